// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Error types for controller bring-up and queue management.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Accumulated failure bits for the bring-up state machine. Each bit
    /// names the admin step that failed; the machine collapses all
    /// non-recoverable errors into one terminal mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StartFailure: u32 {
        const IDENTIFY_CTRL  = 1 << 0;
        const IDENTIFY_NS    = 1 << 1;
        const INT_COALESCING = 1 << 2;
        const QUEUE_ALLOC    = 1 << 3;
        const LBA_RANGE_CHK  = 1 << 4;
        const AER            = 1 << 5;
        const CPLQ_CREATE    = 1 << 6;
        const SUBQ_CREATE    = 1 << 7;
        const CPLQ_DELETE    = 1 << 8;
        const SUBQ_DELETE    = 1 << 9;
        const UNKNOWN_STATE  = 1 << 10;
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("insufficient resources: {0}")]
    InsufficientResources(&'static str),

    #[error("controller registers are not mapped")]
    MmioNotMapped,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("command failed with sc {sc:#x} sct {sct:#x}")]
    CommandFailed { sc: u8, sct: u8 },

    #[error("invariant violated, mask {0:#x}")]
    InvariantViolated(u32),

    #[error("no free command slots on queue {0}")]
    ResourceExhausted(u16),

    #[error("controller start failed: {0:?}")]
    StartFailed(StartFailure),
}

pub type Result<T> = core::result::Result<T, Error>;
