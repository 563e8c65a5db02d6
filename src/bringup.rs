// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Bring-up state machine context.
//!
//! One admin command is in flight at any moment during bring-up; its
//! completion re-enters the machine and selects the next command. The
//! transition logic itself lives on the controller, which owns the tables
//! the transitions mutate; this module holds the machine's state, its
//! counters, and the shared 4 KiB scratch buffer used for every admin
//! data transfer.

use log::error;

use crate::cmd::NvmeCmd;
use crate::error::StartFailure;
use crate::platform::{DmaRegion, PAGE_SIZE};

/// How many arbiter passes a state may sit without progress before the
/// machine gives up on it.
pub const STATE_CHECK_MAX: u32 = 500;

/// Asynchronous Event Requests the driver tries to keep outstanding.
pub const DESIRED_AERS: u8 = 4;

/// Bring-up states. `StartComplete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartState {
    WaitOnRdy,
    WaitOnIdentifyCtrl,
    WaitOnIdentifyNs,
    WaitOnSetFeatures,
    WaitOnSetupQueues,
    WaitOnAer,
    WaitOnIoCq,
    WaitOnIoSq,
    WaitOnLearnMapping,
    WaitOnReSetupQueues,
    StartComplete,
    Failed(StartFailure),
}

/// Mutable state of the bring-up machine.
pub struct StateMachine {
    pub state: StartState,
    pub check_count: u32,
    /// Namespaces whose LBA range has been examined (Get or Set done).
    pub ttl_lba_range_examined: u32,
    /// Identify Namespace payloads fetched so far; also drives the next
    /// NSID to fetch.
    pub identify_ns_fetched: u32,
    /// Namespaces judged visible; indexes the next LUN slot to fill.
    pub visible_ns_examined: u32,
    /// NSID the current LBA range command targets.
    pub current_nsid: u32,
    pub num_aers_issued: u8,
    /// Cores whose vector mapping has been learned.
    pub learning_cores: u16,
    pub interrupt_coalescing_set: bool,
    pub config_lba_range_needed: bool,
    /// Scratch page for admin command payloads. Single-writer: only the
    /// one in-flight admin command transfers through it.
    pub data_buffer: DmaRegion,
    /// The admin command currently in flight, kept for completion-time
    /// dispatch on opcode and feature id.
    pub in_flight: Option<NvmeCmd>,
}

impl StateMachine {
    pub fn new(data_buffer: DmaRegion) -> Self {
        debug_assert!(data_buffer.len() >= PAGE_SIZE);
        StateMachine {
            state: StartState::WaitOnRdy,
            check_count: 0,
            ttl_lba_range_examined: 0,
            identify_ns_fetched: 0,
            visible_ns_examined: 0,
            current_nsid: 0,
            num_aers_issued: 0,
            learning_cores: 0,
            interrupt_coalescing_set: false,
            config_lba_range_needed: false,
            data_buffer,
            in_flight: None,
        }
    }

    /// Move to the next state, resetting the stall counter.
    pub fn advance(&mut self, next: StartState) {
        self.state = next;
        self.check_count = 0;
    }

    /// Collapse into the terminal failure state, accumulating the bit for
    /// this failure point.
    pub fn fatal(&mut self, bit: StartFailure) {
        let mask = match self.state {
            StartState::Failed(prev) => prev | bit,
            _ => bit,
        };
        error!("bring-up failed in {:?}, mask {:?}", self.state, mask);
        self.state = StartState::Failed(mask);
        self.in_flight = None;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, StartState::StartComplete | StartState::Failed(_))
    }

    /// Record the single in-flight admin command. Panics if one is
    /// already outstanding: the scratch buffer is single-writer by
    /// construction, not by convention.
    pub fn track_command(&mut self, cmd: NvmeCmd) {
        assert!(self.in_flight.is_none(), "admin command already in flight");
        self.in_flight = Some(cmd);
    }

    /// Take the in-flight command at completion time.
    pub fn complete_command(&mut self) -> Option<NvmeCmd> {
        self.in_flight.take()
    }

    /// Count one arbiter pass without progress; true once the state has
    /// stalled past its bound.
    pub fn check_stalled(&mut self) -> bool {
        self.check_count += 1;
        self.check_count > STATE_CHECK_MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> StateMachine {
        StateMachine::new(DmaRegion::zeroed_identity(PAGE_SIZE))
    }

    #[test]
    fn advance_resets_check_count() {
        let mut sm = machine();
        sm.check_count = 17;
        sm.advance(StartState::WaitOnIdentifyCtrl);
        assert_eq!(sm.state, StartState::WaitOnIdentifyCtrl);
        assert_eq!(sm.check_count, 0);
    }

    #[test]
    fn fatal_accumulates_bits() {
        let mut sm = machine();
        sm.fatal(StartFailure::IDENTIFY_CTRL);
        sm.fatal(StartFailure::AER);
        match sm.state {
            StartState::Failed(mask) => {
                assert!(mask.contains(StartFailure::IDENTIFY_CTRL | StartFailure::AER));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(sm.is_terminal());
    }

    #[test]
    #[should_panic(expected = "already in flight")]
    fn double_issue_is_rejected() {
        let mut sm = machine();
        sm.track_command(NvmeCmd::async_event_request(0));
        sm.track_command(NvmeCmd::async_event_request(1));
    }

    #[test]
    fn stall_counter_trips_after_bound() {
        let mut sm = machine();
        for _ in 0..STATE_CHECK_MAX {
            assert!(!sm.check_stalled());
        }
        assert!(sm.check_stalled());
    }
}
