// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! NVMe controller bring-up and queue-lifecycle core.
//!
//! This crate takes a freshly powered NVMe PCIe controller from reset to
//! a steady state with per-core submission/completion queue pairs, and
//! tears it all down again on shutdown. It covers topology discovery,
//! MSI/MSI-X/INTx vector classification and mapping, queue memory layout
//! with per-slot PRP lists, the ordered admin-command bring-up state
//! machine (Identify, Set Features, queue creation, vector learning),
//! command-slot allocation, phase-tag completion harvesting, and the
//! orderly shutdown handshake.
//!
//! The host OS is reached only through the [`platform::Platform`] trait;
//! per-I/O request translation, log pages, and namespace exposure live
//! outside this crate.

pub mod bringup;
pub mod cmd;
pub mod config;
pub mod controller;
pub mod error;
pub mod identify;
pub mod platform;
pub mod queue;
pub mod regs;
pub mod sim;
pub mod topology;

pub use bringup::{StartState, StateMachine};
pub use cmd::{NvmeCmd, NvmeComp};
pub use config::DriverConfig;
pub use controller::ControllerContext;
pub use error::{Error, Result, StartFailure};
pub use identify::{IdentifyController, IdentifyNamespace, NamespaceEntry, SlotStatus};
pub use platform::{DmaRegion, Platform};
pub use queue::{CmdHandle, CplQueue, QueueSet, SubQueue};
pub use topology::{CoreEntry, InterruptKind, InterruptResources, MsgVector, NumaNode, ResourceMap};

pub type SqId = u16;
pub type CqId = u16;
pub type CmdId = u16;
/// Interrupt vector id.
pub type Iv = u16;
