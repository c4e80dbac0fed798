//! # VALENCE Scheduler
//!
//! Time-division multiplexing of GPU engines among SR-IOV virtual functions.
//!
//! Every hardware scheduler block is driven through a small state machine
//! (init, run, idle, save, load, shutdown) by GPUIOV commands. Blocks that
//! must switch together are grouped into world switches, which either rotate
//! their VFs in software or hand the rotation to firmware.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         valence-sched                            │
//! │                                                                  │
//! │   control ── run / pause / shutdown / reset / slices / start     │
//! │      │                                                           │
//! │      ▼                                                           │
//! │   manual ─┐   autosched ─┐   full_access ─┐   live_update        │
//! │           ▼              ▼                ▼                      │
//! │   context (save / load / switch) ──▶ bulk ──▶ state_machine      │
//! │                                                   │              │
//! │   topology ── world_switch ── hw_sched ── vf      ▼              │
//! │                                              valence-hal::GpuIov │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod autosched;
pub mod bulk;
pub mod context;
pub mod control;
pub mod diag;
pub mod full_access;
pub mod hw_sched;
pub mod live_update;
pub mod manual;
pub mod scheduler;
pub mod state_machine;
pub mod topology;
pub mod vf;
pub mod world_switch;

#[cfg(test)]
mod fixture;

// Re-exports for convenience
pub use autosched::select_time_quanta;
pub use bulk::BulkState;
pub use diag::{DiagSink, LogDiag, NullDiag, Transition};
pub use full_access::{EventQueue, FullAccessGuard, NullEvents, NullGuard};
pub use hw_sched::{HwSchedState, HwSchedTable};
pub use live_update::{LIVE_UPDATE_VERSION, LiveUpdateSnapshot};
pub use scheduler::Scheduler;
pub use state_machine::Machine;
pub use topology::{SpatialPartition, Topology, WsLayout};
pub use vf::{FullAccessRecord, VfSchedInfo, VfTable};
pub use world_switch::{RunList, WorldSwitch};
