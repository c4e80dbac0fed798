//! # VALENCE HAL
//!
//! Hardware side of the world-switch scheduler.
//!
//! The scheduler never touches registers. It talks to a [`GpuIov`]
//! implementation, the per-ASIC capability table that encodes GPUIOV
//! commands into PCI config space writes and reads completion back.
//!
//! ## Layout
//!
//! ```text
//!   valence-sched
//!        │
//!        ▼
//!   ┌──────────────┐     ┌────────────────┐
//!   │  wait.rs     │────▶│  GpuIov trait  │◀── per-ASIC implementation
//!   │  (polling)   │     │  (iov.rs)      │◀── MockGpuIov (feature "mock")
//!   └──────────────┘     └────────────────┘
//!   ┌──────────────────────────────────────┐
//!   │ asic/  static block + partition data │
//!   └──────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(any(test, feature = "mock"))]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod asic;
pub mod cmd;
pub mod iov;
pub mod wait;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use asic::{AsicProfile, BlockCaps, HwSchedBlockDesc, PartitionRow};
pub use cmd::{ActiveFcnStatus, CmdStatus, GpuIovCmd};
pub use iov::{Clock, GpuIov};
pub use wait::{exec_cmd, wait_cmd_complete, wait_for_first_cmd_complete};
