//! # VALENCE Core
//!
//! Foundational types for the VALENCE SR-IOV world-switch scheduler.
//!
//! Everything in here is hardware-agnostic: strongly-typed ids for virtual
//! functions, hardware scheduler blocks and world switches, the bitmasks that
//! route VFs to engines, the scheduler state enums, time-slice arithmetic and
//! the scheduler configuration.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      valence-core                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │    Ids &    │  │   States    │  │  Error / Config /   │  │
//! │  │    Masks    │  │  (GpuState, │  │    Time slices      │  │
//! │  │ (VfId, ...) │  │  SchedMode) │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod error;
pub mod mask;
pub mod time;
pub mod types;

// Re-exports for convenience
pub use config::{PartitionMode, SchedConfig, SchedFlags};
pub use error::{Error, Result};
pub use mask::{HwSchedMask, VfMask, WorldSwitchMask};
pub use types::*;
