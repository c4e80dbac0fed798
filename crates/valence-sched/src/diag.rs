//! # Diagnostics
//!
//! Observers for state transitions and failure dumps. Sinks never influence
//! scheduling decisions.

use valence_core::{GpuState, HwSchedId, VfId};

/// One acknowledged hardware state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Block that moved
    pub block: HwSchedId,
    /// State before the command
    pub from: GpuState,
    /// State after the command
    pub to: GpuState,
    /// VF the command addressed
    pub vf: VfId,
}

/// Receiver of scheduler diagnostics
pub trait DiagSink: Send + Sync {
    /// Record an acknowledged transition
    fn transition(&self, record: Transition);

    /// Capture GPU state after a failure on `block`
    fn dump_gpu_state(&self, block: HwSchedId);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDiag;

impl DiagSink for NullDiag {
    fn transition(&self, _record: Transition) {}

    fn dump_gpu_state(&self, _block: HwSchedId) {}
}

/// Sink that forwards transitions to the `log` facade at trace level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiag;

impl DiagSink for LogDiag {
    fn transition(&self, record: Transition) {
        log::trace!(
            "{}: {}({}) -> {}",
            record.block,
            record.from,
            record.vf,
            record.to
        );
    }

    fn dump_gpu_state(&self, block: HwSchedId) {
        log::error!("{block}: gpu state dump requested");
    }
}
