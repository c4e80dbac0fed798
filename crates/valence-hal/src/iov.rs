//! # GPUIOV Capability Table
//!
//! The per-ASIC register layer, seen from the scheduler as a black box.

use valence_core::{HwSchedId, Result, SchedMode, VfId, VfMask};

use crate::cmd::{ActiveFcnStatus, CmdStatus, GpuIovCmd};

// =============================================================================
// CLOCK
// =============================================================================

/// Monotonic time source used for command budgets
pub trait Clock {
    /// Current time in microseconds
    fn now_us(&self) -> u64;

    /// Busy-wait or yield for `us` microseconds
    fn delay_us(&self, us: u64);
}

// =============================================================================
// GPUIOV TRAIT
// =============================================================================

/// Hardware capability table of one GPU
///
/// Methods take `&self`; implementations serialize register access
/// internally. The scheduler only issues commands to a block while it holds
/// that block's transition lock.
pub trait GpuIov: Clock + Send + Sync {
    /// Write a command for `vf` to `block` without waiting
    fn set_cmd(&self, cmd: GpuIovCmd, block: HwSchedId, vf: VfId, next_vf: Option<VfId>);

    /// Whether the last command on `block` has completed
    fn is_cmd_complete(&self, block: HwSchedId) -> bool;

    /// Status of the last command on `block`
    fn cmd_status(&self, block: HwSchedId) -> CmdStatus;

    /// VF the block currently holds
    fn get_active_vf_idx(&self, block: HwSchedId) -> Result<VfId>;

    /// VFs the firmware scheduler rotates through
    fn get_active_vfs(&self, block: HwSchedId) -> Result<VfMask>;

    /// Replace the firmware scheduler's VF set
    fn set_active_vfs(&self, block: HwSchedId, vfs: VfMask) -> Result<()>;

    /// Packed time-quanta option bytes of `block`
    fn get_time_quanta_option(&self, block: HwSchedId) -> Result<u32>;

    /// Program the packed time-quanta option bytes
    fn set_time_quanta_option(&self, block: HwSchedId, option: u32) -> Result<()>;

    /// Select which option byte applies to `vf`
    fn set_time_quanta_index(&self, vf: VfId, block: HwSchedId, index: u32) -> Result<()>;

    /// Poll until the firmware scheduler has stopped
    fn wait_auto_sched_stop(&self, block: HwSchedId) -> Result<()>;

    /// Status of the function the firmware scheduler is serving
    fn get_active_vf_status(&self, block: HwSchedId) -> Result<ActiveFcnStatus>;

    /// Program the firmware scheduling policy
    fn config_auto_sched_mode(&self, block: HwSchedId, mode: SchedMode) -> Result<()>;

    /// Add a VF to the firmware rotation
    fn auto_sched_add_vf(&self, block: HwSchedId, vf: VfId) -> Result<()>;

    /// Remove a VF from the firmware rotation
    fn auto_sched_remove_vf(&self, block: HwSchedId, vf: VfId) -> Result<()>;

    /// VFs with outstanding work on `block`
    fn get_vm_busy_status(&self, block: HwSchedId) -> Result<VfMask>;

    /// Log command and status registers of `block`
    fn dump_cmd_status(&self, block: HwSchedId);
}
