//! # Scheduler Configuration
//!
//! Tunables handed to the scheduler at init. Everything has a default that
//! matches production behavior on MI300-class parts.

use bitflags::bitflags;

use crate::time::DEFAULT_MM_TIME_SLICE_US;
use crate::types::SchedMode;

/// Default budget for one GPUIOV command to complete
pub const DEFAULT_ALLOW_TIME_CMD_COMPLETE_US: u64 = 500 * 1000;
/// Default full-access budget
pub const DEFAULT_ALLOW_TIME_FULL_ACCESS_US: u64 = 20_000 * 1000;

bitflags! {
    /// Scheduler behavior switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SchedFlags: u32 {
        /// A lone VF keeps the engine instead of switching to itself
        const DISABLE_SELF_SWITCH = 1 << 0;
        /// Multi-block graphics world switches advance in lock-step
        const BULK_GFX            = 1 << 1;
        /// Stop runs at Load, leaving the engine to start the VF later
        const SKIP_RUN            = 1 << 2;
        /// Re-notify a running single-VF world switch on start
        const SELF_SWITCH_TRIGGER = 1 << 3;
        /// The PF competes for graphics time
        const PF_ACTIVE           = 1 << 4;
    }
}

impl Default for SchedFlags {
    fn default() -> Self {
        Self::DISABLE_SELF_SWITCH | Self::BULK_GFX
    }
}

/// Spatial partition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PartitionMode {
    /// Single partition
    #[default]
    Spx = 0,
    /// Two partitions
    Dpx = 1,
    /// Three partitions
    Tpx = 2,
    /// Four partitions
    Qpx = 3,
    /// One partition per compute die
    Cpx = 4,
}

impl PartitionMode {
    /// Row index into per-ASIC partition tables
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Default partition mode for a VF count
    pub const fn for_num_vf(num_vf: u32) -> Self {
        match num_vf {
            0 | 1 => Self::Spx,
            2 => Self::Dpx,
            3 => Self::Tpx,
            4 => Self::Qpx,
            _ => Self::Cpx,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedConfig {
    /// Budget for one GPUIOV command
    pub allow_time_cmd_complete_us: u64,
    /// Budget a VF may hold full access
    pub allow_time_full_access_us: u64,
    /// Policy for graphics world switches
    pub gfx_sched_mode: SchedMode,
    /// Policy for multimedia world switches
    pub mm_sched_mode: SchedMode,
    /// Graphics slice override; `None` derives it from the VF count
    pub gfx_time_slice_us: Option<u32>,
    /// Multimedia slice
    pub mm_time_slice_us: u32,
    /// Maximum bandwidth used for bandwidth/time-slice conversion
    pub max_bandwidth: u32,
    /// Initial partition mode
    pub partition_mode: PartitionMode,
    /// Behavior switches
    pub flags: SchedFlags,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            allow_time_cmd_complete_us: DEFAULT_ALLOW_TIME_CMD_COMPLETE_US,
            allow_time_full_access_us: DEFAULT_ALLOW_TIME_FULL_ACCESS_US,
            gfx_sched_mode: SchedMode::Fairness,
            mm_sched_mode: SchedMode::FrameLoop,
            gfx_time_slice_us: None,
            mm_time_slice_us: DEFAULT_MM_TIME_SLICE_US,
            max_bandwidth: 0,
            partition_mode: PartitionMode::Spx,
            flags: SchedFlags::DISABLE_SELF_SWITCH.union(SchedFlags::BULK_GFX),
        }
    }
}

impl SchedConfig {
    /// Set the command budget
    pub const fn with_cmd_budget(mut self, us: u64) -> Self {
        self.allow_time_cmd_complete_us = us;
        self
    }

    /// Set the full-access budget
    pub const fn with_full_access_budget(mut self, us: u64) -> Self {
        self.allow_time_full_access_us = us;
        self
    }

    /// Set the graphics policy
    pub const fn with_gfx_mode(mut self, mode: SchedMode) -> Self {
        self.gfx_sched_mode = mode;
        self
    }

    /// Set the multimedia policy
    pub const fn with_mm_mode(mut self, mode: SchedMode) -> Self {
        self.mm_sched_mode = mode;
        self
    }

    /// Set the partition mode
    pub const fn with_partition_mode(mut self, mode: PartitionMode) -> Self {
        self.partition_mode = mode;
        self
    }

    /// Replace the flags
    pub const fn with_flags(mut self, flags: SchedFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the maximum bandwidth
    pub const fn with_max_bandwidth(mut self, max_bandwidth: u32) -> Self {
        self.max_bandwidth = max_bandwidth;
        self
    }

    /// Policy for a sched block
    #[inline]
    pub const fn sched_mode_for(&self, gfx: bool) -> SchedMode {
        if gfx { self.gfx_sched_mode } else { self.mm_sched_mode }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SchedConfig::default();
        assert_eq!(cfg.allow_time_cmd_complete_us, 500_000);
        assert_eq!(cfg.allow_time_full_access_us, 20_000_000);
        assert!(cfg.flags.contains(SchedFlags::DISABLE_SELF_SWITCH));
        assert_eq!(cfg.flags, SchedFlags::default());
        assert_eq!(cfg.sched_mode_for(true), SchedMode::Fairness);
        assert_eq!(cfg.sched_mode_for(false), SchedMode::FrameLoop);
    }

    #[test]
    fn test_builders() {
        let cfg = SchedConfig::default()
            .with_cmd_budget(1_000)
            .with_partition_mode(PartitionMode::Cpx)
            .with_flags(SchedFlags::SKIP_RUN);
        assert_eq!(cfg.allow_time_cmd_complete_us, 1_000);
        assert_eq!(cfg.partition_mode, PartitionMode::Cpx);
        assert_eq!(cfg.flags, SchedFlags::SKIP_RUN);
        assert_eq!(PartitionMode::for_num_vf(8), PartitionMode::Cpx);
    }
}
