//! # Core Types
//!
//! Strongly-typed ids and the scheduler state enums.

use core::fmt;

use static_assertions::const_assert;

// =============================================================================
// LIMITS
// =============================================================================

/// Maximum number of virtual functions
pub const MAX_VF_NUM: usize = 31;
/// Slot index reserved for the physical function
pub const PF_IDX: usize = 31;
/// Number of VF slots, PF included
pub const MAX_VF_SLOT: usize = 32;
/// Maximum number of hardware scheduler blocks
pub const MAX_NUM_HW_SCHED: usize = 32;
/// Maximum number of world switches
pub const MAX_NUM_WORLD_SWITCH: usize = 32;
/// Maximum number of spatial partitions
pub const MAX_NUM_PARTITION: usize = 8;

const_assert!(PF_IDX < MAX_VF_SLOT);
const_assert!(MAX_VF_NUM == PF_IDX);
const_assert!(MAX_VF_SLOT <= 32);
const_assert!(MAX_NUM_HW_SCHED <= 32);
const_assert!(MAX_NUM_WORLD_SWITCH <= 32);

// =============================================================================
// IDS
// =============================================================================

macro_rules! bounded_id {
    ($(#[$meta:meta])* $name:ident, $limit:expr, $tag:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u8);

        impl $name {
            /// Number of valid ids
            pub const LIMIT: usize = $limit;

            /// Validate a raw index
            #[inline]
            pub const fn new(raw: u32) -> Option<Self> {
                if (raw as usize) < Self::LIMIT {
                    Some(Self(raw as u8))
                } else {
                    None
                }
            }

            /// Build from an index already known to be in range
            ///
            /// Out-of-range values are clamped to the last slot.
            #[inline]
            pub const fn from_index(index: usize) -> Self {
                if index < Self::LIMIT {
                    Self(index as u8)
                } else {
                    Self((Self::LIMIT - 1) as u8)
                }
            }

            /// Raw index
            #[inline]
            pub const fn raw(self) -> u32 {
                self.0 as u32
            }

            /// Index for array access
            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            /// Single-bit mask for this id
            #[inline]
            pub const fn bit(self) -> u32 {
                1u32 << self.0
            }

            /// All valid ids in ascending order
            pub fn all() -> impl Iterator<Item = Self> {
                (0..Self::LIMIT).map(|i| Self(i as u8))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "{}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "{}"), self.0)
            }
        }
    };
}

bounded_id!(
    /// Virtual function slot; slot 31 is the physical function
    VfId,
    MAX_VF_SLOT,
    "vf"
);

bounded_id!(
    /// Physical hardware scheduler block
    HwSchedId,
    MAX_NUM_HW_SCHED,
    "hw"
);

bounded_id!(
    /// Logical world switch
    WorldSwitchId,
    MAX_NUM_WORLD_SWITCH,
    "ws"
);

impl VfId {
    /// The physical function
    pub const PF: Self = Self(PF_IDX as u8);

    /// Whether this is the physical function
    #[inline]
    pub const fn is_pf(self) -> bool {
        self.0 as usize == PF_IDX
    }

    /// Virtual functions only, PF excluded
    pub fn vfs() -> impl Iterator<Item = Self> {
        (0..MAX_VF_NUM).map(|i| Self(i as u8))
    }
}

// =============================================================================
// HARDWARE SCHEDULER STATE
// =============================================================================

/// State of one hardware scheduler block as last acknowledged by hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GpuState {
    /// VF context idled, still resident
    Idle = 0,
    /// VF context saved out
    Save = 1,
    /// No context resident
    Shutdown = 2,
    /// VF context initialized from scratch
    Init = 3,
    /// VF context restored
    Load = 4,
    /// VF executing
    Run = 5,
    /// Firmware free-running among auto-run VFs
    EnableAuto = 6,
    /// Firmware scheduling stopped, context not yet settled
    DisableAuto = 7,
}

impl GpuState {
    /// Decode a raw value
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Idle,
            1 => Self::Save,
            2 => Self::Shutdown,
            3 => Self::Init,
            4 => Self::Load,
            5 => Self::Run,
            6 => Self::EnableAuto,
            7 => Self::DisableAuto,
            _ => return None,
        })
    }

    /// Short name for logging
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Save => "SAVE",
            Self::Shutdown => "SHUTDOWN",
            Self::Init => "INIT",
            Self::Load => "LOAD",
            Self::Run => "RUN",
            Self::EnableAuto => "ENABLE_AUTO",
            Self::DisableAuto => "DISABLE_AUTO",
        }
    }

    /// States reachable only on autonomous blocks
    pub const fn is_auto_only(self) -> bool {
        matches!(self, Self::EnableAuto | Self::DisableAuto)
    }
}

impl fmt::Display for GpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a hardware scheduler block switches between VFs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DriverMode {
    /// Every transition is commanded by the host
    Manual = 0,
    /// Firmware switches autonomously once enabled
    Auto = 1,
}

impl DriverMode {
    /// Decode a raw value
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Manual),
            1 => Some(Self::Auto),
            _ => None,
        }
    }
}

/// Engine class of a hardware scheduler block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwSchedClass {
    /// Graphics/compute
    Gfx,
    /// Multimedia (video/jpeg)
    Mm,
}

// =============================================================================
// SCHED BLOCKS AND MODES
// =============================================================================

/// Engine family a world switch schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SchedBlock {
    /// Graphics
    Gfx = 0,
    /// Unified video decoder
    Uvd = 1,
    /// Video compression engine
    Vce = 2,
    /// Second UVD instance
    Uvd1 = 3,
    /// Video core next
    Vcn = 4,
    /// Second VCN instance
    Vcn1 = 5,
    /// JPEG decoder
    Jpeg = 6,
}

impl SchedBlock {
    /// Number of sched blocks
    pub const COUNT: usize = 7;

    /// All sched blocks in id order
    pub const ALL: [Self; Self::COUNT] = [
        Self::Gfx,
        Self::Uvd,
        Self::Vce,
        Self::Uvd1,
        Self::Vcn,
        Self::Vcn1,
        Self::Jpeg,
    ];

    /// Index for per-block arrays
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Engine class
    pub const fn class(self) -> HwSchedClass {
        match self {
            Self::Gfx => HwSchedClass::Gfx,
            _ => HwSchedClass::Mm,
        }
    }

    /// Whether this is the graphics block
    #[inline]
    pub const fn is_gfx(self) -> bool {
        matches!(self, Self::Gfx)
    }

    /// Short name for logging
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gfx => "GFX",
            Self::Uvd => "UVD",
            Self::Vce => "VCE",
            Self::Uvd1 => "UVD1",
            Self::Vcn => "VCN",
            Self::Vcn1 => "VCN1",
            Self::Jpeg => "JPEG",
        }
    }
}

impl fmt::Display for SchedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scheduling policy of a world switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SchedMode {
    /// Firmware loops frames over every active VF
    FrameLoop = 0,
    /// Firmware fixed time slices
    Solid = 1,
    /// Firmware yields early when a VF goes idle
    Liquid = 2,
    /// Host round robin with debt accounting
    Fairness = 3,
    /// Host round robin
    RoundRobin = 4,
    /// Host round robin skipping idle VFs
    HybridLiquid = 5,
}

impl SchedMode {
    /// Decode a raw value
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::FrameLoop,
            1 => Self::Solid,
            2 => Self::Liquid,
            3 => Self::Fairness,
            4 => Self::RoundRobin,
            5 => Self::HybridLiquid,
            _ => return None,
        })
    }

    /// Modes run by the firmware scheduler
    #[inline]
    pub const fn is_auto(self) -> bool {
        (self as u8) <= (Self::Liquid as u8)
    }

    /// Driver mode implied by this policy
    pub const fn driver_mode(self) -> DriverMode {
        if self.is_auto() {
            DriverMode::Auto
        } else {
            DriverMode::Manual
        }
    }
}

// =============================================================================
// VF LIFECYCLE
// =============================================================================

/// Scheduling lifecycle of a VF slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum VfSchedState {
    /// Not allocated
    #[default]
    Unavailable = 0,
    /// Allocated, not scheduled
    Available = 1,
    /// In the run list
    Active = 2,
    /// Removed from the run list, context kept
    Suspended = 3,
    /// Reported while the VF holds full access
    FullAccess = 4,
}

impl VfSchedState {
    /// Decode a raw value
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Unavailable,
            1 => Self::Available,
            2 => Self::Active,
            3 => Self::Suspended,
            4 => Self::FullAccess,
            _ => return None,
        })
    }
}

/// Context state of the VF a world switch currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum VfContextState {
    /// Nothing resident
    #[default]
    Clear = 0,
    /// Context resident on the engines
    Loaded = 1,
    /// Context saved out
    Saved = 2,
    /// Hardware state unknown after a failure
    Abnormal = 3,
}

impl VfContextState {
    /// Decode a raw value
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Clear,
            1 => Self::Loaded,
            2 => Self::Saved,
            3 => Self::Abnormal,
            _ => return None,
        })
    }
}

/// Whether a VF participates in firmware scheduling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AutoRun {
    /// Excluded from firmware scheduling
    #[default]
    Disabled,
    /// Included in firmware scheduling
    Enabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vf_id_bounds() {
        assert_eq!(VfId::new(31), Some(VfId::PF));
        assert!(VfId::new(32).is_none());
        assert!(VfId::PF.is_pf());
        assert!(!VfId::from_index(3).is_pf());
        assert_eq!(VfId::vfs().count(), MAX_VF_NUM);
        assert_eq!(VfId::all().count(), MAX_VF_SLOT);
    }

    #[test]
    fn test_sched_mode_split() {
        assert!(SchedMode::FrameLoop.is_auto());
        assert!(SchedMode::Liquid.is_auto());
        assert!(!SchedMode::Fairness.is_auto());
        assert_eq!(SchedMode::HybridLiquid.driver_mode(), DriverMode::Manual);
    }

    #[test]
    fn test_gpu_state_raw() {
        for raw in 0..8 {
            let state = GpuState::from_raw(raw).unwrap();
            assert_eq!(state as u8, raw);
        }
        assert!(GpuState::from_raw(8).is_none());
    }

    #[test]
    fn test_vf_sched_state_raw() {
        assert_eq!(VfSchedState::from_raw(3), Some(VfSchedState::Suspended));
        assert_eq!(VfSchedState::FullAccess as u8, 4);
        assert!(VfSchedState::from_raw(5).is_none());
    }
}
