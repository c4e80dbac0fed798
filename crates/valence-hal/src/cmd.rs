//! # GPUIOV Commands
//!
//! Command, status and active-function encodings of the GPUIOV protocol.

use core::fmt;

use valence_core::{GpuState, VfContextState};

// =============================================================================
// COMMANDS
// =============================================================================

/// Command written to a hardware scheduler block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GpuIovCmd {
    /// Idle the running VF
    Idle = 0x1,
    /// Save the idle VF context
    Save = 0x2,
    /// Restore a saved VF context
    Load = 0x3,
    /// Start the loaded VF
    Run = 0x4,
    /// Save and load in one step
    ContextSwitch = 0x5,
    /// Hand switching to the firmware scheduler
    EnableAuto = 0x6,
    /// Initialize a fresh VF context
    Init = 0x7,
    /// Take switching back from the firmware scheduler
    DisableAuto = 0xB,
    /// Tear down the VF context
    Shutdown = 0xD,
}

impl GpuIovCmd {
    /// Raw encoding
    #[inline]
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Command that drives a block into `state`
    pub const fn for_state(state: GpuState) -> Self {
        match state {
            GpuState::Idle => Self::Idle,
            GpuState::Save => Self::Save,
            GpuState::Shutdown => Self::Shutdown,
            GpuState::Init => Self::Init,
            GpuState::Load => Self::Load,
            GpuState::Run => Self::Run,
            GpuState::EnableAuto => Self::EnableAuto,
            GpuState::DisableAuto => Self::DisableAuto,
        }
    }

    /// Name for logging
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE_GPU",
            Self::Save => "SAVE_GPU_STATE",
            Self::Load => "LOAD_GPU_STATE",
            Self::Run => "RUN_GPU",
            Self::ContextSwitch => "CONTEXT_SWITCH",
            Self::EnableAuto => "ENABLE_AUTO_HW_SWITCH",
            Self::Init => "INIT_GPU",
            Self::DisableAuto => "DISABLE_AUTO_HW_SWITCH",
            Self::Shutdown => "SHUTDOWN_GPU",
        }
    }
}

impl fmt::Display for GpuIovCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// COMMAND STATUS
// =============================================================================

/// Status register of the last command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CmdStatus {
    /// Completed
    Done = 0x0,
    /// Not supported by this block
    Unsupported = 0x1,
    /// Aborted by firmware
    Aborted = 0x2,
    /// Still executing
    Pending = 0xFF,
}

impl CmdStatus {
    /// Decode a raw register value; unknown values read as pending
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0x0 => Self::Done,
            0x1 => Self::Unsupported,
            0x2 => Self::Aborted,
            _ => Self::Pending,
        }
    }

    /// Name for logging
    pub const fn name(self) -> &'static str {
        match self {
            Self::Done => "DONE",
            Self::Unsupported => "UNSUPPORTED",
            Self::Aborted => "ABORTED",
            Self::Pending => "PENDING",
        }
    }
}

// =============================================================================
// ACTIVE FUNCTION STATUS
// =============================================================================

/// What the firmware scheduler reports for the active function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ActiveFcnStatus {
    /// Nothing running
    Idle = 0,
    /// Function running
    Active = 1,
    /// Function being idled
    Idling = 2,
    /// Function context saved
    Save = 3,
    /// Function context being loaded
    Load = 4,
    /// Function stalled
    Stalled = 5,
}

impl ActiveFcnStatus {
    /// Decode a raw register value
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Idle,
            1 => Self::Active,
            2 => Self::Idling,
            3 => Self::Save,
            4 => Self::Load,
            5 => Self::Stalled,
            _ => return None,
        })
    }

    /// Context state this status implies
    pub const fn context_state(self) -> VfContextState {
        match self {
            Self::Idle | Self::Idling => VfContextState::Clear,
            Self::Active | Self::Load => VfContextState::Loaded,
            Self::Save => VfContextState::Saved,
            Self::Stalled => VfContextState::Abnormal,
        }
    }
}
