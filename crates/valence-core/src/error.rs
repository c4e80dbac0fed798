//! # VALENCE Error Handling
//!
//! Every error carries a stable numeric code so it can be logged, reported
//! to the management plane and compared across driver versions.
//!
//! Codes are grouped by range:
//!
//! | Range           | Category                       |
//! |-----------------|--------------------------------|
//! | 0x0100 - 0x01FF | GPUIOV command protocol        |
//! | 0x0200 - 0x02FF | World switch / state machines  |
//! | 0x0300 - 0x03FF | Scheduler control surface      |
//! | 0x0400 - 0x04FF | Live update                    |

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// VALENCE Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// VALENCE unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // GPUIOV command errors
    // =========================================================================
    /// A GPUIOV command did not complete within its budget
    IovCmdTimeout = 0x0100,
    /// A GPUIOV command could not be derived or was rejected
    IovCmdError = 0x0101,
    /// The hardware register layer reported a failure
    IovRegisterFault = 0x0102,

    // ---------------------------------------------------------------------
    // World switch errors
    // ---------------------------------------------------------------------
    /// Save command timed out
    WsSaveTimeout = 0x0200,
    /// Idle command timed out
    WsIdleTimeout = 0x0201,
    /// Run command timed out
    WsRunTimeout = 0x0202,
    /// Load or init command timed out
    WsLoadTimeout = 0x0203,
    /// Shutdown command timed out
    WsShutdownTimeout = 0x0204,
    /// Target already shut down
    WsAlreadyShutdown = 0x0205,
    /// State walk exceeded its edge budget
    WsInfiniteLoop = 0x0206,
    /// Hardware scheduler block already owned by an in-flight transition
    WsReentrant = 0x0207,
    /// One or more blocks of a lock-step transition failed
    WsBulkFailure = 0x0208,
    /// World switch is in the abnormal context state
    WsAbnormal = 0x0209,
    /// World switch is not enabled
    WsNotEnabled = 0x020A,

    // ---------------------------------------------------------------------
    // Scheduler errors
    // ---------------------------------------------------------------------
    /// Shutting down a VF during reset failed
    SchedShutdownVfFail = 0x0300,
    /// VF count change requested while a VF is still allocated
    VfBusy = 0x0301,
    /// VF id out of range or not routed
    InvalidVf = 0x0302,
    /// Hardware scheduler id out of range
    InvalidHwSched = 0x0303,
    /// Invalid parameter
    InvalidParameter = 0x0304,
    /// Operation not supported for this engine or mode
    NotSupported = 0x0305,
    /// Partition mode has no routing row
    PartitionUnsupported = 0x0306,
    /// Capacity of a fixed table exhausted
    CapacityExceeded = 0x0307,
    /// Generic scheduler failure
    Failure = 0x0308,

    // ---------------------------------------------------------------------
    // Live update errors
    // ---------------------------------------------------------------------
    /// Snapshot produced by a different layout version
    LiveUpdateVersion = 0x0400,
    /// Snapshot carries out-of-range values
    LiveUpdateCorrupt = 0x0401,
}

impl Error {
    /// Stable numeric code
    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Whether this error is one of the per-command hardware timeouts
    pub const fn is_timeout(self) -> bool {
        matches!(
            self,
            Self::IovCmdTimeout
                | Self::WsSaveTimeout
                | Self::WsIdleTimeout
                | Self::WsRunTimeout
                | Self::WsLoadTimeout
                | Self::WsShutdownTimeout
        )
    }

    /// Whether this error signals a driver bug rather than a hardware fault
    pub const fn is_driver_bug(self) -> bool {
        matches!(self, Self::WsInfiniteLoop | Self::WsReentrant)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::IovCmdTimeout => "gpuiov command timeout",
            Self::IovCmdError => "gpuiov command error",
            Self::IovRegisterFault => "gpuiov register access failed",
            Self::WsSaveTimeout => "world switch save timeout",
            Self::WsIdleTimeout => "world switch idle timeout",
            Self::WsRunTimeout => "world switch run timeout",
            Self::WsLoadTimeout => "world switch load timeout",
            Self::WsShutdownTimeout => "world switch shutdown timeout",
            Self::WsAlreadyShutdown => "world switch already shut down",
            Self::WsInfiniteLoop => "world switch state walk did not terminate",
            Self::WsReentrant => "world switch reentrant call",
            Self::WsBulkFailure => "world switch lock-step transition failed",
            Self::WsAbnormal => "world switch in abnormal state",
            Self::WsNotEnabled => "world switch not enabled",
            Self::SchedShutdownVfFail => "failed to shut down vf",
            Self::VfBusy => "vf still allocated",
            Self::InvalidVf => "invalid vf",
            Self::InvalidHwSched => "invalid hardware scheduler",
            Self::InvalidParameter => "invalid parameter",
            Self::NotSupported => "operation not supported",
            Self::PartitionUnsupported => "partition mode not supported",
            Self::CapacityExceeded => "capacity exceeded",
            Self::Failure => "scheduler failure",
            Self::LiveUpdateVersion => "live update version mismatch",
            Self::LiveUpdateCorrupt => "live update data corrupt",
        };
        write!(f, "{msg} (0x{:04x})", self.code())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_switch_codes_keep_order() {
        assert!(Error::WsSaveTimeout.code() < Error::WsIdleTimeout.code());
        assert!(Error::WsIdleTimeout.code() < Error::WsRunTimeout.code());
        assert!(Error::WsRunTimeout.code() < Error::WsLoadTimeout.code());
        assert!(Error::WsLoadTimeout.code() < Error::WsShutdownTimeout.code());
        assert!(Error::WsInfiniteLoop.code() < Error::WsReentrant.code());
    }

    #[test]
    fn test_classification() {
        assert!(Error::WsRunTimeout.is_timeout());
        assert!(!Error::WsReentrant.is_timeout());
        assert!(Error::WsReentrant.is_driver_bug());
        assert!(Error::WsInfiniteLoop.is_driver_bug());
        assert!(!Error::SchedShutdownVfFail.is_driver_bug());
    }
}
