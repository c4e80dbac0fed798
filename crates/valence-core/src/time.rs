//! # Time Slices
//!
//! Default slices and bandwidth conversion. All values in microseconds.

use log::error;

/// Graphics slice with several VFs (or the PF) competing
pub const DEFAULT_GFX_TIME_SLICE_US: u32 = 6_000;
/// Graphics slice for a lone VF with self-switch disabled: never expires
pub const DEFAULT_GFX_TIME_SLICE_1VF_US: u32 = u32::MAX;
/// Graphics slice for a lone VF that still self-switches
pub const DEFAULT_GFX_TIME_SLICE_1VF_SELF_SW_US: u32 = 500_000;
/// Multimedia slice
pub const DEFAULT_MM_TIME_SLICE_US: u32 = 255_000;

/// Bandwidth is expressed per this many frames per second
const FRAMES_PER_SECOND: u64 = 30;
const US_PER_SECOND: u64 = 1_000_000;

/// Default graphics slice for a VF count
pub fn default_gfx_time_slice(num_vf: u32, pf_active: bool, disable_self_switch: bool) -> u32 {
    if num_vf > 1 || pf_active {
        DEFAULT_GFX_TIME_SLICE_US
    } else if num_vf == 1 {
        if disable_self_switch {
            DEFAULT_GFX_TIME_SLICE_1VF_US
        } else {
            DEFAULT_GFX_TIME_SLICE_1VF_SELF_SW_US
        }
    } else {
        error!("no vf and no active pf, using single-vf self-switch slice");
        DEFAULT_GFX_TIME_SLICE_1VF_SELF_SW_US
    }
}

/// Whether a slice is the never-expiring single-VF slice
#[inline]
pub const fn is_infinite(time_slice: u32) -> bool {
    time_slice == DEFAULT_GFX_TIME_SLICE_1VF_US
}

/// Shortest slice a VF in debt is still granted
#[inline]
pub const fn min_time_slice(time_slice: u32) -> u32 {
    time_slice / 2
}

/// Convert a bandwidth share into a time slice
pub fn bandwidth_to_time_slice(bandwidth: u32, max_bandwidth: u32) -> u32 {
    if bandwidth == 0 || max_bandwidth == 0 {
        return 0;
    }
    let ts = bandwidth as u64 * US_PER_SECOND / (max_bandwidth as u64 * FRAMES_PER_SECOND);
    ts.min(u32::MAX as u64) as u32
}

/// Convert a time slice back into a bandwidth share
pub fn time_slice_to_bandwidth(time_slice: u32, max_bandwidth: u32) -> u32 {
    let bw = max_bandwidth as u64 * FRAMES_PER_SECOND * time_slice as u64 / US_PER_SECOND;
    bw.min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_gfx_slice() {
        assert_eq!(default_gfx_time_slice(4, false, true), DEFAULT_GFX_TIME_SLICE_US);
        assert_eq!(default_gfx_time_slice(1, true, true), DEFAULT_GFX_TIME_SLICE_US);
        assert!(is_infinite(default_gfx_time_slice(1, false, true)));
        assert_eq!(
            default_gfx_time_slice(1, false, false),
            DEFAULT_GFX_TIME_SLICE_1VF_SELF_SW_US
        );
        assert_eq!(
            default_gfx_time_slice(0, false, true),
            DEFAULT_GFX_TIME_SLICE_1VF_SELF_SW_US
        );
    }

    #[test]
    fn test_bandwidth_conversion() {
        assert_eq!(bandwidth_to_time_slice(0, 100), 0);
        assert_eq!(bandwidth_to_time_slice(10, 0), 0);
        // Full bandwidth is one frame at 30 fps
        assert_eq!(bandwidth_to_time_slice(100, 100), 33_333);
        assert_eq!(time_slice_to_bandwidth(33_334, 100), 100);
        assert_eq!(time_slice_to_bandwidth(0, 100), 0);
    }
}
