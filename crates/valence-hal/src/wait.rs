//! # Command Completion Polling
//!
//! Timeout-bounded polling of GPUIOV command completion.

use log::{debug, error};

use valence_core::{Error, HwSchedId, HwSchedMask, Result, VfId};

use crate::cmd::GpuIovCmd;
use crate::iov::GpuIov;

/// Delay between two completion polls
pub const POLL_INTERVAL_US: u64 = 5;

/// Wait for the last command on `block`
///
/// On timeout the block's command registers are dumped and
/// [`Error::IovCmdTimeout`] is returned.
pub fn wait_cmd_complete<H: GpuIov + ?Sized>(
    iov: &H,
    block: HwSchedId,
    budget_us: u64,
) -> Result<()> {
    let start = iov.now_us();
    loop {
        if iov.is_cmd_complete(block) {
            return Ok(());
        }
        if iov.now_us().saturating_sub(start) >= budget_us {
            error!("{block}: command timeout after {budget_us}us");
            iov.dump_cmd_status(block);
            return Err(Error::IovCmdTimeout);
        }
        iov.delay_us(POLL_INTERVAL_US);
    }
}

/// Wait for the first block in `mask` to complete its command
///
/// Blocks are checked in ascending id order, so simultaneous completions
/// resolve to the lowest id. On timeout every block in the mask is dumped.
pub fn wait_for_first_cmd_complete<H: GpuIov + ?Sized>(
    iov: &H,
    mask: HwSchedMask,
    budget_us: u64,
) -> Result<HwSchedId> {
    if mask.is_empty() {
        return Err(Error::InvalidParameter);
    }
    let start = iov.now_us();
    loop {
        if let Some(done) = mask.iter().find(|&block| iov.is_cmd_complete(block)) {
            return Ok(done);
        }
        if iov.now_us().saturating_sub(start) >= budget_us {
            error!("{mask:?}: no command completed within {budget_us}us");
            for block in mask.iter() {
                iov.dump_cmd_status(block);
            }
            return Err(Error::IovCmdTimeout);
        }
        iov.delay_us(POLL_INTERVAL_US);
    }
}

/// Issue `cmd` for `vf` on `block` and wait for it
pub fn exec_cmd<H: GpuIov + ?Sized>(
    iov: &H,
    cmd: GpuIovCmd,
    block: HwSchedId,
    vf: VfId,
    budget_us: u64,
) -> Result<()> {
    debug!("{block}: {cmd} {vf}");
    iov.set_cmd(cmd, block, vf, None);
    wait_cmd_complete(iov, block, budget_us)
}
