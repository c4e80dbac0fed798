//! # Full-Access Arbitration
//!
//! A VF in full access owns its world switches outright: scheduling stops
//! on them and the VF stays loaded until it leaves. Time spent is measured
//! against a budget; going over is reported to a [`FullAccessGuard`], never
//! enforced here.
//!
//! Recovery is not done inline. Failures that need a VF reset are queued on
//! the [`EventQueue`], whose worker calls back into the scheduler later.

use arrayvec::ArrayVec;
use log::{error, info, warn};

use valence_core::{
    Error, MAX_VF_SLOT, Result, SchedBlock, VfId, VfMask, WorldSwitchMask,
};
use valence_hal::GpuIov;

use crate::context::{mm_first, outcome};
use crate::scheduler::Scheduler;
use crate::topology::Topology;
use crate::vf::FullAccessRecord;

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Serialized event worker the scheduler hands recovery to
pub trait EventQueue: Send + Sync {
    /// Suspend event processing
    fn queue_suspend(&self) -> Result<()>;

    /// Resume event processing
    fn queue_resume(&self) -> Result<()>;

    /// Queue a reset of `vf` on `sched_block`
    fn queue_reset(&self, vf: VfId, sched_block: SchedBlock);
}

/// Collector of full-access budget overruns
pub trait FullAccessGuard: Send + Sync {
    /// `vf` held full access for `used_us` of an `allowed_us` budget
    fn report_overrun(&self, vf: VfId, used_us: u64, allowed_us: u64);
}

/// Event queue that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEvents;

impl EventQueue for NullEvents {
    fn queue_suspend(&self) -> Result<()> {
        Ok(())
    }

    fn queue_resume(&self) -> Result<()> {
        Ok(())
    }

    fn queue_reset(&self, _vf: VfId, _sched_block: SchedBlock) {}
}

/// Guard that ignores overruns
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGuard;

impl FullAccessGuard for NullGuard {
    fn report_overrun(&self, _vf: VfId, _used_us: u64, _allowed_us: u64) {}
}

// =============================================================================
// ARBITRATION
// =============================================================================

impl<H: GpuIov> Scheduler<H> {
    /// Queue a reset for the VF left on every abnormal graphics world switch
    fn queue_recovery(&self, topo: &Topology) {
        for id in topo.serving(Some(SchedBlock::Gfx)) {
            let Ok(ws) = topo.ws(id) else {
                continue;
            };
            if !ws.is_state_ok() {
                warn!("{id}: queueing reset of {}", ws.curr_idx_vf);
                self.events.queue_reset(ws.curr_idx_vf, ws.sched_block);
            }
        }
    }

    /// Save `vf` and restart scheduling on the world switches in `mask`
    ///
    /// Returns the world switches that could not be handed back.
    fn release(&self, topo: &Topology, vf: VfId, mask: WorldSwitchMask) -> WorldSwitchMask {
        let mut failed = WorldSwitchMask::EMPTY;
        for id in mm_first(topo, mask) {
            let Ok(mut ws) = topo.ws(id) else {
                failed.insert(id);
                continue;
            };
            ws.run_list.entry_mut(vf).record.skip_next_punish = true;
            if let Err(e) = self.save_vf(&mut ws) {
                error!("{id}: {vf} not saved leaving full access: {e}");
                self.events.queue_reset(vf, ws.sched_block);
                failed.insert(id);
                continue;
            }
            if let Err(e) = self.start_ws(&mut ws) {
                warn!("{id}: not restarted after full access: {e}");
                failed.insert(id);
            }
        }
        failed
    }

    /// Stop scheduling and hand every graphics engine to the PF
    pub fn park(&self) -> Result<()> {
        let topo = self.topo();
        let parked = self
            .stop_all_in(&topo)
            .and_then(|()| self.switch_all_to(&topo, VfId::PF, Some(SchedBlock::Gfx)));
        if let Err(e) = parked {
            error!("park failed: {e}");
            self.queue_recovery(&topo);
            return Err(e);
        }
        info!("parked on the PF");
        Ok(())
    }

    /// Save the PF graphics context taken by [`Scheduler::park`]
    pub fn unpark(&self) -> Result<()> {
        let topo = self.topo();
        if let Err(e) = self.save_all_in(&topo, Some(SchedBlock::Gfx)) {
            error!("unpark failed: {e}");
            self.queue_recovery(&topo);
            return Err(e);
        }
        Ok(())
    }

    /// Suspend the event worker and load the PF on every engine
    pub fn lock(&self) -> Result<()> {
        let held = self.vfs.read().full_access_mask();
        if !held.is_empty() {
            warn!("locking while {held:?} hold full access");
        }
        let suspended = self.events.queue_suspend();
        if let Err(e) = self.switch_all_to(&self.topo(), VfId::PF, None) {
            warn!("PF not loaded everywhere while locking: {e}");
        }
        suspended
    }

    /// Resume the event worker
    pub fn unlock(&self) -> Result<()> {
        self.events.queue_resume()
    }

    /// Give `vf` exclusive use of its world switches
    ///
    /// Scheduling stops on each of them and `vf` is loaded. Fails with
    /// [`Error::VfBusy`] if another VF in full access shares one. When a
    /// world switch cannot be taken, the ones already taken are saved and
    /// restarted before the error is returned.
    pub fn enter_full_access(&self, vf: VfId) -> Result<()> {
        let topo = self.topo();
        let mask = self.routed(&topo, vf, None);
        let held = *self.full_access.lock();
        if mask.intersects(held) {
            warn!("{vf}: world switches {:?} already in full access", mask.intersection(held));
            return Err(Error::VfBusy);
        }

        let mut taken = WorldSwitchMask::EMPTY;
        for id in mm_first(&topo, mask) {
            let mut ws = topo.ws(id)?;
            let curr = ws.curr_idx_vf;
            ws.run_list.entry_mut(curr).record.skip_next_punish = true;
            if let Err(e) = self.stop_ws(&mut ws) {
                warn!("{id}: not stopped for full access: {e}");
            }
            let err = if !ws.is_state_ok() {
                self.events.queue_reset(ws.curr_idx_vf, ws.sched_block);
                Error::WsAbnormal
            } else if let Err(e) = self.switch_vf(&mut ws, vf) {
                error!("{id}: {vf} not loaded for full access: {e}");
                self.events.queue_reset(vf, ws.sched_block);
                Error::Failure
            } else {
                taken.insert(id);
                continue;
            };
            drop(ws);
            let stuck = self.release(&topo, vf, taken);
            if !stuck.is_empty() {
                error!("{vf}: {stuck:?} not handed back after failed full access");
            }
            return Err(err);
        }

        *self.full_access.lock() |= mask;
        self.vfs.write().get_mut(vf).full_access = FullAccessRecord {
            active: true,
            start_us: self.iov.now_us(),
            used_us: 0,
            allowed_us: self.config.allow_time_full_access_us,
            overrun_reported: false,
        };
        info!("{vf}: full access on {mask:?}");
        Ok(())
    }

    /// End the full access of `vf` and resume scheduling
    pub fn exit_full_access(&self, vf: VfId) -> Result<()> {
        let topo = self.topo();
        let (used_us, allowed_us, report) = {
            let mut vfs = self.vfs.write();
            let rec = &mut vfs.get_mut(vf).full_access;
            if !rec.active {
                return Err(Error::InvalidParameter);
            }
            rec.used_us = self.iov.now_us().saturating_sub(rec.start_us);
            let report = rec.used_us > rec.allowed_us && !rec.overrun_reported;
            rec.overrun_reported |= report;
            (rec.used_us, rec.allowed_us, report)
        };
        if report {
            self.guard.report_overrun(vf, used_us, allowed_us);
        }

        let mask = self.routed(&topo, vf, None);
        let failed = self.release(&topo, vf, mask);

        {
            let mut held = self.full_access.lock();
            *held = held.difference(mask);
        }
        self.vfs.write().get_mut(vf).full_access.active = false;
        info!("{vf}: full access left after {used_us}us");
        outcome(failed, "exit full access")
    }

    /// VFs whose full access outlasted the budget
    ///
    /// Each overrun is reported to the guard once.
    pub fn check_full_access_budget(&self) -> VfMask {
        let now = self.iov.now_us();
        let mut over = VfMask::EMPTY;
        let mut fresh: ArrayVec<(VfId, u64, u64), MAX_VF_SLOT> = ArrayVec::new();
        {
            let mut vfs = self.vfs.write();
            for vf in VfId::all() {
                let rec = &mut vfs.get_mut(vf).full_access;
                if !rec.active {
                    continue;
                }
                let used = now.saturating_sub(rec.start_us);
                if used <= rec.allowed_us {
                    continue;
                }
                over.insert(vf);
                if !rec.overrun_reported {
                    rec.overrun_reported = true;
                    fresh.push((vf, used, rec.allowed_us));
                }
            }
        }
        for (vf, used, allowed) in fresh {
            warn!("{vf}: full access {used}us over a {allowed}us budget");
            self.guard.report_overrun(vf, used, allowed);
        }
        over
    }
}
