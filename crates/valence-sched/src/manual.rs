//! # Host-Driven World Switches
//!
//! Round-robin scheduling done by the driver: VFs join and leave the run
//! list, and every timer tick [`Scheduler::switch_process`] saves the
//! running VF and loads the next one.
//!
//! ```text
//!   tick ──▶ save curr ──▶ rotate to tail ──▶ pick next ──▶ load ──▶ re-arm(slice)
//!                                                │
//!                              fairness: debt ───┘   liquid: busy first
//! ```

use log::{debug, error, info, warn};

use valence_core::time::is_infinite;
use valence_core::{
    Error, Result, SchedFlags, SchedMode, VfContextState, VfId, VfSchedState, WorldSwitchId,
};
use valence_hal::GpuIov;

use crate::scheduler::Scheduler;
use crate::world_switch::WorldSwitch;

impl<H: GpuIov> Scheduler<H> {
    /// List `vf` on a host-driven world switch
    ///
    /// A VF without a slice for this engine family is left out.
    pub(crate) fn manual_add_vf(&self, ws: &mut WorldSwitch, vf: VfId) -> Result<()> {
        let ts = self.vfs.read().get(vf).time_slice_us[ws.sched_block.index()];
        if ts == 0 {
            info!("{}: {vf} has no slice, not listed", ws.id);
            return Ok(());
        }
        let entry = ws.run_list.entry_mut(vf);
        entry.time_slice = ts;
        entry.dummy = false;
        entry.skip_cnt = 0;
        ws.run_list.push_back(vf);
        ws.self_switch_trigger = self.config.flags.contains(SchedFlags::SELF_SWITCH_TRIGGER);
        debug!("{}: {vf} listed with {ts}us", ws.id);
        Ok(())
    }

    /// Take `vf` off a host-driven world switch, saving it if resident
    ///
    /// Fairness keeps the slot as a dummy the PF runs in.
    pub(crate) fn manual_remove_vf(&self, ws: &mut WorldSwitch, vf: VfId) -> Result<()> {
        if ws.curr_idx_vf == vf && ws.curr_vf_state == VfContextState::Loaded {
            if let Err(e) = self.save_vf(ws) {
                error!("{}: {vf} could not be saved on removal: {e}", ws.id);
                self.events.queue_reset(vf, ws.sched_block);
                return Err(Error::Failure);
            }
        }
        if ws.run_list.is_fairness() && !vf.is_pf() {
            ws.run_list.entry_mut(vf).dummy = true;
        } else {
            ws.run_list.unlink(vf);
        }
        ws.vf_inited.remove(vf);
        Ok(())
    }

    pub(crate) fn manual_update_time_slice(&self, ws: &mut WorldSwitch, vf: VfId) {
        let ts = self.vfs.read().get(vf).time_slice_us[ws.sched_block.index()];
        ws.run_list.entry_mut(vf).time_slice = ts;
    }

    pub(crate) fn manual_start(&self, ws: &mut WorldSwitch) -> Result<()> {
        if ws.switch_running {
            if ws.single_vf && ws.self_switch_trigger {
                ws.self_switch_trigger = false;
                if ws.curr_vf_state == VfContextState::Loaded {
                    info!("{}: self switch of {}", ws.id, ws.curr_idx_vf);
                    let vf = ws.curr_idx_vf;
                    return self.logical_run(ws, vf);
                }
            }
            return Ok(());
        }
        if !ws.is_state_ok() {
            info!("{}: abnormal, left stopped", ws.id);
            return Ok(());
        }
        ws.switch_running = true;
        Ok(())
    }

    pub(crate) fn manual_stop(&self, ws: &mut WorldSwitch) -> Result<()> {
        if !ws.switch_running && ws.curr_vf_state != VfContextState::Loaded {
            return Ok(());
        }
        ws.switch_running = false;
        if ws.curr_vf_state == VfContextState::Loaded {
            let vf = ws.curr_idx_vf;
            if self.save_vf(ws).is_err() {
                return Err(Error::Failure);
            }
            self.rotate_out(ws, vf);
        }
        Ok(())
    }

    /// Move a VF that just left the engine to the tail of the run order
    ///
    /// The PF keeps its place unless it competes for time.
    fn rotate_out(&self, ws: &mut WorldSwitch, vf: VfId) {
        let pf_competes =
            self.pf_active() && self.vfs.read().get(VfId::PF).state == VfSchedState::Active;
        if vf.is_pf() && !pf_competes {
            return;
        }
        ws.run_list.move_to_tail(vf);
    }

    /// One scheduling tick on a host-driven world switch
    ///
    /// Returns the slice to re-arm the timer with, or `None` when the
    /// current VF keeps the engine.
    pub(crate) fn tick(&self, ws: &mut WorldSwitch) -> Option<u32> {
        if !ws.switch_running {
            return None;
        }

        if !ws.run_list.has_runnable() {
            if ws.curr_vf_state != VfContextState::Loaded {
                if let Err(e) = self.switch_vf(ws, VfId::PF) {
                    warn!("{}: PF not loaded on an empty run list: {e}", ws.id);
                }
            }
            return None;
        }

        let hybrid = ws.sched_mode == SchedMode::HybridLiquid;
        if hybrid && ws.curr_vf_state == VfContextState::Loaded {
            let active = self.vfs.read().in_state(VfSchedState::Active);
            if ws.is_one_active_vf(active) {
                return None;
            }
        }

        if ws.curr_vf_state == VfContextState::Loaded {
            let curr = ws.curr_idx_vf;
            if let Err(e) = self.save_vf(ws) {
                error!("{}: {curr} not saved at slice end: {e}", ws.id);
                self.events.queue_reset(curr, ws.sched_block);
                return None;
            }
            if hybrid {
                ws.vf_timeout.insert(curr);
            }
            self.rotate_out(ws, curr);
        } else if let Some(last) = ws.run_list.back() {
            if ws.run_list.is_fairness() && ws.run_list.entry(last).dummy {
                self.stop_record(ws, last);
            }
        }

        let pf_active = self.pf_active();
        let pick = if hybrid {
            if let Some(block) = ws.hw_sched_mask.first() {
                match self.iov.get_vm_busy_status(block) {
                    Ok(busy) => ws.vf_busy = busy & ws.vf_inited,
                    Err(e) => warn!("{block}: busy status unreadable: {e}"),
                }
            }
            ws.run_list
                .schedule_liquid(ws.vf_busy | ws.vf_timeout, pf_active)
        } else {
            ws.run_list.schedule_default(pf_active)
        };
        let (vf, ts) = pick?;
        if hybrid {
            ws.vf_timeout.remove(vf);
        }

        if let Err(e) = self.switch_vf(ws, vf) {
            error!("{}: {vf} not loaded: {e}", ws.id);
            self.events.queue_reset(vf, ws.sched_block);
            return None;
        }
        debug!("{}: {vf} runs for {ts}us", ws.id);
        if is_infinite(ts) { None } else { Some(ts) }
    }

    /// Run one scheduling tick on a host-driven world switch
    ///
    /// Returns the slice to re-arm the tick timer with, or `None` to leave
    /// it disarmed. Autonomous world switches never need ticks.
    pub fn switch_process(&self, id: WorldSwitchId) -> Result<Option<u32>> {
        let topo = self.topo();
        let mut ws = topo.ws(id)?;
        if ws.is_auto() || !ws.enabled {
            return Ok(None);
        }
        Ok(self.tick(&mut ws))
    }
}
