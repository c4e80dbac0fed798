//! # World-Switch Context
//!
//! Tracks which VF a world switch holds and in what state its context is,
//! on top of the logical run/pause walks.
//!
//! ```text
//!            init_vf / load_vf            save_vf
//!   Clear ───────────────────▶ Loaded ───────────▶ Saved
//!     ▲                          │                  │
//!     └──── clear_state ─────────┴── walk failed ──▶ Abnormal
//! ```
//!
//! An abnormal world switch refuses to switch until reset.

use arrayvec::ArrayVec;
use log::{error, info, warn};

use valence_core::{
    Error, MAX_NUM_WORLD_SWITCH, Result, SchedBlock, VfContextState, VfId, WorldSwitchId,
    WorldSwitchMask,
};
use valence_hal::GpuIov;

use crate::scheduler::Scheduler;
use crate::topology::Topology;
use crate::world_switch::WorldSwitch;

impl WorldSwitch {
    /// Context usable for switching
    #[inline]
    pub fn is_state_ok(&self) -> bool {
        self.curr_vf_state != VfContextState::Abnormal
    }
}

/// `mask` with multimedia world switches ahead of graphics ones
pub(crate) fn mm_first(
    topo: &Topology,
    mask: WorldSwitchMask,
) -> ArrayVec<WorldSwitchId, MAX_NUM_WORLD_SWITCH> {
    let gfx = |id: &WorldSwitchId| topo.layout(*id).is_ok_and(|ws| ws.is_gfx());
    mask.iter()
        .filter(|id| !gfx(id))
        .chain(mask.iter().filter(|id| gfx(id)))
        .collect()
}

/// [`Error::Failure`] when any world switch in `failed` did not make it
pub(crate) fn outcome(failed: WorldSwitchMask, what: &str) -> Result<()> {
    if failed.is_empty() {
        Ok(())
    } else {
        error!("{what} failed on {failed:?}");
        Err(Error::Failure)
    }
}

impl<H: GpuIov> Scheduler<H> {
    // =========================================================================
    // TIME RECORDS
    // =========================================================================

    pub(crate) fn start_record(&self, ws: &mut WorldSwitch, vf: VfId) {
        let now = self.iov.now_us();
        ws.run_list.entry_mut(vf).record.start(now);
    }

    pub(crate) fn stop_record(&self, ws: &mut WorldSwitch, vf: VfId) {
        let now = self.iov.now_us();
        ws.run_list.entry_mut(vf).record.stop(now);
    }

    // =========================================================================
    // PER WORLD SWITCH
    // =========================================================================

    /// Bring up a fresh context for `vf`
    pub(crate) fn init_vf(&self, ws: &mut WorldSwitch, vf: VfId) -> Result<()> {
        if !ws.enabled {
            return Ok(());
        }
        ws.curr_idx_vf = vf;
        ws.vf_inited.insert(vf);
        self.start_record(ws, vf);
        match self.logical_run(ws, vf) {
            Ok(()) => {
                ws.curr_vf_state = VfContextState::Loaded;
                Ok(())
            },
            Err(e) => {
                error!("{}: init of {vf} failed: {e}", ws.id);
                ws.curr_vf_state = VfContextState::Abnormal;
                Err(e)
            },
        }
    }

    /// Restore the saved context of `vf`
    pub(crate) fn load_vf(&self, ws: &mut WorldSwitch, vf: VfId) -> Result<()> {
        if !ws.enabled {
            return Ok(());
        }
        ws.curr_idx_vf = vf;
        self.start_record(ws, vf);
        match self.logical_run(ws, vf) {
            Ok(()) => {
                ws.curr_vf_state = VfContextState::Loaded;
                Ok(())
            },
            Err(e) => {
                error!("{}: load of {vf} failed: {e}", ws.id);
                ws.switch_running = false;
                ws.curr_vf_state = VfContextState::Abnormal;
                Err(e)
            },
        }
    }

    /// Save whatever context the world switch holds
    pub(crate) fn save_vf(&self, ws: &mut WorldSwitch) -> Result<()> {
        if !ws.enabled || ws.curr_vf_state != VfContextState::Loaded {
            return Ok(());
        }
        let vf = ws.curr_idx_vf;
        let saved = self.logical_pause(ws, vf);
        if let Err(e) = saved {
            error!("{}: save of {vf} failed: {e}", ws.id);
            ws.switch_running = false;
            ws.curr_vf_state = VfContextState::Abnormal;
        } else {
            ws.curr_vf_state = VfContextState::Saved;
        }
        self.stop_record(ws, vf);
        saved
    }

    /// Make `vf` the loaded context, saving the current one first
    pub(crate) fn switch_vf(&self, ws: &mut WorldSwitch, vf: VfId) -> Result<()> {
        match ws.curr_vf_state {
            VfContextState::Abnormal => {
                warn!("{}: abnormal, not switching to {vf}", ws.id);
                return Err(Error::WsAbnormal);
            },
            VfContextState::Loaded if ws.curr_idx_vf == vf => return Ok(()),
            VfContextState::Loaded => self.save_vf(ws)?,
            VfContextState::Clear | VfContextState::Saved => {},
        }
        if ws.vf_inited.contains(vf) {
            self.load_vf(ws, vf)
        } else {
            self.init_vf(ws, vf)
        }
    }

    /// Forget the held context, which must be initialized again
    pub(crate) fn clear_state(&self, ws: &mut WorldSwitch) {
        let vf = ws.curr_idx_vf;
        ws.curr_vf_state = VfContextState::Clear;
        ws.vf_inited.remove(vf);
        self.stop_record(ws, vf);
    }

    pub(crate) fn mark_abnormal(&self, ws: &mut WorldSwitch, vf: VfId) -> Result<()> {
        if !ws.enabled {
            return Err(Error::Failure);
        }
        warn!("{}: {vf} marked abnormal", ws.id);
        ws.curr_idx_vf = vf;
        ws.curr_vf_state = VfContextState::Abnormal;
        Ok(())
    }

    // =========================================================================
    // PER VF
    // =========================================================================

    /// Initialize `vf` on every world switch it is routed to, multimedia
    /// first
    pub fn context_init(&self, vf: VfId) -> Result<()> {
        let topo = self.topo();
        let mut failed = WorldSwitchMask::EMPTY;
        for id in mm_first(&topo, self.routed(&topo, vf, None)) {
            if self.init_vf(&mut *topo.ws(id)?, vf).is_err() {
                failed.insert(id);
            }
        }
        outcome(failed, "context init")
    }

    /// Switch every world switch of `vf` (or those of one sched block) to it
    pub fn context_switch_to_vf(&self, vf: VfId, sched_block: Option<SchedBlock>) -> Result<()> {
        self.switch_all_to(&self.topo(), vf, sched_block)
    }

    pub(crate) fn switch_all_to(
        &self,
        topo: &Topology,
        vf: VfId,
        sched_block: Option<SchedBlock>,
    ) -> Result<()> {
        let mut failed = WorldSwitchMask::EMPTY;
        for id in mm_first(topo, self.routed(topo, vf, sched_block)) {
            if let Err(e) = self.switch_vf(&mut *topo.ws(id)?, vf) {
                warn!("{id}: switch to {vf} failed: {e}");
                failed.insert(id);
            }
        }
        outcome(failed, "context switch")
    }

    /// Bring `vf` to a saved context on its world switches without leaving
    /// it running
    ///
    /// World switches where the VF is not active, never initialized or
    /// already saved are skipped.
    pub fn switch_to_vf_saved(&self, vf: VfId, sched_block: Option<SchedBlock>) -> Result<()> {
        let topo = self.topo();
        if !self.vfs.read().get(vf).is_active() {
            return Ok(());
        }
        let mut failed = WorldSwitchMask::EMPTY;
        for id in mm_first(&topo, self.routed(&topo, vf, sched_block)) {
            let mut ws = topo.ws(id)?;
            let saved = ws.curr_idx_vf == vf && ws.curr_vf_state == VfContextState::Saved;
            if !ws.vf_inited.contains(vf) || saved {
                continue;
            }
            let done = self
                .switch_vf(&mut ws, vf)
                .and_then(|()| self.save_vf(&mut ws));
            if let Err(e) = done {
                warn!("{id}: {vf} not saved: {e}");
                failed.insert(id);
            }
        }
        outcome(failed, "switch to saved")
    }

    /// Save the held context on every world switch, or those of one sched
    /// block
    pub fn save_all(&self, sched_block: Option<SchedBlock>) -> Result<()> {
        self.save_all_in(&self.topo(), sched_block)
    }

    pub(crate) fn save_all_in(
        &self,
        topo: &Topology,
        sched_block: Option<SchedBlock>,
    ) -> Result<()> {
        let mut failed = WorldSwitchMask::EMPTY;
        for id in topo.serving(sched_block) {
            if self.save_vf(&mut *topo.ws(id)?).is_err() {
                failed.insert(id);
            }
        }
        outcome(failed, "save all")
    }

    /// Forget `vf`'s context on every world switch holding it
    pub fn context_clear(&self, vf: VfId) -> Result<()> {
        let topo = self.topo();
        for id in self.routed(&topo, vf, None).iter() {
            let mut ws = topo.ws(id)?;
            if ws.curr_idx_vf == vf {
                self.clear_state(&mut ws);
            } else {
                ws.vf_inited.remove(vf);
            }
        }
        Ok(())
    }

    /// Flag the world switches of `vf` as abnormal with `vf` resident
    pub fn set_vf_abnormal(&self, vf: VfId, sched_block: Option<SchedBlock>) -> Result<()> {
        let topo = self.topo();
        for id in self.routed(&topo, vf, sched_block).iter() {
            self.mark_abnormal(&mut *topo.ws(id)?, vf)?;
        }
        Ok(())
    }

    /// First enabled world switch whose context is abnormal
    pub fn abnormal_world_switch(&self) -> Result<Option<WorldSwitchId>> {
        Ok(abnormal_in(&self.topo()))
    }
}

pub(crate) fn abnormal_in(topo: &Topology) -> Option<WorldSwitchId> {
    let found = topo
        .serving(None)
        .find(|id| topo.ws(*id).is_ok_and(|ws| !ws.is_state_ok()));
    if let Some(id) = found {
        info!("{id} is abnormal");
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{hw, mi300x, shared, vf};
    use valence_core::{GpuState, SchedConfig, VfSchedState};
    use valence_hal::GpuIovCmd;

    #[test]
    fn test_context_init_runs_media_first() {
        let sched = mi300x(8);
        sched.context_init(vf(2)).unwrap();
        let cmds = sched.iov.commands();
        let first_gfx = cmds.iter().position(|c| c.block == hw(14)).unwrap();
        assert!(cmds[..first_gfx].iter().all(|c| c.block.index() < 12));
        assert!(cmds[first_gfx..].iter().all(|c| c.block == hw(14)));

        let gfx = sched.ws_of(vf(2), SchedBlock::Gfx).unwrap();
        let ws = sched.world_switch(gfx).unwrap();
        assert_eq!(ws.curr_vf_state, VfContextState::Loaded);
        assert!(ws.vf_inited.contains(vf(2)));
        assert_ne!(ws.run_list.entry(vf(2)).record.start_us, 0);
    }

    #[test]
    fn test_switch_saves_then_inits() {
        let sched = shared(SchedConfig::default());
        sched.vfs.write().get_mut(vf(1)).state = VfSchedState::Active;
        sched.context_switch_to_vf(vf(0), Some(SchedBlock::Gfx)).unwrap();
        sched.iov.clear_log();

        sched.context_switch_to_vf(vf(1), Some(SchedBlock::Gfx)).unwrap();
        assert_eq!(
            sched.iov.commands_for(hw(1)),
            [
                (GpuIovCmd::Idle, vf(0)),
                (GpuIovCmd::Save, vf(0)),
                (GpuIovCmd::Init, vf(1)),
                (GpuIovCmd::Run, vf(1)),
            ]
        );
        let ws = sched.world_switch(sched.ws_of(vf(1), SchedBlock::Gfx).unwrap()).unwrap();
        assert_eq!(ws.curr_idx_vf, vf(1));
        assert_eq!(ws.curr_vf_state, VfContextState::Loaded);
        assert!(ws.vf_inited.contains(vf(0)));
    }

    #[test]
    fn test_switch_to_loaded_vf_is_free() {
        let sched = mi300x(8);
        sched.context_switch_to_vf(vf(4), None).unwrap();
        sched.iov.clear_log();
        sched.context_switch_to_vf(vf(4), None).unwrap();
        assert!(sched.iov.commands().is_empty());
    }

    #[test]
    fn test_failed_save_marks_abnormal() {
        let sched = shared(SchedConfig::default().with_cmd_budget(200));
        sched.context_switch_to_vf(vf(0), Some(SchedBlock::Gfx)).unwrap();
        sched.iov.hang(hw(2));

        assert_eq!(sched.save_all(Some(SchedBlock::Gfx)).unwrap_err(), Error::Failure);
        let gfx = sched.ws_of(vf(0), SchedBlock::Gfx).unwrap();
        assert_eq!(sched.abnormal_world_switch().unwrap(), Some(gfx));

        sched.iov.unhang(hw(2));
        assert_eq!(
            sched.context_switch_to_vf(vf(1), Some(SchedBlock::Gfx)).unwrap_err(),
            Error::Failure
        );
        let ws = sched.world_switch(gfx).unwrap();
        assert!(!ws.is_state_ok());
        assert_eq!(ws.curr_idx_vf, vf(0));
    }

    #[test]
    fn test_clear_forces_reinit() {
        let sched = mi300x(8);
        sched.context_switch_to_vf(vf(1), Some(SchedBlock::Gfx)).unwrap();
        sched.save_all(Some(SchedBlock::Gfx)).unwrap();
        sched.context_clear(vf(1)).unwrap();
        sched.iov.clear_log();

        sched.context_switch_to_vf(vf(1), Some(SchedBlock::Gfx)).unwrap();
        assert_eq!(
            sched.iov.commands_for(hw(13)),
            [(GpuIovCmd::Init, vf(1)), (GpuIovCmd::Run, vf(1))]
        );
    }

    #[test]
    fn test_switch_to_saved_skips_idle_vfs() {
        let sched = mi300x(8);
        sched.switch_to_vf_saved(vf(0), None).unwrap();
        assert!(sched.iov.commands().is_empty());

        sched.vfs.write().get_mut(vf(0)).state = VfSchedState::Active;
        sched.context_switch_to_vf(vf(0), Some(SchedBlock::Gfx)).unwrap();
        sched.context_switch_to_vf(VfId::PF, Some(SchedBlock::Gfx)).unwrap();
        sched.iov.clear_log();

        sched.switch_to_vf_saved(vf(0), Some(SchedBlock::Gfx)).unwrap();
        let ws = sched.world_switch(sched.ws_of(vf(0), SchedBlock::Gfx).unwrap()).unwrap();
        assert_eq!(ws.curr_idx_vf, vf(0));
        assert_eq!(ws.curr_vf_state, VfContextState::Saved);
        assert!(sched.block_state(hw(12)).unwrap().is_at(GpuState::Save, vf(0)));
        assert!(
            sched
                .iov
                .commands_for(hw(12))
                .contains(&(GpuIovCmd::Load, vf(0)))
        );
    }

    #[test]
    fn test_set_vf_abnormal() {
        let sched = mi300x(1);
        sched.set_vf_abnormal(vf(0), Some(SchedBlock::Vcn)).unwrap();
        let vcn = sched.ws_of(vf(0), SchedBlock::Vcn).unwrap();
        let ws = sched.world_switch(vcn).unwrap();
        assert_eq!(ws.curr_vf_state, VfContextState::Abnormal);
        assert_eq!(sched.abnormal_world_switch().unwrap(), Some(vcn));
    }
}
