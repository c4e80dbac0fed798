//! # VF Control Surface
//!
//! VF-scoped requests fanned out over every world switch the VF is routed
//! to, optionally narrowed to one sched block. Multimedia world switches go
//! first. A failing world switch does not stop the others; the call then
//! reports [`Error::Failure`] and the logs name which one failed.

use log::{error, info, warn};

use valence_core::time::{bandwidth_to_time_slice, time_slice_to_bandwidth};
use valence_core::{
    DriverMode, Error, GpuState, Result, SchedBlock, VfContextState, VfId, VfMask, VfSchedState,
    WorldSwitchId, WorldSwitchMask,
};
use valence_hal::GpuIov;

use crate::context::{mm_first, outcome};
use crate::scheduler::Scheduler;
use crate::topology::Topology;
use crate::world_switch::WorldSwitch;

impl<H: GpuIov> Scheduler<H> {
    /// Build world switches for `num_vf` VFs and program firmware policies
    pub fn init(&self, num_vf: u32) -> Result<()> {
        self.set_vf_num(num_vf)?;
        let topo = self.topo();
        for layout in topo.layouts.iter().filter(|ws| ws.mode == DriverMode::Auto) {
            self.config_auto_sched(&mut *topo.ws(layout.id)?)?;
        }
        Ok(())
    }

    fn for_each_routed(
        &self,
        vf: VfId,
        sched_block: Option<SchedBlock>,
        what: &str,
        mut op: impl FnMut(&mut WorldSwitch) -> Result<()>,
    ) -> Result<()> {
        let topo = self.topo();
        let mut failed = WorldSwitchMask::EMPTY;
        for id in mm_first(&topo, self.routed(&topo, vf, sched_block)) {
            if let Err(e) = op(&mut *topo.ws(id)?) {
                warn!("{id}: {what} of {vf} failed: {e}");
                failed.insert(id);
            }
        }
        outcome(failed, what)
    }

    // =========================================================================
    // VF STATE
    // =========================================================================

    /// Start `vf`, or only load it when it skips runs
    pub fn run_vf(&self, vf: VfId, sched_block: Option<SchedBlock>) -> Result<()> {
        self.for_each_routed(vf, sched_block, "run", |ws| self.logical_run(ws, vf))
    }

    /// Save the context of `vf`
    pub fn pause_vf(&self, vf: VfId, sched_block: Option<SchedBlock>) -> Result<()> {
        self.for_each_routed(vf, sched_block, "pause", |ws| self.logical_pause(ws, vf))
    }

    /// Shut the context of `vf` down
    pub fn shutdown_vf(&self, vf: VfId, sched_block: Option<SchedBlock>) -> Result<()> {
        self.for_each_routed(vf, sched_block, "shutdown", |ws| self.logical_shutdown(ws, vf))
    }

    /// Drop the context of `vf` after the hardware was reinitialized
    ///
    /// Every block is stamped as holding `vf` saved, then shut down, so one
    /// Shutdown command per block reaches the hardware. A busy block is
    /// skipped and reported like a failed one.
    pub fn reset_vf(&self, vf: VfId, sched_block: Option<SchedBlock>) -> Result<()> {
        let topo = self.topo();
        let machine = self.machine();
        let mut failed = false;

        for id in mm_first(&topo, self.routed(&topo, vf, sched_block)) {
            let mut ws = topo.ws(id)?;
            let env = self.edge_env(&ws);
            for block in ws.hw_sched_mask.iter() {
                let mut st = match self.blocks.try_claim(block) {
                    Ok(st) => st,
                    Err(e) => {
                        error!("{block}: {vf} not shut down after reset: {e}");
                        failed = true;
                        continue;
                    },
                };
                st.land(GpuState::Save, vf);
                let shut =
                    machine.goto_state(&env, block, &mut st, &mut ws, Some(vf), GpuState::Shutdown);
                if let Err(e) = shut {
                    error!("{block}: {vf} not shut down after reset: {e}");
                    failed = true;
                }
            }
            ws.vf_inited.remove(vf);
            if ws.curr_idx_vf == vf {
                ws.curr_vf_state = VfContextState::Clear;
            }
            self.stop_record(&mut ws, vf);
        }

        if failed {
            Err(Error::SchedShutdownVfFail)
        } else {
            info!("{vf} reset");
            Ok(())
        }
    }

    // =========================================================================
    // TIME SLICES
    // =========================================================================

    /// Set the `sched_block` slice of `vf`, or of every VF
    ///
    /// Fairness keeps slices equal, so setting one VF sets all VFs of its
    /// world switch. Multimedia slices can only be set for every VF.
    pub fn set_time_slice(
        &self,
        vf: Option<VfId>,
        time_slice_us: u32,
        sched_block: SchedBlock,
    ) -> Result<()> {
        if vf.is_some() && !sched_block.is_gfx() {
            warn!("per-vf {sched_block} time slice unsupported");
            return Err(Error::NotSupported);
        }
        let topo = self.topo();
        let ids: WorldSwitchMask = match vf {
            Some(vf) => self.ws_of(vf, sched_block).into_iter().collect(),
            None => topo
                .layouts
                .iter()
                .filter(|ws| ws.sched_block == sched_block)
                .map(|ws| ws.id)
                .collect(),
        };
        if ids.is_empty() {
            return Err(Error::InvalidVf);
        }
        for id in ids.iter() {
            if !topo.layout(id)?.enabled {
                error!("{id}: disabled, {sched_block} slice not set");
                return Err(Error::Failure);
            }
        }

        for id in ids.iter() {
            let mut ws = topo.ws(id)?;
            let targets = match vf {
                Some(vf) if !ws.run_list.is_fairness() => VfMask::only(vf),
                _ => ws.allowed_vfs,
            };
            {
                let mut vfs = self.vfs.write();
                for target in targets.iter() {
                    vfs.get_mut(target).time_slice_us[sched_block.index()] = time_slice_us;
                }
            }
            if ws.is_auto() {
                self.auto_update_time_slice(&mut ws, targets)?;
            } else {
                for target in targets.iter() {
                    self.manual_update_time_slice(&mut ws, target);
                }
            }
        }
        info!("{sched_block} slice of {vf:?} set to {time_slice_us}us");
        Ok(())
    }

    /// Set the graphics share of `vf` as a bandwidth
    pub fn set_bandwidth(&self, vf: VfId, bandwidth: u32, sched_block: SchedBlock) -> Result<()> {
        let ts = bandwidth_to_time_slice(bandwidth, self.config.max_bandwidth);
        if ts == 0 {
            return Err(Error::InvalidParameter);
        }
        self.set_time_slice(Some(vf), ts, sched_block)
    }

    /// Share of `vf` expressed as a bandwidth
    pub fn get_bandwidth(&self, vf: VfId, sched_block: SchedBlock) -> Result<u32> {
        if self.config.max_bandwidth == 0 {
            return Err(Error::NotSupported);
        }
        let ts = self.vfs.read().get(vf).time_slice_us[sched_block.index()];
        Ok(time_slice_to_bandwidth(ts, self.config.max_bandwidth))
    }

    // =========================================================================
    // VF LIFECYCLE
    // =========================================================================

    /// Mark `vf` active and put it on every world switch it is routed to
    pub fn add_vf(&self, vf: VfId) -> Result<()> {
        let topo = self.topo();
        let routed = self.routed(&topo, vf, None);
        if routed.is_empty() {
            warn!("{vf} is not routed");
            return Err(Error::InvalidVf);
        }
        self.vfs.write().get_mut(vf).state = VfSchedState::Active;

        let mut failed = WorldSwitchMask::EMPTY;
        for id in mm_first(&topo, routed) {
            let mut ws = topo.ws(id)?;
            let added = if ws.is_auto() {
                self.auto_add_vf(&mut ws, vf)
            } else {
                self.manual_add_vf(&mut ws, vf)
            };
            if let Err(e) = added {
                warn!("{id}: {vf} not added: {e}");
                failed.insert(id);
            }
        }
        outcome(failed, "add vf")
    }

    /// Take `vf` off every world switch, leaving it allocated
    pub fn remove_vf(&self, vf: VfId) -> Result<()> {
        let topo = self.topo();
        self.vfs.write().get_mut(vf).state = VfSchedState::Available;

        let mut failed = WorldSwitchMask::EMPTY;
        for id in mm_first(&topo, self.routed(&topo, vf, None)) {
            let mut ws = topo.ws(id)?;
            let removed = if ws.is_auto() {
                self.auto_remove_vf(&mut ws, vf)
            } else {
                self.manual_remove_vf(&mut ws, vf)
            };
            if let Err(e) = removed {
                warn!("{id}: {vf} not removed: {e}");
                failed.insert(id);
            }
        }
        outcome(failed, "remove vf")
    }

    /// Move `vf` to a lifecycle state
    ///
    /// Full access is entered through [`Scheduler::enter_full_access`] only.
    pub fn set_vf_state(&self, vf: VfId, state: VfSchedState) -> Result<()> {
        if state == VfSchedState::FullAccess {
            return Err(Error::InvalidParameter);
        }
        self.vfs.write().get_mut(vf).state = state;
        Ok(())
    }

    /// Lifecycle state of `vf`, reporting full access while it lasts
    pub fn get_vf_status(&self, vf: VfId) -> VfSchedState {
        let vfs = self.vfs.read();
        let info = vfs.get(vf);
        if info.full_access.active {
            VfSchedState::FullAccess
        } else {
            info.state
        }
    }

    // =========================================================================
    // WORLD SWITCHES
    // =========================================================================

    pub(crate) fn start_ws(&self, ws: &mut WorldSwitch) -> Result<()> {
        if !ws.enabled {
            return Err(Error::WsNotEnabled);
        }
        if ws.is_auto() {
            self.auto_start(ws)
        } else {
            self.manual_start(ws)
        }
    }

    pub(crate) fn stop_ws(&self, ws: &mut WorldSwitch) -> Result<()> {
        if !ws.enabled {
            return Err(Error::WsNotEnabled);
        }
        if ws.is_auto() {
            self.auto_stop(ws)
        } else {
            self.manual_stop(ws)
        }
    }

    /// Start scheduling on one world switch
    pub fn start_world_switch(&self, id: WorldSwitchId) -> Result<()> {
        self.start_ws(&mut *self.topo().ws(id)?)
    }

    /// Stop scheduling on one world switch, saving the context it holds
    pub fn stop_world_switch(&self, id: WorldSwitchId) -> Result<()> {
        self.stop_ws(&mut *self.topo().ws(id)?)
    }

    /// Start every enabled world switch, multimedia first
    pub fn start_all(&self) -> Result<()> {
        let topo = self.topo();
        let ids: WorldSwitchMask = topo.serving(None).collect();
        let mut failed = WorldSwitchMask::EMPTY;
        for id in mm_first(&topo, ids) {
            if let Err(e) = self.start_ws(&mut *topo.ws(id)?) {
                warn!("{id}: not started: {e}");
                failed.insert(id);
            }
        }
        outcome(failed, "start all")
    }

    /// Stop every enabled world switch
    pub fn stop_all(&self) -> Result<()> {
        self.stop_all_in(&self.topo())
    }

    pub(crate) fn stop_all_in(&self, topo: &Topology) -> Result<()> {
        let mut failed = WorldSwitchMask::EMPTY;
        for id in topo.serving(None) {
            if let Err(e) = self.stop_ws(&mut *topo.ws(id)?) {
                warn!("{id}: not stopped: {e}");
                failed.insert(id);
            }
        }
        outcome(failed, "stop all")
    }

    // =========================================================================
    // RECOVERY
    // =========================================================================

    /// Realign the blocks of a multi-block host-driven world switch on `vf`
    ///
    /// Blocks already holding `vf` are left alone. A block holding another
    /// VF's context is saved first; a block stalled on another VF cannot be
    /// realigned.
    pub fn sync_abnormal_sched(&self, vf: VfId, id: WorldSwitchId) -> Result<()> {
        let topo = self.topo();
        let mut ws = topo.ws(id)?;
        if ws.is_auto() || ws.hw_sched_mask.count() < 2 {
            return Ok(());
        }
        let env = self.edge_env(&ws);
        let machine = self.machine();

        for block in ws.hw_sched_mask.iter() {
            let status = self.iov.get_active_vf_status(block)?.context_state();
            let hw_vf = self.iov.get_active_vf_idx(block)?;
            if hw_vf == vf {
                continue;
            }
            if status == VfContextState::Abnormal {
                error!("{block}: stalled on {hw_vf}, cannot realign on {vf}");
                return Err(Error::Failure);
            }

            let mut st = self.blocks.try_claim(block)?;
            match status {
                VfContextState::Loaded => {
                    st.land(GpuState::Run, hw_vf);
                    machine.goto_state(&env, block, &mut st, &mut ws, Some(hw_vf), GpuState::Save)?;
                },
                VfContextState::Saved => st.land(GpuState::Save, hw_vf),
                VfContextState::Clear | VfContextState::Abnormal => {
                    st.land(GpuState::Shutdown, hw_vf)
                },
            }
            machine.goto_state(&env, block, &mut st, &mut ws, Some(vf), GpuState::Run)?;
            info!("{block}: realigned from {hw_vf} on {vf}");
        }

        ws.curr_idx_vf = vf;
        ws.curr_vf_state = VfContextState::Loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{SHARED, hw, mi300x, sched_on, shared, vf};
    use valence_core::{SchedConfig, SchedFlags, SchedMode};
    use valence_hal::{ActiveFcnStatus, GpuIovCmd};

    #[test]
    fn test_init_programs_firmware_policies() {
        let sched = Scheduler::new(
            valence_hal::mock::MockGpuIov::new(),
            &valence_hal::asic::mi300::MI300X,
            SchedConfig::default(),
        )
        .unwrap();
        sched.init(8).unwrap();
        assert_eq!(sched.iov().auto_mode(hw(0)), Some(SchedMode::FrameLoop));
        assert_eq!(sched.iov().get_time_quanta_option(hw(0)).unwrap(), 0xFFFF_FFFF);
        assert_eq!(sched.iov().auto_mode(hw(12)), None);
    }

    #[test]
    fn test_run_pause_shutdown() {
        let sched = mi300x(8);
        let gfx = SchedBlock::Gfx;
        sched.run_vf(vf(5), Some(gfx)).unwrap();
        assert!(sched.block_state(hw(17)).unwrap().is_at(GpuState::Run, vf(5)));
        sched.pause_vf(vf(5), Some(gfx)).unwrap();
        assert!(sched.block_state(hw(17)).unwrap().is_at(GpuState::Save, vf(5)));
        sched.shutdown_vf(vf(5), Some(gfx)).unwrap();
        assert!(sched.block_state(hw(17)).unwrap().is_at(GpuState::Shutdown, vf(5)));
        assert_eq!(
            sched.iov().commands_for(hw(17)),
            [
                (GpuIovCmd::Init, vf(5)),
                (GpuIovCmd::Run, vf(5)),
                (GpuIovCmd::Idle, vf(5)),
                (GpuIovCmd::Save, vf(5)),
                (GpuIovCmd::Shutdown, vf(5)),
            ]
        );
    }

    #[test]
    fn test_run_continues_past_failed_world_switch() {
        let config = SchedConfig::default().with_cmd_budget(200);
        let sched = sched_on(&valence_hal::asic::mi300::MI300X, config, 8);
        sched.iov().hang(hw(12));

        let err = sched.run_vf(vf(0), None).unwrap_err();
        assert_eq!(err, Error::Failure);
        // Multimedia ran before the graphics block timed out
        assert!(sched.block_state(hw(0)).unwrap().is_at(GpuState::Run, vf(0)));
    }

    #[test]
    fn test_reset_issues_one_shutdown_per_block() {
        let sched = mi300x(8);
        sched.context_switch_to_vf(vf(1), Some(SchedBlock::Gfx)).unwrap();
        sched.iov().clear_log();

        sched.reset_vf(vf(1), Some(SchedBlock::Gfx)).unwrap();
        assert_eq!(sched.iov().commands_for(hw(13)), [(GpuIovCmd::Shutdown, vf(1))]);
        let ws = sched.world_switch(sched.ws_of(vf(1), SchedBlock::Gfx).unwrap()).unwrap();
        assert_eq!(ws.curr_vf_state, VfContextState::Clear);
        assert!(!ws.vf_inited.contains(vf(1)));

        let busy = shared(SchedConfig::default());
        let held = busy.blocks.try_claim(hw(1)).unwrap();
        assert_eq!(
            busy.reset_vf(vf(0), Some(SchedBlock::Gfx)).unwrap_err(),
            Error::SchedShutdownVfFail
        );
        drop(held);
        assert!(busy.block_state(hw(2)).unwrap().is_at(GpuState::Shutdown, vf(0)));
        assert_eq!(busy.iov().commands_for(hw(2)), [(GpuIovCmd::Shutdown, vf(0))]);
        assert!(busy.iov().commands_for(hw(1)).is_empty());

        let hung = shared(SchedConfig::default().with_cmd_budget(200));
        hung.iov().hang(hw(2));
        assert_eq!(
            hung.reset_vf(vf(0), Some(SchedBlock::Gfx)).unwrap_err(),
            Error::SchedShutdownVfFail
        );
    }

    #[test]
    fn test_fairness_slice_applies_to_whole_world_switch() {
        let sched = shared(SchedConfig::default());
        sched.set_time_slice(Some(vf(2)), 8_000, SchedBlock::Gfx).unwrap();
        let gfx = sched.ws_of(vf(0), SchedBlock::Gfx).unwrap();
        let ws = sched.world_switch(gfx).unwrap();
        for i in 0..4 {
            assert_eq!(ws.run_list.entry(vf(i)).time_slice, 8_000);
        }
        assert_eq!(ws.run_list.entry(VfId::PF).time_slice, 8_000);
    }

    #[test]
    fn test_round_robin_slice_is_per_vf() {
        let sched = shared(SchedConfig::default().with_gfx_mode(SchedMode::RoundRobin));
        sched.add_vf(vf(1)).unwrap();
        sched.set_time_slice(Some(vf(1)), 9_000, SchedBlock::Gfx).unwrap();
        let ws = sched.world_switch(sched.ws_of(vf(1), SchedBlock::Gfx).unwrap()).unwrap();
        assert_eq!(ws.run_list.entry(vf(1)).time_slice, 9_000);
        assert_eq!(ws.run_list.entry(vf(0)).time_slice, 0);
        assert_eq!(sched.vfs.read().get(vf(0)).time_slice_us[SchedBlock::Gfx.index()], 6_000);
    }

    #[test]
    fn test_mm_slice_only_for_all() {
        let sched = shared(SchedConfig::default());
        assert_eq!(
            sched.set_time_slice(Some(vf(0)), 1_000, SchedBlock::Vcn).unwrap_err(),
            Error::NotSupported
        );
        sched.set_time_slice(None, 100_000, SchedBlock::Vcn).unwrap();
        assert_eq!(sched.vfs.read().get(vf(3)).time_slice_us[SchedBlock::Vcn.index()], 100_000);
    }

    #[test]
    fn test_bandwidth_round_trip() {
        let config = SchedConfig::default()
            .with_gfx_mode(SchedMode::RoundRobin)
            .with_max_bandwidth(100);
        let sched = shared(config);
        assert_eq!(sched.get_bandwidth(vf(0), SchedBlock::Gfx).unwrap(), 18);
        sched.set_bandwidth(vf(0), 30, SchedBlock::Gfx).unwrap();
        assert_eq!(sched.vfs.read().get(vf(0)).time_slice_us[SchedBlock::Gfx.index()], 10_000);
        assert_eq!(sched.get_bandwidth(vf(0), SchedBlock::Gfx).unwrap(), 30);
        assert_eq!(sched.set_bandwidth(vf(0), 0, SchedBlock::Gfx).unwrap_err(), Error::InvalidParameter);

        let unset = shared(SchedConfig::default());
        assert_eq!(unset.get_bandwidth(vf(0), SchedBlock::Gfx).unwrap_err(), Error::NotSupported);
    }

    #[test]
    fn test_vf_lifecycle() {
        let sched = shared(SchedConfig::default());
        assert_eq!(sched.add_vf(vf(6)).unwrap_err(), Error::InvalidVf);
        sched.add_vf(vf(0)).unwrap();
        assert_eq!(sched.get_vf_status(vf(0)), VfSchedState::Active);
        sched.remove_vf(vf(0)).unwrap();
        assert_eq!(sched.get_vf_status(vf(0)), VfSchedState::Available);
        assert_eq!(
            sched.set_vf_state(vf(0), VfSchedState::FullAccess).unwrap_err(),
            Error::InvalidParameter
        );
        sched.set_vf_state(vf(0), VfSchedState::Suspended).unwrap();
        assert_eq!(sched.get_vf_status(vf(0)), VfSchedState::Suspended);
    }

    #[test]
    fn test_start_and_stop_all() {
        let sched = shared(SchedConfig::default());
        sched.add_vf(vf(0)).unwrap();
        sched.start_all().unwrap();
        let cmds = sched.iov().commands();
        assert_eq!(cmds.first().map(|c| c.block), Some(hw(0)));
        let gfx = sched.ws_of(vf(0), SchedBlock::Gfx).unwrap();
        let vcn = sched.ws_of(vf(0), SchedBlock::Vcn).unwrap();
        assert!(sched.world_switch(gfx).unwrap().switch_running);
        assert!(sched.world_switch(vcn).unwrap().switch_running);

        sched.switch_process(gfx).unwrap();
        sched.stop_all().unwrap();
        let ws = sched.world_switch(gfx).unwrap();
        assert!(!ws.switch_running);
        assert_eq!(ws.curr_vf_state, VfContextState::Saved);
        assert!(!sched.world_switch(vcn).unwrap().switch_running);
    }

    #[test]
    fn test_sync_abnormal_realigns_diverged_block() {
        let config = SchedConfig::default().with_flags(SchedFlags::DISABLE_SELF_SWITCH);
        let sched = sched_on(&SHARED, config, 4);
        sched.context_switch_to_vf(vf(0), Some(SchedBlock::Gfx)).unwrap();
        let gfx = sched.ws_of(vf(0), SchedBlock::Gfx).unwrap();
        sched.iov().set_active_vf(hw(2), vf(1));
        sched.iov().clear_log();

        sched.sync_abnormal_sched(vf(0), gfx).unwrap();
        assert!(sched.iov().commands_for(hw(1)).is_empty());
        assert_eq!(
            sched.iov().commands_for(hw(2)),
            [
                (GpuIovCmd::Idle, vf(1)),
                (GpuIovCmd::Save, vf(1)),
                (GpuIovCmd::Init, vf(0)),
                (GpuIovCmd::Run, vf(0)),
            ]
        );
        assert!(sched.block_state(hw(2)).unwrap().is_at(GpuState::Run, vf(0)));

        sched.iov().set_active_vf(hw(2), vf(3));
        sched.iov().set_active_status(hw(2), ActiveFcnStatus::Stalled);
        assert_eq!(sched.sync_abnormal_sched(vf(0), gfx).unwrap_err(), Error::Failure);
    }
}
