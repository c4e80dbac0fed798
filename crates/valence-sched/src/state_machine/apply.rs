//! # Step Application
//!
//! Hardware side of one edge. State is written only after hardware
//! acknowledged the command; a failed step leaves the block where it was.

use log::{debug, error, info};

use valence_core::{Error, GpuState, HwSchedId, Result, VfContextState, VfId};
use valence_hal::{GpuIov, GpuIovCmd, exec_cmd, wait_cmd_complete};

use super::edge::{Edge, EdgeEnv, Step, Walk};
use super::{Machine, ends_detour};
use crate::diag::Transition;
use crate::hw_sched::HwSchedState;
use crate::world_switch::WorldSwitch;

impl<H: GpuIov + ?Sized> Machine<'_, H> {
    /// Carry out `edge` synchronously
    pub fn apply(
        &self,
        env: &EdgeEnv,
        block: HwSchedId,
        st: &mut HwSchedState,
        ws: &mut WorldSwitch,
        walk: &mut Walk,
        edge: &Edge,
    ) -> Result<()> {
        match edge.step {
            Step::Cmd { cmd, vf, .. } => {
                self.issue(block, st, cmd, vf);
                wait_cmd_complete(self.iov, block, self.budget_us)
                    .map_err(|_| edge.step.timeout_error())?;
                self.complete(block, st, ws, walk, edge);
                return Ok(());
            },
            Step::EnableAuto { vf } => self.enable_auto(env, block, st, vf)?,
            Step::LeaveAuto => {
                if self.leave_auto(env, block, st, ws, walk)? {
                    return Ok(());
                }
            },
            Step::Settle => self.settle(env, block, st, ws)?,
        }
        self.finish(block, ws, walk, edge);
        Ok(())
    }

    /// Write a command without waiting
    pub fn issue(&self, block: HwSchedId, st: &mut HwSchedState, cmd: GpuIovCmd, vf: VfId) {
        debug!("{block}: {cmd} {vf}");
        st.last_cmd = Some(cmd);
        self.iov.set_cmd(cmd, block, vf, None);
    }

    /// Record an acknowledged command step
    pub fn complete(
        &self,
        block: HwSchedId,
        st: &mut HwSchedState,
        ws: &mut WorldSwitch,
        walk: &mut Walk,
        edge: &Edge,
    ) {
        if let Step::Cmd { vf, next, .. } = edge.step {
            let from = st.gpu_state;
            st.land(next, vf);
            self.diag.transition(Transition {
                block,
                from,
                to: next,
                vf,
            });
        }
        self.finish(block, ws, walk, edge);
    }

    fn finish(&self, block: HwSchedId, ws: &mut WorldSwitch, walk: &mut Walk, edge: &Edge) {
        if edge.stops_switch {
            ws.switch_running = false;
        }
        if let Some(target) = edge.retarget {
            info!("{block}: single vf holds the engine, heading to {target} instead");
            walk.target = target;
        }
        if walk.detour && ends_detour(&edge.step) {
            walk.detour = false;
        }
    }

    fn enable_auto(
        &self,
        env: &EdgeEnv,
        block: HwSchedId,
        st: &mut HwSchedState,
        vf: VfId,
    ) -> Result<()> {
        let active = self.iov.get_active_vfs(block)?;
        if !active.is_empty() {
            st.last_cmd = Some(GpuIovCmd::EnableAuto);
            exec_cmd(self.iov, GpuIovCmd::EnableAuto, block, vf, self.budget_us)
                .map_err(|_| Error::Failure)?;
        }
        let from = st.gpu_state;
        st.gpu_state = GpuState::EnableAuto;
        st.vf = vf;
        for auto in env.auto_run.iter() {
            st.vf_cache[auto.index()] = GpuState::Run;
        }
        self.diag.transition(Transition {
            block,
            from,
            to: GpuState::EnableAuto,
            vf,
        });
        Ok(())
    }

    /// Returns `true` when the lone VF keeps the engine and the walk was
    /// redirected instead of leaving firmware scheduling
    fn leave_auto(
        &self,
        env: &EdgeEnv,
        block: HwSchedId,
        st: &mut HwSchedState,
        ws: &mut WorldSwitch,
        walk: &mut Walk,
    ) -> Result<bool> {
        let active = self.iov.get_active_vfs(block)?;
        let resident = if active.is_empty() {
            VfId::PF
        } else {
            if env.hold_single_vf && walk.target == GpuState::DisableAuto {
                info!("{block}: single vf holds the engine, saving instead");
                st.gpu_state = GpuState::Run;
                walk.target = GpuState::Save;
                return Ok(true);
            }
            st.last_cmd = Some(GpuIovCmd::DisableAuto);
            let stopped = exec_cmd(self.iov, GpuIovCmd::DisableAuto, block, st.vf, self.budget_us)
                .and_then(|()| self.iov.wait_auto_sched_stop(block));
            if let Err(e) = stopped {
                error!("{block}: firmware scheduler did not stop: {e}");
                let hw_vf = self.iov.get_active_vf_idx(block)?;
                st.vf = hw_vf;
                ws.curr_idx_vf = hw_vf;
                return Err(Error::Failure);
            }
            self.iov.get_active_vf_idx(block)?
        };

        let from = st.gpu_state;
        st.vf = resident;
        if walk.vf.is_none() {
            walk.vf = Some(resident);
        }
        ws.curr_idx_vf = resident;
        st.gpu_state = GpuState::DisableAuto;
        self.diag.transition(Transition {
            block,
            from,
            to: GpuState::DisableAuto,
            vf: resident,
        });
        Ok(false)
    }

    fn settle(
        &self,
        env: &EdgeEnv,
        block: HwSchedId,
        st: &mut HwSchedState,
        ws: &WorldSwitch,
    ) -> Result<()> {
        let observed = if env.is_gfx {
            VfContextState::Saved
        } else {
            hw_context_state(self.iov, block, ws)?
        };
        let needs_idle = observed != VfContextState::Saved;
        let from = st.gpu_state;

        if needs_idle {
            if observed != VfContextState::Clear {
                st.last_cmd = Some(GpuIovCmd::Idle);
                exec_cmd(self.iov, GpuIovCmd::Idle, block, st.vf, self.budget_us)
                    .map_err(|_| Error::WsIdleTimeout)?;
            }
            st.gpu_state = GpuState::Idle;
        } else {
            st.gpu_state = GpuState::Save;
        }

        let mut stamped = env.auto_run;
        if env.pf_active {
            stamped.insert(VfId::PF);
        }
        for vf in stamped.iter() {
            st.vf_cache[vf.index()] = if vf == st.vf && needs_idle {
                GpuState::Idle
            } else {
                GpuState::Save
            };
        }
        self.diag.transition(Transition {
            block,
            from,
            to: st.gpu_state,
            vf: st.vf,
        });
        Ok(())
    }
}

/// Context state of the VF a world switch holds, as hardware sees it
///
/// While the firmware scheduler runs, the driver's copy is stale and the
/// active-function register is read instead.
pub fn hw_context_state<H: GpuIov + ?Sized>(
    iov: &H,
    block: HwSchedId,
    ws: &WorldSwitch,
) -> Result<VfContextState> {
    if ws.is_auto() && ws.switch_running {
        return Ok(iov.get_active_vf_status(block)?.context_state());
    }
    Ok(ws.curr_vf_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::NullDiag;
    use crate::state_machine::advance;
    use valence_core::{DriverMode, SchedBlock, SchedMode, VfMask, WorldSwitchId};
    use valence_hal::ActiveFcnStatus;
    use valence_hal::mock::MockGpuIov;

    fn vf(i: usize) -> VfId {
        VfId::from_index(i)
    }

    fn hw(i: usize) -> HwSchedId {
        HwSchedId::from_index(i)
    }

    fn auto_env() -> EdgeEnv {
        EdgeEnv {
            mode: DriverMode::Auto,
            is_gfx: false,
            hold_single_vf: false,
            pf_loadable: false,
            active: VfMask::first_n(2),
            suspended: VfMask::EMPTY,
            auto_run: VfMask::first_n(2),
            pf_active: false,
        }
    }

    fn vcn_ws() -> WorldSwitch {
        WorldSwitch::new(WorldSwitchId::from_index(1), SchedBlock::Vcn, SchedMode::FrameLoop)
    }

    fn auto_state(state: GpuState, v: VfId) -> HwSchedState {
        let mut st = HwSchedState::new(DriverMode::Auto);
        st.gpu_state = state;
        st.vf = v;
        st
    }

    #[test]
    fn test_enable_auto_without_active_vfs_is_silent() {
        let iov = MockGpuIov::new();
        let machine = Machine::new(&iov, &NullDiag, 1_000);
        let env = auto_env();
        let mut st = auto_state(GpuState::Save, vf(0));
        let mut ws = vcn_ws();
        machine
            .goto_state(&env, hw(0), &mut st, &mut ws, Some(vf(0)), GpuState::EnableAuto)
            .unwrap();
        assert!(iov.commands().is_empty());
        assert_eq!(st.gpu_state, GpuState::EnableAuto);
        assert_eq!(st.cached(vf(1)), GpuState::Run);
    }

    #[test]
    fn test_enable_auto_issues_command() {
        let iov = MockGpuIov::new();
        iov.set_active_vfs(hw(0), VfMask::first_n(2)).unwrap();
        let machine = Machine::new(&iov, &NullDiag, 1_000);
        let mut st = auto_state(GpuState::Save, vf(0));
        let mut ws = vcn_ws();
        machine
            .goto_state(&auto_env(), hw(0), &mut st, &mut ws, Some(vf(0)), GpuState::EnableAuto)
            .unwrap();
        assert_eq!(iov.commands_for(hw(0)), [(GpuIovCmd::EnableAuto, vf(0))]);
    }

    #[test]
    fn test_leave_auto_reads_resident_vf() {
        let iov = MockGpuIov::new();
        iov.set_active_vfs(hw(0), VfMask::first_n(2)).unwrap();
        iov.set_active_vf(hw(0), vf(1));
        let machine = Machine::new(&iov, &NullDiag, 1_000);
        let env = auto_env();
        let mut st = auto_state(GpuState::EnableAuto, vf(0));
        let mut ws = vcn_ws();
        ws.switch_running = true;
        ws.curr_vf_state = VfContextState::Saved;

        // Resident VF unknown while the firmware runs
        machine
            .goto_state(&env, hw(0), &mut st, &mut ws, None, GpuState::Save)
            .unwrap();
        assert!(st.is_at(GpuState::Save, vf(1)));
        assert_eq!(ws.curr_idx_vf, vf(1));
        assert!(!ws.switch_running);
        assert_eq!(iov.commands_for(hw(0)), [(GpuIovCmd::DisableAuto, vf(0))]);
        assert_eq!(st.cached(vf(0)), GpuState::Save);
    }

    #[test]
    fn test_leave_auto_failure_refreshes_vf() {
        let iov = MockGpuIov::new();
        iov.set_active_vfs(hw(3), VfMask::first_n(2)).unwrap();
        iov.set_active_vf(hw(3), vf(1));
        iov.fail_auto_stop(hw(3));
        let machine = Machine::new(&iov, &NullDiag, 1_000);
        let mut st = auto_state(GpuState::EnableAuto, vf(0));
        let mut ws = vcn_ws();
        let err = machine
            .goto_state(&auto_env(), hw(3), &mut st, &mut ws, Some(vf(0)), GpuState::Save)
            .unwrap_err();
        assert_eq!(err, Error::Failure);
        assert_eq!(st.gpu_state, GpuState::EnableAuto);
        assert_eq!(st.vf, vf(1));
        assert_eq!(ws.curr_idx_vf, vf(1));
    }

    #[test]
    fn test_settle_idles_loaded_context() {
        let iov = MockGpuIov::new();
        let machine = Machine::new(&iov, &NullDiag, 1_000);
        let env = auto_env();
        let mut st = auto_state(GpuState::DisableAuto, vf(1));
        let mut ws = vcn_ws();
        ws.curr_vf_state = VfContextState::Loaded;
        let mut walk = Walk::new(GpuState::Idle, Some(vf(1)));
        let edge = advance(&env, &st, &walk).unwrap().unwrap();
        machine.apply(&env, hw(6), &mut st, &mut ws, &mut walk, &edge).unwrap();
        assert_eq!(st.gpu_state, GpuState::Idle);
        assert_eq!(iov.commands_for(hw(6)), [(GpuIovCmd::Idle, vf(1))]);
        assert_eq!(st.cached(vf(1)), GpuState::Idle);
        assert_eq!(st.cached(vf(0)), GpuState::Save);
    }

    #[test]
    fn test_settle_clear_context_skips_idle() {
        let iov = MockGpuIov::new();
        let machine = Machine::new(&iov, &NullDiag, 1_000);
        let env = auto_env();
        let mut st = auto_state(GpuState::DisableAuto, vf(1));
        let mut ws = vcn_ws();
        let mut walk = Walk::new(GpuState::Idle, Some(vf(1)));
        let edge = advance(&env, &st, &walk).unwrap().unwrap();
        machine.apply(&env, hw(6), &mut st, &mut ws, &mut walk, &edge).unwrap();
        assert_eq!(st.gpu_state, GpuState::Idle);
        assert!(iov.commands().is_empty());
    }

    #[test]
    fn test_hw_context_state_reads_register_while_running() {
        let iov = MockGpuIov::new();
        iov.set_active_status(hw(0), ActiveFcnStatus::Save);
        let mut ws = vcn_ws();
        ws.curr_vf_state = VfContextState::Loaded;
        assert_eq!(hw_context_state(&iov, hw(0), &ws), Ok(VfContextState::Loaded));
        ws.switch_running = true;
        assert_eq!(hw_context_state(&iov, hw(0), &ws), Ok(VfContextState::Saved));
    }
}
