//! # Hardware State Machines
//!
//! One walker drives a single block toward a `(vf, state)` target. Edge
//! resolution lives in [`edge`] and is shared with the lock-step driver;
//! [`apply`] performs the hardware side of each step.
//!
//! ```text
//!   goto_state ──▶ advance(env, cur, walk) ──▶ Edge ──▶ apply ──┐
//!        ▲                                                      │
//!        └──────────────────── until None ◀─────────────────────┘
//! ```

pub mod apply;
pub mod edge;

use log::{error, info};

use valence_core::{DriverMode, Error, GpuState, HwSchedId, Result, VfId};
use valence_hal::{GpuIov, GpuIovCmd};

use crate::diag::DiagSink;
use crate::hw_sched::HwSchedState;
use crate::world_switch::WorldSwitch;

pub use edge::{EdgeEnv, LOOP_GUARD, Step, Walk, advance};

/// Hardware access used while walking blocks
pub struct Machine<'a, H: GpuIov + ?Sized> {
    /// Register layer
    pub iov: &'a H,
    /// Transition observer
    pub diag: &'a dyn DiagSink,
    /// Budget of one command
    pub budget_us: u64,
}

impl<'a, H: GpuIov + ?Sized> Machine<'a, H> {
    /// Machine over `iov`
    pub fn new(iov: &'a H, diag: &'a dyn DiagSink, budget_us: u64) -> Self {
        Self { iov, diag, budget_us }
    }

    /// Walk one claimed block to `target` for `vf`
    ///
    /// `vf` may only be `None` on autonomous blocks, where it means the VF
    /// hardware reports as resident.
    pub fn goto_state(
        &self,
        env: &EdgeEnv,
        block: HwSchedId,
        st: &mut HwSchedState,
        ws: &mut WorldSwitch,
        vf: Option<VfId>,
        target: GpuState,
    ) -> Result<()> {
        let mut walk = self.open_walk(env, block, st, ws, vf, target)?;

        let mut edges = 0;
        loop {
            let edge = match advance(env, st, &walk) {
                Ok(Some(edge)) => edge,
                Ok(None) => return Ok(()),
                Err(e) => {
                    error!("{block}: no edge from {}({}) to {}: {e}", st.gpu_state, st.vf, target);
                    self.diag.dump_gpu_state(block);
                    return Err(e);
                },
            };

            if edges == LOOP_GUARD {
                error!(
                    "{block}: {} edges without reaching {}, stuck at {}({})",
                    LOOP_GUARD, walk.target, st.gpu_state, st.vf
                );
                self.diag.dump_gpu_state(block);
                return Err(Error::WsInfiniteLoop);
            }
            edges += 1;

            let from = (st.gpu_state, st.vf);
            if let Err(e) = self.apply(env, block, st, ws, &mut walk, &edge) {
                error!(
                    "{block}: failed moving from {}({}) toward {}: {e}",
                    from.0, from.1, walk.target
                );
                self.diag.dump_gpu_state(block);
                return Err(e);
            }
        }
    }

    /// Resolve the walk's VF and the self-switch detour
    fn open_walk(
        &self,
        env: &EdgeEnv,
        block: HwSchedId,
        st: &HwSchedState,
        ws: &mut WorldSwitch,
        vf: Option<VfId>,
        target: GpuState,
    ) -> Result<Walk> {
        let mut walk = Walk::new(target, vf);

        if walk.vf.is_none() && st.gpu_state != GpuState::EnableAuto {
            if env.mode == DriverMode::Manual {
                return Err(Error::InvalidVf);
            }
            let resident = self.iov.get_active_vf_idx(block)?;
            ws.curr_idx_vf = resident;
            walk.vf = Some(resident);
        }

        if let Some(vf) = walk.vf {
            if env.mode == DriverMode::Manual && target == GpuState::Run && st.is_at(GpuState::Run, vf)
            {
                info!("{block}: {vf} already running, idling first");
                walk.detour = true;
            }
        }
        Ok(walk)
    }
}

/// Whether `step` starts a VF, which ends a self-switch detour
pub(crate) fn ends_detour(step: &Step) -> bool {
    matches!(step, Step::Cmd { cmd: GpuIovCmd::Run, .. })
}
