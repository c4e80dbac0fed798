//! # Edge Table
//!
//! Pure next-step resolution for one block. Both the single-block walker and
//! the lock-step driver ask this table for the next step; neither carries
//! its own copy of the graph.
//!
//! ```text
//!        IDLE ──▶ SAVE ─────┬──▶ INIT ──┐
//!          ▲                │           ├──▶ RUN ──▶ IDLE
//!          │       SHUTDOWN ┴──▶ LOAD ──┘
//!          │                                         (manual)
//!   SAVE/SHUTDOWN/RUN ──▶ ENABLE_AUTO ──▶ DISABLE_AUTO ──▶ IDLE | SAVE
//!                                                     (auto adds)
//! ```

use valence_core::{DriverMode, Error, GpuState, Result, VfId, VfMask};
use valence_hal::GpuIovCmd;

use crate::hw_sched::HwSchedState;

/// Edges one walk may take on one block
pub const LOOP_GUARD: u32 = 20;

// =============================================================================
// INPUTS
// =============================================================================

/// Facts about the block and the VF table the edges depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEnv {
    /// Driver mode of the block
    pub mode: DriverMode,
    /// Graphics block
    pub is_gfx: bool,
    /// One VF per graphics scheduler with self-switch disabled: the VF keeps
    /// the engine instead of entering firmware scheduling
    pub hold_single_vf: bool,
    /// PF context may be restored instead of re-initialized
    pub pf_loadable: bool,
    /// VFs in the Active lifecycle state
    pub active: VfMask,
    /// VFs in the Suspended lifecycle state
    pub suspended: VfMask,
    /// VFs flagged for firmware scheduling
    pub auto_run: VfMask,
    /// The PF competes for time and is stamped with the auto-run VFs
    pub pf_active: bool,
}

/// Destination of a walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Walk {
    /// Requested state
    pub target: GpuState,
    /// Requested VF; `None` only while the block is in EnableAuto and the
    /// resident VF is unknown
    pub vf: Option<VfId>,
    /// Forcing a fresh Idle then Run boundary on a block already running the
    /// target VF
    pub detour: bool,
}

impl Walk {
    /// Walk to `target` for `vf`
    pub const fn new(target: GpuState, vf: Option<VfId>) -> Self {
        Self {
            target,
            vf,
            detour: false,
        }
    }

    /// Whether `cur` is the destination
    ///
    /// A fresh Init satisfies a Load target: either way the context is
    /// resident and not running.
    pub fn is_done(&self, cur: &HwSchedState) -> bool {
        let reached = cur.gpu_state == self.target
            || (self.target == GpuState::Load && cur.gpu_state == GpuState::Init);
        !self.detour && reached && self.vf.is_none_or(|vf| vf == cur.vf)
    }
}

// =============================================================================
// OUTPUTS
// =============================================================================

/// One step of a walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// One GPUIOV command; on acknowledgement the block lands at `next`
    Cmd {
        /// Command to issue
        cmd: GpuIovCmd,
        /// VF the command addresses
        vf: VfId,
        /// State reached on completion
        next: GpuState,
    },
    /// Hand the block to the firmware scheduler
    EnableAuto {
        /// VF recorded as resident
        vf: VfId,
    },
    /// Take the block back from the firmware scheduler
    LeaveAuto,
    /// Settle to Idle or Save once the firmware scheduler stopped
    Settle,
}

impl Step {
    /// Synchronous command step
    #[inline]
    pub const fn cmd(cmd: GpuIovCmd, vf: VfId, next: GpuState) -> Self {
        Self::Cmd { cmd, vf, next }
    }

    /// Error reported when this step times out
    pub const fn timeout_error(&self) -> Error {
        match self {
            Self::Cmd { next, .. } => match next {
                GpuState::Idle => Error::WsIdleTimeout,
                GpuState::Run => Error::WsRunTimeout,
                GpuState::Save => Error::WsSaveTimeout,
                GpuState::Init | GpuState::Load => Error::WsLoadTimeout,
                GpuState::Shutdown => Error::WsShutdownTimeout,
                GpuState::EnableAuto | GpuState::DisableAuto => Error::IovCmdTimeout,
            },
            Self::Settle => Error::WsIdleTimeout,
            Self::EnableAuto { .. } | Self::LeaveAuto => Error::Failure,
        }
    }
}

/// Resolved step plus any change of destination it implies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// What to do
    pub step: Step,
    /// New destination state for the rest of the walk
    pub retarget: Option<GpuState>,
    /// Firmware scheduling of the world switch stops with this step
    pub stops_switch: bool,
}

impl Edge {
    const fn of(step: Step) -> Self {
        Self {
            step,
            retarget: None,
            stops_switch: false,
        }
    }

    const fn retarget(mut self, state: GpuState) -> Self {
        self.retarget = Some(state);
        self
    }

    const fn stopping(mut self) -> Self {
        self.stops_switch = true;
        self
    }
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// Next step from `cur` toward `walk`, `None` once there
pub fn advance(env: &EdgeEnv, cur: &HwSchedState, walk: &Walk) -> Result<Option<Edge>> {
    if walk.is_done(cur) {
        return Ok(None);
    }
    let edge = match env.mode {
        DriverMode::Manual => manual_edge(env, cur, walk)?,
        DriverMode::Auto => auto_edge(env, cur, walk)?,
    };
    Ok(Some(edge))
}

fn target_vf(walk: &Walk) -> Result<VfId> {
    walk.vf.ok_or(Error::InvalidVf)
}

/// Restore when the block holds a saved context the VF may resume,
/// otherwise initialize from scratch
fn load_or_init(env: &EdgeEnv, cur: &HwSchedState, vf: VfId) -> Step {
    let resumable = if vf.is_pf() {
        env.pf_loadable
    } else {
        env.active.contains(vf)
    };
    if cur.cached(vf) == GpuState::Save && resumable {
        Step::cmd(GpuIovCmd::Load, vf, GpuState::Load)
    } else {
        Step::cmd(GpuIovCmd::Init, vf, GpuState::Init)
    }
}

fn manual_edge(env: &EdgeEnv, cur: &HwSchedState, walk: &Walk) -> Result<Edge> {
    let at = cur.vf;
    let step = match cur.gpu_state {
        GpuState::Idle if walk.detour => Step::cmd(GpuIovCmd::Run, at, GpuState::Run),
        GpuState::Idle => Step::cmd(GpuIovCmd::Save, at, GpuState::Save),
        GpuState::Save | GpuState::Shutdown => {
            let vf = target_vf(walk)?;
            let saved = cur.gpu_state == GpuState::Save;
            if walk.target == GpuState::Shutdown && saved && at == vf {
                Step::cmd(GpuIovCmd::Shutdown, at, GpuState::Shutdown)
            } else if walk.target == GpuState::Shutdown
                && at != vf
                && ((saved && env.suspended.contains(vf)) || cur.cached(vf) == GpuState::Save)
            {
                Step::cmd(GpuIovCmd::Shutdown, vf, GpuState::Shutdown)
            } else {
                load_or_init(env, cur, vf)
            }
        },
        GpuState::Load | GpuState::Init => Step::cmd(GpuIovCmd::Run, at, GpuState::Run),
        GpuState::Run => Step::cmd(GpuIovCmd::Idle, at, GpuState::Idle),
        GpuState::EnableAuto | GpuState::DisableAuto => {
            log::error!("manual block in {}", cur.gpu_state);
            return Err(Error::IovCmdError);
        },
    };
    Ok(Edge::of(step))
}

fn auto_edge(env: &EdgeEnv, cur: &HwSchedState, walk: &Walk) -> Result<Edge> {
    let at = cur.vf;
    let edge = match cur.gpu_state {
        GpuState::Idle => Edge::of(Step::cmd(GpuIovCmd::Save, at, GpuState::Save)),
        GpuState::Save | GpuState::Shutdown => {
            let vf = target_vf(walk)?;
            if cur.gpu_state == GpuState::Save && walk.target == GpuState::Shutdown && at == vf {
                Edge::of(Step::cmd(GpuIovCmd::Shutdown, at, GpuState::Shutdown))
            } else if walk.target == GpuState::EnableAuto && env.hold_single_vf {
                Edge::of(Step::cmd(GpuIovCmd::Load, vf, GpuState::Load)).retarget(GpuState::Run)
            } else if walk.target == GpuState::EnableAuto {
                Edge::of(Step::EnableAuto { vf })
            } else {
                Edge::of(load_or_init(env, cur, vf))
            }
        },
        GpuState::Load | GpuState::Init => {
            Edge::of(Step::cmd(GpuIovCmd::Run, at, GpuState::Run))
        },
        GpuState::Run if walk.target == GpuState::EnableAuto && !env.is_gfx => {
            Edge::of(Step::EnableAuto { vf: target_vf(walk)? }).stopping()
        },
        GpuState::Run => {
            let idle = Edge::of(Step::cmd(GpuIovCmd::Idle, at, GpuState::Idle)).stopping();
            if walk.target == GpuState::EnableAuto && env.hold_single_vf {
                idle.retarget(GpuState::Run)
            } else {
                idle
            }
        },
        GpuState::EnableAuto => Edge::of(Step::LeaveAuto).stopping(),
        GpuState::DisableAuto => Edge::of(Step::Settle),
    };
    Ok(edge)
}
