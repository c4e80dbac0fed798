//! # Lock-Step Driver
//!
//! Advances several blocks toward one `(vf, state)` target at once. Each
//! round issues one command to every block still on its way, then collects
//! completions against a budget shared by the round.
//!
//! ```text
//!   round:  resolve ──▶ issue all ──▶ wait first ──▶ land ──┐
//!             ▲                           ▲                 │
//!             │                           └── more pending ─┤
//!             └──────────────── live blocks remain ◀────────┘
//! ```
//!
//! A block that times out or cannot resolve an edge is marked bad and left
//! behind; the others keep going.

use arrayvec::ArrayVec;
use log::{error, warn};

use valence_core::{
    DriverMode, Error, GpuState, HwSchedId, HwSchedMask, MAX_NUM_HW_SCHED, Result, VfId,
};
use valence_hal::{GpuIov, wait_for_first_cmd_complete};

use crate::hw_sched::BlockGuard;
use crate::state_machine::edge::Edge;
use crate::state_machine::{EdgeEnv, LOOP_GUARD, Machine, Step, Walk, advance};
use crate::world_switch::WorldSwitch;

/// Progress of one block in a lock-step call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkState {
    /// Still moving
    Pending,
    /// At target
    Done,
    /// Failed; left behind
    Bad,
}

struct Lane {
    block: HwSchedId,
    walk: Walk,
    state: BulkState,
    in_flight: Option<Edge>,
}

impl<H: GpuIov + ?Sized> Machine<'_, H> {
    /// Walk every claimed block to `target` for `vf` in lock-step
    ///
    /// Returns [`Error::WsBulkFailure`] if any block ended bad; every other
    /// block still reached the target.
    pub fn bulk_goto_state(
        &self,
        env: &EdgeEnv,
        blocks: &mut [(HwSchedId, BlockGuard<'_>)],
        ws: &mut WorldSwitch,
        vf: VfId,
        target: GpuState,
    ) -> Result<()> {
        let mut lanes: ArrayVec<Lane, MAX_NUM_HW_SCHED> = blocks
            .iter()
            .map(|(block, st)| {
                let mut walk = Walk::new(target, Some(vf));
                walk.detour = env.mode == DriverMode::Manual
                    && target == GpuState::Run
                    && st.is_at(GpuState::Run, vf);
                Lane {
                    block: *block,
                    walk,
                    state: BulkState::Pending,
                    in_flight: None,
                }
            })
            .collect();

        let mut edges_left = LOOP_GUARD as usize * blocks.len();

        loop {
            let mut waiting = HwSchedMask::EMPTY;

            for (lane, (_, st)) in lanes.iter_mut().zip(blocks.iter_mut()) {
                if lane.state != BulkState::Pending {
                    continue;
                }
                let edge = match advance(env, st, &lane.walk) {
                    Ok(None) => {
                        lane.state = BulkState::Done;
                        continue;
                    },
                    Ok(Some(edge)) => edge,
                    Err(e) => {
                        error!("{}: no edge toward {target}({vf}): {e}", lane.block);
                        self.diag.dump_gpu_state(lane.block);
                        lane.state = BulkState::Bad;
                        continue;
                    },
                };

                if edges_left == 0 {
                    error!("{}: lock-step walk to {target}({vf}) did not end", lane.block);
                    self.abandon(&mut lanes);
                    return Err(Error::WsInfiniteLoop);
                }
                edges_left -= 1;

                match edge.step {
                    Step::Cmd { cmd, vf: cmd_vf, .. } => {
                        self.issue(lane.block, st, cmd, cmd_vf);
                        lane.in_flight = Some(edge);
                        waiting.insert(lane.block);
                    },
                    _ => {
                        let applied = self.apply(env, lane.block, st, ws, &mut lane.walk, &edge);
                        if let Err(e) = applied {
                            error!("{}: {:?} failed: {e}", lane.block, edge.step);
                            self.diag.dump_gpu_state(lane.block);
                            lane.state = BulkState::Bad;
                        }
                    },
                }
            }

            if waiting.is_empty() {
                if lanes.iter().all(|l| l.state != BulkState::Pending) {
                    break;
                }
                continue;
            }

            self.collect(blocks, &mut lanes, ws, waiting);
        }

        let bad: HwSchedMask = lanes
            .iter()
            .filter(|l| l.state == BulkState::Bad)
            .map(|l| l.block)
            .collect();
        if bad.is_empty() {
            Ok(())
        } else {
            error!("lock-step walk to {target}({vf}) failed on {bad:?}");
            Err(Error::WsBulkFailure)
        }
    }

    /// Mark every lane still moving bad and dump its block
    fn abandon(&self, lanes: &mut [Lane]) {
        for lane in lanes.iter_mut().filter(|l| l.state == BulkState::Pending) {
            lane.in_flight = None;
            lane.state = BulkState::Bad;
            self.diag.dump_gpu_state(lane.block);
        }
    }

    /// Land completions until every issued command is in, or the round's
    /// budget is gone
    fn collect(
        &self,
        blocks: &mut [(HwSchedId, BlockGuard<'_>)],
        lanes: &mut ArrayVec<Lane, MAX_NUM_HW_SCHED>,
        ws: &mut WorldSwitch,
        mut waiting: HwSchedMask,
    ) {
        let start = self.iov.now_us();
        while !waiting.is_empty() {
            let left = self
                .budget_us
                .saturating_sub(self.iov.now_us().saturating_sub(start));
            match wait_for_first_cmd_complete(self.iov, waiting, left) {
                Ok(done) => {
                    waiting.remove(done);
                    let Some(pos) = lanes.iter().position(|l| l.block == done) else {
                        continue;
                    };
                    let lane = &mut lanes[pos];
                    let st = &mut blocks[pos].1;
                    if let Some(edge) = lane.in_flight.take() {
                        self.complete(done, st, ws, &mut lane.walk, &edge);
                    }
                },
                Err(_) => {
                    for block in waiting.iter() {
                        if let Some(lane) = lanes.iter_mut().find(|l| l.block == block) {
                            let err = lane
                                .in_flight
                                .take()
                                .map_or(Error::IovCmdTimeout, |e| e.step.timeout_error());
                            warn!("{block}: left behind: {err}");
                            lane.state = BulkState::Bad;
                        }
                        self.diag.dump_gpu_state(block);
                    }
                    return;
                },
            }
        }
    }
}
