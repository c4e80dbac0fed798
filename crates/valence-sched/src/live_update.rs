//! # Live Update
//!
//! Scheduler state carried across a driver live update: where every block
//! stands and which contexts it keeps saved, what every world switch holds,
//! the lifecycle state of every VF, and full-access bookkeeping.
//! The snapshot is private to this crate's version and checked on import;
//! nothing is changed unless the whole snapshot is valid.

use arrayvec::ArrayVec;
use log::{error, info};

use valence_core::{
    DriverMode, Error, GpuState, MAX_NUM_HW_SCHED, MAX_NUM_WORLD_SWITCH, MAX_VF_NUM, MAX_VF_SLOT,
    PartitionMode, Result, VfContextState, VfId, VfMask, VfSchedState, WorldSwitchMask,
};
use valence_hal::GpuIov;

use crate::scheduler::Scheduler;
use crate::topology::Topology;
use crate::vf::FullAccessRecord;

/// Snapshot layout version
pub const LIVE_UPDATE_VERSION: u32 = 2;

/// One block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockSnapshot {
    /// Raw [`GpuState`]
    pub state: u8,
    /// Raw VF id
    pub vf: u32,
    /// Raw [`DriverMode`]
    pub mode: u8,
    /// Raw [`GpuState`] last reached per VF slot
    pub vf_cache: [u8; MAX_VF_SLOT],
}

/// One world switch
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorldSwitchSnapshot {
    /// Raw VF id held
    pub curr_idx_vf: u32,
    /// Raw [`VfContextState`]
    pub curr_vf_state: u8,
    /// Inited VF bits
    pub vf_inited: u32,
    /// Scheduling was running
    pub switch_running: bool,
    /// Raw VF ids in run order
    pub run_order: ArrayVec<u32, MAX_VF_SLOT>,
    /// Fairness dummy bits
    pub dummy: u32,
}

/// Everything carried across a live update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveUpdateSnapshot {
    /// Layout version
    pub version: u32,
    /// VF count the topology was built for
    pub num_vf: u32,
    /// Command completion budget
    pub cmd_budget_us: u64,
    /// Blocks in id order
    pub blocks: ArrayVec<BlockSnapshot, MAX_NUM_HW_SCHED>,
    /// World switches in id order
    pub world_switches: ArrayVec<WorldSwitchSnapshot, MAX_NUM_WORLD_SWITCH>,
    /// Raw [`VfSchedState`] per VF slot
    pub vf_states: [u8; MAX_VF_SLOT],
    /// Full-access record per VF slot
    pub full_access: [FullAccessRecord; MAX_VF_SLOT],
    /// World switches held in full access
    pub full_access_ws: u32,
}

fn corrupt(what: &str) -> Error {
    error!("live update snapshot: bad {what}");
    Error::LiveUpdateCorrupt
}

fn vf_of(raw: u32) -> Result<VfId> {
    VfId::new(raw).ok_or_else(|| corrupt("vf id"))
}

impl<H: GpuIov> Scheduler<H> {
    /// Capture the scheduler state
    pub fn export(&self) -> Result<LiveUpdateSnapshot> {
        let topo = self.topo();

        let mut blocks = ArrayVec::new();
        for id in self.blocks.all().iter() {
            let st = self.blocks.snapshot(id)?;
            blocks.push(BlockSnapshot {
                state: st.gpu_state as u8,
                vf: st.vf.raw(),
                mode: st.mode as u8,
                vf_cache: st.vf_cache.map(|state| state as u8),
            });
        }

        let world_switches = topo
            .world_switches
            .iter()
            .map(|cell| {
                let ws = cell.lock();
                let order = ws.run_list.order();
                WorldSwitchSnapshot {
                    curr_idx_vf: ws.curr_idx_vf.raw(),
                    curr_vf_state: ws.curr_vf_state as u8,
                    vf_inited: ws.vf_inited.bits(),
                    switch_running: ws.switch_running,
                    run_order: order.iter().map(|vf| vf.raw()).collect(),
                    dummy: order
                        .iter()
                        .filter(|vf| ws.run_list.entry(**vf).dummy)
                        .copied()
                        .collect::<VfMask>()
                        .bits(),
                }
            })
            .collect();

        let vfs = self.vfs.read();
        let vf_states = core::array::from_fn(|i| vfs.get(VfId::from_index(i)).state as u8);
        let full_access = core::array::from_fn(|i| vfs.get(VfId::from_index(i)).full_access);

        Ok(LiveUpdateSnapshot {
            version: LIVE_UPDATE_VERSION,
            num_vf: topo.num_vf,
            cmd_budget_us: self.config.allow_time_cmd_complete_us,
            blocks,
            world_switches,
            vf_states,
            full_access,
            full_access_ws: self.full_access.lock().bits(),
        })
    }

    /// Restore state captured by [`Scheduler::export`]
    ///
    /// The topology is rebuilt first when the VF count differs.
    pub fn import(&mut self, snap: &LiveUpdateSnapshot) -> Result<()> {
        if snap.version != LIVE_UPDATE_VERSION {
            error!("live update snapshot version {} unsupported", snap.version);
            return Err(Error::LiveUpdateVersion);
        }
        self.validate(snap)?;

        if snap.num_vf != self.topo.get_mut().num_vf {
            self.set_vf_num(snap.num_vf)?;
        }
        self.config.allow_time_cmd_complete_us = snap.cmd_budget_us;

        for (id, block) in self.blocks.all().iter().zip(&snap.blocks) {
            let mut st = self.blocks.try_claim(id)?;
            st.gpu_state = GpuState::from_raw(block.state).ok_or_else(|| corrupt("state"))?;
            st.mode = DriverMode::from_raw(block.mode).ok_or_else(|| corrupt("mode"))?;
            st.vf = vf_of(block.vf)?;
            for (cached, raw) in st.vf_cache.iter_mut().zip(&block.vf_cache) {
                *cached = GpuState::from_raw(*raw).ok_or_else(|| corrupt("cached state"))?;
            }
        }

        let topo = self.topo.get_mut();
        for (cell, saved) in topo.world_switches.iter_mut().zip(&snap.world_switches) {
            let ws = cell.get_mut();
            ws.curr_idx_vf = vf_of(saved.curr_idx_vf)?;
            ws.curr_vf_state = VfContextState::from_raw(saved.curr_vf_state)
                .ok_or_else(|| corrupt("context state"))?;
            ws.vf_inited = VfMask::from_bits(saved.vf_inited);
            ws.switch_running = saved.switch_running;

            let listed: ArrayVec<VfId, MAX_VF_SLOT> = ws.run_list.order().iter().copied().collect();
            for vf in listed {
                ws.run_list.unlink(vf);
            }
            let dummy = VfMask::from_bits(saved.dummy);
            for raw in &saved.run_order {
                let vf = vf_of(*raw)?;
                ws.run_list.push_back(vf);
                ws.run_list.entry_mut(vf).dummy = dummy.contains(vf);
            }
        }

        let vfs = self.vfs.get_mut();
        for (i, (rec, raw)) in snap.full_access.iter().zip(&snap.vf_states).enumerate() {
            let info = vfs.get_mut(VfId::from_index(i));
            info.state = VfSchedState::from_raw(*raw).ok_or_else(|| corrupt("vf state"))?;
            info.full_access = *rec;
        }
        *self.full_access.get_mut() = WorldSwitchMask::from_bits(snap.full_access_ws);

        info!(
            "live update: {} blocks, {} world switches restored",
            snap.blocks.len(),
            snap.world_switches.len()
        );
        Ok(())
    }

    /// Check every raw value and count before anything is touched
    fn validate(&self, snap: &LiveUpdateSnapshot) -> Result<()> {
        if snap.num_vf as usize > MAX_VF_NUM {
            return Err(corrupt("vf count"));
        }
        if snap.blocks.len() != self.blocks.len() {
            return Err(corrupt("block count"));
        }
        for block in &snap.blocks {
            GpuState::from_raw(block.state).ok_or_else(|| corrupt("state"))?;
            DriverMode::from_raw(block.mode).ok_or_else(|| corrupt("mode"))?;
            vf_of(block.vf)?;
            for raw in &block.vf_cache {
                GpuState::from_raw(*raw).ok_or_else(|| corrupt("cached state"))?;
            }
        }
        for raw in &snap.vf_states {
            VfSchedState::from_raw(*raw).ok_or_else(|| corrupt("vf state"))?;
        }

        let mode = PartitionMode::for_num_vf(snap.num_vf);
        let expected = Topology::build(self.asic, &self.config, mode, snap.num_vf)?;
        if expected.layouts.len() != snap.world_switches.len() {
            return Err(corrupt("world switch count"));
        }
        for saved in &snap.world_switches {
            vf_of(saved.curr_idx_vf)?;
            VfContextState::from_raw(saved.curr_vf_state)
                .ok_or_else(|| corrupt("context state"))?;
            for raw in &saved.run_order {
                vf_of(*raw)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{SHARED, hw, shared, vf};
    use valence_core::{SchedBlock, SchedConfig};
    use valence_hal::GpuIovCmd;
    use valence_hal::mock::MockGpuIov;

    fn running() -> Scheduler<MockGpuIov> {
        let sched = shared(SchedConfig::default().with_cmd_budget(300_000));
        sched.add_vf(vf(0)).unwrap();
        sched.add_vf(vf(1)).unwrap();
        sched.start_all().unwrap();
        let gfx = sched.ws_of(vf(0), SchedBlock::Gfx).unwrap();
        sched.switch_process(gfx).unwrap();
        sched.switch_process(gfx).unwrap();
        sched
    }

    fn fresh() -> Scheduler<MockGpuIov> {
        Scheduler::new(MockGpuIov::new(), &SHARED, SchedConfig::default()).unwrap()
    }

    #[test]
    fn test_export_import_round_trip() {
        let snap = running().export().unwrap();
        assert_eq!(snap.num_vf, 4);
        assert_eq!(snap.blocks.len(), 3);
        assert_eq!(snap.world_switches.len(), 2);

        let mut next = fresh();
        next.import(&snap).unwrap();
        assert_eq!(next.num_vf().unwrap(), 4);
        assert_eq!(next.config().allow_time_cmd_complete_us, 300_000);
        assert_eq!(next.export().unwrap(), snap);

        let gfx = next.ws_of(vf(1), SchedBlock::Gfx).unwrap();
        let ws = next.world_switch(gfx).unwrap();
        assert_eq!(ws.curr_idx_vf, vf(1));
        assert_eq!(ws.run_list.back(), Some(vf(0)));
        assert_eq!(next.get_vf_status(vf(0)), VfSchedState::Active);
        assert_eq!(next.block_state(hw(1)).unwrap().cached(vf(0)), GpuState::Save);

        // The saved context survives: vf0 is restored, not re-initialized
        next.run_vf(vf(0), Some(SchedBlock::Gfx)).unwrap();
        let cmds = next.iov().commands_for(hw(1));
        assert!(cmds.contains(&(GpuIovCmd::Load, vf(0))));
        assert!(!cmds.contains(&(GpuIovCmd::Init, vf(0))));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut snap = running().export().unwrap();
        snap.version += 1;
        let mut next = fresh();
        assert_eq!(next.import(&snap).unwrap_err(), Error::LiveUpdateVersion);
        assert_eq!(next.num_vf().unwrap(), 0);
    }

    #[test]
    fn test_corrupt_snapshot_changes_nothing() {
        let snap = running().export().unwrap();

        let mut bad_state = snap.clone();
        bad_state.blocks[1].state = 99;
        let mut next = fresh();
        assert_eq!(next.import(&bad_state).unwrap_err(), Error::LiveUpdateCorrupt);
        assert_eq!(next.num_vf().unwrap(), 0);

        let mut bad_order = snap.clone();
        bad_order.world_switches[1].run_order[0] = 40;
        assert_eq!(next.import(&bad_order).unwrap_err(), Error::LiveUpdateCorrupt);

        let mut bad_cache = snap.clone();
        bad_cache.blocks[0].vf_cache[3] = 42;
        assert_eq!(next.import(&bad_cache).unwrap_err(), Error::LiveUpdateCorrupt);

        let mut bad_vf_state = snap.clone();
        bad_vf_state.vf_states[1] = 9;
        assert_eq!(next.import(&bad_vf_state).unwrap_err(), Error::LiveUpdateCorrupt);

        let mut short = snap;
        short.world_switches.pop();
        assert_eq!(next.import(&short).unwrap_err(), Error::LiveUpdateCorrupt);
        assert_eq!(next.num_vf().unwrap(), 0);
    }
}
