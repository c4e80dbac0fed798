//! # Scheduler
//!
//! One adapter's world-switch scheduler: the block arena, the VF table and
//! the world switches built over them, plus the collaborators told about
//! failures.
//!
//! ```text
//!             ┌─────────────────── Scheduler ───────────────────┐
//!   caller ──▶│ Topology (rw) ──▶ WorldSwitch ──▶ Machine     │──▶ GpuIov
//!             │        │            (lock)      │               │
//!             │        ▼                        ▼               │
//!             │   VfTable (rw)         HwSchedTable (try_claim) │
//!             └─────────────────────────────────────────────────┘
//! ```
//!
//! Operations read the topology and lock one world switch at a time. Only
//! a VF-count change writes the topology. Block claims are only ever
//! tried; finding a block claimed means a reentrant call on that block,
//! while transitions on other blocks proceed.

use alloc::boxed::Box;
use core::fmt;

use log::{error, info, warn};
use spin::{Mutex, RwLock, RwLockReadGuard};

use valence_core::time::default_gfx_time_slice;
use valence_core::{
    DriverMode, Error, GpuState, HwSchedId, HwSchedMask, MAX_VF_NUM, PartitionMode, Result,
    SchedBlock, SchedConfig, SchedFlags, SchedMode, VfId, VfSchedState, WorldSwitchId,
    WorldSwitchMask,
};
use valence_hal::{AsicProfile, GpuIov};

use crate::diag::{DiagSink, NullDiag};
use crate::full_access::{EventQueue, FullAccessGuard, NullEvents, NullGuard};
use crate::hw_sched::{HwSchedState, HwSchedTable};
use crate::state_machine::{EdgeEnv, Machine};
use crate::topology::Topology;
use crate::vf::VfTable;
use crate::world_switch::WorldSwitch;

/// Packed time-quanta option of graphics blocks: 6 ms in every slot
pub const DEFAULT_GFX_TIME_QUANTA_OPTION: u32 = 0x0606_0606;
/// Packed time-quanta option of multimedia blocks: 255 ms in every slot
pub const DEFAULT_MM_TIME_QUANTA_OPTION: u32 = 0xFFFF_FFFF;

/// World-switch scheduler of one adapter
pub struct Scheduler<H: GpuIov> {
    pub(crate) iov: H,
    pub(crate) asic: &'static AsicProfile,
    pub(crate) config: SchedConfig,
    pub(crate) blocks: HwSchedTable,
    pub(crate) vfs: RwLock<VfTable>,
    pub(crate) topo: RwLock<Topology>,
    /// Adapter-wide time-quanta option per sched block
    pub(crate) quanta: Mutex<[u32; SchedBlock::COUNT]>,
    /// World switches held by a VF in full access
    pub(crate) full_access: Mutex<WorldSwitchMask>,
    pub(crate) diag: Box<dyn DiagSink>,
    pub(crate) events: Box<dyn EventQueue>,
    pub(crate) guard: Box<dyn FullAccessGuard>,
}

impl<H: GpuIov> fmt::Debug for Scheduler<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("asic", &self.asic.name)
            .field("config", &self.config)
            .field("blocks", &self.blocks.len())
            .finish_non_exhaustive()
    }
}

impl<H: GpuIov> Scheduler<H> {
    /// Scheduler with every block shut down and no VF routed
    ///
    /// Call [`Scheduler::set_vf_num`] to build world switches.
    pub fn new(iov: H, asic: &'static AsicProfile, config: SchedConfig) -> Result<Self> {
        let blocks = HwSchedTable::from_profile(asic)?;
        let topo = Topology::build(asic, &config, config.partition_mode, 0)?;
        let quanta = core::array::from_fn(|i| {
            if SchedBlock::ALL[i].is_gfx() {
                DEFAULT_GFX_TIME_QUANTA_OPTION
            } else {
                DEFAULT_MM_TIME_QUANTA_OPTION
            }
        });
        info!("{}: scheduler with {} blocks", asic.name, blocks.len());

        Ok(Self {
            iov,
            asic,
            config,
            blocks,
            vfs: RwLock::new(VfTable::new()),
            topo: RwLock::new(topo),
            quanta: Mutex::new(quanta),
            full_access: Mutex::new(WorldSwitchMask::EMPTY),
            diag: Box::new(NullDiag),
            events: Box::new(NullEvents),
            guard: Box::new(NullGuard),
        })
    }

    /// Replace the diagnostics sink
    pub fn with_diag(mut self, diag: impl DiagSink + 'static) -> Self {
        self.diag = Box::new(diag);
        self
    }

    /// Replace the event queue told about suspends and resets
    pub fn with_events(mut self, events: impl EventQueue + 'static) -> Self {
        self.events = Box::new(events);
        self
    }

    /// Replace the full-access guard
    pub fn with_guard(mut self, guard: impl FullAccessGuard + 'static) -> Self {
        self.guard = Box::new(guard);
        self
    }

    /// Register layer
    #[inline]
    pub fn iov(&self) -> &H {
        &self.iov
    }

    /// Active configuration
    #[inline]
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// ASIC description
    #[inline]
    pub fn asic(&self) -> &'static AsicProfile {
        self.asic
    }

    /// Block arena
    #[inline]
    pub fn blocks(&self) -> &HwSchedTable {
        &self.blocks
    }

    /// Copy of a block's state
    pub fn block_state(&self, block: HwSchedId) -> Result<HwSchedState> {
        self.blocks.snapshot(block)
    }

    /// Copy of a world switch
    pub fn world_switch(&self, id: WorldSwitchId) -> Result<WorldSwitch> {
        Ok(self.topo().ws(id)?.clone())
    }

    /// Every world switch id
    pub fn world_switch_ids(&self) -> Result<WorldSwitchMask> {
        Ok(self.topo().ids().collect())
    }

    /// World switch serving `vf` for `sched_block`
    pub fn ws_of(&self, vf: VfId, sched_block: SchedBlock) -> Option<WorldSwitchId> {
        self.vfs.read().get(vf).ws_map[sched_block.index()]
    }

    /// VF count the topology was built for
    pub fn num_vf(&self) -> Result<u32> {
        Ok(self.topo().num_vf)
    }

    // =========================================================================
    // TOPOLOGY
    // =========================================================================

    /// Rebuild partitions and world switches for `num_vf` VFs
    ///
    /// Refused with [`Error::VfBusy`] while any VF is allocated and with
    /// [`Error::WsReentrant`] while another operation holds the topology.
    pub fn set_vf_num(&self, num_vf: u32) -> Result<()> {
        if num_vf as usize > MAX_VF_NUM {
            return Err(Error::InvalidParameter);
        }
        let mut topo = self.topo.try_write().ok_or_else(|| {
            error!("vf count change while the scheduler is busy");
            Error::WsReentrant
        })?;
        let mut vfs = self.vfs.write();
        if !vfs.all_vfs_unavailable() {
            warn!("vf count change to {num_vf} with vfs allocated");
            return Err(Error::VfBusy);
        }

        let mode = PartitionMode::for_num_vf(num_vf);
        let mut fresh = Topology::build(self.asic, &self.config, mode, num_vf)?;
        fresh.map_partitions(self.asic, &mut vfs);

        let gfx_slice = self.default_gfx_slice(fresh.num_vf_per_gfx_sched);
        let quanta = *self.quanta.lock();
        for cell in &mut fresh.world_switches {
            let ws = cell.get_mut();
            let slice = if ws.is_gfx() {
                gfx_slice
            } else {
                self.config.mm_time_slice_us
            };
            ws.init_run_list(slice);
            ws.time_quanta_option = quanta[ws.sched_block.index()];
            for block in ws.hw_sched_mask.iter() {
                self.blocks.set_mode(block, ws.mode)?;
            }
        }

        for vf in VfId::all() {
            let info = vfs.get_mut(vf);
            for sb in SchedBlock::ALL {
                info.time_slice_us[sb.index()] = if sb.is_gfx() {
                    gfx_slice
                } else {
                    self.config.mm_time_slice_us
                };
            }
        }

        info!(
            "{}: {num_vf} vfs in {mode:?}, {} world switches, gfx slice {gfx_slice}us",
            self.asic.name,
            fresh.layouts.len()
        );
        *topo = fresh;
        *self.full_access.lock() = WorldSwitchMask::EMPTY;
        Ok(())
    }

    // =========================================================================
    // BLOCK ACCESS
    // =========================================================================

    /// Walk one block to `target`
    ///
    /// `vf` may be `None` on autonomous blocks to mean the VF hardware
    /// reports as resident. Fails fast with [`Error::WsReentrant`] if the
    /// block is in use; other blocks stay free to move meanwhile.
    pub fn goto_state(&self, block: HwSchedId, vf: Option<VfId>, target: GpuState) -> Result<()> {
        let topo = self.topo();
        let id = topo.ws_of_block(block).ok_or(Error::InvalidHwSched)?;
        let mut st = self.blocks.try_claim(block)?;
        let mut ws = topo.ws(id)?;
        let env = self.edge_env(&ws);
        self.machine().goto_state(&env, block, &mut st, &mut ws, vf, target)
    }

    /// Walk several blocks of one world switch to `target` in lock-step
    pub fn bulk_goto_state(&self, mask: HwSchedMask, vf: VfId, target: GpuState) -> Result<()> {
        let topo = self.topo();
        let first = mask.first().ok_or(Error::InvalidParameter)?;
        let id = topo.ws_of_block(first).ok_or(Error::InvalidHwSched)?;
        if !topo.layout(id)?.hw_sched_mask.is_superset(mask) {
            error!("{mask:?} spans more than {id}");
            return Err(Error::InvalidParameter);
        }
        let mut guards = self.blocks.try_claim_all(mask)?;
        let mut ws = topo.ws(id)?;
        let env = self.edge_env(&ws);
        self.machine()
            .bulk_goto_state(&env, &mut guards, &mut ws, vf, target)
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    pub(crate) fn topo(&self) -> RwLockReadGuard<'_, Topology> {
        self.topo.read()
    }

    pub(crate) fn machine(&self) -> Machine<'_, H> {
        Machine::new(&self.iov, &*self.diag, self.config.allow_time_cmd_complete_us)
    }

    #[inline]
    pub(crate) fn pf_active(&self) -> bool {
        self.config.flags.contains(SchedFlags::PF_ACTIVE)
    }

    pub(crate) fn default_gfx_slice(&self, num_vf_per_gfx_sched: u32) -> u32 {
        self.config.gfx_time_slice_us.unwrap_or_else(|| {
            default_gfx_time_slice(
                num_vf_per_gfx_sched,
                self.pf_active(),
                self.config.flags.contains(SchedFlags::DISABLE_SELF_SWITCH),
            )
        })
    }

    /// Edge inputs for the blocks of `ws`
    pub(crate) fn edge_env(&self, ws: &WorldSwitch) -> EdgeEnv {
        let vfs = self.vfs.read();
        EdgeEnv {
            mode: ws.mode,
            is_gfx: ws.is_gfx(),
            hold_single_vf: ws.single_vf
                && self.config.flags.contains(SchedFlags::DISABLE_SELF_SWITCH),
            pf_loadable: ws.mode == DriverMode::Manual || ws.vf_inited.contains(VfId::PF),
            active: vfs.in_state(VfSchedState::Active),
            suspended: vfs.in_state(VfSchedState::Suspended),
            auto_run: vfs.auto_run_mask(),
            pf_active: self.pf_active(),
        }
    }

    /// Enabled world switches `vf` is routed to, optionally one sched block
    pub(crate) fn routed(
        &self,
        topo: &Topology,
        vf: VfId,
        sched_block: Option<SchedBlock>,
    ) -> WorldSwitchMask {
        let mask = self.vfs.read().get(vf).world_switch_mask;
        mask.iter()
            .filter(|id| topo.layout(*id).is_ok_and(|ws| ws.serves(sched_block)))
            .collect()
    }

    /// Walk every block of `ws` to `target`
    ///
    /// Bulk world switches go through the lock-step driver and report its
    /// result. Otherwise blocks are walked one after another; a block that
    /// is busy or fails does not stop the rest and the call reports
    /// [`Error::Failure`].
    pub(crate) fn drive(
        &self,
        ws: &mut WorldSwitch,
        vf: Option<VfId>,
        target: GpuState,
    ) -> Result<()> {
        let env = self.edge_env(ws);
        let machine = self.machine();

        if ws.bulk {
            let vf = vf.ok_or(Error::InvalidVf)?;
            let mut guards = self.blocks.try_claim_all(ws.hw_sched_mask)?;
            return machine.bulk_goto_state(&env, &mut guards, ws, vf, target);
        }

        let mut failed = HwSchedMask::EMPTY;
        for block in ws.hw_sched_mask.iter() {
            let mut st = match self.blocks.try_claim(block) {
                Ok(st) => st,
                Err(e) => {
                    warn!("{}: {block} busy: {e}", ws.id);
                    failed.insert(block);
                    continue;
                },
            };
            if let Err(e) = machine.goto_state(&env, block, &mut st, ws, vf, target) {
                warn!("{}: {block} did not reach {target}: {e}", ws.id);
                failed.insert(block);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            error!("{}: {failed:?} failed toward {target}", ws.id);
            Err(Error::Failure)
        }
    }

    /// Start `vf` on `ws`, stopping at Load when the VF skips runs
    pub(crate) fn logical_run(&self, ws: &mut WorldSwitch, vf: VfId) -> Result<()> {
        let target = if self.vfs.read().get(vf).skip_run {
            GpuState::Load
        } else {
            GpuState::Run
        };
        self.drive(ws, Some(vf), target)
    }

    /// Save `vf` on `ws`
    pub(crate) fn logical_pause(&self, ws: &mut WorldSwitch, vf: VfId) -> Result<()> {
        self.drive(ws, Some(vf), GpuState::Save)
    }

    /// Shut `vf` down on `ws`
    pub(crate) fn logical_shutdown(&self, ws: &mut WorldSwitch, vf: VfId) -> Result<()> {
        self.drive(ws, Some(vf), GpuState::Shutdown)
    }

    /// Hand the blocks of an autonomous world switch to firmware
    ///
    /// A liquid world switch with a single active VF simply runs it, as
    /// does a graphics world switch with no VF flagged for firmware
    /// scheduling (the PF runs).
    pub(crate) fn run_auto(&self, ws: &mut WorldSwitch, vf: Option<VfId>) -> Result<()> {
        let env = self.edge_env(ws);
        let mut vf = vf;
        if ws.is_gfx() && vf.is_none() {
            vf = env.auto_run.first();
        }

        let lone = env.active.without_pf();
        if ws.sched_mode == SchedMode::Liquid && lone.count() == 1 {
            return self.drive(ws, lone.first(), GpuState::Run);
        }
        if ws.is_gfx() && vf.is_none() {
            return self.drive(ws, Some(VfId::PF), GpuState::Run);
        }
        self.drive(ws, vf, GpuState::EnableAuto)
    }

    /// Take the blocks of an autonomous world switch back, saving whoever
    /// hardware reports as resident
    pub(crate) fn pause_auto(&self, ws: &mut WorldSwitch) -> Result<()> {
        self.drive(ws, None, GpuState::Save)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{SHARED, SPLIT, hw, mi300x, sched_on, shared, vf};
    use valence_hal::GpuIovCmd;
    use valence_hal::asic::mi300::MI300X;
    use valence_hal::mock::MockGpuIov;

    const MANUAL_STATES: [GpuState; 6] = [
        GpuState::Idle,
        GpuState::Save,
        GpuState::Shutdown,
        GpuState::Init,
        GpuState::Load,
        GpuState::Run,
    ];

    fn place(sched: &Scheduler<MockGpuIov>, block: HwSchedId, state: GpuState, at: VfId) {
        sched.blocks.try_claim(block).unwrap().land(state, at);
    }

    #[test]
    fn test_set_vf_num_builds_world_switches() {
        let sched = mi300x(8);
        assert_eq!(sched.num_vf().unwrap(), 8);
        let gfx = sched.ws_of(vf(3), SchedBlock::Gfx).unwrap();
        let ws = sched.world_switch(gfx).unwrap();
        assert_eq!(ws.hw_sched_mask, HwSchedMask::only(hw(15)));
        assert!(ws.single_vf);
        assert_eq!(ws.time_quanta_option, DEFAULT_GFX_TIME_QUANTA_OPTION);

        let vfs = sched.vfs.read();
        assert!(valence_core::time::is_infinite(
            vfs.get(vf(3)).time_slice_us[SchedBlock::Gfx.index()]
        ));
        assert_eq!(vfs.get(vf(3)).time_slice_us[SchedBlock::Vcn.index()], 255_000);
    }

    #[test]
    fn test_set_vf_num_refused_while_allocated() {
        let sched = mi300x(2);
        sched.vfs.write().get_mut(vf(1)).state = VfSchedState::Available;
        assert_eq!(sched.set_vf_num(4).unwrap_err(), Error::VfBusy);
        assert_eq!(sched.num_vf().unwrap(), 2);
        assert_eq!(sched.set_vf_num(40).unwrap_err(), Error::InvalidParameter);
    }

    #[test]
    fn test_shared_slices_and_modes() {
        let sched = shared(SchedConfig::default());
        let gfx = sched.ws_of(vf(0), SchedBlock::Gfx).unwrap();
        let ws = sched.world_switch(gfx).unwrap();
        assert!(ws.bulk);
        assert!(!ws.single_vf);
        assert_eq!(ws.run_list.order(), [vf(0), vf(1), vf(2), vf(3)]);
        assert!(ws.run_list.entry(vf(2)).dummy);
        assert_eq!(ws.run_list.entry(vf(2)).time_slice, 6_000);

        assert_eq!(sched.block_state(hw(0)).unwrap().mode, DriverMode::Auto);
        assert_eq!(sched.block_state(hw(1)).unwrap().mode, DriverMode::Manual);
    }

    #[test]
    fn test_manual_walks_stay_short() {
        for start in MANUAL_STATES {
            for target in [GpuState::Idle, GpuState::Save, GpuState::Shutdown, GpuState::Run] {
                for at in [vf(0), VfId::PF] {
                    // From another VF's context only a run is a short walk
                    if at.is_pf() && target != GpuState::Run {
                        continue;
                    }
                    let sched = mi300x(8);
                    let block = hw(12);
                    place(&sched, block, start, at);
                    sched.iov.clear_log();

                    sched.goto_state(block, Some(vf(0)), target).unwrap();
                    let st = sched.block_state(block).unwrap();
                    assert!(st.is_at(target, vf(0)), "{start}({at}) -> {target}");
                    assert!(sched.iov.commands().len() <= 5, "{start}({at}) -> {target}");
                }
            }
        }
    }

    #[test]
    fn test_goto_is_idempotent() {
        for target in [GpuState::Idle, GpuState::Save, GpuState::Shutdown] {
            let sched = mi300x(8);
            sched.goto_state(hw(12), Some(vf(0)), target).unwrap();
            sched.iov.clear_log();
            sched.goto_state(hw(12), Some(vf(0)), target).unwrap();
            assert!(sched.iov.commands().is_empty(), "{target}");
        }

        let sched = mi300x(8);
        sched.goto_state(hw(12), Some(vf(0)), GpuState::Run).unwrap();
        sched.iov.clear_log();
        sched.goto_state(hw(12), Some(vf(0)), GpuState::Run).unwrap();
        assert_eq!(
            sched.iov.commands_for(hw(12)),
            [(GpuIovCmd::Idle, vf(0)), (GpuIovCmd::Run, vf(0))]
        );
    }

    #[test]
    fn test_bulk_matches_sequential_on_one_block() {
        for start in [GpuState::Shutdown, GpuState::Run, GpuState::Save] {
            let single = mi300x(8);
            let bulk = mi300x(8);
            for sched in [&single, &bulk] {
                place(sched, hw(12), start, vf(0));
                sched.iov.clear_log();
            }

            single.goto_state(hw(12), Some(vf(0)), GpuState::Run).unwrap();
            bulk.bulk_goto_state(HwSchedMask::only(hw(12)), vf(0), GpuState::Run)
                .unwrap();

            let a = single.block_state(hw(12)).unwrap();
            let b = bulk.block_state(hw(12)).unwrap();
            assert_eq!((a.gpu_state, a.vf), (b.gpu_state, b.vf), "{start}");
            assert_eq!(single.iov.commands(), bulk.iov.commands(), "{start}");
        }
    }

    #[test]
    fn test_reentrant_goto_fails_fast() {
        let sched = mi300x(8);
        let held = sched.blocks.try_claim(hw(13)).unwrap();
        let err = sched.goto_state(hw(13), Some(vf(1)), GpuState::Run).unwrap_err();
        assert_eq!(err, Error::WsReentrant);
        assert!(sched.iov.commands().is_empty());
        drop(held);

        sched.goto_state(hw(13), Some(vf(1)), GpuState::Run).unwrap();
        assert!(sched.block_state(hw(13)).unwrap().is_at(GpuState::Run, vf(1)));
    }

    #[test]
    fn test_busy_block_leaves_other_world_switches_free() {
        let sched = sched_on(&SPLIT, SchedConfig::default(), 2);
        let topo = sched.topo();
        let busy = topo.ws_of_block(hw(0)).unwrap();
        // A transition in flight on block 0 holds its world switch and claim
        let _ws = topo.ws(busy).unwrap();
        let _st = sched.blocks.try_claim(hw(0)).unwrap();

        assert_eq!(
            sched.goto_state(hw(0), Some(vf(0)), GpuState::Run).unwrap_err(),
            Error::WsReentrant
        );
        sched.goto_state(hw(2), Some(vf(1)), GpuState::Run).unwrap();
        assert!(sched.block_state(hw(2)).unwrap().is_at(GpuState::Run, vf(1)));
        assert!(sched.iov.commands_for(hw(0)).is_empty());
    }

    #[test]
    fn test_transitions_on_other_threads_run_alongside() {
        let sched = sched_on(&SPLIT, SchedConfig::default(), 2);
        let topo = sched.topo();
        let _ws = topo.ws(topo.ws_of_block(hw(0)).unwrap()).unwrap();
        let _st = sched.blocks.try_claim(hw(0)).unwrap();

        let other = std::thread::scope(|s| {
            s.spawn(|| sched.goto_state(hw(2), Some(vf(1)), GpuState::Run))
                .join()
                .unwrap()
        });
        assert_eq!(other, Ok(()));
        assert!(sched.block_state(hw(2)).unwrap().is_at(GpuState::Run, vf(1)));
    }

    #[test]
    fn test_vf_num_change_waits_for_idle_scheduler() {
        let sched = sched_on(&SPLIT, SchedConfig::default(), 2);
        let topo = sched.topo();
        assert_eq!(sched.set_vf_num(1).unwrap_err(), Error::WsReentrant);
        drop(topo);
        sched.set_vf_num(1).unwrap();
        assert_eq!(sched.num_vf().unwrap(), 1);
    }

    #[test]
    fn test_disjoint_blocks_do_not_conflict() {
        let sched = sched_on(&SPLIT, SchedConfig::default(), 2);
        sched.goto_state(hw(0), Some(vf(0)), GpuState::Run).unwrap();
        sched.goto_state(hw(2), Some(vf(1)), GpuState::Run).unwrap();
        assert!(sched.block_state(hw(0)).unwrap().is_at(GpuState::Run, vf(0)));
        assert!(sched.block_state(hw(2)).unwrap().is_at(GpuState::Run, vf(1)));
        assert!(sched.block_state(hw(1)).unwrap().is_at(GpuState::Shutdown, VfId::PF));
    }

    #[test]
    fn test_saved_active_vf_is_loaded() {
        let sched = mi300x(8);
        sched.vfs.write().get_mut(vf(3)).state = VfSchedState::Active;
        sched.blocks.try_claim(hw(15)).unwrap().vf_cache[3] = GpuState::Save;

        sched.goto_state(hw(15), Some(vf(3)), GpuState::Run).unwrap();
        assert_eq!(
            sched.iov.commands_for(hw(15)),
            [(GpuIovCmd::Load, vf(3)), (GpuIovCmd::Run, vf(3))]
        );
        let st = sched.block_state(hw(15)).unwrap();
        assert!(st.is_at(GpuState::Run, vf(3)));
    }

    #[test]
    fn test_bulk_mask_must_stay_in_one_world_switch() {
        let sched = sched_on(&SPLIT, SchedConfig::default(), 2);
        let across = HwSchedMask::only(hw(1)).with(hw(2));
        assert_eq!(
            sched.bulk_goto_state(across, vf(0), GpuState::Run).unwrap_err(),
            Error::InvalidParameter
        );
        assert!(sched.iov.commands().is_empty());
    }

    #[test]
    fn test_drive_sequential_aggregates_failures() {
        let config = SchedConfig::default()
            .with_flags(SchedFlags::DISABLE_SELF_SWITCH)
            .with_cmd_budget(200);
        let sched = shared(config);
        sched.iov.hang(hw(1));
        let topo = sched.topo();
        let mut ws = topo.ws(topo.ws_of_block(hw(1)).unwrap()).unwrap();
        assert!(!ws.bulk);

        assert_eq!(sched.logical_run(&mut ws, vf(0)).unwrap_err(), Error::Failure);
        drop(ws);
        drop(topo);
        // The healthy block still ran
        assert!(sched.block_state(hw(2)).unwrap().is_at(GpuState::Run, vf(0)));
        assert!(sched.block_state(hw(1)).unwrap().is_at(GpuState::Shutdown, VfId::PF));
    }

    #[test]
    fn test_drive_walks_past_busy_block() {
        let config = SchedConfig::default().with_flags(SchedFlags::DISABLE_SELF_SWITCH);
        let sched = shared(config);
        let held = sched.blocks.try_claim(hw(1)).unwrap();
        {
            let topo = sched.topo();
            let mut ws = topo.ws(topo.ws_of_block(hw(2)).unwrap()).unwrap();
            assert_eq!(sched.logical_run(&mut ws, vf(0)).unwrap_err(), Error::Failure);
        }
        drop(held);
        assert!(sched.block_state(hw(2)).unwrap().is_at(GpuState::Run, vf(0)));
        assert!(sched.block_state(hw(1)).unwrap().is_at(GpuState::Shutdown, VfId::PF));
        assert!(sched.iov.commands_for(hw(1)).is_empty());
    }

    #[test]
    fn test_skip_run_stops_at_load() {
        let sched = mi300x(8);
        sched.vfs.write().get_mut(vf(2)).skip_run = true;
        {
            let topo = sched.topo();
            let mut ws = topo.ws(sched.ws_of(vf(2), SchedBlock::Gfx).unwrap()).unwrap();
            sched.logical_run(&mut ws, vf(2)).unwrap();
        }
        assert_eq!(sched.iov.commands_for(hw(14)), [(GpuIovCmd::Init, vf(2))]);
    }

    #[test]
    fn test_run_auto_without_vfs_issues_nothing() {
        let sched = Scheduler::new(MockGpuIov::new(), &MI300X, SchedConfig::default()).unwrap();
        sched.set_vf_num(1).unwrap();
        {
            let topo = sched.topo();
            let mut ws = topo.ws(topo.ws_of_block(hw(0)).unwrap()).unwrap();
            sched.run_auto(&mut ws, None).unwrap();
        }
        assert!(sched.iov.commands().is_empty());
        assert_eq!(sched.block_state(hw(0)).unwrap().gpu_state, GpuState::EnableAuto);
    }

    #[test]
    fn test_shared_fixture_is_routed() {
        let sched = shared(SchedConfig::default());
        assert_eq!(sched.asic().name, SHARED.name);
        let vcn = sched.ws_of(vf(3), SchedBlock::Vcn).unwrap();
        assert_eq!(sched.ws_of(vf(0), SchedBlock::Vcn), Some(vcn));
        assert_eq!(sched.world_switch_ids().unwrap().count(), 2);
    }
}
