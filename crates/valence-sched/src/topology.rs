//! # Topology Builder
//!
//! Compiles the static partition table of an ASIC and the current VF count
//! into world switches and per-VF routing masks.
//!
//! ```text
//!   PartitionRow[mode] ──copy──▶ SpatialPartition ──build──▶ WorldSwitch
//!                                       │                         │
//!                                       └─────────map─────────────┴──▶ VfSchedInfo
//!                                              (ws mask, hw mask, xcc mask, per-block)
//! ```
//!
//! Tables are only ever rebuilt wholesale. The shape of every world switch
//! is fixed at build; only its scheduling state changes afterwards.

use arrayvec::ArrayVec;
use log::{info, warn};
use spin::{Mutex, MutexGuard};

use valence_core::{
    DriverMode, Error, HwSchedId, HwSchedMask, MAX_NUM_PARTITION, MAX_NUM_WORLD_SWITCH, PartitionMode,
    Result, SchedBlock, SchedConfig, SchedFlags, SchedMode, VfId, VfMask, WorldSwitchId,
    WorldSwitchMask,
};
use valence_hal::AsicProfile;

use crate::vf::VfTable;
use crate::world_switch::WorldSwitch;

// =============================================================================
// SPATIAL PARTITION
// =============================================================================

/// One spatial partition with its routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialPartition {
    /// VFs routed here, PF included
    pub idx_vf_mask: VfMask,
    /// Blocks of this partition
    pub hw_sched_mask: HwSchedMask,
    /// Compute dies of this partition
    pub xcc_mask: u32,
    /// World switches with a block in this partition
    pub world_switch_mask: WorldSwitchMask,
    /// World switch per sched block
    pub ws_map: [Option<WorldSwitchId>; SchedBlock::COUNT],
}

impl SpatialPartition {
    const fn new(idx_vf_mask: VfMask, hw_sched_mask: HwSchedMask, xcc_mask: u32) -> Self {
        Self {
            idx_vf_mask,
            hw_sched_mask,
            xcc_mask,
            world_switch_mask: WorldSwitchMask::EMPTY,
            ws_map: [None; SchedBlock::COUNT],
        }
    }
}

/// Partitions of one configuration
pub type PartitionList = ArrayVec<SpatialPartition, MAX_NUM_PARTITION>;

/// Copy the ASIC rows of `mode` for `num_vf` VFs
///
/// One partition per VF. VF bits outside `[0, num_vf)` are dropped and the
/// PF joins every partition. Rows the ASIC leaves empty stay empty.
pub fn copy_partition_table(
    asic: &AsicProfile,
    mode: PartitionMode,
    num_vf: u32,
) -> PartitionList {
    let count = (num_vf as usize).min(MAX_NUM_PARTITION);
    let valid = VfMask::first_n(num_vf).with(VfId::PF);
    let rows = asic.rows(mode);

    let partitions: PartitionList = rows[..count]
        .iter()
        .map(|row| {
            SpatialPartition::new(
                row.idx_vf_mask.intersection(valid).with(VfId::PF),
                row.hw_sched_mask,
                row.hw_sched_mask.shifted_down(asic.first_gfx_block),
            )
        })
        .collect();

    if partitions.iter().any(|p| p.hw_sched_mask.is_empty()) {
        warn!("{}: {mode:?} has no routing for some of {num_vf} vfs", asic.name);
    }
    partitions
}

// =============================================================================
// TOPOLOGY
// =============================================================================

/// Fixed shape of one world switch
///
/// Fixed when the topology is built, so routing reads it without locking
/// the world switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsLayout {
    /// World switch id
    pub id: WorldSwitchId,
    /// Engine family
    pub sched_block: SchedBlock,
    /// Driver mode of the blocks
    pub mode: DriverMode,
    /// Participates in scheduling
    pub enabled: bool,
    /// Blocks switched together
    pub hw_sched_mask: HwSchedMask,
    /// VFs routed here, PF included
    pub allowed_vfs: VfMask,
}

impl WsLayout {
    fn of(ws: &WorldSwitch) -> Self {
        Self {
            id: ws.id,
            sched_block: ws.sched_block,
            mode: ws.mode,
            enabled: ws.enabled,
            hw_sched_mask: ws.hw_sched_mask,
            allowed_vfs: ws.allowed_vfs,
        }
    }

    /// Graphics world switch
    #[inline]
    pub fn is_gfx(&self) -> bool {
        self.sched_block == SchedBlock::Gfx
    }

    /// Enabled and of engine family `sched_block`, any family for `None`
    #[inline]
    pub fn serves(&self, sched_block: Option<SchedBlock>) -> bool {
        self.enabled && sched_block.is_none_or(|sb| sb == self.sched_block)
    }
}

/// World switches and partitions of one VF configuration
///
/// Each world switch sits behind its own lock so transitions on disjoint
/// world switches proceed side by side.
#[derive(Debug)]
pub struct Topology {
    /// VF count the tables were built for
    pub num_vf: u32,
    /// Partition mode the tables were built for
    pub partition_mode: PartitionMode,
    /// Spatial partitions
    pub partitions: PartitionList,
    /// Shapes in id order
    pub layouts: ArrayVec<WsLayout, MAX_NUM_WORLD_SWITCH>,
    /// World switches in id order
    pub world_switches: ArrayVec<Mutex<WorldSwitch>, MAX_NUM_WORLD_SWITCH>,
    /// VFs sharing one graphics scheduler
    pub num_vf_per_gfx_sched: u32,
}

impl Topology {
    /// Build partitions and world switches
    pub fn build(
        asic: &AsicProfile,
        config: &SchedConfig,
        mode: PartitionMode,
        num_vf: u32,
    ) -> Result<Self> {
        let partitions = copy_partition_table(asic, mode, num_vf);
        let gfx_partitions = asic.gfx_partition_count(mode);
        let num_vf_per_gfx_sched = if gfx_partitions == 0 {
            0
        } else {
            num_vf / gfx_partitions
        };
        info!("{}: {num_vf} vfs, {num_vf_per_gfx_sched} per gfx scheduler", asic.name);

        let built = build_world_switches(asic, config, &partitions, num_vf_per_gfx_sched == 1)?;
        Ok(Self {
            num_vf,
            partition_mode: mode,
            partitions,
            layouts: built.iter().map(WsLayout::of).collect(),
            world_switches: built.into_iter().map(Mutex::new).collect(),
            num_vf_per_gfx_sched,
        })
    }

    /// Rebuild every VF's routing from the partitions
    pub fn map_partitions(&mut self, asic: &AsicProfile, vfs: &mut VfTable) {
        vfs.clear_routing();

        for part in &mut self.partitions {
            part.world_switch_mask = WorldSwitchMask::EMPTY;
            part.ws_map = [None; SchedBlock::COUNT];
            for ws in &self.layouts {
                if !part.hw_sched_mask.intersects(ws.hw_sched_mask) {
                    continue;
                }
                part.world_switch_mask.insert(ws.id);
                part.ws_map[ws.sched_block.index()] = Some(ws.id);
            }

            for vf in part.idx_vf_mask.iter() {
                let info = vfs.get_mut(vf);
                info.world_switch_mask |= part.world_switch_mask;
                info.hw_sched_mask |= part.hw_sched_mask;
                info.xcc_mask |= part.xcc_mask;

                for block in info.hw_sched_mask.iter() {
                    if let Some(desc) = asic.block(block) {
                        info.block_map[desc.sched_block.index()].insert(block);
                    }
                }
                for id in info.world_switch_mask.iter() {
                    if let Some(ws) = self.layouts.get(id.index()) {
                        info.ws_map[ws.sched_block.index()] = Some(id);
                    }
                }
            }
        }
    }

    /// Shape of world switch `id`
    pub fn layout(&self, id: WorldSwitchId) -> Result<&WsLayout> {
        self.layouts.get(id.index()).ok_or(Error::InvalidParameter)
    }

    /// Lock world switch `id`
    ///
    /// Waits for a transition already holding it. Callers take at most one
    /// world switch at a time.
    pub fn ws(&self, id: WorldSwitchId) -> Result<MutexGuard<'_, WorldSwitch>> {
        self.world_switches
            .get(id.index())
            .map(|ws| ws.lock())
            .ok_or(Error::InvalidParameter)
    }

    /// World switch owning `block`
    pub fn ws_of_block(&self, block: HwSchedId) -> Option<WorldSwitchId> {
        self.layouts
            .iter()
            .find(|ws| ws.enabled && ws.hw_sched_mask.contains(block))
            .map(|ws| ws.id)
    }

    /// Every block owned by an enabled world switch
    pub fn owned_blocks(&self) -> HwSchedMask {
        self.layouts
            .iter()
            .filter(|ws| ws.enabled)
            .fold(HwSchedMask::EMPTY, |acc, ws| acc | ws.hw_sched_mask)
    }

    /// Ids of every world switch
    pub fn ids(&self) -> impl Iterator<Item = WorldSwitchId> + '_ {
        self.layouts.iter().map(|ws| ws.id)
    }

    /// Ids of the enabled world switches of `sched_block`, any for `None`
    pub fn serving(
        &self,
        sched_block: Option<SchedBlock>,
    ) -> impl Iterator<Item = WorldSwitchId> + '_ {
        self.layouts
            .iter()
            .filter(move |ws| ws.serves(sched_block))
            .map(|ws| ws.id)
    }
}

/// Group partition blocks into world switches
///
/// A block already owned by a world switch only widens its allowed VFs.
/// Otherwise the block joins a world switch of the same engine family
/// created for this partition, or starts a new one.
fn build_world_switches(
    asic: &AsicProfile,
    config: &SchedConfig,
    partitions: &PartitionList,
    single: bool,
) -> Result<ArrayVec<WorldSwitch, MAX_NUM_WORLD_SWITCH>> {
    let mut world_switches: ArrayVec<WorldSwitch, MAX_NUM_WORLD_SWITCH> = ArrayVec::new();
    let mut start = 0;

    for part in partitions {
        for block in part.hw_sched_mask.iter() {
            let desc = asic.block(block).ok_or(Error::InvalidHwSched)?;

            if let Some(ws) = world_switches
                .iter_mut()
                .find(|ws| ws.enabled && ws.hw_sched_mask.contains(block))
            {
                ws.allowed_vfs |= part.idx_vf_mask;
                continue;
            }

            if let Some(ws) = world_switches[start..]
                .iter_mut()
                .find(|ws| ws.enabled && ws.sched_block == desc.sched_block)
            {
                ws.hw_sched_mask.insert(block);
                continue;
            }

            let id = WorldSwitchId::new(world_switches.len() as u32)
                .ok_or(Error::CapacityExceeded)?;
            let mut sched_mode = config.sched_mode_for(desc.is_gfx());
            if !desc.caps.supports(sched_mode) {
                warn!("{block}: {sched_mode:?} unsupported, using {:?}", desc.default_mode);
                sched_mode = desc.default_mode;
            }
            let mut ws = WorldSwitch::new(id, desc.sched_block, sched_mode);
            ws.allowed_vfs = part.idx_vf_mask;
            ws.hw_sched_mask = HwSchedMask::only(block);
            ws.bulk = desc.is_gfx()
                && sched_mode == SchedMode::Fairness
                && config.flags.contains(SchedFlags::BULK_GFX);
            world_switches
                .try_push(ws)
                .map_err(|_| Error::CapacityExceeded)?;
        }
        start = world_switches.len();
    }

    for ws in &mut world_switches {
        ws.single_vf = single && ws.is_gfx();
        info!(
            "created {} type={} hw_sched_mask={:?} mode={:?}",
            ws.id, ws.sched_block, ws.hw_sched_mask, ws.sched_mode
        );
    }
    Ok(world_switches)
}
