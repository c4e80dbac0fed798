//! Small adapters for unit tests
//!
//! Besides the MI300 tables, two made-up ASICs keep scheduler tests short:
//! `SHARED` puts four VFs on one graphics world switch of two blocks plus a
//! multimedia block, `SPLIT` gives two VFs two graphics blocks each.

use valence_core::{
    HwSchedClass, HwSchedId, HwSchedMask, MAX_NUM_PARTITION, PF_IDX, SchedBlock, SchedConfig,
    SchedMode, VfId, VfMask,
};
use valence_hal::asic::PartitionTable;
use valence_hal::asic::mi300::MI300X;
use valence_hal::mock::MockGpuIov;
use valence_hal::{AsicProfile, BlockCaps, HwSchedBlockDesc, PartitionRow};

use crate::scheduler::Scheduler;

pub(crate) fn vf(i: usize) -> VfId {
    VfId::from_index(i)
}

pub(crate) fn hw(i: usize) -> HwSchedId {
    HwSchedId::from_index(i)
}

const fn gfx(name: &'static str, instance: u8) -> HwSchedBlockDesc {
    HwSchedBlockDesc {
        name,
        class: HwSchedClass::Gfx,
        sched_block: SchedBlock::Gfx,
        default_mode: SchedMode::Fairness,
        instance,
        caps: BlockCaps::all(),
    }
}

const VCN: HwSchedBlockDesc = HwSchedBlockDesc {
    name: "VCN_SCH0",
    class: HwSchedClass::Mm,
    sched_block: SchedBlock::Vcn,
    default_mode: SchedMode::FrameLoop,
    instance: 0,
    caps: BlockCaps::FRAME_LOOP,
};

const fn part(vfs: u32, blocks: u32) -> PartitionRow {
    PartitionRow {
        idx_vf_mask: VfMask::from_bits(vfs | (1 << PF_IDX)),
        hw_sched_mask: HwSchedMask::from_bits(blocks),
    }
}

const fn every_mode(rows: [PartitionRow; MAX_NUM_PARTITION]) -> PartitionTable {
    [rows; 5]
}

const E: PartitionRow = PartitionRow::EMPTY;

static SHARED_BLOCKS: [HwSchedBlockDesc; 3] = [VCN, gfx("GFX_SCH0", 0), gfx("GFX_SCH1", 1)];

static SHARED_PARTITIONS: PartitionTable =
    every_mode([part(0b1111, 0b111), E, E, E, E, E, E, E]);

/// Four VFs on block 0 (VCN) and blocks 1-2 (graphics)
pub(crate) static SHARED: AsicProfile = AsicProfile {
    name: "SHARED",
    blocks: &SHARED_BLOCKS,
    partitions: &SHARED_PARTITIONS,
    first_gfx_block: HwSchedId::from_index(1),
};

static SPLIT_BLOCKS: [HwSchedBlockDesc; 4] = [
    gfx("GFX_SCH0", 0),
    gfx("GFX_SCH1", 1),
    gfx("GFX_SCH2", 2),
    gfx("GFX_SCH3", 3),
];

static SPLIT_PARTITIONS: PartitionTable =
    every_mode([part(0b01, 0b0011), part(0b10, 0b1100), E, E, E, E, E, E]);

/// VF0 on blocks 0-1, VF1 on blocks 2-3
pub(crate) static SPLIT: AsicProfile = AsicProfile {
    name: "SPLIT",
    blocks: &SPLIT_BLOCKS,
    partitions: &SPLIT_PARTITIONS,
    first_gfx_block: HwSchedId::from_index(0),
};

/// Scheduler over `asic` with `num_vf` VFs routed
pub(crate) fn sched_on(
    asic: &'static AsicProfile,
    config: SchedConfig,
    num_vf: u32,
) -> Scheduler<MockGpuIov> {
    let sched = Scheduler::new(MockGpuIov::new(), asic, config).unwrap();
    sched.set_vf_num(num_vf).unwrap();
    sched
}

/// Four VFs sharing one graphics world switch
pub(crate) fn shared(config: SchedConfig) -> Scheduler<MockGpuIov> {
    sched_on(&SHARED, config, 4)
}

/// MI300X with `num_vf` VFs and the default configuration
pub(crate) fn mi300x(num_vf: u32) -> Scheduler<MockGpuIov> {
    sched_on(&MI300X, SchedConfig::default(), num_vf)
}
