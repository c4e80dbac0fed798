//! # MI300 Family
//!
//! Twelve MMSCH blocks (VCN, JPEG, JPEG1 for each of four media instances)
//! followed by eight RLCV graphics blocks, one per XCD.

use static_assertions::const_assert_eq;

use valence_core::{HwSchedClass, HwSchedId, MAX_NUM_PARTITION, SchedBlock, SchedMode};

use super::{AsicProfile, BlockCaps, HwSchedBlockDesc, PartitionRow, PartitionTable, row};

// =============================================================================
// BLOCK IDS
// =============================================================================

/// VCN MMSCH, media instance 0
pub const VCN_SCH0: u8 = 0;
/// JPEG MMSCH, media instance 0
pub const JPEG_SCH0: u8 = 1;
/// JPEG1 MMSCH, media instance 0
pub const JPEG1_SCH0: u8 = 2;
/// VCN MMSCH, media instance 1
pub const VCN_SCH1: u8 = 3;
/// JPEG MMSCH, media instance 1
pub const JPEG_SCH1: u8 = 4;
/// JPEG1 MMSCH, media instance 1
pub const JPEG1_SCH1: u8 = 5;
/// VCN MMSCH, media instance 2
pub const VCN_SCH2: u8 = 6;
/// JPEG MMSCH, media instance 2
pub const JPEG_SCH2: u8 = 7;
/// JPEG1 MMSCH, media instance 2
pub const JPEG1_SCH2: u8 = 8;
/// VCN MMSCH, media instance 3
pub const VCN_SCH3: u8 = 9;
/// JPEG MMSCH, media instance 3
pub const JPEG_SCH3: u8 = 10;
/// JPEG1 MMSCH, media instance 3
pub const JPEG1_SCH3: u8 = 11;
/// First RLCV graphics block
pub const GFX_SCH0: u8 = 12;

/// Number of blocks
pub const NUM_BLOCKS: usize = 20;

const GFX_CAPS: BlockCaps = BlockCaps::FAIRNESS.union(BlockCaps::ROUND_ROBIN);

const fn mm(name: &'static str, sched_block: SchedBlock, instance: u8) -> HwSchedBlockDesc {
    HwSchedBlockDesc {
        name,
        class: HwSchedClass::Mm,
        sched_block,
        default_mode: SchedMode::FrameLoop,
        instance,
        caps: BlockCaps::FRAME_LOOP,
    }
}

const fn gfx(name: &'static str, instance: u8) -> HwSchedBlockDesc {
    HwSchedBlockDesc {
        name,
        class: HwSchedClass::Gfx,
        sched_block: SchedBlock::Gfx,
        default_mode: SchedMode::Fairness,
        instance,
        caps: GFX_CAPS,
    }
}

static BLOCKS: [HwSchedBlockDesc; NUM_BLOCKS] = [
    mm("VCN_SCH0_MMSCH", SchedBlock::Vcn, 0),
    mm("JPEG_SCH0_MMSCH", SchedBlock::Jpeg, 0),
    mm("JPEG1_SCH0_MMSCH", SchedBlock::Jpeg, 0),
    mm("VCN_SCH1_MMSCH", SchedBlock::Vcn, 1),
    mm("JPEG_SCH1_MMSCH", SchedBlock::Jpeg, 1),
    mm("JPEG1_SCH1_MMSCH", SchedBlock::Jpeg, 1),
    mm("VCN_SCH2_MMSCH", SchedBlock::Vcn, 2),
    mm("JPEG_SCH2_MMSCH", SchedBlock::Jpeg, 2),
    mm("JPEG1_SCH2_MMSCH", SchedBlock::Jpeg, 2),
    mm("VCN_SCH3_MMSCH", SchedBlock::Vcn, 3),
    mm("JPEG_SCH3_MMSCH", SchedBlock::Jpeg, 3),
    mm("JPEG1_SCH3_MMSCH", SchedBlock::Jpeg, 3),
    gfx("GFX_SCH0_RLCV", 0),
    gfx("GFX_SCH1_RLCV", 1),
    gfx("GFX_SCH2_RLCV", 2),
    gfx("GFX_SCH3_RLCV", 3),
    gfx("GFX_SCH4_RLCV", 4),
    gfx("GFX_SCH5_RLCV", 5),
    gfx("GFX_SCH6_RLCV", 6),
    gfx("GFX_SCH7_RLCV", 7),
];

const_assert_eq!(GFX_SCH0 as usize + 8, NUM_BLOCKS);

// =============================================================================
// PARTITION ROWS
// =============================================================================

const E: PartitionRow = PartitionRow::EMPTY;

const MM0: [u8; 3] = [VCN_SCH0, JPEG_SCH0, JPEG1_SCH0];
const MM1: [u8; 3] = [VCN_SCH1, JPEG_SCH1, JPEG1_SCH1];
const MM2: [u8; 3] = [VCN_SCH2, JPEG_SCH2, JPEG1_SCH2];
const MM3: [u8; 3] = [VCN_SCH3, JPEG_SCH3, JPEG1_SCH3];

const G: u8 = GFX_SCH0;

/// Graphics block `i` plus the media blocks of instance `m`
const fn cpx_row(vf: u32, i: u8, m: [u8; 3]) -> PartitionRow {
    row(vf, &[G + i, m[0], m[1], m[2]])
}

static MI300_PARTITIONS: PartitionTable = [
    // SPX
    [
        row(
            0,
            &[
                G, G + 1, G + 2, G + 3, G + 4, G + 5, G + 6, G + 7,
                MM0[0], MM0[1], MM0[2], MM1[0], MM1[1], MM1[2],
                MM2[0], MM2[1], MM2[2], MM3[0], MM3[1], MM3[2],
            ],
        ),
        E, E, E, E, E, E, E,
    ],
    // DPX
    [
        row(
            0,
            &[G, G + 1, G + 2, G + 3, MM0[0], MM0[1], MM0[2], MM1[0], MM1[1], MM1[2]],
        ),
        row(
            1,
            &[G + 4, G + 5, G + 6, G + 7, MM2[0], MM2[1], MM2[2], MM3[0], MM3[1], MM3[2]],
        ),
        E, E, E, E, E, E,
    ],
    // TPX is not supported
    [E; MAX_NUM_PARTITION],
    // QPX
    [
        row(0, &[G, G + 1, MM0[0], MM0[1], MM0[2]]),
        row(1, &[G + 2, G + 3, MM1[0], MM1[1], MM1[2]]),
        row(2, &[G + 4, G + 5, MM2[0], MM2[1], MM2[2]]),
        row(3, &[G + 6, G + 7, MM3[0], MM3[1], MM3[2]]),
        E, E, E, E,
    ],
    // CPX-8
    [
        cpx_row(0, 0, MM0),
        cpx_row(1, 1, MM0),
        cpx_row(2, 2, MM1),
        cpx_row(3, 3, MM1),
        cpx_row(4, 4, MM2),
        cpx_row(5, 5, MM2),
        cpx_row(6, 6, MM3),
        cpx_row(7, 7, MM3),
    ],
];

static MI308_PARTITIONS: PartitionTable = [
    // SPX
    [
        row(
            0,
            &[
                G, G + 1, G + 2, G + 3,
                MM0[0], MM0[1], MM0[2], MM1[0], MM1[1], MM1[2],
                MM2[0], MM2[1], MM2[2], MM3[0], MM3[1], MM3[2],
            ],
        ),
        E, E, E, E, E, E, E,
    ],
    // DPX
    [
        row(0, &[G, G + 1, MM0[0], MM0[1], MM0[2], MM1[0], MM1[1], MM1[2]]),
        row(1, &[G + 2, G + 3, MM2[0], MM2[1], MM2[2], MM3[0], MM3[1], MM3[2]]),
        E, E, E, E, E, E,
    ],
    // TPX is not supported
    [E; MAX_NUM_PARTITION],
    // QPX is not supported
    [E; MAX_NUM_PARTITION],
    // CPX-4
    [
        cpx_row(0, 0, MM0),
        cpx_row(1, 1, MM1),
        cpx_row(2, 2, MM2),
        cpx_row(3, 3, MM3),
        E, E, E, E,
    ],
];

/// MI300X with eight XCDs
pub static MI300X: AsicProfile = AsicProfile {
    name: "MI300X",
    blocks: &BLOCKS,
    partitions: &MI300_PARTITIONS,
    first_gfx_block: HwSchedId::from_index(GFX_SCH0 as usize),
};

/// MI308X with four XCDs
pub static MI308X: AsicProfile = AsicProfile {
    name: "MI308X",
    blocks: &BLOCKS,
    partitions: &MI308_PARTITIONS,
    first_gfx_block: HwSchedId::from_index(GFX_SCH0 as usize),
};

/// Profile for a PCI device id
pub fn profile_for_device(dev_id: u16) -> Option<&'static AsicProfile> {
    match dev_id {
        0x74A1 | 0x74A9 | 0x74A5 | 0x0070 | 0x0071 | 0x75A0 | 0x75A1 | 0x75A3 => Some(&MI300X),
        0x74A2 | 0x74A8 => Some(&MI308X),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valence_core::{HwSchedMask, PartitionMode, VfId};

    #[test]
    fn test_block_layout() {
        assert_eq!(MI300X.num_blocks(), NUM_BLOCKS);
        let gfx0 = MI300X.block(HwSchedId::from_index(12)).unwrap();
        assert!(gfx0.is_gfx());
        assert!(gfx0.caps.supports(SchedMode::Fairness));
        assert!(!gfx0.caps.supports(SchedMode::FrameLoop));
        let jpeg1 = MI300X.block(HwSchedId::from_index(5)).unwrap();
        assert_eq!(jpeg1.sched_block, SchedBlock::Jpeg);
        assert_eq!(jpeg1.instance, 1);
        assert_eq!(MI300X.class_mask(HwSchedClass::Gfx).bits(), 0xff << 12);
    }

    #[test]
    fn test_partition_rows() {
        let spx = MI300X.rows(PartitionMode::Spx);
        assert_eq!(spx[0].hw_sched_mask.count(), 20);
        assert!(spx[0].idx_vf_mask.contains(VfId::PF));
        assert!(spx[1].is_empty());

        let cpx = MI300X.rows(PartitionMode::Cpx);
        let expected: HwSchedMask = [13u8, 0, 1, 2]
            .iter()
            .map(|&id| HwSchedId::from_index(id as usize))
            .collect();
        assert_eq!(cpx[1].hw_sched_mask, expected);
        assert!(cpx[1].idx_vf_mask.contains(VfId::from_index(1)));

        assert!(MI300X.rows(PartitionMode::Tpx).iter().all(PartitionRow::is_empty));
        assert!(MI308X.rows(PartitionMode::Qpx).iter().all(PartitionRow::is_empty));
    }

    #[test]
    fn test_gfx_partition_count() {
        assert_eq!(MI300X.gfx_partition_count(PartitionMode::Spx), 1);
        assert_eq!(MI300X.gfx_partition_count(PartitionMode::Dpx), 2);
        assert_eq!(MI300X.gfx_partition_count(PartitionMode::Qpx), 4);
        assert_eq!(MI300X.gfx_partition_count(PartitionMode::Cpx), 8);
        assert_eq!(MI308X.gfx_partition_count(PartitionMode::Cpx), 4);
        assert_eq!(MI300X.gfx_partition_count(PartitionMode::Tpx), 0);
    }

    #[test]
    fn test_device_lookup() {
        assert_eq!(profile_for_device(0x74A1).map(|p| p.name), Some("MI300X"));
        assert_eq!(profile_for_device(0x74A8).map(|p| p.name), Some("MI308X"));
        assert!(profile_for_device(0x1234).is_none());
    }
}
