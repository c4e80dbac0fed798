//! # ASIC Scheduler Tables
//!
//! Static description of the hardware scheduler blocks of an ASIC and of
//! the spatial partition rows routing VFs onto them.

use bitflags::bitflags;

use valence_core::{
    HwSchedClass, HwSchedId, HwSchedMask, MAX_NUM_PARTITION, PartitionMode, SchedBlock,
    SchedMode, VfMask,
};

pub mod mi300;

bitflags! {
    /// Scheduling policies a block supports
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlockCaps: u32 {
        /// Firmware frame loop
        const FRAME_LOOP    = 1 << SchedMode::FrameLoop as u32;
        /// Firmware solid slices
        const SOLID         = 1 << SchedMode::Solid as u32;
        /// Firmware liquid slices
        const LIQUID        = 1 << SchedMode::Liquid as u32;
        /// Host fairness
        const FAIRNESS      = 1 << SchedMode::Fairness as u32;
        /// Host round robin
        const ROUND_ROBIN   = 1 << SchedMode::RoundRobin as u32;
        /// Host hybrid liquid
        const HYBRID_LIQUID = 1 << SchedMode::HybridLiquid as u32;
    }
}

impl BlockCaps {
    /// Whether `mode` is supported
    #[inline]
    pub const fn supports(self, mode: SchedMode) -> bool {
        self.bits() & (1 << mode as u32) != 0
    }
}

/// Immutable identity of one hardware scheduler block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwSchedBlockDesc {
    /// Register block name
    pub name: &'static str,
    /// Engine class
    pub class: HwSchedClass,
    /// Engine family
    pub sched_block: SchedBlock,
    /// Policy programmed at init
    pub default_mode: SchedMode,
    /// Instance of this engine family
    pub instance: u8,
    /// Supported policies
    pub caps: BlockCaps,
}

impl HwSchedBlockDesc {
    /// Whether this is a graphics block
    #[inline]
    pub const fn is_gfx(&self) -> bool {
        matches!(self.class, HwSchedClass::Gfx)
    }
}

/// One spatial partition row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionRow {
    /// VFs routed to this partition
    pub idx_vf_mask: VfMask,
    /// Blocks of this partition
    pub hw_sched_mask: HwSchedMask,
}

impl PartitionRow {
    /// Row that routes nothing
    pub const EMPTY: Self = Self {
        idx_vf_mask: VfMask::EMPTY,
        hw_sched_mask: HwSchedMask::EMPTY,
    };

    /// Whether the row routes nothing
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.hw_sched_mask.is_empty()
    }
}

/// Partition rows for every partition mode
pub type PartitionTable = [[PartitionRow; MAX_NUM_PARTITION]; 5];

/// Scheduler description of one ASIC
#[derive(Debug)]
pub struct AsicProfile {
    /// Marketing name
    pub name: &'static str,
    /// Blocks in id order
    pub blocks: &'static [HwSchedBlockDesc],
    /// Partition rows per mode
    pub partitions: &'static PartitionTable,
    /// Id of the first graphics block; XCC masks are relative to it
    pub first_gfx_block: HwSchedId,
}

impl AsicProfile {
    /// Number of blocks
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Descriptor of `block`
    #[inline]
    pub fn block(&self, block: HwSchedId) -> Option<&HwSchedBlockDesc> {
        self.blocks.get(block.index())
    }

    /// Partition rows for `mode`
    #[inline]
    pub fn rows(&self, mode: PartitionMode) -> &[PartitionRow; MAX_NUM_PARTITION] {
        &self.partitions[mode.index()]
    }

    /// Number of partitions carrying graphics blocks in `mode`
    pub fn gfx_partition_count(&self, mode: PartitionMode) -> u32 {
        let gfx = self.class_mask(HwSchedClass::Gfx);
        self.rows(mode)
            .iter()
            .filter(|row| row.hw_sched_mask.intersects(gfx))
            .count() as u32
    }

    /// Blocks of `class`
    pub fn class_mask(&self, class: HwSchedClass) -> HwSchedMask {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, desc)| desc.class == class)
            .map(|(id, _)| HwSchedId::from_index(id))
            .collect()
    }
}

/// Build a block mask from raw ids at compile time
pub(crate) const fn mask_of(ids: &[u8]) -> HwSchedMask {
    let mut bits = 0u32;
    let mut i = 0;
    while i < ids.len() {
        bits |= 1 << ids[i];
        i += 1;
    }
    HwSchedMask::from_bits(bits)
}

/// Partition row for VF `vf` (plus the PF) on blocks `ids`
pub(crate) const fn row(vf: u32, ids: &[u8]) -> PartitionRow {
    PartitionRow {
        idx_vf_mask: VfMask::from_bits((1 << vf) | (1 << valence_core::PF_IDX)),
        hw_sched_mask: mask_of(ids),
    }
}
