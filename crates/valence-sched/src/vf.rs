//! # VF Scheduling Table
//!
//! Fixed array of per-VF scheduling records, PF included at [`VfId::PF`].

use static_assertions::const_assert_eq;

use valence_core::{
    AutoRun, HwSchedMask, MAX_NUM_HW_SCHED, MAX_VF_SLOT, PF_IDX, SchedBlock, VfId, VfMask,
    VfSchedState, WorldSwitchId, WorldSwitchMask,
};

// The PF record closes the table
const_assert_eq!(PF_IDX, MAX_VF_SLOT - 1);

// =============================================================================
// FULL ACCESS RECORD
// =============================================================================

/// Full-access bookkeeping of one VF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FullAccessRecord {
    /// VF currently holds full access
    pub active: bool,
    /// When full access was granted
    pub start_us: u64,
    /// Time consumed by the current grant
    pub used_us: u64,
    /// Budget of one grant
    pub allowed_us: u64,
    /// Overrun already reported for the current grant
    pub overrun_reported: bool,
}

// =============================================================================
// VF RECORD
// =============================================================================

/// Scheduling record of one VF slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfSchedInfo {
    /// Lifecycle state
    pub state: VfSchedState,
    /// Participates in firmware scheduling
    pub auto_run: AutoRun,
    /// Stop runs at Load for this VF
    pub skip_run: bool,
    /// World switches this VF is routed to
    pub world_switch_mask: WorldSwitchMask,
    /// Blocks this VF is routed to
    pub hw_sched_mask: HwSchedMask,
    /// Compute dies this VF is routed to
    pub xcc_mask: u32,
    /// World switch per sched block
    pub ws_map: [Option<WorldSwitchId>; SchedBlock::COUNT],
    /// Blocks per sched block
    pub block_map: [HwSchedMask; SchedBlock::COUNT],
    /// Time slice per sched block
    pub time_slice_us: [u32; SchedBlock::COUNT],
    /// Time-quanta index per block
    pub time_quanta_index: [u8; MAX_NUM_HW_SCHED],
    /// Full access bookkeeping
    pub full_access: FullAccessRecord,
}

impl VfSchedInfo {
    /// Unallocated slot
    pub const fn new() -> Self {
        Self {
            state: VfSchedState::Unavailable,
            auto_run: AutoRun::Disabled,
            skip_run: false,
            world_switch_mask: WorldSwitchMask::EMPTY,
            hw_sched_mask: HwSchedMask::EMPTY,
            xcc_mask: 0,
            ws_map: [None; SchedBlock::COUNT],
            block_map: [HwSchedMask::EMPTY; SchedBlock::COUNT],
            time_slice_us: [0; SchedBlock::COUNT],
            time_quanta_index: [0; MAX_NUM_HW_SCHED],
            full_access: FullAccessRecord {
                active: false,
                start_us: 0,
                used_us: 0,
                allowed_us: 0,
                overrun_reported: false,
            },
        }
    }

    /// Drop every routing entry
    pub fn clear_routing(&mut self) {
        self.world_switch_mask = WorldSwitchMask::EMPTY;
        self.hw_sched_mask = HwSchedMask::EMPTY;
        self.xcc_mask = 0;
        self.ws_map = [None; SchedBlock::COUNT];
        self.block_map = [HwSchedMask::EMPTY; SchedBlock::COUNT];
    }

    /// In the run list
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state == VfSchedState::Active
    }
}

// =============================================================================
// VF TABLE
// =============================================================================

/// Records for every VF slot
#[derive(Debug, Clone)]
pub struct VfTable {
    entries: [VfSchedInfo; MAX_VF_SLOT],
}

impl VfTable {
    /// Every slot unallocated
    pub const fn new() -> Self {
        Self {
            entries: [VfSchedInfo::new(); MAX_VF_SLOT],
        }
    }

    /// Record of `vf`
    #[inline]
    pub fn get(&self, vf: VfId) -> &VfSchedInfo {
        &self.entries[vf.index()]
    }

    /// Mutable record of `vf`
    #[inline]
    pub fn get_mut(&mut self, vf: VfId) -> &mut VfSchedInfo {
        &mut self.entries[vf.index()]
    }

    /// VFs whose lifecycle state is `state`
    pub fn in_state(&self, state: VfSchedState) -> VfMask {
        VfId::all().filter(|vf| self.get(*vf).state == state).collect()
    }

    /// VFs flagged for firmware scheduling
    pub fn auto_run_mask(&self) -> VfMask {
        VfId::all()
            .filter(|vf| self.get(*vf).auto_run == AutoRun::Enabled)
            .collect()
    }

    /// VFs currently holding full access
    pub fn full_access_mask(&self) -> VfMask {
        VfId::all().filter(|vf| self.get(*vf).full_access.active).collect()
    }

    /// Whether no VF (PF excluded) is allocated
    pub fn all_vfs_unavailable(&self) -> bool {
        VfId::vfs().all(|vf| self.get(vf).state == VfSchedState::Unavailable)
    }

    /// Drop routing of every slot
    pub fn clear_routing(&mut self) {
        for entry in &mut self.entries {
            entry.clear_routing();
        }
    }

    /// Iterate over `(vf, record)`
    pub fn iter(&self) -> impl Iterator<Item = (VfId, &VfSchedInfo)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (VfId::from_index(index), entry))
    }
}
