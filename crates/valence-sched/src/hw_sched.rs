//! # Hardware Scheduler Blocks
//!
//! Arena of physical scheduler blocks. Each block carries its acknowledged
//! state, the per-VF state cache for that block, and the non-blocking lock
//! that serializes transitions on it.

use arrayvec::ArrayVec;
use spin::{Mutex, MutexGuard};

use valence_core::{
    DriverMode, Error, GpuState, HwSchedId, HwSchedMask, MAX_NUM_HW_SCHED, MAX_VF_SLOT, Result,
    VfId,
};
use valence_hal::{AsicProfile, GpuIovCmd, HwSchedBlockDesc};

// =============================================================================
// STATE
// =============================================================================

/// Acknowledged state of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwSchedState {
    /// Last state hardware acknowledged
    pub gpu_state: GpuState,
    /// VF the block holds
    pub vf: VfId,
    /// Switching mode
    pub mode: DriverMode,
    /// Last state each VF reached on this block
    pub vf_cache: [GpuState; MAX_VF_SLOT],
    /// Last command issued, for dumps
    pub last_cmd: Option<GpuIovCmd>,
}

impl HwSchedState {
    /// Power-on state: shut down, PF resident
    pub const fn new(mode: DriverMode) -> Self {
        Self {
            gpu_state: GpuState::Shutdown,
            vf: VfId::PF,
            mode,
            vf_cache: [GpuState::Shutdown; MAX_VF_SLOT],
            last_cmd: None,
        }
    }

    /// Cached state of `vf` on this block
    #[inline]
    pub fn cached(&self, vf: VfId) -> GpuState {
        self.vf_cache[vf.index()]
    }

    /// Whether the block sits at `state` for `vf`
    #[inline]
    pub fn is_at(&self, state: GpuState, vf: VfId) -> bool {
        self.gpu_state == state && self.vf == vf
    }

    /// Record an acknowledged transition
    pub fn land(&mut self, state: GpuState, vf: VfId) {
        self.gpu_state = state;
        self.vf = vf;
        self.vf_cache[vf.index()] = state;
    }
}

/// Exclusive ownership of one block for the duration of a transition
pub type BlockGuard<'a> = MutexGuard<'a, HwSchedState>;

// =============================================================================
// BLOCK TABLE
// =============================================================================

/// One physical scheduler block
#[derive(Debug)]
pub struct HwSchedBlock {
    /// Block id
    pub id: HwSchedId,
    /// Static description
    pub desc: HwSchedBlockDesc,
    state: Mutex<HwSchedState>,
}

/// All blocks of the GPU, indexed by id
#[derive(Debug)]
pub struct HwSchedTable {
    blocks: ArrayVec<HwSchedBlock, MAX_NUM_HW_SCHED>,
}

impl HwSchedTable {
    /// Build the table from a static ASIC description
    pub fn from_profile(asic: &AsicProfile) -> Result<Self> {
        if asic.blocks.len() > MAX_NUM_HW_SCHED {
            return Err(Error::CapacityExceeded);
        }
        let blocks = asic
            .blocks
            .iter()
            .enumerate()
            .map(|(index, desc)| HwSchedBlock {
                id: HwSchedId::from_index(index),
                desc: *desc,
                state: Mutex::new(HwSchedState::new(desc.default_mode.driver_mode())),
            })
            .collect();
        Ok(Self { blocks })
    }

    /// Number of blocks
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the table is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Every block id
    pub fn all(&self) -> HwSchedMask {
        self.blocks.iter().map(|b| b.id).collect()
    }

    /// Block by id
    pub fn get(&self, id: HwSchedId) -> Result<&HwSchedBlock> {
        self.blocks.get(id.index()).ok_or(Error::InvalidHwSched)
    }

    /// Static description of a block
    pub fn desc(&self, id: HwSchedId) -> Result<&HwSchedBlockDesc> {
        self.get(id).map(|b| &b.desc)
    }

    /// Take a block's transition lock without waiting
    ///
    /// A held lock means another transition is in flight on this block,
    /// which can only be a reentrant call.
    pub fn try_claim(&self, id: HwSchedId) -> Result<BlockGuard<'_>> {
        self.get(id)?.state.try_lock().ok_or(Error::WsReentrant)
    }

    /// Take the locks of every block in `mask`, or none of them
    pub fn try_claim_all(
        &self,
        mask: HwSchedMask,
    ) -> Result<ArrayVec<(HwSchedId, BlockGuard<'_>), MAX_NUM_HW_SCHED>> {
        let mut guards = ArrayVec::new();
        for id in mask.iter() {
            // Guards taken so far drop on early return
            let guard = self.try_claim(id)?;
            guards.push((id, guard));
        }
        Ok(guards)
    }

    /// Copy of a block's state
    pub fn snapshot(&self, id: HwSchedId) -> Result<HwSchedState> {
        self.try_claim(id).map(|guard| *guard)
    }

    /// Return a block to its power-on state in `mode`
    pub fn reset(&self, id: HwSchedId, mode: DriverMode) -> Result<()> {
        *self.try_claim(id)? = HwSchedState::new(mode);
        Ok(())
    }

    /// Switch a block's driver mode, keeping its state
    pub fn set_mode(&self, id: HwSchedId, mode: DriverMode) -> Result<()> {
        self.try_claim(id)?.mode = mode;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valence_hal::asic::mi300::MI300X;

    #[test]
    fn test_power_on_state() {
        let table = HwSchedTable::from_profile(&MI300X).unwrap();
        assert_eq!(table.len(), 20);
        let gfx = table.snapshot(HwSchedId::from_index(12)).unwrap();
        assert!(gfx.is_at(GpuState::Shutdown, VfId::PF));
        assert_eq!(gfx.mode, DriverMode::Manual);
        assert!(gfx.vf_cache.iter().all(|s| *s == GpuState::Shutdown));
        let vcn = table.snapshot(HwSchedId::from_index(0)).unwrap();
        assert_eq!(vcn.mode, DriverMode::Auto);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let table = HwSchedTable::from_profile(&MI300X).unwrap();
        let id = HwSchedId::from_index(3);
        let guard = table.try_claim(id).unwrap();
        assert_eq!(table.try_claim(id).unwrap_err(), Error::WsReentrant);
        drop(guard);
        assert!(table.try_claim(id).is_ok());
    }

    #[test]
    fn test_claim_all_releases_on_conflict() {
        let table = HwSchedTable::from_profile(&MI300X).unwrap();
        let held = table.try_claim(HwSchedId::from_index(5)).unwrap();
        let mask = HwSchedMask::from_bits(0b11_1000);
        assert_eq!(table.try_claim_all(mask).unwrap_err(), Error::WsReentrant);
        drop(held);
        // Blocks 3 and 4 were released when the claim failed
        assert_eq!(table.try_claim_all(mask).unwrap().len(), 3);
        assert_eq!(
            table.get(HwSchedId::from_index(30)).unwrap_err(),
            Error::InvalidHwSched
        );
    }
}
