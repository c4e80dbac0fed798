//! # World Switches
//!
//! A world switch is the logical scheduler of one engine family inside one
//! spatial partition. It owns one or more physical blocks that switch
//! together, the context state of the VF it currently holds and, for
//! host-driven policies, the round-robin run list with per-VF time
//! accounting.
//!
//! ```text
//!   RunList (fairness)
//!   ┌──────┬──────┬──────┬──────┐
//!   │ vf0  │ vf1* │ vf2  │ vf3* │    * dummy: slot kept, the PF runs in it
//!   └──────┴──────┴──────┴──────┘
//!     head ──▶ scheduled next, moved to the tail once saved
//! ```

use arrayvec::ArrayVec;
use log::debug;

use valence_core::time::{is_infinite, min_time_slice};
use valence_core::{
    DriverMode, HwSchedMask, MAX_VF_SLOT, SchedBlock, SchedMode, VfContextState, VfId, VfMask,
    WorldSwitchId,
};

/// Consecutive passes a non-busy VF may be skipped in hybrid liquid mode
pub const MAX_VF_SKIP_CNT: u8 = 8;

// =============================================================================
// TIME ACCOUNTING
// =============================================================================

/// Run-time bookkeeping of one VF on one world switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRecord {
    /// Load timestamp of the current slice, 0 when not running
    pub start_us: u64,
    /// Total time spent loaded
    pub total_us: u64,
    /// Slice granted for the current run
    pub last_time_slice: u32,
    /// Accumulated over-run still to be paid back
    pub beyond_time_cycle: i64,
    /// Forgive the next over-run
    pub skip_next_punish: bool,
}

impl TimeRecord {
    /// Begin timing a run
    pub fn start(&mut self, now_us: u64) {
        self.start_us = now_us;
    }

    /// Close the current run and charge any over-run
    pub fn stop(&mut self, now_us: u64) {
        if self.start_us == 0 {
            return;
        }
        self.total_us += now_us.saturating_sub(self.start_us);
        let deadline = self.start_us + self.last_time_slice as u64;
        let over = now_us as i64 - deadline as i64;
        if over > 0 {
            if self.skip_next_punish {
                self.skip_next_punish = false;
            } else {
                self.beyond_time_cycle += over;
            }
        }
        self.start_us = 0;
    }

    /// Forget all accounting
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

// =============================================================================
// RUN LIST
// =============================================================================

/// One slot of the run list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunEntry {
    /// Slot is linked into the run order
    pub listed: bool,
    /// Granted slice
    pub time_slice: u32,
    /// Fairness placeholder: the VF is absent, the PF runs in its slot
    pub dummy: bool,
    /// Passes skipped in hybrid liquid mode
    pub skip_cnt: u8,
    /// Time accounting
    pub record: TimeRecord,
}

/// Round-robin order of a host-scheduled world switch
#[derive(Debug, Clone)]
pub struct RunList {
    order: ArrayVec<VfId, MAX_VF_SLOT>,
    entries: [RunEntry; MAX_VF_SLOT],
    fairness: bool,
}

impl RunList {
    /// Empty list
    pub fn new(fairness: bool) -> Self {
        Self {
            order: ArrayVec::new(),
            entries: [RunEntry::default(); MAX_VF_SLOT],
            fairness,
        }
    }

    /// Whether debt-based fairness applies
    #[inline]
    pub fn is_fairness(&self) -> bool {
        self.fairness
    }

    /// Slot of `vf`
    #[inline]
    pub fn entry(&self, vf: VfId) -> &RunEntry {
        &self.entries[vf.index()]
    }

    /// Mutable slot of `vf`
    #[inline]
    pub fn entry_mut(&mut self, vf: VfId) -> &mut RunEntry {
        &mut self.entries[vf.index()]
    }

    /// Link `vf` at the tail
    pub fn push_back(&mut self, vf: VfId) {
        if self.entries[vf.index()].listed {
            return;
        }
        self.entries[vf.index()].listed = true;
        // Capacity equals the slot count and a slot is listed at most once
        let _ = self.order.try_push(vf);
    }

    /// Unlink `vf`
    pub fn unlink(&mut self, vf: VfId) {
        if let Some(pos) = self.order.iter().position(|&v| v == vf) {
            self.order.remove(pos);
        }
        self.entries[vf.index()].listed = false;
    }

    /// Move `vf` to the tail if listed
    pub fn move_to_tail(&mut self, vf: VfId) {
        if let Some(pos) = self.order.iter().position(|&v| v == vf) {
            self.order.remove(pos);
            let _ = self.order.try_push(vf);
        }
    }

    /// First VF in order
    #[inline]
    pub fn front(&self) -> Option<VfId> {
        self.order.first().copied()
    }

    /// Last VF in order
    #[inline]
    pub fn back(&self) -> Option<VfId> {
        self.order.last().copied()
    }

    /// Run order
    pub fn order(&self) -> &[VfId] {
        &self.order
    }

    /// Whether any non-dummy VF is listed
    pub fn has_runnable(&self) -> bool {
        self.order.iter().any(|vf| !self.entries[vf.index()].dummy)
    }

    /// Slice the entry of `vf` is granted this turn
    ///
    /// With fairness, over-run is paid back out of the next slices. A VF in
    /// debt for a whole slice is skipped (returns 0); a partially indebted
    /// VF still gets at least half a slice. Dummy slots charge the PF entry.
    pub fn calculate_time_slice(&mut self, vf: VfId) -> u32 {
        let own = self.entries[vf.index()];
        let time_slice = own.time_slice as i64;
        let min = min_time_slice(own.time_slice) as i64;
        let fairness = self.fairness;
        let entry = if own.dummy {
            &mut self.entries[VfId::PF.index()]
        } else {
            &mut self.entries[vf.index()]
        };
        let rec = &mut entry.record;

        if !fairness {
            rec.last_time_slice = entry.time_slice;
            return rec.last_time_slice;
        }

        if is_infinite(entry.time_slice) {
            rec.beyond_time_cycle = 0;
            rec.last_time_slice = entry.time_slice;
            return rec.last_time_slice;
        }

        let left = time_slice - rec.beyond_time_cycle;
        if left <= 0 {
            rec.last_time_slice = 0;
            rec.beyond_time_cycle -= entry.time_slice as i64;
            debug!("{vf}: skipped, in debt");
        } else if left <= min {
            rec.last_time_slice = min as u32;
            rec.beyond_time_cycle = min - left;
            debug!("{vf}: punished {}us", time_slice - min);
        } else {
            rec.last_time_slice = left as u32;
            rec.beyond_time_cycle = 0;
        }
        if own.dummy {
            rec.beyond_time_cycle = 0;
        }
        rec.last_time_slice
    }

    /// Pick the next VF round-robin
    ///
    /// Returns `(vf, slice)`. An inactive PF at the head is rotated away,
    /// VFs with no slice left this turn are rotated to the tail, and a
    /// fairness dummy hands its slot to the PF.
    pub fn schedule_default(&mut self, pf_active: bool) -> Option<(VfId, u32)> {
        // Every skip pays down at least one slice of debt, so the walk ends;
        // the bound only catches all-zero slices.
        let bound = self.order.len() * 4 + 1;
        for _ in 0..bound {
            let mut vf = self.front()?;
            if vf.is_pf() && !pf_active {
                self.move_to_tail(vf);
                vf = self.front()?;
            }
            let ts = self.calculate_time_slice(vf);
            if ts == 0 {
                self.move_to_tail(vf);
                continue;
            }
            if self.fairness && self.entries[vf.index()].dummy {
                debug!("{vf}: dummy slot, PF runs {ts}us");
                self.move_to_tail(vf);
                return Some((VfId::PF, ts));
            }
            return Some((vf, ts));
        }
        None
    }

    /// Pick the next VF, preferring VFs with pending work
    ///
    /// `busy` is the set of inited VFs with outstanding work or whose last
    /// slice expired. A listed VF without work is passed over at most
    /// [`MAX_VF_SKIP_CNT`] times in a row.
    pub fn schedule_liquid(&mut self, busy: VfMask, pf_active: bool) -> Option<(VfId, u32)> {
        let head = self.front()?;
        if head.is_pf() && !pf_active {
            self.move_to_tail(head);
        }
        let mut pick = self.front()?;
        if !busy.is_empty() {
            let order = self.order.clone();
            let last = order.len() - 1;
            for (pos, &vf) in order.iter().enumerate() {
                if busy.contains(vf) {
                    pick = vf;
                    break;
                }
                if pos == last {
                    debug!("no busy vf in the run list, taking the head");
                    pick = order[0];
                    break;
                }
                if vf.is_pf() && !pf_active {
                    continue;
                }
                let entry = &mut self.entries[vf.index()];
                if entry.skip_cnt >= MAX_VF_SKIP_CNT {
                    pick = vf;
                    break;
                }
                entry.skip_cnt += 1;
            }
        }
        let entry = &mut self.entries[pick.index()];
        entry.skip_cnt = 0;
        Some((pick, entry.time_slice))
    }
}

// =============================================================================
// WORLD SWITCH
// =============================================================================

/// Logical scheduler of one engine family in one partition
#[derive(Debug, Clone)]
pub struct WorldSwitch {
    /// World switch id
    pub id: WorldSwitchId,
    /// Engine family
    pub sched_block: SchedBlock,
    /// Scheduling policy
    pub sched_mode: SchedMode,
    /// Driver mode of every block it owns
    pub mode: DriverMode,
    /// Participates in scheduling
    pub enabled: bool,
    /// Blocks that switch together
    pub hw_sched_mask: HwSchedMask,
    /// VFs this world switch may schedule
    pub allowed_vfs: VfMask,
    /// Blocks advance in lock-step
    pub bulk: bool,
    /// Graphics world switch serving a single VF
    pub single_vf: bool,
    /// Scheduling is running
    pub switch_running: bool,
    /// VF the world switch holds
    pub curr_idx_vf: VfId,
    /// Context state of `curr_idx_vf`
    pub curr_vf_state: VfContextState,
    /// VFs whose context was initialized on this world switch
    pub vf_inited: VfMask,
    /// VFs with outstanding work, last sampled
    pub vf_busy: VfMask,
    /// VFs whose last slice expired
    pub vf_timeout: VfMask,
    /// Re-notify a running single-VF world switch on the next start
    pub self_switch_trigger: bool,
    /// Packed time-quanta option programmed on the blocks
    pub time_quanta_option: u32,
    /// Host round-robin state
    pub run_list: RunList,
}

impl WorldSwitch {
    /// Fresh world switch holding the PF with nothing resident
    pub fn new(id: WorldSwitchId, sched_block: SchedBlock, sched_mode: SchedMode) -> Self {
        Self {
            id,
            sched_block,
            sched_mode,
            mode: sched_mode.driver_mode(),
            enabled: true,
            hw_sched_mask: HwSchedMask::EMPTY,
            allowed_vfs: VfMask::EMPTY,
            bulk: false,
            single_vf: false,
            switch_running: false,
            curr_idx_vf: VfId::PF,
            curr_vf_state: VfContextState::Clear,
            vf_inited: VfMask::EMPTY,
            vf_busy: VfMask::EMPTY,
            vf_timeout: VfMask::EMPTY,
            self_switch_trigger: false,
            time_quanta_option: 0,
            run_list: RunList::new(sched_mode == SchedMode::Fairness),
        }
    }

    /// Graphics world switch
    #[inline]
    pub fn is_gfx(&self) -> bool {
        self.sched_block.is_gfx()
    }

    /// Firmware-scheduled world switch
    #[inline]
    pub fn is_auto(&self) -> bool {
        self.mode == DriverMode::Auto
    }

    /// Seed the run list
    ///
    /// Fairness lists every allowed VF as a dummy slot up front; the PF
    /// entry carries the slice but is not listed. Other policies start
    /// empty.
    pub fn init_run_list(&mut self, default_slice: u32) {
        self.run_list = RunList::new(self.sched_mode == SchedMode::Fairness);
        if self.run_list.is_fairness() {
            for vf in self.allowed_vfs.without_pf().iter() {
                let entry = self.run_list.entry_mut(vf);
                entry.time_slice = default_slice;
                entry.dummy = true;
                self.run_list.push_back(vf);
            }
        }
        self.run_list.entry_mut(VfId::PF).time_slice = default_slice;
        self.vf_inited = VfMask::EMPTY;
        self.vf_busy = VfMask::EMPTY;
        self.vf_timeout = VfMask::EMPTY;
        self.self_switch_trigger = false;
    }

    /// Exactly one VF (PF excluded) inited among `vfs`
    pub fn is_one_active_vf(&self, vfs: VfMask) -> bool {
        (self.vf_inited & vfs).without_pf().count() == 1
    }
}
