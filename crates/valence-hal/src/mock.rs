//! # Simulated GPUIOV
//!
//! Deterministic stand-in for the register layer. Time is virtual: it only
//! moves when the scheduler calls [`Clock::delay_us`], so timeouts are
//! reproducible and cost no wall-clock time.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use valence_core::{
    Error, HwSchedId, MAX_NUM_HW_SCHED, MAX_VF_SLOT, Result, SchedMode, VfId, VfMask,
};

use crate::cmd::{ActiveFcnStatus, CmdStatus, GpuIovCmd};
use crate::iov::{Clock, GpuIov};

/// Default time a command takes to complete
pub const DEFAULT_LATENCY_US: u64 = 20;

/// One command observed by the mock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockCmd {
    /// Target block
    pub block: HwSchedId,
    /// Command
    pub cmd: GpuIovCmd,
    /// VF argument
    pub vf: VfId,
}

#[derive(Debug, Clone, Copy)]
struct BlockRegs {
    pending: Option<(GpuIovCmd, VfId, u64)>,
    status: CmdStatus,
    hung: bool,
    latency_us: u64,
    active_vf: VfId,
    active_vfs: VfMask,
    active_status: ActiveFcnStatus,
    busy: VfMask,
    time_quanta_option: u32,
    auto_mode: Option<SchedMode>,
    fail_auto_stop: bool,
}

impl BlockRegs {
    const fn new() -> Self {
        Self {
            pending: None,
            status: CmdStatus::Done,
            hung: false,
            latency_us: DEFAULT_LATENCY_US,
            active_vf: VfId::PF,
            active_vfs: VfMask::EMPTY,
            active_status: ActiveFcnStatus::Idle,
            busy: VfMask::EMPTY,
            time_quanta_option: 0,
            auto_mode: None,
            fail_auto_stop: false,
        }
    }

    fn retire(&mut self, now: u64) -> bool {
        match self.pending {
            None => true,
            Some(_) if self.hung => false,
            Some((cmd, vf, done_at)) if now >= done_at => {
                self.pending = None;
                self.status = CmdStatus::Done;
                match cmd {
                    GpuIovCmd::Init | GpuIovCmd::Load | GpuIovCmd::Run => {
                        self.active_vf = vf;
                        self.active_status = ActiveFcnStatus::Active;
                    },
                    GpuIovCmd::Idle => self.active_status = ActiveFcnStatus::Idle,
                    GpuIovCmd::Save => self.active_status = ActiveFcnStatus::Save,
                    GpuIovCmd::Shutdown => self.active_status = ActiveFcnStatus::Idle,
                    GpuIovCmd::EnableAuto => self.active_status = ActiveFcnStatus::Active,
                    GpuIovCmd::DisableAuto => self.active_status = ActiveFcnStatus::Save,
                    GpuIovCmd::ContextSwitch => self.active_vf = vf,
                }
                true
            },
            Some(_) => false,
        }
    }
}

struct MockState {
    regs: [BlockRegs; MAX_NUM_HW_SCHED],
    time_quanta_index: [[u32; MAX_NUM_HW_SCHED]; MAX_VF_SLOT],
    log: Vec<MockCmd>,
}

/// Simulated GPUIOV register layer
pub struct MockGpuIov {
    clock: AtomicU64,
    state: Mutex<MockState>,
}

impl core::fmt::Debug for MockGpuIov {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MockGpuIov")
            .field("now_us", &self.clock.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MockGpuIov {
    /// Mock with every block idle and the PF resident
    pub fn new() -> Self {
        Self {
            clock: AtomicU64::new(1),
            state: Mutex::new(MockState {
                regs: [BlockRegs::new(); MAX_NUM_HW_SCHED],
                time_quanta_index: [[0; MAX_NUM_HW_SCHED]; MAX_VF_SLOT],
                log: Vec::new(),
            }),
        }
    }

    /// Make every command on `block` hang forever
    pub fn hang(&self, block: HwSchedId) {
        self.state.lock().regs[block.index()].hung = true;
    }

    /// Undo [`MockGpuIov::hang`]
    pub fn unhang(&self, block: HwSchedId) {
        self.state.lock().regs[block.index()].hung = false;
    }

    /// Set the completion latency of `block`
    pub fn set_latency(&self, block: HwSchedId, us: u64) {
        self.state.lock().regs[block.index()].latency_us = us;
    }

    /// Override the VF the block reports as active
    pub fn set_active_vf(&self, block: HwSchedId, vf: VfId) {
        self.state.lock().regs[block.index()].active_vf = vf;
    }

    /// Override the active-function status of `block`
    pub fn set_active_status(&self, block: HwSchedId, status: ActiveFcnStatus) {
        self.state.lock().regs[block.index()].active_status = status;
    }

    /// Make `wait_auto_sched_stop` fail on `block`
    pub fn fail_auto_stop(&self, block: HwSchedId) {
        self.state.lock().regs[block.index()].fail_auto_stop = true;
    }

    /// Set VFs with pending work on `block`
    pub fn set_busy(&self, block: HwSchedId, busy: VfMask) {
        self.state.lock().regs[block.index()].busy = busy;
    }

    /// Policy programmed on `block`, if any
    pub fn auto_mode(&self, block: HwSchedId) -> Option<SchedMode> {
        self.state.lock().regs[block.index()].auto_mode
    }

    /// Time-quanta index programmed for `vf` on `block`
    pub fn time_quanta_index(&self, vf: VfId, block: HwSchedId) -> u32 {
        self.state.lock().time_quanta_index[vf.index()][block.index()]
    }

    /// Every command issued so far
    pub fn commands(&self) -> Vec<MockCmd> {
        self.state.lock().log.clone()
    }

    /// Commands issued to `block`
    pub fn commands_for(&self, block: HwSchedId) -> Vec<(GpuIovCmd, VfId)> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|c| c.block == block)
            .map(|c| (c.cmd, c.vf))
            .collect()
    }

    /// Forget the command log
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }
}

impl Clock for MockGpuIov {
    fn now_us(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    fn delay_us(&self, us: u64) {
        self.clock.fetch_add(us.max(1), Ordering::AcqRel);
    }
}

impl GpuIov for MockGpuIov {
    fn set_cmd(&self, cmd: GpuIovCmd, block: HwSchedId, vf: VfId, _next_vf: Option<VfId>) {
        let now = self.now_us();
        let mut state = self.state.lock();
        state.log.push(MockCmd { block, cmd, vf });
        let regs = &mut state.regs[block.index()];
        regs.pending = Some((cmd, vf, now + regs.latency_us));
        regs.status = CmdStatus::Pending;
    }

    fn is_cmd_complete(&self, block: HwSchedId) -> bool {
        let now = self.now_us();
        self.state.lock().regs[block.index()].retire(now)
    }

    fn cmd_status(&self, block: HwSchedId) -> CmdStatus {
        self.state.lock().regs[block.index()].status
    }

    fn get_active_vf_idx(&self, block: HwSchedId) -> Result<VfId> {
        Ok(self.state.lock().regs[block.index()].active_vf)
    }

    fn get_active_vfs(&self, block: HwSchedId) -> Result<VfMask> {
        Ok(self.state.lock().regs[block.index()].active_vfs)
    }

    fn set_active_vfs(&self, block: HwSchedId, vfs: VfMask) -> Result<()> {
        self.state.lock().regs[block.index()].active_vfs = vfs;
        Ok(())
    }

    fn get_time_quanta_option(&self, block: HwSchedId) -> Result<u32> {
        Ok(self.state.lock().regs[block.index()].time_quanta_option)
    }

    fn set_time_quanta_option(&self, block: HwSchedId, option: u32) -> Result<()> {
        self.state.lock().regs[block.index()].time_quanta_option = option;
        Ok(())
    }

    fn set_time_quanta_index(&self, vf: VfId, block: HwSchedId, index: u32) -> Result<()> {
        if index > 3 {
            return Err(Error::InvalidParameter);
        }
        self.state.lock().time_quanta_index[vf.index()][block.index()] = index;
        Ok(())
    }

    fn wait_auto_sched_stop(&self, block: HwSchedId) -> Result<()> {
        if self.state.lock().regs[block.index()].fail_auto_stop {
            Err(Error::IovCmdTimeout)
        } else {
            Ok(())
        }
    }

    fn get_active_vf_status(&self, block: HwSchedId) -> Result<ActiveFcnStatus> {
        Ok(self.state.lock().regs[block.index()].active_status)
    }

    fn config_auto_sched_mode(&self, block: HwSchedId, mode: SchedMode) -> Result<()> {
        self.state.lock().regs[block.index()].auto_mode = Some(mode);
        Ok(())
    }

    fn auto_sched_add_vf(&self, block: HwSchedId, vf: VfId) -> Result<()> {
        self.state.lock().regs[block.index()].active_vfs.insert(vf);
        Ok(())
    }

    fn auto_sched_remove_vf(&self, block: HwSchedId, vf: VfId) -> Result<()> {
        self.state.lock().regs[block.index()].active_vfs.remove(vf);
        Ok(())
    }

    fn get_vm_busy_status(&self, block: HwSchedId) -> Result<VfMask> {
        Ok(self.state.lock().regs[block.index()].busy)
    }

    fn dump_cmd_status(&self, block: HwSchedId) {
        let state = self.state.lock();
        let regs = &state.regs[block.index()];
        log::error!(
            "{block}: pending {:?} status {} active {}",
            regs.pending.map(|(cmd, vf, _)| (cmd, vf)),
            regs.status.name(),
            regs.active_vf
        );
    }
}
