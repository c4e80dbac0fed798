//! # Firmware-Driven World Switches
//!
//! World switches in FrameLoop, Solid or Liquid mode hand their blocks to
//! the firmware scheduler. The driver only programs which VFs take part,
//! the time quanta they get and the policy, then enables or disables
//! firmware scheduling.
//!
//! Time quanta are packed four to a register, one byte per index in
//! milliseconds. A VF is pointed at the first index wide enough for its
//! slice; a slice no index covers takes over index 3.

use log::{debug, info, warn};

use valence_core::{
    AutoRun, Error, HwSchedMask, Result, SchedFlags, VfContextState, VfId, VfMask,
    WorldSwitchId,
};
use valence_hal::GpuIov;

use crate::scheduler::Scheduler;
use crate::world_switch::WorldSwitch;

/// Quanta index rewritten when no index fits
const SPARE_QUANTA_INDEX: u32 = 3;

/// Pick the quanta index for a `quanta` ms slice out of a packed option
///
/// Returns `(index, option)`; the option changes only when index 3 had to
/// be rewritten.
pub fn select_time_quanta(option: u32, quanta: u8) -> (u32, u32) {
    for index in 0..4 {
        let slot = (option >> (index * 8)) as u8;
        if quanta <= slot {
            return (index, option);
        }
    }
    let shift = SPARE_QUANTA_INDEX * 8;
    let option = (option & !(0xFF << shift)) | ((quanta as u32) << shift);
    (SPARE_QUANTA_INDEX, option)
}

impl<H: GpuIov> Scheduler<H> {
    /// Quanta index for a `ts` slice on `ws`, reprogramming the packed
    /// option when it changed
    fn program_time_quanta(&self, ws: &mut WorldSwitch, ts: u32) -> Result<u32> {
        let quanta = (ts / 1_000).min(u8::MAX as u32) as u8;
        if quanta == 0 {
            return Ok(0);
        }
        let (index, option) = {
            let mut adapter = self.quanta.lock();
            let slot = &mut adapter[ws.sched_block.index()];
            let picked = select_time_quanta(*slot, quanta);
            *slot = picked.1;
            picked
        };
        if ws.time_quanta_option != option {
            debug!("{}: time quanta option {:#010x}", ws.id, option);
            for block in ws.hw_sched_mask.iter() {
                self.iov.set_time_quanta_option(block, option)?;
            }
            ws.time_quanta_option = option;
        }
        Ok(index)
    }

    fn set_quanta_index(&self, ws: &WorldSwitch, vf: VfId, index: u32) -> Result<()> {
        for block in ws.hw_sched_mask.iter() {
            self.iov.set_time_quanta_index(vf, block, index)?;
        }
        let mut vfs = self.vfs.write();
        let info = vfs.get_mut(vf);
        for block in ws.hw_sched_mask.iter() {
            info.time_quanta_index[block.index()] = index as u8;
        }
        Ok(())
    }

    /// Let the firmware scheduler of `ws` run `vf`
    pub(crate) fn auto_add_vf(&self, ws: &mut WorldSwitch, vf: VfId) -> Result<()> {
        let ts = self.vfs.read().get(vf).time_slice_us[ws.sched_block.index()];
        let index = self.program_time_quanta(ws, ts)?;
        self.set_quanta_index(ws, vf, index)?;
        for block in ws.hw_sched_mask.iter() {
            self.iov.auto_sched_add_vf(block, vf)?;
        }
        self.vfs.write().get_mut(vf).auto_run = AutoRun::Enabled;
        ws.self_switch_trigger = self.config.flags.contains(SchedFlags::SELF_SWITCH_TRIGGER);
        debug!("{}: {vf} added to firmware scheduling at quanta {index}", ws.id);
        Ok(())
    }

    pub(crate) fn auto_remove_vf(&self, ws: &mut WorldSwitch, vf: VfId) -> Result<()> {
        ws.vf_inited.remove(vf);
        self.vfs.write().get_mut(vf).auto_run = AutoRun::Disabled;
        let mut failed = HwSchedMask::EMPTY;
        for block in ws.hw_sched_mask.iter() {
            if let Err(e) = self.iov.auto_sched_remove_vf(block, vf) {
                warn!("{block}: {vf} not removed from firmware scheduling: {e}");
                failed.insert(block);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Failure)
        }
    }

    /// Reprogram the quanta of `vfs` after their slices changed
    ///
    /// Only graphics world switches honour per-VF slices under firmware
    /// scheduling.
    pub(crate) fn auto_update_time_slice(&self, ws: &mut WorldSwitch, vfs: VfMask) -> Result<()> {
        if !ws.is_gfx() {
            return Ok(());
        }
        for vf in vfs.iter() {
            let ts = self.vfs.read().get(vf).time_slice_us[ws.sched_block.index()];
            let index = self.program_time_quanta(ws, ts)?;
            self.set_quanta_index(ws, vf, index)?;
        }
        self.config_auto_sched(ws)
    }

    /// Program the policy and quanta of `ws`, restarting firmware
    /// scheduling around it if it was running
    pub(crate) fn config_auto_sched(&self, ws: &mut WorldSwitch) -> Result<()> {
        if !ws.enabled {
            return Ok(());
        }
        let was_running = ws.switch_running;
        if was_running {
            self.pause_auto(ws)?;
            ws.switch_running = false;
        }
        for block in ws.hw_sched_mask.iter() {
            self.iov.config_auto_sched_mode(block, ws.sched_mode)?;
            self.iov.set_time_quanta_option(block, ws.time_quanta_option)?;
        }
        if was_running {
            self.run_auto(ws, None)?;
            ws.switch_running = true;
        }
        Ok(())
    }

    pub(crate) fn auto_start(&self, ws: &mut WorldSwitch) -> Result<()> {
        let restart = ws.switch_running;
        if restart {
            if !(ws.self_switch_trigger && ws.single_vf) {
                return Ok(());
            }
            info!("{}: self switch retrigger", ws.id);
            ws.self_switch_trigger = false;
        }
        if !ws.is_state_ok() {
            info!("{}: abnormal, left stopped", ws.id);
            return Ok(());
        }

        let started = self.start_firmware(ws, restart);
        if let Err(e) = started {
            warn!("{}: firmware scheduling did not start: {e}", ws.id);
            self.events.queue_reset(ws.curr_idx_vf, ws.sched_block);
            return Err(e);
        }

        if let Some(first) = ws.hw_sched_mask.first() {
            ws.curr_idx_vf = self.blocks.snapshot(first)?.vf;
        }
        ws.curr_vf_state = VfContextState::Loaded;
        ws.switch_running = true;
        Ok(())
    }

    fn start_firmware(&self, ws: &mut WorldSwitch, restart: bool) -> Result<()> {
        if restart {
            self.pause_auto(ws)?;
        }
        for block in ws.hw_sched_mask.iter() {
            self.iov.config_auto_sched_mode(block, ws.sched_mode)?;
        }
        self.run_auto(ws, None)
    }

    pub(crate) fn auto_stop(&self, ws: &mut WorldSwitch) -> Result<()> {
        if !ws.switch_running && ws.curr_vf_state != VfContextState::Loaded {
            return Ok(());
        }

        let mut result = Ok(());
        if !ws.is_state_ok() {
            // Firmware kept switching after the fault
            if let Some(first) = ws.hw_sched_mask.first() {
                let hw_vf = self.iov.get_active_vf_idx(first)?;
                info!("{}: hardware holds {hw_vf}", ws.id);
                ws.curr_idx_vf = hw_vf;
                for block in ws.hw_sched_mask.iter() {
                    self.blocks.try_claim(block)?.vf = hw_vf;
                }
            }
        } else if let Err(e) = self.pause_auto(ws) {
            warn!("{}: firmware scheduling did not stop: {e}", ws.id);
            ws.curr_vf_state = VfContextState::Abnormal;
            result = Err(e);
        } else {
            ws.curr_vf_state = VfContextState::Saved;
        }

        let vf = ws.curr_idx_vf;
        self.stop_record(ws, vf);
        ws.switch_running = false;
        result
    }

    /// Reprogram the firmware policy of one world switch
    pub fn config_world_switch(&self, id: WorldSwitchId) -> Result<()> {
        let topo = self.topo();
        let mut ws = topo.ws(id)?;
        if !ws.is_auto() {
            return Err(Error::NotSupported);
        }
        self.config_auto_sched(&mut ws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{hw, mi300x, shared, vf};
    use valence_core::{GpuState, SchedBlock, SchedConfig, SchedMode};
    use valence_hal::GpuIovCmd;

    fn solid() -> Scheduler<valence_hal::mock::MockGpuIov> {
        shared(SchedConfig::default().with_gfx_mode(SchedMode::Solid))
    }

    #[test]
    fn test_select_time_quanta() {
        assert_eq!(select_time_quanta(0x0606_0606, 6), (0, 0x0606_0606));
        assert_eq!(select_time_quanta(0x1008_0402, 5), (2, 0x1008_0402));
        assert_eq!(select_time_quanta(0x0606_0606, 10), (3, 0x0A06_0606));
        assert_eq!(select_time_quanta(0xFFFF_FFFF, 255), (0, 0xFFFF_FFFF));
    }

    #[test]
    fn test_add_vf_joins_firmware_scheduling() {
        let sched = mi300x(8);
        sched.add_vf(vf(1)).unwrap();
        let vcn = sched.ws_of(vf(1), SchedBlock::Vcn).unwrap();
        let block = sched.world_switch(vcn).unwrap().hw_sched_mask.first().unwrap();
        assert!(sched.iov().get_active_vfs(block).unwrap().contains(vf(1)));
        assert_eq!(sched.iov().time_quanta_index(vf(1), block), 0);
        assert_eq!(sched.vfs.read().get(vf(1)).auto_run, AutoRun::Enabled);

        sched.remove_vf(vf(1)).unwrap();
        assert!(!sched.iov().get_active_vfs(block).unwrap().contains(vf(1)));
        assert_eq!(sched.vfs.read().get(vf(1)).auto_run, AutoRun::Disabled);
    }

    #[test]
    fn test_long_slice_rewrites_spare_index() {
        let sched = solid();
        sched.add_vf(vf(1)).unwrap();
        sched.set_time_slice(Some(vf(1)), 10_000, SchedBlock::Gfx).unwrap();

        assert_eq!(sched.iov().time_quanta_index(vf(1), hw(1)), 3);
        assert_eq!(sched.iov().time_quanta_index(vf(1), hw(2)), 3);
        assert_eq!(sched.iov().get_time_quanta_option(hw(2)).unwrap(), 0x0A06_0606);
        assert_eq!(sched.vfs.read().get(vf(1)).time_quanta_index[2], 3);
        let gfx = sched.ws_of(vf(1), SchedBlock::Gfx).unwrap();
        assert_eq!(sched.world_switch(gfx).unwrap().time_quanta_option, 0x0A06_0606);
    }

    #[test]
    fn test_start_and_stop() {
        let sched = solid();
        sched.add_vf(vf(0)).unwrap();
        let gfx = sched.ws_of(vf(0), SchedBlock::Gfx).unwrap();
        sched.start_world_switch(gfx).unwrap();

        assert_eq!(sched.iov().commands_for(hw(1)), [(GpuIovCmd::EnableAuto, vf(0))]);
        assert_eq!(sched.iov().auto_mode(hw(1)), Some(SchedMode::Solid));
        assert_eq!(sched.block_state(hw(2)).unwrap().gpu_state, GpuState::EnableAuto);
        let ws = sched.world_switch(gfx).unwrap();
        assert!(ws.switch_running);
        assert_eq!(ws.curr_vf_state, VfContextState::Loaded);

        sched.stop_world_switch(gfx).unwrap();
        let ws = sched.world_switch(gfx).unwrap();
        assert!(!ws.switch_running);
        assert_eq!(ws.curr_vf_state, VfContextState::Saved);
        assert_eq!(sched.block_state(hw(1)).unwrap().gpu_state, GpuState::Save);
        assert!(
            sched
                .iov()
                .commands_for(hw(1))
                .contains(&(GpuIovCmd::DisableAuto, vf(0)))
        );
    }

    #[test]
    fn test_failed_stop_marks_abnormal() {
        let sched = solid();
        sched.add_vf(vf(0)).unwrap();
        let gfx = sched.ws_of(vf(0), SchedBlock::Gfx).unwrap();
        sched.start_world_switch(gfx).unwrap();
        sched.iov().fail_auto_stop(hw(1));

        assert!(sched.stop_world_switch(gfx).is_err());
        let ws = sched.world_switch(gfx).unwrap();
        assert_eq!(ws.curr_vf_state, VfContextState::Abnormal);
        assert!(!ws.switch_running);
    }

    #[test]
    fn test_abnormal_stop_reads_resident_vf() {
        let sched = solid();
        sched.add_vf(vf(0)).unwrap();
        let gfx = sched.ws_of(vf(0), SchedBlock::Gfx).unwrap();
        sched.start_world_switch(gfx).unwrap();
        sched.set_vf_abnormal(vf(0), Some(SchedBlock::Gfx)).unwrap();
        sched.iov().set_active_vf(hw(1), vf(2));
        sched.iov().clear_log();

        sched.stop_world_switch(gfx).unwrap();
        assert!(sched.iov().commands().is_empty());
        let ws = sched.world_switch(gfx).unwrap();
        assert_eq!(ws.curr_idx_vf, vf(2));
        assert_eq!(sched.block_state(hw(2)).unwrap().vf, vf(2));
    }

    #[test]
    fn test_config_restarts_running_switch() {
        let sched = solid();
        sched.add_vf(vf(0)).unwrap();
        let gfx = sched.ws_of(vf(0), SchedBlock::Gfx).unwrap();
        sched.start_world_switch(gfx).unwrap();
        sched.iov().clear_log();

        sched.config_world_switch(gfx).unwrap();
        let cmds = sched.iov().commands_for(hw(1));
        assert_eq!(cmds.first(), Some(&(GpuIovCmd::DisableAuto, vf(0))));
        assert_eq!(cmds.last(), Some(&(GpuIovCmd::EnableAuto, vf(0))));
        assert!(sched.world_switch(gfx).unwrap().switch_running);

        let manual = shared(SchedConfig::default());
        let id = manual.ws_of(vf(0), SchedBlock::Gfx).unwrap();
        assert_eq!(manual.config_world_switch(id).unwrap_err(), Error::NotSupported);
    }
}
