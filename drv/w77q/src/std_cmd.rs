// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Legacy (plain) SPI command layer.
//!
//! This exists so the secure engine can bring the device to a known
//! state — autosense, reset, power — and serve plain reads and writes on
//! plain-accessible sections without duplicating transport logic.

use crate::transport::{Platform, SpiTransfer, Trace};
use drv_w77q_api::{
    instr, BusFormat, BusMode, EraseType, PowerState, StdHwVersion, W77qError,
    BLOCK_32K_SIZE, BLOCK_64K_SIZE, LEGACY_PAGE_SIZE, SECTOR_SIZE, WINBOND_MFR_ID,
};

use crate::SecureFlash;

/// Busy-poll budgets, counted in status-register reads. Each read is one
/// SPI transaction, so these bound the wait at roughly the device's
/// worst-case completion times (~2 ms register write, tens of ms per
/// erase block, ~10 s chip erase).
const POLLS_REGISTER_WRITE: u32 = 2_000;
const POLLS_PAGE_PROGRAM: u32 = 5_000;
const POLLS_ERASE: u32 = 500_000;
const POLLS_CHIP_ERASE: u32 = 20_000_000;

/// The manufacturer-id probe is re-read this many times per bus mode; a
/// floating pin can fake one good byte, not four.
const AUTOSENSE_NUM_RETRIES: u32 = 4;

/// SR1/SR2/SR3 bits this layer cares about.
const SR1_BUSY: u8 = 1 << 0;
const SR2_QE: u8 = 1 << 1;
const SR2_SUS: u8 = 1 << 7;
const SR3_HOLD_RST: u8 = 1 << 7;

/// QPI read-parameters byte selecting 8 dummy clocks.
const QPI_READ_PARAMS_8_DUMMY: u8 = 0x30;

impl<'k, P: Platform> SecureFlash<'k, P> {
    /// Executes one legacy command: optional write-enable first, the
    /// command itself, then an optional bounded busy wait.
    pub(crate) fn std_exec(
        &mut self,
        mode: BusMode,
        dtr: bool,
        write_enable: bool,
        wait_polls: Option<u32>,
        cmd: u8,
        addr: Option<u32>,
        data_out: &[u8],
        dummy_cycles: u8,
        data_in: &mut [u8],
    ) -> Result<(), W77qError> {
        // A powered-down device ignores everything except the release.
        if self.powered_down && cmd != instr::RELEASE_POWER_DOWN {
            return Err(W77qError::CommandIgnored);
        }

        if write_enable {
            let we = SpiTransfer::cmd_only(mode, instr::WRITE_ENABLE);
            self.transfer(&we, &mut [])?;
        }

        let xfer = SpiTransfer {
            mode,
            dtr,
            cmd,
            addr: addr.map(|a| (a, 3)),
            data_out,
            dummy_cycles,
        };
        self.transfer(&xfer, data_in)?;

        if let Some(polls) = wait_polls {
            self.std_wait_while_busy(mode, polls)?;
        }
        Ok(())
    }

    fn std_wait_while_busy(&mut self, mode: BusMode, polls: u32) -> Result<(), W77qError> {
        for _ in 0..polls {
            let sr1 = self.std_read_status(mode, instr::READ_STATUS_1)?;
            if sr1 & SR1_BUSY == 0 {
                return Ok(());
            }
        }
        Err(W77qError::CommandIgnored)
    }

    fn std_read_status(&mut self, mode: BusMode, cmd: u8) -> Result<u8, W77qError> {
        let mut sr = [0u8; 1];
        let xfer = SpiTransfer {
            mode,
            dtr: false,
            cmd,
            addr: None,
            data_out: &[],
            dummy_cycles: 0,
        };
        self.transfer(&xfer, &mut sr)?;
        Ok(sr[0])
    }

    fn std_write_status(
        &mut self,
        mode: BusMode,
        cmd: u8,
        value: u8,
    ) -> Result<(), W77qError> {
        self.std_exec(
            mode,
            false,
            true,
            Some(POLLS_REGISTER_WRITE),
            cmd,
            None,
            &[value],
            0,
            &mut [],
        )
    }

    /// Probes `mode` by reading the manufacturer id several times in that
    /// mode; all reads must agree on the Winbond byte.
    fn autosense_check(&mut self, mode: BusMode) -> bool {
        let (cmd, dummy) = match mode {
            BusMode::Quad1_4_4 => (instr::MFR_DEVICE_ID_QUAD, 6),
            BusMode::Dual1_2_2 => (instr::MFR_DEVICE_ID_DUAL, 4),
            BusMode::Single | BusMode::Qpi => (instr::MFR_DEVICE_ID, 0),
            _ => return false,
        };

        for _ in 0..AUTOSENSE_NUM_RETRIES {
            let mut id = [0u8; 1];
            let xfer = SpiTransfer {
                mode,
                dtr: false,
                cmd,
                addr: Some((0, 3)),
                data_out: &[],
                dummy_cycles: dummy,
            };
            // A transport error here just means "not this mode".
            if self.transfer(&xfer, &mut id).is_err() || id[0] != WINBOND_MFR_ID {
                self.platform.trace(Trace::AutoSense { mode, ok: false });
                return false;
            }
        }
        self.platform.trace(Trace::AutoSense { mode, ok: true });
        true
    }

    /// Finds the bus mode the device currently answers in, fastest mode
    /// first.
    pub(crate) fn std_autosense(&mut self) -> Result<BusMode, W77qError> {
        // Release power down in case the device sleeps; also knocks the
        // device out of continuous-read mode.
        self.std_exec(
            BusMode::Single,
            false,
            false,
            None,
            instr::RELEASE_POWER_DOWN,
            None,
            &[],
            0,
            &mut [],
        )?;

        for mode in [BusMode::Quad1_4_4, BusMode::Dual1_2_2, BusMode::Single] {
            if self.autosense_check(mode) {
                return Ok(mode);
            }
        }

        // Maybe the device is parked in QPI: release power down with a
        // quad command byte and probe once more.
        self.std_exec(
            BusMode::Qpi,
            false,
            false,
            None,
            instr::RELEASE_POWER_DOWN,
            None,
            &[],
            0,
            &mut [],
        )?;
        if self.autosense_check(BusMode::Qpi) {
            return Ok(BusMode::Qpi);
        }

        Err(W77qError::ConnectivityErr)
    }

    fn std_enter_exit_qpi(&mut self, enter: bool) -> Result<(), W77qError> {
        if enter {
            self.std_exec(
                self.bus.mode,
                false,
                false,
                None,
                instr::ENTER_QPI,
                None,
                &[],
                0,
                &mut [],
            )?;
            // Pin the QPI fast-read dummy count the driver assumes.
            self.std_exec(
                BusMode::Qpi,
                false,
                false,
                None,
                instr::SET_READ_PARAMETERS,
                None,
                &[QPI_READ_PARAMS_8_DUMMY],
                0,
                &mut [],
            )
        } else {
            self.std_exec(
                BusMode::Qpi,
                false,
                false,
                None,
                instr::EXIT_QPI,
                None,
                &[],
                0,
                &mut [],
            )
        }
    }

    /// Legacy half of `set_interface`: QPI transitions and the recorded
    /// data-path mode.
    pub(crate) fn std_set_interface(&mut self, format: BusFormat) -> Result<(), W77qError> {
        if format.mode == BusMode::Invalid {
            return Err(W77qError::InvalidParameter);
        }

        let current = self.bus.mode;
        if format.switch_qpi && format.mode != current {
            if format.mode == BusMode::Qpi {
                self.std_enter_exit_qpi(true)?;
            } else if current == BusMode::Qpi {
                self.std_enter_exit_qpi(false)?;
            }
        } else if !format.switch_qpi
            && (format.mode == BusMode::Qpi) != (current == BusMode::Qpi)
            && current != BusMode::Invalid
        {
            return Err(W77qError::NotSupported);
        }

        self.bus.mode = format.mode;
        self.bus.dtr = format.dtr;
        self.platform.trace(Trace::Interface {
            mode: format.mode,
            dtr: format.dtr,
        });
        Ok(())
    }

    fn std_read_cmd(&self) -> Result<(u8, u8), W77qError> {
        // (command, dummy cycles) per mode; DTR has its own opcode set.
        Ok(match (self.bus.mode, self.bus.dtr) {
            (BusMode::Single, false) => (instr::FAST_READ, 8),
            (BusMode::Dual1_1_2, false) => (instr::FAST_READ_DUAL_OUT, 8),
            (BusMode::Dual1_2_2, false) => (instr::FAST_READ_DUAL_IO, 4),
            (BusMode::Quad1_1_4, false) => (instr::FAST_READ_QUAD_OUT, 8),
            (BusMode::Quad1_4_4, false) => (instr::FAST_READ_QUAD_IO, 6),
            (BusMode::Qpi, false) => (instr::FAST_READ, 8),
            (BusMode::Single, true) | (BusMode::Qpi, true) => (instr::FAST_READ_DTR, 8),
            (BusMode::Dual1_2_2, true) => (instr::FAST_READ_DUAL_IO_DTR, 8),
            (BusMode::Quad1_4_4, true) => (instr::FAST_READ_QUAD_IO_DTR, 8),
            _ => return Err(W77qError::NotSupported),
        })
    }

    pub(crate) fn std_read(
        &mut self,
        buf: &mut [u8],
        logical_addr: u32,
    ) -> Result<(), W77qError> {
        let (cmd, dummy) = self.std_read_cmd()?;
        self.std_exec(
            self.bus.mode,
            self.bus.dtr,
            false,
            None,
            cmd,
            Some(logical_addr),
            &[],
            dummy,
            buf,
        )
    }

    pub(crate) fn std_write(
        &mut self,
        mut data: &[u8],
        mut logical_addr: u32,
    ) -> Result<(), W77qError> {
        while !data.is_empty() {
            // Stop at the next page boundary; page program wraps within
            // the page otherwise.
            let page_room = LEGACY_PAGE_SIZE - (logical_addr as usize % LEGACY_PAGE_SIZE);
            let chunk = page_room.min(data.len());
            let (head, rest) = data.split_at(chunk);

            self.std_exec(
                self.bus.mode,
                false,
                true,
                Some(POLLS_PAGE_PROGRAM),
                instr::PAGE_PROGRAM,
                Some(logical_addr),
                head,
                0,
                &mut [],
            )?;

            data = rest;
            logical_addr += chunk as u32;
        }
        Ok(())
    }

    pub(crate) fn std_perform_erase(
        &mut self,
        erase: EraseType,
        logical_addr: u32,
        blocking: bool,
    ) -> Result<(), W77qError> {
        let (cmd, addr, polls) = match erase {
            EraseType::Sector4K => (instr::SECTOR_ERASE, Some(logical_addr), POLLS_ERASE),
            EraseType::Block32K => (instr::BLOCK_ERASE_32K, Some(logical_addr), POLLS_ERASE),
            EraseType::Block64K => (instr::BLOCK_ERASE_64K, Some(logical_addr), POLLS_ERASE),
            EraseType::Chip => (instr::CHIP_ERASE, None, POLLS_CHIP_ERASE),
            EraseType::Section => return Err(W77qError::InvalidParameter),
        };
        self.std_exec(
            self.bus.mode,
            false,
            true,
            blocking.then_some(polls),
            cmd,
            addr,
            &[],
            0,
            &mut [],
        )
    }

    pub(crate) fn std_erase(
        &mut self,
        mut logical_addr: u32,
        mut size: u32,
    ) -> Result<(), W77qError> {
        while size > 0 {
            let (erase, step) = if size >= BLOCK_64K_SIZE && logical_addr % BLOCK_64K_SIZE == 0 {
                (EraseType::Block64K, BLOCK_64K_SIZE)
            } else if size >= BLOCK_32K_SIZE && logical_addr % BLOCK_32K_SIZE == 0 {
                (EraseType::Block32K, BLOCK_32K_SIZE)
            } else {
                (EraseType::Sector4K, SECTOR_SIZE)
            };
            self.std_perform_erase(erase, logical_addr, true)?;
            logical_addr += step;
            size -= step;
        }
        Ok(())
    }

    pub(crate) fn std_erase_suspend(&mut self) -> Result<(), W77qError> {
        self.std_exec(
            self.bus.mode,
            false,
            false,
            Some(POLLS_REGISTER_WRITE),
            instr::ERASE_SUSPEND,
            None,
            &[],
            0,
            &mut [],
        )?;
        // The device refuses the suspend when nothing is in progress.
        let sr2 = self.std_read_status(self.bus.mode, instr::READ_STATUS_2)?;
        if sr2 & SR2_SUS == 0 {
            return Err(W77qError::CommandIgnored);
        }
        Ok(())
    }

    pub(crate) fn std_erase_resume(&mut self, blocking: bool) -> Result<(), W77qError> {
        self.std_exec(
            self.bus.mode,
            false,
            false,
            blocking.then_some(POLLS_ERASE),
            instr::ERASE_RESUME,
            None,
            &[],
            0,
            &mut [],
        )?;
        let sr2 = self.std_read_status(self.bus.mode, instr::READ_STATUS_2)?;
        if sr2 & SR2_SUS != 0 {
            return Err(W77qError::CommandIgnored);
        }
        Ok(())
    }

    pub(crate) fn std_power(&mut self, power: PowerState) -> Result<(), W77qError> {
        match power {
            PowerState::Up => {
                self.std_exec(
                    self.bus.mode,
                    false,
                    false,
                    Some(POLLS_REGISTER_WRITE),
                    instr::RELEASE_POWER_DOWN,
                    None,
                    &[],
                    0,
                    &mut [],
                )?;
                self.powered_down = false;
                self.platform.trace(Trace::PowerUp);
            }
            PowerState::Down => {
                self.std_exec(
                    self.bus.mode,
                    false,
                    false,
                    None,
                    instr::POWER_DOWN,
                    None,
                    &[],
                    0,
                    &mut [],
                )?;
                self.powered_down = true;
                self.platform.trace(Trace::PowerDown);
            }
        }
        Ok(())
    }

    /// Resets the flash device. Unless forced, waits for any in-flight
    /// program/erase to complete first so it cannot corrupt data.
    pub(crate) fn std_reset(&mut self, force: bool) -> Result<(), W77qError> {
        let pre_reset_mode = self.bus.mode;

        // Wake the device; reset while powered down is ignored.
        let _ = self.std_power(PowerState::Up);
        // Reset always brings the part out of power-down, whether or not
        // the release above was answered.
        self.powered_down = false;

        if !force {
            loop {
                let sr1 = self.std_read_status(pre_reset_mode, instr::READ_STATUS_1)?;
                let sr2 = self.std_read_status(pre_reset_mode, instr::READ_STATUS_2)?;
                if sr1 & SR1_BUSY == 0 && sr2 & SR2_SUS == 0 {
                    break;
                }
            }
        }

        // The enable/reset pair must reach the device back to back; any
        // other command in between invalidates the enable latch. The
        // platform transport runs each transaction to completion, so the
        // pair is atomic with respect to this context.
        self.std_exec(
            pre_reset_mode,
            false,
            false,
            None,
            instr::RESET_ENABLE,
            None,
            &[],
            0,
            &mut [],
        )?;
        self.std_exec(
            pre_reset_mode,
            false,
            false,
            None,
            instr::RESET_DEVICE,
            None,
            &[],
            0,
            &mut [],
        )?;
        self.platform.trace(Trace::ResetFlash);

        // Reset drops the device out of QPI. Re-enter before recording
        // the bus width, so a failure leaves the recorded state matching
        // what the device actually speaks.
        if pre_reset_mode == BusMode::Qpi {
            self.bus.mode = BusMode::Quad1_4_4;
            self.bus.secure_format = BusMode::Quad1_1_4;
            self.bus.compute_ops();
            self.std_enter_exit_qpi(true)?;
            self.bus.mode = BusMode::Qpi;
            self.bus.secure_format = BusMode::Qpi;
            self.bus.compute_ops();
        }

        self.suspended = false;
        Ok(())
    }

    pub(crate) fn std_set_quad_enable(&mut self, enable: bool) -> Result<(), W77qError> {
        let sr2 = self.std_read_status(self.bus.mode, instr::READ_STATUS_2)?;
        let new = if enable { sr2 | SR2_QE } else { sr2 & !SR2_QE };
        if new == sr2 {
            return Ok(());
        }
        self.std_write_status(self.bus.mode, instr::WRITE_STATUS_2, new)?;
        let readback = self.std_read_status(self.bus.mode, instr::READ_STATUS_2)?;
        if readback & SR2_QE != new & SR2_QE {
            return Err(W77qError::TestFail);
        }
        Ok(())
    }

    pub(crate) fn std_set_reset_in_enable(&mut self, enable: bool) -> Result<(), W77qError> {
        let sr3 = self.std_read_status(self.bus.mode, instr::READ_STATUS_3)?;
        let new = if enable {
            sr3 | SR3_HOLD_RST
        } else {
            sr3 & !SR3_HOLD_RST
        };
        if new == sr3 {
            return Ok(());
        }
        self.std_write_status(self.bus.mode, instr::WRITE_STATUS_3, new)?;
        let readback = self.std_read_status(self.bus.mode, instr::READ_STATUS_3)?;
        if readback & SR3_HOLD_RST != new & SR3_HOLD_RST {
            return Err(W77qError::TestFail);
        }
        Ok(())
    }

    pub(crate) fn std_get_hw_version(&mut self) -> Result<StdHwVersion, W77qError> {
        let mut jedec = [0u8; 3];
        self.std_exec(
            self.bus.mode,
            false,
            false,
            None,
            instr::READ_JEDEC_ID,
            None,
            &[],
            0,
            &mut jedec,
        )?;

        // Manufacturer byte again, then the device id.
        let mut pair = [0u8; 2];
        self.std_exec(
            self.bus.mode,
            false,
            false,
            None,
            instr::MFR_DEVICE_ID,
            Some(0),
            &[],
            0,
            &mut pair,
        )?;

        Ok(StdHwVersion {
            manufacturer_id: jedec[0],
            memory_type: jedec[1],
            capacity: jedec[2],
            device_id: pair[1],
        })
    }

    pub(crate) fn std_get_unique_id(&mut self) -> Result<u64, W77qError> {
        let mut id = [0u8; 8];
        // Four dummy bytes precede the id on this command.
        self.std_exec(
            self.bus.mode,
            false,
            false,
            None,
            instr::READ_UNIQUE_ID,
            None,
            &[],
            32,
            &mut id,
        )?;
        Ok(u64::from_le_bytes(id))
    }

    /// Multi-family hook: this driver currently only drives secure
    /// parts, but the probe is real — the W77Q family identifies itself
    /// by JEDEC memory type.
    pub(crate) fn std_is_secure_flash(&mut self) -> Result<bool, W77qError> {
        let hw = self.std_get_hw_version()?;
        Ok(hw.memory_type == drv_w77q_api::SECURE_MEMORY_TYPE)
    }
}
