// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus interface state and secure-opcode derivation.
//!
//! The three secure opcodes encode the instruction-lines nibble of the
//! active bus mode and the DTR bit; they are rebuilt whenever the
//! interface changes. OP1 (write input buffer) never runs in DTR.

use drv_w77q_api::BusMode;

/// Opcode nibbles of the three secure instructions.
const OP0_POLL_STATUS: u8 = 0x0;
const OP1_WRITE_INPUT: u8 = 0x1;
const OP2_READ_OUTPUT: u8 = 0x2;

/// Dummy cycles for the OP2 output-buffer read, mode-independent.
pub const OP2_DUMMY_CYCLES: u8 = 8;

fn make_op(inst: u8, mode: BusMode, dtr: bool) -> u8 {
    inst | mode.lines_mask() | ((dtr as u8) << 2)
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct BusInterface {
    pub mode: BusMode,
    pub dtr: bool,
    /// Narrowed mode used for secure commands; not every data mode has a
    /// secure variant.
    pub secure_format: BusMode,
    pub op0: u8,
    pub op1: u8,
    pub op2: u8,
    /// Claimed at connect, released at disconnect.
    pub locked: bool,
}

impl BusInterface {
    /// Secure commands run single, 1-1-2, 1-1-4 or QPI; the richer
    /// address-phase modes collapse onto their data width.
    pub fn secure_format_for(mode: BusMode) -> Option<BusMode> {
        match mode {
            BusMode::Single => Some(BusMode::Single),
            BusMode::Dual1_1_2 | BusMode::Dual1_2_2 => Some(BusMode::Dual1_1_2),
            BusMode::Quad1_1_4 | BusMode::Quad1_4_4 => Some(BusMode::Quad1_1_4),
            BusMode::Qpi => Some(BusMode::Qpi),
            BusMode::Invalid => None,
        }
    }

    pub fn compute_ops(&mut self) {
        self.op0 = make_op(OP0_POLL_STATUS, self.secure_format, self.dtr);
        self.op1 = make_op(OP1_WRITE_INPUT, self.secure_format, false);
        self.op2 = make_op(OP2_READ_OUTPUT, self.secure_format, self.dtr);
    }

    /// OP0 dummy cycles are part-configured: 32 in SDR, 16 in DTR.
    pub fn op0_dummy_cycles(&self) -> u8 {
        if self.dtr {
            16
        } else {
            32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_derivation() {
        let mut bus = BusInterface {
            mode: BusMode::Quad1_4_4,
            dtr: false,
            secure_format: BusInterface::secure_format_for(BusMode::Quad1_4_4).unwrap(),
            ..Default::default()
        };
        bus.compute_ops();
        assert_eq!(bus.secure_format, BusMode::Quad1_1_4);
        assert_eq!(bus.op0, 0xD0);
        assert_eq!(bus.op1, 0xD1);
        assert_eq!(bus.op2, 0xD2);

        bus.dtr = true;
        bus.compute_ops();
        // DTR flag rides on bit 2, except for OP1 which stays SDR.
        assert_eq!(bus.op0, 0xD4);
        assert_eq!(bus.op1, 0xD1);
        assert_eq!(bus.op2, 0xD6);
        assert_eq!(bus.op0_dummy_cycles(), 16);
    }

    #[test]
    fn secure_format_narrowing() {
        assert_eq!(
            BusInterface::secure_format_for(BusMode::Dual1_2_2),
            Some(BusMode::Dual1_1_2)
        );
        assert_eq!(
            BusInterface::secure_format_for(BusMode::Qpi),
            Some(BusMode::Qpi)
        );
        assert_eq!(BusInterface::secure_format_for(BusMode::Invalid), None);
    }
}
