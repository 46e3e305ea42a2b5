// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The platform boundary: one SPI transaction primitive plus the few host
//! services the engine cannot provide itself (hash, entropy, CPU reset).
//!
//! On XIP targets the `spi_transfer` implementation, and anything it
//! calls transitively (including `hash` when hardware-accelerated), must
//! be resident in RAM: a secure write makes the flash unreadable for the
//! duration of the transaction.

use drv_w77q_api::{BusMode, SecCmd, SsrErrors};

/// One framed SPI transaction: command byte, optional address phase,
/// write payload, dummy cycles, then a read phase sized by the caller's
/// `data_in` buffer.
#[derive(Debug)]
pub struct SpiTransfer<'a> {
    pub mode: BusMode,
    pub dtr: bool,
    pub cmd: u8,
    /// Address phase: value and length in bytes.
    pub addr: Option<(u32, u8)>,
    pub data_out: &'a [u8],
    pub dummy_cycles: u8,
}

impl SpiTransfer<'_> {
    pub fn cmd_only(mode: BusMode, cmd: u8) -> Self {
        Self {
            mode,
            dtr: false,
            cmd,
            addr: None,
            data_out: &[],
            dummy_cycles: 0,
        }
    }
}

/// Transport-level failures. The engine maps all of these to
/// `ConnectivityErr`; only autosense retries internally.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportError {
    Bus,
    Timeout,
    InvalidArgument,
}

/// Events the engine reports as it works. Delivered to the platform's
/// `trace` hook; the default sink discards them. There is deliberately no
/// global verbosity switch: each device context traces through its own
/// platform.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    AutoSense { mode: BusMode, ok: bool },
    Interface { mode: BusMode, dtr: bool },
    SecCommand(SecCmd),
    SsrErrors(SsrErrors),
    SessionOpened { kid: u8 },
    SessionClosed,
    McSynced { tc: u32, dmc: u32 },
    PlainAccessEnabled { section: u8 },
    ResetFlash,
    PowerDown,
    PowerUp,
}

/// What the host must supply for one W77Q device.
pub trait Platform {
    /// Performs one framed SPI transaction, filling `data_in` from the
    /// read phase. Implementations must satisfy the device payload
    /// bounds (40/72 bytes out, 44 in) by splitting internally when the
    /// SPI controller is smaller.
    fn spi_transfer(
        &mut self,
        xfer: &SpiTransfer<'_>,
        data_in: &mut [u8],
    ) -> Result<(), TransportError>;

    /// The 256-bit hash the device family specifies. The engine treats
    /// it as opaque.
    fn hash(&mut self, digest: &mut [u8; 32], data: &[u8]);

    /// A non-repeating 64-bit nonce, typically from a hardware TRNG.
    fn nonce(&mut self) -> u64;

    /// Resets the host CPU; the final step of reset flows on
    /// architectures that need it.
    fn cpu_reset(&mut self) {}

    /// Receives engine trace events.
    fn trace(&mut self, _event: Trace) {}
}
