// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver core for the Winbond W77Q secure NOR flash.
//!
//! The driver mediates every interaction with the device: it frames the
//! three-opcode secure SPI protocol, keeps the host's transaction counter
//! in lock-step with the device, derives session keys, signs every secure
//! command, verifies the signatures on sensitive reads, and refuses to
//! drive the device's secure state machine into an error it can see
//! coming.
//!
//! One [`SecureFlash`] owns all state for one physical device and is not
//! internally synchronized; the device is claimed with `connect` and
//! released with `disconnect`. The host supplies a [`Platform`]
//! implementation for the SPI transport and the few services the engine
//! cannot provide itself.

#![cfg_attr(not(test), no_std)]

mod bus;
pub mod crypto;
mod engine;
mod keys;
mod sec_cmd;
mod std_cmd;
pub mod transport;

pub use transport::{Platform, SpiTransfer, Trace, TransportError};

use bus::BusInterface;
use crypto::Prng;
use drv_w77q_api::{ResetStatus, Ssr, W77qError, NUM_SECTIONS, SECTION_BASE_GRANULARITY};
use keys::KeyManager;

/// What the driver tracks about each section between syncs.
#[derive(Copy, Clone, Debug, Default)]
struct SectionState {
    /// Section length is 64 KiB << tag.
    size_tag: u8,
    enabled: bool,
    /// Plain access granted at some point in this session lifetime;
    /// cleared by reset.
    plain_enabled: bool,
}

impl SectionState {
    fn size_bytes(&self) -> u32 {
        SECTION_BASE_GRANULARITY << self.size_tag
    }
}

/// Host shadow of the device's monotonic counters.
#[derive(Copy, Clone, Debug, Default)]
struct MonotonicCounter {
    tc: u32,
    dmc: u32,
    /// When set, `tc`/`dmc` equal what the device will stamp into the
    /// next accepted secure command.
    in_sync: bool,
}

/// Driver state for one W77Q device.
pub struct SecureFlash<'k, P: Platform> {
    platform: P,
    bus: BusInterface,
    wid: u64,
    mc: MonotonicCounter,
    /// Legacy logical-address offset width, in bits.
    addr_size: u8,
    sections: [SectionState; NUM_SECTIONS],
    suspended: bool,
    powered_down: bool,
    /// Set while a paged secure read/write is in flight, so transports
    /// may keep their command cache warm between pages.
    multi_transaction: bool,
    watchdog_secure: bool,
    watchdog_section: u8,
    /// Cached SSR. The BUSY bit doubles as "cache invalid".
    ssr: Ssr,
    keys: KeyManager<'k>,
    prng: Prng,
    reset_status: ResetStatus,
    user_data: u32,
}

impl<'k, P: Platform> SecureFlash<'k, P> {
    /// Creates a cleared driver context around `platform`. Nothing is
    /// sent on the wire until `connect` + `init_device`.
    pub fn new(platform: P) -> Self {
        let mut ssr = Ssr(0);
        // Mark the SSR cache dirty so the first reader fetches it.
        ssr.set_busy(true);

        Self {
            platform,
            bus: BusInterface::default(),
            wid: 0,
            mc: MonotonicCounter::default(),
            addr_size: 0,
            sections: [SectionState::default(); NUM_SECTIONS],
            suspended: false,
            powered_down: false,
            multi_transaction: false,
            watchdog_secure: false,
            watchdog_section: NUM_SECTIONS as u8,
            ssr,
            keys: KeyManager::new(),
            prng: Prng::new(),
            reset_status: ResetStatus::default(),
            user_data: 0,
        }
    }

    /// Access to the platform, mainly so tests can reach their fixture.
    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn user_data(&self) -> u32 {
        self.user_data
    }

    pub fn set_user_data(&mut self, value: u32) {
        self.user_data = value;
    }

    /// Driver version string.
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Claims the bus for this context.
    pub fn connect(&mut self) -> Result<(), W77qError> {
        if self.bus.locked {
            return Err(W77qError::IncorrectState);
        }
        self.bus.locked = true;
        Ok(())
    }

    /// Releases the bus. Refused while a session is open: the session
    /// key would be stranded on the device.
    pub fn disconnect(&mut self) -> Result<(), W77qError> {
        if !self.bus.locked {
            return Err(W77qError::NotConnected);
        }
        if self.keys.session_is_open() {
            return Err(W77qError::IncorrectState);
        }
        self.bus.locked = false;
        Ok(())
    }

    /// One framed transfer through the platform. The single choke point
    /// for the connected check and transport-error mapping.
    pub(crate) fn transfer(
        &mut self,
        xfer: &SpiTransfer<'_>,
        data_in: &mut [u8],
    ) -> Result<(), W77qError> {
        if !self.bus.locked {
            return Err(W77qError::NotConnected);
        }
        self.platform
            .spi_transfer(xfer, data_in)
            .map_err(|_| W77qError::ConnectivityErr)
    }

    /// Secure commands are ignored by the device while it is powered
    /// down or a legacy erase/write is suspended; fail fast host-side.
    pub(crate) fn check_active(&self) -> Result<(), W77qError> {
        if self.powered_down || self.suspended {
            return Err(W77qError::CommandIgnored);
        }
        Ok(())
    }
}
