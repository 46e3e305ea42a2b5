// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The secure engine facade: the public operation set.
//!
//! Operations validate arguments and driver state, then lean on the
//! secure command processor for the wire work. Flows that acquire a
//! session release it on every path, including errors.

use crate::bus::BusInterface;
use crate::crypto;
use crate::transport::{Platform, Trace};
use crate::SecureFlash;
use drv_w77q_api::{
    key_is_valid, BusFormat, BusMode, DeviceConfig, DeviceId, DeviceSetup, EraseType, HwVersion,
    HwVerReg, IntegrityCheck, Key, KeyId, Notifications, OpenMode, PowerState, ResetStatus, Scr,
    SectionConfig, SectionInfo, SectionPolicy, SessionAccess, SignedDataType, Smr, Ssr,
    SsrErrors, StdAddrSize, StdHwVersion, Swap, SyncState, W77qError, WatchdogConfig,
    WatchdogThreshold, DMC_EOL_THRESHOLD, FLASH_SIZE, MIN_STD_ADDR_BITS, NUM_SECTIONS,
    SECTION_ALIGNMENT, SECTOR_SIZE, TC_RESET_THRESHOLD,
};
use num_traits::FromPrimitive;

/// Autosense is retried this many times while the device still looks
/// disconnected; it may simply be busy finishing a power-on operation.
const AUTOSENSE_RETRIES: u32 = 16;

/// Post-reset poll budget while the secure module comes up.
const RESET_READY_POLLS: u32 = 100_000;

impl<'k, P: Platform> SecureFlash<'k, P> {
    // --- interface bring-up ---

    /// Applies a bus format to both command layers and rederives the
    /// secure opcodes.
    pub fn set_interface(&mut self, format: BusFormat) -> Result<(), W77qError> {
        self.check_active()?;
        self.std_set_interface(format)?;
        let secure = BusInterface::secure_format_for(format.mode)
            .ok_or(W77qError::NotSupported)?;
        self.bus.secure_format = secure;
        self.bus.compute_ops();
        Ok(())
    }

    /// Brings the device to a known state: autosense when the bus mode
    /// is still unknown, interface selection, sticky-error cleanup,
    /// resume of anything suspended, and a full state sync.
    ///
    /// `format` of `None` keeps whatever autosense found.
    pub fn init_device(&mut self, format: Option<BusFormat>) -> Result<(), W77qError> {
        if self.bus.mode == BusMode::Invalid {
            let mut sensed = Err(W77qError::ConnectivityErr);
            for _ in 0..AUTOSENSE_RETRIES {
                sensed = self.std_autosense();
                if !matches!(sensed, Err(W77qError::ConnectivityErr)) {
                    break;
                }
            }
            sensed?;

            // Sense again: the device may have been busy during the
            // first pass and answered in a slower mode than it supports.
            let mode = self.std_autosense()?;
            self.set_interface(BusFormat::new(mode))?;

            if self.std_is_secure_flash()? {
                // Autosense probing leaves sticky garbage behind. Read
                // the SSR once without checking to clear the latches,
                // then once more to prove they stayed clear.
                self.get_ssr(SsrErrors::empty())?;
                self.get_ssr(SsrErrors::all())?;
            }
        }

        if let Some(format) = format {
            self.set_interface(format)?;
        }

        if self.bus.mode == BusMode::Invalid || self.bus.secure_format == BusMode::Invalid {
            return Err(W77qError::IncorrectState);
        }

        self.std_power(PowerState::Up)?;
        self.std_erase_resume(true)?;
        self.sync_state()
    }

    /// Refreshes everything the driver mirrors from the device.
    pub fn sync_state(&mut self) -> Result<(), W77qError> {
        self.sync_after_reset()?;

        self.wid = self.cmd_get_wid_unsigned()?;

        let gmc = self.get_gmc()?;
        self.addr_size = gmc.devcfg().sect_sel() + MIN_STD_ADDR_BITS;

        let gmt = self.cmd_get_gmt_unsigned()?;
        for section in 0..NUM_SECTIONS {
            let smr = gmt.smr(section);
            self.sections[section].enabled = smr.enabled();
            self.sections[section].size_tag = smr.len_tag();
        }

        let awdt = self.get_awdt_cfg()?;
        self.watchdog_secure = awdt.authenticated();
        self.watchdog_section = awdt.kid();
        Ok(())
    }

    /// Resynchronizes after any flash reset: forget the session and all
    /// plain-access grants, wait for the secure module, and capture why
    /// the device reset.
    pub fn sync_after_reset(&mut self) -> Result<(), W77qError> {
        self.mark_session_closed();
        for section in self.sections.iter_mut() {
            section.plain_enabled = false;
        }

        let mut ready = None;
        for _ in 0..RESET_READY_POLLS {
            match self.get_ssr(SsrErrors::all()) {
                Ok(ssr) if !ssr.busy() => {
                    ready = Some(ssr);
                    break;
                }
                // Not ready yet; sticky bits from the dying moments of
                // the previous epoch get cleared by the read itself.
                _ => continue,
            }
        }
        let ssr = ready.ok_or(W77qError::CommandIgnored)?;

        self.reset_status = ResetStatus {
            power_on_reset: ssr.por(),
            fallback_remap: ssr.fb_remap(),
            watchdog_reset: ssr.awdt_expired(),
        };
        Ok(())
    }

    // --- keys and sessions ---

    pub fn load_key(
        &mut self,
        section: u8,
        key: &'k Key,
        full_access: bool,
    ) -> Result<(), W77qError> {
        self.keys.load_key(section as usize, key, full_access)
    }

    pub fn remove_key(&mut self, section: u8, full_access: bool) -> Result<(), W77qError> {
        self.keys.remove_key(section as usize, full_access)
    }

    pub(crate) fn mark_session_closed(&mut self) {
        if self.keys.session_is_open() {
            self.platform.trace(Trace::SessionClosed);
        }
        self.keys.mark_closed();
        self.mc.in_sync = false;
    }

    /// Opens a session and mirrors the device's open-session side
    /// effect: opening a section with a plain-access policy grants plain
    /// access.
    ///
    /// A stale-SCR open reports `DeviceIntegrityErr` but still leaves
    /// the session open; the caller decides whether that is fatal.
    pub(crate) fn session_open_internal(
        &mut self,
        kid: KeyId,
        key_override: Option<&Key>,
        ignore_scr: bool,
    ) -> Result<(), W77qError> {
        self.sync_mc()?;

        let key = match key_override {
            Some(key) => *key,
            None => *self
                .keys
                .key_for(kid)
                .ok_or(W77qError::InvalidParameter)?,
        };

        let seed = self.platform.nonce();
        self.prng.reseed(seed);
        let host_nonce = self.prng.next();

        let mut mode = OpenMode::INCLUDE_WID;
        if ignore_scr {
            mode |= OpenMode::IGNORE_SCR_VALIDITY;
        }

        let (session_key, integrity_err) =
            self.cmd_session_open(kid, &key, mode, host_nonce)?;
        self.keys.open(kid, session_key);
        self.platform.trace(Trace::SessionOpened { kid: kid.raw() });

        if kid.is_section_key() {
            let section = kid.section();
            let info = self.get_section_configuration(section)?;
            if info.policy.plain_access_read || info.policy.plain_access_write {
                self.sections[section as usize].plain_enabled = true;
                self.platform.trace(Trace::PlainAccessEnabled { section });
            }
        }

        if integrity_err {
            return Err(W77qError::DeviceIntegrityErr);
        }
        Ok(())
    }

    pub(crate) fn session_close_internal(&mut self, revoke_pa: bool) -> Result<(), W77qError> {
        if !self.keys.session_is_open() {
            return Err(W77qError::IncorrectState);
        }
        let kid = self.keys.kid();
        if revoke_pa && !kid.is_section_key() {
            return Err(W77qError::InvalidParameter);
        }
        self.cmd_session_close(kid, revoke_pa)?;
        self.mark_session_closed();
        Ok(())
    }

    pub fn open_session(
        &mut self,
        section: u8,
        access: SessionAccess,
    ) -> Result<(), W77qError> {
        self.check_active()?;
        if section as usize >= NUM_SECTIONS {
            return Err(W77qError::InvalidParameter);
        }
        if self.keys.session_is_open() {
            return Err(W77qError::IncorrectState);
        }
        if !self.sections[section as usize].enabled {
            return Err(W77qError::IncorrectState);
        }

        let (kid, config_only) = match access {
            SessionAccess::Full => (KeyId::full_access(section), false),
            SessionAccess::ConfigOnly => (KeyId::full_access(section), true),
            SessionAccess::Restricted => (KeyId::restricted(section), false),
        };
        self.session_open_internal(kid, None, config_only)
    }

    pub fn close_session(&mut self, section: u8) -> Result<(), W77qError> {
        self.check_active()?;
        if section as usize >= NUM_SECTIONS {
            return Err(W77qError::InvalidParameter);
        }
        if !self.keys.session_is_open() || !self.keys.is_section_session(section) {
            return Err(W77qError::IncorrectState);
        }
        self.session_close_internal(false)
    }

    /// Runs `f` under a device-scoped session, closing it on every path.
    fn with_session<R>(
        &mut self,
        kid: KeyId,
        key: &Key,
        ignore_scr: bool,
        f: impl FnOnce(&mut Self) -> Result<R, W77qError>,
    ) -> Result<R, W77qError> {
        self.session_open_internal(kid, Some(key), ignore_scr)?;
        let result = f(self);
        let close = self.session_close_internal(false);
        match result {
            Ok(value) => close.map(|_| value),
            Err(e) => {
                // The close already ran; the original error wins.
                let _ = close;
                Err(e)
            }
        }
    }

    // --- data path ---

    fn max_legacy_offset(&self) -> u32 {
        1u32 << self.addr_size
    }

    fn max_legacy_sections(&self) -> u32 {
        (FLASH_SIZE >> self.addr_size).min(NUM_SECTIONS as u32)
    }

    fn legacy_address(&self, section: u8, offset: u32) -> u32 {
        ((section as u32) << self.addr_size) | offset
    }

    /// Boot-section aliasing when the device remapped to the fallback
    /// section.
    fn fallback_section(&self, section: u8) -> u8 {
        if self.ssr.fb_remap() {
            match section {
                0 => 7,
                7 => 0,
                other => other,
            }
        } else {
            section
        }
    }

    fn check_secure_range(
        &self,
        section: u8,
        offset: u32,
        size: u32,
    ) -> Result<(), W77qError> {
        if section as usize >= NUM_SECTIONS {
            return Err(W77qError::InvalidParameter);
        }
        let state = &self.sections[section as usize];
        if !state.enabled {
            return Err(W77qError::IncorrectState);
        }
        let end = offset.checked_add(size).ok_or(W77qError::InvalidParameter)?;
        if end > state.size_bytes() {
            return Err(W77qError::ParameterOutOfRange);
        }
        Ok(())
    }

    fn check_legacy_range(
        &mut self,
        section: u8,
        offset: u32,
        size: u32,
    ) -> Result<u8, W77qError> {
        let aliased = self.fallback_section(section);
        let end = offset.checked_add(size).ok_or(W77qError::InvalidParameter)?;
        if end > self.max_legacy_offset() {
            return Err(W77qError::ParameterOutOfRange);
        }
        if (section as u32) >= self.max_legacy_sections() {
            return Err(W77qError::ParameterOutOfRange);
        }
        let state = &self.sections[aliased as usize];
        if !state.enabled {
            return Err(W77qError::IncorrectState);
        }
        if end > state.size_bytes() {
            return Err(W77qError::ParameterOutOfRange);
        }
        if !state.plain_enabled {
            self.plain_access_enable(aliased)?;
        }
        Ok(aliased)
    }

    /// Reads `buf.len()` bytes from `section` at `offset`, through the
    /// secure or plain path. `auth` upgrades secure reads to the
    /// replay-protected authenticated variant.
    pub fn read(
        &mut self,
        buf: &mut [u8],
        section: u8,
        offset: u32,
        secure: bool,
        auth: bool,
    ) -> Result<(), W77qError> {
        self.check_active()?;
        if buf.is_empty() {
            return Err(W77qError::ParameterOutOfRange);
        }
        let size = buf.len() as u32;

        if secure {
            self.check_secure_range(section, offset, size)?;
            self.secure_read(buf, section, offset, auth)
        } else {
            self.check_legacy_range(section, offset, size)?;
            let addr = self.legacy_address(section, offset);
            self.std_read(buf, addr)?;
            self.get_ssr(SsrErrors::all()).map(|_| ())
        }
    }

    /// Writes `data` to `section` at `offset`.
    pub fn write(
        &mut self,
        data: &[u8],
        section: u8,
        offset: u32,
        secure: bool,
    ) -> Result<(), W77qError> {
        self.check_active()?;
        if data.is_empty() {
            return Err(W77qError::ParameterOutOfRange);
        }
        let size = data.len() as u32;

        if secure {
            self.check_secure_range(section, offset, size)?;
            self.secure_write(data, section, offset)
        } else {
            self.check_legacy_range(section, offset, size)?;
            let addr = self.legacy_address(section, offset);
            self.std_write(data, addr)?;
            self.get_ssr(SsrErrors::all()).map(|_| ())
        }
    }

    /// Erases `[offset, offset + size)`, which must be 4 KiB-granular.
    pub fn erase(
        &mut self,
        section: u8,
        offset: u32,
        size: u32,
        secure: bool,
    ) -> Result<(), W77qError> {
        self.check_active()?;
        if size == 0 {
            return Err(W77qError::ParameterOutOfRange);
        }
        if offset % SECTOR_SIZE != 0 {
            return Err(W77qError::InvalidDataAlignment);
        }
        if size % SECTOR_SIZE != 0 {
            return Err(W77qError::InvalidDataSize);
        }

        if secure {
            self.check_secure_range(section, offset, size)?;
            if !self.keys.session_is_open() {
                return Err(W77qError::DeviceSessionErr);
            }
            if !self.keys.is_section_full_access(section) {
                return Err(W77qError::DevicePrivilegeErr);
            }
            self.secure_erase(offset, size)
        } else {
            self.check_legacy_range(section, offset, size)?;
            let addr = self.legacy_address(section, offset);
            self.std_erase(addr, size)?;
            self.get_ssr(SsrErrors::all()).map(|_| ())
        }
    }

    /// Erases a whole section, with either the secure command or the
    /// plain-access variant.
    pub fn erase_section(&mut self, section: u8, secure: bool) -> Result<(), W77qError> {
        self.check_active()?;
        if section as usize >= NUM_SECTIONS {
            return Err(W77qError::InvalidParameter);
        }
        if !self.sections[section as usize].enabled {
            return Err(W77qError::IncorrectState);
        }

        if secure {
            if !self.keys.session_is_open() {
                return Err(W77qError::DeviceSessionErr);
            }
            if !self.keys.is_section_full_access(section) {
                return Err(W77qError::DevicePrivilegeErr);
            }
            self.cmd_serase(EraseType::Section, 0)
        } else {
            if !self.sections[section as usize].plain_enabled {
                self.plain_access_enable(section)?;
            }
            self.cmd_erase_section_plain(section)
        }
    }

    // --- suspend / power / reset / format ---

    pub fn suspend(&mut self) -> Result<(), W77qError> {
        if self.suspended {
            return Err(W77qError::IncorrectState);
        }
        self.std_erase_suspend()?;
        self.suspended = true;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), W77qError> {
        if !self.suspended {
            return Err(W77qError::IncorrectState);
        }
        self.std_erase_resume(false)?;
        self.suspended = false;
        // The device kept counting while we were suspended.
        self.mc.in_sync = false;
        Ok(())
    }

    pub fn power(&mut self, power: PowerState) -> Result<(), W77qError> {
        self.std_power(power)?;
        if power == PowerState::Up {
            // Another host may have talked to the device while we slept.
            self.mc.in_sync = false;
        }
        Ok(())
    }

    /// Resets the flash and resynchronizes the secure state.
    pub fn reset_flash(&mut self) -> Result<(), W77qError> {
        self.std_reset(true)?;
        self.sync_after_reset()
    }

    /// Formats the device. With a master key, uses the secure format
    /// path (or a chip-wide secure erase when only data should go); with
    /// no key, falls back to the plain FORMAT command, which the device
    /// only honors when FORMAT_EN is configured.
    pub fn format(
        &mut self,
        master_key: Option<&Key>,
        erase_data_only: bool,
    ) -> Result<(), W77qError> {
        self.check_active()?;

        match master_key {
            None => {
                if erase_data_only {
                    return Err(W77qError::InvalidParameter);
                }
                self.cmd_format_plain()?;
            }
            Some(key) => {
                if !key_is_valid(key) {
                    return Err(W77qError::InvalidParameter);
                }
                self.with_session(KeyId::DEVICE_MASTER, key, false, |this| {
                    if erase_data_only {
                        this.cmd_serase(EraseType::Chip, 0)
                    } else {
                        this.cmd_secure_format()
                    }
                })?;
            }
        }

        if !erase_data_only {
            for section in self.sections.iter_mut() {
                section.enabled = false;
            }
            self.reset_flash()?;
        }
        Ok(())
    }

    // --- section configuration ---

    pub fn get_section_configuration(
        &mut self,
        section: u8,
    ) -> Result<SectionInfo, W77qError> {
        self.check_active()?;
        if section as usize >= NUM_SECTIONS {
            return Err(W77qError::InvalidParameter);
        }

        let gmt = self.get_gmt()?;
        let smr = gmt.smr(section as usize);
        if !smr.enabled() {
            return Ok(SectionInfo::default());
        }

        let scr = self.get_scr(section)?;
        Ok(SectionInfo {
            base: smr.base_bytes(),
            size: smr.len_bytes(),
            policy: SectionPolicy::from(scr.sspr()),
            digest: scr.digest(),
            crc: scr.checksum(),
            version: scr.version(),
        })
    }

    /// Updates a section's configuration register. Requires a
    /// full-access session on that section; the device closes the
    /// session as a side effect and this wrapper reopens it.
    pub fn config_section(
        &mut self,
        section: u8,
        policy: Option<&SectionPolicy>,
        digest: Option<u64>,
        crc: Option<u32>,
        version: Option<u32>,
        swap: Swap,
    ) -> Result<(), W77qError> {
        if section as usize >= NUM_SECTIONS {
            return Err(W77qError::InvalidParameter);
        }
        self.config_section_internal(section, policy, digest, crc, version, swap)?;
        self.open_session(section, SessionAccess::Full)
    }

    pub(crate) fn config_section_internal(
        &mut self,
        section: u8,
        policy: Option<&SectionPolicy>,
        digest: Option<u64>,
        crc: Option<u32>,
        version: Option<u32>,
        swap: Swap,
    ) -> Result<(), W77qError> {
        self.check_active()?;
        if !self.keys.session_is_open() {
            return Err(W77qError::DeviceSessionErr);
        }
        if !self.keys.is_section_full_access(section) {
            return Err(W77qError::DevicePrivilegeErr);
        }

        if let Some(policy) = policy {
            if policy.checksum_integrity != crc.is_some() {
                return Err(W77qError::InvalidParameter);
            }
            if policy.digest_integrity != digest.is_some() {
                return Err(W77qError::InvalidParameter);
            }

            // Plain-access sections must stay reachable through the
            // legacy address window.
            if (policy.plain_access_read || policy.plain_access_write)
                && (self.sections[section as usize].size_bytes() > self.max_legacy_offset()
                    || (section as u32) >= self.max_legacy_sections())
            {
                return Err(W77qError::InvalidParameter);
            }

            // Checksum-and-rollback on the fallback boot section would
            // make a failed boot unrecoverable while safe fallback is
            // armed.
            if policy.checksum_integrity && policy.rollback_prot && section == 7 {
                let gmc = self.get_gmc()?;
                if gmc.devcfg().fb_en() {
                    return Err(W77qError::InvalidParameter);
                }
            }

            // Rollback keeps its shadow in the upper half, so one block
            // is not enough.
            if policy.rollback_prot {
                let gmt = self.cmd_get_gmt_unsigned()?;
                if gmt.smr(section as usize).len_tag() == 0 {
                    return Err(W77qError::InvalidParameter);
                }
            }
        }

        let mut scr = self.cmd_get_scr_unsigned(section)?;

        match version {
            Some(v) => scr.set_version(v),
            None if scr.version() == u32::MAX => scr.set_version(0),
            None => (),
        }
        if let Some(crc) = crc {
            scr.set_checksum(crc);
        }
        if let Some(digest) = digest {
            scr.set_digest(digest);
        }
        if let Some(policy) = policy {
            scr.set_sspr((*policy).into());
        }

        let sspr_policy = SectionPolicy::from(scr.sspr());
        let needs_init_pa = (sspr_policy.plain_access_read || sspr_policy.plain_access_write)
            && !sspr_policy.auth_plain_access
            && self.sections[section as usize].plain_enabled;

        match swap {
            Swap::None => self.cmd_set_scr(section, &scr, false, false, needs_init_pa)?,
            Swap::Swap => self.cmd_set_scr(section, &scr, true, false, needs_init_pa)?,
            Swap::SwapAndReset => self.cmd_set_scr(section, &scr, true, true, needs_init_pa)?,
        }

        self.sections[section as usize].plain_enabled = needs_init_pa;

        // SET_SCR closes the session on the device side.
        self.mark_session_closed();

        let readback = self.cmd_get_scr_unsigned(section)?;
        if readback != scr {
            return Err(W77qError::TestFail);
        }
        Ok(())
    }

    /// Volatile per-section read/write locks.
    pub fn config_access(
        &mut self,
        section: u8,
        read_enable: bool,
        write_enable: bool,
    ) -> Result<(), W77qError> {
        self.check_active()?;
        if section as usize >= NUM_SECTIONS {
            return Err(W77qError::InvalidParameter);
        }

        let mut aclr = self.cmd_get_aclr()?;
        let bit = 1u8 << section;
        let mut write_lock = aclr.write_lock();
        let mut read_lock = aclr.read_lock();
        if write_enable {
            write_lock &= !bit;
        } else {
            write_lock |= bit;
        }
        if read_enable {
            read_lock &= !bit;
        } else {
            read_lock |= bit;
        }
        aclr.set_write_lock(write_lock);
        aclr.set_read_lock(read_lock);
        self.cmd_set_aclr(aclr.masked())
    }

    // --- plain access ---

    /// Grants plain access to a non-authenticated plain-access section.
    /// Used on demand by the legacy data path.
    pub fn plain_access_enable(&mut self, section: u8) -> Result<(), W77qError> {
        if section as usize >= NUM_SECTIONS {
            return Err(W77qError::InvalidParameter);
        }
        if self.sections[section as usize].plain_enabled {
            return Ok(());
        }
        self.check_active()?;

        let ssr = self.get_ssr(SsrErrors::all())?;
        if ssr.state() & Ssr::STATE_WORKING_MASK != Ssr::STATE_WORKING {
            return Err(W77qError::IncorrectState);
        }

        let gmt = self.cmd_get_gmt_unsigned()?;
        if !gmt.smr(section as usize).enabled() {
            return Err(W77qError::IncorrectState);
        }

        let scr = self.cmd_get_scr_unsigned(section)?;
        let policy = SectionPolicy::from(scr.sspr());
        if !policy.plain_access_read && !policy.plain_access_write {
            return Err(W77qError::DevicePrivilegeErr);
        }
        if policy.auth_plain_access {
            return Err(W77qError::DevicePrivilegeErr);
        }

        self.cmd_init_section_pa(section)?;

        // INIT_SECTION_PA closes any session on the device; reopen ours.
        if self.keys.session_is_open() {
            let kid = self.keys.kid();
            self.mark_session_closed();
            self.session_open_internal(kid, None, false)?;
        }

        self.sections[section as usize].plain_enabled = true;
        self.platform.trace(Trace::PlainAccessEnabled { section });
        Ok(())
    }

    pub fn auth_plain_access_grant(&mut self, section: u8) -> Result<(), W77qError> {
        self.check_active()?;
        if section as usize >= NUM_SECTIONS {
            return Err(W77qError::InvalidParameter);
        }

        let info = self.get_section_configuration(section)?;
        if !info.policy.auth_plain_access {
            return Err(W77qError::InvalidParameter);
        }
        if !info.policy.plain_access_read && !info.policy.plain_access_write {
            return Err(W77qError::DevicePrivilegeErr);
        }

        if !self.sections[section as usize].plain_enabled {
            self.grant_revoke_pa(section, true)?;
        }
        Ok(())
    }

    pub fn auth_plain_access_revoke(&mut self, section: u8) -> Result<(), W77qError> {
        self.check_active()?;
        if section as usize >= NUM_SECTIONS {
            return Err(W77qError::InvalidParameter);
        }

        let info = self.get_section_configuration(section)?;
        if !info.policy.auth_plain_access {
            return Err(W77qError::InvalidParameter);
        }
        if !info.policy.plain_access_read && !info.policy.plain_access_write {
            return Err(W77qError::InvalidParameter);
        }

        if self.sections[section as usize].plain_enabled {
            self.grant_revoke_pa(section, false)?;
        }
        Ok(())
    }

    fn grant_revoke_pa(&mut self, section: u8, grant: bool) -> Result<(), W77qError> {
        // A session on another section is restored afterwards; a session
        // on this very section short-circuits.
        let mut previous = None;
        if self.keys.session_is_open() {
            let kid = self.keys.kid();
            if kid.is_section_key() {
                let open_section = kid.section();
                if open_section == section {
                    if !grant {
                        self.session_close_internal(true)?;
                    }
                    return Ok(());
                }
                let access = if self.keys.is_section_full_access(open_section) {
                    SessionAccess::Full
                } else {
                    SessionAccess::Restricted
                };
                previous = Some((open_section, access));
                if grant {
                    self.session_close_internal(false)?;
                }
            }
        }

        if grant {
            // Opening the section is what grants plain access; prefer
            // the restricted key, it is authority enough.
            if self.keys.has_restricted(section as usize) {
                self.open_session(section, SessionAccess::Restricted)?;
            } else if self.keys.has_full_access(section as usize) {
                self.open_session(section, SessionAccess::Full)?;
            } else {
                return Err(W77qError::DevicePrivilegeErr);
            }
            self.session_close_internal(false)?;
        } else {
            self.cmd_init_section_pa(section)?;
            self.mark_session_closed();
            self.sections[section as usize].plain_enabled = false;
        }

        if let Some((open_section, access)) = previous {
            self.open_session(open_section, access)?;
        }
        Ok(())
    }

    // --- integrity and attestation ---

    pub fn check_integrity(
        &mut self,
        section: u8,
        kind: IntegrityCheck,
    ) -> Result<(), W77qError> {
        self.check_active()?;
        if section as usize >= NUM_SECTIONS {
            return Err(W77qError::InvalidParameter);
        }
        if !self.keys.session_is_open() {
            return Err(W77qError::DeviceSessionErr);
        }

        let info = self.get_section_configuration(section)?;
        match kind {
            IntegrityCheck::Digest => {
                if !info.policy.digest_integrity {
                    return Err(W77qError::IncorrectState);
                }
                let mut digest = [0u8; 8];
                self.calc_sig(SignedDataType::SectionDigest, section, &mut digest)?;
                let mut scr = Scr::default();
                self.calc_sig(
                    SignedDataType::SectionConfig,
                    section,
                    zerocopy::IntoBytes::as_mut_bytes(&mut scr),
                )?;
                if u64::from_le_bytes(digest) != scr.digest() {
                    return Err(W77qError::SecurityErr);
                }
                Ok(())
            }
            IntegrityCheck::Crc => {
                if !self.keys.is_section_session(section) {
                    return Err(W77qError::DevicePrivilegeErr);
                }
                if !info.policy.checksum_integrity {
                    return Err(W77qError::IncorrectState);
                }
                self.cmd_ver_intg(section)
            }
        }
    }

    /// Derives the next link of the compound device identifier chain.
    /// Stage 0 is computed by the device; later stages hash the previous
    /// CDI with the section's digest.
    pub fn calc_cdi(
        &mut self,
        section: u8,
        prev_cdi: Option<&[u8; 32]>,
    ) -> Result<[u8; 32], W77qError> {
        self.check_active()?;
        if section as usize >= NUM_SECTIONS {
            return Err(W77qError::InvalidParameter);
        }

        if section == 0 {
            if !self.keys.is_section_full_access(0) {
                return Err(W77qError::IncorrectState);
            }
            return self.cmd_calc_cdi(0);
        }

        let prev = prev_cdi.ok_or(W77qError::InvalidParameter)?;
        let info = self.get_section_configuration(section)?;

        let digest = if info.policy.digest_integrity
            && (info.policy.write_prot || info.policy.rollback_prot)
        {
            // The stored digest is trustworthy: the section cannot have
            // changed under it.
            if info.digest == 0 {
                return Err(W77qError::IncorrectState);
            }
            info.digest
        } else {
            let mut digest = [0u8; 8];
            self.calc_sig(SignedDataType::SectionDigest, section, &mut digest)?;
            u64::from_le_bytes(digest)
        };

        // prev_cdi(32) ‖ digest(8) ‖ zeros(14) ‖ section(1)
        let mut input = [0u8; 55];
        input[..32].copy_from_slice(prev);
        input[32..40].copy_from_slice(&digest.to_le_bytes());
        input[54] = section;

        let mut next = [0u8; 32];
        self.platform.hash(&mut next, &input);
        Ok(next)
    }

    // --- watchdog ---

    pub fn watchdog_config_set(&mut self, config: &WatchdogConfig) -> Result<(), W77qError> {
        self.check_active()?;

        let mut reg = self.get_awdt_cfg()?;
        if reg.locked() {
            return Err(W77qError::IncorrectState);
        }
        self.watchdog_secure = reg.authenticated();
        let bound_section = reg.kid();

        reg.set_enabled(config.enable);
        reg.set_lf_osc_enabled(config.lf_osc_enable);
        reg.set_sw_reset_enabled(config.sw_reset_enable);
        reg.set_authenticated(config.authenticated);
        reg.set_kid(config.section);
        reg.set_threshold(config.threshold as u8);
        reg.set_locked(config.lock);
        if config.osc_rate_hz != 0 {
            reg.set_osc_rate_hz(config.osc_rate_hz);
        }
        let reg = reg.masked();

        if self.watchdog_secure {
            if !self.keys.session_is_open() {
                return Err(W77qError::DeviceSessionErr);
            }
            if !self.keys.is_section_full_access(bound_section) {
                return Err(W77qError::DevicePrivilegeErr);
            }
            self.cmd_set_awdt(reg)?;
        } else {
            self.cmd_set_awdt_plain(reg)?;
        }

        let readback = self.get_awdt_cfg()?;
        if readback != reg {
            return Err(W77qError::TestFail);
        }
        self.watchdog_secure = readback.authenticated();
        self.watchdog_section = readback.kid();
        Ok(())
    }

    pub fn watchdog_config_get(&mut self) -> Result<WatchdogConfig, W77qError> {
        self.check_active()?;
        let reg = self.get_awdt_cfg()?;
        let threshold = WatchdogThreshold::from_u8(reg.threshold())
            .ok_or(W77qError::DeviceSystemErr)?;
        Ok(WatchdogConfig {
            enable: reg.enabled(),
            lf_osc_enable: reg.lf_osc_enabled(),
            sw_reset_enable: reg.sw_reset_enabled(),
            authenticated: reg.authenticated(),
            section: reg.kid(),
            threshold,
            lock: reg.locked(),
            osc_rate_hz: reg.osc_rate_hz(),
        })
    }

    /// Rewinds the watchdog countdown.
    pub fn watchdog_touch(&mut self) -> Result<(), W77qError> {
        self.check_active()?;
        if self.watchdog_secure {
            if !self.keys.session_is_open() {
                return Err(W77qError::DeviceSessionErr);
            }
            if !self.keys.is_section_session(self.watchdog_section) {
                return Err(W77qError::DevicePrivilegeErr);
            }
            self.cmd_awdt_touch()
        } else {
            self.cmd_awdt_touch_plain()
        }
    }

    /// Forces the watchdog to expire now.
    pub fn watchdog_trigger(&mut self) -> Result<(), W77qError> {
        self.check_active()?;
        self.cmd_awdt_expire()
    }

    /// Current watchdog state: seconds since touch, sub-second residue
    /// in 64-tick units, and whether it has expired.
    pub fn watchdog_get(&mut self) -> Result<(u32, u32, bool), W77qError> {
        self.check_active()?;
        let sr = self.cmd_get_awdtsr()?;
        Ok((sr.seconds(), sr.residue(), sr.expired()))
    }

    // --- identity / status / notifications ---

    pub fn get_wid(&self) -> u64 {
        self.wid
    }

    pub fn get_id(&mut self) -> Result<DeviceId, W77qError> {
        self.check_active()?;
        let suid = self.get_suid()?;
        let unique_id = self.std_get_unique_id()?;
        Ok(DeviceId {
            wid: self.wid,
            suid,
            unique_id,
        })
    }

    pub fn get_hw_version(&mut self) -> Result<(StdHwVersion, HwVersion), W77qError> {
        self.check_active()?;
        let std = self.std_get_hw_version()?;
        let reg = HwVerReg(self.get_hw_ver_reg()?);
        let sec = HwVersion {
            flash_version: reg.flash_version(),
            security_version: reg.security_version(),
            revision: reg.revision(),
            flash_size: reg.flash_size(),
        };
        Ok((std, sec))
    }

    /// Reads the secure status word, surfacing any latched error.
    pub fn get_status(&mut self) -> Result<Ssr, W77qError> {
        if self.powered_down {
            return Err(W77qError::CommandIgnored);
        }
        if !self.suspended && self.signed_gets() {
            let mut buf = [0u8; 4];
            self.calc_sig(SignedDataType::Ssr, 0, &mut buf)?;
            let ssr = Ssr(u32::from_le_bytes(buf));
            self.ssr = ssr;
            self.ssr_status(ssr, SsrErrors::all())?;
            Ok(ssr)
        } else {
            self.get_ssr(SsrErrors::all())
        }
    }

    pub fn get_notifications(&mut self) -> Result<Notifications, W77qError> {
        if self.powered_down {
            return Err(W77qError::CommandIgnored);
        }

        // Counter thresholds always use fresh values; the GET_MC's
        // status poll also refreshes the cached SSR.
        self.mc.in_sync = false;
        self.sync_mc()?;
        let mc_maintenance = self.ssr.mc_maint() != 0;

        Ok(Notifications {
            mc_maintenance,
            reset_device: self.mc.tc >= TC_RESET_THRESHOLD,
            replace_device: self.mc.dmc >= DMC_EOL_THRESHOLD,
        })
    }

    /// One monotonic-counter maintenance iteration. Run while
    /// `get_notifications` reports `mc_maintenance`.
    pub fn perform_maintenance(&mut self) -> Result<(), W77qError> {
        self.check_active()?;
        self.cmd_mc_maint()
    }

    // --- state transfer ---

    /// Everything a remote host needs to adopt this context without
    /// re-probing the device. The bus lock stays behind.
    pub fn export_state(&self) -> SyncState {
        SyncState {
            mode: self.bus.mode,
            dtr: self.bus.dtr,
            wid: self.wid,
            reset_status: self.reset_status,
        }
    }

    pub fn import_state(&mut self, state: &SyncState) -> Result<(), W77qError> {
        self.bus.mode = state.mode;
        self.bus.dtr = state.dtr;
        if let Some(secure) = BusInterface::secure_format_for(state.mode) {
            self.bus.secure_format = secure;
            self.bus.compute_ops();
        }
        self.wid = state.wid;
        self.reset_status = state.reset_status;
        Ok(())
    }

    pub fn get_reset_status(&self) -> ResetStatus {
        self.reset_status
    }

    // --- bulk provisioning ---

    /// Provisions the device in one sweep: keys, SUID, global
    /// configuration, section mapping and policies, reset response.
    /// Order matters — see the per-step comments.
    pub fn config_device(&mut self, setup: &DeviceSetup<'_>) -> Result<(), W77qError> {
        self.check_active()?;

        // Keys first: every later step authenticates with them.
        if let Some(master) = setup.master_key {
            self.set_all_keys(
                master,
                setup.secret_key,
                setup.restricted_keys,
                setup.full_access_keys,
            )?;
        }

        if let Some(suid) = setup.suid {
            let master = setup.master_key.ok_or(W77qError::InvalidParameter)?;
            let current = self.get_suid()?;
            if current != *suid {
                self.with_session(KeyId::DEVICE_MASTER, master, false, |this| {
                    this.cmd_set_suid(suid)
                })?;
                if self.get_suid()? != *suid {
                    return Err(W77qError::TestFail);
                }
            }
        }

        if setup.device_config.is_some() || setup.watchdog_default.is_some() {
            if let Some(config) = setup.device_config {
                // Arming safe fallback with an unrecoverable fallback
                // section already in place is refused up front.
                if config.safe_fallback
                    && self.sections[7].enabled
                    && setup.sections.is_none()
                {
                    let info = self.get_section_configuration(7)?;
                    if info.policy.checksum_integrity && info.policy.rollback_prot {
                        return Err(W77qError::InvalidParameter);
                    }
                }
                if setup.sections.is_none() {
                    self.verify_addr_size_config(config.addr_size)?;
                }
            }
            let master = setup.master_key.ok_or(W77qError::InvalidParameter)?;
            self.config_gmc(master, setup.watchdog_default, setup.device_config)?;
        }

        // Sections whose mapping slot already exists with a compatible
        // size can take their policy before the GMT changes; the rest
        // wait until after.
        if let Some(sections) = setup.sections {
            let full_keys = setup
                .full_access_keys
                .ok_or(W77qError::InvalidParameter)?;
            for (index, section) in sections.iter().enumerate() {
                if section.size != 0 {
                    // Record the new size now so the policy checks test
                    // against it.
                    self.sections[index].size_tag =
                        Smr::len_tag_from_bytes(section.size) as u8;
                    if !self.section_policy_after_gmt(index) {
                        self.config_initial_section_policy(
                            index as u8,
                            &section.policy,
                            &full_keys[index],
                        )?;
                    }
                }
            }

            let master = setup.master_key.ok_or(W77qError::InvalidParameter)?;
            self.config_gmt(master, sections)?;
        }

        // The new mapping takes effect at reset.
        self.reset_flash()?;

        if let Some(config) = setup.device_config {
            if let Some(resp) = &config.reset_response {
                let master = setup.master_key.ok_or(W77qError::InvalidParameter)?;
                self.with_session(KeyId::DEVICE_MASTER, master, false, |this| {
                    this.cmd_set_rst_resp(true, &resp.response1)?;
                    this.cmd_set_rst_resp(false, &resp.response2)
                })?;
                if self.cmd_get_rst_resp(true)? != resp.response1
                    || self.cmd_get_rst_resp(false)? != resp.response2
                {
                    return Err(W77qError::TestFail);
                }
            }
        }

        if let Some(sections) = setup.sections {
            let full_keys = setup
                .full_access_keys
                .ok_or(W77qError::InvalidParameter)?;
            for (index, section) in sections.iter().enumerate() {
                if section.size != 0 && self.section_policy_after_gmt(index) {
                    self.config_initial_section_policy(
                        index as u8,
                        &section.policy,
                        &full_keys[index],
                    )?;
                }
            }
        }

        self.sync_state()
    }

    fn set_all_keys(
        &mut self,
        master: &Key,
        secret: Option<&Key>,
        restricted: Option<&[Key; NUM_SECTIONS]>,
        full_access: Option<&[Key; NUM_SECTIONS]>,
    ) -> Result<(), W77qError> {
        if !key_is_valid(master) {
            return Err(W77qError::InvalidParameter);
        }

        // The master key is provisioned from the factory default.
        self.key_provisioning(&drv_w77q_api::DEFAULT_KEY, KeyId::DEVICE_MASTER, master)?;

        if let Some(secret) = secret {
            if key_is_valid(secret) {
                self.key_provisioning(master, KeyId::DEVICE_SECRET, secret)?;
            }
        }

        for section in 0..NUM_SECTIONS as u8 {
            if let Some(keys) = restricted {
                let key = &keys[section as usize];
                if key_is_valid(key) {
                    self.key_provisioning(master, KeyId::restricted(section), key)?;
                }
            }
            if let Some(keys) = full_access {
                let key = &keys[section as usize];
                if key_is_valid(key) {
                    self.key_provisioning(master, KeyId::full_access(section), key)?;
                }
            }
        }
        Ok(())
    }

    /// Writes one key slot through the one-shot provisioning protocol.
    fn key_provisioning(
        &mut self,
        base: &Key,
        new_kid: KeyId,
        new_key: &Key,
    ) -> Result<(), W77qError> {
        use drv_w77q_api::KeyKind;

        if new_kid == KeyId::DEVICE_MASTER {
            // Maybe it is already this value; probing is cheaper than a
            // failed provisioning attempt.
            let probe = self.session_open_internal(new_kid, Some(new_key), true);
            if probe.is_ok() {
                self.session_close_internal(false)?;
                return Ok(());
            }
        }

        let prov_kid = match new_kid.kind() {
            KeyKind::RestrictedSection | KeyKind::FullAccessSection => {
                KeyId::section_provisioning(new_kid.section())
            }
            KeyKind::DeviceSecret | KeyKind::DeviceMaster => KeyId::DEVICE_KEY_PROVISIONING,
            _ => return Err(W77qError::ParameterOutOfRange),
        };

        let prov_key = {
            let platform = &mut self.platform;
            crypto::derive_provisioning_key(|d, m| platform.hash(d, m), base, prov_kid)
        };

        self.with_session(prov_kid, &prov_key, false, |this| {
            this.cmd_set_key(new_kid, new_key)
        })
    }

    fn config_gmc(
        &mut self,
        master: &Key,
        watchdog_default: Option<&WatchdogConfig>,
        device_config: Option<&DeviceConfig>,
    ) -> Result<(), W77qError> {
        use drv_w77q_api::{AwdtCfg, Io23Mode};

        let mut gmc = self.get_gmc()?;
        gmc.set_version(gmc.version().wrapping_add(1));

        let mut awdt = gmc.awdt_default();

        if let Some(wd) = watchdog_default {
            awdt.set_enabled(wd.enable);
            awdt.set_lf_osc_enabled(wd.lf_osc_enable);
            awdt.set_sw_reset_enabled(wd.sw_reset_enable);
            awdt.set_authenticated(wd.authenticated);
            awdt.set_kid(wd.section);
            awdt.set_threshold(wd.threshold as u8);
            if wd.osc_rate_hz != 0 {
                awdt.set_osc_rate_hz(wd.osc_rate_hz);
            } else {
                awdt.set_osc_rate_hz(AwdtCfg::OSC_RATE_KHZ_DEFAULT << 10);
            }
            awdt.set_locked(wd.lock);
        }

        if let Some(config) = device_config {
            // IO2/IO3 pin function drives both the reset routing here
            // and the QE bit in the legacy status register.
            let quad_enable = match config.pin_mux.io23 {
                Io23Mode::LegacyWpHold => {
                    awdt.set_rsti_override(false);
                    awdt.set_rsto_enabled(false);
                    false
                }
                Io23Mode::ResetInOut => {
                    awdt.set_rsti_override(true);
                    awdt.set_rsti_enabled(true);
                    awdt.set_rsto_enabled(true);
                    false
                }
                Io23Mode::Quad => {
                    awdt.set_rsti_override(false);
                    awdt.set_rsto_enabled(false);
                    true
                }
            };
            awdt.set_rst_in_enabled(config.pin_mux.dedicated_reset_in);

            self.std_set_quad_enable(quad_enable)?;
            // The RSTI override above owns reset routing; the legacy
            // hold/reset pin bit stays off.
            self.std_set_reset_in_enable(false)?;

            let mut devcfg = gmc.devcfg();
            let addr_bits = config.addr_size as u8;
            self.addr_size = addr_bits;
            devcfg.set_sect_sel(addr_bits - MIN_STD_ADDR_BITS);
            devcfg.set_rst_resp_en(config.reset_response.is_some());
            devcfg.set_fb_en(config.safe_fallback);
            devcfg.set_ck_specul(config.speculative_ck);
            devcfg.set_format_en(config.non_secure_format);
            devcfg.set_stm_en(false);
            gmc.set_devcfg(devcfg.masked());
        }

        gmc.set_awdt_default(awdt.masked());

        self.with_session(KeyId::DEVICE_MASTER, master, false, |this| {
            this.cmd_set_gmc(&gmc)
        })?;

        let readback = self.get_gmc()?;
        if readback != gmc {
            return Err(W77qError::TestFail);
        }
        Ok(())
    }

    fn config_gmt(
        &mut self,
        master: &Key,
        sections: &[SectionConfig; NUM_SECTIONS],
    ) -> Result<(), W77qError> {
        let mut gmt = self.cmd_get_gmt_unsigned()?;
        gmt.set_version(gmt.version().wrapping_add(1));

        for (index, section) in sections.iter().enumerate() {
            let mut smr = Smr(0);
            if section.size != 0 {
                let base_tag = Smr::base_tag_from_bytes(section.base);
                let len_tag = Smr::len_tag_from_bytes(section.size);
                if base_tag >= 0x1000 || len_tag >= 8 {
                    return Err(W77qError::InvalidParameter);
                }
                let end = section
                    .base
                    .checked_add(section.size)
                    .ok_or(W77qError::InvalidParameter)?;
                if end > FLASH_SIZE {
                    return Err(W77qError::ParameterOutOfRange);
                }
                if section.base % SECTION_ALIGNMENT != 0
                    || section.size % SECTION_ALIGNMENT != 0
                {
                    return Err(W77qError::InvalidParameter);
                }
                smr.set_base_tag(base_tag as u16);
                smr.set_len_tag(len_tag as u8);
                // Tag encodings are lossy for sizes that are not a
                // power of two; refuse anything that does not survive
                // the round trip.
                if smr.base_bytes() != section.base || smr.len_bytes() != section.size {
                    return Err(W77qError::InvalidParameter);
                }
                smr.set_enabled(true);
            }
            gmt.set_smr(index, smr);
        }

        self.with_session(KeyId::DEVICE_MASTER, master, false, |this| {
            this.cmd_set_gmt(&gmt)
        })?;

        let readback = self.cmd_get_gmt_unsigned()?;
        if readback != gmt {
            return Err(W77qError::TestFail);
        }
        Ok(())
    }

    /// Policy for a section whose mapping slot is not usable yet must
    /// wait for the new GMT: rollback protection, for one, needs the
    /// slot to span at least two blocks first.
    fn section_policy_after_gmt(&self, section: usize) -> bool {
        !self.sections[section].enabled || self.sections[section].size_tag == 0
    }

    fn config_initial_section_policy(
        &mut self,
        section: u8,
        policy: &SectionPolicy,
        full_access_key: &Key,
    ) -> Result<(), W77qError> {
        if !key_is_valid(full_access_key) {
            return Err(W77qError::InvalidParameter);
        }

        // Integrity bits come later, once there is content worth
        // protecting; an empty section cannot match a digest.
        let mut initial = *policy;
        initial.checksum_integrity = false;
        initial.digest_integrity = false;

        self.session_open_internal(
            KeyId::full_access(section),
            Some(full_access_key),
            true,
        )?;
        let result = self.config_section_internal(
            section,
            Some(&initial),
            None,
            None,
            None,
            Swap::None,
        );
        if result.is_err() && self.keys.session_is_open() {
            let _ = self.session_close_internal(false);
        }
        // On success the SET_SCR already closed the session.
        result
    }

    fn verify_addr_size_config(&mut self, addr_size: StdAddrSize) -> Result<(), W77qError> {
        let bits = addr_size as u8;
        let max_offset = 1u32 << bits;
        let max_sections = (FLASH_SIZE >> bits).min(NUM_SECTIONS as u32);

        for section in 0..NUM_SECTIONS {
            if !self.sections[section].enabled {
                continue;
            }
            let info = self.get_section_configuration(section as u8)?;
            if info.policy.plain_access_read || info.policy.plain_access_write {
                if section as u32 >= max_sections || info.size > max_offset {
                    return Err(W77qError::InvalidParameter);
                }
            }
        }
        Ok(())
    }
}
