// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure register layouts, bit for bit as the device defines them.
//!
//! The multi-word registers (GMT, GMC, SCRn) are newtypes over `[u32; 5]`
//! and travel over the wire as their in-memory little-endian image; the
//! single-word registers are newtypes over `u32` with field accessors.

use crate::SectionPolicy;
use core::mem::size_of;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const fn get(v: u32, lo: u32, width: u32) -> u32 {
    (v >> lo) & ((1 << width) - 1)
}

const fn put(v: u32, lo: u32, width: u32, field: u32) -> u32 {
    let mask = ((1u32 << width) - 1) << lo;
    (v & !mask) | ((field << lo) & mask)
}

bitflags::bitflags! {
    /// The sticky error bits of the SSR. Reading the SSR with this full
    /// mask acknowledged clears the latches on the device.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct SsrErrors: u32 {
        const SES_ERR = 1 << 10;
        const INTG_ERR = 1 << 12;
        const AUTH_ERR = 1 << 13;
        const PRIV_ERR = 1 << 14;
        const IGNORE_ERR = 1 << 15;
        const SYS_ERR = 1 << 16;
        const FLASH_ERR = 1 << 17;
        const MC_ERR = 1 << 19;
    }
}

/// Secure Status Register, polled through OP0.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct Ssr(pub u32);

impl Ssr {
    pub const STATE_IN_RESET: u8 = 0;
    pub const STATE_WORKING: u8 = 2;
    pub const STATE_LOCKED: u8 = 4;
    pub const STATE_WORKING_MASK: u8 = 7;

    pub fn busy(self) -> bool {
        get(self.0, 0, 1) != 0
    }
    pub fn flash_busy(self) -> bool {
        get(self.0, 1, 1) != 0
    }
    pub fn err(self) -> bool {
        get(self.0, 2, 1) != 0
    }
    pub fn ses_ready(self) -> bool {
        get(self.0, 4, 1) != 0
    }
    pub fn resp_ready(self) -> bool {
        get(self.0, 5, 1) != 0
    }
    pub fn por(self) -> bool {
        get(self.0, 6, 1) != 0
    }
    pub fn fb_remap(self) -> bool {
        get(self.0, 7, 1) != 0
    }
    pub fn awdt_expired(self) -> bool {
        get(self.0, 8, 1) != 0
    }
    pub fn mc_maint(self) -> u8 {
        get(self.0, 20, 2) as u8
    }
    pub fn suspend_erase(self) -> bool {
        get(self.0, 22, 1) != 0
    }
    pub fn suspend_write(self) -> bool {
        get(self.0, 23, 1) != 0
    }
    pub fn state(self) -> u8 {
        get(self.0, 24, 3) as u8
    }
    pub fn full_priv(self) -> bool {
        get(self.0, 27, 1) != 0
    }
    pub fn kid(self) -> u8 {
        get(self.0, 28, 4) as u8
    }

    /// The sticky error bits currently latched.
    pub fn errors(self) -> SsrErrors {
        SsrErrors::from_bits_truncate(self.0)
    }

    pub fn set_busy(&mut self, v: bool) {
        self.0 = put(self.0, 0, 1, v as u32);
    }
    pub fn set_flash_busy(&mut self, v: bool) {
        self.0 = put(self.0, 1, 1, v as u32);
    }
    pub fn set_err(&mut self, v: bool) {
        self.0 = put(self.0, 2, 1, v as u32);
    }
    pub fn set_ses_ready(&mut self, v: bool) {
        self.0 = put(self.0, 4, 1, v as u32);
    }
    pub fn set_resp_ready(&mut self, v: bool) {
        self.0 = put(self.0, 5, 1, v as u32);
    }
    pub fn set_por(&mut self, v: bool) {
        self.0 = put(self.0, 6, 1, v as u32);
    }
    pub fn set_fb_remap(&mut self, v: bool) {
        self.0 = put(self.0, 7, 1, v as u32);
    }
    pub fn set_awdt_expired(&mut self, v: bool) {
        self.0 = put(self.0, 8, 1, v as u32);
    }
    pub fn set_mc_maint(&mut self, v: u8) {
        self.0 = put(self.0, 20, 2, v as u32);
    }
    pub fn set_suspend_erase(&mut self, v: bool) {
        self.0 = put(self.0, 22, 1, v as u32);
    }
    pub fn set_suspend_write(&mut self, v: bool) {
        self.0 = put(self.0, 23, 1, v as u32);
    }
    pub fn set_state(&mut self, v: u8) {
        self.0 = put(self.0, 24, 3, v as u32);
    }
    pub fn set_full_priv(&mut self, v: bool) {
        self.0 = put(self.0, 27, 1, v as u32);
    }
    pub fn set_kid(&mut self, v: u8) {
        self.0 = put(self.0, 28, 4, v as u32);
    }

    pub fn insert_errors(&mut self, e: SsrErrors) {
        self.0 |= e.bits();
    }
    pub fn clear_errors(&mut self, e: SsrErrors) {
        self.0 &= !e.bits();
        if self.errors().is_empty() {
            self.set_err(false);
        }
    }
}

/// One 16-bit Section Mapping Register entry of the GMT.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Smr(pub u16);

impl Smr {
    pub fn base_tag(self) -> u16 {
        self.0 & 0x0FFF
    }
    pub fn len_tag(self) -> u8 {
        ((self.0 >> 12) & 0x7) as u8
    }
    pub fn enabled(self) -> bool {
        self.0 & 0x8000 != 0
    }

    pub fn set_base_tag(&mut self, tag: u16) {
        self.0 = (self.0 & !0x0FFF) | (tag & 0x0FFF);
    }
    pub fn set_len_tag(&mut self, tag: u8) {
        self.0 = (self.0 & !0x7000) | ((tag as u16 & 0x7) << 12);
    }
    pub fn set_enabled(&mut self, v: bool) {
        if v {
            self.0 |= 0x8000;
        } else {
            self.0 &= !0x8000;
        }
    }

    /// Section base in bytes; the tag unit is 64 KiB.
    pub fn base_bytes(self) -> u32 {
        (self.base_tag() as u32) << 16
    }
    /// Section length in bytes: 64 KiB << tag.
    pub fn len_bytes(self) -> u32 {
        crate::SECTION_BASE_GRANULARITY << self.len_tag()
    }

    pub fn base_tag_from_bytes(base: u32) -> u32 {
        base >> 16
    }
    pub fn len_tag_from_bytes(len: u32) -> u32 {
        (len >> 16).trailing_zeros()
    }
}

/// Global Mapping Table: eight SMR entries plus a version word.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct Gmt(pub [u32; 5]);

impl Gmt {
    pub fn smr(&self, section: usize) -> Smr {
        let word = self.0[section / 2];
        Smr(if section % 2 == 0 {
            word as u16
        } else {
            (word >> 16) as u16
        })
    }

    pub fn set_smr(&mut self, section: usize, smr: Smr) {
        let word = &mut self.0[section / 2];
        if section % 2 == 0 {
            *word = (*word & 0xFFFF_0000) | smr.0 as u32;
        } else {
            *word = (*word & 0x0000_FFFF) | ((smr.0 as u32) << 16);
        }
    }

    pub fn version(&self) -> u32 {
        self.0[4]
    }
    pub fn set_version(&mut self, v: u32) {
        self.0[4] = v;
    }
}

/// Section Security Policy Register word of an SCR.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Sspr(pub u32);

impl From<SectionPolicy> for Sspr {
    fn from(p: SectionPolicy) -> Self {
        let mut v = 0;
        v = put(v, 0, 1, p.digest_integrity as u32);
        v = put(v, 1, 1, p.checksum_integrity as u32);
        v = put(v, 2, 1, p.write_prot as u32);
        v = put(v, 3, 1, p.rollback_prot as u32);
        v = put(v, 4, 1, p.plain_access_read as u32);
        v = put(v, 5, 1, p.plain_access_write as u32);
        v = put(v, 6, 1, p.auth_plain_access as u32);
        Sspr(v)
    }
}

impl From<Sspr> for SectionPolicy {
    fn from(r: Sspr) -> Self {
        SectionPolicy {
            digest_integrity: get(r.0, 0, 1) != 0,
            checksum_integrity: get(r.0, 1, 1) != 0,
            write_prot: get(r.0, 2, 1) != 0,
            rollback_prot: get(r.0, 3, 1) != 0,
            plain_access_read: get(r.0, 4, 1) != 0,
            plain_access_write: get(r.0, 5, 1) != 0,
            auth_plain_access: get(r.0, 6, 1) != 0,
        }
    }
}

/// Section Configuration Register: policy word, CRC, 64-bit digest,
/// version.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct Scr(pub [u32; 5]);

impl Scr {
    pub fn sspr(&self) -> Sspr {
        Sspr(self.0[0])
    }
    pub fn set_sspr(&mut self, sspr: Sspr) {
        self.0[0] = sspr.0;
    }
    pub fn checksum(&self) -> u32 {
        self.0[1]
    }
    pub fn set_checksum(&mut self, crc: u32) {
        self.0[1] = crc;
    }
    pub fn digest(&self) -> u64 {
        self.0[2] as u64 | ((self.0[3] as u64) << 32)
    }
    pub fn set_digest(&mut self, digest: u64) {
        self.0[2] = digest as u32;
        self.0[3] = (digest >> 32) as u32;
    }
    pub fn version(&self) -> u32 {
        self.0[4]
    }
    pub fn set_version(&mut self, v: u32) {
        self.0[4] = v;
    }
}

/// Device Configuration word of the GMC.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DevCfg(pub u32);

impl DevCfg {
    const RESERVED_MASK: u32 = (0b11 << 2) | (1 << 7) | (0x3F_FFFF << 10);

    /// Legacy address-size selector: offset bits minus 19.
    pub fn sect_sel(self) -> u8 {
        get(self.0, 0, 2) as u8
    }
    pub fn rst_resp_en(self) -> bool {
        get(self.0, 4, 1) != 0
    }
    pub fn fb_en(self) -> bool {
        get(self.0, 5, 1) != 0
    }
    pub fn ck_specul(self) -> bool {
        get(self.0, 6, 1) != 0
    }
    pub fn format_en(self) -> bool {
        get(self.0, 8, 1) != 0
    }

    pub fn set_sect_sel(&mut self, v: u8) {
        self.0 = put(self.0, 0, 2, v as u32);
    }
    pub fn set_rst_resp_en(&mut self, v: bool) {
        self.0 = put(self.0, 4, 1, v as u32);
    }
    pub fn set_fb_en(&mut self, v: bool) {
        self.0 = put(self.0, 5, 1, v as u32);
    }
    pub fn set_ck_specul(&mut self, v: bool) {
        self.0 = put(self.0, 6, 1, v as u32);
    }
    pub fn set_format_en(&mut self, v: bool) {
        self.0 = put(self.0, 8, 1, v as u32);
    }
    // STM_EN (bit 9) is reserved-as-zero on this part.
    pub fn set_stm_en(&mut self, v: bool) {
        self.0 = put(self.0, 9, 1, v as u32);
    }

    pub fn masked(self) -> Self {
        DevCfg(self.0 & !Self::RESERVED_MASK)
    }
}

/// Global Memory Configuration: watchdog default, DEVCFG, version.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct Gmc(pub [u32; 5]);

impl Gmc {
    pub fn awdt_default(&self) -> AwdtCfg {
        AwdtCfg(self.0[0])
    }
    pub fn set_awdt_default(&mut self, v: AwdtCfg) {
        self.0[0] = v.0;
    }
    pub fn devcfg(&self) -> DevCfg {
        DevCfg(self.0[1])
    }
    pub fn set_devcfg(&mut self, v: DevCfg) {
        self.0[1] = v.0;
    }
    pub fn version(&self) -> u32 {
        self.0[4]
    }
    pub fn set_version(&mut self, v: u32) {
        self.0[4] = v;
    }
}

/// Authenticated Watchdog Timer configuration register.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AwdtCfg(pub u32);

impl AwdtCfg {
    const RESERVED_MASK: u32 = 0b111 << 17;

    /// Default LF oscillator calibration, in kHz.
    pub const OSC_RATE_KHZ_DEFAULT: u32 = 65;

    pub fn enabled(self) -> bool {
        get(self.0, 0, 1) != 0
    }
    pub fn lf_osc_enabled(self) -> bool {
        get(self.0, 1, 1) != 0
    }
    pub fn sw_reset_enabled(self) -> bool {
        get(self.0, 2, 1) != 0
    }
    pub fn authenticated(self) -> bool {
        get(self.0, 3, 1) != 0
    }
    pub fn rsto_enabled(self) -> bool {
        get(self.0, 4, 1) != 0
    }
    pub fn rsti_override(self) -> bool {
        get(self.0, 5, 1) != 0
    }
    pub fn rsti_enabled(self) -> bool {
        get(self.0, 6, 1) != 0
    }
    pub fn rst_in_enabled(self) -> bool {
        get(self.0, 7, 1) != 0
    }
    pub fn kid(self) -> u8 {
        get(self.0, 8, 4) as u8
    }
    pub fn threshold(self) -> u8 {
        get(self.0, 12, 5) as u8
    }
    pub fn osc_rate_frac(self) -> u32 {
        get(self.0, 20, 4)
    }
    pub fn osc_rate_khz(self) -> u32 {
        get(self.0, 24, 7)
    }
    pub fn locked(self) -> bool {
        get(self.0, 31, 1) != 0
    }

    pub fn set_enabled(&mut self, v: bool) {
        self.0 = put(self.0, 0, 1, v as u32);
    }
    pub fn set_lf_osc_enabled(&mut self, v: bool) {
        self.0 = put(self.0, 1, 1, v as u32);
    }
    pub fn set_sw_reset_enabled(&mut self, v: bool) {
        self.0 = put(self.0, 2, 1, v as u32);
    }
    pub fn set_authenticated(&mut self, v: bool) {
        self.0 = put(self.0, 3, 1, v as u32);
    }
    pub fn set_rsto_enabled(&mut self, v: bool) {
        self.0 = put(self.0, 4, 1, v as u32);
    }
    pub fn set_rsti_override(&mut self, v: bool) {
        self.0 = put(self.0, 5, 1, v as u32);
    }
    pub fn set_rsti_enabled(&mut self, v: bool) {
        self.0 = put(self.0, 6, 1, v as u32);
    }
    pub fn set_rst_in_enabled(&mut self, v: bool) {
        self.0 = put(self.0, 7, 1, v as u32);
    }
    pub fn set_kid(&mut self, v: u8) {
        self.0 = put(self.0, 8, 4, v as u32);
    }
    pub fn set_threshold(&mut self, v: u8) {
        self.0 = put(self.0, 12, 5, v as u32);
    }
    pub fn set_locked(&mut self, v: bool) {
        self.0 = put(self.0, 31, 1, v as u32);
    }

    /// The calibration fields encode rate as `khz << 10 | frac << 6` Hz.
    pub fn osc_rate_hz(self) -> u32 {
        (self.osc_rate_khz() << 10) + (self.osc_rate_frac() << 6)
    }
    pub fn set_osc_rate_hz(&mut self, hz: u32) {
        self.0 = put(self.0, 24, 7, hz >> 10);
        self.0 = put(self.0, 20, 4, hz >> 6);
    }

    pub fn masked(self) -> Self {
        AwdtCfg(self.0 & !Self::RESERVED_MASK)
    }
}

/// Authenticated Watchdog Timer status register.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AwdtSr(pub u32);

impl AwdtSr {
    /// Whole seconds elapsed since the last touch.
    pub fn seconds(self) -> u32 {
        get(self.0, 0, 20)
    }
    /// Sub-second residue, in units of 64 LF-oscillator ticks.
    pub fn residue(self) -> u32 {
        get(self.0, 20, 11)
    }
    pub fn expired(self) -> bool {
        get(self.0, 31, 1) != 0
    }

    pub fn set_seconds(&mut self, v: u32) {
        self.0 = put(self.0, 0, 20, v);
    }
    pub fn set_residue(&mut self, v: u32) {
        self.0 = put(self.0, 20, 11, v);
    }
    pub fn set_expired(&mut self, v: bool) {
        self.0 = put(self.0, 31, 1, v as u32);
    }
}

/// Access Control Lock Register: per-section write and read locks.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Aclr(pub u32);

impl Aclr {
    const RESERVED_MASK: u32 = (0xFF << 8) | (0xFF << 24);

    pub fn write_lock(self) -> u8 {
        get(self.0, 0, 8) as u8
    }
    pub fn read_lock(self) -> u8 {
        get(self.0, 16, 8) as u8
    }
    pub fn set_write_lock(&mut self, mask: u8) {
        self.0 = put(self.0, 0, 8, mask as u32);
    }
    pub fn set_read_lock(&mut self, mask: u8) {
        self.0 = put(self.0, 16, 8, mask as u32);
    }

    pub fn masked(self) -> Self {
        Aclr(self.0 & !Self::RESERVED_MASK)
    }
}

/// Secure hardware version register.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HwVerReg(pub u32);

impl HwVerReg {
    pub fn revision(self) -> u8 {
        get(self.0, 0, 8) as u8
    }
    pub fn security_version(self) -> u8 {
        get(self.0, 8, 8) as u8
    }
    pub fn flash_size(self) -> u8 {
        get(self.0, 16, 4) as u8
    }
    pub fn flash_version(self) -> u8 {
        get(self.0, 20, 8) as u8
    }

    pub fn set_revision(&mut self, v: u8) {
        self.0 = put(self.0, 0, 8, v as u32);
    }
    pub fn set_security_version(&mut self, v: u8) {
        self.0 = put(self.0, 8, 8, v as u32);
    }
    pub fn set_flash_size(&mut self, v: u8) {
        self.0 = put(self.0, 16, 4, v as u32);
    }
    pub fn set_flash_version(&mut self, v: u8) {
        self.0 = put(self.0, 20, 8, v as u32);
    }
}

const_assert_eq!(size_of::<Gmt>(), 20);
const_assert_eq!(size_of::<Gmc>(), 20);
const_assert_eq!(size_of::<Scr>(), 20);
const_assert_eq!(size_of::<Ssr>(), 4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssr_fields() {
        let mut ssr = Ssr(0);
        ssr.set_state(Ssr::STATE_WORKING);
        ssr.set_kid(0x1F & 0xF);
        ssr.set_resp_ready(true);
        ssr.set_mc_maint(2);
        assert_eq!(ssr.state(), Ssr::STATE_WORKING);
        assert_eq!(ssr.kid(), 0xF);
        assert!(ssr.resp_ready());
        assert_eq!(ssr.mc_maint(), 2);
        assert!(!ssr.busy());

        ssr.insert_errors(SsrErrors::AUTH_ERR | SsrErrors::MC_ERR);
        ssr.set_err(true);
        assert_eq!(ssr.errors(), SsrErrors::AUTH_ERR | SsrErrors::MC_ERR);
        ssr.clear_errors(SsrErrors::all());
        assert!(ssr.errors().is_empty());
        assert!(!ssr.err());
    }

    #[test]
    fn gmt_smr_packing() {
        let mut gmt = Gmt::default();
        let mut smr = Smr(0);
        smr.set_base_tag(Smr::base_tag_from_bytes(512 * 1024) as u16);
        smr.set_len_tag(Smr::len_tag_from_bytes(256 * 1024) as u8);
        smr.set_enabled(true);
        gmt.set_smr(3, smr);
        gmt.set_version(7);

        let out = gmt.smr(3);
        assert_eq!(out.base_bytes(), 512 * 1024);
        assert_eq!(out.len_bytes(), 256 * 1024);
        assert!(out.enabled());
        // Neighbors untouched.
        assert_eq!(gmt.smr(2).0, 0);
        assert!(!gmt.smr(4).enabled());
        assert_eq!(gmt.version(), 7);
    }

    #[test]
    fn scr_digest_split() {
        let mut scr = Scr::default();
        scr.set_digest(0x0123_4567_89AB_CDEF);
        assert_eq!(scr.0[2], 0x89AB_CDEF);
        assert_eq!(scr.0[3], 0x0123_4567);
        assert_eq!(scr.digest(), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn sspr_policy_round_trip() {
        let policy = SectionPolicy {
            digest_integrity: true,
            rollback_prot: true,
            plain_access_read: true,
            ..Default::default()
        };
        let sspr = Sspr::from(policy);
        assert_eq!(sspr.0, 0b0011001);
        assert_eq!(SectionPolicy::from(sspr), policy);
    }

    #[test]
    fn awdtcfg_osc_rate() {
        let mut cfg = AwdtCfg(0);
        cfg.set_osc_rate_hz(AwdtCfg::OSC_RATE_KHZ_DEFAULT << 10);
        assert_eq!(cfg.osc_rate_khz(), 65);
        assert_eq!(cfg.osc_rate_frac(), 0);
        assert_eq!(cfg.osc_rate_hz(), 65 << 10);
        cfg.set_threshold(8);
        cfg.set_kid(1);
        assert_eq!(cfg.threshold(), 8);
        assert_eq!(cfg.kid(), 1);
        assert_eq!(cfg.masked().0 & AwdtCfg::RESERVED_MASK, 0);
    }

    #[test]
    fn aclr_masks() {
        let mut aclr = Aclr(0);
        aclr.set_write_lock(0b0000_0100);
        aclr.set_read_lock(0b1000_0000);
        assert_eq!(aclr.write_lock(), 0b0000_0100);
        assert_eq!(aclr.read_lock(), 0b1000_0000);
        assert_eq!(aclr.masked().0, aclr.0);
    }
}
