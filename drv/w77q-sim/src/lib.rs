// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Behavioral model of a W77Q secure flash device.
//!
//! Implements the driver's [`Platform`] trait so the whole engine can be
//! exercised on the host: the model speaks the legacy opcode set and the
//! three-opcode secure protocol, enforces sessions, signatures, section
//! policies and plain-access grants, and keeps the monotonic counters in
//! the same lock-step the real part does. Fault-injection hooks let
//! tests flip response bits and tamper with stored data out of band.
//!
//! It shares the wire-crypto schema with the driver (`drv_w77q::crypto`)
//! — that agreement is exactly what the protocol requires of the two
//! endpoints — and uses SHA3-256 as the 256-bit sponge.

use drv_w77q::crypto::{command_signature, derive_provisioning_key, derive_session_key};
use drv_w77q::{Platform, SpiTransfer, Trace, TransportError};
use drv_w77q_api::{
    instr, section_crc, AwdtCfg, AwdtSr, BusMode, Gmc, Gmt, Key, KeyId, KeyKind, Scr,
    SectionPolicy, SsrErrors, DEFAULT_KEY, FLASH_SIZE, MIN_STD_ADDR_BITS, NUM_SECTIONS,
    SECURE_MEMORY_TYPE, SECURE_PAGE_SIZE, WINBOND_MFR_ID,
};
use sha3::{Digest, Sha3_256};
use zerocopy::IntoBytes;

// Secure command codes, device side. Mirrors the driver's catalog.
mod cmd {
    pub const GET_WID: u8 = 0x14;
    pub const GET_SUID: u8 = 0x15;
    pub const GET_AWDTSR: u8 = 0x18;
    pub const SFORMAT: u8 = 0x20;
    pub const SET_KEY: u8 = 0x21;
    pub const SET_SUID: u8 = 0x22;
    pub const SET_GMC: u8 = 0x24;
    pub const SET_GMT: u8 = 0x25;
    pub const SET_AWDT: u8 = 0x26;
    pub const AWDT_TOUCH: u8 = 0x27;
    pub const SET_SCR: u8 = 0x28;
    pub const SET_SCR_SWAP: u8 = 0x29;
    pub const SET_RST_RESP: u8 = 0x2B;
    pub const SET_ACLR: u8 = 0x2C;
    pub const SET_AWDT_PA: u8 = 0x2D;
    pub const AWDT_TOUCH_PA: u8 = 0x2E;
    pub const FORMAT: u8 = 0x30;
    pub const GET_GMC: u8 = 0x34;
    pub const GET_GMT: u8 = 0x35;
    pub const GET_AWDT: u8 = 0x36;
    pub const GET_SCR: u8 = 0x38;
    pub const GET_RST_RESP: u8 = 0x3B;
    pub const GET_ACLR: u8 = 0x3C;
    pub const GET_MC: u8 = 0x40;
    pub const MC_MAINT: u8 = 0x41;
    pub const SESSION_OPEN: u8 = 0x44;
    pub const SESSION_CLOSE: u8 = 0x45;
    pub const INIT_SECTION_PA: u8 = 0x47;
    pub const CALC_CDI: u8 = 0x48;
    pub const VER_INTG: u8 = 0x49;
    pub const GET_TC: u8 = 0x50;
    pub const CALC_SIG: u8 = 0x52;
    pub const SRD: u8 = 0x60;
    pub const SARD: u8 = 0x61;
    pub const SAWR: u8 = 0x64;
    pub const SERASE_4K: u8 = 0x68;
    pub const SERASE_32K: u8 = 0x69;
    pub const SERASE_64K: u8 = 0x6A;
    pub const SERASE_SECTION: u8 = 0x6B;
    pub const SERASE_ALL: u8 = 0x6C;
    pub const ERASE_SECT_PA: u8 = 0x6F;
    pub const GET_VERSION: u8 = 0xF0;
    pub const AWDT_EXPIRE: u8 = 0xFE;
}

/// Watchdog threshold steps, in seconds.
const AWDT_THRESHOLD_SECS: [u32; 21] = [
    1, 2, 4, 8, 16, 32, 60, 120, 240, 480, 1_020, 2_040, 3_600, 7_200, 14_400, 32_400,
    64_800, 129_600, 259_200, 518_400, 1_036_800,
];

fn sha3_hash(digest: &mut [u8; 32], data: &[u8]) {
    let out = Sha3_256::digest(data);
    digest.copy_from_slice(&out);
}

fn key_bytes_to_words(bytes: &[u8]) -> Key {
    let mut key = [0u32; 4];
    for (i, word) in key.iter_mut().enumerate() {
        *word = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
    }
    key
}

#[derive(Copy, Clone, Default)]
struct Session {
    kid: u8,
    key: Key,
    open: bool,
}

/// The device model. One instance is one flash chip.
pub struct W77qSim {
    memory: Vec<u8>,

    gmt: Gmt,
    gmc: Gmc,
    scrs: [Scr; NUM_SECTIONS],
    aclr: u32,
    awdtcfg: AwdtCfg,
    suid: [u8; 16],
    wid: u64,
    unique_id: u64,
    reset_resp: [[u8; 64]; 2],

    master_key: Key,
    secret_key: Key,
    restricted_keys: [Key; NUM_SECTIONS],
    full_access_keys: [Key; NUM_SECTIONS],

    session: Session,
    pa_granted: [bool; NUM_SECTIONS],

    tc: u32,
    dmc: u32,
    mc_maint_pending: u32,

    sticky: SsrErrors,
    err: bool,
    resp: Vec<u8>,
    resp_ready: bool,

    qpi: bool,
    powered_down: bool,
    reset_enabled: bool,
    suspended_erase: bool,
    por: bool,
    fb_remap: bool,
    awdt_expired_at_reset: bool,

    awdt_seconds: u32,
    awdt_expired: bool,

    nonce_counter: u64,

    /// Flip one bit in the next OP2 response payload.
    corrupt_next_response: bool,

    /// Engine trace events, for tests that assert sequences.
    pub trace_log: Vec<Trace>,
}

impl Default for W77qSim {
    fn default() -> Self {
        Self::new()
    }
}

impl W77qSim {
    /// A factory-fresh device: all memory erased, every key at its
    /// default, all sections disabled, SCR versions unwritten.
    pub fn new() -> Self {
        let mut scr = Scr::default();
        scr.set_version(u32::MAX);

        let mut gmc = Gmc::default();
        let mut awdt_default = AwdtCfg(0);
        awdt_default.set_osc_rate_hz(AwdtCfg::OSC_RATE_KHZ_DEFAULT << 10);
        gmc.set_awdt_default(awdt_default);

        Self {
            memory: vec![0xFF; FLASH_SIZE as usize],
            gmt: Gmt::default(),
            gmc,
            scrs: [scr; NUM_SECTIONS],
            aclr: 0,
            awdtcfg: AwdtCfg(0),
            suid: [0; 16],
            wid: 0x5731_7751_0000_1234,
            unique_id: 0xE11E_D00D_CAFE_F00D,
            reset_resp: [[0; 64]; 2],
            master_key: DEFAULT_KEY,
            secret_key: DEFAULT_KEY,
            restricted_keys: [DEFAULT_KEY; NUM_SECTIONS],
            full_access_keys: [DEFAULT_KEY; NUM_SECTIONS],
            session: Session::default(),
            pa_granted: [false; NUM_SECTIONS],
            tc: 0x100,
            dmc: 5,
            mc_maint_pending: 0,
            sticky: SsrErrors::empty(),
            err: false,
            resp: Vec::new(),
            resp_ready: false,
            qpi: false,
            powered_down: false,
            reset_enabled: false,
            suspended_erase: false,
            por: true,
            fb_remap: false,
            awdt_expired_at_reset: false,
            awdt_seconds: 0,
            awdt_expired: false,
            nonce_counter: 0x0DD5_EED0,
            corrupt_next_response: false,
            trace_log: Vec::new(),
        }
    }

    // --- test hooks ---

    /// Corrupts the next secure response by one bit, for
    /// authentication-failure tests.
    pub fn corrupt_next_response(&mut self) {
        self.corrupt_next_response = true;
    }

    /// Out-of-band data tamper, as if by hardware attack.
    pub fn tamper(&mut self, section: usize, offset: usize, xor: u8) {
        let base = self.section_base(section) as usize;
        self.memory[base + offset] ^= xor;
    }

    /// Current digest of a section's contents, as CALC_SIG reports it.
    /// Provisioning tests store this into the SCR.
    pub fn section_digest(&self, section: usize) -> u64 {
        let data = self.section_data(section);
        let digest = Sha3_256::digest(data);
        u64::from_le_bytes(digest[..8].try_into().unwrap())
    }

    /// Current CRC of a section's contents.
    pub fn section_checksum(&self, section: usize) -> u32 {
        section_crc(self.section_data(section))
    }

    /// Makes the device demand `iterations` maintenance rounds.
    pub fn force_mc_maintenance(&mut self, iterations: u32) {
        self.mc_maint_pending = iterations;
    }

    /// The device's live transaction counter, for lock-step assertions.
    pub fn transaction_counter(&self) -> u32 {
        self.tc
    }

    /// Pushes the counters near their limits for notification tests.
    pub fn set_counters(&mut self, tc: u32, dmc: u32) {
        self.tc = tc;
        self.dmc = dmc;
    }

    /// Lets watchdog time pass.
    pub fn advance_watchdog(&mut self, seconds: u32) {
        if !self.awdtcfg.enabled() {
            return;
        }
        self.awdt_seconds += seconds;
        let threshold = self.awdtcfg.threshold() as usize;
        let limit = AWDT_THRESHOLD_SECS
            .get(threshold)
            .copied()
            .unwrap_or(u32::MAX);
        if self.awdt_seconds >= limit {
            self.awdt_expired = true;
        }
    }

    pub fn take_trace(&mut self) -> Vec<Trace> {
        core::mem::take(&mut self.trace_log)
    }

    // --- geometry ---

    fn addr_size(&self) -> u32 {
        (self.gmc.devcfg().sect_sel() + MIN_STD_ADDR_BITS) as u32
    }

    fn section_base(&self, section: usize) -> u32 {
        self.gmt.smr(section).base_bytes()
    }

    fn section_len(&self, section: usize) -> u32 {
        self.gmt.smr(section).len_bytes()
    }

    fn section_enabled(&self, section: usize) -> bool {
        self.gmt.smr(section).enabled()
    }

    fn section_data(&self, section: usize) -> &[u8] {
        let base = self.section_base(section) as usize;
        let len = self.section_len(section) as usize;
        &self.memory[base..base + len]
    }

    fn policy(&self, section: usize) -> SectionPolicy {
        SectionPolicy::from(self.scrs[section].sspr())
    }

    // --- error latching ---

    fn fail(&mut self, bits: SsrErrors) {
        self.sticky |= bits;
        self.err = true;
    }

    // --- SSR ---

    fn ssr_value(&self) -> u32 {
        let mut ssr = drv_w77q_api::Ssr(0);
        ssr.set_err(self.err);
        ssr.set_ses_ready(self.session.open);
        ssr.set_resp_ready(self.resp_ready);
        ssr.set_por(self.por);
        ssr.set_fb_remap(self.fb_remap);
        ssr.set_awdt_expired(self.awdt_expired_at_reset);
        ssr.insert_errors(self.sticky);
        ssr.set_mc_maint(if self.mc_maint_pending > 0 { 1 } else { 0 });
        ssr.set_suspend_erase(self.suspended_erase);
        ssr.set_state(drv_w77q_api::Ssr::STATE_WORKING);
        if self.session.open {
            ssr.set_full_priv(KeyId::from_raw(self.session.kid).kind()
                == KeyKind::FullAccessSection
                || self.session.kid == KeyId::DEVICE_MASTER.raw());
            ssr.set_kid(self.session.kid & 0xF);
        } else {
            ssr.set_kid(0xF);
        }
        ssr.0
    }

    /// Serving the SSR clears the sticky latches — they are
    /// read-to-clear on the real part too.
    fn serve_ssr(&mut self) -> u32 {
        let value = self.ssr_value();
        self.sticky = SsrErrors::empty();
        self.err = false;
        value
    }

    // --- reset ---

    fn device_reset(&mut self, por: bool) {
        self.session = Session::default();
        self.pa_granted = [false; NUM_SECTIONS];
        self.sticky = SsrErrors::empty();
        self.err = false;
        self.resp.clear();
        self.resp_ready = false;
        self.qpi = false;
        self.powered_down = false;
        self.reset_enabled = false;
        self.suspended_erase = false;
        self.por = por;
        self.awdt_expired_at_reset = self.awdt_expired;
        self.awdt_expired = false;
        self.awdt_seconds = 0;
    }

    // --- key lookup ---

    fn key_for_kid(&self, kid: KeyId) -> Option<Key> {
        match kid.kind() {
            KeyKind::RestrictedSection => {
                Some(self.restricted_keys[kid.section() as usize])
            }
            KeyKind::FullAccessSection => {
                Some(self.full_access_keys[kid.section() as usize])
            }
            KeyKind::DeviceMaster => Some(self.master_key),
            KeyKind::DeviceSecret => Some(self.secret_key),
            KeyKind::SectionProvisioning | KeyKind::DeviceKeyProvisioning => {
                // One-shot provisioning keys are derived from the master
                // (or its factory default before the master exists).
                Some(derive_provisioning_key(sha3_hash, &self.master_key, kid))
            }
            KeyKind::Invalid => None,
        }
    }

    fn session_section(&self) -> Option<usize> {
        let kid = KeyId::from_raw(self.session.kid);
        kid.is_section_key().then(|| kid.section() as usize)
    }

    fn session_is_full_access(&self, section: usize) -> bool {
        self.session.open && self.session.kid == KeyId::full_access(section as u8).raw()
    }

    fn session_is_master(&self) -> bool {
        self.session.open && self.session.kid == KeyId::DEVICE_MASTER.raw()
    }

    // --- secure command execution (OP1) ---

    fn op1(&mut self, data: &[u8]) {
        if data.len() < 4 {
            self.fail(SsrErrors::SYS_ERR);
            return;
        }
        let ctag = u32::from_le_bytes(data[..4].try_into().unwrap());
        let [code, mode, kid_byte, aux] = ctag.to_le_bytes();
        let body = &data[4..];

        self.resp.clear();
        self.resp_ready = false;

        if Self::is_signed_cmd(code) {
            // Every received signed command advances the counter, valid
            // or not; the host stamps at submission, and the two sides
            // must not drift.
            self.tc = self.tc.wrapping_add(1);

            if body.len() < 8 {
                self.fail(SsrErrors::SES_ERR);
                return;
            }
            let (params, sig_bytes) = body.split_at(body.len() - 8);
            let sig = u64::from_le_bytes(sig_bytes.try_into().unwrap());

            let key = if code == cmd::SESSION_OPEN {
                match self.key_for_kid(KeyId::from_raw(kid_byte)) {
                    Some(key) => key,
                    None => {
                        self.fail(SsrErrors::SES_ERR);
                        return;
                    }
                }
            } else {
                if !self.session.open || self.session.kid != kid_byte {
                    self.fail(SsrErrors::SES_ERR);
                    return;
                }
                self.session.key
            };

            let expected = command_signature(sha3_hash, &key, ctag, params, self.tc);
            if expected != sig {
                self.fail(SsrErrors::AUTH_ERR);
                return;
            }

            let params = params.to_vec();
            self.exec_signed(code, mode, kid_byte, aux, &params, key);
        } else {
            let body = body.to_vec();
            self.exec_unsigned(code, mode, aux, &body);
        }
    }

    fn is_signed_cmd(code: u8) -> bool {
        matches!(
            code,
            cmd::SFORMAT
                | cmd::SET_KEY
                | cmd::SET_SUID
                | cmd::SET_GMC
                | cmd::SET_GMT
                | cmd::SET_AWDT
                | cmd::AWDT_TOUCH
                | cmd::SET_SCR
                | cmd::SET_SCR_SWAP
                | cmd::SET_RST_RESP
                | cmd::SESSION_OPEN
                | cmd::SESSION_CLOSE
                | cmd::CALC_CDI
                | cmd::VER_INTG
                | cmd::CALC_SIG
                | cmd::SRD
                | cmd::SARD
                | cmd::SAWR
                | cmd::SERASE_4K
                | cmd::SERASE_32K
                | cmd::SERASE_64K
                | cmd::SERASE_SECTION
                | cmd::SERASE_ALL
        )
    }

    fn respond(&mut self, payload: &[u8], key: &Key, ctag_echo: u32) {
        self.resp.clear();
        self.resp.extend_from_slice(payload);
        let sig = command_signature(sha3_hash, key, ctag_echo, payload, self.tc);
        self.resp.extend_from_slice(&sig.to_le_bytes());
        self.resp_ready = true;
    }

    fn respond_plain(&mut self, payload: &[u8]) {
        self.resp.clear();
        self.resp.extend_from_slice(payload);
        self.resp_ready = true;
    }

    fn exec_signed(
        &mut self,
        code: u8,
        mode: u8,
        kid_byte: u8,
        aux: u8,
        params: &[u8],
        key: Key,
    ) {
        let ctag = u32::from_le_bytes([code, mode, kid_byte, aux]);
        match code {
            cmd::SESSION_OPEN => self.exec_session_open(ctag, mode, kid_byte, params, key),
            cmd::SESSION_CLOSE => {
                let revoke = mode & 1 != 0;
                if let Some(section) = self.session_section() {
                    if revoke {
                        self.pa_granted[section] = false;
                    }
                }
                self.session = Session::default();
            }
            cmd::SET_KEY => {
                if params.len() != 17 {
                    self.fail(SsrErrors::SYS_ERR);
                    return;
                }
                let target = KeyId::from_raw(params[0]);
                let value = key_bytes_to_words(&params[1..17]);
                let allowed = match target.kind() {
                    KeyKind::RestrictedSection | KeyKind::FullAccessSection => {
                        self.session.kid
                            == KeyId::section_provisioning(target.section()).raw()
                    }
                    KeyKind::DeviceMaster | KeyKind::DeviceSecret => {
                        self.session.kid == KeyId::DEVICE_KEY_PROVISIONING.raw()
                    }
                    _ => false,
                };
                if !allowed {
                    self.fail(SsrErrors::PRIV_ERR);
                    return;
                }
                match target.kind() {
                    KeyKind::RestrictedSection => {
                        self.restricted_keys[target.section() as usize] = value
                    }
                    KeyKind::FullAccessSection => {
                        self.full_access_keys[target.section() as usize] = value
                    }
                    KeyKind::DeviceMaster => self.master_key = value,
                    KeyKind::DeviceSecret => self.secret_key = value,
                    _ => unreachable!(),
                }
            }
            cmd::SET_SUID => {
                if !self.session_is_master() || params.len() != 16 {
                    self.fail(SsrErrors::PRIV_ERR);
                    return;
                }
                self.suid.copy_from_slice(params);
            }
            cmd::SET_GMC => {
                if !self.session_is_master() || params.len() != 20 {
                    self.fail(SsrErrors::PRIV_ERR);
                    return;
                }
                self.gmc.as_mut_bytes().copy_from_slice(params);
            }
            cmd::SET_GMT => {
                if !self.session_is_master() || params.len() != 20 {
                    self.fail(SsrErrors::PRIV_ERR);
                    return;
                }
                self.gmt.as_mut_bytes().copy_from_slice(params);
            }
            cmd::SET_RST_RESP => {
                if !self.session_is_master() || params.len() != 64 {
                    self.fail(SsrErrors::PRIV_ERR);
                    return;
                }
                self.reset_resp[(mode & 1) as usize].copy_from_slice(params);
            }
            cmd::SET_SCR | cmd::SET_SCR_SWAP => {
                self.exec_set_scr(code, mode, aux, params)
            }
            cmd::SET_AWDT => self.exec_set_awdt(params, true),
            cmd::AWDT_TOUCH => self.exec_awdt_touch(true),
            cmd::VER_INTG => {
                let section = (aux & 0x7) as usize;
                match self.session_section() {
                    Some(open) if open == section => {}
                    _ => {
                        self.fail(SsrErrors::SES_ERR);
                        return;
                    }
                }
                if self.section_checksum(section) != self.scrs[section].checksum() {
                    self.fail(SsrErrors::INTG_ERR);
                }
            }
            cmd::CALC_SIG => self.exec_calc_sig(ctag, mode, key),
            cmd::CALC_CDI => {
                let section = (aux & 0x7) as usize;
                if !self.session_is_full_access(section) {
                    self.fail(SsrErrors::PRIV_ERR);
                    return;
                }
                // Stage-zero CDI: the device folds its secret into the
                // boot section's digest.
                let mut input = [0u8; 24];
                for (i, word) in self.secret_key.iter().enumerate() {
                    input[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
                }
                input[16..24].copy_from_slice(&self.section_digest(section).to_le_bytes());
                let cdi = Sha3_256::digest(input);
                let cdi: [u8; 32] = cdi.into();
                self.respond(&cdi, &key, ctag);
            }
            cmd::SRD | cmd::SARD => self.exec_secure_read(code, ctag, params, key),
            cmd::SAWR => self.exec_secure_write(params),
            cmd::SERASE_4K | cmd::SERASE_32K | cmd::SERASE_64K | cmd::SERASE_SECTION => {
                self.exec_secure_erase(code, params)
            }
            cmd::SERASE_ALL => {
                if !self.session_is_master() {
                    self.fail(SsrErrors::PRIV_ERR);
                    return;
                }
                self.memory.fill(0xFF);
            }
            cmd::SFORMAT => {
                if !self.session_is_master() {
                    self.fail(SsrErrors::PRIV_ERR);
                    return;
                }
                self.format_device();
            }
            _ => self.fail(SsrErrors::SYS_ERR),
        }
    }

    fn exec_session_open(
        &mut self,
        ctag: u32,
        mode: u8,
        kid_byte: u8,
        params: &[u8],
        key: Key,
    ) {
        if params.len() != 9 {
            self.fail(SsrErrors::SYS_ERR);
            return;
        }
        let host_nonce = u64::from_le_bytes(params[..8].try_into().unwrap());
        let include_wid = mode & 1 != 0;
        let ignore_scr = mode & 2 != 0;

        let kid = KeyId::from_raw(kid_byte);
        let mut scr_version = 0;
        if kid.is_section_key() {
            let section = kid.section() as usize;
            if !self.section_enabled(section) {
                self.fail(SsrErrors::SES_ERR);
                return;
            }
            scr_version = self.scrs[section].version();

            // A stale checksum latches an integrity error but does not
            // keep the key holder out.
            let policy = self.policy(section);
            if !ignore_scr
                && policy.checksum_integrity
                && self.section_checksum(section) != self.scrs[section].checksum()
            {
                self.fail(SsrErrors::INTG_ERR);
            }
        }

        let device_nonce = self.next_nonce();
        let session_key = derive_session_key(
            sha3_hash,
            &key,
            host_nonce,
            device_nonce,
            include_wid.then_some(self.wid),
        );

        self.session = Session {
            kid: kid_byte,
            key: session_key,
            open: true,
        };

        if let Some(section) = self.session_section() {
            let policy = self.policy(section);
            if policy.plain_access_read || policy.plain_access_write {
                self.pa_granted[section] = true;
            }
        }

        let mut payload = [0u8; 12];
        payload[..8].copy_from_slice(&device_nonce.to_le_bytes());
        payload[8..].copy_from_slice(&scr_version.to_le_bytes());
        // The response is signed with the freshly derived session key:
        // key confirmation for the host.
        self.respond(&payload, &session_key, ctag);
    }

    fn exec_set_scr(&mut self, code: u8, mode: u8, aux: u8, params: &[u8]) {
        let section = (aux & 0x7) as usize;
        if !self.session_is_full_access(section) {
            self.fail(SsrErrors::PRIV_ERR);
            return;
        }
        if params.len() != 20 {
            self.fail(SsrErrors::SYS_ERR);
            return;
        }
        self.scrs[section].as_mut_bytes().copy_from_slice(params);

        if code == cmd::SET_SCR_SWAP {
            // Swap the two halves of the section: the rollback shadow
            // becomes live.
            let base = self.section_base(section) as usize;
            let len = self.section_len(section) as usize;
            let half = len / 2;
            for i in 0..half {
                self.memory.swap(base + i, base + half + i);
            }
        }

        let init_pa = mode & 2 != 0;
        let policy = self.policy(section);
        self.pa_granted[section] =
            init_pa && (policy.plain_access_read || policy.plain_access_write);

        // SET_SCR ends the session.
        self.session = Session::default();

        if code == cmd::SET_SCR_SWAP && mode & 1 != 0 {
            self.device_reset(false);
        }
    }

    fn exec_set_awdt(&mut self, params: &[u8], signed: bool) {
        if params.len() != 4 {
            self.fail(SsrErrors::SYS_ERR);
            return;
        }
        if self.awdtcfg.locked() {
            self.fail(SsrErrors::PRIV_ERR);
            return;
        }
        if self.awdtcfg.authenticated() != signed {
            self.fail(SsrErrors::PRIV_ERR);
            return;
        }
        if signed {
            let bound = self.awdtcfg.kid() as usize;
            if !self.session_is_full_access(bound) {
                self.fail(SsrErrors::PRIV_ERR);
                return;
            }
        }
        self.awdtcfg = AwdtCfg(u32::from_le_bytes(params.try_into().unwrap()));
        self.awdt_seconds = 0;
        self.awdt_expired = false;
    }

    fn exec_awdt_touch(&mut self, signed: bool) {
        if self.awdtcfg.authenticated() != signed {
            self.fail(SsrErrors::PRIV_ERR);
            return;
        }
        if signed {
            let bound = self.awdtcfg.kid() as usize;
            match self.session_section() {
                Some(section) if section == bound => {}
                _ => {
                    self.fail(SsrErrors::PRIV_ERR);
                    return;
                }
            }
        }
        self.awdt_seconds = 0;
        self.awdt_expired = false;
    }

    fn exec_calc_sig(&mut self, ctag: u32, data_id: u8, key: Key) {
        let section = (data_id & 0x7) as usize;
        let mut buf = [0u8; 20];
        let len = match data_id {
            0x00..=0x07 => {
                buf[..8].copy_from_slice(&self.section_digest(section).to_le_bytes());
                8
            }
            0x10 => {
                buf[..8].copy_from_slice(&self.wid.to_le_bytes());
                8
            }
            0x14 => {
                buf[..16].copy_from_slice(&self.suid);
                16
            }
            0x18 => {
                buf[..4].copy_from_slice(&self.hw_version().to_le_bytes());
                4
            }
            0x20 => {
                let ssr = self.serve_ssr();
                buf[..4].copy_from_slice(&ssr.to_le_bytes());
                4
            }
            0x24 => {
                buf[..4].copy_from_slice(&self.awdtcfg.0.to_le_bytes());
                4
            }
            0x28 => {
                buf[..4].copy_from_slice(&self.tc.to_le_bytes());
                buf[4..8].copy_from_slice(&self.dmc.to_le_bytes());
                8
            }
            0x30 => {
                buf.copy_from_slice(self.gmc.as_bytes());
                20
            }
            0x32 => {
                buf.copy_from_slice(self.gmt.as_bytes());
                20
            }
            0x40..=0x47 => {
                buf.copy_from_slice(self.scrs[section].as_bytes());
                20
            }
            _ => {
                self.fail(SsrErrors::SYS_ERR);
                return;
            }
        };
        let payload = buf[..len].to_vec();
        self.respond(&payload, &key, ctag);
    }

    fn secure_addr(&mut self, params: &[u8]) -> Option<(usize, usize)> {
        if params.len() < 4 {
            self.fail(SsrErrors::SYS_ERR);
            return None;
        }
        let offset = u32::from_le_bytes(params[..4].try_into().unwrap()) & !31;
        let section = match self.session_section() {
            Some(section) => section,
            None => {
                self.fail(SsrErrors::SES_ERR);
                return None;
            }
        };
        if offset + SECURE_PAGE_SIZE as u32 > self.section_len(section) {
            self.fail(SsrErrors::SYS_ERR);
            return None;
        }
        Some((section, offset as usize))
    }

    fn exec_secure_read(&mut self, code: u8, ctag: u32, params: &[u8], key: Key) {
        let Some((section, offset)) = self.secure_addr(params) else {
            return;
        };
        let base = self.section_base(section) as usize;
        let mut page = [0u8; SECURE_PAGE_SIZE];
        page.copy_from_slice(&self.memory[base + offset..base + offset + SECURE_PAGE_SIZE]);

        if code == cmd::SARD {
            // Echo the stamped TC ahead of the data; the signature
            // covers the data with the echo as CTRL.
            let mut payload = [0u8; 4 + SECURE_PAGE_SIZE];
            payload[..4].copy_from_slice(&self.tc.to_le_bytes());
            payload[4..].copy_from_slice(&page);
            let sig = command_signature(sha3_hash, &key, ctag, &page, self.tc);
            self.resp.clear();
            self.resp.extend_from_slice(&payload);
            self.resp.extend_from_slice(&sig.to_le_bytes());
            self.resp_ready = true;
        } else {
            self.respond(&page, &key, ctag);
        }
    }

    fn exec_secure_write(&mut self, params: &[u8]) {
        if params.len() != 4 + SECURE_PAGE_SIZE {
            self.fail(SsrErrors::SYS_ERR);
            return;
        }
        let Some((section, offset)) = self.secure_addr(params) else {
            return;
        };
        if !self.session_is_full_access(section) {
            self.fail(SsrErrors::PRIV_ERR);
            return;
        }
        if self.policy(section).write_prot {
            self.fail(SsrErrors::PRIV_ERR);
            return;
        }
        let base = self.section_base(section) as usize;
        // NOR semantics: programming can only clear bits.
        for (i, byte) in params[4..].iter().enumerate() {
            self.memory[base + offset + i] &= byte;
        }
    }

    fn exec_secure_erase(&mut self, code: u8, params: &[u8]) {
        let section = match self.session_section() {
            Some(section) => section,
            None => {
                self.fail(SsrErrors::SES_ERR);
                return;
            }
        };
        if !self.session_is_full_access(section) {
            self.fail(SsrErrors::PRIV_ERR);
            return;
        }
        if self.policy(section).write_prot {
            self.fail(SsrErrors::PRIV_ERR);
            return;
        }

        let base = self.section_base(section) as usize;
        let len = self.section_len(section) as usize;
        let (offset, span) = match code {
            cmd::SERASE_4K => (self.erase_offset(params), 4 * 1024),
            cmd::SERASE_32K => (self.erase_offset(params), 32 * 1024),
            cmd::SERASE_64K => (self.erase_offset(params), 64 * 1024),
            _ => (Some(0), len),
        };
        let Some(offset) = offset else {
            return;
        };
        if offset + span > len {
            self.fail(SsrErrors::SYS_ERR);
            return;
        }
        self.memory[base + offset..base + offset + span].fill(0xFF);
    }

    fn erase_offset(&mut self, params: &[u8]) -> Option<usize> {
        if params.len() < 4 {
            self.fail(SsrErrors::SYS_ERR);
            return None;
        }
        Some(u32::from_le_bytes(params[..4].try_into().unwrap()) as usize)
    }

    fn exec_unsigned(&mut self, code: u8, mode: u8, aux: u8, body: &[u8]) {
        match code {
            cmd::GET_WID => {
                let wid = self.wid;
                self.respond_plain(&wid.to_le_bytes());
            }
            cmd::GET_SUID => {
                let suid = self.suid;
                self.respond_plain(&suid);
            }
            cmd::GET_MC => {
                let mut out = [0u8; 8];
                out[..4].copy_from_slice(&self.tc.to_le_bytes());
                out[4..].copy_from_slice(&self.dmc.to_le_bytes());
                self.respond_plain(&out);
            }
            cmd::GET_TC => {
                let tc = self.tc;
                self.respond_plain(&tc.to_le_bytes());
            }
            cmd::MC_MAINT => {
                if self.mc_maint_pending > 0 {
                    self.mc_maint_pending -= 1;
                    self.dmc = self.dmc.wrapping_add(1);
                }
            }
            cmd::GET_GMT => {
                let gmt = self.gmt;
                self.respond_plain(gmt.as_bytes());
            }
            cmd::GET_GMC => {
                let gmc = self.gmc;
                self.respond_plain(gmc.as_bytes());
            }
            cmd::GET_SCR => {
                let scr = self.scrs[(aux & 0x7) as usize];
                self.respond_plain(scr.as_bytes());
            }
            cmd::GET_ACLR => {
                let aclr = self.aclr;
                self.respond_plain(&aclr.to_le_bytes());
            }
            cmd::SET_ACLR => {
                if body.len() == 4 {
                    self.aclr = u32::from_le_bytes(body.try_into().unwrap());
                } else {
                    self.fail(SsrErrors::SYS_ERR);
                }
            }
            cmd::GET_AWDT => {
                let cfg = self.awdtcfg.0;
                self.respond_plain(&cfg.to_le_bytes());
            }
            cmd::GET_AWDTSR => {
                let mut sr = AwdtSr(0);
                sr.set_seconds(self.awdt_seconds);
                sr.set_residue(0);
                sr.set_expired(self.awdt_expired);
                self.respond_plain(&sr.0.to_le_bytes());
            }
            cmd::SET_AWDT_PA => {
                let body = body.to_vec();
                self.exec_set_awdt(&body, false);
            }
            cmd::AWDT_TOUCH_PA => self.exec_awdt_touch(false),
            cmd::AWDT_EXPIRE => {
                if self.awdtcfg.enabled() {
                    self.awdt_expired = true;
                } else {
                    self.fail(SsrErrors::IGNORE_ERR);
                }
            }
            cmd::GET_RST_RESP => {
                let half = self.reset_resp[(mode & 1) as usize];
                self.respond_plain(&half);
            }
            cmd::INIT_SECTION_PA => {
                let section = (aux & 0x7) as usize;
                let policy = self.policy(section);
                if policy.auth_plain_access {
                    // Re-initializing an authenticated-PA section takes
                    // the grant away; only a session can give it back.
                    self.pa_granted[section] = false;
                } else if policy.plain_access_read || policy.plain_access_write {
                    self.pa_granted[section] = true;
                } else {
                    self.fail(SsrErrors::PRIV_ERR);
                }
                self.session = Session::default();
            }
            cmd::ERASE_SECT_PA => {
                let section = (aux & 0x7) as usize;
                let policy = self.policy(section);
                if !self.pa_granted[section] || !policy.plain_access_write {
                    self.fail(SsrErrors::PRIV_ERR);
                    return;
                }
                let base = self.section_base(section) as usize;
                let len = self.section_len(section) as usize;
                self.memory[base..base + len].fill(0xFF);
            }
            cmd::FORMAT => {
                if !self.gmc.devcfg().format_en() {
                    self.fail(SsrErrors::PRIV_ERR);
                    return;
                }
                self.format_device();
            }
            cmd::GET_VERSION => {
                let hw = self.hw_version();
                self.respond_plain(&hw.to_le_bytes());
            }
            _ => self.fail(SsrErrors::SYS_ERR),
        }
    }

    fn format_device(&mut self) {
        self.memory.fill(0xFF);
        self.gmt = Gmt::default();
        let mut scr = Scr::default();
        scr.set_version(u32::MAX);
        self.scrs = [scr; NUM_SECTIONS];
        self.master_key = DEFAULT_KEY;
        self.secret_key = DEFAULT_KEY;
        self.restricted_keys = [DEFAULT_KEY; NUM_SECTIONS];
        self.full_access_keys = [DEFAULT_KEY; NUM_SECTIONS];
        // The session that authorized the format stays up; the driver
        // closes it explicitly.
        self.pa_granted = [false; NUM_SECTIONS];
    }

    fn hw_version(&self) -> u32 {
        let mut reg = drv_w77q_api::HwVerReg(0);
        reg.set_revision(0xB);
        reg.set_security_version(2);
        reg.set_flash_size(0x6);
        reg.set_flash_version(1);
        reg.0
    }

    fn next_nonce(&mut self) -> u64 {
        self.nonce_counter = self.nonce_counter.wrapping_add(0x9E37_79B9_7F4A_7C15);
        self.nonce_counter
    }

    // --- legacy command execution ---

    /// Resolves a legacy logical address to (section, physical index),
    /// honoring a fallback remap of the boot section.
    fn legacy_resolve(&self, logical: u32) -> (usize, usize) {
        let addr_size = self.addr_size();
        let mut section = ((logical >> addr_size) & 0x7) as usize;
        if self.fb_remap {
            section = match section {
                0 => 7,
                7 => 0,
                other => other,
            };
        }
        let offset = (logical & ((1 << addr_size) - 1)) as usize;
        let physical = self.section_base(section) as usize + offset;
        (section, physical)
    }

    fn plain_read_allowed(&self, section: usize) -> bool {
        self.pa_granted[section]
            && self.policy(section).plain_access_read
            && (self.aclr >> 16) & (1 << section) as u32 == 0
    }

    fn plain_write_allowed(&self, section: usize) -> bool {
        self.pa_granted[section]
            && self.policy(section).plain_access_write
            && self.aclr & (1 << section) as u32 == 0
    }

    fn legacy_read(&mut self, logical: u32, out: &mut [u8]) {
        let (section, physical) = self.legacy_resolve(logical);
        if !self.plain_read_allowed(section) {
            self.fail(SsrErrors::PRIV_ERR);
            out.fill(0);
            return;
        }
        let end = (physical + out.len()).min(self.memory.len());
        let span = end - physical;
        out[..span].copy_from_slice(&self.memory[physical..end]);
    }

    fn legacy_program(&mut self, logical: u32, data: &[u8]) {
        let (section, physical) = self.legacy_resolve(logical);
        if !self.plain_write_allowed(section) {
            self.fail(SsrErrors::PRIV_ERR);
            return;
        }
        for (i, byte) in data.iter().enumerate() {
            if physical + i < self.memory.len() {
                self.memory[physical + i] &= byte;
            }
        }
    }

    fn legacy_erase(&mut self, logical: u32, span: usize) {
        let (section, physical) = self.legacy_resolve(logical);
        if !self.plain_write_allowed(section) {
            self.fail(SsrErrors::PRIV_ERR);
            return;
        }
        let start = physical & !(span - 1);
        let end = (start + span).min(self.memory.len());
        self.memory[start..end].fill(0xFF);
    }
}

impl Platform for W77qSim {
    fn spi_transfer(
        &mut self,
        xfer: &SpiTransfer<'_>,
        data_in: &mut [u8],
    ) -> Result<(), TransportError> {
        let cmd = xfer.cmd;
        let addr = xfer.addr.map(|(a, _)| a).unwrap_or(0);

        // Powered down: only the release is heard.
        if self.powered_down && cmd != instr::RELEASE_POWER_DOWN {
            data_in.fill(0);
            return Ok(());
        }

        // A QPI-parked device only answers quad-framed commands; a
        // non-QPI device ignores QPI framing.
        if (xfer.mode == BusMode::Qpi) != self.qpi
            && !matches!(cmd, instr::ENTER_QPI | instr::EXIT_QPI | instr::RELEASE_POWER_DOWN)
        {
            data_in.fill(0);
            return Ok(());
        }

        // Secure opcodes: low nibble 0/1/2 on an instruction-lines mask.
        let lines = cmd & 0xF0;
        if cmd & 0x08 == 0
            && matches!(lines, 0xA0 | 0xB0 | 0xD0)
            && (cmd & 0x03) < 3
        {
            match cmd & 0x03 {
                0 => {
                    let ssr = self.serve_ssr();
                    let bytes = ssr.to_le_bytes();
                    let n = data_in.len().min(4);
                    data_in[..n].copy_from_slice(&bytes[..n]);
                }
                1 => self.op1(xfer.data_out),
                2 => {
                    let n = data_in.len().min(self.resp.len());
                    data_in[..n].copy_from_slice(&self.resp[..n]);
                    if self.corrupt_next_response && !data_in.is_empty() {
                        data_in[0] ^= 0x01;
                        self.corrupt_next_response = false;
                    }
                    self.resp_ready = false;
                }
                _ => unreachable!(),
            }
            return Ok(());
        }

        match cmd {
            instr::READ_JEDEC_ID => {
                let id = [WINBOND_MFR_ID, SECURE_MEMORY_TYPE, 0x16];
                let n = data_in.len().min(3);
                data_in[..n].copy_from_slice(&id[..n]);
            }
            instr::MFR_DEVICE_ID | instr::MFR_DEVICE_ID_DUAL | instr::MFR_DEVICE_ID_QUAD => {
                let id = [WINBOND_MFR_ID, 0x17];
                let n = data_in.len().min(2);
                data_in[..n].copy_from_slice(&id[..n]);
            }
            instr::READ_UNIQUE_ID => {
                let id = self.unique_id.to_le_bytes();
                let n = data_in.len().min(8);
                data_in[..n].copy_from_slice(&id[..n]);
            }
            instr::READ_STATUS_1 => {
                data_in.fill(0); // never busy: operations complete inline
            }
            instr::READ_STATUS_2 => {
                let sr2 = if self.suspended_erase { 0x80 } else { 0 };
                if let Some(out) = data_in.first_mut() {
                    *out = sr2;
                }
            }
            instr::READ_STATUS_3 => data_in.fill(0),
            instr::WRITE_STATUS_1 | instr::WRITE_STATUS_2 | instr::WRITE_STATUS_3 => {}
            instr::WRITE_ENABLE | instr::REGISTER_WRITE_ENABLE => {}
            instr::RELEASE_POWER_DOWN => {
                self.powered_down = false;
            }
            instr::POWER_DOWN => {
                self.powered_down = true;
            }
            instr::RESET_ENABLE => {
                self.reset_enabled = true;
            }
            instr::RESET_DEVICE => {
                if self.reset_enabled {
                    self.device_reset(false);
                }
            }
            instr::ENTER_QPI => {
                self.qpi = true;
            }
            instr::EXIT_QPI => {
                self.qpi = false;
            }
            instr::SET_READ_PARAMETERS => {}
            instr::ERASE_SUSPEND => {
                // Nothing in this model runs long enough to suspend;
                // the SUS bit stays clear and the driver reports the
                // command as ignored.
            }
            instr::ERASE_RESUME => {
                self.suspended_erase = false;
            }
            instr::READ
            | instr::FAST_READ
            | instr::FAST_READ_DTR
            | instr::FAST_READ_DUAL_OUT
            | instr::FAST_READ_DUAL_IO
            | instr::FAST_READ_DUAL_IO_DTR
            | instr::FAST_READ_QUAD_OUT
            | instr::FAST_READ_QUAD_IO
            | instr::FAST_READ_QUAD_IO_DTR => {
                self.legacy_read(addr, data_in);
            }
            instr::PAGE_PROGRAM => {
                let data = xfer.data_out.to_vec();
                self.legacy_program(addr, &data);
            }
            instr::SECTOR_ERASE => self.legacy_erase(addr, 4 * 1024),
            instr::BLOCK_ERASE_32K => self.legacy_erase(addr, 32 * 1024),
            instr::BLOCK_ERASE_64K => self.legacy_erase(addr, 64 * 1024),
            instr::CHIP_ERASE => {
                // Plain chip erase is not honored on the secure part.
                self.fail(SsrErrors::PRIV_ERR);
            }
            _ => {
                data_in.fill(0);
            }
        }
        Ok(())
    }

    fn hash(&mut self, digest: &mut [u8; 32], data: &[u8]) {
        sha3_hash(digest, data);
    }

    fn nonce(&mut self) -> u64 {
        self.next_nonce()
    }

    fn trace(&mut self, event: Trace) {
        self.trace_log.push(event);
    }
}
