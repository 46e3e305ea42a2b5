// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure command processor.
//!
//! Every secure command is an OP1 write of `CTAG ‖ params ‖ signature`,
//! an OP0 poll until BUSY clears, and — for response-bearing commands —
//! an OP2 read of the output buffer. The CTAG packs the command code,
//! per-command mode bits, the KID and a sub-selector; the signature is
//! computed over the `crypto` hash image with the transaction counter
//! the device will stamp.

use crate::bus::OP2_DUMMY_CYCLES;
use crate::crypto::{self, PendingResponse};
use crate::transport::{Platform, SpiTransfer, Trace};
use crate::SecureFlash;
use drv_w77q_api::{
    Aclr, AwdtCfg, AwdtSr, EraseType, Gmc, Gmt, Key, KeyId, Scr, SecCmd, SignedDataType, Ssr,
    SsrErrors, W77qError, BLOCK_32K_SIZE, BLOCK_64K_SIZE, SECTOR_SIZE, SECURE_PAGE_SIZE,
};
use zerocopy::IntoBytes;

/// Poll budget while a secure command executes, in OP0 reads.
const SEC_BUSY_POLLS: u32 = 100_000;

/// Largest OP1 parameter block: a 64-byte reset-response half.
const MAX_PARAMS: usize = 64;

pub(crate) fn make_ctag(cmd: SecCmd, mode: u8, kid: u8, aux: u8) -> u32 {
    u32::from_le_bytes([cmd as u8, mode, kid, aux])
}

impl<'k, P: Platform> SecureFlash<'k, P> {
    fn op0_read_ssr(&mut self) -> Result<Ssr, W77qError> {
        let xfer = SpiTransfer {
            mode: self.bus.secure_format,
            dtr: self.bus.dtr,
            cmd: self.bus.op0,
            addr: None,
            data_out: &[],
            dummy_cycles: self.bus.op0_dummy_cycles(),
        };
        let mut raw = [0u8; 4];
        self.transfer(&xfer, &mut raw)?;
        let ssr = Ssr(u32::from_le_bytes(raw));
        self.ssr = ssr;
        Ok(ssr)
    }

    /// Maps latched SSR error bits to a typed error. `check` is the set
    /// of stickies the caller is not prepared to tolerate.
    pub(crate) fn ssr_status(&mut self, ssr: Ssr, check: SsrErrors) -> Result<(), W77qError> {
        let errs = ssr.errors().intersection(check);
        if !errs.is_empty() {
            self.platform.trace(Trace::SsrErrors(errs));
        }
        if errs.contains(SsrErrors::SES_ERR) {
            Err(W77qError::DeviceSessionErr)
        } else if errs.contains(SsrErrors::INTG_ERR) {
            Err(W77qError::DeviceIntegrityErr)
        } else if errs.contains(SsrErrors::AUTH_ERR) {
            Err(W77qError::DeviceAuthenticationErr)
        } else if errs.contains(SsrErrors::PRIV_ERR) {
            Err(W77qError::DevicePrivilegeErr)
        } else if errs.contains(SsrErrors::IGNORE_ERR) {
            Err(W77qError::CommandIgnored)
        } else if errs.contains(SsrErrors::SYS_ERR) || errs.contains(SsrErrors::FLASH_ERR) {
            Err(W77qError::DeviceSystemErr)
        } else if errs.contains(SsrErrors::MC_ERR) {
            Err(W77qError::DeviceMcErr)
        } else if ssr.err() && !check.is_empty() {
            // The non-sticky summary bit with no decodable cause.
            Err(W77qError::DeviceSystemErr)
        } else {
            Ok(())
        }
    }

    /// Reads the SSR and screens it against `check`. Reading always
    /// clears the device's sticky latches; an empty `check` is how the
    /// engine discards stale errors (e.g. after autosense probing).
    pub(crate) fn get_ssr(&mut self, check: SsrErrors) -> Result<Ssr, W77qError> {
        let ssr = self.op0_read_ssr()?;
        self.ssr_status(ssr, check)?;
        Ok(ssr)
    }

    fn sec_wait_done(&mut self, check: SsrErrors) -> Result<Ssr, W77qError> {
        for _ in 0..SEC_BUSY_POLLS {
            let ssr = self.op0_read_ssr()?;
            if !ssr.busy() {
                self.ssr_status(ssr, check)?;
                return Ok(ssr);
            }
        }
        Err(W77qError::CommandIgnored)
    }

    fn op1_write(
        &mut self,
        ctag: u32,
        params: &[u8],
        sig: Option<u64>,
    ) -> Result<(), W77qError> {
        debug_assert!(params.len() <= MAX_PARAMS);
        let mut buf = [0u8; 4 + MAX_PARAMS + 8];
        buf[..4].copy_from_slice(&ctag.to_le_bytes());
        buf[4..4 + params.len()].copy_from_slice(params);
        let mut len = 4 + params.len();
        if let Some(sig) = sig {
            buf[len..len + 8].copy_from_slice(&sig.to_le_bytes());
            len += 8;
        }

        let xfer = SpiTransfer {
            mode: self.bus.secure_format,
            dtr: false,
            cmd: self.bus.op1,
            addr: None,
            data_out: &buf[..len],
            dummy_cycles: 0,
        };
        self.transfer(&xfer, &mut [])
    }

    fn op2_read(&mut self, data_in: &mut [u8]) -> Result<(), W77qError> {
        let xfer = SpiTransfer {
            mode: self.bus.secure_format,
            dtr: self.bus.dtr,
            cmd: self.bus.op2,
            addr: None,
            data_out: &[],
            dummy_cycles: OP2_DUMMY_CYCLES,
        };
        self.transfer(&xfer, data_in)
    }

    /// Submits a signed command. The transaction counter is stamped as
    /// `tc + 1` and committed only once the transport accepts the
    /// transfer, so a failure to transmit leaves host and device agreed.
    fn sec_cmd_signed(
        &mut self,
        ctag: u32,
        params: &[u8],
        key_override: Option<&Key>,
    ) -> Result<PendingResponse, W77qError> {
        let stamped = self.mc.tc.checked_add(1).ok_or(W77qError::DeviceMcErr)?;
        let key = *key_override.unwrap_or_else(|| self.keys.session_key());

        let platform = &mut self.platform;
        let sig =
            crypto::command_signature(|d, m| platform.hash(d, m), &key, ctag, params, stamped);

        self.op1_write(ctag, params, Some(sig))?;
        self.mc.tc = stamped;
        Ok(PendingResponse::new(key, ctag, stamped))
    }

    /// Signed command with no response payload.
    fn sec_cmd_write_only(
        &mut self,
        ctag: u32,
        params: &[u8],
        check: SsrErrors,
    ) -> Result<(), W77qError> {
        let pending = self.sec_cmd_signed(ctag, params, None)?;
        let result = self.sec_wait_done(check);
        pending.done();
        result.map(|_| ())
    }

    /// Signed command whose response is `out.len()` payload bytes plus a
    /// 64-bit signature, verified against the commanding TC.
    fn sec_cmd_read(
        &mut self,
        ctag: u32,
        params: &[u8],
        out: &mut [u8],
    ) -> Result<(), W77qError> {
        debug_assert!(out.len() <= 32);
        let pending = self.sec_cmd_signed(ctag, params, None)?;
        let ssr = match self.sec_wait_done(SsrErrors::all()) {
            Ok(ssr) => ssr,
            Err(e) => {
                pending.done();
                return Err(e);
            }
        };
        if !ssr.resp_ready() {
            pending.done();
            return Err(W77qError::DeviceSystemErr);
        }

        let mut buf = [0u8; 32 + 8];
        let n = out.len();
        self.op2_read(&mut buf[..n + 8])?;
        let sig = u64::from_le_bytes(buf[n..n + 8].try_into().unwrap_or_default());

        let tc = pending.tc();
        let platform = &mut self.platform;
        pending.verify(|d, m| platform.hash(d, m), &buf[..n], tc, sig)?;
        out.copy_from_slice(&buf[..n]);
        Ok(())
    }

    /// Unsigned command (no session binding, no signature).
    fn sec_cmd_unsigned(
        &mut self,
        ctag: u32,
        params: &[u8],
        check: SsrErrors,
    ) -> Result<Ssr, W77qError> {
        self.op1_write(ctag, params, None)?;
        self.sec_wait_done(check)
    }

    /// Unsigned getter: response payload only, nothing to verify.
    fn sec_get_unsigned(&mut self, ctag: u32, out: &mut [u8]) -> Result<(), W77qError> {
        let ssr = self.sec_cmd_unsigned(ctag, &[], SsrErrors::all())?;
        if !ssr.resp_ready() {
            return Err(W77qError::DeviceSystemErr);
        }
        self.op2_read(out)
    }

    /// True when gets should run signed: a section-key session binds the
    /// device's answers to the session.
    pub(crate) fn signed_gets(&self) -> bool {
        self.keys.kid().is_section_key()
    }

    /// CALC_SIG: fetch a signed copy of a device data object.
    pub(crate) fn calc_sig(
        &mut self,
        ty: SignedDataType,
        section: u8,
        out: &mut [u8],
    ) -> Result<(), W77qError> {
        debug_assert_eq!(out.len(), ty.size());
        let ctag = make_ctag(SecCmd::CalcSig, ty.id(section), self.keys.kid().raw(), 0);
        self.platform.trace(Trace::SecCommand(SecCmd::CalcSig));
        self.sec_cmd_read(ctag, &[], out)
    }

    // --- monotonic counter ---

    fn cmd_get_mc_unsigned(&mut self) -> Result<(u32, u32), W77qError> {
        let ctag = make_ctag(SecCmd::GetMc, 0, 0, 0);
        let mut buf = [0u8; 8];
        self.sec_get_unsigned(ctag, &mut buf)?;
        Ok((
            u32::from_le_bytes(buf[..4].try_into().unwrap_or_default()),
            u32::from_le_bytes(buf[4..].try_into().unwrap_or_default()),
        ))
    }

    /// Brings the counter shadow back in sync with the device. No-op
    /// while the shadow is known good: every accepted command advances
    /// both sides together.
    pub(crate) fn sync_mc(&mut self) -> Result<(), W77qError> {
        if self.mc.in_sync {
            return Ok(());
        }
        let (tc, dmc) = if self.signed_gets() {
            let mut buf = [0u8; 8];
            self.calc_sig(SignedDataType::Mc, 0, &mut buf)?;
            (
                u32::from_le_bytes(buf[..4].try_into().unwrap_or_default()),
                u32::from_le_bytes(buf[4..].try_into().unwrap_or_default()),
            )
        } else {
            self.cmd_get_mc_unsigned()?
        };
        self.mc.tc = tc;
        self.mc.dmc = dmc;
        self.mc.in_sync = true;
        self.platform.trace(Trace::McSynced { tc, dmc });
        Ok(())
    }

    pub(crate) fn cmd_mc_maint(&mut self) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::McMaint, 0, 0, 0);
        self.sec_cmd_unsigned(ctag, &[], SsrErrors::all())?;
        Ok(())
    }

    // --- session ---

    /// SESSION_OPEN exchange. Returns the derived session key on
    /// success; the device proves it derived the same key by signing its
    /// nonce response with it. A latched integrity error (stale SCR, key
    /// still correct) is reported alongside the opened session.
    pub(crate) fn cmd_session_open(
        &mut self,
        kid: KeyId,
        key: &Key,
        mode: drv_w77q_api::OpenMode,
        host_nonce: u64,
    ) -> Result<(Key, bool), W77qError> {
        let mut params = [0u8; 9];
        params[..8].copy_from_slice(&host_nonce.to_le_bytes());
        params[8] = mode.bits();

        let ctag = make_ctag(SecCmd::SessionOpen, mode.bits(), kid.raw(), 0);
        self.platform.trace(Trace::SecCommand(SecCmd::SessionOpen));
        let pending = self.sec_cmd_signed(ctag, &params, Some(key))?;

        // Integrity is tolerated here and surfaced to the caller; every
        // other sticky is fatal.
        let check = SsrErrors::all().difference(SsrErrors::INTG_ERR);
        let ssr = match self.sec_wait_done(check) {
            Ok(ssr) => ssr,
            Err(e) => {
                pending.done();
                return Err(e);
            }
        };
        let integrity_err = ssr.errors().contains(SsrErrors::INTG_ERR);
        if !ssr.resp_ready() {
            pending.done();
            return Err(W77qError::DeviceSessionErr);
        }

        let mut resp = [0u8; 12 + 8];
        self.op2_read(&mut resp)?;
        let device_nonce = u64::from_le_bytes(resp[..8].try_into().unwrap_or_default());
        let sig = u64::from_le_bytes(resp[12..20].try_into().unwrap_or_default());

        let wid = mode
            .contains(drv_w77q_api::OpenMode::INCLUDE_WID)
            .then_some(self.wid);
        let tc = pending.tc();
        pending.done();

        let platform = &mut self.platform;
        let session_key = crypto::derive_session_key(
            |d, m| platform.hash(d, m),
            key,
            host_nonce,
            device_nonce,
            wid,
        );

        // Key confirmation: the response is signed with the session key
        // both ends just derived.
        let expected = {
            let platform = &mut self.platform;
            crypto::command_signature(
                |d, m| platform.hash(d, m),
                &session_key,
                ctag,
                &resp[..12],
                tc,
            )
        };
        if expected != sig {
            return Err(W77qError::DeviceAuthenticationErr);
        }

        Ok((session_key, integrity_err))
    }

    pub(crate) fn cmd_session_close(
        &mut self,
        kid: KeyId,
        revoke_pa: bool,
    ) -> Result<(), W77qError> {
        let mode = if revoke_pa {
            drv_w77q_api::CloseMode::REVOKE_PLAIN_ACCESS.bits()
        } else {
            0
        };
        let ctag = make_ctag(SecCmd::SessionClose, mode, kid.raw(), 0);
        self.platform.trace(Trace::SecCommand(SecCmd::SessionClose));
        self.sec_cmd_write_only(ctag, &[], SsrErrors::all())
    }

    // --- register access ---

    pub(crate) fn cmd_get_gmt_unsigned(&mut self) -> Result<Gmt, W77qError> {
        let ctag = make_ctag(SecCmd::GetGmt, 0, 0, 0);
        let mut gmt = Gmt::default();
        self.sec_get_unsigned(ctag, gmt.as_mut_bytes())?;
        Ok(gmt)
    }

    pub(crate) fn get_gmt(&mut self) -> Result<Gmt, W77qError> {
        if self.signed_gets() {
            let mut gmt = Gmt::default();
            self.calc_sig(SignedDataType::Gmt, 0, gmt.as_mut_bytes())?;
            Ok(gmt)
        } else {
            self.cmd_get_gmt_unsigned()
        }
    }

    pub(crate) fn cmd_set_gmt(&mut self, gmt: &Gmt) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::SetGmt, 0, self.keys.kid().raw(), 0);
        let bytes: [u8; 20] = gmt
            .as_bytes()
            .try_into()
            .map_err(|_| W77qError::InvalidParameter)?;
        self.sec_cmd_write_only(ctag, &bytes, SsrErrors::all())
    }

    pub(crate) fn cmd_get_gmc_unsigned(&mut self) -> Result<Gmc, W77qError> {
        let ctag = make_ctag(SecCmd::GetGmc, 0, 0, 0);
        let mut gmc = Gmc::default();
        self.sec_get_unsigned(ctag, gmc.as_mut_bytes())?;
        Ok(gmc)
    }

    pub(crate) fn get_gmc(&mut self) -> Result<Gmc, W77qError> {
        if self.signed_gets() {
            let mut gmc = Gmc::default();
            self.calc_sig(SignedDataType::Gmc, 0, gmc.as_mut_bytes())?;
            Ok(gmc)
        } else {
            self.cmd_get_gmc_unsigned()
        }
    }

    pub(crate) fn cmd_set_gmc(&mut self, gmc: &Gmc) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::SetGmc, 0, self.keys.kid().raw(), 0);
        let bytes: [u8; 20] = gmc
            .as_bytes()
            .try_into()
            .map_err(|_| W77qError::InvalidParameter)?;
        self.sec_cmd_write_only(ctag, &bytes, SsrErrors::all())
    }

    pub(crate) fn cmd_get_scr_unsigned(&mut self, section: u8) -> Result<Scr, W77qError> {
        let ctag = make_ctag(SecCmd::GetScr, 0, 0, section);
        let mut scr = Scr::default();
        self.sec_get_unsigned(ctag, scr.as_mut_bytes())?;
        Ok(scr)
    }

    pub(crate) fn get_scr(&mut self, section: u8) -> Result<Scr, W77qError> {
        if self.signed_gets() {
            let mut scr = Scr::default();
            self.calc_sig(SignedDataType::SectionConfig, section, scr.as_mut_bytes())?;
            Ok(scr)
        } else {
            self.cmd_get_scr_unsigned(section)
        }
    }

    /// SET_SCR / SET_SCR_SWAP. Mode bit 0 requests a reset after the
    /// swap, bit 1 re-grants plain access under the fresh configuration.
    /// The device closes the session as a side effect; callers mirror
    /// that.
    pub(crate) fn cmd_set_scr(
        &mut self,
        section: u8,
        scr: &Scr,
        swap: bool,
        reset_after: bool,
        init_pa: bool,
    ) -> Result<(), W77qError> {
        let cmd = if swap { SecCmd::SetScrSwap } else { SecCmd::SetScr };
        let mode = (reset_after as u8) | ((init_pa as u8) << 1);
        let ctag = make_ctag(cmd, mode, self.keys.kid().raw(), section);
        let bytes: [u8; 20] = scr
            .as_bytes()
            .try_into()
            .map_err(|_| W77qError::InvalidParameter)?;
        self.platform.trace(Trace::SecCommand(cmd));
        self.sec_cmd_write_only(ctag, &bytes, SsrErrors::all())
    }

    pub(crate) fn cmd_set_key(&mut self, kid: KeyId, key: &Key) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::SetKey, 0, self.keys.kid().raw(), kid.raw());
        let mut params = [0u8; 17];
        params[0] = kid.raw();
        for (i, word) in key.iter().enumerate() {
            params[1 + i * 4..5 + i * 4].copy_from_slice(&word.to_le_bytes());
        }
        self.platform.trace(Trace::SecCommand(SecCmd::SetKey));
        self.sec_cmd_write_only(ctag, &params, SsrErrors::all())
    }

    pub(crate) fn cmd_get_wid_unsigned(&mut self) -> Result<u64, W77qError> {
        let ctag = make_ctag(SecCmd::GetWid, 0, 0, 0);
        let mut buf = [0u8; 8];
        self.sec_get_unsigned(ctag, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn get_suid(&mut self) -> Result<[u8; 16], W77qError> {
        let mut suid = [0u8; 16];
        if self.signed_gets() {
            self.calc_sig(SignedDataType::Suid, 0, &mut suid)?;
        } else {
            let ctag = make_ctag(SecCmd::GetSuid, 0, 0, 0);
            self.sec_get_unsigned(ctag, &mut suid)?;
        }
        Ok(suid)
    }

    pub(crate) fn cmd_set_suid(&mut self, suid: &[u8; 16]) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::SetSuid, 0, self.keys.kid().raw(), 0);
        self.sec_cmd_write_only(ctag, suid, SsrErrors::all())
    }

    pub(crate) fn get_hw_ver_reg(&mut self) -> Result<u32, W77qError> {
        let mut buf = [0u8; 4];
        if self.signed_gets() {
            self.calc_sig(SignedDataType::HwVer, 0, &mut buf)?;
        } else {
            let ctag = make_ctag(SecCmd::GetVersion, 0, 0, 0);
            self.sec_get_unsigned(ctag, &mut buf)?;
        }
        Ok(u32::from_le_bytes(buf))
    }

    pub(crate) fn cmd_get_aclr(&mut self) -> Result<Aclr, W77qError> {
        let ctag = make_ctag(SecCmd::GetAclr, 0, 0, 0);
        let mut buf = [0u8; 4];
        self.sec_get_unsigned(ctag, &mut buf)?;
        Ok(Aclr(u32::from_le_bytes(buf)))
    }

    pub(crate) fn cmd_set_aclr(&mut self, aclr: Aclr) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::SetAclr, 0, 0, 0);
        self.sec_cmd_unsigned(ctag, &aclr.0.to_le_bytes(), SsrErrors::all())?;
        Ok(())
    }

    pub(crate) fn cmd_set_rst_resp(
        &mut self,
        first_half: bool,
        data: &[u8; 64],
    ) -> Result<(), W77qError> {
        let half = if first_half { 0 } else { 1 };
        let ctag = make_ctag(SecCmd::SetRstResp, half, self.keys.kid().raw(), 0);
        self.sec_cmd_write_only(ctag, data, SsrErrors::all())
    }

    pub(crate) fn cmd_get_rst_resp(&mut self, first_half: bool) -> Result<[u8; 64], W77qError> {
        let half = if first_half { 0 } else { 1 };
        let ctag = make_ctag(SecCmd::GetRstResp, half, 0, 0);
        let mut buf = [0u8; 64];
        self.sec_get_unsigned(ctag, &mut buf)?;
        Ok(buf)
    }

    // --- watchdog ---

    pub(crate) fn get_awdt_cfg(&mut self) -> Result<AwdtCfg, W77qError> {
        let mut buf = [0u8; 4];
        if self.signed_gets() {
            self.calc_sig(SignedDataType::AwdtCfg, 0, &mut buf)?;
        } else {
            let ctag = make_ctag(SecCmd::GetAwdt, 0, 0, 0);
            self.sec_get_unsigned(ctag, &mut buf)?;
        }
        Ok(AwdtCfg(u32::from_le_bytes(buf)))
    }

    pub(crate) fn cmd_set_awdt(&mut self, cfg: AwdtCfg) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::SetAwdt, 0, self.keys.kid().raw(), 0);
        self.sec_cmd_write_only(ctag, &cfg.0.to_le_bytes(), SsrErrors::all())
    }

    pub(crate) fn cmd_set_awdt_plain(&mut self, cfg: AwdtCfg) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::SetAwdtPlain, 0, 0, 0);
        self.sec_cmd_unsigned(ctag, &cfg.0.to_le_bytes(), SsrErrors::all())?;
        Ok(())
    }

    pub(crate) fn cmd_awdt_touch(&mut self) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::AwdtTouch, 0, self.keys.kid().raw(), 0);
        self.sec_cmd_write_only(ctag, &[], SsrErrors::all())
    }

    pub(crate) fn cmd_awdt_touch_plain(&mut self) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::AwdtTouchPlain, 0, 0, 0);
        self.sec_cmd_unsigned(ctag, &[], SsrErrors::all())?;
        Ok(())
    }

    pub(crate) fn cmd_awdt_expire(&mut self) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::AwdtExpire, 0, 0, 0);
        self.sec_cmd_unsigned(ctag, &[], SsrErrors::all())?;
        Ok(())
    }

    pub(crate) fn cmd_get_awdtsr(&mut self) -> Result<AwdtSr, W77qError> {
        let ctag = make_ctag(SecCmd::GetAwdtSr, 0, 0, 0);
        let mut buf = [0u8; 4];
        self.sec_get_unsigned(ctag, &mut buf)?;
        Ok(AwdtSr(u32::from_le_bytes(buf)))
    }

    // --- sections, integrity, format ---

    pub(crate) fn cmd_init_section_pa(&mut self, section: u8) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::InitSectionPlain, 0, 0, section);
        self.sec_cmd_unsigned(ctag, &[], SsrErrors::all())?;
        Ok(())
    }

    pub(crate) fn cmd_ver_intg(&mut self, section: u8) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::VerifyIntegrity, 0, self.keys.kid().raw(), section);
        self.platform
            .trace(Trace::SecCommand(SecCmd::VerifyIntegrity));
        self.sec_cmd_write_only(ctag, &[], SsrErrors::all())
    }

    pub(crate) fn cmd_calc_cdi(&mut self, section: u8) -> Result<[u8; 32], W77qError> {
        let ctag = make_ctag(SecCmd::CalcCdi, 0, self.keys.kid().raw(), section);
        self.platform.trace(Trace::SecCommand(SecCmd::CalcCdi));
        let mut cdi = [0u8; 32];
        self.sec_cmd_read(ctag, &[], &mut cdi)?;
        Ok(cdi)
    }

    pub(crate) fn cmd_secure_format(&mut self) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::SecureFormat, 0, self.keys.kid().raw(), 0);
        self.platform.trace(Trace::SecCommand(SecCmd::SecureFormat));
        self.sec_cmd_write_only(ctag, &[], SsrErrors::all())
    }

    pub(crate) fn cmd_format_plain(&mut self) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::Format, 0, 0, 0);
        self.platform.trace(Trace::SecCommand(SecCmd::Format));
        self.sec_cmd_unsigned(ctag, &[], SsrErrors::all())?;
        Ok(())
    }

    pub(crate) fn cmd_erase_section_plain(&mut self, section: u8) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::EraseSectionPlain, 0, 0, section);
        self.sec_cmd_unsigned(ctag, &[], SsrErrors::all())?;
        Ok(())
    }

    // --- data path ---

    fn cmd_srd(&mut self, addr: u32, out: &mut [u8]) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::SecureRead, 0, self.keys.kid().raw(), 0);
        self.sec_cmd_read(ctag, &addr.to_le_bytes(), out)
    }

    /// Authenticated page read: the device echoes the TC it stamped,
    /// which both keys the signature and defeats response replay.
    fn cmd_sard(&mut self, addr: u32, out: &mut [u8]) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::SecureReadAuth, 0, self.keys.kid().raw(), 0);
        let pending = self.sec_cmd_signed(ctag, &addr.to_le_bytes(), None)?;
        let ssr = match self.sec_wait_done(SsrErrors::all()) {
            Ok(ssr) => ssr,
            Err(e) => {
                pending.done();
                return Err(e);
            }
        };
        if !ssr.resp_ready() {
            pending.done();
            return Err(W77qError::DeviceSystemErr);
        }

        let mut buf = [0u8; 4 + 32 + 8];
        self.op2_read(&mut buf)?;
        let tc_echo = u32::from_le_bytes(buf[..4].try_into().unwrap_or_default());
        let sig = u64::from_le_bytes(buf[36..44].try_into().unwrap_or_default());

        let stamped = pending.tc();
        let platform = &mut self.platform;
        pending.verify(|d, m| platform.hash(d, m), &buf[4..36], tc_echo, sig)?;
        if tc_echo != stamped {
            return Err(W77qError::DeviceAuthenticationErr);
        }
        out.copy_from_slice(&buf[4..36]);
        Ok(())
    }

    fn cmd_sawr(&mut self, addr: u32, page: &[u8; SECURE_PAGE_SIZE]) -> Result<(), W77qError> {
        let ctag = make_ctag(SecCmd::SecureWrite, 0, self.keys.kid().raw(), 0);
        let mut params = [0u8; 4 + SECURE_PAGE_SIZE];
        params[..4].copy_from_slice(&addr.to_le_bytes());
        params[4..].copy_from_slice(page);
        self.sec_cmd_write_only(ctag, &params, SsrErrors::all())
    }

    pub(crate) fn cmd_serase(&mut self, erase: EraseType, addr: u32) -> Result<(), W77qError> {
        let cmd = match erase {
            EraseType::Sector4K => SecCmd::SecureErase4K,
            EraseType::Block32K => SecCmd::SecureErase32K,
            EraseType::Block64K => SecCmd::SecureErase64K,
            EraseType::Section => SecCmd::SecureEraseSection,
            EraseType::Chip => SecCmd::SecureEraseAll,
        };
        let ctag = make_ctag(cmd, 0, self.keys.kid().raw(), 0);
        self.platform.trace(Trace::SecCommand(cmd));
        self.sec_cmd_write_only(ctag, &addr.to_le_bytes(), SsrErrors::all())
    }

    fn with_multi_transaction<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, W77qError>,
    ) -> Result<R, W77qError> {
        self.multi_transaction = true;
        let result = f(self);
        self.multi_transaction = false;
        result
    }

    /// Secure read of an arbitrary byte range, decomposed into 32-byte
    /// authenticated pages: a staged head for any misaligned prefix, a
    /// run of whole pages read straight into the caller's buffer, and a
    /// staged tail.
    pub(crate) fn secure_read(
        &mut self,
        buf: &mut [u8],
        section: u8,
        offset: u32,
        auth: bool,
    ) -> Result<(), W77qError> {
        if !self.keys.session_is_open() {
            return Err(W77qError::DeviceSessionErr);
        }
        if !self.keys.is_section_session(section) {
            return Err(W77qError::DevicePrivilegeErr);
        }

        self.with_multi_transaction(|this| {
            let page = SECURE_PAGE_SIZE as u32;
            let head = (offset % page) as usize;

            let read_page = |this: &mut Self, addr: u32, out: &mut [u8]| {
                if auth {
                    this.cmd_sard(addr, out)
                } else {
                    this.cmd_srd(addr, out)
                }
            };

            if head == 0 && buf.len() % SECURE_PAGE_SIZE == 0 {
                // Aligned fast path: no staging copy.
                let mut addr = offset;
                for chunk in buf.chunks_exact_mut(SECURE_PAGE_SIZE) {
                    read_page(this, addr, chunk)?;
                    addr += page;
                }
                return Ok(());
            }

            let mut staged = [0u8; SECURE_PAGE_SIZE];
            let mut addr = offset - head as u32;
            let mut in_page = head;
            let mut remaining = buf;
            while !remaining.is_empty() {
                let take = remaining.len().min(SECURE_PAGE_SIZE - in_page);
                read_page(this, addr, &mut staged)?;
                let (dst, rest) = remaining.split_at_mut(take);
                dst.copy_from_slice(&staged[in_page..in_page + take]);
                remaining = rest;
                addr += page;
                in_page = 0;
            }
            Ok(())
        })
    }

    /// Secure write in 32-byte pages; partial pages are padded with 0xFF
    /// so untouched bytes stay erased.
    pub(crate) fn secure_write(
        &mut self,
        data: &[u8],
        section: u8,
        offset: u32,
    ) -> Result<(), W77qError> {
        if !self.keys.session_is_open() {
            return Err(W77qError::DeviceSessionErr);
        }
        if !self.keys.is_section_full_access(section) {
            return Err(W77qError::DevicePrivilegeErr);
        }

        self.with_multi_transaction(|this| {
            let page = SECURE_PAGE_SIZE as u32;
            let mut in_page = (offset % page) as usize;
            let mut addr = offset - in_page as u32;
            let mut remaining = data;

            while !remaining.is_empty() {
                let take = remaining.len().min(SECURE_PAGE_SIZE - in_page);
                let mut staged = [0xFFu8; SECURE_PAGE_SIZE];
                staged[in_page..in_page + take].copy_from_slice(&remaining[..take]);
                this.cmd_sawr(addr, &staged)?;
                remaining = &remaining[take..];
                addr += page;
                in_page = 0;
            }
            Ok(())
        })
    }

    /// Greedy decomposition of `[offset, offset + size)` into the
    /// largest aligned secure erase units.
    pub(crate) fn secure_erase(&mut self, mut offset: u32, mut size: u32) -> Result<(), W77qError> {
        while size > 0 {
            let (erase, step) = if size >= BLOCK_64K_SIZE && offset % BLOCK_64K_SIZE == 0 {
                (EraseType::Block64K, BLOCK_64K_SIZE)
            } else if size >= BLOCK_32K_SIZE && offset % BLOCK_32K_SIZE == 0 {
                (EraseType::Block32K, BLOCK_32K_SIZE)
            } else {
                (EraseType::Sector4K, SECTOR_SIZE)
            };
            self.cmd_serase(erase, offset)?;
            offset += step;
            size -= step;
        }
        Ok(())
    }
}
