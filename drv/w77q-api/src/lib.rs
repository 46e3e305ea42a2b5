// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API crate for the Winbond W77Q secure flash driver.
//!
//! This crate holds everything shared between the driver core, device
//! models, and callers: the error taxonomy, key identifiers, bus modes,
//! command opcodes, device register layouts, and the configuration types
//! handed to the driver's provisioning operations.

#![cfg_attr(not(test), no_std)]

use hubpack::SerializedSize;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

pub mod regs;

pub use regs::{
    Aclr, AwdtCfg, AwdtSr, DevCfg, Gmc, Gmt, HwVerReg, Scr, Smr, Ssr, SsrErrors, Sspr,
};

/// Number of independently mapped and keyed flash sections.
pub const NUM_SECTIONS: usize = 8;

/// Size in bytes of one authenticated page: every secure read and write
/// moves exactly this much data per transaction.
pub const SECURE_PAGE_SIZE: usize = 32;

/// Size in bytes of a legacy program page.
pub const LEGACY_PAGE_SIZE: usize = 256;

/// Erase granularities supported by the secure erase command set.
pub const SECTOR_SIZE: u32 = 4 * 1024;
pub const BLOCK_32K_SIZE: u32 = 32 * 1024;
pub const BLOCK_64K_SIZE: u32 = 64 * 1024;

/// Section base addresses are expressed in 64 KiB tags but must sit on a
/// 256 KiB boundary; sizes are power-of-two multiples of 256 KiB.
pub const SECTION_BASE_GRANULARITY: u32 = 64 * 1024;
pub const SECTION_ALIGNMENT: u32 = 256 * 1024;

/// Total addressable flash size for the W77Q32 part.
pub const FLASH_SIZE: u32 = 4 * 1024 * 1024;

/// Legacy logical addresses carry a 3-bit section id above an offset of
/// `addr_size` bits; the offset width is device-configured within this
/// range (512 KiB through 16 MiB per section).
pub const MIN_STD_ADDR_BITS: u8 = 19;
pub const MAX_STD_ADDR_BITS: u8 = 24;

/// Manufacturer byte returned by the various read-id commands.
pub const WINBOND_MFR_ID: u8 = 0xEF;

/// JEDEC memory-type byte that distinguishes the secure W77Q family from
/// plain serial flash.
pub const SECURE_MEMORY_TYPE: u8 = 0x8A;

/// Transaction-counter value at which the caller is told to schedule a
/// device reset, and the counter ceiling itself.
pub const TC_RESET_THRESHOLD: u32 = 0xFFFF_FFF0;

/// Device-maintenance-counter value at which the device is near end of
/// life and should be replaced.
pub const DMC_EOL_THRESHOLD: u32 = 0x3FFF_F000;

/// Payload bounds of a single secure SPI exchange. Transports with smaller
/// controllers must split transparently.
pub const MAX_SECURE_OUT_SIZE: usize = 40;
pub const MAX_RESET_RESP_OUT_SIZE: usize = 72;
pub const MAX_SECURE_IN_SIZE: usize = 44;

/// A 128-bit key, stored as the device consumes it.
pub type Key = [u32; 4];

/// The factory default of every key slot.
pub const DEFAULT_KEY: Key = [0xFFFF_FFFF; 4];

/// A key must be loaded and non-zero to be usable.
pub fn key_is_valid(key: &Key) -> bool {
    key.iter().any(|&w| w != 0)
}

/// Errors produced by driver operations.
///
/// The device-prefixed variants are decoded from the sticky error bits of
/// the secure status register; the rest are raised host-side before any
/// SPI traffic happens.
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
pub enum W77qError {
    InvalidParameter = 1,
    ParameterOutOfRange,
    InvalidDataAlignment,
    InvalidDataSize,
    DeviceSessionErr,
    DevicePrivilegeErr,
    DeviceAuthenticationErr,
    DeviceIntegrityErr,
    DeviceMcErr,
    DeviceSystemErr,
    SecurityErr,
    IncorrectState,
    CommandIgnored,
    NotConnected,
    ConnectivityErr,
    NotSupported,
    TestFail,
}

/// SPI bus mode. The discriminant encodes the instruction-lines nibble the
/// secure opcodes are built from: 0xA0 single, 0xB0 dual, 0xD0 quad.
#[derive(
    Copy, Clone, Debug, Default, FromPrimitive, Eq, PartialEq, Serialize, Deserialize,
    SerializedSize,
)]
#[repr(u8)]
pub enum BusMode {
    #[default]
    Invalid = 0,
    /// Single lines for command, address and data.
    Single = 0xA1,
    /// Single command and address, dual data.
    Dual1_1_2 = 0xB2,
    /// Single command, dual address and data.
    Dual1_2_2 = 0xB3,
    /// Single command and address, quad data.
    Quad1_1_4 = 0xD4,
    /// Single command, quad address and data.
    Quad1_4_4 = 0xD5,
    /// Quad everything (QPI).
    Qpi = 0xD6,
}

impl BusMode {
    /// The instruction-lines nibble mixed into secure opcodes.
    pub fn lines_mask(self) -> u8 {
        (self as u8) & 0xF0
    }

    pub fn is_quad(self) -> bool {
        self.lines_mask() == 0xD0
    }
}

/// Bus mode plus transfer-rate selection, as handed to `set_interface`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize)]
pub struct BusFormat {
    pub mode: BusMode,
    pub dtr: bool,
    /// Permit entering/exiting QPI mode to honor `mode`.
    pub switch_qpi: bool,
}

impl BusFormat {
    pub const fn new(mode: BusMode) -> Self {
        Self {
            mode,
            dtr: false,
            switch_qpi: false,
        }
    }
}

/// Session access class requested from `open_session`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionAccess {
    /// Open with the section's restricted key.
    Restricted,
    /// Open with the full key, but ignore SCR validity; used while
    /// configuring a section whose integrity data is not yet written.
    ConfigOnly,
    /// Open with the section's full-access key.
    Full,
}

/// What to erase.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EraseType {
    Sector4K,
    Block32K,
    Block64K,
    Section,
    Chip,
}

/// Integrity check flavor for `check_integrity`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IntegrityCheck {
    Crc,
    Digest,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PowerState {
    Up,
    Down,
}

/// Whether a section reconfiguration also swaps the section halves, and
/// whether the device resets afterwards.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Swap {
    None,
    Swap,
    SwapAndReset,
}

/// Key-slot classes addressable by a KID byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KeyKind {
    RestrictedSection,
    FullAccessSection,
    SectionProvisioning,
    DeviceSecret,
    DeviceMaster,
    DeviceKeyProvisioning,
    Invalid,
}

/// A key identifier: the byte the device uses to name the principal a
/// session authenticates as. Section-scoped kinds carry the section index
/// in the low nibble; device-scoped kinds are whole-byte tags.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KeyId(u8);

impl KeyId {
    pub const INVALID: KeyId = KeyId(0xFF);
    pub const DEVICE_SECRET: KeyId = KeyId(0x8F);
    pub const DEVICE_MASTER: KeyId = KeyId(0x9F);
    pub const DEVICE_KEY_PROVISIONING: KeyId = KeyId(0xAF);

    const RESTRICTED_TAG: u8 = 0x00;
    const FULL_ACCESS_TAG: u8 = 0x10;
    const SECTION_PROVISIONING_TAG: u8 = 0x20;

    pub fn restricted(section: u8) -> Self {
        KeyId(Self::RESTRICTED_TAG | (section & 0xF))
    }

    pub fn full_access(section: u8) -> Self {
        KeyId(Self::FULL_ACCESS_TAG | (section & 0xF))
    }

    pub fn section_provisioning(section: u8) -> Self {
        KeyId(Self::SECTION_PROVISIONING_TAG | (section & 0xF))
    }

    pub fn from_raw(raw: u8) -> Self {
        KeyId(raw)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    /// The section index, meaningful only for section-scoped kinds.
    pub fn section(self) -> u8 {
        self.0 & 0xF
    }

    pub fn kind(self) -> KeyKind {
        if self.0 < 0x30 {
            match self.0 & 0xF0 {
                Self::RESTRICTED_TAG => KeyKind::RestrictedSection,
                Self::FULL_ACCESS_TAG => KeyKind::FullAccessSection,
                Self::SECTION_PROVISIONING_TAG => KeyKind::SectionProvisioning,
                _ => KeyKind::Invalid,
            }
        } else {
            match self {
                Self::DEVICE_SECRET => KeyKind::DeviceSecret,
                Self::DEVICE_MASTER => KeyKind::DeviceMaster,
                Self::DEVICE_KEY_PROVISIONING => KeyKind::DeviceKeyProvisioning,
                _ => KeyKind::Invalid,
            }
        }
    }

    pub fn is_section_key(self) -> bool {
        matches!(
            self.kind(),
            KeyKind::RestrictedSection | KeyKind::FullAccessSection
        )
    }

    pub fn is_provisioning(self) -> bool {
        matches!(
            self.kind(),
            KeyKind::SectionProvisioning | KeyKind::DeviceKeyProvisioning
        )
    }
}

/// Per-section security policy, as stored in the SSPR word of the SCR.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SectionPolicy {
    /// Boot-time digest integrity check.
    pub digest_integrity: bool,
    /// Boot-time CRC integrity check.
    pub checksum_integrity: bool,
    pub write_prot: bool,
    pub rollback_prot: bool,
    pub plain_access_read: bool,
    pub plain_access_write: bool,
    /// Plain access requires an authenticated grant first.
    pub auth_plain_access: bool,
}

/// One row of the section configuration table consumed by
/// `config_device`. A zero size disables the section.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SectionConfig {
    pub base: u32,
    pub size: u32,
    pub policy: SectionPolicy,
}

/// Authenticated-watchdog countdown thresholds, exponentially scaled.
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
pub enum WatchdogThreshold {
    Secs1 = 0,
    Secs2,
    Secs4,
    Secs8,
    Secs16,
    Secs32,
    Min1,
    Min2,
    Min4,
    Min8,
    Min17,
    Min34,
    Hours1,
    Hours2,
    Hours4,
    Hours9,
    Hours18,
    Hours36,
    Hours72,
    Days6,
    Days12,
}

/// Authenticated-watchdog configuration in unpacked form.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WatchdogConfig {
    pub enable: bool,
    pub lf_osc_enable: bool,
    pub sw_reset_enable: bool,
    /// Configuration and touch require a signed command bound to
    /// `section`'s key.
    pub authenticated: bool,
    pub section: u8,
    pub threshold: WatchdogThreshold,
    pub lock: bool,
    /// LF oscillator calibration in Hz; 0 keeps the stored calibration.
    pub osc_rate_hz: u32,
}

/// IO2/IO3 pin function selection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Io23Mode {
    LegacyWpHold,
    ResetInOut,
    Quad,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PinMux {
    pub io23: Io23Mode,
    pub dedicated_reset_in: bool,
}

/// The two 64-byte reset-response buffers the device can emit after
/// power-on reset.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ResetResponse {
    pub response1: [u8; 64],
    pub response2: [u8; 64],
}

/// Legacy logical-address width (offset bits per section).
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
pub enum StdAddrSize {
    Bits19 = 19,
    Bits20 = 20,
    Bits21 = 21,
    Bits22 = 22,
    Bits23 = 23,
    Bits24 = 24,
}

/// Device-wide configuration consumed by `config_device`.
#[derive(Copy, Clone)]
pub struct DeviceConfig {
    pub reset_response: Option<ResetResponse>,
    /// Safe fallback: remap the boot section to its fallback twin when
    /// boot-time integrity fails.
    pub safe_fallback: bool,
    /// Speculative cipher-key generation.
    pub speculative_ck: bool,
    /// Allow the unauthenticated FORMAT command.
    pub non_secure_format: bool,
    pub pin_mux: PinMux,
    pub addr_size: StdAddrSize,
}

/// Everything known about one section's configuration, as returned by
/// `get_section_configuration`. A disabled section reads back zeroed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SectionInfo {
    pub base: u32,
    pub size: u32,
    pub policy: SectionPolicy,
    pub digest: u64,
    pub crc: u32,
    pub version: u32,
}

/// The full provisioning bundle for `config_device`. Every part is
/// optional; zeroed entries in the key arrays mean "leave this slot
/// unprogrammed".
#[derive(Copy, Clone, Default)]
pub struct DeviceSetup<'a> {
    pub master_key: Option<&'a Key>,
    pub secret_key: Option<&'a Key>,
    pub sections: Option<&'a [SectionConfig; NUM_SECTIONS]>,
    pub restricted_keys: Option<&'a [Key; NUM_SECTIONS]>,
    pub full_access_keys: Option<&'a [Key; NUM_SECTIONS]>,
    pub watchdog_default: Option<&'a WatchdogConfig>,
    pub device_config: Option<&'a DeviceConfig>,
    pub suid: Option<&'a [u8; 16]>,
}

/// Host-relevant conditions the device is signalling.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Notifications {
    /// Monotonic-counter maintenance wanted; run `perform_maintenance`.
    pub mc_maintenance: bool,
    /// TC is near its ceiling; reset the device soon.
    pub reset_device: bool,
    /// DMC is near end of life; replace the device.
    pub replace_device: bool,
}

/// Why and how the device last reset, captured at sync-after-reset.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct ResetStatus {
    /// Hardware power-on reset, as opposed to a software reset command.
    pub power_on_reset: bool,
    pub fallback_remap: bool,
    pub watchdog_reset: bool,
}

/// Secure-side hardware version register, unpacked.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HwVersion {
    pub flash_version: u8,
    pub security_version: u8,
    pub revision: u8,
    pub flash_size: u8,
}

/// Legacy JEDEC/device-id identification.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StdHwVersion {
    pub manufacturer_id: u8,
    pub memory_type: u8,
    pub capacity: u8,
    pub device_id: u8,
}

/// Device identity: factory WID, user SUID, legacy unique id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceId {
    pub wid: u64,
    pub suid: [u8; 16],
    pub unique_id: u64,
}

/// The driver state worth handing to another host: enough for a remote
/// party to resume this host's setup without re-probing the bus. The bus
/// lock is deliberately not part of it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize)]
pub struct SyncState {
    pub mode: BusMode,
    pub dtr: bool,
    pub wid: u64,
    pub reset_status: ResetStatus,
}

/// Secure command opcodes, as encoded into the CTAG's first byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SecCmd {
    GetWid = 0x14,
    GetSuid = 0x15,
    GetAwdtSr = 0x18,
    SecureFormat = 0x20,
    SetKey = 0x21,
    SetSuid = 0x22,
    SetGmc = 0x24,
    SetGmt = 0x25,
    SetAwdt = 0x26,
    AwdtTouch = 0x27,
    SetScr = 0x28,
    SetScrSwap = 0x29,
    SetRstResp = 0x2B,
    SetAclr = 0x2C,
    SetAwdtPlain = 0x2D,
    AwdtTouchPlain = 0x2E,
    Format = 0x30,
    GetGmc = 0x34,
    GetGmt = 0x35,
    GetAwdt = 0x36,
    GetScr = 0x38,
    GetRstResp = 0x3B,
    GetAclr = 0x3C,
    GetMc = 0x40,
    McMaint = 0x41,
    SessionOpen = 0x44,
    SessionClose = 0x45,
    InitSectionPlain = 0x47,
    CalcCdi = 0x48,
    VerifyIntegrity = 0x49,
    GetTc = 0x50,
    CalcSig = 0x52,
    SecureRead = 0x60,
    SecureReadAuth = 0x61,
    SecureWrite = 0x64,
    SecureErase4K = 0x68,
    SecureErase32K = 0x69,
    SecureErase64K = 0x6A,
    SecureEraseSection = 0x6B,
    SecureEraseAll = 0x6C,
    EraseSectionPlain = 0x6F,
    GetVersion = 0xF0,
    AwdtExpire = 0xFE,
}

impl From<SecCmd> for u8 {
    fn from(c: SecCmd) -> u8 {
        c as u8
    }
}

bitflags::bitflags! {
    /// Mode byte of the SESSION_OPEN command.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct OpenMode: u8 {
        /// Mix the WID into the session-key derivation.
        const INCLUDE_WID = 1 << 0;
        /// Open even when the section's SCR integrity data is stale.
        const IGNORE_SCR_VALIDITY = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Mode byte of the SESSION_CLOSE command.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct CloseMode: u8 {
        /// Also revoke the section's plain-access grant.
        const REVOKE_PLAIN_ACCESS = 1 << 0;
    }
}

/// Data objects addressable by CALC_SIG and the signed getters. Each
/// carries its object id and response size; section-scoped ids add the
/// section index.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SignedDataType {
    SectionDigest,
    Wid,
    Suid,
    HwVer,
    Ssr,
    AwdtCfg,
    Mc,
    Gmc,
    Gmt,
    SectionConfig,
}

impl SignedDataType {
    pub fn id(self, section: u8) -> u8 {
        let base = match self {
            Self::SectionDigest => 0x00,
            Self::Wid => 0x10,
            Self::Suid => 0x14,
            Self::HwVer => 0x18,
            Self::Ssr => 0x20,
            Self::AwdtCfg => 0x24,
            Self::Mc => 0x28,
            Self::Gmc => 0x30,
            Self::Gmt => 0x32,
            Self::SectionConfig => 0x40,
        };
        match self {
            Self::SectionDigest | Self::SectionConfig => base + (section & 0x7),
            _ => base,
        }
    }

    pub fn size(self) -> usize {
        match self {
            Self::SectionDigest | Self::Wid | Self::Mc => 8,
            Self::Suid => 16,
            Self::HwVer | Self::Ssr | Self::AwdtCfg => 4,
            Self::Gmc | Self::Gmt | Self::SectionConfig => 20,
        }
    }
}

/// Legacy SPI command opcodes. Only the subset this driver issues.
pub mod instr {
    pub const WRITE_STATUS_1: u8 = 0x01;
    pub const PAGE_PROGRAM: u8 = 0x02;
    pub const READ: u8 = 0x03;
    pub const READ_STATUS_1: u8 = 0x05;
    pub const WRITE_ENABLE: u8 = 0x06;
    pub const FAST_READ: u8 = 0x0B;
    pub const FAST_READ_DTR: u8 = 0x0D;
    pub const WRITE_STATUS_3: u8 = 0x11;
    pub const READ_STATUS_3: u8 = 0x15;
    pub const SECTOR_ERASE: u8 = 0x20;
    pub const WRITE_STATUS_2: u8 = 0x31;
    pub const READ_STATUS_2: u8 = 0x35;
    pub const ENTER_QPI: u8 = 0x38;
    pub const FAST_READ_DUAL_OUT: u8 = 0x3B;
    pub const READ_UNIQUE_ID: u8 = 0x4B;
    pub const REGISTER_WRITE_ENABLE: u8 = 0x50;
    pub const BLOCK_ERASE_32K: u8 = 0x52;
    pub const FAST_READ_QUAD_OUT: u8 = 0x6B;
    pub const ERASE_SUSPEND: u8 = 0x75;
    pub const ERASE_RESUME: u8 = 0x7A;
    pub const MFR_DEVICE_ID: u8 = 0x90;
    pub const MFR_DEVICE_ID_DUAL: u8 = 0x92;
    pub const MFR_DEVICE_ID_QUAD: u8 = 0x94;
    pub const READ_JEDEC_ID: u8 = 0x9F;
    pub const RELEASE_POWER_DOWN: u8 = 0xAB;
    pub const POWER_DOWN: u8 = 0xB9;
    pub const FAST_READ_DUAL_IO: u8 = 0xBB;
    pub const FAST_READ_DUAL_IO_DTR: u8 = 0xBD;
    pub const SET_READ_PARAMETERS: u8 = 0xC0;
    pub const CHIP_ERASE: u8 = 0xC7;
    pub const BLOCK_ERASE_64K: u8 = 0xD8;
    pub const FAST_READ_QUAD_IO: u8 = 0xEB;
    pub const FAST_READ_QUAD_IO_DTR: u8 = 0xED;
    pub const RESET_ENABLE: u8 = 0x66;
    pub const RESET_DEVICE: u8 = 0x99;
    pub const EXIT_QPI: u8 = 0xFF;
}

/// CRC-32 used for section checksums, matching what the device computes
/// during VER_INTG.
pub fn section_crc(data: &[u8]) -> u32 {
    static CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);
    let mut digest = CRC.digest();
    digest.update(data);
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kid_kinds() {
        assert_eq!(KeyId::full_access(3).kind(), KeyKind::FullAccessSection);
        assert_eq!(KeyId::full_access(3).section(), 3);
        assert_eq!(KeyId::restricted(7).kind(), KeyKind::RestrictedSection);
        assert_eq!(
            KeyId::section_provisioning(2).kind(),
            KeyKind::SectionProvisioning
        );
        assert_eq!(KeyId::DEVICE_MASTER.kind(), KeyKind::DeviceMaster);
        assert_eq!(KeyId::DEVICE_SECRET.kind(), KeyKind::DeviceSecret);
        assert_eq!(
            KeyId::DEVICE_KEY_PROVISIONING.kind(),
            KeyKind::DeviceKeyProvisioning
        );
        assert_eq!(KeyId::INVALID.kind(), KeyKind::Invalid);
        assert!(KeyId::section_provisioning(2).is_provisioning());
        assert!(!KeyId::full_access(2).is_provisioning());
    }

    #[test]
    fn key_validity() {
        assert!(!key_is_valid(&[0; 4]));
        assert!(key_is_valid(&[0, 0, 1, 0]));
        assert!(key_is_valid(&DEFAULT_KEY));
    }

    #[test]
    fn signed_data_ids() {
        assert_eq!(SignedDataType::SectionDigest.id(5), 0x05);
        assert_eq!(SignedDataType::SectionConfig.id(5), 0x45);
        // Non-section ids must not absorb the section index.
        assert_eq!(SignedDataType::Gmt.id(5), 0x32);
        assert_eq!(SignedDataType::Suid.size(), 16);
        assert_eq!(SignedDataType::Gmc.size(), 20);
    }

    #[test]
    fn bus_mode_lines() {
        assert_eq!(BusMode::Single.lines_mask(), 0xA0);
        assert_eq!(BusMode::Dual1_2_2.lines_mask(), 0xB0);
        assert_eq!(BusMode::Quad1_4_4.lines_mask(), 0xD0);
        assert!(BusMode::Qpi.is_quad());
        assert!(!BusMode::Dual1_1_2.is_quad());
    }

    #[test]
    fn sync_state_round_trip() {
        let state = SyncState {
            mode: BusMode::Quad1_4_4,
            dtr: false,
            wid: 0x1122_3344_5566_7788,
            reset_status: ResetStatus {
                power_on_reset: true,
                fallback_remap: false,
                watchdog_reset: false,
            },
        };
        let mut buf = [0u8; SyncState::MAX_SIZE];
        let len = hubpack::serialize(&mut buf, &state).unwrap();
        let (out, _) = hubpack::deserialize::<SyncState>(&buf[..len]).unwrap();
        assert_eq!(out, state);
    }
}
