// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared test fixture: a provisioned device behind a connected driver.
//!
//! The section layout used throughout the integration tests:
//!
//! | # | base    | size    | policy                          |
//! |---|---------|---------|---------------------------------|
//! | 0 | 0       | 512 KiB | rollback (digest added later)   |
//! | 1 | 512 KiB | 512 KiB | plain read                      |
//! | 2 | 1 MiB   | 512 KiB | rollback (digest added later)   |
//! | 3 | 1.5 MiB | 256 KiB | plain read + write              |
//! | 4 | 1.75 MiB| 256 KiB | none                            |
//! | 5 | 2 MiB   | 256 KiB | plain read, authenticated grant |
//! | 6 | —       | —       | disabled                        |
//! | 7 | —       | —       | disabled                        |

use drv_w77q::SecureFlash;
use drv_w77q_api::{
    DeviceConfig, DeviceSetup, Io23Mode, Key, PinMux, SectionConfig, SectionPolicy,
    StdAddrSize, NUM_SECTIONS,
};
use drv_w77q_sim::W77qSim;

pub static MASTER_KEY: Key = [0xDEAD_0001, 0xDEAD_0002, 0xDEAD_0003, 0xDEAD_0004];
pub static SECRET_KEY: Key = [0x5EC2_0001, 0x5EC2_0002, 0x5EC2_0003, 0x5EC2_0004];

pub static FULL_KEYS: [Key; NUM_SECTIONS] = [
    [0xF000_0000, 1, 2, 3],
    [0xF000_0001, 1, 2, 3],
    [0xF000_0002, 1, 2, 3],
    [0xF000_0003, 1, 2, 3],
    [0xF000_0004, 1, 2, 3],
    [0xF000_0005, 1, 2, 3],
    [0, 0, 0, 0],
    [0, 0, 0, 0],
];

pub static RESTRICTED_KEYS: [Key; NUM_SECTIONS] = [
    [0, 0, 0, 0],
    [0xE000_0001, 4, 5, 6],
    [0, 0, 0, 0],
    [0, 0, 0, 0],
    [0xE000_0004, 4, 5, 6],
    [0xE000_0005, 4, 5, 6],
    [0, 0, 0, 0],
    [0, 0, 0, 0],
];

pub static SUID: [u8; 16] = [
    0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x20, 0x21, 0x22, 0x23, 0x24, 0x25,
    0x26, 0x27,
];

static DEVICE_CONFIG: DeviceConfig = DeviceConfig {
    reset_response: None,
    safe_fallback: false,
    speculative_ck: false,
    non_secure_format: true,
    pin_mux: PinMux {
        io23: Io23Mode::LegacyWpHold,
        dedicated_reset_in: false,
    },
    addr_size: StdAddrSize::Bits19,
};

const KIB: u32 = 1024;

pub fn section_table() -> [SectionConfig; NUM_SECTIONS] {
    let mut table = [SectionConfig::default(); NUM_SECTIONS];
    table[0] = SectionConfig {
        base: 0,
        size: 512 * KIB,
        policy: SectionPolicy {
            rollback_prot: true,
            ..Default::default()
        },
    };
    table[1] = SectionConfig {
        base: 512 * KIB,
        size: 512 * KIB,
        policy: SectionPolicy {
            plain_access_read: true,
            ..Default::default()
        },
    };
    table[2] = SectionConfig {
        base: 1024 * KIB,
        size: 512 * KIB,
        policy: SectionPolicy {
            rollback_prot: true,
            ..Default::default()
        },
    };
    table[3] = SectionConfig {
        base: 1536 * KIB,
        size: 256 * KIB,
        policy: SectionPolicy {
            plain_access_read: true,
            plain_access_write: true,
            ..Default::default()
        },
    };
    table[4] = SectionConfig {
        base: 1792 * KIB,
        size: 256 * KIB,
        policy: SectionPolicy::default(),
    };
    table[5] = SectionConfig {
        base: 2048 * KIB,
        size: 256 * KIB,
        policy: SectionPolicy {
            plain_access_read: true,
            auth_plain_access: true,
            ..Default::default()
        },
    };
    table
}

/// A connected, provisioned device with the working keys loaded.
pub fn provisioned() -> SecureFlash<'static, W77qSim> {
    let mut flash = SecureFlash::new(W77qSim::new());
    flash.connect().unwrap();
    flash.init_device(None).unwrap();

    let table = section_table();
    let setup = DeviceSetup {
        master_key: Some(&MASTER_KEY),
        secret_key: Some(&SECRET_KEY),
        sections: Some(&table),
        restricted_keys: Some(&RESTRICTED_KEYS),
        full_access_keys: Some(&FULL_KEYS),
        watchdog_default: None,
        device_config: Some(&DEVICE_CONFIG),
        suid: Some(&SUID),
    };
    flash.config_device(&setup).unwrap();

    for section in 0..6 {
        flash
            .load_key(section, &FULL_KEYS[section as usize], true)
            .unwrap();
    }
    for section in [1, 4, 5] {
        flash
            .load_key(section, &RESTRICTED_KEYS[section as usize], false)
            .unwrap();
    }
    flash
}
