// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Watchdog, monotonic-counter maintenance and notification flows.

mod common;

use common::{provisioned, MASTER_KEY, SUID};
use drv_w77q_api::{
    DeviceConfig, DeviceSetup, Io23Mode, PinMux, ResetResponse, SessionAccess, StdAddrSize,
    W77qError, WatchdogConfig, WatchdogThreshold, DMC_EOL_THRESHOLD,
};

#[test]
fn watchdog_round_trip() {
    let mut flash = provisioned();

    // Arm the watchdog, authenticated, bound to section 1's key.
    let config = WatchdogConfig {
        enable: true,
        lf_osc_enable: true,
        sw_reset_enable: false,
        authenticated: true,
        section: 1,
        threshold: WatchdogThreshold::Min4,
        lock: false,
        osc_rate_hz: 0,
    };
    flash.watchdog_config_set(&config).unwrap();

    let readback = flash.watchdog_config_get().unwrap();
    assert!(readback.enable);
    assert!(readback.authenticated);
    assert_eq!(readback.section, 1);
    assert_eq!(readback.threshold, WatchdogThreshold::Min4);

    let (seconds, _residue, expired) = flash.watchdog_get().unwrap();
    assert!(!expired);
    assert!(seconds <= 1);

    flash.platform_mut().advance_watchdog(30);
    let (before_touch, _, expired) = flash.watchdog_get().unwrap();
    assert_eq!(before_touch, 30);
    assert!(!expired);

    // Touching needs the bound section's session now.
    assert_eq!(flash.watchdog_touch(), Err(W77qError::DeviceSessionErr));

    flash.open_session(1, SessionAccess::Full).unwrap();
    flash.watchdog_touch().unwrap();
    let (after_touch, _, _) = flash.watchdog_get().unwrap();
    assert!(after_touch <= before_touch);

    // Disarm, still under the bound session.
    let disable = WatchdogConfig {
        enable: false,
        authenticated: false,
        ..config
    };
    flash.watchdog_config_set(&disable).unwrap();
    assert!(!flash.watchdog_config_get().unwrap().enable);

    flash.close_session(1).unwrap();
}

#[test]
fn watchdog_expires_and_reports() {
    let mut flash = provisioned();

    let config = WatchdogConfig {
        enable: true,
        lf_osc_enable: true,
        sw_reset_enable: false,
        authenticated: false,
        section: 0,
        threshold: WatchdogThreshold::Secs4,
        lock: false,
        osc_rate_hz: 0,
    };
    flash.watchdog_config_set(&config).unwrap();

    flash.platform_mut().advance_watchdog(5);
    let (_, _, expired) = flash.watchdog_get().unwrap();
    assert!(expired);

    // An unauthenticated watchdog is touchable without a session.
    flash.watchdog_touch().unwrap();
    let (seconds, _, expired) = flash.watchdog_get().unwrap();
    assert_eq!(seconds, 0);
    assert!(!expired);

    // Force-expire on demand.
    flash.watchdog_trigger().unwrap();
    let (_, _, expired) = flash.watchdog_get().unwrap();
    assert!(expired);
}

#[test]
fn mc_maintenance_converges() {
    let mut flash = provisioned();

    flash.platform_mut().force_mc_maintenance(3);
    assert!(flash.get_notifications().unwrap().mc_maintenance);

    let mut rounds = 0;
    while flash.get_notifications().unwrap().mc_maintenance {
        flash.perform_maintenance().unwrap();
        rounds += 1;
        assert!(rounds <= 8, "maintenance failed to converge");
    }
    assert!(!flash.get_notifications().unwrap().mc_maintenance);

    // The device is fully usable afterwards.
    flash.open_session(3, SessionAccess::Full).unwrap();
    flash.close_session(3).unwrap();
}

#[test]
fn dmc_threshold_raises_replace_notification() {
    let mut flash = provisioned();

    flash.platform_mut().set_counters(0x2000, DMC_EOL_THRESHOLD);
    let notifications = flash.get_notifications().unwrap();
    assert!(notifications.replace_device);
    assert!(!notifications.reset_device);
    assert!(!notifications.mc_maintenance);
}

#[test]
fn reconfiguration_with_reset_response() {
    let mut flash = provisioned();

    let mut response = ResetResponse {
        response1: [0x11; 64],
        response2: [0x22; 64],
    };
    response.response1[0] = 0xA5;

    let device_config = DeviceConfig {
        reset_response: Some(response),
        safe_fallback: false,
        speculative_ck: false,
        non_secure_format: true,
        pin_mux: PinMux {
            io23: Io23Mode::LegacyWpHold,
            dedicated_reset_in: false,
        },
        addr_size: StdAddrSize::Bits19,
    };

    // Re-running config on an already-provisioned device: key writes
    // settle to the same values, the SUID write is skipped, and only
    // the global configuration moves.
    let setup = DeviceSetup {
        master_key: Some(&MASTER_KEY),
        secret_key: None,
        sections: None,
        restricted_keys: None,
        full_access_keys: None,
        watchdog_default: None,
        device_config: Some(&device_config),
        suid: Some(&SUID),
    };
    flash.config_device(&setup).unwrap();

    // Sections survived untouched.
    let info = flash.get_section_configuration(3).unwrap();
    assert_eq!(info.size, 256 * 1024);
}

#[test]
fn plain_format_needs_format_enable() {
    let mut flash = provisioned();

    // FORMAT_EN was set at provisioning, so the keyless format works
    // and wipes the mapping.
    flash.format(None, false).unwrap();
    assert_eq!(
        flash.open_session(3, SessionAccess::Full),
        Err(W77qError::IncorrectState)
    );

    // Data-only format without a key is meaningless.
    assert_eq!(flash.format(None, true), Err(W77qError::InvalidParameter));
}
