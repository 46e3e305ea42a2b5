// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Engine-level integration tests against the device model: bring-up,
//! sessions, the secure and plain data paths, and boundary behavior.

mod common;

use common::{provisioned, FULL_KEYS, MASTER_KEY, SUID};
use drv_w77q::{SecureFlash, Trace};
use drv_w77q_api::{
    SectionPolicy, SessionAccess, Swap, W77qError, SECURE_PAGE_SIZE, WINBOND_MFR_ID,
};
use drv_w77q_sim::W77qSim;

#[test]
fn bring_up_and_identity() {
    let mut flash = provisioned();

    assert_ne!(flash.get_wid(), 0);

    let id = flash.get_id().unwrap();
    assert_eq!(id.wid, flash.get_wid());
    assert_eq!(id.suid, SUID);

    let (std_hw, sec_hw) = flash.get_hw_version().unwrap();
    assert_eq!(std_hw.manufacturer_id, WINBOND_MFR_ID);
    assert_eq!(sec_hw.security_version, 2);

    // Autosense settled on the fastest mode the model answers in.
    let traces = flash.platform_mut().take_trace();
    assert!(traces
        .iter()
        .any(|t| matches!(t, Trace::AutoSense { ok: true, .. })));
}

#[test]
fn not_connected_is_refused() {
    let mut flash = SecureFlash::new(W77qSim::new());
    assert_eq!(flash.init_device(None), Err(W77qError::NotConnected));

    flash.connect().unwrap();
    assert_eq!(flash.connect(), Err(W77qError::IncorrectState));
    flash.init_device(None).unwrap();
    flash.disconnect().unwrap();
    assert_eq!(flash.disconnect(), Err(W77qError::NotConnected));
}

#[test]
fn disconnect_refused_while_session_open() {
    let mut flash = provisioned();
    flash.open_session(4, SessionAccess::Restricted).unwrap();
    assert_eq!(flash.disconnect(), Err(W77qError::IncorrectState));
    flash.close_session(4).unwrap();
    flash.disconnect().unwrap();
}

#[test]
fn key_removal_interlocks_with_session() {
    let mut flash = provisioned();

    flash.open_session(4, SessionAccess::Restricted).unwrap();
    // The key backing the open session must stay.
    assert_eq!(flash.remove_key(4, false), Err(W77qError::IncorrectState));
    // The other class is fair game.
    flash.remove_key(4, true).unwrap();

    flash.close_session(4).unwrap();
    flash.remove_key(4, false).unwrap();

    // Loading again works, and a zero key never does.
    flash.load_key(4, &FULL_KEYS[4], true).unwrap();
    static ZERO: drv_w77q_api::Key = [0; 4];
    assert_eq!(
        flash.load_key(4, &ZERO, false),
        Err(W77qError::InvalidParameter)
    );
}

#[test]
fn session_open_close_traces() {
    let mut flash = provisioned();
    flash.platform_mut().take_trace();

    flash.open_session(4, SessionAccess::Restricted).unwrap();
    flash.close_session(4).unwrap();

    let traces = flash.platform_mut().take_trace();
    let opened = traces
        .iter()
        .position(|t| matches!(t, Trace::SessionOpened { .. }));
    let closed = traces.iter().position(|t| matches!(t, Trace::SessionClosed));
    assert!(opened.is_some());
    assert!(closed.is_some());
    assert!(opened.unwrap() < closed.unwrap());
}

#[test]
fn transaction_counter_stays_in_lock_step() {
    let mut flash = provisioned();

    // Synchronize, then count: the device's TC must advance by exactly
    // one per signed command.
    flash.get_notifications().unwrap();
    let tc0 = flash.platform_mut().transaction_counter();

    // SESSION_OPEN plus the two signed getters behind the plain-access
    // policy lookup.
    flash.open_session(4, SessionAccess::Restricted).unwrap();
    assert_eq!(flash.platform_mut().transaction_counter(), tc0 + 3);

    // One authenticated page read is one signed command.
    let mut page = [0u8; SECURE_PAGE_SIZE];
    flash.read(&mut page, 4, 0, true, true).unwrap();
    assert_eq!(flash.platform_mut().transaction_counter(), tc0 + 4);

    flash.close_session(4).unwrap();
}

#[test]
fn secure_write_read_round_trip() {
    let mut flash = provisioned();
    flash.open_session(3, SessionAccess::Full).unwrap();

    // Deliberately misaligned range: head slice, middle pages, tail.
    let data: Vec<u8> = (0..100u32).map(|i| (i * 7) as u8).collect();
    flash.write(&data, 3, 40, true).unwrap();

    let mut readback = vec![0u8; data.len()];
    flash.read(&mut readback, 3, 40, true, true).unwrap();
    assert_eq!(readback, data);

    // The unauthenticated read sees the same bytes.
    flash.read(&mut readback, 3, 40, true, false).unwrap();
    assert_eq!(readback, data);

    // Bytes around the written range stayed erased.
    let mut edge = [0u8; 8];
    flash.read(&mut edge, 3, 32, true, false).unwrap();
    assert_eq!(edge, [0xFF; 8]);

    flash.close_session(3).unwrap();
}

#[test]
fn erase_leaves_erased_flash() {
    let mut flash = provisioned();
    flash.open_session(3, SessionAccess::Full).unwrap();

    let data = [0x5Au8; 64];
    flash.write(&data, 3, 4096, true).unwrap();
    flash.erase(3, 0, 8192, true).unwrap();

    let mut readback = [0u8; 64];
    flash.read(&mut readback, 3, 4096, true, false).unwrap();
    assert_eq!(readback, [0xFF; 64]);

    flash.close_session(3).unwrap();
}

#[test]
fn restricted_session_reads_but_cannot_write() {
    let mut flash = provisioned();
    flash.open_session(4, SessionAccess::Restricted).unwrap();

    let mut page = [0u8; 32];
    flash.read(&mut page, 4, 0, true, false).unwrap();

    let data = [0u8; 32];
    assert_eq!(
        flash.write(&data, 4, 0, true),
        Err(W77qError::DevicePrivilegeErr)
    );
    assert_eq!(
        flash.erase(4, 0, 4096, true),
        Err(W77qError::DevicePrivilegeErr)
    );

    flash.close_session(4).unwrap();
}

#[test]
fn plain_read_with_secure_write() {
    let mut flash = provisioned();

    // Section 1 allows plain reads only; writes must be secure.
    flash.open_session(1, SessionAccess::Full).unwrap();

    let data: Vec<u8> = (0..=255u8).collect();
    flash.write(&data, 1, 0, true).unwrap();

    let mut readback = vec![0u8; 256];
    flash.read(&mut readback, 1, 0, false, false).unwrap();
    assert_eq!(readback, data);

    assert_eq!(
        flash.write(&data, 1, 0, false),
        Err(W77qError::DevicePrivilegeErr)
    );

    flash.erase(1, 0, 4096, true).unwrap();
    flash.read(&mut readback, 1, 0, false, false).unwrap();
    assert!(readback.iter().all(|&b| b == 0xFF));

    flash.close_session(1).unwrap();
}

#[test]
fn auth_plain_access_grant_and_revoke() {
    let mut flash = provisioned();
    let mut buf = [0u8; 16];

    // Without a grant, the on-demand plain-access path is refused: the
    // section demands an authenticated grant.
    assert_eq!(
        flash.read(&mut buf, 5, 0, false, false),
        Err(W77qError::DevicePrivilegeErr)
    );

    flash.auth_plain_access_grant(5).unwrap();
    flash.read(&mut buf, 5, 0, false, false).unwrap();

    flash.auth_plain_access_revoke(5).unwrap();
    assert_eq!(
        flash.read(&mut buf, 5, 0, false, false),
        Err(W77qError::DevicePrivilegeErr)
    );
}

#[test]
fn reset_revokes_plain_access() {
    let mut flash = provisioned();
    let mut buf = [0u8; 16];

    flash.auth_plain_access_grant(5).unwrap();
    flash.read(&mut buf, 5, 0, false, false).unwrap();

    flash.reset_flash().unwrap();

    // The grant died with the reset, and this section cannot re-grant
    // implicitly.
    assert_eq!(
        flash.read(&mut buf, 5, 0, false, false),
        Err(W77qError::DevicePrivilegeErr)
    );
}

#[test]
fn disabled_section_is_fenced_off() {
    let mut flash = provisioned();
    let mut buf = [0u8; 32];

    assert_eq!(
        flash.open_session(6, SessionAccess::Full),
        Err(W77qError::IncorrectState)
    );
    assert_eq!(
        flash.read(&mut buf, 6, 0, true, false),
        Err(W77qError::IncorrectState)
    );
    assert_eq!(
        flash.write(&buf, 6, 0, true),
        Err(W77qError::IncorrectState)
    );
    assert_eq!(
        flash.erase(6, 0, 4096, true),
        Err(W77qError::IncorrectState)
    );
    assert_eq!(
        flash.erase_section(6, true),
        Err(W77qError::IncorrectState)
    );
}

#[test]
fn boundary_checks() {
    let mut flash = provisioned();
    let mut buf = [0u8; 32];

    // Address arithmetic overflow is caught up front.
    assert_eq!(
        flash.read(&mut buf, 3, u32::MAX - 8, true, false),
        Err(W77qError::InvalidParameter)
    );

    // Erase granularity.
    assert_eq!(
        flash.erase(3, 100, 4096, true),
        Err(W77qError::InvalidDataAlignment)
    );
    assert_eq!(
        flash.erase(3, 0, 100, true),
        Err(W77qError::InvalidDataSize)
    );

    // Out-of-section access.
    assert_eq!(
        flash.read(&mut buf, 3, 256 * 1024 - 16, true, false),
        Err(W77qError::ParameterOutOfRange)
    );

    // Empty transfers are refused.
    assert_eq!(
        flash.read(&mut [], 3, 0, true, false),
        Err(W77qError::ParameterOutOfRange)
    );

    // Bad section id.
    assert_eq!(
        flash.open_session(8, SessionAccess::Full),
        Err(W77qError::InvalidParameter)
    );
}

#[test]
fn transaction_counter_ceiling() {
    let mut flash = provisioned();

    flash.platform_mut().set_counters(u32::MAX, 10);
    let notifications = flash.get_notifications().unwrap();
    assert!(notifications.reset_device);

    // The counter cannot be stamped past its ceiling; the next secure
    // command is refused host-side.
    assert_eq!(
        flash.open_session(4, SessionAccess::Restricted),
        Err(W77qError::DeviceMcErr)
    );
}

#[test]
fn config_section_round_trips_policy() {
    let mut flash = provisioned();
    flash.open_session(4, SessionAccess::Full).unwrap();

    let policy = SectionPolicy {
        plain_access_read: true,
        plain_access_write: true,
        ..Default::default()
    };
    flash
        .config_section(4, Some(&policy), None, None, Some(7), Swap::None)
        .unwrap();

    let info = flash.get_section_configuration(4).unwrap();
    assert_eq!(info.policy, policy);
    assert_eq!(info.version, 7);
    assert_eq!(info.size, 256 * 1024);

    flash.close_session(4).unwrap();
}

#[test]
fn config_section_validates_integrity_arguments() {
    let mut flash = provisioned();
    flash.open_session(4, SessionAccess::Full).unwrap();

    // Digest policy without a digest, and vice versa.
    let policy = SectionPolicy {
        digest_integrity: true,
        ..Default::default()
    };
    assert_eq!(
        flash.config_section(4, Some(&policy), None, None, None, Swap::None),
        Err(W77qError::InvalidParameter)
    );
    let policy = SectionPolicy::default();
    assert_eq!(
        flash.config_section(4, Some(&policy), Some(1), None, None, Swap::None),
        Err(W77qError::InvalidParameter)
    );

    // Rollback protection needs at least two blocks; section 4 has one.
    let policy = SectionPolicy {
        rollback_prot: true,
        ..Default::default()
    };
    assert_eq!(
        flash.config_section(4, Some(&policy), None, None, None, Swap::None),
        Err(W77qError::InvalidParameter)
    );

    flash.close_session(4).unwrap();
}

#[test]
fn config_section_requires_full_access() {
    let mut flash = provisioned();

    assert_eq!(
        flash.config_section(4, None, None, None, Some(1), Swap::None),
        Err(W77qError::DeviceSessionErr)
    );

    flash.open_session(4, SessionAccess::Restricted).unwrap();
    assert_eq!(
        flash.config_section(4, None, None, None, Some(1), Swap::None),
        Err(W77qError::DevicePrivilegeErr)
    );
    flash.close_session(4).unwrap();
}

#[test]
fn export_import_identity() {
    let mut flash = provisioned();
    let exported = flash.export_state();

    let mut other = SecureFlash::new(W77qSim::new());
    other.import_state(&exported).unwrap();
    assert_eq!(other.export_state(), exported);
    assert_eq!(other.get_wid(), flash.get_wid());
}

#[test]
fn resume_without_suspend_is_refused() {
    let mut flash = provisioned();
    assert_eq!(flash.resume(), Err(W77qError::IncorrectState));

    // Nothing is in progress on the model, so a suspend is ignored by
    // the device.
    assert_eq!(flash.suspend(), Err(W77qError::CommandIgnored));
}

#[test]
fn power_down_gates_operations() {
    let mut flash = provisioned();
    flash.power(drv_w77q_api::PowerState::Down).unwrap();

    assert_eq!(
        flash.open_session(4, SessionAccess::Full),
        Err(W77qError::CommandIgnored)
    );
    assert_eq!(flash.get_status(), Err(W77qError::CommandIgnored));

    flash.power(drv_w77q_api::PowerState::Up).unwrap();
    flash.open_session(4, SessionAccess::Full).unwrap();
    flash.close_session(4).unwrap();
}

#[test]
fn format_disables_everything() {
    let mut flash = provisioned();
    flash.format(Some(&MASTER_KEY), false).unwrap();

    assert_eq!(
        flash.open_session(3, SessionAccess::Full),
        Err(W77qError::IncorrectState)
    );
    let info = flash.get_section_configuration(3).unwrap();
    assert_eq!(info.size, 0);
}

#[test]
fn format_data_only_keeps_configuration() {
    let mut flash = provisioned();

    flash.open_session(3, SessionAccess::Full).unwrap();
    flash.write(&[0xAB; 32], 3, 0, true).unwrap();
    flash.close_session(3).unwrap();

    flash.format(Some(&MASTER_KEY), true).unwrap();

    flash.open_session(3, SessionAccess::Full).unwrap();
    let mut buf = [0u8; 32];
    flash.read(&mut buf, 3, 0, true, false).unwrap();
    assert_eq!(buf, [0xFF; 32]);
    flash.close_session(3).unwrap();
}
