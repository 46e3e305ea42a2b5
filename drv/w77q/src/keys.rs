// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key manager: per-section key slots and the live session.
//!
//! The slots hold borrows, not copies — the caller owns the key bytes and
//! the borrow keeps them valid for as long as they are loaded. Only the
//! session key is materialized here, and it is erased whenever the
//! session closes.

use drv_w77q_api::{key_is_valid, Key, KeyId, KeyKind, W77qError, NUM_SECTIONS};
use zeroize::Zeroize;

pub(crate) struct KeyManager<'k> {
    restricted: [Option<&'k Key>; NUM_SECTIONS],
    full_access: [Option<&'k Key>; NUM_SECTIONS],
    session_key: Key,
    kid: KeyId,
}

impl<'k> KeyManager<'k> {
    pub fn new() -> Self {
        Self {
            restricted: [None; NUM_SECTIONS],
            full_access: [None; NUM_SECTIONS],
            session_key: [0; 4],
            kid: KeyId::INVALID,
        }
    }

    pub fn load_key(
        &mut self,
        section: usize,
        key: &'k Key,
        full_access: bool,
    ) -> Result<(), W77qError> {
        if !key_is_valid(key) {
            return Err(W77qError::InvalidParameter);
        }
        if section >= NUM_SECTIONS {
            return Err(W77qError::InvalidParameter);
        }
        let slots = if full_access {
            &mut self.full_access
        } else {
            &mut self.restricted
        };
        slots[section] = Some(key);
        Ok(())
    }

    pub fn remove_key(&mut self, section: usize, full_access: bool) -> Result<(), W77qError> {
        if section >= NUM_SECTIONS {
            return Err(W77qError::InvalidParameter);
        }
        let kid = if full_access {
            KeyId::full_access(section as u8)
        } else {
            KeyId::restricted(section as u8)
        };
        // The key backing an open session stays put.
        if self.kid == kid {
            return Err(W77qError::IncorrectState);
        }
        let slots = if full_access {
            &mut self.full_access
        } else {
            &mut self.restricted
        };
        slots[section] = None;
        Ok(())
    }

    pub fn key_for(&self, kid: KeyId) -> Option<&'k Key> {
        match kid.kind() {
            KeyKind::FullAccessSection => self.full_access[kid.section() as usize],
            KeyKind::RestrictedSection => self.restricted[kid.section() as usize],
            _ => None,
        }
    }

    pub fn has_restricted(&self, section: usize) -> bool {
        self.restricted[section].is_some()
    }

    pub fn has_full_access(&self, section: usize) -> bool {
        self.full_access[section].is_some()
    }

    pub fn session_is_open(&self) -> bool {
        self.kid != KeyId::INVALID
    }

    pub fn kid(&self) -> KeyId {
        self.kid
    }

    pub fn session_key(&self) -> &Key {
        &self.session_key
    }

    pub fn open(&mut self, kid: KeyId, session_key: Key) {
        self.session_key = session_key;
        self.kid = kid;
    }

    /// Forgets the session: key material erased, KID invalidated.
    pub fn mark_closed(&mut self) {
        self.session_key.zeroize();
        self.kid = KeyId::INVALID;
    }

    pub fn is_section_full_access(&self, section: u8) -> bool {
        self.kid == KeyId::full_access(section)
    }

    pub fn is_section_restricted(&self, section: u8) -> bool {
        self.kid == KeyId::restricted(section)
    }

    pub fn is_section_session(&self, section: u8) -> bool {
        self.is_section_full_access(section) || self.is_section_restricted(section)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: Key = [1, 2, 3, 4];

    #[test]
    fn load_rejects_zero_key() {
        let mut mngr = KeyManager::new();
        assert_eq!(
            mngr.load_key(0, &[0; 4], true),
            Err(W77qError::InvalidParameter)
        );
        assert!(mngr.load_key(0, &KEY, true).is_ok());
        assert!(mngr.has_full_access(0));
        assert!(!mngr.has_restricted(0));
    }

    #[test]
    fn remove_blocked_while_session_uses_key() {
        let mut mngr = KeyManager::new();
        mngr.load_key(2, &KEY, false).unwrap();
        mngr.open(KeyId::restricted(2), KEY);

        assert_eq!(
            mngr.remove_key(2, false),
            Err(W77qError::IncorrectState)
        );
        // The full-access slot of the same section is not the session key.
        assert!(mngr.remove_key(2, true).is_ok());

        mngr.mark_closed();
        assert!(mngr.remove_key(2, false).is_ok());
        assert!(!mngr.has_restricted(2));
    }

    #[test]
    fn close_erases_session() {
        let mut mngr = KeyManager::new();
        mngr.open(KeyId::full_access(1), KEY);
        assert!(mngr.session_is_open());
        assert!(mngr.is_section_full_access(1));
        assert!(!mngr.is_section_restricted(1));

        mngr.mark_closed();
        assert!(!mngr.session_is_open());
        assert_eq!(mngr.kid(), KeyId::INVALID);
        assert_eq!(*mngr.session_key(), [0; 4]);
    }
}
