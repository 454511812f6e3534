//! Derivation of the initial IVs and keys from `K`, `H` and the session identifier.

use crate::{
    crypto::{HashAlgorithm, KeyMaterial},
    transport::Direction,
    util::put_ssh_mpint,
};
use bytes::{Bytes, BytesMut};
use std::fmt;

/// Bytes derived for every key; longer than any supported cipher or MAC needs.
pub const KEY_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    IvClientToServer,
    IvServerToClient,
    EncryptionClientToServer,
    EncryptionServerToClient,
    IntegrityClientToServer,
    IntegrityServerToClient,
}

impl KeyRole {
    pub const ALL: [KeyRole; 6] = [
        KeyRole::IvClientToServer,
        KeyRole::IvServerToClient,
        KeyRole::EncryptionClientToServer,
        KeyRole::EncryptionServerToClient,
        KeyRole::IntegrityClientToServer,
        KeyRole::IntegrityServerToClient,
    ];

    /// The character hashed into the key, `'A'` to `'F'`.
    pub fn letter(self) -> u8 {
        b'A' + self as u8
    }
}

/// The six keys of one key exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    keys: [Bytes; 6],
}

/// Keys protecting one direction.
#[derive(Debug, Clone, Copy)]
pub struct DirectionKeys<'a> {
    pub iv: &'a [u8],
    pub enc: &'a [u8],
    pub mac: &'a [u8],
}

impl SessionKeys {
    pub fn get(&self, role: KeyRole) -> &[u8] {
        &self.keys[role as usize]
    }

    pub fn for_direction(&self, direction: Direction) -> DirectionKeys<'_> {
        let (iv, enc, mac) = match direction {
            Direction::ClientToServer => (
                KeyRole::IvClientToServer,
                KeyRole::EncryptionClientToServer,
                KeyRole::IntegrityClientToServer,
            ),
            Direction::ServerToClient => (
                KeyRole::IvServerToClient,
                KeyRole::EncryptionServerToClient,
                KeyRole::IntegrityServerToClient,
            ),
        };
        DirectionKeys {
            iv: self.get(iv),
            enc: self.get(enc),
            mac: self.get(mac),
        }
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct KeyScheduler<'a> {
    hash: HashAlgorithm,
    shared_secret: &'a KeyMaterial,
    exchange_hash: &'a [u8],
    session_id: &'a [u8],
}

impl<'a> KeyScheduler<'a> {
    pub fn new(
        hash: HashAlgorithm,
        shared_secret: &'a KeyMaterial,
        exchange_hash: &'a [u8],
        session_id: &'a [u8],
    ) -> Self {
        Self {
            hash,
            shared_secret,
            exchange_hash,
            session_id,
        }
    }

    pub fn derive(&self) -> SessionKeys {
        let span = tracing::trace_span!("KeyScheduler::derive");
        let _enter = span.enter();

        let mut keys: [Bytes; 6] = Default::default();
        for role in &KeyRole::ALL {
            keys[*role as usize] = self.compute_key(role.letter());
        }
        SessionKeys { keys }
    }

    fn compute_key(&self, c: u8) -> Bytes {
        // described in https://tools.ietf.org/html/rfc4253#section-7.2

        let mut prefix = BytesMut::new();
        put_ssh_mpint(&mut prefix, self.shared_secret.as_bytes());
        prefix.extend_from_slice(self.exchange_hash);

        let mut key = {
            let mut h = prefix.clone();
            h.extend_from_slice(&[c]);
            h.extend_from_slice(self.session_id);
            BytesMut::from(&self.hash.digest(&h)[..])
        }; // K1

        while key.len() < KEY_LEN {
            let mut h = prefix.clone();
            h.extend_from_slice(&key);
            let digest = self.hash.digest(&h);
            key.extend_from_slice(&digest);
        } // K2, K3, ...

        key.truncate(KEY_LEN);
        key.freeze()
    }
}
