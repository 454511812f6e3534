//! Cryptographic values shared by the key exchange, key derivation and cipher layers.

use bytes::Bytes;
use num_bigint::BigUint;
use ring::digest;
use std::{convert::TryInto as _, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("unsupported cipher")]
    UnsupportedCipher,

    #[error("unsupported curve")]
    UnsupportedCurve,

    #[error("invalid key or IV length")]
    InvalidKeyLength,

    #[error("invalid public value")]
    InvalidPublicValue,

    #[error("invalid group parameters")]
    InvalidGroup,

    #[error("implausible decrypted packet length {0}")]
    ImplausibleLength(u32),

    #[error("packet length {0} is not a multiple of the cipher block size")]
    Misaligned(u32),
}

/// An unsigned big-endian integer or opaque key value.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct KeyMaterial(Bytes);

impl KeyMaterial {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn from_static(data: &'static [u8]) -> Self {
        Self(Bytes::from_static(data))
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().map(Self::new)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `self ^ exponent mod modulus`.
    pub fn mod_pow(
        &self,
        exponent: &KeyMaterial,
        modulus: &KeyMaterial,
    ) -> Result<KeyMaterial, CryptoError> {
        let m = BigUint::from_bytes_be(modulus.as_bytes());
        if m <= BigUint::from(1u8) {
            return Err(CryptoError::InvalidGroup);
        }
        let base = BigUint::from_bytes_be(self.as_bytes());
        let exp = BigUint::from_bytes_be(exponent.as_bytes());
        let r = base.modpow(&exp, &m);
        Ok(Self::new(r.to_bytes_be()))
    }

    /// Curve25519 scalar multiplication of `point` by the scalar `self`.
    pub fn x25519(&self, point: &KeyMaterial) -> Result<KeyMaterial, CryptoError> {
        let scalar: [u8; 32] = self
            .as_bytes()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let point: [u8; 32] = point
            .as_bytes()
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicValue)?;
        let shared = x25519_dalek::x25519(scalar, point);
        // low order points give an all-zero result
        if shared.iter().all(|&b| b == 0) {
            return Err(CryptoError::InvalidPublicValue);
        }
        Ok(Self::new(shared.to_vec()))
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for KeyMaterial {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}

impl AsRef<[u8]> for KeyMaterial {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Hash function of a key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Picks the hash from the method name, e.g. `curve25519-sha256@libssh.org`.
    pub fn for_kex(name: &str) -> Option<Self> {
        let name = name.split('@').next().unwrap_or(name);
        match name {
            "ecdh-sha2-nistp256" => return Some(HashAlgorithm::Sha256),
            "ecdh-sha2-nistp384" => return Some(HashAlgorithm::Sha384),
            "ecdh-sha2-nistp521" => return Some(HashAlgorithm::Sha512),
            _ => (),
        }
        if name.ends_with("sha1") {
            Some(HashAlgorithm::Sha1)
        } else if name.ends_with("sha256") {
            Some(HashAlgorithm::Sha256)
        } else if name.ends_with("sha384") {
            Some(HashAlgorithm::Sha384)
        } else if name.ends_with("sha512") {
            Some(HashAlgorithm::Sha512)
        } else {
            None
        }
    }

    pub(crate) fn algorithm(self) -> &'static digest::Algorithm {
        match self {
            HashAlgorithm::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            HashAlgorithm::Sha256 => &digest::SHA256,
            HashAlgorithm::Sha384 => &digest::SHA384,
            HashAlgorithm::Sha512 => &digest::SHA512,
        }
    }

    pub fn digest(self, data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(digest::digest(self.algorithm(), data).as_ref())
    }
}
