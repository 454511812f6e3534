//! Per-direction record decryption.
//!
//! A [`CipherContext`] is installed for a direction when that direction sends
//! `SSH_MSG_NEWKEYS`. From then on every record is fed to [`CipherContext::open_record`],
//! which either returns the plaintext of one record (starting with its length field) or
//! tells the caller how many more bytes it needs.
//!
//! CBC and CTR keep their state across records, so the first block of a record that is
//! still incomplete is decrypted only once and parked in a [`PartialRecord`].

// Refs:
// * https://tools.ietf.org/html/rfc4253#section-6
// * https://tools.ietf.org/html/rfc4344
// * https://tools.ietf.org/html/rfc5647
// * https://github.com/openssh/openssh-portable/blob/master/PROTOCOL.chacha20poly1305

use crate::{
    crypto::CryptoError,
    keys::DirectionKeys,
    negotiate::{DirectionAlgorithms, LengthField},
    util::{ReadError, Reader},
};
use aes::{
    cipher::{
        generic_array::GenericArray, BlockDecryptMut, BlockSizeUser, KeyInit, KeyIvInit,
        StreamCipher, StreamCipherSeek,
    },
    Aes128, Aes192, Aes256,
};
use aes_gcm::{aead::AeadInPlace, Aes128Gcm, Aes256Gcm};
use byteorder::{BigEndian, ByteOrder};
use chacha20::ChaCha20Legacy;
use ctr::{Ctr128BE, Ctr32BE};
use hmac::{Hmac, Mac};
use md5::Md5;
use poly1305::Poly1305;
use ring::hmac as ring_hmac;
use std::fmt;

const BLOCK_LEN: usize = 16;
const AEAD_TAG_LEN: usize = 16;
const GCM_NONCE_LEN: usize = 12;

/// Largest packet length accepted after decryption (OpenSSH's `PACKET_MAX_SIZE`).
pub const MAX_PACKET_LEN: u32 = 256 * 1024;

/// The first block of a record whose remaining bytes have not arrived yet.
#[derive(Clone, PartialEq, Eq)]
pub struct PartialRecord {
    sequence_number: u32,
    first_block: [u8; BLOCK_LEN],
}

impl PartialRecord {
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }
}

impl fmt::Debug for PartialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialRecord")
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opened {
    /// The record is incomplete; `hint` is the number of missing bytes when known.
    NeedMore { hint: Option<usize> },
    Record(OpenedRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedRecord {
    /// The decrypted packet: length, padding length, payload and padding.
    pub plaintext: Vec<u8>,
    pub packet_length: u32,
    /// Bytes consumed from the wire, MAC included.
    pub wire_len: usize,
    /// `None` when the MAC could not be checked.
    pub mac_ok: Option<bool>,
}

pub struct CipherContext {
    opening: Opening,
    mac: Option<MacKey>,
    mac_len: usize,
    length_field: LengthField,
}

enum Opening {
    None,
    Gcm(Box<Gcm>),
    ChaCha20Poly1305 {
        main_key: [u8; 32],
        header_key: [u8; 32],
    },
    Block(Box<BlockDecryptor>),
}

impl fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opening = match self.opening {
            Opening::None => "none",
            Opening::Gcm(..) => "gcm",
            Opening::ChaCha20Poly1305 { .. } => "chacha20-poly1305",
            Opening::Block(ref b) => b.name(),
        };
        f.debug_struct("CipherContext")
            .field("opening", &opening)
            .field("mac_len", &self.mac_len)
            .field("length_field", &self.length_field)
            .finish()
    }
}

impl CipherContext {
    pub fn new(algs: &DirectionAlgorithms, keys: DirectionKeys<'_>) -> Result<Self, CryptoError> {
        let span = tracing::trace_span!("CipherContext::new");
        let _enter = span.enter();

        let enc = algs.enc.as_deref().ok_or(CryptoError::UnsupportedCipher)?;
        let opening = match enc {
            "none" => Opening::None,
            "aes128-gcm@openssh.com" | "aes128-gcm" => {
                Opening::Gcm(Box::new(Gcm::new(slice(keys.enc, 16)?, keys.iv)?))
            }
            "aes256-gcm@openssh.com" | "aes256-gcm" => {
                Opening::Gcm(Box::new(Gcm::new(slice(keys.enc, 32)?, keys.iv)?))
            }
            "chacha20-poly1305@openssh.com" => {
                let key = slice(keys.enc, 64)?;
                let mut main_key = [0u8; 32];
                let mut header_key = [0u8; 32];
                main_key.copy_from_slice(&key[..32]);
                header_key.copy_from_slice(&key[32..]);
                Opening::ChaCha20Poly1305 {
                    main_key,
                    header_key,
                }
            }
            name => Opening::Block(Box::new(BlockDecryptor::new(name, keys.enc, keys.iv)?)),
        };

        let mac = match opening {
            Opening::Gcm(..) | Opening::ChaCha20Poly1305 { .. } => None,
            _ => match algs.mac.as_deref() {
                Some(name) => MacKey::new(name, keys.mac)?,
                None => None,
            },
        };

        tracing::trace!("--> Keyed({})", enc);
        Ok(Self {
            opening,
            mac,
            mac_len: algs.mac_length,
            length_field: algs.length_field,
        })
    }

    pub fn length_field(&self) -> LengthField {
        self.length_field
    }

    /// Opens the record at the start of `data`.
    ///
    /// `pending` holds the cached first block of a fragmented CBC/CTR record; it is
    /// consumed when `sequence_number` matches and refilled when the record is still
    /// incomplete.
    pub fn open_record(
        &mut self,
        sequence_number: u32,
        data: &[u8],
        pending: &mut Option<PartialRecord>,
    ) -> Result<Opened, CryptoError> {
        let span = tracing::trace_span!("CipherContext::open_record", sequence_number);
        let _enter = span.enter();

        match self.opening {
            Opening::Gcm(ref mut gcm) => open_gcm(gcm, data),
            Opening::ChaCha20Poly1305 {
                ref main_key,
                ref header_key,
            } => open_chacha20_poly1305(main_key, header_key, sequence_number, data),
            Opening::Block(ref mut block) if self.length_field == LengthField::Encrypted => {
                open_encrypted_length(
                    block,
                    self.mac.as_ref(),
                    self.mac_len,
                    sequence_number,
                    data,
                    pending,
                )
            }
            Opening::Block(ref mut block) => open_plain_length(
                Some(block),
                self.mac.as_ref(),
                self.mac_len,
                sequence_number,
                data,
            ),
            Opening::None => {
                open_plain_length(None, self.mac.as_ref(), self.mac_len, sequence_number, data)
            }
        }
    }
}

fn slice(key: &[u8], len: usize) -> Result<&[u8], CryptoError> {
    key.get(..len).ok_or(CryptoError::InvalidKeyLength)
}

fn check_length(packet_length: u32) -> Result<(), CryptoError> {
    if packet_length > MAX_PACKET_LEN {
        tracing::debug!("implausible decrypted packet length {}", packet_length);
        return Err(CryptoError::ImplausibleLength(packet_length));
    }
    Ok(())
}

/// The first `len` bytes of a record. Until they are all there the packet length is
/// unknown, so only one more segment can be asked for.
fn length_prefix(data: &[u8], len: usize) -> Result<&[u8], Opened> {
    Reader::streaming(data)
        .read_slice(len)
        .map_err(|_| Opened::NeedMore { hint: None })
}

/// Asks for the rest of a record whose length is known.
fn need(data: &[u8], wire_len: usize) -> Option<Opened> {
    match Reader::streaming(data).skip(wire_len) {
        Err(ReadError::NeedMore { missing }) => Some(Opened::NeedMore {
            hint: Some(missing),
        }),
        _ => None,
    }
}

// ==== CBC / CTR ====

enum BlockDecryptor {
    Aes128Cbc(cbc::Decryptor<Aes128>),
    Aes192Cbc(cbc::Decryptor<Aes192>),
    Aes256Cbc(cbc::Decryptor<Aes256>),
    Aes128Ctr(Ctr128BE<Aes128>),
    Aes192Ctr(Ctr128BE<Aes192>),
    Aes256Ctr(Ctr128BE<Aes256>),
}

impl BlockDecryptor {
    fn new(name: &str, key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        let iv = slice(iv, BLOCK_LEN)?;
        let d = match name {
            "aes128-cbc" => Self::Aes128Cbc(init(slice(key, 16)?, iv)?),
            "aes192-cbc" => Self::Aes192Cbc(init(slice(key, 24)?, iv)?),
            "aes256-cbc" | "rijndael-cbc@lysator.liu.se" => {
                Self::Aes256Cbc(init(slice(key, 32)?, iv)?)
            }
            "aes128-ctr" => Self::Aes128Ctr(init(slice(key, 16)?, iv)?),
            "aes192-ctr" => Self::Aes192Ctr(init(slice(key, 24)?, iv)?),
            "aes256-ctr" => Self::Aes256Ctr(init(slice(key, 32)?, iv)?),
            _ => {
                tracing::debug!("decryption not supported: {}", name);
                return Err(CryptoError::UnsupportedCipher);
            }
        };
        Ok(d)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Aes128Cbc(..) => "aes128-cbc",
            Self::Aes192Cbc(..) => "aes192-cbc",
            Self::Aes256Cbc(..) => "aes256-cbc",
            Self::Aes128Ctr(..) => "aes128-ctr",
            Self::Aes192Ctr(..) => "aes192-ctr",
            Self::Aes256Ctr(..) => "aes256-ctr",
        }
    }

    /// Decrypts `buf` in place; its length must be a multiple of the block size.
    fn decrypt(&mut self, buf: &mut [u8]) {
        match self {
            Self::Aes128Cbc(d) => decrypt_blocks(d, buf),
            Self::Aes192Cbc(d) => decrypt_blocks(d, buf),
            Self::Aes256Cbc(d) => decrypt_blocks(d, buf),
            Self::Aes128Ctr(c) => c.apply_keystream(buf),
            Self::Aes192Ctr(c) => c.apply_keystream(buf),
            Self::Aes256Ctr(c) => c.apply_keystream(buf),
        }
    }
}

fn init<C: KeyIvInit>(key: &[u8], iv: &[u8]) -> Result<C, CryptoError> {
    C::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength)
}

fn decrypt_blocks<C: BlockDecryptMut>(cipher: &mut C, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(C::block_size()) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn open_encrypted_length(
    block: &mut BlockDecryptor,
    mac: Option<&MacKey>,
    mac_len: usize,
    sequence_number: u32,
    data: &[u8],
    pending: &mut Option<PartialRecord>,
) -> Result<Opened, CryptoError> {
    let first_block = match pending.take() {
        Some(partial) if partial.sequence_number == sequence_number => {
            tracing::trace!("resuming fragmented record");
            partial.first_block
        }
        _ => {
            let prefix = match length_prefix(data, BLOCK_LEN) {
                Ok(prefix) => prefix,
                Err(more) => return Ok(more),
            };
            let mut first_block = [0u8; BLOCK_LEN];
            first_block.copy_from_slice(prefix);
            block.decrypt(&mut first_block);
            first_block
        }
    };

    let packet_length = BigEndian::read_u32(&first_block[..4]);
    check_length(packet_length)?;
    let body_len = 4 + packet_length as usize;
    if body_len % BLOCK_LEN != 0 {
        return Err(CryptoError::Misaligned(packet_length));
    }

    let wire_len = body_len + mac_len;
    if data.len() < wire_len {
        tracing::trace!("--> fragment ({} of {} bytes)", data.len(), wire_len);
        *pending = Some(PartialRecord {
            sequence_number,
            first_block,
        });
        return Ok(Opened::NeedMore {
            hint: Some(wire_len - data.len()),
        });
    }

    let mut plaintext = Vec::with_capacity(body_len);
    plaintext.extend_from_slice(&first_block);
    plaintext.extend_from_slice(&data[BLOCK_LEN..body_len]);
    block.decrypt(&mut plaintext[BLOCK_LEN..]);

    let mac_ok = mac.map(|mac| mac.verify(sequence_number, &plaintext, &data[body_len..wire_len]));

    Ok(Opened::Record(OpenedRecord {
        plaintext,
        packet_length,
        wire_len,
        mac_ok,
    }))
}

/// Encrypt-then-MAC records, and records of the `none` cipher.
fn open_plain_length(
    block: Option<&mut Box<BlockDecryptor>>,
    mac: Option<&MacKey>,
    mac_len: usize,
    sequence_number: u32,
    data: &[u8],
) -> Result<Opened, CryptoError> {
    let packet_length = match length_prefix(data, 4) {
        Ok(prefix) => BigEndian::read_u32(prefix),
        Err(more) => return Ok(more),
    };
    check_length(packet_length)?;
    if block.is_some() && packet_length as usize % BLOCK_LEN != 0 {
        return Err(CryptoError::Misaligned(packet_length));
    }

    let body_len = 4 + packet_length as usize;
    let wire_len = body_len + mac_len;
    if let Some(more) = need(data, wire_len) {
        return Ok(more);
    }

    // the MAC covers the ciphertext here
    let mac_ok = mac.map(|mac| mac.verify(sequence_number, &data[..body_len], &data[body_len..wire_len]));

    let mut plaintext = data[..body_len].to_vec();
    if let Some(block) = block {
        block.decrypt(&mut plaintext[4..]);
    }

    Ok(Opened::Record(OpenedRecord {
        plaintext,
        packet_length,
        wire_len,
        mac_ok,
    }))
}

// ==== AES-GCM ====

enum GcmCipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

struct Gcm {
    cipher: GcmCipher,
    key: Vec<u8>,
    nonce: [u8; GCM_NONCE_LEN],
}

impl Gcm {
    fn new(key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        let cipher = match key.len() {
            16 => GcmCipher::Aes128(
                Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?,
            ),
            _ => GcmCipher::Aes256(
                Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?,
            ),
        };
        let mut nonce = [0u8; GCM_NONCE_LEN];
        nonce.copy_from_slice(slice(iv, GCM_NONCE_LEN)?);
        Ok(Self {
            cipher,
            key: key.to_vec(),
            nonce,
        })
    }

    /// Decrypts `body` in place and reports whether the tag matched.
    fn open(&self, aad: &[u8], body: &mut [u8], tag: &[u8]) -> Result<bool, CryptoError> {
        let ciphertext = body.to_vec();
        let nonce = GenericArray::from_slice(&self.nonce);
        let tag = GenericArray::from_slice(tag);
        let res = match self.cipher {
            GcmCipher::Aes128(ref c) => c.decrypt_in_place_detached(nonce, aad, body, tag),
            GcmCipher::Aes256(ref c) => c.decrypt_in_place_detached(nonce, aad, body, tag),
        };
        if res.is_ok() {
            return Ok(true);
        }

        // Still show the plaintext: GCM encrypts with CTR from counter block 2.
        tracing::debug!("GCM tag mismatch");
        body.copy_from_slice(&ciphertext);
        let mut iv = [0u8; BLOCK_LEN];
        iv[..GCM_NONCE_LEN].copy_from_slice(&self.nonce);
        iv[BLOCK_LEN - 1] = 2;
        match self.key.len() {
            16 => init::<Ctr32BE<Aes128>>(&self.key, &iv)?.apply_keystream(body),
            _ => init::<Ctr32BE<Aes256>>(&self.key, &iv)?.apply_keystream(body),
        }
        Ok(false)
    }

    /// Bumps the 64-bit invocation counter in the last 8 bytes of the nonce.
    fn advance(&mut self) {
        let counter = BigEndian::read_u64(&self.nonce[4..]).wrapping_add(1);
        BigEndian::write_u64(&mut self.nonce[4..], counter);
    }
}

fn open_gcm(gcm: &mut Gcm, data: &[u8]) -> Result<Opened, CryptoError> {
    let packet_length = match length_prefix(data, 4) {
        Ok(prefix) => BigEndian::read_u32(prefix),
        Err(more) => return Ok(more),
    };
    check_length(packet_length)?;
    if packet_length as usize % BLOCK_LEN != 0 {
        return Err(CryptoError::Misaligned(packet_length));
    }

    let body_len = 4 + packet_length as usize;
    let wire_len = body_len + AEAD_TAG_LEN;
    if let Some(more) = need(data, wire_len) {
        return Ok(more);
    }

    let mut plaintext = data[..body_len].to_vec();
    let (aad, body) = plaintext.split_at_mut(4);
    let mac_ok = gcm.open(aad, body, &data[body_len..wire_len])?;
    gcm.advance();

    Ok(Opened::Record(OpenedRecord {
        plaintext,
        packet_length,
        wire_len,
        mac_ok: Some(mac_ok),
    }))
}

// ==== ChaCha20-Poly1305 ====

fn open_chacha20_poly1305(
    main_key: &[u8; 32],
    header_key: &[u8; 32],
    sequence_number: u32,
    data: &[u8],
) -> Result<Opened, CryptoError> {
    let prefix = match length_prefix(data, 4) {
        Ok(prefix) => prefix,
        Err(more) => return Ok(more),
    };
    let nonce = u64::from(sequence_number).to_be_bytes();

    let mut length = [0u8; 4];
    length.copy_from_slice(prefix);
    init::<ChaCha20Legacy>(header_key, &nonce)?.apply_keystream(&mut length);
    let packet_length = BigEndian::read_u32(&length);
    check_length(packet_length)?;

    let body_len = 4 + packet_length as usize;
    let wire_len = body_len + AEAD_TAG_LEN;
    if let Some(more) = need(data, wire_len) {
        return Ok(more);
    }

    let mut main = init::<ChaCha20Legacy>(main_key, &nonce)?;
    let mut poly_key = [0u8; 32];
    main.apply_keystream(&mut poly_key);
    let tag = Poly1305::new_from_slice(&poly_key)
        .map_err(|_| CryptoError::InvalidKeyLength)?
        .compute_unpadded(&data[..body_len]);
    let mac_ok = tag.as_slice() == &data[body_len..wire_len];
    if !mac_ok {
        tracing::debug!("Poly1305 tag mismatch");
    }

    // the payload starts at block counter 1
    main.seek(64u64);
    let mut plaintext = Vec::with_capacity(body_len);
    plaintext.extend_from_slice(&length);
    plaintext.extend_from_slice(&data[4..body_len]);
    main.apply_keystream(&mut plaintext[4..]);

    Ok(Opened::Record(OpenedRecord {
        plaintext,
        packet_length,
        wire_len,
        mac_ok: Some(mac_ok),
    }))
}

// ==== MAC ====

enum MacKey {
    Ring(ring_hmac::Key),
    Md5(Hmac<Md5>),
}

impl MacKey {
    /// Returns `None` for MACs that can be framed but not verified.
    fn new(name: &str, key: &[u8]) -> Result<Option<Self>, CryptoError> {
        let base = name
            .strip_suffix("-etm@openssh.com")
            .or_else(|| name.strip_suffix("@openssh.com"))
            .unwrap_or(name);
        let base = base.strip_suffix("-96").unwrap_or(base);

        let (algorithm, key_len) = match base {
            "hmac-sha1" => (ring_hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, 20),
            "hmac-sha2-256" => (ring_hmac::HMAC_SHA256, 32),
            "hmac-sha2-512" => (ring_hmac::HMAC_SHA512, 64),
            "hmac-md5" => {
                let mac = <Hmac<Md5> as Mac>::new_from_slice(slice(key, 16)?)
                    .map_err(|_| CryptoError::InvalidKeyLength)?;
                return Ok(Some(MacKey::Md5(mac)));
            }
            "none" | crate::negotiate::IMPLICIT_MAC => return Ok(None),
            _ => {
                tracing::debug!("MAC {} cannot be verified", name);
                return Ok(None);
            }
        };
        Ok(Some(MacKey::Ring(ring_hmac::Key::new(
            algorithm,
            slice(key, key_len)?,
        ))))
    }

    fn verify(&self, sequence_number: u32, data: &[u8], tag: &[u8]) -> bool {
        let seq = sequence_number.to_be_bytes();
        let ok = match self {
            MacKey::Ring(key) => {
                let mut ctx = ring_hmac::Context::with_key(key);
                ctx.update(&seq);
                ctx.update(data);
                ctx.sign().as_ref().get(..tag.len()) == Some(tag)
            }
            MacKey::Md5(mac) => {
                let mut mac = mac.clone();
                mac.update(&seq);
                mac.update(data);
                mac.finalize().into_bytes().get(..tag.len()) == Some(tag)
            }
        };
        if !ok {
            tracing::debug!("MAC mismatch in record {}", sequence_number);
        }
        ok
    }
}
