//! KEXINIT parsing and algorithm negotiation.

// Refs:
// * https://tools.ietf.org/html/rfc4253#section-7.1
// * http://cvsweb.openbsd.org/cgi-bin/cvsweb/src/usr.bin/ssh/PROTOCOL

use crate::{
    sink::{Field, Tree},
    transport::Direction,
    util::{ReadError, Reader},
};
use std::{convert::TryInto as _, fmt};

/// The MAC name recorded for ciphers that authenticate on their own.
pub const IMPLICIT_MAC: &str = "<implicit>";

const AEAD_TAG_LEN: usize = 16;

/// One of the ten name-lists of a KEXINIT message, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Kex,
    HostKey,
    EncryptionClientToServer,
    EncryptionServerToClient,
    MacClientToServer,
    MacServerToClient,
    CompressionClientToServer,
    CompressionServerToClient,
    LanguagesClientToServer,
    LanguagesServerToClient,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::Kex,
        Category::HostKey,
        Category::EncryptionClientToServer,
        Category::EncryptionServerToClient,
        Category::MacClientToServer,
        Category::MacServerToClient,
        Category::CompressionClientToServer,
        Category::CompressionServerToClient,
        Category::LanguagesClientToServer,
        Category::LanguagesServerToClient,
    ];

    pub fn encryption(direction: Direction) -> Self {
        match direction {
            Direction::ClientToServer => Category::EncryptionClientToServer,
            Direction::ServerToClient => Category::EncryptionServerToClient,
        }
    }

    pub fn mac(direction: Direction) -> Self {
        match direction {
            Direction::ClientToServer => Category::MacClientToServer,
            Direction::ServerToClient => Category::MacServerToClient,
        }
    }

    pub fn compression(direction: Direction) -> Self {
        match direction {
            Direction::ClientToServer => Category::CompressionClientToServer,
            Direction::ServerToClient => Category::CompressionServerToClient,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// An ordered list of algorithm names without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameList(Vec<String>);

impl NameList {
    pub fn parse(raw: &[u8]) -> Self {
        let mut names: Vec<String> = vec![];
        for name in raw.split(|&c| c == b',').filter(|n| !n.is_empty()) {
            let name = String::from_utf8_lossy(name).into_owned();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Self(names)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NameList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

impl<'a> std::iter::FromIterator<&'a str> for NameList {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let joined = iter.into_iter().collect::<Vec<_>>().join(",");
        Self::parse(joined.as_bytes())
    }
}

/// The body of an `SSH_MSG_KEXINIT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    pub cookie: [u8; 16],
    lists: [NameList; 10],
    pub first_kex_packet_follows: bool,
    pub reserved: u32,
}

impl KexInit {
    /// Parses the fields following the message code.
    pub(crate) fn dissect(r: &mut Reader<'_>, tree: &mut Tree<'_>) -> Result<Self, ReadError> {
        let at = r.position();
        let cookie: [u8; 16] = r
            .read_slice(16)?
            .try_into()
            .map_err(|_| ReadError::OutOfBounds)?;
        tree.add(Field::Cookie, at, 16, crate::sink::Value::Bytes(&cookie));

        let mut lists: [NameList; 10] = Default::default();
        for category in Category::ALL.iter().copied() {
            let raw = tree.text(r, Field::NameList(category))?;
            lists[category.index()] = NameList::parse(raw);
        }

        let first_kex_packet_follows = tree.boolean(r, Field::FirstKexPacketFollows)?;
        let reserved = tree.u32(r, Field::Reserved)?;

        Ok(Self {
            cookie,
            lists,
            first_kex_packet_follows,
            reserved,
        })
    }

    pub fn list(&self, category: Category) -> &NameList {
        &self.lists[category.index()]
    }
}

/// Selects the first entry of `client` that `server` supports.
pub fn choose(client: &NameList, server: &NameList) -> Option<String> {
    client
        .iter()
        .find(|name| server.contains(name))
        .map(str::to_owned)
}

/// How the 4-byte length of a record is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthField {
    /// Encrypted together with the packet (CBC/CTR) or by a separate cipher (ChaCha20).
    Encrypted,
    /// Sent in clear but fed to the AEAD as associated data (GCM).
    Authenticated,
    /// Sent in clear and not processed by the cipher (encrypt-then-MAC, `none`).
    Plain,
}

impl LengthField {
    /// Whether the length can be read without decrypting.
    pub fn is_readable(self) -> bool {
        !matches!(self, LengthField::Encrypted)
    }
}

impl Default for LengthField {
    fn default() -> Self {
        LengthField::Encrypted
    }
}

/// Algorithms selected for one direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectionAlgorithms {
    pub enc: Option<String>,
    pub mac: Option<String>,
    pub mac_length: usize,
    pub length_field: LengthField,
    pub compression: Option<String>,
}

/// The outcome of matching a client KEXINIT against a server KEXINIT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiated {
    pub kex: Option<String>,
    pub host_key: Option<String>,
    pub directions: [DirectionAlgorithms; 2],
}

impl Negotiated {
    pub fn direction(&self, direction: Direction) -> &DirectionAlgorithms {
        &self.directions[direction.index()]
    }

    /// Categories for which no common algorithm exists.
    pub fn unresolved(&self) -> Vec<Category> {
        let mut missing = vec![];
        if self.kex.is_none() {
            missing.push(Category::Kex);
        }
        if self.host_key.is_none() {
            missing.push(Category::HostKey);
        }
        for &direction in &Direction::BOTH {
            let algs = self.direction(direction);
            if algs.enc.is_none() {
                missing.push(Category::encryption(direction));
            }
            if algs.mac.is_none() {
                missing.push(Category::mac(direction));
            }
            if algs.compression.is_none() {
                missing.push(Category::compression(direction));
            }
        }
        missing
    }

    /// Whether kex, encryption, MAC and compression all resolved.
    pub fn is_complete(&self) -> bool {
        self.kex.is_some()
            && self
                .directions
                .iter()
                .all(|d| d.enc.is_some() && d.mac.is_some() && d.compression.is_some())
    }
}

pub fn negotiate(client: &KexInit, server: &KexInit) -> Negotiated {
    let span = tracing::trace_span!("negotiate");
    let _enter = span.enter();

    let pick = |category| choose(client.list(category), server.list(category));

    let mut negotiated = Negotiated {
        kex: pick(Category::Kex),
        host_key: pick(Category::HostKey),
        directions: Default::default(),
    };

    for &direction in &Direction::BOTH {
        let enc = pick(Category::encryption(direction));
        let mut algs = DirectionAlgorithms {
            compression: pick(Category::compression(direction)),
            ..Default::default()
        };

        match enc.as_deref().map(aead_length_field) {
            Some(Some(length_field)) => {
                // the cipher carries its own tag
                algs.mac = Some(IMPLICIT_MAC.to_owned());
                algs.mac_length = AEAD_TAG_LEN;
                algs.length_field = length_field;
            }
            _ => {
                algs.mac = pick(Category::mac(direction));
                if let Some(ref mac) = algs.mac {
                    let (len, etm) = mac_length(mac);
                    algs.mac_length = len;
                    if etm {
                        algs.length_field = LengthField::Plain;
                    }
                }
                if enc.as_deref() == Some("none") {
                    algs.length_field = LengthField::Plain;
                }
            }
        }
        algs.enc = enc;

        tracing::trace!(
            "--> {:?}: enc={:?} mac={:?} ({} bytes) comp={:?}",
            direction,
            algs.enc,
            algs.mac,
            algs.mac_length,
            algs.compression
        );
        negotiated.directions[direction.index()] = algs;
    }

    negotiated
}

fn aead_length_field(enc: &str) -> Option<LengthField> {
    match enc {
        "aes128-gcm@openssh.com" | "aes256-gcm@openssh.com" => Some(LengthField::Authenticated),
        "chacha20-poly1305@openssh.com" => Some(LengthField::Encrypted),
        _ => None,
    }
}

/// Tag length of a MAC and whether it is an encrypt-then-MAC variant.
pub fn mac_length(name: &str) -> (usize, bool) {
    let (name, etm) = match name.strip_suffix("-etm@openssh.com") {
        Some(base) => (base, true),
        None => (name.strip_suffix("@openssh.com").unwrap_or(name), false),
    };

    // hmac-sha1-96, hmac-sha2-256, umac-64 ...
    if let Some(bits) = name
        .rsplit('-')
        .next()
        .filter(|_| name.contains('-'))
        .and_then(|s| s.parse::<usize>().ok())
    {
        return (bits / 8, etm);
    }

    let len = match name {
        "hmac-sha1" => 20,
        "hmac-md5" => 16,
        "hmac-ripemd160" => 20,
        _ => 0,
    };
    (len, etm)
}
