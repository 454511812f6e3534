//! Key exchange methods.
//!
//! Each method knows how to pick its public values out of the method-specific messages
//! (codes 30 to 49) and how to turn one side's private key and the other side's public
//! value into the shared secret `K`. A method is selected once per key exchange from the
//! negotiated name, see [`method_for`].

// Refs:
// * https://tools.ietf.org/html/rfc4253#section-8
// * https://tools.ietf.org/html/rfc4419
// * https://tools.ietf.org/html/rfc5656#section-4
// * https://tools.ietf.org/html/rfc8731

mod groups;

use crate::{
    consts,
    crypto::{CryptoError, KeyMaterial},
    hostauth,
    sink::{Field, Tree},
    util::{ReadError, Reader},
};
use bytes::Bytes;
use std::fmt;

// defined in https://git.libssh.org/projects/libssh.git/tree/doc/curve25519-sha256@libssh.org.txt#n62
const CURVE25519_SHA256_LIBSSH: &str = "curve25519-sha256@libssh.org";
const CURVE25519_SHA256: &str = "curve25519-sha256";

/// A Diffie-Hellman group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGroup {
    pub modulus: KeyMaterial,
    pub generator: KeyMaterial,
}

impl DhGroup {
    fn fixed(modulus: &'static [u8]) -> Self {
        Self {
            modulus: KeyMaterial::from_static(modulus),
            generator: KeyMaterial::from_static(&[2]),
        }
    }
}

/// Group size preferences sent by the client of a group exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GexBounds {
    /// `SSH_MSG_KEX_DH_GEX_REQUEST_OLD`
    Old { n: u32 },
    /// `SSH_MSG_KEX_DH_GEX_REQUEST`
    New { min: u32, n: u32, max: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexKind {
    Dh,
    GroupExchange,
    Ecdh,
}

/// The role of a method-specific message code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexMessage {
    Init,
    Reply,
    GroupRequest,
    Group,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    Request(GexBounds),
    Group(DhGroup),
}

/// The server's reply: host key blob, server public value and signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexReply {
    pub host_key: Bytes,
    pub public: KeyMaterial,
    pub signature: Bytes,
}

pub trait KeyExchangeMethod: fmt::Debug + Send + Sync {
    /// The negotiated method name.
    fn name(&self) -> &str;

    fn kind(&self) -> KexKind;

    fn classify(&self, msg_code: u8) -> KexMessage;

    /// Dissects the client's init message, returning its public value (`e` or `Q_C`).
    fn on_init(&self, r: &mut Reader<'_>, tree: &mut Tree<'_>) -> Result<KeyMaterial, ReadError>;

    /// Dissects the server's reply message.
    fn on_reply(&self, r: &mut Reader<'_>, tree: &mut Tree<'_>) -> Result<KexReply, ReadError>;

    /// Dissects the messages that negotiate a group before `on_init`.
    fn on_group_message(
        &self,
        _msg_code: u8,
        _r: &mut Reader<'_>,
        _tree: &mut Tree<'_>,
    ) -> Result<Option<GroupEvent>, ReadError> {
        Ok(None)
    }

    /// Computes `K` from the private key of one side and the public value of the other.
    ///
    /// `group` carries the parameters negotiated by a group exchange.
    fn shared_secret(
        &self,
        peer_public: &KeyMaterial,
        private: &KeyMaterial,
        group: Option<&DhGroup>,
    ) -> Result<KeyMaterial, CryptoError>;
}

/// Returns the handler of the named method, if it is known.
pub fn method_for(name: &str) -> Option<Box<dyn KeyExchangeMethod>> {
    let method: Box<dyn KeyExchangeMethod> = match name {
        "diffie-hellman-group1-sha1" => Box::new(ClassicDh::new(name, &groups::OAKLEY_GROUP_2)),
        "diffie-hellman-group14-sha1" | "diffie-hellman-group14-sha256" => {
            Box::new(ClassicDh::new(name, &groups::MODP_GROUP_14))
        }
        "diffie-hellman-group16-sha512" => Box::new(ClassicDh::new(name, &groups::MODP_GROUP_16)),
        "diffie-hellman-group18-sha512" => Box::new(ClassicDh::new(name, &groups::MODP_GROUP_18)),
        "diffie-hellman-group-exchange-sha1" | "diffie-hellman-group-exchange-sha256" => {
            Box::new(GroupExchange {
                name: name.to_owned(),
            })
        }
        CURVE25519_SHA256 | CURVE25519_SHA256_LIBSSH => Box::new(Ecdh::new(name, Curve::X25519)),
        "ecdh-sha2-nistp256" => Box::new(Ecdh::new(name, Curve::NistP256)),
        "ecdh-sha2-nistp384" => Box::new(Ecdh::new(name, Curve::NistP384)),
        "ecdh-sha2-nistp521" => Box::new(Ecdh::new(name, Curve::NistP521)),
        _ => {
            tracing::debug!("unknown key exchange method {:?}", name);
            return None;
        }
    };
    Some(method)
}

fn dissect_reply(
    r: &mut Reader<'_>,
    tree: &mut Tree<'_>,
    public: Field,
) -> Result<KexReply, ReadError> {
    let at = r.position();
    let host_key = tree.string(r, Field::HostKey)?;
    if let Err(err) = hostauth::dissect_host_key(host_key, &mut tree.nested(at + 4)) {
        tracing::debug!("malformed host key blob: {}", err);
    }

    let f = tree.string(r, public)?;

    let at = r.position();
    let signature = tree.string(r, Field::Signature)?;
    if let Err(err) = hostauth::dissect_signature(signature, &mut tree.nested(at + 4)) {
        tracing::debug!("malformed signature blob: {}", err);
    }

    Ok(KexReply {
        host_key: Bytes::copy_from_slice(host_key),
        public: KeyMaterial::new(Bytes::copy_from_slice(f)),
        signature: Bytes::copy_from_slice(signature),
    })
}

fn dh_shared_secret(
    peer_public: &KeyMaterial,
    private: &KeyMaterial,
    group: &DhGroup,
) -> Result<KeyMaterial, CryptoError> {
    if peer_public.as_bytes().iter().all(|&b| b == 0) {
        return Err(CryptoError::InvalidPublicValue);
    }
    peer_public.mod_pow(private, &group.modulus)
}

// ==== ClassicDh ====

/// Diffie-Hellman over one of the fixed MODP groups.
#[derive(Debug)]
pub struct ClassicDh {
    name: String,
    group: DhGroup,
}

impl ClassicDh {
    fn new(name: &str, modulus: &'static [u8]) -> Self {
        Self {
            name: name.to_owned(),
            group: DhGroup::fixed(modulus),
        }
    }

    pub fn group(&self) -> &DhGroup {
        &self.group
    }
}

impl KeyExchangeMethod for ClassicDh {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> KexKind {
        KexKind::Dh
    }

    fn classify(&self, msg_code: u8) -> KexMessage {
        match msg_code {
            consts::SSH_MSG_KEXDH_INIT => KexMessage::Init,
            consts::SSH_MSG_KEXDH_REPLY => KexMessage::Reply,
            _ => KexMessage::Unknown,
        }
    }

    fn on_init(&self, r: &mut Reader<'_>, tree: &mut Tree<'_>) -> Result<KeyMaterial, ReadError> {
        tracing::trace!("--> KEXDH_INIT");
        let e = tree.string(r, Field::DhE)?;
        Ok(KeyMaterial::new(Bytes::copy_from_slice(e)))
    }

    fn on_reply(&self, r: &mut Reader<'_>, tree: &mut Tree<'_>) -> Result<KexReply, ReadError> {
        tracing::trace!("--> KEXDH_REPLY");
        dissect_reply(r, tree, Field::DhF)
    }

    fn shared_secret(
        &self,
        peer_public: &KeyMaterial,
        private: &KeyMaterial,
        _group: Option<&DhGroup>,
    ) -> Result<KeyMaterial, CryptoError> {
        dh_shared_secret(peer_public, private, &self.group)
    }
}

// ==== GroupExchange ====

/// Diffie-Hellman over a group chosen by the server.
#[derive(Debug)]
pub struct GroupExchange {
    name: String,
}

impl KeyExchangeMethod for GroupExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> KexKind {
        KexKind::GroupExchange
    }

    fn classify(&self, msg_code: u8) -> KexMessage {
        match msg_code {
            consts::SSH_MSG_KEX_DH_GEX_REQUEST_OLD | consts::SSH_MSG_KEX_DH_GEX_REQUEST => {
                KexMessage::GroupRequest
            }
            consts::SSH_MSG_KEX_DH_GEX_GROUP => KexMessage::Group,
            consts::SSH_MSG_KEX_DH_GEX_INIT => KexMessage::Init,
            consts::SSH_MSG_KEX_DH_GEX_REPLY => KexMessage::Reply,
            _ => KexMessage::Unknown,
        }
    }

    fn on_init(&self, r: &mut Reader<'_>, tree: &mut Tree<'_>) -> Result<KeyMaterial, ReadError> {
        tracing::trace!("--> KEX_DH_GEX_INIT");
        let e = tree.string(r, Field::DhE)?;
        Ok(KeyMaterial::new(Bytes::copy_from_slice(e)))
    }

    fn on_reply(&self, r: &mut Reader<'_>, tree: &mut Tree<'_>) -> Result<KexReply, ReadError> {
        tracing::trace!("--> KEX_DH_GEX_REPLY");
        dissect_reply(r, tree, Field::DhF)
    }

    fn on_group_message(
        &self,
        msg_code: u8,
        r: &mut Reader<'_>,
        tree: &mut Tree<'_>,
    ) -> Result<Option<GroupEvent>, ReadError> {
        match msg_code {
            consts::SSH_MSG_KEX_DH_GEX_REQUEST_OLD => {
                tracing::trace!("--> KEX_DH_GEX_REQUEST_OLD");
                let n = tree.u32(r, Field::GexPreferred)?;
                Ok(Some(GroupEvent::Request(GexBounds::Old { n })))
            }
            consts::SSH_MSG_KEX_DH_GEX_REQUEST => {
                tracing::trace!("--> KEX_DH_GEX_REQUEST");
                let min = tree.u32(r, Field::GexMin)?;
                let n = tree.u32(r, Field::GexPreferred)?;
                let max = tree.u32(r, Field::GexMax)?;
                Ok(Some(GroupEvent::Request(GexBounds::New { min, n, max })))
            }
            consts::SSH_MSG_KEX_DH_GEX_GROUP => {
                tracing::trace!("--> KEX_DH_GEX_GROUP");
                let p = tree.string(r, Field::GexModulus)?;
                let g = tree.string(r, Field::GexGenerator)?;
                Ok(Some(GroupEvent::Group(DhGroup {
                    modulus: KeyMaterial::new(Bytes::copy_from_slice(p)),
                    generator: KeyMaterial::new(Bytes::copy_from_slice(g)),
                })))
            }
            _ => Ok(None),
        }
    }

    fn shared_secret(
        &self,
        peer_public: &KeyMaterial,
        private: &KeyMaterial,
        group: Option<&DhGroup>,
    ) -> Result<KeyMaterial, CryptoError> {
        let group = group.ok_or(CryptoError::InvalidGroup)?;
        dh_shared_secret(peer_public, private, group)
    }
}

// ==== Ecdh ====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    X25519,
    NistP256,
    NistP384,
    NistP521,
}

/// Elliptic-curve Diffie-Hellman; the shared secret is computed for Curve25519 only.
#[derive(Debug)]
pub struct Ecdh {
    name: String,
    curve: Curve,
}

impl Ecdh {
    fn new(name: &str, curve: Curve) -> Self {
        Self {
            name: name.to_owned(),
            curve,
        }
    }
}

impl KeyExchangeMethod for Ecdh {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> KexKind {
        KexKind::Ecdh
    }

    fn classify(&self, msg_code: u8) -> KexMessage {
        match msg_code {
            consts::SSH_MSG_KEX_ECDH_INIT => KexMessage::Init,
            consts::SSH_MSG_KEX_ECDH_REPLY => KexMessage::Reply,
            _ => KexMessage::Unknown,
        }
    }

    fn on_init(&self, r: &mut Reader<'_>, tree: &mut Tree<'_>) -> Result<KeyMaterial, ReadError> {
        tracing::trace!("--> KEX_ECDH_INIT");
        let q_c = tree.string(r, Field::EcdhClientPublic)?;
        Ok(KeyMaterial::new(Bytes::copy_from_slice(q_c)))
    }

    fn on_reply(&self, r: &mut Reader<'_>, tree: &mut Tree<'_>) -> Result<KexReply, ReadError> {
        tracing::trace!("--> KEX_ECDH_REPLY");
        dissect_reply(r, tree, Field::EcdhServerPublic)
    }

    fn shared_secret(
        &self,
        peer_public: &KeyMaterial,
        private: &KeyMaterial,
        _group: Option<&DhGroup>,
    ) -> Result<KeyMaterial, CryptoError> {
        match self.curve {
            Curve::X25519 => private.x25519(peer_public),
            _ => Err(CryptoError::UnsupportedCurve),
        }
    }
}
