//! Inputs of the exchange hash `H`.

// Refs:
// * https://tools.ietf.org/html/rfc4253#section-8
// * https://tools.ietf.org/html/rfc4419#section-3
// * https://tools.ietf.org/html/rfc5656#section-4

use crate::{
    crypto::{HashAlgorithm, KeyMaterial},
    kex::{DhGroup, GexBounds, KexKind},
    transport::Direction,
    util::{put_ssh_mpint, put_ssh_string},
};
use bytes::{BufMut as _, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptError {
    #[error("{0} has not been seen")]
    Incomplete(&'static str),
}

/// The public values and secret that close the transcript.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeValues<'a> {
    pub kind: KexKind,
    /// The group negotiated by a group exchange.
    pub group: Option<&'a DhGroup>,
    /// `e` or `Q_C`, exactly as sent.
    pub client_public: &'a KeyMaterial,
    /// `f` or `Q_S`, exactly as sent.
    pub server_public: &'a KeyMaterial,
    pub shared_secret: &'a KeyMaterial,
}

/// Collects the exchange hash inputs as they appear in the stream.
#[derive(Debug, Clone, Default)]
pub struct TranscriptAccumulator {
    versions: [Option<Bytes>; 2],
    kexinits: [Option<Bytes>; 2],
    host_key: Option<Bytes>,
    gex_bounds: Option<GexBounds>,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the identification string, without its line terminator.
    pub fn set_version(&mut self, direction: Direction, banner: &[u8]) {
        self.versions[direction.index()] = Some(Bytes::copy_from_slice(banner));
    }

    /// Records a KEXINIT payload, starting with the message code.
    pub fn set_kexinit(&mut self, direction: Direction, payload: &[u8]) {
        self.kexinits[direction.index()] = Some(Bytes::copy_from_slice(payload));
    }

    pub fn set_host_key(&mut self, blob: &[u8]) {
        self.host_key = Some(Bytes::copy_from_slice(blob));
    }

    pub fn set_gex_bounds(&mut self, bounds: GexBounds) {
        self.gex_bounds = Some(bounds);
    }

    pub fn version(&self, direction: Direction) -> Option<&[u8]> {
        self.versions[direction.index()].as_deref()
    }

    pub fn has_kexinit(&self, direction: Direction) -> bool {
        self.kexinits[direction.index()].is_some()
    }

    /// Drops everything but the identification strings, which stay valid across re-keying.
    pub fn reset_round(&mut self) {
        self.kexinits = Default::default();
        self.host_key = None;
        self.gex_bounds = None;
    }

    pub fn exchange_hash(
        &self,
        hash: HashAlgorithm,
        values: &ExchangeValues<'_>,
    ) -> Result<Bytes, TranscriptError> {
        let span = tracing::trace_span!("TranscriptAccumulator::exchange_hash");
        let _enter = span.enter();

        let [v_c, v_s] = &self.versions;
        let v_c = v_c.as_ref().ok_or(TranscriptError::Incomplete("client version"))?;
        let v_s = v_s.as_ref().ok_or(TranscriptError::Incomplete("server version"))?;
        let [i_c, i_s] = &self.kexinits;
        let i_c = i_c.as_ref().ok_or(TranscriptError::Incomplete("client KEXINIT"))?;
        let i_s = i_s.as_ref().ok_or(TranscriptError::Incomplete("server KEXINIT"))?;
        let k_s = self
            .host_key
            .as_ref()
            .ok_or(TranscriptError::Incomplete("server host key"))?;

        let mut buf = BytesMut::new();
        put_ssh_string(&mut buf, v_c);
        put_ssh_string(&mut buf, v_s);
        put_ssh_string(&mut buf, i_c);
        put_ssh_string(&mut buf, i_s);
        put_ssh_string(&mut buf, k_s);

        if values.kind == KexKind::GroupExchange {
            match self.gex_bounds {
                Some(GexBounds::Old { n }) => buf.put_u32(n),
                Some(GexBounds::New { min, n, max }) => {
                    buf.put_u32(min);
                    buf.put_u32(n);
                    buf.put_u32(max);
                }
                None => return Err(TranscriptError::Incomplete("group request")),
            }
            let group = values
                .group
                .ok_or(TranscriptError::Incomplete("group parameters"))?;
            put_ssh_string(&mut buf, group.modulus.as_bytes());
            put_ssh_string(&mut buf, group.generator.as_bytes());
        }

        // e and f are mpints and Q_C and Q_S are strings; both keep their wire encoding.
        put_ssh_string(&mut buf, values.client_public.as_bytes());
        put_ssh_string(&mut buf, values.server_public.as_bytes());
        put_ssh_mpint(&mut buf, values.shared_secret.as_bytes());

        tracing::trace!("hashing {} bytes with {:?}", buf.len(), hash);
        Ok(hash.digest(&buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> TranscriptAccumulator {
        let mut t = TranscriptAccumulator::new();
        t.set_version(Direction::ClientToServer, b"SSH-2.0-client");
        t.set_version(Direction::ServerToClient, b"SSH-2.0-server");
        t.set_kexinit(Direction::ClientToServer, b"\x14client");
        t.set_kexinit(Direction::ServerToClient, b"\x14server");
        t.set_host_key(b"host key blob");
        t
    }

    #[test]
    fn ecdh_hash_covers_fields_in_order() {
        let q_c = KeyMaterial::new(vec![1u8; 32]);
        let q_s = KeyMaterial::new(vec![2u8; 32]);
        let k = KeyMaterial::new(vec![0x80, 1]);
        let values = ExchangeValues {
            kind: KexKind::Ecdh,
            group: None,
            client_public: &q_c,
            server_public: &q_s,
            shared_secret: &k,
        };

        let mut expected = vec![];
        for s in &[
            &b"SSH-2.0-client"[..],
            b"SSH-2.0-server",
            b"\x14client",
            b"\x14server",
            b"host key blob",
            &[1u8; 32],
            &[2u8; 32],
        ] {
            put_ssh_string(&mut expected, s);
        }
        expected.extend_from_slice(&[0, 0, 0, 3, 0, 0x80, 1]);

        let h = filled()
            .exchange_hash(HashAlgorithm::Sha256, &values)
            .unwrap();
        assert_eq!(h, HashAlgorithm::Sha256.digest(&expected));
    }

    #[test]
    fn gex_needs_bounds_and_group() {
        let e = KeyMaterial::new(vec![5]);
        let group = DhGroup {
            modulus: KeyMaterial::new(vec![0, 0xe3]),
            generator: KeyMaterial::new(vec![2]),
        };
        let mut values = ExchangeValues {
            kind: KexKind::GroupExchange,
            group: None,
            client_public: &e,
            server_public: &e,
            shared_secret: &e,
        };

        let mut t = filled();
        assert_eq!(
            t.exchange_hash(HashAlgorithm::Sha1, &values),
            Err(TranscriptError::Incomplete("group request"))
        );
        t.set_gex_bounds(GexBounds::New {
            min: 1024,
            n: 2048,
            max: 8192,
        });
        assert_eq!(
            t.exchange_hash(HashAlgorithm::Sha1, &values),
            Err(TranscriptError::Incomplete("group parameters"))
        );
        values.group = Some(&group);

        let expected = |bounds: &[u32]| {
            let mut buf = vec![];
            for s in &[
                &b"SSH-2.0-client"[..],
                b"SSH-2.0-server",
                b"\x14client",
                b"\x14server",
                b"host key blob",
            ] {
                put_ssh_string(&mut buf, s);
            }
            for &bound in bounds {
                buf.extend_from_slice(&bound.to_be_bytes());
            }
            // p with its sign byte, g, e, f, K
            buf.extend_from_slice(&[0, 0, 0, 2, 0, 0xe3, 0, 0, 0, 1, 2]);
            for _ in 0..3 {
                buf.extend_from_slice(&[0, 0, 0, 1, 5]);
            }
            HashAlgorithm::Sha1.digest(&buf)
        };
        let h = t.exchange_hash(HashAlgorithm::Sha1, &values).unwrap();
        assert_eq!(h, expected(&[1024, 2048, 8192]));

        t.set_gex_bounds(GexBounds::Old { n: 2048 });
        let h = t.exchange_hash(HashAlgorithm::Sha1, &values).unwrap();
        assert_eq!(h, expected(&[2048]));
    }

    #[test]
    fn reset_round_keeps_versions() {
        let mut t = filled();
        t.reset_round();
        assert!(!t.has_kexinit(Direction::ClientToServer));
        let k = KeyMaterial::new(vec![1]);
        let values = ExchangeValues {
            kind: KexKind::Dh,
            group: None,
            client_public: &k,
            server_public: &k,
            shared_secret: &k,
        };
        assert_eq!(
            t.exchange_hash(HashAlgorithm::Sha256, &values),
            Err(TranscriptError::Incomplete("client KEXINIT"))
        );
        assert_eq!(t.versions[0].as_deref(), Some(&b"SSH-2.0-client"[..]));
    }
}
