//! Host keys and exchange-hash signatures as they appear in key exchange replies.

// Refs:
// * https://tools.ietf.org/html/rfc4253#section-6.6
// * https://tools.ietf.org/html/rfc5656#section-3.1
// * https://tools.ietf.org/html/rfc8709#section-4

use crate::{
    sink::{Field, Tree},
    util::{ReadError, Reader},
};

/// Dissects a public key blob; `tree` is positioned at the start of the blob.
pub(crate) fn dissect_host_key(blob: &[u8], tree: &mut Tree<'_>) -> Result<(), ReadError> {
    let mut r = Reader::new(blob);
    let key_type = tree.text(&mut r, Field::HostKeyType)?;

    match key_type {
        b"ssh-rsa" => {
            tree.string(&mut r, Field::RsaExponent)?;
            tree.string(&mut r, Field::RsaModulus)?;
        }
        b"ssh-dss" => {
            tree.string(&mut r, Field::DsaP)?;
            tree.string(&mut r, Field::DsaQ)?;
            tree.string(&mut r, Field::DsaG)?;
            tree.string(&mut r, Field::DsaY)?;
        }
        b"ssh-ed25519" | b"ssh-ed448" => {
            tree.string(&mut r, Field::EdwardsKey)?;
        }
        t if t.starts_with(b"ecdsa-sha2-") => {
            tree.text(&mut r, Field::EcdsaCurve)?;
            tree.string(&mut r, Field::EcdsaPoint)?;
        }
        _ => {
            tree.rest(&mut r, Field::KeyData);
        }
    }

    Ok(())
}

pub(crate) fn dissect_signature(blob: &[u8], tree: &mut Tree<'_>) -> Result<(), ReadError> {
    let mut r = Reader::new(blob);
    tree.text(&mut r, Field::SignatureType)?;
    tree.string(&mut r, Field::SignatureData)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sink::{OwnedValue, Recorder, Source},
        util::put_ssh_string,
    };

    #[test]
    fn rsa_key_fields() {
        let mut blob = vec![];
        put_ssh_string(&mut blob, b"ssh-rsa");
        put_ssh_string(&mut blob, &[1, 0, 1]);
        put_ssh_string(&mut blob, &[0, 0xc3, 0x11]);

        let mut sink = Recorder::new();
        dissect_host_key(&blob, &mut Tree::new(&mut sink, Source::Wire, 100)).unwrap();
        assert_eq!(
            sink.find(Field::HostKeyType).unwrap().value,
            OwnedValue::Text("ssh-rsa".into())
        );

        let n = sink.find(Field::RsaModulus).unwrap();
        assert_eq!(n.span.offset, 100 + 11 + 7 + 4);
        assert_eq!(n.span.len, 3);
    }

    #[test]
    fn truncated_signature() {
        let mut blob = vec![];
        put_ssh_string(&mut blob, b"ssh-ed25519");
        blob.extend_from_slice(&[0, 0, 0, 64, 1, 2]);

        let mut sink = Recorder::new();
        let err = dissect_signature(&blob, &mut Tree::new(&mut sink, Source::Wire, 0));
        assert_eq!(err, Err(ReadError::OutOfBounds));
    }
}
