//! Dissection of the authentication messages described in RFC4252.

// Refs:
// * https://tools.ietf.org/html/rfc4252
// * https://tools.ietf.org/html/rfc4256

use crate::{
    consts,
    hostauth::{dissect_host_key, dissect_signature},
    sink::{Field, Tree},
    util::{ReadError, Reader},
};

pub(crate) fn dissect_message(
    msg_code: u8,
    r: &mut Reader<'_>,
    tree: &mut Tree<'_>,
) -> Result<(), ReadError> {
    match msg_code {
        consts::SSH_MSG_USERAUTH_REQUEST => {
            tracing::trace!("--> USERAUTH_REQUEST");
            tree.text(r, Field::UserName)?;
            tree.text(r, Field::ServiceName)?;
            let method = tree.text(r, Field::MethodName)?;
            match method {
                b"publickey" => dissect_publickey_request(r, tree)?,
                b"password" => {
                    let change = tree.boolean(r, Field::ChangePassword)?;
                    tree.text(r, Field::Password)?;
                    if change {
                        tree.text(r, Field::Password)?;
                    }
                }
                _ => {
                    tree.rest(r, Field::MessagePayload);
                }
            }
        }

        consts::SSH_MSG_USERAUTH_FAILURE => {
            tracing::trace!("--> USERAUTH_FAILURE");
            tree.text(r, Field::AuthMethods)?;
            tree.boolean(r, Field::PartialSuccess)?;
        }

        consts::SSH_MSG_USERAUTH_SUCCESS => {
            tracing::trace!("--> USERAUTH_SUCCESS");
        }

        consts::SSH_MSG_USERAUTH_BANNER => {
            tracing::trace!("--> USERAUTH_BANNER");
            tree.text(r, Field::BannerMessage)?;
            tree.text(r, Field::LanguageTag)?;
        }

        consts::SSH_MSG_USERAUTH_PK_OK => {
            tracing::trace!("--> USERAUTH_PK_OK");
            tree.text(r, Field::PublicKeyAlgorithm)?;
            dissect_key_blob(r, tree)?;
        }

        typ => {
            // 61 and up depend on the method in use, which is not tracked.
            tracing::trace!("method specific userauth message (typ = {})", typ);
            tree.rest(r, Field::MessagePayload);
        }
    }

    Ok(())
}

fn dissect_publickey_request(r: &mut Reader<'_>, tree: &mut Tree<'_>) -> Result<(), ReadError> {
    let has_signature = tree.boolean(r, Field::HasSignature)?;
    tree.text(r, Field::PublicKeyAlgorithm)?;
    dissect_key_blob(r, tree)?;
    if has_signature {
        let at = r.position();
        let blob = tree.string(r, Field::Signature)?;
        dissect_signature(blob, &mut tree.nested(at + 4))?;
    }
    Ok(())
}

fn dissect_key_blob(r: &mut Reader<'_>, tree: &mut Tree<'_>) -> Result<(), ReadError> {
    let at = r.position();
    let blob = tree.string(r, Field::PublicKeyBlob)?;
    dissect_host_key(blob, &mut tree.nested(at + 4))?;
    Ok(())
}
