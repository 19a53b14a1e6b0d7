//! Message signatures
//!
//! The signature covers exactly the fields named in `openid.signed`, in that
//! order, serialized as `key:value\n` lines (key-value form, unprefixed keys)
//! and MACed with the association secret. The result is base64 encoded into
//! `openid.sig`.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use ring::hmac;
use subtle::ConstantTimeEq;

use crate::association::{Association, AssociationSecret};
use crate::error::{OpenIdError, Result};
use crate::message::{OPENID_PREFIX, ParameterSet};
use crate::types::AssociationType;

fn hmac_algorithm(assoc_type: AssociationType) -> hmac::Algorithm {
    match assoc_type {
        AssociationType::HmacSha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
        AssociationType::HmacSha256 => hmac::HMAC_SHA256,
    }
}

/// Build the exact byte string that is MACed for `fields`.
///
/// # Errors
///
/// Returns [`OpenIdError::MissingParameter`] if a listed field is absent, or
/// a value contains a newline (which would let one field forge another line).
pub fn signing_input(params: &ParameterSet, fields: &[&str]) -> Result<String> {
    let mut input = String::new();
    for field in fields {
        let value = params.get(field).ok_or_else(|| {
            OpenIdError::MissingParameter(format!("signed field {OPENID_PREFIX}{field}"))
        })?;
        if value.contains('\n') || field.contains(':') || field.contains('\n') {
            return Err(OpenIdError::MissingParameter(format!(
                "signed field {OPENID_PREFIX}{field} cannot be encoded in key-value form"
            )));
        }
        input.push_str(field);
        input.push(':');
        input.push_str(value);
        input.push('\n');
    }
    Ok(input)
}

/// Raw MAC over `fields` of `params`.
///
/// # Errors
///
/// See [`signing_input`].
pub fn compute_mac(
    secret: &AssociationSecret,
    assoc_type: AssociationType,
    params: &ParameterSet,
    fields: &[&str],
) -> Result<Vec<u8>> {
    let input = signing_input(params, fields)?;
    let key = hmac::Key::new(hmac_algorithm(assoc_type), secret.expose());
    Ok(hmac::sign(&key, input.as_bytes()).as_ref().to_vec())
}

/// Base64 signature over `fields` of `params`.
///
/// # Errors
///
/// See [`signing_input`].
pub fn sign(assoc: &Association, params: &ParameterSet, fields: &[&str]) -> Result<String> {
    compute_mac(&assoc.secret, assoc.assoc_type, params, fields).map(|mac| STANDARD.encode(mac))
}

/// Sign `params` in place: sets `assoc_handle`, `signed` and `sig`.
///
/// Used by providers and by tests that play the provider role.
///
/// # Errors
///
/// See [`signing_input`].
pub fn sign_message(assoc: &Association, params: &mut ParameterSet, fields: &[&str]) -> Result<()> {
    params.set("assoc_handle", assoc.handle.clone());
    params.set("signed", fields.join(","));
    let sig = sign(assoc, params, fields)?;
    params.set("sig", sig);
    Ok(())
}

/// Check `openid.sig` against the fields listed in `openid.signed`.
///
/// The comparison runs in constant time over the decoded MAC bytes.
///
/// # Errors
///
/// - [`OpenIdError::MissingParameter`] if `sig` or `signed` is absent
/// - [`OpenIdError::SignatureMismatch`] if the MAC does not match or `sig` is
///   not valid base64
pub fn verify_signature(assoc: &Association, params: &ParameterSet) -> Result<()> {
    let provided = params.require("sig")?;
    params.require("signed")?;
    let fields = params.signed_fields();

    let expected = compute_mac(&assoc.secret, assoc.assoc_type, params, &fields)?;
    let mismatch = || OpenIdError::SignatureMismatch {
        handle: assoc.handle.clone(),
    };

    let provided = STANDARD.decode(provided.trim()).map_err(|_| mismatch())?;
    if bool::from(provided.ct_eq(&expected)) {
        Ok(())
    } else {
        Err(mismatch())
    }
}
