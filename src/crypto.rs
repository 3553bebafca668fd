use aes_gcm::Nonce;
use aes_gcm::aead::{Aead, OsRng, Payload, rand_core::RngCore};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::OidcError;
use crate::keyring::ProtectionKey;

pub(crate) const SESSION_COOKIE_PREFIX: &str = "v1.";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Seals `value` as `v1.<key id>.<base64url(nonce || ciphertext)>`. The key id
/// is bound as associated data so it cannot be swapped.
pub(crate) fn seal_json<T: Serialize>(key: &ProtectionKey, value: &T) -> Result<String, OidcError> {
    let payload = serde_json::to_vec(value)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = key
        .cipher()?
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &payload,
                aad: key.id.as_bytes(),
            },
        )
        .map_err(|_| OidcError::Crypto)?;

    let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);

    Ok(format!(
        "{SESSION_COOKIE_PREFIX}{}.{}",
        key.id,
        URL_SAFE_NO_PAD.encode(out)
    ))
}

/// The key id a sealed value claims to be protected with.
pub(crate) fn sealed_key_id(value: &str) -> Option<&str> {
    let (key_id, _) = value.strip_prefix(SESSION_COOKIE_PREFIX)?.split_once('.')?;
    if key_id.is_empty() {
        None
    } else {
        Some(key_id)
    }
}

pub(crate) fn open_json<T: DeserializeOwned>(
    key: &ProtectionKey,
    value: &str,
) -> Result<T, OidcError> {
    let (key_id, encoded) = value
        .strip_prefix(SESSION_COOKIE_PREFIX)
        .and_then(|rest| rest.split_once('.'))
        .ok_or(OidcError::Crypto)?;
    if key_id != key.id {
        return Err(OidcError::Crypto);
    }

    let raw = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| OidcError::Crypto)?;
    if raw.len() < NONCE_LEN + TAG_LEN {
        return Err(OidcError::Crypto);
    }

    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    let plaintext = key
        .cipher()?
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: key.id.as_bytes(),
            },
        )
        .map_err(|_| OidcError::Crypto)?;

    Ok(serde_json::from_slice(&plaintext)?)
}
