use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::OidcError;
use crate::claims::{COOKIE_AUTHENTICATION_TYPE, Claims, Identity, Principal};
use crate::config::CookieOptions;
use crate::crypto::{open_json, seal_json, sealed_key_id};
use crate::helpers::{MAX_COOKIE_BYTES, build_delete_cookie, build_set_cookie, cookie_value};
use crate::key_manager::KeyManager;

const CHUNK_COUNT_PREFIX: &str = "chunks-";
const MAX_COOKIE_CHUNKS: usize = 8;

/// Provider tokens retained in the session when `save_tokens` is enabled.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedTokens {
    #[serde(rename = "at", default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(rename = "rt", default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(rename = "it", default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(rename = "tt", default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Absolute access token expiry.
    #[serde(rename = "ea", default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl fmt::Debug for SavedTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |t: &Option<String>| t.as_ref().map(|_| "<redacted>");
        f.debug_struct("SavedTokens")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("id_token", &redact(&self.id_token))
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "c")]
    pub claims: Claims,
    #[serde(rename = "iat")]
    pub issued_at: u64,
    #[serde(rename = "exp")]
    pub expires_at: u64,
    #[serde(rename = "sl", default)]
    pub sliding: bool,
    #[serde(rename = "tk", default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<SavedTokens>,
}

impl Session {
    pub fn new(
        claims: Claims,
        tokens: Option<SavedTokens>,
        now: u64,
        lifetime_secs: u64,
        sliding: bool,
    ) -> Self {
        Self {
            claims,
            issued_at: now,
            expires_at: now.saturating_add(lifetime_secs),
            sliding,
            tokens,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// More than half of the lifetime has elapsed on a sliding session.
    pub fn should_renew(&self, now: u64) -> bool {
        if !self.sliding || self.is_expired(now) {
            return false;
        }
        let lifetime = self.expires_at.saturating_sub(self.issued_at);
        now.saturating_sub(self.issued_at) > lifetime / 2
    }

    pub fn renewed(&self, now: u64) -> Self {
        let lifetime = self.expires_at.saturating_sub(self.issued_at);
        Self {
            issued_at: now,
            expires_at: now.saturating_add(lifetime),
            ..self.clone()
        }
    }

    pub fn principal(&self) -> Principal {
        Principal::from_identity(Identity::authenticated(
            self.claims.clone(),
            COOKIE_AUTHENTICATION_TYPE,
        ))
    }
}

/// Seals sessions into the shared cookie and opens them again.
///
/// Any application holding the same key ring and cookie options can read a
/// cookie issued by another. A sealed value too large for one cookie is
/// split: `<name>=chunks-<n>` names the count and `<name>C1` through
/// `<name>C<n>` carry the pieces.
pub struct SessionCookieCodec {
    keys: Arc<KeyManager>,
    options: CookieOptions,
}

impl SessionCookieCodec {
    pub fn new(keys: Arc<KeyManager>, options: CookieOptions) -> Self {
        Self { keys, options }
    }

    pub fn options(&self) -> &CookieOptions {
        &self.options
    }

    /// The sealed value, before any chunking.
    pub fn encode_at(&self, session: &Session, now: u64) -> Result<String, OidcError> {
        let key = self.keys.encryption_key(now)?;
        let value = seal_json(&key, session)?;

        let limit = self.chunk_capacity() * MAX_COOKIE_CHUNKS;
        if value.len() > limit {
            return Err(OidcError::SessionTooLarge(limit));
        }
        Ok(value)
    }

    /// `Set-Cookie` header values for `session`: one cookie, or the chunk
    /// count followed by the chunks.
    pub fn issue_at(&self, session: &Session, now: u64) -> Result<Vec<String>, OidcError> {
        let value = self.encode_at(session, now)?;
        let max_age = session.expires_at.saturating_sub(now);
        let name = &self.options.name;

        if name.len() + 1 + value.len() <= MAX_COOKIE_BYTES {
            return Ok(vec![build_set_cookie(name, &value, max_age, &self.options)]);
        }

        let chunks = value
            .as_bytes()
            .chunks(self.chunk_capacity())
            .map(std::str::from_utf8)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| OidcError::Internal("sealed session is not ascii".to_string()))?;

        let mut set_cookies = Vec::with_capacity(chunks.len() + 1);
        set_cookies.push(build_set_cookie(
            name,
            &format!("{CHUNK_COUNT_PREFIX}{}", chunks.len()),
            max_age,
            &self.options,
        ));
        for (i, chunk) in chunks.into_iter().enumerate() {
            set_cookies.push(build_set_cookie(
                &self.chunk_name(i + 1),
                chunk,
                max_age,
                &self.options,
            ));
        }
        Ok(set_cookies)
    }

    /// `Ok(None)` for anything that is not a live session sealed with a known
    /// key. Only a failing key store is an error.
    pub fn decode_at(&self, value: &str, now: u64) -> Result<Option<Session>, OidcError> {
        let Some(key_id) = sealed_key_id(value) else {
            debug!("session cookie is malformed");
            return Ok(None);
        };
        let Some(key) = self.keys.decryption_key(key_id, now)? else {
            debug!(key_id, "session cookie sealed with unknown or expired key");
            return Ok(None);
        };

        let session: Session = match open_json(&key, value) {
            Ok(session) => session,
            Err(err) => {
                debug!(key_id, error = %err, "session cookie failed to open");
                return Ok(None);
            }
        };
        if session.is_expired(now) {
            debug!(key_id, "session cookie expired");
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// The sealed value carried by `cookie_header`, reassembled from chunks
    /// when needed. `None` when a chunk is missing.
    pub fn sealed_value(&self, cookie_header: Option<&str>) -> Option<String> {
        let value = cookie_value(cookie_header, &self.options.name)?;
        let Some(count) = value.strip_prefix(CHUNK_COUNT_PREFIX) else {
            return Some(value.to_string());
        };

        let count = count
            .parse::<usize>()
            .ok()
            .filter(|n| (1..=MAX_COOKIE_CHUNKS).contains(n))?;
        let value: Option<String> = (1..=count)
            .map(|i| cookie_value(cookie_header, &self.chunk_name(i)))
            .collect();
        if value.is_none() {
            debug!(count, "session cookie chunk missing");
        }
        value
    }

    pub fn session_from_header(
        &self,
        cookie_header: Option<&str>,
        now: u64,
    ) -> Result<Option<Session>, OidcError> {
        match self.sealed_value(cookie_header) {
            Some(value) => self.decode_at(&value, now),
            None => Ok(None),
        }
    }

    /// Deletion cookies for the session cookie and every chunk the request
    /// carried.
    pub fn delete_cookies(&self, cookie_header: Option<&str>) -> Vec<String> {
        let mut set_cookies = vec![build_delete_cookie(&self.options.name, &self.options)];
        for i in 1..=MAX_COOKIE_CHUNKS {
            let chunk = self.chunk_name(i);
            if cookie_value(cookie_header, &chunk).is_some() {
                set_cookies.push(build_delete_cookie(&chunk, &self.options));
            }
        }
        set_cookies
    }

    fn chunk_name(&self, index: usize) -> String {
        format!("{}C{index}", self.options.name)
    }

    /// Value bytes per chunk so that `<name>C<n>=<chunk>` stays in one cookie.
    fn chunk_capacity(&self) -> usize {
        MAX_COOKIE_BYTES
            .saturating_sub(self.chunk_name(MAX_COOKIE_CHUNKS).len() + 1)
            .max(1)
    }
}
