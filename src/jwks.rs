use reqwest::blocking::Client;
use reqwest::header::CACHE_CONTROL;
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

use crate::OidcError;
use crate::helpers::now_secs;

const DEFAULT_JWKS_MAX_AGE_SECS: u64 = 300;
const MAX_REFRESH_BACKOFF_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DiscoveryDocument {
    pub(crate) issuer: String,
    pub(crate) authorization_endpoint: String,
    pub(crate) token_endpoint: String,
    pub(crate) jwks_uri: String,
    #[serde(default)]
    pub(crate) userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub(crate) end_session_endpoint: Option<String>,
}

impl DiscoveryDocument {
    fn validate(&self, require_https: bool) -> Result<(), OidcError> {
        if self.issuer.trim().is_empty()
            || self.authorization_endpoint.trim().is_empty()
            || self.token_endpoint.trim().is_empty()
            || self.jwks_uri.trim().is_empty()
        {
            return Err(OidcError::InvalidConfig(
                "discovery document is missing mandatory fields".to_string(),
            ));
        }

        let endpoints = [
            ("authorization_endpoint", Some(&self.authorization_endpoint)),
            ("token_endpoint", Some(&self.token_endpoint)),
            ("jwks_uri", Some(&self.jwks_uri)),
            ("userinfo_endpoint", self.userinfo_endpoint.as_ref()),
            ("end_session_endpoint", self.end_session_endpoint.as_ref()),
        ];
        for (field, endpoint) in endpoints {
            let Some(endpoint) = endpoint else {
                continue;
            };
            let url = Url::parse(endpoint).map_err(|e| {
                OidcError::InvalidConfig(format!("discovery {field} is not a valid url: {e}"))
            })?;
            if require_https && url.scheme() != "https" {
                return Err(OidcError::InvalidConfig(format!(
                    "discovery {field} must use https"
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    kty: String,
    #[serde(default)]
    alg: Option<String>,
    #[serde(default, rename = "use")]
    key_use: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub(crate) id_token: Option<String>,
    #[serde(default)]
    pub(crate) access_token: Option<String>,
    #[serde(default)]
    pub(crate) refresh_token: Option<String>,
    #[serde(default)]
    pub(crate) token_type: Option<String>,
    #[serde(default)]
    pub(crate) expires_in: Option<u64>,
}

/// Body of a token endpoint error response.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenErrorResponse {
    pub(crate) error: String,
    #[serde(default)]
    pub(crate) error_description: Option<String>,
}

/// RSA public key components published in the provider's key set.
#[derive(Debug, Clone)]
pub(crate) struct SigningKey {
    pub(crate) n: String,
    pub(crate) e: String,
}

impl Jwk {
    /// Id tokens are RS256 only; anything else in the set is skipped.
    fn into_signing_key(self) -> Option<(Option<String>, SigningKey)> {
        let rs256 = self.kty == "RSA"
            && self.alg.as_deref().is_none_or(|alg| alg == "RS256")
            && self.key_use.as_deref().is_none_or(|u| u == "sig");
        if !rs256 {
            return None;
        }
        let n = self.n.filter(|v| !v.trim().is_empty())?;
        let e = self.e.filter(|v| !v.trim().is_empty())?;
        let kid = self.kid.filter(|k| !k.trim().is_empty());
        Some((kid, SigningKey { n, e }))
    }
}

/// The provider's signing keys plus the bookkeeping for refetching them.
#[derive(Debug, Clone)]
pub(crate) struct JwksCache {
    by_kid: HashMap<String, SigningKey>,
    without_kid: Vec<SigningKey>,
    pub(crate) expires_at: u64,
    failures: u32,
    backoff_until: u64,
    generation: u64,
}

impl JwksCache {
    fn from_document(document: JwksDocument, max_age: u64, now: u64) -> Result<Self, OidcError> {
        let mut by_kid = HashMap::new();
        let mut without_kid = Vec::new();
        for (kid, key) in document.keys.into_iter().filter_map(Jwk::into_signing_key) {
            match kid {
                Some(kid) => {
                    by_kid.insert(kid, key);
                }
                None => without_kid.push(key),
            }
        }

        if by_kid.is_empty() && without_kid.is_empty() {
            return Err(OidcError::InvalidToken(
                "jwks does not contain usable RSA keys".to_string(),
            ));
        }

        Ok(Self {
            by_kid,
            without_kid,
            expires_at: now.saturating_add(max_age),
            failures: 0,
            backoff_until: 0,
            generation: 0,
        })
    }

    pub(crate) fn is_stale(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub(crate) fn in_backoff(&self, now: u64) -> bool {
        now < self.backoff_until
    }

    /// Bumped on every successful refresh.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Takes the keys and expiry of `fresh` and clears the failure count.
    pub(crate) fn replace(&mut self, fresh: JwksCache) {
        let generation = self.generation.wrapping_add(1);
        *self = JwksCache { generation, ..fresh };
    }

    /// Backs off 1s, 2s, 4s ... up to a minute. Returns the failure count.
    pub(crate) fn record_failure(&mut self, now: u64) -> u32 {
        let backoff = (1u64 << self.failures.min(6)).min(MAX_REFRESH_BACKOFF_SECS);
        self.failures = self.failures.saturating_add(1);
        self.backoff_until = now.saturating_add(backoff);
        self.failures
    }

    fn len(&self) -> usize {
        self.by_kid.len() + self.without_kid.len()
    }

    /// A token without `kid` only resolves when the set holds exactly one key.
    pub(crate) fn lookup(&self, kid: Option<&str>) -> Option<SigningKey> {
        match kid {
            Some(kid) => self.by_kid.get(kid).cloned(),
            None if self.len() == 1 => self
                .without_kid
                .first()
                .or_else(|| self.by_kid.values().next())
                .cloned(),
            None => None,
        }
    }
}

pub(crate) fn fetch_discovery(
    client: &Client,
    discovery_url: &str,
    require_https: bool,
) -> Result<DiscoveryDocument, OidcError> {
    let discovery: DiscoveryDocument = client.get(discovery_url).send()?.error_for_status()?.json()?;
    discovery.validate(require_https)?;
    Ok(discovery)
}

pub(crate) fn fetch_jwks_cache(client: &Client, jwks_uri: &str) -> Result<JwksCache, OidcError> {
    let response = client.get(jwks_uri).send()?.error_for_status()?;
    let max_age = response
        .headers()
        .get(CACHE_CONTROL)
        .and_then(|h| h.to_str().ok())
        .and_then(parse_max_age)
        .unwrap_or(DEFAULT_JWKS_MAX_AGE_SECS);
    JwksCache::from_document(response.json()?, max_age, now_secs())
}

fn parse_max_age(cache_control: &str) -> Option<u64> {
    cache_control
        .split(',')
        .find_map(|directive| directive.trim().strip_prefix("max-age="))
        .and_then(|secs| secs.parse().ok())
}
