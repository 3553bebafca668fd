//! OpenID Connect relying party: the authorization-code + PKCE exchange.
//!
//! A login attempt moves from *idle* to *challenge issued* when
//! [`OidcRelyingParty::begin_challenge`] stores a [`ChallengeState`] and
//! hands back the provider redirect, and from *callback received* to either
//! *validated* or *rejected* in [`OidcRelyingParty::complete_callback`].
//! Rejected attempts never produce claims.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use reqwest::blocking::Client;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use url::Url;

use crate::OidcError;
use crate::challenge::{ChallengeLookup, ChallengeState, ChallengeStore, MemoryChallengeStore};
use crate::claims::{Claims, SUBJECT_CLAIM};
use crate::config::{AuthConfig, CookieOptions};
use crate::helpers::{
    build_delete_cookie, build_set_cookie, cookie_value, derive_return_to, now_secs, query_param,
    random_token, request_path,
};
use crate::jwks::{
    DiscoveryDocument, JwksCache, TokenErrorResponse, TokenResponse, fetch_discovery,
    fetch_jwks_cache,
};
use crate::pkce::{CODE_CHALLENGE_METHOD, PkcePair};
use crate::session::SavedTokens;

#[derive(Debug, Clone)]
pub struct AuthorizationStart {
    pub url: String,
    /// Binds the attempt to the browser that started it.
    pub correlation_set_cookie: String,
}

#[derive(Debug, Clone)]
pub struct ValidatedLogin {
    pub subject: String,
    pub claims: Claims,
    pub tokens: SavedTokens,
    pub return_to: String,
}

pub struct OidcRelyingParty {
    config: AuthConfig,
    client: Client,
    discovery: DiscoveryDocument,
    jwks_cache: Mutex<JwksCache>,
    challenges: Arc<dyn ChallengeStore>,
    callback_path: String,
}

impl OidcRelyingParty {
    /// Fetches discovery and the JWKS; fails closed if either is unusable.
    pub fn new(config: AuthConfig) -> Result<Self, OidcError> {
        Self::with_challenge_store(config, Arc::new(MemoryChallengeStore::new()))
    }

    pub fn with_challenge_store(
        config: AuthConfig,
        challenges: Arc<dyn ChallengeStore>,
    ) -> Result<Self, OidcError> {
        let config = config.normalize()?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.http_connect_timeout_secs))
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;

        let discovery = fetch_discovery(&client, &config.discovery_url(), !config.development)?;
        let jwks_cache = fetch_jwks_cache(&client, &discovery.jwks_uri)?;
        let callback_path = request_path(&config.redirect_uri);

        info!(
            issuer = %discovery.issuer,
            client_id = %config.client_id,
            callback_path = %callback_path,
            "oidc relying party initialized"
        );

        Ok(Self {
            config,
            client,
            discovery,
            jwks_cache: Mutex::new(jwks_cache),
            challenges,
            callback_path,
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn issuer(&self) -> &str {
        &self.discovery.issuer
    }

    pub fn is_callback(&self, request_url: &str) -> bool {
        request_path(request_url) == self.callback_path
    }

    pub fn begin_challenge(&self, request_url: &str) -> Result<AuthorizationStart, OidcError> {
        self.begin_challenge_at(request_url, now_secs())
    }

    pub fn begin_challenge_at(
        &self,
        request_url: &str,
        now: u64,
    ) -> Result<AuthorizationStart, OidcError> {
        let state = random_token(32);
        let nonce = random_token(32);
        let pkce = PkcePair::generate();
        let return_to = derive_return_to(request_url);

        let mut auth_url = Url::parse(&self.discovery.authorization_endpoint)?;
        auth_url
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scope_param())
            .append_pair("state", &state)
            .append_pair("nonce", &nonce)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", CODE_CHALLENGE_METHOD);

        self.challenges.insert(
            ChallengeState {
                state: state.clone(),
                nonce,
                code_verifier: pkce.verifier,
                return_to: return_to.clone(),
                expires_at: now.saturating_add(self.config.state_ttl_secs),
            },
            now,
        )?;

        let correlation_set_cookie = build_set_cookie(
            &self.config.state_cookie_name(),
            &state,
            self.config.state_ttl_secs,
            &self.correlation_cookie_options(),
        );

        debug!(return_to = %return_to, "issued authentication challenge");

        Ok(AuthorizationStart {
            url: auth_url.to_string(),
            correlation_set_cookie,
        })
    }

    pub fn correlation_delete_cookie(&self) -> String {
        build_delete_cookie(
            &self.config.state_cookie_name(),
            &self.correlation_cookie_options(),
        )
    }

    // Host-only: concurrent logins on sibling applications must not overwrite
    // each other's correlation cookie.
    fn correlation_cookie_options(&self) -> CookieOptions {
        CookieOptions {
            domain: None,
            ..self.config.cookie.clone()
        }
    }

    pub fn complete_callback(
        &self,
        callback_url: &str,
        cookie_header: Option<&str>,
    ) -> Result<ValidatedLogin, OidcError> {
        self.complete_callback_at(callback_url, cookie_header, now_secs())
    }

    pub fn complete_callback_at(
        &self,
        callback_url: &str,
        cookie_header: Option<&str>,
        now: u64,
    ) -> Result<ValidatedLogin, OidcError> {
        let challenge = self.take_challenge(callback_url, cookie_header, now)?;

        if let Some(error) = query_param(callback_url, "error") {
            let description = query_param(callback_url, "error_description").unwrap_or_default();
            return Err(OidcError::Provider(if description.is_empty() {
                error
            } else {
                format!("{error}: {description}")
            }));
        }

        let code = query_param(callback_url, "code").unwrap_or_default();
        if code.trim().is_empty() {
            return Err(OidcError::InvalidToken(
                "missing authorization code".to_string(),
            ));
        }

        let token_response = self.exchange_code(&code, &challenge.code_verifier)?;
        let id_token = token_response
            .id_token
            .clone()
            .ok_or_else(|| OidcError::InvalidToken("token response missing id_token".to_string()))?;
        let id_claims = self.validate_id_token(&id_token, &challenge.nonce)?;
        let subject = id_claims
            .get(SUBJECT_CLAIM)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut claims = Claims::from_json_object(&id_claims);
        if self.config.fetch_userinfo
            && let Some(endpoint) = self.discovery.userinfo_endpoint.as_deref()
        {
            let access_token = token_response.access_token.as_deref().ok_or_else(|| {
                OidcError::InvalidToken("token response missing access_token".to_string())
            })?;
            let userinfo = self.fetch_userinfo(endpoint, access_token, &subject)?;
            claims.merge_missing(&userinfo);
        }
        let claims = self.config.claim_mapping.apply(claims);

        let tokens = SavedTokens {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            id_token: Some(id_token),
            token_type: token_response.token_type,
            expires_at: token_response
                .expires_in
                .map(|secs| now.saturating_add(secs)),
        };

        info!(subject = %subject, "authentication callback validated");

        Ok(ValidatedLogin {
            subject,
            claims,
            tokens,
            return_to: challenge.return_to,
        })
    }

    fn take_challenge(
        &self,
        callback_url: &str,
        cookie_header: Option<&str>,
        now: u64,
    ) -> Result<ChallengeState, OidcError> {
        let state = query_param(callback_url, "state").unwrap_or_default();
        if state.is_empty() {
            return Err(OidcError::InvalidState);
        }

        let correlation = cookie_value(cookie_header, &self.config.state_cookie_name())
            .ok_or(OidcError::InvalidState)?;
        if !bool::from(state.as_bytes().ct_eq(correlation.as_bytes())) {
            return Err(OidcError::InvalidState);
        }

        match self.challenges.take(&state, now)? {
            ChallengeLookup::Found(challenge) => Ok(challenge),
            ChallengeLookup::Consumed => Err(OidcError::StateConsumed),
            ChallengeLookup::Expired | ChallengeLookup::Unknown => Err(OidcError::InvalidState),
        }
    }

    fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenResponse, OidcError> {
        let response = self
            .client
            .post(&self.discovery.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code_verifier", code_verifier),
            ])
            .send()?;

        let status = response.status();
        // A provider outage fails the request; it does not prove the login invalid.
        let response = if status.is_server_error() {
            response.error_for_status()?
        } else {
            response
        };

        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => OidcError::Provider(match err.error_description {
                    Some(description) => format!("{}: {description}", err.error),
                    None => err.error,
                }),
                Err(_) => OidcError::InvalidToken(format!("token endpoint returned {status}")),
            });
        }

        let body = response.text()?;
        serde_json::from_str(&body).map_err(|e| {
            OidcError::InvalidToken(format!("token endpoint returned malformed json: {e}"))
        })
    }

    fn validate_id_token(
        &self,
        id_token: &str,
        expected_nonce: &str,
    ) -> Result<Map<String, Value>, OidcError> {
        // A provider outage keeps validation running on the cached keys.
        if let Err(err) = self.refresh_jwks(false) {
            warn!(error = %err, "using cached jwks");
        }

        let header = decode_header(id_token)?;
        if header.alg != Algorithm::RS256 {
            return Err(OidcError::InvalidToken(
                "only RS256 id tokens are accepted".to_string(),
            ));
        }

        let key = self.decoding_key(header.kid.as_deref())?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.discovery.issuer.as_str()]);
        validation.set_audience(&[self.config.client_id.as_str()]);
        validation.required_spec_claims = HashSet::from([
            "exp".to_string(),
            "iat".to_string(),
            "aud".to_string(),
            "iss".to_string(),
            "sub".to_string(),
        ]);

        let token_data = decode::<Value>(id_token, &key, &validation)?;
        let Value::Object(claims) = token_data.claims else {
            return Err(OidcError::InvalidToken(
                "id token payload must be an object".to_string(),
            ));
        };

        let nonce = claims
            .get("nonce")
            .and_then(Value::as_str)
            .ok_or_else(|| OidcError::InvalidToken("nonce claim missing".to_string()))?;
        let sub = claims
            .get(SUBJECT_CLAIM)
            .and_then(Value::as_str)
            .ok_or_else(|| OidcError::InvalidToken("sub claim missing".to_string()))?;

        if !bool::from(nonce.as_bytes().ct_eq(expected_nonce.as_bytes())) {
            return Err(OidcError::InvalidToken("nonce mismatch".to_string()));
        }
        if sub.trim().is_empty() {
            return Err(OidcError::InvalidToken("sub claim missing".to_string()));
        }

        Ok(claims)
    }

    fn fetch_userinfo(
        &self,
        endpoint: &str,
        access_token: &str,
        subject: &str,
    ) -> Result<Map<String, Value>, OidcError> {
        let body = self
            .client
            .get(endpoint)
            .bearer_auth(access_token)
            .send()?
            .error_for_status()?
            .text()?;
        let userinfo: Map<String, Value> = serde_json::from_str(&body).map_err(|e| {
            OidcError::InvalidToken(format!("userinfo returned malformed json: {e}"))
        })?;

        if userinfo.get(SUBJECT_CLAIM).and_then(Value::as_str) != Some(subject) {
            return Err(OidcError::InvalidToken(
                "userinfo subject does not match id token".to_string(),
            ));
        }
        Ok(userinfo)
    }

    /// Provider logout URL, if the provider advertises an end-session endpoint.
    pub fn end_session_url(&self, id_token_hint: Option<&str>) -> Result<Option<String>, OidcError> {
        let Some(endpoint) = self.discovery.end_session_endpoint.as_deref() else {
            return Ok(None);
        };

        let mut url = Url::parse(endpoint)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.config.client_id);
            if let Some(hint) = id_token_hint {
                query.append_pair("id_token_hint", hint);
            }
            if let Some(uri) = self.config.post_logout_redirect_uri.as_deref() {
                query.append_pair("post_logout_redirect_uri", uri);
            }
        }
        Ok(Some(url.to_string()))
    }

    fn jwks(&self) -> Result<MutexGuard<'_, JwksCache>, OidcError> {
        self.jwks_cache
            .lock()
            .map_err(|_| OidcError::Internal("jwks mutex poisoned".to_string()))
    }

    /// Refetches the provider's key set when it is stale, or unconditionally
    /// with `force` (a token named a key the cache does not hold).
    fn refresh_jwks(&self, force: bool) -> Result<(), OidcError> {
        let now = now_secs();
        let seen = {
            let cache = self.jwks()?;
            if !force && !cache.is_stale(now) {
                return Ok(());
            }
            if cache.in_backoff(now) {
                return Err(OidcError::InvalidToken(
                    "jwks refresh in backoff window".to_string(),
                ));
            }
            cache.generation()
        };

        let fetched = fetch_jwks_cache(&self.client, &self.discovery.jwks_uri);
        let mut cache = self.jwks()?;
        if cache.generation() != seen {
            // Another request refreshed while this one was fetching.
            return Ok(());
        }
        match fetched {
            Ok(fresh) => {
                cache.replace(fresh);
                debug!(generation = cache.generation(), "refreshed jwks");
                Ok(())
            }
            Err(err) => {
                let failures = cache.record_failure(now_secs());
                warn!(error = %err, failures, "jwks refresh failed");
                Err(err)
            }
        }
    }

    fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, OidcError> {
        let cached = self.jwks()?.lookup(kid);
        let key = match cached {
            Some(key) => key,
            None => {
                self.refresh_jwks(true)?;
                self.jwks()?.lookup(kid).ok_or_else(|| {
                    OidcError::InvalidToken("no matching jwk found for token kid".to_string())
                })?
            }
        };
        DecodingKey::from_rsa_components(&key.n, &key.e)
            .map_err(|e| OidcError::InvalidToken(format!("invalid jwk: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::ClaimMapping;
    use crate::pkce::code_challenge;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use mockito::Matcher;
    use serde_json::json;

    const FIXTURE_RSA_PRIVATE_PEM: &str = include_str!("../fixtures/test-keys/rsa-private.pem");
    const FIXTURE_WRONG_RSA_PRIVATE_PEM: &str =
        include_str!("../fixtures/test-keys/wrong-key-private.pem");
    const FIXTURE_JWKS_JSON: &str = include_str!("../fixtures/test-keys/jwks.json");

    fn test_config(authority: &str) -> AuthConfig {
        AuthConfig {
            authority: authority.to_string(),
            client_id: "client-123".to_string(),
            client_secret: "secret-xyz".to_string(),
            redirect_uri: "https://app.example.test/signin-oidc".to_string(),
            scopes: vec!["profile".to_string(), "flauntapi.read".to_string()],
            development: true,
            ..AuthConfig::default()
        }
    }

    fn mock_discovery(server: &mut mockito::ServerGuard) {
        let base = server.url();
        server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "issuer": base,
                    "authorization_endpoint": format!("{base}/authorize"),
                    "token_endpoint": format!("{base}/token"),
                    "jwks_uri": format!("{base}/jwks"),
                    "userinfo_endpoint": format!("{base}/userinfo"),
                    "end_session_endpoint": format!("{base}/logout"),
                })
                .to_string(),
            )
            .create();
        server
            .mock("GET", "/jwks")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(FIXTURE_JWKS_JSON)
            .create();
    }

    fn setup_with<F>(adjust: F) -> (mockito::ServerGuard, OidcRelyingParty, Arc<MemoryChallengeStore>)
    where
        F: FnOnce(&mut AuthConfig),
    {
        let mut server = mockito::Server::new();
        mock_discovery(&mut server);

        let mut config = test_config(&server.url());
        adjust(&mut config);
        let challenges = Arc::new(MemoryChallengeStore::new());
        let rp = OidcRelyingParty::with_challenge_store(config, challenges.clone())
            .expect("relying party should initialize");
        (server, rp, challenges)
    }

    fn setup() -> (mockito::ServerGuard, OidcRelyingParty, Arc<MemoryChallengeStore>) {
        setup_with(|_| {})
    }

    fn cookie_pair_from_set_cookie(set_cookie: &str) -> String {
        set_cookie
            .split(';')
            .next()
            .expect("set-cookie should contain name=value")
            .trim()
            .to_string()
    }

    fn sign_token_with_claims(claims: &Value, private_pem: &str, kid: &str) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        let key = EncodingKey::from_rsa_pem(private_pem.as_bytes()).expect("valid rsa private key");
        encode(&header, claims, &key).expect("token should be signed")
    }

    fn valid_claims(nonce: &str, issuer: &str) -> Value {
        json!({
            "sub": "1234567890",
            "name": "Jane Doe",
            "email": "jane@example.com",
            "iss": issuer,
            "aud": "client-123",
            "iat": now_secs() as i64,
            "exp": (now_secs() + 300) as i64,
            "nonce": nonce
        })
    }

    fn mock_token(server: &mut mockito::ServerGuard, id_token: &str) -> mockito::Mock {
        server
            .mock("POST", "/token")
            .match_header(
                "content-type",
                Matcher::Regex("application/x-www-form-urlencoded.*".to_string()),
            )
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "auth-code".into()),
                Matcher::UrlEncoded("client_id".into(), "client-123".into()),
                Matcher::UrlEncoded("client_secret".into(), "secret-xyz".into()),
                Matcher::Regex("code_verifier=[A-Za-z0-9_-]{43}".to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "id_token": id_token,
                    "access_token": "access-abc",
                    "refresh_token": "refresh-abc",
                    "token_type": "Bearer",
                    "expires_in": 300
                })
                .to_string(),
            )
            .create()
    }

    fn login_with_signed_token<F>(token_builder: F) -> Result<ValidatedLogin, OidcError>
    where
        F: FnOnce(&str, &str) -> String,
    {
        let (mut server, rp, _) = setup();
        let start = rp.begin_challenge("/protected?x=1").expect("challenge should start");
        let state = query_param(&start.url, "state").expect("state must exist");
        let nonce = query_param(&start.url, "nonce").expect("nonce must exist");

        let token = token_builder(&nonce, &server.url());
        let token_mock = mock_token(&mut server, &token);

        let callback_url = format!("/signin-oidc?code=auth-code&state={state}");
        let cookie_header = cookie_pair_from_set_cookie(&start.correlation_set_cookie);
        let result = rp.complete_callback(&callback_url, Some(&cookie_header));
        token_mock.assert();
        result
    }

    #[test]
    fn begin_challenge_builds_pkce_authorization_request() {
        let (_server, rp, challenges) = setup();

        let start = rp
            .begin_challenge("https://app.example.test/protected/data?x=1#frag")
            .expect("challenge should start");

        assert!(start.url.contains("response_type=code"));
        assert!(start.url.contains("client_id=client-123"));
        assert!(
            start
                .url
                .contains("redirect_uri=https%3A%2F%2Fapp.example.test%2Fsignin-oidc")
        );
        assert!(start.url.contains("scope=openid+profile+flauntapi.read"));
        assert!(start.url.contains("code_challenge_method=S256"));
        assert_eq!(
            query_param(&start.url, "code_challenge").map(|c| c.len()),
            Some(43)
        );
        assert_eq!(challenges.pending(), 1);

        let state = query_param(&start.url, "state").expect("state must exist");
        assert!(
            start
                .correlation_set_cookie
                .starts_with(&format!("__sso_state={state}; Path=/"))
        );
        assert!(start.correlation_set_cookie.contains("HttpOnly"));
        assert!(start.correlation_set_cookie.contains("Max-Age=300"));
        assert!(start.correlation_set_cookie.contains("Secure"));
    }

    #[test]
    fn callback_sends_stored_code_verifier_and_returns_claims() {
        let (mut server, rp, challenges) = setup();
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
        challenges
            .insert(
                ChallengeState {
                    state: "state-abc".to_string(),
                    nonce: "nonce-abc".to_string(),
                    code_verifier: verifier.to_string(),
                    return_to: "/protected/data?x=1".to_string(),
                    expires_at: now_secs() + 60,
                },
                now_secs(),
            )
            .unwrap();

        let token = sign_token_with_claims(
            &valid_claims("nonce-abc", &server.url()),
            FIXTURE_RSA_PRIVATE_PEM,
            "test-key",
        );
        let token_mock = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("code_verifier".into(), verifier.into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"id_token": token, "access_token": "abc"}).to_string())
            .create();

        let login = rp
            .complete_callback(
                "/signin-oidc?code=auth-code&state=state-abc",
                Some("__sso_state=state-abc"),
            )
            .expect("callback should validate");
        token_mock.assert();

        assert_eq!(login.subject, "1234567890");
        assert_eq!(login.return_to, "/protected/data?x=1");
        assert_eq!(login.claims.find_first("email"), Some("jane@example.com"));
        assert_eq!(login.claims.display_name(), "Jane Doe");
        assert!(!login.claims.contains("nonce"));
        assert!(!login.claims.contains("aud"));
        assert_eq!(login.tokens.access_token.as_deref(), Some("abc"));
        assert!(login.tokens.id_token.is_some());
    }

    #[test]
    fn accepts_valid_signed_token() {
        let login = login_with_signed_token(|nonce, issuer| {
            sign_token_with_claims(&valid_claims(nonce, issuer), FIXTURE_RSA_PRIVATE_PEM, "test-key")
        })
        .expect("login should validate");

        assert_eq!(login.return_to, "/protected?x=1");
        assert_eq!(login.claims.find_first("sub"), Some("1234567890"));
        assert_eq!(login.tokens.refresh_token.as_deref(), Some("refresh-abc"));
        assert_eq!(login.tokens.token_type.as_deref(), Some("Bearer"));
        assert!(login.tokens.expires_at.is_some());
    }

    #[test]
    fn rejects_invalid_id_token_variants() {
        let patch = |field: &'static str, value: Value| {
            move |nonce: &str, issuer: &str| {
                let mut claims = valid_claims(nonce, issuer);
                claims[field] = value;
                sign_token_with_claims(&claims, FIXTURE_RSA_PRIVATE_PEM, "test-key")
            }
        };

        let expired = login_with_signed_token(patch("exp", json!((now_secs() - 3600) as i64)));
        assert!(matches!(expired, Err(OidcError::Jwt(_))));

        let wrong_aud = login_with_signed_token(patch("aud", json!("wrong-client")));
        assert!(matches!(wrong_aud, Err(OidcError::Jwt(_))));

        let wrong_iss = login_with_signed_token(patch("iss", json!("http://wrong-issuer")));
        assert!(matches!(wrong_iss, Err(OidcError::Jwt(_))));

        let wrong_nonce = login_with_signed_token(patch("nonce", json!("forged")));
        assert!(matches!(wrong_nonce, Err(OidcError::InvalidToken(_))));

        let blank_sub = login_with_signed_token(patch("sub", json!("  ")));
        assert!(matches!(blank_sub, Err(OidcError::InvalidToken(_))));

        let wrong_signature = login_with_signed_token(|nonce, issuer| {
            sign_token_with_claims(
                &valid_claims(nonce, issuer),
                FIXTURE_WRONG_RSA_PRIVATE_PEM,
                "test-key",
            )
        });
        assert!(wrong_signature.is_err());

        let missing_claims = login_with_signed_token(|nonce, _issuer| {
            let claims = json!({
                "email": "user@example.com",
                "iat": now_secs() as i64,
                "exp": (now_secs() + 300) as i64,
                "nonce": nonce
            });
            sign_token_with_claims(&claims, FIXTURE_RSA_PRIVATE_PEM, "test-key")
        });
        assert!(missing_claims.is_err());
    }

    #[test]
    fn unknown_kid_refetches_jwks_before_rejecting() {
        let (mut server, rp, _) = setup();
        let start = rp.begin_challenge("/").unwrap();
        let state = query_param(&start.url, "state").unwrap();
        let nonce = query_param(&start.url, "nonce").unwrap();
        let token = sign_token_with_claims(
            &valid_claims(&nonce, &server.url()),
            FIXTURE_RSA_PRIVATE_PEM,
            "rotated-key",
        );
        mock_token(&mut server, &token);
        assert_eq!(rp.jwks().unwrap().generation(), 0);

        let err = rp
            .complete_callback(
                &format!("/signin-oidc?code=auth-code&state={state}"),
                Some(&cookie_pair_from_set_cookie(&start.correlation_set_cookie)),
            )
            .unwrap_err();
        assert!(matches!(err, OidcError::InvalidToken(ref m) if m.contains("no matching jwk")));
        assert_eq!(rp.jwks().unwrap().generation(), 1);
    }

    #[test]
    fn replayed_callback_is_rejected_as_consumed() {
        let (mut server, rp, _) = setup();
        let start = rp.begin_challenge("/").unwrap();
        let state = query_param(&start.url, "state").unwrap();
        let nonce = query_param(&start.url, "nonce").unwrap();
        let token = sign_token_with_claims(
            &valid_claims(&nonce, &server.url()),
            FIXTURE_RSA_PRIVATE_PEM,
            "test-key",
        );
        let token_mock = mock_token(&mut server, &token).expect(1);

        let callback_url = format!("/signin-oidc?code=auth-code&state={state}");
        let cookie_header = cookie_pair_from_set_cookie(&start.correlation_set_cookie);

        assert!(rp.complete_callback(&callback_url, Some(&cookie_header)).is_ok());
        let replay = rp.complete_callback(&callback_url, Some(&cookie_header));
        assert!(matches!(replay, Err(OidcError::StateConsumed)));
        assert_eq!(
            replay.unwrap_err().to_string(),
            "state already consumed"
        );
        token_mock.assert();
    }

    #[test]
    fn state_must_match_correlation_cookie() {
        let (mut server, rp, challenges) = setup();
        let token_mock = server.mock("POST", "/token").expect(0).create();
        let start = rp.begin_challenge("/").unwrap();
        let state = query_param(&start.url, "state").unwrap();
        let callback_url = format!("/signin-oidc?code=auth-code&state={state}");

        for cookie in [None, Some("__sso_state=other"), Some("unrelated=1")] {
            assert!(matches!(
                rp.complete_callback(&callback_url, cookie),
                Err(OidcError::InvalidState)
            ));
        }
        assert!(matches!(
            rp.complete_callback("/signin-oidc?code=auth-code", Some("__sso_state=x")),
            Err(OidcError::InvalidState)
        ));

        // A mismatched cookie does not burn the attempt.
        assert_eq!(challenges.pending(), 1);
        token_mock.assert();
    }

    #[test]
    fn expired_or_unknown_state_is_invalid() {
        let (_server, rp, _) = setup();
        let start = rp.begin_challenge_at("/", 1_000).unwrap();
        let state = query_param(&start.url, "state").unwrap();
        let callback_url = format!("/signin-oidc?code=c&state={state}");
        let cookie = format!("__sso_state={state}");

        assert!(matches!(
            rp.complete_callback_at(&callback_url, Some(&cookie), 1_300),
            Err(OidcError::InvalidState)
        ));
        assert!(matches!(
            rp.complete_callback_at(
                "/signin-oidc?code=c&state=never-issued",
                Some("__sso_state=never-issued"),
                1_000
            ),
            Err(OidcError::InvalidState)
        ));
    }

    #[test]
    fn provider_error_rejects_attempt() {
        let (_server, rp, _) = setup();
        let start = rp.begin_challenge("/").unwrap();
        let state = query_param(&start.url, "state").unwrap();
        let callback_url = format!(
            "/signin-oidc?error=access_denied&error_description=User+cancelled&state={state}"
        );
        let cookie = format!("__sso_state={state}");

        match rp.complete_callback(&callback_url, Some(&cookie)) {
            Err(OidcError::Provider(msg)) => assert_eq!(msg, "access_denied: User cancelled"),
            other => panic!("expected provider error, got {other:?}"),
        }
    }

    #[test]
    fn token_endpoint_failures_are_classified() {
        let (mut server, rp, _) = setup();
        let start = rp.begin_challenge("/").unwrap();
        let state = query_param(&start.url, "state").unwrap();
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant","error_description":"code expired"}"#)
            .create();
        let err = rp
            .complete_callback(
                &format!("/signin-oidc?code=auth-code&state={state}"),
                Some(&format!("__sso_state={state}")),
            )
            .unwrap_err();
        assert!(matches!(err, OidcError::Provider(ref m) if m == "invalid_grant: code expired"));
        assert!(!err.is_unavailable());

        let (mut server, rp, _) = setup();
        let start = rp.begin_challenge("/").unwrap();
        let state = query_param(&start.url, "state").unwrap();
        server.mock("POST", "/token").with_status(503).create();
        let err = rp
            .complete_callback(
                &format!("/signin-oidc?code=auth-code&state={state}"),
                Some(&format!("__sso_state={state}")),
            )
            .unwrap_err();
        assert!(err.is_unavailable());

        let (mut server, rp, _) = setup();
        let start = rp.begin_challenge("/").unwrap();
        let state = query_param(&start.url, "state").unwrap();
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("<html>gateway login page</html>")
            .create();
        let err = rp
            .complete_callback(
                &format!("/signin-oidc?code=auth-code&state={state}"),
                Some(&format!("__sso_state={state}")),
            )
            .unwrap_err();
        assert!(matches!(err, OidcError::InvalidToken(ref m) if m.contains("malformed json")));
        assert!(!err.is_unavailable());
    }

    #[test]
    fn userinfo_claims_fill_gaps_and_subject_must_match() {
        let run = |userinfo_body: Value| {
            let (mut server, rp, _) = setup_with(|c| c.fetch_userinfo = true);
            let start = rp.begin_challenge("/").unwrap();
            let state = query_param(&start.url, "state").unwrap();
            let nonce = query_param(&start.url, "nonce").unwrap();
            let token = sign_token_with_claims(
                &valid_claims(&nonce, &server.url()),
                FIXTURE_RSA_PRIVATE_PEM,
                "test-key",
            );
            mock_token(&mut server, &token);
            let userinfo_mock = server
                .mock("GET", "/userinfo")
                .match_header("authorization", "Bearer access-abc")
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(userinfo_body.to_string())
                .create();

            let result = rp.complete_callback(
                &format!("/signin-oidc?code=auth-code&state={state}"),
                Some(&format!("__sso_state={state}")),
            );
            userinfo_mock.assert();
            result
        };

        let login = run(json!({
            "sub": "1234567890",
            "name": "Someone Else",
            "groups": ["staff", "ops"]
        }))
        .expect("login should validate");
        assert_eq!(login.claims.display_name(), "Jane Doe");
        assert_eq!(
            login.claims.find_all("groups").collect::<Vec<_>>(),
            vec!["staff", "ops"]
        );

        let mismatch = run(json!({"sub": "attacker"}));
        assert!(matches!(mismatch, Err(OidcError::InvalidToken(_))));
    }

    #[test]
    fn claim_mapping_is_pass_through_unless_configured() {
        let (mut server, rp, _) = setup_with(|c| c.claim_mapping = ClaimMapping::legacy_jwt());
        let start = rp.begin_challenge("/").unwrap();
        let state = query_param(&start.url, "state").unwrap();
        let nonce = query_param(&start.url, "nonce").unwrap();
        let token = sign_token_with_claims(
            &valid_claims(&nonce, &server.url()),
            FIXTURE_RSA_PRIVATE_PEM,
            "test-key",
        );
        mock_token(&mut server, &token);

        let login = rp
            .complete_callback(
                &format!("/signin-oidc?code=auth-code&state={state}"),
                Some(&format!("__sso_state={state}")),
            )
            .unwrap();
        assert!(!login.claims.contains("email"));
        assert_eq!(
            login.claims.find_first(
                "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress"
            ),
            Some("jane@example.com")
        );
    }

    #[test]
    fn end_session_url_carries_hint_and_post_logout_redirect() {
        let (server, rp, _) = setup_with(|c| {
            c.post_logout_redirect_uri = Some("https://app.example.test/".to_string());
        });
        let url = rp.end_session_url(Some("id.token.value")).unwrap().unwrap();
        assert!(url.starts_with(&format!("{}/logout?", server.url())));
        assert_eq!(query_param(&url, "id_token_hint").as_deref(), Some("id.token.value"));
        assert_eq!(query_param(&url, "client_id").as_deref(), Some("client-123"));
        assert_eq!(
            query_param(&url, "post_logout_redirect_uri").as_deref(),
            Some("https://app.example.test/")
        );
    }

    #[test]
    fn callback_path_is_taken_from_redirect_uri() {
        let (_server, rp, _) = setup();
        assert!(rp.is_callback("/signin-oidc?code=a&state=b"));
        assert!(rp.is_callback("https://app.example.test/signin-oidc"));
        assert!(!rp.is_callback("/signin-oidc/other"));
        assert!(!rp.is_callback("/"));
    }

    #[test]
    fn init_fails_closed() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(500)
            .create();
        assert!(OidcRelyingParty::new(test_config(&server.url())).is_err());

        let mut server = mockito::Server::new();
        mock_discovery(&mut server);
        let mut config = test_config(&server.url());
        config.development = false;
        // http authority is refused outside development mode
        assert!(matches!(
            OidcRelyingParty::new(config),
            Err(OidcError::InvalidConfig(_))
        ));
    }
}
