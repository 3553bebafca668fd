use std::fmt;
use url::Url;

use crate::OidcError;
use crate::claims::ClaimMapping;
use crate::key_manager::KeyPolicy;

pub const DEFAULT_COOKIE_NAME: &str = "__sso";
pub const DEFAULT_SCOPE: &str = "openid";
pub const DEFAULT_APPLICATION_NAME: &str = "oidc-sso";
pub const DEFAULT_LOGOUT_PATH: &str = "/signout";
const DEFAULT_COOKIE_TTL_SECS: u64 = 3600;
const DEFAULT_STATE_TTL_SECS: u64 = 300;
const DEFAULT_KEY_LIFETIME_SECS: u64 = 90 * 86_400;
const DEFAULT_KEY_ROTATION_LEAD_SECS: u64 = 2 * 86_400;
const DEFAULT_KEY_REFRESH_SECS: u64 = 300;
const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 2;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    #[default]
    Lax,
    Strict,
    None,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Lax => "Lax",
            SameSite::Strict => "Strict",
            SameSite::None => "None",
        }
    }
}

/// Attributes of the shared session cookie. Every cooperating application
/// must use the same name, domain and path for sessions to be shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieOptions {
    pub name: String,
    /// Common parent domain of all cooperating applications; `None` for a
    /// host-only cookie.
    pub domain: Option<String>,
    pub path: String,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: SameSite,
    pub lifetime_secs: u64,
    pub sliding: bool,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_COOKIE_NAME.to_string(),
            domain: None,
            path: "/".to_string(),
            http_only: true,
            secure: true,
            same_site: SameSite::Lax,
            lifetime_secs: DEFAULT_COOKIE_TTL_SECS,
            sliding: true,
        }
    }
}

#[derive(Clone)]
pub struct AuthConfig {
    /// Issuer base URL; discovery is fetched from
    /// `<authority>/.well-known/openid-configuration`.
    pub authority: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub cookie: CookieOptions,
    pub save_tokens: bool,
    pub fetch_userinfo: bool,
    pub claim_mapping: ClaimMapping,
    /// Relaxes transport security and metadata checks, and exposes failure
    /// detail. Never enable in production.
    pub development: bool,
    pub application_name: String,
    pub logout_path: String,
    pub post_logout_redirect_uri: Option<String>,
    pub state_ttl_secs: u64,
    pub key_lifetime_secs: u64,
    pub key_rotation_lead_secs: u64,
    pub key_refresh_secs: u64,
    pub http_connect_timeout_secs: u64,
    pub http_timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            authority: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: String::new(),
            scopes: vec![DEFAULT_SCOPE.to_string()],
            cookie: CookieOptions::default(),
            save_tokens: false,
            fetch_userinfo: false,
            claim_mapping: ClaimMapping::PassThrough,
            development: false,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            logout_path: DEFAULT_LOGOUT_PATH.to_string(),
            post_logout_redirect_uri: None,
            state_ttl_secs: DEFAULT_STATE_TTL_SECS,
            key_lifetime_secs: DEFAULT_KEY_LIFETIME_SECS,
            key_rotation_lead_secs: DEFAULT_KEY_ROTATION_LEAD_SECS,
            key_refresh_secs: DEFAULT_KEY_REFRESH_SECS,
            http_connect_timeout_secs: DEFAULT_HTTP_CONNECT_TIMEOUT_SECS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("authority", &self.authority)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("cookie", &self.cookie)
            .field("save_tokens", &self.save_tokens)
            .field("fetch_userinfo", &self.fetch_userinfo)
            .field("claim_mapping", &self.claim_mapping)
            .field("development", &self.development)
            .field("application_name", &self.application_name)
            .field("logout_path", &self.logout_path)
            .field("post_logout_redirect_uri", &self.post_logout_redirect_uri)
            .field("state_ttl_secs", &self.state_ttl_secs)
            .field("key_lifetime_secs", &self.key_lifetime_secs)
            .field("key_rotation_lead_secs", &self.key_rotation_lead_secs)
            .field("key_refresh_secs", &self.key_refresh_secs)
            .finish_non_exhaustive()
    }
}

impl AuthConfig {
    /// Reads the `SSO_*` environment variables.
    pub fn from_env() -> Result<Self, OidcError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, OidcError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AuthConfig::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        config.authority = var("SSO_AUTHORITY").unwrap_or_default();
        config.client_id = var("SSO_CLIENT_ID").unwrap_or_default();
        config.client_secret = var("SSO_CLIENT_SECRET").unwrap_or_default();
        config.redirect_uri = var("SSO_REDIRECT_URI").unwrap_or_default();
        if let Some(scopes) = var("SSO_SCOPES") {
            config.scopes = scopes.split_whitespace().map(str::to_string).collect();
        }
        if let Some(name) = var("SSO_COOKIE_NAME") {
            config.cookie.name = name;
        }
        config.cookie.domain = var("SSO_COOKIE_DOMAIN");
        if let Some(ttl) = var("SSO_COOKIE_TTL") {
            config.cookie.lifetime_secs = parse_u64("SSO_COOKIE_TTL", &ttl)?;
        }
        if let Some(sliding) = var("SSO_COOKIE_SLIDING") {
            config.cookie.sliding = parse_bool("SSO_COOKIE_SLIDING", &sliding)?;
        }
        if let Some(save) = var("SSO_SAVE_TOKENS") {
            config.save_tokens = parse_bool("SSO_SAVE_TOKENS", &save)?;
        }
        if let Some(userinfo) = var("SSO_FETCH_USERINFO") {
            config.fetch_userinfo = parse_bool("SSO_FETCH_USERINFO", &userinfo)?;
        }
        if let Some(development) = var("SSO_DEVELOPMENT") {
            config.development = parse_bool("SSO_DEVELOPMENT", &development)?;
        }
        if let Some(application) = var("SSO_APPLICATION_NAME") {
            config.application_name = application;
        }
        config.post_logout_redirect_uri = var("SSO_POST_LOGOUT_REDIRECT_URI");

        // Plain-http development setups cannot carry Secure cookies.
        if config.development && config.redirect_uri.starts_with("http://") {
            config.cookie.secure = false;
        }

        config.normalize()
    }

    pub fn normalize(mut self) -> Result<Self, OidcError> {
        for (field, value) in [
            ("authority", &self.authority),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("redirect_uri", &self.redirect_uri),
        ] {
            if value.trim().is_empty() {
                return Err(OidcError::InvalidConfig(format!("{field} is required")));
            }
        }

        self.authority = self.authority.trim().trim_end_matches('/').to_string();
        let authority = Url::parse(&self.authority)?;
        let redirect_uri = Url::parse(self.redirect_uri.trim())?;
        if !self.development {
            if authority.scheme() != "https" {
                return Err(OidcError::InvalidConfig(
                    "authority must use https outside development mode".to_string(),
                ));
            }
            if redirect_uri.scheme() != "https" {
                return Err(OidcError::InvalidConfig(
                    "redirect_uri must use https outside development mode".to_string(),
                ));
            }
            if !self.cookie.secure {
                return Err(OidcError::InvalidConfig(
                    "cookie.secure may only be disabled in development mode".to_string(),
                ));
            }
        }
        if let Some(uri) = self.post_logout_redirect_uri.as_deref() {
            Url::parse(uri)?;
        }

        let mut scopes: Vec<String> = Vec::with_capacity(self.scopes.len() + 1);
        for scope in self.scopes.iter().flat_map(|s| s.split_whitespace()) {
            if !scopes.iter().any(|s| s == scope) {
                scopes.push(scope.to_string());
            }
        }
        if !scopes.iter().any(|s| s == DEFAULT_SCOPE) {
            scopes.insert(0, DEFAULT_SCOPE.to_string());
        }
        self.scopes = scopes;

        self.normalize_cookie()?;

        if self.application_name.trim().is_empty() {
            self.application_name = DEFAULT_APPLICATION_NAME.to_string();
        }
        if self.logout_path.trim().is_empty() {
            self.logout_path = DEFAULT_LOGOUT_PATH.to_string();
        }
        if !self.logout_path.starts_with('/') {
            return Err(OidcError::InvalidConfig(
                "logout_path must start with '/'".to_string(),
            ));
        }

        if self.state_ttl_secs == 0 {
            self.state_ttl_secs = DEFAULT_STATE_TTL_SECS;
        }
        if self.key_lifetime_secs == 0 {
            self.key_lifetime_secs = DEFAULT_KEY_LIFETIME_SECS;
        }
        if self.key_rotation_lead_secs == 0 {
            self.key_rotation_lead_secs = DEFAULT_KEY_ROTATION_LEAD_SECS;
        }
        if self.key_refresh_secs == 0 {
            self.key_refresh_secs = DEFAULT_KEY_REFRESH_SECS;
        }
        if !(self.key_refresh_secs < self.key_rotation_lead_secs
            && self.key_rotation_lead_secs < self.key_lifetime_secs)
        {
            return Err(OidcError::InvalidConfig(
                "key timings must satisfy refresh < rotation lead < lifetime".to_string(),
            ));
        }
        // A key keeps sealing until its successor activates, at most
        // refresh seconds into the lead, and must outlive those sessions.
        if self.cookie.lifetime_secs > self.key_rotation_lead_secs - self.key_refresh_secs {
            return Err(OidcError::InvalidConfig(format!(
                "cookie lifetime ({}s) must not exceed key rotation lead minus key refresh ({}s)",
                self.cookie.lifetime_secs,
                self.key_rotation_lead_secs - self.key_refresh_secs
            )));
        }
        if self.http_connect_timeout_secs == 0 {
            self.http_connect_timeout_secs = DEFAULT_HTTP_CONNECT_TIMEOUT_SECS;
        }
        if self.http_timeout_secs == 0 {
            self.http_timeout_secs = DEFAULT_HTTP_TIMEOUT_SECS;
        }

        Ok(self)
    }

    fn normalize_cookie(&mut self) -> Result<(), OidcError> {
        let cookie = &mut self.cookie;

        cookie.name = cookie.name.trim().to_string();
        if cookie.name.is_empty() {
            cookie.name = DEFAULT_COOKIE_NAME.to_string();
        }
        if !cookie
            .name
            .chars()
            .all(|c| c.is_ascii_graphic() && !"()<>@,;:\\\"/[]?={}".contains(c))
        {
            return Err(OidcError::InvalidConfig(format!(
                "cookie name {:?} contains characters not allowed in a cookie name",
                cookie.name
            )));
        }

        cookie.domain = cookie
            .domain
            .take()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        if let Some(domain) = cookie.domain.as_deref()
            && !domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
        {
            return Err(OidcError::InvalidConfig(format!(
                "cookie domain {domain:?} is not a valid domain"
            )));
        }

        if cookie.path.trim().is_empty() {
            cookie.path = "/".to_string();
        }
        if !cookie.path.starts_with('/') || cookie.path.contains(';') {
            return Err(OidcError::InvalidConfig(
                "cookie path must start with '/' and not contain ';'".to_string(),
            ));
        }

        if !cookie.http_only {
            return Err(OidcError::InvalidConfig(
                "session cookie must be HttpOnly".to_string(),
            ));
        }
        match cookie.same_site {
            SameSite::Strict => {
                return Err(OidcError::InvalidConfig(
                    "SameSite=Strict drops the session on the redirect back from the provider"
                        .to_string(),
                ));
            }
            SameSite::None if !cookie.secure => {
                return Err(OidcError::InvalidConfig(
                    "SameSite=None requires a Secure cookie".to_string(),
                ));
            }
            _ => {}
        }

        if cookie.lifetime_secs == 0 {
            cookie.lifetime_secs = DEFAULT_COOKIE_TTL_SECS;
        }

        Ok(())
    }

    pub fn discovery_url(&self) -> String {
        format!("{}/.well-known/openid-configuration", self.authority)
    }

    pub fn state_cookie_name(&self) -> String {
        format!("{}_state", self.cookie.name)
    }

    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }

    pub fn key_policy(&self) -> KeyPolicy {
        KeyPolicy {
            lifetime_secs: self.key_lifetime_secs,
            rotation_lead_secs: self.key_rotation_lead_secs,
            refresh_secs: self.key_refresh_secs,
            max_session_lifetime_secs: self.cookie.lifetime_secs,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, OidcError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(OidcError::InvalidConfig(format!(
            "{name} must be a boolean, got {other:?}"
        ))),
    }
}

fn parse_u64(name: &str, value: &str) -> Result<u64, OidcError> {
    value.trim().parse().map_err(|_| {
        OidcError::InvalidConfig(format!("{name} must be a non-negative integer, got {value:?}"))
    })
}
