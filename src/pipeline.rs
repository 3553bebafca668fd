//! Per-request orchestration.
//!
//! The pipeline runs an ordered list of named [`Stage`]s. A stage either
//! lets the request through or short-circuits it with a redirect or a
//! rejection; the host applies the resulting [`PipelineOutcome`] to its
//! response.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::OidcError;
use crate::claims::Principal;
use crate::config::AuthConfig;
use crate::helpers::{cookie_value, now_secs, request_path};
use crate::key_manager::KeyManager;
use crate::relying_party::OidcRelyingParty;
use crate::session::{Session, SessionCookieCodec};
use crate::store::KeyMaterialStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// Absolute URL or origin-form target (`/path?query`).
    pub url: String,
    pub cookie_header: Option<String>,
    pub requires_authentication: bool,
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_cookies(mut self, cookie_header: impl Into<String>) -> Self {
        self.cookie_header = Some(cookie_header.into());
        self
    }

    pub fn protected(mut self) -> Self {
        self.requires_authentication = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The attempt is invalid: forged, replayed, expired or refused.
    Protocol,
    /// A provider or key store could not be reached.
    Unavailable,
}

impl FailureKind {
    pub fn status(&self) -> u16 {
        match self {
            FailureKind::Protocol => 403,
            FailureKind::Unavailable => 503,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    pub kind: FailureKind,
    /// Safe to show to the browser.
    pub message: String,
    /// Underlying error; only populated in development mode.
    pub detail: Option<String>,
}

impl AuthFailure {
    pub fn from_error(err: &OidcError, development: bool) -> Self {
        let kind = if err.is_unavailable() {
            FailureKind::Unavailable
        } else {
            FailureKind::Protocol
        };
        let message = match err {
            _ if kind == FailureKind::Unavailable => "authentication service unavailable",
            OidcError::InvalidState | OidcError::StateConsumed => {
                "invalid or expired sign-in attempt"
            }
            OidcError::Provider(_) => "identity provider refused the sign-in",
            _ => "authentication failed",
        };
        Self {
            kind,
            message: message.to_string(),
            detail: development.then(|| err.to_string()),
        }
    }

    pub fn status(&self) -> u16 {
        self.kind.status()
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({detail})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineResult {
    Continue,
    Redirect(String),
    Reject(AuthFailure),
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub result: PipelineResult,
    pub principal: Principal,
    /// The live session behind `principal`, with its lifetime and any
    /// retained provider tokens.
    pub session: Option<Session>,
    /// `Set-Cookie` header values to attach to the response, in order.
    pub set_cookies: Vec<String>,
}

/// State shared by the stages of one request.
pub struct RequestContext<'a> {
    pub request: &'a Request,
    pub now: u64,
    pub principal: Principal,
    pub session: Option<Session>,
    pub set_cookies: Vec<String>,
}

impl RequestContext<'_> {
    pub fn cookie_header(&self) -> Option<&str> {
        self.request.cookie_header.as_deref()
    }

    fn sign_in(&mut self, session: Session) {
        self.principal = session.principal();
        self.session = Some(session);
    }
}

pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, ctx: &mut RequestContext<'_>) -> PipelineResult;
}

/// Logout, callback completion and session restoration.
pub struct AuthenticationStage {
    relying_party: Arc<OidcRelyingParty>,
    codec: Arc<SessionCookieCodec>,
}

impl AuthenticationStage {
    pub fn new(relying_party: Arc<OidcRelyingParty>, codec: Arc<SessionCookieCodec>) -> Self {
        Self {
            relying_party,
            codec,
        }
    }

    fn config(&self) -> &AuthConfig {
        self.relying_party.config()
    }

    fn reject(&self, err: &OidcError) -> PipelineResult {
        PipelineResult::Reject(AuthFailure::from_error(err, self.config().development))
    }

    fn logout(&self, ctx: &mut RequestContext<'_>) -> PipelineResult {
        let id_token = match self.codec.session_from_header(ctx.cookie_header(), ctx.now) {
            Ok(session) => session
                .and_then(|s| s.tokens)
                .and_then(|tokens| tokens.id_token),
            Err(err) => {
                warn!(error = %err, "could not read session during logout");
                None
            }
        };

        let deletions = self.codec.delete_cookies(ctx.cookie_header());
        ctx.set_cookies.extend(deletions);
        let target = match self.relying_party.end_session_url(id_token.as_deref()) {
            Ok(Some(url)) => url,
            Ok(None) => "/".to_string(),
            Err(err) => {
                warn!(error = %err, "could not build end-session url");
                "/".to_string()
            }
        };
        info!("signed out");
        PipelineResult::Redirect(target)
    }

    fn callback(&self, ctx: &mut RequestContext<'_>) -> PipelineResult {
        ctx.set_cookies
            .push(self.relying_party.correlation_delete_cookie());

        let login = match self.relying_party.complete_callback_at(
            &ctx.request.url,
            ctx.cookie_header(),
            ctx.now,
        ) {
            Ok(login) => login,
            Err(err) => {
                warn!(error = %err, "authentication callback rejected");
                return self.reject(&err);
            }
        };

        let config = self.config();
        let tokens = config.save_tokens.then_some(login.tokens);
        let session = Session::new(
            login.claims,
            tokens,
            ctx.now,
            config.cookie.lifetime_secs,
            config.cookie.sliding,
        );
        match self.codec.issue_at(&session, ctx.now) {
            Ok(set_cookies) => {
                ctx.set_cookies.extend(set_cookies);
                ctx.sign_in(session);
                PipelineResult::Redirect(login.return_to)
            }
            Err(err) => {
                warn!(subject = %login.subject, error = %err, "could not issue session cookie");
                self.reject(&err)
            }
        }
    }

    fn restore(&self, ctx: &mut RequestContext<'_>) -> PipelineResult {
        let session = match self.codec.session_from_header(ctx.cookie_header(), ctx.now) {
            Ok(Some(session)) => session,
            Ok(None) => {
                if cookie_value(ctx.cookie_header(), &self.codec.options().name).is_some() {
                    let deletions = self.codec.delete_cookies(ctx.cookie_header());
                    ctx.set_cookies.extend(deletions);
                }
                return PipelineResult::Continue;
            }
            Err(err) => {
                warn!(error = %err, "session cookie could not be checked");
                return self.reject(&err);
            }
        };

        let session = if session.should_renew(ctx.now) {
            let renewed = session.renewed(ctx.now);
            match self.codec.issue_at(&renewed, ctx.now) {
                Ok(set_cookies) => {
                    ctx.set_cookies.extend(set_cookies);
                    renewed
                }
                Err(err) => {
                    warn!(error = %err, "sliding renewal failed");
                    session
                }
            }
        } else {
            session
        };
        ctx.sign_in(session);
        PipelineResult::Continue
    }
}

impl Stage for AuthenticationStage {
    fn name(&self) -> &'static str {
        "authentication"
    }

    fn process(&self, ctx: &mut RequestContext<'_>) -> PipelineResult {
        if request_path(&ctx.request.url) == self.config().logout_path {
            return self.logout(ctx);
        }
        if self.relying_party.is_callback(&ctx.request.url) {
            return self.callback(ctx);
        }
        self.restore(ctx)
    }
}

/// Challenges unauthenticated requests to protected resources.
pub struct AuthorizationStage {
    relying_party: Arc<OidcRelyingParty>,
}

impl AuthorizationStage {
    pub fn new(relying_party: Arc<OidcRelyingParty>) -> Self {
        Self { relying_party }
    }
}

impl Stage for AuthorizationStage {
    fn name(&self) -> &'static str {
        "authorization"
    }

    fn process(&self, ctx: &mut RequestContext<'_>) -> PipelineResult {
        if !ctx.request.requires_authentication || ctx.principal.is_authenticated() {
            return PipelineResult::Continue;
        }

        match self
            .relying_party
            .begin_challenge_at(&ctx.request.url, ctx.now)
        {
            Ok(start) => {
                ctx.set_cookies.push(start.correlation_set_cookie);
                PipelineResult::Redirect(start.url)
            }
            Err(err) => {
                warn!(error = %err, "could not issue authentication challenge");
                PipelineResult::Reject(AuthFailure::from_error(
                    &err,
                    self.relying_party.config().development,
                ))
            }
        }
    }
}

pub struct AuthenticationPipeline {
    relying_party: Arc<OidcRelyingParty>,
    codec: Arc<SessionCookieCodec>,
    stages: Vec<Box<dyn Stage>>,
}

impl AuthenticationPipeline {
    /// Contacts the provider; fails if discovery or the JWKS is unusable.
    pub fn new(config: AuthConfig, store: Arc<dyn KeyMaterialStore>) -> Result<Self, OidcError> {
        let relying_party = OidcRelyingParty::new(config)?;
        let keys = Arc::new(KeyManager::new(store, relying_party.config().key_policy()));
        Ok(Self::from_parts(relying_party, keys))
    }

    pub fn from_parts(relying_party: OidcRelyingParty, keys: Arc<KeyManager>) -> Self {
        let relying_party = Arc::new(relying_party);
        let codec = Arc::new(SessionCookieCodec::new(
            keys,
            relying_party.config().cookie.clone(),
        ));
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(AuthenticationStage::new(relying_party.clone(), codec.clone())),
            Box::new(AuthorizationStage::new(relying_party.clone())),
        ];
        Self {
            relying_party,
            codec,
            stages,
        }
    }

    /// Appends a stage after the built-in ones.
    pub fn push_stage(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(stage);
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn relying_party(&self) -> &OidcRelyingParty {
        &self.relying_party
    }

    pub fn handle(&self, request: &Request) -> PipelineOutcome {
        self.handle_at(request, now_secs())
    }

    pub fn handle_at(&self, request: &Request, now: u64) -> PipelineOutcome {
        let mut ctx = RequestContext {
            request,
            now,
            principal: Principal::anonymous(),
            session: None,
            set_cookies: Vec::new(),
        };

        let mut result = PipelineResult::Continue;
        for stage in &self.stages {
            result = stage.process(&mut ctx);
            if result != PipelineResult::Continue {
                debug!(stage = stage.name(), result = ?result, "pipeline short-circuited");
                break;
            }
        }

        PipelineOutcome {
            result,
            principal: ctx.principal,
            session: ctx.session,
            set_cookies: ctx.set_cookies,
        }
    }

    /// The principal carried by the session cookie in `cookie_header`;
    /// anonymous when there is no live session.
    pub fn principal(&self, cookie_header: Option<&str>) -> Result<Principal, OidcError> {
        self.principal_at(cookie_header, now_secs())
    }

    pub fn principal_at(&self, cookie_header: Option<&str>, now: u64) -> Result<Principal, OidcError> {
        Ok(self
            .session_at(cookie_header, now)?
            .map(|session| session.principal())
            .unwrap_or_default())
    }

    /// The live session in `cookie_header`, including retained tokens.
    pub fn session(&self, cookie_header: Option<&str>) -> Result<Option<Session>, OidcError> {
        self.session_at(cookie_header, now_secs())
    }

    pub fn session_at(
        &self,
        cookie_header: Option<&str>,
        now: u64,
    ) -> Result<Option<Session>, OidcError> {
        self.codec.session_from_header(cookie_header, now)
    }
}
