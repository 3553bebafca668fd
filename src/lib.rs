//! Single sign-on front door for web applications that share one login.
//!
//! Browsers are authenticated against an OpenID Connect provider with the
//! authorization-code flow and PKCE. The verified claims are sealed into a
//! session cookie that every cooperating application can open, because they
//! all read the same key ring from a shared [`KeyMaterialStore`].
//!
//! # How it works
//!
//! 1. A request for a protected resource arrives without a usable session.
//!    The pipeline stores a challenge (state, nonce, PKCE verifier) and
//!    redirects the browser to the provider.
//! 2. The provider redirects back to the callback. The challenge is taken
//!    exactly once, the code is exchanged, and the id token is validated
//!    against the provider's JWKS.
//! 3. The claims are sealed with AES-256-GCM under the ring's current key and
//!    set as the session cookie; the browser returns to where it started.
//! 4. Later requests, to this application or a sibling sharing the cookie
//!    name, domain and key ring, are authenticated from the cookie alone.
//!
//! # Key ring
//!
//! Keys are provisioned on demand, rotated ahead of expiry and pruned once
//! no live cookie can reference them. Stores only ever add keys on save, so
//! instances with stale views cannot erase each other's keys.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use oidc_sso::{AuthConfig, AuthenticationPipeline, FileKeyStore, PipelineResult, Request};
//!
//! # fn main() -> Result<(), oidc_sso::OidcError> {
//! let config = AuthConfig::from_env()?;
//! let store = FileKeyStore::new("/var/lib/oidc-sso", &config.application_name)?;
//! let pipeline = AuthenticationPipeline::new(config, Arc::new(store))?;
//!
//! let request = Request::new("/account").with_cookies("__sso=v1.abc.def").protected();
//! let outcome = pipeline.handle(&request);
//! for set_cookie in &outcome.set_cookies {
//!     println!("Set-Cookie: {set_cookie}");
//! }
//! match outcome.result {
//!     PipelineResult::Continue => println!("hello {}", outcome.principal.display_name()),
//!     PipelineResult::Redirect(location) => println!("302 {location}"),
//!     PipelineResult::Reject(failure) => println!("{} {failure}", failure.status()),
//! }
//! # Ok(())
//! # }
//! ```

pub mod challenge;
pub mod claims;
pub mod config;
mod crypto;
mod error;
mod helpers;
mod jwks;
pub mod key_manager;
pub mod keyring;
pub mod pipeline;
pub mod pkce;
pub mod relying_party;
pub mod session;
pub mod store;

pub use challenge::{ChallengeLookup, ChallengeState, ChallengeStore, MemoryChallengeStore};
pub use claims::{ClaimMapping, Claims, Identity, Principal, display_name, is_authenticated};
pub use config::{AuthConfig, CookieOptions, SameSite};
pub use error::OidcError;
pub use key_manager::{KeyManager, KeyPolicy};
pub use keyring::{KeyRing, ProtectionKey};
pub use pipeline::{
    AuthFailure, AuthenticationPipeline, AuthenticationStage, AuthorizationStage, FailureKind,
    PipelineOutcome, PipelineResult, Request, RequestContext, Stage,
};
pub use relying_party::{AuthorizationStart, OidcRelyingParty, ValidatedLogin};
pub use session::{SavedTokens, Session, SessionCookieCodec};
pub use store::{FileKeyStore, KeyMaterialStore, MemoryKeyStore};
