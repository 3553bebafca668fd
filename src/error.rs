use thiserror::Error;

#[derive(Debug, Error)]
pub enum OidcError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("provider returned error: {0}")]
    Provider(String),
    #[error("key store unavailable: {0}")]
    KeyStore(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid state")]
    InvalidState,
    #[error("state already consumed")]
    StateConsumed,
    #[error("session cookie exceeds {0} bytes")]
    SessionTooLarge(usize),
    #[error("crypto failure")]
    Crypto,
}

impl OidcError {
    /// Transport and storage failures: the request failed but the login
    /// attempt itself was not proven invalid.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            OidcError::Http(_) | OidcError::Io(_) | OidcError::KeyStore(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_store_and_io_as_unavailable() {
        assert!(OidcError::KeyStore("down".into()).is_unavailable());
        assert!(OidcError::Io(std::io::Error::other("disk")).is_unavailable());
        assert!(!OidcError::InvalidState.is_unavailable());
        assert!(!OidcError::StateConsumed.is_unavailable());
        assert!(!OidcError::InvalidToken("nonce mismatch".into()).is_unavailable());
    }
}
