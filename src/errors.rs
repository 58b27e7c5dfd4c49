//! Error taxonomy for the timing core
//!
//! Every suspension-point failure maps into one of these variants at the
//! boundary of the component that issued the call. Nothing here is allowed
//! to take the process down: transport failures become connection-state
//! transitions, decode failures drop the offending message and keep the
//! stream alive.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PitwallError {
    /// Credential exchange failed. Blocks dependent calls until the caller
    /// reconfigures credentials.
    #[error("auth error: {0}")]
    Auth(String),

    /// Transient transport failure. Triggers reconnect/backoff; surfaced to
    /// observers only as a connection-state change.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed envelope or command line. Logged and dropped.
    #[error("decode error: {0}")]
    Decode(String),

    /// Provider returned a 429-equivalent. Retryable after backing off.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Requested entity absent. Read paths that tolerate absence return
    /// `Ok(None)` instead of this; it exists for paths that cannot.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persistence layer failure.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, PitwallError>;

impl From<reqwest::Error> for PitwallError {
    fn from(e: reqwest::Error) -> Self {
        if e.status().map(|s| s.as_u16() == 429).unwrap_or(false) {
            PitwallError::RateLimit(e.to_string())
        } else {
            PitwallError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for PitwallError {
    fn from(e: serde_json::Error) -> Self {
        PitwallError::Decode(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PitwallError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        PitwallError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for PitwallError {
    fn from(e: std::io::Error) -> Self {
        PitwallError::Transport(e.to_string())
    }
}

impl From<base64::DecodeError> for PitwallError {
    fn from(e: base64::DecodeError) -> Self {
        PitwallError::Decode(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for PitwallError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        PitwallError::Decode(e.to_string())
    }
}
