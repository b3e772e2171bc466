//! Error taxonomy for the session core

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    /// Refresh itself was rejected. Credentials and chat state have been
    /// cleared; the user has to log in again.
    #[error("Session expired, please log in again")]
    ReauthRequired,

    /// Bad user input (empty search target, searching for yourself, unknown peer).
    #[error("{0}")]
    InvalidInput(String),

    /// A send was attempted with no open connection.
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success response that the caller wanted to decode
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not logged in")]
    NotLoggedIn,
}

impl SessionError {
    /// True when the only way forward is a fresh login.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionError::ReauthRequired | SessionError::NotLoggedIn)
    }
}
