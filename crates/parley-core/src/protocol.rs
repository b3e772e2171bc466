//! Wire protocol: WebSocket frames, HTTP bodies, endpoint paths, snapshot keys

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SessionError};
use crate::types::User;

/// Client → server chat frame. The sender is derived server-side from the
/// authenticated connection, so it is never sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub to: String,
    pub content: String,
}

/// Server → client frames are plain [`crate::types::Message`] values.
pub use crate::types::Message as InboundFrame;

#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

impl std::fmt::Debug for LoginRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Deserialize)]
pub struct LoginResponse {
    pub user: User,
    pub token: String,
    pub refresh_token: String,
}

#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

#[derive(Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    /// Present when the server rotates the refresh token as well
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// HTTP endpoint paths, relative to the API base URL
pub mod endpoints {
    pub const LOGIN: &str = "/login";
    pub const REFRESH: &str = "/refresh";
    pub const USERS: &str = "/users";

    /// `/user/<username>` with the username as a single encoded segment.
    pub fn user(username: &str) -> String {
        let mut path = String::from("/user/");
        for chunk in url::form_urlencoded::byte_serialize(username.as_bytes()) {
            // byte_serialize writes spaces as '+', which a path takes literally
            path.push_str(if chunk == "+" { "%20" } else { chunk });
        }
        path
    }
}

/// Keys of the persisted snapshot in the key-value store
pub mod keys {
    pub const IDENTITY: &str = "identity";
    pub const PEERS: &str = "chat_users";
    pub const MESSAGES: &str = "chat_messages";
    pub const SELECTED: &str = "selected_chat";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const REFRESH_TOKEN: &str = "refresh_token";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// An API call before credentials are attached
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            body: Some(body),
        }
    }
}

/// A completed API call, successful or not
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode a successful body; non-2xx becomes [`SessionError::Status`].
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if !self.is_success() {
            return Err(SessionError::Status {
                status: self.status,
                body: self.body.clone(),
            });
        }
        Ok(serde_json::from_str(&self.body)?)
    }
}
