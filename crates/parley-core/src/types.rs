//! Core data model: users, messages, the chat snapshot, credentials

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A chat participant. The local identity and every peer share this shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub fullname: String,
}

/// The local user, set once at login
pub type Identity = User;

/// Someone the local user has an open or implied conversation with
pub type Peer = User;

impl User {
    pub fn new(username: impl Into<String>, fullname: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            fullname: fullname.into(),
        }
    }

    /// A peer known only by username; the display name falls back to it.
    pub fn from_username(username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            fullname: username.clone(),
            username,
        }
    }
}

/// A single chat message. Also the inbound wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub content: String,
}

/// Everything that survives a reload.
///
/// Writers keep these invariants:
/// - `peers` has no duplicate usernames
/// - every key of `messages_by_peer` names a registered peer
/// - `selected_peer`, if set, is a registered peer
/// - message logs are append-only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub identity: Identity,
    /// Discovery order
    #[serde(default)]
    pub peers: Vec<Peer>,
    #[serde(default)]
    pub messages_by_peer: BTreeMap<String, Vec<Message>>,
    #[serde(default)]
    pub selected_peer: Option<Peer>,
}

impl SessionState {
    /// Fresh state for a newly logged-in identity
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            ..Default::default()
        }
    }

    pub fn peer(&self, username: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.username == username)
    }

    /// Conversation log with `username`, oldest first
    pub fn history(&self, username: &str) -> &[Message] {
        self.messages_by_peer
            .get(username)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Access/refresh token pair. Kept out of [`SessionState`].
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}
