//! parley-core: authenticated real-time session core for a one-to-one chat client
//!
//! Keeps a live connection tied to a short-lived access token, refreshes the
//! token transparently when the API rejects it (replacing the connection), and
//! maintains the local list of chat partners and per-partner message logs,
//! persisted so they survive a restart.

pub mod auth;
pub mod client;
pub mod composer;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod router;
pub mod state;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use auth::{ApiTransport, AuthGateway, HttpTransport, Reconnect};
pub use client::ChatClient;
pub use composer::{OutboundComposer, SendOutcome};
pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionState, Connector, Link, WsConnector};
pub use error::{Result, SessionError};
pub use router::MessageRouter;
pub use state::{InvariantViolation, SharedSession};
pub use store::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, SessionStore};
pub use types::{Credentials, Identity, Message, Peer, SessionState, User};
