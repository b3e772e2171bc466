//! Chat state transitions and the handle that owns the live state
//!
//! Every mutation is a plain function on [`SessionState`]; [`SharedSession`]
//! runs it under a lock and then persists the result, so the inbound and
//! outbound paths share one sequential pipeline: event → transition → save.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, SessionError};
use crate::store::SessionStore;
use crate::types::{Identity, Message, Peer, SessionState, User};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("peer '{0}' is registered more than once")]
    DuplicatePeer(String),
    #[error("message log for '{0}' has no registered peer")]
    OrphanLog(String),
    #[error("selected peer '{0}' is not registered")]
    SelectionNotRegistered(String),
}

impl SessionState {
    /// Apply a message received from the network.
    ///
    /// Appends to the sender's log, registers the sender on first contact
    /// (display name = username, the wire carries no display name), and
    /// selects the sender only if nothing is selected yet.
    pub fn apply_inbound(&mut self, message: Message) {
        let sender = message.from.clone();
        self.messages_by_peer
            .entry(sender.clone())
            .or_default()
            .push(message);

        if self.peer(&sender).is_none() {
            debug!("Registering new peer '{}' from inbound message", sender);
            self.peers.push(User::from_username(sender.as_str()));
        }

        if self.selected_peer.is_none() {
            self.selected_peer = self.peer(&sender).cloned();
        }
    }

    /// Mirror a locally sent message into the recipient's log. The recipient
    /// is the current selection and therefore already registered.
    pub fn record_outbound(&mut self, message: Message) {
        self.messages_by_peer
            .entry(message.to.clone())
            .or_default()
            .push(message);
    }

    /// Register `user` if unknown and make it the selection.
    pub fn open_chat(&mut self, user: Peer) {
        let selected = match self.peer(&user.username) {
            Some(existing) => existing.clone(),
            None => {
                self.peers.push(user.clone());
                user
            }
        };
        self.selected_peer = Some(selected);
    }

    /// Select an already-registered peer.
    pub fn select(&mut self, username: &str) -> Result<Peer> {
        let peer = self
            .peer(username)
            .cloned()
            .ok_or_else(|| SessionError::InvalidInput(format!("Unknown chat '{}'", username)))?;
        self.selected_peer = Some(peer.clone());
        Ok(peer)
    }

    pub fn check_invariants(&self) -> std::result::Result<(), InvariantViolation> {
        for (i, peer) in self.peers.iter().enumerate() {
            if self.peers[..i].iter().any(|p| p.username == peer.username) {
                return Err(InvariantViolation::DuplicatePeer(peer.username.clone()));
            }
        }
        for username in self.messages_by_peer.keys() {
            if self.peer(username).is_none() {
                return Err(InvariantViolation::OrphanLog(username.clone()));
            }
        }
        if let Some(selected) = &self.selected_peer {
            if self.peer(&selected.username).is_none() {
                return Err(InvariantViolation::SelectionNotRegistered(
                    selected.username.clone(),
                ));
            }
        }
        Ok(())
    }
}

/// Owner of the in-memory [`SessionState`], backed by a [`SessionStore`].
///
/// Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct SharedSession {
    state: Arc<Mutex<SessionState>>,
    store: SessionStore,
}

impl SharedSession {
    /// Start from whatever the store holds.
    pub fn restore(store: SessionStore) -> Self {
        let state = store.load();
        info!(
            "Restored session: {} peers, selection {:?}",
            state.peers.len(),
            state.selected_peer.as_ref().map(|p| p.username.as_str())
        );
        Self {
            state: Arc::new(Mutex::new(state)),
            store,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub async fn snapshot(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    pub async fn identity(&self) -> Identity {
        self.state.lock().await.identity.clone()
    }

    pub async fn selected_peer(&self) -> Option<Peer> {
        self.state.lock().await.selected_peer.clone()
    }

    /// Run a transition, then persist. The in-memory state keeps the change
    /// even if the save fails.
    pub async fn apply<F, R>(&self, transition: F) -> Result<R>
    where
        F: FnOnce(&mut SessionState) -> R,
    {
        let mut state = self.state.lock().await;
        let out = transition(&mut state);
        self.store.save(&state)?;
        Ok(out)
    }

    /// Like [`apply`](Self::apply) for fallible transitions; nothing is saved
    /// when the transition fails.
    pub async fn try_apply<F, R>(&self, transition: F) -> Result<R>
    where
        F: FnOnce(&mut SessionState) -> Result<R>,
    {
        let mut state = self.state.lock().await;
        let out = transition(&mut state)?;
        self.store.save(&state)?;
        Ok(out)
    }

    /// Replace the whole state (fresh login) and persist it.
    pub async fn replace(&self, new_state: SessionState) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = new_state;
        self.store.save(&state)
    }

    /// Forget everything: in-memory state, snapshot and credentials.
    pub async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = SessionState::default();
        self.store.clear()
    }
}
