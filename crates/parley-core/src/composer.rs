//! Outbound message composition

use tracing::debug;

use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::protocol::OutboundFrame;
use crate::state::SharedSession;
use crate::types::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Transmitted and appended to the peer's log
    Sent(Message),
    /// No selection, or blank content. Nothing was transmitted.
    Skipped,
}

#[derive(Clone)]
pub struct OutboundComposer {
    session: SharedSession,
    connection: ConnectionManager,
}

impl OutboundComposer {
    pub fn new(session: SharedSession, connection: ConnectionManager) -> Self {
        Self {
            session,
            connection,
        }
    }

    /// Send `content` to the selected peer.
    ///
    /// Without a selection, or with whitespace-only content, this is a silent
    /// no-op. With no open connection the message is dropped and
    /// [`crate::SessionError::NotConnected`] is returned.
    pub async fn send(&self, content: &str) -> Result<SendOutcome> {
        let Some(peer) = self.session.selected_peer().await else {
            return Ok(SendOutcome::Skipped);
        };
        if content.trim().is_empty() {
            return Ok(SendOutcome::Skipped);
        }

        let identity = self.session.identity().await;
        let message = Message {
            from: identity.username,
            to: peer.username,
            content: content.to_string(),
        };

        self.connection
            .send(&OutboundFrame {
                to: message.to.clone(),
                content: message.content.clone(),
            })
            .await?;

        let logged = message.clone();
        self.session
            .apply(move |state| {
                // A logout between send and append leaves nobody to log against
                if state.peer(&logged.to).is_some() {
                    state.record_outbound(logged);
                }
            })
            .await?;
        debug!("Sent message to '{}'", message.to);
        Ok(SendOutcome::Sent(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::store::SessionStore;
    use crate::testing::MockConnector;
    use crate::types::{SessionState, User};
    use std::sync::Arc;

    struct Fixture {
        store: SessionStore,
        session: SharedSession,
        connector: Arc<MockConnector>,
        composer: OutboundComposer,
    }

    async fn fixture(select: Option<&str>, connected: bool) -> Fixture {
        let store = SessionStore::in_memory();
        let session = SharedSession::restore(store.clone());
        session
            .replace(SessionState::new(User::from_username("alice")))
            .await
            .unwrap();
        if let Some(peer) = select {
            session
                .apply(|s| s.open_chat(User::from_username(peer)))
                .await
                .unwrap();
        }
        let connector = Arc::new(MockConnector::new());
        let (connection, _inbound) = ConnectionManager::new(connector.clone());
        if connected {
            connection.open("t1").await.unwrap();
        }
        let composer = OutboundComposer::new(session.clone(), connection);
        Fixture {
            store,
            session,
            connector,
            composer,
        }
    }

    #[tokio::test]
    async fn test_send_transmits_and_logs() {
        let f = fixture(Some("bob"), true).await;
        let mut server = f.connector.take_server(0).await;

        let outcome = f.composer.send("hello bob").await.unwrap();
        let expected = Message {
            from: "alice".into(),
            to: "bob".into(),
            content: "hello bob".into(),
        };
        assert_eq!(outcome, SendOutcome::Sent(expected.clone()));

        let wire = server.from_client.recv().await.unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&wire).unwrap(),
            serde_json::json!({"to": "bob", "content": "hello bob"})
        );
        assert_eq!(f.store.load().history("bob"), &[expected]);
    }

    #[tokio::test]
    async fn test_whitespace_content_is_noop() {
        let f = fixture(Some("bob"), true).await;
        let mut server = f.connector.take_server(0).await;
        let before = f.session.snapshot().await;

        for blank in ["", "   ", "\n\t "] {
            assert_eq!(f.composer.send(blank).await.unwrap(), SendOutcome::Skipped);
        }

        assert!(server.from_client.try_recv().is_err());
        assert_eq!(f.session.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_no_selection_is_noop() {
        let f = fixture(None, true).await;
        let mut server = f.connector.take_server(0).await;
        assert_eq!(f.composer.send("hi").await.unwrap(), SendOutcome::Skipped);
        assert!(server.from_client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_not_connected_drops_message() {
        let f = fixture(Some("bob"), false).await;
        let err = f.composer.send("hi").await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        assert!(f.session.snapshot().await.history("bob").is_empty());
    }

    #[tokio::test]
    async fn test_send_never_registers_peers() {
        let f = fixture(Some("bob"), true).await;
        f.composer.send("one").await.unwrap();
        f.composer.send("two").await.unwrap();
        let state = f.session.snapshot().await;
        assert_eq!(state.peers.len(), 1);
        assert_eq!(state.history("bob").len(), 2);
        state.check_invariants().unwrap();
    }
}
