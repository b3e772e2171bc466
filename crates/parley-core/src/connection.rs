//! Live connection management: one current connection, keyed by access token
//!
//! The manager owns the connection exclusively. Everyone else goes through
//! [`ConnectionManager::send`] and the inbound channel handed out by
//! [`ConnectionManager::new`], so nothing holds a socket across a reconnect.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::auth::Reconnect;
use crate::error::{Result, SessionError};
use crate::protocol::OutboundFrame;
use crate::types::Message;

/// Outbound frames buffered per connection before `send` reports backpressure
const OUTBOUND_BUFFER: usize = 64;

/// Inbound messages buffered between the connection and the router
const INBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

/// Text-frame pipes of an established connection. Dropping `outgoing` asks
/// the transport to close.
pub struct Link {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

/// Establishes a connection authorized by `token`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Link>;
}

/// WebSocket connector; the token travels as the `token` query parameter.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn endpoint(&self, token: &str) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|e| SessionError::Config(format!("ws_url '{}': {}", self.url, e)))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, token: &str) -> Result<Link> {
        let url = self.endpoint(token)?;
        debug!("Connecting to {}", self.url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(INBOUND_BUFFER);

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                    warn!("WebSocket write failed: {}", e);
                    return;
                }
            }
            // Every sender is gone: the manager let go of this connection
            let _ = write.send(WsMessage::Close(None)).await;
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("WebSocket reader finished");
        });

        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

struct ActiveConnection {
    epoch: u64,
    outgoing: mpsc::Sender<String>,
    pump: JoinHandle<()>,
}

impl ActiveConnection {
    fn shutdown(self) {
        self.pump.abort();
        // Dropping `outgoing` lets the writer flush what is queued, then close
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    inbound: mpsc::Sender<Message>,
    current: Mutex<Option<ActiveConnection>>,
    epoch: AtomicU64,
    state: watch::Sender<ConnectionState>,
}

/// Holds at most one current connection.
///
/// State machine: `Disconnected → Connecting → Open → Disconnected`. A
/// reconnect drops the old connection before the new one is established, so
/// a send in between fails with [`SessionError::NotConnected`].
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Returns the manager and the receiving end of its inbound messages,
    /// in arrival order across connections.
    pub fn new(connector: Arc<dyn Connector>) -> (Self, mpsc::Receiver<Message>) {
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let manager = Self {
            inner: Arc::new(Inner {
                connector,
                inbound,
                current: Mutex::new(None),
                epoch: AtomicU64::new(0),
                state,
            }),
        };
        (manager, inbound_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Establish a connection with `token`, replacing any current one.
    pub async fn open(&self, token: &str) -> Result<()> {
        self.establish(token).await
    }

    /// Close the current connection (if any) and open a new one with `token`.
    pub async fn reconnect(&self, token: &str) -> Result<()> {
        info!("Reconnecting with refreshed token");
        self.establish(token).await
    }

    /// Close the current connection. Also abandons any connect in progress.
    pub async fn close(&self) {
        let mut current = self.inner.current.lock().await;
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(active) = current.take() {
            active.shutdown();
            info!("Connection closed");
        }
        self.inner.state.send_replace(ConnectionState::Disconnected);
    }

    /// Queue `frame` on the current connection.
    pub async fn send(&self, frame: &OutboundFrame) -> Result<()> {
        let payload = serde_json::to_string(frame)?;
        let current = self.inner.current.lock().await;
        let active = current.as_ref().ok_or(SessionError::NotConnected)?;
        active.outgoing.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SessionError::Connect("outbound buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => SessionError::NotConnected,
        })
    }

    async fn establish(&self, token: &str) -> Result<()> {
        let epoch = {
            let mut current = self.inner.current.lock().await;
            let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(old) = current.take() {
                debug!("Dropping connection {} before connecting", old.epoch);
                old.shutdown();
            }
            self.inner.state.send_replace(ConnectionState::Connecting);
            epoch
        };

        let link = match self.inner.connector.connect(token).await {
            Ok(link) => link,
            Err(e) => {
                let current = self.inner.current.lock().await;
                if self.inner.epoch.load(Ordering::SeqCst) == epoch && current.is_none() {
                    self.inner.state.send_replace(ConnectionState::Disconnected);
                }
                warn!("Connect failed: {}", e);
                return Err(e);
            }
        };

        let mut current = self.inner.current.lock().await;
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            debug!("Connection {} superseded before it was ready", epoch);
            return Err(SessionError::Connect(
                "superseded by a newer connection".to_string(),
            ));
        }

        let pump = tokio::spawn(pump_inbound(
            Arc::downgrade(&self.inner),
            epoch,
            link.incoming,
            self.inner.inbound.clone(),
        ));
        *current = Some(ActiveConnection {
            epoch,
            outgoing: link.outgoing,
            pump,
        });
        self.inner.state.send_replace(ConnectionState::Open);
        info!("Connection {} open", epoch);
        Ok(())
    }
}

#[async_trait]
impl Reconnect for ConnectionManager {
    async fn reconnect(&self, token: &str) -> Result<()> {
        ConnectionManager::reconnect(self, token).await
    }
}

/// Decode frames of one connection and forward them in order. When the
/// connection ends on its own, mark the manager disconnected if it is still
/// the current one.
async fn pump_inbound(
    inner: Weak<Inner>,
    epoch: u64,
    mut incoming: mpsc::Receiver<String>,
    inbound: mpsc::Sender<Message>,
) {
    while let Some(text) = incoming.recv().await {
        match serde_json::from_str::<Message>(&text) {
            Ok(message) => {
                if inbound.send(message).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("Ignoring malformed inbound frame: {}", e),
        }
    }

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut current = inner.current.lock().await;
    if current.as_ref().is_some_and(|c| c.epoch == epoch) {
        *current = None;
        inner.state.send_replace(ConnectionState::Disconnected);
        info!("Connection {} ended by remote", epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnector;
    use std::time::Duration;

    fn frame(to: &str, content: &str) -> OutboundFrame {
        OutboundFrame {
            to: to.to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let (manager, _rx) = ConnectionManager::new(Arc::new(MockConnector::new()));
        let err = manager.send(&frame("bob", "hi")).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_open_send_and_receive() {
        let connector = Arc::new(MockConnector::new());
        let (manager, mut inbound) = ConnectionManager::new(connector.clone());
        manager.open("t1").await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Open);

        let mut server = connector.take_server(0).await;
        assert_eq!(server.token, "t1");

        manager.send(&frame("bob", "hi")).await.unwrap();
        let wire = server.from_client.recv().await.unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&wire).unwrap(),
            serde_json::json!({"to": "bob", "content": "hi"})
        );

        server
            .to_client
            .send(r#"{"from":"bob","to":"alice","content":"yo"}"#.to_string())
            .await
            .unwrap();
        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.from, "bob");
        assert_eq!(msg.content, "yo");
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let connector = Arc::new(MockConnector::new());
        let (manager, mut inbound) = ConnectionManager::new(connector.clone());
        manager.open("t1").await.unwrap();
        let server = connector.take_server(0).await;

        server.to_client.send("not json".to_string()).await.unwrap();
        server
            .to_client
            .send(r#"{"from":"bob","to":"alice","content":"ok"}"#.to_string())
            .await
            .unwrap();

        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.content, "ok");
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_connection() {
        let connector = Arc::new(MockConnector::new());
        let (manager, _inbound) = ConnectionManager::new(connector.clone());
        manager.open("t1").await.unwrap();
        let mut old = connector.take_server(0).await;

        manager.reconnect("t2").await.unwrap();
        let mut new = connector.take_server(1).await;
        assert_eq!(new.token, "t2");
        assert_eq!(connector.tokens().await, vec!["t1", "t2"]);
        assert_eq!(connector.connect_count().await, 2);

        // Old connection's outgoing side is closed
        assert!(old.from_client.recv().await.is_none());

        manager.send(&frame("bob", "after")).await.unwrap();
        let wire = new.from_client.recv().await.unwrap();
        assert!(wire.contains("after"));
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_send_fails_fast_while_reconnecting() {
        let connector = Arc::new(MockConnector::new());
        let (manager, _inbound) = ConnectionManager::new(connector.clone());
        manager.open("t1").await.unwrap();

        let release = connector.hold_next_connect().await;
        let reconnecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.reconnect("t2").await })
        };

        let mut states = manager.subscribe();
        states
            .wait_for(|s| *s == ConnectionState::Connecting)
            .await
            .unwrap();
        let err = manager.send(&frame("bob", "lost?")).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));

        release.send(()).unwrap();
        reconnecting.await.unwrap().unwrap();
        assert_eq!(manager.state(), ConnectionState::Open);
        manager.send(&frame("bob", "now")).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let connector = Arc::new(MockConnector::new());
        let (manager, _inbound) = ConnectionManager::new(connector.clone());
        manager.open("t1").await.unwrap();
        manager.close().await;
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(
            manager.send(&frame("bob", "x")).await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let connector = Arc::new(MockConnector::failing());
        let (manager, _inbound) = ConnectionManager::new(connector);
        assert!(manager.open("t1").await.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_remote_close_marks_disconnected() {
        let connector = Arc::new(MockConnector::new());
        let (manager, _inbound) = ConnectionManager::new(connector.clone());
        manager.open("t1").await.unwrap();
        let server = connector.take_server(0).await;
        drop(server);

        let mut states = manager.subscribe();
        tokio::time::timeout(
            Duration::from_secs(1),
            states.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(matches!(
            manager.send(&frame("bob", "x")).await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_during_connect_abandons_it() {
        let connector = Arc::new(MockConnector::new());
        let (manager, _inbound) = ConnectionManager::new(connector.clone());

        let release = connector.hold_next_connect().await;
        let opening = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.open("t1").await })
        };
        let mut states = manager.subscribe();
        states
            .wait_for(|s| *s == ConnectionState::Connecting)
            .await
            .unwrap();

        manager.close().await;
        release.send(()).unwrap();

        assert!(opening.await.unwrap().is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_ws_endpoint_appends_token() {
        let connector = WsConnector::new("ws://localhost:8080/ws");
        let url = connector.endpoint("abc.def").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8080/ws?token=abc.def");
    }
}
