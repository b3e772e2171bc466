//! ChatClient: wires store, gateway, connection, router and composer together

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::{ApiTransport, AuthGateway, HttpTransport};
use crate::composer::{OutboundComposer, SendOutcome};
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState, Connector, WsConnector};
use crate::error::{Result, SessionError};
use crate::protocol::{ApiRequest, endpoints};
use crate::router::MessageRouter;
use crate::state::SharedSession;
use crate::store::SessionStore;
use crate::types::{Identity, Message, Peer, SessionState, User};

pub struct ChatClient {
    session: SharedSession,
    gateway: AuthGateway,
    connection: ConnectionManager,
    router: MessageRouter,
    composer: OutboundComposer,
    router_task: JoinHandle<()>,
}

impl ChatClient {
    /// Build a client for `config`, restoring any persisted session.
    /// Must be called inside a tokio runtime.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.api_url, config.request_timeout())?;
        Ok(Self::with_parts(
            Arc::new(transport),
            Arc::new(WsConnector::new(&config.ws_url)),
            SessionStore::at_path(&config.state_path),
        ))
    }

    pub fn with_parts(
        transport: Arc<dyn ApiTransport>,
        connector: Arc<dyn Connector>,
        store: SessionStore,
    ) -> Self {
        let session = SharedSession::restore(store);
        let (connection, inbound) = ConnectionManager::new(connector);
        let gateway = AuthGateway::new(
            transport,
            session.clone(),
            Arc::new(connection.clone()),
        );
        let router = MessageRouter::new(session.clone());
        let router_task = router.clone().spawn(inbound);
        let composer = OutboundComposer::new(session.clone(), connection.clone());

        Self {
            session,
            gateway,
            connection,
            router,
            composer,
            router_task,
        }
    }

    /// Log in, start a fresh chat state for the identity, and connect.
    pub async fn login(&self, username: &str, password: &str) -> Result<Identity> {
        let (identity, credentials) = self.gateway.login(username, password).await?;
        self.session
            .replace(SessionState::new(identity.clone()))
            .await?;
        self.connection.open(&credentials.access_token).await?;
        Ok(identity)
    }

    /// Reconnect a restored session with the stored access token.
    ///
    /// If the token no longer opens a connection, one authorized probe is
    /// made; when the token was stale that refreshes it and reconnects.
    pub async fn resume(&self) -> Result<()> {
        let credentials = self
            .session
            .store()
            .credentials()
            .ok_or(SessionError::NotLoggedIn)?;

        match self.connection.open(&credentials.access_token).await {
            Ok(()) => Ok(()),
            Err(connect_err) => {
                info!("Stored token did not connect, probing credentials");
                self.list_users().await?;
                if self.connection.state() == ConnectionState::Open {
                    Ok(())
                } else {
                    Err(connect_err)
                }
            }
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.session.store().credentials().is_some()
    }

    /// Look up another user by exact username.
    pub async fn search_user(&self, username: &str) -> Result<User> {
        let username = username.trim();
        let me = self.session.identity().await;
        // Dot segments would be collapsed by URL normalization
        if username.is_empty() || username == me.username || matches!(username, "." | "..") {
            return Err(SessionError::InvalidInput("Invalid username".to_string()));
        }
        let resp = self
            .authorized(&ApiRequest::get(endpoints::user(username)))
            .await?;
        resp.json()
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let resp = self.authorized(&ApiRequest::get(endpoints::USERS)).await?;
        resp.json()
    }

    /// Add `user` to the chat list (if new) and select it.
    pub async fn open_chat(&self, user: Peer) -> Result<()> {
        self.session.apply(|state| state.open_chat(user)).await
    }

    pub async fn select(&self, username: &str) -> Result<Peer> {
        self.session.try_apply(|state| state.select(username)).await
    }

    pub async fn send(&self, content: &str) -> Result<SendOutcome> {
        self.composer.send(content).await
    }

    pub async fn snapshot(&self) -> SessionState {
        self.session.snapshot().await
    }

    pub async fn history(&self, username: &str) -> Vec<Message> {
        self.session.snapshot().await.history(username).to_vec()
    }

    /// Inbound messages, after they have been applied
    pub fn messages(&self) -> broadcast::Receiver<Message> {
        self.router.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Close the connection and forget credentials and chat state.
    pub async fn logout(&self) -> Result<()> {
        self.connection.close().await;
        self.session.reset().await?;
        info!("Logged out");
        Ok(())
    }

    /// Close the connection, keeping the persisted session for next time.
    pub async fn shutdown(self) {
        self.connection.close().await;
        self.router_task.abort();
    }

    async fn authorized(&self, request: &ApiRequest) -> Result<crate::protocol::ApiResponse> {
        let result = self.gateway.authorized_request(request).await;
        if let Err(e) = &result {
            if e.is_terminal() {
                warn!("Session can no longer be authorized, disconnecting");
                self.connection.close().await;
            }
        }
        result
    }
}
