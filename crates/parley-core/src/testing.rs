//! Test doubles for the transport, connector and reconnect seams

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::auth::{ApiTransport, Reconnect};
use crate::connection::{Connector, Link};
use crate::error::{Result, SessionError};
use crate::protocol::{ApiRequest, ApiResponse};

/// Replies with canned responses in order and records every call.
pub struct ScriptedTransport {
    responses: StdMutex<VecDeque<ApiResponse>>,
    calls: StdMutex<Vec<(ApiRequest, Option<String>)>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<ApiResponse>) -> Self {
        Self {
            responses: StdMutex::new(responses.into()),
            calls: StdMutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(ApiRequest, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ApiTransport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((request.clone(), bearer.map(str::to_string)));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| SessionError::Connect("no scripted response left".to_string()))
    }
}

/// Records reconnect tokens; optionally fails every reconnect.
#[derive(Default)]
pub struct RecordingReconnect {
    tokens: StdMutex<Vec<String>>,
    fail: bool,
}

impl RecordingReconnect {
    pub fn failing() -> Self {
        Self {
            tokens: StdMutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reconnect for RecordingReconnect {
    async fn reconnect(&self, token: &str) -> Result<()> {
        self.tokens.lock().unwrap().push(token.to_string());
        if self.fail {
            return Err(SessionError::Connect("refused".to_string()));
        }
        Ok(())
    }
}

/// Server side of a mock connection
pub struct ServerEnd {
    pub token: String,
    pub from_client: mpsc::Receiver<String>,
    pub to_client: mpsc::Sender<String>,
}

/// In-memory connector. Each successful connect leaves a [`ServerEnd`] behind.
pub struct MockConnector {
    fail: bool,
    tokens: Mutex<Vec<String>>,
    servers: Mutex<Vec<Option<ServerEnd>>>,
    hold: Mutex<Option<oneshot::Receiver<()>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            fail: false,
            tokens: Mutex::new(Vec::new()),
            servers: Mutex::new(Vec::new()),
            hold: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub async fn tokens(&self) -> Vec<String> {
        self.tokens.lock().await.clone()
    }

    pub async fn connect_count(&self) -> usize {
        self.tokens.lock().await.len()
    }

    pub async fn take_server(&self, index: usize) -> ServerEnd {
        self.servers.lock().await[index]
            .take()
            .expect("server end already taken")
    }

    /// The next connect blocks until the returned sender fires.
    pub async fn hold_next_connect(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.hold.lock().await = Some(rx);
        tx
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, token: &str) -> Result<Link> {
        self.tokens.lock().await.push(token.to_string());
        let hold = self.hold.lock().await.take();
        if let Some(rx) = hold {
            let _ = rx.await;
        }
        if self.fail {
            return Err(SessionError::Connect("connection refused".to_string()));
        }

        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        self.servers.lock().await.push(Some(ServerEnd {
            token: token.to_string(),
            from_client: out_rx,
            to_client: in_tx,
        }));
        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
