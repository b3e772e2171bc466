//! Inbound message routing into the chat state

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::state::SharedSession;
use crate::types::Message;

/// Capacity of the observer channel for applied inbound messages
const OBSERVER_BUFFER: usize = 128;

#[derive(Clone)]
pub struct MessageRouter {
    session: SharedSession,
    observers: broadcast::Sender<Message>,
}

impl MessageRouter {
    pub fn new(session: SharedSession) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_BUFFER);
        Self { session, observers }
    }

    /// Messages that have been applied and persisted, for display.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.observers.subscribe()
    }

    /// Apply one inbound message and persist the result.
    pub async fn on_inbound(&self, message: Message) -> Result<()> {
        debug!("Inbound message from '{}'", message.from);
        let applied = message.clone();
        self.session
            .apply(move |state| state.apply_inbound(applied))
            .await?;
        let _ = self.observers.send(message);
        Ok(())
    }

    /// Consume `inbound` one message at a time, in receipt order.
    pub fn spawn(self, mut inbound: mpsc::Receiver<Message>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if let Err(e) = self.on_inbound(message).await {
                    warn!("Failed to persist inbound message: {}", e);
                }
            }
            debug!("Inbound channel closed, router stopping");
        })
    }
}
