//! Cross-context event relay.
//!
//! Sibling contexts sharing one Local Store hold clones of the same
//! [`Broadcaster`]. Events carry the id of the context that published them so
//! a receiver can skip its own.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// What happened in the publishing context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextEventKind {
    LanguageChanged { language: String },
    SyncCompleted { language: String, version: i64 },
    /// Local entries were dropped; `None` means every language.
    CacheCleared { language: Option<String> },
    /// Delivered locally when a listener fell behind and `skipped` events were
    /// lost; the receiver can no longer tell what changed. Never published.
    Lagged { skipped: u64 },
}

/// An event published by one context to its siblings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEvent {
    pub origin: String,
    #[serde(flatten)]
    pub kind: ContextEventKind,
}

/// Publish/subscribe channel shared by sibling contexts.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<ContextEvent>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl Broadcaster {
    /// Create a channel buffering up to `capacity` undelivered events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Send an event to every receiver. Returns how many receivers got it.
    pub fn publish(&self, event: ContextEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!(origin = %event.origin, "no sibling contexts listening");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.sender.subscribe()
    }

    /// Run `handler` for every event received from now on.
    ///
    /// The listener stops when every `Broadcaster` clone is dropped or the
    /// returned task is aborted. When the receiver lags, the handler gets a
    /// [`ContextEventKind::Lagged`] event with an empty origin in place of the
    /// lost events.
    pub fn on_receive<F, Fut>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(ContextEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => handler(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "context listener lagged behind, events dropped");
                        handler(ContextEvent { origin: String::new(), kind: ContextEventKind::Lagged { skipped } }).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
