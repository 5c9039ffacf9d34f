//! Call sources: where per-queue call messages come from.
//!
//! The reconciler only needs `subscribe(queue) -> Subscription` and a
//! liveness flag. Transport, authentication and reconnection stay inside the
//! source implementation:
//! - `BusSource`: in-process `EventBus` topics
//! - `StompSource`: STOMP 1.2 over WebSocket against the Q-Manager broker

pub mod bus;
pub mod frame;
pub mod stomp;

pub use bus::{queue_topic, BusSource, CALL_EVENT};
pub use frame::Frame;
pub use stomp::{HeartBeat, StompSource, StompSourceConfig};

use crate::event::Event;
use crate::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

#[async_trait]
pub trait CallSource: Send + Sync {
    /// Starts delivering the queue's messages. Dropping the returned
    /// subscription unsubscribes.
    async fn subscribe(&self, queue_id: &str) -> Result<Subscription>;

    fn is_connected(&self) -> bool;

    /// Receiver that observes connectivity changes
    fn watch_connected(&self) -> watch::Receiver<bool>;
}

type UnsubscribeFn = Box<dyn FnOnce() + Send>;

/// Live subscription to one queue channel
pub struct Subscription {
    queue_id: String,
    receiver: mpsc::Receiver<Event>,
    unsubscribe: Option<UnsubscribeFn>,
}

impl Subscription {
    pub fn new(
        queue_id: impl Into<String>,
        receiver: mpsc::Receiver<Event>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            queue_id: queue_id.into(),
            receiver,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// Next message; `None` once the source closed the channel
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}
