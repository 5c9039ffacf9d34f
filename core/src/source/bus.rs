// In-process call source backed by the event bus
use super::{CallSource, Subscription};
use crate::event::{Event, EventBus, QoSLevel};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Event type carried by call messages on queue topics
pub const CALL_EVENT: &str = "panel.call";

pub fn queue_topic(queue_id: &str) -> String {
    format!("queue.{}", queue_id)
}

pub struct BusSource {
    bus: Arc<EventBus>,
    // The bus lives in-process, so it is always connected
    connected: watch::Sender<bool>,
}

impl BusSource {
    pub fn new(bus: Arc<EventBus>) -> Self {
        let (connected, _) = watch::channel(true);
        Self { bus, connected }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Publishes a raw JSON call message on the queue's topic
    pub async fn publish(&self, queue_id: &str, payload: impl Into<Vec<u8>>) -> Result<u64> {
        let event = Event::new(CALL_EVENT, "bus", payload.into());
        self.bus.publish(&queue_topic(queue_id), event).await
    }
}

#[async_trait]
impl CallSource for BusSource {
    async fn subscribe(&self, queue_id: &str) -> Result<Subscription> {
        let (sub_id, rx) = self
            .bus
            .subscribe(
                queue_topic(queue_id),
                vec![CALL_EVENT.to_string()],
                QoSLevel::QosBatched,
            )
            .await?;

        let bus = Arc::clone(&self.bus);
        Ok(Subscription::new(queue_id, rx, move || {
            debug!(target: "bus_source", subscription = %sub_id, "Releasing bus subscription");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = bus.unsubscribe(&sub_id).await;
                });
            }
        }))
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}
