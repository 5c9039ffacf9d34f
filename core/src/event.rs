// Event bus implementation
use crate::utils::{gen_id, now_ms};
use crate::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Delivery class of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QoSLevel {
    /// Small queue, never awaits; events are dropped when the subscriber lags
    QosRealtime,
    /// Bounded queue; publisher awaits capacity
    QosBatched,
    /// Large bounded queue; publisher awaits capacity
    QosBackground,
}

/// Message carried on the bus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub r#type: String,
    pub timestamp_ms: i64,
    pub source: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: gen_id(),
            r#type: event_type.into(),
            timestamp_ms: now_ms(),
            source: source.into(),
            metadata: HashMap::new(),
            payload,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Subscription information
#[derive(Debug, Clone)]
struct Subscription {
    id: String,
    event_types: Vec<String>,
    qos: QoSLevel,
    sender: mpsc::Sender<Event>,
}

/// Event bus statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub active_subscriptions: usize,
    pub dropped_events: u64,
}

/// In-process topic bus
pub struct EventBus {
    // Topic -> Subscriber list
    subscriptions: Arc<DashMap<String, Vec<Subscription>>>,

    // Statistics
    stats: Arc<DashMap<String, EventBusStats>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            stats: Arc::new(DashMap::new()),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "event_bus", "Event Bus shutting down");
        self.subscriptions.clear();
        Ok(())
    }

    /// Publish event to topic, returning the number of subscribers reached
    pub async fn publish(&self, topic: &str, event: Event) -> Result<u64> {
        debug!(target: "event_bus", "Publishing event {} to topic {}", event.id, topic);

        self.update_stats(topic, |stats| stats.total_published += 1);

        // Clone the senders out so no map guard is held across an await
        let subs: Vec<Subscription> = match self.subscriptions.get(topic) {
            Some(subs) => subs.value().clone(),
            None => {
                debug!(target: "event_bus", "No subscriptions for topic: {}", topic);
                return Ok(0);
            }
        };

        let mut delivered = 0;
        let mut dropped = 0;

        for sub in &subs {
            if !sub.event_types.is_empty() && !sub.event_types.contains(&event.r#type) {
                continue;
            }

            match sub.qos {
                QoSLevel::QosRealtime => {
                    if sub.sender.try_send(event.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        dropped += 1;
                        warn!(target: "event_bus", "Dropped realtime event for subscription {}", sub.id);
                    }
                }
                QoSLevel::QosBatched | QoSLevel::QosBackground => {
                    match sub.sender.send(event.clone()).await {
                        Ok(_) => delivered += 1,
                        Err(_) => {
                            dropped += 1;
                            warn!(target: "event_bus", "Failed to send event to subscription {}", sub.id);
                        }
                    }
                }
            }
        }

        self.update_stats(topic, |stats| {
            stats.total_delivered += delivered;
            stats.dropped_events += dropped;
        });

        Ok(delivered)
    }

    /// Subscribe to topic
    pub async fn subscribe(
        &self,
        topic: String,
        event_types: Vec<String>,
        qos: QoSLevel,
    ) -> Result<(String, mpsc::Receiver<Event>)> {
        let subscription_id = format!("sub_{}_{}", topic, gen_id());
        let cap = match qos {
            QoSLevel::QosRealtime => 64,
            QoSLevel::QosBatched => 1024,
            QoSLevel::QosBackground => 4096,
        };
        let (tx, rx) = mpsc::channel(cap);

        let subscription = Subscription {
            id: subscription_id.clone(),
            event_types,
            qos,
            sender: tx,
        };

        self.subscriptions
            .entry(topic.clone())
            .or_default()
            .push(subscription);

        self.update_stats(&topic, |stats| {
            stats.active_subscriptions += 1;
        });

        info!(
            target: "event_bus",
            "Created subscription {} for topic {}",
            subscription_id, topic
        );
        Ok((subscription_id, rx))
    }

    /// Unsubscribe; dropping the sender closes the subscriber's receiver
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let mut emptied_topics = Vec::new();
        for mut entry in self.subscriptions.iter_mut() {
            let topic = entry.key().clone();
            let before = entry.value().len();
            entry.value_mut().retain(|sub| sub.id != subscription_id);
            let removed = before - entry.value().len();

            if removed > 0 {
                self.update_stats(&topic, |stats| {
                    stats.active_subscriptions = stats.active_subscriptions.saturating_sub(removed);
                });
            }
            if entry.value().is_empty() {
                emptied_topics.push(topic);
            }
        }
        for topic in emptied_topics {
            self.subscriptions.remove_if(&topic, |_, subs| subs.is_empty());
        }

        info!(target: "event_bus", "Unsubscribed {}", subscription_id);
        Ok(())
    }

    /// Get stats
    pub fn get_stats(&self, topic: &str) -> Option<EventBusStats> {
        self.stats.get(topic).map(|s| s.clone())
    }

    fn update_stats<F>(&self, topic: &str, f: F)
    where
        F: FnOnce(&mut EventBusStats),
    {
        let mut entry = self.stats.entry(topic.to_string()).or_default();
        f(entry.value_mut());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
