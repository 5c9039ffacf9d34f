// Panel runtime: source -> reconciler -> announcer
use crate::announcer::{Announcer, SpeechSynthesizer};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::source::CallSource;
use crate::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct PanelRuntimeConfig {
    pub queues: Vec<String>,
    pub reconciler: ReconcilerConfig,
}

/// One public panel instance.
///
/// Owns one consumer task per subscribed queue, the reconciler with its
/// highlight timers and the announcer with its repeat timers. `shutdown`
/// releases all of them.
pub struct PanelRuntime {
    source: Arc<dyn CallSource>,
    reconciler: Arc<Reconciler>,
    announcer: Arc<Announcer>,
    queues: Vec<String>,
    consumers: DashMap<String, JoinHandle<()>>,
}

impl PanelRuntime {
    pub fn new(
        config: PanelRuntimeConfig,
        source: Arc<dyn CallSource>,
        synth: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        Self {
            source,
            reconciler: Arc::new(Reconciler::new(config.reconciler)),
            announcer: Arc::new(Announcer::new(synth)),
            queues: config.queues,
            consumers: DashMap::new(),
        }
    }

    pub async fn start(&self) -> Result<()> {
        info!(target: "panel", queues = ?self.queues, "Starting panel");
        for queue in &self.queues {
            self.subscribe_queue(queue).await?;
        }
        info!(target: "panel", "Panel started");
        Ok(())
    }

    /// Subscribes to one more queue. Already-subscribed queues are left as is.
    pub async fn subscribe_queue(&self, queue_id: &str) -> Result<()> {
        if self.consumers.contains_key(queue_id) {
            debug!(target: "panel", queue = %queue_id, "Already subscribed");
            return Ok(());
        }
        let mut subscription = self.source.subscribe(queue_id).await?;
        let reconciler = Arc::clone(&self.reconciler);
        let announcer = Arc::clone(&self.announcer);
        let queue = queue_id.to_string();

        // Messages of one queue are applied strictly in delivery order
        let consumer = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let Some(request) = reconciler.apply_message(&queue, &event.payload) {
                    announcer.announce(request);
                }
            }
            warn!(target: "panel", queue = %queue, "Queue channel closed");
        });

        if let Some(previous) = self.consumers.insert(queue_id.to_string(), consumer) {
            previous.abort();
        }
        info!(target: "panel", queue = %queue_id, "Subscribed to queue");
        Ok(())
    }

    /// Stops consuming a queue and discards its view.
    pub fn unsubscribe_queue(&self, queue_id: &str) -> bool {
        let Some((_, consumer)) = self.consumers.remove(queue_id) else {
            return false;
        };
        // Aborting drops the subscription, which unsubscribes at the source
        consumer.abort();
        self.reconciler.remove_queue(queue_id);
        info!(target: "panel", queue = %queue_id, "Unsubscribed from queue");
        true
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "panel", "Shutting down panel...");
        let queues: Vec<String> = self.consumers.iter().map(|c| c.key().clone()).collect();
        for queue in queues {
            if let Some((_, consumer)) = self.consumers.remove(&queue) {
                consumer.abort();
            }
        }
        self.announcer.stop();
        self.reconciler.clear();
        info!(target: "panel", "Panel shut down");
        Ok(())
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn announcer(&self) -> &Arc<Announcer> {
        &self.announcer
    }

    pub fn subscribed_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.consumers.iter().map(|c| c.key().clone()).collect();
        queues.sort();
        queues
    }

    pub fn is_connected(&self) -> bool {
        self.source.is_connected()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.source.watch_connected()
    }
}

impl Drop for PanelRuntime {
    fn drop(&mut self) {
        for consumer in self.consumers.iter() {
            consumer.value().abort();
        }
    }
}
