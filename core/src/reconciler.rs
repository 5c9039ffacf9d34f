//! Per-queue call reconciliation.
//!
//! The reconciler turns an unordered, possibly redundant stream of call
//! updates into one bounded, newest-first view per queue. The most recent call
//! is highlighted (`is_new`) for a display window; the highlight is cleared by
//! a timer that looks the record up by key, never by position, because the
//! list may have been re-sorted or truncated by the time it fires.

use crate::message::{CallUpdate, SingleCall, Snapshot};
use crate::model::{render_announcement, AnnouncementRequest, CallKey, QueuePanelState};
use crate::timers::TimerRegistry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Highlight window for single-call updates; not configurable.
pub const SINGLE_CALL_HIGHLIGHT: Duration = Duration::from_secs(5);

const DEFAULT_TEMPLATE: &str = "{nome}, {local}";
const TICKET_TEMPLATE: &str = "Senha {senha}, {nome}, {local}";

/// How far a new highlight reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HighlightScope {
    /// At most one highlighted call per queue
    #[default]
    Queue,
    /// At most one highlighted call across the whole panel
    Panel,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Snapshot highlight window when the message does not carry one
    pub display_duration: Duration,
    /// Announcement repeat interval when the message does not carry one
    pub repeat_interval: Duration,
    /// Repeats for single-call announcements
    pub single_call_repeats: u32,
    pub highlight_scope: HighlightScope,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            display_duration: Duration::from_secs(15),
            repeat_interval: Duration::from_secs(5),
            single_call_repeats: 1,
            highlight_scope: HighlightScope::Queue,
        }
    }
}

pub struct Reconciler {
    config: ReconcilerConfig,
    states: Arc<DashMap<String, QueuePanelState>>,
    // One highlight timer per queue
    timers: TimerRegistry<String>,
    changes: Arc<watch::Sender<u64>>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        let (changes, _) = watch::channel(0u64);
        Self {
            config,
            states: Arc::new(DashMap::new()),
            timers: TimerRegistry::new("highlight"),
            changes: Arc::new(changes),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Decodes a raw JSON frame and applies it. Undecodable frames are
    /// logged and dropped.
    pub fn apply_message(&self, queue_id: &str, payload: &[u8]) -> Option<AnnouncementRequest> {
        match CallUpdate::from_slice(payload) {
            Ok(update) => self.apply_update(queue_id, update),
            Err(e) => {
                warn!(target: "reconciler", queue = %queue_id, error = %e, "Ignoring malformed message");
                None
            }
        }
    }

    /// Applies one update to the queue's view and returns the announcement it
    /// triggers, if any. Malformed updates leave the state untouched.
    pub fn apply_update(&self, queue_id: &str, update: CallUpdate) -> Option<AnnouncementRequest> {
        match update {
            CallUpdate::Snapshot(snapshot) => self.apply_snapshot(queue_id, &snapshot),
            CallUpdate::Single(call) => self.apply_single(queue_id, &call),
        }
    }

    fn apply_snapshot(&self, queue_id: &str, snapshot: &Snapshot) -> Option<AnnouncementRequest> {
        let (current, recent) = match snapshot.to_records(queue_id) {
            Ok(records) => records,
            Err(e) => {
                warn!(target: "reconciler", queue = %queue_id, error = %e, "Ignoring malformed snapshot");
                return None;
            }
        };

        let announced = current.clone();
        if current.is_some() {
            self.clear_other_queues(queue_id);
        }

        let (changed, retained) = {
            let mut state = self
                .states
                .entry(queue_id.to_string())
                .or_insert_with(|| QueuePanelState::new(queue_id));
            let before = state.records.clone();
            let retained = state.merge_snapshot(current, recent);
            (before != state.records, retained)
        };

        let announcement = match announced {
            Some(record) if retained => {
                let window = snapshot
                    .display_duration()
                    .unwrap_or(self.config.display_duration);
                self.schedule_clear(queue_id, record.key.clone(), window);

                snapshot.sound_enabled().then(|| {
                    let template = snapshot.voice_template().unwrap_or(DEFAULT_TEMPLATE);
                    let interval = snapshot
                        .repeat_interval()
                        .unwrap_or(self.config.repeat_interval);
                    AnnouncementRequest::new(
                        render_announcement(template, &record),
                        snapshot.repeat_count().unwrap_or(1),
                        whole_seconds(interval),
                    )
                })
            }
            Some(record) => {
                debug!(target: "reconciler", queue = %queue_id, name = %record.subject_name, "Current call older than retained history");
                self.timers.cancel(&queue_id.to_string());
                None
            }
            None => None,
        };

        if changed {
            self.notify();
        }
        announcement
    }

    fn apply_single(&self, queue_id: &str, call: &SingleCall) -> Option<AnnouncementRequest> {
        let record = match call.to_record(queue_id) {
            Ok(record) => record,
            Err(e) => {
                warn!(target: "reconciler", queue = %queue_id, error = %e, "Ignoring malformed single call");
                return None;
            }
        };

        self.clear_other_queues(queue_id);

        let key = record.key.clone();
        let template = if record.ticket.is_some() {
            TICKET_TEMPLATE
        } else {
            DEFAULT_TEMPLATE
        };
        let text = render_announcement(template, &record);
        info!(target: "reconciler", queue = %queue_id, name = %record.subject_name, location = %record.location, "Call received");

        self.states
            .entry(queue_id.to_string())
            .or_insert_with(|| QueuePanelState::new(queue_id))
            .push_single(record);

        self.schedule_clear(queue_id, key, SINGLE_CALL_HIGHLIGHT);
        self.notify();

        Some(AnnouncementRequest::new(
            text,
            self.config.single_call_repeats,
            whole_seconds(self.config.repeat_interval),
        ))
    }

    fn schedule_clear(&self, queue_id: &str, key: CallKey, window: Duration) {
        let states = Arc::clone(&self.states);
        let changes = Arc::clone(&self.changes);
        let queue = queue_id.to_string();

        self.timers.schedule(queue_id.to_string(), window, async move {
            let cleared = states
                .get_mut(&queue)
                .map(|mut state| state.clear_new(&key))
                .unwrap_or(false);
            if cleared {
                debug!(target: "reconciler", queue = %queue, "Highlight expired");
                changes.send_modify(|v| *v = v.wrapping_add(1));
            }
        });
    }

    // Under panel scope a new highlight anywhere ends every other one.
    fn clear_other_queues(&self, queue_id: &str) {
        if self.config.highlight_scope != HighlightScope::Panel {
            return;
        }
        let mut cleared = Vec::new();
        for mut entry in self.states.iter_mut() {
            if entry.key() != queue_id && entry.value_mut().clear_all_flags() {
                cleared.push(entry.key().clone());
            }
        }
        for queue in cleared {
            self.timers.cancel(&queue);
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Snapshot of one queue's view
    pub fn view(&self, queue_id: &str) -> Option<QueuePanelState> {
        self.states.get(queue_id).map(|s| s.value().clone())
    }

    /// Snapshots of every queue, ordered by queue id
    pub fn views(&self) -> Vec<QueuePanelState> {
        let mut views: Vec<QueuePanelState> =
            self.states.iter().map(|s| s.value().clone()).collect();
        views.sort_by(|a, b| a.queue_id.cmp(&b.queue_id));
        views
    }

    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.states.iter().map(|s| s.key().clone()).collect();
        queues.sort();
        queues
    }

    /// Total highlighted records across all queues
    pub fn new_count(&self) -> usize {
        self.states.iter().map(|s| s.value().new_count()).sum()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.pending()
    }

    /// Receiver bumped on every visible state change
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Drops a queue's view and its pending highlight timer.
    pub fn remove_queue(&self, queue_id: &str) -> bool {
        self.timers.cancel(&queue_id.to_string());
        let removed = self.states.remove(queue_id).is_some();
        if removed {
            self.notify();
        }
        removed
    }

    /// Teardown: cancels every timer and forgets every queue.
    pub fn clear(&self) {
        let cancelled = self.timers.cancel_all();
        self.states.clear();
        debug!(target: "reconciler", cancelled, "Reconciler cleared");
        self.notify();
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}

fn whole_seconds(d: Duration) -> u64 {
    d.as_secs_f64().round() as u64
}
