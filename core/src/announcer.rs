//! Speech announcements for newly highlighted calls.
//!
//! A panel owns one `Announcer`, and the announcer owns one timer set: a new
//! announcement replaces whatever repeats are still pending, it never queues
//! behind them. Speech failures are logged and swallowed so that the visual
//! path is never affected.

use crate::model::{AnnouncementRequest, MAX_REPEAT_COUNT};
use crate::timers::TimerRegistry;
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Host text-to-speech capability
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Stops the utterance currently being spoken, if any. Must not block.
    fn cancel(&self);

    /// Speaks `text`, returning once playback ends or is cancelled.
    async fn speak(&self, text: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncerState {
    Idle,
    Scheduled { pending: usize },
}

pub struct Announcer {
    synth: Arc<dyn SpeechSynthesizer>,
    // Keyed by repeat index of the current announcement
    timers: TimerRegistry<u32>,
    // Held for the duration of an utterance
    speech_gate: Arc<Mutex<()>>,
    // Ticket of the most recently fired utterance
    latest: Arc<AtomicU64>,
    seq: AtomicU64,
}

impl Announcer {
    pub fn new(synth: Arc<dyn SpeechSynthesizer>) -> Self {
        Self {
            synth,
            timers: TimerRegistry::new("announcer"),
            speech_gate: Arc::new(Mutex::new(())),
            latest: Arc::new(AtomicU64::new(0)),
            seq: AtomicU64::new(0),
        }
    }

    /// Replaces any pending repeats with the utterances of `request`.
    ///
    /// The i-th utterance fires `i * repeat_interval` after this call. Each one
    /// interrupts whatever is being spoken before it starts; an utterance
    /// still waiting for the speaker when a newer one fires is dropped.
    pub fn announce(&self, request: AnnouncementRequest) {
        let replaced = self.timers.cancel_all();
        let announcement = self.seq.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "announcer",
            announcement,
            text = %request.text,
            repeats = request.repeat_count,
            interval_s = request.repeat_interval_secs,
            replaced,
            "Scheduling announcement"
        );

        for index in 0..request.repeat_count.min(MAX_REPEAT_COUNT) {
            let Some(offset) = request.offset_of(index) else {
                warn!(target: "announcer", announcement, index, "Repeat offset out of range; remaining repeats dropped");
                break;
            };
            let synth = Arc::clone(&self.synth);
            let gate = Arc::clone(&self.speech_gate);
            let latest = Arc::clone(&self.latest);
            let text = request.text.clone();

            self.timers.schedule(index, offset, async move {
                let ticket = latest.fetch_add(1, Ordering::SeqCst) + 1;
                synth.cancel();
                let _speaking = gate.lock().await;
                // A newer utterance fired while this one waited
                if latest.load(Ordering::SeqCst) != ticket {
                    debug!(target: "announcer", announcement, index, "Superseded before speaking");
                    return;
                }
                debug!(target: "announcer", announcement, index, "Speaking");
                if let Err(e) = synth.speak(&text).await {
                    warn!(target: "announcer", announcement, index, error = %e, "Speech synthesis failed");
                }
            });
        }
    }

    /// Cancels repeats that have not fired yet. Utterances already started
    /// are left alone.
    pub fn cancel_pending(&self) -> usize {
        self.timers.cancel_all()
    }

    /// Teardown: cancels pending repeats and interrupts current speech.
    pub fn stop(&self) {
        let cancelled = self.timers.cancel_all();
        self.latest.fetch_add(1, Ordering::SeqCst);
        self.synth.cancel();
        debug!(target: "announcer", cancelled, "Announcer stopped");
    }

    pub fn state(&self) -> AnnouncerState {
        match self.timers.pending() {
            0 => AnnouncerState::Idle,
            pending => AnnouncerState::Scheduled { pending },
        }
    }
}
