// Q-Manager Panel Core Library
// Real-time call reconciliation and announcement runtime

pub mod announcer;
pub mod event;
pub mod launch;
pub mod message;
pub mod model;
pub mod reconciler;
pub mod runtime;
pub mod source;
pub mod timers;
pub(crate) mod utils;

// Export core types
pub use announcer::{Announcer, AnnouncerState, SpeechSynthesizer};
pub use event::{Event, EventBus, EventBusStats, QoSLevel};
pub use launch::{LaunchParams, LaunchWarning};
pub use message::{CallUpdate, SingleCall, Snapshot, SnapshotCall};
pub use model::{
    AnnouncementRequest, CallKey, CallRecord, QueuePanelState, MAX_PARAM_SECS, MAX_RECORDS,
    MAX_REPEAT_COUNT,
};
pub use reconciler::{HighlightScope, Reconciler, ReconcilerConfig};
pub use runtime::{PanelRuntime, PanelRuntimeConfig};
pub use source::{BusSource, CallSource, StompSource, StompSourceConfig, Subscription};
pub use timers::TimerRegistry;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PanelError {
    #[error("Event bus error: {0}")]
    EventBusError(String),

    #[error("Source error: {0}")]
    SourceError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Speech error: {0}")]
    SpeechError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, PanelError>;
