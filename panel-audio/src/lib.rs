// Panel audio capabilities

// Shared audio utilities
pub(crate) mod utils;

pub mod tts;

pub use tts::{CommandSpeaker, TtsEngine, TtsSpeakerConfig};
