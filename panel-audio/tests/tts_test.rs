use qpanel_audio::{CommandSpeaker, TtsEngine, TtsSpeakerConfig};
use qpanel_core::{EventBus, QoSLevel, Result, SpeechSynthesizer};
use std::sync::Arc;
use std::time::Duration;

fn log_only_config() -> TtsSpeakerConfig {
    TtsSpeakerConfig {
        piper_bin: None,
        piper_voice: None,
        espeak_bin: None,
        topic: "tts.test".to_string(),
        ..TtsSpeakerConfig::default()
    }
}

#[tokio::test]
async fn degrades_to_log_only_without_engines() -> Result<()> {
    let bus = Arc::new(EventBus::new());
    let (_sub, mut rx) = bus
        .subscribe("tts.test".to_string(), vec![], QoSLevel::QosBatched)
        .await?;

    let speaker = CommandSpeaker::new(log_only_config()).with_event_bus(Arc::clone(&bus));
    assert_eq!(speaker.engine(), &TtsEngine::None);

    speaker.speak("Senha A12, Maria, Guichê 3").await?;

    let start = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    assert_eq!(start.r#type, "tts.start");
    assert_eq!(start.source, "tts");
    assert_eq!(start.metadata.get("engine").map(String::as_str), Some("none"));
    assert_eq!(start.payload, "Senha A12, Maria, Guichê 3".as_bytes().to_vec());

    let done = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    assert_eq!(done.r#type, "tts.done");
    assert_eq!(done.metadata.get("no_engine").map(String::as_str), Some("true"));
    Ok(())
}

#[tokio::test]
async fn blank_text_is_silent() -> Result<()> {
    let bus = Arc::new(EventBus::new());
    let (_sub, mut rx) = bus
        .subscribe("tts.test".to_string(), vec![], QoSLevel::QosBatched)
        .await?;
    let speaker = CommandSpeaker::new(log_only_config()).with_event_bus(Arc::clone(&bus));

    speaker.speak("   ").await?;

    let nothing = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(nothing.is_err(), "blank text must not emit events");
    Ok(())
}

#[tokio::test]
async fn cancel_without_utterance_is_noop() -> Result<()> {
    let speaker = CommandSpeaker::new(log_only_config());
    speaker.cancel();
    speaker.speak("Maria, Sala 2").await?;
    speaker.cancel();
    Ok(())
}
