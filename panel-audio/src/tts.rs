//! Command-line speech synthesis for the public panel.
//!
//! `CommandSpeaker` implements `SpeechSynthesizer` on top of local CLI
//! engines with graceful degradation:
//! - Prefer Piper (higher quality, requires voice model)
//! - Fallback to espeak-ng (widely available)
//! - If neither is present, logs the text and returns OK
//!
//! Env overrides:
//! - PIPER_BIN, PIPER_VOICE, PIPER_VOICE_DIR
//! - ESPEAK_BIN
//! - TTS_VOICE, TTS_RATE, TTS_VOLUME, TTS_PLAYER
//! - TTS_TIMEOUT_MS, TTS_TEMP_DIR, TTS_TOPIC
//!
//! When built with an `EventBus`, emits observability events on the `tts`
//! topic: tts.start, tts.done, tts.cancelled, tts.error

use crate::utils::{
    gen_id, get_from_env_or_path, get_from_path, is_executable_name, now_ms, scale_wav_pcm16,
};
use async_trait::async_trait;
use qpanel_core::{Event, EventBus, PanelError, Result, SpeechSynthesizer};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct TtsSpeakerConfig {
    pub temp_dir: PathBuf,
    pub topic: String,
    pub timeout_ms: u64,
    pub sample_rate: u32,
    pub piper_bin: Option<PathBuf>,
    pub piper_voice: Option<PathBuf>,
    pub piper_voice_dir: Option<PathBuf>,
    pub espeak_bin: Option<PathBuf>,
    /// Piper voice name or espeak voice code
    pub voice: String,
    pub rate: f32,
    pub volume: f32,
    pub player: Option<String>,
}

impl Default for TtsSpeakerConfig {
    fn default() -> Self {
        let temp_dir = std::env::var("TTS_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        let topic = std::env::var("TTS_TOPIC").unwrap_or_else(|_| "tts".to_string());
        let timeout_ms = env_parse("TTS_TIMEOUT_MS").unwrap_or(20_000);

        let piper_bin = get_from_env_or_path("PIPER_BIN", "piper");
        let piper_voice = std::env::var("PIPER_VOICE").ok().map(PathBuf::from);
        let piper_voice_dir = std::env::var("PIPER_VOICE_DIR").ok().map(PathBuf::from);
        let espeak_bin =
            get_from_env_or_path("ESPEAK_BIN", "espeak-ng").or_else(|| get_from_path("espeak"));

        Self {
            temp_dir,
            topic,
            timeout_ms,
            sample_rate: 16_000,
            piper_bin,
            piper_voice,
            piper_voice_dir,
            espeak_bin,
            voice: std::env::var("TTS_VOICE").unwrap_or_else(|_| "pt-br".to_string()),
            rate: env_parse("TTS_RATE").unwrap_or(1.0),
            volume: env_parse("TTS_VOLUME").unwrap_or(1.0),
            player: std::env::var("TTS_PLAYER").ok().filter(|p| !p.is_empty()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TtsEngine {
    Piper { voice: PathBuf },
    Espeak,
    None,
}

impl fmt::Display for TtsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TtsEngine::Piper { .. } => write!(f, "piper"),
            TtsEngine::Espeak => write!(f, "espeak-ng"),
            TtsEngine::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Cancelled,
}

/// Speaks through Piper or espeak-ng child processes.
///
/// Only one utterance plays at a time: `cancel` kills the running child and a
/// new `speak` interrupts the previous one.
pub struct CommandSpeaker {
    cfg: TtsSpeakerConfig,
    engine: TtsEngine,
    player: Option<PathBuf>,
    bus: Option<Arc<EventBus>>,
    current: Mutex<Option<(u64, oneshot::Sender<()>)>>,
    seq: AtomicU64,
}

impl CommandSpeaker {
    pub fn new(cfg: TtsSpeakerConfig) -> Self {
        let engine = select_engine(&cfg);
        let player = select_player(cfg.player.as_deref());
        match &engine {
            TtsEngine::Piper { voice } => {
                info!(target: "tts", bin = ?cfg.piper_bin, voice = ?voice, "Using Piper")
            }
            TtsEngine::Espeak => info!(target: "tts", bin = ?cfg.espeak_bin, "Using espeak-ng"),
            TtsEngine::None => warn!(target: "tts", "No TTS engine detected; announcements go to the log only"),
        }
        if engine != TtsEngine::None && player.is_none() {
            warn!(target: "tts", "No audio player found (aplay, paplay, ffplay)");
        }
        Self {
            cfg,
            engine,
            player,
            bus: None,
            current: Mutex::new(None),
            seq: AtomicU64::new(0),
        }
    }

    /// Publishes tts.* events on `bus`
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn engine(&self) -> &TtsEngine {
        &self.engine
    }

    fn base_metadata(&self) -> HashMap<String, String> {
        let mut meta = HashMap::new();
        meta.insert("engine".to_string(), self.engine.to_string());
        meta.insert("voice".to_string(), self.cfg.voice.clone());
        meta.insert("rate".to_string(), self.cfg.rate.to_string());
        meta.insert("volume".to_string(), self.cfg.volume.to_string());
        meta.insert(
            "player".to_string(),
            self.player
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default(),
        );
        meta
    }

    async fn emit(&self, event_type: &str, metadata: HashMap<String, String>, payload: Vec<u8>) {
        if let Some(bus) = &self.bus {
            let event = Event::new(event_type, "tts", payload).with_metadata(metadata);
            if let Err(e) = bus.publish(&self.cfg.topic, event).await {
                debug!(target: "tts", error = %e, "Failed to publish {}", event_type);
            }
        }
    }

    /// Registers a new utterance, interrupting the previous one.
    fn begin(&self) -> (u64, oneshot::Receiver<()>) {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut current) = self.current.lock() {
            if let Some((_, previous)) = current.replace((id, tx)) {
                let _ = previous.send(());
            }
        }
        (id, rx)
    }

    fn finish(&self, id: u64) {
        if let Ok(mut current) = self.current.lock() {
            if matches!(current.as_ref(), Some((cur, _)) if *cur == id) {
                current.take();
            }
        }
    }

    async fn synth_and_play(
        &self,
        text: &str,
        wav_path: &Path,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<(Outcome, i64, i64)> {
        let synth_start = now_ms();
        let synth = match &self.engine {
            TtsEngine::Piper { voice } => self.piper_command(voice, wav_path),
            TtsEngine::Espeak => self.espeak_command(text, wav_path),
            TtsEngine::None => return Ok((Outcome::Completed, 0, 0)),
        };
        let stdin = matches!(self.engine, TtsEngine::Piper { .. }).then_some(text);
        if run_cancellable(synth, stdin, cancel).await? == Outcome::Cancelled {
            return Ok((Outcome::Cancelled, now_ms() - synth_start, 0));
        }
        let synthesis_ms = now_ms() - synth_start;

        // espeak applies volume itself
        if matches!(self.engine, TtsEngine::Piper { .. }) && (self.cfg.volume - 1.0).abs() > f32::EPSILON {
            if let Err(e) = scale_wav_file(wav_path, self.cfg.volume).await {
                warn!(target: "tts", error = %e, "Failed to scale volume for WAV");
            }
        }

        let play_start = now_ms();
        let Some(player) = &self.player else {
            info!(target: "tts", path = ?wav_path, "No audio player found; skipping playback");
            return Ok((Outcome::Completed, synthesis_ms, 0));
        };
        let outcome = run_cancellable(play_command(player, wav_path), None, cancel).await?;
        Ok((outcome, synthesis_ms, now_ms() - play_start))
    }

    fn piper_command(&self, voice: &Path, out_wav: &Path) -> Command {
        let piper = self.cfg.piper_bin.clone().unwrap_or_else(|| PathBuf::from("piper"));
        let mut cmd = Command::new(piper);
        cmd.arg("-m").arg(voice);
        cmd.arg("-f").arg(out_wav);
        let length_scale = (1.0f32 / self.cfg.rate.clamp(0.5, 2.0)).clamp(0.5, 2.0);
        cmd.arg("--length_scale").arg(format!("{:.2}", length_scale));
        cmd.arg("--sample_rate").arg(self.cfg.sample_rate.to_string());
        cmd
    }

    fn espeak_command(&self, text: &str, out_wav: &Path) -> Command {
        let espeak = self.cfg.espeak_bin.clone().unwrap_or_else(|| PathBuf::from("espeak-ng"));
        let mut cmd = Command::new(espeak);
        let wpm = (160.0 * self.cfg.rate).round().clamp(80.0, 450.0) as i32;
        let amp = (100.0 * self.cfg.volume).round().clamp(50.0, 200.0) as i32;
        if !self.cfg.voice.is_empty() {
            cmd.arg("-v").arg(&self.cfg.voice);
        }
        cmd.arg("-s").arg(wpm.to_string());
        cmd.arg("-a").arg(amp.to_string());
        cmd.arg("-w").arg(out_wav);
        cmd.arg(text);
        cmd
    }
}

#[async_trait]
impl SpeechSynthesizer for CommandSpeaker {
    fn cancel(&self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some((id, tx)) = current.take() {
                debug!(target: "tts", utterance = id, "Cancelling utterance");
                let _ = tx.send(());
            }
        }
    }

    async fn speak(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let meta = self.base_metadata();
        self.emit("tts.start", meta.clone(), text.as_bytes().to_vec())
            .await;

        if self.engine == TtsEngine::None {
            info!(target: "tts", text = %text, "Announcement");
            let mut meta_done = meta;
            meta_done.insert("no_engine".into(), "true".into());
            self.emit("tts.done", meta_done, text.as_bytes().to_vec())
                .await;
            return Ok(());
        }

        let (id, mut cancel) = self.begin();
        let wav_path = self.cfg.temp_dir.join(format!("panel_tts_{}.wav", gen_id()));
        let t0 = now_ms();

        let result = timeout(
            Duration::from_millis(self.cfg.timeout_ms),
            self.synth_and_play(text, &wav_path, &mut cancel),
        )
        .await;
        self.finish(id);
        if let Err(e) = tokio::fs::remove_file(&wav_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(target: "tts", path = ?wav_path, error = %e, "Failed to remove WAV");
            }
        }

        match result {
            Ok(Ok((Outcome::Completed, synthesis_ms, playback_ms))) => {
                let mut meta_done = meta;
                meta_done.insert("synthesis_ms".into(), synthesis_ms.to_string());
                meta_done.insert("playback_ms".into(), playback_ms.to_string());
                meta_done.insert("total_ms".into(), (now_ms() - t0).to_string());
                self.emit("tts.done", meta_done, Vec::new()).await;
                Ok(())
            }
            Ok(Ok((Outcome::Cancelled, _, _))) => {
                debug!(target: "tts", utterance = id, "Utterance interrupted");
                self.emit("tts.cancelled", meta, Vec::new()).await;
                Ok(())
            }
            Ok(Err(err)) => {
                let mut meta_err = meta;
                meta_err.insert("error".to_string(), err.to_string());
                self.emit("tts.error", meta_err, Vec::new()).await;
                Err(err)
            }
            Err(_) => {
                let mut meta_err = meta;
                meta_err.insert("timeout_ms".into(), self.cfg.timeout_ms.to_string());
                self.emit("tts.error", meta_err, Vec::new()).await;
                Err(PanelError::SpeechError(format!(
                    "speech timed out after {}ms",
                    self.cfg.timeout_ms
                )))
            }
        }
    }
}

/// Runs `cmd` to completion unless `cancel` fires first, in which case the
/// child is killed.
async fn run_cancellable(
    mut cmd: Command,
    stdin: Option<&str>,
    cancel: &mut oneshot::Receiver<()>,
) -> Result<Outcome> {
    cmd.kill_on_drop(true)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    debug!(target: "tts", command = ?cmd, "Running");

    let mut child = cmd.spawn()?;
    if let (Some(text), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(text.as_bytes()).await?;
        // Closing stdin ends the input
        drop(pipe);
    }

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if status.success() {
                Ok(Outcome::Completed)
            } else {
                Err(PanelError::SpeechError(format!("speech command exited with {}", status)))
            }
        }
        _ = cancel => {
            let _ = child.kill().await;
            Ok(Outcome::Cancelled)
        }
    }
}

fn play_command(player: &Path, wav_path: &Path) -> Command {
    let mut cmd = Command::new(player);
    if is_executable_name(player, "ffplay") {
        cmd.arg("-autoexit").arg("-nodisp").arg("-loglevel").arg("quiet");
    }
    cmd.arg(wav_path);
    cmd
}

async fn scale_wav_file(path: &Path, gain: f32) -> std::io::Result<()> {
    let mut buf = tokio::fs::read(path).await?;
    if scale_wav_pcm16(&mut buf, gain) {
        tokio::fs::write(path, &buf).await?;
    }
    Ok(())
}

fn select_engine(cfg: &TtsSpeakerConfig) -> TtsEngine {
    if cfg.piper_bin.is_some() {
        if let Some(voice) = resolve_piper_voice_path(cfg) {
            return TtsEngine::Piper { voice };
        }
        debug!(target: "tts", "Piper found without a voice model; skipping");
    }
    if cfg.espeak_bin.is_some() {
        return TtsEngine::Espeak;
    }
    TtsEngine::None
}

fn resolve_piper_voice_path(cfg: &TtsSpeakerConfig) -> Option<PathBuf> {
    if let Some(v) = &cfg.piper_voice {
        return Some(v.clone());
    }
    if cfg.voice.is_empty() {
        return None;
    }
    let named = PathBuf::from(&cfg.voice);
    if named.exists() {
        return Some(named);
    }
    let dir = cfg.piper_voice_dir.as_ref()?;
    let candidate = dir.join(&cfg.voice);
    if candidate.exists() {
        return Some(candidate);
    }
    ["onnx", "onnx.gz"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", cfg.voice, ext)))
        .find(|c| c.exists())
}

fn select_player(pref: Option<&str>) -> Option<PathBuf> {
    pref.and_then(get_from_path)
        .or_else(|| get_from_path("aplay"))
        .or_else(|| get_from_path("paplay"))
        .or_else(|| get_from_path("ffplay"))
}
