use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use qpanel_audio::TtsSpeakerConfig;
use qpanel_core::{HighlightScope, ReconcilerConfig, StompSourceConfig};
use serde::Deserialize;

/// Where call messages come from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Q-Manager broker over STOMP/WebSocket
    #[default]
    Stomp,
    /// In-process bus fed with JSON lines from stdin
    Bus,
}

impl SourceKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stomp" => Some(SourceKind::Stomp),
            "bus" | "stdin" => Some(SourceKind::Bus),
            _ => None,
        }
    }
}

/// Board behaviour
#[derive(Clone, Debug)]
pub struct PanelConfig {
    pub source: SourceKind,
    pub display_secs: u64,
    pub repeat_interval_secs: u64,
    pub single_call_repeats: u32,
    pub highlight_scope: HighlightScope,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            source: std::env::var("PANEL_SOURCE")
                .ok()
                .and_then(|s| SourceKind::parse(&s))
                .unwrap_or_default(),
            display_secs: env_parse("PANEL_DISPLAY_SECS").unwrap_or(15),
            repeat_interval_secs: env_parse("PANEL_REPEAT_INTERVAL_SECS").unwrap_or(5),
            single_call_repeats: env_parse("PANEL_SINGLE_CALL_REPEATS").unwrap_or(1),
            highlight_scope: match std::env::var("PANEL_HIGHLIGHT_SCOPE").ok().as_deref() {
                Some("panel") => HighlightScope::Panel,
                _ => HighlightScope::Queue,
            },
        }
    }
}

/// High-level configuration for the public panel
#[derive(Clone, Debug, Default)]
pub struct PublicPanelConfig {
    pub panel: PanelConfig,
    pub stomp: StompSourceConfig,
    pub tts: TtsSpeakerConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl PublicPanelConfig {
    /// Load configuration from a TOML file (path via PUBLIC_PANEL_CONFIG or ./public_panel.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path =
            std::env::var("PUBLIC_PANEL_CONFIG").unwrap_or_else(|_| "public_panel.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "public_panel", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match Self::overlay_toml(&s, default.clone()) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(target: "public_panel", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "public_panel", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    pub fn overlay_toml(raw: &str, base: Self) -> Result<Self, toml::de::Error> {
        let t = toml::from_str::<PublicPanelToml>(raw)?;
        Ok(t.overlay(base))
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            display_duration: Duration::from_secs(self.panel.display_secs.max(1)),
            repeat_interval: Duration::from_secs(self.panel.repeat_interval_secs.max(1)),
            single_call_repeats: self.panel.single_call_repeats.max(1),
            highlight_scope: self.panel.highlight_scope,
        }
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, Deserialize)]
struct PublicPanelToml {
    pub panel: Option<PanelToml>,
    pub stomp: Option<StompToml>,
    pub tts: Option<TtsToml>,
}

impl PublicPanelToml {
    fn overlay(self, mut base: PublicPanelConfig) -> PublicPanelConfig {
        if let Some(p) = self.panel {
            p.apply(&mut base.panel);
        }
        if let Some(s) = self.stomp {
            s.apply(&mut base.stomp);
        }
        if let Some(t) = self.tts {
            t.apply(&mut base.tts);
        }
        base
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PanelToml {
    pub source: Option<SourceKind>,
    pub display_secs: Option<u64>,
    pub repeat_interval_secs: Option<u64>,
    pub single_call_repeats: Option<u32>,
    pub highlight_scope: Option<HighlightScope>,
}
impl PanelToml {
    fn apply(self, p: &mut PanelConfig) {
        if let Some(x) = self.source {
            p.source = x;
        }
        if let Some(x) = self.display_secs {
            p.display_secs = x;
        }
        if let Some(x) = self.repeat_interval_secs {
            p.repeat_interval_secs = x;
        }
        if let Some(x) = self.single_call_repeats {
            p.single_call_repeats = x;
        }
        if let Some(x) = self.highlight_scope {
            p.highlight_scope = x;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StompToml {
    pub url: Option<String>,
    pub token: Option<String>,
    pub host: Option<String>,
    pub destination_template: Option<String>,
    pub heartbeat_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub reconnect_initial_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
}
impl StompToml {
    fn apply(self, s: &mut StompSourceConfig) {
        if let Some(x) = self.url {
            s.url = x;
        }
        if let Some(x) = self.token.filter(|t| !t.is_empty()) {
            s.token = Some(x);
        }
        if let Some(x) = self.host {
            s.host = Some(x);
        }
        if let Some(x) = self.destination_template {
            s.destination_template = x;
        }
        if let Some(x) = self.heartbeat_ms {
            s.heartbeat_ms = x;
        }
        if let Some(x) = self.connect_timeout_ms {
            s.connect_timeout_ms = x;
        }
        if let Some(x) = self.reconnect_initial_ms {
            s.reconnect_initial_ms = x.max(1);
        }
        if let Some(x) = self.reconnect_max_ms {
            s.reconnect_max_ms = x;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TtsToml {
    pub voice: Option<String>,
    pub rate: Option<f32>,
    pub volume: Option<f32>,
    pub sample_rate: Option<u32>,
    pub player: Option<String>,
    pub piper_voice: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
}
impl TtsToml {
    fn apply(self, t: &mut TtsSpeakerConfig) {
        if let Some(x) = self.voice {
            t.voice = x;
        }
        if let Some(x) = self.rate {
            t.rate = x.clamp(0.5, 2.0);
        }
        if let Some(x) = self.volume {
            t.volume = x.clamp(0.5, 2.0);
        }
        if let Some(x) = self.sample_rate {
            t.sample_rate = x;
        }
        if let Some(x) = self.player {
            t.player = Some(x);
        }
        if let Some(x) = self.piper_voice {
            t.piper_voice = Some(x);
        }
        if let Some(x) = self.timeout_ms {
            t.timeout_ms = x;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overlays_only_given_keys() {
        let raw = r#"
            [panel]
            source = "bus"
            display_secs = 20
            highlight_scope = "panel"

            [stomp]
            url = "ws://qmanager.local/ws"
            destination_template = "/topic/painel/{queue}"

            [tts]
            voice = "pt_BR-faber-medium"
            volume = 5.0
        "#;
        let base = PublicPanelConfig::default();
        let cfg = PublicPanelConfig::overlay_toml(raw, base.clone()).unwrap();

        assert_eq!(cfg.panel.source, SourceKind::Bus);
        assert_eq!(cfg.panel.display_secs, 20);
        assert_eq!(cfg.panel.highlight_scope, HighlightScope::Panel);
        assert_eq!(cfg.panel.repeat_interval_secs, base.panel.repeat_interval_secs);
        assert_eq!(cfg.stomp.url, "ws://qmanager.local/ws");
        assert_eq!(cfg.stomp.destination_for("4"), "/topic/painel/4");
        assert_eq!(cfg.stomp.heartbeat_ms, base.stomp.heartbeat_ms);
        assert_eq!(cfg.tts.voice, "pt_BR-faber-medium");
        assert_eq!(cfg.tts.volume, 2.0);

        let rc = cfg.reconciler_config();
        assert_eq!(rc.display_duration, Duration::from_secs(20));
        assert_eq!(rc.highlight_scope, HighlightScope::Panel);
    }

    #[test]
    fn bad_toml_is_an_error() {
        let err = PublicPanelConfig::overlay_toml("[panel]\nsource = \"carrier-pigeon\"", PublicPanelConfig::default());
        assert!(err.is_err());
    }

    #[test]
    fn source_kind_aliases() {
        assert_eq!(SourceKind::parse(" STOMP "), Some(SourceKind::Stomp));
        assert_eq!(SourceKind::parse("stdin"), Some(SourceKind::Bus));
        assert_eq!(SourceKind::parse("mqtt"), None);
    }
}
