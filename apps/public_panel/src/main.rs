mod board;
mod config;

use config::{PublicPanelConfig, SourceKind};
use qpanel_audio::CommandSpeaker;
use qpanel_core::{
    BusSource, CallSource, EventBus, LaunchParams, LaunchWarning, PanelRuntime,
    PanelRuntimeConfig, StompSource,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging / tracing
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,qpanel_core=info,public_panel=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    // Load configuration (defaults + env + optional TOML overlay)
    let cfg = PublicPanelConfig::load();

    // Launch parameters: PANEL_QUERY or first argument, either a query string or a full URL
    let raw_query = std::env::var("PANEL_QUERY")
        .ok()
        .or_else(|| std::env::args().nth(1))
        .unwrap_or_default();
    let launch = if raw_query.contains("://") {
        LaunchParams::from_url(&raw_query)?
    } else {
        LaunchParams::from_query(&raw_query)
    };
    let mut warnings = launch.warnings();
    if cfg.panel.source == SourceKind::Bus {
        // The local feed needs no credential
        warnings.retain(|w| *w != LaunchWarning::MissingToken);
    }
    for w in &warnings {
        warn!(target: "public_panel", "{}", w);
    }

    info!(
        target: "public_panel",
        queues = ?launch.queues,
        source = ?cfg.panel.source,
        "Starting public panel"
    );

    let bus = Arc::new(EventBus::new());

    let mut feeder: Option<JoinHandle<()>> = None;
    let source: Arc<dyn CallSource> = match cfg.panel.source {
        SourceKind::Stomp => {
            let mut stomp = cfg.stomp.clone();
            if launch.token.is_some() {
                stomp.token = launch.token.clone();
            }
            Arc::new(StompSource::start(stomp)?)
        }
        SourceKind::Bus => {
            let source = Arc::new(BusSource::new(Arc::clone(&bus)));
            feeder = Some(spawn_stdin_feed(Arc::clone(&source), launch.queues.clone()));
            source
        }
    };

    let speaker = Arc::new(CommandSpeaker::new(cfg.tts.clone()).with_event_bus(Arc::clone(&bus)));

    let runtime = PanelRuntime::new(
        PanelRuntimeConfig {
            queues: launch.queues.clone(),
            reconciler: cfg.reconciler_config(),
        },
        source,
        speaker,
    );
    runtime.start().await?;

    let mut changes = runtime.reconciler().subscribe_changes();
    let mut connected = runtime.watch_connected();
    let draw = |connected: bool| {
        let text = board::render(
            &runtime.reconciler().views(),
            connected,
            &warnings,
            &chrono::Local,
        );
        println!("{}", text);
    };
    draw(runtime.is_connected());

    // Ctrl+C handler to shutdown gracefully
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(target: "public_panel", "Shutting down...");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                draw(runtime.is_connected());
            }
            changed = connected.changed() => {
                if changed.is_err() {
                    break;
                }
                let up = *connected.borrow_and_update();
                if up {
                    info!(target: "public_panel", "Connected to call source");
                } else {
                    warn!(target: "public_panel", "Call source disconnected; reconnecting");
                }
                draw(up);
            }
        }
    }

    if let Some(feeder) = feeder {
        feeder.abort();
    }
    runtime.shutdown().await?;
    bus.shutdown().await?;
    Ok(())
}

/// Publishes JSON lines from stdin as call messages.
///
/// A line is either `<queue> <json>` or bare JSON, which goes to the first
/// configured queue.
fn spawn_stdin_feed(source: Arc<BusSource>, queues: Vec<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (queue, payload) = match line.split_once(char::is_whitespace) {
                Some((queue, rest)) if !queue.starts_with('{') => (queue.to_string(), rest.trim()),
                _ => match queues.first() {
                    Some(queue) => (queue.clone(), line),
                    None => {
                        warn!(target: "public_panel", "No queue configured for stdin message");
                        continue;
                    }
                },
            };
            if let Err(e) = source.publish(&queue, payload.as_bytes().to_vec()).await {
                warn!(target: "public_panel", queue = %queue, error = %e, "Failed to publish stdin message");
            }
        }
        info!(target: "public_panel", "stdin feed closed");
    })
}
