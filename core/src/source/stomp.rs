//! STOMP-over-WebSocket call source.
//!
//! A single driver task owns the socket. Subscribe/unsubscribe requests reach
//! it over a command channel, so subscriptions made while disconnected are
//! simply replayed on the next successful CONNECT. On socket loss the driver
//! flips the connectivity flag, backs off (doubling up to a cap) and
//! reconnects. Heart-beats follow what the broker agreed to on CONNECTED; a
//! broker that offers none is never timed out for being quiet.
//!
//! Env overrides (see `StompSourceConfig::default`):
//! - PANEL_WS_URL, PANEL_TOKEN, PANEL_DESTINATION_TEMPLATE
//! - PANEL_HEARTBEAT_MS

use super::frame::Frame;
use super::{CallSource, Subscription};
use crate::event::Event;
use crate::{PanelError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, Interval};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug)]
pub struct StompSourceConfig {
    /// WebSocket endpoint of the broker (ws:// or wss://)
    pub url: String,
    /// Bearer credential sent on CONNECT
    pub token: Option<String>,
    /// Virtual host; defaults to the URL host
    pub host: Option<String>,
    /// Destination per queue; `{queue}` is replaced by the queue id
    pub destination_template: String,
    /// Heart-beat interval we offer and expect, 0 disables
    pub heartbeat_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for StompSourceConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("PANEL_WS_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "ws://localhost:8080/ws".to_string()),
            token: std::env::var("PANEL_TOKEN").ok().filter(|s| !s.is_empty()),
            host: None,
            destination_template: std::env::var("PANEL_DESTINATION_TEMPLATE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "/topic/fila/{queue}".to_string()),
            heartbeat_ms: std::env::var("PANEL_HEARTBEAT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(10_000),
            connect_timeout_ms: 10_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
        }
    }
}

impl StompSourceConfig {
    pub fn validate(&self) -> Result<Url> {
        let url = Url::parse(&self.url)
            .map_err(|e| PanelError::ConfigError(format!("invalid broker url {}: {}", self.url, e)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(PanelError::ConfigError(format!(
                    "broker url must be ws:// or wss://, got {}://",
                    other
                )))
            }
        }
        if !self.destination_template.contains("{queue}") {
            return Err(PanelError::ConfigError(
                "destination_template must contain {queue}".into(),
            ));
        }
        Ok(url)
    }

    pub fn destination_for(&self, queue_id: &str) -> String {
        self.destination_template.replace("{queue}", queue_id)
    }

    fn virtual_host(&self, url: &Url) -> String {
        self.host
            .clone()
            .or_else(|| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Backoff after `failures` consecutive failed attempts
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u64 << failures.min(16);
        Duration::from_millis(
            self.reconnect_initial_ms
                .saturating_mul(factor)
                .min(self.reconnect_max_ms),
        )
    }

    fn connect_frame(&self, url: &Url) -> Frame {
        let mut frame = Frame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", self.virtual_host(url))
            .header(
                "heart-beat",
                format!("{},{}", self.heartbeat_ms, self.heartbeat_ms),
            );
        if let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) {
            frame = frame.header("Authorization", format!("Bearer {}", token));
        }
        frame
    }
}

enum Command {
    Subscribe {
        id: String,
        queue_id: String,
        destination: String,
        sender: mpsc::Sender<Event>,
    },
    Unsubscribe {
        id: String,
    },
    Shutdown,
}

struct LiveSubscription {
    queue_id: String,
    destination: String,
    sender: mpsc::Sender<Event>,
}

enum SessionEnd {
    Lost,
    Shutdown,
}

/// Heart-beat periods agreed with the broker on CONNECTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    /// How often we send a beat
    pub outgoing: Option<Duration>,
    /// How often the broker promised to send something
    pub incoming: Option<Duration>,
}

impl HeartBeat {
    /// Combines our `offered_ms` (used for both directions) with the broker's
    /// `heart-beat:sx,sy` header. A zero on either side disables that
    /// direction; an absent or unreadable header means the broker sends none.
    pub fn negotiate(offered_ms: u64, server: Option<&str>) -> Self {
        let (sx, sy) = server
            .and_then(|raw| raw.split_once(','))
            .and_then(|(sx, sy)| {
                Some((sx.trim().parse::<u64>().ok()?, sy.trim().parse::<u64>().ok()?))
            })
            .unwrap_or((0, 0));
        let period = |ours: u64, theirs: u64| {
            (ours > 0 && theirs > 0).then(|| Duration::from_millis(ours.max(theirs)))
        };
        Self {
            outgoing: period(offered_ms, sy),
            incoming: period(offered_ms, sx),
        }
    }
}

pub struct StompSource {
    config: StompSourceConfig,
    commands: mpsc::UnboundedSender<Command>,
    connected: watch::Receiver<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl StompSource {
    /// Validates the config and starts the connection driver.
    pub fn start(config: StompSourceConfig) -> Result<Self> {
        let url = config.validate()?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected) = watch::channel(false);

        let driver_cfg = config.clone();
        let driver = tokio::spawn(drive(driver_cfg, url, command_rx, connected_tx));
        info!(target: "stomp", url = %config.url, "STOMP source started");

        Ok(Self {
            config,
            commands,
            connected,
            driver: Mutex::new(Some(driver)),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &StompSourceConfig {
        &self.config
    }

    /// Sends DISCONNECT and stops the driver.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = driver {
            if timeout(Duration::from_secs(2), handle).await.is_err() {
                warn!(target: "stomp", "Driver did not stop in time");
            }
        }
    }
}

impl Drop for StompSource {
    fn drop(&mut self) {
        if let Some(handle) = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl CallSource for StompSource {
    async fn subscribe(&self, queue_id: &str) -> Result<Subscription> {
        let id = format!("sub-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let destination = self.config.destination_for(queue_id);
        let (sender, receiver) = mpsc::channel(256);

        self.commands
            .send(Command::Subscribe {
                id: id.clone(),
                queue_id: queue_id.to_string(),
                destination,
                sender,
            })
            .map_err(|_| PanelError::SourceError("STOMP driver is not running".into()))?;

        let commands = self.commands.clone();
        Ok(Subscription::new(queue_id, receiver, move || {
            let _ = commands.send(Command::Unsubscribe { id });
        }))
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }
}

async fn drive(
    config: StompSourceConfig,
    url: Url,
    mut commands: mpsc::UnboundedReceiver<Command>,
    connected: watch::Sender<bool>,
) {
    let mut subs: HashMap<String, LiveSubscription> = HashMap::new();
    let mut failures: u32 = 0;

    loop {
        match open_session(&config, &url).await {
            Ok((socket, heart_beat)) => {
                failures = 0;
                connected.send_replace(true);
                info!(target: "stomp", url = %url, subscriptions = subs.len(), "Connected to broker");

                let end = run_session(socket, heart_beat, &mut subs, &mut commands).await;
                connected.send_replace(false);
                if let SessionEnd::Shutdown = end {
                    info!(target: "stomp", "STOMP source stopped");
                    return;
                }
                warn!(target: "stomp", "Connection to broker lost");
            }
            Err(e) => {
                warn!(target: "stomp", error = %e, attempt = failures + 1, "Broker connection failed");
            }
        }

        // Keep bookkeeping subscriptions while waiting to reconnect
        let wait = config.backoff(failures);
        failures = failures.saturating_add(1);
        debug!(target: "stomp", wait_ms = wait.as_millis() as u64, "Reconnecting after backoff");
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                cmd = commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return,
                    Some(cmd) => {
                        apply_offline(&mut subs, cmd);
                    }
                },
            }
        }
    }
}

fn apply_offline(subs: &mut HashMap<String, LiveSubscription>, cmd: Command) {
    match cmd {
        Command::Subscribe {
            id,
            queue_id,
            destination,
            sender,
        } => {
            subs.insert(
                id,
                LiveSubscription {
                    queue_id,
                    destination,
                    sender,
                },
            );
        }
        Command::Unsubscribe { id } => {
            subs.remove(&id);
        }
        Command::Shutdown => {}
    }
}

async fn open_session(config: &StompSourceConfig, url: &Url) -> Result<(Socket, HeartBeat)> {
    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
    let (mut socket, _response) = timeout(connect_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| PanelError::TransportError("WebSocket connect timed out".into()))?
        .map_err(|e| PanelError::TransportError(e.to_string()))?;

    socket
        .send(to_message(&config.connect_frame(url)))
        .await
        .map_err(|e| PanelError::TransportError(e.to_string()))?;

    let deadline = Instant::now() + connect_timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, socket.next())
            .await
            .map_err(|_| PanelError::TransportError("no CONNECTED frame".into()))?;
        let data = match next {
            Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
            Some(Ok(Message::Binary(bin))) => bin.to_vec(),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(PanelError::TransportError(e.to_string())),
            None => return Err(PanelError::TransportError("socket closed during CONNECT".into())),
        };
        for frame in Frame::decode_all(&data)? {
            match frame.command.as_str() {
                "CONNECTED" => {
                    let heart_beat = HeartBeat::negotiate(config.heartbeat_ms, frame.get("heart-beat"));
                    debug!(target: "stomp", version = ?frame.get("version"), ?heart_beat, "STOMP session established");
                    return Ok((socket, heart_beat));
                }
                "ERROR" => {
                    return Err(PanelError::SourceError(format!(
                        "broker refused CONNECT: {}",
                        frame.get("message").unwrap_or("no message")
                    )));
                }
                other => debug!(target: "stomp", command = other, "Ignoring frame before CONNECTED"),
            }
        }
    }
}

async fn run_session(
    socket: Socket,
    heart_beat: HeartBeat,
    subs: &mut HashMap<String, LiveSubscription>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();

    for (id, sub) in subs.iter() {
        if let Err(e) = sink.send(to_message(&subscribe_frame(id, &sub.destination))).await {
            warn!(target: "stomp", error = %e, "Failed to replay SUBSCRIBE");
            return SessionEnd::Lost;
        }
        debug!(target: "stomp", subscription = %id, queue = %sub.queue_id, destination = %sub.destination, "Subscribed");
    }

    let mut send_beat = heart_beat.outgoing.map(tokio::time::interval);
    let mut check_beat = heart_beat.incoming.map(tokio::time::interval);
    let silence_limit = heart_beat.incoming.map(|d| d.saturating_mul(3));
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                last_seen = Instant::now();
                let data = match incoming {
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                    Some(Ok(Message::Binary(bin))) => bin.to_vec(),
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(target: "stomp", error = %e, "WebSocket error");
                        return SessionEnd::Lost;
                    }
                };
                let frames = match Frame::decode_all(&data) {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!(target: "stomp", error = %e, "Dropping undecodable frame");
                        continue;
                    }
                };
                for frame in frames {
                    if !dispatch(frame, subs) {
                        return SessionEnd::Lost;
                    }
                }
            }
            cmd = commands.recv() => {
                let frame = match cmd {
                    None | Some(Command::Shutdown) => {
                        let _ = sink.send(to_message(&Frame::new("DISCONNECT"))).await;
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                    Some(Command::Subscribe { id, queue_id, destination, sender }) => {
                        let frame = subscribe_frame(&id, &destination);
                        debug!(target: "stomp", subscription = %id, queue = %queue_id, destination = %destination, "Subscribed");
                        subs.insert(id, LiveSubscription { queue_id, destination, sender });
                        frame
                    }
                    Some(Command::Unsubscribe { id }) => {
                        if subs.remove(&id).is_none() {
                            continue;
                        }
                        debug!(target: "stomp", subscription = %id, "Unsubscribed");
                        Frame::new("UNSUBSCRIBE").header("id", id)
                    }
                };
                if let Err(e) = sink.send(to_message(&frame)).await {
                    warn!(target: "stomp", error = %e, "Failed to send frame");
                    return SessionEnd::Lost;
                }
            }
            _ = tick(&mut send_beat) => {
                if sink.send(Message::Text("\n".to_string().into())).await.is_err() {
                    return SessionEnd::Lost;
                }
            }
            _ = tick(&mut check_beat) => {
                if silence_limit.is_some_and(|limit| last_seen.elapsed() > limit) {
                    warn!(target: "stomp", silent_ms = last_seen.elapsed().as_millis() as u64, "Broker went silent");
                    return SessionEnd::Lost;
                }
            }
        }
    }
}

/// Next tick of an optional interval; never resolves when disabled.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Routes one server frame. Returns false when the session must end.
fn dispatch(frame: Frame, subs: &HashMap<String, LiveSubscription>) -> bool {
    match frame.command.as_str() {
        "MESSAGE" => {
            let Some(sub_id) = frame.get("subscription") else {
                warn!(target: "stomp", "MESSAGE without subscription header");
                return true;
            };
            let Some(sub) = subs.get(sub_id) else {
                debug!(target: "stomp", subscription = %sub_id, "MESSAGE for unknown subscription");
                return true;
            };
            let mut metadata = HashMap::new();
            metadata.insert("queue_id".to_string(), sub.queue_id.clone());
            metadata.insert("destination".to_string(), sub.destination.clone());
            if let Some(id) = frame.get("message-id") {
                metadata.insert("message_id".to_string(), id.to_string());
            }
            let event = Event::new(super::CALL_EVENT, "stomp", frame.body).with_metadata(metadata);
            if sub.sender.try_send(event).is_err() {
                warn!(target: "stomp", queue = %sub.queue_id, "Subscriber lagging or gone; message dropped");
            }
            true
        }
        "ERROR" => {
            warn!(target: "stomp", message = ?frame.get("message"), "Broker sent ERROR");
            false
        }
        "RECEIPT" => true,
        other => {
            debug!(target: "stomp", command = other, "Ignoring frame");
            true
        }
    }
}

fn subscribe_frame(id: &str, destination: &str) -> Frame {
    Frame::new("SUBSCRIBE")
        .header("id", id)
        .header("destination", destination)
        .header("ack", "auto")
}

fn to_message(frame: &Frame) -> Message {
    match String::from_utf8(frame.encode()) {
        Ok(text) => Message::Text(text.into()),
        Err(e) => Message::Binary(e.into_bytes().into()),
    }
}
