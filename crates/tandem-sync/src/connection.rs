//! Resilient WebSocket channel management.
//!
//! One [`ChannelConnection`] owns one logical channel to the server (an event
//! room or the pairing feed): open/close lifecycle, heartbeat liveness,
//! exponential-backoff reconnection, and a bounded outbound buffer that is
//! flushed FIFO after a successful open. Instances are fully independent;
//! several may exist at once (one per open chat view) without coordinating.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, SyncError};
use crate::message::{ClientFrame, ServerFrame};
use crate::router::{FrameCallback, FrameRouter, RouteOutcome};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type TaskSlot = Mutex<Option<JoinHandle<()>>>;

/// Close codes the server uses to reject a credential. Terminal: no
/// automatic reconnection is attempted after one of these.
pub const AUTH_CLOSE_CODES: &[u16] = &[1008, 4001];

/// Connection manager tuning knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Window for the open confirmation, and for a pong answering our ping.
    pub connect_timeout: Duration,
    /// Interval between self-initiated liveness probes.
    pub heartbeat_interval: Duration,
    /// First reconnect delay; doubles per consecutive failed attempt.
    pub base_reconnect_delay: Duration,
    /// Cap on the reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up.
    pub max_reconnect_attempts: u32,
    /// Capacity of the outbound buffer used while the channel is not open.
    pub outbound_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            base_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            outbound_capacity: 64,
        }
    }
}

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Snapshot of the connection's health, returned by
/// [`ChannelConnection::health`].
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    pub phase: ConnectionPhase,
    /// Consecutive failed attempts since the last successful open.
    pub attempts: u32,
    /// False once a self-initiated ping went unanswered past its window.
    pub healthy: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Produces the channel URL on demand, refreshing the credential if needed.
#[async_trait]
pub trait ChannelUrlProvider: Send + Sync {
    async fn channel_url(&self) -> Result<Url>;
}

/// Fixed-URL provider, for channels whose credential never rotates and for
/// tests.
pub struct StaticChannelUrl(pub Url);

#[async_trait]
impl ChannelUrlProvider for StaticChannelUrl {
    async fn channel_url(&self) -> Result<Url> {
        Ok(self.0.clone())
    }
}

/// Derive a channel URL from the REST base address: keep only the origin
/// (any trailing API path segment is dropped), rewrite `http`→`ws` /
/// `https`→`wss`, then append the resource-scoped path and the credential as
/// a query parameter.
pub fn channel_url(api_base: &str, channel_path: &str, token: &str) -> Result<Url> {
    let base = Url::parse(api_base)?;
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::InvalidUrl(format!(
                "unsupported scheme: {other}"
            )));
        }
    };
    let host = base
        .host_str()
        .ok_or_else(|| SyncError::InvalidUrl(format!("missing host in {api_base}")))?;

    let mut url = Url::parse(&format!("{scheme}://{host}"))?;
    if base.port().is_some()
        && url
            .set_port(base.port())
            .is_err()
    {
        return Err(SyncError::InvalidUrl(format!("cannot set port on {url}")));
    }
    url.set_path(channel_path);
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

struct ChannelState {
    phase: ConnectionPhase,
    attempts: u32,
    /// Set by `disconnect()`; suppresses all automatic reconnection until
    /// the next explicit `connect()`.
    manual_close: bool,
    healthy: bool,
    awaiting_pong: bool,
    last_connected_at: Option<DateTime<Utc>>,
    last_disconnected_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    outbound: VecDeque<Value>,
}

struct Inner {
    config: ConnectionConfig,
    url_provider: Arc<dyn ChannelUrlProvider>,
    router: FrameRouter,
    state: Mutex<ChannelState>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    reader_task: TaskSlot,
    heartbeat_task: TaskSlot,
    reconnect_task: TaskSlot,
}

/// Owns one bidirectional channel to the server.
pub struct ChannelConnection {
    inner: Arc<Inner>,
}

impl ChannelConnection {
    /// Create a manager with default configuration. Does not connect yet.
    pub fn new(url_provider: Arc<dyn ChannelUrlProvider>, on_frame: FrameCallback) -> Self {
        Self::with_config(url_provider, on_frame, ConnectionConfig::default())
    }

    pub fn with_config(
        url_provider: Arc<dyn ChannelUrlProvider>,
        on_frame: FrameCallback,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                url_provider,
                router: FrameRouter::new(on_frame),
                state: Mutex::new(ChannelState {
                    phase: ConnectionPhase::Disconnected,
                    attempts: 0,
                    manual_close: false,
                    healthy: false,
                    awaiting_pong: false,
                    last_connected_at: None,
                    last_disconnected_at: None,
                    last_heartbeat_at: None,
                    last_error: None,
                    outbound: VecDeque::new(),
                }),
                writer: Mutex::new(None),
                reader_task: Mutex::new(None),
                heartbeat_task: Mutex::new(None),
                reconnect_task: Mutex::new(None),
            }),
        }
    }

    /// Open the channel. Idempotent: a manager that is already connecting or
    /// connected ignores the call. A failed open feeds the reconnection
    /// policy like any unexpected close.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if matches!(
                state.phase,
                ConnectionPhase::Connecting | ConnectionPhase::Connected
            ) {
                debug!(phase = ?state.phase, "connect() ignored");
                return Ok(());
            }
            state.manual_close = false;
            state.attempts = 0;
            state.last_error = None;
        }
        // An explicit connect supersedes any pending reconnect timer.
        abort_slot(&self.inner.reconnect_task);
        open_once(&self.inner).await
    }

    /// Close the channel and suppress automatic reconnection until the next
    /// `connect()`. Cancels the heartbeat and any pending reconnect timer.
    pub fn disconnect(&self) {
        let was_open = {
            let mut state = self.inner.state.lock();
            state.manual_close = true;
            let open = matches!(
                state.phase,
                ConnectionPhase::Connecting | ConnectionPhase::Connected
            );
            if open {
                state.last_disconnected_at = Some(Utc::now());
            }
            state.phase = ConnectionPhase::Disconnected;
            state.healthy = false;
            state.awaiting_pong = false;
            open
        };
        if let Some(tx) = self.inner.writer.lock().take() {
            let _ = tx.send(Message::Close(None));
        }
        abort_slot(&self.inner.reconnect_task);
        abort_slot(&self.inner.heartbeat_task);
        abort_slot(&self.inner.reader_task);
        if was_open {
            info!("channel disconnected");
        }
    }

    /// Send an application message. Non-blocking: while the channel is not
    /// open the message is buffered (bounded; the oldest entry is dropped on
    /// overflow) and flushed FIFO after the next successful open.
    pub fn send(&self, message: &Value) -> Result<()> {
        let writer = self.inner.writer.lock().clone();
        if let Some(tx) = writer {
            let text = serde_json::to_string(message)?;
            if tx.send(Message::Text(text.into())).is_ok() {
                return Ok(());
            }
            // Writer just went away; fall through to buffering.
        }

        let mut state = self.inner.state.lock();
        if state.outbound.len() >= self.inner.config.outbound_capacity {
            state.outbound.pop_front();
            warn!(
                capacity = self.inner.config.outbound_capacity,
                "outbound buffer full; dropped oldest message"
            );
        }
        state.outbound.push_back(message.clone());
        Ok(())
    }

    /// Current health snapshot.
    pub fn health(&self) -> ConnectionHealth {
        let state = self.inner.state.lock();
        ConnectionHealth {
            phase: state.phase,
            attempts: state.attempts,
            healthy: state.healthy,
            last_connected_at: state.last_connected_at,
            last_disconnected_at: state.last_disconnected_at,
            last_heartbeat_at: state.last_heartbeat_at,
            last_error: state.last_error.clone(),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.state.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    #[cfg(test)]
    pub(crate) fn buffered_outbound(&self) -> Vec<Value> {
        self.inner.state.lock().outbound.iter().cloned().collect()
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        // Same cancellation as an explicit disconnect, so no timer or task
        // outlives its manager.
        self.disconnect();
    }
}

/// `min(base * 2^(attempt-1), max)` for `attempt >= 1`.
fn backoff_delay(config: &ConnectionConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    config
        .base_reconnect_delay
        .saturating_mul(1u32 << exp)
        .min(config.max_reconnect_delay)
}

fn abort_slot(slot: &TaskSlot) {
    if let Some(handle) = slot.lock().take() {
        handle.abort();
    }
}

/// One connection attempt. On success the read/write/heartbeat tasks are
/// installed and the outbound buffer flushed; on failure the reconnection
/// policy decides whether a retry is scheduled.
async fn open_once(inner: &Arc<Inner>) -> Result<()> {
    {
        let mut state = inner.state.lock();
        if state.manual_close {
            return Err(SyncError::NotConnected);
        }
        if matches!(
            state.phase,
            ConnectionPhase::Connecting | ConnectionPhase::Connected
        ) {
            return Ok(());
        }
        state.phase = ConnectionPhase::Connecting;
    }

    let url = match inner.url_provider.channel_url().await {
        Ok(url) => url,
        Err(err) => return fail_attempt(inner, err),
    };
    debug!(host = url.host_str().unwrap_or("?"), path = url.path(), "opening channel");

    match timeout(inner.config.connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => {
            install(inner, stream);
            Ok(())
        }
        Ok(Err(err)) => {
            let err = classify_handshake_error(err);
            fail_attempt(inner, err)
        }
        Err(_) => fail_attempt(
            inner,
            SyncError::Timeout(format!(
                "no open confirmation within {:?}",
                inner.config.connect_timeout
            )),
        ),
    }
}

/// Handshake rejections carrying an auth status are terminal, like an
/// auth-coded close on an established channel.
fn classify_handshake_error(err: WsError) -> SyncError {
    match &err {
        WsError::Http(response)
            if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
        {
            SyncError::AuthRejected(format!("handshake rejected: {}", response.status()))
        }
        _ => SyncError::WebSocket(err.to_string()),
    }
}

fn fail_attempt(inner: &Arc<Inner>, err: SyncError) -> Result<()> {
    let auth = matches!(err, SyncError::AuthRejected(_));
    handle_close(inner, auth, err.to_string());
    Err(err)
}

fn install(inner: &Arc<Inner>, stream: WsStream) {
    let (sink, stream) = stream.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    *inner.writer.lock() = Some(tx.clone());

    let queued = {
        let mut state = inner.state.lock();
        state.phase = ConnectionPhase::Connected;
        state.attempts = 0;
        state.healthy = true;
        state.awaiting_pong = false;
        state.last_connected_at = Some(Utc::now());
        state.last_error = None;
        std::mem::take(&mut state.outbound)
    };

    // Writer task ends on its own once every sender is gone.
    tokio::spawn(run_writer(sink, rx));
    *inner.reader_task.lock() = Some(tokio::spawn(run_reader(inner.clone(), stream)));
    *inner.heartbeat_task.lock() = Some(tokio::spawn(run_heartbeat(inner.clone())));

    let flushed = queued.len();
    for message in queued {
        match serde_json::to_string(&message) {
            Ok(text) => {
                let _ = tx.send(Message::Text(text.into()));
            }
            Err(err) => warn!(%err, "dropping unserializable buffered message"),
        }
    }
    if flushed > 0 {
        debug!(count = flushed, "flushed outbound buffer");
    }
    info!("channel connected");
}

async fn run_writer(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() || closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn run_reader(inner: Arc<Inner>, mut stream: SplitStream<WsStream>) {
    while let Some(received) = stream.next().await {
        match received {
            Ok(Message::Text(text)) => match ServerFrame::from_json(&text) {
                Ok(frame) => match inner.router.route(frame) {
                    RouteOutcome::ReplyPong => {
                        send_control(&inner, ClientFrame::Pong);
                    }
                    RouteOutcome::HeartbeatAck => {
                        let mut state = inner.state.lock();
                        state.awaiting_pong = false;
                        state.healthy = true;
                        state.last_heartbeat_at = Some(Utc::now());
                    }
                    RouteOutcome::Delivered | RouteOutcome::Ignored => {}
                },
                Err(err) => debug!(%err, "ignoring unparseable frame"),
            },
            // Transport-level ping; distinct from the application heartbeat.
            Ok(Message::Ping(payload)) => {
                if let Some(tx) = inner.writer.lock().as_ref() {
                    let _ = tx.send(Message::Pong(payload));
                }
            }
            Ok(Message::Close(frame)) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "channel closed by server".to_string());
                let auth = code.is_some_and(|c| AUTH_CLOSE_CODES.contains(&c));
                handle_close(&inner, auth, reason);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                handle_close(&inner, false, format!("transport error: {err}"));
                return;
            }
        }
    }
    handle_close(&inner, false, "channel stream ended".to_string());
}

async fn run_heartbeat(inner: Arc<Inner>) {
    loop {
        tokio::time::sleep(inner.config.heartbeat_interval).await;
        if inner.state.lock().phase != ConnectionPhase::Connected {
            return;
        }
        if !send_control(&inner, ClientFrame::Ping) {
            return;
        }
        inner.state.lock().awaiting_pong = true;
        debug!("heartbeat ping sent");

        tokio::time::sleep(inner.config.connect_timeout).await;
        let missed = {
            let state = inner.state.lock();
            state.phase == ConnectionPhase::Connected && state.awaiting_pong
        };
        if missed {
            inner.state.lock().healthy = false;
            warn!("heartbeat pong missed; forcing close");
            handle_close(&inner, false, "heartbeat timeout".to_string());
            return;
        }
    }
}

fn send_control(inner: &Arc<Inner>, frame: ClientFrame) -> bool {
    let writer = inner.writer.lock().clone();
    match writer {
        Some(tx) => tx.send(Message::Text(frame.to_json().into())).is_ok(),
        None => false,
    }
}

/// Shared teardown for every close path: unexpected close, transport error,
/// handshake failure, open timeout, heartbeat timeout. Decides between
/// scheduling a backoff reconnect and going terminal.
fn handle_close(inner: &Arc<Inner>, auth: bool, reason: String) {
    if let Some(tx) = inner.writer.lock().take() {
        let _ = tx.send(Message::Close(None));
    }
    abort_slot(&inner.heartbeat_task);
    abort_slot(&inner.reader_task);

    let retry = {
        let mut state = inner.state.lock();
        if !matches!(
            state.phase,
            ConnectionPhase::Connecting | ConnectionPhase::Connected
        ) {
            // Already torn down by a racing close path or disconnect().
            return;
        }
        state.healthy = false;
        state.awaiting_pong = false;
        state.last_disconnected_at = Some(Utc::now());
        state.last_error = Some(reason.clone());

        if state.manual_close {
            state.phase = ConnectionPhase::Disconnected;
            None
        } else if auth {
            state.phase = ConnectionPhase::Disconnected;
            warn!(%reason, "authentication rejected; reconnection suppressed");
            None
        } else if state.attempts >= inner.config.max_reconnect_attempts {
            state.phase = ConnectionPhase::Disconnected;
            warn!(
                attempts = state.attempts,
                "reconnect attempts exhausted; staying disconnected"
            );
            None
        } else {
            state.attempts += 1;
            let delay = backoff_delay(&inner.config, state.attempts);
            state.phase = ConnectionPhase::Reconnecting;
            Some((delay, state.attempts))
        }
    };

    if let Some((delay, attempt)) = retry {
        info!(%reason, attempt, ?delay, "channel closed; reconnect scheduled");
        schedule_reconnect(inner.clone(), delay);
    } else {
        info!(%reason, "channel closed");
    }
}

fn schedule_reconnect(inner: Arc<Inner>, delay: Duration) {
    let handle = tokio::spawn({
        let inner = Arc::clone(&inner);
        async move {
            tokio::time::sleep(delay).await;
            // Re-checked here because disconnect() may have raced the timer.
            if inner.state.lock().manual_close {
                return;
            }
            let _ = open_once(&inner).await;
        }
    });
    *inner.reconnect_task.lock() = Some(handle);
}
