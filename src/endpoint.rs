//! Supervised endpoint: connect, heartbeat, reconnect.
//!
//! An [`Endpoint`] owns one background task that keeps a WebSocket
//! connection alive: it dials (through a proxy when configured), performs
//! the upgrade, heartbeats, watches for stalls, and reconnects with
//! capped, jittered exponential backoff until reconnection is disabled or
//! [`Endpoint::stop`] is called.
//!
//! Interaction is by message passing. Application handles push outbound
//! messages into a queue ([`Endpoint::send_text`] and friends) and receive
//! [`Event`]s over a channel; nothing user-visible runs on the supervisor
//! task itself, so application code can never deadlock the transport.
//! Pings and close requests travel on a separate control lane that the
//! supervisor services before queued sends.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::SinkExt;
use tokio::{
    net::TcpStream,
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use url::Url;

use crate::{
    close::CloseCode,
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD},
    proxy::ProxyConfig,
    ws::{self, HandshakeInfo, Options, ReadStep, TcpWebSocket, WebSocket},
    Result, WebSocketError,
};

/// Callback observing wire traffic: `(payload_size, incoming)`.
pub type TrafficTracker = Arc<dyn Fn(usize, bool) + Send + Sync>;

static DEFAULT_TRACKER: OnceLock<Mutex<Option<TrafficTracker>>> = OnceLock::new();

/// Installs (or clears) the process-wide traffic tracker used by endpoints
/// that do not carry their own.
pub fn set_default_traffic_tracker(tracker: Option<TrafficTracker>) {
    *DEFAULT_TRACKER
        .get_or_init(|| Mutex::new(None))
        .lock()
        .expect("tracker mutex") = tracker;
}

fn default_traffic_tracker() -> Option<TrafficTracker> {
    DEFAULT_TRACKER
        .get_or_init(|| Mutex::new(None))
        .lock()
        .expect("tracker mutex")
        .clone()
}

/// Connection lifecycle state, mirroring the browser WebSocket API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Timeouts applied around the transport.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Send a ping whenever this much time passed since the last outbound
    /// frame. `None` disables heartbeats.
    pub ping_interval: Option<Duration>,
    /// Declare the connection dead when no pong answers a ping within this
    /// window. `None` disables the check.
    pub ping_timeout: Option<Duration>,
    /// Close when nothing was read for this long. `None` disables.
    pub idle_timeout: Option<Duration>,
    /// Fail a send that cannot be flushed within this window.
    pub send_timeout: Option<Duration>,
    /// Bound on the close handshake before the socket is force-closed.
    pub close_timeout: Duration,
    /// Bound on connect + upgrade.
    pub handshake_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ping_interval: None,
            ping_timeout: None,
            idle_timeout: None,
            send_timeout: Some(Duration::from_secs(300)),
            close_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Immutable endpoint configuration; everything is fixed once the
/// supervisor starts.
#[derive(Clone)]
pub struct EndpointOptions {
    pub(crate) url: Url,
    pub(crate) headers: hyper::HeaderMap,
    pub(crate) sub_protocols: Vec<String>,
    pub(crate) proxy: Option<ProxyConfig>,
    pub(crate) tls_connector: Option<tokio_rustls::TlsConnector>,
    pub(crate) transport: Options,
    pub(crate) timeouts: Timeouts,
    pub(crate) reconnect: bool,
    pub(crate) min_reconnect_wait: Duration,
    pub(crate) max_reconnect_wait: Duration,
    pub(crate) backpressure_threshold: usize,
    pub(crate) ping_payload: Bytes,
    pub(crate) traffic_tracker: Option<TrafficTracker>,
}

impl EndpointOptions {
    /// Creates options for `url` (`ws://` or `wss://`); rejects other
    /// schemes synchronously, before any socket is opened.
    pub fn new(url: &str) -> Result<Self> {
        let url: Url = url.parse()?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(WebSocketError::InvalidScheme);
        }
        Ok(Self {
            url,
            headers: hyper::HeaderMap::new(),
            sub_protocols: Vec::new(),
            proxy: None,
            tls_connector: None,
            transport: Options::default(),
            timeouts: Timeouts::default(),
            reconnect: true,
            min_reconnect_wait: Duration::from_millis(1),
            max_reconnect_wait: Duration::from_secs(10),
            backpressure_threshold: 0,
            ping_payload: Bytes::new(),
            traffic_tracker: None,
        })
    }

    /// Adds a request header to the upgrade request.
    pub fn with_header(mut self, name: hyper::header::HeaderName, value: &str) -> Result<Self> {
        let value = value
            .parse()
            .map_err(|_| WebSocketError::Proxy(format!("invalid header value for {name}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Offers a sub-protocol; repeat for several, in preference order.
    pub fn with_sub_protocol(mut self, protocol: &str) -> Self {
        self.sub_protocols.push(protocol.to_string());
        self
    }

    /// Routes the connection through a proxy.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Uses a caller-supplied TLS connector for `wss://` instead of the
    /// built-in webpki-roots one.
    pub fn with_tls_connector(mut self, connector: tokio_rustls::TlsConnector) -> Self {
        self.tls_connector = Some(connector);
        self
    }

    /// Transport-level options (limits, compression, fragmentation).
    pub fn with_transport(mut self, transport: Options) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Enables or disables automatic reconnection (on by default).
    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    /// Bounds on the reconnect backoff sleep. Defaults: 1 ms to 10 s.
    pub fn with_reconnect_waits(mut self, min: Duration, max: Duration) -> Self {
        self.min_reconnect_wait = min;
        self.max_reconnect_wait = max;
        self
    }

    /// Queued-bytes threshold for [`Event::Backpressure`]; 0 disables.
    pub fn with_backpressure_threshold(mut self, threshold: usize) -> Self {
        self.backpressure_threshold = threshold;
        self
    }

    /// Payload carried by scheduled heartbeat pings. At most 125 bytes;
    /// larger payloads are rejected here, with no connection opened.
    pub fn with_ping_payload(mut self, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        self.ping_payload = payload;
        Ok(self)
    }

    /// Traffic observer for this endpoint, overriding the process default.
    pub fn with_traffic_tracker(mut self, tracker: TrafficTracker) -> Self {
        self.traffic_tracker = Some(tracker);
        self
    }
}

/// Everything the supervisor reports back to the application.
#[derive(Debug)]
pub enum Event {
    /// The upgrade completed; the connection is usable.
    Open {
        url: String,
        headers: hyper::HeaderMap,
        protocol: Option<String>,
    },
    /// A complete message arrived.
    Message {
        data: Bytes,
        binary: bool,
        /// The payload is raw compressed bytes that failed to inflate; the
        /// connection is closing with 1007.
        decompression_error: bool,
    },
    /// A fragment of a larger message arrived; the message is not complete
    /// yet.
    Fragment,
    /// A ping arrived (it was answered automatically unless disabled).
    Ping { data: Bytes },
    /// A pong arrived.
    Pong { data: Bytes },
    /// The connection closed; with reconnection enabled a new attempt
    /// follows.
    Close {
        code: u16,
        reason: String,
        /// Whether the peer initiated the closure.
        remote: bool,
    },
    /// A connect attempt or live connection failed.
    Error {
        reason: String,
        /// Consecutive failed connect attempts so far.
        retries: u32,
        /// Backoff sleep before the next attempt (zero when not retrying).
        wait: Duration,
        /// HTTP status of a failed upgrade, 0 otherwise.
        http_status: u16,
    },
    /// Queued outbound bytes crossed the configured threshold. Fires once
    /// per crossing, in both directions.
    Backpressure { buffered: usize, active: bool },
}

/// Result of a send call.
#[derive(Debug, Clone, Copy)]
pub struct SendInfo {
    /// Whether the message was accepted for delivery.
    pub success: bool,
    /// Payload size in bytes.
    pub size: usize,
}

impl SendInfo {
    fn failure() -> Self {
        Self {
            success: false,
            size: 0,
        }
    }
}

/// Delivery lane for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePriority {
    /// Normal queue order.
    Normal,
    /// Jumps queued sends; never splits a frame already in flight. Used
    /// internally by pings and close.
    High,
}

/// Snapshot of the endpoint counters. Counters reset on every successful
/// handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub pings_sent: u64,
    pub pings_received: u64,
    pub pongs_sent: u64,
    pub pongs_received: u64,
    /// Time since the current connection opened.
    pub connection_duration: Duration,
}

#[derive(Debug)]
struct StatsCells {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    pings_sent: AtomicU64,
    pings_received: AtomicU64,
    pongs_sent: AtomicU64,
    pongs_received: AtomicU64,
    connection_start: Mutex<Instant>,
}

impl Default for StatsCells {
    fn default() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            pings_received: AtomicU64::new(0),
            pongs_sent: AtomicU64::new(0),
            pongs_received: AtomicU64::new(0),
            connection_start: Mutex::new(Instant::now()),
        }
    }
}

impl StatsCells {
    fn reset(&self) {
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.pings_sent.store(0, Ordering::Relaxed);
        self.pings_received.store(0, Ordering::Relaxed);
        self.pongs_sent.store(0, Ordering::Relaxed);
        self.pongs_received.store(0, Ordering::Relaxed);
        *self.connection_start.lock().expect("stats mutex") = Instant::now();
    }

    fn snapshot(&self) -> Stats {
        Stats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            pings_received: self.pings_received.load(Ordering::Relaxed),
            pongs_sent: self.pongs_sent.load(Ordering::Relaxed),
            pongs_received: self.pongs_received.load(Ordering::Relaxed),
            connection_duration: self
                .connection_start
                .lock()
                .expect("stats mutex")
                .elapsed(),
        }
    }
}

/// What kind of payload an outbound queue entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendKind {
    Text,
    Binary,
}

/// Progress observer for large sends: `(bytes_flushed, total)`.
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

struct Outbound {
    kind: SendKind,
    data: Bytes,
    progress: Option<ProgressFn>,
}

enum Control {
    Ping(Bytes),
    Send(Outbound),
    Close { code: CloseCode, reason: String },
}

#[derive(Clone)]
struct Channels {
    data_tx: mpsc::UnboundedSender<Outbound>,
    control_tx: mpsc::UnboundedSender<Control>,
}

/// Supervisor bookkeeping guarded by one mutex; never held across awaits.
struct Runtime {
    task: Option<JoinHandle<()>>,
    channels: Option<Channels>,
}

struct Inner {
    options: EndpointOptions,
    event_tx: mpsc::UnboundedSender<Event>,
    ready_state: AtomicU8,
    stats: StatsCells,
    buffered: AtomicUsize,
    backpressure_active: AtomicBool,
    stop: AtomicBool,
    stop_notify: Notify,
    runtime: Mutex<Runtime>,
}

impl Inner {
    fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    fn set_state(&self, state: ReadyState) {
        self.ready_state.store(state as u8, Ordering::SeqCst);
    }

    fn state(&self) -> ReadyState {
        ReadyState::from_u8(self.ready_state.load(Ordering::SeqCst))
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn tracker(&self) -> Option<TrafficTracker> {
        self.options
            .traffic_tracker
            .clone()
            .or_else(default_traffic_tracker)
    }

    fn track(&self, size: usize, incoming: bool) {
        if let Some(tracker) = self.tracker() {
            tracker(size, incoming);
        }
    }

    fn add_buffered(&self, size: usize) {
        let now = self.buffered.fetch_add(size, Ordering::SeqCst) + size;
        self.check_backpressure(now);
    }

    fn sub_buffered(&self, size: usize) {
        // Saturating: a reconnect resets the counter while late
        // decrements for the previous connection may still arrive.
        let mut after = 0;
        let _ = self
            .buffered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                after = current.saturating_sub(size);
                Some(after)
            });
        self.check_backpressure(after);
    }

    fn reset_buffered(&self) {
        self.buffered.store(0, Ordering::SeqCst);
        self.check_backpressure(0);
    }

    /// Fires the backpressure event exactly once per threshold crossing.
    fn check_backpressure(&self, current: usize) {
        let threshold = self.options.backpressure_threshold;
        if threshold == 0 {
            return;
        }
        let above = current >= threshold;
        if self.backpressure_active.swap(above, Ordering::SeqCst) != above {
            self.emit(Event::Backpressure {
                buffered: current,
                active: above,
            });
        }
    }

    async fn sleep_interruptible(&self, wait: Duration) {
        tokio::select! {
            _ = self.stop_notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// Handle to a supervised WebSocket connection.
///
/// Cheap to clone; all clones drive the same connection. Dropping every
/// handle does not stop the supervisor; call [`Endpoint::stop`] for that.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    /// Creates the endpoint and its event channel without connecting yet.
    pub fn new(options: EndpointOptions) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            options,
            event_tx,
            ready_state: AtomicU8::new(ReadyState::Closed as u8),
            stats: StatsCells::default(),
            buffered: AtomicUsize::new(0),
            backpressure_active: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            stop_notify: Notify::new(),
            runtime: Mutex::new(Runtime {
                task: None,
                channels: None,
            }),
        });
        (Self { inner }, event_rx)
    }

    /// Creates the endpoint and starts its supervisor.
    pub fn start_new(options: EndpointOptions) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (endpoint, events) = Self::new(options);
        endpoint.start();
        (endpoint, events)
    }

    /// Starts the supervisor task. Idempotent: a running supervisor is
    /// left alone; after [`Endpoint::stop`] this establishes a fresh
    /// connection.
    pub fn start(&self) {
        let mut runtime = self.inner.runtime.lock().expect("runtime mutex");
        if let Some(task) = runtime.task.as_ref() {
            if !task.is_finished() {
                return;
            }
        }

        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        runtime.channels = Some(Channels {
            data_tx,
            control_tx,
        });
        self.inner.stop.store(false, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        runtime.task = Some(tokio::spawn(supervise(inner, data_rx, control_rx)));
    }

    /// Stops with a normal closure.
    pub async fn stop(&self) {
        self.stop_with(CloseCode::Normal, "").await;
    }

    /// Requests a close with `code`/`reason`, wakes any backoff sleep, and
    /// waits for the supervisor to finish. Idempotent.
    pub async fn stop_with(&self, code: CloseCode, reason: &str) {
        self.inner.stop.store(true, Ordering::SeqCst);

        let task = {
            let mut runtime = self.inner.runtime.lock().expect("runtime mutex");
            if let Some(channels) = runtime.channels.as_ref() {
                let _ = channels.control_tx.send(Control::Close {
                    code,
                    reason: reason.to_string(),
                });
            }
            runtime.channels = None;
            runtime.task.take()
        };

        self.inner.stop_notify.notify_one();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.stop.store(false, Ordering::SeqCst);
        self.inner.reset_buffered();
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Bytes accepted by `send*` but not yet flushed to the socket.
    pub fn buffered_amount(&self) -> usize {
        self.inner.buffered.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> Stats {
        self.inner.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    pub fn url(&self) -> &Url {
        &self.inner.options.url
    }

    /// Sends a text message. The payload must be valid UTF-8: invalid
    /// bytes are rejected locally and the connection closes with 1007, as
    /// a peer would do.
    pub fn send_text(&self, data: impl Into<Bytes>) -> SendInfo {
        let data = data.into();
        if std::str::from_utf8(&data).is_err() {
            if let Some(channels) = self.channels() {
                let _ = channels.control_tx.send(Control::Close {
                    code: CloseCode::Invalid,
                    reason: "invalid UTF-8 in outbound text".to_string(),
                });
            }
            return SendInfo::failure();
        }
        self.enqueue(SendKind::Text, data, MessagePriority::Normal, None)
    }

    /// Sends a binary message.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> SendInfo {
        self.enqueue(SendKind::Binary, data.into(), MessagePriority::Normal, None)
    }

    /// Sends a binary message and reports flush progress per fragment,
    /// `(bytes_done, total)`.
    pub fn send_binary_with_progress(
        &self,
        data: impl Into<Bytes>,
        progress: ProgressFn,
    ) -> SendInfo {
        self.enqueue(
            SendKind::Binary,
            data.into(),
            MessagePriority::Normal,
            Some(progress),
        )
    }

    /// Sends with an explicit priority lane.
    pub fn send(&self, data: impl Into<Bytes>, binary: bool, priority: MessagePriority) -> SendInfo {
        let kind = if binary {
            SendKind::Binary
        } else {
            SendKind::Text
        };
        self.enqueue(kind, data.into(), priority, None)
    }

    /// Sends a ping on the high-priority lane. Payload capped at 125
    /// bytes.
    pub fn ping(&self, payload: impl Into<Bytes>) -> SendInfo {
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD || !self.is_connected() {
            return SendInfo::failure();
        }
        let Some(channels) = self.channels() else {
            return SendInfo::failure();
        };
        let size = payload.len();
        if channels.control_tx.send(Control::Ping(payload)).is_err() {
            return SendInfo::failure();
        }
        SendInfo {
            success: true,
            size,
        }
    }

    /// Requests a close without waiting for the supervisor to exit; with
    /// reconnection enabled the endpoint will dial again.
    pub fn close(&self, code: CloseCode, reason: &str) {
        if let Some(channels) = self.channels() {
            let _ = channels.control_tx.send(Control::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    fn channels(&self) -> Option<Channels> {
        self.inner
            .runtime
            .lock()
            .expect("runtime mutex")
            .channels
            .clone()
    }

    fn enqueue(
        &self,
        kind: SendKind,
        data: Bytes,
        priority: MessagePriority,
        progress: Option<ProgressFn>,
    ) -> SendInfo {
        if !self.is_connected() {
            return SendInfo::failure();
        }
        let Some(channels) = self.channels() else {
            return SendInfo::failure();
        };

        let size = data.len();
        let outbound = Outbound {
            kind,
            data,
            progress,
        };

        // Count the bytes before the supervisor can see the message, so
        // its decrement can never race ahead of this increment.
        self.inner.add_buffered(size);
        let accepted = match priority {
            MessagePriority::Normal => channels.data_tx.send(outbound).is_ok(),
            MessagePriority::High => channels.control_tx.send(Control::Send(outbound)).is_ok(),
        };
        if !accepted {
            self.inner.sub_buffered(size);
            return SendInfo::failure();
        }

        SendInfo {
            success: true,
            size,
        }
    }
}

// ================== Supervisor ====================

/// How a connection ended.
struct CloseOutcome {
    code: u16,
    reason: String,
    remote: bool,
}

async fn supervise(
    inner: Arc<Inner>,
    mut data_rx: mpsc::UnboundedReceiver<Outbound>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
) {
    log::debug!("supervisor for {} starting", inner.options.url);
    let mut first_attempt = true;

    'lifecycle: loop {
        // ---- connect loop ----
        let mut retries: u32 = 0;
        let mut wait = Duration::ZERO;
        let (mut ws, info) = loop {
            if inner.stopping() || (!first_attempt && !inner.options.reconnect) {
                break 'lifecycle;
            }
            if !wait.is_zero() {
                inner.sleep_interruptible(wait).await;
                if inner.stopping() {
                    break 'lifecycle;
                }
            }

            first_attempt = false;
            inner.set_state(ReadyState::Connecting);
            match connect_once(&inner.options).await {
                Ok(connected) => break connected,
                Err(err) => {
                    let http_status = match &err {
                        WebSocketError::UpgradeStatus { status, .. } => *status,
                        _ => 0,
                    };
                    if inner.options.reconnect {
                        wait = retry_wait(
                            retries,
                            inner.options.min_reconnect_wait,
                            inner.options.max_reconnect_wait,
                        );
                        retries += 1;
                    }
                    log::warn!(
                        "connect to {} failed (attempt {retries}): {err}",
                        inner.options.url
                    );
                    inner.emit(Event::Error {
                        reason: err.to_string(),
                        retries,
                        wait,
                        http_status,
                    });
                    continue;
                }
            }
        };

        // ---- open ----
        inner.stats.reset();
        inner.set_state(ReadyState::Open);
        log::info!("connected to {}", inner.options.url);
        inner.emit(Event::Open {
            url: inner.options.url.to_string(),
            headers: info.headers,
            protocol: info.protocol,
        });

        let outcome = drive_connection(&inner, &mut ws, &mut data_rx, &mut control_rx).await;

        // Force the socket down if the close handshake left it half-open.
        let _ = tokio::time::timeout(inner.options.timeouts.close_timeout, ws.close()).await;

        inner.set_state(ReadyState::Closed);
        inner.reset_buffered();
        log::info!(
            "connection to {} closed: code={} remote={}",
            inner.options.url,
            outcome.code,
            outcome.remote
        );
        inner.emit(Event::Close {
            code: outcome.code,
            reason: outcome.reason,
            remote: outcome.remote,
        });

        if inner.stopping() || !inner.options.reconnect {
            break;
        }
    }

    inner.set_state(ReadyState::Closed);
    log::debug!("supervisor for {} stopped", inner.options.url);
}

/// Dials, tunnels, wraps TLS, and performs the upgrade, all bounded by the
/// handshake timeout.
async fn connect_once(options: &EndpointOptions) -> Result<(TcpWebSocket, HandshakeInfo)> {
    let attempt = async {
        let (host, port) = ws::host_port(&options.url)?;

        let stream = if let Some(proxy) = options.proxy.as_ref() {
            let mut tcp = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
            let _ = tcp.set_nodelay(true);
            proxy.tunnel(&mut tcp, &host, port).await?;
            ws::wrap_tls(&options.url, &host, tcp, options.tls_connector.clone()).await?
        } else {
            ws::connect_stream(&options.url, options.tls_connector.clone()).await?
        };

        WebSocket::handshake_with_headers(
            &options.url,
            stream,
            options.transport.clone(),
            options.headers.clone(),
            &options.sub_protocols,
        )
        .await
    };

    match tokio::time::timeout(options.timeouts.handshake_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(WebSocketError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "handshake timed out",
        ))),
    }
}

/// Backoff before retry number `retries`: `min(max, min * 2^retries)` plus
/// up to 10% jitter.
fn retry_wait(retries: u32, min: Duration, max: Duration) -> Duration {
    let base = (min.as_secs_f64() * 2f64.powi(retries.min(63) as i32)).min(max.as_secs_f64());
    let jitter = base * 0.1 * rand::random::<f64>();
    Duration::from_secs_f64(base + jitter)
}

fn sleep_at(at: Option<Instant>) -> tokio::time::Sleep {
    tokio::time::sleep_until(at.unwrap_or_else(Instant::now).into())
}

/// Runs one open connection until it ends, one way or another.
async fn drive_connection(
    inner: &Arc<Inner>,
    ws: &mut TcpWebSocket,
    data_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    control_rx: &mut mpsc::UnboundedReceiver<Control>,
) -> CloseOutcome {
    let timeouts = inner.options.timeouts.clone();
    let mut last_write = Instant::now();
    let mut last_read = Instant::now();
    let mut pong_deadline: Option<Instant> = None;

    // Heartbeat right away so a dead peer is noticed without waiting a
    // full interval.
    if timeouts.ping_interval.is_some() {
        if let Err(err) = send_ping(inner, ws, &inner.options.ping_payload).await {
            return error_outcome(inner, err);
        }
        last_write = Instant::now();
        pong_deadline = timeouts.ping_timeout.map(|t| Instant::now() + t);
    }

    loop {
        let ping_at = timeouts.ping_interval.map(|d| last_write + d);
        let idle_at = timeouts.idle_timeout.map(|d| last_read + d);

        tokio::select! {
            biased;

            ctrl = control_rx.recv() => match ctrl {
                Some(Control::Ping(payload)) => {
                    match send_ping(inner, ws, &payload).await {
                        Ok(()) => {
                            last_write = Instant::now();
                            if pong_deadline.is_none() {
                                pong_deadline = timeouts.ping_timeout.map(|t| Instant::now() + t);
                            }
                        }
                        Err(err) => return error_outcome(inner, err),
                    }
                }
                Some(Control::Send(outbound)) => {
                    if let Err(err) = deliver(inner, ws, outbound, &timeouts).await {
                        return error_outcome(inner, err);
                    }
                    last_write = Instant::now();
                }
                Some(Control::Close { code, reason }) => {
                    return close_gracefully(inner, ws, code, &reason, &timeouts).await;
                }
                None => {
                    return close_gracefully(inner, ws, CloseCode::Normal, "", &timeouts).await;
                }
            },

            outbound = data_rx.recv() => match outbound {
                Some(outbound) => {
                    if let Err(err) = deliver(inner, ws, outbound, &timeouts).await {
                        return error_outcome(inner, err);
                    }
                    last_write = Instant::now();
                }
                None => {
                    return close_gracefully(inner, ws, CloseCode::Normal, "", &timeouts).await;
                }
            },

            step = ws.next_step() => match step {
                Ok(ReadStep::Complete(frame)) => {
                    last_read = Instant::now();
                    match frame.opcode {
                        OpCode::Text | OpCode::Binary => {
                            let size = frame.payload.len();
                            inner.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                            inner.stats.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
                            inner.track(size, true);
                            inner.emit(Event::Message {
                                binary: frame.opcode == OpCode::Binary,
                                decompression_error: frame.decompression_failed(),
                                data: frame.payload.freeze(),
                            });
                        }
                        OpCode::Ping => {
                            inner.stats.pings_received.fetch_add(1, Ordering::Relaxed);
                            if !inner.options.transport.disable_auto_pong {
                                inner.stats.pongs_sent.fetch_add(1, Ordering::Relaxed);
                            }
                            inner.emit(Event::Ping { data: frame.payload.freeze() });
                        }
                        OpCode::Pong => {
                            inner.stats.pongs_received.fetch_add(1, Ordering::Relaxed);
                            pong_deadline = None;
                            inner.emit(Event::Pong { data: frame.payload.freeze() });
                        }
                        OpCode::Close => {
                            let code = frame
                                .close_code()
                                .map(u16::from)
                                .unwrap_or(u16::from(CloseCode::Status));
                            let reason = frame
                                .close_reason()
                                .ok()
                                .flatten()
                                .unwrap_or_default()
                                .to_string();

                            // Drain until the mirrored close is flushed and
                            // the stream reports closed.
                            inner.set_state(ReadyState::Closing);
                            let _ = tokio::time::timeout(timeouts.close_timeout, async {
                                while ws.next_step().await.is_ok() {}
                            })
                            .await;

                            return CloseOutcome { code, reason, remote: true };
                        }
                        OpCode::Continuation => {}
                    }
                }
                Ok(ReadStep::Partial) => {
                    last_read = Instant::now();
                    inner.emit(Event::Fragment);
                }
                Err(WebSocketError::ConnectionClosed) => {
                    return CloseOutcome {
                        code: u16::from(CloseCode::Abnormal),
                        reason: "connection closed by peer".to_string(),
                        remote: true,
                    };
                }
                Err(err) => return error_outcome(inner, err),
            },

            _ = sleep_at(ping_at), if ping_at.is_some() => {
                match send_ping(inner, ws, &inner.options.ping_payload).await {
                    Ok(()) => {
                        last_write = Instant::now();
                        if pong_deadline.is_none() {
                            pong_deadline = timeouts.ping_timeout.map(|t| Instant::now() + t);
                        }
                    }
                    Err(err) => return error_outcome(inner, err),
                }
            }

            _ = sleep_at(pong_deadline), if pong_deadline.is_some() => {
                return error_outcome(inner, WebSocketError::PongTimeout);
            }

            _ = sleep_at(idle_at), if idle_at.is_some() => {
                inner.emit(Event::Error {
                    reason: WebSocketError::IdleTimeout.to_string(),
                    retries: 0,
                    wait: Duration::ZERO,
                    http_status: 0,
                });
                return close_gracefully(
                    inner,
                    ws,
                    CloseCode::Normal,
                    "idle timeout",
                    &timeouts,
                )
                .await;
            }
        }
    }
}

/// Writes one queued message, honoring the send timeout and reporting
/// progress per fragment when requested.
async fn deliver(
    inner: &Arc<Inner>,
    ws: &mut TcpWebSocket,
    outbound: Outbound,
    timeouts: &Timeouts,
) -> Result<()> {
    let size = outbound.data.len();

    let write = async {
        match (&outbound.progress, inner.options.transport.fragment_size) {
            (Some(progress), Some(cap)) if size > cap => {
                // Flush fragment by fragment so progress reflects bytes on
                // the wire.
                let mut offset = 0;
                while offset < size {
                    let end = (offset + cap).min(size);
                    let last = end == size;
                    let frame = if offset == 0 {
                        data_frame(outbound.kind, &outbound.data[offset..end]).with_fin(last)
                    } else {
                        Frame::continuation(&outbound.data[offset..end]).with_fin(last)
                    };
                    ws.send(frame).await?;
                    progress(end, size);
                    offset = end;
                }
                Ok(())
            }
            _ => {
                ws.send(data_frame(outbound.kind, &outbound.data)).await?;
                if let Some(progress) = &outbound.progress {
                    progress(size, size);
                }
                Ok(())
            }
        }
    };

    let result: Result<()> = match timeouts.send_timeout {
        Some(timeout) => tokio::time::timeout(timeout, write)
            .await
            .unwrap_or(Err(WebSocketError::SendTimeout)),
        None => write.await,
    };

    inner.sub_buffered(size);
    result?;

    inner.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
    inner
        .stats
        .bytes_sent
        .fetch_add(size as u64, Ordering::Relaxed);
    inner.track(size, false);
    Ok(())
}

fn data_frame(kind: SendKind, data: &[u8]) -> Frame {
    match kind {
        SendKind::Text => Frame::text(data),
        SendKind::Binary => Frame::binary(data),
    }
}

async fn send_ping(inner: &Arc<Inner>, ws: &mut TcpWebSocket, payload: &Bytes) -> Result<()> {
    ws.send(Frame::ping(&payload[..])).await?;
    inner.stats.pings_sent.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Initiates the close handshake and waits (bounded) for the peer's reply.
async fn close_gracefully(
    inner: &Arc<Inner>,
    ws: &mut TcpWebSocket,
    code: CloseCode,
    reason: &str,
    timeouts: &Timeouts,
) -> CloseOutcome {
    inner.set_state(ReadyState::Closing);

    let exchange = async {
        ws.send(Frame::close(code, reason)).await?;
        // Wait for the peer's close (or EOF); frames arriving meanwhile
        // are discarded, no application frames are accepted anymore.
        loop {
            match ws.next_step().await {
                Ok(ReadStep::Complete(frame)) if frame.opcode == OpCode::Close => {
                    // One more pass flushes our side and observes EOF.
                    while ws.next_step().await.is_ok() {}
                    return Ok::<(), WebSocketError>(());
                }
                Ok(_) => continue,
                Err(_) => return Ok(()),
            }
        }
    };

    if tokio::time::timeout(timeouts.close_timeout, exchange)
        .await
        .is_err()
    {
        log::warn!("close handshake timed out, force-closing socket");
    }

    CloseOutcome {
        code: u16::from(code),
        reason: reason.to_string(),
        remote: false,
    }
}

/// Emits an error event and shapes the outcome for a failed connection.
fn error_outcome(inner: &Arc<Inner>, err: WebSocketError) -> CloseOutcome {
    inner.emit(Event::Error {
        reason: err.to_string(),
        retries: 0,
        wait: Duration::ZERO,
        http_status: 0,
    });
    CloseOutcome {
        code: u16::from(err.close_code()),
        reason: err.to_string(),
        remote: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::UpgradeFut;
    use hyper::{body::Incoming, service::service_fn, Request};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    /// What a test peer does with an accepted connection.
    #[derive(Clone, Copy, PartialEq)]
    enum PeerMode {
        /// Echo every data message back.
        Echo,
        /// Accept the upgrade, answer nothing (pongs included).
        Mute,
        /// Collect messages into the given channel.
        Collect,
    }

    struct TestServer {
        addr: SocketAddr,
        received: mpsc::UnboundedReceiver<Frame>,
        _task: JoinHandle<()>,
    }

    async fn spawn_server(mode: PeerMode) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, received) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let seen_tx = seen_tx.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |mut req: Request<Incoming>| {
                        let seen_tx = seen_tx.clone();
                        async move {
                            let options = match mode {
                                PeerMode::Mute => Options::default().without_auto_pong(),
                                _ => Options::default(),
                            };
                            let (response, fut) =
                                crate::ws::WebSocket::upgrade_with_options(&mut req, options)?;
                            tokio::spawn(run_peer(fut, mode, seen_tx));
                            Ok::<_, WebSocketError>(response)
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await;
                });
            }
        });

        TestServer {
            addr,
            received,
            _task: task,
        }
    }

    async fn run_peer(fut: UpgradeFut, mode: PeerMode, seen_tx: mpsc::UnboundedSender<Frame>) {
        let Ok(mut ws) = fut.await else { return };
        loop {
            match ws.next_frame().await {
                Ok(frame) => match frame.opcode {
                    OpCode::Text | OpCode::Binary => match mode {
                        PeerMode::Echo => {
                            let echo = Frame::new(true, frame.opcode, &frame.payload[..]);
                            if ws.send(echo).await.is_err() {
                                break;
                            }
                        }
                        PeerMode::Collect => {
                            let _ = seen_tx.send(frame);
                        }
                        PeerMode::Mute => {}
                    },
                    OpCode::Close => {
                        let _ = seen_tx.send(frame);
                        // Keep polling so the mirrored close flushes.
                    }
                    _ => {
                        let _ = seen_tx.send(frame);
                    }
                },
                Err(_) => break,
            }
        }
    }

    fn options_for(addr: SocketAddr) -> EndpointOptions {
        EndpointOptions::new(&format!("ws://{addr}/live"))
            .unwrap()
            .with_reconnect(false)
    }

    async fn wait_for_open(events: &mut mpsc::UnboundedReceiver<Event>) {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for open")
            {
                Some(Event::Open { .. }) => return,
                Some(_) => continue,
                None => panic!("event channel closed before open"),
            }
        }
    }

    #[tokio::test]
    async fn connects_sends_and_receives() {
        let server = spawn_server(PeerMode::Echo).await;
        let (endpoint, mut events) = Endpoint::new(options_for(server.addr));
        endpoint.start();

        wait_for_open(&mut events).await;
        assert_eq!(endpoint.ready_state(), ReadyState::Open);

        let info = endpoint.send_text("round trip");
        assert!(info.success);
        assert_eq!(info.size, 10);

        loop {
            match events.recv().await.unwrap() {
                Event::Message { data, binary, .. } => {
                    assert!(!binary);
                    assert_eq!(&data[..], b"round trip");
                    break;
                }
                _ => continue,
            }
        }

        let stats = endpoint.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.bytes_sent, 10);

        endpoint.stop().await;
        assert_eq!(endpoint.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn send_before_open_fails_without_side_effects() {
        let (endpoint, _events) = Endpoint::new(
            EndpointOptions::new("ws://127.0.0.1:9/unused").unwrap(),
        );
        let info = endpoint.send_text("nope");
        assert!(!info.success);
        assert_eq!(endpoint.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn invalid_utf8_text_is_rejected_locally() {
        let server = spawn_server(PeerMode::Echo).await;
        let (endpoint, mut events) = Endpoint::new(options_for(server.addr));
        endpoint.start();
        wait_for_open(&mut events).await;

        let info = endpoint.send_text(vec![0xC0u8, 0x80]);
        assert!(!info.success);

        // The connection closes with 1007 like it would for a peer
        // violation.
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for close")
                .expect("events open")
            {
                Event::Close { code, .. } => {
                    assert_eq!(code, 1007);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn reconnect_backoff_is_capped_and_bounded() {
        // Nothing listens on the target port at first.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let min = Duration::from_millis(10);
        let max = Duration::from_millis(160);
        let options = EndpointOptions::new(&format!("ws://{addr}/retry"))
            .unwrap()
            .with_reconnect(true)
            .with_reconnect_waits(min, max);

        let (endpoint, mut events) = Endpoint::new(options);
        endpoint.start();

        let mut waits = Vec::new();
        while waits.len() < 6 {
            match tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("timed out collecting errors")
                .expect("events open")
            {
                Event::Error { retries, wait, .. } => {
                    assert_eq!(retries as usize, waits.len() + 1);
                    waits.push(wait);
                }
                other => panic!("unexpected event while refusing: {other:?}"),
            }
        }

        for (i, wait) in waits.iter().enumerate() {
            let base = (min.as_secs_f64() * 2f64.powi(i as i32)).min(max.as_secs_f64());
            let bound = base * 1.1 + 0.001;
            assert!(
                wait.as_secs_f64() >= base && wait.as_secs_f64() <= bound,
                "attempt {i}: wait {wait:?} outside [{base}, {bound}]"
            );
        }

        // Now accept: the endpoint must connect on a following attempt.
        let server = {
            let listener = TcpListener::bind(addr).await.unwrap();
            let (seen_tx, _received) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let seen_tx = seen_tx.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |mut req: Request<Incoming>| {
                            let seen_tx = seen_tx.clone();
                            async move {
                                let (response, fut) = crate::ws::WebSocket::upgrade(&mut req)?;
                                tokio::spawn(run_peer(fut, PeerMode::Echo, seen_tx));
                                Ok::<_, WebSocketError>(response)
                            }
                        });
                        let _ = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades()
                            .await;
                    });
                }
            })
        };

        wait_for_open(&mut events).await;
        endpoint.stop().await;
        server.abort();
    }

    #[tokio::test]
    async fn missing_pongs_close_the_connection() {
        let server = spawn_server(PeerMode::Mute).await;
        let mut options = options_for(server.addr);
        options.timeouts.ping_interval = Some(Duration::from_millis(100));
        options.timeouts.ping_timeout = Some(Duration::from_millis(200));

        let (endpoint, mut events) = Endpoint::new(options);
        endpoint.start();
        wait_for_open(&mut events).await;

        let started = Instant::now();
        let mut saw_error = false;
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for pong timeout")
                .expect("events open")
            {
                Event::Error { reason, .. } => {
                    assert!(reason.contains("pong"), "reason: {reason}");
                    saw_error = true;
                }
                Event::Close { .. } => break,
                _ => continue,
            }
        }
        assert!(saw_error);
        assert!(started.elapsed() < Duration::from_millis(2500));
        assert_eq!(endpoint.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn cooperating_peer_keeps_the_connection_open() {
        let server = spawn_server(PeerMode::Echo).await;
        let mut options = options_for(server.addr);
        options.timeouts.ping_interval = Some(Duration::from_millis(50));
        options.timeouts.ping_timeout = Some(Duration::from_millis(200));

        let (endpoint, mut events) = Endpoint::new(options);
        endpoint.start();
        wait_for_open(&mut events).await;

        // Several ping/pong cycles must pass without a close.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(endpoint.ready_state(), ReadyState::Open);

        let stats = endpoint.stats();
        assert!(stats.pings_sent >= 2, "pings_sent = {}", stats.pings_sent);
        assert!(stats.pongs_received >= 2);

        endpoint.stop().await;
    }

    #[tokio::test]
    async fn graceful_stop_sends_one_close_with_code_and_reason() {
        let mut server = spawn_server(PeerMode::Collect).await;
        let (endpoint, mut events) = Endpoint::new(options_for(server.addr));
        endpoint.start();
        wait_for_open(&mut events).await;

        endpoint.stop_with(CloseCode::Normal, "bye").await;
        assert_eq!(endpoint.ready_state(), ReadyState::Closed);

        // The peer saw exactly one close frame with our code and reason.
        let close = tokio::time::timeout(Duration::from_secs(5), server.received.recv())
            .await
            .expect("peer never saw close")
            .expect("peer channel");
        assert_eq!(close.opcode, OpCode::Close);
        assert_eq!(close.close_code(), Some(CloseCode::Normal));
        assert_eq!(close.close_reason().unwrap(), Some("bye"));
        assert!(server.received.try_recv().is_err());

        // Restart establishes a fresh connection.
        endpoint.start();
        wait_for_open(&mut events).await;
        assert_eq!(endpoint.ready_state(), ReadyState::Open);
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn concurrent_senders_keep_per_sender_order() {
        let mut server = spawn_server(PeerMode::Collect).await;
        let (endpoint, mut events) = Endpoint::new(options_for(server.addr));
        endpoint.start();
        wait_for_open(&mut events).await;

        let count = 200;
        let a = endpoint.clone();
        let b = endpoint.clone();
        let task_a = tokio::spawn(async move {
            for i in 0..count {
                assert!(a.send_text(format!("a:{i:04}")).success);
                if i % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
        let task_b = tokio::spawn(async move {
            for i in 0..count {
                assert!(b.send_text(format!("b:{i:04}")).success);
                if i % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
        task_a.await.unwrap();
        task_b.await.unwrap();

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        while seen_a.len() + seen_b.len() < 2 * count {
            let frame = tokio::time::timeout(Duration::from_secs(10), server.received.recv())
                .await
                .expect("timed out collecting messages")
                .expect("peer channel");
            let text = String::from_utf8(frame.payload.to_vec()).unwrap();
            match text.split_once(':').unwrap() {
                ("a", n) => seen_a.push(n.parse::<u32>().unwrap()),
                ("b", n) => seen_b.push(n.parse::<u32>().unwrap()),
                _ => panic!("unexpected payload {text}"),
            }
        }

        let expected: Vec<u32> = (0..count as u32).collect();
        assert_eq!(seen_a, expected);
        assert_eq!(seen_b, expected);

        endpoint.stop().await;
    }

    #[tokio::test]
    async fn backpressure_fires_once_per_crossing() {
        let server = spawn_server(PeerMode::Collect).await;
        let options = options_for(server.addr).with_backpressure_threshold(1);
        let (endpoint, mut events) = Endpoint::new(options);
        endpoint.start();
        wait_for_open(&mut events).await;

        assert!(endpoint.send_binary(vec![0u8; 4096]).success);

        let mut activations = 0;
        let mut deactivations = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while deactivations == 0 && Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for backpressure")
                .expect("events open")
            {
                Event::Backpressure { active: true, .. } => activations += 1,
                Event::Backpressure { active: false, .. } => deactivations += 1,
                _ => continue,
            }
        }
        assert_eq!(activations, 1);
        assert_eq!(deactivations, 1);

        endpoint.stop().await;
    }

    #[test]
    fn retry_wait_stays_within_its_bounds() {
        let min = Duration::from_millis(10);
        let max = Duration::from_millis(160);
        for i in 0..12u32 {
            let wait = retry_wait(i, min, max);
            let base = (min.as_secs_f64() * 2f64.powi(i as i32)).min(max.as_secs_f64());
            assert!(wait.as_secs_f64() >= base);
            assert!(wait.as_secs_f64() <= base * 1.1 + f64::EPSILON);
        }
        // The cap holds even for absurd retry counts.
        assert!(retry_wait(80, min, max) <= Duration::from_millis(176));
    }

    #[test]
    fn options_reject_bad_urls_and_oversized_ping_payloads() {
        assert!(EndpointOptions::new("http://example.com").is_err());
        assert!(EndpointOptions::new("not a url").is_err());

        let options = EndpointOptions::new("ws://example.com/s").unwrap();
        assert!(options.clone().with_ping_payload(vec![0u8; 125]).is_ok());
        assert!(matches!(
            options.with_ping_payload(vec![0u8; 126]),
            Err(WebSocketError::ControlFrameTooLarge)
        ));
    }
}
