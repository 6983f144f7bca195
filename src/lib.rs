//! # windlass
//!
//! Resilient WebSockets for Tokio: an RFC 6455 client and server with
//! permessage-deflate (RFC 7692), proxy tunneling (HTTP CONNECT and SOCKS5)
//! and a supervised endpoint that reconnects with capped, jittered
//! exponential backoff.
//!
//! The crate is organized in three layers:
//!
//! - [`WebSocket`] is the protocol core: framing, masking, fragmentation,
//!   compression and the close handshake over any `AsyncRead + AsyncWrite`
//!   stream. It implements [`futures::Stream`] and [`futures::Sink`].
//! - [`Endpoint`] supervises one connection: it owns a background task that
//!   connects (through a proxy if configured), heartbeats, detects stalls,
//!   reconnects, and delivers [`Event`]s over a channel.
//! - [`Server`] accepts connections, enforces per-IP limits, and demuxes
//!   WebSocket upgrades from plain HTTP requests.
//!
//! ```no_run
//! use windlass::{Endpoint, EndpointOptions, Event};
//!
//! #[tokio::main]
//! async fn main() -> windlass::Result<()> {
//!     let options = EndpointOptions::new("wss://echo.websocket.org")?;
//!     let (endpoint, mut events) = Endpoint::start_new(options);
//!
//!     while let Some(event) = events.recv().await {
//!         if let Event::Open { .. } = event {
//!             endpoint.send_text("hello");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod close;
pub mod codec;
pub mod compression;
pub mod endpoint;
pub mod files;
pub mod frame;
mod http;
mod mask;
pub mod net;
pub mod pool;
pub mod proxy;
pub mod server;
mod stream;
mod ws;

use thiserror::Error;

pub use close::CloseCode;
pub use endpoint::{
    set_default_traffic_tracker, Endpoint, EndpointOptions, Event, MessagePriority, ProgressFn,
    ReadyState, SendInfo, Stats, Timeouts, TrafficTracker,
};
pub use frame::{Frame, OpCode};
pub use pool::ConnectionPool;
pub use proxy::{ProxyConfig, ProxyKind};
pub use server::{Client, Server, ServerEvent, ServerOptions};
pub use stream::MaybeTlsStream;
pub use ws::{
    accept_key, CompressionLevel, DeflateOptions, HandshakeInfo, HttpResponse, HttpWebSocket,
    Options, TcpWebSocket, UpgradeFut, WebSocket,
};

/// Result type used throughout the crate, with [`WebSocketError`] as the
/// error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors surfaced by WebSocket operations.
///
/// Protocol violations map to a close code when they are detected on a live
/// connection (see [`WebSocketError::close_code`]); handshake errors are
/// returned from the connect path before any frame is exchanged.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A new data frame arrived while a fragmented message was still being
    /// assembled, or a fragment sequence was otherwise malformed.
    #[error("invalid fragment")]
    InvalidFragment,

    /// A text message (or close reason) did not contain valid UTF-8.
    #[error("invalid UTF-8")]
    InvalidUtf8,

    /// A continuation frame arrived with no message in progress.
    #[error("continuation frame without an initial frame")]
    InvalidContinuationFrame,

    /// The server answered the upgrade request with something other than
    /// `101 Switching Protocols`. The response headers are attached so the
    /// caller can inspect redirects or auth challenges.
    #[error("unexpected handshake status: {status}")]
    UpgradeStatus {
        status: u16,
        headers: hyper::HeaderMap,
    },

    /// The `Upgrade` header was missing or did not name `websocket`.
    #[error("invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The `Connection` header was missing or did not contain `Upgrade`.
    #[error("invalid connection header")]
    InvalidConnectionHeader,

    /// The `Sec-WebSocket-Accept` value did not match the derived key.
    #[error("invalid Sec-WebSocket-Accept value")]
    InvalidSecWebSocketAccept,

    /// Operation attempted on a connection that is already closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// A close frame carried a 1-byte payload (must be empty or >= 2 bytes).
    #[error("invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carried a status code outside the allowed ranges.
    #[error("invalid close code")]
    InvalidCloseCode,

    /// RSV2/RSV3 were set, or RSV1 was set without negotiated compression.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame arrived without FIN; control frames must not be
    /// fragmented.
    #[error("fragmented control frame")]
    ControlFrameFragmented,

    /// A control frame payload exceeded 125 bytes.
    #[error("control frame payload over 125 bytes")]
    ControlFrameTooLarge,

    /// A frame payload exceeded the configured read limit.
    #[error("frame too large")]
    FrameTooLarge,

    /// The peer stopped mid-message: the remaining fragments did not arrive
    /// within the configured window.
    #[error("timed out waiting for message fragments")]
    FragmentTimeout,

    /// `Sec-WebSocket-Version` was not 13.
    #[error("Sec-WebSocket-Version must be 13")]
    InvalidSecWebSocketVersion,

    /// A server handshake request used a method other than GET.
    #[error("handshake requires GET, got {0}")]
    InvalidHttpMethod(String),

    /// A server handshake request used an HTTP version other than 1.1.
    #[error("handshake requires HTTP/1.1")]
    InvalidHttpVersion,

    /// `Sec-WebSocket-Key` was absent from the client request.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// A frame carried an opcode outside the RFC 6455 set.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A client-to-server frame arrived without the mandatory mask.
    #[error("unmasked frame from client")]
    UnmaskedFrame,

    /// A server-to-client frame arrived masked; servers must not mask.
    #[error("masked frame from server")]
    MaskedFrame,

    /// URL scheme was not `ws` or `wss`.
    #[error("invalid websocket scheme")]
    InvalidScheme,

    /// A compressed frame arrived but permessage-deflate was not negotiated.
    #[error("received compressed frame without negotiated compression")]
    CompressionNotSupported,

    /// Inflating a compressed message failed. The close code for this
    /// condition is 1007.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// No pong arrived within the configured window of an outbound ping.
    #[error("no pong received within the ping timeout")]
    PongTimeout,

    /// No bytes were read for the configured idle window.
    #[error("connection idle timeout")]
    IdleTimeout,

    /// A send could not be flushed within the configured window.
    #[error("send timeout")]
    SendTimeout,

    /// Proxy negotiation (CONNECT or SOCKS5) failed.
    #[error("proxy: {0}")]
    Proxy(String),

    /// The WebSocket or proxy URL failed to parse.
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Errors from the hyper HTTP layer during handshake or upgrade.
    #[error(transparent)]
    Http(#[from] hyper::Error),

    /// Errors building an HTTP request or response.
    #[error(transparent)]
    HttpBuild(#[from] hyper::http::Error),
}

impl From<std::convert::Infallible> for WebSocketError {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

impl WebSocketError {
    /// Close code that should be sent to the peer when this error is
    /// detected on an open connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            WebSocketError::FrameTooLarge => CloseCode::Size,
            WebSocketError::InvalidOpCode(_) => CloseCode::Unsupported,
            WebSocketError::InvalidUtf8 | WebSocketError::Decompression(_) => CloseCode::Invalid,
            WebSocketError::PongTimeout | WebSocketError::SendTimeout => CloseCode::Error,
            WebSocketError::ReservedBitsNotZero
            | WebSocketError::ControlFrameFragmented
            | WebSocketError::ControlFrameTooLarge
            | WebSocketError::InvalidFragment
            | WebSocketError::InvalidContinuationFrame
            | WebSocketError::FragmentTimeout
            | WebSocketError::UnmaskedFrame
            | WebSocketError::MaskedFrame
            | WebSocketError::InvalidCloseFrame
            | WebSocketError::InvalidCloseCode
            | WebSocketError::CompressionNotSupported => CloseCode::Protocol,
            _ => CloseCode::Error,
        }
    }
}
