//! Protocol core: the [`WebSocket`] type.
//!
//! Layering, bottom to top:
//!
//! - [`codec`](crate::codec) decodes/encodes single frames and enforces
//!   header invariants (reserved bits, masking direction, control shape).
//! - [`split`] assembles fragmented messages, applies limits, and runs
//!   compression per message.
//! - [`WebSocket`] (this module) owns the protocol obligations: answering
//!   pings, mirroring close frames, validating UTF-8 of text messages, and
//!   the client handshake.
//!
//! A compressed message split over three fragments therefore travels:
//! codec yields `Text(RSV1, FIN=0)`, `Continuation(FIN=0)`,
//! `Continuation(FIN=1)`; the read half concatenates and inflates; this
//! module validates UTF-8 and hands one complete `Text` frame to the
//! application.

mod options;
mod split;
mod upgrade;

use std::{
    collections::VecDeque,
    future::poll_fn,
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{header, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::codec::{Framed, FramedParts};
use url::Url;

use crate::{
    close::CloseCode,
    codec::{FrameCodec, Role},
    compression::{DeflateParams, Deflater, Inflater},
    frame::{Frame, OpCode},
    http::header_eq,
    stream::MaybeTlsStream,
    Result, WebSocketError,
};

pub use options::{CompressionLevel, DeflateOptions, Options, MAX_PAYLOAD_READ, MAX_READ_BUFFER};
pub(crate) use split::ReadStep;
use split::{ReadHalf, WriteHalf};
pub use upgrade::{accept_key, HttpResponse, HttpWebSocket, UpgradeFut};
pub(crate) use upgrade::{generate_key, upgrade_request, ServerUpgrade};

/// WebSocket over a possibly TLS-wrapped TCP stream, as produced by
/// [`WebSocket::connect`].
pub type TcpWebSocket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Parameters agreed between client and server during the handshake,
/// flattened with the transport options that survive past it.
#[derive(Debug, Clone, Default)]
pub(crate) struct Negotiation {
    pub(crate) deflate: Option<NegotiatedDeflate>,
    pub(crate) max_payload_read: usize,
    pub(crate) max_read_buffer: usize,
    pub(crate) check_utf8: bool,
    pub(crate) auto_pong: bool,
    pub(crate) fragment_size: Option<usize>,
    pub(crate) fragment_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub(crate) struct NegotiatedDeflate {
    pub(crate) params: DeflateParams,
    pub(crate) level: CompressionLevel,
}

impl Negotiation {
    pub(crate) fn from_options(options: &Options, agreed: Option<DeflateParams>) -> Self {
        Self {
            deflate: agreed.map(|params| NegotiatedDeflate {
                params,
                level: options
                    .compression
                    .as_ref()
                    .map(|c| c.level)
                    .unwrap_or_default(),
            }),
            max_payload_read: options.effective_max_payload_read(),
            max_read_buffer: options.effective_max_read_buffer(),
            check_utf8: !options.skip_utf8_check,
            auto_pong: !options.disable_auto_pong,
            fragment_size: options.fragment_size,
            fragment_timeout: options.fragment_timeout,
        }
    }

    /// Inflater for the inbound direction of `role`: a server reads
    /// client-compressed data, a client reads server-compressed data.
    pub(crate) fn inflater(&self, role: Role) -> Option<Inflater> {
        let deflate = self.deflate.as_ref()?;
        let reset = match role {
            Role::Server => deflate.params.client_no_context_takeover,
            Role::Client => deflate.params.server_no_context_takeover,
        };
        log::debug!(
            "inbound deflate for {role}: reset_per_message={reset} params=[{}]",
            deflate.params
        );
        Some(Inflater::new(reset))
    }

    /// Deflater for the outbound direction of `role`.
    pub(crate) fn deflater(&self, role: Role) -> Option<Deflater> {
        let deflate = self.deflate.as_ref()?;
        let reset = match role {
            Role::Client => deflate.params.client_no_context_takeover,
            Role::Server => deflate.params.server_no_context_takeover,
        };
        log::debug!(
            "outbound deflate for {role}: reset_per_message={reset} params=[{}]",
            deflate.params
        );
        Some(Deflater::new(deflate.level, reset))
    }
}

/// What the client learned from a successful upgrade exchange.
#[derive(Debug, Clone, Default)]
pub struct HandshakeInfo {
    /// Response headers from the 101 exchange.
    pub headers: hyper::HeaderMap,
    /// Sub-protocol the server selected, if any.
    pub protocol: Option<String>,
}

// ================== WebSocket ====================

/// WebSocket connection for either role.
///
/// Implements [`futures::Stream`] of inbound frames (complete messages and
/// control frames) and [`futures::Sink`] of outbound frames. Protocol
/// control is automatic:
///
/// - inbound pings queue a pong ahead of application sends (still
///   delivered, so callers can observe them);
/// - inbound close frames are mirrored once and end the stream;
/// - text messages are UTF-8 validated when enabled;
/// - whole messages are compressed/decompressed when negotiated, and
///   oversized outbound messages are fragmented at the configured cap.
pub struct WebSocket<S> {
    stream: Framed<S, FrameCodec>,
    read: ReadHalf,
    write: WriteHalf,
    /// Frames the protocol owes the peer (pongs, close echoes); flushed
    /// before application traffic.
    obligated: VecDeque<Frame>,
    flush_obligated: bool,
    auto_pong: bool,
    check_utf8: bool,
}

impl TcpWebSocket {
    /// Connects to `url` (`ws://` or `wss://`) and performs the upgrade
    /// with default options.
    pub async fn connect(url: &Url) -> Result<TcpWebSocket> {
        Self::connect_with_options(url, Options::default()).await
    }

    /// Connects with explicit transport options.
    pub async fn connect_with_options(url: &Url, options: Options) -> Result<TcpWebSocket> {
        let stream = connect_stream(url, None).await?;
        let (ws, _) =
            WebSocket::handshake_with_headers(url, stream, options, Default::default(), &[])
                .await?;
        Ok(ws)
    }
}

/// Opens the TCP (and, for `wss`, TLS) stream for `url` without speaking
/// any WebSocket yet. The endpoint supervisor uses this split so a proxy
/// tunnel can be negotiated between the two steps.
pub(crate) async fn connect_stream(
    url: &Url,
    connector: Option<tokio_rustls::TlsConnector>,
) -> Result<MaybeTlsStream<TcpStream>> {
    let (host, port) = host_port(url)?;
    let tcp = TcpStream::connect((host.as_str(), port)).await?;
    let _ = tcp.set_nodelay(true);
    wrap_tls(url, &host, tcp, connector).await
}

/// Layers TLS on an already-connected stream when the scheme asks for it.
pub(crate) async fn wrap_tls(
    url: &Url,
    host: &str,
    tcp: TcpStream,
    connector: Option<tokio_rustls::TlsConnector>,
) -> Result<MaybeTlsStream<TcpStream>> {
    match url.scheme() {
        "ws" => Ok(MaybeTlsStream::Plain(tcp)),
        "wss" => {
            let connector = connector.unwrap_or_else(crate::stream::tls_connector);
            let domain = ServerName::try_from(host.to_string()).map_err(|_| {
                WebSocketError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "invalid dns name",
                ))
            })?;
            Ok(MaybeTlsStream::Tls(connector.connect(domain, tcp).await?))
        }
        _ => Err(WebSocketError::InvalidScheme),
    }
}

/// Splits a WebSocket URL into host and effective port.
pub(crate) fn host_port(url: &Url) -> Result<(String, u16)> {
    let host = url
        .host_str()
        .ok_or(WebSocketError::InvalidScheme)?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or(WebSocketError::InvalidScheme)?;
    Ok((host, port))
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Performs the client handshake over an existing stream.
    ///
    /// Use this when the connection needed custom dialing (a proxy tunnel,
    /// custom DNS, a reused socket); [`WebSocket::connect`] covers the
    /// plain case.
    pub async fn handshake(url: &Url, io: S, options: Options) -> Result<WebSocket<S>> {
        let (ws, _) =
            Self::handshake_with_headers(url, io, options, Default::default(), &[]).await?;
        Ok(ws)
    }

    /// Client handshake with extra request headers and a sub-protocol
    /// offer. Returns the connection plus what the server answered.
    pub(crate) async fn handshake_with_headers(
        url: &Url,
        io: S,
        options: Options,
        extra_headers: hyper::HeaderMap,
        sub_protocols: &[String],
    ) -> Result<(WebSocket<S>, HandshakeInfo)> {
        let key = generate_key();
        let request = build_upgrade_request(url, &key, &options, extra_headers, sub_protocols)?;

        let (mut sender, conn) =
            hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.with_upgrades().await {
                log::error!("upgrade connection task: {err:?}");
            }
        });

        let mut response = sender.send_request(request).await?;
        let (negotiation, info) = verify_upgrade(&response, &options, &key)?;

        let upgraded = hyper::upgrade::on(&mut response).await?;
        let parts = upgraded
            .downcast::<TokioIo<S>>()
            .expect("upgrade returns the stream we handed in");

        Ok((
            WebSocket::new(
                Role::Client,
                parts.io.into_inner(),
                parts.read_buf,
                negotiation,
            ),
            info,
        ))
    }
}

impl WebSocket<TokioIo<hyper::upgrade::Upgraded>> {
    /// Accepts a WebSocket upgrade on a hyper request with default options
    /// and no sub-protocols.
    ///
    /// The returned response must be sent to the client before the future
    /// resolves; see [`UpgradeFut`].
    pub fn upgrade<B>(request: &mut Request<B>) -> Result<(HttpResponse, UpgradeFut)> {
        Self::upgrade_with_options(request, Options::default())
    }

    /// Accepts a WebSocket upgrade with explicit transport options.
    pub fn upgrade_with_options<B>(
        request: &mut Request<B>,
        options: Options,
    ) -> Result<(HttpResponse, UpgradeFut)> {
        let ServerUpgrade { response, fut, .. } =
            upgrade_request(request, &options, &[], crate::net::SERVER_AGENT)?;
        Ok((response, fut))
    }
}

// ======== Generic implementation =============

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(role: Role, stream: S, read_buf: Bytes, negotiation: Negotiation) -> Self {
        let codec = FrameCodec::new(role, negotiation.max_payload_read);
        let mut parts = FramedParts::new(stream, codec);
        parts.read_buf = read_buf.into();

        Self {
            stream: Framed::from_parts(parts),
            read: ReadHalf::new(role, &negotiation),
            write: WriteHalf::new(role, &negotiation),
            obligated: VecDeque::new(),
            flush_obligated: false,
            auto_pong: negotiation.auto_pong,
            check_utf8: negotiation.check_utf8,
        }
    }

    /// Bytes queued on the transport but not yet flushed to the socket.
    pub fn buffered_amount(&self) -> usize {
        self.stream.write_buffer().len()
    }

    /// Polls for one step of inbound progress: a complete message, a
    /// control frame, or notice that a fragment arrived.
    pub(crate) fn poll_step(&mut self, cx: &mut Context<'_>) -> Poll<Result<ReadStep>> {
        match self.read.poll_step(&mut self.stream, cx) {
            Poll::Ready(Ok(ReadStep::Complete(frame))) => match self.on_frame(frame) {
                Ok(frame) => Poll::Ready(Ok(ReadStep::Complete(frame))),
                Err(err) => {
                    // `on_close` already queued its own protocol answer for
                    // a bad close code; everything else gets one here.
                    if !matches!(err, WebSocketError::InvalidCloseCode) {
                        self.emit_close(Frame::close(err.close_code(), err.to_string()));
                    }
                    let _ = self.poll_flush_obligated(cx);
                    Poll::Ready(Err(err))
                }
            },
            Poll::Ready(Ok(ReadStep::Partial)) => Poll::Ready(Ok(ReadStep::Partial)),
            Poll::Ready(Err(WebSocketError::ConnectionClosed)) => {
                ready!(self.poll_flush_obligated(cx))?;
                Poll::Ready(Err(WebSocketError::ConnectionClosed))
            }
            Poll::Ready(Err(err)) => {
                // Answer the violation with the matching close code;
                // delivery is best effort while the error propagates.
                self.emit_close(Frame::close(err.close_code(), err.to_string()));
                let _ = self.poll_flush_obligated(cx);
                Poll::Ready(Err(err))
            }
            Poll::Pending => {
                ready!(self.poll_flush_obligated(cx))?;
                Poll::Pending
            }
        }
    }

    /// Polls for the next complete message or control frame.
    pub fn poll_next_frame(&mut self, cx: &mut Context<'_>) -> Poll<Result<Frame>> {
        loop {
            match ready!(self.poll_step(cx))? {
                ReadStep::Complete(frame) => return Poll::Ready(Ok(frame)),
                ReadStep::Partial => continue,
            }
        }
    }

    /// Waits for the next complete message or control frame.
    pub async fn next_frame(&mut self) -> Result<Frame> {
        poll_fn(|cx| self.poll_next_frame(cx)).await
    }

    /// Waits for one step of inbound progress.
    pub(crate) async fn next_step(&mut self) -> Result<ReadStep> {
        poll_fn(|cx| self.poll_step(cx)).await
    }

    fn on_frame(&mut self, frame: Frame) -> Result<Frame> {
        match frame.opcode {
            OpCode::Ping => {
                if self.auto_pong {
                    self.obligated.push_back(Frame::pong(&frame.payload[..]));
                }
                return Ok(frame);
            }
            OpCode::Pong => return Ok(frame),
            OpCode::Close => {
                self.on_close(&frame)?;
                return Ok(frame);
            }
            _ => {}
        }

        if frame.decompression_failed() {
            // Deliver the flagged message; the connection is closing with
            // 1007 as RFC 7692 requires.
            self.emit_close(Frame::close(CloseCode::Invalid, "decompression failed"));
            return Ok(frame);
        }

        if frame.opcode == OpCode::Text
            && self.check_utf8
            && std::str::from_utf8(&frame.payload).is_err()
        {
            return Err(WebSocketError::InvalidUtf8);
        }

        Ok(frame)
    }

    /// Handles an inbound close frame: validate, then mirror it once.
    fn on_close(&mut self, frame: &Frame) -> Result<()> {
        match frame.payload.len() {
            0 => {}
            1 => return Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let code = frame.close_code().expect("length checked");
                frame.close_reason()?;

                if !code.is_allowed() {
                    self.emit_close(Frame::close(CloseCode::Protocol, &frame.payload[2..]));
                    return Err(WebSocketError::InvalidCloseCode);
                }
            }
        }

        if self.write.close_sent() {
            // We initiated the close; the peer's frame is the reply, not a
            // request to be mirrored.
            self.read.is_closed = true;
        } else {
            self.emit_close(Frame::close_raw(&frame.payload[..]));
        }
        Ok(())
    }

    fn emit_close(&mut self, frame: Frame) {
        self.obligated.push_back(frame);
        self.read.is_closed = true;
    }

    fn poll_flush_obligated(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        while !self.obligated.is_empty() {
            ready!(self.write.poll_ready(&mut self.stream, cx))?;
            let next = self.obligated.pop_front().expect("non-empty queue");
            self.write.start_send(&mut self.stream, next)?;
            self.flush_obligated = true;
        }

        if self.flush_obligated {
            ready!(self.write.poll_flush(&mut self.stream, cx))?;
            self.flush_obligated = false;
        }

        Poll::Ready(Ok(()))
    }
}

impl<S> futures::Stream for WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<Frame>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match ready!(this.poll_next_frame(cx)) {
            Ok(frame) => Poll::Ready(Some(Ok(frame))),
            Err(WebSocketError::ConnectionClosed) => Poll::Ready(None),
            Err(err) => Poll::Ready(Some(Err(err))),
        }
    }
}

impl<S> futures::Sink<Frame> for WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Error = WebSocketError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_obligated(cx))?;
        this.write.poll_ready(&mut this.stream, cx)
    }

    fn start_send(self: Pin<&mut Self>, frame: Frame) -> Result<()> {
        let this = self.get_mut();
        this.write.start_send(&mut this.stream, frame)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        this.write.poll_flush(&mut this.stream, cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        this.write.poll_close(&mut this.stream, cx)
    }
}

// ================ Client handshake helpers ====================

fn build_upgrade_request(
    url: &Url,
    key: &str,
    options: &Options,
    extra_headers: hyper::HeaderMap,
    sub_protocols: &[String],
) -> Result<Request<Empty<Bytes>>> {
    let (host, port) = host_port(url)?;

    let mut builder = Request::builder()
        .method("GET")
        .uri(&url[url::Position::BeforePath..])
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "upgrade")
        .header(header::SEC_WEBSOCKET_KEY, key)
        .header(header::SEC_WEBSOCKET_VERSION, "13");

    if !extra_headers.contains_key(header::HOST) {
        let host_header = if url.port().is_some() {
            format!("{host}:{port}")
        } else {
            host.clone()
        };
        builder = builder.header(header::HOST, host_header);
    }
    if !extra_headers.contains_key(header::USER_AGENT) {
        builder = builder.header(header::USER_AGENT, crate::net::SERVER_AGENT);
    }
    if !extra_headers.contains_key(header::ORIGIN) {
        builder = builder.header(header::ORIGIN, format!("{}://{host}:{port}", url.scheme()));
    }

    if !sub_protocols.is_empty() {
        builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, sub_protocols.join(","));
    }
    if let Some(compression) = options.compression.as_ref() {
        builder = builder.header(
            header::SEC_WEBSOCKET_EXTENSIONS,
            compression.offer().to_string(),
        );
    }

    let mut request = builder.body(Empty::new())?;
    for (name, value) in extra_headers.iter() {
        request.headers_mut().insert(name, value.clone());
    }
    Ok(request)
}

/// Validates the server's answer to the upgrade request.
fn verify_upgrade<B>(
    response: &Response<B>,
    options: &Options,
    key: &str,
) -> Result<(Negotiation, HandshakeInfo)> {
    let headers = response.headers();

    if response.status() != hyper::StatusCode::SWITCHING_PROTOCOLS {
        return Err(WebSocketError::UpgradeStatus {
            status: response.status().as_u16(),
            headers: headers.clone(),
        });
    }

    if !header_eq(headers, header::UPGRADE, "websocket") {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }
    if !header_eq(headers, header::CONNECTION, "Upgrade") {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    let expected = accept_key(key.as_bytes());
    if headers
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .map(|value| value.as_bytes())
        != Some(expected.as_bytes())
    {
        return Err(WebSocketError::InvalidSecWebSocketAccept);
    }

    // The server's extension answer is authoritative; without one (or
    // without our own offer) compression stays off.
    let agreed = if options.compression.is_some() {
        headers
            .get(header::SEC_WEBSOCKET_EXTENSIONS)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<DeflateParams>().ok())
    } else {
        None
    };

    let protocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let info = HandshakeInfo {
        headers: headers.clone(),
        protocol,
    };
    Ok((Negotiation::from_options(options, agreed), info))
}
