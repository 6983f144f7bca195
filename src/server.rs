//! WebSocket server: accept loop, per-IP limits, HTTP demux.
//!
//! Each accepted socket is served as an HTTP/1.1 connection. Requests
//! carrying a WebSocket `Upgrade` header drive the server handshake and
//! become supervised client connections; everything else goes to the
//! static-file responder when a document root is configured (404
//! otherwise).
//!
//! Application code consumes one [`ServerEvent`] channel and talks back
//! through [`Client`] handles, which are safe to clone into any task.
//! Clients never run application code on the connection task itself.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::SinkExt;
use http_body_util::{Either, Empty, Full};
use hyper::{body::Incoming, header, service::service_fn, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::{
    net::TcpListener,
    sync::{mpsc, Notify},
    task::JoinHandle,
};

use crate::{
    close::CloseCode,
    files,
    frame::{Frame, OpCode},
    ws::{upgrade_request, Options, ServerUpgrade, UpgradeFut},
    Result, WebSocketError,
};

/// Body served on plain HTTP responses and upgrade responses alike.
type DemuxBody = Either<Empty<Bytes>, Full<Bytes>>;

/// Server configuration, immutable once bound.
#[derive(Clone)]
pub struct ServerOptions {
    pub(crate) host: String,
    pub(crate) port: u16,
    /// Concurrent connections allowed per remote IP; 0 means unlimited.
    pub(crate) max_connections_per_ip: usize,
    pub(crate) sub_protocols: Vec<String>,
    pub(crate) transport: Options,
    pub(crate) server_header: String,
    /// Document root for plain HTTP requests; `None` answers 404.
    pub(crate) http_root: Option<PathBuf>,
}

impl ServerOptions {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            max_connections_per_ip: 0,
            sub_protocols: Vec::new(),
            transport: Options::default(),
            server_header: crate::net::SERVER_AGENT.to_string(),
            http_root: None,
        }
    }

    pub fn with_max_connections_per_ip(mut self, max: usize) -> Self {
        self.max_connections_per_ip = max;
        self
    }

    /// Registers a supported sub-protocol; order is preference order.
    pub fn with_sub_protocol(mut self, protocol: &str) -> Self {
        self.sub_protocols.push(protocol.to_string());
        self
    }

    pub fn with_transport(mut self, transport: Options) -> Self {
        self.transport = transport;
        self
    }

    /// Overrides the `Server` response header.
    pub fn with_server_header(mut self, value: &str) -> Self {
        self.server_header = value.to_string();
        self
    }

    /// Enables the static-file responder rooted at `root`.
    pub fn with_http_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.http_root = Some(root.into());
        self
    }
}

/// Handle to one connected WebSocket client.
///
/// Clones share the same connection. Sends are queued; a `false` return
/// means the connection is gone.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientShared>,
}

#[derive(Debug)]
struct ClientShared {
    id: u64,
    remote_addr: SocketAddr,
    protocol: Option<String>,
    tx: mpsc::UnboundedSender<Frame>,
}

impl Client {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Sub-protocol selected during the handshake, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.inner.protocol.as_deref()
    }

    pub fn send_text(&self, data: impl AsRef<[u8]>) -> bool {
        self.inner.tx.send(Frame::text(data)).is_ok()
    }

    pub fn send_binary(&self, data: impl AsRef<[u8]>) -> bool {
        self.inner.tx.send(Frame::binary(data)).is_ok()
    }

    /// Starts the close handshake toward this client.
    pub fn close(&self, code: CloseCode, reason: &str) -> bool {
        self.inner.tx.send(Frame::close(code, reason)).is_ok()
    }
}

/// Notifications delivered to the application.
#[derive(Debug)]
pub enum ServerEvent {
    /// A client completed the WebSocket handshake.
    Connected { client: Client },
    /// A complete message arrived from a client.
    Message {
        client: Client,
        data: Bytes,
        binary: bool,
    },
    /// A ping arrived (already answered automatically unless disabled).
    Ping { client: Client, data: Bytes },
    /// A pong arrived.
    Pong { client: Client, data: Bytes },
    /// The client connection ended and left the directory.
    Disconnected {
        client: Client,
        code: u16,
        reason: String,
    },
}

struct ServerInner {
    options: ServerOptions,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<ServerEvent>,
    clients: Mutex<HashMap<u64, Client>>,
    per_ip: Mutex<HashMap<IpAddr, usize>>,
    next_id: AtomicU64,
    shutdown: Notify,
    listener: Mutex<Option<TcpListener>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Holds one slot of the per-IP connection count; the slot frees when the
/// last clone referencing the connection is dropped.
struct IpSlot {
    inner: Arc<ServerInner>,
    ip: IpAddr,
}

impl Drop for IpSlot {
    fn drop(&mut self) {
        let mut per_ip = self.inner.per_ip.lock().expect("per-ip mutex");
        if let Some(count) = per_ip.get_mut(&self.ip) {
            *count -= 1;
            if *count == 0 {
                per_ip.remove(&self.ip);
            }
        }
    }
}

/// Listening WebSocket server.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Binds the listening socket; [`Server::start`] begins accepting.
    pub async fn bind(options: ServerOptions) -> Result<(Server, mpsc::UnboundedReceiver<ServerEvent>)> {
        let listener = TcpListener::bind((options.host.as_str(), options.port)).await?;
        let addr = listener.local_addr()?;
        log::info!("listening on {addr}");

        let (events, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ServerInner {
            options,
            addr,
            events,
            clients: Mutex::new(HashMap::new()),
            per_ip: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: Notify::new(),
            listener: Mutex::new(Some(listener)),
            task: Mutex::new(None),
        });

        Ok((Server { inner }, event_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Spawns the accept loop. Idempotent while running.
    pub fn start(&self) {
        let mut task = self.inner.task.lock().expect("task mutex");
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let Some(listener) = self.inner.listener.lock().expect("listener mutex").take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(accept_loop(inner, listener)));
    }

    /// Stops accepting, asks every connected client to close, and waits
    /// for the accept loop to finish.
    pub async fn stop(&self) {
        self.inner.shutdown.notify_one();

        let clients: Vec<Client> = {
            let directory = self.inner.clients.lock().expect("clients mutex");
            directory.values().cloned().collect()
        };
        for client in clients {
            client.close(CloseCode::Away, "server shutting down");
        }

        let task = self.inner.task.lock().expect("task mutex").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().expect("clients mutex").len()
    }

    pub fn clients(&self) -> Vec<Client> {
        self.inner
            .clients
            .lock()
            .expect("clients mutex")
            .values()
            .cloned()
            .collect()
    }

    pub fn client_by_id(&self, id: u64) -> Option<Client> {
        self.inner
            .clients
            .lock()
            .expect("clients mutex")
            .get(&id)
            .cloned()
    }

    /// Live connections currently counted against `ip`.
    pub fn connection_count_for_ip(&self, ip: IpAddr) -> usize {
        self.inner
            .per_ip
            .lock()
            .expect("per-ip mutex")
            .get(&ip)
            .copied()
            .unwrap_or(0)
    }

    /// Queues `data` to every connected client, optionally excluding one.
    pub fn broadcast(&self, data: impl AsRef<[u8]>, binary: bool, exclude: Option<u64>) {
        let data = data.as_ref();
        for client in self.clients() {
            if Some(client.id()) == exclude {
                continue;
            }
            let delivered = if binary {
                client.send_binary(data)
            } else {
                client.send_text(data)
            };
            if !delivered {
                log::debug!("broadcast skipped closed client {}", client.id());
            }
        }
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.shutdown.notified() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        // Transient accept failures (fd pressure) must not
                        // kill the listener.
                        log::warn!("accept failed: {err}");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };

                let ip = peer.ip();
                {
                    let cap = inner.options.max_connections_per_ip;
                    let mut per_ip = inner.per_ip.lock().expect("per-ip mutex");
                    let count = per_ip.entry(ip).or_insert(0);
                    if cap > 0 && *count >= cap {
                        log::warn!("rate limit exceeded for {ip}, rejecting connection");
                        continue;
                    }
                    *count += 1;
                }

                let slot = Arc::new(IpSlot {
                    inner: Arc::clone(&inner),
                    ip,
                });
                let inner = Arc::clone(&inner);
                tokio::spawn(serve_socket(inner, stream, peer, slot));
            }
        }
    }
    log::debug!("accept loop stopped");
}

/// Serves one accepted socket as HTTP/1.1, demuxing WebSocket upgrades.
async fn serve_socket(
    inner: Arc<ServerInner>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    slot: Arc<IpSlot>,
) {
    let service_inner = Arc::clone(&inner);
    let service = service_fn(move |mut req: Request<Incoming>| {
        let inner = Arc::clone(&service_inner);
        let slot = Arc::clone(&slot);
        async move {
            let response = if is_upgrade_request(&req) {
                match upgrade_request(
                    &mut req,
                    &inner.options.transport,
                    &inner.options.sub_protocols,
                    &inner.options.server_header,
                ) {
                    Ok(ServerUpgrade {
                        response,
                        fut,
                        protocol,
                    }) => {
                        tokio::spawn(run_client(inner, fut, peer, protocol, slot));
                        response.map(Either::Left)
                    }
                    Err(err) => {
                        log::warn!("rejecting upgrade from {peer}: {err}");
                        handshake_error_response(&err, &inner.options.server_header)
                            .map(Either::Right)
                    }
                }
            } else {
                // Drain and validate the request body first; a bad
                // Content-Length or gzip body fails the request.
                let (parts, body) = req.into_parts();
                let req = Request::from_parts(parts, ());
                if crate::http::collect_body(req.headers(), body).await.is_err() {
                    Response::builder()
                        .status(StatusCode::BAD_REQUEST)
                        .header(header::SERVER, inner.options.server_header.as_str())
                        .body(Full::new(Bytes::new()))
                        .expect("static response")
                        .map(Either::Right)
                } else if let Some(root) = inner.options.http_root.clone() {
                    files::serve_files(&req, &root).await.map(Either::Right)
                } else {
                    Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .header(header::SERVER, inner.options.server_header.as_str())
                        .body(Full::new(Bytes::new()))
                        .expect("static response")
                        .map(Either::Right)
                }
            };
            Ok::<Response<DemuxBody>, std::convert::Infallible>(response)
        }
    });

    if let Err(err) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        log::debug!("connection from {peer} ended with error: {err}");
    }
}

/// An `Upgrade: websocket` header routes the request to the WebSocket
/// handshake; anything else is plain HTTP.
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket") || value == "keep-alive, Upgrade")
        .unwrap_or(false)
}

/// HTTP error answering a failed handshake, carrying the reason.
fn handshake_error_response(err: &WebSocketError, server_header: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(header::SERVER, server_header)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(err.to_string())))
        .expect("static response")
}

/// Owns one upgraded client connection until it closes.
async fn run_client(
    inner: Arc<ServerInner>,
    upgrade: UpgradeFut,
    peer: SocketAddr,
    protocol: Option<String>,
    slot: Arc<IpSlot>,
) {
    let mut ws = match upgrade.await {
        Ok(ws) => ws,
        Err(err) => {
            log::warn!("upgrade from {peer} failed: {err}");
            return;
        }
    };

    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Client {
        inner: Arc::new(ClientShared {
            id,
            remote_addr: peer,
            protocol,
            tx,
        }),
    };

    inner
        .clients
        .lock()
        .expect("clients mutex")
        .insert(id, client.clone());
    let _ = inner.events.send(ServerEvent::Connected {
        client: client.clone(),
    });
    log::debug!("client {id} connected from {peer}");

    let mut close_code = u16::from(CloseCode::Abnormal);
    let mut close_reason = String::new();

    loop {
        tokio::select! {
            biased;

            outbound = rx.recv() => match outbound {
                Some(frame) => {
                    let closing = frame.opcode == OpCode::Close;
                    if closing {
                        if let Some(code) = frame.close_code() {
                            close_code = u16::from(code);
                        }
                    }
                    if ws.send(frame).await.is_err() {
                        break;
                    }
                    if closing {
                        // Wait (bounded) for the peer's close reply before
                        // tearing the socket down.
                        let _ = tokio::time::timeout(Duration::from_secs(5), async {
                            while ws.next_frame().await.is_ok() {}
                        })
                        .await;
                        break;
                    }
                }
                None => break,
            },

            frame = ws.next_frame() => match frame {
                Ok(frame) => match frame.opcode {
                    OpCode::Text | OpCode::Binary => {
                        let _ = inner.events.send(ServerEvent::Message {
                            client: client.clone(),
                            binary: frame.opcode == OpCode::Binary,
                            data: frame.payload.freeze(),
                        });
                    }
                    OpCode::Ping => {
                        let _ = inner.events.send(ServerEvent::Ping {
                            client: client.clone(),
                            data: frame.payload.freeze(),
                        });
                    }
                    OpCode::Pong => {
                        let _ = inner.events.send(ServerEvent::Pong {
                            client: client.clone(),
                            data: frame.payload.freeze(),
                        });
                    }
                    OpCode::Close => {
                        close_code = frame
                            .close_code()
                            .map(u16::from)
                            .unwrap_or(u16::from(CloseCode::Status));
                        close_reason = frame
                            .close_reason()
                            .ok()
                            .flatten()
                            .unwrap_or_default()
                            .to_string();
                        // Drain so the mirrored close flushes.
                        let _ = tokio::time::timeout(Duration::from_secs(5), async {
                            while ws.next_frame().await.is_ok() {}
                        })
                        .await;
                        break;
                    }
                    OpCode::Continuation => {}
                },
                Err(err) => {
                    if !matches!(err, WebSocketError::ConnectionClosed) {
                        log::debug!("client {id} errored: {err}");
                        close_reason = err.to_string();
                    }
                    break;
                }
            },
        }
    }

    let _ = ws.close().await;
    inner.clients.lock().expect("clients mutex").remove(&id);
    let _ = inner.events.send(ServerEvent::Disconnected {
        client,
        code: close_code,
        reason: close_reason,
    });
    log::debug!("client {id} disconnected");
    drop(slot);
}
