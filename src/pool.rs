//! Keep-alive connection pool for HTTP-style clients.
//!
//! Idle sockets are parked per `host:port[:tls]` key and handed back out on
//! [`ConnectionPool::acquire`]. Every acquire first evicts entries that
//! have idled past the timeout or whose socket reports closed, so a pooled
//! stream that is returned is observably open at that moment.
//!
//! A process-wide default pool exists for convenience; constructing
//! dedicated instances (one per client, one per test) is the intended way
//! to isolate behavior.

use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
    time::{Duration, Instant},
};

use tokio::net::TcpStream;

use crate::stream::MaybeTlsStream;

/// Default cap on idle entries per key.
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 4;

/// Default idle lifetime of a pooled entry.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct PooledEntry {
    stream: MaybeTlsStream<TcpStream>,
    last_used: Instant,
}

/// Thread-safe pool of idle client connections.
///
/// The mutex only guards the map; it is never held across network I/O.
pub struct ConnectionPool {
    entries: Mutex<HashMap<String, Vec<PooledEntry>>>,
    max_per_host: usize,
    idle_timeout: Duration,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS_PER_HOST, DEFAULT_IDLE_TIMEOUT)
    }
}

impl ConnectionPool {
    pub fn new(max_per_host: usize, idle_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_per_host,
            idle_timeout,
        }
    }

    /// The process-wide pool used when no dedicated instance is supplied.
    pub fn global() -> &'static ConnectionPool {
        static GLOBAL: OnceLock<ConnectionPool> = OnceLock::new();
        GLOBAL.get_or_init(ConnectionPool::default)
    }

    fn key(host: &str, port: u16, tls: bool) -> String {
        if tls {
            format!("{host}:{port}:tls")
        } else {
            format!("{host}:{port}")
        }
    }

    /// Takes the freshest live idle connection for the destination, if any.
    ///
    /// Stale and closed entries across the whole pool are evicted first.
    /// `None` means the caller should dial a new connection.
    pub fn acquire(&self, host: &str, port: u16, tls: bool) -> Option<MaybeTlsStream<TcpStream>> {
        let mut entries = self.entries.lock().expect("pool mutex");
        self.evict_locked(&mut entries);

        let bucket = entries.get_mut(&Self::key(host, port, tls))?;
        while let Some(entry) = bucket.pop() {
            if socket_is_open(&entry.stream) {
                return Some(entry.stream);
            }
            // Closed while parked; try the next one.
        }
        None
    }

    /// Returns a connection to the pool after use.
    ///
    /// Dropped instead when the socket is closed or the per-key bound is
    /// already met.
    pub fn release(&self, host: &str, port: u16, tls: bool, stream: MaybeTlsStream<TcpStream>) {
        if !socket_is_open(&stream) {
            return;
        }

        let mut entries = self.entries.lock().expect("pool mutex");
        let bucket = entries.entry(Self::key(host, port, tls)).or_default();
        if bucket.len() >= self.max_per_host {
            log::debug!("pool for {host}:{port} full, dropping connection");
            return;
        }
        bucket.push(PooledEntry {
            stream,
            last_used: Instant::now(),
        });
    }

    /// Number of idle entries currently parked for a destination.
    pub fn idle_count(&self, host: &str, port: u16, tls: bool) -> usize {
        let entries = self.entries.lock().expect("pool mutex");
        entries
            .get(&Self::key(host, port, tls))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drops every pooled connection.
    pub fn clear(&self) {
        self.entries.lock().expect("pool mutex").clear();
    }

    fn evict_locked(&self, entries: &mut HashMap<String, Vec<PooledEntry>>) {
        entries.retain(|_, bucket| {
            bucket.retain(|entry| {
                entry.last_used.elapsed() <= self.idle_timeout && socket_is_open(&entry.stream)
            });
            !bucket.is_empty()
        });
    }
}

/// Non-blocking liveness probe.
///
/// A parked keep-alive connection must have no pending bytes; readable
/// data or EOF both disqualify it.
fn socket_is_open(stream: &MaybeTlsStream<TcpStream>) -> bool {
    let mut probe = [0u8; 1];
    match stream.get_ref().try_read(&mut probe) {
        Ok(_) => false,
        Err(err) => err.kind() == std::io::ErrorKind::WouldBlock,
    }
}
