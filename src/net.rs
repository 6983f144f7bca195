//! Small networking helpers.

use tokio::net::TcpListener;

use crate::Result;

/// Identification string used for the default `User-Agent` and `Server`
/// headers. Callers can override both per endpoint / per server.
pub(crate) const SERVER_AGENT: &str = concat!("windlass/", env!("CARGO_PKG_VERSION"));

/// Asks the OS for a currently free TCP port on the loopback interface.
///
/// The port is released before returning, so it is only a best-effort
/// reservation; tests that need a listener should bind `127.0.0.1:0`
/// directly and keep the listener.
pub async fn free_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}
