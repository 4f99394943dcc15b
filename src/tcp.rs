//! TCP socket tuning shared by both endpoints.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Enables SO_KEEPALIVE with `interval` as both the idle time and the probe
/// interval, on an already-connected (accepted or dialed) socket.
pub fn enable_keepalive(stream: &TcpStream, interval: Duration) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(interval).with_interval(interval);
    sock.set_tcp_keepalive(&keepalive)
}
