//! The outer accept/reconnect loops around the multiplexer core.
//!
//! Everything in [`crate::link`], [`crate::worker`] and [`crate::role`] is
//! agnostic to how the link socket came to exist. This module supplies that:
//! `run_initiator` dials out and reconnects forever; `run_acceptor` listens
//! and serves one link at a time. Both are thin enough that `backline` and
//! `frontline` are little more than CLI parsing wrapped around them.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, instrument, warn};

use crate::config::Timings;
use crate::error::Result;
use crate::frame::Frame;
use crate::link;
use crate::role::{accept_local, AcceptorHandler, InitiatorHandler};
use crate::slot::SlotTable;
use crate::tcp::enable_keepalive;

/// `TcpListener::bind` resolves its argument through `ToSocketAddrs`, which
/// has no notion of an empty host meaning "every interface" the way Go's
/// `net.Listen` does — `":8443"` fails to resolve as-is. Normalize the
/// bare-port shorthand to the unspecified IPv4 address before binding.
fn normalize_listen_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

/// This process's identity in the `Link` handshake: `<hostname>-<pid>`, e.g.
/// `host-42`. Falls back to the literal string `"unknown"` if the hostname
/// cannot be determined, rather than failing the handshake over it.
fn client_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{host}-{}", std::process::id())
}

/// Runs the backline (initiator) forever: binds `listen_addr` once, then
/// repeatedly dials `frontline_addr`, serving local `CONNECT` clients
/// against whichever link is currently up. A dial failure retries after
/// `timings.dial_retry_interval`; a link that dies mid-session is
/// reconnected the same way. Only returns on a listener bind failure.
#[instrument(skip(timings))]
pub async fn run_initiator(frontline_addr: String, listen_addr: String, timings: Timings) -> Result<()> {
    let listener = TcpListener::bind(normalize_listen_addr(&listen_addr)).await?;
    info!(listen_addr, frontline_addr, "backline listening for local CONNECT clients");

    loop {
        let link_socket = dial_with_retry(&frontline_addr, &timings).await;
        let slots = Arc::new(SlotTable::new());
        let (send_tx, _running, mut engine_handle) = link::spawn(
            link_socket,
            |_send_tx| InitiatorHandler::new(slots.clone()),
            slots.clone(),
            timings.clone(),
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, _peer)) => {
                            if let Err(e) = enable_keepalive(&socket, timings.tcp_keepalive) {
                                warn!(error = %e, "failed to enable SO_KEEPALIVE on local client socket");
                            }
                            let accept_task = accept_local(
                                socket,
                                slots.clone(),
                                send_tx.clone(),
                                timings.clone(),
                            );
                            tokio::spawn(async move {
                                if let Err(e) = accept_task.await {
                                    warn!(error = %e, "local CONNECT client rejected");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "local accept failed"),
                    }
                }
                result = &mut engine_handle => {
                    match result {
                        Ok(Err(e)) => warn!(error = %e, "link lost, will reconnect"),
                        Ok(Ok(())) => info!("link closed, will reconnect"),
                        Err(e) => warn!(error = %e, "link engine task panicked, will reconnect"),
                    }
                    break;
                }
            }
        }
    }
}

/// Dials `addr` once per `dial_retry_interval` until it succeeds, sends the
/// `Link` handshake, and returns the connected socket ready for
/// [`link::spawn`].
async fn dial_with_retry(addr: &str, timings: &Timings) -> TcpStream {
    loop {
        match TcpStream::connect(addr).await {
            Ok(mut stream) => {
                if let Err(e) = enable_keepalive(&stream, timings.tcp_keepalive) {
                    warn!(error = %e, "failed to enable SO_KEEPALIVE on link socket");
                }
                let hello = Frame::Link {
                    client: client_identity(),
                }
                .pack();
                if stream.write_all(&hello).await.is_ok() {
                    info!(addr, "link established");
                    return stream;
                }
                warn!(addr, "link dropped before handshake completed, retrying");
            }
            Err(e) => {
                warn!(error = %e, addr, "dial failed, retrying");
            }
        }
        tokio::time::sleep(timings.dial_retry_interval).await;
    }
}

/// Runs the frontline (acceptor) forever: binds `listen_addr` and serves one
/// link at a time, returning to `accept()` once a link ends. Only returns on
/// a listener bind failure.
#[instrument(skip(timings))]
pub async fn run_acceptor(listen_addr: String, timings: Timings) -> Result<()> {
    let listener = TcpListener::bind(normalize_listen_addr(&listen_addr)).await?;
    info!(listen_addr, "frontline listening for a backline link");

    loop {
        let (socket, peer) = listener.accept().await?;
        info!(%peer, "link accepted");
        if let Err(e) = enable_keepalive(&socket, timings.tcp_keepalive) {
            warn!(error = %e, "failed to enable SO_KEEPALIVE on link socket");
        }

        let slots = Arc::new(SlotTable::new());
        let (send_tx, _running, engine_handle) = link::spawn(
            socket,
            |send_tx| AcceptorHandler::new(slots.clone(), send_tx, timings.clone()),
            slots.clone(),
            timings.clone(),
        );
        drop(send_tx);

        match engine_handle.await {
            Ok(Err(e)) => warn!(%peer, error = %e, "link ended, returning to accept loop"),
            Ok(Ok(())) => info!(%peer, "link ended, returning to accept loop"),
            Err(e) => warn!(%peer, error = %e, "link engine task panicked, returning to accept loop"),
        }
    }
}
