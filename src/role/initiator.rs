//! The backline's role adapter: routes inbound stream frames to their slot,
//! and turns a locally-accepted HTTP CONNECT client into a `Connect`
//! request and a Stream Worker.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{instrument, warn};

use crate::cancel::CancelToken;
use crate::config::{Timings, MAX_CONNECT_REQUEST_LEN};
use crate::error::{Result, TunnelError};
use crate::frame::Frame;
use crate::http::read_connect_request;
use crate::link::engine::{CommandHandler, SendQueueTx};
use crate::slot::SlotTable;
use crate::worker::{Role, Worker};

/// Implements [`CommandHandler`] for the initiator (backline): every
/// stream-addressed frame is simply routed to its slot's inbox, and
/// `Connect` — which only ever flows acceptor-ward — is never expected
/// here.
pub struct InitiatorHandler {
    slots: Arc<SlotTable>,
}

impl InitiatorHandler {
    pub fn new(slots: Arc<SlotTable>) -> Self {
        Self { slots }
    }
}

impl CommandHandler for InitiatorHandler {
    async fn handle_link(&self, _client: String) {
        // The initiator sends Link, it never receives one.
    }

    async fn handle_keepalive(&self) {
        // Liveness bookkeeping happens in the Link Engine itself; nothing
        // stream-level to do here.
    }

    async fn handle_connect(&self, conn_id: u8, _hostport: String) {
        warn!(conn_id, "backline received Connect, which only flows the other way; ignoring");
    }

    async fn handle_connect_ack(&self, conn_id: u8, ok: bool) {
        self.slots.queue(Frame::ConnectAck { conn_id, ok }).await;
    }

    async fn handle_disconnect(&self, conn_id: u8) {
        self.slots.queue(Frame::Disconnect { conn_id }).await;
    }

    async fn handle_data(&self, conn_id: u8, seq: u8, payload: Bytes) {
        self.slots.queue(Frame::Data { conn_id, seq, payload }).await;
    }

    async fn handle_data_ack(&self, conn_id: u8, seq: u8, datalen: u16) {
        self.slots
            .queue(Frame::DataAck { conn_id, seq, datalen })
            .await;
    }
}

/// Drives one locally-accepted client through validation, slot acquisition,
/// and handoff to a Stream Worker. Consumes `client`; on any failure path
/// the socket is answered (where the protocol calls for it) and dropped.
/// Returns the failure reason (already logged by the caller) so it shows up
/// in whatever per-connection telemetry wraps this task, rather than being
/// swallowed here.
#[instrument(skip(client, slots, send_tx, timings))]
pub async fn accept_local(
    mut client: TcpStream,
    slots: Arc<SlotTable>,
    send_tx: SendQueueTx,
    timings: Timings,
) -> Result<()> {
    let request = match read_connect_request(&mut client, MAX_CONNECT_REQUEST_LEN).await {
        Ok(Some(req)) => req,
        Ok(None) => {
            let _ = client
                .write_all(b"HTTP/1.0 400 Bad Request\r\n\r\n")
                .await;
            return Err(TunnelError::HandshakeRejected(
                "malformed or oversized CONNECT request",
            ));
        }
        Err(e) => return Err(TunnelError::Io(e)),
    };

    // Slot exhaustion fails closed with a plain close, not a 400: §7/§6
    // reserve 400 for validation failure and ConnectAck(ok=false) — there is
    // no tunnel frame to answer here, just an unavailable local resource.
    let Some(id) = acquire_slot(&slots, &timings).await else {
        return Err(TunnelError::SlotsExhausted);
    };

    slots.flush_inbox(id);
    let slot = slots.get(id).expect("slot just flushed");
    let inbox = slot.take_inbox();
    let cancel = slot.cancel_token();

    let connect = Frame::Connect {
        conn_id: id,
        hostport: request.hostport,
    }
    .pack();
    if send_tx.send(connect).await.is_err() {
        slots.free(id, timings.quarantine);
        return Err(TunnelError::LinkClosed);
    }

    let worker = Worker::spawn(
        id,
        Role::Initiator,
        client,
        slots.clone(),
        send_tx,
        inbox,
        cancel,
        timings,
    );
    tokio::spawn(worker.run());
    Ok(())
}

/// Polls `get_free` once per `slot_acquire_poll` until it succeeds or
/// `slot_acquire_deadline` elapses.
async fn acquire_slot(slots: &SlotTable, timings: &Timings) -> Option<u8> {
    let deadline = tokio::time::Instant::now() + timings.slot_acquire_deadline;
    loop {
        if let Some(id) = slots.get_free() {
            return Some(id);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(timings.slot_acquire_poll).await;
    }
}
