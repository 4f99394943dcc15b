//! The frontline's role adapter: originates a stream on inbound `Connect`
//! by dialing the requested target, otherwise routes stream frames to
//! their slot like the initiator does.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::config::Timings;
use crate::frame::Frame;
use crate::link::engine::{CommandHandler, SendQueueTx};
use crate::slot::SlotTable;
use crate::tcp::enable_keepalive;
use crate::worker::{Role, Worker};

pub struct AcceptorHandler {
    slots: Arc<SlotTable>,
    send_tx: SendQueueTx,
    timings: Timings,
}

impl AcceptorHandler {
    pub fn new(slots: Arc<SlotTable>, send_tx: SendQueueTx, timings: Timings) -> Self {
        Self {
            slots,
            send_tx,
            timings,
        }
    }
}

impl CommandHandler for AcceptorHandler {
    async fn handle_link(&self, client: String) {
        info!(client, "link announced");
    }

    async fn handle_keepalive(&self) {}

    async fn handle_connect(&self, conn_id: u8, hostport: String) {
        let Some(slot) = self.slots.get(conn_id) else {
            return;
        };
        if slot.is_used() {
            info!(conn_id, "duplicate Connect for an in-use slot, dropping");
            return;
        }

        self.slots.flush_inbox(conn_id);
        let inbox = self.slots.get(conn_id).expect("just flushed").take_inbox();
        let cancel = self.slots.get(conn_id).expect("just flushed").cancel_token();

        match TcpStream::connect(&hostport).await {
            Ok(upstream) => {
                if let Err(e) = enable_keepalive(&upstream, self.timings.tcp_keepalive) {
                    warn!(error = %e, conn_id, "failed to enable SO_KEEPALIVE on upstream socket");
                }
                let ack = Frame::ConnectAck {
                    conn_id,
                    ok: true,
                }
                .pack();
                if self.send_tx.send(ack).await.is_err() {
                    return;
                }
                let worker = Worker::spawn(
                    conn_id,
                    Role::Acceptor,
                    upstream,
                    self.slots.clone(),
                    self.send_tx.clone(),
                    inbox,
                    cancel,
                    self.timings.clone(),
                );
                tokio::spawn(worker.run());
            }
            Err(e) => {
                warn!(error = %e, conn_id, hostport, "outbound dial failed");
                let ack = Frame::ConnectAck {
                    conn_id,
                    ok: false,
                }
                .pack();
                let _ = self.send_tx.send(ack).await;
                // No worker ever ran for this occupancy, so there is
                // nothing to straggle: release immediately rather than
                // quarantining.
                self.slots.free(conn_id, Duration::ZERO);
            }
        }
    }

    async fn handle_connect_ack(&self, conn_id: u8, _ok: bool) {
        warn!(conn_id, "frontline received ConnectAck, which only flows the other way; ignoring");
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
