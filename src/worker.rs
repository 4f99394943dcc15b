//! Stream Worker: drives one stream's state machine on top of a slot and a
//! local TCP socket, plus its Local Reader (the throttled byte pump that
//! turns local socket reads into outbound `Data` frames).

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{instrument, warn};

use crate::cancel::CancelToken;
use crate::config::Timings;
use crate::frame::Frame;
use crate::link::engine::SendQueueTx;
use crate::slot::SlotTable;

/// Which endpoint this worker belongs to. Only changes three things versus
/// the otherwise-identical state machine: the Local Reader's buffer size,
/// whether the stream starts `connected`, and whether inbound `ConnectAck`
/// is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Backline: accepts local HTTP CONNECT clients, relays ConnectAck to
    /// them as an HTTP response.
    Initiator,
    /// Frontline: dials the requested upstream itself, already connected
    /// by the time its worker starts.
    Acceptor,
}

impl Role {
    fn local_buf_size(self) -> usize {
        match self {
            Role::Initiator => crate::config::INITIATOR_LOCAL_BUF,
            Role::Acceptor => crate::config::ACCEPTOR_LOCAL_BUF,
        }
    }
}

/// One non-empty read (or an empty one standing in for the
/// read-error/EOF sentinel) plus the worker's acknowledgement channel —
/// the Local Reader blocks on this ack before issuing its next read.
type LocalReadEvent = (Bytes, oneshot::Sender<()>);

struct LocalReader {
    read_half: OwnedReadHalf,
    buf_size: usize,
    timings: Timings,
    cancel: CancelToken,
    tx: mpsc::Sender<LocalReadEvent>,
}

impl LocalReader {
    #[instrument(skip(self), name = "local_reader")]
    async fn run(mut self) {
        let mut buf = vec![0u8; self.buf_size];
        loop {
            let read_start = Instant::now();
            let n = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.push(Bytes::new()).await;
                    return;
                }
                result = tokio::time::timeout(self.timings.read_deadline, self.read_half.read(&mut buf)) => {
                    match result {
                        Err(_elapsed) => continue,
                        Ok(Err(e)) => {
                            warn!(error = %e, "local read failed");
                            self.push(Bytes::new()).await;
                            return;
                        }
                        Ok(Ok(0)) => {
                            self.push(Bytes::new()).await;
                            return;
                        }
                        Ok(Ok(n)) => n,
                    }
                }
            };

            let chunk = Bytes::copy_from_slice(&buf[..n]);
            if !self.push(chunk).await {
                return;
            }

            let elapsed = read_start.elapsed();
            if elapsed < self.timings.local_read_throttle && n < self.buf_size / 2 {
                tokio::time::sleep(self.timings.local_read_throttle).await;
            }
        }
    }

    /// Sends one event and waits for the worker's acknowledgement —
    /// the stream-level backpressure handoff. Returns `false` if the
    /// worker is gone.
    async fn push(&self, chunk: Bytes) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send((chunk, ack_tx)).await.is_err() {
            return false;
        }
        ack_rx.await.is_ok()
    }
}

pub struct Worker {
    id: u8,
    role: Role,
    slots: Arc<SlotTable>,
    send_tx: SendQueueTx,
    write_half: OwnedWriteHalf,
    inbox: mpsc::Receiver<Frame>,
    local_rx: mpsc::Receiver<LocalReadEvent>,
    cancel: CancelToken,
    timings: Timings,
}

impl Worker {
    /// Spawns the Local Reader and builds a `Worker` ready for `run`.
    /// `socket` is the local client connection (initiator) or the dialed
    /// upstream connection (acceptor).
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: u8,
        role: Role,
        socket: tokio::net::TcpStream,
        slots: Arc<SlotTable>,
        send_tx: SendQueueTx,
        inbox: mpsc::Receiver<Frame>,
        cancel: CancelToken,
        timings: Timings,
    ) -> Self {
        let (read_half, write_half) = socket.into_split();
        let (local_tx, local_rx) = mpsc::channel(1);
        let reader = LocalReader {
            read_half,
            buf_size: role.local_buf_size(),
            timings: timings.clone(),
            cancel: cancel.clone(),
            tx: local_tx,
        };
        tokio::spawn(reader.run());

        Worker {
            id,
            role,
            slots,
            send_tx,
            write_half,
            inbox,
            local_rx,
            cancel,
            timings,
        }
    }

    /// Drives the stream's state machine until termination, then
    /// quarantines the slot. Consumes the worker.
    #[instrument(skip(self), fields(conn_id = self.id), name = "stream_worker")]
    pub async fn run(mut self) {
        if self.role == Role::Acceptor {
            if let Some(slot) = self.slots.get(self.id) {
                slot.set_connected(true);
            }
        }

        let mut idle_tick = tokio::time::interval(self.timings.worker_tick);
        idle_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                frame = self.inbox.recv() => {
                    match frame {
                        None => break,
                        Some(f) => {
                            last_inbound = Instant::now();
                            if !self.handle_inbound(f).await {
                                break;
                            }
                        }
                    }
                }
                event = self.local_rx.recv() => {
                    match event {
                        None => break,
                        Some((chunk, ack)) => {
                            if chunk.is_empty() {
                                let _ = ack.send(());
                                self.emit_disconnect().await;
                                break;
                            }
                            self.emit_data(chunk).await;
                            let _ = ack.send(());
                        }
                    }
                }
                _ = idle_tick.tick() => {
                    if last_inbound.elapsed() > self.timings.idle_watchdog {
                        break;
                    }
                }
                _ = self.cancel.cancelled() => {
                    break;
                }
            }
        }

        self.terminate().await;
    }

    /// Handles one inbound frame. Returns `false` if the stream should
    /// terminate.
    async fn handle_inbound(&mut self, frame: Frame) -> bool {
        let Some(slot) = self.slots.get(self.id) else {
            return false;
        };
        match frame {
            Frame::ConnectAck { ok, .. } => {
                if self.role == Role::Initiator {
                    if slot.is_connected() {
                        return true;
                    }
                    if !ok {
                        let _ = self
                            .write_half
                            .write_all(b"HTTP/1.0 400 Bad Request\r\n\r\n")
                            .await;
                        return false;
                    }
                    let _ = self
                        .write_half
                        .write_all(b"HTTP/1.0 200 Established\r\n\r\n")
                        .await;
                    slot.set_connected(true);
                }
                true
            }
            Frame::Data {
                conn_id,
                seq,
                payload,
            } => {
                // Mismatches are logged by `accept_seq_remote` and treated
                // best-effort rather than torn down.
                slot.accept_seq_remote(seq);
                let ack = Frame::DataAck {
                    conn_id,
                    seq,
                    datalen: payload.len() as u16,
                }
                .pack();
                let _ = self.send_tx.send(ack).await;
                if !payload.is_empty() && self.write_half.write_all(&payload).await.is_err() {
                    return false;
                }
                true
            }
            // Reserved for future windowing; accepted but currently a no-op.
            Frame::DataAck { .. } => true,
            Frame::Disconnect { .. } => false,
            Frame::Link { .. } | Frame::Keepalive | Frame::Connect { .. } => true,
        }
    }

    async fn emit_data(&mut self, payload: Bytes) {
        let Some(slot) = self.slots.get(self.id) else {
            return;
        };
        let seq = slot.next_seq_local();
        let frame = Frame::Data {
            conn_id: self.id,
            seq,
            payload,
        };
        let _ = self.send_tx.send(frame.pack()).await;
    }

    async fn emit_disconnect(&mut self) {
        let frame = Frame::Disconnect { conn_id: self.id };
        let _ = self.send_tx.send(frame.pack()).await;
    }

    /// Fires cancellation (in case it wasn't already, so the Local Reader
    /// also stops), drains the Local Reader's remaining events up to and
    /// including its sentinel, sleeps the drain grace, then releases the
    /// slot into quarantine.
    async fn terminate(mut self) {
        self.cancel.cancel();
        while let Some((chunk, ack)) = self.local_rx.recv().await {
            let _ = ack.send(());
            if chunk.is_empty() {
                break;
            }
        }
        tokio::time::sleep(self.timings.drain_grace).await;
        self.slots.free(self.id, self.timings.quarantine);
    }
}
