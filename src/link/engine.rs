//! Link Engine: the single writer of the link socket. Multiplexes inbound
//! frames (dispatching to a role-specific Command Handler), outbound frame
//! bytes from every stream, and the keepalive tick, and polices link
//! liveness.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, instrument, warn};

use crate::config::Timings;
use crate::error::{Result, TunnelError};
use crate::frame::Frame;
use crate::link::receiver::{Handoff, RunningFlag, TermSlot};
use crate::slot::SlotTable;

/// The per-endpoint behavior that decides what an inbound frame means:
/// route it to a stream, originate one, or treat it as a protocol error.
/// Implemented once for the initiator (backline) and once for the acceptor
/// (frontline); dispatched statically, since the role is fixed at process
/// startup and never needs dynamic replacement.
///
/// Methods spell out `-> impl Future<..> + Send` rather than `async fn`
/// directly: native `async fn` in a trait leaves the returned future's
/// `Send`-ness unresolved, and `LinkEngine::run` (spawned with
/// `tokio::spawn`, which requires its whole future to be `Send`) awaits
/// these across `.await` points. Spelling the bound out is what makes
/// `engine.run()` provably `Send` in `link::spawn`'s generic context.
pub trait CommandHandler: Send + Sync {
    fn handle_link(&self, client: String) -> impl Future<Output = ()> + Send;
    fn handle_keepalive(&self) -> impl Future<Output = ()> + Send;
    fn handle_connect(&self, conn_id: u8, hostport: String) -> impl Future<Output = ()> + Send;
    fn handle_connect_ack(&self, conn_id: u8, ok: bool) -> impl Future<Output = ()> + Send;
    fn handle_disconnect(&self, conn_id: u8) -> impl Future<Output = ()> + Send;
    fn handle_data(&self, conn_id: u8, seq: u8, payload: Bytes) -> impl Future<Output = ()> + Send;
    fn handle_data_ack(
        &self,
        conn_id: u8,
        seq: u8,
        datalen: u16,
    ) -> impl Future<Output = ()> + Send;
}

/// Handle producers use to push outbound frame bytes onto the shared send
/// queue. Cloned into every Stream Worker and the Role Adapter; the Engine
/// itself holds one to push its own Keepalive frames through the same
/// path as everyone else.
pub type SendQueueTx = mpsc::Sender<Bytes>;

pub struct LinkEngine<H: CommandHandler> {
    write_half: OwnedWriteHalf,
    frame_rx: mpsc::Receiver<Handoff>,
    send_rx: mpsc::Receiver<Bytes>,
    send_tx: SendQueueTx,
    running: RunningFlag,
    term: TermSlot,
    handler: H,
    slots: Arc<SlotTable>,
    timings: Timings,
}

impl<H: CommandHandler> LinkEngine<H> {
    pub fn new(
        write_half: OwnedWriteHalf,
        frame_rx: mpsc::Receiver<Handoff>,
        send_rx: mpsc::Receiver<Bytes>,
        send_tx: SendQueueTx,
        running: RunningFlag,
        term: TermSlot,
        handler: H,
        slots: Arc<SlotTable>,
        timings: Timings,
    ) -> Self {
        Self {
            write_half,
            frame_rx,
            send_rx,
            send_tx,
            running,
            term,
            handler,
            slots,
            timings,
        }
    }

    /// Runs until link loss or keepalive failure, then tears down every
    /// active stream and returns why. The caller (the outer reconnect/accept
    /// loop) decides what happens next; `Ok(())` never actually happens
    /// today (every exit path is a failure of some kind) but is kept so a
    /// future graceful-shutdown path has somewhere to return through.
    #[instrument(skip(self), name = "link_engine")]
    pub async fn run(mut self) -> Result<()> {
        let mut tick = tokio::time::interval(self.timings.keepalive_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        let outcome = loop {
            tokio::select! {
                handoff = self.frame_rx.recv() => {
                    let Some((frame, ack)) = handoff else {
                        warn!("link receiver gone");
                        let reason = self.term.lock().unwrap().take().unwrap_or(TunnelError::LinkClosed);
                        break Err(reason);
                    };
                    last_inbound = Instant::now();
                    self.dispatch(frame).await;
                    let _ = ack.send(());
                }
                outbound = self.send_rx.recv() => {
                    let Some(bytes) = outbound else {
                        break Err(TunnelError::LinkClosed);
                    };
                    if let Err(e) = self.write_all(&bytes).await {
                        warn!(error = %e, "link write failed");
                        break Err(TunnelError::Io(e));
                    }
                }
                _ = tick.tick() => {
                    let _ = self.send_tx.try_send(Frame::Keepalive.pack());
                    if last_inbound.elapsed() > self.timings.keepalive_timeout {
                        warn!("no inbound frame within the liveness window, declaring link dead");
                        break Err(TunnelError::KeepaliveTimeout);
                    }
                }
            }
        };

        self.running.store(false, Ordering::Release);
        self.shutdown().await;
        outcome
    }

    async fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Link { client } => self.handler.handle_link(client).await,
            Frame::Keepalive => self.handler.handle_keepalive().await,
            Frame::Connect { conn_id, hostport } => {
                self.handler.handle_connect(conn_id, hostport).await
            }
            Frame::ConnectAck { conn_id, ok } => self.handler.handle_connect_ack(conn_id, ok).await,
            Frame::Disconnect { conn_id } => self.handler.handle_disconnect(conn_id).await,
            Frame::Data {
                conn_id,
                seq,
                payload,
            } => self.handler.handle_data(conn_id, seq, payload).await,
            Frame::DataAck {
                conn_id,
                seq,
                datalen,
            } => self.handler.handle_data_ack(conn_id, seq, datalen).await,
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.write_half.write_all(bytes).await
    }

    /// Cancels every in-use slot, awaits their drain, then sleeps the
    /// drain-grace window before returning.
    async fn shutdown(&self) {
        self.slots.clean_all().await;
        tokio::time::sleep(self.timings.drain_grace).await;
        info!("link engine shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;
    use crate::slot::SlotTable;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    /// A `CommandHandler` that does nothing with any inbound frame — this
    /// test only cares about the Engine's own keepalive-liveness policy,
    /// never about dispatch.
    struct NoopHandler;

    impl CommandHandler for NoopHandler {
        async fn handle_link(&self, _client: String) {}
        async fn handle_keepalive(&self) {}
        async fn handle_connect(&self, _conn_id: u8, _hostport: String) {}
        async fn handle_connect_ack(&self, _conn_id: u8, _ok: bool) {}
        async fn handle_disconnect(&self, _conn_id: u8) {}
        async fn handle_data(&self, _conn_id: u8, _seq: u8, _payload: Bytes) {}
        async fn handle_data_ack(&self, _conn_id: u8, _seq: u8, _datalen: u16) {}
    }

    async fn loopback_write_half() -> OwnedWriteHalf {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, (b, _)) = tokio::join!(TcpStream::connect(addr), async {
            listener.accept().await.unwrap()
        });
        // Keep the peer half alive for the engine's lifetime by leaking it
        // into the write side's companion task: simplest is to just forget
        // it, since this test never reads from it.
        std::mem::forget(b);
        a.unwrap().into_split().1
    }

    /// Scenario 6 from the design notes: no inbound frame arrives within the
    /// liveness window, so the Engine declares the link dead on its own tick
    /// rather than waiting on a Receiver that will never hand it anything.
    #[tokio::test]
    async fn keepalive_liveness_failure_tears_down_the_link() {
        let write_half = loopback_write_half().await;
        let (_frame_tx, frame_rx) = mpsc::channel(8);
        let (send_tx, send_rx) = mpsc::channel(8);
        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let term = Arc::new(Mutex::new(None));
        let slots = Arc::new(SlotTable::new());
        let mut fast_timings = Timings::new()
            .with_keepalive_timeout(Duration::from_millis(20))
            .with_quarantine(Duration::from_millis(5));
        fast_timings.keepalive_interval = Duration::from_millis(5);
        fast_timings.drain_grace = Duration::from_millis(1);

        let engine = LinkEngine::new(
            write_half,
            frame_rx,
            send_rx,
            send_tx,
            running,
            term,
            NoopHandler,
            slots,
            fast_timings,
        );

        let result = tokio::time::timeout(Duration::from_secs(2), engine.run())
            .await
            .expect("engine.run() should return once liveness fails, not hang");
        assert!(matches!(result, Err(TunnelError::KeepaliveTimeout)));
    }
}
