//! Link Receiver: reads the link socket, parses frames out of a sliding
//! buffer, and hands each one to the Link Engine under lock-step
//! backpressure — the receiver never parses the next frame until the
//! engine has acknowledged the previous one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::{error, instrument, warn};

use crate::config::{LINK_COMPACT_THRESHOLD, LINK_READ_BUF};
use crate::error::TunnelError;
use crate::frame::{Frame, FrameError};

/// One parsed frame plus the channel the engine uses to acknowledge having
/// finished with it, releasing the receiver to parse the next one.
pub type Handoff = (Frame, oneshot::Sender<()>);

/// Cooperative shutdown signal the Link Engine sets on link loss; checked
/// once per receiver loop iteration.
pub type RunningFlag = Arc<AtomicBool>;

/// Shared slot the Receiver fills in with the reason it stopped, just
/// before the `Handoff` channel closes, so the Engine can report *why*
/// the link died rather than only that it died.
pub type TermSlot = Arc<Mutex<Option<TunnelError>>>;

pub struct LinkReceiver {
    socket: OwnedReadHalf,
    tx: mpsc::Sender<Handoff>,
    running: RunningFlag,
    term: TermSlot,
    read_deadline: Duration,
    buf: BytesMut,
    filled: usize,
    consumed: usize,
}

impl LinkReceiver {
    pub fn new(
        socket: OwnedReadHalf,
        tx: mpsc::Sender<Handoff>,
        running: RunningFlag,
        term: TermSlot,
        read_deadline: Duration,
    ) -> Self {
        Self {
            socket,
            tx,
            running,
            term,
            read_deadline,
            buf: BytesMut::zeroed(LINK_READ_BUF),
            filled: 0,
            consumed: 0,
        }
    }

    fn set_term(&self, reason: TunnelError) {
        *self.term.lock().unwrap() = Some(reason);
    }

    /// Runs until the link is lost, a fatal parse error is hit, or the
    /// engine signals cooperative shutdown via `running`.
    #[instrument(skip(self), name = "link_receiver")]
    pub async fn run(mut self) {
        loop {
            if !self.running.load(Ordering::Acquire) {
                return;
            }

            match tokio::time::timeout(self.read_deadline, self.socket.read(&mut self.buf[self.filled..])).await {
                Err(_elapsed) => continue,
                Ok(Err(e)) => {
                    warn!(error = %e, "link read failed");
                    self.set_term(TunnelError::Io(e));
                    return;
                }
                Ok(Ok(0)) => {
                    warn!("link closed by peer");
                    self.set_term(TunnelError::LinkClosed);
                    return;
                }
                Ok(Ok(n)) => {
                    self.filled += n;
                }
            }

            if !self.drain_parsed_frames().await {
                return;
            }
            self.compact();
        }
    }

    /// Parses and hands off every complete frame currently in the buffer.
    /// Returns `false` on a fatal parse error (the caller should stop).
    async fn drain_parsed_frames(&mut self) -> bool {
        loop {
            let window = &self.buf[self.consumed..self.filled];
            match Frame::parse(window) {
                Err(FrameError::Incomplete) => return true,
                Err(err @ FrameError::Invalid { reason }) => {
                    let sample_len = window.len().min(8);
                    error!(
                        reason,
                        first_bytes = ?&window[..sample_len],
                        "fatal frame parse error, tearing down link"
                    );
                    self.set_term(TunnelError::Frame(err));
                    return false;
                }
                Ok((frame, n)) => {
                    self.consumed += n;
                    let (ack_tx, ack_rx) = oneshot::channel();
                    if self.tx.send((frame, ack_tx)).await.is_err() {
                        return false;
                    }
                    // Lock-step backpressure: do not parse the next frame
                    // until the engine acknowledges this one.
                    if ack_rx.await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Slides unconsumed bytes to the front once the consumed prefix grows
    /// past the compaction threshold, or resets both offsets to zero when
    /// the buffer has been fully drained. Also slides whenever the buffer
    /// has filled completely, regardless of the threshold: a single
    /// incomplete max-size `Data` frame (up to 32771 bytes) can leave
    /// `consumed` short of the threshold while `filled` has already hit
    /// capacity, and without this branch the next read call would be
    /// handed an empty slice — indistinguishable from the peer closing
    /// the link.
    fn compact(&mut self) {
        if self.consumed == self.filled {
            self.consumed = 0;
            self.filled = 0;
        } else if self.consumed > LINK_COMPACT_THRESHOLD || self.filled == self.buf.len() {
            self.buf.copy_within(self.consumed..self.filled, 0);
            self.filled -= self.consumed;
            self.consumed = 0;
        }
    }
}
