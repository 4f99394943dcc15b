//! The link: one shared TCP connection between the two endpoints, split
//! into an independent Receiver task (owns the read half) and an Engine
//! task (owns the write half and all dispatch/liveness policy).

pub mod engine;
pub mod receiver;

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::{Timings, SEND_QUEUE_CAP};
use crate::error::Result;
use crate::slot::SlotTable;
use engine::{CommandHandler, LinkEngine, SendQueueTx};
use receiver::{Handoff, LinkReceiver, RunningFlag};

/// Splits a freshly-established link socket into its Receiver and Engine
/// halves and spawns both as independent tasks.
///
/// The handler is built by `make_handler` rather than passed in ready-made,
/// because the acceptor's [`CommandHandler`] needs a [`SendQueueTx`] of its
/// own (to answer `Connect` with `ConnectAck`) and that queue does not exist
/// until `spawn` creates it — the closure breaks what would otherwise be a
/// construction cycle. Returns the same [`SendQueueTx`] handed to the
/// closure, so the caller's Role Adapter can push further frames (e.g. the
/// initiator's local-accept path enqueuing `Connect`) onto the queue every
/// Stream Worker also uses, plus a [`RunningFlag`] the caller can observe if
/// it needs to know when the link dies.
pub fn spawn<H, F>(
    socket: TcpStream,
    make_handler: F,
    slots: Arc<SlotTable>,
    timings: Timings,
) -> (
    SendQueueTx,
    RunningFlag,
    tokio::task::JoinHandle<Result<()>>,
)
where
    H: CommandHandler + 'static,
    F: FnOnce(SendQueueTx) -> H,
{
    let (read_half, write_half) = socket.into_split();
    let (frame_tx, frame_rx) = mpsc::channel::<Handoff>(SEND_QUEUE_CAP);
    let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAP);
    let running: RunningFlag = Arc::new(AtomicBool::new(true));
    let term = Arc::new(Mutex::new(None));
    let handler = make_handler(send_tx.clone());

    let receiver = LinkReceiver::new(
        read_half,
        frame_tx,
        running.clone(),
        term.clone(),
        timings.read_deadline,
    );
    tokio::spawn(receiver.run());

    let engine = LinkEngine::new(
        write_half,
        frame_rx,
        send_rx,
        send_tx.clone(),
        running.clone(),
        term,
        handler,
        slots,
        timings,
    );
    let engine_handle = tokio::spawn(engine.run());

    (send_tx, running, engine_handle)
}
