//! The 256-entry stream slot table: allocation, routing, and the quarantine
//! discipline that keeps a freshly-reallocated slot from observing a
//! previous tenant's stragglers.

use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::{SLOT_COUNT, SLOT_INBOX_CAP};
use crate::frame::Frame;

struct SlotInner {
    used: bool,
    freeing: bool,
    connected: bool,
    seq_local: u8,
    seq_remote: u8,
    inbox_tx: mpsc::Sender<Frame>,
    inbox_rx: Option<mpsc::Receiver<Frame>>,
    cancel: CancelToken,
}

impl SlotInner {
    fn fresh() -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(SLOT_INBOX_CAP);
        Self {
            used: false,
            freeing: false,
            connected: false,
            seq_local: 0,
            seq_remote: 0,
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            cancel: CancelToken::new(),
        }
    }
}

pub struct Slot {
    pub id: u8,
    inner: Mutex<SlotInner>,
}

impl Slot {
    fn new(id: u8) -> Self {
        Self {
            id,
            inner: Mutex::new(SlotInner::fresh()),
        }
    }

    pub fn is_used(&self) -> bool {
        self.inner.lock().unwrap().used
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().unwrap().connected = connected;
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.inner.lock().unwrap().cancel.clone()
    }

    /// Takes the current generation's inbox receiver. Must be called
    /// exactly once per occupancy, right after `flush_inbox`, by whatever
    /// is about to spawn the Stream Worker for this slot.
    pub fn take_inbox(&self) -> mpsc::Receiver<Frame> {
        self.inner
            .lock()
            .unwrap()
            .inbox_rx
            .take()
            .expect("inbox receiver already taken for this occupancy")
    }

    /// Next outbound sequence number, advancing the counter mod 256.
    pub fn next_seq_local(&self) -> u8 {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.seq_local;
        inner.seq_local = seq.wrapping_add(1);
        seq
    }

    /// Records an inbound `Data(seq, ..)`. Returns `true` if `seq` matched
    /// the expected next value. Either way `seq_remote` advances past the
    /// observed sequence, mod 256 — mismatches are logged and accepted
    /// best-effort rather than torn down (see the sequence-mismatch design
    /// decision).
    pub fn accept_seq_remote(&self, seq: u8) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let expected = inner.seq_remote;
        let matched = seq == expected;
        if !matched {
            warn!(slot = self.id, expected, got = seq, "unexpected data sequence number");
        }
        inner.seq_remote = seq.wrapping_add(1);
        matched
    }
}

pub struct SlotTable {
    slots: Vec<Slot>,
    free: Mutex<Vec<u8>>,
    in_use: watch::Sender<usize>,
}

impl SlotTable {
    pub fn new() -> Self {
        let slots = (0..SLOT_COUNT).map(|id| Slot::new(id as u8)).collect();
        // Push in descending order so popping this LIFO stack yields
        // ascending ids on first allocation (0, 1, 2, ...).
        let free = (0..SLOT_COUNT as u8).rev().collect();
        let (in_use, _) = watch::channel(0);
        Self {
            slots,
            free: Mutex::new(free),
            in_use,
        }
    }

    pub fn get(&self, id: u8) -> Option<&Slot> {
        self.slots.get(id as usize)
    }

    /// Pops the head of the free list. `None` means slot exhaustion.
    pub fn get_free(&self) -> Option<u8> {
        self.free.lock().unwrap().pop()
    }

    fn put_free(&self, id: u8) {
        self.free.lock().unwrap().push(id);
    }

    /// Marks a slot `used`, resets its sequence counters, and replaces its
    /// inbox and cancellation token with fresh ones — guarantees a
    /// reallocated slot never observes debris left by a previous tenant.
    pub fn flush_inbox(&self, id: u8) {
        let slot = self.get(id).expect("flush_inbox on valid id");
        let mut inner = slot.inner.lock().unwrap();
        *inner = SlotInner::fresh();
        inner.used = true;
        drop(inner);
        self.in_use.send_modify(|n| *n += 1);
    }

    /// Routes `frame` to its addressed slot's inbox, iff that slot is
    /// `used`. Link-level frames (no `conn_id`) and frames addressed to an
    /// unused slot are silently dropped. This can await: a full inbox
    /// blocks the caller, which is the intended backpressure signal that
    /// propagates back to the Link Receiver.
    pub async fn queue(&self, frame: Frame) {
        let Some(id) = frame.conn_id() else {
            return;
        };
        let Some(slot) = self.get(id) else {
            return;
        };
        let sender = {
            let inner = slot.inner.lock().unwrap();
            if !inner.used {
                debug!(slot = id, "dropping frame addressed to unused slot");
                return;
            }
            inner.inbox_tx.clone()
        };
        if sender.send(frame).await.is_err() {
            debug!(slot = id, "inbox receiver gone, dropping frame");
        }
    }

    /// Fires the slot's cancellation token. A no-op if the slot is already
    /// in quarantine (`freeing`), matching the idempotence the source
    /// requires.
    pub fn cancel(&self, id: u8) {
        if let Some(slot) = self.get(id) {
            let inner = slot.inner.lock().unwrap();
            if inner.freeing {
                return;
            }
            inner.cancel.cancel();
        }
    }

    /// Cancels every in-use slot, then awaits until all of them report
    /// `used = false`. Replaces the source's 1-second polling loop with a
    /// watch-channel wait, per the design decision in §9.
    pub async fn clean_all(&self) {
        for id in 0..SLOT_COUNT as u8 {
            self.cancel(id);
        }
        let mut rx = self.in_use.subscribe();
        while *rx.borrow() > 0 {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Ends a stream's occupancy of `id`: marks it unused and uncontactable
    /// immediately (so `queue` silently drops any more frames addressed to
    /// it), then quarantines it for `quarantine` before it can be
    /// reallocated. Fire-and-forget: the caller does not wait on the
    /// quarantine timer.
    pub fn free(self: &std::sync::Arc<Self>, id: u8, quarantine: Duration) {
        {
            let slot = self.get(id).expect("free on valid id");
            let mut inner = slot.inner.lock().unwrap();
            inner.used = false;
            inner.connected = false;
            inner.freeing = true;
        }
        self.in_use.send_modify(|n| *n -= 1);

        let table = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(quarantine).await;
            let slot = table.get(id).expect("free on valid id");
            slot.inner.lock().unwrap().freeing = false;
            table.put_free(id);
            debug!(slot = id, "quarantine elapsed, slot reusable");
        });
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}
