//! Tunable timings shared by both endpoints.
//!
//! Centralizing these in one `Default`-backed struct (rather than scattering
//! the literal constants through the engine, slot table, and worker) lets a
//! test construct a `Timings` with compressed windows instead of waiting out
//! the real 60-second quarantine or the 2-minute keepalive timeout.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Timings {
    /// How often the Link Engine sends `Keepalive` and checks liveness.
    pub keepalive_interval: Duration,
    /// No inbound frame for longer than this declares the link dead.
    pub keepalive_timeout: Duration,
    /// Post-termination window during which a slot cannot be reallocated.
    pub quarantine: Duration,
    /// A stream with no inbound activity for longer than this is torn down.
    pub idle_watchdog: Duration,
    /// Grace period the Link Engine sleeps after `clean_all` returns,
    /// before the outer process reconnects or resumes accepting.
    pub drain_grace: Duration,
    /// How long the initiator's local-accept path polls for a free slot
    /// before failing closed.
    pub slot_acquire_deadline: Duration,
    /// Poll interval used while waiting for a free slot.
    pub slot_acquire_poll: Duration,
    /// Interval between dial retries when the initiator cannot reach the
    /// frontline.
    pub dial_retry_interval: Duration,
    /// Per-call read deadline on both the link socket and local stream
    /// sockets.
    pub read_deadline: Duration,
    /// Local Reader throttle: a read that completed within this long and
    /// was smaller than half its buffer waits this long before the next
    /// read.
    pub local_read_throttle: Duration,
    /// SO_KEEPALIVE probe interval applied to every accepted or dialed TCP
    /// socket.
    pub tcp_keepalive: Duration,
    /// Stream Worker's periodic idle-watchdog tick.
    pub worker_tick: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(120),
            quarantine: Duration::from_secs(60),
            idle_watchdog: Duration::from_secs(3600),
            worker_tick: Duration::from_secs(60),
            drain_grace: Duration::from_secs(3),
            slot_acquire_deadline: Duration::from_secs(60),
            slot_acquire_poll: Duration::from_secs(1),
            dial_retry_interval: Duration::from_secs(1),
            read_deadline: Duration::from_secs(1),
            local_read_throttle: Duration::from_millis(100),
            tcp_keepalive: Duration::from_secs(60),
        }
    }
}

impl Timings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quarantine(mut self, d: Duration) -> Self {
        self.quarantine = d;
        self
    }

    pub fn with_keepalive_timeout(mut self, d: Duration) -> Self {
        self.keepalive_timeout = d;
        self
    }

    pub fn with_idle_watchdog(mut self, d: Duration) -> Self {
        self.idle_watchdog = d;
        self
    }

    pub fn with_slot_acquire_deadline(mut self, d: Duration) -> Self {
        self.slot_acquire_deadline = d;
        self
    }
}

/// Fixed local-socket read buffer sizes, per §4.5: the initiator reads
/// small interactive chunks, the acceptor reads bulk upstream responses.
pub const INITIATOR_LOCAL_BUF: usize = 1024;
pub const ACCEPTOR_LOCAL_BUF: usize = 16384;

/// Link Receiver's sliding read buffer.
pub const LINK_READ_BUF: usize = 64 * 1024;
/// Compaction threshold for the Link Receiver's buffer.
pub const LINK_COMPACT_THRESHOLD: usize = 32 * 1024;

/// Number of preallocated stream slots.
pub const SLOT_COUNT: usize = 256;
/// Bounded capacity of a slot's inbound frame queue.
pub const SLOT_INBOX_CAP: usize = 32;
/// Bounded capacity of the shared outbound send queue.
pub const SEND_QUEUE_CAP: usize = 256;
/// Maximum length of a local HTTP CONNECT request line.
pub const MAX_CONNECT_REQUEST_LEN: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timings_match_the_documented_constants() {
        let t = Timings::default();
        assert_eq!(t.keepalive_interval, Duration::from_secs(60));
        assert_eq!(t.keepalive_timeout, Duration::from_secs(120));
        assert_eq!(t.quarantine, Duration::from_secs(60));
        assert_eq!(t.idle_watchdog, Duration::from_secs(3600));
    }

    #[test]
    fn builder_overrides_individual_fields() {
        let t = Timings::new().with_quarantine(Duration::from_millis(10));
        assert_eq!(t.quarantine, Duration::from_millis(10));
        assert_eq!(t.keepalive_timeout, Duration::from_secs(120));
    }
}
