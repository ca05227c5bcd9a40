//! Link statistics.
//!
//! The worker updates [`Counters`] while clients read consistent-enough
//! [`LinkStats`] snapshots. Counters are reset at every open.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about link operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    /// Transmit exchanges that completed.
    pub frames_sent: u64,

    /// Receive (probe + fetch) operations that completed with payload.
    pub frames_received: u64,

    /// Payload bytes sent.
    pub bytes_sent: u64,

    /// Payload bytes received, including full-duplex carry.
    pub bytes_received: u64,

    /// Transmit exchanges that failed.
    pub tx_failures: u64,

    /// Receive exchanges that failed.
    pub rx_failures: u64,

    /// Transmits shortened to a non-zero credit.
    pub credit_retries: u64,

    /// Transmits deferred because credit was zero.
    pub credit_delays: u64,

    /// Status bytes with the pending-error bit.
    pub pending_errors: u64,

    /// Handshakes that timed out.
    pub handshake_timeouts: u64,

    /// Inbound bytes dropped because the read ring was full.
    pub read_overruns: u64,

    /// Client bytes dropped because the write ring was full.
    pub write_drops: u64,
}

impl LinkStats {
    /// Returns the transmit failure rate as a percentage.
    pub fn tx_failure_rate(&self) -> f32 {
        let attempts = self.frames_sent + self.tx_failures;
        if attempts == 0 {
            0.0
        } else {
            (self.tx_failures as f32 / attempts as f32) * 100.0
        }
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub(crate) frames_sent: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) tx_failures: AtomicU64,
    pub(crate) rx_failures: AtomicU64,
    pub(crate) credit_retries: AtomicU64,
    pub(crate) credit_delays: AtomicU64,
    pub(crate) pending_errors: AtomicU64,
    pub(crate) handshake_timeouts: AtomicU64,
    pub(crate) read_overruns: AtomicU64,
    pub(crate) write_drops: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        LinkStats {
            frames_sent: get(&self.frames_sent),
            frames_received: get(&self.frames_received),
            bytes_sent: get(&self.bytes_sent),
            bytes_received: get(&self.bytes_received),
            tx_failures: get(&self.tx_failures),
            rx_failures: get(&self.rx_failures),
            credit_retries: get(&self.credit_retries),
            credit_delays: get(&self.credit_delays),
            pending_errors: get(&self.pending_errors),
            handshake_timeouts: get(&self.handshake_timeouts),
            read_overruns: get(&self.read_overruns),
            write_drops: get(&self.write_drops),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.frames_sent,
            &self.frames_received,
            &self.bytes_sent,
            &self.bytes_received,
            &self.tx_failures,
            &self.rx_failures,
            &self.credit_retries,
            &self.credit_delays,
            &self.pending_errors,
            &self.handshake_timeouts,
            &self.read_overruns,
            &self.write_drops,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
