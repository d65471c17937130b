//! Per-neighbor receive window.
//!
//! Tracks which sequences have been received and which have been delivered
//! upstream, carries the explicit-NAK rate limiter, and accumulates the
//! receiver-side EVM/RSSI statistics that are echoed back to the sender.
//!
//! Invariants:
//! - `ack <= max + 1`
//! - entries below `ack` are empty
//! - with in-order delivery enforced, at most one hole exists in
//!   `[ack, max]` at delivery time

use crate::clock::MonoTime;
use crate::estimator::TimeWindowedEma;
use crate::packet::{NodeId, RadioPacket};
use crate::seq::Seq;

/// One slot of the receive window.
#[derive(Debug, Default)]
pub struct RecvEntry {
    /// The sequence has been received.
    pub received: bool,
    /// The packet has already been handed upstream.
    pub delivered: bool,
    /// The packet itself, parked until delivery.
    pub pkt: Option<RadioPacket>,
}

impl RecvEntry {
    /// Return the slot to the empty state.
    pub fn reset(&mut self) {
        self.received = false;
        self.delivered = false;
        self.pkt = None;
    }

    /// Mark a packet that was delivered immediately, out of order.
    pub fn already_delivered(&mut self) {
        self.received = true;
        self.delivered = true;
        self.pkt = None;
    }
}

/// Per-neighbor ARQ receiver state.
#[derive(Debug)]
pub struct RecvWindow {
    /// The neighbor this window receives from.
    pub node: NodeId,
    /// Next sequence number to cumulatively ACK.
    pub ack: Seq,
    /// Largest sequence number received.
    pub max: Seq,
    /// RX timestamp of the packet that set `max`.
    pub max_timestamp: MonoTime,
    /// Window size.
    pub win: u16,
    /// A selective ACK should be attached to the next outbound packet.
    pub need_selective_ack: bool,
    /// The armed timer is the pure-ACK phase rather than the SACK phase.
    pub timer_for_ack: bool,
    /// Receiver-side long-term EVM [dB].
    pub long_evm: TimeWindowedEma,
    /// Receiver-side long-term RSSI [dB].
    pub long_rssi: TimeWindowedEma,
    entries: Vec<RecvEntry>,
    explicit_nak_win: Vec<Option<MonoTime>>,
    explicit_nak_idx: usize,
}

impl RecvWindow {
    /// Create a window for `node` starting at `start`.
    ///
    /// `explicit_nak_win` bounds how many NAKs may be outstanding within
    /// the rate-limit duration; zero disables explicit NAKs entirely.
    pub fn new(
        node: NodeId,
        start: Seq,
        win: u16,
        explicit_nak_win: usize,
        stats_tau_secs: f64,
    ) -> RecvWindow {
        let win = win.max(1);
        let mut entries = Vec::with_capacity(win as usize);
        entries.resize_with(win as usize, RecvEntry::default);

        RecvWindow {
            node,
            ack: start,
            max: start.sub(1),
            max_timestamp: MonoTime::ZERO,
            win,
            need_selective_ack: false,
            timer_for_ack: false,
            long_evm: TimeWindowedEma::new(stats_tau_secs),
            long_rssi: TimeWindowedEma::new(stats_tau_secs),
            entries,
            explicit_nak_win: vec![None; explicit_nak_win],
            explicit_nak_idx: 0,
        }
    }

    /// The entry slot for `seq`.
    pub fn entry(&self, seq: Seq) -> &RecvEntry {
        &self.entries[seq.0 as usize % self.win as usize]
    }

    /// The entry slot for `seq`, mutable.
    pub fn entry_mut(&mut self, seq: Seq) -> &mut RecvEntry {
        &mut self.entries[seq.0 as usize % self.win as usize]
    }

    /// Record `seq` as the new maximum if it is beyond the current one.
    pub fn update_max(&mut self, seq: Seq, timestamp: MonoTime) {
        if seq > self.max {
            self.max = seq;
            self.max_timestamp = timestamp;
        }
    }

    /// True if `seq` would land inside the current window.
    pub fn in_window(&self, seq: Seq) -> bool {
        seq >= self.ack && seq < self.ack.add(self.win)
    }

    /// Consult and update the explicit-NAK rate limiter.
    ///
    /// Allows at most `explicit_nak_win` NAKs per `duration_secs`; each
    /// allowed NAK overwrites the oldest slot of the ring.
    pub fn nak_allowed(&mut self, now: MonoTime, duration_secs: f64) -> bool {
        if self.explicit_nak_win.is_empty() {
            return false;
        }

        if let Some(oldest) = self.explicit_nak_win[self.explicit_nak_idx] {
            if oldest + std::time::Duration::from_secs_f64(duration_secs) > now {
                return false;
            }
        }

        self.explicit_nak_win[self.explicit_nak_idx] = Some(now);
        self.explicit_nak_idx = (self.explicit_nak_idx + 1) % self.explicit_nak_win.len();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_window() {
        let w = RecvWindow::new(3, Seq(10), 8, 2, 1.0);
        assert_eq!(w.ack, Seq(10));
        assert_eq!(w.max, Seq(9));
        assert!(w.ack <= w.max.next());
        assert!(w.in_window(Seq(10)));
        assert!(w.in_window(Seq(17)));
        assert!(!w.in_window(Seq(18)));
    }

    #[test]
    fn test_update_max_ignores_older() {
        let mut w = RecvWindow::new(3, Seq(0), 8, 0, 1.0);
        w.update_max(Seq(5), MonoTime::from_nanos(100));
        w.update_max(Seq(3), MonoTime::from_nanos(200));

        assert_eq!(w.max, Seq(5));
        assert_eq!(w.max_timestamp, MonoTime::from_nanos(100));
    }

    #[test]
    fn test_nak_rate_limit() {
        let mut w = RecvWindow::new(3, Seq(0), 8, 2, 1.0);
        let t0 = MonoTime::from_secs_f64(100.0);

        // Two NAKs allowed within the duration, the third suppressed
        assert!(w.nak_allowed(t0, 1.0));
        assert!(w.nak_allowed(t0, 1.0));
        assert!(!w.nak_allowed(t0, 1.0));

        // After the duration elapses the ring reopens
        let t1 = MonoTime::from_secs_f64(101.5);
        assert!(w.nak_allowed(t1, 1.0));
    }

    #[test]
    fn test_zero_nak_window_suppresses_all() {
        let mut w = RecvWindow::new(3, Seq(0), 8, 0, 1.0);
        assert!(!w.nak_allowed(MonoTime::from_secs_f64(5.0), 0.1));
    }

    #[test]
    fn test_entry_lifecycle() {
        let mut w = RecvWindow::new(3, Seq(0), 4, 0, 1.0);

        let e = w.entry_mut(Seq(2));
        assert!(!e.received);
        e.already_delivered();
        assert!(e.received && e.delivered);

        e.reset();
        assert!(!e.received && !e.delivered && e.pkt.is_none());
    }
}
