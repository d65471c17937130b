//! Per-neighbor send window.
//!
//! Holds every in-flight packet between sequence assignment and ACK (or
//! drop), plus the PER estimators and MCS transition state that drive AMC
//! for this neighbor.
//!
//! Invariants:
//! - `unack <= max + 1`
//! - `max < unack + win`
//! - `entry(s)` is populated iff `unack <= s <= max` and `s` has neither
//!   been ACK'ed nor dropped
//! - `per_end >= unack` and `per_end` only advances

use crate::clock::MonoTime;
use crate::estimator::WindowedEma;
use crate::packet::{NetPacket, NodeId};
use crate::seq::Seq;

/// One slot of the send window.
#[derive(Debug, Default)]
pub struct SendEntry {
    /// The in-flight packet, present until ACK or drop.
    pub pkt: Option<NetPacket>,
    /// When the packet was last handed to the modulator.
    pub timestamp: MonoTime,
    /// MCS index the packet was last sent at.
    pub mcsidx: usize,
    /// Number of retransmissions so far.
    pub nretrans: u32,
}

impl SendEntry {
    /// Return the slot to the empty state.
    pub fn reset(&mut self) {
        self.pkt = None;
        self.timestamp = MonoTime::ZERO;
        self.mcsidx = 0;
        self.nretrans = 0;
    }

    /// True if a packet is in flight in this slot.
    pub fn occupied(&self) -> bool {
        self.pkt.is_some()
    }
}

/// Per-neighbor ARQ sender state.
#[derive(Debug)]
pub struct SendWindow {
    /// The neighbor this window sends to.
    pub node: NodeId,
    /// Next un-ACK'ed sequence number.
    pub unack: Seq,
    /// Largest sequence number sent.
    pub max: Seq,
    /// Current window size.
    pub win: u16,
    /// Maximum window size.
    pub maxwin: u16,
    /// All sequences below this have been scored into the PER estimators.
    pub per_end: Seq,
    /// Current MCS index for this neighbor.
    pub mcsidx: usize,
    /// Probability of transitioning up into each MCS level.
    pub mcsidx_prob: Vec<f64>,
    /// Short-window packet error rate.
    pub short_per: WindowedEma,
    /// Long-window packet error rate.
    pub long_per: WindowedEma,
    /// Receiver-reported long-term EVM [dB].
    pub long_evm: Option<f64>,
    /// Receiver-reported long-term RSSI [dB].
    pub long_rssi: Option<f64>,
    /// `unack` moved locally (by a drop); the next outbound data packet
    /// carries a SetUnack control message.
    pub locally_updated: bool,
    /// No packet has been sent in this window yet; the first one carries
    /// SYN.
    pub new_window: bool,
    entries: Vec<SendEntry>,
}

impl SendWindow {
    /// Create a window for `node` with room for `maxwin` in-flight packets.
    pub fn new(node: NodeId, maxwin: u16, nlevels: usize, mcsidx: usize) -> SendWindow {
        let maxwin = maxwin.max(1);
        let mut entries = Vec::with_capacity(maxwin as usize);
        entries.resize_with(maxwin as usize, SendEntry::default);

        SendWindow {
            node,
            unack: Seq(0),
            max: Seq(0).sub(1),
            win: maxwin,
            maxwin,
            per_end: Seq(0),
            mcsidx,
            mcsidx_prob: vec![1.0; nlevels],
            short_per: WindowedEma::new(1),
            long_per: WindowedEma::new(1),
            long_evm: None,
            long_rssi: None,
            locally_updated: false,
            new_window: true,
            entries,
        }
    }

    /// The entry slot for `seq`.
    pub fn entry(&self, seq: Seq) -> &SendEntry {
        &self.entries[seq.0 as usize % self.maxwin as usize]
    }

    /// The entry slot for `seq`, mutable.
    pub fn entry_mut(&mut self, seq: Seq) -> &mut SendEntry {
        &mut self.entries[seq.0 as usize % self.maxwin as usize]
    }

    /// True if `seq` lies within the current window.
    pub fn in_window(&self, seq: Seq) -> bool {
        seq >= self.unack && seq < self.unack.add(self.win)
    }

    /// Slide `unack` forward past empty entries, up to `max + 1`, and
    /// restore the window to its maximum size.
    ///
    /// Packets just past an ACK may have timed out and been dropped, so the
    /// advance must skip over every released slot, not only the first.
    /// Returns true if `unack` moved.
    pub fn advance(&mut self) -> bool {
        let before = self.unack;

        while self.unack <= self.max && !self.entry(self.unack).occupied() {
            self.unack = self.unack.next();
        }
        self.win = self.maxwin;

        self.unack != before
    }

    /// True if assigning `next_seq` would still fit in the window.
    pub fn seq_fits(&self, next_seq: Seq) -> bool {
        next_seq < self.unack.add(self.win)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pkt(seq: u16) -> NetPacket {
        let mut p = NetPacket::data(1, 2, Bytes::from_static(b"x"));
        p.hdr.seq = Seq(seq);
        p
    }

    fn store(w: &mut SendWindow, seq: u16) {
        let entry = w.entry_mut(Seq(seq));
        entry.pkt = Some(pkt(seq));
        if Seq(seq) > w.max {
            w.max = Seq(seq);
        }
    }

    #[test]
    fn test_new_window_invariants() {
        let w = SendWindow::new(2, 8, 4, 1);
        assert_eq!(w.unack, Seq(0));
        assert_eq!(w.max, Seq(65535));
        assert!(w.unack <= w.max.next());
        assert!(w.new_window);
        assert_eq!(w.mcsidx_prob, vec![1.0; 4]);
    }

    #[test]
    fn test_advance_skips_released_entries() {
        let mut w = SendWindow::new(2, 8, 1, 0);
        for s in 0..4 {
            store(&mut w, s);
        }

        // ACK 0, drop 1, leave 2 and 3 in flight
        w.entry_mut(Seq(0)).reset();
        w.entry_mut(Seq(1)).reset();

        assert!(w.advance());
        assert_eq!(w.unack, Seq(2));
        assert!(w.entry(Seq(2)).occupied());
    }

    #[test]
    fn test_advance_to_max_plus_one() {
        let mut w = SendWindow::new(2, 4, 1, 0);
        for s in 0..3 {
            store(&mut w, s);
            w.entry_mut(Seq(s)).reset();
        }

        w.advance();
        assert_eq!(w.unack, Seq(3));
        assert_eq!(w.unack, w.max.next());
    }

    #[test]
    fn test_window_bounds() {
        let mut w = SendWindow::new(2, 4, 1, 0);
        assert!(w.in_window(Seq(0)));
        assert!(w.in_window(Seq(3)));
        assert!(!w.in_window(Seq(4)));
        assert!(!w.in_window(Seq(65535)));

        assert!(w.seq_fits(Seq(3)));
        assert!(!w.seq_fits(Seq(4)));

        // Window of one
        let w1 = SendWindow::new(2, 1, 1, 0);
        assert!(w1.seq_fits(Seq(0)));
        assert!(!w1.seq_fits(Seq(1)));
        let _ = w;
    }

    #[test]
    fn test_entry_wraps_circularly() {
        let mut w = SendWindow::new(2, 8, 1, 0);
        w.unack = Seq(65532);
        w.max = Seq(65531);

        store(&mut w, 65533);
        assert!(w.entry(Seq(65533)).occupied());
        // 65533 and 65533 + 8 share a slot
        assert!(w.entry(Seq(65533u16.wrapping_add(8))).occupied());
    }
}
