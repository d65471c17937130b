//! The ARQ/AMC controller.
//!
//! The controller sits between the network queue and the modulator pool on
//! the way out, and between the demodulator pool and the network interface
//! on the way in. It owns per-neighbor send and receive windows, injects
//! ACK/NAK/HELLO control packets, runs the retransmission and selective-ACK
//! timers, and drives the adaptive MCS policy from the feedback it decodes.
//!
//! Locking: each window has its own lock, and for one neighbor `pull` and
//! `received` never run interleaved on the same send window. The neighbor
//! record lock is only ever taken while holding the corresponding window
//! lock, never the other way around.

pub mod amc;
pub mod recv_window;
pub mod send_window;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

pub use amc::AmcParams;
pub use recv_window::{RecvEntry, RecvWindow};
pub use send_window::{SendEntry, SendWindow};

use crate::clock::{MonoClock, MonoTime};
use crate::error::Result;
use crate::net::is_tcp;
use crate::packet::{CtrlMsg, NetPacket, NodeId, RadioPacket, WireTime};
use crate::neighbor::NeighborTable;
use crate::phy::McsTable;
use crate::queue::NetQueue;
use crate::seq::Seq;
use crate::timer::TimerQueue;
use crate::LinkConfig;

/// Timer handles dispatched by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArqTimer {
    /// Retransmission timer for one send-window entry.
    Retransmission { node: NodeId, seq: Seq },
    /// Selective-ACK timer for one receive window.
    SelectiveAck { node: NodeId },
    /// Periodic HELLO broadcast.
    Hello,
}

/// Sink for packets delivered upstream to the network interface.
pub type DeliverFn = Box<dyn Fn(RadioPacket) + Send + Sync>;

/// The ARQ/AMC controller.
pub struct Controller {
    cfg: Arc<LinkConfig>,
    me: NodeId,
    amc: AmcParams,
    mcs_table: Arc<McsTable>,
    neighbors: Arc<NeighborTable>,
    netq: Arc<NetQueue>,
    timers: TimerQueue<ArqTimer>,
    send: Mutex<HashMap<NodeId, Arc<Mutex<SendWindow>>>>,
    recv: Mutex<HashMap<NodeId, Arc<Mutex<RecvWindow>>>>,
    deliver: Mutex<Option<DeliverFn>>,
    echoed_timestamps: Mutex<Vec<(MonoTime, MonoTime)>>,
    rng: Mutex<StdRng>,
    /// Samples in the data region of a TX slot, set by the MAC.
    tx_slot_samps: AtomicUsize,
    /// The local node currently owns TX slots.
    can_transmit: AtomicBool,
}

impl Controller {
    /// Create a controller.
    pub fn new(
        cfg: Arc<LinkConfig>,
        mcs_table: Arc<McsTable>,
        neighbors: Arc<NeighborTable>,
        netq: Arc<NetQueue>,
    ) -> Result<Arc<Controller>> {
        let amc = cfg.amc_params(mcs_table.len())?;
        let me = neighbors.me();

        Ok(Arc::new(Controller {
            cfg,
            me,
            amc,
            mcs_table,
            neighbors,
            netq,
            timers: TimerQueue::new(),
            send: Mutex::new(HashMap::new()),
            recv: Mutex::new(HashMap::new()),
            deliver: Mutex::new(None),
            echoed_timestamps: Mutex::new(Vec::new()),
            rng: Mutex::new(StdRng::from_entropy()),
            tx_slot_samps: AtomicUsize::new(usize::MAX),
            can_transmit: AtomicBool::new(true),
        }))
    }

    /// Install the inbound delivery sink and start the timer worker.
    pub fn start(self: Arc<Self>, deliver: DeliverFn) {
        *self.deliver.lock() = Some(deliver);

        let weak = Arc::downgrade(&self);
        self.timers.start(move |key| {
            let Some(ctrl) = weak.upgrade() else { return };
            match key {
                ArqTimer::Retransmission { node, seq } => ctrl.retransmit_on_timeout(node, seq),
                ArqTimer::SelectiveAck { node } => ctrl.on_sack_timer(node),
                ArqTimer::Hello => ctrl.on_hello_timer(),
            }
        });

        if !self.cfg.hello_interval.is_zero() {
            self.timers.schedule(ArqTimer::Hello, self.cfg.hello_interval);
        }
    }

    /// Stop the timer worker and the network queue.
    pub fn stop(&self) {
        self.timers.stop();
        self.netq.stop();
    }

    /// The outbound network queue feeding this controller.
    pub fn netq(&self) -> &Arc<NetQueue> {
        &self.netq
    }

    /// The neighbor table this controller updates.
    pub fn neighbors(&self) -> &Arc<NeighborTable> {
        &self.neighbors
    }

    /// Enqueue an outbound packet from the network interface.
    pub fn push_net(&self, pkt: NetPacket) {
        self.netq.push(pkt);
    }

    /// Update the TX slot capacity used to size PER windows and validate
    /// MCS levels. Called by the MAC on (re)configuration.
    pub fn set_tx_slot_samps(&self, samps: usize) {
        self.tx_slot_samps.store(samps.max(1), Ordering::Release);
    }

    /// Tell the controller whether the local node currently owns TX slots.
    pub fn set_can_transmit(&self, can: bool) {
        self.can_transmit.store(can, Ordering::Release);
    }

    /// Timestamp pairs echoed back to us by the time master.
    pub fn echoed_timestamps(&self) -> Vec<(MonoTime, MonoTime)> {
        self.echoed_timestamps.lock().clone()
    }

    /// Reset every send window's MCS transition probabilities to 1.
    ///
    /// Used when channel conditions are known to have changed wholesale,
    /// e.g. after retuning, so past down-shifts stop penalizing levels.
    pub fn reset_mcs_transition_probabilities(&self) {
        for w in self.send.lock().values() {
            let mut sw = w.lock();
            for p in sw.mcsidx_prob.iter_mut() {
                *p = 1.0;
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Produce the next packet ready for modulation.
    ///
    /// Blocks on the internal queue; returns `None` once the queue is
    /// stopped and drained.
    pub fn pull(&self) -> Option<NetPacket> {
        loop {
            let mut pkt = self.get_packet()?;

            if pkt.hdr.flags.broadcast() {
                self.apply_broadcast_params(&mut pkt, self.cfg.broadcast_gain);
                return Some(pkt);
            }

            let nexthop = pkt.hdr.nexthop;

            // Opportunistic ACK: any packet to a neighbor we receive from
            // carries our current cumulative ACK.
            if let Some(recvw) = self.maybe_recv_window(nexthop) {
                let mut rw = recvw.lock();
                debug_assert!(rw.ack <= rw.max.next());

                pkt.hdr.flags.set_ack(true);
                pkt.ack = rw.ack;

                if rw.need_selective_ack {
                    self.append_feedback(&mut rw, &mut pkt);
                }
            }

            if pkt.data_len() != 0 {
                let sendw = self.send_window(nexthop);
                let mut sw = sendw.lock();

                // The send window may have shifted between the queue pop
                // and this point, e.g. on an ACK processed in between.
                if pkt.hdr.seq < sw.unack {
                    continue;
                }
                if !sw.in_window(pkt.hdr.seq) {
                    warn!(
                        "ARQ: packet outside send window: node={}; seq={}; unack={}; win={}",
                        nexthop, pkt.hdr.seq, sw.unack, sw.win,
                    );
                    continue;
                }

                if sw.locally_updated {
                    pkt.append_ctrl(CtrlMsg::SetUnack { unack: sw.unack });
                    sw.locally_updated = false;
                }

                let nbr_arc = self.neighbors.entry(nexthop);
                let nbr = nbr_arc.lock();

                let mcsidx = if nbr.can_transmit {
                    if pkt.internal.retransmission
                        && pkt.deadline.is_some()
                        && pkt.mcsidx == sw.mcsidx
                        && sw.mcsidx > self.amc.mcsidx_min
                        && self.cfg.decrease_retrans_mcsidx
                    {
                        sw.mcsidx - 1
                    } else {
                        sw.mcsidx
                    }
                } else {
                    // A mute destination gives us no feedback to adapt on
                    self.cfg.mcsidx_init.min(self.mcs_table.len() - 1)
                };

                pkt.mcsidx = mcsidx;
                pkt.gain = nbr.gain * self.mcs_table.entry(mcsidx).autogain.get();
                drop(nbr);

                let is_retrans = pkt.internal.retransmission;
                let seq = pkt.hdr.seq;

                let entry = sw.entry_mut(seq);
                entry.pkt = Some(pkt.clone());
                entry.timestamp = MonoClock::now();
                entry.mcsidx = mcsidx;
                if is_retrans {
                    entry.nretrans += 1;
                } else {
                    entry.nretrans = 0;
                }

                if seq > sw.max {
                    sw.max = seq;
                }

                debug!("ARQ: send: node={}; seq={}; mcsidx={}", nexthop, seq, mcsidx);
            } else {
                self.apply_broadcast_params(&mut pkt, self.cfg.ack_gain);
            }

            return Some(pkt);
        }
    }

    fn apply_broadcast_params(&self, pkt: &mut NetPacket, gain: f32) {
        let mcsidx = self.cfg.mcsidx_broadcast.min(self.mcs_table.len() - 1);
        pkt.mcsidx = mcsidx;
        pkt.gain = gain * self.mcs_table.entry(mcsidx).autogain.get();
    }

    /// Pop the next sendable packet from the network queue, assigning a
    /// sequence number to packets that don't have one yet.
    fn get_packet(&self) -> Option<NetPacket> {
        loop {
            let mut pkt = self.netq.pop()?;

            if pkt.hdr.flags.broadcast() || pkt.data_len() == 0 {
                return Some(pkt);
            }

            let nexthop = pkt.hdr.nexthop;
            let sendw = self.send_window(nexthop);
            let mut sw = sendw.lock();

            if !pkt.internal.has_seq {
                let nbr_arc = self.neighbors.entry(nexthop);
                let mut nbr = nbr_arc.lock();

                // If the window is full but the head has exhausted its
                // retransmissions, drop it so the window advances.
                if !sw.seq_fits(nbr.seq) && self.cfg.move_along && sw.win > 1 {
                    let head = sw.unack;
                    let head_exhausted = sw.entry(head).occupied()
                        && sw.entry(head)
                            .pkt
                            .as_ref()
                            .is_some_and(|p| !p.hdr.flags.syn())
                        && self
                            .cfg
                            .max_retransmissions
                            .is_some_and(|m| sw.entry(head).nretrans >= m);

                    if head_exhausted {
                        self.drop_entry(&mut sw, head);
                    }
                }

                if !sw.seq_fits(nbr.seq) {
                    warn!("ARQ: dropping due to full window: node={}", nexthop);
                    continue;
                }

                pkt.hdr.seq = nbr.seq;
                nbr.seq = nbr.seq.next();
                pkt.internal.has_seq = true;

                if sw.new_window {
                    pkt.hdr.flags.set_syn(true);
                    sw.new_window = false;
                }

                // Window now full: pause the queue for this destination
                // unless the head can be dropped out of the way.
                if !sw.seq_fits(nbr.seq) {
                    let head_droppable = self.cfg.move_along
                        && sw.win > 1
                        && self.cfg.max_retransmissions.is_some()
                        && sw.entry(sw.unack)
                            .pkt
                            .as_ref()
                            .map_or(true, |p| !p.hdr.flags.syn());

                    if !head_droppable {
                        self.netq.set_send_window_status(nexthop, false);
                    }
                }

                return Some(pkt);
            }

            // A retransmission could have snuck in just before the send
            // window moved forward.
            if pkt.hdr.seq < sw.unack {
                continue;
            }
            if !sw.in_window(pkt.hdr.seq) {
                warn!(
                    "ARQ: queued packet outside send window: node={}; seq={}; unack={}",
                    nexthop, pkt.hdr.seq, sw.unack,
                );
                continue;
            }

            // Sequenced packets are dropped here, not in the queue, so the
            // window is adjusted along with the drop.
            if pkt.should_drop(MonoClock::now()) {
                let seq = pkt.hdr.seq;
                self.drop_entry(&mut sw, seq);
                continue;
            }

            return Some(pkt);
        }
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Process a packet from the demodulator.
    pub fn received(&self, pkt: RadioPacket) {
        if !pkt.header_valid {
            return;
        }
        if !pkt.hdr.flags.broadcast() && pkt.hdr.nexthop != self.me {
            return;
        }

        let prevhop = pkt.hdr.curhop;
        let now = MonoClock::now();

        let nbr_arc = self.neighbors.entry(prevhop);
        nbr_arc.lock().last_seen = Some(now);

        // A data frame with an unrecoverable payload can still be NAK'ed by
        // sequence number.
        if !pkt.payload_valid {
            if pkt.hdr.flags.has_data() {
                let recvw = self.recv_window(prevhop, pkt.hdr.seq, pkt.hdr.flags.syn());
                {
                    let mut rw = recvw.lock();
                    rw.update_max(pkt.hdr.seq, pkt.timestamp);
                    rw.long_evm.update(now, pkt.evm as f64);
                    rw.long_rssi.update(now, pkt.rssi as f64);
                }
                self.nak(prevhop, pkt.hdr.seq);
            }
            return;
        }

        if pkt.hdr.flags.has_control() {
            self.handle_ctrl(prevhop, &pkt);
        }

        if pkt.hdr.flags.broadcast() {
            if pkt.data_len() != 0 {
                let mut pkt = pkt;
                pkt.strip_ctrl();
                self.deliver(pkt);
            }
            return;
        }

        self.handle_feedback(prevhop, &pkt, now);
        self.fill_recv_window(prevhop, pkt, now);
    }

    /// Process ACK/NAK/SACK feedback against the send window for `prevhop`.
    fn handle_feedback(&self, prevhop: NodeId, pkt: &RadioPacket, now: MonoTime) {
        let Some(sendw) = self.maybe_send_window(prevhop) else {
            return;
        };

        let mut sw = sendw.lock();
        let mut tfeedback = now - self.cfg.selective_ack_feedback_delay;

        let nak = self.scan_naks(&mut sw, pkt);

        // Make sure the feedback horizon covers the NAK'ed packet itself.
        if self.cfg.demod_always_ordered {
            if let Some(n) = nak {
                let t = sw.entry(n).timestamp + Duration::from_millis(1);
                if t > tfeedback {
                    tfeedback = t;
                }
            }
        }

        if pkt.hdr.flags.ack() {
            let mut rtts: Vec<f64> = Vec::new();

            if pkt.ack > sw.unack {
                debug!(
                    "ARQ: ack: node={}; seq=[{},{})",
                    prevhop, sw.unack, pkt.ack,
                );

                // The sender could ACK something we never sent; guard on
                // max as well as the window.
                let mut unack = sw.unack;
                while unack < pkt.ack && unack <= sw.max {
                    self.release_acked(&mut sw, unack, now, &mut rtts);
                    if unack >= sw.per_end {
                        amc::tx_success(&mut sw);
                    }
                    unack = unack.next();
                }

                sw.unack = unack;

                // A retransmission may have been ACK'ed after we already
                // scored it; never rewind the PER window.
                if unack > sw.per_end {
                    sw.per_end = unack;
                }
            }

            // Selective ACKs describe packets beyond the cumulative ACK, so
            // they are handled second.
            self.handle_selective_ack(&mut sw, pkt, tfeedback);

            // A NAK for a retransmitted packet is a fresh failure; the
            // original loss was scored when the packet was first NAK'ed.
            if let Some(n) = nak {
                let entry = sw.entry(n);
                if entry.nretrans > 0 && sw.mcsidx >= entry.mcsidx {
                    amc::tx_failure(&mut sw);
                    info!(
                        "ARQ: txFailure nak of retransmission: node={}; seq={}",
                        prevhop, n,
                    );
                }
            }

            let nbr_arc = self.neighbors.entry(prevhop);
            {
                let mut nbr = nbr_arc.lock();

                for rtt in rtts {
                    nbr.ack_delay.update(rtt);
                    nbr.retransmission_delay = self
                        .cfg
                        .min_retransmission_delay
                        .as_secs_f64()
                        .max(self.cfg.retransmission_delay_slop * nbr.ack_delay.value());
                }

                amc::update_mcs(
                    &mut sw,
                    &mut nbr,
                    &self.mcs_table,
                    &self.amc,
                    self.tx_slot_samps.load(Ordering::Acquire),
                    &mut *self.rng.lock(),
                );
            }

            // Packets right after the ACK'ed one may have been dropped in
            // the meantime; push the window as far as it will go.
            sw.advance();

            let nbr = nbr_arc.lock();
            if sw.seq_fits(nbr.seq) {
                self.netq.set_send_window_status(prevhop, true);
            }
        }
    }

    /// Validate explicit NAKs and return the last valid one.
    fn scan_naks(&self, sw: &mut SendWindow, pkt: &RadioPacket) -> Option<Seq> {
        let mut result = None;

        for msg in pkt.ctrl_iter() {
            let CtrlMsg::Nak(seq) = msg else { continue };

            if !sw.in_window(seq) || !sw.entry(seq).occupied() {
                debug!(
                    "ARQ: nak outside send window: node={}; seq={}; unack={}",
                    sw.node, seq, sw.unack,
                );
                continue;
            }

            info!("ARQ: nak: node={}; seq={}", sw.node, seq);
            result = Some(seq);
        }

        result
    }

    /// Release an ACK'ed entry: cancel its timer, record its round trip.
    fn release_acked(&self, sw: &mut SendWindow, seq: Seq, now: MonoTime, rtts: &mut Vec<f64>) {
        if !sw.in_window(seq) {
            warn!(
                "ARQ: ack outside send window: node={}; seq={}; unack={}",
                sw.node, seq, sw.unack,
            );
            return;
        }

        let node = sw.node;
        let entry = sw.entry_mut(seq);
        if !entry.occupied() {
            return;
        }

        // Retransmitted packets give ambiguous RTT samples; skip them.
        if entry.nretrans == 0 {
            rtts.push(now.saturating_duration_since(entry.timestamp).as_secs_f64());
        }

        self.timers.cancel(ArqTimer::Retransmission { node, seq });
        entry.reset();
    }

    /// Walk the selective-ACK ranges, scoring gaps as failures and runs as
    /// successes, but only for packets old enough that feedback about them
    /// must have been generated after they arrived (`tfeedback`).
    fn handle_selective_ack(&self, sw: &mut SendWindow, pkt: &RadioPacket, tfeedback: MonoTime) {
        let mut next_seq = sw.unack;
        let mut saw_run = false;

        for msg in pkt.ctrl_iter() {
            let CtrlMsg::SelectiveAck { begin, end } = msg else {
                continue;
            };

            if !saw_run {
                debug!(
                    "ARQ: selective ack: node={}; per_end={}",
                    sw.node, sw.per_end,
                );
            }

            // The gap between ACK runs was not received.
            if next_seq < begin {
                info!(
                    "ARQ: selective nak: node={}; seq=[{},{})",
                    sw.node, next_seq, begin,
                );

                for seq in Seq::range(next_seq, begin) {
                    if seq < sw.per_end {
                        continue;
                    }

                    let entry = sw.entry(seq);
                    if entry.occupied() && entry.timestamp < tfeedback {
                        amc::tx_failure(&mut *sw);
                        info!("ARQ: txFailure selective nak: node={}; seq={}", sw.node, seq);
                        sw.per_end = seq.next();
                        self.retransmit_entry(sw, seq);
                    }
                }
            }

            for seq in Seq::range(begin, end) {
                let sent_at = sw.entry(seq).timestamp;
                let occupied = sw.entry(seq).occupied();

                if seq >= sw.unack && occupied {
                    let node = sw.node;
                    self.timers.cancel(ArqTimer::Retransmission { node, seq });
                    sw.entry_mut(seq).reset();
                }

                if seq >= sw.per_end && sent_at < tfeedback {
                    amc::tx_success(&mut *sw);
                    sw.per_end = seq.next();
                }
            }

            saw_run = true;
            next_seq = end;
        }
    }

    /// Place a data packet into the receive window and deliver what can be
    /// delivered.
    fn fill_recv_window(&self, prevhop: NodeId, pkt: RadioPacket, now: MonoTime) {
        if pkt.data_len() == 0 {
            debug!("ARQ: recv: node={}; ack={}", prevhop, pkt.ack);
            return;
        }

        let mut pkt = pkt;
        let seq = pkt.hdr.seq;
        let is_syn = pkt.hdr.flags.syn();

        // SetUnack must be read before the control area is stripped.
        let set_unack = pkt.ctrl_iter().find_map(|m| match m {
            CtrlMsg::SetUnack { unack } => Some(unack),
            _ => None,
        });

        pkt.strip_ctrl();

        let recvw = self.recv_window(prevhop, seq, is_syn);
        let mut rw = recvw.lock();
        let mut out: Vec<RadioPacket> = Vec::new();

        rw.long_evm.update(now, pkt.evm as f64);
        rw.long_rssi.update(now, pkt.rssi as f64);

        // A SYN is ACK'ed immediately to open the sender's window. Anything
        // else arms the SACK timer: even a duplicate needs an ACK, because
        // the duplicate may mean our previous ACK was lost.
        if is_syn {
            self.inject_ack(&mut rw);
        } else {
            self.start_sack_timer(&mut rw);
        }

        // The sender has given up on everything before `u`; so do we.
        if let Some(u) = set_unack {
            if u > rw.ack {
                info!("ARQ: set unack: node={}; unack={}", prevhop, u);
                for s in Seq::range(rw.ack, u) {
                    rw.entry_mut(s).reset();
                }
                rw.ack = u;
            }
        }

        if seq < rw.ack {
            debug!("ARQ: recv duplicate before window: node={}; seq={}", prevhop, seq);
            return;
        }

        if seq >= rw.ack.add(rw.win) {
            info!("ARQ: recv outside window, advancing: node={}; seq={}", prevhop, seq);

            // Slide the window so `seq` becomes its new maximum, delivering
            // anything that would be forgotten. The forget point can exceed
            // the highest sequence we ever received.
            let new_ack = seq.next().sub(rw.win);
            let forget = if new_ack > rw.max { rw.max.next() } else { new_ack };

            for s in Seq::range(rw.ack, forget) {
                let entry = rw.entry_mut(s);
                if !entry.delivered {
                    if let Some(p) = entry.pkt.take() {
                        out.push(p);
                    }
                }
                entry.reset();
            }

            rw.ack = new_ack;
        } else if rw.entry(seq).received {
            debug!("ARQ: recv duplicate: node={}; seq={}", prevhop, seq);
            return;
        }

        rw.update_max(seq, pkt.timestamp);

        if seq == rw.ack {
            rw.ack = rw.ack.next();
            out.push(pkt);
        } else if !self.cfg.enforce_ordering && !is_tcp(&pkt.data) {
            // Out-of-order delivery is fine for datagram traffic; remember
            // that the sequence was received so it still gets ACK'ed.
            out.push(pkt);
            rw.entry_mut(seq).already_delivered();
        } else {
            let entry = rw.entry_mut(seq);
            entry.received = true;
            entry.pkt = Some(pkt);
        }

        // Drain the contiguous prefix.
        let mut s = rw.ack;
        while s <= rw.max && rw.entry(s).received {
            let entry = rw.entry_mut(s);
            if !entry.delivered {
                if let Some(p) = entry.pkt.take() {
                    out.push(p);
                }
            }
            entry.reset();
            s = s.next();
        }
        rw.ack = s;

        drop(rw);

        for p in out {
            self.deliver(p);
        }
    }

    /// Process control messages that do not touch ARQ windows.
    fn handle_ctrl(&self, prevhop: NodeId, pkt: &RadioPacket) {
        let nbr_arc = self.neighbors.entry(prevhop);

        for msg in pkt.ctrl_iter() {
            match msg {
                CtrlMsg::Hello { is_gateway } => {
                    nbr_arc.lock().is_gateway = is_gateway;
                    info!(
                        "ARQ: HELLO: node={}; gateway={}",
                        prevhop, is_gateway,
                    );
                }
                CtrlMsg::Timestamp { t_sent } => {
                    let t_sent = t_sent.to_mono();
                    nbr_arc.lock().record_timestamp(t_sent, pkt.timestamp);
                    info!(
                        "TIMESYNC: timestamp: node={}; t_sent={:.6}; t_recv={:.6}",
                        prevhop,
                        t_sent.as_secs_f64(),
                        pkt.timestamp.as_secs_f64(),
                    );
                }
                CtrlMsg::TimestampEcho { node, t_sent, t_recv } => {
                    // Only the elected time master's echoes are authoritative
                    let time_master = self.neighbors.time_master();
                    if node == self.me && time_master == Some(prevhop) && prevhop != self.me {
                        self.echoed_timestamps
                            .lock()
                            .push((t_sent.to_mono(), t_recv.to_mono()));
                        info!(
                            "TIMESYNC: timestamp echo: node={}; t_sent={:.6}; t_recv={:.6}",
                            prevhop,
                            t_sent.to_mono().as_secs_f64(),
                            t_recv.to_mono().as_secs_f64(),
                        );
                    }
                }
                CtrlMsg::ReceiverStats { long_evm, long_rssi } => {
                    if let Some(sendw) = self.maybe_send_window(prevhop) {
                        let mut sw = sendw.lock();
                        sw.long_evm = Some(long_evm);
                        sw.long_rssi = Some(long_rssi);
                    }
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Transmission notifications
    // ------------------------------------------------------------------

    /// Note that `pkt` has been handed to the transport.
    ///
    /// Starts the retransmission timer for data packets and cancels the
    /// receive window's SACK timer once a selective ACK is on the air.
    pub fn transmitted(&self, pkt: &NetPacket) {
        if !pkt.hdr.flags.broadcast() && pkt.data_len() != 0 && pkt.internal.has_seq {
            let sendw = self.send_window(pkt.hdr.nexthop);
            let sw = sendw.lock();

            let node = sw.node;
            let seq = pkt.hdr.seq;
            let key = ArqTimer::Retransmission { node, seq };

            if sw.entry(seq).occupied() && !self.timers.running(key) {
                let delay = self
                    .neighbors
                    .entry(node)
                    .lock()
                    .retransmission_delay;
                debug!("ARQ: starting retransmission timer: node={}; seq={}", node, seq);
                self.timers.schedule(key, Duration::from_secs_f64(delay));
            }
        }

        if pkt.internal.has_selective_ack {
            if let Some(recvw) = self.maybe_recv_window(pkt.hdr.nexthop) {
                let mut rw = recvw.lock();
                self.timers.cancel(ArqTimer::SelectiveAck { node: rw.node });
                rw.timer_for_ack = false;
            }
        }
    }

    /// Re-queue a packet whose slot was never transmitted.
    ///
    /// The packet keeps its sequence number; it will be sent again and
    /// counted as a retransmission, but no transmission failure is scored
    /// because it never went on the air.
    pub fn missed(&self, mut pkt: NetPacket) {
        info!(
            "ARQ: missed slot: node={}; seq={}",
            pkt.hdr.nexthop, pkt.hdr.seq,
        );

        pkt.clear_ctrl();
        pkt.hdr.flags.set_ack(false);
        pkt.internal.retransmission = true;
        pkt.internal.has_selective_ack = false;
        self.netq.push_hi_back(pkt);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn retransmit_on_timeout(&self, node: NodeId, seq: Seq) {
        let Some(sendw) = self.maybe_send_window(node) else {
            return;
        };
        let mut sw = sendw.lock();

        // The entry may have been released, or its slot reused by a later
        // sequence, between expiry and dispatch.
        let holds_seq = sw
            .entry(seq)
            .pkt
            .as_ref()
            .map_or(false, |p| p.hdr.seq == seq);
        if !holds_seq {
            debug!(
                "ARQ: retransmission timeout for released packet: node={}; seq={}",
                node, seq,
            );
            return;
        }

        let nbr_arc = self.neighbors.entry(node);
        let dest_can_transmit = nbr_arc.lock().can_transmit;

        // Only score the timeout when the destination could have ACK'ed and
        // the MCS has not moved under the packet.
        if dest_can_transmit && sw.mcsidx >= sw.entry(seq).mcsidx {
            amc::tx_failure(&mut sw);
            info!(
                "AMC: txFailure retransmission timeout: node={}; seq={}; short_per={:.4}",
                node,
                seq,
                sw.short_per.value(),
            );

            let mut nbr = nbr_arc.lock();
            amc::update_mcs(
                &mut sw,
                &mut nbr,
                &self.mcs_table,
                &self.amc,
                self.tx_slot_samps.load(Ordering::Acquire),
                &mut *self.rng.lock(),
            );
        }

        // If we have no TX slots there is no point re-queueing; try again
        // after another timeout.
        if !self.can_transmit.load(Ordering::Acquire) {
            let delay = nbr_arc.lock().retransmission_delay;
            self.timers.schedule(
                ArqTimer::Retransmission { node, seq },
                Duration::from_secs_f64(delay),
            );
            return;
        }

        self.retransmit_or_drop(&mut sw, seq);
    }

    fn retransmit_or_drop(&self, sw: &mut SendWindow, seq: Seq) {
        let entry = sw.entry(seq);
        let Some(pkt) = entry.pkt.as_ref() else { return };

        let exhausted = self
            .cfg
            .max_retransmissions
            .is_some_and(|m| entry.nretrans >= m);
        let expired = pkt.deadline_passed(MonoClock::now());

        // SYN packets are always retransmitted: without one the connection
        // never opens.
        if !pkt.hdr.flags.syn() && (exhausted || expired) {
            self.drop_entry(sw, seq);
        } else {
            self.retransmit_entry(sw, seq);
        }
    }

    /// Put an in-flight packet back on the high-priority queue.
    ///
    /// The retransmission timer is cancelled rather than restarted here:
    /// restarting happens when the packet is actually sent again. An
    /// explicit NAK and a timeout can otherwise race and retransmit the
    /// same packet twice.
    fn retransmit_entry(&self, sw: &mut SendWindow, seq: Seq) {
        let node = sw.node;
        let Some(pkt) = sw.entry(seq).pkt.as_ref() else {
            debug!("ARQ: attempted to retransmit released packet: node={}", node);
            return;
        };

        info!(
            "ARQ: retransmit: node={}; seq={}; mcsidx={}",
            node, seq, sw.entry(seq).mcsidx,
        );

        self.timers.cancel(ArqTimer::Retransmission { node, seq });

        let mut copy = pkt.clone();
        copy.clear_ctrl();
        copy.hdr.flags.set_ack(false);
        copy.internal.retransmission = true;
        copy.internal.has_selective_ack = false;

        self.netq.push_hi_back(copy);
    }

    /// Drop an in-flight packet and slide the window past it.
    fn drop_entry(&self, sw: &mut SendWindow, seq: Seq) {
        if !sw.entry(seq).occupied() {
            return;
        }

        let node = sw.node;
        info!("ARQ: dropping packet: node={}; seq={}", node, seq);

        self.timers.cancel(ArqTimer::Retransmission { node, seq });
        sw.entry_mut(seq).reset();

        if sw.advance() {
            // The receiver must be told to give up on the dropped range
            sw.locally_updated = true;
            self.netq.set_send_window_status(node, true);
        }
    }

    fn on_sack_timer(&self, node: NodeId) {
        let Some(recvw) = self.maybe_recv_window(node) else {
            return;
        };
        let mut rw = recvw.lock();

        if rw.timer_for_ack {
            rw.timer_for_ack = false;
            self.inject_ack(&mut rw);
        } else {
            // First phase: ask the next outbound data packet to carry the
            // SACK; if none shows up, the second phase sends a pure ACK.
            rw.need_selective_ack = true;
            rw.timer_for_ack = true;
            debug!("ARQ: arming full ACK timer: node={}", node);
            self.timers
                .schedule(ArqTimer::SelectiveAck { node }, self.cfg.sack_delay);
        }
    }

    fn on_hello_timer(&self) {
        self.broadcast_hello();
        self.timers.schedule(ArqTimer::Hello, self.cfg.hello_interval);
    }

    // ------------------------------------------------------------------
    // Control packet injection
    // ------------------------------------------------------------------

    fn start_sack_timer(&self, rw: &mut RecvWindow) {
        let key = ArqTimer::SelectiveAck { node: rw.node };
        if !self.timers.running(key) {
            debug!("ARQ: starting SACK timer: node={}", rw.node);
            rw.need_selective_ack = false;
            rw.timer_for_ack = false;

            let delay = self
                .cfg
                .ack_delay
                .saturating_sub(self.cfg.sack_delay)
                .max(Duration::from_millis(1));
            self.timers.schedule(key, delay);
        }
    }

    /// Inject a control-only packet carrying an ACK for `rw`.
    ///
    /// The cumulative ACK number and the selective-ACK feedback are filled
    /// in when the packet flows back through `pull` on its way out, so
    /// they reflect everything received by then.
    fn inject_ack(&self, rw: &mut RecvWindow) {
        rw.need_selective_ack = true;
        let pkt = NetPacket::control(self.me, rw.node);
        debug!("ARQ: inject ack: node={}", rw.node);
        self.netq.push_hi_front(pkt);
    }

    /// Send a rate-limited explicit NAK for `seq`.
    fn nak(&self, node: NodeId, seq: Seq) {
        let Some(recvw) = self.maybe_recv_window(node) else {
            return;
        };
        let mut rw = recvw.lock();

        if !rw.nak_allowed(MonoClock::now(), self.cfg.explicit_nak_win_duration.as_secs_f64()) {
            return;
        }

        info!("ARQ: send nak: node={}; nak={}", node, seq);

        rw.need_selective_ack = true;
        let mut pkt = NetPacket::control(self.me, node);
        pkt.append_ctrl(CtrlMsg::Nak(seq));
        self.netq.push_hi_front(pkt);
    }

    /// Broadcast a HELLO advertising our capabilities.
    ///
    /// The time master also echoes the most recent timestamp heard from
    /// each neighbor.
    pub fn broadcast_hello(&self) {
        let mut pkt = NetPacket::broadcast(self.me);

        let is_gateway = self.neighbors.me_entry().lock().is_gateway;
        pkt.append_ctrl(CtrlMsg::Hello { is_gateway });
        pkt.internal.is_timestamp = true;

        if self.neighbors.time_master() == Some(self.me) {
            for id in self.neighbors.ids() {
                if id == self.me {
                    continue;
                }
                let Some(nbr) = self.neighbors.get(id) else { continue };
                let Some((t_sent, t_recv)) = nbr.lock().last_timestamp() else {
                    continue;
                };

                info!(
                    "TIMESYNC: echoing timestamp: node={}; t_sent={:.6}; t_recv={:.6}",
                    id,
                    t_sent.as_secs_f64(),
                    t_recv.as_secs_f64(),
                );
                pkt.append_ctrl(CtrlMsg::TimestampEcho {
                    node: id,
                    t_sent: WireTime::from_mono(t_sent),
                    t_recv: WireTime::from_mono(t_recv),
                });
            }
        }

        debug!("ARQ: broadcast HELLO");
        self.netq.push_hi_front(pkt);
    }

    /// Append receiver feedback to an outbound ACK-bearing packet.
    fn append_feedback(&self, rw: &mut RecvWindow, pkt: &mut NetPacket) {
        pkt.append_ctrl(CtrlMsg::ReceiverStats {
            long_evm: rw.long_evm.value().unwrap_or(0.0),
            long_rssi: rw.long_rssi.value().unwrap_or(0.0),
        });

        if !self.cfg.selective_ack {
            return;
        }

        // Find the maximal runs of received sequences past the cumulative
        // ACK. recvw.ack itself is covered by the header ACK.
        let mut ranges: Vec<(Seq, Seq)> = Vec::new();
        let mut in_run = false;
        let mut begin = rw.ack;
        let mut end = rw.ack;

        for seq in Seq::range(rw.ack.next(), rw.max.next()) {
            if rw.entry(seq).received {
                if !in_run {
                    in_run = true;
                    begin = seq;
                }
                end = seq;
            } else if in_run {
                ranges.push((begin, end.next()));
                in_run = false;
            }
        }
        if in_run {
            ranges.push((begin, end.next()));
        }

        // An empty sentinel range tells the sender the final stretch up to
        // max was not received.
        if end < rw.max {
            ranges.push((rw.max.next(), rw.max.next()));
        }

        // MTU budget: keep the most recent ranges, dropping the earliest.
        let room = self.cfg.mtu.saturating_sub(pkt.wire_size());
        let max_ranges = room / CtrlMsg::SELECTIVE_ACK_SIZE;
        if ranges.len() > max_ranges {
            warn!(
                "ARQ: out of space for selective ack: node={}; dropped={}",
                rw.node,
                ranges.len() - max_ranges,
            );
            ranges.drain(..ranges.len() - max_ranges);
        }

        for (b, e) in ranges {
            debug!("ARQ: send selective ack: node={}; seq=[{},{})", rw.node, b, e);
            pkt.append_ctrl(CtrlMsg::SelectiveAck { begin: b, end: e });
        }

        pkt.internal.has_selective_ack = true;
        rw.need_selective_ack = false;
    }

    // ------------------------------------------------------------------
    // Window lookup
    // ------------------------------------------------------------------

    fn maybe_send_window(&self, node: NodeId) -> Option<Arc<Mutex<SendWindow>>> {
        self.send.lock().get(&node).cloned()
    }

    /// Look up the send window for `node`, creating it on first use.
    pub fn send_window(&self, node: NodeId) -> Arc<Mutex<SendWindow>> {
        if let Some(w) = self.maybe_send_window(node) {
            return w;
        }

        let nbr_arc = self.neighbors.entry(node);
        let mut send = self.send.lock();

        send.entry(node)
            .or_insert_with(|| {
                let mcsidx = self.cfg.mcsidx_init.min(self.mcs_table.len() - 1);
                let mut sw =
                    SendWindow::new(node, self.cfg.max_sendwin, self.mcs_table.len(), mcsidx);

                let mut nbr = nbr_arc.lock();
                sw.per_end = nbr.seq;
                sw.unack = nbr.seq;
                sw.max = nbr.seq.sub(1);

                amc::set_mcs(
                    &mut sw,
                    &mut nbr,
                    &self.mcs_table,
                    &self.amc,
                    self.tx_slot_samps.load(Ordering::Acquire),
                    mcsidx,
                );

                Arc::new(Mutex::new(sw))
            })
            .clone()
    }

    fn maybe_recv_window(&self, node: NodeId) -> Option<Arc<Mutex<RecvWindow>>> {
        self.recv.lock().get(&node).cloned()
    }

    /// Look up the receive window for `node`, creating it on first packet.
    ///
    /// A SYN whose sequence lies outside the current window means the
    /// sender restarted: the old window is discarded and a fresh one starts
    /// at `seq`.
    fn recv_window(&self, node: NodeId, seq: Seq, is_syn: bool) -> Arc<Mutex<RecvWindow>> {
        let mut recv = self.recv.lock();

        if let Some(w) = recv.get(&node) {
            let keep = {
                let rw = w.lock();
                !is_syn || (seq >= rw.max.sub(rw.win) && seq < rw.ack.add(rw.win))
            };

            if keep {
                return w.clone();
            }

            info!("ARQ: sender restarted: node={}; seq={}", node, seq);
            self.timers.cancel(ArqTimer::SelectiveAck { node });
            recv.remove(&node);
        }

        self.neighbors.entry(node);

        let w = Arc::new(Mutex::new(RecvWindow::new(
            node,
            seq,
            self.cfg.recvwin,
            self.cfg.explicit_nak_win,
            self.cfg.stats_window.as_secs_f64(),
        )));
        recv.insert(node, w.clone());
        w
    }

    fn deliver(&self, pkt: RadioPacket) {
        if let Some(deliver) = self.deliver.lock().as_ref() {
            deliver(pkt);
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.timers.stop();
    }
}
