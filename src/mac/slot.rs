//! Slots and the slot synthesizer.
//!
//! A [`Slot`] collects modulated packets for one transmit opportunity. The
//! synthesizer owns a FIFO of prepared slots: the MAC asks it to start
//! filling the *following* slot while the current one transmits, and calls
//! [`SlotSynthesizer::finalize`] at the deadline to take exclusive
//! ownership of the head slot.
//!
//! Commit atomicity: a packet is assigned to at most one slot. If the slot
//! closes before a popped packet is committed, the packet goes back to the
//! front of the modulator output queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::arq::Controller;
use crate::clock::MonoTime;
use crate::packet::{CtrlMsg, WireTime};
use crate::phy::mod_pool::{modulate_packet, ModPacket, ModQueue};
use crate::phy::{Codec, McsTable, SampleBuf};

/// How long a synthesis worker waits for a packet before rechecking the
/// current slot.
const FILL_POLL: Duration = Duration::from_millis(1);

#[derive(Default)]
struct SlotInner {
    mpkts: Vec<ModPacket>,
    nsamples: usize,
}

/// One transmit opportunity.
pub struct Slot {
    /// Transmission time of the slot's first sample.
    pub deadline: MonoTime,
    /// Samples already spoken for at the head of the slot (a previous
    /// slot's overfill).
    pub delay: usize,
    /// Capacity of the nominal data region, guard excluded.
    pub max_samples: usize,
    /// Capacity including the following slot's data region, when overfill
    /// is allowed.
    pub full_slot_samples: usize,
    /// The node also owns the following slot.
    pub overfill: bool,
    /// No more packets may be committed.
    pub closed: AtomicBool,
    inner: Mutex<SlotInner>,
}

impl Slot {
    /// Create an empty slot.
    pub fn new(
        deadline: MonoTime,
        delay: usize,
        max_samples: usize,
        full_slot_samples: usize,
        overfill: bool,
    ) -> Arc<Slot> {
        Arc::new(Slot {
            deadline,
            delay,
            max_samples,
            full_slot_samples,
            overfill,
            closed: AtomicBool::new(false),
            inner: Mutex::new(SlotInner::default()),
        })
    }

    /// Total committed samples.
    pub fn length(&self) -> usize {
        self.inner.lock().nsamples
    }

    /// Samples beyond the nominal data region.
    pub fn noverfill(&self) -> usize {
        self.length().saturating_sub(self.max_samples)
    }

    /// Close the slot.
    ///
    /// Taking the inner mutex here is the barrier against synthesis
    /// workers: once `close` returns, no commit can succeed.
    pub fn close(&self) {
        let _inner = self.inner.lock();
        self.closed.store(true, Ordering::Release);
    }

    /// Take the committed packets.
    pub fn take(&self) -> Vec<ModPacket> {
        std::mem::take(&mut self.inner.lock().mpkts)
    }

    /// The committed sample buffers, in transmission order.
    pub fn iqbufs(&self) -> Vec<SampleBuf> {
        self.inner
            .lock()
            .mpkts
            .iter()
            .map(|m| m.samples.clone())
            .collect()
    }
}

/// The slot synthesizer.
pub struct SlotSynthesizer {
    mod_queue: Arc<ModQueue>,
    controller: Arc<Controller>,
    codec: Arc<dyn Codec>,
    mcs_table: Arc<McsTable>,
    tx_rate: f64,
    slots: Mutex<VecDeque<Arc<Slot>>>,
    cur: Mutex<Option<Arc<Slot>>>,
    cur_cond: Condvar,
    done: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SlotSynthesizer {
    /// Create a synthesizer and start `nthreads` fill workers.
    pub fn start(
        nthreads: usize,
        mod_queue: Arc<ModQueue>,
        controller: Arc<Controller>,
        codec: Arc<dyn Codec>,
        mcs_table: Arc<McsTable>,
        tx_rate: f64,
    ) -> Arc<SlotSynthesizer> {
        let synth = Arc::new(SlotSynthesizer {
            mod_queue,
            controller,
            codec,
            mcs_table,
            tx_rate,
            slots: Mutex::new(VecDeque::new()),
            cur: Mutex::new(None),
            cur_cond: Condvar::new(),
            done: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = synth.workers.lock();
        for i in 0..nthreads.max(1) {
            let synth2 = synth.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("synth-worker-{i}"))
                    .spawn(move || synth2.fill_worker())
                    .expect("spawn synthesizer worker"),
            );
        }
        drop(workers);

        synth
    }

    /// Begin synthesis of the slot starting at `when`.
    ///
    /// `noverfill` samples at the head are already committed to the
    /// previous slot's trailing burst; `overfill` says the node also owns
    /// the slot after this one.
    pub fn modulate_slot(
        &self,
        when: MonoTime,
        noverfill: usize,
        data_samples: usize,
        overfill: bool,
    ) -> Arc<Slot> {
        let max_samples = data_samples.saturating_sub(noverfill);
        let full = if overfill {
            max_samples + data_samples
        } else {
            max_samples
        };

        let slot = Slot::new(when, noverfill, max_samples, full, overfill);

        self.slots.lock().push_back(slot.clone());
        *self.cur.lock() = Some(slot.clone());
        self.cur_cond.notify_all();

        debug!(
            "MAC: modulate slot: deadline={:.6}; max_samples={}; overfill={}",
            when.as_secs_f64(),
            max_samples,
            overfill,
        );

        slot
    }

    /// Take exclusive ownership of the slot due at `when`.
    ///
    /// Slots whose deadline already passed are discarded and their packets
    /// reported missed; they keep their sequence numbers and will be sent
    /// again. Returns `None` when no slot matches `when`.
    pub fn finalize(&self, when: MonoTime) -> Option<Arc<Slot>> {
        loop {
            let head = {
                let mut slots = self.slots.lock();
                let Some(head) = slots.front() else {
                    return None;
                };

                if head.deadline.approx_eq(when) || head.deadline < when {
                    slots.pop_front()
                } else {
                    return None;
                }
            };

            let slot = head?;
            slot.close();

            if slot.deadline.approx_eq(when) {
                return Some(slot);
            }

            // Missed its deadline
            info!(
                "MAC: missed slot: deadline={:.6}; now={:.6}",
                slot.deadline.as_secs_f64(),
                when.as_secs_f64(),
            );
            for mpkt in slot.take() {
                if !mpkt.pkt.internal.is_timestamp {
                    self.controller.missed(mpkt.pkt);
                }
            }
        }
    }

    /// Report every remaining queued slot as missed. Called when the MAC
    /// stops.
    pub fn missed_remaining(&self) {
        let slots: Vec<Arc<Slot>> = self.slots.lock().drain(..).collect();
        for slot in slots {
            slot.close();
            for mpkt in slot.take() {
                if !mpkt.pkt.internal.is_timestamp {
                    self.controller.missed(mpkt.pkt);
                }
            }
        }
    }

    /// Stop the fill workers.
    pub fn stop(&self) {
        self.done.store(true, Ordering::Release);
        self.mod_queue.stop();
        self.cur_cond.notify_all();

        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }

    fn fill_worker(&self) {
        let mut prev: Option<Arc<Slot>> = None;

        while !self.done.load(Ordering::Acquire) {
            // Wait for a slot we haven't filled yet
            let slot = {
                let mut cur = self.cur.lock();
                loop {
                    if self.done.load(Ordering::Acquire) {
                        return;
                    }

                    let fresh = cur
                        .as_ref()
                        .filter(|s| !same_slot(&prev, s) && !s.closed.load(Ordering::Acquire))
                        .cloned();
                    match fresh {
                        Some(s) => break s,
                        None => {
                            self.cur_cond.wait_for(&mut cur, FILL_POLL);
                        }
                    }
                }
            };

            self.fill(&slot);
            prev = Some(slot);
        }
    }

    /// Consume modulated packets into `slot` until it closes, fills, or
    /// the queue goes dry at close time.
    fn fill(&self, slot: &Slot) {
        while !slot.closed.load(Ordering::Acquire) && !self.done.load(Ordering::Acquire) {
            let Some(mpkt) = self.mod_queue.pop_timeout(FILL_POLL) else {
                continue;
            };

            match self.commit(slot, mpkt) {
                Ok(()) => {}
                Err(Some(mpkt)) => {
                    // Slot closed or out of room: keep the packet for the
                    // next slot
                    self.mod_queue.put_back(mpkt);
                    return;
                }
                Err(None) => {}
            }
        }
    }

    /// Try to commit one packet to `slot`.
    ///
    /// `Err(Some(_))` hands the packet back; `Err(None)` means the packet
    /// was consumed without being committed (dropped as oversized).
    fn commit(&self, slot: &Slot, mut mpkt: ModPacket) -> std::result::Result<(), Option<ModPacket>> {
        let mut inner = slot.inner.lock();

        if slot.closed.load(Ordering::Acquire) {
            return Err(Some(mpkt));
        }

        // Timestamped packets are modulated here, where the transmission
        // time of the packet's first sample is known.
        let stamped = if mpkt.pkt.internal.is_timestamp {
            let offset_secs = (slot.delay + inner.nsamples) as f64 / self.tx_rate;
            let t_send = slot.deadline + Duration::from_secs_f64(offset_secs);
            let ts = CtrlMsg::Timestamp {
                t_sent: WireTime::from_mono(t_send),
            };
            mpkt.pkt.append_ctrl(ts);

            let entry = self.mcs_table.entry(mpkt.pkt.mcsidx);
            let mut modulator = self.codec.modulator(entry.mcs);
            let (samples, _raw) = modulate_packet(modulator.as_mut(), &mpkt.pkt);
            mpkt.nsamples = samples.len();
            mpkt.nsamples_pre_resample = samples.len();
            mpkt.samples = samples;
            Some(ts)
        } else {
            None
        };

        // A packet that cannot fit even in an empty full slot can never be
        // sent; drop it rather than wedge the queue.
        if mpkt.nsamples > slot.full_slot_samples && inner.nsamples == 0 {
            info!(
                "MAC: dropping modulated packet too long for slot: nsamples={}; max={}",
                mpkt.nsamples, slot.full_slot_samples,
            );
            return Err(None);
        }

        if inner.nsamples + mpkt.nsamples > slot.full_slot_samples {
            if let Some(ts) = stamped {
                mpkt.pkt.remove_last_ctrl(&ts);
            }
            return Err(Some(mpkt));
        }

        mpkt.offset = inner.nsamples;
        mpkt.start = slot.delay + inner.nsamples;
        inner.nsamples += mpkt.nsamples;
        inner.mpkts.push(mpkt);
        Ok(())
    }
}

fn same_slot(prev: &Option<Arc<Slot>>, cur: &Arc<Slot>) -> bool {
    prev.as_ref().is_some_and(|p| Arc::ptr_eq(p, cur))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighbor::{NeighborDefaults, NeighborTable};
    use crate::packet::NetPacket;
    use crate::phy::{Check, Fec, FrameEvent, Mcs, Demodulator, ModScheme, Modulator, Sample};
    use crate::queue::NetQueue;
    use crate::LinkConfig;
    use bytes::Bytes;

    struct ByteModulator {
        remaining: usize,
    }

    impl Modulator for ByteModulator {
        fn assemble(&mut self, _header: &[u8; 8], payload: &[u8]) {
            self.remaining = 8 + payload.len();
        }

        fn write_samples(&mut self, out: &mut [Sample]) -> (usize, bool) {
            let n = self.remaining.min(out.len());
            for s in out[..n].iter_mut() {
                *s = Sample::new(1.0, 0.0);
            }
            self.remaining -= n;
            (n, self.remaining == 0)
        }
    }

    struct NullDemod;

    impl Demodulator for NullDemod {
        fn reset(&mut self) {}
        fn demodulate(&mut self, _samples: &[Sample], _cb: &mut dyn FnMut(&FrameEvent<'_>) -> bool) {}
    }

    struct ByteCodec;

    impl Codec for ByteCodec {
        fn modulator(&self, _mcs: Mcs) -> Box<dyn Modulator> {
            Box::new(ByteModulator { remaining: 0 })
        }

        fn demodulator(&self, _header_mcs: Mcs) -> Box<dyn Demodulator> {
            Box::new(NullDemod)
        }

        fn max_modulated_samples(&self, _mcs: Mcs, payload_len: usize) -> usize {
            8 + payload_len
        }
    }

    fn controller() -> Arc<Controller> {
        let cfg = Arc::new(LinkConfig::default());
        let table = Arc::new(
            McsTable::new(
                vec![Mcs::new(Check::Crc32, Fec::None, Fec::None, ModScheme::Qpsk)],
                vec![None],
                vec![1500],
            )
            .unwrap(),
        );
        let neighbors = Arc::new(NeighborTable::new(
            1,
            NeighborDefaults {
                ack_delay: cfg.ack_delay,
                retransmission_delay: cfg.retransmission_delay,
                mcsidx: 0,
            },
        ));
        Controller::new(cfg, table, neighbors, Arc::new(NetQueue::new())).unwrap()
    }

    fn synth(ctrl: Arc<Controller>) -> Arc<SlotSynthesizer> {
        let table = Arc::new(
            McsTable::new(
                vec![Mcs::new(Check::Crc32, Fec::None, Fec::None, ModScheme::Qpsk)],
                vec![None],
                vec![1500],
            )
            .unwrap(),
        );
        SlotSynthesizer::start(
            1,
            Arc::new(ModQueue::new()),
            ctrl,
            Arc::new(ByteCodec),
            table,
            1e6,
        )
    }

    fn mod_packet(nsamples: usize, seq: u16) -> ModPacket {
        let mut pkt = NetPacket::data(1, 2, Bytes::from_static(b"x"));
        pkt.hdr.seq = crate::seq::Seq(seq);
        pkt.internal.has_seq = true;

        ModPacket {
            samples: vec![Sample::new(1.0, 0.0); nsamples],
            nsamples,
            nsamples_pre_resample: nsamples,
            ..ModPacket::passthrough(pkt)
        }
    }

    #[test]
    fn test_commit_respects_capacity() {
        let ctrl = controller();
        let s = synth(ctrl);

        let slot = Slot::new(MonoTime::from_secs_f64(1.0), 0, 100, 100, false);
        assert!(s.commit(&slot, mod_packet(60, 0)).is_ok());

        // Second packet would exceed the region and overfill is off
        let res = s.commit(&slot, mod_packet(60, 1));
        assert!(matches!(res, Err(Some(_))));
        assert_eq!(slot.length(), 60);
        s.stop();
    }

    #[test]
    fn test_commit_overfill() {
        let ctrl = controller();
        let s = synth(ctrl);

        let slot = Slot::new(MonoTime::from_secs_f64(1.0), 0, 100, 200, true);
        assert!(s.commit(&slot, mod_packet(80, 0)).is_ok());
        assert!(s.commit(&slot, mod_packet(80, 1)).is_ok());

        assert_eq!(slot.length(), 160);
        assert_eq!(slot.noverfill(), 60);
        s.stop();
    }

    #[test]
    fn test_commit_rejects_after_close() {
        let ctrl = controller();
        let s = synth(ctrl);

        let slot = Slot::new(MonoTime::from_secs_f64(1.0), 0, 100, 100, false);
        slot.close();
        assert!(matches!(s.commit(&slot, mod_packet(10, 0)), Err(Some(_))));
        s.stop();
    }

    #[test]
    fn test_finalize_discards_missed_slot() {
        let ctrl = controller();
        let s = synth(ctrl.clone());

        // A slot 50ms in the past with one packet in it
        let slot = s.modulate_slot(MonoTime::from_secs_f64(0.5), 0, 1000, false);
        s.commit(&slot, mod_packet(100, 7)).unwrap();

        // Finalizing well after the deadline discards it
        let got = s.finalize(MonoTime::from_secs_f64(0.9));
        assert!(got.is_none());

        // The missed packet went back to the controller's queue, marked as
        // a retransmission with its sequence number intact
        let requeued = ctrl.netq().try_pop().expect("missed packet requeued");
        assert_eq!(requeued.hdr.seq, crate::seq::Seq(7));
        assert!(requeued.internal.retransmission);
        s.stop();
    }

    #[test]
    fn test_finalize_matches_deadline() {
        let ctrl = controller();
        let s = synth(ctrl);

        let when = MonoTime::from_secs_f64(2.0);
        let slot = s.modulate_slot(when, 0, 1000, false);
        s.commit(&slot, mod_packet(100, 0)).unwrap();

        let got = s.finalize(when).expect("slot due");
        assert!(got.closed.load(Ordering::Acquire));
        assert_eq!(got.length(), 100);

        // Queue is now empty
        assert!(s.finalize(when).is_none());
        s.stop();
    }
}
