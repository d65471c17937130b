//! The slotted TDMA MAC.
//!
//! Time is divided into frames of `nslots` slots. The RX worker keeps a
//! continuous stream of timed burst reads aligned to slot boundaries and
//! feeds one buffer per slot to the demodulator pool. The TX worker walks
//! the schedule: it finalizes the slot whose deadline is next, kicks off
//! synthesis of the following owned slot, transmits, and sleeps until just
//! before the following slot needs to be delivered to the transport.

pub mod slot;

use self::slot::SlotSynthesizer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::arq::Controller;
use crate::clock::{doze, MonoTime, SlotTiming};
use crate::error::Result;
use crate::packet::NetPacket;
use crate::phy::demod_pool::{DemodulatorPool, RxSlotBuf};
use crate::phy::SampleBuf;
use crate::transport::Transport;
use crate::LinkConfig;

/// Which slots of the frame this node owns.
#[derive(Debug, Clone)]
pub struct Schedule {
    slots: Vec<bool>,
}

impl Schedule {
    /// A schedule that owns nothing.
    pub fn new(nslots: usize) -> Schedule {
        Schedule { slots: vec![false; nslots] }
    }

    /// Build from an explicit slot mask.
    pub fn from_slots(slots: Vec<bool>) -> Schedule {
        Schedule { slots }
    }

    /// The canonical one-slot-per-node TDMA assignment.
    pub fn tdma(nslots: usize, slot: usize) -> Schedule {
        let mut s = Schedule::new(nslots);
        s.slots[slot % nslots] = true;
        s
    }

    /// Number of slots per frame.
    pub fn nslots(&self) -> usize {
        self.slots.len()
    }

    /// True if this node may transmit in slot `idx`.
    pub fn can_transmit(&self, idx: usize) -> bool {
        self.slots[idx % self.slots.len()]
    }

    /// True if the schedule owns any slot at all.
    pub fn any(&self) -> bool {
        self.slots.iter().any(|s| *s)
    }
}

/// The next two owned transmit opportunities after `t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct NextSlots {
    t_next: MonoTime,
    next_idx: usize,
    t_following: MonoTime,
    following_idx: usize,
}

/// Find the next two slots the schedule owns, starting strictly after `t`.
fn find_next_slot(t: MonoTime, timing: &SlotTiming, sched: &Schedule) -> Option<NextSlots> {
    let nslots = sched.nslots();
    let slot_pos = timing.slot_offset(t);
    let cur_slot = timing.slot_index(t);

    let mut found: Option<(MonoTime, usize)> = None;
    for k in 1..=nslots {
        let idx = (cur_slot + k) % nslots;
        if sched.can_transmit(idx) {
            let t_next = t + (timing.slot_size * k as u32 - slot_pos);
            found = Some((t_next, idx));
            break;
        }
    }
    let (t_next, next_idx) = found?;

    for k in 1..=nslots {
        let idx = (next_idx + k) % nslots;
        if sched.can_transmit(idx) {
            return Some(NextSlots {
                t_next,
                next_idx,
                t_following: t_next + timing.slot_size * k as u32,
                following_idx: idx,
            });
        }
    }

    None
}

/// The slotted TDMA MAC.
pub struct TdmaMac {
    transport: Arc<dyn Transport>,
    controller: Arc<Controller>,
    synth: Arc<SlotSynthesizer>,
    demod: Arc<DemodulatorPool>,
    timing: SlotTiming,
    schedule: Mutex<Schedule>,
    tx_rate: f64,
    rx_rate: f64,
    slot_modulate_lead_time: Duration,
    slot_send_lead_time: Duration,
    demod_overlap_size: Duration,
    done: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    notify_tx: Sender<Vec<NetPacket>>,
    notify_rx: Receiver<Vec<NetPacket>>,
}

impl TdmaMac {
    /// Create a MAC over the given collaborators.
    pub fn new(
        cfg: &LinkConfig,
        transport: Arc<dyn Transport>,
        controller: Arc<Controller>,
        synth: Arc<SlotSynthesizer>,
        demod: Arc<DemodulatorPool>,
        schedule: Schedule,
    ) -> Arc<TdmaMac> {
        let timing = SlotTiming {
            slot_size: cfg.slot_size,
            guard_size: cfg.guard_size,
            nslots: cfg.nslots,
        };

        let (notify_tx, notify_rx) = crossbeam_channel::unbounded();

        let mac = Arc::new(TdmaMac {
            transport,
            controller,
            synth,
            demod,
            timing,
            schedule: Mutex::new(schedule),
            tx_rate: cfg.tx_rate,
            rx_rate: cfg.rx_rate,
            slot_modulate_lead_time: cfg.slot_modulate_lead_time,
            slot_send_lead_time: cfg.slot_send_lead_time,
            demod_overlap_size: cfg.demod_overlap_size,
            done: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            notify_tx,
            notify_rx,
        });

        mac.reconfigure();
        mac
    }

    /// Samples in the data (non-guard) region of a TX slot.
    pub fn tx_slot_samps(&self) -> usize {
        let data = self
            .timing
            .slot_size
            .saturating_sub(self.timing.guard_size);
        (data.as_secs_f64() * self.tx_rate) as usize
    }

    /// Samples in a full RX slot.
    pub fn rx_slot_samps(&self) -> usize {
        (self.timing.slot_size.as_secs_f64() * self.rx_rate) as usize
    }

    /// Install a new schedule.
    pub fn set_schedule(&self, schedule: Schedule) {
        *self.schedule.lock() = schedule;
        self.reconfigure();
    }

    /// Push timing-derived facts to the controller.
    pub fn reconfigure(&self) {
        // The lead times eat into the usable slot; a schedule that leaves
        // no room for synthesis and handover cannot hold its deadlines.
        let lead = self.slot_modulate_lead_time + self.slot_send_lead_time;
        if lead >= self.timing.slot_size {
            warn!(
                "MAC: lead times ({:?}) exceed slot size ({:?})",
                lead, self.timing.slot_size,
            );
        }

        self.controller.set_tx_slot_samps(self.tx_slot_samps());
        self.controller.set_can_transmit(self.schedule.lock().any());
    }

    /// Start the RX, TX and TX-notifier workers.
    pub fn start(self: Arc<Self>) {
        let mut threads = self.threads.lock();

        let mac = self.clone();
        threads.push(
            std::thread::Builder::new()
                .name("mac-rx".into())
                .spawn(move || mac.rx_worker())
                .expect("spawn MAC rx worker"),
        );

        let mac = self.clone();
        threads.push(
            std::thread::Builder::new()
                .name("mac-tx".into())
                .spawn(move || mac.tx_worker())
                .expect("spawn MAC tx worker"),
        );

        let mac = self.clone();
        threads.push(
            std::thread::Builder::new()
                .name("mac-tx-notify".into())
                .spawn(move || mac.tx_notifier())
                .expect("spawn MAC tx notifier"),
        );
    }

    /// Stop the workers and flush unsent slots back to the controller.
    pub fn stop(&self) {
        self.done.store(true, Ordering::Release);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        self.synth.missed_remaining();
    }

    /// RX worker: one timed burst read per slot, each handed to the
    /// demodulator pool. The pool runs behind the stream on purpose; a
    /// frame near the end of a slot is recovered from the next window's
    /// overlap region.
    fn rx_worker(&self) {
        let nominal = self.rx_slot_samps();
        let overlap_samps =
            (self.demod_overlap_size.as_secs_f64() * self.rx_rate) as usize;

        let mut t_cur = self
            .timing
            .next_boundary(self.transport.get_time_now());
        self.transport.start_rx_stream(t_cur);

        let mut seq: u64 = 0;
        let mut prev_tail = SampleBuf::new();

        while !self.done.load(Ordering::Acquire) {
            let want = self.transport.recommended_burst_rx_size(nominal);
            let mut buf = SampleBuf::with_capacity(want);

            match self.transport.burst_rx(t_cur, nominal, &mut buf) {
                Ok(()) => {}
                Err(err) => {
                    warn!("MAC: rx burst error, restarting stream: {err}");
                    self.transport.stop_rx_stream();
                    t_cur = self
                        .timing
                        .next_boundary(self.transport.get_time_now());
                    self.transport.start_rx_stream(t_cur);
                    prev_tail.clear();
                    continue;
                }
            }

            seq += 1;

            let tail_start = buf.len().saturating_sub(overlap_samps);
            let tail: SampleBuf = buf[tail_start..].to_vec();

            self.demod.push(RxSlotBuf {
                samples: buf,
                overlap: std::mem::replace(&mut prev_tail, tail),
                timestamp: t_cur,
                seq,
                channel: 0,
                rate: self.rx_rate,
                resamp_rate: 1.0,
            });

            t_cur = t_cur + self.timing.slot_size;
        }

        self.transport.stop_rx_stream();
    }

    /// TX worker: finalize, kick synthesis of the following slot,
    /// transmit, sleep.
    fn tx_worker(&self) {
        let mut in_burst = false;

        while !self.done.load(Ordering::Acquire) {
            let mut t_prev_modulated = MonoTime::ZERO;

            while !self.done.load(Ordering::Acquire) {
                let t_now = self.transport.get_time_now();

                let sched = self.schedule.lock().clone();
                let Some(next) = find_next_slot(t_now, &self.timing, &sched) else {
                    doze(Duration::from_millis(100));
                    continue;
                };

                // Exclusive access to the slot due at t_next, if one was
                // prepared in time
                let slot = self.synth.finalize(next.t_next);

                let noverfill = slot.as_ref().map_or(0, |s| s.noverfill());

                // Kick synthesis of the following slot, shortened by any
                // overfill only when it is physically adjacent
                if !next.t_following.approx_eq(t_prev_modulated) {
                    let adjacent = next
                        .t_following
                        .approx_eq(next.t_next + self.timing.slot_size);
                    let owns_after =
                        sched.can_transmit((next.following_idx + 1) % sched.nslots());

                    self.synth.modulate_slot(
                        next.t_following,
                        if adjacent { noverfill } else { 0 },
                        self.tx_slot_samps(),
                        owns_after,
                    );
                    t_prev_modulated = next.t_following;
                }

                if let Some(slot) = slot {
                    match self.tx_slot(&slot, &mut in_burst) {
                        Ok(()) => {}
                        Err(err) => {
                            warn!("MAC: tx burst error: {err}");
                            in_burst = false;
                            break;
                        }
                    }
                }

                if self.transport.tx_late_count() != 0 {
                    warn!("MAC: transport reported late bursts");
                    in_burst = false;
                    break;
                }

                // Sleep until the following slot must be handed over
                let t_now = self.transport.get_time_now();
                let wake = next.t_following - self.slot_send_lead_time;
                doze(wake.saturating_duration_since(t_now));
            }

            if self.done.load(Ordering::Acquire) {
                break;
            }

            info!("MAC: attempting to reset TX loop");
            doze(self.timing.slot_size / 2);
        }
    }

    /// Transmit one finalized slot.
    fn tx_slot(&self, slot: &slot::Slot, in_burst: &mut bool) -> Result<()> {
        let noverfill = slot.noverfill();
        let mpkts = slot.take();
        if mpkts.is_empty() {
            return Ok(());
        }

        let mut bufs: Vec<SampleBuf> = Vec::with_capacity(mpkts.len());
        let mut pkts: Vec<NetPacket> = Vec::with_capacity(mpkts.len());
        for mpkt in mpkts {
            bufs.push(mpkt.samples);
            pkts.push(mpkt.pkt);
        }

        let start_of_burst = !*in_burst;
        // An overfilled slot leaves the burst open into the next slot
        let end_of_burst = noverfill == 0;

        let res = self.transport.burst_tx(
            slot.deadline,
            start_of_burst,
            end_of_burst,
            &bufs,
        );

        match res {
            Ok(()) => {
                *in_burst = !end_of_burst;
                let _ = self.notify_tx.send(pkts);
                Ok(())
            }
            Err(err) => {
                // The slot never made it on the air: every data packet in
                // it is re-queued with its sequence number intact
                for pkt in pkts {
                    if !pkt.internal.is_timestamp {
                        self.controller.missed(pkt);
                    }
                }
                Err(err)
            }
        }
    }

    /// TX notifier: reports transmitted packets back to the controller so
    /// retransmission timers start and SACK timers are cancelled.
    fn tx_notifier(&self) {
        loop {
            match self
                .notify_rx
                .recv_timeout(Duration::from_millis(100))
            {
                Ok(pkts) => {
                    for pkt in pkts {
                        self.controller.transmitted(&pkt);
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if self.done.load(Ordering::Acquire) {
                        return;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> SlotTiming {
        SlotTiming {
            slot_size: Duration::from_millis(10),
            guard_size: Duration::from_millis(1),
            nslots: 4,
        }
    }

    #[test]
    fn test_find_next_slot_skips_unowned() {
        let timing = timing();
        // We own slots 1 and 3
        let sched = Schedule::from_slots(vec![false, true, false, true]);

        // At t = 2ms we are in slot 0; next owned slot starts at 10ms
        let t = MonoTime::from_secs_f64(0.002);
        let next = find_next_slot(t, &timing, &sched).unwrap();

        assert_eq!(next.next_idx, 1);
        assert_eq!(next.t_next.as_nanos(), 10_000_000);
        assert_eq!(next.following_idx, 3);
        assert_eq!(next.t_following.as_nanos(), 30_000_000);
    }

    #[test]
    fn test_find_next_slot_wraps_frame() {
        let timing = timing();
        let sched = Schedule::from_slots(vec![true, false, false, false]);

        // In slot 3 of the first frame; the next owned slot is slot 0 of
        // the next frame
        let t = MonoTime::from_secs_f64(0.031);
        let next = find_next_slot(t, &timing, &sched).unwrap();

        assert_eq!(next.next_idx, 0);
        assert_eq!(next.t_next.as_nanos(), 40_000_000);
        // The following owned slot is a full frame later
        assert_eq!(next.t_following.as_nanos(), 80_000_000);
    }

    #[test]
    fn test_find_next_slot_empty_schedule() {
        let timing = timing();
        let sched = Schedule::new(4);
        assert!(find_next_slot(MonoTime::ZERO, &timing, &sched).is_none());
    }

    #[test]
    fn test_schedule_tdma() {
        let s = Schedule::tdma(4, 2);
        assert!(!s.can_transmit(0));
        assert!(s.can_transmit(2));
        assert!(s.can_transmit(6));
        assert!(s.any());
        assert!(!Schedule::new(4).any());
    }
}
