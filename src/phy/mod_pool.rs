//! The modulator worker pool.
//!
//! Each worker repeatedly pulls the next eligible packet from the
//! controller, renders it to baseband at the packet's MCS and linear gain,
//! and publishes the result to the synthesizer's FIFO. Timestamped packets
//! are passed through unmodulated: their transmission time is only known
//! when the synthesizer commits them to a slot, so the synthesizer
//! modulates them itself.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::arq::Controller;
use crate::clock::MonoClock;
use crate::packet::NetPacket;
use crate::phy::{Codec, McsTable, Modulator, Sample, SampleBuf};

/// Chunk size for draining a modulator.
const MOD_CHUNK: usize = 4096;

/// A modulated packet.
#[derive(Debug)]
pub struct ModPacket {
    /// The packet itself.
    pub pkt: NetPacket,
    /// Modulated baseband samples, already scaled by the packet gain.
    pub samples: SampleBuf,
    /// Sample offset within the slot's data region, set on commit.
    pub offset: usize,
    /// Number of samples.
    pub nsamples: usize,
    /// Number of samples before any rate conversion.
    pub nsamples_pre_resample: usize,
    /// Sample index on the slot timeline, set on commit.
    pub start: usize,
    /// Channel the packet is synthesized for.
    pub channel: usize,
    /// Time spent modulating.
    pub mod_latency: Duration,
}

impl ModPacket {
    /// A passthrough entry for a packet the synthesizer must modulate
    /// itself.
    pub fn passthrough(pkt: NetPacket) -> ModPacket {
        ModPacket {
            pkt,
            samples: SampleBuf::new(),
            offset: 0,
            nsamples: 0,
            nsamples_pre_resample: 0,
            start: 0,
            channel: 0,
            mod_latency: Duration::ZERO,
        }
    }
}

/// The FIFO between the modulator pool and the slot synthesizer.
///
/// Supports put-back at the front: a packet popped by the synthesizer but
/// not committed to a slot (the slot closed or filled first) goes back to
/// the head so slot assignment stays atomic per packet.
pub struct ModQueue {
    q: Mutex<VecDeque<ModPacket>>,
    cond: Condvar,
    done: Mutex<bool>,
}

impl Default for ModQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ModQueue {
    pub fn new() -> ModQueue {
        ModQueue {
            q: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            done: Mutex::new(false),
        }
    }

    /// Publish a freshly modulated packet.
    pub fn push(&self, mpkt: ModPacket) {
        self.q.lock().push_back(mpkt);
        self.cond.notify_one();
    }

    /// Return an uncommitted packet to the head of the queue.
    pub fn put_back(&self, mpkt: ModPacket) {
        self.q.lock().push_front(mpkt);
        self.cond.notify_one();
    }

    /// Pop the next packet, waiting up to `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<ModPacket> {
        let mut q = self.q.lock();
        if let Some(mpkt) = q.pop_front() {
            return Some(mpkt);
        }
        self.cond.wait_for(&mut q, timeout);
        q.pop_front()
    }

    /// Pop without waiting.
    pub fn try_pop(&self) -> Option<ModPacket> {
        self.q.lock().pop_front()
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.q.lock().len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake any waiting consumers for shutdown.
    pub fn stop(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    /// True once `stop` has been called.
    pub fn stopped(&self) -> bool {
        *self.done.lock()
    }
}

/// Render one packet to baseband with the given modulator.
///
/// Returns the scaled samples; the pre-gain buffer feeds the soft-gain
/// estimator.
pub(crate) fn modulate_packet(
    modulator: &mut dyn Modulator,
    pkt: &NetPacket,
) -> (SampleBuf, SampleBuf) {
    modulator.assemble(&pkt.hdr.to_bytes(), &pkt.payload_bytes());

    let mut raw = SampleBuf::new();
    let mut chunk = vec![Sample::new(0.0, 0.0); MOD_CHUNK];
    loop {
        let (n, last) = modulator.write_samples(&mut chunk);
        raw.extend_from_slice(&chunk[..n]);
        if last {
            break;
        }
    }

    let scaled = raw.iter().map(|s| s * pkt.gain).collect();
    (scaled, raw)
}

/// The modulator worker pool.
pub struct ModulatorPool {
    queue: Arc<ModQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ModulatorPool {
    /// Start `nthreads` modulator workers.
    pub fn start(
        nthreads: usize,
        controller: Arc<Controller>,
        codec: Arc<dyn Codec>,
        mcs_table: Arc<McsTable>,
        gain_percentile: f64,
    ) -> Arc<ModulatorPool> {
        let pool = Arc::new(ModulatorPool {
            queue: Arc::new(ModQueue::new()),
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = pool.workers.lock();
        for i in 0..nthreads.max(1) {
            let controller = controller.clone();
            let codec = codec.clone();
            let mcs_table = mcs_table.clone();
            let queue = pool.queue.clone();

            workers.push(
                std::thread::Builder::new()
                    .name(format!("mod-worker-{i}"))
                    .spawn(move || {
                        mod_worker(&controller, &*codec, &mcs_table, &queue, gain_percentile)
                    })
                    .expect("spawn modulator worker"),
            );
        }
        drop(workers);

        pool
    }

    /// The FIFO feeding the slot synthesizer.
    pub fn queue(&self) -> &Arc<ModQueue> {
        &self.queue
    }

    /// Wait for the workers to exit.
    ///
    /// The workers exit once the controller's queue is stopped and drained.
    pub fn join(&self) {
        self.queue.stop();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn mod_worker(
    controller: &Controller,
    codec: &dyn Codec,
    mcs_table: &McsTable,
    queue: &ModQueue,
    gain_percentile: f64,
) {
    let mut modulators: HashMap<usize, Box<dyn Modulator>> = HashMap::new();

    while let Some(pkt) = controller.pull() {
        // The synthesizer modulates timestamped packets at commit time
        if pkt.internal.is_timestamp {
            queue.push(ModPacket::passthrough(pkt));
            continue;
        }

        let t0 = MonoClock::now();
        let entry = mcs_table.entry(pkt.mcsidx);

        let modulator = modulators
            .entry(pkt.mcsidx)
            .or_insert_with(|| codec.modulator(entry.mcs));

        let (samples, raw) = modulate_packet(modulator.as_mut(), &pkt);
        entry.autogain.estimate(&raw, gain_percentile);

        let nsamples = samples.len();
        let mod_latency = MonoClock::now().saturating_duration_since(t0);

        debug!(
            "PHY: modulated: node={}; seq={}; mcsidx={}; nsamples={}",
            pkt.hdr.nexthop, pkt.hdr.seq, pkt.mcsidx, nsamples,
        );

        queue.push(ModPacket {
            pkt,
            samples,
            offset: 0,
            nsamples,
            nsamples_pre_resample: nsamples,
            start: 0,
            channel: 0,
            mod_latency,
        });
    }
}
