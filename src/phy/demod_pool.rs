//! The demodulator worker pool.
//!
//! The MAC RX worker hands one sample buffer per slot to the pool, tagged
//! with a window description that lets the callback convert codec-frame
//! sample counters back to the absolute RX timeline. Each buffer may carry
//! an overlap region copied from the tail of the previous slot, so frames
//! straddling a slot boundary are still recovered; demodulation runs
//! asynchronously and may deliver packets after the slot ends.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::arq::Controller;
use crate::clock::MonoTime;
use crate::net::mgen_info;
use crate::packet::{Header, NodeId, RadioPacket, BROADCAST};
use crate::phy::{Codec, FrameEvent, Mcs, McsTable, SampleBuf};

/// One slot's worth of received samples, primed with its position on the
/// RX timeline.
#[derive(Debug)]
pub struct RxSlotBuf {
    /// Samples of this slot.
    pub samples: SampleBuf,
    /// Tail of the previous slot, fed through first.
    pub overlap: SampleBuf,
    /// RX time of this slot's first sample.
    pub timestamp: MonoTime,
    /// Monotonically increasing slot counter.
    pub seq: u64,
    /// Channel index.
    pub channel: usize,
    /// RX sample rate for counter-to-time conversion.
    pub rate: f64,
    /// Resampling factor between codec counters and RX samples.
    pub resamp_rate: f64,
}

/// The demodulator worker pool.
pub struct DemodulatorPool {
    tx: Mutex<Option<Sender<RxSlotBuf>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DemodulatorPool {
    /// Start `nthreads` demodulator workers feeding `controller`.
    pub fn start(
        nthreads: usize,
        controller: Arc<Controller>,
        codec: Arc<dyn Codec>,
        mcs_table: Arc<McsTable>,
        header_mcs: Mcs,
        me: NodeId,
    ) -> Arc<DemodulatorPool> {
        let (tx, rx) = crossbeam_channel::unbounded::<RxSlotBuf>();

        let pool = Arc::new(DemodulatorPool {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = pool.workers.lock();
        for i in 0..nthreads.max(1) {
            let rx: Receiver<RxSlotBuf> = rx.clone();
            let controller = controller.clone();
            let codec = codec.clone();
            let mcs_table = mcs_table.clone();

            workers.push(
                std::thread::Builder::new()
                    .name(format!("demod-worker-{i}"))
                    .spawn(move || {
                        demod_worker(rx, &controller, &*codec, &mcs_table, header_mcs, me)
                    })
                    .expect("spawn demodulator worker"),
            );
        }
        drop(workers);

        pool
    }

    /// Queue a slot buffer for demodulation.
    pub fn push(&self, buf: RxSlotBuf) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(buf);
        }
    }

    /// Close the input and wait for the workers to drain.
    pub fn stop(&self) {
        self.tx.lock().take();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn demod_worker(
    rx: Receiver<RxSlotBuf>,
    controller: &Controller,
    codec: &dyn Codec,
    mcs_table: &McsTable,
    header_mcs: Mcs,
    me: NodeId,
) {
    let mut demod = codec.demodulator(header_mcs);

    for buf in rx.iter() {
        // Each window restarts framing: the overlap region provides the
        // continuity across the boundary.
        demod.reset();

        let mut joined =
            SampleBuf::with_capacity(buf.overlap.len() + buf.samples.len());
        joined.extend_from_slice(&buf.overlap);
        joined.extend_from_slice(&buf.samples);

        let sample_start = buf.overlap.len();

        let mut cb = |ev: &FrameEvent<'_>| -> bool {
            handle_frame(ev, &buf, sample_start, controller, mcs_table, me)
        };
        demod.demodulate(&joined, &mut cb);
    }
}

/// The per-window demodulation callback.
///
/// Phase one (`header_test`) implements the want-packet policy; phase two
/// builds the [`RadioPacket`] and sends it upstream.
fn handle_frame(
    ev: &FrameEvent<'_>,
    buf: &RxSlotBuf,
    sample_start: usize,
    controller: &Controller,
    mcs_table: &McsTable,
    me: NodeId,
) -> bool {
    let hdr = ev.header.and_then(|bytes| Header::from_bytes(&bytes));

    if ev.header_test {
        // Only keep frames addressed to us or to everyone
        return match (&hdr, ev.header_valid) {
            (Some(h), true) => h.nexthop == me || h.nexthop == BROADCAST,
            _ => false,
        };
    }

    let Some(hdr) = hdr else {
        return true;
    };

    let mut pkt = if ev.header_valid && ev.payload_valid {
        match ev.payload.and_then(|p| RadioPacket::parse(hdr, p)) {
            Some(pkt) => pkt,
            None => {
                // The codec liked the payload but it is incoherent; treat
                // it exactly like a failed payload check
                warn!("PHY: payload parse failure: curhop={}; seq={}", hdr.curhop, hdr.seq);
                let mut pkt = RadioPacket::header_only(hdr, true);
                pkt.payload_valid = false;
                pkt
            }
        }
    } else {
        RadioPacket::header_only(hdr, ev.header_valid)
    };

    // Convert the codec's frame counter to the absolute RX timeline
    let start = ev.stats.start_counter as f64 * buf.resamp_rate;
    let offset_samps = start - sample_start as f64;
    let offset_secs = offset_samps / buf.rate;
    pkt.timestamp = if offset_secs >= 0.0 {
        buf.timestamp + std::time::Duration::from_secs_f64(offset_secs)
    } else {
        buf.timestamp - std::time::Duration::from_secs_f64(-offset_secs)
    };

    pkt.evm = ev.stats.evm;
    pkt.rssi = ev.stats.rssi;
    pkt.cfo = ev.stats.cfo;
    pkt.channel = buf.channel;

    if let Some((flow, seqno)) = mgen_info(&pkt.data) {
        pkt.mgen_flow_uid = Some(flow);
        pkt.mgen_seqno = Some(seqno);
    }

    let mcsidx = mcs_table.find(&ev.stats.mcs);
    debug!(
        "PHY: received frame: curhop={}; seq={}; mcsidx={:?}; evm={:.1}; rssi={:.1}",
        pkt.hdr.curhop, pkt.hdr.seq, mcsidx, pkt.evm, pkt.rssi,
    );

    controller.received(pkt);
    true
}
