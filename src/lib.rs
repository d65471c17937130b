//! # slotlink
//!
//! A slotted-TDMA radio link core: per-neighbor selective-repeat ARQ with
//! adaptive modulation and coding, pipelined across modulator and
//! demodulator worker pools against a shared slot timeline.
//!
//! ## Overview
//!
//! The crate turns a stream of IP datagrams into a reliable, adaptive,
//! slotted-time wireless link between a small set of cooperating nodes:
//!
//! - **Slotted TDMA MAC** - timed bursted RX/TX aligned to a shared
//!   wall-clock timeline, with per-slot finalize/transmit pipelining
//! - **Selective-repeat ARQ** - per-neighbor send/receive windows,
//!   cumulative and selective acknowledgment, explicit NAKs,
//!   retransmission timers, bounded drop policy
//! - **AMC** - per-neighbor packet-error-rate estimation driving MCS
//!   transitions with hysteresis and EVM gating
//!
//! The radio front-end, the waveform codec, and the OS network interface
//! are collaborators behind the [`transport::Transport`], [`phy::Codec`]
//! and [`net::NetIo`] traits.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            Radio                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  NetIo ──→ NetQueue ──→ Controller ──→ ModulatorPool         │
//! │    ↑                     │    ↑             │                │
//! │    │                  windows timers   SlotSynthesizer       │
//! │    │                     │    │             │                │
//! │    └──── DemodulatorPool ┴────┴──── TdmaMac ┴──→ Transport   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use slotlink::{LinkConfig, Radio};
//! use slotlink::mac::Schedule;
//!
//! let cfg = std::sync::Arc::new(LinkConfig { node_id: 1, ..LinkConfig::default() });
//! let radio = Radio::build(cfg, transport, codec, netio, Schedule::tdma(2, 0))?;
//! // ... traffic flows until shutdown ...
//! radio.stop();
//! ```

pub mod arq;
pub mod clock;
pub mod error;
pub mod estimator;
pub mod mac;
pub mod net;
pub mod neighbor;
pub mod packet;
pub mod phy;
pub mod queue;
pub mod seq;
pub mod timer;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use arq::{AmcParams, Controller};
use error::{LinkError, Result};
use mac::slot::SlotSynthesizer;
use mac::{Schedule, TdmaMac};
use neighbor::{NeighborDefaults, NeighborTable};
use packet::NodeId;
use phy::demod_pool::DemodulatorPool;
use phy::mod_pool::ModulatorPool;
use phy::{Check, Codec, Fec, Mcs, McsTable, ModScheme};
use queue::NetQueue;
use transport::Transport;

/// Configuration for the link core.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// This node's 8-bit id.
    pub node_id: NodeId,
    /// Number of cooperating nodes.
    pub num_nodes: usize,

    // === MAC timing ===
    /// Slot length, guard included.
    pub slot_size: Duration,
    /// Dead zone at the end of each slot.
    pub guard_size: Duration,
    /// Slots per frame.
    pub nslots: usize,
    /// Time reserved for computing the next slot's samples.
    pub slot_modulate_lead_time: Duration,
    /// Time reserved for delivering samples to the transport.
    pub slot_send_lead_time: Duration,
    /// Demodulation overlap carried between RX slots.
    pub demod_overlap_size: Duration,
    /// TX sample rate.
    pub tx_rate: f64,
    /// RX sample rate.
    pub rx_rate: f64,

    // === Worker counts ===
    /// Demodulator pool size.
    pub rx_thread_pool_size: usize,
    /// Modulator pool size.
    pub mod_thread_pool_size: usize,

    // === Codec parameters ===
    /// MCS levels, most to least robust.
    pub mcs_table: Vec<Mcs>,
    /// Header MCS, used for every frame header.
    pub header_mcs: Mcs,
    /// Down-shift EVM thresholds, entry-aligned with `mcs_table`.
    pub evm_thresholds: Vec<Option<f64>>,

    // === ARQ windows ===
    /// Maximum send window per neighbor.
    pub max_sendwin: u16,
    /// Receive window per neighbor.
    pub recvwin: u16,

    // === AMC policy ===
    pub mcsidx_init: usize,
    pub mcsidx_min: usize,
    pub mcsidx_max: usize,
    /// MCS used for broadcast packets.
    pub mcsidx_broadcast: usize,
    pub mcsidx_up_per_threshold: f64,
    pub mcsidx_down_per_threshold: f64,
    pub mcsidx_alpha: f64,
    pub mcsidx_prob_floor: f64,
    /// Short PER window, in slots' worth of packets.
    pub short_per_nslots: u64,
    /// Long PER window, in slots' worth of packets.
    pub long_per_nslots: u64,

    // === Timer policy ===
    /// Expected ACK round trip, before measurements arrive.
    pub ack_delay: Duration,
    /// Time we wait for a data packet to carry a selective ACK.
    pub sack_delay: Duration,
    /// Initial retransmission timeout.
    pub retransmission_delay: Duration,
    /// Floor for the adaptive retransmission timeout.
    pub min_retransmission_delay: Duration,
    /// Multiplier applied to the ACK-delay EMA to form the timeout.
    pub retransmission_delay_slop: f64,

    // === Explicit NAK rate limit ===
    /// NAKs allowed per rate-limit window; zero disables explicit NAKs.
    pub explicit_nak_win: usize,
    /// Rate-limit window duration.
    pub explicit_nak_win_duration: Duration,

    // === Feedback policy ===
    /// Attach selective ACKs to outbound packets.
    pub selective_ack: bool,
    /// Age a transmission must reach before missing feedback counts
    /// against it.
    pub selective_ack_feedback_delay: Duration,

    /// Drop a packet after this many retransmissions; `None` retries
    /// forever.
    pub max_retransmissions: Option<u32>,

    // === Behavior switches ===
    /// Deliver strictly in sequence order per neighbor.
    pub enforce_ordering: bool,
    /// The demodulator delivers frames in order, so a NAK proves every
    /// earlier frame was observed.
    pub demod_always_ordered: bool,
    /// Advance a full window over an exhausted head instead of stalling.
    pub move_along: bool,
    /// Retransmit deadline-bearing packets one MCS lower.
    pub decrease_retrans_mcsidx: bool,

    // === Misc ===
    /// Maximum radio payload size.
    pub mtu: usize,
    /// Linear gain for broadcast packets.
    pub broadcast_gain: f32,
    /// Linear gain for control-only packets.
    pub ack_gain: f32,
    /// HELLO broadcast period; zero disables HELLOs.
    pub hello_interval: Duration,
    /// Time constant of the receiver EVM/RSSI averages.
    pub stats_window: Duration,
    /// Percentile of the IQ magnitude distribution driven to 0 dBFS by
    /// the soft-gain estimator.
    pub soft_gain_percentile: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        let qpsk = |fec0, fec1, ms| Mcs::new(Check::Crc32, fec0, fec1, ms);

        Self {
            node_id: 1,
            num_nodes: 2,

            slot_size: Duration::from_millis(10),
            guard_size: Duration::from_millis(1),
            nslots: 2,
            slot_modulate_lead_time: Duration::from_millis(3),
            slot_send_lead_time: Duration::from_millis(2),
            demod_overlap_size: Duration::from_micros(500),
            tx_rate: 1e6,
            rx_rate: 1e6,

            rx_thread_pool_size: 2,
            mod_thread_pool_size: 2,

            mcs_table: vec![
                qpsk(Fec::ConvV27, Fec::ReedSolomon8, ModScheme::Bpsk),
                qpsk(Fec::ConvV27, Fec::None, ModScheme::Qpsk),
                qpsk(Fec::ConvV29, Fec::None, ModScheme::Qam16),
                qpsk(Fec::None, Fec::None, ModScheme::Qam64),
            ],
            header_mcs: qpsk(Fec::ConvV27, Fec::ReedSolomon8, ModScheme::Bpsk),
            evm_thresholds: vec![None, None, None, None],

            max_sendwin: 512,
            recvwin: 512,

            mcsidx_init: 0,
            mcsidx_min: 0,
            mcsidx_max: usize::MAX,
            mcsidx_broadcast: 0,
            mcsidx_up_per_threshold: 0.04,
            mcsidx_down_per_threshold: 0.10,
            mcsidx_alpha: 0.5,
            mcsidx_prob_floor: 0.1,
            short_per_nslots: 2,
            long_per_nslots: 8,

            ack_delay: Duration::from_millis(100),
            sack_delay: Duration::from_millis(50),
            retransmission_delay: Duration::from_millis(500),
            min_retransmission_delay: Duration::from_millis(200),
            retransmission_delay_slop: 1.1,

            explicit_nak_win: 10,
            explicit_nak_win_duration: Duration::from_secs(1),

            selective_ack: true,
            selective_ack_feedback_delay: Duration::from_millis(300),

            max_retransmissions: Some(5),

            enforce_ordering: false,
            demod_always_ordered: false,
            move_along: true,
            decrease_retrans_mcsidx: false,

            mtu: 1500,
            broadcast_gain: 1.0,
            ack_gain: 1.0,
            hello_interval: Duration::from_secs(10),
            stats_window: Duration::from_secs(1),
            soft_gain_percentile: 0.999,
        }
    }
}

impl LinkConfig {
    /// Extract and validate the AMC policy for an `nlevels`-entry MCS
    /// table.
    pub fn amc_params(&self, nlevels: usize) -> Result<AmcParams> {
        if nlevels == 0 {
            return Err(LinkError::config("MCS table is empty"));
        }
        if self.mcsidx_min >= nlevels {
            return Err(LinkError::config(format!(
                "mcsidx_min {} out of range for {} MCS levels",
                self.mcsidx_min, nlevels
            )));
        }
        if self.mcsidx_min > self.mcsidx_max {
            return Err(LinkError::config("mcsidx_min exceeds mcsidx_max"));
        }
        if !(0.0..=1.0).contains(&self.mcsidx_alpha) {
            return Err(LinkError::config("mcsidx_alpha outside [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.mcsidx_prob_floor) {
            return Err(LinkError::config("mcsidx_prob_floor outside [0, 1]"));
        }

        Ok(AmcParams {
            mcsidx_min: self.mcsidx_min,
            mcsidx_max: self.mcsidx_max.min(nlevels - 1),
            up_per_threshold: self.mcsidx_up_per_threshold,
            down_per_threshold: self.mcsidx_down_per_threshold,
            alpha: self.mcsidx_alpha,
            prob_floor: self.mcsidx_prob_floor,
            short_per_nslots: self.short_per_nslots,
            long_per_nslots: self.long_per_nslots,
        })
    }

    /// Initial state handed to newly discovered neighbors.
    pub fn neighbor_defaults(&self) -> NeighborDefaults {
        NeighborDefaults {
            ack_delay: self.ack_delay,
            retransmission_delay: self.retransmission_delay,
            mcsidx: self.mcsidx_init,
        }
    }

    /// Build the MCS table, asking `codec` for per-level payload bounds.
    pub fn build_mcs_table(&self, codec: &dyn Codec) -> Result<McsTable> {
        let max_packet_samples = self
            .mcs_table
            .iter()
            .map(|mcs| codec.max_modulated_samples(*mcs, self.mtu))
            .collect();

        McsTable::new(
            self.mcs_table.clone(),
            self.evm_thresholds.clone(),
            max_packet_samples,
        )
    }
}

/// A fully-assembled link radio.
///
/// Owns the controller, the worker pools, the synthesizer and the MAC,
/// plus the pump thread that moves outbound frames from the network
/// interface into the controller.
pub struct Radio {
    /// The ARQ/AMC controller.
    pub controller: Arc<Controller>,
    /// The slotted MAC.
    pub mac: Arc<TdmaMac>,
    mod_pool: Arc<ModulatorPool>,
    synth: Arc<SlotSynthesizer>,
    demod: Arc<DemodulatorPool>,
    done: Arc<AtomicBool>,
    net_pump: Mutex<Option<JoinHandle<()>>>,
}

impl Radio {
    /// Assemble a radio from its collaborators and start its workers.
    pub fn build(
        cfg: Arc<LinkConfig>,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        netio: Arc<dyn net::NetIo>,
        schedule: Schedule,
    ) -> Result<Radio> {
        let mcs_table = Arc::new(cfg.build_mcs_table(&*codec)?);

        let neighbors = Arc::new(NeighborTable::new(cfg.node_id, cfg.neighbor_defaults()));
        {
            let netio = netio.clone();
            neighbors.on_discover(Arc::new(move |node| {
                netio.add_arp_entry(node, net::node_ip(node));
            }));
        }

        let netq = Arc::new(NetQueue::new());
        let controller = Controller::new(cfg.clone(), mcs_table.clone(), neighbors, netq)?;

        {
            let netio = netio.clone();
            controller.clone().start(Box::new(move |pkt| {
                netio.deliver(pkt.data.to_vec());
            }));
        }

        let mod_pool = ModulatorPool::start(
            cfg.mod_thread_pool_size,
            controller.clone(),
            codec.clone(),
            mcs_table.clone(),
            cfg.soft_gain_percentile,
        );

        let synth = SlotSynthesizer::start(
            1,
            mod_pool.queue().clone(),
            controller.clone(),
            codec.clone(),
            mcs_table.clone(),
            cfg.tx_rate,
        );

        let demod = DemodulatorPool::start(
            cfg.rx_thread_pool_size,
            controller.clone(),
            codec,
            mcs_table,
            cfg.header_mcs,
            cfg.node_id,
        );

        let mac = TdmaMac::new(
            &cfg,
            transport,
            controller.clone(),
            synth.clone(),
            demod.clone(),
            schedule,
        );
        mac.clone().start();

        // Pump outbound frames from the network interface
        let done = Arc::new(AtomicBool::new(false));
        let net_pump = {
            let done = done.clone();
            let controller = controller.clone();
            let me = cfg.node_id;
            std::thread::Builder::new()
                .name("net-pump".into())
                .spawn(move || {
                    while !done.load(Ordering::Acquire) {
                        let Some(frame) =
                            netio.next_outbound(Some(Duration::from_millis(100)))
                        else {
                            continue;
                        };
                        if let Some(pkt) = net::filter_outbound(me, frame) {
                            controller.push_net(pkt);
                        }
                    }
                })
                .expect("spawn net pump")
        };

        Ok(Radio {
            controller,
            mac,
            mod_pool,
            synth,
            demod,
            done,
            net_pump: Mutex::new(Some(net_pump)),
        })
    }

    /// Stop every worker, flushing unsent slots back through the
    /// controller.
    pub fn stop(&self) {
        self.done.store(true, Ordering::Release);
        if let Some(handle) = self.net_pump.lock().take() {
            let _ = handle.join();
        }

        self.mac.stop();
        self.controller.stop();
        self.mod_pool.join();
        self.synth.stop();
        self.demod.stop();
    }
}
