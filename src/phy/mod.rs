//! PHY-facing types: MCS descriptors, the codec interface, and the
//! modulator/demodulator worker pools.
//!
//! The waveform codec itself (framing, FEC, symbol sync) is a collaborator
//! behind the [`Codec`] trait; the link core only chooses an MCS, hands the
//! codec a header and payload, and interprets the per-frame statistics the
//! codec reports on receive.

pub mod demod_pool;
pub mod mod_pool;

use num_complex::Complex;
use parking_lot::Mutex;

use crate::error::{LinkError, Result};
use crate::estimator::Ema;
use crate::packet::Header;

/// One complex baseband sample.
pub type Sample = Complex<f32>;

/// A buffer of baseband samples.
pub type SampleBuf = Vec<Sample>;

/// Data-integrity check schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Check {
    None,
    Checksum8,
    Crc16,
    Crc32,
}

/// Forward error correction schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fec {
    None,
    Hamming74,
    Hamming128,
    Golay2412,
    ConvV27,
    ConvV29,
    ReedSolomon8,
}

/// Modulation schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModScheme {
    Bpsk,
    Qpsk,
    Qam16,
    Qam64,
    Qam256,
}

/// A modulation-and-coding scheme: check, inner FEC, outer FEC, modulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mcs {
    pub check: Check,
    pub fec0: Fec,
    pub fec1: Fec,
    pub ms: ModScheme,
}

impl Mcs {
    pub fn new(check: Check, fec0: Fec, fec1: Fec, ms: ModScheme) -> Mcs {
        Mcs { check, fec0, fec1, ms }
    }
}

/// Per-frame statistics reported by the demodulator.
#[derive(Debug, Clone, Copy)]
pub struct FrameStats {
    /// MCS tuple observed on the payload.
    pub mcs: Mcs,
    /// Error vector magnitude [dB].
    pub evm: f32,
    /// Received signal strength [dB].
    pub rssi: f32,
    /// Carrier frequency offset (f/Fs).
    pub cfo: f32,
    /// Codec-frame sample counter at the start of the frame.
    pub start_counter: u64,
    /// Codec-frame sample counter just past the end of the frame.
    pub end_counter: u64,
    /// Number of frame symbols.
    pub num_framesyms: usize,
}

/// A framed-packet event delivered by [`Demodulator::demodulate`].
///
/// Delivered twice per frame: first with `header_test` set, asking whether
/// the frame is wanted at all, then with the final payload result.
#[derive(Debug)]
pub struct FrameEvent<'a> {
    /// Raw frame header bytes, when the header was recovered.
    pub header: Option<[u8; Header::SIZE]>,
    /// The header passed its check.
    pub header_valid: bool,
    /// Recovered payload bytes, on the final phase.
    pub payload: Option<&'a [u8]>,
    /// The payload passed its check.
    pub payload_valid: bool,
    /// Frame statistics.
    pub stats: FrameStats,
    /// True on the first, header-only phase.
    pub header_test: bool,
}

/// A packet modulator for one MCS.
pub trait Modulator: Send {
    /// Load a header and payload into the modulator.
    fn assemble(&mut self, header: &[u8; Header::SIZE], payload: &[u8]);

    /// Write baseband samples into `out`.
    ///
    /// Returns the number of samples written and whether the frame is
    /// complete.
    fn write_samples(&mut self, out: &mut [Sample]) -> (usize, bool);
}

/// A streaming packet demodulator.
pub trait Demodulator: Send {
    /// Reset framing state, e.g. at a slot boundary discontinuity.
    fn reset(&mut self);

    /// Feed samples through the demodulator.
    ///
    /// `cb` is invoked for every framed packet, twice (see [`FrameEvent`]);
    /// returning `false` from the header-test phase skips the frame.
    fn demodulate(&mut self, samples: &[Sample], cb: &mut dyn FnMut(&FrameEvent<'_>) -> bool);
}

/// The waveform codec: a factory for modulators and demodulators.
pub trait Codec: Send + Sync {
    /// Create a modulator for the given MCS.
    fn modulator(&self, mcs: Mcs) -> Box<dyn Modulator>;

    /// Create a demodulator whose frame headers are protected by
    /// `header_mcs`.
    fn demodulator(&self, header_mcs: Mcs) -> Box<dyn Demodulator>;

    /// Upper bound on the modulated length of a `payload_len`-byte packet
    /// at the given MCS, in samples.
    fn max_modulated_samples(&self, mcs: Mcs, payload_len: usize) -> usize;
}

/// Soft TX gain tracked per MCS table entry.
///
/// The estimator learns the multiplicative gain that drives the given
/// percentile of the modulated IQ magnitude distribution to 0 dBFS, as an
/// EMA over estimation passes.
pub struct SoftTxGain {
    gain: Mutex<Ema>,
}

impl std::fmt::Debug for SoftTxGain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftTxGain")
            .field("gain", &self.gain.lock().value())
            .finish()
    }
}

impl Default for SoftTxGain {
    fn default() -> Self {
        SoftTxGain {
            gain: Mutex::new(Ema::new(0.2, 1.0)),
        }
    }
}

impl SoftTxGain {
    /// Current recommended linear gain.
    pub fn get(&self) -> f32 {
        let g = self.gain.lock();
        if g.nsamples() == 0 {
            1.0
        } else {
            g.value() as f32
        }
    }

    /// Update the estimate from a modulated sample buffer.
    ///
    /// `percentile` selects which point of the magnitude distribution is
    /// driven to full scale, in `(0, 1]`.
    pub fn estimate(&self, samples: &[Sample], percentile: f64) {
        if samples.is_empty() {
            return;
        }

        let mut mags: Vec<f32> = samples.iter().map(|s| s.norm()).collect();
        mags.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let idx = ((mags.len() as f64 * percentile).ceil() as usize)
            .clamp(1, mags.len())
            - 1;
        let mag = mags[idx];
        if mag > 0.0 {
            self.gain.lock().update(1.0 / mag as f64);
        }
    }
}

/// One entry of the MCS table.
#[derive(Debug)]
pub struct McsEntry {
    /// The scheme itself.
    pub mcs: Mcs,
    /// Down-shift EVM threshold [dB], if this level has one.
    pub evm_threshold: Option<f64>,
    /// Upper bound on the samples of a full-MTU packet at this MCS.
    pub max_packet_samples: usize,
    /// Learned 0-dBFS soft gain.
    pub autogain: SoftTxGain,
}

/// The table of usable MCS levels, ordered from most to least robust.
#[derive(Debug)]
pub struct McsTable {
    entries: Vec<McsEntry>,
}

impl McsTable {
    /// Build a table from schemes, per-level EVM thresholds and per-level
    /// full-MTU sample bounds.
    ///
    /// The threshold and sample tables must be entry-aligned with the
    /// scheme table; a length mismatch is fatal.
    pub fn new(
        schemes: Vec<Mcs>,
        evm_thresholds: Vec<Option<f64>>,
        max_packet_samples: Vec<usize>,
    ) -> Result<McsTable> {
        if schemes.is_empty() {
            return Err(LinkError::config("MCS table is empty"));
        }
        if evm_thresholds.len() != schemes.len() {
            return Err(LinkError::EvmTableMismatch {
                thresholds: evm_thresholds.len(),
                mcs: schemes.len(),
            });
        }
        if max_packet_samples.len() != schemes.len() {
            return Err(LinkError::config(format!(
                "max_packet_samples has {} entries but MCS table has {}",
                max_packet_samples.len(),
                schemes.len()
            )));
        }

        let entries = schemes
            .into_iter()
            .zip(evm_thresholds)
            .zip(max_packet_samples)
            .map(|((mcs, evm_threshold), max_packet_samples)| McsEntry {
                mcs,
                evm_threshold,
                max_packet_samples,
                autogain: SoftTxGain::default(),
            })
            .collect();

        Ok(McsTable { entries })
    }

    /// Number of levels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the table has no levels.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry at `idx`.
    pub fn entry(&self, idx: usize) -> &McsEntry {
        &self.entries[idx]
    }

    /// How many full-MTU packets fit in a TX slot at level `idx`.
    pub fn packets_per_slot(&self, idx: usize, tx_slot_samps: usize) -> usize {
        let max = self.entries[idx].max_packet_samples;
        if max == 0 {
            0
        } else {
            tx_slot_samps / max
        }
    }

    /// A level is usable only if at least one full packet fits in a slot.
    pub fn is_valid(&self, idx: usize, tx_slot_samps: usize) -> bool {
        idx < self.entries.len() && self.packets_per_slot(idx, tx_slot_samps) >= 1
    }

    /// Find the index of an observed MCS tuple.
    pub fn find(&self, mcs: &Mcs) -> Option<usize> {
        self.entries.iter().position(|e| e.mcs == *mcs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schemes() -> Vec<Mcs> {
        vec![
            Mcs::new(Check::Crc32, Fec::ConvV27, Fec::ReedSolomon8, ModScheme::Bpsk),
            Mcs::new(Check::Crc32, Fec::ConvV27, Fec::None, ModScheme::Qpsk),
            Mcs::new(Check::Crc32, Fec::None, Fec::None, ModScheme::Qam16),
        ]
    }

    #[test]
    fn test_table_rejects_mismatched_thresholds() {
        let err = McsTable::new(schemes(), vec![None, None], vec![100, 100, 100]);
        assert!(matches!(err, Err(LinkError::EvmTableMismatch { .. })));
    }

    #[test]
    fn test_table_rejects_empty() {
        assert!(McsTable::new(vec![], vec![], vec![]).is_err());
    }

    #[test]
    fn test_find() {
        let table =
            McsTable::new(schemes(), vec![None, None, None], vec![4000, 2000, 1000]).unwrap();

        let target = Mcs::new(Check::Crc32, Fec::ConvV27, Fec::None, ModScheme::Qpsk);
        assert_eq!(table.find(&target), Some(1));

        let missing = Mcs::new(Check::None, Fec::None, Fec::None, ModScheme::Bpsk);
        assert_eq!(table.find(&missing), None);
    }

    #[test]
    fn test_validity_depends_on_slot() {
        let table =
            McsTable::new(schemes(), vec![None, None, None], vec![4000, 2000, 1000]).unwrap();

        assert!(table.is_valid(2, 1500));
        assert!(!table.is_valid(0, 1500));
        assert_eq!(table.packets_per_slot(2, 2500), 2);
    }

    #[test]
    fn test_soft_gain_estimate() {
        let gain = SoftTxGain::default();
        assert_eq!(gain.get(), 1.0);

        // Constant magnitude 0.5 everywhere: the 99.9th percentile gain is 2
        let samples: Vec<Sample> = (0..100).map(|_| Sample::new(0.5, 0.0)).collect();
        gain.estimate(&samples, 0.999);
        assert!((gain.get() - 2.0).abs() < 1e-3);
    }
}
