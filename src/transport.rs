//! The radio front-end abstraction.
//!
//! The link core drives the radio through [`Transport`]: timed bursted
//! receive and transmit of complex baseband samples against the
//! transport's own monotonic clock. A USRP-style device maps onto this
//! directly; [`LoopbackMedium`] provides an in-memory implementation that
//! connects any number of endpoints for tests and bench setups.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::clock::{doze, MonoClock, MonoTime};
use crate::error::{LinkError, Result};
use crate::phy::{Sample, SampleBuf};

/// Timed bursted access to the radio front-end.
pub trait Transport: Send + Sync {
    fn set_rx_rate(&self, rate: f64);
    fn set_tx_rate(&self, rate: f64);
    fn set_rx_freq(&self, freq: f64);
    fn set_tx_freq(&self, freq: f64);
    fn set_rx_gain(&self, db: f64);
    fn set_tx_gain(&self, db: f64);

    /// The transport's monotonic clock.
    fn get_time_now(&self) -> MonoTime;

    /// Begin streaming receive at `at`.
    fn start_rx_stream(&self, at: MonoTime);

    /// Stop the receive stream.
    fn stop_rx_stream(&self);

    /// Read `nsamps` samples beginning at `at` into `buf`.
    ///
    /// `buf` is cleared and filled with exactly the received window; the
    /// call returns once the window has elapsed.
    fn burst_rx(&self, at: MonoTime, nsamps: usize, buf: &mut SampleBuf) -> Result<()>;

    /// Transmit sample buffers as (part of) a burst starting at `at`.
    fn burst_tx(
        &self,
        at: MonoTime,
        start_of_burst: bool,
        end_of_burst: bool,
        bufs: &[SampleBuf],
    ) -> Result<()>;

    /// Recommended read size for a nominal window, allowing the transport
    /// headroom for its own buffering granularity.
    fn recommended_burst_rx_size(&self, nominal: usize) -> usize {
        nominal
    }

    /// Number of TX bursts that missed their deadline since start.
    fn tx_late_count(&self) -> u64 {
        0
    }
}

/// One burst on the in-memory medium.
#[derive(Debug, Clone)]
struct AirBurst {
    at: MonoTime,
    samples: SampleBuf,
}

#[derive(Default)]
struct EndpointState {
    inbound: Vec<AirBurst>,
    streaming: bool,
}

struct Endpoint {
    state: Mutex<EndpointState>,
}

struct MediumInner {
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
}

impl MediumInner {
    fn broadcast(&self, from: &Arc<Endpoint>, burst: AirBurst) {
        for ep in self.endpoints.read().iter() {
            if Arc::ptr_eq(ep, from) {
                continue;
            }
            let mut state = ep.state.lock();
            if state.streaming {
                state.inbound.push(burst.clone());
            }
        }
    }
}

/// An in-memory medium connecting loopback transports.
///
/// Every burst transmitted by one endpoint is heard by every other
/// endpoint at the same timestamp, with unit gain and no noise.
pub struct LoopbackMedium {
    inner: Arc<MediumInner>,
}

impl Default for LoopbackMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackMedium {
    pub fn new() -> LoopbackMedium {
        LoopbackMedium {
            inner: Arc::new(MediumInner {
                endpoints: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Attach a new endpoint to the medium.
    pub fn endpoint(&self, rate: f64) -> Arc<LoopbackTransport> {
        let ep = Arc::new(Endpoint {
            state: Mutex::new(EndpointState::default()),
        });
        self.inner.endpoints.write().push(ep.clone());

        Arc::new(LoopbackTransport {
            medium: self.inner.clone(),
            endpoint: ep,
            rx_rate: Mutex::new(rate),
            tx_rate: Mutex::new(rate),
            late: Mutex::new(0),
        })
    }
}

/// A [`Transport`] endpoint on a [`LoopbackMedium`].
pub struct LoopbackTransport {
    medium: Arc<MediumInner>,
    endpoint: Arc<Endpoint>,
    rx_rate: Mutex<f64>,
    tx_rate: Mutex<f64>,
    late: Mutex<u64>,
}

impl Transport for LoopbackTransport {
    fn set_rx_rate(&self, rate: f64) {
        *self.rx_rate.lock() = rate;
    }

    fn set_tx_rate(&self, rate: f64) {
        *self.tx_rate.lock() = rate;
    }

    fn set_rx_freq(&self, _freq: f64) {}
    fn set_tx_freq(&self, _freq: f64) {}
    fn set_rx_gain(&self, _db: f64) {}
    fn set_tx_gain(&self, _db: f64) {}

    fn get_time_now(&self) -> MonoTime {
        MonoClock::now()
    }

    fn start_rx_stream(&self, _at: MonoTime) {
        let mut state = self.endpoint.state.lock();
        state.streaming = true;
        state.inbound.clear();
    }

    fn stop_rx_stream(&self) {
        let mut state = self.endpoint.state.lock();
        state.streaming = false;
        state.inbound.clear();
    }

    fn burst_rx(&self, at: MonoTime, nsamps: usize, buf: &mut SampleBuf) -> Result<()> {
        let rate = *self.rx_rate.lock();
        let window = std::time::Duration::from_secs_f64(nsamps as f64 / rate);
        let end = at + window;

        // The read completes only once the window has fully elapsed
        let now = MonoClock::now();
        if end > now {
            doze(end.saturating_duration_since(now));
        }

        buf.clear();
        buf.resize(nsamps, Sample::new(0.0, 0.0));

        let mut state = self.endpoint.state.lock();
        if !state.streaming {
            return Err(LinkError::TransportStream("rx stream stopped".into()));
        }

        // Overlay every burst that intersects the window and retire the
        // ones entirely in the past
        state.inbound.retain(|burst| {
            let start = burst.at;
            let burst_end =
                start + std::time::Duration::from_secs_f64(burst.samples.len() as f64 / rate);

            if burst_end <= at {
                return false;
            }
            if start >= end {
                return true;
            }

            let offset = ((start.delta(at) as f64 / 1e9) * rate).round() as i64;
            for (i, s) in burst.samples.iter().enumerate() {
                let idx = offset + i as i64;
                if idx >= 0 && (idx as usize) < nsamps {
                    buf[idx as usize] = *s;
                }
            }

            burst_end > end
        });

        Ok(())
    }

    fn burst_tx(
        &self,
        at: MonoTime,
        start_of_burst: bool,
        end_of_burst: bool,
        bufs: &[SampleBuf],
    ) -> Result<()> {
        let now = MonoClock::now();
        if start_of_burst && at < now {
            *self.late.lock() += 1;
            return Err(LinkError::TransportLate(format!(
                "burst at {:.6} but now is {:.6}",
                at.as_secs_f64(),
                now.as_secs_f64(),
            )));
        }

        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut samples = SampleBuf::with_capacity(total);
        for b in bufs {
            samples.extend_from_slice(b);
        }

        debug!(
            "MAC: loopback tx: at={:.6}; nsamples={}; dur={:.6}; sob={}; eob={}",
            at.as_secs_f64(),
            samples.len(),
            samples.len() as f64 / *self.tx_rate.lock(),
            start_of_burst,
            end_of_burst,
        );

        self.medium
            .broadcast(&self.endpoint, AirBurst { at, samples });
        Ok(())
    }

    fn tx_late_count(&self) -> u64 {
        *self.late.lock()
    }
}
