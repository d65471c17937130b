//! Statistical estimators used by the ARQ/AMC layer.
//!
//! Packet error rate is tracked by [`WindowedEma`] estimators whose window
//! is measured in packets at the current MCS; ACK round-trip delay uses a
//! plain [`Ema`]; receiver-side EVM and RSSI use [`TimeWindowedEma`], whose
//! smoothing weight depends on the time elapsed between samples rather than
//! on a sample count.

use crate::clock::MonoTime;

/// Estimate a value by its running mean.
#[derive(Debug, Clone, Default)]
pub struct Mean {
    value: f64,
    nsamples: u64,
}

impl Mean {
    /// Create an empty mean estimator.
    pub fn new() -> Mean {
        Mean::default()
    }

    /// Current estimate, or 0.0 before the first sample.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Number of samples folded in.
    pub fn nsamples(&self) -> u64 {
        self.nsamples
    }

    /// Fold in a new sample.
    pub fn update(&mut self, x: f64) {
        self.nsamples += 1;
        self.value += (x - self.value) / self.nsamples as f64;
    }
}

/// Exponentially weighted moving average with an explicit smoothing weight.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    value: f64,
    nsamples: u64,
}

impl Ema {
    /// Create an EMA with weight `alpha` and initial value `initial`.
    pub fn new(alpha: f64, initial: f64) -> Ema {
        Ema { alpha, value: initial, nsamples: 0 }
    }

    /// Current estimate.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Number of samples folded in since the last reset.
    pub fn nsamples(&self) -> u64 {
        self.nsamples
    }

    /// Fold in a new sample.
    pub fn update(&mut self, x: f64) {
        if self.nsamples == 0 {
            self.value = x;
        } else {
            self.value = self.alpha * x + (1.0 - self.alpha) * self.value;
        }
        self.nsamples += 1;
    }

    /// Reset to `initial` and forget all samples.
    pub fn reset(&mut self, initial: f64) {
        self.value = initial;
        self.nsamples = 0;
    }
}

/// EMA whose weight is derived from a window size measured in samples.
///
/// Choosing `alpha = 2 / (window + 1)` makes the most recent `window`
/// samples account for about 86% of the estimate. The window can be resized
/// on the fly; the AMC layer resizes PER windows on every MCS change because
/// the packets-per-slot count changes with the MCS.
#[derive(Debug, Clone)]
pub struct WindowedEma {
    window: u64,
    ema: Ema,
}

impl WindowedEma {
    /// Create an estimator over a window of `window` samples.
    ///
    /// The window is clamped to at least one sample.
    pub fn new(window: u64) -> WindowedEma {
        let window = window.max(1);
        WindowedEma {
            window,
            ema: Ema::new(2.0 / (window as f64 + 1.0), 0.0),
        }
    }

    /// Current estimate.
    pub fn value(&self) -> f64 {
        self.ema.value()
    }

    /// Number of samples folded in since the last reset.
    pub fn nsamples(&self) -> u64 {
        self.ema.nsamples()
    }

    /// Window size in samples.
    pub fn window(&self) -> u64 {
        self.window
    }

    /// True once a full window of samples has been observed.
    pub fn full(&self) -> bool {
        self.ema.nsamples() >= self.window
    }

    /// Fold in a new sample.
    pub fn update(&mut self, x: f64) {
        self.ema.update(x);
    }

    /// Resize the window and reset the estimate to `initial`.
    pub fn resize(&mut self, window: u64, initial: f64) {
        let window = window.max(1);
        self.window = window;
        self.ema = Ema::new(2.0 / (window as f64 + 1.0), initial);
    }
}

/// EMA over a time window.
///
/// The weight of a new sample grows with the time elapsed since the previous
/// sample, so the estimate decays toward fresh data with time constant
/// `tau` regardless of the sample rate.
#[derive(Debug, Clone)]
pub struct TimeWindowedEma {
    tau_secs: f64,
    value: Option<f64>,
    last: MonoTime,
}

impl TimeWindowedEma {
    /// Create an estimator with time constant `tau_secs`.
    pub fn new(tau_secs: f64) -> TimeWindowedEma {
        TimeWindowedEma { tau_secs, value: None, last: MonoTime::ZERO }
    }

    /// Current estimate, if any sample has arrived.
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Fold in a sample observed at `now`.
    pub fn update(&mut self, now: MonoTime, x: f64) {
        match self.value {
            None => self.value = Some(x),
            Some(v) => {
                let dt = now.saturating_duration_since(self.last).as_secs_f64();
                let alpha = 1.0 - (-dt / self.tau_secs).exp();
                self.value = Some(alpha * x + (1.0 - alpha) * v);
            }
        }
        self.last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean() {
        let mut m = Mean::new();
        m.update(1.0);
        m.update(3.0);
        assert!((m.value() - 2.0).abs() < 1e-9);
        assert_eq!(m.nsamples(), 2);
    }

    #[test]
    fn test_ema_first_sample_snaps() {
        let mut e = Ema::new(0.1, 0.0);
        e.update(5.0);
        assert!((e.value() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_windowed_ema_converges() {
        let mut per = WindowedEma::new(10);

        for _ in 0..50 {
            per.update(1.0);
        }
        assert!(per.value() > 0.9);
        assert!(per.full());

        for _ in 0..100 {
            per.update(0.0);
        }
        assert!(per.value() < 0.1);
    }

    #[test]
    fn test_windowed_ema_clamps_window() {
        let per = WindowedEma::new(0);
        assert_eq!(per.window(), 1);
    }

    #[test]
    fn test_windowed_ema_resize_resets() {
        let mut per = WindowedEma::new(4);
        for _ in 0..8 {
            per.update(1.0);
        }
        per.resize(16, 0.0);
        assert_eq!(per.nsamples(), 0);
        assert_eq!(per.window(), 16);
        assert_eq!(per.value(), 0.0);
    }

    #[test]
    fn test_time_windowed_ema() {
        let mut evm = TimeWindowedEma::new(1.0);
        assert!(evm.value().is_none());

        let t0 = MonoTime::from_secs_f64(0.0);
        evm.update(t0, -20.0);
        assert_eq!(evm.value(), Some(-20.0));

        // After many time constants the estimate tracks the new level
        let t1 = MonoTime::from_secs_f64(10.0);
        evm.update(t1, -10.0);
        let v = evm.value().unwrap();
        assert!(v > -10.1 && v < -9.9);
    }
}
