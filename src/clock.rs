//! Monotonic and wall-clock time for the link core.
//!
//! All timestamps in the core are monotonic nanoseconds measured from a
//! process-wide epoch. A wall-time anchor can be attached once so monotonic
//! times can be reported in wall-clock terms for cross-node logs.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A point on the monotonic timeline, in nanoseconds since the process epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MonoTime {
    ns: u64,
}

impl MonoTime {
    /// Time zero on the monotonic timeline.
    pub const ZERO: MonoTime = MonoTime { ns: 0 };

    /// Construct from raw nanoseconds.
    pub const fn from_nanos(ns: u64) -> MonoTime {
        MonoTime { ns }
    }

    /// Construct from seconds.
    pub fn from_secs_f64(secs: f64) -> MonoTime {
        MonoTime { ns: (secs * 1e9) as u64 }
    }

    /// Raw nanoseconds since the process epoch.
    pub const fn as_nanos(self) -> u64 {
        self.ns
    }

    /// Seconds since the process epoch.
    pub fn as_secs_f64(self) -> f64 {
        self.ns as f64 / 1e9
    }

    /// `self - earlier`, saturating to zero.
    pub fn saturating_duration_since(self, earlier: MonoTime) -> Duration {
        Duration::from_nanos(self.ns.saturating_sub(earlier.ns))
    }

    /// Signed difference `self - other` in nanoseconds.
    pub fn delta(self, other: MonoTime) -> i64 {
        self.ns as i64 - other.ns as i64
    }

    /// Offset of this time within a repeating period.
    pub fn offset_in(self, period: Duration) -> Duration {
        Duration::from_nanos(self.ns % period.as_nanos() as u64)
    }

    /// True if `self` and `other` are within 1us of each other.
    pub fn approx_eq(self, other: MonoTime) -> bool {
        self.delta(other).unsigned_abs() < 1_000
    }
}

impl std::ops::Add<Duration> for MonoTime {
    type Output = MonoTime;

    fn add(self, d: Duration) -> MonoTime {
        MonoTime { ns: self.ns + d.as_nanos() as u64 }
    }
}

impl std::ops::Sub<Duration> for MonoTime {
    type Output = MonoTime;

    fn sub(self, d: Duration) -> MonoTime {
        MonoTime { ns: self.ns.saturating_sub(d.as_nanos() as u64) }
    }
}

/// The process-wide monotonic clock.
pub struct MonoClock;

static EPOCH: OnceLock<Instant> = OnceLock::new();

impl MonoClock {
    /// The current monotonic time.
    pub fn now() -> MonoTime {
        let epoch = *EPOCH.get_or_init(Instant::now);
        MonoTime { ns: epoch.elapsed().as_nanos() as u64 }
    }
}

/// A wall-clock anchor pairing a monotonic instant with UNIX time.
///
/// Installed once at startup; converts core timestamps for human-facing
/// output without perturbing any deadline math.
#[derive(Debug, Clone, Copy)]
pub struct WallAnchor {
    mono: MonoTime,
    wall_ns: u64,
}

impl WallAnchor {
    /// Anchor the current monotonic time to the current wall clock.
    pub fn now() -> WallAnchor {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);

        WallAnchor {
            mono: MonoClock::now(),
            wall_ns: wall.as_nanos() as u64,
        }
    }

    /// Convert a monotonic time to UNIX seconds.
    pub fn to_wall_secs(&self, t: MonoTime) -> f64 {
        let delta = t.delta(self.mono);
        (self.wall_ns as i64 + delta) as f64 / 1e9
    }
}

/// Slot timing for a repeating TDMA frame.
#[derive(Debug, Clone, Copy)]
pub struct SlotTiming {
    /// Length of one slot.
    pub slot_size: Duration,
    /// Dead zone at the end of each slot.
    pub guard_size: Duration,
    /// Slots per frame.
    pub nslots: usize,
}

impl SlotTiming {
    /// Length of one full frame.
    pub fn frame_size(&self) -> Duration {
        self.slot_size * self.nslots as u32
    }

    /// Index of the slot containing `t`.
    pub fn slot_index(&self, t: MonoTime) -> usize {
        let off = t.offset_in(self.frame_size());
        (off.as_nanos() / self.slot_size.as_nanos()) as usize
    }

    /// Offset of `t` into its slot.
    pub fn slot_offset(&self, t: MonoTime) -> Duration {
        t.offset_in(self.slot_size)
    }

    /// The first slot boundary strictly after `t`.
    pub fn next_boundary(&self, t: MonoTime) -> MonoTime {
        t + (self.slot_size - self.slot_offset(t))
    }
}

/// Sleep for `dt`, coarsely.
///
/// The worker loops use this to align with slot boundaries; the residual
/// error of the OS sleep is absorbed by the transport lead times.
pub fn doze(dt: Duration) {
    if !dt.is_zero() {
        std::thread::sleep(dt);
    }
}
