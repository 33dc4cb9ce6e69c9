//! Packet scheduler time base.
//!
//! Every meter and timer in the scheduler counts in its own time unit ("ticks"). A [`TickBase`]
//! fixes how many ticks make up a microsecond, and a [`Clock`] hands out the current time in
//! those ticks.

use std::{
    fmt,
    io::{self, Read as _},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Path to the kernel's packet scheduler timing information.
pub const PSCHED_PATH: &str = "/proc/net/psched";

/// A point in time on the packet scheduler clock, in ticks.
pub type PschedTime = u64;

/// Ratio between scheduler ticks and microseconds, stored as the `t2us / us2t` fraction the
/// kernel exposes so conversions stay in integer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickBase {
    t2us: u64,
    us2t: u64,
}

impl Default for TickBase {
    /// One tick per microsecond.
    fn default() -> Self {
        Self { t2us: 1, us2t: 1 }
    }
}

impl TickBase {
    /// Creates a time base of `t2us / us2t` ticks per microsecond.
    ///
    /// # Panics
    ///
    /// Panics if either term is zero.
    pub fn new(t2us: u64, us2t: u64) -> Self {
        assert!(t2us != 0 && us2t != 0, "tick base terms must be non-zero");
        Self { t2us, us2t }
    }

    /// Reads the time base from [`PSCHED_PATH`].
    ///
    /// The file format is `t2us us2t clock resolution`, four hex values. Only the first two are
    /// used.
    pub fn from_proc() -> io::Result<Self> {
        let mut file = std::fs::File::open(PSCHED_PATH)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let base = Self::parse(&contents)?;
        tracing::debug!(t2us = base.t2us, us2t = base.us2t, "read {PSCHED_PATH}");

        Ok(base)
    }

    /// Parses the contents of a `/proc/net/psched` style file.
    pub fn parse(contents: &str) -> io::Result<Self> {
        let mut iter = contents.split_whitespace();

        let mut next_hex = |name: &str| {
            let field = iter.next().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, format!("missing {name}"))
            })?;
            u64::from_str_radix(field, 16).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("{name} is not hex: {e}"))
            })
        };

        let t2us = next_hex("t2us")?;
        let us2t = next_hex("us2t")?;

        if t2us == 0 || us2t == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "zero tick ratio"));
        }

        Ok(Self { t2us, us2t })
    }

    /// Number of ticks within a microsecond.
    pub fn tick_in_usec(&self) -> f64 {
        self.t2us as f64 / self.us2t as f64
    }

    /// Convert microseconds to ticks, rounding down.
    pub fn usec_to_ticks(&self, usec: u64) -> u64 {
        (usec as u128 * self.t2us as u128 / self.us2t as u128) as u64
    }

    /// Convert a duration to ticks, rounding down.
    pub fn duration_to_ticks(&self, duration: Duration) -> u64 {
        (duration.as_nanos() * self.t2us as u128 / (1_000 * self.us2t as u128)) as u64
    }

    /// Convert ticks back to wall time.
    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        let nanos = ticks as u128 * 1_000 * self.us2t as u128 / self.t2us as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    /// Ticks needed to put `bytes` on a wire running at `rate` bytes per second, rounded up.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is zero.
    pub fn xmit_ticks(&self, bytes: u64, rate: u32) -> u64 {
        assert!(rate != 0, "transmission time at a zero rate");
        let num = bytes as u128 * 1_000_000 * self.t2us as u128;
        let den = rate as u128 * self.us2t as u128;
        num.div_ceil(den).min(u64::MAX as u128) as u64
    }
}

/// Difference `now - then`, bounded to `bound`. A clock that appears to have gone backwards
/// yields zero.
#[inline]
pub fn tdiff_safe(now: PschedTime, then: PschedTime, bound: u64) -> u64 {
    now.saturating_sub(then).min(bound)
}

/// A source of scheduler time.
pub trait Clock: fmt::Debug + Send + Sync + 'static {
    /// The current time, in ticks.
    fn now(&self) -> PschedTime;
}

/// Clock backed by [`std::time::Instant`].
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: std::time::Instant,
    base: TickBase,
}

impl MonotonicClock {
    pub fn new(base: TickBase) -> Self {
        Self { origin: std::time::Instant::now(), base }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new(TickBase::default())
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> PschedTime {
        self.base.duration_to_ticks(self.origin.elapsed())
    }
}

/// Clock backed by [`tokio::time::Instant`], so it follows a paused test runtime.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
    base: TickBase,
}

impl TokioClock {
    pub fn new(base: TickBase) -> Self {
        Self { origin: tokio::time::Instant::now(), base }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new(TickBase::default())
    }
}

impl Clock for TokioClock {
    fn now(&self) -> PschedTime {
        self.base.duration_to_ticks(self.origin.elapsed())
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub const fn new(start: PschedTime) -> Self {
        Self { now: AtomicU64::new(start) }
    }

    /// Jump to `now`. Moving backwards is allowed.
    pub fn set(&self, now: PschedTime) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `ticks`.
    pub fn advance(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> PschedTime {
        self.now.load(Ordering::SeqCst)
    }
}
