//! Exponentially weighted average rate estimator.

use std::{sync::Weak, time::Duration};

use tokio::task::JoinHandle;

use crate::{PoliceError, Policer};

/// Fractional bits kept in the byte-rate average.
const BPS_SHIFT: u32 = 5;
/// Fractional bits kept in the packet-rate average.
const PPS_SHIFT: u32 = 10;

/// Sampling period and smoothing weight of a [`RateEstimator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimatorOptions {
    /// How often the counters are sampled.
    pub interval: Duration,
    /// Weight of a new sample is `1 / 2^ewma_log`.
    pub ewma_log: u8,
}

impl Default for EstimatorOptions {
    fn default() -> Self {
        Self { interval: Duration::from_secs(1), ewma_log: 3 }
    }
}

impl EstimatorOptions {
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn ewma_log(mut self, ewma_log: u8) -> Self {
        self.ewma_log = ewma_log;
        self
    }

    /// Rejects a zero interval and weights too small to shift the average by.
    pub(crate) fn validate(&self) -> Result<(), PoliceError> {
        if self.interval.is_zero() {
            return Err(PoliceError::InvalidEstimator("zero sampling interval"));
        }
        if self.ewma_log >= i64::BITS as u8 {
            return Err(PoliceError::InvalidEstimator("ewma_log must be below 64"));
        }
        Ok(())
    }
}

/// Turns monotonically increasing byte/packet counters into smoothed rates.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    options: EstimatorOptions,
    last_bytes: u64,
    last_packets: u64,
    /// Average bytes/sec, fixed point with [`BPS_SHIFT`] fractional bits.
    avbps: i64,
    /// Average packets/sec, fixed point with [`PPS_SHIFT`] fractional bits.
    avpps: i64,
}

impl RateEstimator {
    /// Creates an estimator starting from the given counter values.
    pub fn new(options: EstimatorOptions, bytes: u64, packets: u64) -> Self {
        Self { options, last_bytes: bytes, last_packets: packets, avbps: 0, avpps: 0 }
    }

    /// Folds one sampling interval into the average and returns `(bps, pps)`.
    pub fn sample(&mut self, bytes: u64, packets: u64) -> (u64, u64) {
        let interval_ns = self.options.interval.as_nanos().max(1);

        let nbytes = bytes.wrapping_sub(self.last_bytes) as u128;
        let npackets = packets.wrapping_sub(self.last_packets) as u128;
        self.last_bytes = bytes;
        self.last_packets = packets;

        let rate = ((nbytes << BPS_SHIFT) * 1_000_000_000 / interval_ns) as i64;
        self.avbps += (rate - self.avbps) >> self.options.ewma_log;

        let rate = ((npackets << PPS_SHIFT) * 1_000_000_000 / interval_ns) as i64;
        self.avpps += (rate - self.avpps) >> self.options.ewma_log;

        (self.bps(), self.pps())
    }

    pub fn bps(&self) -> u64 {
        ((self.avbps + 0xF) >> BPS_SHIFT).max(0) as u64
    }

    pub fn pps(&self) -> u64 {
        ((self.avpps + 0x1FF) >> PPS_SHIFT).max(0) as u64
    }

    pub fn options(&self) -> &EstimatorOptions {
        &self.options
    }
}

/// Samples the policer's estimator every interval until the policer is freed.
pub(crate) fn spawn_estimator(policer: Weak<Policer>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(policer) = policer.upgrade() else {
                break;
            };
            policer.sample_rate();
        }
    })
}
