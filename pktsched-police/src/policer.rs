//! Dual-rate token-bucket policer.
//!
//! Tokens are scheduler ticks. The committed bucket fills at one token per tick up to `burst`,
//! and a packet costs the ticks its length takes at the committed rate. The optional peak bucket
//! fills the same way up to the cost of one MTU at the peak rate. A packet is admitted only if
//! both buckets stay non-negative after paying for it.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use parking_lot::Mutex;
use pktsched_common::{time::tdiff_safe, Clock, PschedTime};
use tokio::task::JoinHandle;

use crate::{
    estimator::{EstimatorOptions, RateEstimator},
    rate::{RateSpec, RateTable},
};

/// Verdicts a policer hands back to its caller (`TC_POLICE_*`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PoliceAction {
    /// No verdict, let the caller's default apply.
    Unspec,
    /// Accept the packet.
    #[default]
    Ok,
    /// Send the packet back to classification.
    Reclassify,
    /// Drop the packet.
    Shot,
    /// Pass the packet on to the next policy in the chain.
    Pipe,
}

impl PoliceAction {
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Unspec => -1,
            Self::Ok => 0,
            Self::Reclassify => 1,
            Self::Shot => 2,
            Self::Pipe => 3,
        }
    }

    pub const fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            -1 => Self::Unspec,
            0 => Self::Ok,
            1 => Self::Reclassify,
            2 => Self::Shot,
            3 => Self::Pipe,
            _ => return None,
        })
    }
}

/// Outcome of metering one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The packet conforms; carries the configured result.
    Accept(PoliceAction),
    /// The packet is over the limit; carries the configured exceed action.
    Exceed(PoliceAction),
}

impl Decision {
    #[inline]
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }

    #[inline]
    pub fn is_exceed(&self) -> bool {
        matches!(self, Self::Exceed(_))
    }

    /// The action the caller should carry out.
    #[inline]
    pub fn action(&self) -> PoliceAction {
        match self {
            Self::Accept(action) | Self::Exceed(action) => *action,
        }
    }
}

/// Creation parameters accepted from the configuration plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicerConfig {
    /// Stable identifier. 0 asks the registry to allocate one.
    pub index: u32,
    /// Committed rate. `None` disables metering: every packet within `mtu` is accepted.
    pub rate: Option<RateSpec>,
    /// Optional peak rate.
    pub peak_rate: Option<RateSpec>,
    /// Committed bucket size in bytes at the committed rate.
    pub burst: u32,
    /// Largest packet that can conform. 0 means "as large as the committed table allows".
    pub mtu: u32,
    /// Verdict for packets over the limit.
    pub action: PoliceAction,
    /// Verdict for conforming packets.
    pub result: PoliceAction,
    /// Average rate ceiling in bytes/sec, checked against the estimator. 0 disables it.
    pub ewma_rate: u32,
    /// Average rate estimator. Required for `ewma_rate` to have an effect.
    pub estimator: Option<EstimatorOptions>,
}

impl Default for PolicerConfig {
    fn default() -> Self {
        Self {
            index: 0,
            rate: None,
            peak_rate: None,
            burst: 0,
            mtu: 0,
            action: PoliceAction::Reclassify,
            result: PoliceAction::Ok,
            ewma_rate: 0,
            estimator: None,
        }
    }
}

impl PolicerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    pub fn rate(mut self, rate: RateSpec) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn peak_rate(mut self, peak_rate: RateSpec) -> Self {
        self.peak_rate = Some(peak_rate);
        self
    }

    pub fn burst(mut self, burst_bytes: u32) -> Self {
        self.burst = burst_bytes;
        self
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn action(mut self, action: PoliceAction) -> Self {
        self.action = action;
        self
    }

    pub fn result(mut self, result: PoliceAction) -> Self {
        self.result = result;
        self
    }

    pub fn ewma_rate(mut self, ewma_rate: u32) -> Self {
        self.ewma_rate = ewma_rate;
        self
    }

    pub fn estimator(mut self, estimator: EstimatorOptions) -> Self {
        self.estimator = Some(estimator);
        self
    }
}

/// Counters kept per policer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicerStats {
    /// Bytes seen, conforming or not.
    pub bytes: u64,
    /// Packets seen, conforming or not.
    pub packets: u64,
    /// Packets that exceeded.
    pub overlimits: u64,
    /// Estimated average byte rate.
    pub bps: u64,
    /// Estimated average packet rate.
    pub pps: u64,
}

/// Validated, immutable parameters of a policer.
#[derive(Debug, Clone)]
pub(crate) struct PolicerParams {
    pub(crate) rate: Option<Arc<RateTable>>,
    pub(crate) peak: Option<Arc<RateTable>>,
    /// Committed bucket size, in ticks.
    pub(crate) burst: u64,
    pub(crate) mtu: u64,
    pub(crate) action: PoliceAction,
    pub(crate) result: PoliceAction,
    pub(crate) ewma_rate: u32,
    pub(crate) estimator: Option<EstimatorOptions>,
}

impl PolicerParams {
    /// Capacity of the peak bucket: the cost of one MTU at the peak rate.
    #[inline]
    fn peak_capacity(&self) -> i64 {
        self.peak.as_ref().map_or(0, |peak| peak.lookup(self.mtu) as i64)
    }
}

#[derive(Debug)]
struct PolicerState {
    params: PolicerParams,
    toks: i64,
    ptoks: i64,
    /// Time of the last committed update.
    t_c: PschedTime,
    stats: PolicerStats,
    estimator: Option<RateEstimator>,
}

impl PolicerState {
    fn new(params: PolicerParams, now: PschedTime) -> Self {
        let estimator = params.estimator.map(|options| RateEstimator::new(options, 0, 0));
        Self {
            toks: params.burst as i64,
            ptoks: params.peak_capacity(),
            t_c: now,
            stats: PolicerStats::default(),
            estimator,
            params,
        }
    }
}

/// Snapshot of a policer's configuration and counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicerDump {
    pub index: u32,
    pub action: PoliceAction,
    pub result: PoliceAction,
    pub mtu: u64,
    /// Committed bucket size, in ticks.
    pub burst: u64,
    pub rate: Option<RateSpec>,
    pub peak_rate: Option<RateSpec>,
    pub ewma_rate: u32,
    pub refcnt: u32,
    pub bindcnt: u32,
    pub toks: i64,
    pub ptoks: i64,
    pub stats: PolicerStats,
}

/// A single token-bucket meter.
///
/// All metering on one instance is serialized by its own lock; instances never contend with
/// each other.
#[derive(Debug)]
pub struct Policer {
    index: u32,
    clock: Arc<dyn Clock>,
    state: Mutex<PolicerState>,
    refcnt: AtomicU32,
    bindcnt: AtomicU32,
    estimator_task: Mutex<Option<JoinHandle<()>>>,
}

impl Policer {
    pub(crate) fn new(index: u32, params: PolicerParams, clock: Arc<dyn Clock>) -> Self {
        let state = PolicerState::new(params, clock.now());
        Self {
            index,
            clock,
            state: Mutex::new(state),
            refcnt: AtomicU32::new(1),
            bindcnt: AtomicU32::new(0),
            estimator_task: Mutex::new(None),
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Meters one packet of `len` bytes.
    pub fn classify(&self, len: usize) -> Decision {
        let len = len as u64;
        let mut guard = self.state.lock();
        let st = &mut *guard;

        st.stats.bytes += len;
        st.stats.packets += 1;

        let params = &st.params;

        // The average-rate ceiling is a pre-filter. It can only turn a packet away, and it does so
        // without touching the buckets.
        if params.ewma_rate != 0 && st.stats.bps >= params.ewma_rate as u64 {
            st.stats.overlimits += 1;
            return Decision::Exceed(params.action);
        }

        if len <= params.mtu {
            let Some(ref rate) = params.rate else {
                return Decision::Accept(params.result);
            };

            let now = self.clock.now();
            let elapsed = tdiff_safe(now, st.t_c, params.burst) as i64;

            let mut ptoks = 0;
            if let Some(ref peak) = params.peak {
                ptoks = (elapsed + st.ptoks).min(params.peak_capacity()) - peak.lookup(len) as i64;
            }

            let toks = (elapsed + st.toks).min(params.burst as i64) - rate.lookup(len) as i64;

            if toks >= 0 && ptoks >= 0 {
                st.t_c = now;
                st.toks = toks;
                st.ptoks = ptoks;
                return Decision::Accept(params.result);
            }
        }

        st.stats.overlimits += 1;
        Decision::Exceed(params.action)
    }

    /// Folds the counters into the average-rate estimate, if an estimator is configured.
    pub fn sample_rate(&self) {
        let mut st = self.state.lock();
        let (bytes, packets) = (st.stats.bytes, st.stats.packets);
        if let Some((bps, pps)) = st.estimator.as_mut().map(|est| est.sample(bytes, packets)) {
            st.stats.bps = bps;
            st.stats.pps = pps;
        }
    }

    pub fn stats(&self) -> PolicerStats {
        self.state.lock().stats
    }

    /// Current committed and peak token counts.
    pub fn tokens(&self) -> (i64, i64) {
        let st = self.state.lock();
        (st.toks, st.ptoks)
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    pub fn bindcnt(&self) -> u32 {
        self.bindcnt.load(Ordering::Acquire)
    }

    pub fn dump(&self) -> PolicerDump {
        let st = self.state.lock();
        PolicerDump {
            index: self.index,
            action: st.params.action,
            result: st.params.result,
            mtu: st.params.mtu,
            burst: st.params.burst,
            rate: st.params.rate.as_ref().map(|table| *table.spec()),
            peak_rate: st.params.peak.as_ref().map(|table| *table.spec()),
            ewma_rate: st.params.ewma_rate,
            refcnt: self.refcnt(),
            bindcnt: self.bindcnt(),
            toks: st.toks,
            ptoks: st.ptoks,
            stats: st.stats,
        }
    }

    /// Swaps in new parameters and refills both buckets. Counters are kept.
    pub(crate) fn set_params(&self, params: PolicerParams) {
        let now = self.clock.now();
        let mut st = self.state.lock();

        let stats = st.stats;
        let estimator = match (st.estimator.take(), params.estimator) {
            (Some(est), Some(options)) if *est.options() == options => Some(est),
            (_, options) => {
                options.map(|options| RateEstimator::new(options, stats.bytes, stats.packets))
            }
        };

        *st = PolicerState::new(params, now);
        st.stats = stats;
        st.estimator = estimator;
    }

    pub(crate) fn estimator_options(&self) -> Option<EstimatorOptions> {
        self.state.lock().params.estimator
    }

    pub(crate) fn set_estimator_task(&self, task: JoinHandle<()>) {
        if let Some(old) = self.estimator_task.lock().replace(task) {
            old.abort();
        }
    }

    /// Takes a reference (and a binding if `bind`).
    pub(crate) fn hold(&self, bind: bool) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
        if bind {
            self.bindcnt.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Adds a binding to the creation reference.
    pub(crate) fn bind(&self) {
        self.bindcnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a reference (and a binding if `bind`). Returns `true` once both counts are zero.
    pub(crate) fn put(&self, bind: bool) -> bool {
        let dec = |n: u32| n.checked_sub(1);
        if bind {
            let _ = self.bindcnt.fetch_update(Ordering::AcqRel, Ordering::Acquire, dec);
        }
        let _ = self.refcnt.fetch_update(Ordering::AcqRel, Ordering::Acquire, dec);
        self.refcnt() == 0 && self.bindcnt() == 0
    }
}

impl Drop for Policer {
    fn drop(&mut self) {
        if let Some(task) = self.estimator_task.get_mut().take() {
            task.abort();
        }
    }
}
