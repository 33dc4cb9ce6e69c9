//! Index → policer table.
//!
//! Lookups take the read side of the table lock; create, replace and release take the write
//! side. Metering never touches the table.

use std::sync::Arc;

use parking_lot::RwLock;
use pktsched_common::{Clock, TickBase};

use crate::{
    estimator::spawn_estimator,
    policer::{Policer, PolicerConfig, PolicerDump, PolicerParams},
    rate::RateTableCache,
    PoliceError,
};

/// Number of hash buckets. The bucket of a policer is `index & POLICER_HASH_MASK`.
pub const POLICER_HASH_BUCKETS: usize = 16;
const POLICER_HASH_MASK: u32 = POLICER_HASH_BUCKETS as u32 - 1;

#[inline]
const fn bucket(index: u32) -> usize {
    (index & POLICER_HASH_MASK) as usize
}

#[derive(Debug, Default)]
struct Table {
    buckets: [Vec<Arc<Policer>>; POLICER_HASH_BUCKETS],
    /// Last generated index.
    idx_gen: u32,
    len: usize,
}

impl Table {
    fn get(&self, index: u32) -> Option<&Arc<Policer>> {
        self.buckets[bucket(index)].iter().find(|p| p.index() == index)
    }

    fn insert(&mut self, policer: Arc<Policer>) -> Result<(), PoliceError> {
        if self.get(policer.index()).is_some() {
            return Err(PoliceError::Exists(policer.index()));
        }
        self.buckets[bucket(policer.index())].push(policer);
        self.len += 1;
        Ok(())
    }

    fn remove(&mut self, index: u32) -> Option<Arc<Policer>> {
        let chain = &mut self.buckets[bucket(index)];
        let pos = chain.iter().position(|p| p.index() == index)?;
        self.len -= 1;
        Some(chain.swap_remove(pos))
    }

    fn new_index(&mut self) -> Result<u32, PoliceError> {
        if self.len >= u32::MAX as usize {
            return Err(PoliceError::IndexExhausted);
        }
        loop {
            self.idx_gen = self.idx_gen.wrapping_add(1);
            if self.idx_gen == 0 {
                self.idx_gen = 1;
            }
            if self.get(self.idx_gen).is_none() {
                return Ok(self.idx_gen);
            }
        }
    }
}

/// Registry of policers, shared by everything that references them by index.
#[derive(Debug)]
pub struct PolicerRegistry {
    table: RwLock<Table>,
    rtabs: RateTableCache,
    clock: Arc<dyn Clock>,
}

impl PolicerRegistry {
    /// Creates an empty registry with the default tick base.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_tick_base(clock, TickBase::default())
    }

    /// Creates an empty registry whose rate tables use `base`. It must match the clock's.
    pub fn with_tick_base(clock: Arc<dyn Clock>, base: TickBase) -> Self {
        Self { table: RwLock::new(Table::default()), rtabs: RateTableCache::new(base), clock }
    }

    /// The rate tables currently referenced by this registry's policers.
    pub fn rate_tables(&self) -> &RateTableCache {
        &self.rtabs
    }

    pub fn lookup(&self, index: u32) -> Option<Arc<Policer>> {
        self.table.read().get(index).cloned()
    }

    /// Links an already built policer into the table, rejecting a duplicate index.
    pub fn insert(&self, policer: Arc<Policer>) -> Result<(), PoliceError> {
        self.table.write().insert(policer)
    }

    /// Unlinks a policer regardless of its reference counts.
    pub fn remove(&self, index: u32) -> Option<Arc<Policer>> {
        self.table.write().remove(index)
    }

    /// Allocates an index no live policer uses.
    pub fn new_index(&self) -> Result<u32, PoliceError> {
        self.table.write().new_index()
    }

    pub fn len(&self) -> usize {
        self.table.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices of all registered policers, in no particular order.
    pub fn indices(&self) -> Vec<u32> {
        let table = self.table.read();
        table.buckets.iter().flatten().map(|p| p.index()).collect()
    }

    /// Creates and registers a new policer. A non-zero `config.index` that is already taken is an
    /// error.
    ///
    /// Nothing is registered if any part of the configuration is rejected.
    pub fn create(&self, config: &PolicerConfig) -> Result<Arc<Policer>, PoliceError> {
        let params = self.build_params(config)?;

        let policer = {
            let mut table = self.table.write();
            let index = match config.index {
                0 => table.new_index()?,
                index => index,
            };
            if table.get(index).is_some() {
                return Err(PoliceError::Exists(index));
            }

            let policer = Arc::new(Policer::new(index, params, Arc::clone(&self.clock)));
            table.insert(Arc::clone(&policer))?;
            policer
        };

        self.start_estimator(&policer);
        tracing::debug!(index = policer.index(), "created policer");

        Ok(policer)
    }

    /// Returns the policer `config.index` refers to, taking a reference on it, or creates it.
    ///
    /// A `bind` reference is held by a classifier that actively feeds packets to the policer.
    pub fn locate(&self, config: &PolicerConfig, bind: bool) -> Result<Arc<Policer>, PoliceError> {
        if config.index != 0 {
            let table = self.table.write();
            if let Some(policer) = table.get(config.index) {
                policer.hold(bind);
                return Ok(Arc::clone(policer));
            }
        }

        let policer = self.create(config)?;
        if bind {
            policer.bind();
        }
        Ok(policer)
    }

    /// Re-parameterizes an existing policer in place. Its counters are kept, its buckets refilled.
    pub fn replace(&self, config: &PolicerConfig) -> Result<Arc<Policer>, PoliceError> {
        let params = self.build_params(config)?;

        let policer = self.lookup(config.index).ok_or(PoliceError::NotFound(config.index))?;
        policer.set_params(params);
        self.start_estimator(&policer);
        tracing::debug!(index = policer.index(), "replaced policer parameters");

        Ok(policer)
    }

    /// Drops a reference (and a binding if `bind`). The policer is unlinked once neither is left.
    ///
    /// Returns `true` if the policer was unlinked.
    pub fn release(&self, policer: &Policer, bind: bool) -> bool {
        let mut table = self.table.write();
        if !policer.put(bind) {
            return false;
        }

        let removed = table.remove(policer.index()).is_some();
        if removed {
            tracing::debug!(index = policer.index(), "destroyed policer");
        }
        removed
    }

    pub fn dump(&self, index: u32) -> Option<PolicerDump> {
        self.lookup(index).map(|policer| policer.dump())
    }

    /// Validates a configuration and builds its rate tables. Any table built before a later
    /// check fails is released on return.
    fn build_params(&self, config: &PolicerConfig) -> Result<PolicerParams, PoliceError> {
        if config.peak_rate.is_some() && config.rate.is_none() {
            return Err(PoliceError::PeakWithoutRate);
        }
        if let Some(ref estimator) = config.estimator {
            estimator.validate()?;
        }

        let rate = config.rate.map(|spec| self.rtabs.get(spec)).transpose()?;
        let peak = config.peak_rate.map(|spec| self.rtabs.get(spec)).transpose()?;

        let mtu = match (config.mtu, &rate) {
            (0, Some(table)) => 255u64 << table.cell_log(),
            (0, None) => u64::MAX,
            (mtu, _) => mtu as u64,
        };

        if peak.is_some() && mtu == u64::MAX {
            return Err(PoliceError::PeakWithoutMtu);
        }

        for table in rate.iter().chain(peak.iter()) {
            let max = table.spec().max_len();
            if mtu > max {
                return Err(PoliceError::MtuTooLarge { mtu, max });
            }
        }

        let burst = match rate {
            Some(ref table) => table.xmit_ticks(config.burst as u64),
            None => config.burst as u64,
        };

        Ok(PolicerParams {
            rate,
            peak,
            burst,
            mtu,
            action: config.action,
            result: config.result,
            ewma_rate: config.ewma_rate,
            estimator: config.estimator,
        })
    }

    fn start_estimator(&self, policer: &Arc<Policer>) {
        let Some(options) = policer.estimator_options() else {
            return;
        };

        if tokio::runtime::Handle::try_current().is_err() {
            let index = policer.index();
            tracing::debug!(index, "no runtime, rate estimator is sampled manually");
            return;
        }

        policer.set_estimator_task(spawn_estimator(Arc::downgrade(policer), options.interval));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{EstimatorOptions, PoliceAction, RateSpec};
    use pktsched_common::ManualClock;

    fn registry() -> (Arc<ManualClock>, PolicerRegistry) {
        let clock = Arc::new(ManualClock::new(0));
        let registry = PolicerRegistry::new(Arc::clone(&clock) as Arc<dyn Clock>);
        (clock, registry)
    }

    fn config() -> PolicerConfig {
        PolicerConfig::new()
            .rate(RateSpec::for_mtu(125_000, 1_500))
            .burst(3_000)
            .mtu(1_500)
            .action(PoliceAction::Shot)
    }

    #[test]
    fn create_and_lookup() {
        let (_, registry) = registry();

        let a = registry.create(&config()).unwrap();
        let b = registry.create(&config()).unwrap();
        assert_ne!(a.index(), b.index());
        assert_eq!(registry.len(), 2);

        assert!(Arc::ptr_eq(&registry.lookup(a.index()).unwrap(), &a));
        assert!(registry.lookup(999).is_none());

        // Both policers share one rate table.
        assert_eq!(registry.rate_tables().len(), 1);
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let (_, registry) = registry();

        registry.create(&config().index(7)).unwrap();
        assert!(matches!(registry.create(&config().index(7)), Err(PoliceError::Exists(7))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn indices_share_buckets() {
        let (_, registry) = registry();
        for index in [3, 19, 35] {
            registry.create(&config().index(index)).unwrap();
        }
        assert_eq!(registry.lookup(19).unwrap().index(), 19);

        let removed = registry.remove(19).unwrap();
        assert_eq!(removed.index(), 19);
        assert!(registry.lookup(19).is_none());
        assert!(registry.lookup(3).is_some() && registry.lookup(35).is_some());

        let mut indices = registry.indices();
        indices.sort_unstable();
        assert_eq!(indices, vec![3, 35]);
    }

    #[test]
    fn generated_indices_skip_taken_ones() {
        let (_, registry) = registry();
        registry.create(&config().index(1)).unwrap();
        registry.create(&config().index(2)).unwrap();

        assert_eq!(registry.create(&config()).unwrap().index(), 3);
    }

    #[test]
    fn failed_create_leaves_nothing_behind() {
        let (_, registry) = registry();

        let bad_peak = config().peak_rate(RateSpec::new(0, 3));
        assert!(matches!(registry.create(&bad_peak), Err(PoliceError::RateTable(_))));

        let too_big = config().mtu(4_000);
        assert!(matches!(registry.create(&too_big), Err(PoliceError::MtuTooLarge { .. })));

        let orphan_peak = PolicerConfig::new().peak_rate(RateSpec::for_mtu(1_000, 1_500));
        assert!(matches!(registry.create(&orphan_peak), Err(PoliceError::PeakWithoutRate)));

        let zero_interval = EstimatorOptions::default().interval(Duration::ZERO);
        let zero_interval = config().estimator(zero_interval);
        assert!(matches!(registry.create(&zero_interval), Err(PoliceError::InvalidEstimator(_))));

        let wide_shift = config().estimator(EstimatorOptions::default().ewma_log(64));
        assert!(matches!(registry.create(&wide_shift), Err(PoliceError::InvalidEstimator(_))));

        assert!(registry.is_empty());
        assert!(registry.rate_tables().is_empty());
    }

    #[test]
    fn locate_reuses_and_release_frees() {
        let (_, registry) = registry();

        let first = registry.locate(&config().index(5), true).unwrap();
        assert_eq!((first.refcnt(), first.bindcnt()), (1, 1));

        let second = registry.locate(&config().index(5), false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!((first.refcnt(), first.bindcnt()), (2, 1));

        assert!(!registry.release(&second, false));
        assert!(registry.lookup(5).is_some());

        assert!(registry.release(&first, true));
        assert!(registry.lookup(5).is_none());

        drop((first, second));
        assert!(registry.rate_tables().is_empty());
    }

    #[test]
    fn default_mtu_follows_cell_size() {
        let (_, registry) = registry();
        let policer = registry.create(&config().mtu(0)).unwrap();
        assert_eq!(policer.dump().mtu, 255 << 3);

        let unmetered = registry.create(&PolicerConfig::new()).unwrap();
        assert_eq!(unmetered.dump().mtu, u64::MAX);
        assert!(unmetered.classify(60_000).is_accept());
    }

    #[test]
    fn replace_refills_and_keeps_counters() {
        let (_, registry) = registry();
        let policer = registry.create(&config().index(9)).unwrap();

        assert!(policer.classify(1_500).is_accept());
        assert!(policer.classify(1_500).is_accept());
        assert!(policer.classify(1_500).is_exceed());

        registry.replace(&config().index(9).burst(6_000)).unwrap();
        assert!(policer.classify(1_500).is_accept());

        let dump = registry.dump(9).unwrap();
        assert_eq!(dump.burst, 48_000);
        assert_eq!(dump.stats.packets, 4);
        assert_eq!(dump.stats.overlimits, 1);

        assert!(matches!(registry.replace(&config().index(10)), Err(PoliceError::NotFound(10))));
    }

    #[tokio::test(start_paused = true)]
    async fn estimator_task_samples_on_interval() {
        let (_, registry) = registry();
        let options = EstimatorOptions::default().interval(Duration::from_millis(250)).ewma_log(0);
        let policer = registry.create(&config().estimator(options)).unwrap();

        assert!(policer.classify(1_000).is_accept());
        tokio::time::sleep(Duration::from_millis(260)).await;

        // 1000 bytes within a quarter second.
        assert_eq!(policer.stats().bps, 4_000);
    }
}
