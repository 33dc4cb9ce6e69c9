//! Rate tables.
//!
//! A rate table turns a packet length into the number of scheduler ticks the packet occupies on a
//! link of a given bandwidth. Lengths are quantized into 256 cells of `1 << cell_log` bytes each,
//! so the lookup is a shift and an index.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pktsched_common::TickBase;
use thiserror::Error;

/// Number of slots in a rate table.
pub const RATE_TABLE_SLOTS: usize = 256;

/// Largest accepted `cell_log`: `255 << cell_log` must fit in 32 bits.
pub const MAX_CELL_LOG: u8 = 24;

/// Why a [`RateSpec`] cannot be turned into a table.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RateTableError {
    #[error("rate must be non-zero")]
    ZeroRate,
    #[error("cell_log {0} is out of range (max {MAX_CELL_LOG})")]
    CellLog(u8),
}

/// Rate specification, mirroring the kernel's `tc_ratespec`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RateSpec {
    /// Rate in bytes per second.
    pub rate: u32,
    /// Log2 of the cell size.
    pub cell_log: u8,
    /// Minimum packet unit: no packet is charged less than this many bytes.
    pub mpu: u16,
    /// Link layer overhead added to every packet (bytes).
    pub overhead: u16,
}

impl RateSpec {
    pub fn new(rate_bytes_per_sec: u32, cell_log: u8) -> Self {
        Self { rate: rate_bytes_per_sec, cell_log, ..Default::default() }
    }

    /// Create a rate spec whose cells just cover `mtu` bytes.
    pub fn for_mtu(rate_bytes_per_sec: u32, mtu: u32) -> Self {
        Self::new(rate_bytes_per_sec, Self::compute_cell_log(mtu))
    }

    /// Smallest `cell_log` such that `mtu >> cell_log <= 255`.
    ///
    /// For Ethernet (MTU 1500), this returns 3 because `1500 >> 3 = 187 < 256`.
    pub fn compute_cell_log(mtu: u32) -> u8 {
        let mut cell_log = 0u8;
        while (mtu >> cell_log) > 255 {
            cell_log += 1;
        }
        cell_log
    }

    pub fn with_mpu(mut self, mpu: u16) -> Self {
        self.mpu = mpu;
        self
    }

    pub fn with_overhead(mut self, overhead: u16) -> Self {
        self.overhead = overhead;
        self
    }

    /// Size of one cell in bytes.
    #[inline]
    pub fn cell_size(&self) -> u64 {
        1u64 << self.cell_log
    }

    /// Largest packet length the table built from this spec can look up.
    #[inline]
    pub fn max_len(&self) -> u64 {
        ((RATE_TABLE_SLOTS as u64) << self.cell_log) - 1
    }

    pub fn validate(&self) -> Result<(), RateTableError> {
        if self.rate == 0 {
            return Err(RateTableError::ZeroRate);
        }
        if self.cell_log > MAX_CELL_LOG {
            return Err(RateTableError::CellLog(self.cell_log));
        }
        Ok(())
    }
}

/// Immutable length → ticks lookup table.
///
/// `data[i]` is the time to send the bytes at the lower edge of cell `i`:
/// `max((i << cell_log) + overhead, mpu)`. Every length inside a cell is charged the same, at
/// most one cell's worth of bytes less than its exact cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateTable {
    spec: RateSpec,
    base: TickBase,
    data: [u64; RATE_TABLE_SLOTS],
}

impl RateTable {
    /// Build a table for `rate_bytes_per_sec` with the default tick base.
    ///
    /// # Panics
    ///
    /// Panics if the rate is zero or `cell_log` exceeds [`MAX_CELL_LOG`].
    pub fn build(rate_bytes_per_sec: u32, cell_log: u8) -> Self {
        Self::with_spec(RateSpec::new(rate_bytes_per_sec, cell_log), TickBase::default())
    }

    /// Build a table for a full rate spec.
    ///
    /// # Panics
    ///
    /// Panics if the spec does not [`validate`](RateSpec::validate).
    pub fn with_spec(spec: RateSpec, base: TickBase) -> Self {
        if let Err(e) = spec.validate() {
            panic!("invalid rate spec {spec:?}: {e}");
        }

        let mut data = [0u64; RATE_TABLE_SLOTS];
        for (i, slot) in data.iter_mut().enumerate() {
            let size = ((i as u64) << spec.cell_log) + spec.overhead as u64;
            *slot = base.xmit_ticks(size.max(spec.mpu as u64), spec.rate);
        }

        Self { spec, base, data }
    }

    /// Validating constructor for the configuration plane.
    pub fn try_from_spec(spec: RateSpec, base: TickBase) -> Result<Self, RateTableError> {
        spec.validate()?;
        Ok(Self::with_spec(spec, base))
    }

    /// Ticks charged for a packet of `len` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len >> cell_log` is past the last slot; callers clamp lengths to the metered
    /// MTU first.
    #[inline]
    pub fn lookup(&self, len: u64) -> u64 {
        self.data[(len >> self.spec.cell_log) as usize]
    }

    /// Ticks needed to send `bytes` at this table's rate, for byte counts beyond the table
    /// (e.g. burst sizes).
    pub fn xmit_ticks(&self, bytes: u64) -> u64 {
        self.base.xmit_ticks(bytes, self.spec.rate)
    }

    #[inline]
    pub fn spec(&self) -> &RateSpec {
        &self.spec
    }

    #[inline]
    pub fn rate(&self) -> u32 {
        self.spec.rate
    }

    #[inline]
    pub fn cell_log(&self) -> u8 {
        self.spec.cell_log
    }

    #[inline]
    pub fn data(&self) -> &[u64; RATE_TABLE_SLOTS] {
        &self.data
    }
}

/// Interns rate tables so users of the same spec share one allocation.
///
/// Only weak references are kept: a table is freed as soon as its last user drops it.
#[derive(Debug, Default)]
pub struct RateTableCache {
    base: TickBase,
    tables: Mutex<Vec<Weak<RateTable>>>,
}

impl RateTableCache {
    pub fn new(base: TickBase) -> Self {
        Self { base, tables: Mutex::new(Vec::new()) }
    }

    /// Returns the shared table for `spec`, building it on first use.
    pub fn get(&self, spec: RateSpec) -> Result<Arc<RateTable>, RateTableError> {
        spec.validate()?;

        let mut tables = self.tables.lock();
        tables.retain(|table| table.strong_count() > 0);

        if let Some(table) =
            tables.iter().filter_map(Weak::upgrade).find(|table| table.spec == spec)
        {
            return Ok(table);
        }

        let table = Arc::new(RateTable::with_spec(spec, self.base));
        tables.push(Arc::downgrade(&table));
        tracing::trace!(?spec, "built rate table");

        Ok(table)
    }

    /// Number of tables currently alive.
    pub fn len(&self) -> usize {
        self.tables.lock().iter().filter(|table| table.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tick_base(&self) -> TickBase {
        self.base
    }
}
