#![doc(issue_tracker_base_url = "https://github.com/chainbound/pktsched/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Traffic policing: rate tables, token-bucket policers and the registry that names them.

use thiserror::Error;

mod estimator;
pub use estimator::{EstimatorOptions, RateEstimator};

mod policer;
pub use policer::{Decision, PoliceAction, Policer, PolicerConfig, PolicerDump, PolicerStats};

pub mod rate;
pub use rate::{RateSpec, RateTable, RateTableCache, RateTableError};

mod registry;
pub use registry::{PolicerRegistry, POLICER_HASH_BUCKETS};

/// Errors from creating, replacing or looking up policers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoliceError {
    #[error("Rate table error: {0}")]
    RateTable(#[from] RateTableError),
    #[error("Policer {0} already exists")]
    Exists(u32),
    #[error("Policer {0} not found")]
    NotFound(u32),
    #[error("Peak rate given without a committed rate")]
    PeakWithoutRate,
    #[error("Peak rate requires a bounded MTU")]
    PeakWithoutMtu,
    #[error("MTU {mtu} exceeds the largest length the rate table covers ({max})")]
    MtuTooLarge { mtu: u64, max: u64 },
    #[error("Policer index space exhausted")]
    IndexExhausted,
    #[error("Invalid rate estimator: {0}")]
    InvalidEstimator(&'static str),
}
