#![doc(issue_tracker_base_url = "https://github.com/chainbound/pktsched/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Queueing disciplines and the per-device transmit path.
//!
//! A [`NetDevice`] owns an active qdisc behind its queue lock and serializes access to its
//! [`NetDriver`] with a separate transmit lock. [`NetDevice::queue_xmit`] enqueues and runs the
//! queue; when the driver is busy or another thread is transmitting, the packet is requeued and
//! the device is posted to the [`TxScheduler`] task for a later run.

use thiserror::Error;

pub mod builtin;
pub use builtin::{PfifoFast, PfifoFastConfig};

mod device;
pub use device::{
    DeviceCounters, DeviceOptions, NetDevice, NetDriver, QueueGuard, QueueState, TxBusy,
};

mod dispatch;
pub use dispatch::{Restart, XmitStatus};

pub mod handle;
pub use handle::Handle;

mod ops;
pub use ops::{Dropped, QdiscConfig, QdiscKind, QdiscOps};

mod qdisc;
pub use qdisc::{Qdisc, QdiscCounters, QdiscDump, QdiscFlags};

mod scheduler;
pub use scheduler::TxScheduler;

mod watchdog;

/// Errors from creating and configuring qdiscs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QdiscError {
    #[error("Unknown qdisc kind: {0}")]
    UnknownKind(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("{kind} does not support {op}")]
    NotSupported { kind: &'static str, op: &'static str },
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Qdisc {0} already exists")]
    Exists(Handle),
    #[error("No free qdisc handles")]
    HandleExhausted,
}
