//! The qdisc wrapper: flags, counters and serialized access to a discipline's operations.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use pktsched_common::Packet;

use crate::{
    builtin::{Noop, Noqueue, PfifoFast},
    Dropped, Handle, QdiscConfig, QdiscError, QdiscKind, QdiscOps,
};

/// Qdisc flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QdiscFlags(u32);

impl QdiscFlags {
    /// Statically provided; never destroyed.
    pub const BUILTIN: Self = Self(1);
    /// Held back by a rate limit.
    pub const THROTTLED: Self = Self(1 << 1);
    /// Attached to the receive side of a device.
    pub const INGRESS: Self = Self(1 << 2);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Snapshot of a qdisc's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QdiscCounters {
    pub bytes: u64,
    pub packets: u64,
    pub drops: u64,
    pub overlimits: u64,
    pub requeues: u64,
    pub qlen: usize,
}

#[derive(Debug, Default)]
struct QdiscStats {
    bytes: AtomicU64,
    packets: AtomicU64,
    drops: AtomicU64,
    overlimits: AtomicU64,
    requeues: AtomicU64,
}

impl QdiscStats {
    #[inline]
    fn increment_enqueued(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn increment_drops(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn increment_requeues(&self) {
        self.requeues.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn increment_overlimits(&self) {
        self.overlimits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Full description of a qdisc, as reported to the configuration plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QdiscDump {
    pub kind: &'static str,
    pub handle: Handle,
    pub parent: Handle,
    pub flags: QdiscFlags,
    pub counters: QdiscCounters,
    pub options: Option<QdiscConfig>,
}

/// A queueing discipline instance.
///
/// Shared by `Arc` between its device and any in-flight dequeue; the discipline is reset and
/// destroyed when the last reference goes away.
#[derive(Debug)]
pub struct Qdisc {
    kind: &'static str,
    handle: Handle,
    parent: Handle,
    flags: AtomicU32,
    queueless: bool,
    stats: QdiscStats,
    ops: Mutex<Box<dyn QdiscOps>>,
}

impl Qdisc {
    /// Wraps `ops` and runs its `init` with `config`.
    pub fn new(
        ops: Box<dyn QdiscOps>,
        handle: Handle,
        parent: Handle,
        config: Option<&QdiscConfig>,
    ) -> Result<Arc<Self>, QdiscError> {
        let mut ops = ops;
        ops.init(config)?;
        Ok(Arc::new(Self::from_ops(ops, handle, parent, QdiscFlags::empty())))
    }

    /// Creates a qdisc of a built-in kind. `limit` is the per-band packet limit of queueing kinds.
    pub fn create(
        kind: QdiscKind,
        limit: usize,
        handle: Handle,
        parent: Handle,
        config: Option<&QdiscConfig>,
    ) -> Result<Arc<Self>, QdiscError> {
        match kind {
            QdiscKind::Noop | QdiscKind::Noqueue if config.is_some() => {
                Err(QdiscError::InvalidConfig(kind.id()))
            }
            QdiscKind::Noop => Ok(Self::noop()),
            QdiscKind::Noqueue => Ok(Self::noqueue()),
            QdiscKind::PfifoFast => {
                Self::new(Box::new(PfifoFast::new(limit)), handle, parent, config)
            }
        }
    }

    /// The qdisc a device gets assigned when it is activated without one: `pfifo_fast` if the
    /// device has a transmit queue, `noqueue` otherwise.
    pub fn create_default(tx_queue_len: usize) -> Arc<Self> {
        if tx_queue_len == 0 {
            return Self::noqueue();
        }
        Arc::new(Self::from_ops(
            Box::new(PfifoFast::new(tx_queue_len)),
            Handle::UNSPEC,
            Handle::ROOT,
            QdiscFlags::empty(),
        ))
    }

    pub fn noop() -> Arc<Self> {
        Arc::new(Self::from_ops(Box::new(Noop), Handle::UNSPEC, Handle::ROOT, QdiscFlags::BUILTIN))
    }

    pub fn noqueue() -> Arc<Self> {
        let ops = Box::new(Noqueue);
        Arc::new(Self::from_ops(ops, Handle::UNSPEC, Handle::ROOT, QdiscFlags::BUILTIN))
    }

    fn from_ops(ops: Box<dyn QdiscOps>, handle: Handle, parent: Handle, flags: QdiscFlags) -> Self {
        Self {
            kind: ops.id(),
            handle,
            parent,
            flags: AtomicU32::new(flags.bits()),
            queueless: ops.is_queueless(),
            stats: QdiscStats::default(),
            ops: Mutex::new(ops),
        }
    }

    #[inline]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn parent(&self) -> Handle {
        self.parent
    }

    pub fn flags(&self) -> QdiscFlags {
        QdiscFlags(self.flags.load(Ordering::Acquire))
    }

    /// Sets or clears `flag`. Returns whether it was set before.
    pub(crate) fn set_flag(&self, flag: QdiscFlags, on: bool) -> bool {
        let old = if on {
            self.flags.fetch_or(flag.bits(), Ordering::AcqRel)
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::AcqRel)
        };
        QdiscFlags(old).contains(flag)
    }

    /// Marks the qdisc as held back by a rate limit. Every transition into the throttled state
    /// counts one overlimit.
    pub fn set_throttled(&self, throttled: bool) {
        let was = self.set_flag(QdiscFlags::THROTTLED, throttled);
        if throttled && !was {
            self.stats.increment_overlimits();
        }
    }

    #[inline]
    pub fn is_builtin(&self) -> bool {
        self.flags().contains(QdiscFlags::BUILTIN)
    }

    #[inline]
    pub fn is_noop(&self) -> bool {
        self.kind == QdiscKind::Noop.id()
    }

    /// Whether packets bypass queueing and go straight to the driver.
    #[inline]
    pub fn is_queueless(&self) -> bool {
        self.queueless
    }

    pub fn enqueue(&self, packet: Packet) -> Result<(), Dropped> {
        let len = packet.len();
        match self.ops.lock().enqueue(packet) {
            Ok(()) => {
                self.stats.increment_enqueued(len);
                Ok(())
            }
            Err(dropped) => {
                self.stats.increment_drops();
                Err(dropped)
            }
        }
    }

    pub fn dequeue(&self) -> Option<Packet> {
        self.ops.lock().dequeue()
    }

    pub fn requeue(&self, packet: Packet) -> Result<(), Dropped> {
        match self.ops.lock().requeue(packet) {
            Ok(()) => {
                self.stats.increment_requeues();
                Ok(())
            }
            Err(dropped) => {
                self.stats.increment_drops();
                Err(dropped)
            }
        }
    }

    pub fn reset(&self) {
        self.ops.lock().reset();
    }

    pub fn change(&self, config: &QdiscConfig) -> Result<(), QdiscError> {
        self.ops.lock().change(config)
    }

    pub fn qlen(&self) -> usize {
        self.ops.lock().qlen()
    }

    pub fn counters(&self) -> QdiscCounters {
        QdiscCounters {
            bytes: self.stats.bytes.load(Ordering::Relaxed),
            packets: self.stats.packets.load(Ordering::Relaxed),
            drops: self.stats.drops.load(Ordering::Relaxed),
            overlimits: self.stats.overlimits.load(Ordering::Relaxed),
            requeues: self.stats.requeues.load(Ordering::Relaxed),
            qlen: self.qlen(),
        }
    }

    pub fn dump(&self) -> QdiscDump {
        let options = self.ops.lock().dump();
        QdiscDump {
            kind: self.kind,
            handle: self.handle,
            parent: self.parent,
            flags: self.flags(),
            counters: self.counters(),
            options,
        }
    }
}

impl Drop for Qdisc {
    fn drop(&mut self) {
        if self.is_builtin() {
            return;
        }

        let ops = self.ops.get_mut();
        ops.reset();
        ops.destroy();
        tracing::debug!(kind = self.kind, handle = %self.handle, "destroyed qdisc");
    }
}
