//! Per-device transmit state and lifecycle.

use std::{
    fmt,
    mem,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, MutexGuard, RwLock};
use pktsched_common::Packet;
use tokio::{task::JoinHandle, time::Instant};

use crate::{
    handle::AUTOHANDLE_FIRST_MAJOR, scheduler::TxScheduler, watchdog::spawn_watchdog, Handle,
    Qdisc, QdiscError, QdiscFlags,
};

/// The default transmit queue length.
const DEFAULT_TX_QUEUE_LEN: usize = 1000;
/// The default watchdog timeout.
const DEFAULT_WATCHDOG_TIMEO: Duration = Duration::from_secs(5);

/// The driver refused a packet. The packet is handed back to be requeued.
#[derive(Debug, PartialEq, Eq)]
pub struct TxBusy(pub Packet);

/// The device driver below the scheduler.
///
/// The driver never calls back into the scheduler synchronously, except through
/// [`NetDevice::wake_queue`] and [`NetDevice::queue_xmit`].
pub trait NetDriver: Send + Sync + 'static {
    /// Hands a packet to the hardware.
    fn start_xmit(&self, packet: Packet) -> Result<(), TxBusy>;

    /// Whether the driver asked for transmission to stop.
    fn queue_stopped(&self) -> bool;

    /// Recovery for a transmit queue that stayed stopped past the watchdog timeout.
    fn tx_timeout(&self) {}
}

/// Construction options for a [`NetDevice`].
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Interface name, for diagnostics.
    name: String,
    /// Packets each band of the default qdisc may hold. 0 means no queue.
    tx_queue_len: usize,
    /// How long the driver queue may stay stopped before [`NetDriver::tx_timeout`] runs.
    /// Zero disables the watchdog.
    watchdog_timeo: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            name: String::from("eth0"),
            tx_queue_len: DEFAULT_TX_QUEUE_LEN,
            watchdog_timeo: DEFAULT_WATCHDOG_TIMEO,
        }
    }
}

impl DeviceOptions {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn tx_queue_len(mut self, tx_queue_len: usize) -> Self {
        self.tx_queue_len = tx_queue_len;
        self
    }

    /// Sets the watchdog timeout. Zero disables the watchdog.
    pub fn watchdog_timeo(mut self, watchdog_timeo: Duration) -> Self {
        self.watchdog_timeo = watchdog_timeo;
        self
    }
}

/// Device state bits.
pub(crate) mod state {
    pub(crate) const PRESENT: u32 = 1;
    pub(crate) const UP: u32 = 1 << 1;
    pub(crate) const CARRIER: u32 = 1 << 2;
    /// Posted to the transmit scheduler and not yet serviced.
    pub(crate) const SCHEDULED: u32 = 1 << 3;
}

#[derive(Debug, Default)]
pub(crate) struct DeviceStats {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    tx_dropped: AtomicU64,
    collisions: AtomicU64,
    dead_loops: AtomicU64,
    tx_timeouts: AtomicU64,
}

impl DeviceStats {
    #[inline]
    pub(crate) fn increment_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_dropped(&self) {
        self.tx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_collisions(&self) {
        self.collisions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_dead_loops(&self) {
        self.dead_loops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_tx_timeouts(&self) {
        self.tx_timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of a device's transmit counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    /// Packets discarded on the transmit path outside of a qdisc.
    pub tx_dropped: u64,
    /// Times the transmit lock was found held by another thread.
    pub collisions: u64,
    /// Packets dropped because the driver re-entered its own transmit path.
    pub dead_loops: u64,
    pub tx_timeouts: u64,
}

/// The qdisc slots, protected by the queue lock.
#[derive(Debug)]
pub struct QueueState {
    /// The qdisc packets are enqueued on and dequeued from.
    pub(crate) qdisc: Arc<Qdisc>,
    /// The configured qdisc, installed as active on activation.
    pub(crate) sleeping: Arc<Qdisc>,
    pub(crate) ingress: Option<Arc<Qdisc>>,
}

impl QueueState {
    pub fn active(&self) -> &Arc<Qdisc> {
        &self.qdisc
    }

    pub fn sleeping(&self) -> &Arc<Qdisc> {
        &self.sleeping
    }

    pub fn ingress(&self) -> Option<&Arc<Qdisc>> {
        self.ingress.as_ref()
    }
}

/// The held queue lock.
pub type QueueGuard<'a> = MutexGuard<'a, QueueState>;

/// A network device as seen by the packet scheduler.
///
/// Lock order: the tree lock, then the queue lock, then a qdisc's own lock. The transmit lock
/// is never acquired while the queue lock is held.
pub struct NetDevice {
    pub(crate) options: DeviceOptions,
    pub(crate) driver: Arc<dyn NetDriver>,
    /// All non-builtin qdiscs attached to the device.
    pub(crate) tree: RwLock<Vec<Arc<Qdisc>>>,
    pub(crate) queue: Mutex<QueueState>,
    pub(crate) xmit_lock: Mutex<()>,
    /// Token of the thread holding the transmit lock, 0 if none.
    pub(crate) xmit_owner: AtomicU64,
    pub(crate) trans_start: Mutex<Instant>,
    pub(crate) state: AtomicU32,
    pub(crate) stats: DeviceStats,
    pub(crate) scheduler: Option<TxScheduler>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for NetDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetDevice")
            .field("name", &self.options.name)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Returns a unique, non-zero token for the calling thread.
pub(crate) fn current_thread_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);

    thread_local! {
        static TOKEN: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }

    TOKEN.with(|token| *token)
}

impl NetDevice {
    /// Creates a device with no transmit scheduler: a device that needs rescheduling is only
    /// marked, and [`run_scheduled`](Self::run_scheduled) must be called to service it.
    pub fn new(options: DeviceOptions, driver: Arc<dyn NetDriver>) -> Arc<Self> {
        Self::build(options, driver, None)
    }

    /// Creates a device serviced by `scheduler`.
    pub fn with_scheduler(
        options: DeviceOptions,
        driver: Arc<dyn NetDriver>,
        scheduler: TxScheduler,
    ) -> Arc<Self> {
        Self::build(options, driver, Some(scheduler))
    }

    fn build(
        options: DeviceOptions,
        driver: Arc<dyn NetDriver>,
        scheduler: Option<TxScheduler>,
    ) -> Arc<Self> {
        let noop = Qdisc::noop();
        Arc::new(Self {
            options,
            driver,
            tree: RwLock::new(Vec::new()),
            queue: Mutex::new(QueueState {
                qdisc: Arc::clone(&noop),
                sleeping: noop,
                ingress: None,
            }),
            xmit_lock: Mutex::new(()),
            xmit_owner: AtomicU64::new(0),
            trans_start: Mutex::new(Instant::now()),
            state: AtomicU32::new(state::PRESENT | state::CARRIER),
            stats: DeviceStats::default(),
            scheduler,
            watchdog: Mutex::new(None),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.options.name
    }

    #[inline]
    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    #[inline]
    pub fn tx_queue_len(&self) -> usize {
        self.options.tx_queue_len
    }

    #[inline]
    pub fn watchdog_timeo(&self) -> Duration {
        self.options.watchdog_timeo
    }

    pub fn driver(&self) -> &Arc<dyn NetDriver> {
        &self.driver
    }

    #[inline]
    pub(crate) fn test_state(&self, bit: u32) -> bool {
        self.state.load(Ordering::Acquire) & bit != 0
    }

    #[inline]
    fn set_state(&self, bit: u32, on: bool) {
        if on {
            self.state.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.state.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    pub fn is_up(&self) -> bool {
        self.test_state(state::UP)
    }

    pub fn is_present(&self) -> bool {
        self.test_state(state::PRESENT)
    }

    pub fn carrier_ok(&self) -> bool {
        self.test_state(state::CARRIER)
    }

    /// Whether the device is waiting to be serviced by the transmit scheduler.
    pub fn is_scheduled(&self) -> bool {
        self.test_state(state::SCHEDULED)
    }

    pub fn set_present(&self, present: bool) {
        self.set_state(state::PRESENT, present);
    }

    pub fn set_carrier(&self, carrier: bool) {
        self.set_state(state::CARRIER, carrier);
    }

    pub fn counters(&self) -> DeviceCounters {
        let s = &self.stats;
        DeviceCounters {
            tx_packets: s.tx_packets.load(Ordering::Relaxed),
            tx_bytes: s.tx_bytes.load(Ordering::Relaxed),
            tx_dropped: s.tx_dropped.load(Ordering::Relaxed),
            collisions: s.collisions.load(Ordering::Relaxed),
            dead_loops: s.dead_loops.load(Ordering::Relaxed),
            tx_timeouts: s.tx_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Time of the last successful transmit (or of activation).
    pub fn trans_start(&self) -> Instant {
        *self.trans_start.lock()
    }

    pub(crate) fn touch_trans_start(&self) {
        *self.trans_start.lock() = Instant::now();
    }

    /// Takes the queue lock.
    pub fn lock_queue(&self) -> QueueGuard<'_> {
        self.queue.lock()
    }

    /// The qdisc currently receiving packets.
    pub fn active_qdisc(&self) -> Arc<Qdisc> {
        Arc::clone(&self.queue.lock().qdisc)
    }

    /// The configured qdisc.
    pub fn sleeping_qdisc(&self) -> Arc<Qdisc> {
        Arc::clone(&self.queue.lock().sleeping)
    }

    pub fn ingress_qdisc(&self) -> Option<Arc<Qdisc>> {
        self.queue.lock().ingress.clone()
    }

    /// Brings the device up and activates its qdisc.
    pub fn open(self: &Arc<Self>) {
        self.set_state(state::UP, true);
        self.activate();
        tracing::debug!(dev = self.name(), "device up");
    }

    /// Deactivates the qdisc and takes the device down.
    pub fn close(self: &Arc<Self>) {
        self.deactivate();
        self.set_state(state::UP, false);
        tracing::debug!(dev = self.name(), "device down");
    }

    /// Installs the configured qdisc as active, creating the default one first if none is
    /// configured, and starts the watchdog.
    pub fn activate(self: &Arc<Self>) {
        let mut tree = self.tree.write();
        let mut queue = self.queue.lock();

        if queue.sleeping.is_noop() {
            let qdisc = Qdisc::create_default(self.options.tx_queue_len);
            tracing::debug!(dev = self.name(), kind = qdisc.kind(), "created default qdisc");
            if !qdisc.is_builtin() {
                tree.push(Arc::clone(&qdisc));
            }
            queue.sleeping = qdisc;
        }

        queue.qdisc = Arc::clone(&queue.sleeping);
        let queueless = queue.qdisc.is_queueless();
        drop(queue);
        drop(tree);

        if !queueless {
            self.touch_trans_start();
            self.watchdog_up();
        }
    }

    /// Installs `noop` as the active qdisc and purges the previous one.
    ///
    /// Blocks until a transmit in progress on another thread finishes.
    pub fn deactivate(self: &Arc<Self>) {
        let old = {
            let mut queue = self.queue.lock();
            let old = mem::replace(&mut queue.qdisc, Qdisc::noop());
            old.reset();
            old
        };

        self.watchdog_down();

        // A pending reschedule finds the noop qdisc and nothing to do.
        self.set_state(state::SCHEDULED, false);

        // Wait out a transmit in flight; it requeues onto noop, which drops.
        drop(self.xmit_lock.lock());

        tracing::debug!(dev = self.name(), kind = old.kind(), "deactivated qdisc");
    }

    /// Releases all qdiscs. The device is left with `noop` in every slot.
    pub fn shutdown(&self) {
        let (tree, old) = {
            let mut tree = self.tree.write();
            let mut queue = self.queue.lock();

            let noop = Qdisc::noop();
            queue.qdisc = Arc::clone(&noop);
            let old = mem::replace(&mut queue.sleeping, noop);
            queue.ingress = None;
            (mem::take(&mut *tree), old)
        };

        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }

        tracing::debug!(dev = self.name(), qdiscs = tree.len(), "shut down scheduler");
        drop((tree, old));
    }

    /// Replaces the configured (or, with `ingress`, the ingress) qdisc and returns the old one.
    /// `None` restores the default.
    ///
    /// A running device is deactivated around the swap.
    pub fn graft(
        self: &Arc<Self>,
        qdisc: Option<Arc<Qdisc>>,
        ingress: bool,
    ) -> Result<Option<Arc<Qdisc>>, QdiscError> {
        if let Some(ref qdisc) = qdisc {
            let handle = qdisc.handle();
            if handle != Handle::UNSPEC && self.qdisc_lookup(handle).is_some() {
                return Err(QdiscError::Exists(handle));
            }
        }

        let up = self.is_up();
        if up {
            self.deactivate();
        }

        let old = {
            let mut tree = self.tree.write();
            let mut queue = self.queue.lock();

            let old = if ingress {
                if let Some(ref qdisc) = qdisc {
                    qdisc.set_flag(QdiscFlags::INGRESS, true);
                }
                mem::replace(&mut queue.ingress, qdisc.clone())
            } else {
                let new = qdisc.clone().unwrap_or_else(Qdisc::noop);
                let old = mem::replace(&mut queue.sleeping, new);
                queue.qdisc = Qdisc::noop();
                (!old.is_builtin()).then_some(old)
            };

            if let Some(ref old) = old {
                tree.retain(|q| !Arc::ptr_eq(q, old));
            }
            if let Some(qdisc) = qdisc.filter(|q| !q.is_builtin()) {
                tree.push(qdisc);
            }
            old
        };

        if up {
            self.activate();
        }

        Ok(old)
    }

    /// Finds an attached qdisc by handle.
    pub fn qdisc_lookup(&self, handle: Handle) -> Option<Arc<Qdisc>> {
        self.tree.read().iter().find(|q| q.handle() == handle).cloned()
    }

    /// Allocates a `major:0` handle no attached qdisc uses.
    pub fn alloc_handle(&self) -> Result<Handle, QdiscError> {
        let tree = self.tree.read();
        (AUTOHANDLE_FIRST_MAJOR..=0xFFFF)
            .map(|major| Handle::new(major as u16, 0))
            .find(|handle| tree.iter().all(|q| q.handle() != *handle))
            .ok_or(QdiscError::HandleExhausted)
    }

    fn watchdog_up(self: &Arc<Self>) {
        let timeo = self.options.watchdog_timeo;
        if timeo.is_zero() {
            return;
        }

        if tokio::runtime::Handle::try_current().is_err() {
            tracing::debug!(dev = self.name(), "no runtime, transmit watchdog disabled");
            return;
        }

        let task = spawn_watchdog(Arc::downgrade(self), timeo);
        if let Some(old) = self.watchdog.lock().replace(task) {
            old.abort();
        }
    }

    fn watchdog_down(&self) {
        if let Some(task) = self.watchdog.lock().take() {
            task.abort();
        }
    }

    /// One watchdog tick: calls the driver's recovery if the queue has been stopped for longer
    /// than the timeout.
    pub(crate) fn watchdog_check(&self) {
        if self.queue.lock().qdisc.is_noop() {
            return;
        }

        let _xmit = self.xmit_lock.lock();

        if !(self.is_present() && self.is_up() && self.carrier_ok()) {
            return;
        }

        let stalled = self.trans_start().elapsed();
        if self.driver.queue_stopped() && stalled > self.options.watchdog_timeo {
            tracing::warn!(dev = self.name(), ?stalled, "transmit timed out");
            self.stats.increment_tx_timeouts();
            self.driver.tx_timeout();
        }
    }
}

impl Drop for NetDevice {
    fn drop(&mut self) {
        if let Some(task) = self.watchdog.get_mut().take() {
            task.abort();
        }
    }
}
