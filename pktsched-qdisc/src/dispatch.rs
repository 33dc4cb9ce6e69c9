//! The transmit path: moving packets from the active qdisc to the driver.

use std::sync::{atomic::Ordering, Arc};

use parking_lot::MutexGuard;
use pktsched_common::Packet;

use crate::{
    device::{current_thread_token, state, QueueGuard, QueueState},
    NetDevice, TxBusy,
};

/// Outcome of one [`NetDevice::restart`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restart {
    /// A packet was handed off (or discarded); the queue may have more.
    Progress,
    /// Nothing to send.
    Empty,
    /// The packet was put back and the device rescheduled.
    Busy,
}

/// Outcome of [`NetDevice::queue_xmit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmitStatus {
    /// Queued (or sent directly, on a device without a queue).
    Success,
    /// Dropped by the qdisc.
    Drop,
    /// The device could not take the packet: it is down, busy or looping.
    Down,
}

impl NetDevice {
    /// Dequeues one packet and tries to send it. Must be called with the queue lock held; the
    /// lock is released around the driver call.
    pub fn restart(self: &Arc<Self>, queue: &mut QueueGuard<'_>) -> Restart {
        let Some(packet) = queue.qdisc.dequeue() else {
            return Restart::Empty;
        };

        let me = current_thread_token();

        let Some(xmit) = self.xmit_lock.try_lock() else {
            if self.xmit_owner.load(Ordering::Acquire) == me {
                self.stats.increment_dead_loops();
                tracing::error!(dev = self.name(), "dead loop on device, fix it urgently");
                return Restart::Progress;
            }

            self.stats.increment_collisions();
            self.requeue(queue, packet);
            return Restart::Busy;
        };

        self.xmit_owner.store(me, Ordering::Release);

        let result = MutexGuard::unlocked(queue, || {
            let len = packet.len();
            let result = if self.driver.queue_stopped() {
                Err(TxBusy(packet))
            } else {
                self.driver.start_xmit(packet)
            };

            if result.is_ok() {
                self.touch_trans_start();
                self.stats.increment_tx(len);
            }

            self.xmit_owner.store(0, Ordering::Release);
            drop(xmit);
            result
        });

        match result {
            Ok(()) => Restart::Progress,
            Err(TxBusy(packet)) => {
                tracing::trace!(dev = self.name(), "driver busy, requeueing");
                self.requeue(queue, packet);
                Restart::Busy
            }
        }
    }

    /// Puts a packet back on the active qdisc, which may have changed while the queue lock was
    /// released, and reschedules the device.
    fn requeue(self: &Arc<Self>, queue: &QueueState, packet: Packet) {
        if queue.qdisc.requeue(packet).is_err() {
            tracing::trace!(dev = self.name(), kind = queue.qdisc.kind(), "requeue dropped packet");
        }
        self.netif_schedule();
    }

    /// Sends packets while the driver queue is running and there is progress.
    pub fn qdisc_run(self: &Arc<Self>, queue: &mut QueueGuard<'_>) {
        while !self.driver.queue_stopped() && self.restart(queue) == Restart::Progress {}
    }

    /// Takes the queue lock and runs the queue.
    pub fn run_queue(self: &Arc<Self>) {
        let mut queue = self.queue.lock();
        self.qdisc_run(&mut queue);
    }

    /// Queues a packet for transmission and runs the queue.
    ///
    /// On a device without a queue the packet goes straight to the driver.
    pub fn queue_xmit(self: &Arc<Self>, packet: Packet) -> XmitStatus {
        let mut queue = self.queue.lock();
        let qdisc = Arc::clone(&queue.qdisc);

        if !qdisc.is_queueless() {
            let status = match qdisc.enqueue(packet) {
                Ok(()) => XmitStatus::Success,
                Err(_) => XmitStatus::Drop,
            };
            self.qdisc_run(&mut queue);
            return status;
        }

        drop(queue);
        self.xmit_direct(packet)
    }

    fn xmit_direct(&self, packet: Packet) -> XmitStatus {
        if self.is_up() {
            let me = current_thread_token();

            if self.xmit_owner.load(Ordering::Acquire) != me {
                let xmit = self.xmit_lock.lock();
                self.xmit_owner.store(me, Ordering::Release);

                let len = packet.len();
                let sent = !self.driver.queue_stopped() && self.driver.start_xmit(packet).is_ok();

                self.xmit_owner.store(0, Ordering::Release);
                drop(xmit);

                if sent {
                    self.touch_trans_start();
                    self.stats.increment_tx(len);
                    return XmitStatus::Success;
                }

                tracing::debug!(dev = self.name(), "virtual device asks to queue packet");
            } else {
                self.stats.increment_dead_loops();
                tracing::error!(dev = self.name(), "dead loop on virtual device, fix it urgently");
            }
        }

        self.stats.increment_dropped();
        XmitStatus::Down
    }

    /// Asks the transmit scheduler to run this device's queue later. A device is posted at most
    /// once until it is serviced.
    pub fn netif_schedule(self: &Arc<Self>) {
        let prev = self.state.fetch_or(state::SCHEDULED, Ordering::AcqRel);
        if prev & state::SCHEDULED != 0 {
            return;
        }

        if let Some(ref scheduler) = self.scheduler {
            if !scheduler.post(Arc::downgrade(self)) {
                tracing::warn!(dev = self.name(), "transmit scheduler is gone");
            }
        }
    }

    /// Called by the driver once its queue can take packets again.
    pub fn wake_queue(self: &Arc<Self>) {
        self.netif_schedule();
    }

    /// Services a pending reschedule. Returns `false` if none was pending.
    ///
    /// If the queue lock is contended the device is posted again instead of waiting.
    pub fn run_scheduled(self: &Arc<Self>) -> bool {
        let prev = self.state.fetch_and(!state::SCHEDULED, Ordering::AcqRel);
        if prev & state::SCHEDULED == 0 {
            return false;
        }

        match self.queue.try_lock() {
            Some(mut queue) => self.qdisc_run(&mut queue),
            None => self.netif_schedule(),
        }
        true
    }
}
