use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier, OnceLock, Weak,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use pktsched_common::Packet;
use pktsched_qdisc::{DeviceOptions, NetDevice, NetDriver, TxBusy, TxScheduler, XmitStatus};
use rand::Rng;

use crate::helpers::{device, packet, RecordingDriver};

/// Blocks inside its first transmit until released.
#[derive(Debug)]
struct GateDriver {
    sent: Mutex<Vec<u8>>,
    first: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl NetDriver for GateDriver {
    fn start_xmit(&self, packet: Packet) -> Result<(), TxBusy> {
        if self.first.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
        self.sent.lock().push(packet.data()[0]);
        Ok(())
    }

    fn queue_stopped(&self) -> bool {
        false
    }
}

#[test]
fn collision_requeues_until_holder_finishes() {
    let driver = Arc::new(GateDriver {
        sent: Mutex::new(Vec::new()),
        first: AtomicBool::new(true),
        entered: Barrier::new(2),
        release: Barrier::new(2),
    });
    let dev = NetDevice::new(DeviceOptions::default(), Arc::clone(&driver) as Arc<dyn NetDriver>);
    dev.open();

    let holder = {
        let dev = Arc::clone(&dev);
        thread::spawn(move || dev.queue_xmit(packet(1, 0)))
    };
    driver.entered.wait();

    // The transmit lock is held by the other thread: counted, requeued, rescheduled.
    assert_eq!(dev.queue_xmit(packet(2, 0)), XmitStatus::Success);
    assert_eq!(dev.counters().collisions, 1);
    assert!(dev.is_scheduled());
    assert_eq!(dev.active_qdisc().qlen(), 1);

    driver.release.wait();
    assert_eq!(holder.join().unwrap(), XmitStatus::Success);

    // The holder's run picked up the requeued packet.
    assert_eq!(*driver.sent.lock(), vec![1, 2]);
}

/// Transmits by re-entering the device it belongs to.
#[derive(Debug, Default)]
struct LoopingDriver {
    dev: OnceLock<Weak<NetDevice>>,
    sent: Mutex<Vec<u8>>,
}

impl NetDriver for LoopingDriver {
    fn start_xmit(&self, packet: Packet) -> Result<(), TxBusy> {
        let tag = packet.data()[0];
        if tag == 1 {
            if let Some(dev) = self.dev.get().and_then(Weak::upgrade) {
                dev.queue_xmit(packet.clone());
            }
        }
        self.sent.lock().push(tag);
        Ok(())
    }

    fn queue_stopped(&self) -> bool {
        false
    }
}

fn looping_device(tx_queue_len: usize) -> (Arc<NetDevice>, Arc<LoopingDriver>) {
    let driver = Arc::new(LoopingDriver::default());
    let options = DeviceOptions::default().tx_queue_len(tx_queue_len);
    let dev = NetDevice::new(options, Arc::clone(&driver) as Arc<dyn NetDriver>);
    driver.dev.set(Arc::downgrade(&dev)).unwrap();
    dev.open();
    (dev, driver)
}

#[test]
fn dead_loop_is_broken() {
    let (dev, driver) = looping_device(10);

    assert_eq!(dev.queue_xmit(packet(1, 0)), XmitStatus::Success);
    assert_eq!(*driver.sent.lock(), vec![1]);
    assert_eq!(dev.counters().dead_loops, 1);
    assert_eq!(dev.counters().collisions, 0);
    assert_eq!(dev.active_qdisc().qlen(), 0);
}

#[test]
fn dead_loop_on_queueless_device() {
    let (dev, driver) = looping_device(0);

    assert_eq!(dev.queue_xmit(packet(1, 0)), XmitStatus::Success);
    assert_eq!(*driver.sent.lock(), vec![1]);
    let counters = dev.counters();
    assert_eq!((counters.dead_loops, counters.tx_dropped), (1, 1));
}

#[test]
fn concurrent_senders_keep_per_sender_order() {
    const THREADS: u8 = 4;
    const PER_THREAD: usize = 200;

    let (dev, driver) = device(10_000);

    let handles: Vec<_> = (0..THREADS)
        .map(|tag| {
            let dev = Arc::clone(&dev);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for seq in 0..PER_THREAD {
                    let mut data = vec![tag; rng.gen_range(3..200)];
                    data[1..3].copy_from_slice(&(seq as u16).to_be_bytes());
                    dev.queue_xmit(Packet::from_slice(&data));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Flush whatever the last collision left behind.
    dev.run_scheduled();
    dev.run_queue();

    let sent = driver.sent.lock();
    assert_eq!(sent.len(), THREADS as usize * PER_THREAD);
    for tag in 0..THREADS {
        let seqs: Vec<u16> = sent
            .iter()
            .filter(|p| p.data()[0] == tag)
            .map(|p| u16::from_be_bytes([p.data()[1], p.data()[2]]))
            .collect();
        assert_eq!(seqs, (0..PER_THREAD as u16).collect::<Vec<_>>());
    }
    assert_eq!(dev.counters().dead_loops, 0);
}

#[tokio::test]
async fn scheduler_task_retries_busy_device() {
    let _ = tracing_subscriber::fmt::try_init();

    let (scheduler, task) = TxScheduler::spawn();
    let driver = Arc::new(RecordingDriver::default());
    let dev = NetDevice::with_scheduler(
        DeviceOptions::default().tx_queue_len(10),
        Arc::clone(&driver) as Arc<dyn NetDriver>,
        scheduler,
    );
    dev.open();

    driver.refuse(1);
    assert_eq!(dev.queue_xmit(packet(1, 0)), XmitStatus::Success);
    assert!(driver.tags().is_empty());
    assert!(dev.is_scheduled());

    for _ in 0..100 {
        if !driver.tags().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(driver.tags(), vec![1]);
    assert!(!dev.is_scheduled());

    dev.queue_xmit(packet(2, 0));
    assert_eq!(driver.tags(), vec![1, 2]);

    dev.shutdown();
    drop(dev);
    task.abort();
}

#[tokio::test]
async fn woken_queue_is_serviced() {
    let (scheduler, _task) = TxScheduler::spawn();
    let driver = Arc::new(RecordingDriver::default());
    let dev = NetDevice::with_scheduler(
        DeviceOptions::default(),
        Arc::clone(&driver) as Arc<dyn NetDriver>,
        scheduler,
    );
    dev.open();

    driver.stop();
    dev.queue_xmit(packet(7, 0));
    assert!(driver.tags().is_empty());

    driver.start();
    dev.wake_queue();

    for _ in 0..100 {
        if !driver.tags().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(driver.tags(), vec![7]);
}
