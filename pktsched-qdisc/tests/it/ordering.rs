use std::sync::Arc;

use pktsched_qdisc::{
    DeviceOptions, Handle, NetDevice, NetDriver, PfifoFastConfig, Qdisc, QdiscConfig, QdiscKind,
    Restart, XmitStatus,
};

use crate::helpers::{device, packet, RecordingDriver};

#[test]
fn fifo_within_band() {
    let (dev, driver) = device(10);
    driver.stop();

    for tag in 1..=3 {
        assert_eq!(dev.queue_xmit(packet(tag, 0)), XmitStatus::Success);
    }
    assert!(driver.tags().is_empty());
    assert_eq!(dev.active_qdisc().qlen(), 3);

    driver.start();
    dev.run_queue();
    assert_eq!(driver.tags(), vec![1, 2, 3]);
    assert_eq!(dev.counters().tx_packets, 3);
    assert_eq!(dev.counters().tx_bytes, 3 * 64);
}

#[test]
fn higher_band_drains_first() {
    let (dev, driver) = device(10);
    driver.stop();

    // Interleave the bulk (band 2), best effort (band 1) and interactive (band 0) priorities.
    let sends = [(1, 1), (2, 0), (3, 6), (4, 1), (5, 0), (6, 7)];
    for (tag, priority) in sends {
        dev.queue_xmit(packet(tag, priority));
    }

    driver.start();
    dev.run_queue();
    assert_eq!(driver.tags(), vec![3, 6, 2, 5, 1, 4]);
}

#[test]
fn full_band_drops() {
    let (dev, driver) = device(2);
    driver.stop();

    assert_eq!(dev.queue_xmit(packet(1, 0)), XmitStatus::Success);
    assert_eq!(dev.queue_xmit(packet(2, 0)), XmitStatus::Success);
    assert_eq!(dev.queue_xmit(packet(3, 0)), XmitStatus::Drop);

    let counters = dev.active_qdisc().counters();
    assert_eq!(counters.drops, 1);
    assert_eq!(counters.qlen, 2);
}

#[test]
fn busy_driver_keeps_order() {
    let (dev, driver) = device(10);
    driver.stop();
    for tag in 1..=3 {
        dev.queue_xmit(packet(tag, 0));
    }
    driver.start();
    driver.refuse(1);

    {
        let mut queue = dev.lock_queue();
        assert_eq!(dev.restart(&mut queue), Restart::Busy);
    }
    assert!(dev.is_scheduled());
    assert_eq!(dev.active_qdisc().counters().requeues, 1);
    assert!(driver.tags().is_empty());

    assert!(dev.run_scheduled());
    assert!(!dev.run_scheduled());
    assert_eq!(driver.tags(), vec![1, 2, 3]);

    let mut queue = dev.lock_queue();
    assert_eq!(dev.restart(&mut queue), Restart::Empty);
}

#[test]
fn stopped_queue_is_requeued() {
    let (dev, driver) = device(10);
    driver.stop();
    dev.queue_xmit(packet(1, 0));

    // The driver stopped between the caller's check and the transmit.
    let mut queue = dev.lock_queue();
    assert_eq!(dev.restart(&mut queue), Restart::Busy);
    assert_eq!(queue.active().qlen(), 1);
}

#[test]
fn noqueue_device_transmits_directly() {
    let (dev, driver) = device(0);
    assert!(dev.active_qdisc().is_queueless());

    assert_eq!(dev.queue_xmit(packet(1, 0)), XmitStatus::Success);
    assert_eq!(driver.tags(), vec![1]);

    driver.stop();
    assert_eq!(dev.queue_xmit(packet(2, 0)), XmitStatus::Down);
    assert_eq!(dev.counters().tx_dropped, 1);
}

#[test]
fn closed_device_drops() {
    let (dev, driver) = device(10);
    dev.close();

    assert_eq!(dev.queue_xmit(packet(1, 0)), XmitStatus::Drop);
    assert!(driver.tags().is_empty());
    assert_eq!(dev.active_qdisc().counters().drops, 1);
}

#[test]
fn grafted_qdisc_with_custom_priomap() {
    let driver = Arc::new(RecordingDriver::default());
    let dev = NetDevice::new(
        DeviceOptions::default().tx_queue_len(10),
        Arc::clone(&driver) as Arc<dyn NetDriver>,
    );

    // Everything except priority 0 goes to band 0.
    let mut priomap = [0; 16];
    priomap[0] = 2;
    let config = QdiscConfig::PfifoFast(PfifoFastConfig::default().priomap(priomap));
    let qdisc =
        Qdisc::create(QdiscKind::PfifoFast, 10, Handle::new(1, 0), Handle::ROOT, Some(&config))
            .unwrap();

    dev.graft(Some(qdisc), false).unwrap();
    dev.open();
    assert_eq!(dev.active_qdisc().handle(), Handle::new(1, 0));
    assert_eq!(dev.active_qdisc().dump().options, Some(config));

    driver.stop();
    dev.queue_xmit(packet(1, 0));
    dev.queue_xmit(packet(2, 1));
    driver.start();
    dev.run_queue();
    assert_eq!(driver.tags(), vec![2, 1]);
}
