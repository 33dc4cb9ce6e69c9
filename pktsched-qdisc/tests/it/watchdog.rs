use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use pktsched_qdisc::{DeviceOptions, NetDevice, NetDriver};

use crate::helpers::{packet, RecordingDriver};

fn watched_device(timeo: Duration) -> (Arc<NetDevice>, Arc<RecordingDriver>) {
    let _ = tracing_subscriber::fmt::try_init();

    let driver = Arc::new(RecordingDriver::default());
    let options = DeviceOptions::default().tx_queue_len(10).watchdog_timeo(timeo);
    let dev = NetDevice::new(options, Arc::clone(&driver) as Arc<dyn NetDriver>);
    (dev, driver)
}

#[tokio::test(start_paused = true)]
async fn stalled_queue_times_out() {
    let (dev, driver) = watched_device(Duration::from_secs(1));
    dev.open();
    driver.stop();
    dev.queue_xmit(packet(1, 0));

    // At the first tick the queue has been stopped for exactly the timeout, which is not enough.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(driver.timeouts.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(driver.timeouts.load(Ordering::SeqCst), 1);
    assert_eq!(dev.counters().tx_timeouts, 1);

    // Deactivation stops the watchdog.
    dev.close();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(driver.timeouts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn running_queue_never_times_out() {
    let (dev, driver) = watched_device(Duration::from_secs(1));
    dev.open();

    for tag in 0..5 {
        tokio::time::sleep(Duration::from_millis(900)).await;
        dev.queue_xmit(packet(tag, 0));
    }
    assert_eq!(driver.tags().len(), 5);
    assert_eq!(driver.timeouts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn no_timeout_without_carrier() {
    let (dev, driver) = watched_device(Duration::from_secs(1));
    dev.open();
    driver.stop();
    dev.set_carrier(false);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(driver.timeouts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_timeout_disables_watchdog() {
    let (dev, driver) = watched_device(Duration::ZERO);
    dev.open();
    driver.stop();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(driver.timeouts.load(Ordering::SeqCst), 0);
}
