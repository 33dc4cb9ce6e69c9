use std::{sync::Weak, time::Duration};

use tokio::task::JoinHandle;

use crate::NetDevice;

/// Checks the device for a stalled transmit queue every `timeo` until it is deactivated or freed.
pub(crate) fn spawn_watchdog(dev: Weak<NetDevice>, timeo: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(timeo);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(dev) = dev.upgrade() else {
                break;
            };
            dev.watchdog_check();
        }
    })
}
