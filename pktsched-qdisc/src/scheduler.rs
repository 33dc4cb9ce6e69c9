//! The transmit scheduler: a task that services devices whose queue needs another run.

use std::{
    future::Future,
    pin::Pin,
    sync::Weak,
    task::{Context, Poll},
};

use tokio::{sync::mpsc, task::JoinHandle};

use crate::NetDevice;

/// Devices serviced per poll before the task yields.
const TX_BUDGET: usize = 64;

/// Handle used by devices to post themselves to the scheduler task.
#[derive(Debug, Clone)]
pub struct TxScheduler {
    to_driver: mpsc::UnboundedSender<Weak<NetDevice>>,
}

impl TxScheduler {
    /// Spawns the scheduler task on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (to_driver, from_devices) = mpsc::unbounded_channel();
        let task = tokio::spawn(TxDriver { from_devices });
        (Self { to_driver }, task)
    }

    /// Returns `false` if the task is gone.
    pub(crate) fn post(&self, dev: Weak<NetDevice>) -> bool {
        self.to_driver.send(dev).is_ok()
    }
}

/// Receives posted devices and runs their queues. Ends once every [`TxScheduler`] is dropped.
struct TxDriver {
    from_devices: mpsc::UnboundedReceiver<Weak<NetDevice>>,
}

impl Future for TxDriver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        for _ in 0..TX_BUDGET {
            match this.from_devices.poll_recv(cx) {
                Poll::Ready(Some(dev)) => {
                    // A device freed while posted needs no service.
                    if let Some(dev) = dev.upgrade() {
                        dev.run_scheduled();
                    }
                }
                Poll::Ready(None) => {
                    tracing::debug!("transmit scheduler shutting down");
                    return Poll::Ready(());
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
