mod contention;
mod ordering;
mod watchdog;

/// Test drivers.
mod helpers {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    use parking_lot::Mutex;
    use pktsched_common::Packet;
    use pktsched_qdisc::{DeviceOptions, NetDevice, NetDriver, TxBusy};

    /// Records every packet it accepts.
    #[derive(Debug, Default)]
    pub struct RecordingDriver {
        pub sent: Mutex<Vec<Packet>>,
        pub stopped: AtomicBool,
        /// Number of upcoming transmits to refuse.
        pub busy: AtomicUsize,
        pub timeouts: AtomicUsize,
    }

    impl RecordingDriver {
        pub fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        pub fn start(&self) {
            self.stopped.store(false, Ordering::SeqCst);
        }

        pub fn refuse(&self, n: usize) {
            self.busy.store(n, Ordering::SeqCst);
        }

        /// First payload byte of every sent packet.
        pub fn tags(&self) -> Vec<u8> {
            self.sent.lock().iter().map(|p| p.data()[0]).collect()
        }
    }

    impl NetDriver for RecordingDriver {
        fn start_xmit(&self, packet: Packet) -> Result<(), TxBusy> {
            let refuse =
                self.busy.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if refuse.is_ok() {
                return Err(TxBusy(packet));
            }
            self.sent.lock().push(packet);
            Ok(())
        }

        fn queue_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }

        fn tx_timeout(&self) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn packet(tag: u8, priority: u32) -> Packet {
        Packet::from_slice(&[tag; 64]).with_priority(priority)
    }

    /// A running device with a recording driver.
    pub fn device(tx_queue_len: usize) -> (Arc<NetDevice>, Arc<RecordingDriver>) {
        let _ = tracing_subscriber::fmt::try_init();

        let driver = Arc::new(RecordingDriver::default());
        let options = DeviceOptions::default().name("test0").tx_queue_len(tx_queue_len);
        let dev = NetDevice::new(options, Arc::clone(&driver) as Arc<dyn NetDriver>);
        dev.open();
        (dev, driver)
    }
}
