use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct IpStats {
    in_receives: AtomicU64,
    in_hdr_errors: AtomicU64,
    in_discards: AtomicU64,
    in_delivers: AtomicU64,
    in_unknown_protos: AtomicU64,
    reasm_reqds: AtomicU64,
    reasm_oks: AtomicU64,
    reasm_fails: AtomicU64,
}

impl IpStats {
    #[inline]
    pub(crate) fn increment_in_receives(&self) {
        self.in_receives.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_in_hdr_errors(&self) {
        self.in_hdr_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_in_discards(&self) {
        self.in_discards.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_in_delivers(&self) {
        self.in_delivers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_in_unknown_protos(&self) {
        self.in_unknown_protos.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_reasm_reqds(&self) {
        self.reasm_reqds.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_reasm_oks(&self) {
        self.reasm_oks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_reasm_fails(&self, n: usize) {
        self.reasm_fails.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> IpCounters {
        IpCounters {
            in_receives: self.in_receives.load(Ordering::Relaxed),
            in_hdr_errors: self.in_hdr_errors.load(Ordering::Relaxed),
            in_discards: self.in_discards.load(Ordering::Relaxed),
            in_delivers: self.in_delivers.load(Ordering::Relaxed),
            in_unknown_protos: self.in_unknown_protos.load(Ordering::Relaxed),
            reasm_reqds: self.reasm_reqds.load(Ordering::Relaxed),
            reasm_oks: self.reasm_oks.load(Ordering::Relaxed),
            reasm_fails: self.reasm_fails.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the receive path counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpCounters {
    /// Every datagram handed to the receiver, valid or not.
    pub in_receives: u64,
    /// Datagrams with a broken header or option list.
    pub in_hdr_errors: u64,
    pub in_discards: u64,
    pub in_delivers: u64,
    pub in_unknown_protos: u64,
    /// Fragments received.
    pub reasm_reqds: u64,
    pub reasm_oks: u64,
    /// Datagrams given up on, including timeouts.
    pub reasm_fails: u64,
}
