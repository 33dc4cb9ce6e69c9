use std::{fmt, sync::Arc, time::Instant};

use parking_lot::{Mutex, RwLock};
use pktsched_common::Packet;
use rustc_hash::FxHashMap;

use crate::{
    header::{Ipv4Header, IPV4_MIN_HLEN},
    options::parse_options,
    reassembly::{Reassembler, ReassemblyOptions},
    stats::{IpCounters, IpStats},
    IpError,
};

/// A transport protocol fed by the receive path.
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Takes a complete datagram. The packet data starts at its IP header.
    fn deliver(&self, header: &Ipv4Header, packet: Packet);
}

/// What happened to a received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the protocol's handler.
    Delivered,
    /// A fragment, held until the rest of its datagram arrives.
    Fragment,
    /// No handler is registered for the protocol.
    UnknownProtocol(u8),
    Dropped(IpError),
}

/// The IPv4 input path: validation, reassembly and protocol dispatch.
pub struct IpReceiver {
    handlers: RwLock<FxHashMap<u8, Arc<dyn ProtocolHandler>>>,
    reasm: Mutex<Reassembler>,
    stats: IpStats,
}

impl fmt::Debug for IpReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut protocols: Vec<u8> = self.handlers.read().keys().copied().collect();
        protocols.sort_unstable();
        f.debug_struct("IpReceiver")
            .field("protocols", &protocols)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Default for IpReceiver {
    fn default() -> Self {
        Self::new(ReassemblyOptions::default())
    }
}

impl IpReceiver {
    pub fn new(options: ReassemblyOptions) -> Self {
        Self {
            handlers: RwLock::new(FxHashMap::default()),
            reasm: Mutex::new(Reassembler::new(options)),
            stats: IpStats::default(),
        }
    }

    /// Registers `handler` for IP protocol number `protocol`.
    pub fn register(
        &self,
        protocol: u8,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<(), IpError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&protocol) {
            return Err(IpError::HandlerExists(protocol));
        }
        handlers.insert(protocol, handler);
        Ok(())
    }

    pub fn unregister(&self, protocol: u8) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.write().remove(&protocol)
    }

    pub fn counters(&self) -> IpCounters {
        self.stats.snapshot()
    }

    /// Number of datagrams waiting for fragments.
    pub fn pending_reassemblies(&self) -> usize {
        self.reasm.lock().len()
    }

    pub fn receive(&self, packet: Packet) -> Delivery {
        self.receive_at(packet, Instant::now())
    }

    /// Receives `packet` as if at `now`, which drives reassembly timeouts.
    pub fn receive_at(&self, mut packet: Packet, now: Instant) -> Delivery {
        self.stats.increment_in_receives();

        let header = match Self::validate(packet.data()) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!(len = packet.len(), "ip header error: {e}");
                self.stats.increment_in_hdr_errors();
                return Delivery::Dropped(e);
            }
        };

        // Link layer padding.
        packet.truncate(header.total_len);

        let (header, packet) = if header.is_fragment() {
            match self.defrag(&header, packet, now) {
                Ok(Some(whole)) => whole,
                Ok(None) => return Delivery::Fragment,
                Err(e) => return Delivery::Dropped(e),
            }
        } else {
            (header, packet)
        };

        let handler = self.handlers.read().get(&header.protocol).cloned();
        match handler {
            Some(handler) => {
                self.stats.increment_in_delivers();
                handler.deliver(&header, packet);
                Delivery::Delivered
            }
            None => {
                tracing::trace!(protocol = header.protocol, "no handler for protocol");
                self.stats.increment_in_unknown_protos();
                Delivery::UnknownProtocol(header.protocol)
            }
        }
    }

    /// Discards incomplete datagrams that timed out.
    pub fn expire(&self, now: Instant) -> usize {
        let expired = self.reasm.lock().expire(now);
        self.stats.increment_reasm_fails(expired);
        expired
    }

    fn validate(data: &[u8]) -> Result<Ipv4Header, IpError> {
        let header = Ipv4Header::parse(data)?;
        parse_options(&data[IPV4_MIN_HLEN..header.ihl])?;
        Ok(header)
    }

    fn defrag(
        &self,
        header: &Ipv4Header,
        packet: Packet,
        now: Instant,
    ) -> Result<Option<(Ipv4Header, Packet)>, IpError> {
        self.stats.increment_reasm_reqds();

        let result = {
            let mut reasm = self.reasm.lock();
            let expired = reasm.expire(now);
            self.stats.increment_reasm_fails(expired);
            reasm.insert(header, packet.data(), now)
        };

        let whole = match result {
            Ok(Some(whole)) => whole,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::debug!(id = header.id, source = %header.source, "reassembly failed: {e}");
                self.stats.increment_reasm_fails(1);
                return Err(e);
            }
        };

        self.stats.increment_reasm_oks();
        match Ipv4Header::parse(whole.data()) {
            Ok(header) => Ok(Some((header, whole))),
            Err(e) => {
                self.stats.increment_in_discards();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::{datagram, with_options};

    #[derive(Debug, Default)]
    struct Sink {
        received: Mutex<Vec<(u8, Vec<u8>)>>,
    }

    impl ProtocolHandler for Sink {
        fn deliver(&self, header: &Ipv4Header, packet: Packet) {
            let payload = packet.data()[header.ihl..].to_vec();
            self.received.lock().push((header.protocol, payload));
        }
    }

    fn receiver() -> (IpReceiver, Arc<Sink>) {
        let _ = tracing_subscriber::fmt::try_init();
        let receiver = IpReceiver::default();
        let sink = Arc::new(Sink::default());
        receiver.register(17, Arc::clone(&sink) as Arc<dyn ProtocolHandler>).unwrap();
        (receiver, sink)
    }

    #[test]
    fn dispatches_by_protocol() {
        let (receiver, sink) = receiver();

        assert_eq!(receiver.receive(datagram(17, 1, 0, false, b"udp")), Delivery::Delivered);
        let sctp = datagram(132, 2, 0, false, b"sctp");
        assert_eq!(receiver.receive(sctp), Delivery::UnknownProtocol(132));

        assert_eq!(*sink.received.lock(), vec![(17, b"udp".to_vec())]);
        let counters = receiver.counters();
        assert_eq!(counters.in_receives, 2);
        assert_eq!(counters.in_delivers, 1);
        assert_eq!(counters.in_unknown_protos, 1);
    }

    #[test]
    fn duplicate_registration() {
        let (receiver, sink) = receiver();
        let err = receiver.register(17, sink as Arc<dyn ProtocolHandler>).unwrap_err();
        assert_eq!(err, IpError::HandlerExists(17));

        assert!(receiver.unregister(17).is_some());
        let udp = datagram(17, 1, 0, false, b"x");
        assert_eq!(receiver.receive(udp), Delivery::UnknownProtocol(17));
    }

    #[test]
    fn padding_is_trimmed() {
        let (receiver, sink) = receiver();
        let mut packet = datagram(17, 1, 0, false, b"abc");
        packet.extend_from_slice(&[0; 20]);

        assert_eq!(receiver.receive(packet), Delivery::Delivered);
        assert_eq!(sink.received.lock()[0].1, b"abc");
    }

    #[test]
    fn header_errors_are_counted() {
        let (receiver, sink) = receiver();

        let mut bad = datagram(17, 1, 0, false, b"abc");
        bad.data_mut()[10] ^= 1;
        assert_eq!(receiver.receive(bad), Delivery::Dropped(IpError::Checksum));

        let bad_options = with_options(datagram(17, 1, 0, false, b"abc"), &[0x94, 9, 0, 0]);
        assert_eq!(
            receiver.receive(bad_options),
            Delivery::Dropped(IpError::BadOption { offset: 0 })
        );

        let good_options = with_options(datagram(17, 1, 0, false, b"abc"), &[1, 1, 1, 0]);
        assert_eq!(receiver.receive(good_options), Delivery::Delivered);

        assert_eq!(receiver.counters().in_hdr_errors, 2);
        assert_eq!(sink.received.lock().len(), 1);
    }

    #[test]
    fn fragments_are_reassembled_before_delivery() {
        let (receiver, sink) = receiver();
        let payload: Vec<u8> = (0..24).collect();

        let fragment = |offset: usize, more: bool, data: &[u8]| datagram(17, 9, offset, more, data);
        assert_eq!(receiver.receive(fragment(8, true, &payload[8..16])), Delivery::Fragment);
        assert_eq!(receiver.receive(fragment(16, false, &payload[16..])), Delivery::Fragment);
        assert_eq!(receiver.receive(fragment(0, true, &payload[..8])), Delivery::Delivered);

        assert_eq!(*sink.received.lock(), vec![(17, payload)]);
        let counters = receiver.counters();
        assert_eq!((counters.reasm_reqds, counters.reasm_oks, counters.reasm_fails), (3, 1, 0));
        assert_eq!(counters.in_delivers, 1);
    }

    #[test]
    fn stale_fragments_expire() {
        let (receiver, sink) = receiver();
        let start = Instant::now();

        receiver.receive_at(datagram(17, 4, 0, true, &[0; 8]), start);
        assert_eq!(receiver.pending_reassemblies(), 1);

        // The rest arrives after the timeout and starts a new, incomplete datagram.
        let late = start + Duration::from_secs(31);
        let rest = datagram(17, 4, 8, false, &[1; 8]);
        assert_eq!(receiver.receive_at(rest, late), Delivery::Fragment);
        assert_eq!(receiver.counters().reasm_fails, 1);
        assert_eq!(receiver.pending_reassemblies(), 1);

        assert_eq!(receiver.expire(late + Duration::from_secs(30)), 1);
        assert_eq!(receiver.pending_reassemblies(), 0);
        assert!(sink.received.lock().is_empty());
    }

    #[test]
    fn overlapping_fragments_are_dropped() {
        let (receiver, _sink) = receiver();
        receiver.receive(datagram(17, 2, 0, true, &[0; 16]));
        let delivery = receiver.receive(datagram(17, 2, 8, true, &[0; 8]));
        assert_eq!(delivery, Delivery::Dropped(IpError::Overlap { offset: 8 }));
        assert_eq!(receiver.counters().reasm_fails, 1);
    }
}
