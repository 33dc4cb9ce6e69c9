//! Fragment reassembly.

use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use pktsched_common::{checksum, constants::IP_MAX_DATAGRAM, Packet};
use rustc_hash::FxHashMap;

use crate::{header::Ipv4Header, IpError};

/// Default time an incomplete datagram is kept.
pub const DEFAULT_REASM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ReassemblyOptions {
    /// How long a datagram may stay incomplete before its fragments are discarded.
    timeout: Duration,
    /// Largest reassembled datagram accepted, header included.
    max_datagram: usize,
}

impl Default for ReassemblyOptions {
    fn default() -> Self {
        Self { timeout: DEFAULT_REASM_TIMEOUT, max_datagram: IP_MAX_DATAGRAM }
    }
}

impl ReassemblyOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the largest datagram to reassemble. Values above 65535 are clamped.
    pub fn max_datagram(mut self, max_datagram: usize) -> Self {
        self.max_datagram = max_datagram.min(IP_MAX_DATAGRAM);
        self
    }
}

/// Fragments belong to the same datagram when all four match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragKey {
    source: Ipv4Addr,
    destination: Ipv4Addr,
    id: u16,
    protocol: u8,
}

impl From<&Ipv4Header> for FragKey {
    fn from(header: &Ipv4Header) -> Self {
        Self {
            source: header.source,
            destination: header.destination,
            id: header.id,
            protocol: header.protocol,
        }
    }
}

#[derive(Debug)]
struct FragQueue {
    /// Header of the fragment at offset 0, once it arrived.
    header: Option<Vec<u8>>,
    /// Payload by byte offset. Ranges never overlap.
    fragments: BTreeMap<usize, Vec<u8>>,
    /// Payload length of the whole datagram, known once the last fragment arrived.
    total: Option<usize>,
    received: usize,
    created: Instant,
}

impl FragQueue {
    fn new(now: Instant) -> Self {
        Self { header: None, fragments: BTreeMap::new(), total: None, received: 0, created: now }
    }

    fn insert(&mut self, header: &Ipv4Header, data: &[u8]) -> Result<(), IpError> {
        let payload = &data[header.ihl..header.total_len];
        let start = header.frag_offset;
        let end = start + payload.len();

        if !header.more_fragments {
            if self.total.is_some_and(|total| total != end) {
                return Err(IpError::Fragment("conflicting last fragments"));
            }
            if self.fragments.last_key_value().is_some_and(|(off, frag)| off + frag.len() > end) {
                return Err(IpError::Fragment("data past the last fragment"));
            }
            self.total = Some(end);
        } else {
            if payload.is_empty() || payload.len() % 8 != 0 {
                return Err(IpError::Fragment("fragment length not a multiple of 8"));
            }
            if self.total.is_some_and(|total| end > total) {
                return Err(IpError::Fragment("data past the last fragment"));
            }
        }

        let prev = self.fragments.range(..=start).next_back();
        if prev.is_some_and(|(off, frag)| off + frag.len() > start) {
            return Err(IpError::Overlap { offset: start });
        }
        let next = self.fragments.range(start..).next();
        if next.is_some_and(|(off, _)| *off < end) {
            return Err(IpError::Overlap { offset: start });
        }

        if start == 0 {
            self.header = Some(data[..header.ihl].to_vec());
        }
        self.received += payload.len();
        self.fragments.insert(start, payload.to_vec());
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.header.is_some() && self.total == Some(self.received)
    }

    /// Joins the fragments behind the first fragment's header.
    fn assemble(self) -> Packet {
        let header = self.header.unwrap_or_default();
        let ihl = header.len();

        let mut buf = BytesMut::with_capacity(ihl + self.received);
        buf.extend_from_slice(&header);
        for frag in self.fragments.into_values() {
            buf.extend_from_slice(&frag);
        }

        let total = buf.len() as u16;
        buf[2..4].copy_from_slice(&total.to_be_bytes());
        // Keep DF, clear MF and the offset.
        buf[6] &= 0x40;
        buf[7] = 0;
        buf[10..12].fill(0);
        let check = checksum::internet_checksum(&buf[..ihl]);
        buf[10..12].copy_from_slice(&check.to_be_bytes());

        Packet::new(buf)
    }
}

/// Collects fragments until their datagram is complete.
#[derive(Debug, Default)]
pub struct Reassembler {
    options: ReassemblyOptions,
    queues: FxHashMap<FragKey, FragQueue>,
}

impl Reassembler {
    pub fn new(options: ReassemblyOptions) -> Self {
        Self { options, queues: FxHashMap::default() }
    }

    /// Adds the fragment `data` (with `header` already validated) to its datagram.
    ///
    /// Returns the datagram once every fragment arrived. Any error discards every fragment of
    /// the datagram received so far.
    pub fn insert(
        &mut self,
        header: &Ipv4Header,
        data: &[u8],
        now: Instant,
    ) -> Result<Option<Packet>, IpError> {
        let key = FragKey::from(header);

        let end = header.ihl + header.frag_offset + header.payload_len();
        if end > self.options.max_datagram {
            self.queues.remove(&key);
            return Err(IpError::TooLarge(end));
        }

        let queue = self.queues.entry(key).or_insert_with(|| FragQueue::new(now));
        if let Err(e) = queue.insert(header, data) {
            self.queues.remove(&key);
            return Err(e);
        }

        if !queue.is_complete() {
            return Ok(None);
        }

        Ok(self.queues.remove(&key).map(FragQueue::assemble))
    }

    /// Discards incomplete datagrams older than the timeout. Returns how many were dropped.
    pub fn expire(&mut self, now: Instant) -> usize {
        let timeout = self.options.timeout;
        let before = self.queues.len();
        self.queues.retain(|key, queue| {
            let keep = now.saturating_duration_since(queue.created) < timeout;
            if !keep {
                tracing::debug!(id = key.id, source = %key.source, "reassembly timed out");
            }
            keep
        });
        before - self.queues.len()
    }

    /// Number of datagrams waiting for fragments.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
