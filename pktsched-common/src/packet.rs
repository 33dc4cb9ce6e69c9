use std::fmt;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::constants::IP_MAX_DATAGRAM;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet would grow to {0} bytes, beyond the {IP_MAX_DATAGRAM} byte limit")]
    TooLarge(usize),
    #[error("offset {offset} out of bounds for a {len} byte packet")]
    OutOfBounds { offset: usize, len: usize },
}

/// An owned, linear network buffer.
///
/// The data starts at the network (IP) header. Exclusive access through `&mut Packet` is what
/// makes a packet writable: there is no shared clone to copy away from.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    buf: BytesMut,
    /// Scheduling priority (`TC_PRIO_*`), used by the qdisc to pick a band.
    priority: u32,
}

impl Packet {
    pub fn new(buf: BytesMut) -> Self {
        Self { buf, priority: 0 }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(BytesMut::from(data))
    }

    /// Sets the scheduling priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    #[inline]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    #[inline]
    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Spare bytes past the end of the data that can be used without reallocating.
    #[inline]
    pub fn tailroom(&self) -> usize {
        self.buf.capacity() - self.buf.len()
    }

    /// Makes sure `extra` more bytes fit at the tail, reallocating and copying if needed.
    ///
    /// Fails without touching the packet if the result would exceed the largest IP datagram.
    pub fn ensure_tailroom(&mut self, extra: usize) -> Result<(), PacketError> {
        let wanted = self.len() + extra;
        if wanted > IP_MAX_DATAGRAM {
            return Err(PacketError::TooLarge(wanted));
        }
        if extra > self.tailroom() {
            tracing::trace!(len = self.len(), extra, "expanding packet tail");
            self.buf.reserve(extra);
        }
        Ok(())
    }

    /// Extends the data by `n` zero bytes.
    pub fn put_zeroed(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    /// Shortens the data to `len` bytes. No-op if already shorter.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Removes the first `n` bytes, e.g. to strip a header after it has been processed.
    pub fn pull(&mut self, n: usize) -> Result<(), PacketError> {
        if n > self.len() {
            return Err(PacketError::OutOfBounds { offset: n, len: self.len() });
        }
        let _ = self.buf.split_to(n);
        Ok(())
    }

    /// Appends `data` to the tail.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("priority", &self.priority)
            .finish()
    }
}

impl From<Vec<u8>> for Packet {
    fn from(data: Vec<u8>) -> Self {
        Self::new(BytesMut::from(&data[..]))
    }
}
