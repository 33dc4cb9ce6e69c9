use std::{fmt, str::FromStr};

use pktsched_common::Packet;

use crate::{builtin::PfifoFastConfig, QdiscError};

/// A packet the qdisc refused. Ownership goes back to the caller, who discards it.
#[derive(Debug, PartialEq, Eq)]
pub struct Dropped(pub Packet);

impl Dropped {
    pub fn into_packet(self) -> Packet {
        self.0
    }
}

/// Options a qdisc is initialized or changed with, and reports back in a dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QdiscConfig {
    PfifoFast(PfifoFastConfig),
}

/// The queueing disciplines this crate provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QdiscKind {
    /// Drops everything. Installed on devices that are not running.
    Noop,
    /// No queue at all: packets go straight to the driver.
    Noqueue,
    /// Three-band priority FIFO, the default for devices with a transmit queue.
    PfifoFast,
}

impl QdiscKind {
    pub const fn id(self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Noqueue => "noqueue",
            Self::PfifoFast => "pfifo_fast",
        }
    }
}

impl fmt::Display for QdiscKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for QdiscKind {
    type Err = QdiscError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "noop" => Ok(Self::Noop),
            "noqueue" => Ok(Self::Noqueue),
            "pfifo_fast" => Ok(Self::PfifoFast),
            other => Err(QdiscError::UnknownKind(other.to_string())),
        }
    }
}

/// The operations every queueing discipline implements.
///
/// Calls are serialized by the owning [`Qdisc`](crate::Qdisc), so implementations keep plain
/// mutable state. Statistics are kept by the wrapper as well.
pub trait QdiscOps: fmt::Debug + Send + 'static {
    /// Identifier of the discipline, e.g. `"pfifo_fast"`.
    fn id(&self) -> &'static str;

    /// Queues a packet, or hands it back if it is dropped.
    fn enqueue(&mut self, packet: Packet) -> Result<(), Dropped>;

    /// Takes the next packet to send.
    fn dequeue(&mut self) -> Option<Packet>;

    /// Puts back a packet that was dequeued but could not be sent. It must be the next one
    /// dequeued from its band.
    fn requeue(&mut self, packet: Packet) -> Result<(), Dropped>;

    /// Purges all queued packets.
    fn reset(&mut self);

    /// Number of packets queued.
    fn qlen(&self) -> usize;

    /// Applies the initial configuration. `None` means defaults.
    fn init(&mut self, config: Option<&QdiscConfig>) -> Result<(), QdiscError> {
        match config {
            None => Ok(()),
            Some(_) => Err(QdiscError::InvalidConfig(self.id())),
        }
    }

    /// Reconfigures a live instance.
    fn change(&mut self, _config: &QdiscConfig) -> Result<(), QdiscError> {
        Err(QdiscError::NotSupported { kind: self.id(), op: "change" })
    }

    /// Current configuration, if the discipline has any.
    fn dump(&self) -> Option<QdiscConfig> {
        None
    }

    /// Releases resources. Runs once, after the last reference to the qdisc is gone and after
    /// a final [`reset`](Self::reset).
    fn destroy(&mut self) {}

    /// Whether the discipline has no queue at all. Devices with such a qdisc transmit directly.
    fn is_queueless(&self) -> bool {
        false
    }
}
