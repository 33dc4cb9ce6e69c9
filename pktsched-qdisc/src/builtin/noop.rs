use pktsched_common::Packet;

use crate::{Dropped, QdiscOps};

/// Drops every packet. Stands in for a real qdisc while a device is down.
#[derive(Debug, Default)]
pub struct Noop;

impl QdiscOps for Noop {
    fn id(&self) -> &'static str {
        "noop"
    }

    fn enqueue(&mut self, packet: Packet) -> Result<(), Dropped> {
        Err(Dropped(packet))
    }

    fn dequeue(&mut self) -> Option<Packet> {
        None
    }

    fn requeue(&mut self, packet: Packet) -> Result<(), Dropped> {
        tracing::warn!("noop qdisc got a requeue: deferred output, it is buggy");
        Err(Dropped(packet))
    }

    fn reset(&mut self) {}

    fn qlen(&self) -> usize {
        0
    }
}

/// No queue: the device hands packets to its driver as they come.
///
/// Behaves like [`Noop`] if anything does try to queue on it.
#[derive(Debug, Default)]
pub struct Noqueue;

impl QdiscOps for Noqueue {
    fn id(&self) -> &'static str {
        "noqueue"
    }

    fn enqueue(&mut self, packet: Packet) -> Result<(), Dropped> {
        Err(Dropped(packet))
    }

    fn dequeue(&mut self) -> Option<Packet> {
        None
    }

    fn requeue(&mut self, packet: Packet) -> Result<(), Dropped> {
        tracing::warn!("noqueue qdisc got a requeue: deferred output, it is buggy");
        Err(Dropped(packet))
    }

    fn reset(&mut self) {}

    fn qlen(&self) -> usize {
        0
    }

    fn is_queueless(&self) -> bool {
        true
    }
}
