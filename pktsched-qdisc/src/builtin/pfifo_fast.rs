//! Three-band priority FIFO.
//!
//! The packet's priority selects a band through a 16-entry map; band 0 is always served first.
//! Each band holds at most `limit` packets.

use std::collections::VecDeque;

use pktsched_common::Packet;

use crate::{Dropped, QdiscConfig, QdiscError, QdiscOps};

pub const PFIFO_FAST_BANDS: usize = 3;

/// Lowest bits of the priority (`TC_PRIO_*`) index the band map.
pub const TC_PRIO_MAX: u32 = 15;

/// Default priority → band map.
pub const PRIO2BAND: [u8; TC_PRIO_MAX as usize + 1] =
    [1, 2, 2, 2, 1, 2, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1];

/// Band count and priority map. Only the map is configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfifoFastConfig {
    pub bands: usize,
    pub priomap: [u8; TC_PRIO_MAX as usize + 1],
}

impl Default for PfifoFastConfig {
    fn default() -> Self {
        Self { bands: PFIFO_FAST_BANDS, priomap: PRIO2BAND }
    }
}

impl PfifoFastConfig {
    pub fn priomap(mut self, priomap: [u8; TC_PRIO_MAX as usize + 1]) -> Self {
        self.priomap = priomap;
        self
    }

    fn validate(&self) -> Result<(), QdiscError> {
        if self.bands != PFIFO_FAST_BANDS {
            return Err(QdiscError::InvalidConfig("pfifo_fast: band count is fixed at 3"));
        }
        if self.priomap.iter().any(|&band| band as usize >= self.bands) {
            return Err(QdiscError::InvalidConfig("pfifo_fast: priomap points past the last band"));
        }
        Ok(())
    }
}

/// The default queueing discipline of devices with a transmit queue.
#[derive(Debug)]
pub struct PfifoFast {
    bands: [VecDeque<Packet>; PFIFO_FAST_BANDS],
    priomap: [u8; TC_PRIO_MAX as usize + 1],
    /// Per-band packet limit, the device's `tx_queue_len`.
    limit: usize,
}

impl PfifoFast {
    pub fn new(limit: usize) -> Self {
        Self { bands: Default::default(), priomap: PRIO2BAND, limit }
    }

    #[inline]
    fn band(&self, packet: &Packet) -> usize {
        self.priomap[(packet.priority() & TC_PRIO_MAX) as usize] as usize
    }

    /// Packets queued in each band.
    pub fn band_lens(&self) -> [usize; PFIFO_FAST_BANDS] {
        [self.bands[0].len(), self.bands[1].len(), self.bands[2].len()]
    }
}

impl QdiscOps for PfifoFast {
    fn id(&self) -> &'static str {
        "pfifo_fast"
    }

    fn enqueue(&mut self, packet: Packet) -> Result<(), Dropped> {
        let band = self.band(&packet);
        let queue = &mut self.bands[band];

        if queue.len() >= self.limit {
            return Err(Dropped(packet));
        }

        queue.push_back(packet);
        Ok(())
    }

    fn dequeue(&mut self) -> Option<Packet> {
        self.bands.iter_mut().find_map(VecDeque::pop_front)
    }

    fn requeue(&mut self, packet: Packet) -> Result<(), Dropped> {
        let band = self.band(&packet);
        self.bands[band].push_front(packet);
        Ok(())
    }

    fn reset(&mut self) {
        self.bands.iter_mut().for_each(VecDeque::clear);
    }

    fn qlen(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    fn init(&mut self, config: Option<&QdiscConfig>) -> Result<(), QdiscError> {
        match config {
            None => Ok(()),
            Some(config) => self.change(config),
        }
    }

    fn change(&mut self, config: &QdiscConfig) -> Result<(), QdiscError> {
        let QdiscConfig::PfifoFast(config) = config;
        config.validate()?;
        self.priomap = config.priomap;
        Ok(())
    }

    fn dump(&self) -> Option<QdiscConfig> {
        let config = PfifoFastConfig { bands: PFIFO_FAST_BANDS, priomap: self.priomap };
        Some(QdiscConfig::PfifoFast(config))
    }
}
