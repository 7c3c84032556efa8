use crate::packet::PacketId;

/// Identifiers held by outbound exchanges (QoS 1/2 PUBLISH, SUBSCRIBE,
/// UNSUBSCRIBE) and by their unclaimed results. `N` is the in-flight window.
/// Numbering continues across connections.
pub(crate) struct PacketIdPool<const N: usize> {
    in_flight: [u16; N],
    next_id: u16,
}

impl<const N: usize> PacketIdPool<N> {
    pub(crate) fn new() -> Self {
        Self {
            in_flight: [0u16; N],
            next_id: 1,
        }
    }

    pub(crate) fn allocate(&mut self) -> Result<PacketId, crate::Error> {
        let index = self
            .in_flight
            .iter()
            .position(|id| *id == 0)
            .ok_or(crate::Error::NoPacketIdAvailable)?;

        let id = self.next_id()?;
        self.in_flight[index] = id;

        Ok(PacketId(id))
    }

    fn next_id(&mut self) -> Result<u16, crate::Error> {
        for _ in 0..u16::MAX {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);

            if self.next_id == 0 {
                self.next_id = 1;
            }

            if self.contains(id) {
                continue;
            }

            return Ok(id);
        }

        Err(crate::Error::NoPacketIdAvailable)
    }

    /// Returns false when the id was not in flight.
    pub(crate) fn release(&mut self, packet_id: &PacketId) -> bool {
        match self.in_flight.iter().position(|id| *id == packet_id.0) {
            Some(index) => {
                self.in_flight[index] = 0;
                true
            }
            None => false,
        }
    }

    #[inline]
    pub(crate) fn contains(&self, looking_for: u16) -> bool {
        looking_for != 0 && self.in_flight.contains(&looking_for)
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.iter().filter(|id| **id != 0).count()
    }
}
