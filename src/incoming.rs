use heapless::Vec;

use crate::packet::{PacketId, publish::Message};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ReceiptState {
    Received,
    Released,
}

/// Inbound QoS 2 PUBLISH held between PUBREC and PUBREL. `message` is `None`
/// when it did not fit the configured capacities.
struct PendingReceipt<const TOPIC: usize, const PAYLOAD: usize> {
    packet_id: PacketId,
    state: ReceiptState,
    message: Option<Message<TOPIC, PAYLOAD>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Track {
    New,
    Duplicate,
}

pub(crate) struct Incoming<const N: usize, const TOPIC: usize, const PAYLOAD: usize> {
    cursor: usize,
    receipts: Vec<PendingReceipt<TOPIC, PAYLOAD>, N>,
}

impl<const N: usize, const TOPIC: usize, const PAYLOAD: usize> Incoming<N, TOPIC, PAYLOAD> {
    pub(crate) fn new() -> Self {
        Self {
            cursor: 0,
            receipts: Vec::new(),
        }
    }

    /// A retransmitted PUBLISH for a Received id keeps the first copy. A
    /// Released id starts a new exchange.
    pub(crate) fn track(
        &mut self,
        packet_id: PacketId,
        message: Option<Message<TOPIC, PAYLOAD>>,
    ) -> Result<Track, crate::Error> {
        if let Some(entry) = self.receipts.iter_mut().find(|r| r.packet_id == packet_id) {
            if entry.state == ReceiptState::Received {
                return Ok(Track::Duplicate);
            }

            entry.state = ReceiptState::Received;
            entry.message = message;
            return Ok(Track::New);
        }

        let entry = PendingReceipt {
            packet_id,
            state: ReceiptState::Received,
            message,
        };

        if !self.receipts.is_full() {
            self.receipts
                .push(entry)
                .map_err(|_| crate::Error::ReceiveWindowFull)?;
            return Ok(Track::New);
        }

        for _ in 0..self.receipts.len() {
            if self.receipts[self.cursor].state == ReceiptState::Released {
                self.receipts[self.cursor] = entry;
                self.shift_cursor();
                return Ok(Track::New);
            }

            self.shift_cursor();
        }

        Err(crate::Error::ReceiveWindowFull)
    }

    fn shift_cursor(&mut self) {
        self.cursor += 1;

        if self.cursor >= N {
            self.cursor = 0;
        }
    }

    pub(crate) fn state(&self, packet_id: &PacketId) -> Option<ReceiptState> {
        self.receipts
            .iter()
            .find(|r| r.packet_id == *packet_id)
            .map(|r| r.state)
    }

    /// The withheld message of a Received entry.
    pub(crate) fn message(&self, packet_id: &PacketId) -> Option<&Message<TOPIC, PAYLOAD>> {
        self.receipts
            .iter()
            .find(|r| r.packet_id == *packet_id && r.state == ReceiptState::Received)
            .and_then(|r| r.message.as_ref())
    }

    pub(crate) fn mark_released(&mut self, packet_id: &PacketId) {
        if let Some(entry) = self.receipts.iter_mut().find(|r| r.packet_id == *packet_id) {
            entry.state = ReceiptState::Released;
            entry.message = None;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.receipts.clear();
        self.cursor = 0;
    }
}
