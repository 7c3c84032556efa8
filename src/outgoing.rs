use embedded_time::{Clock, Instant, duration};
use heapless::{String, Vec};

use crate::packet::{
    Packet, PacketId, QoS,
    publish::{Flags, Publish},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ExchangeState {
    AwaitingPubrec,
    AwaitingPubcomp,
}

/// Snapshot of an outbound PUBLISH kept until it is acknowledged.
pub(crate) struct PendingPublish<C: Clock, const TOPIC: usize, const PAYLOAD: usize> {
    pub(crate) packet_id: PacketId,
    pub(crate) topic: String<TOPIC>,
    pub(crate) payload: Vec<u8, PAYLOAD>,
    pub(crate) retain: bool,
    pub(crate) dup: bool,
    pub(crate) sent_at: Instant<C>,
}

impl<C: Clock, const TOPIC: usize, const PAYLOAD: usize> PendingPublish<C, TOPIC, PAYLOAD> {
    pub(crate) fn try_new(
        packet_id: PacketId,
        topic: &str,
        payload: &[u8],
        retain: bool,
        now: Instant<C>,
    ) -> Result<Self, crate::Error> {
        Ok(Self {
            packet_id,
            topic: String::try_from(topic).map_err(|_| crate::Error::TopicTooLong)?,
            payload: Vec::from_slice(payload).map_err(|_| crate::Error::PayloadTooLarge)?,
            retain,
            dup: false,
            sent_at: now,
        })
    }

    pub(crate) fn as_packet(&self, qos: QoS) -> Packet<'_> {
        Packet::Publish(Publish {
            flags: Flags {
                dup: self.dup,
                qos,
                retain: self.retain,
            },
            topic: self.topic.as_str(),
            packet_id: Some(self.packet_id),
            payload: self.payload.as_slice(),
        })
    }
}

pub(crate) struct PendingExchange<C: Clock, const TOPIC: usize, const PAYLOAD: usize> {
    pub(crate) publish: PendingPublish<C, TOPIC, PAYLOAD>,
    pub(crate) state: ExchangeState,
}

pub(crate) enum Pending<C: Clock, const TOPIC: usize, const PAYLOAD: usize> {
    AtLeastOnce(PendingPublish<C, TOPIC, PAYLOAD>),
    ExactlyOnce(PendingExchange<C, TOPIC, PAYLOAD>),
}

impl<C: Clock, const TOPIC: usize, const PAYLOAD: usize> Pending<C, TOPIC, PAYLOAD> {
    pub(crate) fn packet_id(&self) -> PacketId {
        match self {
            Self::AtLeastOnce(publish) => publish.packet_id,
            Self::ExactlyOnce(exchange) => exchange.publish.packet_id,
        }
    }
}

/// Outbound QoS 1 and QoS 2 publishes in the order they were first sent.
pub(crate) struct Outgoing<C: Clock, const N: usize, const TOPIC: usize, const PAYLOAD: usize> {
    pending: Vec<Pending<C, TOPIC, PAYLOAD>, N>,
}

impl<C: Clock, const N: usize, const TOPIC: usize, const PAYLOAD: usize>
    Outgoing<C, N, TOPIC, PAYLOAD>
{
    pub(crate) fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    pub(crate) fn track(&mut self, entry: Pending<C, TOPIC, PAYLOAD>) -> Result<(), crate::Error> {
        self.pending
            .push(entry)
            .map_err(|_| crate::Error::VectorIsFull)
    }

    pub(crate) fn get(&self, packet_id: &PacketId) -> Option<&Pending<C, TOPIC, PAYLOAD>> {
        self.pending.iter().find(|p| p.packet_id() == *packet_id)
    }

    pub(crate) fn remove(&mut self, packet_id: &PacketId) -> Option<Pending<C, TOPIC, PAYLOAD>> {
        let index = self
            .pending
            .iter()
            .position(|p| p.packet_id() == *packet_id)?;

        Some(self.pending.remove(index))
    }

    /// PUBACK completes a QoS 1 entry only.
    pub(crate) fn on_puback(&mut self, packet_id: &PacketId) -> bool {
        match self.get(packet_id) {
            Some(Pending::AtLeastOnce(_)) => self.remove(packet_id).is_some(),
            _ => false,
        }
    }

    /// Returns true when a PUBREL has to go out for `packet_id`.
    pub(crate) fn on_pubrec(&mut self, packet_id: &PacketId, now: Instant<C>) -> bool {
        let exchange = self.pending.iter_mut().find_map(|p| match p {
            Pending::ExactlyOnce(exchange) if exchange.publish.packet_id == *packet_id => {
                Some(exchange)
            }
            _ => None,
        });

        match exchange {
            Some(exchange) => {
                exchange.state = ExchangeState::AwaitingPubcomp;
                exchange.publish.sent_at = now;
                true
            }
            None => false,
        }
    }

    /// PUBCOMP completes a QoS 2 entry once PUBREL went out.
    pub(crate) fn on_pubcomp(&mut self, packet_id: &PacketId) -> bool {
        match self.get(packet_id) {
            Some(Pending::ExactlyOnce(exchange))
                if exchange.state == ExchangeState::AwaitingPubcomp =>
            {
                self.remove(packet_id).is_some()
            }
            _ => false,
        }
    }

    /// Re-sends every entry that waited at least `interval`: PUBLISH with DUP
    /// set, or PUBREL once PUBREC arrived.
    pub(crate) fn retransmit_expired<F>(
        &mut self,
        now: Instant<C>,
        interval: duration::Generic<C::T>,
        mut send: F,
    ) -> Result<usize, crate::Error>
    where
        F: FnMut(&Packet<'_>) -> Result<(), crate::Error>,
    {
        let mut count = 0;

        for entry in self.pending.iter_mut() {
            let (publish, qos, state) = match entry {
                Pending::AtLeastOnce(publish) => (publish, QoS::AtLeastOnce, None),
                Pending::ExactlyOnce(exchange) => (
                    &mut exchange.publish,
                    QoS::ExactlyOnce,
                    Some(exchange.state),
                ),
            };

            let expired = now
                .checked_duration_since(&publish.sent_at)
                .map(|elapsed| elapsed >= interval)
                .unwrap_or(false);

            if !expired {
                continue;
            }

            match state {
                Some(ExchangeState::AwaitingPubcomp) => send(&Packet::PubRel(publish.packet_id))?,
                _ => {
                    publish.dup = true;
                    send(&publish.as_packet(qos))?;
                }
            }

            publish.sent_at = now;
            count += 1;
        }

        Ok(count)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Empties the table, handing every dropped identifier to `f`.
    pub(crate) fn drain<F: FnMut(PacketId)>(&mut self, mut f: F) {
        for entry in self.pending.iter() {
            f(entry.packet_id());
        }

        self.pending.clear();
    }
}
