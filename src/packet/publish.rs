use crate::{
    packet::{
        PacketId, QoS, decode,
        encode::{self, Encode},
    },
    protocol::{FixedHeader, PacketType},
};

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Publish<'a> {
    pub flags: Flags,
    pub topic: &'a str,
    pub packet_id: Option<PacketId>,
    pub payload: &'a [u8],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Flags {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
}

impl From<&Flags> for u8 {
    fn from(value: &Flags) -> Self {
        (value.dup as u8) << 3 | (value.qos as u8) << 1 | (value.retain as u8)
    }
}

impl<'a> encode::EncodePacket for Publish<'a> {
    const PACKET_TYPE: PacketType = PacketType::Publish;

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.topic.encode(cursor)?;

        match (self.flags.qos, self.packet_id) {
            (QoS::AtMostOnce, None) => {}
            (QoS::AtLeastOnce | QoS::ExactlyOnce, Some(id)) => id.encode(cursor)?,
            _ => return Err(crate::Error::MalformedPacket),
        }

        // no length prefix, the remaining length delimits the payload
        cursor.write_bytes(self.payload)
    }

    fn flags(&self) -> u8 {
        (&self.flags).into()
    }

    fn required_space(&self) -> usize {
        self.topic.required_space()
            + self.packet_id.map(|id| id.required_space()).unwrap_or(0)
            + self.payload.len()
    }
}

impl<'buf> Publish<'buf> {
    pub(crate) fn decode(
        cursor: &mut decode::Cursor<'buf>,
        header: &FixedHeader,
    ) -> Result<Self, crate::Error> {
        let flags = header.publish;

        // @todo this cannot be a topic filter unlike subscribe, so maybe check for allowed chars
        let topic = cursor.read_utf8()?;

        let packet_id = match flags.qos {
            QoS::AtMostOnce => None,
            // id 0 on QoS 1 means deliver without PUBACK
            QoS::AtLeastOnce => PacketId::new(cursor.read_u16()?),
            QoS::ExactlyOnce => Some(PacketId::decode(cursor)?),
        };

        // remaining_len - topic - packet id
        let payload = cursor.read_all();

        Ok(Publish {
            flags,
            topic,
            packet_id,
            payload,
        })
    }
}

/// Application-facing copy of an inbound PUBLISH.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message<const TOPIC: usize, const PAYLOAD: usize> {
    pub topic: heapless::String<TOPIC>,
    pub payload: heapless::Vec<u8, PAYLOAD>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

impl<'a, const TOPIC: usize, const PAYLOAD: usize> TryFrom<&Publish<'a>>
    for Message<TOPIC, PAYLOAD>
{
    type Error = crate::Error;

    fn try_from(value: &Publish<'a>) -> Result<Self, Self::Error> {
        let topic =
            heapless::String::try_from(value.topic).map_err(|_| crate::Error::TopicTooLong)?;
        let payload =
            heapless::Vec::from_slice(value.payload).map_err(|_| crate::Error::PayloadTooLarge)?;

        Ok(Self {
            topic,
            payload,
            qos: value.flags.qos,
            retain: value.flags.retain,
            dup: value.flags.dup,
        })
    }
}
