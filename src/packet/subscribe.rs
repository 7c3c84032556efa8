use heapless::Vec;

use crate::{
    packet::{
        MAX_FILTERS, PacketId, QoS, decode,
        encode::{self, Encode},
    },
    protocol::PacketType,
};

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Subscribe<'a, const N: usize = MAX_FILTERS> {
    pub packet_id: PacketId,
    pub topics: Vec<Subscription<'a>, N>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Subscription<'a> {
    pub topic_filter: &'a str,
    pub qos: QoS,
}

impl<'a, const N: usize> Subscribe<'a, N> {
    pub(crate) fn decode(cursor: &mut decode::Cursor<'a>) -> Result<Self, crate::Error> {
        let packet_id = PacketId::decode(cursor)?;

        let mut topics = Vec::new();

        while !cursor.is_empty() {
            let topic_filter = cursor.read_utf8()?;
            let qos = QoS::try_from(cursor.read_u8()?)?;

            topics
                .push(Subscription { topic_filter, qos })
                .map_err(|_| crate::Error::VectorIsFull)?;
        }

        if topics.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        Ok(Subscribe { packet_id, topics })
    }
}

impl<'a, const N: usize> encode::EncodePacket for Subscribe<'a, N> {
    const PACKET_TYPE: PacketType = PacketType::Subscribe;

    fn required_space(&self) -> usize {
        self.packet_id.required_space()
            + self
                .topics
                .iter()
                .map(|sub| sub.topic_filter.required_space() + sub.qos.required_space())
                .sum::<usize>()
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        if self.topics.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        self.packet_id.encode(cursor)?;

        for sub in &self.topics {
            sub.topic_filter.encode(cursor)?;
            sub.qos.encode(cursor)?;
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubAckReturnCode {
    Granted(QoS),
    Failure,
}

impl TryFrom<u8> for SubAckReturnCode {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x80 => Ok(Self::Failure),
            qos => QoS::try_from(qos)
                .map(Self::Granted)
                .map_err(|_| crate::Error::MalformedPacket),
        }
    }
}

impl From<SubAckReturnCode> for u8 {
    fn from(value: SubAckReturnCode) -> Self {
        match value {
            SubAckReturnCode::Granted(qos) => qos as u8,
            SubAckReturnCode::Failure => 0x80,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SubAck<const N: usize = MAX_FILTERS> {
    pub packet_id: PacketId,
    pub return_codes: Vec<SubAckReturnCode, N>,
}

impl<const N: usize> SubAck<N> {
    pub(crate) fn decode(cursor: &mut decode::Cursor) -> Result<Self, crate::Error> {
        let packet_id = PacketId::decode(cursor)?;

        let mut return_codes = Vec::new();

        while !cursor.is_empty() {
            let code = SubAckReturnCode::try_from(cursor.read_u8()?)?;

            return_codes
                .push(code)
                .map_err(|_| crate::Error::VectorIsFull)?;
        }

        if return_codes.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        Ok(SubAck {
            packet_id,
            return_codes,
        })
    }
}

impl<const N: usize> encode::EncodePacket for SubAck<N> {
    const PACKET_TYPE: PacketType = PacketType::SubAck;

    fn required_space(&self) -> usize {
        self.packet_id.required_space() + self.return_codes.len()
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.packet_id.encode(cursor)?;

        for code in &self.return_codes {
            u8::from(*code).encode(cursor)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_subscribe_filters_in_order() {
        let body = [
            0x00, 0x0A, // packet id
            0x00, 0x03, b'a', b'/', b'b', 0x01, // "a/b" QoS 1
            0x00, 0x01, b'#', 0x02, // "#" QoS 2
        ];
        let mut cursor = decode::Cursor::new(&body);
        let packet = Subscribe::<4>::decode(&mut cursor).unwrap();

        assert_eq!(packet.packet_id.get(), 10);
        assert_eq!(packet.topics.len(), 2);
        assert_eq!(packet.topics[0].topic_filter, "a/b");
        assert_eq!(packet.topics[0].qos, QoS::AtLeastOnce);
        assert_eq!(packet.topics[1].topic_filter, "#");
        assert_eq!(packet.topics[1].qos, QoS::ExactlyOnce);
    }

    #[test]
    fn subscribe_without_filters_is_malformed() {
        let body = [0x00, 0x0A];
        let mut cursor = decode::Cursor::new(&body);

        assert!(matches!(
            Subscribe::<4>::decode(&mut cursor),
            Err(crate::Error::MalformedPacket)
        ));
    }

    #[test]
    fn suback_return_codes() {
        let body = [0x00, 0x01, 0x00, 0x02, 0x80];
        let mut cursor = decode::Cursor::new(&body);
        let packet = SubAck::<4>::decode(&mut cursor).unwrap();

        assert_eq!(
            packet.return_codes.as_slice(),
            &[
                SubAckReturnCode::Granted(QoS::AtMostOnce),
                SubAckReturnCode::Granted(QoS::ExactlyOnce),
                SubAckReturnCode::Failure,
            ]
        );
    }

    #[test]
    fn suback_invalid_return_code() {
        let body = [0x00, 0x01, 0x03];
        let mut cursor = decode::Cursor::new(&body);

        assert!(SubAck::<4>::decode(&mut cursor).is_err());
    }
}
