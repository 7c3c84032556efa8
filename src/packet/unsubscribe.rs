use heapless::Vec;

use crate::{
    packet::{
        MAX_FILTERS, PacketId, decode,
        encode::{self, Encode},
    },
    protocol::PacketType,
};

/// Topic filters are kept in order, duplicates included.
#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Unsubscribe<'a, const N: usize = MAX_FILTERS> {
    pub packet_id: PacketId,
    pub topics: Vec<&'a str, N>,
}

impl<'a, const N: usize> Unsubscribe<'a, N> {
    pub(crate) fn new(packet_id: PacketId, filters: &[&'a str]) -> Result<Self, crate::Error> {
        if filters.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        let topics = Vec::from_slice(filters).map_err(|_| crate::Error::VectorIsFull)?;

        Ok(Self { packet_id, topics })
    }

    pub(crate) fn decode(cursor: &mut decode::Cursor<'a>) -> Result<Self, crate::Error> {
        let packet_id = PacketId::decode(cursor)?;

        let mut topics = Vec::new();

        while !cursor.is_empty() {
            let topic = cursor.read_utf8()?;
            topics.push(topic).map_err(|_| crate::Error::VectorIsFull)?;
        }

        if topics.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        Ok(Unsubscribe { packet_id, topics })
    }
}

impl<'a, const N: usize> encode::EncodePacket for Unsubscribe<'a, N> {
    const PACKET_TYPE: PacketType = PacketType::Unsubscribe;

    fn required_space(&self) -> usize {
        let mut required = self.packet_id.required_space();

        for topic in &self.topics {
            required += topic.required_space();
        }

        required
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        if self.topics.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        self.packet_id.encode(cursor)?;

        for topic in &self.topics {
            topic.encode(cursor)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::packet::encode::EncodePacket;

    use super::*;

    #[test]
    fn keeps_order_and_duplicates() {
        let id = PacketId::new(9).unwrap();
        let packet = Unsubscribe::<4>::new(id, &["b", "a", "b"]).unwrap();

        let mut buf = [0u8; 32];
        let mut cursor = encode::Cursor::new(&mut buf);
        packet.encode_body(&mut cursor).unwrap();

        assert_eq!(
            cursor.written(),
            &[0x00, 0x09, 0x00, 0x01, b'b', 0x00, 0x01, b'a', 0x00, 0x01, b'b']
        );

        let len = cursor.written().len();
        let mut cursor = decode::Cursor::new(&buf[..len]);
        let decoded = Unsubscribe::<4>::decode(&mut cursor).unwrap();
        assert_eq!(decoded.topics.as_slice(), &["b", "a", "b"]);
    }

    #[test]
    fn requires_at_least_one_filter() {
        let id = PacketId::new(1).unwrap();

        assert!(matches!(
            Unsubscribe::<4>::new(id, &[]),
            Err(crate::Error::MalformedPacket)
        ));

        let body = [0x00, 0x01];
        let mut cursor = decode::Cursor::new(&body);
        assert!(matches!(
            Unsubscribe::<4>::decode(&mut cursor),
            Err(crate::Error::MalformedPacket)
        ));
    }

    #[test]
    fn too_many_filters() {
        let id = PacketId::new(1).unwrap();

        assert!(matches!(
            Unsubscribe::<2>::new(id, &["a", "b", "c"]),
            Err(crate::Error::VectorIsFull)
        ));
    }
}
