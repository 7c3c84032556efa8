use crate::{
    packet::{
        connect::{ConnAck, Connect},
        encode::{Encode, EncodePacket},
        publish::Publish,
        subscribe::{SubAck, Subscribe},
        unsubscribe::Unsubscribe,
    },
    protocol::{FixedHeader, PacketType},
};

pub mod connect;
pub mod decode;
pub mod encode;
pub mod publish;
pub mod subscribe;
pub mod unsubscribe;

/// Topic filters carried by a single SUBSCRIBE/UNSUBSCRIBE/SUBACK.
pub const MAX_FILTERS: usize = 8;

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Packet<'a> {
    Connect(Connect<'a>),
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PubAck(PacketId),
    PubRec(PacketId),
    PubRel(PacketId),
    PubComp(PacketId),
    Subscribe(Subscribe<'a>),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe<'a>),
    UnsubAck(PacketId),
    PingReq,
    PingResp,
    Disconnect,
}

impl<'buf> Packet<'buf> {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect => PacketType::Disconnect,
        }
    }

    /// Writes the complete frame, fixed header included.
    pub fn encode(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        match self {
            Self::Connect(packet) => encode_packet(packet, cursor),
            Self::ConnAck(packet) => encode_packet(packet, cursor),
            Self::Publish(packet) => encode_packet(packet, cursor),
            Self::Subscribe(packet) => encode_packet(packet, cursor),
            Self::SubAck(packet) => encode_packet(packet, cursor),
            Self::Unsubscribe(packet) => encode_packet(packet, cursor),
            Self::PubAck(id)
            | Self::PubRec(id)
            | Self::PubRel(id)
            | Self::PubComp(id)
            | Self::UnsubAck(id) => only_packet_id_body(cursor, self.packet_type(), id),
            Self::PingReq | Self::PingResp | Self::Disconnect => {
                FixedHeader::new(self.packet_type(), 0).encode(cursor)
            }
        }
    }

    /// Size of the encoded frame.
    pub fn required_space(&self) -> Result<usize, crate::Error> {
        let body = match self {
            Self::Connect(packet) => packet.required_space(),
            Self::ConnAck(packet) => packet.required_space(),
            Self::Publish(packet) => packet.required_space(),
            Self::Subscribe(packet) => packet.required_space(),
            Self::SubAck(packet) => packet.required_space(),
            Self::Unsubscribe(packet) => packet.required_space(),
            Self::PubAck(_)
            | Self::PubRec(_)
            | Self::PubRel(_)
            | Self::PubComp(_)
            | Self::UnsubAck(_) => 2,
            Self::PingReq | Self::PingResp | Self::Disconnect => 0,
        };

        Ok(1 + encode::calculate_remaining_length(body)? + body)
    }

    /// Decodes exactly one complete frame.
    pub fn decode(bytes: &'buf [u8]) -> Result<Self, crate::Error> {
        let cursor = &mut decode::Cursor::new(bytes);
        let header = FixedHeader::decode(cursor)?;

        if cursor.remaining() < header.remaining_len {
            return Err(crate::Error::UnexpectedEof);
        }

        if cursor.remaining() > header.remaining_len {
            return Err(crate::Error::MalformedRemainingLength);
        }

        Self::decode_body(&header, cursor.read_all())
    }

    pub(crate) fn decode_body(header: &FixedHeader, body: &'buf [u8]) -> Result<Self, crate::Error> {
        let cursor = &mut decode::Cursor::new(body);

        match header.packet_type {
            PacketType::Connect => Connect::decode(cursor).map(Packet::Connect),
            PacketType::ConnAck => ConnAck::decode(cursor).map(Packet::ConnAck),
            PacketType::Publish => Publish::decode(cursor, header).map(Packet::Publish),
            PacketType::PubAck => only_packet_id(cursor).map(Packet::PubAck),
            PacketType::PubRec => only_packet_id(cursor).map(Packet::PubRec),
            PacketType::PubRel => only_packet_id(cursor).map(Packet::PubRel),
            PacketType::PubComp => only_packet_id(cursor).map(Packet::PubComp),
            PacketType::Subscribe => Subscribe::decode(cursor).map(Packet::Subscribe),
            PacketType::SubAck => SubAck::decode(cursor).map(Packet::SubAck),
            PacketType::Unsubscribe => Unsubscribe::decode(cursor).map(Packet::Unsubscribe),
            PacketType::UnsubAck => only_packet_id(cursor).map(Packet::UnsubAck),
            PacketType::PingReq => cursor.expect_empty().map(|_| Packet::PingReq),
            PacketType::PingResp => cursor.expect_empty().map(|_| Packet::PingResp),
            PacketType::Disconnect => cursor.expect_empty().map(|_| Packet::Disconnect),
        }
    }
}

fn encode_packet<P: EncodePacket>(
    packet: &P,
    cursor: &mut encode::Cursor<'_>,
) -> Result<(), crate::Error> {
    // fails before anything is written when the body is too large
    let len = packet.required_space();
    encode::calculate_remaining_length(len)?;

    let header = ((P::PACKET_TYPE as u8) << 4) | (packet.flags() & 0x0F);
    cursor.write_u8(header)?;

    encode::remaining_length(len, cursor)?;

    packet.encode_body(cursor)
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let qos = match value {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            2 => Self::ExactlyOnce,
            _ => return Err(crate::Error::InvalidQoS),
        };

        Ok(qos)
    }
}

impl Encode for QoS {
    fn encode(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        (*self as u8).encode(cursor)
    }

    fn required_space(&self) -> usize {
        1
    }
}

/// Non-zero packet identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PacketId(pub(crate) u16);

impl PacketId {
    pub const fn new(id: u16) -> Option<Self> {
        if id == 0 { None } else { Some(Self(id)) }
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    fn decode(cursor: &mut decode::Cursor) -> Result<Self, crate::Error> {
        Self::try_from(cursor.read_u16()?)
    }
}

impl TryFrom<u16> for PacketId {
    type Error = crate::Error;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        Self::new(id).ok_or(crate::Error::MalformedPacket)
    }
}

impl Encode for PacketId {
    fn encode(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.0.encode(cursor)
    }

    fn required_space(&self) -> usize {
        2
    }
}

fn only_packet_id(cursor: &mut decode::Cursor<'_>) -> Result<PacketId, crate::Error> {
    let packet_id = PacketId::decode(cursor)?;
    cursor.expect_empty()?;
    Ok(packet_id)
}

fn only_packet_id_body(
    cursor: &mut encode::Cursor,
    packet_type: PacketType,
    packet_id: &PacketId,
) -> Result<(), crate::Error> {
    FixedHeader::new(packet_type, 2).encode(cursor)?;
    packet_id.encode(cursor)
}

#[cfg(test)]
mod tests {
    use heapless::Vec;

    use super::*;
    use crate::packet::{
        connect::{ConnectReturnCode, Will},
        publish::Flags,
        subscribe::{SubAckReturnCode, Subscription},
    };

    fn roundtrip(packet: &Packet<'_>, buf: &mut [u8]) -> usize {
        let mut cursor = encode::Cursor::new(buf);
        packet.encode(&mut cursor).unwrap();
        let len = cursor.written().len();
        assert_eq!(len, packet.required_space().unwrap());

        let decoded = Packet::decode(&buf[..len]).unwrap();
        assert_eq!(&decoded, packet);
        len
    }

    fn id(value: u16) -> PacketId {
        PacketId::new(value).unwrap()
    }

    #[test]
    fn roundtrip_every_variant() {
        let mut buf = [0u8; 512];

        let mut filters = Vec::new();
        filters
            .push(Subscription {
                topic_filter: "a/+",
                qos: QoS::ExactlyOnce,
            })
            .unwrap();
        filters
            .push(Subscription {
                topic_filter: "b/#",
                qos: QoS::AtMostOnce,
            })
            .unwrap();

        let mut codes = Vec::new();
        codes.push(SubAckReturnCode::Granted(QoS::AtLeastOnce)).unwrap();
        codes.push(SubAckReturnCode::Failure).unwrap();

        let mut unsub = Vec::new();
        unsub.push("a/+").unwrap();
        unsub.push("a/+").unwrap();
        unsub.push("c").unwrap();

        let packets = [
            Packet::Connect(Connect {
                clean_session: true,
                keep_alive: 30,
                client_id: "client",
                will: Some(Will {
                    qos: QoS::AtLeastOnce,
                    retain: false,
                    topic: "last/will",
                    payload: b"bye",
                }),
                username: Some("user"),
                password: Some(b"secret"),
            }),
            Packet::ConnAck(ConnAck {
                session_present: true,
                return_code: ConnectReturnCode::Accepted,
            }),
            Packet::ConnAck(ConnAck {
                session_present: false,
                return_code: ConnectReturnCode::NotAuthorized,
            }),
            Packet::Publish(Publish {
                flags: Flags::default(),
                topic: "t",
                packet_id: None,
                payload: b"",
            }),
            Packet::Publish(Publish {
                flags: Flags {
                    dup: true,
                    qos: QoS::AtLeastOnce,
                    retain: true,
                },
                topic: "sensors/1",
                packet_id: Some(id(7)),
                payload: b"21.5",
            }),
            Packet::Publish(Publish {
                flags: Flags {
                    dup: false,
                    qos: QoS::ExactlyOnce,
                    retain: false,
                },
                topic: "sensors/2",
                packet_id: Some(id(u16::MAX)),
                payload: &[0u8; 200],
            }),
            Packet::PubAck(id(1)),
            Packet::PubRec(id(2)),
            Packet::PubRel(id(3)),
            Packet::PubComp(id(4)),
            Packet::Subscribe(Subscribe {
                packet_id: id(5),
                topics: filters,
            }),
            Packet::SubAck(SubAck {
                packet_id: id(5),
                return_codes: codes,
            }),
            Packet::Unsubscribe(Unsubscribe {
                packet_id: id(6),
                topics: unsub,
            }),
            Packet::UnsubAck(id(6)),
            Packet::PingReq,
            Packet::PingResp,
            Packet::Disconnect,
        ];

        for packet in &packets {
            roundtrip(packet, &mut buf);
        }
    }

    #[test]
    fn roundtrip_maximum_length_topic() {
        let topic = [b'x'; u16::MAX as usize];
        let topic = core::str::from_utf8(&topic).unwrap();
        let packet = Packet::Publish(Publish {
            flags: Flags::default(),
            topic,
            packet_id: None,
            payload: b"p",
        });

        let mut buf = std::vec![0u8; u16::MAX as usize + 16];
        let len = roundtrip(&packet, &mut buf);

        // 1 type byte, 3 length bytes, 2 + 65535 topic, 1 payload
        assert_eq!(len, 1 + 3 + 2 + u16::MAX as usize + 1);
    }

    #[test]
    fn pingreq_wire_format() {
        let mut buf = [0u8; 2];
        let mut cursor = encode::Cursor::new(&mut buf);
        Packet::PingReq.encode(&mut cursor).unwrap();

        assert_eq!(cursor.written(), &[0xC0, 0x00]);
    }

    #[test]
    fn pubrel_carries_reserved_flags() {
        let mut buf = [0u8; 4];
        let mut cursor = encode::Cursor::new(&mut buf);
        Packet::PubRel(id(0x0102)).encode(&mut cursor).unwrap();

        assert_eq!(cursor.written(), &[0x62, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let bytes = [0x40, 0x02, 0x00];

        assert!(matches!(
            Packet::decode(&bytes),
            Err(crate::Error::UnexpectedEof)
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let bytes = [0x40, 0x02, 0x00, 0x01, 0xFF];

        assert!(matches!(
            Packet::decode(&bytes),
            Err(crate::Error::MalformedRemainingLength)
        ));
    }

    #[test]
    fn inconsistent_ack_length_is_rejected() {
        let bytes = [0x40, 0x03, 0x00, 0x01, 0x00];

        assert!(matches!(
            Packet::decode(&bytes),
            Err(crate::Error::MalformedPacket)
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(matches!(
            Packet::decode(&[0xF0, 0x00]),
            Err(crate::Error::InvalidPacketType)
        ));
        assert!(matches!(
            Packet::decode(&[0x00, 0x00]),
            Err(crate::Error::InvalidPacketType)
        ));
    }

    #[test]
    fn zero_packet_id_is_rejected() {
        assert!(matches!(
            Packet::decode(&[0x40, 0x02, 0x00, 0x00]),
            Err(crate::Error::MalformedPacket)
        ));
    }

    #[test]
    fn non_empty_pingresp_is_rejected() {
        assert!(Packet::decode(&[0xD0, 0x01, 0x00]).is_err());
    }
}
