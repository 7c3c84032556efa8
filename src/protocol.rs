use crate::packet::{
    QoS,
    decode,
    encode::{self, Encode},
    publish,
};

/// Largest value the remaining length varint can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub(crate) fn validate_flags(&self, flags: u8) -> bool {
        match self {
            Self::Publish => true,
            Self::PubRel | Self::Subscribe | Self::Unsubscribe => flags == 0b0010,
            _ => flags == 0,
        }
    }

    /// Flags nibble mandated for every type except PUBLISH.
    pub(crate) fn reserved_flags(&self) -> u8 {
        match self {
            Self::PubRel | Self::Subscribe | Self::Unsubscribe => 0b0010,
            _ => 0,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let packet_type = match value {
            1 => Self::Connect,
            2 => Self::ConnAck,
            3 => Self::Publish,
            4 => Self::PubAck,
            5 => Self::PubRec,
            6 => Self::PubRel,
            7 => Self::PubComp,
            8 => Self::Subscribe,
            9 => Self::SubAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubAck,
            12 => Self::PingReq,
            13 => Self::PingResp,
            14 => Self::Disconnect,
            _ => return Err(crate::Error::InvalidPacketType),
        };

        Ok(packet_type)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FixedHeader {
    pub packet_type: PacketType,
    /// Only meaningful for PUBLISH.
    pub publish: publish::Flags,
    pub remaining_len: usize,
}

impl FixedHeader {
    pub(crate) fn new(packet_type: PacketType, remaining_len: usize) -> Self {
        Self {
            packet_type,
            publish: publish::Flags::default(),
            remaining_len,
        }
    }

    /// Low nibble of the first byte.
    pub fn flags(&self) -> u8 {
        match self.packet_type {
            PacketType::Publish => (&self.publish).into(),
            other => other.reserved_flags(),
        }
    }

    pub(crate) fn decode(cursor: &mut decode::Cursor<'_>) -> Result<Self, crate::Error> {
        let byte = cursor.read_u8()?;
        let packet_type = PacketType::try_from(byte >> 4)?;
        let flags = byte & 0x0F;

        if !packet_type.validate_flags(flags) {
            return Err(crate::Error::InvalidFlags);
        }

        let remaining_len = cursor.read_remaining_length()?;

        if packet_type != PacketType::Publish {
            return Ok(Self::new(packet_type, remaining_len));
        }

        Ok(Self {
            packet_type,
            publish: publish::Flags {
                dup: flags & 0b1000 != 0,
                qos: QoS::try_from((flags >> 1) & 0b11)?,
                retain: flags & 0b0001 != 0,
            },
            remaining_len,
        })
    }

    pub(crate) fn encode(&self, cursor: &mut encode::Cursor<'_>) -> Result<(), crate::Error> {
        let byte = ((self.packet_type as u8) << 4) | self.flags();
        byte.encode(cursor)?;
        encode::remaining_length(self.remaining_len, cursor)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_follow_standard_assignment() {
        assert_eq!(PacketType::try_from(1).unwrap(), PacketType::Connect);
        assert_eq!(PacketType::try_from(14).unwrap(), PacketType::Disconnect);
        assert!(matches!(
            PacketType::try_from(0),
            Err(crate::Error::InvalidPacketType)
        ));
        assert!(matches!(
            PacketType::try_from(15),
            Err(crate::Error::InvalidPacketType)
        ));
    }

    #[test]
    fn publish_flags_pack_into_low_nibble() {
        let header = FixedHeader {
            packet_type: PacketType::Publish,
            publish: publish::Flags {
                dup: true,
                qos: QoS::ExactlyOnce,
                retain: true,
            },
            remaining_len: 0,
        };

        assert_eq!(header.flags(), 0b1101);
    }

    #[test]
    fn pubrel_with_wrong_flags_is_rejected() {
        let bytes = [0x60, 0x02, 0x00, 0x01];
        let mut cursor = decode::Cursor::new(&bytes);

        assert!(matches!(
            FixedHeader::decode(&mut cursor),
            Err(crate::Error::InvalidFlags)
        ));
    }

    #[test]
    fn publish_with_qos_three_is_rejected() {
        let bytes = [0x36, 0x00];
        let mut cursor = decode::Cursor::new(&bytes);

        assert!(matches!(
            FixedHeader::decode(&mut cursor),
            Err(crate::Error::InvalidQoS)
        ));
    }
}
