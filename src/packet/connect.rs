use crate::{
    packet::{
        QoS, decode,
        encode::{self, Encode},
    },
    protocol::PacketType,
};

const PROTOCOL_NAME: &str = "MQTT";
// @note: MQTT v3.1.1
const PROTOCOL_LEVEL: u8 = 4;

/// Connection parameters used to build the CONNECT packet.
#[derive(Clone, Debug)]
pub struct Options<'a> {
    pub clean_session: bool,
    /// Seconds, 0 disables keep-alive.
    pub keep_alive: u16,
    pub client_id: &'a str,
    pub will: Option<WillOptions<'a>>,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

impl<'a> Options<'a> {
    pub fn new(client_id: &'a str) -> Self {
        Self {
            clean_session: true,
            keep_alive: 60,
            client_id,
            will: None,
            username: None,
            password: None,
        }
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    pub fn credentials(mut self, username: &'a str, password: &'a [u8]) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }

    pub fn will(mut self, will: WillOptions<'a>) -> Self {
        self.will = Some(will);
        self
    }
}

#[derive(Clone, Debug)]
pub struct WillOptions<'a> {
    pub qos: QoS,
    pub retain: bool,
    pub topic: &'a str,
    pub payload: &'a [u8],
}

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Connect<'a> {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: &'a str,
    pub will: Option<Will<'a>>,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

impl<'a> From<&Options<'a>> for Connect<'a> {
    fn from(value: &Options<'a>) -> Self {
        Self {
            clean_session: value.clean_session,
            keep_alive: value.keep_alive,
            client_id: value.client_id,
            will: value.will.as_ref().map(|will| Will {
                qos: will.qos,
                retain: will.retain,
                topic: will.topic,
                payload: will.payload,
            }),
            username: value.username,
            // a password without a username is not representable in 3.1.1
            password: value.username.and(value.password),
        }
    }
}

impl<'buf> Connect<'buf> {
    pub(crate) fn decode(cursor: &mut decode::Cursor<'buf>) -> Result<Self, crate::Error> {
        let protocol_name = cursor.read_utf8()?;
        if protocol_name != PROTOCOL_NAME {
            return Err(crate::Error::MalformedPacket);
        }

        let level = cursor.read_u8()?;
        if level != PROTOCOL_LEVEL {
            return Err(crate::Error::MalformedPacket);
        }

        let flags = cursor.read_u8()?;
        if flags & 0b0000_0001 != 0 {
            return Err(crate::Error::MalformedPacket);
        }

        let clean_session = flags & 0b0000_0010 != 0;
        let will_flag = flags & 0b0000_0100 != 0;
        let qos = QoS::try_from((flags >> 3) & 0b11)?;
        let retain = flags & 0b0010_0000 != 0;
        let password_flag = flags & 0b0100_0000 != 0;
        let username_flag = flags & 0b1000_0000 != 0;

        if !will_flag && (retain || qos != QoS::AtMostOnce) {
            return Err(crate::Error::MalformedPacket);
        }

        if password_flag && !username_flag {
            return Err(crate::Error::MalformedPacket);
        }

        let keep_alive = cursor.read_u16()?;
        let client_id = cursor.read_utf8()?;

        let will = if will_flag {
            Some(Will {
                topic: cursor.read_utf8()?,
                payload: cursor.read_binary_chunk()?,
                qos,
                retain,
            })
        } else {
            None
        };

        let username = if username_flag {
            Some(cursor.read_utf8()?)
        } else {
            None
        };

        let password = if password_flag {
            Some(cursor.read_binary_chunk()?)
        } else {
            None
        };

        cursor.expect_empty()?;

        Ok(Connect {
            clean_session,
            keep_alive,
            client_id,
            will,
            username,
            password,
        })
    }

    fn connect_flags(&self) -> u8 {
        (self.username.is_some() as u8) << 7
            | (self.password.is_some() as u8) << 6
            | (self.will.as_ref().map(|w| w.retain).unwrap_or(false) as u8) << 5
            | self.will.as_ref().map(|w| w.qos as u8).unwrap_or(0) << 3 // 2 bits
            | (self.will.is_some() as u8) << 2
            | (self.clean_session as u8) << 1
    }
}

impl<'buf> encode::EncodePacket for Connect<'buf> {
    const PACKET_TYPE: PacketType = PacketType::Connect;

    fn required_space(&self) -> usize {
        let mut required = PROTOCOL_NAME.required_space()
            + PROTOCOL_LEVEL.required_space()
            + 0u8.required_space()
            + self.keep_alive.required_space()
            + self.client_id.required_space();

        if let Some(will) = &self.will {
            required += will.topic.required_space();
            required += will.payload.required_space();
        }

        if let Some(username) = &self.username {
            required += username.required_space();
        }

        if let Some(password) = &self.password {
            required += password.required_space();
        }

        required
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        PROTOCOL_NAME.encode(cursor)?;
        PROTOCOL_LEVEL.encode(cursor)?;

        self.connect_flags().encode(cursor)?;
        self.keep_alive.encode(cursor)?;
        self.client_id.encode(cursor)?;

        if let Some(will) = &self.will {
            will.topic.encode(cursor)?;
            will.payload.encode(cursor)?;
        }

        if let Some(username) = &self.username {
            username.encode(cursor)?;
        }

        if let Some(password) = &self.password {
            password.encode(cursor)?;
        }

        Ok(())
    }
}

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Will<'a> {
    pub qos: QoS,
    pub retain: bool,
    pub topic: &'a str,
    pub payload: &'a [u8],
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    pub(crate) fn decode(cursor: &mut decode::Cursor) -> Result<Self, crate::Error> {
        let flags = cursor.read_u8()?;

        if flags & 0b1111_1110 != 0 {
            return Err(crate::Error::MalformedPacket);
        }

        let return_code = ConnectReturnCode::try_from(cursor.read_u8()?)?;
        let session_present = (flags & 0b0000_0001) != 0;

        if return_code != ConnectReturnCode::Accepted && session_present {
            return Err(crate::Error::MalformedPacket);
        }

        cursor.expect_empty()?;

        Ok(ConnAck {
            return_code,
            session_present,
        })
    }
}

impl encode::EncodePacket for ConnAck {
    const PACKET_TYPE: PacketType = PacketType::ConnAck;

    fn required_space(&self) -> usize {
        2
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        (self.session_present as u8).encode(cursor)?;
        (self.return_code as u8).encode(cursor)
    }
}

// @note: for MQTT 5.0 it is a whole another story
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => return Err(crate::Error::InvalidConnectReturnCode),
        };

        Ok(code)
    }
}

/// Result of one connection attempt, resolved exactly once.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectOutcome {
    Accepted { session_present: bool },
    Refused(ConnectReturnCode),
    /// The attempt ended before a CONNACK was processed.
    Failed(crate::Error),
}

impl ConnectOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn return_code(&self) -> ConnectReturnCode {
        match self {
            Self::Accepted { .. } => ConnectReturnCode::Accepted,
            Self::Refused(code) => *code,
            Self::Failed(_) => ConnectReturnCode::ServerUnavailable,
        }
    }
}

impl From<&ConnAck> for ConnectOutcome {
    fn from(value: &ConnAck) -> Self {
        match value.return_code {
            ConnectReturnCode::Accepted => Self::Accepted {
                session_present: value.session_present,
            },
            code => Self::Refused(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::packet::encode::EncodePacket;

    use super::*;

    #[test]
    fn connack_accepted() {
        let body = [0x00, 0x00];
        let mut cursor = decode::Cursor::new(&body);
        let packet = ConnAck::decode(&mut cursor).unwrap();

        assert!(matches!(
            packet,
            ConnAck {
                session_present: false,
                return_code: ConnectReturnCode::Accepted
            }
        ));
    }

    #[test]
    fn connack_invalid_flags() {
        let body = [0b0000_0010, 0x00];
        let mut cursor = decode::Cursor::new(&body);
        assert!(ConnAck::decode(&mut cursor).is_err());
    }

    #[test]
    fn connack_refused_with_session_present() {
        let body = [0x01, 0x05];
        let mut cursor = decode::Cursor::new(&body);
        assert!(ConnAck::decode(&mut cursor).is_err());
    }

    #[test]
    fn connack_unknown_return_code() {
        let body = [0x00, 0x06];
        let mut cursor = decode::Cursor::new(&body);

        assert!(matches!(
            ConnAck::decode(&mut cursor),
            Err(crate::Error::InvalidConnectReturnCode)
        ));
    }

    #[test]
    fn connect_encode_flags() {
        let connect = Connect::from(&Options::new("Client").keep_alive(60));

        let mut buf = [0u8; 32];
        let mut cursor = encode::Cursor::new(&mut buf);
        connect.encode_body(&mut cursor).unwrap();

        // [
        //   0, 4,   77, 81, 84, 84,    // "MQTT"
        //   4,                         // MQTT version
        //   2,                         // Flags
        //   0, 60,                     // keep_alive
        //   0, 6,   67, 108, 105, 101, 110, 116    // "Client"
        // ]
        assert_eq!(cursor.written().len(), 18);
        assert_eq!(connect.required_space(), 18);
        assert_eq!(&buf[2..6], b"MQTT");
        assert_eq!(buf[6], 4);
        assert_eq!(buf[7], 0b0000_0010);
        assert_eq!(u16::from_be_bytes([buf[8], buf[9]]), 60);

        let len = u16::from_be_bytes([buf[10], buf[11]]) as usize;
        assert_eq!(&buf[12..12 + len], b"Client");
    }

    #[test]
    fn connect_encode_with_will_username_password() {
        let options = Options::new("Client 2")
            .clean_session(false)
            .keep_alive(120)
            .credentials("user 1", b"long-pass")
            .will(WillOptions {
                topic: "topic1",
                payload: b"heavy-load",
                qos: QoS::AtLeastOnce,
                retain: true,
            });
        let connect = Connect::from(&options);

        let mut buf = [0u8; 64];
        let mut cursor = encode::Cursor::new(&mut buf);
        connect.encode_body(&mut cursor).unwrap();

        //  [
        //    0, 4,   77, 81, 84, 84,   // "MQTT"
        //    4,                        // MQTT version
        //    236,                      // Flags
        //    0, 120,                   // keep_alive
        //    0, 8,   67, 108, 105, 101, 110, 116, 32, 50,              // "Client 2"
        //    0, 6,   116, 111, 112, 105, 99, 49,                       // "topic1"
        //    0, 10,  104, 101, 97, 118, 121, 45, 108, 111, 97, 100,    // "heavy-load"
        //    0, 6,   117, 115, 101, 114, 32, 49,                       // "user 1"
        //    0, 9,   108, 111, 110, 103, 45, 112, 97, 115, 115         // "long-pass"
        //  ]

        assert_eq!(cursor.written().len(), 59);

        assert_eq!(buf[7], 0b1110_1100);
        assert_eq!(u16::from_be_bytes([buf[8], buf[9]]), 120);

        let len = u16::from_be_bytes([buf[10], buf[11]]) as usize;
        assert_eq!(&buf[12..12 + len], b"Client 2");

        let len = u16::from_be_bytes([buf[20], buf[21]]) as usize;
        assert_eq!(&buf[22..22 + len], b"topic1");

        let len = u16::from_be_bytes([buf[28], buf[29]]) as usize;
        assert_eq!(&buf[30..30 + len], b"heavy-load");

        let len = u16::from_be_bytes([buf[40], buf[41]]) as usize;
        assert_eq!(&buf[42..42 + len], b"user 1");

        let len = u16::from_be_bytes([buf[48], buf[49]]) as usize;
        assert_eq!(&buf[50..50 + len], b"long-pass");
    }

    #[test]
    fn connect_without_credentials_omits_fields() {
        let options = Options::new("c").will(WillOptions {
            topic: "w",
            payload: b"",
            qos: QoS::AtMostOnce,
            retain: false,
        });
        let connect = Connect::from(&options);

        let mut buf = [0u8; 32];
        let mut cursor = encode::Cursor::new(&mut buf);
        connect.encode_body(&mut cursor).unwrap();

        // header 10, client id 3, will topic 3, will payload 2
        assert_eq!(cursor.written().len(), 18);
        assert_eq!(buf[7], 0b0000_0110);
    }

    #[test]
    fn password_is_sent_as_password() {
        let options = Options::new("c").credentials("alice", b"hunter2");
        let connect = Connect::from(&options);

        assert_eq!(connect.username, Some("alice"));
        assert_eq!(connect.password, Some(b"hunter2".as_slice()));
    }

    #[test]
    fn connect_with_invalid_flags() {
        let bytes = [
            0x00,        // "MQTT"
            0x04,        // |
            b'M',        // |
            b'Q',        // |
            b'T',        // |
            b'T',        // ___
            0x04,        // MQTT version
            0b0000_0001, // Flags - invalid
            0x00,        // keep_alive = 60
            0x3C,        // ___
        ];
        let mut cursor = decode::Cursor::new(&bytes);
        let err = Connect::decode(&mut cursor).unwrap_err();

        assert!(matches!(err, crate::Error::MalformedPacket));
    }

    #[test]
    fn outcome_reports_return_codes() {
        let refused = ConnectOutcome::from(&ConnAck {
            session_present: false,
            return_code: ConnectReturnCode::BadUserNameOrPassword,
        });

        assert!(!refused.succeeded());
        assert_eq!(
            refused.return_code(),
            ConnectReturnCode::BadUserNameOrPassword
        );

        let failed = ConnectOutcome::Failed(crate::Error::ConnectionClosed);
        assert!(!failed.succeeded());
        assert_eq!(failed.return_code(), ConnectReturnCode::ServerUnavailable);
    }
}
