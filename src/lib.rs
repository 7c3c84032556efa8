#![cfg_attr(not(test), no_std)]

pub(crate) mod fmt;

pub mod client;
pub(crate) mod incoming;
pub(crate) mod keep_alive;
pub(crate) mod oneshot;
pub(crate) mod outgoing;
pub mod packet;
pub(crate) mod packet_id_pool;
pub mod parser;
pub mod protocol;
pub(crate) mod session;
#[cfg(feature = "embassy")]
pub mod time;
pub mod transport;

pub use client::{Client, Config, Delivery, Handler};
pub use packet::QoS;
pub use packet::connect::{ConnectOutcome, ConnectReturnCode, Options as ConnectOptions};
pub use packet::publish::Message;
pub use packet::subscribe::SubAckReturnCode;
pub use session::{Ack, Event};
pub use transport::{PipeTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    InvalidFlags,
    MalformedRemainingLength,
    InvalidPacketType,
    MalformedPacket,
    InvalidConnectReturnCode,
    InvalidQoS,
    InvalidUtf8,
    UnexpectedEof,
    BufferTooSmall,
    /// Remaining length above 268,435,455.
    PacketTooLarge,
    PayloadTooLarge,
    TopicTooLong,
    VectorIsFull,
    TransportError,
    ConnectionClosed,
    NotConnected,
    AlreadyConnected,
    TimeError,
    TimedOut,
    ProtocolViolation,
    NoPacketIdAvailable,
    ReceiveWindowFull,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::InvalidFlags => "invalid fixed header flags",
            Error::MalformedRemainingLength => "malformed remaining length",
            Error::InvalidPacketType => "unknown packet type",
            Error::MalformedPacket => "malformed packet",
            Error::InvalidConnectReturnCode => "invalid connect return code",
            Error::InvalidQoS => "invalid QoS level",
            Error::InvalidUtf8 => "invalid UTF-8 string",
            Error::UnexpectedEof => "unexpected end of packet",
            Error::BufferTooSmall => "buffer too small",
            Error::PacketTooLarge => "packet exceeds maximum remaining length",
            Error::PayloadTooLarge => "payload exceeds configured capacity",
            Error::TopicTooLong => "topic exceeds configured capacity",
            Error::VectorIsFull => "vector is full",
            Error::TransportError => "transport error",
            Error::ConnectionClosed => "connection closed",
            Error::NotConnected => "not connected",
            Error::AlreadyConnected => "connection attempt already made",
            Error::TimeError => "clock error",
            Error::TimedOut => "keep-alive timed out",
            Error::ProtocolViolation => "protocol violation",
            Error::NoPacketIdAvailable => "no packet identifier available",
            Error::ReceiveWindowFull => "inbound QoS 2 window is full",
        };

        f.write_str(msg)
    }
}

impl core::error::Error for Error {}

impl Error {
    /// Decode failures tear the connection down.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Error::InvalidFlags
                | Error::MalformedRemainingLength
                | Error::InvalidPacketType
                | Error::MalformedPacket
                | Error::InvalidConnectReturnCode
                | Error::InvalidQoS
                | Error::InvalidUtf8
                | Error::UnexpectedEof
        )
    }

    /// Errors after which the connection cannot continue.
    pub fn is_fatal(&self) -> bool {
        self.is_decode()
            || matches!(
                self,
                Error::TransportError
                    | Error::ConnectionClosed
                    | Error::TimedOut
                    | Error::ProtocolViolation
            )
    }
}
