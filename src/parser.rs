use embassy_sync::{blocking_mutex::raw::RawMutex, pipe::Pipe};
use embedded_io_async::{Read, ReadExactError, Write};
use embedded_time::Clock;

use crate::{client::Client, protocol::PacketType, transport::Transport};

/// Reads one complete frame, fixed header included, into `buf`.
pub async fn read_frame<'b, R: Read>(
    read: &mut R,
    buf: &'b mut [u8],
) -> Result<&'b [u8], crate::Error> {
    let byte = read_u8(read).await?;
    parse_first_byte(byte)?;

    let header = buf.first_mut().ok_or(crate::Error::BufferTooSmall)?;
    *header = byte;

    let mut header_len = 1;
    let mut remaining_len: usize = 0;
    let mut multiplier = 1;

    loop {
        let byte = read_u8(read).await?;

        let slot = buf
            .get_mut(header_len)
            .ok_or(crate::Error::BufferTooSmall)?;
        *slot = byte;
        header_len += 1;

        remaining_len += (byte & 0x7F) as usize * multiplier;

        if (byte & 0x80) == 0 {
            break;
        }

        // four length bytes at most
        if header_len > 4 {
            return Err(crate::Error::MalformedRemainingLength);
        }

        multiplier *= 128;
    }

    let total = header_len + remaining_len;
    let body = buf
        .get_mut(header_len..total)
        .ok_or(crate::Error::BufferTooSmall)?;

    read.read_exact(body).await.map_err(read_error)?;

    Ok(&buf[..total])
}

/// Moves one chunk of queued outbound bytes from the pipe of a
/// [`crate::PipeTransport`] to `write`. Waits while the pipe is empty.
pub async fn write_pending<M: RawMutex, W: Write, const N: usize>(
    pipe: &Pipe<M, N>,
    write: &mut W,
) -> Result<usize, crate::Error> {
    let mut chunk = [0u8; 128];
    let len = pipe.read(&mut chunk).await;

    write
        .write_all(&chunk[..len])
        .await
        .map_err(|_| crate::Error::TransportError)?;
    write
        .flush()
        .await
        .map_err(|_| crate::Error::TransportError)?;

    Ok(len)
}

/// Feeds every frame read from `read` to `client` until the stream ends or a
/// fatal error occurs. A read failure is reported to the client as a closed
/// connection.
pub async fn read_loop<
    M: RawMutex,
    C: Clock,
    T: Transport,
    R: Read,
    const N_OUT: usize,
    const N_IN: usize,
    const Q: usize,
    const TOPIC: usize,
    const PAYLOAD: usize,
>(
    client: &Client<'_, M, C, T, N_OUT, N_IN, Q, TOPIC, PAYLOAD>,
    read: &mut R,
    buf: &mut [u8],
) -> crate::Error {
    loop {
        let frame = match read_frame(read, buf).await {
            Ok(frame) => frame,
            Err(err) => {
                debug!("read loop ended: {:?}", err);
                client.on_closed();
                return err;
            }
        };

        if let Err(err) = client.on_packet(frame)
            && err.is_fatal()
        {
            return err;
        }
    }
}

fn parse_first_byte(byte: u8) -> Result<PacketType, crate::Error> {
    let packet_type = PacketType::try_from(byte >> 4)?;

    if !packet_type.validate_flags(byte & 0x0F) {
        return Err(crate::Error::InvalidFlags);
    }

    Ok(packet_type)
}

fn read_error<E>(err: ReadExactError<E>) -> crate::Error {
    match err {
        ReadExactError::UnexpectedEof => crate::Error::ConnectionClosed,
        ReadExactError::Other(_) => crate::Error::TransportError,
    }
}

async fn read_u8<R: Read>(read: &mut R) -> Result<u8, crate::Error> {
    let mut buf = [0u8; 1];
    read.read_exact(&mut buf).await.map_err(read_error)?;

    Ok(buf[0])
}

#[cfg(test)]
mod tests {
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use futures::executor::block_on;

    use super::*;
    use crate::{
        Config, ConnectOptions, Event, PipeTransport,
        client::tests::MockClock,
        packet::{Packet, QoS, encode, publish},
    };

    fn frame(packet: &Packet<'_>) -> Vec<u8> {
        let mut buf = [0u8; 512];
        let mut cursor = encode::Cursor::new(&mut buf);
        packet.encode(&mut cursor).unwrap();

        cursor.written().to_vec()
    }

    #[test]
    fn frames_back_to_back() {
        let mut input = frame(&Packet::PingResp);
        input.extend(frame(&Packet::PubAck(crate::packet::PacketId::new(3).unwrap())));

        let mut read = input.as_slice();
        let mut buf = [0u8; 16];

        block_on(async {
            assert_eq!(read_frame(&mut read, &mut buf).await.unwrap(), &[0xD0, 0x00]);
            assert_eq!(
                read_frame(&mut read, &mut buf).await.unwrap(),
                &[0x40, 0x02, 0x00, 0x03]
            );
            assert!(matches!(
                read_frame(&mut read, &mut buf).await,
                Err(crate::Error::ConnectionClosed)
            ));
        });
    }

    #[test]
    fn multibyte_remaining_length() {
        let payload = [0xAB; 316];
        let input = frame(&Packet::Publish(publish::Publish {
            flags: Default::default(),
            topic: "abc",
            packet_id: None,
            payload: &payload,
        }));

        // 316 + 5 = 321 = 0xC1 0x02
        assert_eq!(&input[..3], &[0x30, 0xC1, 0x02]);

        let mut read = input.as_slice();
        let mut buf = [0u8; 400];

        let read_back = block_on(read_frame(&mut read, &mut buf)).unwrap();
        assert_eq!(read_back.len(), 324);
        assert!(matches!(
            Packet::decode(read_back).unwrap(),
            Packet::Publish(publish) if publish.payload.len() == 316
        ));
    }

    #[test]
    fn remaining_length_too_long() {
        let input = [0xC0, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        let mut read = input.as_slice();
        let mut buf = [0u8; 16];

        assert!(matches!(
            block_on(read_frame(&mut read, &mut buf)),
            Err(crate::Error::MalformedRemainingLength)
        ));
    }

    #[test]
    fn rejects_bad_first_byte_and_small_buffers() {
        let mut buf = [0u8; 4];

        let input = [0xF0, 0x00];
        assert!(matches!(
            block_on(read_frame(&mut input.as_slice(), &mut buf)),
            Err(crate::Error::InvalidPacketType)
        ));

        // PUBREL with flags 0
        let input = [0x60, 0x02, 0x00, 0x01];
        assert!(matches!(
            block_on(read_frame(&mut input.as_slice(), &mut buf)),
            Err(crate::Error::InvalidFlags)
        ));

        let input = [0x30, 0x05, 0x00, 0x01, b'a', b'b', b'c'];
        assert!(matches!(
            block_on(read_frame(&mut input.as_slice(), &mut buf)),
            Err(crate::Error::BufferTooSmall)
        ));
    }

    #[test]
    fn pending_frames_are_written_out() {
        let pipe = Pipe::<NoopRawMutex, 32>::new();
        let mut transport = PipeTransport::new(&pipe);
        transport.send(&[0xC0, 0x00]).unwrap();
        transport.send(&[0xE0, 0x00]).unwrap();

        let mut out = [0u8; 8];
        let mut write: &mut [u8] = &mut out;

        assert_eq!(block_on(write_pending(&pipe, &mut write)).unwrap(), 4);
        assert_eq!(&out[..4], &[0xC0, 0x00, 0xE0, 0x00]);
    }

    #[test]
    fn read_loop_feeds_the_client_until_eof() {
        let pipe = Pipe::<NoopRawMutex, 256>::new();
        let mut tx = [0u8; 128];
        let client: Client<'_, NoopRawMutex, MockClock, _, 2, 2, 4, 16, 16> = Client::new(
            MockClock::default(),
            PipeTransport::new(&pipe),
            &mut tx,
            Config::default(),
        );

        client.begin_connect(&ConnectOptions::new("reader")).unwrap();

        let mut input = frame(&Packet::ConnAck(crate::packet::connect::ConnAck {
            session_present: true,
            return_code: crate::ConnectReturnCode::Accepted,
        }));
        input.extend(frame(&Packet::Publish(publish::Publish {
            flags: publish::Flags {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
            },
            topic: "t",
            packet_id: None,
            payload: b"hi",
        })));

        let mut read = input.as_slice();
        let mut buf = [0u8; 64];

        let err = block_on(read_loop(&client, &mut read, &mut buf));

        assert_eq!(err, crate::Error::ConnectionClosed);
        assert!(client.is_closed());
        assert_eq!(
            client.try_next_event(),
            Some(Event::Connected {
                session_present: true
            })
        );
        assert!(matches!(
            client.try_next_event(),
            Some(Event::Message(message)) if message.payload.as_slice() == b"hi"
        ));
    }
}
