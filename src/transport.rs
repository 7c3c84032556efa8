use embassy_sync::{blocking_mutex::raw::RawMutex, pipe::Pipe};

use crate::packet::{Packet, encode};

/// Outbound byte sink for whole frames. A frame is either accepted
/// completely or the call fails.
pub trait Transport {
    fn send(&mut self, frame: &[u8]) -> Result<(), crate::Error>;

    fn close(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, frame: &[u8]) -> Result<(), crate::Error> {
        T::send(self, frame)
    }

    fn close(&mut self) {
        T::close(self)
    }
}

/// Frames queued into a [`Pipe`], drained by [`crate::parser::write_pending`].
pub struct PipeTransport<'p, M: RawMutex, const N: usize> {
    pipe: &'p Pipe<M, N>,
    closed: bool,
}

impl<'p, M: RawMutex, const N: usize> PipeTransport<'p, M, N> {
    pub fn new(pipe: &'p Pipe<M, N>) -> Self {
        Self {
            pipe,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<M: RawMutex, const N: usize> Transport for PipeTransport<'_, M, N> {
    fn send(&mut self, mut frame: &[u8]) -> Result<(), crate::Error> {
        if self.closed {
            return Err(crate::Error::ConnectionClosed);
        }

        if self.pipe.free_capacity() < frame.len() {
            warn!("pipe full, dropping {} byte frame", frame.len());
            return Err(crate::Error::TransportError);
        }

        while !frame.is_empty() {
            let written = self
                .pipe
                .try_write(frame)
                .map_err(|_| crate::Error::TransportError)?;
            frame = &frame[written..];
        }

        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// The transport together with the frame buffer outbound packets are encoded
/// into.
pub(crate) struct Link<'b, T: Transport> {
    transport: T,
    tx: &'b mut [u8],
    open: bool,
}

impl<'b, T: Transport> Link<'b, T> {
    pub(crate) fn new(transport: T, tx: &'b mut [u8]) -> Self {
        Self {
            transport,
            tx,
            open: true,
        }
    }

    /// Encoding failures leave the link usable, transport failures do not.
    pub(crate) fn send(&mut self, packet: &Packet<'_>) -> Result<(), crate::Error> {
        if !self.open {
            return Err(crate::Error::NotConnected);
        }

        let mut cursor = encode::Cursor::new(&mut *self.tx);
        packet.encode(&mut cursor)?;
        let frame = cursor.written();

        trace!("sending {:?}, {} bytes", packet.packet_type(), frame.len());

        self.transport.send(frame).map_err(|err| {
            error!("transport send failed: {:?}", err);
            crate::Error::TransportError
        })
    }

    pub(crate) fn close(&mut self) {
        if self.open {
            self.open = false;
            self.transport.close();
        }
    }

    pub(crate) fn replace(&mut self, transport: T) {
        self.transport = transport;
        self.open = true;
    }
}
