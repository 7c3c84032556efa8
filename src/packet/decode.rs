pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8, crate::Error> {
        self.ensure_remaining(1)?;
        let res = self.buf[self.pos];
        self.pos += 1;

        Ok(res)
    }

    pub fn read_u16(&mut self) -> Result<u16, crate::Error> {
        self.ensure_remaining(2)?;
        let res = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;

        Ok(res)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], crate::Error> {
        self.ensure_remaining(len)?;
        let res = &self.buf[self.pos..self.pos + len];
        self.pos += len;

        Ok(res)
    }

    pub fn read_binary_chunk(&mut self) -> Result<&'a [u8], crate::Error> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    pub fn read_utf8(&mut self) -> Result<&'a str, crate::Error> {
        let bytes = self.read_binary_chunk()?;

        core::str::from_utf8(bytes).map_err(|_| crate::Error::InvalidUtf8)
    }

    /// Everything left in the buffer.
    pub fn read_all(&mut self) -> &'a [u8] {
        let res = &self.buf[self.pos..];
        self.pos = self.buf.len();

        res
    }

    /// 7 bits per byte, least significant group first, at most 4 bytes.
    pub fn read_remaining_length(&mut self) -> Result<usize, crate::Error> {
        let mut remaining_len: usize = 0;
        let mut multiplier = 1;

        for _ in 0..4 {
            let byte = self.read_u8()?;
            remaining_len += (byte & 0x7F) as usize * multiplier;

            if byte & 0x80 == 0 {
                return Ok(remaining_len);
            }

            multiplier *= 128;
        }

        Err(crate::Error::MalformedRemainingLength)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn expect_empty(&self) -> Result<(), crate::Error> {
        if !self.is_empty() {
            Err(crate::Error::MalformedPacket)
        } else {
            Ok(())
        }
    }

    fn ensure_remaining(&self, n: usize) -> Result<(), crate::Error> {
        if self.remaining() < n {
            Err(crate::Error::UnexpectedEof)
        } else {
            Ok(())
        }
    }
}
