use byteorder::{BigEndian, ByteOrder};
use bytes::BufMut;

/// A failed read from a [`Reader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// The buffer ends early but the stream may still deliver the rest.
    #[error("{missing} more bytes are needed")]
    NeedMore { missing: usize },

    /// A field runs past the end of a buffer that is known to be complete.
    #[error("field runs out of bounds")]
    OutOfBounds,
}

/// Bounds-checked big-endian reader over a byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    streaming: bool,
}

impl<'a> Reader<'a> {
    /// Reader over a complete buffer, e.g. a decrypted payload.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            streaming: false,
        }
    }

    /// Reader over a prefix of a stream; short reads report `NeedMore`.
    pub fn streaming(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            streaming: true,
        }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining_len(&self) -> usize {
        self.data.len() - self.pos
    }

    #[inline]
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        let b = self.read_slice(1)?;
        Ok(b[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, ReadError> {
        self.read_u8().map(|b| b != 0)
    }

    pub fn read_u32_be(&mut self) -> Result<u32, ReadError> {
        self.read_slice(4).map(BigEndian::read_u32)
    }

    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        if self.remaining_len() < len {
            return Err(self.short(len));
        }
        let s = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(s)
    }

    /// Reads a `string` (RFC 4251 section 5): a u32 length followed by that many bytes.
    pub fn read_string(&mut self) -> Result<&'a [u8], ReadError> {
        let start = self.pos;
        let len = self.read_u32_be()? as usize;
        match self.read_slice(len) {
            Ok(s) => Ok(s),
            Err(err) => {
                self.pos = start;
                Err(err)
            }
        }
    }

    pub fn skip(&mut self, len: usize) -> Result<(), ReadError> {
        self.read_slice(len).map(drop)
    }

    fn short(&self, needed: usize) -> ReadError {
        if self.streaming {
            ReadError::NeedMore {
                missing: needed - self.remaining_len(),
            }
        } else {
            ReadError::OutOfBounds
        }
    }
}

pub(crate) fn put_ssh_string<B: BufMut>(mut b: B, s: &[u8]) {
    let len = s.len() as u32;
    b.put_u32(len);
    b.put_slice(s);
}

/// Writes an unsigned big-endian integer as an `mpint`.
pub(crate) fn put_ssh_mpint<B: BufMut>(mut b: B, s: &[u8]) {
    // Skip initial 0s.
    let i = s.iter().take_while(|&&c| c == 0).count();
    let s = &s[i..];

    // A set high bit would make the value negative, so prepend a 0.
    match s.first() {
        Some(c) if c & 0x80 != 0 => {
            b.put_u32(s.len() as u32 + 1);
            b.put_u8(0);
        }
        _ => b.put_u32(s.len() as u32),
    }
    b.put_slice(s);
}

pub(crate) fn starts_with_ignore_case(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len() && data[..prefix.len()].eq_ignore_ascii_case(prefix)
}
