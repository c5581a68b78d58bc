//! Little-endian binary encoding with variable-length integers
//!
//! Variable-length integers use a one-byte prefix: values below `0xFD` are
//! written as a single byte, otherwise `0xFD`, `0xFE` or `0xFF` is followed
//! by a `u16`, `u32` or `u64` respectively. Decoding rejects non-canonical
//! encodings so every value has exactly one byte representation.

use crate::{CoreError, CoreResult, Hash};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Writer producing a contiguous little-endian byte buffer
#[derive(Debug, Default)]
pub struct BinaryWriter {
    buf: BytesMut,
}

impl BinaryWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with preallocated capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    /// Write raw bytes without a length prefix
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn write_hash(&mut self, hash: &Hash) {
        self.buf.put_slice(hash.as_bytes());
    }

    /// Write a variable-length integer
    pub fn write_var_int(&mut self, value: u64) {
        if value < 0xFD {
            self.buf.put_u8(value as u8);
        } else if value <= 0xFFFF {
            self.buf.put_u8(0xFD);
            self.buf.put_u16_le(value as u16);
        } else if value <= 0xFFFF_FFFF {
            self.buf.put_u8(0xFE);
            self.buf.put_u32_le(value as u32);
        } else {
            self.buf.put_u8(0xFF);
            self.buf.put_u64_le(value);
        }
    }

    /// Write a length-prefixed byte string
    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_var_int(bytes.len() as u64);
        self.buf.put_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Freeze the written bytes
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Number of bytes `write_var_int` uses for `value`
pub fn var_int_size(value: u64) -> usize {
    if value < 0xFD {
        1
    } else if value <= 0xFFFF {
        3
    } else if value <= 0xFFFF_FFFF {
        5
    } else {
        9
    }
}

/// Reader over a borrowed byte slice
///
/// Every read checks the remaining length first, so malformed input yields
/// an error instead of a panic.
#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    buf: &'a [u8],
}

impl<'a> BinaryReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize) -> CoreResult<()> {
        if self.buf.remaining() < needed {
            return Err(CoreError::UnexpectedEof {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> CoreResult<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    /// Read a strict boolean (only 0 and 1 are accepted)
    pub fn read_bool(&mut self) -> CoreResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CoreError::Format(format!("invalid boolean byte {:#04x}", other))),
        }
    }

    pub fn read_u16(&mut self) -> CoreResult<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32(&mut self) -> CoreResult<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64(&mut self) -> CoreResult<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    /// Read a fixed-size array
    pub fn read_array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    pub fn read_hash(&mut self) -> CoreResult<Hash> {
        Ok(Hash::new(self.read_array::<32>()?))
    }

    /// Read a variable-length integer no greater than `max`
    pub fn read_var_int(&mut self, max: u64) -> CoreResult<u64> {
        let value = match self.read_u8()? {
            0xFD => {
                let v = u64::from(self.read_u16()?);
                if v < 0xFD {
                    return Err(CoreError::NonCanonicalVarInt(v));
                }
                v
            }
            0xFE => {
                let v = u64::from(self.read_u32()?);
                if v <= 0xFFFF {
                    return Err(CoreError::NonCanonicalVarInt(v));
                }
                v
            }
            0xFF => {
                let v = self.read_u64()?;
                if v <= 0xFFFF_FFFF {
                    return Err(CoreError::NonCanonicalVarInt(v));
                }
                v
            }
            small => u64::from(small),
        };
        if value > max {
            return Err(CoreError::LengthExceeded { len: value, max });
        }
        Ok(value)
    }

    /// Read a length-prefixed byte string of at most `max` bytes
    pub fn read_var_bytes(&mut self, max: usize) -> CoreResult<Vec<u8>> {
        let len = self.read_var_int(max as u64)? as usize;
        self.ensure(len)?;
        let mut out = vec![0u8; len];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Fail if any input is left unread
    pub fn finish(self) -> CoreResult<()> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(CoreError::TrailingBytes(n)),
        }
    }
}
