//! Byte cursors for the fixed-width, big-endian wire format.
//!
//! Every multi-byte integer is big-endian and every variable-length
//! collection is preceded by an explicit `u32` count. There are no
//! delimiters, so a decoder must know exactly how many bytes to take.

use crate::error::DecodeError;

/// Width of a `u32` count prefix.
pub const U32_SIZE: usize = 4;

/// Width of a `u64` field.
pub const U64_SIZE: usize = 8;

/// A sequential reader over a byte slice.
///
/// Tracks how many bytes have been consumed so callers can report the
/// exact encoded length of what they decoded.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Create a reader positioned at the start of `bytes`.
    pub fn new(bytes: &'a [u8]) -> Reader<'a> {
        return Reader { bytes, offset: 0 };
    }

    /// Number of bytes consumed so far.
    #[inline]
    pub fn offset(&self) -> usize {
        return self.offset;
    }

    /// Number of bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> usize {
        return self.bytes.len() - self.offset;
    }

    /// Return true if every byte has been consumed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        return self.remaining() == 0;
    }

    /// Take the next `len` bytes, failing on a short read.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(DecodeError::ShortRead {
                needed: len,
                remaining,
                offset: self.offset,
            });
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        return Ok(slice);
    }

    /// Take the next `N` bytes as a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        return Ok(out);
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        return Ok(u32::from_be_bytes(self.read_array()?));
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        return Ok(u64::from_be_bytes(self.read_array()?));
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(&self) -> Result<(), DecodeError> {
        if !self.is_empty() {
            return Err(DecodeError::Invalid(format!(
                "{} trailing bytes after offset {}",
                self.remaining(),
                self.offset
            )));
        }
        return Ok(());
    }
}

/// A growable big-endian writer.
#[derive(Clone, Debug, Default)]
pub struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    pub fn new() -> Writer {
        return Writer { bytes: Vec::new() };
    }

    pub fn with_capacity(capacity: usize) -> Writer {
        return Writer {
            bytes: Vec::with_capacity(capacity),
        };
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Writer {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        return self;
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Writer {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        return self;
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Writer {
        self.bytes.extend_from_slice(bytes);
        return self;
    }

    /// Write a collection length as a `u32` count prefix.
    ///
    /// # Panics
    ///
    /// If `count` exceeds `u32::MAX`. Collections in this index are bounded
    /// by the number of parent sequences and steps, so such a count means
    /// the caller built an entity the wire format cannot describe.
    pub fn write_count(&mut self, count: usize) -> &mut Writer {
        let Ok(prefix) = u32::try_from(count) else {
            panic!("collection of {count} elements overflows the u32 count prefix");
        };
        return self.write_u32(prefix);
    }

    /// Append the encoding of `value`.
    pub fn write<E: Encode + ?Sized>(&mut self, value: &E) -> &mut Writer {
        value.encode(self);
        return self;
    }

    pub fn len(&self) -> usize {
        return self.bytes.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.bytes.is_empty();
    }

    pub fn into_bytes(self) -> Vec<u8> {
        return self.bytes;
    }
}

/// A value with a binary encoding.
pub trait Encode {
    fn encode(&self, writer: &mut Writer);

    /// Encode into a fresh buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.encode(&mut writer);
        return writer.into_bytes();
    }
}

/// A value that can be decoded from its binary encoding.
pub trait Decode: Sized {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Decode from the front of `bytes`, returning the value and the number
    /// of bytes consumed. Trailing bytes are left for the caller.
    fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut reader = Reader::new(bytes);
        let value = Self::decode(&mut reader)?;
        return Ok((value, reader.offset()));
    }
}

/// Upper bound for preallocating a collection whose count came off the wire.
pub(crate) fn bounded_capacity(count: u32, reader: &Reader<'_>, element_size: usize) -> usize {
    return (count as usize).min(reader.remaining() / element_size.max(1));
}
