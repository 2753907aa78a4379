//! Growable byte buffer with a read cursor and endianness-aware value codecs.
//!
//! Every multi-byte value written through a [`BytePacker`] is converted from
//! host order to the packer's configured [`Endianness`]; reads convert back.
//! Strings are stored as a single length byte followed by raw UTF-8 bytes:
//!
//! ```text
//! +-----------+------------------------+
//! | len (u8)  |  bytes (len, no NUL)   |
//! +-----------+------------------------+
//! ```

/// Byte order used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Least significant byte first. The network layer's default.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

impl Endianness {
    /// Byte order of the machine this code runs on.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }
}

/// Longest string that fits behind a one-byte length header.
pub const MAX_STRING_LEN: usize = u8::MAX as usize;

/// Errors produced by [`BytePacker`] reads and bounded writes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackerError {
    /// A read asked for more bytes than remain before the write cursor.
    #[error("buffer underflow: needed {needed} bytes, {available} available")]
    Underflow {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left between the read and write cursors.
        available: usize,
    },

    /// A write would exceed the packer's fixed capacity.
    #[error("buffer overflow: writing {needed} bytes exceeds capacity {capacity}")]
    Overflow {
        /// Bytes the write required.
        needed: usize,
        /// The packer's capacity.
        capacity: usize,
    },

    /// A length-prefixed string did not contain valid UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
}

/// A fixed-size value that can be written to and read from a [`BytePacker`].
pub trait PackValue: Sized + Copy {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Encode `self` into `out` (exactly [`Self::SIZE`] bytes).
    fn pack(self, out: &mut [u8], endianness: Endianness);

    /// Decode a value from `bytes` (exactly [`Self::SIZE`] bytes).
    fn unpack(bytes: &[u8], endianness: Endianness) -> Self;
}

macro_rules! impl_pack_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl PackValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn pack(self, out: &mut [u8], endianness: Endianness) {
                    let bytes = match endianness {
                        Endianness::Little => self.to_le_bytes(),
                        Endianness::Big => self.to_be_bytes(),
                    };
                    out.copy_from_slice(&bytes);
                }

                fn unpack(bytes: &[u8], endianness: Endianness) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    match endianness {
                        Endianness::Little => <$ty>::from_le_bytes(raw),
                        Endianness::Big => <$ty>::from_be_bytes(raw),
                    }
                }
            }
        )*
    };
}

impl_pack_value!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl PackValue for bool {
    const SIZE: usize = 1;

    fn pack(self, out: &mut [u8], _endianness: Endianness) {
        out[0] = u8::from(self);
    }

    fn unpack(bytes: &[u8], _endianness: Endianness) -> Self {
        bytes[0] != 0
    }
}

/// Resizable byte buffer with independent read and write cursors.
///
/// The write cursor is the end of the buffer. Reads never move past it; a
/// failed read leaves the read cursor where it was.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BytePacker {
    buffer: Vec<u8>,
    read_head: usize,
    endianness: Endianness,
    capacity: Option<usize>,
}

impl BytePacker {
    /// Create an empty, growable packer using little-endian encoding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty, growable packer with the given byte order.
    pub fn with_endianness(endianness: Endianness) -> Self {
        Self {
            endianness,
            ..Self::default()
        }
    }

    /// Create an empty packer that refuses to grow past `capacity` bytes.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Wrap already-written bytes for reading.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            buffer: bytes.into(),
            ..Self::default()
        }
    }

    /// The configured byte order.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Change the byte order used by subsequent reads and writes.
    pub fn set_endianness(&mut self, endianness: Endianness) {
        self.endianness = endianness;
    }

    /// Total bytes written.
    pub fn written_len(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes left to read.
    pub fn readable_len(&self) -> usize {
        self.buffer.len() - self.read_head
    }

    /// Current read cursor position.
    pub fn read_position(&self) -> usize {
        self.read_head
    }

    /// Everything written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the packer, returning the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Move the read cursor back to the start.
    pub fn rewind(&mut self) {
        self.read_head = 0;
    }

    /// Drop all written bytes and reset both cursors.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_head = 0;
    }

    fn reserve_write(&mut self, needed: usize) -> Result<(), PackerError> {
        if let Some(capacity) = self.capacity
            && self.buffer.len() + needed > capacity
        {
            return Err(PackerError::Overflow { needed, capacity });
        }
        Ok(())
    }

    fn check_read(&self, needed: usize) -> Result<(), PackerError> {
        let available = self.readable_len();
        if needed > available {
            return Err(PackerError::Underflow { needed, available });
        }
        Ok(())
    }

    /// Append a fixed-size value in the configured byte order.
    pub fn write<T: PackValue>(&mut self, value: T) -> Result<(), PackerError> {
        self.reserve_write(T::SIZE)?;
        let start = self.buffer.len();
        self.buffer.resize(start + T::SIZE, 0);
        value.pack(&mut self.buffer[start..], self.endianness);
        Ok(())
    }

    /// Read the next fixed-size value.
    pub fn read<T: PackValue>(&mut self) -> Result<T, PackerError> {
        let value = self.peek::<T>()?;
        self.read_head += T::SIZE;
        Ok(value)
    }

    /// Read the next fixed-size value without advancing the read cursor.
    pub fn peek<T: PackValue>(&self) -> Result<T, PackerError> {
        self.check_read(T::SIZE)?;
        let end = self.read_head + T::SIZE;
        Ok(T::unpack(&self.buffer[self.read_head..end], self.endianness))
    }

    /// Append raw bytes with no length header.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), PackerError> {
        self.reserve_write(bytes.len())?;
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Read exactly `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&[u8], PackerError> {
        self.check_read(len)?;
        let start = self.read_head;
        self.read_head += len;
        Ok(&self.buffer[start..self.read_head])
    }

    /// Append a length-prefixed string.
    ///
    /// Strings longer than [`MAX_STRING_LEN`] bytes are truncated at the last
    /// character boundary that fits.
    pub fn write_string(&mut self, value: &str) -> Result<(), PackerError> {
        let mut len = value.len().min(MAX_STRING_LEN);
        while !value.is_char_boundary(len) {
            len -= 1;
        }
        self.reserve_write(len + 1)?;
        self.buffer.push(len as u8);
        self.buffer.extend_from_slice(&value.as_bytes()[..len]);
        Ok(())
    }

    /// Read a length-prefixed string.
    pub fn read_string(&mut self) -> Result<String, PackerError> {
        let len = usize::from(self.peek::<u8>()?);
        self.check_read(len + 1)?;
        let start = self.read_head + 1;
        let text = std::str::from_utf8(&self.buffer[start..start + len])
            .map_err(|_| PackerError::InvalidUtf8)?
            .to_owned();
        self.read_head = start + len;
        Ok(text)
    }
}
