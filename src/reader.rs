//! Random-access, endian-aware primitive reads over the mapped file.
//!
//! The reader's only state is its cursor. Each read either returns exactly
//! what it promises or fails with a bounds error; there is no partial-read
//! ambiguity. Structured metadata is parsed by the nom parsers in
//! [`crate::parse`]; this module serves raw data regions (chunks,
//! contiguous payloads, heap segments) and the typed value decoder.

use byteorder::ByteOrder as _;
use byteorder::{BigEndian, LittleEndian};

use crate::error::{Hdf5Error, Result};

/// Endianness of a single read, named per call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Bounds-checked subslice starting at a file-relative address.
pub fn slice_from(buf: &[u8], address: u64) -> Result<&[u8]> {
    if address > buf.len() as u64 {
        return Err(Hdf5Error::ShortRead { address, len: 0 });
    }
    Ok(&buf[address as usize..])
}

/// Bounds-checked subslice of exactly `len` bytes at a file-relative address.
pub fn slice_at(buf: &[u8], address: u64, len: u64) -> Result<&[u8]> {
    let end = address.checked_add(len).filter(|e| *e <= buf.len() as u64);
    match end {
        Some(end) => Ok(&buf[address as usize..end as usize]),
        None => Err(Hdf5Error::ShortRead { address, len }),
    }
}

/// Cursor over a byte region with explicit-endianness primitive reads.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    offset_size: u8,
    length_size: u8,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8], offset_size: u8, length_size: u8) -> Self {
        ByteReader {
            buf,
            pos: 0,
            offset_size,
            length_size,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.pos as u64
    }

    pub fn seek(&mut self, position: u64) -> Result<()> {
        if position > self.buf.len() as u64 {
            return Err(Hdf5Error::ShortRead {
                address: position,
                len: 0,
            });
        }
        self.pos = position as usize;
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Hdf5Error::ShortRead {
                address: self.pos as u64,
                len: n as u64,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self, endian: Endian) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u16(b),
            Endian::Big => BigEndian::read_u16(b),
        })
    }

    pub fn read_u32(&mut self, endian: Endian) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u32(b),
            Endian::Big => BigEndian::read_u32(b),
        })
    }

    pub fn read_u64(&mut self, endian: Endian) -> Result<u64> {
        let b = self.read_bytes(8)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u64(b),
            Endian::Big => BigEndian::read_u64(b),
        })
    }

    pub fn read_i16(&mut self, endian: Endian) -> Result<i16> {
        Ok(self.read_u16(endian)? as i16)
    }

    pub fn read_i32(&mut self, endian: Endian) -> Result<i32> {
        Ok(self.read_u32(endian)? as i32)
    }

    pub fn read_i64(&mut self, endian: Endian) -> Result<i64> {
        Ok(self.read_u64(endian)? as i64)
    }

    pub fn read_f32(&mut self, endian: Endian) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32(endian)?))
    }

    pub fn read_f64(&mut self, endian: Endian) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64(endian)?))
    }

    /// Read a file offset of size-of-offsets bytes, little-endian.
    ///
    /// The all-ones undefined sentinel is normalized to `u64::MAX` so
    /// callers can test it without knowing the stored width.
    pub fn read_offset(&mut self) -> Result<u64> {
        let width = self.offset_size;
        self.read_sized(width)
    }

    /// Read a length of size-of-lengths bytes, little-endian.
    pub fn read_length(&mut self) -> Result<u64> {
        let width = self.length_size;
        self.read_sized(width)
    }

    fn read_sized(&mut self, width: u8) -> Result<u64> {
        let bytes = self.read_bytes(width as usize)?;
        Ok(fold_le(bytes))
    }
}

/// Fold up to 8 little-endian bytes into a u64, normalizing the all-ones
/// undefined-address sentinel of any width to `u64::MAX`.
pub fn fold_le(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, b) in bytes.iter().enumerate() {
        value |= u64::from(*b) << (8 * i);
    }
    if !bytes.is_empty() && bytes.iter().all(|b| *b == 0xFF) {
        u64::MAX
    } else {
        value
    }
}

/// True if an address read from metadata is the undefined sentinel.
pub fn is_undefined(address: u64) -> bool {
    address == u64::MAX
}
