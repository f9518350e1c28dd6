// Sources:
// - Microsoft Tape Format Specification Version 1.00a (MTF_TAPE_ADDRESS, MTF_DATE_TIME)

//! Position-tracked little-endian reader over any `Read + Seek` backup source.

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{MtfError, Result};

/// Forward skips up to this size are served by reading instead of seeking, so a
/// buffered source keeps its buffer.
const SKIP_BY_READ_MAX: u64 = 4096;
const COPY_CHUNK: usize = 64 * 1024;

/// String storage mode declared by a descriptor block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum StringEncoding {
    None = 0,
    Ansi = 1,
    Unicode = 2,
}

impl StringEncoding {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(StringEncoding::None),
            1 => Some(StringEncoding::Ansi),
            2 => Some(StringEncoding::Unicode),
            _ => None,
        }
    }

    /// Bytes per character.
    pub fn char_width(self) -> u64 {
        match self {
            StringEncoding::Unicode => 2,
            _ => 1,
        }
    }
}

/// Decode raw string bytes. Single-byte strings are taken as Latin-1; an odd
/// trailing byte of a double-byte string is ignored.
pub fn decode_string(raw: &[u8], encoding: StringEncoding) -> String {
    match encoding {
        StringEncoding::Unicode => String::from_utf16_lossy(
            &raw.chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .collect::<Vec<_>>(),
        ),
        StringEncoding::Ansi | StringEncoding::None => raw.iter().map(|&b| b as char).collect(),
    }
}

/// Decode a packed 5-byte MTF_DATE_TIME.
///
/// The 40 bits (most significant first) are year:14, month:4, day:5, hour:5,
/// minute:6, second:6. Zero or out-of-range fields give `None`.
pub fn decode_date(raw: [u8; 5]) -> Option<NaiveDateTime> {
    let v = raw.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
    if v == 0 {
        return None;
    }
    let year = ((v >> 26) & 0x3FFF) as i32;
    let month = ((v >> 22) & 0x0F) as u32;
    let day = ((v >> 17) & 0x1F) as u32;
    let hour = ((v >> 12) & 0x1F) as u32;
    let minute = ((v >> 6) & 0x3F) as u32;
    let second = (v & 0x3F) as u32;
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

/// MTF_TAPE_ADDRESS: a (size, offset) pair locating variable data relative to the
/// start of the owning descriptor block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct TapeAddress {
    pub size: u16,
    pub offset: u16,
}

pub struct ByteCursor<T: Read + Seek> {
    inner: T,
    pos: u64,
    len: u64,
}

impl<T: Read + Seek> ByteCursor<T> {
    /// Wrap a source and rewind it to offset 0.
    pub fn new(mut inner: T) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, pos: 0, len })
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining_len(&self) -> u64 {
        self.len.saturating_sub(self.pos)
    }

    fn ensure(&self, needed: u64) -> Result<()> {
        let available = self.remaining_len();
        if available < needed {
            return Err(MtfError::TruncatedInput {
                offset: self.pos,
                needed,
                available,
            });
        }
        Ok(())
    }

    /// Move to an absolute offset. Offsets past the end are allowed; any read
    /// from there fails with `TruncatedInput`.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        if offset != self.pos {
            self.inner.seek(SeekFrom::Start(offset))?;
            self.pos = offset;
        }
        Ok(())
    }

    /// Move forward by `n` bytes that must exist.
    pub fn skip(&mut self, n: u64) -> Result<()> {
        self.ensure(n)?;
        if n <= SKIP_BY_READ_MAX {
            let mut scratch = [0u8; SKIP_BY_READ_MAX as usize];
            self.inner.read_exact(&mut scratch[..n as usize])?;
            self.pos += n;
            Ok(())
        } else {
            self.seek(self.pos + n)
        }
    }

    /// Pad forward so that `(position - base)` is a multiple of `boundary`.
    /// Padding missing at the very end of the source is not an error.
    pub fn align_from(&mut self, base: u64, boundary: u64) -> Result<()> {
        let rel = self.pos.saturating_sub(base);
        let pad = (boundary - rel % boundary) % boundary;
        if pad == 0 {
            return Ok(());
        }
        if pad <= self.remaining_len() {
            self.skip(pad)
        } else {
            self.seek(self.pos + pad)
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        let v = self.inner.read_u8()?;
        self.pos += 1;
        Ok(v)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.ensure(1)?;
        let v = self.inner.read_i8()?;
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        let v = self.inner.read_u16::<LittleEndian>()?;
        self.pos += 2;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        let v = self.inner.read_u32::<LittleEndian>()?;
        self.pos += 4;
        Ok(v)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        let v = self.inner.read_u64::<LittleEndian>()?;
        self.pos += 8;
        Ok(v)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        let v = self.inner.read_i64::<LittleEndian>()?;
        self.pos += 8;
        Ok(v)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure(N as u64)?;
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        self.pos += N as u64;
        Ok(buf)
    }

    pub fn read_bytes(&mut self, n: u64) -> Result<Vec<u8>> {
        self.ensure(n)?;
        let mut buf = vec![0u8; n as usize];
        self.inner.read_exact(&mut buf)?;
        self.pos += n;
        Ok(buf)
    }

    /// Read `n` bytes at an absolute offset and come back to the current position.
    pub fn read_bytes_at(&mut self, offset: u64, n: u64) -> Result<Vec<u8>> {
        let resume = self.pos;
        self.seek(offset)?;
        let raw = self.read_bytes(n);
        self.seek(resume)?;
        raw
    }

    /// Stream `n` bytes from the current position into `out` in bounded chunks.
    pub fn copy_to<W: Write>(&mut self, n: u64, out: &mut W) -> Result<u64> {
        self.ensure(n)?;
        let mut buf = vec![0u8; COPY_CHUNK.min(n as usize)];
        let mut left = n;
        while left > 0 {
            let chunk = left.min(buf.len() as u64) as usize;
            self.inner.read_exact(&mut buf[..chunk])?;
            out.write_all(&buf[..chunk])?;
            self.pos += chunk as u64;
            left -= chunk as u64;
        }
        Ok(n)
    }

    /// Peek the next little-endian u32 without consuming it.
    pub fn peek_u32(&mut self) -> Result<u32> {
        let at = self.pos;
        let v = self.read_u32()?;
        self.seek(at)?;
        Ok(v)
    }

    /// Read `len` characters (1 or 2 bytes each depending on `encoding`).
    pub fn read_fixed_string(&mut self, len: u64, encoding: StringEncoding) -> Result<String> {
        let raw = self.read_bytes(len * encoding.char_width())?;
        Ok(decode_string(&raw, encoding))
    }

    /// Read a u32 character count followed by that many characters.
    pub fn read_length_prefixed_string(&mut self, encoding: StringEncoding) -> Result<String> {
        let chars = self.read_u32()? as u64;
        self.read_fixed_string(chars, encoding)
    }

    pub fn read_tape_address(&mut self) -> Result<TapeAddress> {
        Ok(TapeAddress {
            size: self.read_u16()?,
            offset: self.read_u16()?,
        })
    }

    /// Read a tape address and return the bytes it points at; the cursor ends up
    /// just after the 4-byte address.
    pub fn read_tape_bytes(&mut self, block_start: u64) -> Result<Vec<u8>> {
        let addr = self.read_tape_address()?;
        if addr.size == 0 {
            return Ok(Vec::new());
        }
        self.read_bytes_at(block_start + addr.offset as u64, addr.size as u64)
    }

    /// Read a string stored through a tape address.
    pub fn read_tape_string(&mut self, block_start: u64, encoding: StringEncoding) -> Result<String> {
        let raw = self.read_tape_bytes(block_start)?;
        Ok(decode_string(&raw, encoding))
    }

    pub fn read_date(&mut self) -> Result<Option<NaiveDateTime>> {
        Ok(decode_date(self.read_array::<5>()?))
    }
}
