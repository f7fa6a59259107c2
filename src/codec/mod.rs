//! Primitive wire codec: fixed-width integers, GUIDs, UTF-16/UTF-8
//! strings, and the two variable-length integer encodings.
//!
//! # Variable-length integers
//!
//! `VarUInt` is plain ULEB128: 7 value bits per byte, high bit set on
//! every byte except the last, at most 10 bytes for a 64-bit value.
//! `VarInt` is zig-zag over ULEB128 (`(raw >> 1) ^ -(raw & 1)`), so
//! small negative numbers stay short.  Both must round-trip exactly at
//! the 64-bit boundaries (`i64::MIN`/`MAX`, `u64::MAX`).
//!
//! # Strings
//!
//! A string on the wire is a VarUInt code-unit count followed by that
//! many code units: 2 bytes each for UTF-16, 1 byte for UTF-8.  Invalid
//! sequences decode lossily (replacement character) — a producer bug in
//! a display name must not abort the parse.
//!
//! # Endianness
//!
//! All multi-byte values are strictly little-endian.  No runtime
//! negotiation is ever performed.

use uuid::Uuid;

use crate::error::{Result, TraceError};

/// Zig-zag decode a raw ULEB128 value to a signed 64-bit integer.
#[inline]
pub fn zigzag_decode(raw: u64) -> i64 {
    ((raw >> 1) as i64) ^ -((raw & 1) as i64)
}

/// Zig-zag encode a signed 64-bit integer.
#[inline]
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Append a ULEB128-encoded unsigned integer to `out`.
pub fn write_varuint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Append a zig-zag + ULEB128 encoded signed integer to `out`.
pub fn write_varint(out: &mut Vec<u8>, value: i64) {
    write_varuint(out, zigzag_encode(value));
}

// ── Slice cursor ─────────────────────────────────────────────────────────────

/// A bounds-checked cursor over one in-memory block or payload.
///
/// Every read either consumes exactly the requested bytes or fails with
/// `TraceError::Corrupt`; there is no partial read and no sticky state.
/// The cursor never reads past the end of its slice, which is what
/// confines event decoding to the current block.
#[derive(Debug, Clone)]
pub struct SliceCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// A fresh cursor over `len` bytes starting at absolute `offset`
    /// within the same underlying slice.  Used by RelLoc/DataLoc region
    /// decoding, which addresses the payload by explicit offset.
    pub fn window(&self, offset: usize, len: usize) -> Result<SliceCursor<'a>> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| TraceError::corrupt("location region overflows"))?;
        if end > self.data.len() {
            return Err(TraceError::corrupt(format!(
                "location region {offset}..{end} exceeds payload size {}",
                self.data.len()
            )));
        }
        Ok(SliceCursor { data: &self.data[offset..end], pos: 0 })
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(TraceError::corrupt(format!(
                "need {n} bytes, {} remain",
                self.remaining()
            )));
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..self.pos])
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    /// Advance to absolute position `pos`, which must not be behind the
    /// cursor.  This is the "consume declared length regardless of what
    /// was recognised" primitive behind every length-prefixed record.
    pub fn seek_to(&mut self, pos: usize) -> Result<()> {
        if pos < self.pos || pos > self.data.len() {
            return Err(TraceError::corrupt(format!(
                "declared record end {pos} out of range (at {}, len {})",
                self.pos,
                self.data.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    pub fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    pub fn i16(&mut self) -> Result<i16> {
        Ok(self.u16()? as i16)
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    pub fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    pub fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.u64()?))
    }

    /// Legacy 4-byte boolean: 0 or 1, anything else is corruption.
    pub fn bool32(&mut self) -> Result<bool> {
        match self.u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(TraceError::corrupt(format!(
                "boolean must be 0 or 1, got {other}"
            ))),
        }
    }

    pub fn guid(&mut self) -> Result<Uuid> {
        let raw: [u8; 16] = self.bytes(16)?.try_into().unwrap();
        Ok(Uuid::from_bytes_le(raw))
    }

    /// ULEB128 unsigned integer, at most 10 bytes.
    pub fn varuint(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 64 {
                return Err(TraceError::corrupt("varuint longer than 10 bytes"));
            }
        }
    }

    /// Zig-zag signed integer.
    pub fn varint(&mut self) -> Result<i64> {
        Ok(zigzag_decode(self.varuint()?))
    }

    /// VarUInt code-unit count + UTF-16LE code units.
    pub fn utf16_string(&mut self) -> Result<String> {
        let count = self.varuint()? as usize;
        let byte_len = count
            .checked_mul(2)
            .ok_or_else(|| TraceError::corrupt("string length overflows"))?;
        let raw = self.bytes(byte_len)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    /// VarUInt byte count + UTF-8 bytes.
    pub fn utf8_string(&mut self) -> Result<String> {
        let count = self.varuint()? as usize;
        let raw = self.bytes(count)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }
}
