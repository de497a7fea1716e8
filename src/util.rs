//! Byte-level helpers for reading untrusted Mach-O data.
//!
//! This module provides:
//! - Bounds-checked little-endian reads (using byteorder)
//! - NUL-terminated string scanning (via memchr)
//! - LEB128 decoding with explicit failure reasons
//! - Overflow-aware range arithmetic used by every bounds check

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

// =============================================================================
// Unaligned Reads
// =============================================================================

/// Reads a little-endian u64, returning `None` when out of bounds.
#[inline]
pub fn get_u64_le(data: &[u8], offset: usize) -> Option<u64> {
    let end = offset.checked_add(8)?;
    data.get(offset..end).map(LittleEndian::read_u64)
}

/// Reads a little-endian u32, returning `None` when out of bounds.
#[inline]
pub fn get_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    data.get(offset..end).map(LittleEndian::read_u32)
}

/// Reads a little-endian u16, returning `None` when out of bounds.
#[inline]
pub fn get_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    let end = offset.checked_add(2)?;
    data.get(offset..end).map(LittleEndian::read_u16)
}

/// Reads a pointer-sized little-endian value (4 or 8 bytes).
#[inline]
pub fn get_pointer_le(data: &[u8], offset: usize, pointer_size: u32) -> Option<u64> {
    if pointer_size == 8 {
        get_u64_le(data, offset)
    } else {
        get_u32_le(data, offset).map(u64::from)
    }
}

// =============================================================================
// String Scanning
// =============================================================================

/// Finds the position of the first null byte in a slice.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Returns the bytes of the NUL-terminated string starting at `offset`.
///
/// Returns `None` if `offset` is out of range or no terminator exists
/// before the end of `data`.
#[inline]
pub fn read_cstr(data: &[u8], offset: usize) -> Option<&[u8]> {
    let tail = data.get(offset..)?;
    memchr::memchr(0, tail).map(|len| &tail[..len])
}

/// Decodes a fixed-width, possibly unterminated name field (segment and
/// section names are 16 bytes with no guaranteed terminator).
#[inline]
pub fn fixed_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(&raw[..memchr_null(raw)]).into_owned()
}

// =============================================================================
// LEB128
// =============================================================================

/// Reason a LEB128 read failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LebError {
    /// Ran off the end of the data before the final byte.
    Malformed,
    /// Value does not fit in 64 bits.
    TooBig,
}

impl fmt::Display for LebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LebError::Malformed => f.write_str("malformed uleb128"),
            LebError::TooBig => f.write_str("uleb128 too big for uint64"),
        }
    }
}

/// Reads an unsigned LEB128 value at `*pos`, never reading at or past `end`.
///
/// On success `*pos` is advanced past the encoded value.
#[inline]
pub fn read_uleb128(data: &[u8], pos: &mut usize, end: usize) -> Result<u64, LebError> {
    let end = end.min(data.len());
    let mut p = *pos;
    if p >= end {
        return Err(LebError::Malformed);
    }

    // Fast path: single byte values dominate opcode streams
    let b0 = data[p];
    if b0 < 0x80 {
        *pos = p + 1;
        return Ok(b0 as u64);
    }

    let mut result: u64 = 0;
    let mut bit = 0u32;
    loop {
        if p == end {
            return Err(LebError::Malformed);
        }
        let byte = data[p];
        let slice = (byte & 0x7F) as u64;
        if bit > 63 {
            return Err(LebError::TooBig);
        }
        result |= slice << bit;
        bit += 7;
        p += 1;
        if byte & 0x80 == 0 {
            break;
        }
    }
    *pos = p;
    Ok(result)
}

/// Reads a signed LEB128 value at `*pos`, never reading at or past `end`.
#[inline]
pub fn read_sleb128(data: &[u8], pos: &mut usize, end: usize) -> Result<i64, LebError> {
    let end = end.min(data.len());
    let mut p = *pos;
    let mut result: i64 = 0;
    let mut bit = 0u32;
    let mut byte;
    loop {
        if p >= end {
            return Err(LebError::Malformed);
        }
        byte = data[p];
        p += 1;
        if bit < 64 {
            result |= ((byte & 0x7F) as i64) << bit;
        }
        bit += 7;
        if byte & 0x80 == 0 {
            break;
        }
    }
    // sign extend negative numbers
    if (byte & 0x40) != 0 && bit < 64 {
        result |= -1i64 << bit;
    }
    *pos = p;
    Ok(result)
}

/// Writes an unsigned LEB128 value to a buffer.
pub fn write_uleb128(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Writes a signed LEB128 value to a buffer.
pub fn write_sleb128(mut value: i64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

// =============================================================================
// Range Arithmetic
// =============================================================================

/// Returns true if `lhs + rhs` overflows or is greater than `limit`.
#[inline(always)]
pub const fn greater_than_add_or_overflow(lhs: u64, rhs: u64, limit: u64) -> bool {
    match lhs.checked_add(rhs) {
        Some(sum) => sum > limit,
        None => true,
    }
}

/// Returns `data[offset..offset + len]` if the whole range is in bounds.
#[inline]
pub fn sub_slice(data: &[u8], offset: u64, len: u64) -> Option<&[u8]> {
    if greater_than_add_or_overflow(offset, len, data.len() as u64) {
        return None;
    }
    Some(&data[offset as usize..(offset + len) as usize])
}

// =============================================================================
// Alignment Utilities
// =============================================================================

/// Aligns a value up to the given power-of-two alignment.
///
/// Saturates at the highest aligned value instead of wrapping.
#[inline(always)]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value.saturating_add(alignment - 1) & !(alignment - 1)
}
