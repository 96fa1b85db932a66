//! Utility functions for binary parsing, serialization, and string
//! conversion.

use crate::error::{EngineError, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use encoding_rs::UTF_16LE;
use std::io::Cursor;

/// Offset where hive bins start (after base block)
pub const HBIN_START_OFFSET: u32 = 0x1000;

/// Sentinel reference meaning "none".
pub const REF_NONE: u32 = 0xFFFF_FFFF;

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_DIFF: i64 = 11_644_473_600;

/// Reads an ASCII string from a byte slice, trimming null terminators.
///
/// Registry strings are often null-terminated, so we trim trailing nulls.
/// Uses lossy conversion to handle any invalid UTF-8 bytes gracefully.
pub fn read_ascii_string(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .to_string()
}

/// Reads a UTF-16LE string from a byte slice, trimming null terminators.
///
/// # Errors
///
/// Returns an error if the data length is not even (UTF-16 requires 2-byte
/// units) or if the UTF-16 decoding fails.
pub fn read_utf16_string(data: &[u8], offset: u32) -> Result<String> {
    if data.is_empty() {
        return Ok(String::new());
    }

    if data.len() % 2 != 0 {
        return Err(EngineError::corrupt_cell(offset, "odd UTF-16LE length"));
    }

    let (decoded, _encoding, had_errors) = UTF_16LE.decode(data);

    if had_errors {
        return Err(EngineError::corrupt_cell(offset, "invalid UTF-16LE data"));
    }

    Ok(decoded.trim_end_matches('\0').to_string())
}

/// Reads a u32 from a byte slice at the given offset.
pub fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    if offset + 4 > data.len() {
        return Err(EngineError::corrupt_cell(
            offset as u32,
            "truncated u32 field",
        ));
    }

    let mut cursor = Cursor::new(&data[offset..offset + 4]);
    Ok(cursor.read_u32::<LittleEndian>()?)
}

/// Reads a u16 from a byte slice at the given offset.
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    if offset + 2 > data.len() {
        return Err(EngineError::corrupt_cell(
            offset as u32,
            "truncated u16 field",
        ));
    }

    let mut cursor = Cursor::new(&data[offset..offset + 2]);
    Ok(cursor.read_u16::<LittleEndian>()?)
}

/// Reads an i32 from a byte slice at the given offset.
pub fn read_i32_le(data: &[u8], offset: usize) -> Result<i32> {
    if offset + 4 > data.len() {
        return Err(EngineError::corrupt_cell(
            offset as u32,
            "truncated i32 field",
        ));
    }

    let mut cursor = Cursor::new(&data[offset..offset + 4]);
    Ok(cursor.read_i32::<LittleEndian>()?)
}

/// Reads a u64 from a byte slice at the given offset.
pub fn read_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    if offset + 8 > data.len() {
        return Err(EngineError::corrupt_cell(
            offset as u32,
            "truncated u64 field",
        ));
    }

    let mut cursor = Cursor::new(&data[offset..offset + 8]);
    Ok(cursor.read_u64::<LittleEndian>()?)
}

/// Writes a u16 into a byte slice at the given offset.
pub fn write_u16_le(data: &mut [u8], offset: usize, value: u16) {
    LittleEndian::write_u16(&mut data[offset..offset + 2], value);
}

/// Writes a u32 into a byte slice at the given offset.
pub fn write_u32_le(data: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut data[offset..offset + 4], value);
}

/// Writes an i32 into a byte slice at the given offset.
pub fn write_i32_le(data: &mut [u8], offset: usize, value: i32) {
    LittleEndian::write_i32(&mut data[offset..offset + 4], value);
}

/// Writes a u64 into a byte slice at the given offset.
pub fn write_u64_le(data: &mut [u8], offset: usize, value: u64) {
    LittleEndian::write_u64(&mut data[offset..offset + 8], value);
}

/// Calculates the XOR checksum of the base block.
///
/// The checksum covers the 127 little-endian u32 words of the first 508
/// bytes. Two result values are reserved and remapped: 0x00000000 becomes
/// 0x00000001 and 0xFFFFFFFF becomes 0xFFFFFFFE.
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut checksum: u32 = 0;

    for i in (0..0x1FC).step_by(4) {
        if i + 4 <= data.len() {
            checksum ^= LittleEndian::read_u32(&data[i..i + 4]);
        }
    }

    match checksum {
        0x0000_0000 => 0x0000_0001,
        0xFFFF_FFFF => 0xFFFF_FFFE,
        other => other,
    }
}

/// Converts a relative cell reference to an absolute file offset.
///
/// Cell references in the registry are relative to the first hbin (at
/// 0x1000). This function adds 0x1000 to convert to an absolute offset.
///
/// # Errors
///
/// Returns `EngineError::InvalidRef` if the addition would overflow.
#[inline]
pub fn cell_offset_to_absolute(cell_offset: u32) -> Result<u32> {
    cell_offset
        .checked_add(HBIN_START_OFFSET)
        .ok_or(EngineError::InvalidRef {
            reference: cell_offset,
            reason: "reference overflows the file",
        })
}

/// Converts an absolute file offset to a relative cell reference.
///
/// # Errors
///
/// Returns `EngineError::InvalidRef` if the offset is before hbin start.
#[inline]
pub fn absolute_to_cell_offset(absolute_offset: u32) -> Result<u32> {
    if absolute_offset < HBIN_START_OFFSET {
        return Err(EngineError::InvalidRef {
            reference: absolute_offset,
            reason: "absolute offset before hbin start",
        });
    }
    Ok(absolute_offset - HBIN_START_OFFSET)
}

/// Rounds a size up to the next multiple of 8 (cell alignment).
#[inline]
pub fn align_cell(size: usize) -> usize {
    (size.max(8) + 7) & !7
}

/// Rounds a size up to the next multiple of 4096 (page alignment).
#[inline]
pub fn align_page(size: usize) -> usize {
    (size + 0xFFF) & !0xFFF
}

/// Lowercases a name character by character using simple Unicode lowercase.
///
/// Names on disk remain case-preserving; this form is used only for
/// comparison and index keys. Locale-dependent folding is never applied.
pub fn lowercase_name(name: &str) -> String {
    name.chars().flat_map(char::to_lowercase).collect()
}

/// Encodes a key or value name for on-disk storage.
///
/// Names consisting entirely of ASCII code points are stored one byte per
/// character with the "compressed" flag; anything else is stored UTF-16LE.
///
/// Returns the encoded bytes and whether the compressed form was used.
pub fn encode_name(name: &str) -> (Vec<u8>, bool) {
    if name.chars().all(|c| (c as u32) <= 0x7F) {
        (name.bytes().collect(), true)
    } else {
        let mut bytes = Vec::with_capacity(name.len() * 2);
        for unit in name.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        (bytes, false)
    }
}

/// Decodes an on-disk name according to its compressed flag.
pub fn decode_name(data: &[u8], compressed: bool, offset: u32) -> Result<String> {
    if compressed {
        Ok(read_ascii_string(data))
    } else {
        read_utf16_string(data, offset)
    }
}

/// Returns the current time as a Windows FILETIME (100 ns ticks since
/// 1601-01-01 UTC).
pub fn filetime_now() -> u64 {
    filetime_from_datetime(chrono::Utc::now())
}

/// Converts a `chrono` timestamp to a Windows FILETIME.
pub fn filetime_from_datetime(dt: chrono::DateTime<chrono::Utc>) -> u64 {
    let seconds = dt.timestamp() + FILETIME_UNIX_DIFF;
    if seconds < 0 {
        return 0;
    }
    (seconds as u64) * 10_000_000 + u64::from(dt.timestamp_subsec_nanos() / 100)
}

/// Converts a Windows FILETIME to a `chrono` timestamp.
pub fn datetime_from_filetime(filetime: u64) -> Option<chrono::DateTime<chrono::Utc>> {
    let seconds = (filetime / 10_000_000) as i64 - FILETIME_UNIX_DIFF;
    let nanos = ((filetime % 10_000_000) * 100) as u32;

    chrono::DateTime::from_timestamp(seconds, nanos)
}
