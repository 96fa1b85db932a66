//! Big data (db) fan-out for values larger than one data cell can hold.
//!
//! Data longer than 16,344 bytes is split into chunks of that size, each
//! in its own cell; a blocklist cell lists the chunk references in order,
//! and a small "db" header cell carries the chunk count and the blocklist
//! reference. The value key points at the header and keeps the full,
//! unchunked length.

use crate::alloc::Allocator;
use crate::cell::CellClass;
use crate::dirty::DirtyTracker;
use crate::error::{EngineError, Result};
use crate::mapping::HiveMapping;
use crate::utils::{read_u16_le, read_u32_le, write_u16_le, write_u32_le};

/// Maximum raw payload per data chunk (and per plain data cell).
pub const BIG_DATA_CHUNK_SIZE: usize = 16_344;

/// Big data block header structure.
///
/// Format:
/// ```text
/// Offset  Size  Description
/// 0x00    2     Signature ("db")
/// 0x02    2     Number of segments
/// 0x04    4     Reference to the segment list
/// ```
#[derive(Debug, Clone)]
pub struct BigDataBlock {
    /// Number of data segments
    pub segment_count: u16,

    /// Reference to the list of segment references
    pub segment_list_offset: u32,
}

impl BigDataBlock {
    /// Minimum size of a big data block header
    const MIN_SIZE: usize = 8;

    /// Parses a big data block header from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell payload (excluding size field, starting with the
    ///   "db" signature)
    /// * `offset` - Reference of this cell for error reporting
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(EngineError::corrupt_cell(offset, "truncated db header"));
        }

        if &data[0..2] != b"db" {
            return Err(EngineError::corrupt_cell(
                offset,
                format!("expected 'db' signature, found {:?}", &data[0..2]),
            ));
        }

        let segment_count = read_u16_le(data, 0x02)?;
        let segment_list_offset = read_u32_le(data, 0x04)?;

        Ok(BigDataBlock {
            segment_count,
            segment_list_offset,
        })
    }

    /// Serializes a db header payload.
    pub fn serialize(segment_count: u16, segment_list_offset: u32) -> Vec<u8> {
        let mut buf = vec![0u8; Self::MIN_SIZE];
        buf[0..2].copy_from_slice(b"db");
        write_u16_le(&mut buf, 0x02, segment_count);
        write_u32_le(&mut buf, 0x04, segment_list_offset);
        buf
    }
}

/// Stores `data` as a big-data fan-out and returns the reference of the
/// db header cell.
///
/// Chunks are allocated first, then the blocklist, then the header, so
/// every reference written is final even if an allocation grows the hive
/// in between.
pub fn write(
    alloc: &mut Allocator,
    mapping: &mut HiveMapping,
    dirty: &mut DirtyTracker,
    data: &[u8],
) -> Result<u32> {
    debug_assert!(data.len() > BIG_DATA_CHUNK_SIZE);

    let mut chunk_refs = Vec::with_capacity(data.len().div_ceil(BIG_DATA_CHUNK_SIZE));

    for chunk in data.chunks(BIG_DATA_CHUNK_SIZE) {
        let chunk_ref = alloc.alloc(mapping, dirty, 4 + chunk.len(), CellClass::BigData)?;
        mapping.cell_payload_mut(chunk_ref)?[..chunk.len()].copy_from_slice(chunk);
        chunk_refs.push(chunk_ref);
    }

    let list_payload = crate::value_list::serialize(&chunk_refs);
    let list_ref = alloc.alloc(mapping, dirty, 4 + list_payload.len(), CellClass::BigData)?;
    mapping.cell_payload_mut(list_ref)?[..list_payload.len()].copy_from_slice(&list_payload);

    let header_payload = BigDataBlock::serialize(chunk_refs.len() as u16, list_ref);
    let header_ref = alloc.alloc(mapping, dirty, 4 + header_payload.len(), CellClass::BigData)?;
    mapping.cell_payload_mut(header_ref)?[..header_payload.len()]
        .copy_from_slice(&header_payload);

    Ok(header_ref)
}

/// Reads the chunk references of the fan-out rooted at `header_ref`.
pub fn chunk_refs(mapping: &HiveMapping, header_ref: u32) -> Result<(BigDataBlock, Vec<u32>)> {
    let db = BigDataBlock::parse(mapping.cell_payload(header_ref)?, header_ref)?;

    let list = mapping.cell_payload(db.segment_list_offset)?;
    let needed = db.segment_count as usize * 4;
    if list.len() < needed {
        return Err(EngineError::corrupt_cell(
            db.segment_list_offset,
            "blocklist shorter than its segment count",
        ));
    }

    let mut refs = Vec::with_capacity(db.segment_count as usize);
    for i in 0..db.segment_count as usize {
        // Some writers set the high bit on segment references; mask it.
        refs.push(read_u32_le(list, i * 4)? & 0x7FFF_FFFF);
    }

    Ok((db, refs))
}

/// Assembles the full value data from the fan-out rooted at `header_ref`.
///
/// Each chunk contributes at most [`BIG_DATA_CHUNK_SIZE`] bytes; the last
/// chunk is truncated to whatever satisfies `total_len`.
pub fn read_data(mapping: &HiveMapping, header_ref: u32, total_len: usize) -> Result<Vec<u8>> {
    let (_, refs) = chunk_refs(mapping, header_ref)?;

    let mut data = Vec::with_capacity(total_len);
    for chunk_ref in refs {
        let remaining = total_len - data.len();
        if remaining == 0 {
            break;
        }

        let payload = mapping.cell_payload(chunk_ref)?;
        let take = remaining.min(BIG_DATA_CHUNK_SIZE).min(payload.len());
        data.extend_from_slice(&payload[..take]);
    }

    if data.len() < total_len {
        return Err(EngineError::corrupt_cell(
            header_ref,
            format!(
                "big data holds {} bytes, value claims {}",
                data.len(),
                total_len
            ),
        ));
    }

    Ok(data)
}

/// Frees the whole fan-out: every chunk, the blocklist, the header.
pub fn free(
    alloc: &mut Allocator,
    mapping: &mut HiveMapping,
    dirty: &mut DirtyTracker,
    header_ref: u32,
) -> Result<()> {
    let (db, refs) = chunk_refs(mapping, header_ref)?;

    for chunk_ref in refs {
        alloc.free(mapping, dirty, chunk_ref)?;
    }
    alloc.free(mapping, dirty, db.segment_list_offset)?;
    alloc.free(mapping, dirty, header_ref)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bigdata_minimum_size() {
        let data = vec![0u8; 7];
        assert!(BigDataBlock::parse(&data, 0).is_err());
    }

    #[test]
    fn test_bigdata_invalid_signature() {
        let mut data = vec![0u8; 8];
        data[0..2].copy_from_slice(b"XX");
        assert!(BigDataBlock::parse(&data, 0).is_err());
    }

    #[test]
    fn test_header_roundtrip() {
        let buf = BigDataBlock::serialize(5, 0x20);
        let db = BigDataBlock::parse(&buf, 0).unwrap();
        assert_eq!(db.segment_count, 5);
        assert_eq!(db.segment_list_offset, 0x20);
    }
}
