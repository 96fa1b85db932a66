//! Hive bin (hbin) block parsing and serialization.
//!
//! Hive bins are 4KB-aligned blocks that contain registry cells. Each hbin
//! has a 32-byte header followed by a packed run of cells that tile the
//! rest of the bin exactly.

use crate::error::{EngineError, Result};
use crate::utils::{read_i32_le, read_u32_le, write_u32_le, write_u64_le};

/// Expected signature for hive bins ("hbin").
pub const HBIN_SIGNATURE: &[u8; 4] = b"hbin";

/// Size of an hbin header.
pub const HBIN_HEADER_SIZE: usize = 0x20;

/// Alignment and minimum size of an hbin.
pub const HBIN_ALIGNMENT: usize = 0x1000;

/// Hive bin header structure.
#[derive(Debug, Clone)]
pub struct HbinHeader {
    /// Offset of this hbin from the start of the hive bins (relative to 0x1000).
    pub offset: u32,

    /// Size of this hbin in bytes (including header).
    pub size: u32,

    /// Timestamp (Windows FILETIME).
    pub timestamp: u64,
}

impl HbinHeader {
    /// Parses an hbin header from raw bytes.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes starting at the hbin header.
    /// * `expected_offset` - Expected offset value for validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is too small, the signature is invalid,
    /// the self-offset does not match, or the size is not a positive
    /// multiple of 4 KiB.
    pub fn parse(data: &[u8], expected_offset: u32) -> Result<Self> {
        if data.len() < HBIN_HEADER_SIZE {
            return Err(EngineError::corrupt_cell(
                expected_offset,
                "truncated hbin header",
            ));
        }

        if &data[0..4] != HBIN_SIGNATURE {
            return Err(EngineError::corrupt_cell(
                expected_offset,
                format!("bad hbin signature {:?}", &data[0..4]),
            ));
        }

        let offset = read_u32_le(data, 0x04)?;
        let size = read_u32_le(data, 0x08)?;

        if offset != expected_offset {
            return Err(EngineError::corrupt_cell(
                expected_offset,
                format!("hbin self-offset {:#x} does not match position", offset),
            ));
        }

        if size == 0 || size as usize % HBIN_ALIGNMENT != 0 {
            return Err(EngineError::corrupt_cell(
                expected_offset,
                format!("hbin size {:#x} is not a positive multiple of 4 KiB", size),
            ));
        }

        let timestamp = u64::from(read_u32_le(data, 0x14)?)
            | (u64::from(read_u32_le(data, 0x18)?) << 32);

        Ok(HbinHeader {
            offset,
            size,
            timestamp,
        })
    }

    /// Serializes a fresh hbin header in place.
    ///
    /// `buf` must be at least `HBIN_HEADER_SIZE` bytes and is assumed to be
    /// zeroed; reserved and spare fields stay zero.
    pub fn write_initial(buf: &mut [u8], offset: u32, size: u32) {
        debug_assert!(buf.len() >= HBIN_HEADER_SIZE);
        buf[0..4].copy_from_slice(HBIN_SIGNATURE);
        write_u32_le(buf, 0x04, offset);
        write_u32_le(buf, 0x08, size);
        write_u64_le(buf, 0x14, crate::utils::filetime_now());
    }

    /// Returns the size of the data area (excluding the header).
    pub fn data_size(&self) -> u32 {
        self.size.saturating_sub(HBIN_HEADER_SIZE as u32)
    }
}

/// Iterator over the cells of one hbin's data area.
///
/// Yields every cell in on-disk order, free and allocated alike, enforcing
/// the cell invariants: |size| ≥ 8, |size| ≡ 0 mod 8, and the cell must
/// stay inside the bin.
pub struct HbinCellIterator<'a> {
    data: &'a [u8],
    offset: usize,
    hbin_offset: u32,
}

impl<'a> HbinCellIterator<'a> {
    /// Creates a new cell iterator for an hbin's data area.
    ///
    /// # Arguments
    ///
    /// * `data` - The hbin's data area (excluding header).
    /// * `hbin_offset` - The offset of this hbin from the first hbin.
    pub fn new(data: &'a [u8], hbin_offset: u32) -> Self {
        Self {
            data,
            offset: 0,
            hbin_offset,
        }
    }
}

impl<'a> Iterator for HbinCellIterator<'a> {
    type Item = Result<CellInfo<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let cell_offset = self.hbin_offset + HBIN_HEADER_SIZE as u32 + self.offset as u32;

        let size = match read_i32_le(self.data, self.offset) {
            Ok(s) => s,
            Err(e) => return Some(Err(e)),
        };

        let abs_size = size.unsigned_abs() as usize;

        if abs_size < 8 || abs_size % 8 != 0 {
            return Some(Err(EngineError::corrupt_cell(
                cell_offset,
                format!("cell size {} is not a multiple of 8 at least 8", size),
            )));
        }

        let data_start = self.offset + 4;
        let data_end = self.offset + abs_size;

        if data_end > self.data.len() {
            return Some(Err(EngineError::corrupt_cell(
                cell_offset,
                format!("cell of {} bytes runs past its hbin", abs_size),
            )));
        }

        let cell_info = CellInfo {
            offset: cell_offset,
            size: abs_size as u32,
            is_allocated: size < 0,
            data: &self.data[data_start..data_end],
        };

        self.offset = data_end;
        Some(Ok(cell_info))
    }
}

/// Information about a cell within an hbin.
#[derive(Debug)]
pub struct CellInfo<'a> {
    /// Reference of this cell (relative to the first hbin).
    pub offset: u32,

    /// Size of the cell (including the size field).
    pub size: u32,

    /// Whether this cell is allocated (true) or free (false).
    pub is_allocated: bool,

    /// Cell data (excluding the size field).
    pub data: &'a [u8],
}

impl<'a> CellInfo<'a> {
    /// Returns the cell type signature (first 2 bytes of data).
    pub fn cell_type(&self) -> Option<[u8; 2]> {
        if self.data.len() >= 2 {
            Some([self.data[0], self.data[1]])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::write_i32_le;

    #[test]
    fn test_invalid_signature() {
        let mut data = vec![0u8; HBIN_HEADER_SIZE];
        data[0..4].copy_from_slice(b"XXXX");

        assert!(HbinHeader::parse(&data, 0).is_err());
    }

    #[test]
    fn test_write_then_parse() {
        let mut data = vec![0u8; HBIN_ALIGNMENT];
        HbinHeader::write_initial(&mut data, 0x2000, 0x1000);
        let header = HbinHeader::parse(&data, 0x2000).unwrap();
        assert_eq!(header.offset, 0x2000);
        assert_eq!(header.size, 0x1000);
        assert_eq!(header.data_size(), 0x1000 - HBIN_HEADER_SIZE as u32);
    }

    #[test]
    fn test_cell_iteration() {
        // Two cells tiling 4064 bytes: one allocated 32-byte cell, one free
        // cell covering the rest.
        let mut area = vec![0u8; HBIN_ALIGNMENT - HBIN_HEADER_SIZE];
        let area_len = area.len();
        write_i32_le(&mut area, 0, -32);
        write_i32_le(&mut area, 32, (area_len - 32) as i32);

        let cells: Vec<_> = HbinCellIterator::new(&area, 0)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(cells.len(), 2);
        assert!(cells[0].is_allocated);
        assert_eq!(cells[0].size, 32);
        assert_eq!(cells[0].offset, HBIN_HEADER_SIZE as u32);
        assert!(!cells[1].is_allocated);
        assert_eq!(cells[1].offset, HBIN_HEADER_SIZE as u32 + 32);
    }

    #[test]
    fn test_misaligned_cell_rejected() {
        let mut area = vec![0u8; 64];
        write_i32_le(&mut area, 0, -12); // not a multiple of 8
        let result: Result<Vec<_>> = HbinCellIterator::new(&area, 0).collect();
        assert!(result.is_err());
    }
}
