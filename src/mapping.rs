//! Read-write memory mapping of a hive file.
//!
//! The mapping owns the file handle and the mutable mmap, and is the sole
//! authority for turning cell references into byte views. Growth remaps
//! the file; because remapping may move the base pointer, every slice
//! handed out before a growth is invalid afterwards. The borrow checker
//! enforces this: all views borrow the mapping, and every call that can
//! grow takes `&mut self`.

use crate::error::{EngineError, Result};
use crate::header::BASE_BLOCK_SIZE;
use crate::utils::{read_i32_le, write_i32_le, REF_NONE};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::{debug, trace};

/// Page granularity for growth and truncation.
pub const PAGE_SIZE: usize = 4096;

/// A hive file mapped read-write into memory.
pub struct HiveMapping {
    file: File,
    map: MmapMut,
}

impl HiveMapping {
    /// Opens a hive file read-write and maps it entirely into memory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let file_size = file.metadata()?.len() as usize;
        if file_size < BASE_BLOCK_SIZE {
            return Err(EngineError::corrupt_header(format!(
                "hive too small: {} bytes (minimum {})",
                file_size, BASE_BLOCK_SIZE
            )));
        }

        // SAFETY: the file is held open for the lifetime of the mapping,
        // the length was just validated, and all access goes through the
        // bounds-checked cell contract below. The engine is the single
        // owner of the file while the hive is open.
        let map = unsafe { MmapMut::map_mut(&file)? };
        debug!(size = map.len(), "memory mapped hive file");

        Ok(Self { file, map })
    }

    /// Creates a new file with the given initial contents and maps it.
    ///
    /// Fails if the file already exists.
    pub fn create<P: AsRef<Path>>(path: P, initial: &[u8]) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(initial.len() as u64)?;

        // SAFETY: as in `open`; the file was created and sized by us.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map.copy_from_slice(initial);

        Ok(Self { file, map })
    }

    /// Total mapped length in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Immutable view of the whole mapping.
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// Mutable view of the whole mapping.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// The underlying file handle (for fd-level syncs).
    pub fn file(&self) -> &File {
        &self.file
    }

    /// The raw mapping (for range flushes).
    pub fn map(&self) -> &MmapMut {
        &self.map
    }

    /// Appends `pages` zeroed 4 KiB pages to the file and remaps.
    ///
    /// Every byte view obtained before this call is invalidated.
    pub fn grow_by_pages(&mut self, pages: usize) -> Result<()> {
        let old_len = self.map.len();
        let new_len = old_len
            .checked_add(pages * PAGE_SIZE)
            .ok_or_else(|| EngineError::OutOfSpace("file length overflow".into()))?;

        self.file
            .set_len(new_len as u64)
            .map_err(|e| EngineError::OutOfSpace(e.to_string()))?;

        // SAFETY: as in `open`; the file was just extended to new_len.
        self.map = unsafe {
            MmapMut::map_mut(&self.file).map_err(|e| EngineError::OutOfSpace(e.to_string()))?
        };
        trace!(old_len, new_len, "grew hive mapping");

        Ok(())
    }

    /// Truncates the file to `len` bytes and remaps.
    ///
    /// `len` must be page-aligned and at least one page beyond the base
    /// block.
    pub fn truncate_to_len(&mut self, len: usize) -> Result<()> {
        if len % PAGE_SIZE != 0 || len < BASE_BLOCK_SIZE + PAGE_SIZE {
            return Err(EngineError::OutOfSpace(format!(
                "truncation target {:#x} is not a valid hive length",
                len
            )));
        }

        self.file.set_len(len as u64)?;
        // SAFETY: as in `open`; the file was just resized.
        self.map = unsafe { MmapMut::map_mut(&self.file)? };

        Ok(())
    }

    /// Converts a reference into its absolute position, validating range.
    fn checked_absolute(&self, reference: u32) -> Result<usize> {
        if reference == 0 {
            return Err(EngineError::invalid_ref(reference, "zero reference"));
        }
        if reference == REF_NONE {
            return Err(EngineError::invalid_ref(reference, "sentinel reference"));
        }

        let abs = BASE_BLOCK_SIZE + reference as usize;
        if abs + 4 > self.map.len() {
            return Err(EngineError::invalid_ref(
                reference,
                "reference beyond end of mapping",
            ));
        }

        Ok(abs)
    }

    /// Reads the signed size field of the cell at `reference`.
    ///
    /// Works for both free and allocated cells; validates alignment and
    /// bounds but not the sign.
    pub fn cell_size_raw(&self, reference: u32) -> Result<i32> {
        let abs = self.checked_absolute(reference)?;
        let size = read_i32_le(&self.map, abs)?;
        let abs_size = size.unsigned_abs() as usize;

        if abs_size < 8 || abs_size % 8 != 0 {
            return Err(EngineError::corrupt_cell(
                reference,
                format!("cell size {} is not a multiple of 8 at least 8", size),
            ));
        }
        if abs + abs_size > self.map.len() {
            return Err(EngineError::corrupt_cell(
                reference,
                format!("cell of {} bytes runs past the mapping", abs_size),
            ));
        }

        Ok(size)
    }

    /// Overwrites the signed size field of the cell at `reference`.
    ///
    /// Allocator use only; callers are responsible for keeping the free
    /// lists in step.
    pub(crate) fn set_cell_size_raw(&mut self, reference: u32, size: i32) -> Result<()> {
        let abs = self.checked_absolute(reference)?;
        write_i32_le(&mut self.map, abs, size);
        Ok(())
    }

    /// Payload capacity in bytes of the allocated cell at `reference`.
    pub fn cell_capacity(&self, reference: u32) -> Result<usize> {
        let size = self.cell_size_raw(reference)?;
        if size >= 0 {
            return Err(EngineError::invalid_ref(
                reference,
                "reference points at a free cell",
            ));
        }
        Ok(size.unsigned_abs() as usize - 4)
    }

    /// Immutable payload view of the allocated cell at `reference`.
    ///
    /// The view excludes the 4-byte size prefix. Errors on a zero or
    /// sentinel reference, an out-of-bounds reference, or a free cell.
    pub fn cell_payload(&self, reference: u32) -> Result<&[u8]> {
        let capacity = self.cell_capacity(reference)?;
        let abs = BASE_BLOCK_SIZE + reference as usize;
        Ok(&self.map[abs + 4..abs + 4 + capacity])
    }

    /// Mutable payload view of the allocated cell at `reference`.
    pub fn cell_payload_mut(&mut self, reference: u32) -> Result<&mut [u8]> {
        let capacity = self.cell_capacity(reference)?;
        let abs = BASE_BLOCK_SIZE + reference as usize;
        Ok(&mut self.map[abs + 4..abs + 4 + capacity])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::write_i32_le as w_i32;

    fn scratch_mapping() -> (tempfile::TempDir, HiveMapping) {
        let dir = tempfile::tempdir().unwrap();
        let mut initial = vec![0u8; BASE_BLOCK_SIZE + PAGE_SIZE];
        // One allocated 32-byte cell at ref 0x20, one free cell after it.
        w_i32(&mut initial, BASE_BLOCK_SIZE + 0x20, -32);
        w_i32(&mut initial, BASE_BLOCK_SIZE + 0x40, 64);
        let mapping = HiveMapping::create(dir.path().join("hive"), &initial).unwrap();
        (dir, mapping)
    }

    #[test]
    fn test_cell_contract() {
        let (_dir, mut mapping) = scratch_mapping();

        assert!(matches!(
            mapping.cell_payload(0),
            Err(EngineError::InvalidRef { .. })
        ));
        assert!(matches!(
            mapping.cell_payload(REF_NONE),
            Err(EngineError::InvalidRef { .. })
        ));
        assert!(matches!(
            mapping.cell_payload(0x0010_0000),
            Err(EngineError::InvalidRef { .. })
        ));
        // Free cell is rejected.
        assert!(matches!(
            mapping.cell_payload(0x40),
            Err(EngineError::InvalidRef { .. })
        ));

        let payload = mapping.cell_payload(0x20).unwrap();
        assert_eq!(payload.len(), 28);

        let payload = mapping.cell_payload_mut(0x20).unwrap();
        payload[0] = 0xAB;
        assert_eq!(mapping.cell_payload(0x20).unwrap()[0], 0xAB);
    }

    #[test]
    fn test_grow_zero_fills() {
        let (_dir, mut mapping) = scratch_mapping();
        let old_len = mapping.len();

        mapping.grow_by_pages(2).unwrap();
        assert_eq!(mapping.len(), old_len + 2 * PAGE_SIZE);
        assert!(mapping.as_slice()[old_len..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_truncate() {
        let (_dir, mut mapping) = scratch_mapping();
        mapping.grow_by_pages(3).unwrap();
        let target = BASE_BLOCK_SIZE + PAGE_SIZE;
        mapping.truncate_to_len(target).unwrap();
        assert_eq!(mapping.len(), target);

        assert!(mapping.truncate_to_len(target + 1).is_err());
    }
}
