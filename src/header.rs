//! Hive base block (header) parsing and serialization.
//!
//! The base block is the first 4096 bytes (0x1000) of a registry hive file.
//! It contains metadata about the hive including version, timestamps, the
//! root key cell reference, and the paired sequence numbers that act as the
//! commit marker.

use crate::error::{EngineError, Result};
use crate::utils::{
    calculate_checksum, read_u32_le, read_u64_le, read_utf16_string, write_u32_le, write_u64_le,
};
use std::fmt;

/// Size of the base block in bytes.
pub const BASE_BLOCK_SIZE: usize = 4096;

/// Expected signature for a valid registry hive ("regf").
pub const REGF_SIGNATURE: &[u8; 4] = b"regf";

/// Offset of the primary sequence number.
pub const PRIMARY_SEQUENCE_OFFSET: usize = 0x04;

/// Offset of the secondary sequence number.
pub const SECONDARY_SEQUENCE_OFFSET: usize = 0x08;

/// Offset of the last-written FILETIME.
const LAST_WRITTEN_OFFSET: usize = 0x0C;

/// Offset of the hive data length field.
const HIVE_LENGTH_OFFSET: usize = 0x28;

/// Offset of the file name in the base block.
const FILE_NAME_OFFSET: usize = 0x30;

/// Length of the file name field (64 UTF-16LE characters = 128 bytes).
const FILE_NAME_LENGTH: usize = 128;

/// Offset of the checksum field in the base block.
const CHECKSUM_OFFSET: usize = 0x1FC;

/// Hive base block header.
#[derive(Debug, Clone)]
pub struct BaseBlock {
    /// Primary sequence number.
    pub primary_sequence: u32,

    /// Secondary sequence number.
    pub secondary_sequence: u32,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Major version of the hive format.
    pub major_version: u32,

    /// Minor version of the hive format.
    pub minor_version: u32,

    /// File type (0 = normal, 1 = transaction log).
    pub file_type: u32,

    /// File format (1 = direct memory load).
    pub file_format: u32,

    /// Reference to the root key cell (relative to first hbin).
    pub root_cell_offset: u32,

    /// Length of hive data in bytes (everything after the base block).
    pub hive_length: u32,

    /// Clustering factor (always 1).
    pub clustering_factor: u32,

    /// File name (embedded, 64 UTF-16LE characters).
    pub file_name: String,

    /// Checksum (XOR of the first 508 bytes).
    pub checksum: u32,
}

impl BaseBlock {
    /// Parses a base block from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `CorruptHeader` if the data is too small, the signature is
    /// wrong, the checksum does not match, or the version is unsupported.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BASE_BLOCK_SIZE {
            return Err(EngineError::corrupt_header(format!(
                "hive too small: {} bytes (minimum {})",
                data.len(),
                BASE_BLOCK_SIZE
            )));
        }

        if &data[0..4] != REGF_SIGNATURE {
            return Err(EngineError::corrupt_header(format!(
                "bad signature {:?}, expected {:?}",
                &data[0..4],
                REGF_SIGNATURE
            )));
        }

        let primary_sequence = read_u32_le(data, PRIMARY_SEQUENCE_OFFSET)?;
        let secondary_sequence = read_u32_le(data, SECONDARY_SEQUENCE_OFFSET)?;
        let last_written = read_u64_le(data, LAST_WRITTEN_OFFSET)?;

        let major_version = read_u32_le(data, 0x14)?;
        let minor_version = read_u32_le(data, 0x18)?;
        let file_type = read_u32_le(data, 0x1C)?;
        let file_format = read_u32_le(data, 0x20)?;
        let root_cell_offset = read_u32_le(data, 0x24)?;
        let hive_length = read_u32_le(data, HIVE_LENGTH_OFFSET)?;
        let clustering_factor = read_u32_le(data, 0x2C)?;

        let file_name_bytes = &data[FILE_NAME_OFFSET..FILE_NAME_OFFSET + FILE_NAME_LENGTH];
        let file_name = read_utf16_string(file_name_bytes, FILE_NAME_OFFSET as u32)
            .unwrap_or_default();

        let checksum = read_u32_le(data, CHECKSUM_OFFSET)?;

        let calculated = calculate_checksum(data);
        if checksum != calculated {
            return Err(EngineError::corrupt_header(format!(
                "checksum mismatch: stored {:#x}, calculated {:#x}",
                checksum, calculated
            )));
        }

        // Support versions 1.3 through 1.6.
        if major_version != 1 || !(3..=6).contains(&minor_version) {
            return Err(EngineError::corrupt_header(format!(
                "unsupported hive version {}.{}",
                major_version, minor_version
            )));
        }

        Ok(BaseBlock {
            primary_sequence,
            secondary_sequence,
            last_written,
            major_version,
            minor_version,
            file_type,
            file_format,
            root_cell_offset,
            hive_length,
            clustering_factor,
            file_name,
            checksum,
        })
    }

    /// Validates the header geometry against the actual file length.
    ///
    /// The data size must be a non-zero multiple of 4 KiB and fit inside
    /// the file after the base block; the root reference must land inside
    /// the data area.
    pub fn validate_geometry(&self, file_len: u64) -> Result<()> {
        let hive_length = u64::from(self.hive_length);

        if self.hive_length == 0 || self.hive_length % 4096 != 0 {
            return Err(EngineError::corrupt_header(format!(
                "data size {:#x} is not a non-zero multiple of 4 KiB",
                self.hive_length
            )));
        }

        if file_len < BASE_BLOCK_SIZE as u64 || hive_length > file_len - BASE_BLOCK_SIZE as u64 {
            return Err(EngineError::corrupt_header(format!(
                "data size {:#x} exceeds file length {:#x}",
                self.hive_length, file_len
            )));
        }

        if self.root_cell_offset == 0 || u64::from(self.root_cell_offset) >= hive_length {
            return Err(EngineError::corrupt_header(format!(
                "root reference {:#x} outside the data area",
                self.root_cell_offset
            )));
        }

        Ok(())
    }

    /// Returns true if the hive is in a consistent state.
    ///
    /// The hive is consistent when primary and secondary sequence numbers
    /// match.
    pub fn is_consistent(&self) -> bool {
        self.primary_sequence == self.secondary_sequence
    }

    /// Converts the last written timestamp to a `chrono` timestamp.
    pub fn last_written_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        crate::utils::datetime_from_filetime(self.last_written)
    }

    /// Serializes a complete header page for a freshly created hive.
    ///
    /// `page` must be the full 4096-byte header page; everything not set
    /// here stays zero (including the opaque per-GUID transaction fields).
    pub fn write_initial(
        page: &mut [u8],
        root_cell_offset: u32,
        hive_length: u32,
        minor_version: u32,
        file_name: &str,
    ) {
        debug_assert!(page.len() >= BASE_BLOCK_SIZE);

        page[0..4].copy_from_slice(REGF_SIGNATURE);
        write_u32_le(page, PRIMARY_SEQUENCE_OFFSET, 1);
        write_u32_le(page, SECONDARY_SEQUENCE_OFFSET, 1);
        write_u64_le(page, LAST_WRITTEN_OFFSET, crate::utils::filetime_now());
        write_u32_le(page, 0x14, 1);
        write_u32_le(page, 0x18, minor_version);
        write_u32_le(page, 0x1C, 0); // file type: normal hive
        write_u32_le(page, 0x20, 1); // file format: direct memory load
        write_u32_le(page, 0x24, root_cell_offset);
        write_u32_le(page, HIVE_LENGTH_OFFSET, hive_length);
        write_u32_le(page, 0x2C, 1); // clustering factor

        let name_area = &mut page[FILE_NAME_OFFSET..FILE_NAME_OFFSET + FILE_NAME_LENGTH];
        name_area.fill(0);
        for (i, unit) in file_name.encode_utf16().take(64).enumerate() {
            name_area[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }

        Self::refresh_checksum(page);
    }

    /// Patches the commit-relevant header fields in place.
    ///
    /// Only the sequence numbers, last-written timestamp, and hive length
    /// are touched; every other header byte (including fields opaque to
    /// the engine) is preserved, then the checksum is recomputed.
    pub fn patch_for_commit(
        page: &mut [u8],
        primary_sequence: u32,
        secondary_sequence: u32,
        last_written: u64,
        hive_length: u32,
    ) {
        write_u32_le(page, PRIMARY_SEQUENCE_OFFSET, primary_sequence);
        write_u32_le(page, SECONDARY_SEQUENCE_OFFSET, secondary_sequence);
        write_u64_le(page, LAST_WRITTEN_OFFSET, last_written);
        write_u32_le(page, HIVE_LENGTH_OFFSET, hive_length);
        Self::refresh_checksum(page);
    }

    /// Recomputes and stores the header checksum.
    pub fn refresh_checksum(page: &mut [u8]) {
        let checksum = calculate_checksum(page);
        write_u32_le(page, CHECKSUM_OFFSET, checksum);
    }
}

impl fmt::Display for BaseBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Registry Hive Header:\n\
             - Version: {}.{}\n\
             - Root Cell Offset: {:#x}\n\
             - Hive Length: {} bytes\n\
             - Consistent: {}\n\
             - File Name: {}",
            self.major_version,
            self.minor_version,
            self.root_cell_offset,
            self.hive_length,
            self.is_consistent(),
            self.file_name
        )
    }
}
