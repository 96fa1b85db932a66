//! Value list codec: a flat cell of little-endian VK references.
//!
//! Unlike subkey lists, value lists carry no signature, no hashes, and no
//! ordering guarantee; the on-disk order is the order. The owning key
//! node's value count is the authoritative length.

use crate::error::{EngineError, Result};
use crate::mapping::HiveMapping;
use crate::utils::{read_u32_le, write_u32_le};

/// Reads `count` VK references from the value list cell at `list_ref`.
pub fn read(mapping: &HiveMapping, list_ref: u32, count: u32) -> Result<Vec<u32>> {
    let payload = mapping.cell_payload(list_ref)?;

    let needed = count as usize * 4;
    if payload.len() < needed {
        return Err(EngineError::corrupt_cell(
            list_ref,
            format!(
                "value list holds {} bytes, {} entries need {}",
                payload.len(),
                count,
                needed
            ),
        ));
    }

    let mut refs = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        refs.push(read_u32_le(payload, i * 4)?);
    }

    Ok(refs)
}

/// Serializes a value list payload.
pub fn serialize(refs: &[u32]) -> Vec<u8> {
    let mut buf = vec![0u8; refs.len() * 4];
    for (i, r) in refs.iter().enumerate() {
        write_u32_le(&mut buf, i * 4, *r);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize() {
        let buf = serialize(&[0x10, 0x20, 0x30]);
        assert_eq!(buf.len(), 12);
        assert_eq!(read_u32_le(&buf, 0).unwrap(), 0x10);
        assert_eq!(read_u32_le(&buf, 4).unwrap(), 0x20);
        assert_eq!(read_u32_le(&buf, 8).unwrap(), 0x30);
    }
}
