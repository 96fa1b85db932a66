//! Key node (nk) parsing and serialization.

use crate::cell::KeyNodeFlags;
use crate::error::{EngineError, Result};
use crate::utils::{
    decode_name, encode_name, read_u16_le, read_u32_le, read_u64_le, write_u16_le, write_u32_le,
    write_u64_le, REF_NONE,
};

/// Minimum size of a key node structure in bytes.
pub const KEY_NODE_MIN_SIZE: usize = 76;

/// Offset of the key name in the key node structure.
pub const KEY_NAME_OFFSET: usize = 0x4C;

// Payload-relative field offsets, shared with the editors for in-place
// patching.
pub(crate) const NK_FLAGS: usize = 0x02;
pub(crate) const NK_LAST_WRITTEN: usize = 0x04;
pub(crate) const NK_PARENT: usize = 0x10;
pub(crate) const NK_SUBKEY_COUNT: usize = 0x14;
pub(crate) const NK_SUBKEY_LIST: usize = 0x1C;
pub(crate) const NK_VALUE_COUNT: usize = 0x24;
pub(crate) const NK_VALUE_LIST: usize = 0x28;
pub(crate) const NK_SECURITY: usize = 0x2C;
pub(crate) const NK_MAX_SUBKEY_NAME: usize = 0x34;
pub(crate) const NK_MAX_VALUE_NAME: usize = 0x3C;
pub(crate) const NK_MAX_VALUE_DATA: usize = 0x40;
pub(crate) const NK_NAME_LENGTH: usize = 0x48;

/// Key node (nk) structure.
///
/// A parsed snapshot of a registry key: name, timestamps, and references
/// to subkeys, values, and the security descriptor.
#[derive(Debug, Clone)]
pub struct KeyNode {
    /// Flags for this key.
    pub flags: KeyNodeFlags,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Reference to the parent key node.
    pub parent_offset: u32,

    /// Number of subkeys.
    pub subkey_count: u32,

    /// Number of volatile subkeys (mirrored but unused on disk).
    pub volatile_subkey_count: u32,

    /// Reference to the subkey list.
    pub subkey_list_offset: u32,

    /// Reference to the volatile subkey list.
    pub volatile_subkey_list_offset: u32,

    /// Number of values.
    pub value_count: u32,

    /// Reference to the value list.
    pub value_list_offset: u32,

    /// Reference to the security descriptor.
    pub security_offset: u32,

    /// Reference to the class name.
    pub class_name_offset: u32,

    /// Maximum length of subkey name (UTF-16 bytes).
    pub max_subkey_name_len: u32,

    /// Maximum length of subkey class name.
    pub max_subkey_class_len: u32,

    /// Maximum length of value name (UTF-16 bytes).
    pub max_value_name_len: u32,

    /// Maximum length of value data.
    pub max_value_data_len: u32,

    /// Length of key name in bytes as stored.
    pub name_length: u16,

    /// Length of class name.
    pub class_name_length: u16,

    /// Key name.
    pub name: String,
}

impl KeyNode {
    /// Parses a key node from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell payload (excluding size field, starting with the
    ///   "nk" signature).
    /// * `offset` - Reference of this cell for error reporting.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < KEY_NODE_MIN_SIZE {
            return Err(EngineError::corrupt_cell(offset, "truncated key node"));
        }

        if &data[0..2] != b"nk" {
            return Err(EngineError::corrupt_cell(
                offset,
                format!("expected 'nk' signature, found {:?}", &data[0..2]),
            ));
        }

        let flags = KeyNodeFlags::new(read_u16_le(data, NK_FLAGS)?);
        let last_written = read_u64_le(data, NK_LAST_WRITTEN)?;
        let parent_offset = read_u32_le(data, NK_PARENT)?;
        let subkey_count = read_u32_le(data, NK_SUBKEY_COUNT)?;
        let volatile_subkey_count = read_u32_le(data, 0x18)?;
        let subkey_list_offset = read_u32_le(data, NK_SUBKEY_LIST)?;
        let volatile_subkey_list_offset = read_u32_le(data, 0x20)?;
        let value_count = read_u32_le(data, NK_VALUE_COUNT)?;
        let value_list_offset = read_u32_le(data, NK_VALUE_LIST)?;
        let security_offset = read_u32_le(data, NK_SECURITY)?;
        let class_name_offset = read_u32_le(data, 0x30)?;

        let max_subkey_name_len = read_u32_le(data, NK_MAX_SUBKEY_NAME)?;
        let max_subkey_class_len = read_u32_le(data, 0x38)?;
        let max_value_name_len = read_u32_le(data, NK_MAX_VALUE_NAME)?;
        let max_value_data_len = read_u32_le(data, NK_MAX_VALUE_DATA)?;

        let name_length = read_u16_le(data, NK_NAME_LENGTH)?;
        let class_name_length = read_u16_le(data, 0x4A)?;

        let name = if name_length > 0 {
            let name_end = KEY_NAME_OFFSET + name_length as usize;
            if name_end > data.len() {
                return Err(EngineError::corrupt_cell(offset, "key name past cell end"));
            }

            decode_name(
                &data[KEY_NAME_OFFSET..name_end],
                flags.is_compressed(),
                offset,
            )?
        } else {
            String::new()
        };

        Ok(KeyNode {
            flags,
            last_written,
            parent_offset,
            subkey_count,
            volatile_subkey_count,
            subkey_list_offset,
            volatile_subkey_list_offset,
            value_count,
            value_list_offset,
            security_offset,
            class_name_offset,
            max_subkey_name_len,
            max_subkey_class_len,
            max_value_name_len,
            max_value_data_len,
            name_length,
            class_name_length,
            name,
        })
    }

    /// Serializes a fresh key node payload for a key with no subkeys, no
    /// values, and no class name.
    ///
    /// Returns the payload bytes (the caller prepends the cell size).
    pub fn serialize_new(
        name: &str,
        parent: u32,
        security: u32,
        extra_flags: u16,
        last_written: u64,
    ) -> Vec<u8> {
        let (name_bytes, compressed) = encode_name(name);
        let flags = extra_flags | if compressed { KeyNodeFlags::COMP_NAME } else { 0 };

        let mut buf = vec![0u8; KEY_NAME_OFFSET + name_bytes.len()];
        buf[0..2].copy_from_slice(b"nk");
        write_u16_le(&mut buf, NK_FLAGS, flags);
        write_u64_le(&mut buf, NK_LAST_WRITTEN, last_written);
        write_u32_le(&mut buf, NK_PARENT, parent);
        write_u32_le(&mut buf, NK_SUBKEY_COUNT, 0);
        write_u32_le(&mut buf, 0x18, 0);
        write_u32_le(&mut buf, NK_SUBKEY_LIST, REF_NONE);
        write_u32_le(&mut buf, 0x20, REF_NONE);
        write_u32_le(&mut buf, NK_VALUE_COUNT, 0);
        write_u32_le(&mut buf, NK_VALUE_LIST, REF_NONE);
        write_u32_le(&mut buf, NK_SECURITY, security);
        write_u32_le(&mut buf, 0x30, REF_NONE);
        write_u16_le(&mut buf, NK_NAME_LENGTH, name_bytes.len() as u16);
        buf[KEY_NAME_OFFSET..].copy_from_slice(&name_bytes);

        buf
    }

    /// Returns true if this key has subkeys.
    pub fn has_subkeys(&self) -> bool {
        self.subkey_count > 0
    }

    /// Returns true if this key has values.
    pub fn has_values(&self) -> bool {
        self.value_count > 0
    }

    /// Returns true if this is the root key.
    pub fn is_root(&self) -> bool {
        self.flags.is_root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_node_minimum_size() {
        let data = vec![0u8; 75];
        assert!(KeyNode::parse(&data, 0).is_err());
    }

    #[test]
    fn test_key_node_invalid_signature() {
        let mut data = vec![0u8; 80];
        data[0..2].copy_from_slice(b"XX");
        assert!(KeyNode::parse(&data, 0).is_err());
    }

    #[test]
    fn test_serialize_then_parse() {
        let payload = KeyNode::serialize_new("Services", 0x20, 0x80, 0, 0x1234_5678_9ABC_DEF0);
        let nk = KeyNode::parse(&payload, 0).unwrap();

        assert_eq!(nk.name, "Services");
        assert!(nk.flags.is_compressed());
        assert_eq!(nk.parent_offset, 0x20);
        assert_eq!(nk.security_offset, 0x80);
        assert_eq!(nk.last_written, 0x1234_5678_9ABC_DEF0);
        assert_eq!(nk.subkey_count, 0);
        assert_eq!(nk.subkey_list_offset, REF_NONE);
        assert_eq!(nk.value_count, 0);
        assert_eq!(nk.value_list_offset, REF_NONE);
    }

    #[test]
    fn test_serialize_unicode_name() {
        let payload = KeyNode::serialize_new("Ünïcode", 0, REF_NONE, 0, 0);
        let nk = KeyNode::parse(&payload, 0).unwrap();
        assert!(!nk.flags.is_compressed());
        assert_eq!(nk.name, "Ünïcode");
        assert_eq!(nk.name_length as usize, "Ünïcode".chars().count() * 2);
    }

    #[test]
    fn test_root_flag() {
        let payload = KeyNode::serialize_new(
            "ROOT",
            0,
            REF_NONE,
            KeyNodeFlags::ROOT_KEY,
            0,
        );
        let nk = KeyNode::parse(&payload, 0).unwrap();
        assert!(nk.is_root());
        assert!(nk.flags.is_compressed());
    }
}
