//! Value key (vk) parsing, serialization, and data decoding.

use crate::cell::ValueType;
use crate::error::{EngineError, Result};
use crate::utils::{
    decode_name, encode_name, read_u16_le, read_u32_le, write_u16_le, write_u32_le,
};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// High bit of the raw data length: the data lives inline in the
/// data-offset field.
pub const VK_DATA_INLINE: u32 = 0x8000_0000;

/// Value name flag: name is stored ASCII-compressed.
pub const VK_FLAG_COMP_NAME: u16 = 0x0001;

/// Offset of the value name in the value key structure.
pub const VALUE_NAME_OFFSET: usize = 0x14;

/// Minimum size of a value key structure in bytes.
pub const VALUE_KEY_MIN_SIZE: usize = 20;

/// Value key (vk) structure.
///
/// A parsed snapshot of a registry value descriptor: name, type, and
/// where its data lives.
#[derive(Debug, Clone)]
pub struct ValueKey {
    /// Length of value name in bytes as stored.
    pub name_length: u16,

    /// Length of value data (inline flag stripped).
    pub data_length: u32,

    /// Whether the data is stored inline in the data-offset field.
    pub inline: bool,

    /// Reference to value data (or the inline bytes if `inline`).
    pub data_offset: u32,

    /// Value data type.
    pub data_type: ValueType,

    /// Flags (0x0001 = name is ASCII).
    pub flags: u16,

    /// Value name; empty for the default value.
    pub name: String,
}

impl ValueKey {
    /// Parses a value key from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell payload (excluding size field, starting with the
    ///   "vk" signature).
    /// * `offset` - Reference of this cell for error reporting.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < VALUE_KEY_MIN_SIZE {
            return Err(EngineError::corrupt_cell(offset, "truncated value key"));
        }

        if &data[0..2] != b"vk" {
            return Err(EngineError::corrupt_cell(
                offset,
                format!("expected 'vk' signature, found {:?}", &data[0..2]),
            ));
        }

        let name_length = read_u16_le(data, 0x02)?;

        let data_length_raw = read_u32_le(data, 0x04)?;
        let inline = (data_length_raw & VK_DATA_INLINE) != 0;
        let data_length = data_length_raw & !VK_DATA_INLINE;

        let data_offset = read_u32_le(data, 0x08)?;
        let data_type = ValueType::from_u32(read_u32_le(data, 0x0C)?);
        let flags = read_u16_le(data, 0x10)?;

        let name = if name_length > 0 {
            let name_end = VALUE_NAME_OFFSET + name_length as usize;
            if name_end > data.len() {
                return Err(EngineError::corrupt_cell(offset, "value name past cell end"));
            }

            decode_name(
                &data[VALUE_NAME_OFFSET..name_end],
                (flags & VK_FLAG_COMP_NAME) != 0,
                offset,
            )?
        } else {
            // The unnamed default value.
            String::new()
        };

        Ok(ValueKey {
            name_length,
            data_length,
            inline,
            data_offset,
            data_type,
            flags,
            name,
        })
    }

    /// Serializes a fresh value key payload.
    ///
    /// `raw_data_length` carries the inline flag in its high bit when the
    /// data lives in `data_offset`; otherwise `data_offset` is the
    /// reference of the external data or big-data header cell.
    pub fn serialize_new(
        name: &str,
        raw_data_length: u32,
        data_offset: u32,
        data_type: ValueType,
    ) -> Vec<u8> {
        let (name_bytes, compressed) = encode_name(name);
        let flags = if compressed { VK_FLAG_COMP_NAME } else { 0 };

        let mut buf = vec![0u8; VALUE_NAME_OFFSET + name_bytes.len()];
        buf[0..2].copy_from_slice(b"vk");
        write_u16_le(&mut buf, 0x02, name_bytes.len() as u16);
        write_u32_le(&mut buf, 0x04, raw_data_length);
        write_u32_le(&mut buf, 0x08, data_offset);
        write_u32_le(&mut buf, 0x0C, data_type.as_u32());
        write_u16_le(&mut buf, 0x10, flags);
        buf[VALUE_NAME_OFFSET..].copy_from_slice(&name_bytes);

        buf
    }

    /// Returns true if the data is stored inline (in the data_offset field).
    pub fn is_inline_data(&self) -> bool {
        self.inline
    }

    /// Extracts inline data (when the inline flag is set).
    pub fn inline_data(&self) -> Vec<u8> {
        let bytes = self.data_offset.to_le_bytes();
        let len = (self.data_length as usize).min(4);
        bytes[..len].to_vec()
    }
}

/// Parsed registry value data.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    /// No data.
    None,

    /// String value.
    String(String),

    /// Expandable string value.
    ExpandString(String),

    /// Binary data.
    Binary(Vec<u8>),

    /// 32-bit integer.
    Dword(u32),

    /// 32-bit big-endian integer.
    DwordBigEndian(u32),

    /// Multiple strings.
    MultiString(Vec<String>),

    /// 64-bit integer.
    Qword(u64),

    /// Unknown or unsupported type.
    Unknown(Vec<u8>),
}

impl ValueData {
    /// Parses value data based on the value type.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw value data bytes.
    /// * `value_type` - Type of the value.
    /// * `offset` - Offset for error reporting.
    pub fn parse(data: &[u8], value_type: ValueType, offset: u32) -> Result<Self> {
        if data.is_empty() {
            return Ok(ValueData::None);
        }

        match value_type {
            ValueType::None => Ok(ValueData::None),

            ValueType::String | ValueType::ExpandString => {
                let s = crate::utils::read_utf16_string(data, offset)?;
                if value_type == ValueType::String {
                    Ok(ValueData::String(s))
                } else {
                    Ok(ValueData::ExpandString(s))
                }
            }

            ValueType::Binary => Ok(ValueData::Binary(data.to_vec())),

            ValueType::Dword => {
                if data.len() < 4 {
                    return Err(EngineError::corrupt_cell(offset, "short REG_DWORD data"));
                }
                let mut cursor = Cursor::new(data);
                Ok(ValueData::Dword(cursor.read_u32::<LittleEndian>()?))
            }

            ValueType::DwordBigEndian => {
                if data.len() < 4 {
                    return Err(EngineError::corrupt_cell(offset, "short REG_DWORD_BE data"));
                }
                let mut cursor = Cursor::new(data);
                Ok(ValueData::DwordBigEndian(cursor.read_u32::<BigEndian>()?))
            }

            ValueType::Qword => {
                if data.len() < 8 {
                    return Err(EngineError::corrupt_cell(offset, "short REG_QWORD data"));
                }
                let mut cursor = Cursor::new(data);
                Ok(ValueData::Qword(cursor.read_u64::<LittleEndian>()?))
            }

            ValueType::MultiString => {
                let full_string = crate::utils::read_utf16_string(data, offset)?;
                let strings: Vec<String> = full_string
                    .split('\0')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect();
                Ok(ValueData::MultiString(strings))
            }

            // For other types, return raw binary data.
            _ => Ok(ValueData::Unknown(data.to_vec())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_key_minimum_size() {
        let data = vec![0u8; 19];
        assert!(ValueKey::parse(&data, 0).is_err());
    }

    #[test]
    fn test_value_key_invalid_signature() {
        let mut data = vec![0u8; 24];
        data[0..2].copy_from_slice(b"XX");
        assert!(ValueKey::parse(&data, 0).is_err());
    }

    #[test]
    fn test_serialize_inline() {
        let raw_len = 4 | VK_DATA_INLINE;
        let inline = u32::from_le_bytes([0x01, 0x02, 0x03, 0x04]);
        let payload = ValueKey::serialize_new("Count", raw_len, inline, ValueType::Dword);

        let vk = ValueKey::parse(&payload, 0).unwrap();
        assert_eq!(vk.name, "Count");
        assert!(vk.is_inline_data());
        assert_eq!(vk.data_length, 4);
        assert_eq!(vk.inline_data(), vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(vk.data_type, ValueType::Dword);
    }

    #[test]
    fn test_serialize_external() {
        let payload = ValueKey::serialize_new("Blob", 600, 0x1040, ValueType::Binary);
        let vk = ValueKey::parse(&payload, 0).unwrap();
        assert!(!vk.is_inline_data());
        assert_eq!(vk.data_length, 600);
        assert_eq!(vk.data_offset, 0x1040);
    }

    #[test]
    fn test_serialize_default_value_name() {
        let payload = ValueKey::serialize_new("", VK_DATA_INLINE, 0, ValueType::None);
        let vk = ValueKey::parse(&payload, 0).unwrap();
        assert_eq!(vk.name_length, 0);
        assert_eq!(vk.name, "");
    }

    #[test]
    fn test_multi_string_parse() {
        let mut bytes = Vec::new();
        for unit in "one\0two\0\0".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let parsed = ValueData::parse(&bytes, ValueType::MultiString, 0).unwrap();
        assert_eq!(
            parsed,
            ValueData::MultiString(vec!["one".to_string(), "two".to_string()])
        );
    }
}
