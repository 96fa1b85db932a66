//! Subkey list codec (lf, lh, li, ri) — parsing, hashing, serialization.
//!
//! A key's subkeys live in one of four list shapes. Leaves (lf/lh/li)
//! hold entries directly; an index root (ri) fans out over further leaf
//! cells when one leaf would exceed the per-bucket cap. The codec
//! presents a single flat, sorted sequence upward regardless of shape.

use crate::error::{EngineError, Result};
use crate::mapping::HiveMapping;
use crate::utils::{lowercase_name, read_u16_le, read_u32_le, write_u16_le, write_u32_le};

/// Maximum entries per lf/lh bucket before an ri fan-out is written.
///
/// 8-byte entries keep a full bucket near 8 KiB, well under the 64 KiB
/// cell bound.
pub const SUBKEY_BUCKET_MAX: usize = 1024;

/// Bound on ri recursion while reading. On-disk fan-outs are one level
/// deep in practice; the reader tolerates more but not a reference cycle.
const MAX_LIST_DEPTH: u32 = 32;

/// Subkey list shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubkeyListType {
    /// Index leaf (li) - simple list of offsets.
    IndexLeaf,

    /// Fast leaf (lf) - list with 4-byte name hints.
    FastLeaf,

    /// Hash leaf (lh) - list with name hashes.
    HashLeaf,

    /// Index root (ri) - list of subkey list offsets.
    IndexRoot,
}

impl SubkeyListType {
    /// Parses a subkey list type from a 2-byte signature.
    pub fn from_signature(sig: &[u8; 2]) -> Result<Self> {
        match sig {
            b"li" => Ok(SubkeyListType::IndexLeaf),
            b"lf" => Ok(SubkeyListType::FastLeaf),
            b"lh" => Ok(SubkeyListType::HashLeaf),
            b"ri" => Ok(SubkeyListType::IndexRoot),
            _ => Err(EngineError::corrupt_cell(
                0,
                format!("unknown subkey list signature {:?}", sig),
            )),
        }
    }
}

/// The leaf flavor written by the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    /// lf: hint is the first four name characters.
    Fast,
    /// lh: hint is the 37x rolling hash. Used for hive minor version >= 5.
    Hash,
}

impl LeafKind {
    /// Picks the leaf flavor for a hive format minor version.
    pub fn for_minor_version(minor: u32) -> Self {
        if minor >= 5 {
            LeafKind::Hash
        } else {
            LeafKind::Fast
        }
    }

    /// Computes the hint for `name` under this flavor.
    pub fn hash(&self, name: &str) -> u32 {
        match self {
            LeafKind::Fast => lf_hash(name),
            LeafKind::Hash => lh_hash(name),
        }
    }
}

/// One subkey list entry: the child reference and its hint under the
/// list's flavor (zero when the source leaf carried none).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubkeyEntry {
    /// Reference to the child key node.
    pub key_offset: u32,

    /// Name hint (first 4 chars for lf, hash for lh, 0 for li).
    pub name_hint: u32,
}

/// Parsed subkey list cell.
#[derive(Debug, Clone)]
pub enum SubkeyList {
    /// Index leaf - simple list of offsets.
    IndexLeaf(Vec<u32>),

    /// Fast leaf or hash leaf - list with hints.
    LeafWithHints(LeafKind, Vec<SubkeyEntry>),

    /// Index root - list of sublist offsets.
    IndexRoot(Vec<u32>),
}

impl SubkeyList {
    /// Parses a subkey list from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell payload (excluding size field).
    /// * `offset` - Reference of this cell for error reporting.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < 4 {
            return Err(EngineError::corrupt_cell(offset, "truncated subkey list"));
        }

        let sig = [data[0], data[1]];
        let list_type = SubkeyListType::from_signature(&sig)
            .map_err(|_| EngineError::corrupt_cell(offset, format!("bad list signature {:?}", sig)))?;

        let count = read_u16_le(data, 0x02)? as usize;

        match list_type {
            SubkeyListType::IndexLeaf | SubkeyListType::IndexRoot => {
                // li/ri: signature (2) + count (2) + offsets (4 * count)
                let expected_size = 4 + count * 4;
                if data.len() < expected_size {
                    return Err(EngineError::corrupt_cell(offset, "subkey list past cell end"));
                }

                let mut offsets = Vec::with_capacity(count);
                for i in 0..count {
                    offsets.push(read_u32_le(data, 4 + i * 4)?);
                }

                if list_type == SubkeyListType::IndexLeaf {
                    Ok(SubkeyList::IndexLeaf(offsets))
                } else {
                    Ok(SubkeyList::IndexRoot(offsets))
                }
            }

            SubkeyListType::FastLeaf | SubkeyListType::HashLeaf => {
                // lf/lh: signature (2) + count (2) + entries (8 * count)
                let expected_size = 4 + count * 8;
                if data.len() < expected_size {
                    return Err(EngineError::corrupt_cell(offset, "subkey list past cell end"));
                }

                let kind = if list_type == SubkeyListType::FastLeaf {
                    LeafKind::Fast
                } else {
                    LeafKind::Hash
                };

                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    let entry_pos = 4 + i * 8;
                    entries.push(SubkeyEntry {
                        key_offset: read_u32_le(data, entry_pos)?,
                        name_hint: read_u32_le(data, entry_pos + 4)?,
                    });
                }

                Ok(SubkeyList::LeafWithHints(kind, entries))
            }
        }
    }

    /// Returns the number of entries in this cell (not flattened).
    pub fn len(&self) -> usize {
        match self {
            SubkeyList::IndexLeaf(offsets) => offsets.len(),
            SubkeyList::LeafWithHints(_, entries) => entries.len(),
            SubkeyList::IndexRoot(offsets) => offsets.len(),
        }
    }

    /// Returns true if this cell holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if this is an index root (contains sublists).
    pub fn is_index_root(&self) -> bool {
        matches!(self, SubkeyList::IndexRoot(_))
    }
}

/// Reads a subkey list and flattens any ri fan-out into one entry
/// sequence in on-disk order.
///
/// Returns the entries and, when every visited leaf shares one flavor,
/// that flavor (callers preserve hints only in that case).
pub fn read_flat(mapping: &HiveMapping, list_ref: u32) -> Result<(Vec<SubkeyEntry>, Option<LeafKind>)> {
    let mut entries = Vec::new();
    let mut kind: Option<LeafKind> = None;
    let mut uniform = true;

    collect_entries(mapping, list_ref, 0, &mut entries, &mut kind, &mut uniform)?;

    Ok((entries, if uniform { kind } else { None }))
}

fn collect_entries(
    mapping: &HiveMapping,
    list_ref: u32,
    depth: u32,
    entries: &mut Vec<SubkeyEntry>,
    kind: &mut Option<LeafKind>,
    uniform: &mut bool,
) -> Result<()> {
    if depth > MAX_LIST_DEPTH {
        return Err(EngineError::corrupt_cell(
            list_ref,
            "subkey list nesting exceeds sane depth",
        ));
    }

    let list = SubkeyList::parse(mapping.cell_payload(list_ref)?, list_ref)?;

    match list {
        SubkeyList::IndexLeaf(offsets) => {
            *uniform = false;
            entries.extend(offsets.into_iter().map(|key_offset| SubkeyEntry {
                key_offset,
                name_hint: 0,
            }));
        }
        SubkeyList::LeafWithHints(leaf_kind, leaf_entries) => {
            match kind {
                None => *kind = Some(leaf_kind),
                Some(existing) if *existing == leaf_kind => {}
                Some(_) => *uniform = false,
            }
            entries.extend(leaf_entries);
        }
        SubkeyList::IndexRoot(offsets) => {
            for child in offsets {
                collect_entries(mapping, child, depth + 1, entries, kind, uniform)?;
            }
        }
    }

    Ok(())
}

/// Collects every cell reference making up a subkey list: the list cell
/// itself and, for an ri, each bucket cell. Used by the free path.
pub fn list_cell_refs(mapping: &HiveMapping, list_ref: u32) -> Result<Vec<u32>> {
    let list = SubkeyList::parse(mapping.cell_payload(list_ref)?, list_ref)?;

    let mut refs = vec![list_ref];
    if let SubkeyList::IndexRoot(offsets) = list {
        // Buckets under an ri are leaves; one level is enough here
        // because the writer never nests deeper.
        refs.extend(offsets);
    }

    Ok(refs)
}

/// LF hint: the first four characters of the name (original case), padded
/// with spaces to 4 bytes, interpreted little-endian.
pub fn lf_hash(name: &str) -> u32 {
    let mut bytes = [b' '; 4];
    for (i, c) in name.chars().take(4).enumerate() {
        bytes[i] = if (c as u32) <= 0xFF { c as u8 } else { b'?' };
    }
    u32::from_le_bytes(bytes)
}

/// LH hash: over the lowercased name, `h = h * 37 + uppercase(c)`.
pub fn lh_hash(name: &str) -> u32 {
    let mut hash: u32 = 0;
    for c in lowercase_name(name).chars() {
        for u in c.to_uppercase() {
            hash = hash.wrapping_mul(37).wrapping_add(u as u32);
        }
    }
    hash
}

/// Serializes one lf/lh leaf payload from entries already sorted by
/// lowercased name.
pub fn serialize_leaf(kind: LeafKind, entries: &[SubkeyEntry]) -> Vec<u8> {
    let mut buf = vec![0u8; 4 + entries.len() * 8];
    buf[0..2].copy_from_slice(match kind {
        LeafKind::Fast => b"lf",
        LeafKind::Hash => b"lh",
    });
    write_u16_le(&mut buf, 0x02, entries.len() as u16);

    for (i, entry) in entries.iter().enumerate() {
        write_u32_le(&mut buf, 4 + i * 8, entry.key_offset);
        write_u32_le(&mut buf, 8 + i * 8, entry.name_hint);
    }

    buf
}

/// Serializes an ri payload listing bucket cells in order.
pub fn serialize_index_root(buckets: &[u32]) -> Vec<u8> {
    let mut buf = vec![0u8; 4 + buckets.len() * 4];
    buf[0..2].copy_from_slice(b"ri");
    write_u16_le(&mut buf, 0x02, buckets.len() as u16);

    for (i, bucket) in buckets.iter().enumerate() {
        write_u32_le(&mut buf, 4 + i * 4, *bucket);
    }

    buf
}
