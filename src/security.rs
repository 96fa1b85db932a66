//! Security descriptor (sk) cells and their sharing machinery.
//!
//! SK cells form a doubly-linked list through the hive and are shared:
//! any number of key nodes may point at one SK, tracked by its reference
//! count. The editor deduplicates descriptors by digest so identical
//! descriptors are stored once.

use crate::alloc::Allocator;
use crate::cell::CellClass;
use crate::dirty::DirtyTracker;
use crate::error::{EngineError, Result};
use crate::header::BASE_BLOCK_SIZE;
use crate::mapping::HiveMapping;
use crate::utils::{read_u16_le, read_u32_le, write_u32_le};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::trace;

/// Offset of the descriptor bytes within an sk payload.
pub const SK_HEADER_SIZE: usize = 0x14;

const SK_FLINK: usize = 0x04;
const SK_BLINK: usize = 0x08;
const SK_REF_COUNT: usize = 0x0C;
const SK_DESCRIPTOR_LEN: usize = 0x10;

/// The default security descriptor written for newly created keys.
///
/// Self-relative, Revision 1, Control 0x8004 (SE_SELF_RELATIVE |
/// SE_DACL_PRESENT), no SACL, one ACCESS_ALLOWED ACE granting Everyone
/// (S-1-1-0) READ_CONTROL, owner and group both SYSTEM (S-1-5-18, stored
/// once and referenced by both offsets).
pub const DEFAULT_SECURITY_DESCRIPTOR: [u8; 60] = [
    // SECURITY_DESCRIPTOR_RELATIVE header
    0x01, 0x00, 0x04, 0x80, // Revision 1, Sbz1, Control 0x8004
    0x30, 0x00, 0x00, 0x00, // OffsetOwner = 48
    0x30, 0x00, 0x00, 0x00, // OffsetGroup = 48
    0x00, 0x00, 0x00, 0x00, // OffsetSacl = 0 (absent)
    0x14, 0x00, 0x00, 0x00, // OffsetDacl = 20
    // ACL header
    0x02, 0x00, 0x1C, 0x00, // AclRevision 2, Sbz1, AclSize 28
    0x01, 0x00, 0x00, 0x00, // AceCount 1, Sbz2
    // ACCESS_ALLOWED_ACE
    0x00, 0x00, 0x14, 0x00, // AceType 0, AceFlags 0, AceSize 20
    0x00, 0x00, 0x02, 0x00, // Mask = READ_CONTROL (0x00020000)
    0x01, 0x01, 0x00, 0x00, // SID S-1-1-0: Revision 1, SubAuthorityCount 1
    0x00, 0x00, 0x00, 0x01, // IdentifierAuthority = 1 (World)
    0x00, 0x00, 0x00, 0x00, // SubAuthority[0] = 0
    // SID S-1-5-18 (SYSTEM), shared by owner and group
    0x01, 0x01, 0x00, 0x00, // Revision 1, SubAuthorityCount 1
    0x00, 0x00, 0x00, 0x05, // IdentifierAuthority = 5 (NT)
    0x12, 0x00, 0x00, 0x00, // SubAuthority[0] = 18
];

/// Parsed security (sk) cell.
#[derive(Debug, Clone)]
pub struct SecurityCell {
    /// Forward link in the hive-wide SK list.
    pub flink: u32,

    /// Backward link in the hive-wide SK list.
    pub blink: u32,

    /// Number of key nodes pointing at this cell.
    pub ref_count: u32,

    /// The self-relative security descriptor bytes.
    pub descriptor: Vec<u8>,
}

impl SecurityCell {
    /// Parses an sk cell payload.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < SK_HEADER_SIZE {
            return Err(EngineError::corrupt_cell(offset, "truncated sk cell"));
        }

        if &data[0..2] != b"sk" {
            return Err(EngineError::corrupt_cell(
                offset,
                format!("expected 'sk' signature, found {:?}", &data[0..2]),
            ));
        }

        let _reserved = read_u16_le(data, 0x02)?;
        let flink = read_u32_le(data, SK_FLINK)?;
        let blink = read_u32_le(data, SK_BLINK)?;
        let ref_count = read_u32_le(data, SK_REF_COUNT)?;
        let descriptor_len = read_u32_le(data, SK_DESCRIPTOR_LEN)? as usize;

        if SK_HEADER_SIZE + descriptor_len > data.len() {
            return Err(EngineError::corrupt_cell(
                offset,
                "security descriptor past cell end",
            ));
        }

        Ok(SecurityCell {
            flink,
            blink,
            ref_count,
            descriptor: data[SK_HEADER_SIZE..SK_HEADER_SIZE + descriptor_len].to_vec(),
        })
    }

    /// Serializes a fresh sk payload.
    pub fn serialize_new(flink: u32, blink: u32, ref_count: u32, descriptor: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; SK_HEADER_SIZE + descriptor.len()];
        buf[0..2].copy_from_slice(b"sk");
        write_u32_le(&mut buf, SK_FLINK, flink);
        write_u32_le(&mut buf, SK_BLINK, blink);
        write_u32_le(&mut buf, SK_REF_COUNT, ref_count);
        write_u32_le(&mut buf, SK_DESCRIPTOR_LEN, descriptor.len() as u32);
        buf[SK_HEADER_SIZE..].copy_from_slice(descriptor);
        buf
    }
}

/// Digest-keyed directory of the hive's SK cells.
///
/// The map is guarded so ref-count bumps stay atomic with respect to SK
/// allocations made on behalf of helper routines.
#[derive(Debug, Default)]
pub struct SkDirectory {
    inner: Mutex<SkDirectoryInner>,
}

#[derive(Debug, Default)]
struct SkDirectoryInner {
    by_digest: HashMap<[u8; 32], u32>,
    head: Option<u32>,
}

impl SkDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an SK cell found on disk (open-time indexing). Does not
    /// change its reference count.
    pub fn register_existing(&self, mapping: &HiveMapping, sk_ref: u32) -> Result<()> {
        let cell = SecurityCell::parse(mapping.cell_payload(sk_ref)?, sk_ref)?;
        let digest = *blake3::hash(&cell.descriptor).as_bytes();

        let mut inner = self.inner.lock().expect("sk directory lock poisoned");
        inner.by_digest.entry(digest).or_insert(sk_ref);
        inner.head.get_or_insert(sk_ref);
        Ok(())
    }

    /// Returns an SK reference for `descriptor`, sharing an existing cell
    /// when one with the same digest is known.
    ///
    /// A shared cell has its reference count incremented; a first
    /// occurrence allocates a new cell with `ref_count = 1` and splices it
    /// into the SK list.
    pub fn acquire(
        &self,
        alloc: &mut Allocator,
        mapping: &mut HiveMapping,
        dirty: &mut DirtyTracker,
        descriptor: &[u8],
    ) -> Result<u32> {
        let digest = *blake3::hash(descriptor).as_bytes();
        let mut inner = self.inner.lock().expect("sk directory lock poisoned");

        if let Some(&sk_ref) = inner.by_digest.get(&digest) {
            bump_ref_count(mapping, dirty, sk_ref, 1)?;
            trace!(sk_ref, digest = %hex::encode(&digest[..8]), "shared existing sk cell");
            return Ok(sk_ref);
        }

        // First occurrence: allocate, then splice in at the tail of the
        // list (or self-link when this is the first SK of the hive).
        let (flink, blink) = match inner.head {
            None => (0, 0),
            Some(head) => {
                let head_cell = SecurityCell::parse(mapping.cell_payload(head)?, head)?;
                (head, head_cell.blink)
            }
        };

        let payload = SecurityCell::serialize_new(flink, blink, 1, descriptor);
        let sk_ref = alloc.alloc(mapping, dirty, 4 + payload.len(), CellClass::Security)?;
        mapping.cell_payload_mut(sk_ref)?[..payload.len()].copy_from_slice(&payload);

        match inner.head {
            None => {
                // Sole member: both links point at itself.
                let cell = mapping.cell_payload_mut(sk_ref)?;
                write_u32_le(cell, SK_FLINK, sk_ref);
                write_u32_le(cell, SK_BLINK, sk_ref);
                inner.head = Some(sk_ref);
            }
            Some(head) => {
                let old_tail = {
                    let head_payload = mapping.cell_payload(head)?;
                    read_u32_le(head_payload, SK_BLINK)?
                };
                patch_link(mapping, dirty, old_tail, SK_FLINK, sk_ref)?;
                patch_link(mapping, dirty, head, SK_BLINK, sk_ref)?;
            }
        }

        dirty_cell(mapping, dirty, sk_ref)?;
        inner.by_digest.insert(digest, sk_ref);
        trace!(sk_ref, "allocated new sk cell");
        Ok(sk_ref)
    }

    /// Drops one reference to the SK at `sk_ref`, freeing and unsplicing
    /// the cell when the count reaches zero. `reclaim` is false under the
    /// append strategy: the count still drops but the cell is orphaned.
    pub fn release(
        &self,
        alloc: &mut Allocator,
        mapping: &mut HiveMapping,
        dirty: &mut DirtyTracker,
        sk_ref: u32,
        reclaim: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("sk directory lock poisoned");

        let cell = SecurityCell::parse(mapping.cell_payload(sk_ref)?, sk_ref)?;
        if cell.ref_count > 1 {
            bump_ref_count(mapping, dirty, sk_ref, -1)?;
            return Ok(());
        }

        let digest = *blake3::hash(&cell.descriptor).as_bytes();
        inner.by_digest.remove(&digest);

        if cell.flink == sk_ref || cell.flink == cell.blink && cell.blink == sk_ref {
            // Sole member.
            if inner.head == Some(sk_ref) {
                inner.head = None;
            }
        } else {
            patch_link(mapping, dirty, cell.blink, SK_FLINK, cell.flink)?;
            patch_link(mapping, dirty, cell.flink, SK_BLINK, cell.blink)?;
            if inner.head == Some(sk_ref) {
                inner.head = Some(cell.flink);
            }
        }

        if reclaim {
            alloc.free(mapping, dirty, sk_ref)?;
        } else {
            // Orphaned under append-only; keep the count honest.
            bump_ref_count(mapping, dirty, sk_ref, -1)?;
        }

        Ok(())
    }
}

fn bump_ref_count(
    mapping: &mut HiveMapping,
    dirty: &mut DirtyTracker,
    sk_ref: u32,
    delta: i64,
) -> Result<()> {
    let payload = mapping.cell_payload_mut(sk_ref)?;
    let count = read_u32_le(payload, SK_REF_COUNT)?;
    let updated = (i64::from(count) + delta).max(0) as u32;
    write_u32_le(payload, SK_REF_COUNT, updated);

    dirty.add(
        BASE_BLOCK_SIZE + sk_ref as usize + 4 + SK_REF_COUNT,
        4,
    );
    Ok(())
}

fn patch_link(
    mapping: &mut HiveMapping,
    dirty: &mut DirtyTracker,
    sk_ref: u32,
    field: usize,
    target: u32,
) -> Result<()> {
    let payload = mapping.cell_payload_mut(sk_ref)?;
    write_u32_le(payload, field, target);
    dirty.add(BASE_BLOCK_SIZE + sk_ref as usize + 4 + field, 4);
    Ok(())
}

fn dirty_cell(mapping: &HiveMapping, dirty: &mut DirtyTracker, reference: u32) -> Result<()> {
    let capacity = mapping.cell_capacity(reference)?;
    dirty.add(BASE_BLOCK_SIZE + reference as usize, capacity + 4);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_layout() {
        let d = &DEFAULT_SECURITY_DESCRIPTOR;
        assert_eq!(d.len(), 60);
        assert_eq!(d[0], 1); // revision
        assert_eq!(u16::from_le_bytes([d[2], d[3]]), 0x8004); // control
        assert_eq!(u32::from_le_bytes([d[4], d[5], d[6], d[7]]), 48); // owner
        assert_eq!(u32::from_le_bytes([d[8], d[9], d[10], d[11]]), 48); // group
        assert_eq!(u32::from_le_bytes([d[12], d[13], d[14], d[15]]), 0); // sacl
        assert_eq!(u32::from_le_bytes([d[16], d[17], d[18], d[19]]), 20); // dacl
        // ACL size covers header + one 20-byte ACE.
        assert_eq!(u16::from_le_bytes([d[22], d[23]]), 28);
        // ACE mask is READ_CONTROL.
        assert_eq!(u32::from_le_bytes([d[32], d[33], d[34], d[35]]), 0x0002_0000);
    }

    #[test]
    fn test_sk_cell_roundtrip() {
        let payload = SecurityCell::serialize_new(0x100, 0x200, 3, &DEFAULT_SECURITY_DESCRIPTOR);
        let cell = SecurityCell::parse(&payload, 0).unwrap();
        assert_eq!(cell.flink, 0x100);
        assert_eq!(cell.blink, 0x200);
        assert_eq!(cell.ref_count, 3);
        assert_eq!(cell.descriptor, DEFAULT_SECURITY_DESCRIPTOR);
    }

    #[test]
    fn test_sk_cell_bad_signature() {
        let mut payload = SecurityCell::serialize_new(0, 0, 1, &[]);
        payload[0] = b'x';
        assert!(SecurityCell::parse(&payload, 0).is_err());
    }
}
