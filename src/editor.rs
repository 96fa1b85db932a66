//! Key and value editors: the public mutation surface of the engine.
//!
//! Every editor step of the form "modify field F of cell C" re-resolves
//! C's payload from its reference after any call that may allocate,
//! because allocation can grow the hive and remap it. Parsed snapshots
//! (`KeyNode`, `ValueKey`) are owned copies and stay valid; byte views do
//! not.

use crate::bigdata::{self, BIG_DATA_CHUNK_SIZE};
use crate::cancel::CancelToken;
use crate::cell::{CellClass, ValueType};
use crate::error::{EngineError, Result};
use crate::hive::Hive;
use crate::key::{
    KeyNode, NK_LAST_WRITTEN, NK_MAX_SUBKEY_NAME, NK_MAX_VALUE_DATA, NK_MAX_VALUE_NAME,
    NK_SUBKEY_COUNT, NK_SUBKEY_LIST, NK_VALUE_COUNT, NK_VALUE_LIST,
};
use crate::security::DEFAULT_SECURITY_DESCRIPTOR;
use crate::subkey_list::{
    self, serialize_index_root, serialize_leaf, SubkeyEntry, SUBKEY_BUCKET_MAX,
};
use crate::utils::{
    filetime_now, lowercase_name, write_u32_le, write_u64_le, REF_NONE,
};
use crate::value::{ValueKey, VK_DATA_INLINE};
use crate::value_list;
use tracing::{debug, instrument};

/// Sanity limit on a single value's data.
pub const MAX_VALUE_DATA: usize = 1 << 30;

impl Hive {
    /// Walks `segments` below `parent_ref`, creating every missing key on
    /// the way. Returns the final key's reference and how many keys were
    /// created. Idempotent: a second run with the same path creates
    /// nothing.
    #[instrument(skip(self, segments, cancel), fields(depth = segments.len()))]
    pub fn ensure_key_path(
        &mut self,
        parent_ref: u32,
        segments: &[&str],
        cancel: &CancelToken,
    ) -> Result<(u32, u32)> {
        cancel.check()?;
        self.key_node(parent_ref)?;

        let mut current = parent_ref;
        let mut created = 0;

        for segment in segments {
            cancel.check()?;
            match self.index.lookup_key(current, segment) {
                Some(child) => current = child,
                None => {
                    current = self.create_key(current, segment)?;
                    created += 1;
                }
            }
        }

        Ok((current, created))
    }

    /// Deletes the key at `nk_ref`. With `recursive`, the whole subtree
    /// and every value in it goes; without, a key that still has subkeys
    /// is refused. The root key can never be deleted.
    #[instrument(skip(self, cancel))]
    pub fn delete_key(&mut self, nk_ref: u32, recursive: bool, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;

        if nk_ref == self.root() {
            return Err(EngineError::CannotDeleteRoot);
        }
        self.key_node(nk_ref)?;

        // Deferred accumulators may hold children this delete must see.
        if self.deferred.as_ref().is_some_and(|d| d.has_pending()) {
            self.flush_deferred_subkeys(cancel)?;
        }

        let nk = self.key_node(nk_ref)?;
        if nk.subkey_count > 0 && !recursive {
            return Err(EngineError::KeyHasSubkeys {
                count: nk.subkey_count,
            });
        }

        self.note_mutation();
        self.delete_tree(nk_ref, cancel)?;

        // Unhook from the parent's subkey list.
        let parent_ref = nk.parent_offset;
        let parent = self.key_node(parent_ref)?;
        let reclaim = self.strategy.reclaim_structures();

        let (mut entries, uniform) =
            subkey_list::read_flat(&self.mapping, parent.subkey_list_offset)?;
        entries.retain(|e| e.key_offset != nk_ref);

        let now = filetime_now();
        if entries.is_empty() {
            self.free_subkey_list(parent.subkey_list_offset, reclaim)?;
            self.patch_cell(parent_ref, |p| {
                write_u32_le(p, NK_SUBKEY_COUNT, 0);
                write_u32_le(p, NK_SUBKEY_LIST, REF_NONE);
                write_u64_le(p, NK_LAST_WRITTEN, now);
            })?;
        } else {
            let kind = self.leaf_kind();
            if uniform != Some(kind) {
                self.recompute_hints(&mut entries)?;
            }
            let new_list = self.write_subkey_list(&entries)?;
            self.free_subkey_list(parent.subkey_list_offset, reclaim)?;

            let count = entries.len() as u32;
            self.patch_cell(parent_ref, |p| {
                write_u32_le(p, NK_SUBKEY_COUNT, count);
                write_u32_le(p, NK_SUBKEY_LIST, new_list);
                write_u64_le(p, NK_LAST_WRITTEN, now);
            })?;
        }

        debug!(nk_ref, "deleted key");
        Ok(())
    }

    /// Creates or replaces the value `name` under `nk_ref`.
    ///
    /// The storage shape (inline / single cell / big-data fan-out) is
    /// chosen from the data length. An upsert with identical type and
    /// data is a no-op that touches nothing.
    #[instrument(skip(self, data, cancel), fields(len = data.len()))]
    pub fn upsert_value(
        &mut self,
        nk_ref: u32,
        name: &str,
        data_type: ValueType,
        data: &[u8],
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;

        if data.len() > MAX_VALUE_DATA {
            return Err(EngineError::DataTooLarge {
                size: data.len(),
                limit: MAX_VALUE_DATA,
            });
        }
        validate_name(name, true)?;
        self.key_node(nk_ref)?;

        let existing = self.index.lookup_value(nk_ref, name);

        if let Some(vk_ref) = existing {
            let vk = self.value_key(vk_ref)?;
            if vk.data_type == data_type && self.read_vk_data(&vk)? == data {
                return Ok(());
            }
        }

        self.note_mutation();
        let now = filetime_now();

        // In-place data rewrite, when the strategy admits it and both the
        // old and new shape are a plain external cell.
        if let Some(vk_ref) = existing {
            if self.try_rewrite_in_place(nk_ref, vk_ref, data_type, data, now)? {
                return Ok(());
            }
        }

        // Data cells are allocated before the value key so every
        // reference written into the fresh VK payload is final.
        let (raw_len, offset_field) = self.store_value_data(data)?;
        let vk_payload = ValueKey::serialize_new(name, raw_len, offset_field, data_type);
        let new_vk = self.write_cell(&vk_payload, CellClass::Value)?;

        match existing {
            Some(old_vk) => self.swap_value_entry(nk_ref, old_vk, new_vk)?,
            None => self.append_value_entry(nk_ref, new_vk)?,
        }

        let name_len = (name.encode_utf16().count() * 2) as u32;
        let data_len = data.len() as u32;
        let nk = self.key_node(nk_ref)?;
        self.patch_cell(nk_ref, |p| {
            write_u32_le(p, NK_MAX_VALUE_NAME, nk.max_value_name_len.max(name_len));
            write_u32_le(p, NK_MAX_VALUE_DATA, nk.max_value_data_len.max(data_len));
            write_u64_le(p, NK_LAST_WRITTEN, now);
        })?;

        self.index.insert_value(nk_ref, name, new_vk);
        Ok(())
    }

    /// Deletes the value `name` under `nk_ref`. Idempotent: deleting an
    /// absent value succeeds and changes nothing.
    #[instrument(skip(self, cancel))]
    pub fn delete_value(&mut self, nk_ref: u32, name: &str, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        self.key_node(nk_ref)?;

        let Some(vk_ref) = self.index.lookup_value(nk_ref, name) else {
            return Ok(());
        };

        self.note_mutation();
        let reclaim = self.strategy.reclaim_on_delete();

        let vk = self.value_key(vk_ref)?;
        self.free_value_storage(&vk, reclaim)?;
        if reclaim {
            self.free_cell(vk_ref)?;
        }

        let nk = self.key_node(nk_ref)?;
        let mut refs = value_list::read(&self.mapping, nk.value_list_offset, nk.value_count)?;
        refs.retain(|&r| r != vk_ref);

        let now = filetime_now();
        if refs.is_empty() {
            if reclaim {
                self.free_cell(nk.value_list_offset)?;
            }
            self.patch_cell(nk_ref, |p| {
                write_u32_le(p, NK_VALUE_COUNT, 0);
                write_u32_le(p, NK_VALUE_LIST, REF_NONE);
                write_u64_le(p, NK_LAST_WRITTEN, now);
            })?;
        } else {
            // The compacted list shrinks, so it always fits in place.
            let bytes = value_list::serialize(&refs);
            self.patch_cell(nk.value_list_offset, |p| {
                p[..bytes.len()].copy_from_slice(&bytes);
            })?;
            let count = refs.len() as u32;
            self.patch_cell(nk_ref, |p| {
                write_u32_le(p, NK_VALUE_COUNT, count);
                write_u64_le(p, NK_LAST_WRITTEN, now);
            })?;
        }

        self.index.remove_value(nk_ref, name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Key internals
    // ------------------------------------------------------------------

    /// Creates one key under `parent_ref` and hooks it into the parent's
    /// subkey list (or the deferred accumulator when that mode is on).
    pub(crate) fn create_key(&mut self, parent_ref: u32, name: &str) -> Result<u32> {
        validate_name(name, false)?;
        self.note_mutation();
        let now = filetime_now();

        let sk_ref = self.sk_dir.acquire(
            &mut self.alloc,
            &mut self.mapping,
            &mut self.dirty,
            &DEFAULT_SECURITY_DESCRIPTOR,
        )?;

        let payload = KeyNode::serialize_new(name, parent_ref, sk_ref, 0, now);
        let nk_ref = self.write_cell(&payload, CellClass::Key)?;

        if self.deferred.is_some() {
            self.defer_child(parent_ref, name, nk_ref)?;
            self.index.insert_key(parent_ref, name, nk_ref);
            return Ok(nk_ref);
        }

        let parent = self.key_node(parent_ref)?;
        let (mut entries, uniform) = if parent.subkey_list_offset == REF_NONE {
            (Vec::new(), None)
        } else {
            subkey_list::read_flat(&self.mapping, parent.subkey_list_offset)?
        };

        let kind = self.leaf_kind();
        if uniform != Some(kind) && !entries.is_empty() {
            self.recompute_hints(&mut entries)?;
        }

        let position = self.sorted_position(&entries, name)?;
        entries.insert(
            position,
            SubkeyEntry {
                key_offset: nk_ref,
                name_hint: kind.hash(name),
            },
        );

        let new_list = self.write_subkey_list(&entries)?;
        if parent.subkey_list_offset != REF_NONE {
            self.free_subkey_list(parent.subkey_list_offset, self.strategy.reclaim_structures())?;
        }

        let count = entries.len() as u32;
        let name_len = (name.encode_utf16().count() * 2) as u32;
        self.patch_cell(parent_ref, |p| {
            write_u32_le(p, NK_SUBKEY_COUNT, count);
            write_u32_le(p, NK_SUBKEY_LIST, new_list);
            write_u32_le(p, NK_MAX_SUBKEY_NAME, parent.max_subkey_name_len.max(name_len));
            write_u64_le(p, NK_LAST_WRITTEN, now);
        })?;

        self.index.insert_key(parent_ref, name, nk_ref);
        debug!(nk_ref, parent_ref, "created key");
        Ok(nk_ref)
    }

    /// Deletes the subtree rooted at `nk_ref`: children depth-first, then
    /// values, the security reference, and the key cell itself. The
    /// parent's subkey list is the caller's business.
    fn delete_tree(&mut self, nk_ref: u32, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;

        let nk = self.key_node(nk_ref)?;
        let reclaim = self.strategy.reclaim_on_delete();

        if nk.subkey_list_offset != REF_NONE && nk.subkey_count > 0 {
            let (entries, _) = subkey_list::read_flat(&self.mapping, nk.subkey_list_offset)?;
            for entry in entries {
                self.delete_tree(entry.key_offset, cancel)?;
            }
            self.free_subkey_list(nk.subkey_list_offset, reclaim)?;
        }

        if nk.value_list_offset != REF_NONE && nk.value_count > 0 {
            let refs = value_list::read(&self.mapping, nk.value_list_offset, nk.value_count)?;
            for vk_ref in refs {
                cancel.check()?;
                let vk = self.value_key(vk_ref)?;
                self.free_value_storage(&vk, reclaim)?;
                if reclaim {
                    self.free_cell(vk_ref)?;
                }
            }
            if reclaim {
                self.free_cell(nk.value_list_offset)?;
            }
        }

        if nk.security_offset != 0 && nk.security_offset != REF_NONE {
            self.sk_dir.release(
                &mut self.alloc,
                &mut self.mapping,
                &mut self.dirty,
                nk.security_offset,
                reclaim,
            )?;
        }

        self.index.remove_key(nk.parent_offset, &nk.name);
        self.index.remove_values_of(nk_ref);
        if reclaim {
            self.free_cell(nk_ref)?;
        }

        Ok(())
    }

    /// Serializes `entries` as one leaf cell, or as leaf buckets under an
    /// index root when they exceed the per-bucket cap.
    pub(crate) fn write_subkey_list(&mut self, entries: &[SubkeyEntry]) -> Result<u32> {
        let kind = self.leaf_kind();

        if entries.len() <= SUBKEY_BUCKET_MAX {
            let payload = serialize_leaf(kind, entries);
            return self.write_cell(&payload, CellClass::SubkeyList);
        }

        let mut buckets = Vec::with_capacity(entries.len().div_ceil(SUBKEY_BUCKET_MAX));
        for chunk in entries.chunks(SUBKEY_BUCKET_MAX) {
            let payload = serialize_leaf(kind, chunk);
            buckets.push(self.write_cell(&payload, CellClass::SubkeyList)?);
        }

        let payload = serialize_index_root(&buckets);
        self.write_cell(&payload, CellClass::SubkeyList)
    }

    /// Frees a subkey list cell and, for an index root, its buckets.
    pub(crate) fn free_subkey_list(&mut self, list_ref: u32, reclaim: bool) -> Result<()> {
        if !reclaim || list_ref == REF_NONE {
            return Ok(());
        }

        for reference in subkey_list::list_cell_refs(&self.mapping, list_ref)? {
            self.free_cell(reference)?;
        }
        Ok(())
    }

    /// Recomputes every entry's hint under the hive's leaf flavor, from
    /// the child key names on disk.
    fn recompute_hints(&self, entries: &mut [SubkeyEntry]) -> Result<()> {
        let kind = self.leaf_kind();
        for entry in entries.iter_mut() {
            entry.name_hint = kind.hash(&self.key_node(entry.key_offset)?.name);
        }
        Ok(())
    }

    /// Binary-searches the sorted insert position for `name` among
    /// `entries`, comparing lowercased names.
    fn sorted_position(&self, entries: &[SubkeyEntry], name: &str) -> Result<usize> {
        let target = lowercase_name(name);
        let mut lo = 0;
        let mut hi = entries.len();

        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_name = lowercase_name(&self.key_node(entries[mid].key_offset)?.name);
            if mid_name < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        Ok(lo)
    }

    // ------------------------------------------------------------------
    // Value internals
    // ------------------------------------------------------------------

    /// Writes `data` into its storage shape and returns the raw length
    /// field (inline flag included) and the data-offset field for the VK.
    fn store_value_data(&mut self, data: &[u8]) -> Result<(u32, u32)> {
        let len = data.len();

        if len <= 4 {
            let mut inline = [0u8; 4];
            inline[..len].copy_from_slice(data);
            return Ok((len as u32 | VK_DATA_INLINE, u32::from_le_bytes(inline)));
        }

        if len <= BIG_DATA_CHUNK_SIZE {
            let reference = self.write_cell(data, CellClass::Data)?;
            return Ok((len as u32, reference));
        }

        let reference = bigdata::write(&mut self.alloc, &mut self.mapping, &mut self.dirty, data)?;
        Ok((len as u32, reference))
    }

    /// Frees a value's external storage (single cell or fan-out) when the
    /// strategy reclaims it. Inline data has nothing to free.
    fn free_value_storage(&mut self, vk: &ValueKey, reclaim: bool) -> Result<()> {
        if !reclaim
            || vk.is_inline_data()
            || vk.data_length == 0
            || vk.data_offset == 0
            || vk.data_offset == REF_NONE
        {
            return Ok(());
        }

        if vk.data_length as usize > BIG_DATA_CHUNK_SIZE {
            bigdata::free(&mut self.alloc, &mut self.mapping, &mut self.dirty, vk.data_offset)
        } else {
            self.free_cell(vk.data_offset)
        }
    }

    /// Attempts to rewrite an existing value's data inside its current
    /// cell. Returns true when the rewrite happened.
    fn try_rewrite_in_place(
        &mut self,
        nk_ref: u32,
        vk_ref: u32,
        data_type: ValueType,
        data: &[u8],
        now: u64,
    ) -> Result<bool> {
        let vk = self.value_key(vk_ref)?;

        let new_inline = data.len() <= 4;
        let new_big = data.len() > BIG_DATA_CHUNK_SIZE;
        let old_big = vk.data_length as usize > BIG_DATA_CHUNK_SIZE;
        if vk.is_inline_data()
            || new_inline
            || new_big
            || old_big
            || vk.data_offset == 0
            || vk.data_offset == REF_NONE
        {
            return Ok(false);
        }

        let capacity = self.mapping.cell_capacity(vk.data_offset)?;
        if !self.strategy.allow_in_place_rewrite(capacity, data.len()) {
            return Ok(false);
        }

        self.patch_cell(vk.data_offset, |p| {
            p[..data.len()].copy_from_slice(data);
        })?;
        let raw_len = data.len() as u32;
        self.patch_cell(vk_ref, |p| {
            write_u32_le(p, 0x04, raw_len);
            write_u32_le(p, 0x0C, data_type.as_u32());
        })?;

        let nk = self.key_node(nk_ref)?;
        self.patch_cell(nk_ref, |p| {
            write_u32_le(p, NK_MAX_VALUE_DATA, nk.max_value_data_len.max(raw_len));
            write_u64_le(p, NK_LAST_WRITTEN, now);
        })?;

        debug!(vk_ref, len = data.len(), "rewrote value data in place");
        Ok(true)
    }

    /// Replaces `old_vk` with `new_vk` in the owning key's value list and
    /// releases the replaced descriptor and data per the strategy.
    fn swap_value_entry(&mut self, nk_ref: u32, old_vk: u32, new_vk: u32) -> Result<()> {
        let nk = self.key_node(nk_ref)?;
        let mut refs = value_list::read(&self.mapping, nk.value_list_offset, nk.value_count)?;

        match refs.iter().position(|&r| r == old_vk) {
            Some(slot) => refs[slot] = new_vk,
            None => {
                return Err(EngineError::corrupt_cell(
                    nk.value_list_offset,
                    "value list does not hold the replaced entry",
                ))
            }
        }

        let bytes = value_list::serialize(&refs);
        self.patch_cell(nk.value_list_offset, |p| {
            p[..bytes.len()].copy_from_slice(&bytes);
        })?;

        let old = self.value_key(old_vk)?;
        let reclaim = self.strategy.reclaim_replaced_value(old.data_length as usize);
        self.free_value_storage(&old, reclaim)?;
        if reclaim {
            self.free_cell(old_vk)?;
        }

        Ok(())
    }

    /// Appends `new_vk` to the owning key's value list, reusing the
    /// existing list cell when it has room.
    fn append_value_entry(&mut self, nk_ref: u32, new_vk: u32) -> Result<()> {
        let nk = self.key_node(nk_ref)?;

        let mut refs = if nk.value_list_offset == REF_NONE || nk.value_count == 0 {
            Vec::new()
        } else {
            value_list::read(&self.mapping, nk.value_list_offset, nk.value_count)?
        };
        refs.push(new_vk);

        let has_old_list = nk.value_list_offset != REF_NONE && nk.value_count > 0;
        let fits_in_place = has_old_list
            && self.mapping.cell_capacity(nk.value_list_offset)? >= refs.len() * 4
            && self.strategy.reclaim_structures();

        let list_ref = if fits_in_place {
            let bytes = value_list::serialize(&refs);
            self.patch_cell(nk.value_list_offset, |p| {
                p[..bytes.len()].copy_from_slice(&bytes);
            })?;
            nk.value_list_offset
        } else {
            let reference = self.write_cell(&value_list::serialize(&refs), CellClass::ValueList)?;
            if has_old_list {
                let reclaim = self.strategy.reclaim_structures();
                if reclaim {
                    self.free_cell(nk.value_list_offset)?;
                }
            }
            reference
        };

        let count = refs.len() as u32;
        self.patch_cell(nk_ref, |p| {
            write_u32_le(p, NK_VALUE_COUNT, count);
            write_u32_le(p, NK_VALUE_LIST, list_ref);
        })?;

        Ok(())
    }
}

/// Checks a key or value name against the encoding rules. Value names may
/// be empty (the default value); key names may not.
fn validate_name(name: &str, allow_empty: bool) -> Result<()> {
    if name.is_empty() && !allow_empty {
        return Err(EngineError::invalid_name(name, "empty name"));
    }

    let encoded_len = name.encode_utf16().count() * 2;
    if encoded_len > u16::MAX as usize {
        return Err(EngineError::invalid_name(name, "name longer than 65535 bytes"));
    }

    if name.chars().any(|c| c == '\0') {
        return Err(EngineError::invalid_name(name, "embedded NUL"));
    }

    Ok(())
}
