//! Deferred subkey building for bulk-construction workloads.
//!
//! Rewriting a parent's subkey list per insert is O(N²) when importing
//! thousands of keys. In deferred mode, inserts accumulate per-parent in
//! memory (seeded with the children already on disk) and one flush writes
//! each parent's list in a single pass. The mode is explicit and
//! fail-closed: disabling it with pending parents is an error, and delete
//! operations flush first so they see the real on-disk state.

use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::hive::Hive;
use crate::key::{NK_LAST_WRITTEN, NK_MAX_SUBKEY_NAME, NK_SUBKEY_COUNT, NK_SUBKEY_LIST};
use crate::subkey_list::{self, SubkeyEntry};
use crate::utils::{filetime_now, lowercase_name, write_u32_le, write_u64_le, REF_NONE};
use std::collections::HashMap;
use tracing::debug;

/// Per-parent accumulators for pending child entries.
#[derive(Debug, Default)]
pub(crate) struct DeferredSubkeys {
    /// Parent NK ref -> full child set (name, child ref), on-disk
    /// children included.
    pending: HashMap<u32, Vec<(String, u32)>>,
}

impl DeferredSubkeys {
    /// True when any parent still holds unflushed children.
    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Hive {
    /// Switches subkey insertion into deferred mode. A no-op when the
    /// mode is already on; accumulated state is kept.
    pub fn enable_deferred_subkeys(&mut self) {
        if self.deferred.is_none() {
            self.deferred = Some(DeferredSubkeys::default());
        }
    }

    /// Leaves deferred mode. Fails when parents still hold pending
    /// children; flush first.
    pub fn disable_deferred_subkeys(&mut self) -> Result<()> {
        match &self.deferred {
            Some(deferred) if deferred.has_pending() => Err(EngineError::DeferredPending {
                parents: deferred.pending.len(),
            }),
            _ => {
                self.deferred = None;
                Ok(())
            }
        }
    }

    /// Records a freshly created child in its parent's accumulator,
    /// seeding the accumulator from disk on first touch.
    pub(crate) fn defer_child(&mut self, parent_ref: u32, name: &str, nk_ref: u32) -> Result<()> {
        let seeded = self
            .deferred
            .as_ref()
            .is_some_and(|d| d.pending.contains_key(&parent_ref));

        let seed = if seeded {
            Vec::new()
        } else {
            self.on_disk_children(parent_ref)?
        };

        let deferred = self
            .deferred
            .as_mut()
            .ok_or_else(|| EngineError::corrupt_header("deferred insert without deferred mode"))?;

        let children = deferred.pending.entry(parent_ref).or_insert(seed);
        children.push((name.to_string(), nk_ref));
        Ok(())
    }

    /// Writes every pending parent's subkey list in one pass each and
    /// empties the accumulators. The old lists are freed (in-place) or
    /// orphaned (append) per the strategy.
    pub fn flush_deferred_subkeys(&mut self, cancel: &CancelToken) -> Result<()> {
        let Some(deferred) = self.deferred.as_mut() else {
            return Ok(());
        };
        let pending: Vec<(u32, Vec<(String, u32)>)> = deferred.pending.drain().collect();
        if pending.is_empty() {
            return Ok(());
        }

        let kind = self.leaf_kind();
        let reclaim = self.strategy.reclaim_structures();

        for (parent_ref, mut children) in pending {
            cancel.check()?;

            children.sort_by(|a, b| lowercase_name(&a.0).cmp(&lowercase_name(&b.0)));
            let entries: Vec<SubkeyEntry> = children
                .iter()
                .map(|(name, nk_ref)| SubkeyEntry {
                    key_offset: *nk_ref,
                    name_hint: kind.hash(name),
                })
                .collect();

            let parent = self.key_node(parent_ref)?;
            let new_list = self.write_subkey_list(&entries)?;
            if parent.subkey_list_offset != REF_NONE {
                self.free_subkey_list(parent.subkey_list_offset, reclaim)?;
            }

            let count = entries.len() as u32;
            let max_name = children
                .iter()
                .map(|(name, _)| (name.encode_utf16().count() * 2) as u32)
                .max()
                .unwrap_or(0)
                .max(parent.max_subkey_name_len);
            let now = filetime_now();

            self.patch_cell(parent_ref, |p| {
                write_u32_le(p, NK_SUBKEY_COUNT, count);
                write_u32_le(p, NK_SUBKEY_LIST, new_list);
                write_u32_le(p, NK_MAX_SUBKEY_NAME, max_name);
                write_u64_le(p, NK_LAST_WRITTEN, now);
            })?;

            debug!(parent_ref, children = count, "flushed deferred subkeys");
        }

        Ok(())
    }

    /// Reads the parent's current children (name, ref) from disk.
    fn on_disk_children(&self, parent_ref: u32) -> Result<Vec<(String, u32)>> {
        let parent = self.key_node(parent_ref)?;
        if parent.subkey_list_offset == REF_NONE || parent.subkey_count == 0 {
            return Ok(Vec::new());
        }

        let (entries, _) = subkey_list::read_flat(&self.mapping, parent.subkey_list_offset)?;
        entries
            .iter()
            .map(|e| Ok((self.key_node(e.key_offset)?.name, e.key_offset)))
            .collect()
    }
}
