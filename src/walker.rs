//! Bounded depth-first traversal: the public walk and the index builder.

use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::hive::Hive;
use crate::key::KeyNode;
use crate::subkey_list;
use crate::utils::REF_NONE;
use crate::value_list;
use std::collections::HashSet;
use tracing::debug;

/// What the walk visitor wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    /// Keep walking.
    Continue,
    /// Halt the walk immediately; `walk` returns Ok.
    Stop,
}

impl Hive {
    /// Depth-first walk over every key reachable from the root.
    ///
    /// The visitor receives each key's reference and parsed node;
    /// returning [`WalkControl::Stop`] halts the walk. The cancellation
    /// token is checked per visited cell.
    pub fn walk<F>(&self, cancel: &CancelToken, mut visitor: F) -> Result<()>
    where
        F: FnMut(u32, &KeyNode) -> WalkControl,
    {
        let mut stack = vec![self.root()];
        let mut visited = HashSet::new();

        while let Some(nk_ref) = stack.pop() {
            cancel.check()?;

            if !visited.insert(nk_ref) {
                return Err(EngineError::corrupt_cell(nk_ref, "key tree contains a cycle"));
            }

            let nk = self.key_node(nk_ref)?;
            if visitor(nk_ref, &nk) == WalkControl::Stop {
                return Ok(());
            }

            if nk.subkey_list_offset != REF_NONE && nk.subkey_count > 0 {
                let (entries, _) = subkey_list::read_flat(&self.mapping, nk.subkey_list_offset)?;
                // Reverse so the stack pops children in stored order.
                for entry in entries.into_iter().rev() {
                    stack.push(entry.key_offset);
                }
            }
        }

        Ok(())
    }

    /// Rebuilds the in-memory index (and the SK directory) from disk.
    ///
    /// Always legal: the index is an accelerator, and any inconsistency
    /// suspicion is answered by running this again.
    pub fn build_index(&mut self, cancel: &CancelToken) -> Result<()> {
        self.index.clear();

        let mut stack = vec![self.root()];
        let mut visited = HashSet::new();

        while let Some(nk_ref) = stack.pop() {
            cancel.check()?;

            if !visited.insert(nk_ref) {
                return Err(EngineError::corrupt_cell(nk_ref, "key tree contains a cycle"));
            }

            let nk = self.key_node(nk_ref)?;

            if nk.security_offset != 0 && nk.security_offset != REF_NONE {
                self.sk_dir.register_existing(&self.mapping, nk.security_offset)?;
            }

            if nk.value_list_offset != REF_NONE && nk.value_count > 0 {
                let refs = value_list::read(&self.mapping, nk.value_list_offset, nk.value_count)?;
                for vk_ref in refs {
                    cancel.check()?;
                    let vk = self.value_key(vk_ref)?;
                    self.index.insert_value(nk_ref, &vk.name, vk_ref);
                }
            }

            if nk.subkey_list_offset != REF_NONE && nk.subkey_count > 0 {
                let (entries, _) = subkey_list::read_flat(&self.mapping, nk.subkey_list_offset)?;
                for entry in entries {
                    let child = self.key_node(entry.key_offset)?;
                    self.index.insert_key(nk_ref, &child.name, entry.key_offset);
                    stack.push(entry.key_offset);
                }
            }
        }

        debug!(
            keys = self.index.key_count(),
            values = self.index.value_count(),
            "index rebuilt"
        );
        Ok(())
    }
}
