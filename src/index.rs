//! In-memory fast-lookup index over the key/value tree.
//!
//! Two hash maps keyed by `(parent reference, lowercased name)`. The
//! index is an accelerator only: it stores plain tuples, borrows nothing
//! from the mapping, and can always be rebuilt from disk by the walker.

use crate::utils::lowercase_name;
use std::collections::HashMap;

/// Name-keyed lookup index for key nodes and value keys.
#[derive(Debug, Default)]
pub struct KeyIndex {
    /// (parent NK ref, lowercased subkey name) -> child NK ref.
    nk: HashMap<(u32, String), u32>,

    /// (NK ref, lowercased value name) -> VK ref.
    vk: HashMap<(u32, String), u32>,
}

impl KeyIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every entry (before a rebuild).
    pub fn clear(&mut self) {
        self.nk.clear();
        self.vk.clear();
    }

    /// Looks up a subkey by name under `parent`.
    pub fn lookup_key(&self, parent: u32, name: &str) -> Option<u32> {
        self.nk.get(&(parent, lowercase_name(name))).copied()
    }

    /// Looks up a value by name under `nk_ref`.
    pub fn lookup_value(&self, nk_ref: u32, name: &str) -> Option<u32> {
        self.vk.get(&(nk_ref, lowercase_name(name))).copied()
    }

    /// Installs or replaces a subkey entry.
    pub fn insert_key(&mut self, parent: u32, name: &str, child: u32) {
        self.nk.insert((parent, lowercase_name(name)), child);
    }

    /// Installs or replaces a value entry.
    pub fn insert_value(&mut self, nk_ref: u32, name: &str, vk_ref: u32) {
        self.vk.insert((nk_ref, lowercase_name(name)), vk_ref);
    }

    /// Removes a subkey entry.
    pub fn remove_key(&mut self, parent: u32, name: &str) {
        self.nk.remove(&(parent, lowercase_name(name)));
    }

    /// Removes a value entry.
    pub fn remove_value(&mut self, nk_ref: u32, name: &str) {
        self.vk.remove(&(nk_ref, lowercase_name(name)));
    }

    /// Drops every value entry belonging to `nk_ref`.
    ///
    /// Used when a key is deleted; the per-entry removals were already
    /// done by the value delete path, this sweeps any stragglers.
    pub fn remove_values_of(&mut self, nk_ref: u32) {
        self.vk.retain(|(owner, _), _| *owner != nk_ref);
    }

    /// Number of indexed keys (test support).
    pub fn key_count(&self) -> usize {
        self.nk.len()
    }

    /// Number of indexed values (test support).
    pub fn value_count(&self) -> usize {
        self.vk.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut index = KeyIndex::new();
        index.insert_key(0x20, "Software", 0x100);

        assert_eq!(index.lookup_key(0x20, "software"), Some(0x100));
        assert_eq!(index.lookup_key(0x20, "SOFTWARE"), Some(0x100));
        assert_eq!(index.lookup_key(0x21, "software"), None);

        index.remove_key(0x20, "SoftWare");
        assert_eq!(index.lookup_key(0x20, "software"), None);
    }

    #[test]
    fn test_value_sweep() {
        let mut index = KeyIndex::new();
        index.insert_value(0x100, "a", 0x1);
        index.insert_value(0x100, "b", 0x2);
        index.insert_value(0x200, "a", 0x3);

        index.remove_values_of(0x100);
        assert_eq!(index.value_count(), 1);
        assert_eq!(index.lookup_value(0x200, "a"), Some(0x3));
    }
}
