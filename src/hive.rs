//! The hive façade: open/create, the commit protocol, and read access.
//!
//! A `Hive` owns the mapping and every piece of engine state around it:
//! the allocator's free lists, the dirty tracker, the in-memory index,
//! the SK dedup directory, and the write strategy. Mutation entry points
//! live in the editor module; traversal in the walker module.

use crate::alloc::Allocator;
use crate::bigdata::{self, BIG_DATA_CHUNK_SIZE};
use crate::cancel::CancelToken;
use crate::cell::{CellClass, KeyNodeFlags, ValueType};
use crate::deferred::DeferredSubkeys;
use crate::dirty::{CommitMode, DirtyTracker};
use crate::error::{EngineError, Result};
use crate::header::{BaseBlock, BASE_BLOCK_SIZE};
use crate::hbin::{HbinHeader, HBIN_HEADER_SIZE};
use crate::index::KeyIndex;
use crate::key::KeyNode;
use crate::mapping::{HiveMapping, PAGE_SIZE};
use crate::security::{SecurityCell, SkDirectory, DEFAULT_SECURITY_DESCRIPTOR};
use crate::strategy::WriteStrategy;
use crate::subkey_list::LeafKind;
use crate::utils::{align_cell, filetime_now, write_i32_le, REF_NONE};
use crate::value::{ValueData, ValueKey};
use std::path::Path;
use tracing::{debug, info, instrument};

/// Name given to the root key of a freshly created hive.
const NEW_ROOT_NAME: &str = "ROOT";

/// Hive format minor version written by `create`.
const NEW_HIVE_MINOR_VERSION: u32 = 5;

/// An open registry hive with full read-write access.
pub struct Hive {
    pub(crate) mapping: HiveMapping,
    pub(crate) base: BaseBlock,
    pub(crate) alloc: Allocator,
    pub(crate) dirty: DirtyTracker,
    pub(crate) index: KeyIndex,
    pub(crate) sk_dir: SkDirectory,
    pub(crate) strategy: WriteStrategy,
    pub(crate) deferred: Option<DeferredSubkeys>,
}

impl Hive {
    /// Opens a hive file with the default (hybrid) write strategy.
    ///
    /// Validates the base block and every HBIN and cell, builds the free
    /// lists and the in-memory index. Any corrupt-header or corrupt-cell
    /// finding refuses the file.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_strategy(path, WriteStrategy::default())
    }

    /// Opens a hive file with an explicit write strategy.
    pub fn open_with_strategy<P: AsRef<Path>>(path: P, strategy: WriteStrategy) -> Result<Self> {
        info!("opening registry hive");
        let mapping = HiveMapping::open(path)?;
        Self::from_mapping(mapping, strategy)
    }

    /// Creates a fresh, minimal, valid hive file: header, one HBIN, a
    /// root key with the default security descriptor.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file_name = path
            .as_ref()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let image = Self::build_initial_image(&file_name);
        let mapping = HiveMapping::create(path, &image)?;
        Self::from_mapping(mapping, WriteStrategy::default())
    }

    /// Builds the byte image of a minimal hive.
    fn build_initial_image(file_name: &str) -> Vec<u8> {
        let mut image = vec![0u8; BASE_BLOCK_SIZE + PAGE_SIZE];

        // Data area layout: sk cell, then the root nk, then one free cell
        // covering the rest of the bin.
        let sk_ref = HBIN_HEADER_SIZE as u32;
        let sk_payload = SecurityCell::serialize_new(sk_ref, sk_ref, 1, &DEFAULT_SECURITY_DESCRIPTOR);
        let sk_cell = align_cell(4 + sk_payload.len());

        let root_ref = sk_ref + sk_cell as u32;
        let root_payload = KeyNode::serialize_new(
            NEW_ROOT_NAME,
            root_ref,
            sk_ref,
            KeyNodeFlags::ROOT_KEY | KeyNodeFlags::NO_DELETE,
            filetime_now(),
        );
        let root_cell = align_cell(4 + root_payload.len());

        let free_ref = root_ref + root_cell as u32;
        let free_size = PAGE_SIZE - free_ref as usize;

        HbinHeader::write_initial(&mut image[BASE_BLOCK_SIZE..], 0, PAGE_SIZE as u32);

        let sk_abs = BASE_BLOCK_SIZE + sk_ref as usize;
        write_i32_le(&mut image, sk_abs, -(sk_cell as i32));
        image[sk_abs + 4..sk_abs + 4 + sk_payload.len()].copy_from_slice(&sk_payload);

        let root_abs = BASE_BLOCK_SIZE + root_ref as usize;
        write_i32_le(&mut image, root_abs, -(root_cell as i32));
        image[root_abs + 4..root_abs + 4 + root_payload.len()].copy_from_slice(&root_payload);

        write_i32_le(&mut image, BASE_BLOCK_SIZE + free_ref as usize, free_size as i32);

        BaseBlock::write_initial(
            &mut image,
            root_ref,
            PAGE_SIZE as u32,
            NEW_HIVE_MINOR_VERSION,
            file_name,
        );

        image
    }

    /// Validates the mapped image and assembles the engine state.
    fn from_mapping(mapping: HiveMapping, strategy: WriteStrategy) -> Result<Self> {
        let base = BaseBlock::parse(mapping.as_slice())?;
        base.validate_geometry(mapping.len() as u64)?;

        // The whole data area must be covered by HBINs.
        if mapping.len() != BASE_BLOCK_SIZE + base.hive_length as usize {
            return Err(EngineError::corrupt_header(format!(
                "file length {:#x} does not equal header plus data size {:#x}",
                mapping.len(),
                base.hive_length
            )));
        }

        // Scanning the free lists doubles as whole-file cell validation.
        let alloc = Allocator::scan(&mapping)?;

        // The root must be an allocated nk cell.
        let root_ref = base.root_cell_offset;
        let root_payload = mapping.cell_payload(root_ref).map_err(|e| {
            EngineError::corrupt_header(format!("root reference does not resolve: {e}"))
        })?;
        KeyNode::parse(root_payload, root_ref)?;

        let mut hive = Self {
            mapping,
            base,
            alloc,
            dirty: DirtyTracker::new(PAGE_SIZE),
            index: KeyIndex::new(),
            sk_dir: SkDirectory::new(),
            strategy,
            deferred: None,
        };

        hive.build_index(&CancelToken::new())?;
        debug!(
            keys = hive.index.key_count(),
            values = hive.index.value_count(),
            "hive opened"
        );

        Ok(hive)
    }

    /// Returns a reference to the base block header.
    pub fn base_block(&self) -> &BaseBlock {
        &self.base
    }

    /// Reference of the root key node.
    pub fn root(&self) -> u32 {
        self.base.root_cell_offset
    }

    /// The active write strategy.
    pub fn strategy(&self) -> WriteStrategy {
        self.strategy
    }

    /// Replaces the write strategy for subsequent mutations.
    pub fn set_strategy(&mut self, strategy: WriteStrategy) {
        self.strategy = strategy;
    }

    /// The paired sequence numbers (primary, secondary).
    pub fn sequence_numbers(&self) -> (u32, u32) {
        (self.base.primary_sequence, self.base.secondary_sequence)
    }

    /// True when the sequence numbers match (no uncommitted mutation).
    pub fn is_clean(&self) -> bool {
        self.base.is_consistent()
    }

    /// Total file length in bytes.
    pub fn file_len(&self) -> usize {
        self.mapping.len()
    }

    /// Closes the hive, unmapping the file and dropping the handle.
    ///
    /// Uncommitted mutations are NOT flushed; call
    /// [`commit`](Self::commit) first if they should survive.
    pub fn close(self) {
        drop(self);
    }

    /// Commits all pending mutations durably.
    ///
    /// Phase one flushes the coalesced dirty data ranges; phase two
    /// writes the header with matching sequence numbers and flushes it,
    /// applying the fd-level sync the mode asks for. The header goes last
    /// because its sequence numbers are the commit marker.
    #[instrument(skip(self, cancel))]
    pub fn commit(&mut self, mode: CommitMode, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;

        if self.base.is_consistent() && self.dirty.is_empty() {
            return Ok(());
        }

        self.dirty.flush_data(self.mapping.map(), cancel)?;

        self.base.secondary_sequence = self.base.primary_sequence;
        self.base.last_written = filetime_now();
        self.base.hive_length = (self.mapping.len() - BASE_BLOCK_SIZE) as u32;

        let (primary, secondary, last_written, hive_length) = (
            self.base.primary_sequence,
            self.base.secondary_sequence,
            self.base.last_written,
            self.base.hive_length,
        );
        BaseBlock::patch_for_commit(
            &mut self.mapping.as_mut_slice()[..BASE_BLOCK_SIZE],
            primary,
            secondary,
            last_written,
            hive_length,
        );

        self.dirty
            .flush_header(self.mapping.map(), self.mapping.file(), mode, cancel)?;

        info!(sequence = primary, "commit complete");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read access
    // ------------------------------------------------------------------

    /// Parses the key node at `nk_ref`.
    pub fn key_node(&self, nk_ref: u32) -> Result<KeyNode> {
        KeyNode::parse(self.mapping.cell_payload(nk_ref)?, nk_ref)
    }

    /// Parses the value key at `vk_ref`.
    pub fn value_key(&self, vk_ref: u32) -> Result<ValueKey> {
        ValueKey::parse(self.mapping.cell_payload(vk_ref)?, vk_ref)
    }

    /// Resolves a key path (segments under the root) to its reference.
    pub fn key_ref(&self, path: &[&str]) -> Result<u32> {
        let mut current = self.root();
        for segment in path {
            current = self
                .index
                .lookup_key(current, segment)
                .ok_or_else(|| EngineError::KeyNotFound(segment.to_string()))?;
        }
        Ok(current)
    }

    /// Names of the subkeys of `nk_ref`, in stored (sorted) order.
    pub fn subkey_names(&self, nk_ref: u32) -> Result<Vec<String>> {
        let nk = self.key_node(nk_ref)?;
        if nk.subkey_list_offset == REF_NONE || nk.subkey_count == 0 {
            return Ok(Vec::new());
        }

        let (entries, _) = crate::subkey_list::read_flat(&self.mapping, nk.subkey_list_offset)?;
        entries
            .iter()
            .map(|e| Ok(self.key_node(e.key_offset)?.name))
            .collect()
    }

    /// Names of the values of `nk_ref`, in stored order.
    pub fn value_names(&self, nk_ref: u32) -> Result<Vec<String>> {
        let nk = self.key_node(nk_ref)?;
        if nk.value_list_offset == REF_NONE || nk.value_count == 0 {
            return Ok(Vec::new());
        }

        let refs = crate::value_list::read(&self.mapping, nk.value_list_offset, nk.value_count)?;
        refs.iter()
            .map(|&vk_ref| Ok(self.value_key(vk_ref)?.name))
            .collect()
    }

    /// Type and raw bytes of the value `name` under `nk_ref`.
    pub fn value_bytes(&self, nk_ref: u32, name: &str) -> Result<(ValueType, Vec<u8>)> {
        let vk_ref = self
            .index
            .lookup_value(nk_ref, name)
            .ok_or_else(|| EngineError::ValueNotFound(name.to_string()))?;

        let vk = self.value_key(vk_ref)?;
        let data = self.read_vk_data(&vk)?;
        Ok((vk.data_type, data))
    }

    /// Decoded data of the value `name` under `nk_ref`.
    pub fn value_data(&self, nk_ref: u32, name: &str) -> Result<ValueData> {
        let (data_type, bytes) = self.value_bytes(nk_ref, name)?;
        ValueData::parse(&bytes, data_type, nk_ref)
    }

    /// Assembles the raw data bytes a value key points at, whatever its
    /// storage shape (inline, single cell, or big-data fan-out).
    pub(crate) fn read_vk_data(&self, vk: &ValueKey) -> Result<Vec<u8>> {
        if vk.is_inline_data() {
            return Ok(vk.inline_data());
        }
        if vk.data_length == 0 || vk.data_offset == REF_NONE || vk.data_offset == 0 {
            return Ok(Vec::new());
        }

        let total = vk.data_length as usize;
        if total > BIG_DATA_CHUNK_SIZE {
            return bigdata::read_data(&self.mapping, vk.data_offset, total);
        }

        let payload = self.mapping.cell_payload(vk.data_offset)?;
        if payload.len() < total {
            return Err(EngineError::corrupt_cell(
                vk.data_offset,
                format!("data cell holds {} bytes, value claims {}", payload.len(), total),
            ));
        }
        Ok(payload[..total].to_vec())
    }

    /// Reference of the value `name` under `nk_ref`, if present.
    pub fn value_ref(&self, nk_ref: u32, name: &str) -> Option<u32> {
        self.index.lookup_value(nk_ref, name)
    }

    /// Debug method: raw payload of any allocated cell.
    #[doc(hidden)]
    pub fn raw_cell_payload(&self, reference: u32) -> Result<&[u8]> {
        self.mapping.cell_payload(reference)
    }

    /// Verifies the structural invariants of the whole hive.
    ///
    /// Checks every cell's size discipline and free-cell adjacency per
    /// HBIN, then walks the tree from the root checking that each key's
    /// subkey and value counts match its lists and that every SK cell's
    /// reference count equals the number of keys pointing at it.
    pub fn verify_consistency(&self) -> Result<()> {
        // Cell level: sizes and signs are revalidated by the iterator;
        // two free cells may never touch.
        let data = self.mapping.as_slice();
        let data_len = data.len() - BASE_BLOCK_SIZE;
        let mut pos = 0usize;
        while pos < data_len {
            let abs = BASE_BLOCK_SIZE + pos;
            let header = HbinHeader::parse(&data[abs..], pos as u32)?;
            let bin_size = header.size as usize;

            let mut prev_free = false;
            let cells = crate::hbin::HbinCellIterator::new(
                &data[abs + HBIN_HEADER_SIZE..abs + bin_size],
                pos as u32,
            );
            for cell in cells {
                let cell = cell?;
                if !cell.is_allocated && prev_free {
                    return Err(EngineError::corrupt_cell(
                        cell.offset,
                        "adjacent free cells left uncoalesced",
                    ));
                }
                prev_free = !cell.is_allocated;
            }

            pos += bin_size;
        }

        // Tree level: counts and SK reference counts.
        let mut sk_counts: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();
        let mut stack = vec![self.root()];
        let mut visited = std::collections::HashSet::new();

        while let Some(nk_ref) = stack.pop() {
            if !visited.insert(nk_ref) {
                return Err(EngineError::corrupt_cell(nk_ref, "key tree contains a cycle"));
            }
            let nk = self.key_node(nk_ref)?;

            let child_count = if nk.subkey_list_offset == REF_NONE {
                0
            } else {
                let (entries, _) =
                    crate::subkey_list::read_flat(&self.mapping, nk.subkey_list_offset)?;
                for entry in &entries {
                    stack.push(entry.key_offset);
                }
                entries.len() as u32
            };
            if child_count != nk.subkey_count {
                return Err(EngineError::corrupt_cell(
                    nk_ref,
                    format!(
                        "subkey count {} disagrees with list length {}",
                        nk.subkey_count, child_count
                    ),
                ));
            }

            if nk.value_count > 0 {
                crate::value_list::read(&self.mapping, nk.value_list_offset, nk.value_count)?;
            }

            if nk.security_offset != 0 && nk.security_offset != REF_NONE {
                *sk_counts.entry(nk.security_offset).or_insert(0) += 1;
            }
        }

        for (sk_ref, expected) in sk_counts {
            let cell = SecurityCell::parse(self.mapping.cell_payload(sk_ref)?, sk_ref)?;
            if cell.ref_count != expected {
                return Err(EngineError::corrupt_cell(
                    sk_ref,
                    format!(
                        "sk reference count {} disagrees with {} referencing keys",
                        cell.ref_count, expected
                    ),
                ));
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared mutation plumbing
    // ------------------------------------------------------------------

    /// The leaf flavor this hive writes, by format minor version.
    pub(crate) fn leaf_kind(&self) -> LeafKind {
        LeafKind::for_minor_version(self.base.minor_version)
    }

    /// Marks the hive dirty before its first mutation since the last
    /// commit: the primary sequence number advances so on-disk readers
    /// see the hive as in-flux until the header is committed.
    pub(crate) fn note_mutation(&mut self) {
        if self.base.is_consistent() {
            self.base.primary_sequence = self.base.primary_sequence.wrapping_add(1).max(1);
            let primary = self.base.primary_sequence;
            let page = &mut self.mapping.as_mut_slice()[..BASE_BLOCK_SIZE];
            crate::utils::write_u32_le(page, crate::header::PRIMARY_SEQUENCE_OFFSET, primary);
            BaseBlock::refresh_checksum(page);
        }
    }

    /// Allocates a cell for `payload` and copies it in, returning the new
    /// reference. The caller must treat this as a growth point.
    pub(crate) fn write_cell(&mut self, payload: &[u8], class: CellClass) -> Result<u32> {
        let reference = self
            .alloc
            .alloc(&mut self.mapping, &mut self.dirty, 4 + payload.len(), class)?;
        self.mapping.cell_payload_mut(reference)?[..payload.len()].copy_from_slice(payload);
        Ok(reference)
    }

    /// Applies `patch` to the payload of the cell at `reference` and
    /// records the whole cell dirty.
    pub(crate) fn patch_cell<F>(&mut self, reference: u32, patch: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let payload = self.mapping.cell_payload_mut(reference)?;
        patch(payload);
        let len = payload.len();
        self.dirty.add(BASE_BLOCK_SIZE + reference as usize, len + 4);
        Ok(())
    }

    /// Frees a cell through the allocator.
    pub(crate) fn free_cell(&mut self, reference: u32) -> Result<()> {
        self.alloc.free(&mut self.mapping, &mut self.dirty, reference)
    }
}
