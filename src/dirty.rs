//! Page-level dirty tracking and the flush half of the commit protocol.
//!
//! Editors report every touched byte range; the tracker coalesces them to
//! page-aligned, sorted, disjoint ranges at flush time and msyncs each one.
//! The header page is flushed separately and last, because its sequence
//! numbers act as the commit marker.

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::header::BASE_BLOCK_SIZE;
use memmap2::MmapMut;
use std::fs::File;
use tracing::{debug, trace};

/// Durability mode for [`flush_header`](DirtyTracker::flush_header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Header msync followed by a data-level fd sync.
    Auto,
    /// Data msync only; the caller issues its own fd sync later.
    DataOnly,
    /// Header msync followed by a full fd sync (metadata included).
    Full,
}

/// Accumulates dirty byte ranges against the hive mapping.
#[derive(Debug)]
pub struct DirtyTracker {
    ranges: Vec<(usize, usize)>,
    page_size: usize,
}

impl DirtyTracker {
    /// Creates a tracker for the given OS page size (typically 4096).
    pub fn new(page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            ranges: Vec::new(),
            page_size,
        }
    }

    /// Records a modified byte range. O(1); no coalescing happens here.
    pub fn add(&mut self, offset: usize, length: usize) {
        if length == 0 {
            return;
        }
        self.ranges.push((offset, length));
    }

    /// Returns true if no ranges are pending.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of raw (uncoalesced) pending ranges.
    pub fn pending(&self) -> usize {
        self.ranges.len()
    }

    /// Drops all pending ranges.
    pub fn reset(&mut self) {
        self.ranges.clear();
    }

    /// Produces the page-aligned, sorted, disjoint coalesced ranges.
    ///
    /// Each (offset, length) is aligned outward to page boundaries, then
    /// overlapping or adjacent ranges are merged in one sweep.
    pub fn coalesced(&self) -> Vec<(usize, usize)> {
        let mask = self.page_size - 1;

        let mut aligned: Vec<(usize, usize)> = self
            .ranges
            .iter()
            .map(|&(off, len)| {
                let start = off & !mask;
                let end = (off + len + mask) & !mask;
                (start, end)
            })
            .collect();

        aligned.sort_unstable();

        let mut out: Vec<(usize, usize)> = Vec::with_capacity(aligned.len());
        for (start, end) in aligned {
            match out.last_mut() {
                // Adjacency counts as overlap.
                Some((_, cur_end)) if start <= *cur_end => {
                    *cur_end = (*cur_end).max(end);
                }
                _ => out.push((start, end)),
            }
        }

        out.into_iter()
            .map(|(start, end)| (start, end - start))
            .collect()
    }

    /// Flushes all pending data ranges to disk.
    ///
    /// The portion of any range that falls inside the header page is left
    /// to [`flush_header`](Self::flush_header). The range list is cleared
    /// only after every range was synced, so a cancelled flush re-syncs
    /// everything on the next attempt.
    pub fn flush_data(&mut self, map: &MmapMut, cancel: &CancelToken) -> Result<()> {
        if self.ranges.is_empty() {
            return Ok(());
        }

        let ranges = self.coalesced();
        debug!(raw = self.ranges.len(), coalesced = ranges.len(), "flushing dirty ranges");

        for (start, len) in ranges {
            cancel.check()?;

            let mut start = start;
            let mut end = start + len;
            // The header page has its own flush ordering.
            if start < BASE_BLOCK_SIZE {
                start = BASE_BLOCK_SIZE;
            }
            end = end.min(map.len());
            if start >= end {
                continue;
            }

            trace!(start, len = end - start, "msync range");
            map.flush_range(start, end - start)?;
        }

        self.ranges.clear();
        Ok(())
    }

    /// Flushes the header page, then applies the fd-level sync the mode
    /// asks for.
    pub fn flush_header(
        &self,
        map: &MmapMut,
        file: &File,
        mode: CommitMode,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;

        map.flush_range(0, BASE_BLOCK_SIZE.min(map.len()))?;

        match mode {
            CommitMode::DataOnly => {}
            CommitMode::Auto => file.sync_data()?,
            CommitMode::Full => file.sync_all()?,
        }

        Ok(())
    }
}
