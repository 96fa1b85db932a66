//! Cell allocation: per-HBIN free lists, best-fit with splitting, freeing
//! with coalescing, and file growth by whole HBINs.
//!
//! The allocator is the sole producer of new references and the sole
//! authority on cell size headers. Every allocation is a potential growth
//! point: callers must re-resolve any byte view they held beforehand.

use crate::cell::CellClass;
use crate::dirty::DirtyTracker;
use crate::error::{EngineError, Result};
use crate::hbin::{HbinCellIterator, HbinHeader, HBIN_ALIGNMENT, HBIN_HEADER_SIZE};
use crate::header::BASE_BLOCK_SIZE;
use crate::mapping::HiveMapping;
use crate::utils::align_cell;
use std::collections::BTreeMap;
use tracing::trace;

/// Upper bound on a single cell allocation. Anything larger is a caller
/// bug or a corrupt length; growth for it would be unreasonable.
const MAX_CELL_ALLOC: usize = 0x3FFF_0000;

/// Free-cell bookkeeping for the whole hive.
///
/// Free cells are keyed by their containing HBIN start for locality; the
/// HBIN spans themselves are tracked so coalescing never crosses a bin
/// boundary.
#[derive(Debug, Default)]
pub struct Allocator {
    /// HBIN start reference -> HBIN size in bytes.
    hbins: BTreeMap<u32, u32>,

    /// HBIN start reference -> (free cell reference -> cell size).
    free: BTreeMap<u32, BTreeMap<u32, u32>>,
}

impl Allocator {
    /// Builds the free lists by scanning every HBIN and cell in the
    /// mapping. Doubles as the open-time cell-invariant validation.
    pub fn scan(mapping: &HiveMapping) -> Result<Self> {
        let data = mapping.as_slice();
        let data_len = data.len() - BASE_BLOCK_SIZE;

        let mut alloc = Allocator::default();

        let mut pos: usize = 0;
        while pos < data_len {
            let abs = BASE_BLOCK_SIZE + pos;
            let header = HbinHeader::parse(&data[abs..], pos as u32)?;

            let bin_size = header.size as usize;
            if pos + bin_size > data_len {
                return Err(EngineError::corrupt_cell(
                    pos as u32,
                    format!("hbin of {:#x} bytes runs past the data area", bin_size),
                ));
            }

            alloc.hbins.insert(pos as u32, header.size);
            let mut bin_free = BTreeMap::new();

            let cells = HbinCellIterator::new(
                &data[abs + HBIN_HEADER_SIZE..abs + bin_size],
                pos as u32,
            );
            for cell in cells {
                let cell = cell?;
                if !cell.is_allocated {
                    bin_free.insert(cell.offset, cell.size);
                }
            }

            alloc.free.insert(pos as u32, bin_free);
            pos += bin_size;
        }

        Ok(alloc)
    }

    /// Returns the HBIN (start, size) containing `reference`, if any.
    pub fn hbin_of(&self, reference: u32) -> Option<(u32, u32)> {
        let (&start, &size) = self.hbins.range(..=reference).next_back()?;
        if reference < start + size {
            Some((start, size))
        } else {
            None
        }
    }

    /// Number of free cells across all HBINs (test support).
    pub fn free_cell_count(&self) -> usize {
        self.free.values().map(BTreeMap::len).sum()
    }

    /// Iterates all free cells as (reference, size) pairs (test support).
    pub fn free_cells(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.free
            .values()
            .flat_map(|bin| bin.iter().map(|(&r, &s)| (r, s)))
    }

    /// Allocates a cell of at least `need` bytes (including the 4-byte
    /// size prefix) and returns its reference.
    ///
    /// The request is rounded up to a multiple of 8. Best fit is taken
    /// within the lowest HBIN that has any fit; the found free cell is
    /// split when the remainder can stand as a free cell of its own. When
    /// no HBIN fits, the hive grows by the smallest number of pages that
    /// can hold the cell in a fresh HBIN.
    ///
    /// The payload of the returned cell is zeroed.
    pub fn alloc(
        &mut self,
        mapping: &mut HiveMapping,
        dirty: &mut DirtyTracker,
        need: usize,
        class: CellClass,
    ) -> Result<u32> {
        if need > MAX_CELL_ALLOC {
            return Err(EngineError::OutOfSpace(format!(
                "cell allocation of {} bytes is impossible",
                need
            )));
        }

        let rounded = align_cell(need);

        if let Some((bin_start, reference, size)) = self.find_fit(rounded as u32) {
            self.claim(mapping, dirty, bin_start, reference, size, rounded as u32)?;
            trace!(reference, rounded, ?class, "allocated cell");
            return Ok(reference);
        }

        // No HBIN has a fit: grow by a fresh HBIN sized for the request.
        let bin_size = crate::utils::align_page(rounded + HBIN_HEADER_SIZE);
        let bin_start = (mapping.len() - BASE_BLOCK_SIZE) as u32;

        mapping.grow_by_pages(bin_size / HBIN_ALIGNMENT)?;

        let abs = BASE_BLOCK_SIZE + bin_start as usize;
        let data = mapping.as_mut_slice();
        HbinHeader::write_initial(&mut data[abs..], bin_start, bin_size as u32);

        // One big free cell covering the rest of the bin.
        let free_ref = bin_start + HBIN_HEADER_SIZE as u32;
        let free_size = (bin_size - HBIN_HEADER_SIZE) as u32;
        crate::utils::write_i32_le(data, abs + HBIN_HEADER_SIZE, free_size as i32);

        dirty.add(abs, bin_size);

        self.hbins.insert(bin_start, bin_size as u32);
        let mut bin_free = BTreeMap::new();
        bin_free.insert(free_ref, free_size);
        self.free.insert(bin_start, bin_free);

        self.claim(mapping, dirty, bin_start, free_ref, free_size, rounded as u32)?;
        trace!(reference = free_ref, rounded, ?class, "allocated cell in fresh hbin");
        Ok(free_ref)
    }

    /// Finds the lowest HBIN holding a fit and the best-fitting free cell
    /// within it.
    fn find_fit(&self, rounded: u32) -> Option<(u32, u32, u32)> {
        for (&bin_start, bin_free) in &self.free {
            let mut best: Option<(u32, u32)> = None;
            for (&reference, &size) in bin_free {
                if size >= rounded {
                    match best {
                        Some((_, best_size)) if best_size <= size => {}
                        _ => best = Some((reference, size)),
                    }
                }
            }
            if let Some((reference, size)) = best {
                return Some((bin_start, reference, size));
            }
        }
        None
    }

    /// Converts the free cell `(reference, size)` into an allocated cell
    /// of exactly `rounded` bytes, splitting off the remainder as a new
    /// free cell when it is large enough to stand alone.
    fn claim(
        &mut self,
        mapping: &mut HiveMapping,
        dirty: &mut DirtyTracker,
        bin_start: u32,
        reference: u32,
        size: u32,
        rounded: u32,
    ) -> Result<()> {
        let bin_free = self
            .free
            .get_mut(&bin_start)
            .ok_or_else(|| EngineError::corrupt_cell(reference, "free cell in unknown hbin"))?;
        bin_free.remove(&reference);

        let remainder = size - rounded;
        let (claimed, split_at) = if remainder >= 8 {
            (rounded, Some((reference + rounded, remainder)))
        } else {
            (size, None)
        };

        mapping.set_cell_size_raw(reference, -(claimed as i32))?;

        if let Some((free_ref, free_size)) = split_at {
            mapping.set_cell_size_raw(free_ref, free_size as i32)?;
            bin_free.insert(free_ref, free_size);
        }

        // Zero the payload so fresh cells never leak stale bytes.
        let abs = BASE_BLOCK_SIZE + reference as usize;
        let payload_len = claimed as usize - 4;
        mapping.as_mut_slice()[abs + 4..abs + 4 + payload_len].fill(0);

        dirty.add(abs, claimed as usize + if split_at.is_some() { 4 } else { 0 });

        Ok(())
    }

    /// Frees the allocated cell at `reference`, coalescing it with the
    /// immediately preceding and following free cells of the same HBIN.
    pub fn free(
        &mut self,
        mapping: &mut HiveMapping,
        dirty: &mut DirtyTracker,
        reference: u32,
    ) -> Result<()> {
        let size = mapping.cell_size_raw(reference)?;
        if size >= 0 {
            return Err(EngineError::invalid_ref(reference, "double free"));
        }
        let mut size = size.unsigned_abs();

        let (bin_start, bin_size) = self.hbin_of(reference).ok_or_else(|| {
            EngineError::corrupt_cell(reference, "cell outside any known hbin")
        })?;
        let bin_end = bin_start + bin_size;
        let bin_free = self.free.entry(bin_start).or_default();

        let mut start = reference;

        // Merge the immediately following free cell, never across the
        // HBIN boundary.
        let next = start + size;
        if next < bin_end {
            if let Some(&next_size) = bin_free.get(&next) {
                bin_free.remove(&next);
                size += next_size;
            }
        }

        // Merge the immediately preceding free cell.
        if let Some((&prev_ref, &prev_size)) = bin_free.range(..start).next_back() {
            if prev_ref + prev_size == start {
                bin_free.remove(&prev_ref);
                start = prev_ref;
                size += prev_size;
            }
        }

        mapping.set_cell_size_raw(start, size as i32)?;
        bin_free.insert(start, size);

        dirty.add(BASE_BLOCK_SIZE + start as usize, 4);
        trace!(reference, merged_start = start, merged_size = size, "freed cell");

        Ok(())
    }

    /// Truncates `pages` whole pages off the end of the hive.
    ///
    /// Only allowed when the trailing HBIN consists of exactly one free
    /// cell and spans exactly the pages being removed.
    pub fn truncate_pages(
        &mut self,
        mapping: &mut HiveMapping,
        pages: usize,
    ) -> Result<()> {
        let drop_len = pages * HBIN_ALIGNMENT;
        let data_len = mapping.len() - BASE_BLOCK_SIZE;
        if drop_len == 0 || drop_len >= data_len {
            return Err(EngineError::OutOfSpace(
                "truncation would remove the whole data area".into(),
            ));
        }

        let (&last_start, &last_size) = self
            .hbins
            .iter()
            .next_back()
            .ok_or_else(|| EngineError::OutOfSpace("no hbins to truncate".into()))?;

        if last_size as usize != drop_len {
            return Err(EngineError::OutOfSpace(format!(
                "trailing hbin spans {:#x} bytes, not the requested {:#x}",
                last_size, drop_len
            )));
        }

        let bin_free = self.free.get(&last_start);
        let whole_bin_free = bin_free.is_some_and(|f| {
            f.len() == 1
                && f.iter().next().is_some_and(|(&r, &s)| {
                    r == last_start + HBIN_HEADER_SIZE as u32
                        && s == last_size - HBIN_HEADER_SIZE as u32
                })
        });
        if !whole_bin_free {
            return Err(EngineError::OutOfSpace(
                "trailing hbin still holds allocated cells".into(),
            ));
        }

        mapping.truncate_to_len(BASE_BLOCK_SIZE + data_len - drop_len)?;
        self.hbins.remove(&last_start);
        self.free.remove(&last_start);

        Ok(())
    }
}
