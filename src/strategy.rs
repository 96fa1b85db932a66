//! Write-strategy selection: whether mutation reuses cells or only
//! appends.
//!
//! All three strategies drive the same editors; the strategy only answers
//! reuse questions. Under append-only no cell is ever freed, so
//! use-after-free is impossible by construction and the file grows
//! monotonically.

/// Size below which the hybrid strategy keeps value data in place.
const HYBRID_SMALL_VALUE: usize = 1024;

/// Default slack percentage for hybrid in-place replacement.
const DEFAULT_SLACK_PERCENT: u32 = 25;

/// How mutations treat existing cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Allocate on create, free on delete/replace. Tightest space; can
    /// fragment under churn.
    InPlace,

    /// Never free. Deletions only drop references; orphaned cells stay.
    AppendOnly,

    /// Keys and deletes in place; small values in place, larger values
    /// appended. In-place replacement admits `slack_percent` waste.
    Hybrid {
        /// Tolerated waste, as a percentage of the existing cell size.
        slack_percent: u32,
    },
}

impl Default for WriteStrategy {
    fn default() -> Self {
        WriteStrategy::Hybrid {
            slack_percent: DEFAULT_SLACK_PERCENT,
        }
    }
}

impl WriteStrategy {
    /// Whether cells removed by an explicit delete are returned to the
    /// free list.
    pub fn reclaim_on_delete(&self) -> bool {
        !matches!(self, WriteStrategy::AppendOnly)
    }

    /// Whether the old cells of a replaced value are returned to the free
    /// list.
    pub fn reclaim_replaced_value(&self, old_data_len: usize) -> bool {
        match self {
            WriteStrategy::InPlace => true,
            WriteStrategy::AppendOnly => false,
            WriteStrategy::Hybrid { .. } => old_data_len < HYBRID_SMALL_VALUE,
        }
    }

    /// Whether structural cells (lists, key nodes) freed during a rewrite
    /// are returned to the free list.
    pub fn reclaim_structures(&self) -> bool {
        !matches!(self, WriteStrategy::AppendOnly)
    }

    /// Whether a data replacement may be written into the existing cell.
    ///
    /// `capacity` is the old cell's payload capacity; `new_len` the new
    /// payload size. The new data must fit, and under hybrid the waste it
    /// would leave must stay within the slack percentage.
    pub fn allow_in_place_rewrite(&self, capacity: usize, new_len: usize) -> bool {
        if new_len > capacity {
            return false;
        }
        match self {
            WriteStrategy::InPlace => true,
            WriteStrategy::AppendOnly => false,
            WriteStrategy::Hybrid { slack_percent } => {
                let cell_size = capacity + 4;
                let needed = crate::utils::align_cell(new_len + 4);
                let waste = cell_size.saturating_sub(needed);
                waste * 100 <= cell_size * *slack_percent as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_never_reclaims() {
        let s = WriteStrategy::AppendOnly;
        assert!(!s.reclaim_on_delete());
        assert!(!s.reclaim_replaced_value(10));
        assert!(!s.reclaim_structures());
        assert!(!s.allow_in_place_rewrite(100, 10));
    }

    #[test]
    fn test_in_place_always_reclaims() {
        let s = WriteStrategy::InPlace;
        assert!(s.reclaim_on_delete());
        assert!(s.reclaim_replaced_value(1 << 20));
        assert!(s.allow_in_place_rewrite(100, 100));
        assert!(!s.allow_in_place_rewrite(100, 101));
    }

    #[test]
    fn test_hybrid_small_value_cutoff() {
        let s = WriteStrategy::default();
        assert!(s.reclaim_replaced_value(1023));
        assert!(!s.reclaim_replaced_value(1024));
        assert!(s.reclaim_on_delete());
    }

    #[test]
    fn test_hybrid_slack() {
        let s = WriteStrategy::Hybrid { slack_percent: 25 };
        // Same size: no waste.
        assert!(s.allow_in_place_rewrite(252, 252));
        // Shrink within slack: 256-byte cell, 200-byte payload needs 208.
        assert!(s.allow_in_place_rewrite(252, 200));
        // Shrink past slack: 256-byte cell, 50-byte payload wastes 200.
        assert!(!s.allow_in_place_rewrite(252, 50));
    }
}
