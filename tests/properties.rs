//! Property tests for the dirty tracker, the allocator, and the tree
//! invariants.

use proptest::prelude::*;
use reg_engine::alloc::Allocator;
use reg_engine::cell::CellClass;
use reg_engine::dirty::DirtyTracker;
use reg_engine::hbin::{HbinCellIterator, HbinHeader, HBIN_HEADER_SIZE};
use reg_engine::header::BASE_BLOCK_SIZE;
use reg_engine::mapping::HiveMapping;
use reg_engine::{CancelToken, Hive, ValueType, WriteStrategy};

const PAGE: usize = 4096;

// --- dirty tracker -------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Coalesced output is sorted, disjoint, page-aligned, and covers
    /// every byte that was added.
    #[test]
    fn tracker_coalescing_preserves_union(
        ranges in prop::collection::vec((0usize..1 << 20, 1usize..16 * PAGE), 1..40)
    ) {
        let mut tracker = DirtyTracker::new(PAGE);
        for &(off, len) in &ranges {
            tracker.add(off, len);
        }

        let coalesced = tracker.coalesced();

        // Aligned and sorted with gaps between neighbors.
        for &(start, len) in &coalesced {
            prop_assert_eq!(start % PAGE, 0);
            prop_assert_eq!(len % PAGE, 0);
            prop_assert!(len > 0);
        }
        for pair in coalesced.windows(2) {
            let (a_start, a_len) = pair[0];
            let (b_start, _) = pair[1];
            // Strictly disjoint: adjacency would have merged.
            prop_assert!(a_start + a_len < b_start);
        }

        // Every added byte is covered.
        for &(off, len) in &ranges {
            let covered = coalesced
                .iter()
                .any(|&(start, clen)| start <= off && off + len <= start + clen);
            prop_assert!(covered, "range ({off}, {len}) not covered");
        }

        // Nothing outside the aligned inputs is covered.
        let total: usize = coalesced.iter().map(|&(_, len)| len).sum();
        let aligned_union: usize = {
            let mut spans: Vec<(usize, usize)> = ranges
                .iter()
                .map(|&(off, len)| {
                    let start = off & !(PAGE - 1);
                    let end = (off + len + PAGE - 1) & !(PAGE - 1);
                    (start, end)
                })
                .collect();
            spans.sort_unstable();
            let mut sum = 0;
            let mut cur: Option<(usize, usize)> = None;
            for (start, end) in spans {
                match cur {
                    Some((cs, ce)) if start <= ce => cur = Some((cs, ce.max(end))),
                    Some((cs, ce)) => {
                        sum += ce - cs;
                        cur = Some((start, end));
                    }
                    None => cur = Some((start, end)),
                }
            }
            if let Some((cs, ce)) = cur {
                sum += ce - cs;
            }
            sum
        };
        prop_assert_eq!(total, aligned_union);
    }
}

// --- allocator -----------------------------------------------------------

#[derive(Debug, Clone)]
enum AllocOp {
    Alloc(usize),
    Free(usize),
}

fn alloc_ops() -> impl Strategy<Value = Vec<AllocOp>> {
    prop::collection::vec(
        prop_oneof![
            (8usize..2048).prop_map(AllocOp::Alloc),
            (0usize..64).prop_map(AllocOp::Free),
        ],
        1..80,
    )
}

fn scratch_image() -> Vec<u8> {
    let mut image = vec![0u8; BASE_BLOCK_SIZE + PAGE];
    HbinHeader::write_initial(&mut image[BASE_BLOCK_SIZE..], 0, PAGE as u32);
    let free_size = (PAGE - HBIN_HEADER_SIZE) as i32;
    image[BASE_BLOCK_SIZE + HBIN_HEADER_SIZE..BASE_BLOCK_SIZE + HBIN_HEADER_SIZE + 4]
        .copy_from_slice(&free_size.to_le_bytes());
    image
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// After any alloc/free sequence: every allocated cell is negative,
    /// every free cell positive, all multiples of 8, and no two free
    /// cells are adjacent within an HBIN.
    #[test]
    fn allocator_invariants_hold(ops in alloc_ops()) {
        let dir = tempfile::tempdir().unwrap();
        let mut mapping =
            HiveMapping::create(dir.path().join("scratch"), &scratch_image()).unwrap();
        let mut alloc = Allocator::scan(&mapping).unwrap();
        let mut dirty = DirtyTracker::new(PAGE);

        let mut live: Vec<u32> = Vec::new();

        for op in ops {
            match op {
                AllocOp::Alloc(size) => {
                    let r = alloc
                        .alloc(&mut mapping, &mut dirty, size, CellClass::Data)
                        .unwrap();
                    live.push(r);
                }
                AllocOp::Free(pick) => {
                    if !live.is_empty() {
                        let r = live.swap_remove(pick % live.len());
                        alloc.free(&mut mapping, &mut dirty, r).unwrap();
                    }
                }
            }
        }

        // Scan every HBIN and re-derive the ground truth.
        let data = mapping.as_slice();
        let data_len = data.len() - BASE_BLOCK_SIZE;
        let mut free_seen = 0usize;
        let mut pos = 0usize;
        while pos < data_len {
            let abs = BASE_BLOCK_SIZE + pos;
            let header = HbinHeader::parse(&data[abs..], pos as u32).unwrap();
            let bin = header.size as usize;

            let mut prev_free = false;
            for cell in HbinCellIterator::new(&data[abs + HBIN_HEADER_SIZE..abs + bin], pos as u32) {
                let cell = cell.unwrap();
                // The iterator itself enforces size >= 8 and % 8 == 0.
                if !cell.is_allocated {
                    prop_assert!(!prev_free, "adjacent free cells at {:#x}", cell.offset);
                    free_seen += 1;
                }
                prev_free = !cell.is_allocated;
            }
            pos += bin;
        }

        prop_assert_eq!(free_seen, alloc.free_cell_count());

        // Every live reference still resolves to an allocated cell.
        for r in live {
            prop_assert!(mapping.cell_payload(r).is_ok());
        }
    }
}

// --- tree invariants -----------------------------------------------------

#[derive(Debug, Clone)]
enum TreeOp {
    EnsureShallow(u8),
    EnsureDeep(u8, u8),
    DeleteKey(u8),
    Upsert(u8, u8, u16),
    DeleteValue(u8, u8),
}

fn tree_ops() -> impl Strategy<Value = Vec<TreeOp>> {
    prop::collection::vec(
        prop_oneof![
            (0u8..8).prop_map(TreeOp::EnsureShallow),
            (0u8..8, 0u8..8).prop_map(|(a, b)| TreeOp::EnsureDeep(a, b)),
            (0u8..8).prop_map(TreeOp::DeleteKey),
            (0u8..8, 0u8..4, 0u16..5000).prop_map(|(a, v, n)| TreeOp::Upsert(a, v, n)),
            (0u8..8, 0u8..4).prop_map(|(a, v)| TreeOp::DeleteValue(a, v)),
        ],
        1..60,
    )
}

fn strategies() -> impl Strategy<Value = WriteStrategy> {
    prop_oneof![
        Just(WriteStrategy::InPlace),
        Just(WriteStrategy::AppendOnly),
        Just(WriteStrategy::default()),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// After any editing sequence, every reachable key's counts match
    /// its lists and every SK reference count matches its referencing
    /// keys, under every write strategy.
    #[test]
    fn tree_counts_and_sk_refcounts_hold(ops in tree_ops(), strategy in strategies()) {
        let cancel = CancelToken::new();
        let dir = tempfile::tempdir().unwrap();
        let mut hive = Hive::create(dir.path().join("tree.hive")).unwrap();
        hive.set_strategy(strategy);
        let root = hive.root();

        let key_names = ["ka", "kb", "kc", "kd", "ke", "kf", "kg", "kh"];
        let value_names = ["va", "vb", "vc", "vd"];

        let mut append_floor = hive.file_len();

        for op in ops {
            match op {
                TreeOp::EnsureShallow(a) => {
                    hive.ensure_key_path(root, &[key_names[a as usize]], &cancel).unwrap();
                }
                TreeOp::EnsureDeep(a, b) => {
                    hive.ensure_key_path(
                        root,
                        &[key_names[a as usize], key_names[b as usize]],
                        &cancel,
                    )
                    .unwrap();
                }
                TreeOp::DeleteKey(a) => {
                    if let Ok(reference) = hive.key_ref(&[key_names[a as usize]]) {
                        hive.delete_key(reference, true, &cancel).unwrap();
                    }
                }
                TreeOp::Upsert(a, v, len) => {
                    let (key, _) = hive
                        .ensure_key_path(root, &[key_names[a as usize]], &cancel)
                        .unwrap();
                    let data = vec![a ^ v; len as usize];
                    hive.upsert_value(key, value_names[v as usize], ValueType::Binary, &data, &cancel)
                        .unwrap();
                }
                TreeOp::DeleteValue(a, v) => {
                    if let Ok(key) = hive.key_ref(&[key_names[a as usize]]) {
                        hive.delete_value(key, value_names[v as usize], &cancel).unwrap();
                    }
                }
            }

            if strategy == WriteStrategy::AppendOnly {
                prop_assert!(hive.file_len() >= append_floor);
                append_floor = hive.file_len();
            }
        }

        hive.verify_consistency().unwrap();

        // ensure_key_path stays idempotent at the end of any history.
        let (first, created) = hive.ensure_key_path(root, &["ka", "kb"], &cancel).unwrap();
        let (second, created_again) = hive.ensure_key_path(root, &["ka", "kb"], &cancel).unwrap();
        prop_assert_eq!(first, second);
        let _ = created;
        prop_assert_eq!(created_again, 0);

        hive.verify_consistency().unwrap();
    }
}
