//! End-to-end tests of the mutation surface and the commit protocol.

use reg_engine::bigdata::BigDataBlock;
use reg_engine::hbin::{HbinHeader, HBIN_HEADER_SIZE};
use reg_engine::header::{BaseBlock, BASE_BLOCK_SIZE};
use reg_engine::key::KeyNode;
use reg_engine::value::ValueKey;
use reg_engine::{
    CancelToken, CommitMode, EngineError, Hive, ValueData, ValueType, WalkControl, WriteStrategy,
};
use std::path::{Path, PathBuf};

fn cancel() -> CancelToken {
    CancelToken::new()
}

fn new_hive(dir: &Path) -> (PathBuf, Hive) {
    let path = dir.join("test.hive");
    let hive = Hive::create(&path).unwrap();
    (path, hive)
}

// --- open-time validation ------------------------------------------------

#[test]
fn minimal_create_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("minimal.hive");

    // An 8 KiB file carrying nothing but the signature must be refused.
    let mut image = vec![0u8; 8192];
    image[0..4].copy_from_slice(b"regf");
    std::fs::write(&path, &image).unwrap();

    match Hive::open(&path) {
        Err(EngineError::CorruptHeader(_)) => {}
        other => panic!("expected CorruptHeader, got {:?}", other.map(|_| ())),
    }

    // Replace it with a minimally valid hive: correct header, one HBIN
    // holding a tiny root nk and one free cell.
    let root_ref = HBIN_HEADER_SIZE as u32;
    let root_payload = KeyNode::serialize_new("MINIMAL", root_ref, 0xFFFF_FFFF, 0x0004, 0);
    let root_cell = (4 + root_payload.len() + 7) & !7;

    let mut image = vec![0u8; BASE_BLOCK_SIZE + 4096];
    HbinHeader::write_initial(&mut image[BASE_BLOCK_SIZE..], 0, 4096);

    let root_abs = BASE_BLOCK_SIZE + root_ref as usize;
    image[root_abs..root_abs + 4].copy_from_slice(&(-(root_cell as i32)).to_le_bytes());
    image[root_abs + 4..root_abs + 4 + root_payload.len()].copy_from_slice(&root_payload);

    let free_abs = root_abs + root_cell;
    let free_size = (BASE_BLOCK_SIZE + 4096 - free_abs) as i32;
    image[free_abs..free_abs + 4].copy_from_slice(&free_size.to_le_bytes());

    BaseBlock::write_initial(&mut image, root_ref, 4096, 5, "minimal");
    std::fs::write(&path, &image).unwrap();

    let hive = Hive::open(&path).unwrap();
    assert_eq!(hive.root(), root_ref);
    assert_eq!(hive.key_node(hive.root()).unwrap().name, "MINIMAL");
}

#[test]
fn corrupt_checksum_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (path, hive) = new_hive(dir.path());
    drop(hive);

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0x08] ^= 0xFF; // secondary sequence, covered by the checksum
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(
        Hive::open(&path),
        Err(EngineError::CorruptHeader(_))
    ));
}

// --- key editing ---------------------------------------------------------

#[test]
fn ensure_key_path_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut hive) = new_hive(dir.path());
    let root = hive.root();

    let (first_ref, created) = hive
        .ensure_key_path(root, &["Software", "Vendor", "App"], &cancel())
        .unwrap();
    assert_eq!(created, 3);

    let (second_ref, created) = hive
        .ensure_key_path(root, &["Software", "Vendor", "App"], &cancel())
        .unwrap();
    assert_eq!(second_ref, first_ref);
    assert_eq!(created, 0);

    // Case-insensitive matching reuses the same keys.
    let (third_ref, created) = hive
        .ensure_key_path(root, &["SOFTWARE", "vendor", "APP"], &cancel())
        .unwrap();
    assert_eq!(third_ref, first_ref);
    assert_eq!(created, 0);

    hive.verify_consistency().unwrap();
}

#[test]
fn subkeys_stay_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut hive) = new_hive(dir.path());
    let root = hive.root();

    for name in ["zeta", "Alpha", "mike", "BRAVO", "echo"] {
        hive.ensure_key_path(root, &[name], &cancel()).unwrap();
    }

    let names = hive.subkey_names(root).unwrap();
    assert_eq!(names, vec!["Alpha", "BRAVO", "echo", "mike", "zeta"]);
    hive.verify_consistency().unwrap();
}

#[test]
fn delete_root_is_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    let (path, mut hive) = new_hive(dir.path());
    hive.commit(CommitMode::Auto, &cancel()).unwrap();
    let before = std::fs::read(&path).unwrap();

    let root = hive.root();
    assert!(matches!(
        hive.delete_key(root, true, &cancel()),
        Err(EngineError::CannotDeleteRoot)
    ));

    drop(hive);
    let after = std::fs::read(&path).unwrap();
    assert_eq!(before, after);
}

#[test]
fn delete_key_with_subkeys_needs_recursive() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut hive) = new_hive(dir.path());
    let root = hive.root();

    let (parent, _) = hive.ensure_key_path(root, &["A"], &cancel()).unwrap();
    hive.ensure_key_path(parent, &["B", "C"], &cancel()).unwrap();

    assert!(matches!(
        hive.delete_key(parent, false, &cancel()),
        Err(EngineError::KeyHasSubkeys { count: 1 })
    ));

    hive.delete_key(parent, true, &cancel()).unwrap();
    assert!(hive.key_ref(&["A"]).is_err());
    hive.verify_consistency().unwrap();
}

#[test]
fn recursive_delete_reclaims_space_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inplace.hive");
    let mut hive = Hive::create(&path).unwrap();
    hive.set_strategy(WriteStrategy::InPlace);
    let root = hive.root();

    let (parent, _) = hive.ensure_key_path(root, &["Bulk"], &cancel()).unwrap();
    for i in 0..20 {
        let name = format!("child{i:02}");
        let (child, _) = hive.ensure_key_path(parent, &[&name], &cancel()).unwrap();
        hive.upsert_value(child, "payload", ValueType::Binary, &[0xAB; 600], &cancel())
            .unwrap();
    }
    let grown = hive.file_len();

    hive.delete_key(parent, true, &cancel()).unwrap();
    hive.verify_consistency().unwrap();

    // Rebuilding an equivalent subtree reuses the freed cells instead of
    // growing the file again.
    let (parent, _) = hive.ensure_key_path(root, &["Bulk"], &cancel()).unwrap();
    for i in 0..20 {
        let name = format!("child{i:02}");
        let (child, _) = hive.ensure_key_path(parent, &[&name], &cancel()).unwrap();
        hive.upsert_value(child, "payload", ValueType::Binary, &[0xCD; 600], &cancel())
            .unwrap();
    }
    assert!(hive.file_len() <= grown);
    hive.verify_consistency().unwrap();
}

// --- value editing -------------------------------------------------------

#[test]
fn value_shapes_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (path, mut hive) = new_hive(dir.path());
    let root = hive.root();
    let (key, _) = hive.ensure_key_path(root, &["Shapes"], &cancel()).unwrap();

    // Inline (<= 4 bytes), external cell, and an empty default value.
    hive.upsert_value(key, "Dword", ValueType::Dword, &7u32.to_le_bytes(), &cancel())
        .unwrap();
    hive.upsert_value(key, "Blob", ValueType::Binary, &[0x5A; 600], &cancel())
        .unwrap();
    hive.upsert_value(key, "", ValueType::String, &utf16z("hello"), &cancel())
        .unwrap();

    hive.commit(CommitMode::Auto, &cancel()).unwrap();
    drop(hive);

    let hive = Hive::open(&path).unwrap();
    let key = hive.key_ref(&["Shapes"]).unwrap();

    assert_eq!(
        hive.value_data(key, "dword").unwrap(),
        ValueData::Dword(7)
    );
    let (ty, blob) = hive.value_bytes(key, "BLOB").unwrap();
    assert_eq!(ty, ValueType::Binary);
    assert_eq!(blob, vec![0x5A; 600]);
    assert_eq!(
        hive.value_data(key, "").unwrap(),
        ValueData::String("hello".to_string())
    );
    assert_eq!(hive.key_node(key).unwrap().value_count, 3);
    hive.verify_consistency().unwrap();
}

#[test]
fn big_value_uses_db_fanout() {
    let dir = tempfile::tempdir().unwrap();
    let (path, mut hive) = new_hive(dir.path());
    let root = hive.root();

    let (key, _) = hive.ensure_key_path(root, &["A", "B"], &cancel()).unwrap();
    let data: Vec<u8> = (0..30_720u32).map(|i| (i % 256) as u8).collect();
    hive.upsert_value(key, "X", ValueType::Binary, &data, &cancel())
        .unwrap();
    hive.commit(CommitMode::Auto, &cancel()).unwrap();
    drop(hive);

    let hive = Hive::open(&path).unwrap();
    let key = hive.key_ref(&["A", "B"]).unwrap();
    let (_, read_back) = hive.value_bytes(key, "X").unwrap();
    assert_eq!(read_back, data);

    // The on-disk shape is a db header fanning out over two chunks.
    let vk_ref = hive.value_ref(key, "X").unwrap();
    let vk = ValueKey::parse(hive.raw_cell_payload(vk_ref).unwrap(), vk_ref).unwrap();
    assert!(!vk.is_inline_data());
    assert_eq!(vk.data_length, 30_720);

    let db = BigDataBlock::parse(hive.raw_cell_payload(vk.data_offset).unwrap(), vk.data_offset)
        .unwrap();
    assert_eq!(db.segment_count, 2);
    hive.verify_consistency().unwrap();
}

#[test]
fn upsert_identical_value_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let (path, mut hive) = new_hive(dir.path());
    let root = hive.root();
    let (key, _) = hive.ensure_key_path(root, &["K"], &cancel()).unwrap();

    hive.upsert_value(key, "V", ValueType::Binary, &[1, 2, 3, 4, 5, 6], &cancel())
        .unwrap();
    hive.commit(CommitMode::Auto, &cancel()).unwrap();
    drop(hive);
    let before = std::fs::read(&path).unwrap();

    let mut hive = Hive::open(&path).unwrap();
    let key = hive.key_ref(&["K"]).unwrap();
    hive.upsert_value(key, "v", ValueType::Binary, &[1, 2, 3, 4, 5, 6], &cancel())
        .unwrap();
    assert!(hive.is_clean());
    hive.commit(CommitMode::Auto, &cancel()).unwrap();
    drop(hive);

    let after = std::fs::read(&path).unwrap();
    assert_eq!(before, after);
}

#[test]
fn upsert_replaces_data_and_type() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut hive) = new_hive(dir.path());
    let root = hive.root();
    let (key, _) = hive.ensure_key_path(root, &["K"], &cancel()).unwrap();

    hive.upsert_value(key, "V", ValueType::Binary, &[9; 200], &cancel())
        .unwrap();
    hive.upsert_value(key, "V", ValueType::Binary, &[7; 180], &cancel())
        .unwrap();

    let (_, data) = hive.value_bytes(key, "V").unwrap();
    assert_eq!(data, vec![7; 180]);
    assert_eq!(hive.key_node(key).unwrap().value_count, 1);

    // Shrinking to a dword flips to inline storage.
    hive.upsert_value(key, "V", ValueType::Dword, &3u32.to_le_bytes(), &cancel())
        .unwrap();
    assert_eq!(hive.value_data(key, "V").unwrap(), ValueData::Dword(3));
    hive.verify_consistency().unwrap();
}

#[test]
fn delete_value_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (path, mut hive) = new_hive(dir.path());
    let root = hive.root();
    let (key, _) = hive.ensure_key_path(root, &["K"], &cancel()).unwrap();

    hive.upsert_value(key, "A", ValueType::Dword, &1u32.to_le_bytes(), &cancel())
        .unwrap();
    hive.upsert_value(key, "B", ValueType::Dword, &2u32.to_le_bytes(), &cancel())
        .unwrap();

    hive.delete_value(key, "A", &cancel()).unwrap();
    assert!(matches!(
        hive.value_bytes(key, "A"),
        Err(EngineError::ValueNotFound(_))
    ));
    assert_eq!(hive.key_node(key).unwrap().value_count, 1);

    // Absent names succeed without touching anything.
    hive.commit(CommitMode::Auto, &cancel()).unwrap();
    let before = std::fs::read(&path).unwrap();
    hive.delete_value(key, "A", &cancel()).unwrap();
    hive.delete_value(key, "never-existed", &cancel()).unwrap();
    assert!(hive.is_clean());
    drop(hive);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn oversized_value_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut hive) = new_hive(dir.path());
    let root = hive.root();

    // The zeroed pages stay virtual; the length check fires before any
    // byte of this buffer is read.
    let data = vec![0u8; reg_engine::MAX_VALUE_DATA + 1];
    assert!(matches!(
        hive.upsert_value(root, "big", ValueType::Binary, &data, &cancel()),
        Err(EngineError::DataTooLarge { .. })
    ));
    assert!(hive.is_clean());
}

// --- unicode names -------------------------------------------------------

#[test]
fn unicode_names_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let (path, mut hive) = new_hive(dir.path());
    let root = hive.root();

    let (key, _) = hive.ensure_key_path(root, &["Grüße"], &cancel()).unwrap();
    hive.upsert_value(key, "Größe", ValueType::Dword, &5u32.to_le_bytes(), &cancel())
        .unwrap();
    hive.commit(CommitMode::Auto, &cancel()).unwrap();
    drop(hive);

    let hive = Hive::open(&path).unwrap();
    let key = hive.key_ref(&["GRÜSSE"]).unwrap_or_else(|_| {
        // Simple lowercase does not fold ß/SS; match by simple-lowercase
        // equality instead.
        hive.key_ref(&["grüße"]).unwrap()
    });
    assert_eq!(hive.key_node(key).unwrap().name, "Grüße");
    assert_eq!(hive.value_data(key, "größe").unwrap(), ValueData::Dword(5));
}

// --- durability ----------------------------------------------------------

#[test]
fn roundtrip_without_mutation_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let (path, mut hive) = new_hive(dir.path());
    let root = hive.root();
    hive.ensure_key_path(root, &["A"], &cancel()).unwrap();
    hive.commit(CommitMode::Auto, &cancel()).unwrap();
    drop(hive);

    let before = std::fs::read(&path).unwrap();
    let hive = Hive::open(&path).unwrap();
    hive.close();
    let after = std::fs::read(&path).unwrap();
    assert_eq!(before, after);
}

#[test]
fn sequence_numbers_mark_commits() {
    let dir = tempfile::tempdir().unwrap();
    let (path, mut hive) = new_hive(dir.path());
    let root = hive.root();

    assert!(hive.is_clean());
    hive.ensure_key_path(root, &["Dirty"], &cancel()).unwrap();
    let (primary, secondary) = hive.sequence_numbers();
    assert_ne!(primary, secondary);

    hive.commit(CommitMode::Full, &cancel()).unwrap();
    let (primary, secondary) = hive.sequence_numbers();
    assert_eq!(primary, secondary);
    drop(hive);

    let hive = Hive::open(&path).unwrap();
    assert!(hive.base_block().is_consistent());
}

#[test]
fn commit_modes_all_flush() {
    let dir = tempfile::tempdir().unwrap();
    let (path, mut hive) = new_hive(dir.path());
    let root = hive.root();

    for (i, mode) in [CommitMode::Auto, CommitMode::DataOnly, CommitMode::Full]
        .into_iter()
        .enumerate()
    {
        let name = format!("key{i}");
        hive.ensure_key_path(root, &[&name], &cancel()).unwrap();
        hive.commit(mode, &cancel()).unwrap();
    }
    drop(hive);

    let hive = Hive::open(&path).unwrap();
    assert_eq!(hive.subkey_names(hive.root()).unwrap().len(), 3);
}

#[test]
fn cancelled_mutations_return_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut hive) = new_hive(dir.path());
    let root = hive.root();

    let token = CancelToken::new();
    token.cancel();

    assert!(matches!(
        hive.ensure_key_path(root, &["x"], &token),
        Err(EngineError::Cancelled)
    ));
    assert!(matches!(
        hive.upsert_value(root, "v", ValueType::Dword, &[0; 4], &token),
        Err(EngineError::Cancelled)
    ));
    assert!(matches!(
        hive.commit(CommitMode::Auto, &token),
        Err(EngineError::Cancelled)
    ));
}

// --- strategies ----------------------------------------------------------

#[test]
fn append_strategy_grows_monotonically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("append.hive");
    let mut hive = Hive::create(&path).unwrap();
    hive.set_strategy(WriteStrategy::AppendOnly);
    let root = hive.root();

    let mut last_len = hive.file_len();
    for i in 0..10 {
        let name = format!("key{i}");
        let (key, _) = hive.ensure_key_path(root, &[&name], &cancel()).unwrap();
        hive.upsert_value(key, "data", ValueType::Binary, &[i as u8; 2000], &cancel())
            .unwrap();
        assert!(hive.file_len() >= last_len);
        last_len = hive.file_len();

        hive.delete_value(key, "data", &cancel()).unwrap();
        assert!(hive.file_len() >= last_len);
        last_len = hive.file_len();
    }

    let victim = hive.key_ref(&["key3"]).unwrap();
    hive.delete_key(victim, true, &cancel()).unwrap();
    assert!(hive.file_len() >= last_len);

    assert!(hive.key_ref(&["key3"]).is_err());
    hive.commit(CommitMode::Auto, &cancel()).unwrap();
    drop(hive);

    // Orphaned cells notwithstanding, the result reopens and validates.
    let hive = Hive::open(&path).unwrap();
    assert_eq!(hive.subkey_names(hive.root()).unwrap().len(), 9);
}

#[test]
fn hybrid_rewrites_small_values_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut hive) = new_hive(dir.path());
    let root = hive.root();
    let (key, _) = hive.ensure_key_path(root, &["K"], &cancel()).unwrap();

    hive.upsert_value(key, "V", ValueType::Binary, &[1; 512], &cancel())
        .unwrap();
    let vk_before = hive.value_ref(key, "V").unwrap();
    let data_before =
        ValueKey::parse(hive.raw_cell_payload(vk_before).unwrap(), vk_before)
            .unwrap()
            .data_offset;

    // Same-size replacement reuses both the data cell and the VK.
    hive.upsert_value(key, "V", ValueType::Binary, &[2; 512], &cancel())
        .unwrap();
    let vk_after = hive.value_ref(key, "V").unwrap();
    let data_after = ValueKey::parse(hive.raw_cell_payload(vk_after).unwrap(), vk_after)
        .unwrap()
        .data_offset;

    assert_eq!(vk_before, vk_after);
    assert_eq!(data_before, data_after);
    let (_, data) = hive.value_bytes(key, "V").unwrap();
    assert_eq!(data, vec![2; 512]);
    hive.verify_consistency().unwrap();
}

// --- deferred builder ----------------------------------------------------

#[test]
fn deferred_bulk_build_and_fanout() {
    let dir = tempfile::tempdir().unwrap();
    let (path, mut hive) = new_hive(dir.path());
    let root = hive.root();
    let (parent, _) = hive.ensure_key_path(root, &["Bulk"], &cancel()).unwrap();

    hive.enable_deferred_subkeys();
    for i in 0..1100 {
        let name = format!("entry{i:04}");
        hive.ensure_key_path(parent, &[&name], &cancel()).unwrap();
    }

    // Disabling with pending parents is fail-closed.
    assert!(matches!(
        hive.disable_deferred_subkeys(),
        Err(EngineError::DeferredPending { .. })
    ));

    hive.flush_deferred_subkeys(&cancel()).unwrap();
    hive.disable_deferred_subkeys().unwrap();

    let nk = hive.key_node(parent).unwrap();
    assert_eq!(nk.subkey_count, 1100);

    // 1100 children exceed one bucket: the list is an index root.
    let list = hive.raw_cell_payload(nk.subkey_list_offset).unwrap();
    assert_eq!(&list[0..2], b"ri");

    let names = hive.subkey_names(parent).unwrap();
    assert_eq!(names.len(), 1100);
    assert!(names.windows(2).all(|w| w[0] < w[1]));

    hive.verify_consistency().unwrap();
    hive.commit(CommitMode::Auto, &cancel()).unwrap();
    drop(hive);

    let hive = Hive::open(&path).unwrap();
    let parent = hive.key_ref(&["Bulk"]).unwrap();
    assert_eq!(hive.key_node(parent).unwrap().subkey_count, 1100);
    assert!(hive.key_ref(&["Bulk", "ENTRY0550"]).is_ok());
    hive.verify_consistency().unwrap();
}

#[test]
fn delete_flushes_deferred_parents_first() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut hive) = new_hive(dir.path());
    let root = hive.root();
    let (parent, _) = hive.ensure_key_path(root, &["P"], &cancel()).unwrap();

    hive.enable_deferred_subkeys();
    let (child, _) = hive.ensure_key_path(parent, &["C"], &cancel()).unwrap();

    // The delete sees the pending child via the implicit flush.
    hive.delete_key(child, false, &cancel()).unwrap();
    hive.disable_deferred_subkeys().unwrap();

    assert_eq!(hive.key_node(parent).unwrap().subkey_count, 0);
    hive.verify_consistency().unwrap();
}

// --- walking -------------------------------------------------------------

#[test]
fn walk_visits_depth_first_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut hive) = new_hive(dir.path());
    let root = hive.root();

    hive.ensure_key_path(root, &["a", "a1"], &cancel()).unwrap();
    hive.ensure_key_path(root, &["b"], &cancel()).unwrap();

    let mut seen = Vec::new();
    hive.walk(&cancel(), |_, nk| {
        seen.push(nk.name.clone());
        WalkControl::Continue
    })
    .unwrap();
    assert_eq!(seen, vec!["ROOT", "a", "a1", "b"]);

    let mut count = 0;
    hive.walk(&cancel(), |_, _| {
        count += 1;
        if count == 2 {
            WalkControl::Stop
        } else {
            WalkControl::Continue
        }
    })
    .unwrap();
    assert_eq!(count, 2);

    let token = CancelToken::new();
    token.cancel();
    assert!(matches!(
        hive.walk(&token, |_, _| WalkControl::Continue),
        Err(EngineError::Cancelled)
    ));
}

// --- helpers -------------------------------------------------------------

fn utf16z(s: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    for unit in s.encode_utf16().chain(std::iter::once(0)) {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}
