use arbor_db::{
    BTreeReader, Cell, DupPolicy, DupSeek, Transaction, Tuple,
};

mod common;
use common::*;

#[test]
// duplicates: BEGIN positions at the first occurrence, END right after the
// last, and both are observable by iteration
fn duplicate_seek_semantics() {
    setup();
    let (db, descriptor) = new_int_tree("dup_seek", SMALL_PAGE_SIZE);
    let tx = Transaction::new();

    let mut writer = new_writer(&db, &descriptor, &tx);
    for payload in 0..4 {
        let row = Tuple::new(vec![Cell(7), Cell(payload)]);
        writer.insert(&tx, &row, DupPolicy::Allow).unwrap();
    }
    writer.insert(&tx, &Tuple::new(vec![Cell(3), Cell(30)]), DupPolicy::Allow).unwrap();
    writer.insert(&tx, &Tuple::new(vec![Cell(9), Cell(90)]), DupPolicy::Allow).unwrap();
    tx.commit();

    let read_tx = Transaction::new();
    let descriptor = db.tree(descriptor.owner_id).unwrap();
    let mut reader = BTreeReader::new(&db, &descriptor, &read_tx);

    // BEGIN, then iterate across all four duplicates (they span leaves)
    assert!(reader.search_for_key(&[Cell(7)], DupSeek::Begin, true).unwrap());
    let mut seen = Vec::new();
    loop {
        let tuple = reader.current_tuple().unwrap();
        if tuple.get_cell(0) != Cell(7) {
            break;
        }
        seen.push(tuple.get_cell(1).value());
        if !reader.search_next().unwrap() {
            break;
        }
    }
    assert_eq!(seen, vec![0, 1, 2, 3]);
    reader.end_search().unwrap();

    // END positions immediately after the run of duplicates
    assert!(reader.search_for_key(&[Cell(7)], DupSeek::End, true).unwrap());
    assert!(!reader.is_singular());
    assert_eq!(reader.current_tuple().unwrap().get_cell(0), Cell(9));
    reader.end_search().unwrap();

    // END past the largest key leaves the cursor singular
    assert!(reader.search_for_key(&[Cell(9)], DupSeek::End, true).unwrap());
    assert!(reader.is_singular());
    reader.end_search().unwrap();
}

#[test]
// the greatest lower bound may live on the left of a leaf boundary even
// when the descent lands one leaf to the right of it, and vice versa
fn glb_across_leaf_boundary() {
    setup();
    let (db, descriptor) = new_int_tree("glb", SMALL_PAGE_SIZE);
    let tx = Transaction::new();
    insert_keys(&db, &descriptor, &tx, &[1, 2, 3, 5, 8, 9, 12, 15]);
    tx.commit();

    let read_tx = Transaction::new();
    let descriptor = db.tree(descriptor.owner_id).unwrap();
    let mut reader = BTreeReader::new(&db, &descriptor, &read_tx);

    for (search, expected) in [(6, 5), (7, 5), (10, 9), (11, 9), (14, 12), (99, 15), (8, 8)] {
        let found = reader
            .search_for_key(&[Cell(search)], DupSeek::Any, false)
            .unwrap();
        assert_eq!(found, expected == search, "search {}", search);
        assert_eq!(
            reader.current_tuple().unwrap().get_cell(0),
            Cell(expected),
            "glb of {}",
            search
        );
        reader.end_search().unwrap();
    }
}

#[test]
fn partial_key_search() {
    setup();
    // two-field key over two columns
    let (db, descriptor) = new_tree("partial_key", 128, 2, vec![0, 1]);
    let tx = Transaction::new();

    let mut writer = new_writer(&db, &descriptor, &tx);
    for a in 1..=5 {
        for b in 1..=4 {
            let row = Tuple::new(vec![Cell(a), Cell(b)]);
            writer.insert(&tx, &row, DupPolicy::Allow).unwrap();
        }
    }
    tx.commit();

    let read_tx = Transaction::new();
    let descriptor = db.tree(descriptor.owner_id).unwrap();
    let mut reader = BTreeReader::new(&db, &descriptor, &read_tx);

    // prefix search positions at the first row of the group
    assert!(reader.search_for_key(&[Cell(3)], DupSeek::Begin, true).unwrap());
    assert_eq!(reader.current_tuple().unwrap().cells(), &[Cell(3), Cell(1)]);

    // the whole group comes out in order
    let mut group = Vec::new();
    loop {
        let tuple = reader.current_tuple().unwrap();
        if tuple.get_cell(0) != Cell(3) {
            break;
        }
        group.push(tuple.get_cell(1).value());
        if !reader.search_next().unwrap() {
            break;
        }
    }
    assert_eq!(group, vec![1, 2, 3, 4]);
    reader.end_search().unwrap();

    // full-key search is exact
    assert!(reader
        .search_for_key(&[Cell(4), Cell(2)], DupSeek::Any, true)
        .unwrap());
    assert_eq!(reader.current_tuple().unwrap().cells(), &[Cell(4), Cell(2)]);
    reader.end_search().unwrap();

    // absent prefix
    assert!(!reader.search_for_key(&[Cell(9)], DupSeek::Begin, true).unwrap());
    reader.end_search().unwrap();
}

#[test]
fn search_first_last_and_singular() {
    setup();
    let (db, descriptor) = new_int_tree("first_last", SMALL_PAGE_SIZE);
    let read_tx = Transaction::new();

    // empty tree: both ends are singular
    {
        let descriptor = db.tree(descriptor.owner_id).unwrap();
        let mut reader = BTreeReader::new(&db, &descriptor, &read_tx);
        assert!(!reader.search_first().unwrap());
        assert!(reader.is_singular());
        assert!(!reader.search_last().unwrap());
        assert!(reader.is_singular());
        // end_search on a singular cursor is harmless
        reader.end_search().unwrap();
    }

    let tx = Transaction::new();
    insert_keys(&db, &descriptor, &tx, &[20, 5, 15, 30, 25, 10]);
    tx.commit();

    let descriptor = db.tree(descriptor.owner_id).unwrap();
    let mut reader = BTreeReader::new(&db, &descriptor, &read_tx);

    assert!(reader.search_first().unwrap());
    assert_eq!(reader.current_tuple().unwrap().get_cell(0), Cell(5));

    assert!(reader.search_last().unwrap());
    assert_eq!(reader.current_tuple().unwrap().get_cell(0), Cell(30));

    // walking off the end turns the cursor singular; further steps stay put
    assert!(!reader.search_next().unwrap());
    assert!(reader.is_singular());
    assert!(!reader.search_next().unwrap());
    reader.end_search().unwrap();
}

#[test]
fn read_modes_confine_the_search() {
    use arbor_db::ReadMode;

    setup();
    let (db, descriptor) = new_int_tree("read_modes", SMALL_PAGE_SIZE);
    let tx = Transaction::new();
    // one split: leaves [1] and [2,3,5] under a height-1 root
    insert_keys(&db, &descriptor, &tx, &[1, 2, 3, 5]);
    tx.commit();

    let read_tx = Transaction::new();
    let descriptor = db.tree(descriptor.owner_id).unwrap();
    let mut reader = BTreeReader::new(&db, &descriptor, &read_tx);

    // a leaf-only GLB search may not switch to the sibling leaf even when
    // the true bound lives there; it reports the best entry on its leaf
    let found = reader
        .search_with_mode(&[Cell(2)], DupSeek::Any, false, ReadMode::ReadLeafOnly)
        .unwrap();
    assert!(!found);
    assert_eq!(reader.current_tuple().unwrap().get_cell(0), Cell(1));
    reader.end_search().unwrap();

    // the unconfined search follows the bound across the boundary
    let found = reader
        .search_with_mode(&[Cell(2)], DupSeek::Any, false, ReadMode::Normal)
        .unwrap();
    assert!(found);
    assert_eq!(reader.current_tuple().unwrap().get_cell(0), Cell(2));
    reader.end_search().unwrap();

    // a non-leaf search stops one level above the leaves, positioned on a
    // child pointer
    let found = reader
        .search_with_mode(&[Cell(5)], DupSeek::Any, true, ReadMode::ReadNonLeafOnly)
        .unwrap();
    assert!(!found);
    assert!(!reader.is_singular());
    assert!(!reader.current_child().unwrap().is_null());
    reader.end_search().unwrap();
}

#[test]
// one search with the wrong root mode fixes the mode for all that follow
fn root_lock_mode_converges() {
    use arbor_db::cache::accessor::{QuotaCacheAccessor, TransactionalCacheAccessor};
    use arbor_db::{CacheAccessor, LockMode};
    use std::sync::Arc;

    setup();
    let (db, descriptor) = new_int_tree("root_mode", SMALL_PAGE_SIZE);
    let tx = Transaction::new();
    insert_keys(&db, &descriptor, &tx, &[1, 2]);
    tx.commit();

    // a writer-style accessor over a single-leaf tree: the root needs
    // EXCLUSIVE but opens SHARED on the first search
    let read_tx = Transaction::new();
    let descriptor = db.tree(descriptor.owner_id).unwrap();
    let base: Arc<dyn CacheAccessor> = Arc::clone(db.buffer_pool()) as Arc<dyn CacheAccessor>;
    let transactional = Arc::new(TransactionalCacheAccessor::new(base, read_tx.id()));
    let quota = Arc::new(QuotaCacheAccessor::new(transactional, None, 4));
    let mut cursor = BTreeReader::with_accessor(
        &descriptor,
        &read_tx,
        quota,
        LockMode::Exclusive,
        false,
    );

    assert_eq!(cursor.root_lock_mode(), LockMode::Shared);
    assert!(cursor.search_for_key(&[Cell(2)], DupSeek::Any, true).unwrap());
    cursor.end_search().unwrap();
    assert_eq!(cursor.root_lock_mode(), LockMode::Exclusive);

    assert!(cursor.search_for_key(&[Cell(1)], DupSeek::Any, true).unwrap());
    cursor.end_search().unwrap();
    assert_eq!(cursor.root_lock_mode(), LockMode::Exclusive);
}
