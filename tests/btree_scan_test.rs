use arbor_db::{BTreeScan, Cell, DupSeek, ErrorKind, Transaction};

mod common;
use common::*;

#[test]
// the stream-facing cursor: open resolves the root through the owner map,
// so a scan opened after splits sees the relocated root
fn scan_open_close() {
    setup();
    let (db, descriptor) = new_int_tree("scan", SMALL_PAGE_SIZE);
    let tx = Transaction::new();
    insert_keys(&db, &descriptor, &tx, &(1..=20).collect::<Vec<i64>>());
    tx.commit();

    let read_tx = Transaction::new();
    let mut scan = BTreeScan::new(&db, descriptor.clone());
    scan.open(&read_tx, false).unwrap();

    assert!(scan.search_first().unwrap());
    let mut count = 1;
    while scan.search_next().unwrap() {
        count += 1;
    }
    assert_eq!(count, 20);
    assert!(scan.is_singular());

    // restart keeps the reader but drops the position
    scan.open(&read_tx, true).unwrap();
    assert!(scan.is_singular());
    assert!(scan.search_for_key(&[Cell(13)], DupSeek::Begin, true).unwrap());
    assert_eq!(scan.current_tuple().unwrap().get_cell(0), Cell(13));
    scan.end_search().unwrap();

    scan.close().unwrap();
}

#[test]
fn scan_survives_root_relocation() {
    setup();
    let (db, descriptor) = new_int_tree("scan_reloc", SMALL_PAGE_SIZE);

    // descriptor still carries the pre-split root; open() must re-resolve
    let tx = Transaction::new();
    insert_keys(&db, &descriptor, &tx, &(1..=50).collect::<Vec<i64>>());
    tx.commit();

    let read_tx = Transaction::new();
    let mut scan = BTreeScan::new(&db, descriptor);
    scan.open(&read_tx, false).unwrap();
    assert!(scan.search_last().unwrap());
    assert_eq!(scan.current_tuple().unwrap().get_cell(0), Cell(50));
    scan.close().unwrap();
}

#[test]
fn unknown_owner_is_a_typed_error() {
    setup();
    let (db, _descriptor) = new_int_tree("scan_unknown", SMALL_PAGE_SIZE);

    let err = db.tree(arbor_db::PageOwnerId(4242)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownTree);
}

#[test]
fn abort_signal_surfaces_on_page_access() {
    setup();
    let (db, descriptor) = new_int_tree("abort", SMALL_PAGE_SIZE);
    let tx = Transaction::new();
    insert_keys(&db, &descriptor, &tx, &[1, 2, 3]);
    tx.commit();

    let read_tx = Transaction::new();
    let descriptor = db.tree(descriptor.owner_id).unwrap();
    let mut reader = arbor_db::BTreeReader::new(&db, &descriptor, &read_tx);

    read_tx.abort();
    let err = reader.search_first().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Aborted);
    // scope guards released everything
    assert_eq!(reader.quota_accessor().n_pages_locked(), 0);
}
