use arbor_db::{
    BTreeReader, BTreeWriter, Cell, ScratchAccessor, Transaction, Tuple,
};

mod common;
use common::*;

#[test]
// monotonic bulk append: no re-descents, finished leaves packed full
fn bulk_append_monotonic() {
    setup();
    let (db, descriptor) = new_int_tree("bulk_append", SMALL_PAGE_SIZE);

    let tx = Transaction::new();
    let scratch = ScratchAccessor::new(db.page_size(), 4);
    let mut writer = BTreeWriter::new(&db, &descriptor, &tx, scratch, true);

    for k in 1..=1000 {
        let row = Tuple::new(vec![Cell(k), Cell(k)]);
        writer.append_monotonic(&tx, &row).unwrap();
    }
    writer.end_search().unwrap();
    tx.commit();
    assert_eq!(writer.quota_accessor().n_pages_locked(), 0);
    drop(writer);

    let read_tx = Transaction::new();
    let descriptor = db.tree(descriptor.owner_id).unwrap();
    let mut reader = BTreeReader::new(&db, &descriptor, &read_tx);

    assert!(reader.search_last().unwrap());
    assert_eq!(reader.current_tuple().unwrap().get_cell(0), Cell(1000));
    reader.end_search().unwrap();

    // every leaf except possibly the last is at least half full
    let occupancy = reader.leaf_occupancy().unwrap();
    assert_eq!(occupancy.iter().sum::<usize>(), 1000);
    // leaf capacity is 3 at this page size
    let half = 2;
    for (i, n) in occupancy.iter().enumerate() {
        if i + 1 < occupancy.len() {
            assert!(*n >= half, "leaf {} holds only {} rows", i, n);
        }
    }

    let keys = collect_keys(&db, &descriptor, &read_tx);
    assert_eq!(keys, (1..=1000).collect::<Vec<i64>>());
}

#[test]
// appends go through the held rightmost leaf even after a cold start on a
// non-empty tree
fn bulk_append_resumes_on_existing_tree() {
    setup();
    let (db, descriptor) = new_int_tree("bulk_resume", SMALL_PAGE_SIZE);

    let tx = Transaction::new();
    insert_keys(&db, &descriptor, &tx, &[1, 2, 3, 4, 5]);
    tx.commit();

    let tx2 = Transaction::new();
    let scratch = ScratchAccessor::new(db.page_size(), 4);
    let mut writer = BTreeWriter::new(&db, &descriptor, &tx2, scratch, true);
    for k in 6..=50 {
        let row = Tuple::new(vec![Cell(k), Cell(k)]);
        writer.append_monotonic(&tx2, &row).unwrap();
    }
    writer.end_search().unwrap();
    tx2.commit();
    drop(writer);

    let read_tx = Transaction::new();
    assert_eq!(
        collect_keys(&db, &descriptor, &read_tx),
        (1..=50).collect::<Vec<i64>>()
    );
}

#[test]
#[should_panic(expected = "monotonic append out of order")]
fn bulk_append_rejects_regressing_keys() {
    setup();
    let (db, descriptor) = new_int_tree("bulk_misuse", SMALL_PAGE_SIZE);

    let tx = Transaction::new();
    let scratch = ScratchAccessor::new(db.page_size(), 4);
    let mut writer = BTreeWriter::new(&db, &descriptor, &tx, scratch, true);

    writer
        .append_monotonic(&tx, &Tuple::new(vec![Cell(10), Cell(10)]))
        .unwrap();
    writer
        .append_monotonic(&tx, &Tuple::new(vec![Cell(9), Cell(9)]))
        .unwrap();
}
