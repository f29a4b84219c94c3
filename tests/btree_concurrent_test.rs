use std::sync::atomic::{AtomicI64, Ordering};

use arbor_db::{
    BTreeReader, Cell, DupPolicy, DupSeek, ScratchAccessor, BTreeWriter, Transaction, Tuple,
};

mod common;
use common::*;

#[test]
// readers chasing right siblings never miss a key that a concurrent writer
// already published, and never error
fn readers_survive_concurrent_splits() {
    setup();
    let (db, descriptor) = new_int_tree("concurrent_read", SMALL_PAGE_SIZE);

    const ROWS: i64 = 400;
    let progress = AtomicI64::new(-1);

    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            let tx = Transaction::new();
            let scratch = ScratchAccessor::new(db.page_size(), 4);
            let mut writer = BTreeWriter::new(&db, &descriptor, &tx, scratch, false);
            for k in 0..ROWS {
                let row = Tuple::new(vec![Cell(k), Cell(k * 10)]);
                writer.insert(&tx, &row, DupPolicy::Allow).unwrap();
                progress.store(k, Ordering::Release);
            }
            tx.commit();
        });

        for _ in 0..2 {
            s.spawn(|_| {
                let tx = Transaction::new();
                let mut reader = BTreeReader::new(&db, &descriptor, &tx);
                loop {
                    let published = progress.load(Ordering::Acquire);
                    if published >= 5 {
                        // key 5 is in; a split may force a right-chase, but
                        // the search must always come back with it
                        let found = reader
                            .search_for_key(&[Cell(5)], DupSeek::Begin, true)
                            .unwrap();
                        assert!(found);
                        let tuple = reader.current_tuple().unwrap();
                        assert_eq!(tuple.get_cell(0), Cell(5));
                        reader.end_search().unwrap();
                    }
                    if published >= ROWS - 1 {
                        break;
                    }
                }
            });
        }
    })
    .unwrap();

    // the sibling chain visits every key exactly once, in order
    let read_tx = Transaction::new();
    assert_eq!(
        collect_keys(&db, &descriptor, &read_tx),
        (0..ROWS).collect::<Vec<i64>>()
    );
}

#[test]
// two writers on the same tree; root relocation is decided by exactly one
fn concurrent_writers_interleave() {
    setup();
    let (db, descriptor) = new_int_tree("concurrent_write", 128);

    crossbeam::thread::scope(|s| {
        for w in 0..2i64 {
            let db = &db;
            let descriptor = &descriptor;
            s.spawn(move |_| {
                let tx = Transaction::new();
                let scratch = ScratchAccessor::new(db.page_size(), 4);
                let mut writer = BTreeWriter::new(&db, &descriptor, &tx, scratch, false);
                // disjoint key ranges per writer
                for k in 0..200 {
                    let key = w * 1000 + k;
                    let row = Tuple::new(vec![Cell(key), Cell(key)]);
                    writer.insert(&tx, &row, DupPolicy::Allow).unwrap();
                }
                tx.commit();
            });
        }
    })
    .unwrap();

    let read_tx = Transaction::new();
    let keys = collect_keys(&db, &descriptor, &read_tx);
    let mut expected: Vec<i64> = (0..200).collect();
    expected.extend(1000..1200);
    assert_eq!(keys, expected);
}

#[test]
fn concurrent_readers_share_the_pool() {
    setup();
    let (db, descriptor) = new_int_tree("concurrent_pool", 256);
    let tx = Transaction::new();
    insert_keys(&db, &descriptor, &tx, &(0..300).collect::<Vec<i64>>());
    tx.commit();

    crossbeam::thread::scope(|s| {
        for r in 0..4i64 {
            let db = &db;
            let descriptor = &descriptor;
            s.spawn(move |_| {
                let tx = Transaction::new();
                let descriptor = db.tree(descriptor.owner_id).unwrap();
                let mut reader = BTreeReader::new(&db, &descriptor, &tx);
                for k in (r * 7..300).step_by(11) {
                    assert!(reader
                        .search_for_key(&[Cell(k)], DupSeek::Begin, true)
                        .unwrap());
                    reader.end_search().unwrap();
                }
                assert_eq!(reader.quota_accessor().n_pages_locked(), 0);
            });
        }
    })
    .unwrap();
}
