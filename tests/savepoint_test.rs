use arbor_db::{
    BTreeWriter, Cell, DupPolicy, ErrorKind, ScratchAccessor, Transaction, Tuple,
};

mod common;
use common::*;

#[test]
// a batch that fails mid-way rolls back to exactly the pre-batch state
fn scratch_exhaustion_rolls_back_cleanly() {
    setup();
    // leaf capacity 7: room for the whole batch until the last row splits
    let (db, descriptor) = new_int_tree("savepoint_scratch", 128);

    let tx = Transaction::new();
    let _action = db.action_shared();

    insert_keys(&db, &descriptor, &tx, &[10, 20]);
    let before = fingerprint(&db, &descriptor, &tx);

    let scratch = ScratchAccessor::new(db.page_size(), 1);
    let mut writer = BTreeWriter::new(&db, &descriptor, &tx, scratch.clone(), false);

    let mut sp = tx.create_savepoint();

    // five rows fit in the leaf; the sixth forces a split, and the only
    // scratch frame is held elsewhere
    for k in 30..35 {
        let row = Tuple::new(vec![Cell(k), Cell(k)]);
        writer.insert(&tx, &row, DupPolicy::Allow).unwrap();
    }
    let _hostage = scratch.allocate().unwrap();
    let row = Tuple::new(vec![Cell(35), Cell(35)]);
    let err = writer.insert(&tx, &row, DupPolicy::Allow).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScratchMemExhausted);

    tx.rollback(&mut sp).unwrap();

    let after = fingerprint(&db, &descriptor, &tx);
    assert_eq!(before, after);

    let read_tx = Transaction::new();
    assert_eq!(collect_keys(&db, &descriptor, &read_tx), vec![10, 20]);
}

#[test]
fn rollback_inverts_inserts_deletes_and_updates() {
    setup();
    let (db, descriptor) = new_int_tree("savepoint_mixed", SMALL_PAGE_SIZE);

    let tx = Transaction::new();
    let _action = db.action_shared();

    insert_keys(&db, &descriptor, &tx, &(1..=10).collect::<Vec<i64>>());
    let before = fingerprint(&db, &descriptor, &tx);

    let mut sp = tx.create_savepoint();
    let mut writer = new_writer(&db, &descriptor, &tx);

    for k in 50..70 {
        let row = Tuple::new(vec![Cell(k), Cell(k)]);
        writer.insert(&tx, &row, DupPolicy::Allow).unwrap();
    }
    assert!(writer.delete(&tx, &[Cell(3)]).unwrap());
    assert!(writer.delete(&tx, &[Cell(7)]).unwrap());
    assert!(writer.update(&tx, &Tuple::new(vec![Cell(5), Cell(-5)])).unwrap());
    drop(writer);

    tx.rollback(&mut sp).unwrap();

    assert_eq!(fingerprint(&db, &descriptor, &tx), before);
    let read_tx = Transaction::new();
    assert_eq!(
        collect_keys(&db, &descriptor, &read_tx),
        (1..=10).collect::<Vec<i64>>()
    );
}

#[test]
// committing a savepoint keeps its records live for an outer rollback
fn nested_savepoints() {
    setup();
    let (db, descriptor) = new_int_tree("savepoint_nested", SMALL_PAGE_SIZE);

    let tx = Transaction::new();
    let _action = db.action_shared();

    insert_keys(&db, &descriptor, &tx, &[1, 2, 3]);
    let baseline = fingerprint(&db, &descriptor, &tx);

    let mut outer = tx.create_savepoint();
    let mut writer = new_writer(&db, &descriptor, &tx);
    writer
        .insert(&tx, &Tuple::new(vec![Cell(10), Cell(10)]), DupPolicy::Allow)
        .unwrap();

    let inner = tx.create_savepoint();
    writer
        .insert(&tx, &Tuple::new(vec![Cell(20), Cell(20)]), DupPolicy::Allow)
        .unwrap();
    tx.commit_savepoint(inner);
    drop(writer);

    // the inner batch was merged into the outer scope; rolling back the
    // outer savepoint undoes both
    tx.rollback(&mut outer).unwrap();
    assert_eq!(fingerprint(&db, &descriptor, &tx), baseline);
}

#[test]
fn rollback_is_repeatable() {
    setup();
    let (db, descriptor) = new_int_tree("savepoint_repeat", SMALL_PAGE_SIZE);

    let tx = Transaction::new();
    insert_keys(&db, &descriptor, &tx, &[5, 6]);
    let baseline = fingerprint(&db, &descriptor, &tx);

    let mut sp = tx.create_savepoint();
    let mut writer = new_writer(&db, &descriptor, &tx);
    writer
        .insert(&tx, &Tuple::new(vec![Cell(7), Cell(7)]), DupPolicy::Allow)
        .unwrap();
    tx.rollback(&mut sp).unwrap();
    assert_eq!(fingerprint(&db, &descriptor, &tx), baseline);

    // the savepoint survives a rollback and can be used again
    writer
        .insert(&tx, &Tuple::new(vec![Cell(8), Cell(8)]), DupPolicy::Allow)
        .unwrap();
    writer
        .insert(&tx, &Tuple::new(vec![Cell(9), Cell(9)]), DupPolicy::Allow)
        .unwrap();
    tx.rollback(&mut sp).unwrap();
    assert_eq!(fingerprint(&db, &descriptor, &tx), baseline);
}
