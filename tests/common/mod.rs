use std::sync::Arc;

use arbor_db::{
    utils, BTreeDescriptor, BTreeReader, BTreeWriter, Cell, Database, DupPolicy, KeyDescriptor,
    ScratchAccessor, Transaction, Tuple, TupleScheme,
};

/// Page size that fits 3 two-field rows per leaf; splits come early.
pub const SMALL_PAGE_SIZE: usize = 64;

pub fn setup() {
    utils::init_log();
}

fn test_path(name: &str) -> String {
    format!(
        "{}/arbor-{}-{}.db",
        std::env::temp_dir().display(),
        name,
        std::process::id()
    )
}

/// Fresh database with one empty tree keyed on the first of two int fields.
pub fn new_int_tree(name: &str, page_size: usize) -> (Arc<Database>, BTreeDescriptor) {
    new_tree(name, page_size, 2, vec![0])
}

pub fn new_tree(
    name: &str,
    page_size: usize,
    columns: usize,
    key_projection: Vec<usize>,
) -> (Arc<Database>, BTreeDescriptor) {
    let db = Arc::new(Database::new(page_size));
    let path = test_path(name);
    let _ = std::fs::remove_file(&path);
    let segment = db.open_segment(&path).unwrap();
    let descriptor = db
        .create_tree(
            &segment,
            TupleScheme::new(columns),
            KeyDescriptor::new(key_projection),
        )
        .unwrap();
    (db, descriptor)
}

pub fn new_writer(
    db: &Arc<Database>,
    descriptor: &BTreeDescriptor,
    tx: &Transaction,
) -> BTreeWriter {
    let scratch = ScratchAccessor::new(db.page_size(), 4);
    BTreeWriter::new(db, descriptor, tx, scratch, false)
}

pub fn insert_keys(
    db: &Arc<Database>,
    descriptor: &BTreeDescriptor,
    tx: &Transaction,
    keys: &[i64],
) {
    let mut writer = new_writer(db, descriptor, tx);
    for &k in keys {
        let tuple = Tuple::new(vec![Cell(k), Cell(k * 10)]);
        writer.insert(tx, &tuple, DupPolicy::Allow).unwrap();
    }
}

/// All keys in iteration order, via search_first / search_next.
pub fn collect_keys(
    db: &Arc<Database>,
    descriptor: &BTreeDescriptor,
    tx: &Transaction,
) -> Vec<i64> {
    let descriptor = db.tree(descriptor.owner_id).unwrap();
    let mut reader = BTreeReader::new(db, &descriptor, tx);
    let mut keys = Vec::new();
    let mut positioned = reader.search_first().unwrap();
    while positioned {
        keys.push(reader.current_tuple().unwrap().get_cell(0).value());
        positioned = reader.search_next().unwrap();
    }
    reader.end_search().unwrap();
    keys
}

pub fn fingerprint(db: &Arc<Database>, descriptor: &BTreeDescriptor, tx: &Transaction) -> String {
    let descriptor = db.tree(descriptor.owner_id).unwrap();
    let mut reader = BTreeReader::new(db, &descriptor, tx);
    utils::tree_fingerprint(&mut reader).unwrap()
}
