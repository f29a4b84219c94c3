use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub use crate::log::init_log;
use crate::{btree::reader::BTreeReader, types::TreeResult};

/// Digest of the full entry set, in key order. Two trees with the same
/// logical content produce the same digest regardless of page layout.
pub fn tree_fingerprint(reader: &mut BTreeReader) -> TreeResult<String> {
    let mut hasher = DefaultHasher::new();
    let mut positioned = reader.search_first()?;
    while positioned {
        let tuple = reader.current_tuple()?;
        for i in 0..tuple.n_cells() {
            tuple.get_cell(i).value().hash(&mut hasher);
        }
        positioned = reader.search_next()?;
    }
    reader.end_search()?;
    Ok(hex::encode(hasher.finish().to_be_bytes()))
}
