use core::fmt;
use std::sync::{Arc, Mutex};

use log::info;

use crate::{
    error::{ErrorKind, TreeError},
    storage::{page_id::PageId, segment::Segment},
    types::{ConcurrentHashMap, TreeResult},
};

use super::{
    node::NodeLayout,
    tuple::{KeyDescriptor, TupleScheme},
};

/// Identifies a tree within its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageOwnerId(pub u64);

impl fmt::Display for PageOwnerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "owner_{}", self.0)
    }
}

/// Binds a logical tree to its storage: the segment holding its pages, the
/// row and key shape, and the root as of when the descriptor was read. The
/// root page id is a snapshot; the owner map is authoritative.
#[derive(Clone, Debug)]
pub struct BTreeDescriptor {
    pub segment: Arc<Segment>,
    pub scheme: TupleScheme,
    pub key: KeyDescriptor,
    pub owner_id: PageOwnerId,
    pub root_page_id: PageId,

    /// Serializes structural mutation of this tree. Readers never touch it;
    /// they rely on page latches and sibling chasing alone.
    pub write_latch: Arc<Mutex<()>>,
}

impl BTreeDescriptor {
    pub fn layout(&self) -> NodeLayout {
        NodeLayout::new(
            self.segment.page_size(),
            self.scheme,
            self.key.clone(),
        )
    }
}

/// Resolves a page owner to the current root of its tree. Roots relocate
/// when the root page splits, so clients re-read this map on open instead
/// of caching root page ids across operations.
pub struct OwnerRootMap {
    roots: ConcurrentHashMap<PageOwnerId, PageId>,
}

impl OwnerRootMap {
    pub fn new() -> Self {
        Self {
            roots: ConcurrentHashMap::new(),
        }
    }

    pub fn get_root(&self, owner: PageOwnerId) -> TreeResult<PageId> {
        self.roots.get(&owner).ok_or_else(|| {
            TreeError::new(ErrorKind::UnknownTree, &format!("{} has no root", owner))
        })
    }

    pub fn set_root(&self, owner: PageOwnerId, root: PageId) {
        self.roots.insert(owner, root);
    }

    /// Root relocation on split. The critical section is the map's own
    /// write lock; readers holding the old root still see a valid subtree
    /// and reach relocated entries through sibling links. Returns false
    /// when another writer relocated the root first.
    pub fn try_relocate_root(&self, owner: PageOwnerId, old: PageId, new: PageId) -> bool {
        let relocated = self.roots.compare_and_set(&owner, &old, new);
        if relocated {
            info!("{} root relocated, {} -> {}", owner, old, new);
        }
        relocated
    }

    pub fn remove(&self, owner: PageOwnerId) {
        self.roots.remove(&owner);
    }
}

impl Default for OwnerRootMap {
    fn default() -> Self {
        Self::new()
    }
}
