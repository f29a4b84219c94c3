use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use log::info;

use crate::{
    btree::{
        descriptor::{BTreeDescriptor, OwnerRootMap, PageOwnerId},
        node::NodeViewMut,
        tuple::{KeyDescriptor, TupleScheme},
    },
    storage::{
        buffer_pool::BufferPool,
        latch::LockMode,
        page_id::SegmentId,
        segment::Segment,
    },
    transaction::{AbortSignal, TXN_ID_NONE},
    types::{ConcurrentHashMap, TreeResult},
};

use crate::cache::accessor::CacheAccessor;

/// Process-wide services, constructed explicitly and passed by reference.
/// Holds the buffer pool, the owner-to-root map, the tree registry used by
/// rollback, and the action latch that coordinates write batches with
/// checkpointing.
pub struct Database {
    page_size: usize,
    buffer_pool: Arc<BufferPool>,
    root_map: Arc<OwnerRootMap>,
    trees: ConcurrentHashMap<PageOwnerId, BTreeDescriptor>,

    // writers take this shared for the duration of a batch; a checkpointer
    // takes it exclusive
    action_latch: RwLock<()>,

    next_owner: AtomicU64,
    next_segment: AtomicU32,
}

impl Database {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            buffer_pool: Arc::new(BufferPool::new(page_size)),
            root_map: Arc::new(OwnerRootMap::new()),
            trees: ConcurrentHashMap::new(),
            action_latch: RwLock::new(()),
            next_owner: AtomicU64::new(1),
            next_segment: AtomicU32::new(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    pub fn root_map(&self) -> &Arc<OwnerRootMap> {
        &self.root_map
    }

    pub fn open_segment(&self, path: &str) -> TreeResult<Arc<Segment>> {
        let id = SegmentId(self.next_segment.fetch_add(1, Ordering::Relaxed));
        let segment = Arc::new(Segment::create(path, id, self.page_size)?);
        self.buffer_pool.register_segment(Arc::clone(&segment));
        Ok(segment)
    }

    /// Create an empty tree in the segment: one root leaf, registered in
    /// the owner map and the tree registry.
    pub fn create_tree(
        &self,
        segment: &Arc<Segment>,
        scheme: TupleScheme,
        key: KeyDescriptor,
    ) -> TreeResult<BTreeDescriptor> {
        let owner_id = PageOwnerId(self.next_owner.fetch_add(1, Ordering::Relaxed));
        let root = segment.allocate_page()?;

        let signal = AbortSignal::new();
        let block = segment.map_to_block(root);
        let page = self
            .buffer_pool
            .lock_page(block, LockMode::Exclusive, true, &signal, TXN_ID_NONE)?
            .expect("faulting lock_page returned no page");
        let descriptor = BTreeDescriptor {
            segment: Arc::clone(segment),
            scheme,
            key,
            owner_id,
            root_page_id: root,
            write_latch: Arc::new(std::sync::Mutex::new(())),
        };
        {
            let mut node = NodeViewMut::new(page.write_data(), descriptor.layout());
            node.init(0);
        }
        self.buffer_pool
            .unlock_page(&page, LockMode::Exclusive, TXN_ID_NONE);
        self.root_map.set_root(owner_id, root);
        self.trees.insert(owner_id, descriptor.clone());

        info!("created tree {} with root {}", owner_id, root);
        Ok(descriptor)
    }

    /// Descriptor with the root re-read from the owner map.
    pub fn tree(&self, owner: PageOwnerId) -> TreeResult<BTreeDescriptor> {
        let mut descriptor = self.trees.get(&owner).ok_or_else(|| {
            crate::error::TreeError::new(
                crate::error::ErrorKind::UnknownTree,
                &format!("{} not registered", owner),
            )
        })?;
        descriptor.root_page_id = self.root_map.get_root(owner)?;
        Ok(descriptor)
    }

    pub fn action_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.action_latch.read().unwrap()
    }

    pub fn action_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.action_latch.write().unwrap()
    }

    pub fn flush_all(&self) -> TreeResult<()> {
        self.buffer_pool.flush_all()
    }
}
