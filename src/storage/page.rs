use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use super::{latch::PageLatch, page_id::BlockId};

pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// A buffer-pool frame: one page worth of bytes plus its latch. Content is
/// mutated only while the latch is held EXCLUSIVE; the inner `RwLock` exists
/// to hand out byte views, it never contends once the latch discipline is
/// respected.
pub struct CachePage {
    block: BlockId,
    latch: PageLatch,
    data: RwLock<Vec<u8>>,
    dirty: AtomicBool,
}

pub type PageHandle = Arc<CachePage>;

impl CachePage {
    pub fn new(block: BlockId, data: Vec<u8>) -> Self {
        Self {
            block,
            latch: PageLatch::new(),
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn latch(&self) -> &PageLatch {
        &self.latch
    }

    pub fn read_data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read().unwrap()
    }

    /// Marks the frame dirty; the caller must hold the latch EXCLUSIVE.
    pub fn write_data(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.dirty.store(true, Ordering::Release);
        self.data.write().unwrap()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}
