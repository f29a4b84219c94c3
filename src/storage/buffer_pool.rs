use std::sync::Arc;

use log::debug;

use crate::{
    cache::accessor::CacheAccessor,
    error::TreeError,
    transaction::{AbortSignal, TxnId},
    types::{ConcurrentHashMap, TreeResult},
};

use super::{
    latch::LockMode,
    page::{CachePage, PageHandle},
    page_id::{BlockId, SegmentId},
    segment::Segment,
};

/// The shared frame table. Faults pages in from their owning segment on
/// demand; frames stay resident until explicitly discarded. Implements the
/// base `CacheAccessor`, which the transactional and quota decorators wrap.
pub struct BufferPool {
    page_size: usize,
    frames: ConcurrentHashMap<BlockId, PageHandle>,
    segments: ConcurrentHashMap<SegmentId, Arc<Segment>>,
}

impl BufferPool {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            frames: ConcurrentHashMap::new(),
            segments: ConcurrentHashMap::new(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn register_segment(&self, segment: Arc<Segment>) {
        assert_eq!(segment.page_size(), self.page_size);
        self.segments.insert(segment.id(), segment);
    }

    pub fn segment(&self, id: SegmentId) -> Option<Arc<Segment>> {
        self.segments.get(&id)
    }

    fn fault_page(&self, block: BlockId) -> TreeResult<PageHandle> {
        let segment = self.segments.get(&block.segment_id).ok_or_else(|| {
            TreeError::storage_io(&format!("segment {} not registered", block.segment_id))
        })?;

        let mut buf = vec![0u8; self.page_size];
        segment.read_block(block, &mut buf)?;
        debug!("page fault, {}", block);
        Ok(Arc::new(CachePage::new(block, buf)))
    }

    pub fn is_resident(&self, block: BlockId) -> bool {
        self.frames.contains_key(&block)
    }

    pub fn discard(&self, block: BlockId) {
        self.frames.remove(&block);
    }

    /// Write every dirty frame back to its segment.
    pub fn flush_all(&self) -> TreeResult<()> {
        let mut result = Ok(());
        self.frames.for_each(|block, page| {
            if result.is_ok() && page.is_dirty() {
                let data = page.read_data();
                result = self
                    .segments
                    .get(&block.segment_id)
                    .ok_or_else(|| TreeError::storage_io("segment vanished"))
                    .and_then(|seg| seg.write_block(*block, &data));
                if result.is_ok() {
                    page.clear_dirty();
                }
            }
        });
        result
    }
}

impl CacheAccessor for BufferPool {
    fn lock_page(
        &self,
        block: BlockId,
        mode: LockMode,
        fault_if_missing: bool,
        signal: &AbortSignal,
        _txn: TxnId,
    ) -> TreeResult<Option<PageHandle>> {
        let page = match self.frames.get(&block) {
            Some(p) => p,
            None => {
                if !fault_if_missing {
                    return Ok(None);
                }
                // Two threads may fault the same block; the first insert
                // wins and the loser's copy is dropped unread.
                let fresh = self.fault_page(block)?;
                self.frames.get_or_insert_with(&block, || fresh)
            }
        };

        page.latch().acquire(mode, signal)?;
        Ok(Some(page))
    }

    fn unlock_page(&self, page: &PageHandle, mode: LockMode, _txn: TxnId) {
        page.latch().release(mode);
    }
}
