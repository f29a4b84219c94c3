use std::sync::Arc;

use log::debug;

use crate::{
    cache::accessor::CacheAccessor,
    error::TreeError,
    storage::{
        latch::LockMode,
        page::PageHandle,
        page_id::PageId,
        segment::Segment,
    },
    transaction::{AbortSignal, TxnId},
    types::TreeResult,
};

use super::node::{NodeLayout, NodeView, NodeViewMut};

struct HeldPage {
    page: PageHandle,
    pid: PageId,
    mode: LockMode,
}

/// Scoped acquisition of a single tree page through a cache accessor.
/// Whatever happens on the way out (error, early return, cancellation), a
/// successful lock is paired with a release: explicitly, on re-lock, or on
/// drop. Holding one counts against the accessor's quota.
pub struct PageLock {
    accessor: Arc<dyn CacheAccessor>,
    segment: Arc<Segment>,
    layout: NodeLayout,
    signal: AbortSignal,
    txn: TxnId,
    held: Option<HeldPage>,
}

impl PageLock {
    pub fn new(
        accessor: Arc<dyn CacheAccessor>,
        segment: Arc<Segment>,
        layout: NodeLayout,
        signal: AbortSignal,
        txn: TxnId,
    ) -> Self {
        Self {
            accessor,
            segment,
            layout,
            signal,
            txn,
            held: None,
        }
    }

    fn acquire(&self, pid: PageId, mode: LockMode) -> TreeResult<HeldPage> {
        if self.signal.is_set() {
            return Err(TreeError::aborted());
        }
        let block = self.segment.map_to_block(pid);
        let page = self
            .accessor
            .lock_page(block, mode, true, &self.signal, self.txn)?
            .expect("faulting lock_page returned no page");
        Ok(HeldPage { page, pid, mode })
    }

    /// Release the held page (if any), then lock `pid`.
    pub fn lock_page(&mut self, pid: PageId, mode: LockMode) -> TreeResult<()> {
        self.unlock();
        let held = self.acquire(pid, mode)?;
        self.held = Some(held);
        Ok(())
    }

    /// Lock-coupling: acquire the new page before releasing the one held,
    /// so no split can slip in between the two.
    pub fn lock_page_with_coupling(&mut self, pid: PageId, mode: LockMode) -> TreeResult<()> {
        let prev = self.held.take();
        let result = self.acquire(pid, mode);
        if let Some(h) = prev {
            self.accessor.unlock_page(&h.page, h.mode, self.txn);
        }
        self.held = Some(result?);
        Ok(())
    }

    /// Non-blocking SHARED -> EXCLUSIVE conversion of the held lock.
    pub fn try_upgrade(&mut self) -> bool {
        let held = self.held.as_mut().expect("upgrade without a held page");
        match held.mode {
            LockMode::Exclusive => true,
            LockMode::Shared => {
                if held.page.latch().try_upgrade() {
                    held.mode = LockMode::Exclusive;
                    true
                } else {
                    debug!("upgrade contention on {}", held.pid);
                    false
                }
            }
        }
    }

    pub fn unlock(&mut self) {
        if let Some(h) = self.held.take() {
            self.accessor.unlock_page(&h.page, h.mode, self.txn);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.held.is_some()
    }

    pub fn current_page_id(&self) -> PageId {
        self.held.as_ref().expect("no page held").pid
    }

    pub fn mode(&self) -> LockMode {
        self.held.as_ref().expect("no page held").mode
    }

    pub fn get_node_for_read(&self) -> NodeView<'_> {
        let held = self.held.as_ref().expect("read view without a held page");
        NodeView::new(held.page.read_data(), self.layout.clone())
    }

    pub fn get_node_for_write(&self) -> NodeViewMut<'_> {
        let held = self.held.as_ref().expect("write view without a held page");
        assert_eq!(
            held.mode,
            LockMode::Exclusive,
            "write view requires an exclusive lock"
        );
        NodeViewMut::new(held.page.write_data(), self.layout.clone())
    }
}

impl Drop for PageLock {
    fn drop(&mut self) {
        self.unlock();
    }
}
