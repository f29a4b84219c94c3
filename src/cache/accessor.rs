use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use log::debug;

use crate::{
    storage::{latch::LockMode, page::PageHandle, page_id::BlockId},
    transaction::{AbortSignal, TxnId, TXN_ID_NONE},
    types::TreeResult,
};

/// Mediates page lock acquisition against an underlying buffer pool.
/// Decorators compose: the quota accessor usually wraps a transactional
/// accessor which wraps the pool itself.
pub trait CacheAccessor: Send + Sync {
    /// Returns a live, locked page, or `None` when the block is not
    /// resident and `fault_if_missing` is false.
    fn lock_page(
        &self,
        block: BlockId,
        mode: LockMode,
        fault_if_missing: bool,
        signal: &AbortSignal,
        txn: TxnId,
    ) -> TreeResult<Option<PageHandle>>;

    fn unlock_page(&self, page: &PageHandle, mode: LockMode, txn: TxnId);

    fn max_locked_pages(&self) -> usize {
        usize::MAX
    }

    /// The new cap must cover the pages currently held; shrinking below
    /// that is a programmer error.
    fn set_max_locked_pages(&self, _n: usize) {}
}

/// Tags every lock with the transaction it was bound to at construction,
/// unless the caller already supplied one. Reads pass through untouched.
pub struct TransactionalCacheAccessor {
    delegate: Arc<dyn CacheAccessor>,
    txn_id: TxnId,
}

impl TransactionalCacheAccessor {
    pub fn new(delegate: Arc<dyn CacheAccessor>, txn_id: TxnId) -> Self {
        Self { delegate, txn_id }
    }

    fn effective_txn(&self, txn: TxnId) -> TxnId {
        if txn == TXN_ID_NONE {
            self.txn_id
        } else {
            txn
        }
    }
}

impl CacheAccessor for TransactionalCacheAccessor {
    fn lock_page(
        &self,
        block: BlockId,
        mode: LockMode,
        fault_if_missing: bool,
        signal: &AbortSignal,
        txn: TxnId,
    ) -> TreeResult<Option<PageHandle>> {
        self.delegate
            .lock_page(block, mode, fault_if_missing, signal, self.effective_txn(txn))
    }

    fn unlock_page(&self, page: &PageHandle, mode: LockMode, txn: TxnId) {
        self.delegate.unlock_page(page, mode, self.effective_txn(txn));
    }

    fn max_locked_pages(&self) -> usize {
        self.delegate.max_locked_pages()
    }

    fn set_max_locked_pages(&self, n: usize) {
        self.delegate.set_max_locked_pages(n)
    }
}

/// Caps the number of concurrently held page locks. An accessor may have a
/// super-accessor, so a cluster of child accessors shares one total cap;
/// every lock recursively increments, every unlock recursively decrements.
pub struct QuotaCacheAccessor {
    delegate: Arc<dyn CacheAccessor>,
    super_quota: Option<Arc<QuotaCacheAccessor>>,
    max_locked_pages: AtomicUsize,
    n_pages_locked: AtomicUsize,
    high_water: AtomicUsize,
}

impl QuotaCacheAccessor {
    pub fn new(
        delegate: Arc<dyn CacheAccessor>,
        super_quota: Option<Arc<QuotaCacheAccessor>>,
        max_locked_pages: usize,
    ) -> Self {
        Self {
            delegate,
            super_quota,
            max_locked_pages: AtomicUsize::new(max_locked_pages),
            n_pages_locked: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
        }
    }

    pub fn n_pages_locked(&self) -> usize {
        self.n_pages_locked.load(Ordering::Acquire)
    }

    /// Largest concurrently held count observed over the accessor's life.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Acquire)
    }

    fn increment_usage(&self) {
        let n = self.n_pages_locked.fetch_add(1, Ordering::AcqRel) + 1;
        assert!(
            n <= self.max_locked_pages.load(Ordering::Acquire),
            "page lock quota exceeded: {} held, cap {}",
            n,
            self.max_locked_pages.load(Ordering::Acquire)
        );
        self.high_water.fetch_max(n, Ordering::AcqRel);
        if let Some(sup) = &self.super_quota {
            sup.increment_usage();
        }
    }

    fn decrement_usage(&self) {
        let prev = self.n_pages_locked.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "page unlock without a matching lock");
        if let Some(sup) = &self.super_quota {
            sup.decrement_usage();
        }
    }
}

impl CacheAccessor for QuotaCacheAccessor {
    fn lock_page(
        &self,
        block: BlockId,
        mode: LockMode,
        fault_if_missing: bool,
        signal: &AbortSignal,
        txn: TxnId,
    ) -> TreeResult<Option<PageHandle>> {
        let page = self
            .delegate
            .lock_page(block, mode, fault_if_missing, signal, txn)?;
        if page.is_some() {
            self.increment_usage();
            debug!(
                "page locked, {}, mode: {:?}, held: {}",
                block,
                mode,
                self.n_pages_locked()
            );
        }
        Ok(page)
    }

    fn unlock_page(&self, page: &PageHandle, mode: LockMode, txn: TxnId) {
        self.decrement_usage();
        self.delegate.unlock_page(page, mode, txn);
    }

    fn max_locked_pages(&self) -> usize {
        self.max_locked_pages.load(Ordering::Acquire)
    }

    fn set_max_locked_pages(&self, n: usize) {
        assert!(
            n >= self.n_pages_locked(),
            "cannot shrink quota below held count"
        );
        self.max_locked_pages.store(n, Ordering::Release);
    }
}

impl Drop for QuotaCacheAccessor {
    fn drop(&mut self) {
        assert_eq!(
            self.n_pages_locked(),
            0,
            "quota accessor dropped with pages still locked"
        );
    }
}
