use std::cmp::Ordering;
use std::sync::Arc;

use log::debug;

use crate::{
    cache::accessor::{CacheAccessor, QuotaCacheAccessor, TransactionalCacheAccessor},
    database::Database,
    storage::{
        latch::LockMode,
        page_id::{PageId, NULL_PAGE_ID},
    },
    transaction::{Transaction, TXN_ID_NONE},
    types::TreeResult,
};

use super::{
    descriptor::BTreeDescriptor,
    node::{DupSeek, NodeLayout},
    page_lock::PageLock,
    tuple::{Cell, Tuple},
};

pub const DEFAULT_READER_QUOTA: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Normal,
    /// Confine the search to the first leaf reached; never switch to a
    /// sibling leaf.
    ReadLeafOnly,
    /// Stop one level above the leaves.
    ReadNonLeafOnly,
}

enum GlbOutcome {
    /// Final position taken; the page holding it is locked.
    Positioned { i: usize, found: bool },
    /// The bound lives further right; restart the level search there.
    SwitchRight(PageId),
    /// READ_LEAF_ONLY: stay on the original leaf at the given index.
    LeafOnlyStop(usize),
}

/// Descending search over the tree, tolerating concurrent splits by chasing
/// right-sibling links (Lehman-Yao). One page is locked at a time, two
/// briefly during lock-coupling. The cursor is `singular` when it is not
/// positioned on a tuple.
pub struct BTreeReader {
    // page_lock must drop before the quota accessor it counts against
    pub(crate) page_lock: PageLock,
    pub(crate) quota: Arc<QuotaCacheAccessor>,
    pub(crate) desc: BTreeDescriptor,
    pub(crate) layout: NodeLayout,

    pub(crate) page_id: PageId,
    pub(crate) i_tuple: usize,
    pub(crate) singular: bool,

    /// Lock mode to open the root with. Self-tuning: one search with the
    /// wrong mode corrects it for every search after.
    pub(crate) root_lock_mode: LockMode,
    pub(crate) leaf_lock_mode: LockMode,
    pub(crate) leaf_lock_coupling: bool,
}

impl BTreeReader {
    pub fn new(db: &Database, descriptor: &BTreeDescriptor, txn: &Transaction) -> Self {
        let base: Arc<dyn CacheAccessor> = Arc::clone(db.buffer_pool()) as Arc<dyn CacheAccessor>;
        let transactional = Arc::new(TransactionalCacheAccessor::new(base, txn.id()));
        let quota = Arc::new(QuotaCacheAccessor::new(
            transactional,
            None,
            DEFAULT_READER_QUOTA,
        ));
        Self::with_accessor(descriptor, txn, quota, LockMode::Shared, false)
    }

    /// Build on a caller-supplied quota accessor; used by the writer (which
    /// shares one quota between its two page locks) and by tests observing
    /// held-page counts.
    pub fn with_accessor(
        descriptor: &BTreeDescriptor,
        txn: &Transaction,
        quota: Arc<QuotaCacheAccessor>,
        leaf_lock_mode: LockMode,
        leaf_lock_coupling: bool,
    ) -> Self {
        let layout = descriptor.layout();
        let page_lock = PageLock::new(
            Arc::clone(&quota) as Arc<dyn CacheAccessor>,
            Arc::clone(&descriptor.segment),
            layout.clone(),
            txn.abort_signal(),
            TXN_ID_NONE,
        );
        Self {
            page_lock,
            quota,
            desc: descriptor.clone(),
            layout,
            page_id: NULL_PAGE_ID,
            i_tuple: 0,
            singular: true,
            root_lock_mode: LockMode::Shared,
            leaf_lock_mode,
            leaf_lock_coupling,
        }
    }

    pub fn root_page_id(&self) -> PageId {
        self.desc.root_page_id
    }

    pub fn set_root_page_id(&mut self, pid: PageId) {
        self.desc.root_page_id = pid;
    }

    pub fn quota_accessor(&self) -> &Arc<QuotaCacheAccessor> {
        &self.quota
    }

    pub fn root_lock_mode(&self) -> LockMode {
        self.root_lock_mode
    }

    /// Height of the root node; 0 for a single-leaf tree.
    pub fn tree_height(&mut self) -> TreeResult<u32> {
        self.end_search()?;
        self.page_lock
            .lock_page(self.desc.root_page_id, LockMode::Shared)?;
        let height = self.page_lock.get_node_for_read().height();
        self.page_lock.unlock();
        Ok(height)
    }

    /// Entry count of every leaf, left to right. Validation helper for
    /// tests and debugging; walks the whole leaf chain.
    pub fn leaf_occupancy(&mut self) -> TreeResult<Vec<usize>> {
        self.end_search()?;
        self.page_id = self.desc.root_page_id;
        loop {
            self.page_lock.lock_page(self.page_id, LockMode::Shared)?;
            let node = self.page_lock.get_node_for_read();
            if node.is_leaf() {
                break;
            }
            let child = node.child(0);
            drop(node);
            self.page_id = child;
        }

        let mut counts = Vec::new();
        loop {
            let (n_entries, right_sibling) = {
                let node = self.page_lock.get_node_for_read();
                (node.n_entries(), node.right_sibling())
            };
            counts.push(n_entries);
            if right_sibling.is_null() {
                break;
            }
            self.page_id = right_sibling;
            self.page_lock.lock_page(right_sibling, LockMode::Shared)?;
        }
        self.end_search()?;
        Ok(counts)
    }

    pub fn is_singular(&self) -> bool {
        self.singular
    }

    /// Release the cursor position. Always safe to call; after it the
    /// cursor is singular and holds no page.
    pub fn end_search(&mut self) -> TreeResult<()> {
        self.page_lock.unlock();
        self.singular = true;
        Ok(())
    }

    /// Row under the cursor. The cursor must be positioned on a leaf entry.
    pub fn current_tuple(&self) -> TreeResult<Tuple> {
        assert!(!self.singular, "cursor is singular");
        let node = self.page_lock.get_node_for_read();
        assert!(node.is_leaf(), "cursor is not on a leaf");
        assert!(self.i_tuple < node.n_entries(), "cursor past the last entry");
        Ok(node.tuple(self.i_tuple))
    }

    /// Child pointer under the cursor after a READ_NONLEAF_ONLY search.
    pub fn current_child(&self) -> TreeResult<PageId> {
        assert!(!self.singular, "cursor is singular");
        let node = self.page_lock.get_node_for_read();
        Ok(node.child(self.i_tuple))
    }

    pub fn search_for_key(
        &mut self,
        search_key: &[Cell],
        dup_seek: DupSeek,
        least_upper: bool,
    ) -> TreeResult<bool> {
        self.search_with_mode(search_key, dup_seek, least_upper, ReadMode::Normal)
    }

    pub fn search_with_mode(
        &mut self,
        search_key: &[Cell],
        dup_seek: DupSeek,
        least_upper: bool,
        read_mode: ReadMode,
    ) -> TreeResult<bool> {
        let mut stack = Vec::new();
        let start = self.desc.root_page_id;
        let mode = self.root_lock_mode;
        self.search_template(
            search_key, dup_seek, least_upper, &mut stack, start, mode, read_mode,
        )
    }

    /// The search core. At each level we may have to search right because of
    /// concurrent splits; the parent's notion of the next sibling child
    /// bounds that chase. Positions the cursor at the leaf (or at height 1
    /// for READ_NONLEAF_ONLY) and records the descent in `page_stack`.
    pub(crate) fn search_template(
        &mut self,
        search_key: &[Cell],
        dup_seek: DupSeek,
        least_upper: bool,
        page_stack: &mut Vec<PageId>,
        start_page_id: PageId,
        initial_lock_mode: LockMode,
        read_mode: ReadMode,
    ) -> TreeResult<bool> {
        self.end_search()?;
        self.singular = false;
        self.page_id = start_page_id;

        let mut right_search_terminator = NULL_PAGE_ID;
        let mut mode = initial_lock_mode;
        let mut coupling_pending = false;
        let mut found_key_and_moved_right = false;

        loop {
            if self.leaf_lock_coupling && coupling_pending {
                self.page_lock
                    .lock_page_with_coupling(self.page_id, mode)?;
            } else {
                self.page_lock.lock_page(self.page_id, mode)?;
            }
            coupling_pending = false;

            // The root can turn out to be a leaf while we opened it in the
            // non-leaf mode.
            let height = self.page_lock.get_node_for_read().height();
            if height == 0 && mode != self.leaf_lock_mode && !self.adjust_root_lock_mode(&mut mode)
            {
                // retry the whole level with the remembered mode
                continue;
            }

            let (mut n_entries, mut right_sibling) = {
                let node = self.page_lock.get_node_for_read();
                (node.n_entries(), node.right_sibling())
            };

            let (mut i, mut found) = {
                let node = self.page_lock.get_node_for_read();
                node.binary_search(search_key, dup_seek, least_upper)
            };

            if found_key_and_moved_right && !found {
                // We located the key on the page to the left and moved right
                // for DUP_SEEK_END; the duplicate run ended exactly at the
                // boundary, so the key was found after all.
                debug_assert_eq!(i, 0);
                found = true;
            }

            // A greatest-lower-bound search positioned on the rightmost
            // entry must check the right sibling's first key before it can
            // claim the bound.
            if !least_upper
                && !found
                && n_entries > 0
                && i + 1 == n_entries
                && !right_sibling.is_null()
            {
                debug_assert!(!self.leaf_lock_coupling);
                match self.glb_check_right(search_key, dup_seek, right_sibling, mode, read_mode, i)?
                {
                    GlbOutcome::SwitchRight(pid) => {
                        self.page_id = pid;
                        found_key_and_moved_right = false;
                        continue;
                    }
                    GlbOutcome::LeafOnlyStop(index) => {
                        self.i_tuple = index;
                        return Ok(false);
                    }
                    GlbOutcome::Positioned { i: i2, found: f2 } => {
                        i = i2;
                        found = f2;
                        let node = self.page_lock.get_node_for_read();
                        n_entries = node.n_entries();
                        right_sibling = node.right_sibling();
                    }
                }
            }

            if i == n_entries {
                debug_assert!(!found || dup_seek == DupSeek::End);
                // What we are searching for is bigger than everything on
                // this node.
                if right_sibling == right_search_terminator {
                    // No need to search rightward. Only possible at the
                    // leaf level: keys are never deleted from internal
                    // nodes, so parent and child upper bounds agree there.
                    debug_assert_eq!(height, 0);
                    if right_search_terminator.is_null() {
                        self.singular = true;
                    }
                } else {
                    found_key_and_moved_right = found;
                    self.page_id = right_sibling;
                    if self.leaf_lock_coupling && height == 0 {
                        coupling_pending = true;
                    }
                    continue;
                }
            }

            if height == 0 {
                self.i_tuple = i;
                return Ok(found);
            }
            if height == 1 && read_mode == ReadMode::ReadNonLeafOnly {
                self.i_tuple = i;
                return Ok(found);
            }

            // leave a trail of breadcrumbs for the writer
            page_stack.push(self.page_id);

            let child = {
                let node = self.page_lock.get_node_for_read();
                node.child(i)
            };

            if height == 1 {
                // prepare to hit rock bottom
                mode = self.leaf_lock_mode;
                if self.leaf_lock_coupling {
                    coupling_pending = true;
                }
            }

            // Record the successor child as a terminator for rightward
            // searches at the child level, except for partial-key and
            // DUP_SEEK_END searches: a key deleted from a leaf still
            // matches in the parent, so those chases must stay open-ended.
            if search_key.len() == self.layout.key.width() && dup_seek != DupSeek::End {
                if i + 1 < n_entries {
                    right_search_terminator = {
                        let node = self.page_lock.get_node_for_read();
                        node.child(i + 1)
                    };
                } else {
                    // the successor child lives under our own right sibling
                    self.page_lock.unlock();
                    coupling_pending = false;
                    right_search_terminator = self.first_child_of(right_sibling)?;
                }
            }

            self.page_id = child;
            found_key_and_moved_right = false;
        }
    }

    /// The chosen lock mode mismatched what the root turned out to need.
    /// Remember the right mode for future searches, then try to upgrade in
    /// place; failing that, release and let the caller retry.
    fn adjust_root_lock_mode(&mut self, mode: &mut LockMode) -> bool {
        self.root_lock_mode = self.leaf_lock_mode;
        *mode = self.leaf_lock_mode;
        if self.page_lock.try_upgrade() {
            return true;
        }
        debug!("root lock mode adjustment forces a retry");
        self.page_lock.unlock();
        false
    }

    /// Decide where a GLB search positioned on its rightmost entry really
    /// ends. Peeks at the right sibling's first key; when the bound stays on
    /// the original page, the page is re-locked and — because it may have
    /// split while unlocked — re-scanned until the sibling chain reconnects
    /// to the peeked page.
    fn glb_check_right(
        &mut self,
        search_key: &[Cell],
        dup_seek: DupSeek,
        sibling: PageId,
        mode: LockMode,
        read_mode: ReadMode,
        i_current: usize,
    ) -> TreeResult<GlbOutcome> {
        let orig = self.page_id;

        // peek at the first key to the right, skipping leaves emptied by
        // deletion
        let mut peek = sibling;
        let first_key_cmp = loop {
            self.page_lock.lock_page(peek, mode)?;
            let (n, next) = {
                let node = self.page_lock.get_node_for_read();
                (node.n_entries(), node.right_sibling())
            };
            if n > 0 {
                let node = self.page_lock.get_node_for_read();
                break Some(node.compare_first_key(search_key));
            }
            if next.is_null() {
                break None;
            }
            peek = next;
        };
        self.page_lock.unlock();

        match first_key_cmp {
            Some(cmp) if cmp != Ordering::Less => {
                // the bound (or an exact match) lies to the right
                if read_mode == ReadMode::ReadLeafOnly {
                    self.page_lock.lock_page(orig, mode)?;
                    self.page_id = orig;
                    return Ok(GlbOutcome::LeafOnlyStop(i_current));
                }
                Ok(GlbOutcome::SwitchRight(peek))
            }
            _ => {
                // The bound is on the original page — or on a page split
                // off it while we were peeking. Re-scan rightward until the
                // chain reconnects to the remembered sibling.
                self.page_id = orig;
                let mut last_peeked: Option<PageId> = None;
                loop {
                    self.page_lock.lock_page(self.page_id, mode)?;
                    let (n, right) = {
                        let node = self.page_lock.get_node_for_read();
                        (node.n_entries(), node.right_sibling())
                    };

                    if n == 0 {
                        // emptied by a concurrent delete; nothing to claim
                        // here
                        if right.is_null() || right == peek {
                            return Ok(GlbOutcome::Positioned { i: 0, found: false });
                        }
                        self.page_id = right;
                        continue;
                    }

                    let (i, found) = {
                        let node = self.page_lock.get_node_for_read();
                        node.binary_search(search_key, dup_seek, false)
                    };

                    if found || i + 1 < n {
                        // exact match, or an interior bound
                        return Ok(GlbOutcome::Positioned { i, found });
                    }

                    // every key here is below the search key
                    if right.is_null() || right == peek || last_peeked == Some(right) {
                        return Ok(GlbOutcome::Positioned { i, found });
                    }

                    // the page split while unlocked; check whether the new
                    // piece still holds keys at or below the search key
                    self.page_lock.unlock();
                    self.page_lock.lock_page(right, mode)?;
                    let (piece_n, piece_cmp) = {
                        let node = self.page_lock.get_node_for_read();
                        let n2 = node.n_entries();
                        let c = if n2 > 0 {
                            Some(node.compare_first_key(search_key))
                        } else {
                            None
                        };
                        (n2, c)
                    };
                    self.page_lock.unlock();

                    match piece_cmp {
                        Some(cmp) if cmp != Ordering::Less => {
                            // keys at or below the search key moved right
                            self.page_id = right;
                            last_peeked = None;
                        }
                        _ if piece_n == 0 => {
                            self.page_id = right;
                            last_peeked = None;
                        }
                        _ => {
                            // the bound stays on the current piece; re-lock
                            // it and conclude unless it split yet again
                            last_peeked = Some(right);
                        }
                    }
                }
            }
        }
    }

    /// First child entry of the node at `pid`, or NULL for the null page.
    fn first_child_of(&mut self, pid: PageId) -> TreeResult<PageId> {
        if pid.is_null() {
            return Ok(NULL_PAGE_ID);
        }
        self.page_lock.lock_page(pid, LockMode::Shared)?;
        let child = {
            let node = self.page_lock.get_node_for_read();
            debug_assert!(node.n_entries() > 0);
            node.child(0)
        };
        self.page_lock.unlock();
        Ok(child)
    }

    /// Position on the first tuple of the tree.
    pub fn search_first(&mut self) -> TreeResult<bool> {
        self.end_search()?;
        self.singular = false;
        self.page_id = self.desc.root_page_id;
        let mut mode = self.root_lock_mode;

        loop {
            self.page_lock.lock_page(self.page_id, mode)?;

            let height = self.page_lock.get_node_for_read().height();
            if height == 0 && mode != self.leaf_lock_mode && !self.adjust_root_lock_mode(&mut mode)
            {
                continue;
            }

            let (n_entries, right_sibling) = {
                let node = self.page_lock.get_node_for_read();
                (node.n_entries(), node.right_sibling())
            };

            if height == 0 {
                if n_entries > 0 {
                    self.i_tuple = 0;
                    return Ok(true);
                }
                if right_sibling.is_null() {
                    self.end_search()?;
                    return Ok(false);
                }
                // leaf emptied by deletion; keep walking the chain
                self.page_id = right_sibling;
                continue;
            }

            debug_assert!(n_entries > 0);
            let child = {
                let node = self.page_lock.get_node_for_read();
                node.child(0)
            };
            if height == 1 {
                mode = self.leaf_lock_mode;
            }
            self.page_id = child;
        }
    }

    /// Position on the last tuple of the tree.
    pub fn search_last(&mut self) -> TreeResult<bool> {
        'restart: loop {
            self.end_search()?;
            self.singular = false;
            self.page_id = self.desc.root_page_id;
            let mut mode = self.root_lock_mode;

            // descend along the rightmost child of each level
            loop {
                self.page_lock.lock_page(self.page_id, mode)?;

                let height = self.page_lock.get_node_for_read().height();
                if height == 0
                    && mode != self.leaf_lock_mode
                    && !self.adjust_root_lock_mode(&mut mode)
                {
                    continue;
                }
                if height == 0 {
                    break;
                }

                let child = {
                    let node = self.page_lock.get_node_for_read();
                    node.child(node.n_entries() - 1)
                };
                if height == 1 {
                    mode = self.leaf_lock_mode;
                }
                self.page_id = child;
            }

            // walk to the end of the leaf chain, remembering the last
            // non-empty page; deletion can leave empty leaves anywhere
            let mut best = self.walk_chain_to_last(mode)?;
            if best.is_none() {
                // everything under the rightmost descent was empty; scan
                // the whole leaf level from the left
                if !self.search_first()? {
                    return Ok(false);
                }
                best = self.walk_chain_to_last(mode)?;
            }

            match best {
                Some((pid, i)) => {
                    if self.page_lock.current_page_id() != pid {
                        self.page_lock.lock_page(pid, mode)?;
                        self.page_id = pid;
                    }
                    let n = self.page_lock.get_node_for_read().n_entries();
                    if n == 0 {
                        // emptied between the walk and the re-lock
                        continue 'restart;
                    }
                    self.i_tuple = i.min(n - 1);
                    return Ok(true);
                }
                None => {
                    self.end_search()?;
                    return Ok(false);
                }
            }
        }
    }

    /// Follow the leaf chain from the current locked leaf to its end,
    /// returning the position of the last tuple seen.
    fn walk_chain_to_last(&mut self, mode: LockMode) -> TreeResult<Option<(PageId, usize)>> {
        let mut best = None;
        loop {
            let (n_entries, right_sibling) = {
                let node = self.page_lock.get_node_for_read();
                (node.n_entries(), node.right_sibling())
            };
            if n_entries > 0 {
                best = Some((self.page_id, n_entries - 1));
            }
            if right_sibling.is_null() {
                return Ok(best);
            }
            self.page_id = right_sibling;
            self.page_lock.lock_page(right_sibling, mode)?;
        }
    }

    /// Advance to the next tuple, following the leaf chain and skipping
    /// leaves emptied by deletion.
    pub fn search_next(&mut self) -> TreeResult<bool> {
        if self.singular {
            return Ok(false);
        }
        assert!(self.page_lock.is_locked());
        self.i_tuple += 1;

        loop {
            let (n_entries, right_sibling) = {
                let node = self.page_lock.get_node_for_read();
                debug_assert!(node.is_leaf());
                (node.n_entries(), node.right_sibling())
            };

            if self.i_tuple < n_entries {
                return Ok(true);
            }
            if right_sibling.is_null() {
                self.end_search()?;
                return Ok(false);
            }

            if self.leaf_lock_coupling {
                self.page_lock
                    .lock_page_with_coupling(right_sibling, self.leaf_lock_mode)?;
            } else {
                self.page_lock
                    .lock_page(right_sibling, self.leaf_lock_mode)?;
            }
            self.page_id = right_sibling;
            self.i_tuple = 0;
        }
    }
}
