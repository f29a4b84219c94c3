use std::sync::Arc;

use log::{debug, info};

use crate::{
    cache::accessor::{CacheAccessor, QuotaCacheAccessor, TransactionalCacheAccessor},
    database::Database,
    error::{ErrorKind, TreeError},
    storage::{
        latch::LockMode,
        page_id::{PageId, NULL_PAGE_ID},
        segment::ScratchAccessor,
    },
    transaction::{Transaction, TxnParticipant, UndoOp, UndoRecord, TXN_ID_NONE},
    types::TreeResult,
};

use super::{
    descriptor::{BTreeDescriptor, PageOwnerId},
    node::{stage_node_image, DupSeek},
    page_lock::PageLock,
    reader::{BTreeReader, ReadMode},
    tuple::{Cell, Tuple},
};

pub const DEFAULT_WRITER_QUOTA: usize = 8;

const UNDO_SCRATCH_PAGES: usize = 4;

/// What to do when an insert finds its key already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupPolicy {
    Allow,
    /// Silently drop the new row.
    Discard,
    Fail,
}

/// Mutating access to a tree. Extends the reader: descents run with an
/// EXCLUSIVE leaf lock and lock-coupling, and the ancestor trail recorded by
/// the search drives split propagation. New node images are staged on
/// scratch frames before publication; sibling links are published
/// left-then-right so readers always see a forward-consistent chain.
pub struct BTreeWriter {
    db: Arc<Database>,
    cursor: BTreeReader,

    // second lock for the page being created by a split
    side_lock: PageLock,
    scratch: ScratchAccessor,
    page_stack: Vec<PageId>,
    monotonic: bool,
}

impl BTreeWriter {
    pub fn new(
        db: &Arc<Database>,
        descriptor: &BTreeDescriptor,
        txn: &Transaction,
        scratch: ScratchAccessor,
        monotonic: bool,
    ) -> Self {
        let base: Arc<dyn CacheAccessor> =
            Arc::clone(db.buffer_pool()) as Arc<dyn CacheAccessor>;
        let transactional = Arc::new(TransactionalCacheAccessor::new(base, txn.id()));
        let quota = Arc::new(QuotaCacheAccessor::new(
            transactional,
            None,
            DEFAULT_WRITER_QUOTA,
        ));
        let cursor = BTreeReader::with_accessor(
            descriptor,
            txn,
            Arc::clone(&quota),
            LockMode::Exclusive,
            true,
        );
        let side_lock = PageLock::new(
            quota as Arc<dyn CacheAccessor>,
            Arc::clone(&descriptor.segment),
            descriptor.layout(),
            txn.abort_signal(),
            TXN_ID_NONE,
        );

        txn.add_participant(Arc::new(TreeUndoApplier {
            db: Arc::clone(db),
            owner: descriptor.owner_id,
        }));

        Self {
            db: Arc::clone(db),
            cursor,
            side_lock,
            scratch,
            page_stack: Vec::new(),
            monotonic,
        }
    }

    pub fn is_singular(&self) -> bool {
        self.cursor.is_singular()
    }

    pub fn end_search(&mut self) -> TreeResult<()> {
        self.cursor.end_search()
    }

    pub fn current_tuple(&self) -> TreeResult<Tuple> {
        self.cursor.current_tuple()
    }

    pub fn search_for_key(
        &mut self,
        search_key: &[Cell],
        dup_seek: DupSeek,
        least_upper: bool,
    ) -> TreeResult<bool> {
        self.cursor.search_for_key(search_key, dup_seek, least_upper)
    }

    pub fn search_first(&mut self) -> TreeResult<bool> {
        self.cursor.search_first()
    }

    pub fn search_last(&mut self) -> TreeResult<bool> {
        self.cursor.search_last()
    }

    pub fn search_next(&mut self) -> TreeResult<bool> {
        self.cursor.search_next()
    }

    pub fn quota_accessor(&self) -> &Arc<QuotaCacheAccessor> {
        self.cursor.quota_accessor()
    }

    fn refresh_root(&mut self) -> TreeResult<()> {
        let root = self.db.root_map().get_root(self.cursor.desc.owner_id)?;
        self.cursor.desc.root_page_id = root;
        Ok(())
    }

    /// Descend to the owning leaf and insert the row, splitting on the way
    /// back up as needed.
    pub fn insert(&mut self, txn: &Transaction, tuple: &Tuple, policy: DupPolicy) -> TreeResult<()> {
        let write_latch = Arc::clone(&self.cursor.desc.write_latch);
        let _guard = write_latch.lock().unwrap();

        let search_key = self.cursor.desc.key.project(tuple);
        self.refresh_root()?;
        self.page_stack.clear();

        let start = self.cursor.desc.root_page_id;
        let mode = self.cursor.root_lock_mode;
        let found = self.cursor.search_template(
            &search_key,
            DupSeek::End,
            true,
            &mut self.page_stack,
            start,
            mode,
            ReadMode::Normal,
        )?;

        if found {
            match policy {
                DupPolicy::Allow => {}
                DupPolicy::Discard => {
                    self.cursor.end_search()?;
                    return Ok(());
                }
                DupPolicy::Fail => {
                    self.cursor.end_search()?;
                    return Err(TreeError::new(
                        ErrorKind::DuplicateKey,
                        &format!("key already present in {}", self.cursor.desc.owner_id),
                    ));
                }
            }
        }

        self.insert_at_cursor(txn, tuple)?;
        self.cursor.end_search()?;
        Ok(())
    }

    /// Replace the payload of the first row matching the tuple's key.
    pub fn update(&mut self, txn: &Transaction, tuple: &Tuple) -> TreeResult<bool> {
        let write_latch = Arc::clone(&self.cursor.desc.write_latch);
        let _guard = write_latch.lock().unwrap();

        let search_key = self.cursor.desc.key.project(tuple);
        self.refresh_root()?;
        self.page_stack.clear();

        let found = self.cursor.search_for_key(&search_key, DupSeek::Begin, true)?;
        if !found {
            self.cursor.end_search()?;
            return Ok(false);
        }

        let old = self.cursor.current_tuple()?;
        debug_assert_eq!(self.cursor.desc.key.project(&old), search_key);
        {
            let mut node = self.cursor.page_lock.get_node_for_write();
            node.update_tuple(self.cursor.i_tuple, tuple);
        }
        txn.record_undo(UndoRecord {
            owner: self.cursor.desc.owner_id,
            op: UndoOp::UpdatedTuple {
                old,
                new: tuple.clone(),
            },
        });
        self.cursor.end_search()?;
        Ok(true)
    }

    /// Remove the first row matching the key. Internal nodes keep their
    /// (now possibly stale) upper bounds; readers treat them as hints.
    pub fn delete(&mut self, txn: &Transaction, search_key: &[Cell]) -> TreeResult<bool> {
        let write_latch = Arc::clone(&self.cursor.desc.write_latch);
        let _guard = write_latch.lock().unwrap();

        self.refresh_root()?;
        self.page_stack.clear();

        let found = self.cursor.search_for_key(search_key, DupSeek::Begin, true)?;
        if !found {
            self.cursor.end_search()?;
            return Ok(false);
        }

        let old = self.cursor.current_tuple()?;
        {
            let mut node = self.cursor.page_lock.get_node_for_write();
            node.remove_entry(self.cursor.i_tuple);
        }
        txn.record_undo(UndoRecord {
            owner: self.cursor.desc.owner_id,
            op: UndoOp::DeletedTuple(old),
        });
        self.cursor.end_search()?;
        Ok(true)
    }

    /// Remove exactly this row, payload included; duplicates with the same
    /// key but other payloads stay.
    pub fn delete_exact(&mut self, txn: &Transaction, tuple: &Tuple) -> TreeResult<bool> {
        let write_latch = Arc::clone(&self.cursor.desc.write_latch);
        let _guard = write_latch.lock().unwrap();

        let search_key = self.cursor.desc.key.project(tuple);
        self.refresh_root()?;
        self.page_stack.clear();

        let mut positioned = self.cursor.search_for_key(&search_key, DupSeek::Begin, true)?;
        while positioned && !self.cursor.is_singular() {
            let candidate = self.cursor.current_tuple()?;
            if self.cursor.desc.key.project(&candidate) != search_key {
                break;
            }
            if candidate == *tuple {
                {
                    let mut node = self.cursor.page_lock.get_node_for_write();
                    node.remove_entry(self.cursor.i_tuple);
                }
                txn.record_undo(UndoRecord {
                    owner: self.cursor.desc.owner_id,
                    op: UndoOp::DeletedTuple(candidate),
                });
                self.cursor.end_search()?;
                return Ok(true);
            }
            positioned = self.cursor.search_next()?;
        }
        self.cursor.end_search()?;
        Ok(false)
    }

    /// Bulk-append fast path for strictly increasing keys: the rightmost
    /// leaf stays EXCLUSIVE across calls and rows are appended without
    /// re-descending. Finished leaves are left full.
    pub fn append_monotonic(&mut self, txn: &Transaction, tuple: &Tuple) -> TreeResult<()> {
        assert!(self.monotonic, "writer was not opened in monotonic mode");
        let write_latch = Arc::clone(&self.cursor.desc.write_latch);
        let _guard = write_latch.lock().unwrap();

        if !self.cursor.page_lock.is_locked() || self.cursor.singular {
            self.position_rightmost_leaf()?;
        }

        let key = self.cursor.desc.key.project(tuple);
        {
            let mut node = self.cursor.page_lock.get_node_for_write();
            let n = node.n_entries();
            if n > 0 {
                let last = node.key_cells(n - 1);
                assert_eq!(
                    self.cursor.desc.key.compare(&key, &last),
                    std::cmp::Ordering::Greater,
                    "monotonic append out of order"
                );
            }
            if n < node.capacity() {
                node.insert_leaf_entry(n, tuple);
                drop(node);
                self.cursor.i_tuple = n;
                txn.record_undo(UndoRecord {
                    owner: self.cursor.desc.owner_id,
                    op: UndoOp::InsertedTuple(tuple.clone()),
                });
                return Ok(());
            }
        }

        // leaf full: open a fresh rightmost leaf holding just the new row
        let mut scratch = self.scratch.allocate()?;
        let new_pid = self.cursor.desc.segment.allocate_page()?;

        let mut entry = vec![0u8; self.cursor.layout.leaf_entry_size()];
        tuple.encode(&mut entry);
        stage_node_image(&mut scratch, 0, NULL_PAGE_ID, 1, &entry);

        self.side_lock.lock_page(new_pid, LockMode::Exclusive)?;
        {
            let mut new_node = self.side_lock.get_node_for_write();
            new_node.load_image(&scratch);
        }
        drop(scratch);

        let old_pid = self.cursor.page_lock.current_page_id();
        let separator = {
            let mut node = self.cursor.page_lock.get_node_for_write();
            debug_assert!(node.right_sibling().is_null());
            let sep = node.key_cells(node.n_entries() - 1);
            node.set_right_sibling(new_pid);
            sep
        };
        txn.record_undo(UndoRecord {
            owner: self.cursor.desc.owner_id,
            op: UndoOp::InsertedTuple(tuple.clone()),
        });
        info!(
            "monotonic leaf rollover in {}, {} -> {}",
            self.cursor.desc.owner_id, old_pid, new_pid
        );

        // release both leaves before touching ancestors
        self.side_lock.unlock();
        self.cursor.page_lock.unlock();
        self.page_stack.clear();
        self.insert_separator(txn, separator, old_pid, new_pid, 1)?;

        // resume appending on the fresh leaf, and keep it exclusive
        self.cursor.page_lock.lock_page(new_pid, LockMode::Exclusive)?;
        self.cursor.page_id = new_pid;
        self.cursor.i_tuple = 0;
        self.cursor.singular = false;
        Ok(())
    }

    fn position_rightmost_leaf(&mut self) -> TreeResult<()> {
        self.refresh_root()?;
        self.cursor.end_search()?;
        self.cursor.singular = false;

        let mut pid = self.cursor.desc.root_page_id;
        loop {
            self.cursor.page_lock.lock_page(pid, LockMode::Exclusive)?;
            let (height, n_entries, right_sibling) = {
                let node = self.cursor.page_lock.get_node_for_read();
                (node.height(), node.n_entries(), node.right_sibling())
            };
            if height == 0 {
                if right_sibling.is_null() {
                    self.cursor.page_id = pid;
                    self.cursor.i_tuple = n_entries;
                    return Ok(());
                }
                pid = right_sibling;
                continue;
            }
            pid = {
                let node = self.cursor.page_lock.get_node_for_read();
                node.child(n_entries - 1)
            };
        }
    }

    /// The cursor is on an EXCLUSIVE-locked leaf with `i_tuple` at the
    /// insertion position.
    fn insert_at_cursor(&mut self, txn: &Transaction, tuple: &Tuple) -> TreeResult<()> {
        {
            let mut node = self.cursor.page_lock.get_node_for_write();
            debug_assert!(node.is_leaf());
            if node.n_entries() < node.capacity() {
                node.insert_leaf_entry(self.cursor.i_tuple, tuple);
                drop(node);
                txn.record_undo(UndoRecord {
                    owner: self.cursor.desc.owner_id,
                    op: UndoOp::InsertedTuple(tuple.clone()),
                });
                return Ok(());
            }
        }
        self.split_leaf_and_insert(txn, tuple)
    }

    /// Leaf split. The upper half is staged on a scratch frame and published
    /// on a fresh page whose right sibling is already set; only then does the
    /// old leaf shrink and point at it. Scratch or allocation failure
    /// surfaces before anything is mutated.
    fn split_leaf_and_insert(&mut self, txn: &Transaction, tuple: &Tuple) -> TreeResult<()> {
        let i_insert = self.cursor.i_tuple;
        let old_pid = self.cursor.page_lock.current_page_id();

        let mut scratch = self.scratch.allocate()?;
        let new_pid = self.cursor.desc.segment.allocate_page()?;

        let (separator, mid) = {
            let node = self.cursor.page_lock.get_node_for_read();
            let n = node.n_entries();
            debug_assert_eq!(n, node.capacity());
            let mid = n / 2;
            let separator = node.key_cells(mid - 1);
            stage_node_image(
                &mut scratch,
                0,
                node.right_sibling(),
                n - mid,
                node.entries_bytes(mid, n),
            );
            (separator, mid)
        };

        self.side_lock.lock_page(new_pid, LockMode::Exclusive)?;
        {
            let mut new_node = self.side_lock.get_node_for_write();
            new_node.load_image(&scratch);
        }
        drop(scratch);

        {
            let mut old_node = self.cursor.page_lock.get_node_for_write();
            old_node.truncate(mid);
            old_node.set_right_sibling(new_pid);
        }

        if i_insert < mid {
            let mut old_node = self.cursor.page_lock.get_node_for_write();
            old_node.insert_leaf_entry(i_insert, tuple);
        } else {
            let mut new_node = self.side_lock.get_node_for_write();
            new_node.insert_leaf_entry(i_insert - mid, tuple);
        }
        txn.record_undo(UndoRecord {
            owner: self.cursor.desc.owner_id,
            op: UndoOp::InsertedTuple(tuple.clone()),
        });
        info!(
            "leaf split in {}, {} -> {}",
            self.cursor.desc.owner_id, old_pid, new_pid
        );

        // release the children before locking ancestors; the half-split
        // state is already consistent for readers
        self.side_lock.unlock();
        self.cursor.page_lock.unlock();
        self.insert_separator(txn, separator, old_pid, new_pid, 1)
    }

    /// Propagate `(separator, new_child)` into the parent level, recursing
    /// upward when ancestors split too.
    fn insert_separator(
        &mut self,
        txn: &Transaction,
        separator: Vec<Cell>,
        old_child: PageId,
        new_child: PageId,
        parent_height: u32,
    ) -> TreeResult<()> {
        match self.page_stack.pop() {
            Some(parent) => {
                self.insert_entry_into_level(txn, parent, separator, old_child, new_child, parent_height)
            }
            None => {
                let owner = self.cursor.desc.owner_id;
                let current_root = self.db.root_map().get_root(owner)?;
                if current_root == old_child
                    && self.grow_root(txn, &separator, old_child, new_child, parent_height)?
                {
                    return Ok(());
                }
                // The tree grew under us since this descent started; find
                // the split child's level from the current root.
                let start = self.locate_level(&separator, parent_height)?;
                self.insert_entry_into_level(txn, start, separator, old_child, new_child, parent_height)
            }
        }
    }

    /// Root split: a new root pointing at both halves, published through the
    /// owner map. Returns false when another writer relocated the root
    /// first.
    fn grow_root(
        &mut self,
        _txn: &Transaction,
        separator: &[Cell],
        old_child: PageId,
        new_child: PageId,
        parent_height: u32,
    ) -> TreeResult<bool> {
        let owner = self.cursor.desc.owner_id;
        let new_root = self.cursor.desc.segment.allocate_page()?;

        self.side_lock.lock_page(new_root, LockMode::Exclusive)?;
        {
            let mut root = self.side_lock.get_node_for_write();
            root.init(parent_height);
            root.insert_internal_entry(0, separator, old_child);
            // rightmost entry of the rightmost node: an infinity upper
            // bound whose stored key bytes are never compared
            let infinity = vec![Cell(i64::MAX); self.cursor.layout.key.width()];
            root.insert_internal_entry(1, &infinity, new_child);
        }
        self.side_lock.unlock();

        if !self
            .db
            .root_map()
            .try_relocate_root(owner, old_child, new_root)
        {
            debug!("lost the root relocation race for {}", owner);
            self.cursor.desc.segment.deallocate_page(new_root);
            self.db.buffer_pool().discard(self.cursor.desc.segment.map_to_block(new_root));
            return Ok(false);
        }
        self.cursor.desc.root_page_id = new_root;
        Ok(true)
    }

    /// Descend from the current root to the first node at `target_height`
    /// whose range may contain the separator.
    fn locate_level(&mut self, separator: &[Cell], target_height: u32) -> TreeResult<PageId> {
        let owner = self.cursor.desc.owner_id;
        let mut pid = self.db.root_map().get_root(owner)?;
        loop {
            self.side_lock.lock_page(pid, LockMode::Shared)?;
            let (height, n_entries, right_sibling, i) = {
                let node = self.side_lock.get_node_for_read();
                let (i, _) = node.binary_search(separator, DupSeek::Any, true);
                (
                    node.height(),
                    node.n_entries(),
                    node.right_sibling(),
                    i,
                )
            };
            if height == target_height {
                self.side_lock.unlock();
                return Ok(pid);
            }
            assert!(height > target_height, "split child level vanished");

            if i == n_entries {
                assert!(!right_sibling.is_null());
                self.side_lock.unlock();
                pid = right_sibling;
                continue;
            }
            pid = {
                let node = self.side_lock.get_node_for_read();
                node.child(i)
            };
            self.side_lock.unlock();
        }
    }

    /// Insert `(separator, old_child)` before the split child's entry in the
    /// parent node and repoint that entry at the new child. Splits the
    /// parent first when full.
    fn insert_entry_into_level(
        &mut self,
        txn: &Transaction,
        parent: PageId,
        separator: Vec<Cell>,
        old_child: PageId,
        new_child: PageId,
        height: u32,
    ) -> TreeResult<()> {
        self.cursor.page_lock.lock_page(parent, LockMode::Exclusive)?;
        // Structural writes are serialized per tree, so the entry cannot
        // have moved since this writer located the parent.
        let j = {
            let node = self.cursor.page_lock.get_node_for_read();
            node.find_child(old_child)
                .expect("split child missing from its parent node")
        };

        {
            let mut node = self.cursor.page_lock.get_node_for_write();
            if node.n_entries() < node.capacity() {
                node.set_child(j, new_child);
                node.insert_internal_entry(j, &separator, old_child);
                drop(node);
                self.cursor.page_lock.unlock();
                return Ok(());
            }
        }
        self.split_internal_and_insert(txn, separator, old_child, new_child, j, height)
    }

    /// Same protocol as the leaf split, one level up.
    fn split_internal_and_insert(
        &mut self,
        txn: &Transaction,
        separator: Vec<Cell>,
        old_child: PageId,
        new_child: PageId,
        j: usize,
        height: u32,
    ) -> TreeResult<()> {
        let node_pid = self.cursor.page_lock.current_page_id();

        let mut scratch = self.scratch.allocate()?;
        let new_pid = self.cursor.desc.segment.allocate_page()?;

        let (up_separator, mid) = {
            let node = self.cursor.page_lock.get_node_for_read();
            let n = node.n_entries();
            debug_assert_eq!(n, node.capacity());
            let mid = n / 2;
            let up_separator = node.key_cells(mid - 1);
            stage_node_image(
                &mut scratch,
                height,
                node.right_sibling(),
                n - mid,
                node.entries_bytes(mid, n),
            );
            (up_separator, mid)
        };

        self.side_lock.lock_page(new_pid, LockMode::Exclusive)?;
        {
            let mut new_node = self.side_lock.get_node_for_write();
            new_node.load_image(&scratch);
        }
        drop(scratch);

        {
            let mut old_node = self.cursor.page_lock.get_node_for_write();
            old_node.truncate(mid);
            old_node.set_right_sibling(new_pid);
        }

        // place the pending entry in whichever half kept the split child
        if j < mid {
            let mut old_node = self.cursor.page_lock.get_node_for_write();
            old_node.set_child(j, new_child);
            old_node.insert_internal_entry(j, &separator, old_child);
        } else {
            let mut new_node = self.side_lock.get_node_for_write();
            new_node.set_child(j - mid, new_child);
            new_node.insert_internal_entry(j - mid, &separator, old_child);
        }
        info!(
            "internal split at height {} in {}, {} -> {}",
            height, self.cursor.desc.owner_id, node_pid, new_pid
        );

        self.side_lock.unlock();
        self.cursor.page_lock.unlock();
        self.insert_separator(txn, up_separator, node_pid, new_pid, height + 1)
    }
}

/// Undo hook registered with the transaction: inverts this tree's mutations
/// through a short-lived writer.
struct TreeUndoApplier {
    db: Arc<Database>,
    owner: PageOwnerId,
}

impl TxnParticipant for TreeUndoApplier {
    fn owner_id(&self) -> PageOwnerId {
        self.owner
    }

    fn apply_undo(&self, txn: &Transaction, op: &UndoOp) -> TreeResult<()> {
        let descriptor = self.db.tree(self.owner)?;
        let scratch = ScratchAccessor::new(self.db.page_size(), UNDO_SCRATCH_PAGES);
        let mut writer = BTreeWriter::new(&self.db, &descriptor, txn, scratch, false);
        match op {
            UndoOp::InsertedTuple(t) => {
                let removed = writer.delete_exact(txn, t)?;
                assert!(removed, "undo of insert found no matching row");
            }
            UndoOp::DeletedTuple(t) => {
                writer.insert(txn, t, DupPolicy::Allow)?;
            }
            UndoOp::UpdatedTuple { old, new } => {
                let removed = writer.delete_exact(txn, new)?;
                assert!(removed, "undo of update found no matching row");
                writer.insert(txn, old, DupPolicy::Allow)?;
            }
        }
        Ok(())
    }
}
