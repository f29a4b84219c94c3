use core::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use log::{debug, info};

use crate::{
    btree::{descriptor::PageOwnerId, tuple::Tuple},
    types::TreeResult,
};

static TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnId(pub u64);

/// Passed where no transaction is bound yet; a transactional cache accessor
/// substitutes its own id for it.
pub const TXN_ID_NONE: TxnId = TxnId(0);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.0)
    }
}

/// Asynchronous cancellation flag. Cloned into every latch wait so a pending
/// abort surfaces as `Aborted` at the next blocking point.
#[derive(Clone)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Inverse of one applied mutation. Replayed in reverse order on rollback.
pub enum UndoOp {
    InsertedTuple(Tuple),
    DeletedTuple(Tuple),
    UpdatedTuple { old: Tuple, new: Tuple },
}

pub struct UndoRecord {
    pub owner: PageOwnerId,
    pub op: UndoOp,
}

/// Index into the undo log at savepoint creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavepointId(usize);

/// Applies undo records for one tree. Writers register a participant for
/// their tree when they join the transaction.
pub trait TxnParticipant: Send + Sync {
    fn owner_id(&self) -> PageOwnerId;

    fn apply_undo(&self, txn: &Transaction, op: &UndoOp) -> TreeResult<()>;
}

struct TxnInner {
    undo: Vec<UndoRecord>,
    savepoints: Vec<usize>,
    participants: Vec<Arc<dyn TxnParticipant>>,
}

pub struct Transaction {
    id: TxnId,
    signal: AbortSignal,
    inner: Mutex<TxnInner>,

    // true while this transaction is replaying its own undo log
    undoing: AtomicBool,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: TxnId(TRANSACTION_ID.fetch_add(1, Ordering::Relaxed)),
            signal: AbortSignal::new(),
            inner: Mutex::new(TxnInner {
                undo: Vec::new(),
                savepoints: Vec::new(),
                participants: Vec::new(),
            }),
            undoing: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Request asynchronous cancellation. The next blocking page operation
    /// under this transaction raises `Aborted`.
    pub fn abort(&self) {
        info!("{} abort requested", self.id);
        self.signal.set();
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_set()
    }

    pub fn add_participant(&self, participant: Arc<dyn TxnParticipant>) {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .participants
            .iter()
            .any(|p| p.owner_id() == participant.owner_id())
        {
            return;
        }
        inner.participants.push(participant);
    }

    pub fn record_undo(&self, record: UndoRecord) {
        if self.undoing.load(Ordering::Acquire) {
            return;
        }
        self.inner.lock().unwrap().undo.push(record);
    }

    pub fn create_savepoint(&self) -> SavepointId {
        let mut inner = self.inner.lock().unwrap();
        let sp = SavepointId(inner.undo.len());
        inner.savepoints.push(sp.0);
        debug!("{} savepoint at undo position {}", self.id, sp.0);
        sp
    }

    /// Merge the savepoint into its parent scope; the undo records stay
    /// live for an outer rollback.
    pub fn commit_savepoint(&self, sp: SavepointId) {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner
            .savepoints
            .iter()
            .rposition(|&s| s == sp.0)
            .expect("commit of unknown savepoint");
        inner.savepoints.remove(pos);
    }

    /// Roll the transaction back to the given savepoint: every mutation
    /// recorded after it is inverted, newest first. On success the
    /// savepoint stays valid and may be rolled back to again.
    pub fn rollback(&self, sp: &mut SavepointId) -> TreeResult<()> {
        let (tail, participants) = {
            let mut inner = self.inner.lock().unwrap();
            assert!(sp.0 <= inner.undo.len(), "savepoint beyond undo log");
            let tail: Vec<UndoRecord> = inner.undo.drain(sp.0..).collect();
            (tail, inner.participants.clone())
        };

        info!(
            "{} rollback to savepoint {}, {} records",
            self.id,
            sp.0,
            tail.len()
        );

        self.undoing.store(true, Ordering::Release);
        let result = (|| {
            for record in tail.iter().rev() {
                let participant = participants
                    .iter()
                    .find(|p| p.owner_id() == record.owner)
                    .expect("undo record without participant");
                participant.apply_undo(self, &record.op)?;
            }
            Ok(())
        })();
        self.undoing.store(false, Ordering::Release);
        result
    }

    /// Finish the transaction; the undo log is discarded.
    pub fn commit(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.undo.clear();
        inner.savepoints.clear();
        inner.participants.clear();
        debug!("{} committed", self.id);
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
