use std::{error::Error, fmt, io};

use backtrace::Backtrace;

/// Failure categories surfaced by the engine. Anything that is a programmer
/// error (quota imbalance, unlock without lock, a broken sibling chain) is an
/// assertion instead, never a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Asynchronous cancellation observed at a blocking point.
    Aborted,

    /// No scratch frame was available for staging a split.
    ScratchMemExhausted,

    /// The buffer pool or segment could not service a page.
    StorageIo,

    /// Insert with `DupPolicy::Fail` hit an existing key.
    DuplicateKey,

    /// The owner id is not registered in the root map.
    UnknownTree,
}

pub struct TreeError {
    kind: ErrorKind,
    details: String,
    backtrace: Backtrace,
}

impl TreeError {
    pub fn new(kind: ErrorKind, msg: &str) -> TreeError {
        TreeError {
            kind,
            details: msg.to_string(),
            backtrace: Backtrace::new_unresolved(),
        }
    }

    pub fn aborted() -> TreeError {
        Self::new(ErrorKind::Aborted, "execution aborted")
    }

    pub fn scratch_exhausted() -> TreeError {
        Self::new(ErrorKind::ScratchMemExhausted, "scratch memory exhausted")
    }

    pub fn storage_io(msg: &str) -> TreeError {
        Self::new(ErrorKind::StorageIo, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn details(&self) -> &str {
        &self.details
    }
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.details)
    }
}

impl fmt::Debug for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut bt = self.backtrace.clone();
        bt.resolve();
        write!(f, "[{:?}] {}\n{:?}", self.kind, self.details, bt)
    }
}

impl Error for TreeError {}

impl From<io::Error> for TreeError {
    fn from(e: io::Error) -> TreeError {
        TreeError::storage_io(&e.to_string())
    }
}
