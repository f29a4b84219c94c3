use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

use crate::{error::TreeError, transaction::AbortSignal, types::TreeResult};

/// Short-term mutex on a buffer-pool frame, distinct from a transactional
/// key lock. Re-entrant acquisition by the same holder is not supported and
/// not detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct LatchState {
    n_shared: u32,
    exclusive: bool,
}

pub struct PageLatch {
    state: Mutex<LatchState>,
    available: Condvar,
}

impl PageLatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::default()),
            available: Condvar::new(),
        }
    }

    /// Block until the latch is granted in the requested mode. The abort
    /// signal is re-checked on every wakeup so a cancelled operation never
    /// stays parked here.
    pub fn acquire(&self, mode: LockMode, signal: &AbortSignal) -> TreeResult<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            if signal.is_set() {
                return Err(TreeError::aborted());
            }

            let grantable = match mode {
                LockMode::Shared => !state.exclusive,
                LockMode::Exclusive => !state.exclusive && state.n_shared == 0,
            };
            if grantable {
                match mode {
                    LockMode::Shared => state.n_shared += 1,
                    LockMode::Exclusive => state.exclusive = true,
                }
                return Ok(());
            }

            let (guard, _) = self
                .available
                .wait_timeout(state, Duration::from_millis(10))
                .unwrap();
            state = guard;
        }
    }

    /// Non-blocking SHARED -> EXCLUSIVE conversion. Fails immediately when
    /// any other holder is present.
    pub fn try_upgrade(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.n_shared == 1 && !state.exclusive {
            state.n_shared = 0;
            state.exclusive = true;
            true
        } else {
            false
        }
    }

    pub fn release(&self, mode: LockMode) {
        let mut state = self.state.lock().unwrap();
        match mode {
            LockMode::Shared => {
                assert!(state.n_shared > 0, "shared release without holder");
                state.n_shared -= 1;
            }
            LockMode::Exclusive => {
                assert!(state.exclusive, "exclusive release without holder");
                state.exclusive = false;
            }
        }
        drop(state);
        self.available.notify_all();
    }
}
