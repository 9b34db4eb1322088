//! Master-side transaction state
//!
//! A `MasterTransaction` is attached to at most one task at a time. Between
//! replica calls it is suspended and records when, so the reaper can roll
//! back transactions whose replica went away.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::MasterError;
use crate::spi::TxHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Attached to a task serving a replica call; never reaped
    Resumed,
    /// Detached between calls
    Suspended { since_millis: u64 },
    /// Claimed by an explicit finish or by the reaper
    Finishing,
}

pub struct MasterTransaction {
    handle: TxHandle,
    state: Mutex<TransactionState>,
    finish_asap: AtomicBool,
}

impl MasterTransaction {
    /// A transaction that was just begun and is still attached to its creator
    pub fn new(handle: TxHandle) -> Self {
        Self {
            handle,
            state: Mutex::new(TransactionState::Resumed),
            finish_asap: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> TxHandle {
        self.handle
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Attach the transaction to the calling task
    pub fn resume(&self) -> Result<(), MasterError> {
        let mut state = self.state.lock();
        match *state {
            TransactionState::Suspended { .. } => {
                *state = TransactionState::Resumed;
                Ok(())
            }
            TransactionState::Resumed => Err(MasterError::ConcurrentAccess(format!(
                "transaction {} is already resumed",
                self.handle
            ))),
            TransactionState::Finishing => Err(MasterError::TransactionNotPresent(format!(
                "transaction {} is finishing",
                self.handle
            ))),
        }
    }

    /// Detach the transaction; returns whether it was resumed
    pub fn suspend(&self, now_millis: u64) -> bool {
        let mut state = self.state.lock();
        if *state != TransactionState::Resumed {
            return false;
        }
        *state = TransactionState::Suspended {
            since_millis: now_millis,
        };
        true
    }

    /// Claim the transaction for an explicit finish
    ///
    /// Only a suspended transaction can be claimed. A resumed one is flagged
    /// finish-asap instead, so the reaper rolls it back once its call
    /// suspends it.
    pub fn claim_for_finish(&self) -> Result<(), MasterError> {
        let mut state = self.state.lock();
        match *state {
            TransactionState::Suspended { .. } => {
                *state = TransactionState::Finishing;
                Ok(())
            }
            TransactionState::Resumed => {
                self.mark_finish_asap();
                Err(MasterError::ConcurrentAccess(format!(
                    "transaction {} is in use by another call",
                    self.handle
                )))
            }
            TransactionState::Finishing => Err(MasterError::TransactionNotPresent(format!(
                "transaction {} is finishing",
                self.handle
            ))),
        }
    }

    /// Claim the transaction for rollback by the reaper
    ///
    /// Succeeds for a suspended transaction older than `threshold_millis`,
    /// or for any suspended transaction marked finish-asap.
    pub fn claim_for_reap(&self, now_millis: u64, threshold_millis: u64) -> bool {
        let mut state = self.state.lock();
        let TransactionState::Suspended { since_millis } = *state else {
            return false;
        };

        if self.finish_asap() || now_millis.saturating_sub(since_millis) >= threshold_millis {
            *state = TransactionState::Finishing;
            return true;
        }
        false
    }

    /// Flag the transaction as left in an indeterminate state
    pub fn mark_finish_asap(&self) {
        self.finish_asap.store(true, Ordering::Release);
    }

    pub fn finish_asap(&self) -> bool {
        self.finish_asap.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MasterTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterTransaction")
            .field("handle", &self.handle)
            .field("state", &self.state())
            .field("finish_asap", &self.finish_asap())
            .finish()
    }
}
