// Master error types
// Every failure a replica call can surface, grouped by category

use tandem_common::{EpochError, ErrorCategory, StoreId};
use tandem_core::{ConversationError, RepositoryError};
use tandem_lock::LockError;

use crate::spi::TxError;

#[derive(thiserror::Error, Debug)]
pub enum MasterError {
    #[error("invalid epoch {actual}, current epoch is {expected}; re-handshake required")]
    InvalidEpoch { expected: i64, actual: i64 },

    #[error("transaction not present: {0}")]
    TransactionNotPresent(String),

    #[error("concurrent access: {0}")]
    ConcurrentAccess(String),

    #[error("no such entry: {0}")]
    NoSuchEntry(String),

    #[error("store id mismatch: master has {expected}, replica presented {actual}")]
    StoreIdMismatch { expected: StoreId, actual: StoreId },

    #[error("master is not running")]
    NotRunning,

    #[error("master store is not accessible")]
    Unavailable,

    #[error("invalid server id: {0}")]
    Epoch(#[from] EpochError),

    #[error("lock failure: {0}")]
    Lock(LockError),

    #[error("transaction failure: {0}")]
    Transaction(#[from] TxError),

    #[error("transaction manager failure: {0:#}")]
    Spi(anyhow::Error),
}

impl MasterError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            MasterError::InvalidEpoch { .. } => ErrorCategory::Fencing,
            MasterError::TransactionNotPresent(_)
            | MasterError::ConcurrentAccess(_)
            | MasterError::NoSuchEntry(_)
            | MasterError::StoreIdMismatch { .. }
            | MasterError::NotRunning => ErrorCategory::Protocol,
            MasterError::Lock(e) => e.category(),
            MasterError::Unavailable
            | MasterError::Epoch(_)
            | MasterError::Transaction(_)
            | MasterError::Spi(_) => ErrorCategory::Infrastructure,
        }
    }

    pub fn is_fencing(&self) -> bool {
        self.category() == ErrorCategory::Fencing
    }
}

impl From<ConversationError> for MasterError {
    fn from(e: ConversationError) -> Self {
        match e {
            ConversationError::NotRunning => MasterError::NotRunning,
            ConversationError::Repository(e) => e.into(),
        }
    }
}

impl From<RepositoryError> for MasterError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::ConcurrentAccess(message) => MasterError::ConcurrentAccess(message),
            RepositoryError::NoSuchEntry(message) => MasterError::NoSuchEntry(message),
        }
    }
}

impl From<LockError> for MasterError {
    fn from(e: LockError) -> Self {
        MasterError::Lock(e)
    }
}
