//! Lock manager contracts
//!
//! The master never owns lock state; it only hands out and retires clients.
//! Everything below is the surface it needs from a lock manager.

use std::sync::Arc;

use async_trait::async_trait;
use tandem_common::ErrorCategory;

use crate::model::LockableResource;

/// Lock acquisition failures
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("illegal resource: {0}")]
    IllegalResource(String),

    #[error("lock client {0} was stopped while waiting")]
    Stopped(u64),

    #[error("lock client {0} is closed")]
    Closed(u64),

    #[error("lock manager failure: {0}")]
    Internal(String),
}

impl LockError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LockError::Deadlock(_) | LockError::IllegalResource(_) => ErrorCategory::Contention,
            LockError::Stopped(_) | LockError::Closed(_) | LockError::Internal(_) => {
                ErrorCategory::Infrastructure
            }
        }
    }
}

/// One participant's handle onto the lock manager
#[async_trait]
pub trait LockClient: Send + Sync {
    fn client_id(&self) -> u64;

    /// Acquire a shared lock, waiting while a conflicting lock is held
    async fn acquire_shared(&self, resource: &LockableResource) -> Result<(), LockError>;

    /// Acquire an exclusive lock, waiting while a conflicting lock is held
    async fn acquire_exclusive(&self, resource: &LockableResource) -> Result<(), LockError>;

    /// Abort pending acquisitions. Held locks are kept.
    fn stop(&self);

    /// Release every held lock and retire the client
    fn close(&self);
}

/// Factory of lock clients
pub trait LockManager: Send + Sync {
    fn new_client(&self) -> Arc<dyn LockClient>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_error_category() {
        assert_eq!(
            LockError::Deadlock("x".into()).category(),
            ErrorCategory::Contention
        );
        assert_eq!(
            LockError::IllegalResource("x".into()).category(),
            ErrorCategory::Contention
        );
        assert_eq!(LockError::Stopped(1).category(), ErrorCategory::Infrastructure);
    }
}
