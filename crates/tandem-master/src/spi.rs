//! Transaction manager SPI
//!
//! Everything the master needs from the storage engine. Transactions are
//! identified by opaque handles; suspend and resume detach a transaction
//! from the task that is driving it so another task can pick it up later.

use async_trait::async_trait;
use tandem_common::StoreId;

use crate::model::{
    CommittedTransaction, IdAllocation, IdType, PreparedTransaction, StoreCopy, TokenKind,
};

/// Opaque handle of a master-side transaction
pub type TxHandle = u64;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    /// The transaction is currently resumed by another task
    #[error("transaction {0} is active on another task")]
    Active(TxHandle),

    #[error("unknown transaction {0}")]
    Unknown(TxHandle),

    #[error("transaction {handle} failed: {message}")]
    Failed { handle: TxHandle, message: String },
}

#[async_trait]
pub trait MasterSpi: Send + Sync {
    /// Cluster member id of this master
    fn server_id(&self) -> i32;

    fn store_id(&self) -> StoreId;

    /// Whether the store currently accepts transactions
    fn is_accessible(&self) -> bool;

    /// Begin a transaction, attached to the calling task
    async fn begin_transaction(&self) -> anyhow::Result<TxHandle>;

    fn suspend_transaction(&self, handle: TxHandle) -> Result<(), TxError>;

    fn resume_transaction(&self, handle: TxHandle) -> Result<(), TxError>;

    /// Commit or roll back a suspended transaction
    async fn finish_transaction(&self, handle: TxHandle, success: bool) -> Result<(), TxError>;

    /// Apply a replica-prepared transaction, returning its tx id
    async fn apply_prepared_transaction(
        &self,
        transaction: PreparedTransaction,
    ) -> anyhow::Result<i64>;

    fn transaction_checksum(&self, tx_id: i64) -> anyhow::Result<i64>;

    fn last_committed_tx_id(&self) -> i64;

    /// Record that `machine_id` has applied everything up to `tx_id`
    async fn push_transaction(&self, machine_id: i32, tx_id: i64) -> anyhow::Result<()>;

    /// Committed transactions with ids in `[from, to]`
    async fn committed_transactions(
        &self,
        from: i64,
        to: i64,
    ) -> anyhow::Result<Vec<CommittedTransaction>>;

    async fn copy_store(&self) -> anyhow::Result<StoreCopy>;

    fn allocate_ids(&self, id_type: IdType) -> anyhow::Result<IdAllocation>;

    /// Id of the token named `name`, creating it if needed
    fn create_token(&self, kind: TokenKind, name: &str) -> anyhow::Result<i32>;
}
