// In-memory transaction manager
// Backs the standalone server and tests with a committed log and id/token tables held in memory

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tandem_common::{BASE_TX_CHECKSUM, BASE_TX_ID, StoreId};
use tracing::{debug, trace};

use crate::model::{
    CommittedTransaction, IdAllocation, IdType, PreparedTransaction, StoreCopy, TokenKind,
};
use crate::spi::{MasterSpi, TxError, TxHandle};

/// Ids handed out per `allocate_ids` call
pub const ID_GRAB_SIZE: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TxRecord {
    resumed: bool,
}

#[derive(Default)]
struct TokenTable {
    next_id: AtomicI32,
    ids: DashMap<String, i32>,
}

/// Master SPI keeping all state in memory
pub struct MemoryMasterSpi {
    server_id: i32,
    store_id: StoreId,
    accessible: AtomicBool,
    fail_applies: AtomicBool,
    next_handle: AtomicU64,
    transactions: DashMap<TxHandle, TxRecord>,
    /// Outcome of every finished transaction, in finish order
    finished: RwLock<Vec<(TxHandle, bool)>>,
    log: RwLock<Vec<CommittedTransaction>>,
    replica_positions: DashMap<i32, i64>,
    high_ids: DashMap<IdType, i64>,
    tokens: DashMap<TokenKind, Arc<TokenTable>>,
}

impl MemoryMasterSpi {
    pub fn new(server_id: i32, store_id: StoreId) -> Self {
        Self {
            server_id,
            store_id,
            accessible: AtomicBool::new(true),
            fail_applies: AtomicBool::new(false),
            next_handle: AtomicU64::new(0),
            transactions: DashMap::new(),
            finished: RwLock::new(Vec::new()),
            log: RwLock::new(vec![CommittedTransaction {
                tx_id: BASE_TX_ID,
                checksum: BASE_TX_CHECKSUM,
                master_id: server_id,
                commands: Vec::new(),
            }]),
            replica_positions: DashMap::new(),
            high_ids: DashMap::new(),
            tokens: DashMap::new(),
        }
    }

    pub fn set_accessible(&self, accessible: bool) {
        self.accessible.store(accessible, Ordering::Release);
    }

    /// Make every later `apply_prepared_transaction` fail
    pub fn set_fail_applies(&self, fail: bool) {
        self.fail_applies.store(fail, Ordering::Release);
    }

    /// Handles of transactions begun and not yet finished
    pub fn live_transactions(&self) -> Vec<TxHandle> {
        let mut handles: Vec<TxHandle> = self.transactions.iter().map(|e| *e.key()).collect();
        handles.sort_unstable();
        handles
    }

    pub fn is_resumed(&self, handle: TxHandle) -> bool {
        self.transactions
            .get(&handle)
            .is_some_and(|record| record.resumed)
    }

    pub fn finished(&self) -> Vec<(TxHandle, bool)> {
        self.finished.read().clone()
    }

    pub fn replica_position(&self, machine_id: i32) -> Option<i64> {
        self.replica_positions.get(&machine_id).map(|v| *v)
    }

    fn set_resumed(&self, handle: TxHandle, resumed: bool) -> Result<(), TxError> {
        let mut record = self
            .transactions
            .get_mut(&handle)
            .ok_or(TxError::Unknown(handle))?;

        if record.resumed == resumed {
            return Err(TxError::Failed {
                handle,
                message: if resumed {
                    "already resumed".to_string()
                } else {
                    "not resumed".to_string()
                },
            });
        }

        record.resumed = resumed;
        Ok(())
    }
}

fn checksum(previous: i64, tx_id: i64, commands: &[u8]) -> i64 {
    commands
        .iter()
        .fold(previous.wrapping_mul(31).wrapping_add(tx_id), |acc, b| {
            acc.wrapping_mul(31).wrapping_add(i64::from(*b))
        })
}

#[async_trait]
impl MasterSpi for MemoryMasterSpi {
    fn server_id(&self) -> i32 {
        self.server_id
    }

    fn store_id(&self) -> StoreId {
        self.store_id
    }

    fn is_accessible(&self) -> bool {
        self.accessible.load(Ordering::Acquire)
    }

    async fn begin_transaction(&self) -> anyhow::Result<TxHandle> {
        if !self.is_accessible() {
            anyhow::bail!("store is not accessible");
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        self.transactions.insert(handle, TxRecord { resumed: true });
        trace!(handle, "Began transaction");
        Ok(handle)
    }

    fn suspend_transaction(&self, handle: TxHandle) -> Result<(), TxError> {
        self.set_resumed(handle, false)
    }

    fn resume_transaction(&self, handle: TxHandle) -> Result<(), TxError> {
        self.set_resumed(handle, true)
    }

    async fn finish_transaction(&self, handle: TxHandle, success: bool) -> Result<(), TxError> {
        // Check and remove under one shard lock
        let removed = self
            .transactions
            .remove_if(&handle, |_, record| !record.resumed);

        if removed.is_none() {
            return Err(if self.transactions.contains_key(&handle) {
                TxError::Active(handle)
            } else {
                TxError::Unknown(handle)
            });
        }

        self.finished.write().push((handle, success));
        debug!(handle, success, "Finished transaction");
        Ok(())
    }

    async fn apply_prepared_transaction(
        &self,
        transaction: PreparedTransaction,
    ) -> anyhow::Result<i64> {
        if self.fail_applies.load(Ordering::Acquire) {
            anyhow::bail!("failed to apply prepared transaction");
        }

        let mut log = self.log.write();
        let (previous_id, previous_checksum) = log
            .last()
            .map(|tx| (tx.tx_id, tx.checksum))
            .unwrap_or((BASE_TX_ID, BASE_TX_CHECKSUM));
        let tx_id = previous_id + 1;
        let checksum = checksum(previous_checksum, tx_id, &transaction.commands);
        log.push(CommittedTransaction {
            tx_id,
            checksum,
            master_id: self.server_id,
            commands: transaction.commands,
        });

        debug!(tx_id, "Applied prepared transaction");
        Ok(tx_id)
    }

    fn transaction_checksum(&self, tx_id: i64) -> anyhow::Result<i64> {
        self.log
            .read()
            .iter()
            .find(|tx| tx.tx_id == tx_id)
            .map(|tx| tx.checksum)
            .ok_or_else(|| anyhow::anyhow!("no committed transaction with id {}", tx_id))
    }

    fn last_committed_tx_id(&self) -> i64 {
        self.log
            .read()
            .last()
            .map(|tx| tx.tx_id)
            .unwrap_or(BASE_TX_ID)
    }

    async fn push_transaction(&self, machine_id: i32, tx_id: i64) -> anyhow::Result<()> {
        if tx_id > self.last_committed_tx_id() {
            anyhow::bail!("transaction {} has not been committed", tx_id);
        }
        self.replica_positions
            .entry(machine_id)
            .and_modify(|position| *position = (*position).max(tx_id))
            .or_insert(tx_id);
        Ok(())
    }

    async fn committed_transactions(
        &self,
        from: i64,
        to: i64,
    ) -> anyhow::Result<Vec<CommittedTransaction>> {
        Ok(self
            .log
            .read()
            .iter()
            .filter(|tx| tx.tx_id >= from && tx.tx_id <= to)
            .cloned()
            .collect())
    }

    async fn copy_store(&self) -> anyhow::Result<StoreCopy> {
        let log = self.log.read();
        let (last_committed_tx_id, checksum) = log
            .last()
            .map(|tx| (tx.tx_id, tx.checksum))
            .unwrap_or((BASE_TX_ID, BASE_TX_CHECKSUM));
        Ok(StoreCopy {
            store_id: self.store_id,
            last_committed_tx_id,
            checksum,
        })
    }

    fn allocate_ids(&self, id_type: IdType) -> anyhow::Result<IdAllocation> {
        let mut high_id = self.high_ids.entry(id_type).or_insert(0);
        let start = *high_id;
        *high_id = start
            .checked_add(ID_GRAB_SIZE)
            .ok_or_else(|| anyhow::anyhow!("{} ids exhausted", id_type))?;

        Ok(IdAllocation {
            id_type,
            start,
            size: ID_GRAB_SIZE,
            high_id: *high_id,
        })
    }

    fn create_token(&self, kind: TokenKind, name: &str) -> anyhow::Result<i32> {
        if name.is_empty() {
            anyhow::bail!("token name must not be empty");
        }

        let table = self.tokens.entry(kind).or_default().clone();
        let id = *table
            .ids
            .entry(name.to_string())
            .or_insert_with(|| table.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(id)
    }
}
