//! Master endpoint
//!
//! `MasterImpl` serves every replica operation. Transactional calls are
//! fenced by epoch, bracketed by the replica's conversation, and run with
//! the replica's transaction resumed only for the duration of the call.
//! Transactions whose replica stopped talking are rolled back by a
//! fixed-delay reaper.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tandem_common::{BASE_TX_ID, Clock, Epoch, RequestContext, StoreId, duration_millis};
use tandem_core::{ConversationManager, HaSettings, JobHandle, JobScheduler};
use tandem_lock::{LockError, LockGrabber, LockResult, LockStatus, LockableResource};
use tracing::{debug, info, warn};

use crate::error::MasterError;
use crate::metrics::{
    MASTER_FENCED_REQUESTS_TOTAL, MASTER_LOCK_RESULTS_TOTAL, MASTER_TRANSACTIONS_ACTIVE,
    MASTER_TRANSACTIONS_FINISHED_TOTAL, MASTER_TRANSACTIONS_REAPED_TOTAL,
    MASTER_TRANSACTIONS_STARTED_TOTAL,
};
use crate::model::{
    CommittedTransaction, HandshakeResult, IdAllocation, IdType, PreparedTransaction, Response,
    StoreCopy, TokenKind,
};
use crate::spi::{MasterSpi, TxError};
use crate::transaction::{MasterTransaction, TransactionState};

/// Suspends a resumed transaction when dropped, including when the call
/// future is cancelled mid-await
struct SuspendGuard {
    transaction: Arc<MasterTransaction>,
    spi: Arc<dyn MasterSpi>,
    clock: Arc<dyn Clock>,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        if !self.transaction.suspend(self.clock.now_millis()) {
            return;
        }
        if let Err(e) = self.spi.suspend_transaction(self.transaction.handle()) {
            debug!(
                handle = self.transaction.handle(),
                error = %e,
                "Failed to suspend transaction"
            );
        }
    }
}

pub struct MasterImpl {
    spi: Arc<dyn MasterSpi>,
    conversations: Arc<ConversationManager>,
    scheduler: Arc<dyn JobScheduler>,
    settings: HaSettings,
    clock: Arc<dyn Clock>,
    transactions: DashMap<RequestContext, Arc<MasterTransaction>>,
    epoch: RwLock<Option<Epoch>>,
    reaper_job: Mutex<Option<JobHandle>>,
}

impl MasterImpl {
    pub fn new(
        spi: Arc<dyn MasterSpi>,
        conversations: Arc<ConversationManager>,
        scheduler: Arc<dyn JobScheduler>,
        settings: HaSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            spi,
            conversations,
            scheduler,
            settings,
            clock,
            transactions: DashMap::new(),
            epoch: RwLock::new(None),
            reaper_job: Mutex::new(None),
        }
    }

    /// Generate a new epoch, start the conversation manager and schedule the reaper
    pub fn start(self: &Arc<Self>) -> Result<Epoch, MasterError> {
        let mut current = self.epoch.write();
        if let Some(epoch) = *current {
            return Ok(epoch);
        }

        let epoch = Epoch::for_server(self.spi.server_id(), self.clock.now_millis())?;
        self.conversations.start();

        let master: Weak<Self> = Arc::downgrade(self);
        let job = self.scheduler.schedule_with_fixed_delay(
            "transaction-reaper",
            self.settings.transaction_reap_interval(),
            Box::new(move || {
                let master = master.clone();
                async move {
                    if let Some(master) = master.upgrade() {
                        master.reap_stale_transactions().await;
                    }
                }
                .boxed()
            }),
        );
        *self.reaper_job.lock() = Some(job);
        *current = Some(epoch);

        info!(
            epoch = %epoch,
            server_id = epoch.server_id(),
            "Master started"
        );
        Ok(epoch)
    }

    /// Cancel the reaper, stop the conversation manager and roll back every live transaction
    pub async fn stop(&self) {
        if self.epoch.write().take().is_none() {
            return;
        }
        if let Some(job) = self.reaper_job.lock().take() {
            job.cancel();
        }
        self.conversations.stop();

        let live: Vec<(RequestContext, Arc<MasterTransaction>)> = self
            .transactions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (context, transaction) in live {
            // A transaction still in use stays flagged for the next reaper pass
            if let Err(e) = transaction.claim_for_finish() {
                debug!(context = %context, error = %e, "Left transaction for the reaper");
                continue;
            }
            self.transactions
                .remove_if(&context, |_, current| Arc::ptr_eq(current, &transaction));
            if let Err(e) = self.spi.finish_transaction(transaction.handle(), false).await {
                warn!(context = %context, error = %e, "Failed to roll back transaction on stop");
            }
        }

        info!("Master stopped");
    }

    pub fn is_running(&self) -> bool {
        self.epoch.read().is_some()
    }

    pub fn epoch(&self) -> Option<Epoch> {
        *self.epoch.read()
    }

    pub fn conversations(&self) -> &Arc<ConversationManager> {
        &self.conversations
    }

    /// Contexts with a live transaction
    pub fn ongoing_transactions(&self) -> Vec<RequestContext> {
        self.transactions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn transaction_state(&self, context: &RequestContext) -> Option<TransactionState> {
        self.transactions.get(context).map(|tx| tx.state())
    }

    /// Flag the transaction of `context` for rollback by the next reaper pass
    pub fn mark_finish_asap(&self, context: &RequestContext) -> bool {
        match self.transactions.get(context) {
            Some(transaction) => {
                transaction.mark_finish_asap();
                true
            }
            None => false,
        }
    }

    fn current_epoch(&self) -> Result<Epoch, MasterError> {
        self.epoch.read().ok_or(MasterError::NotRunning)
    }

    fn assert_correct_epoch(&self, context: &RequestContext) -> Result<(), MasterError> {
        let current = self.current_epoch()?;
        if context.epoch != current.as_i64() {
            counter!(MASTER_FENCED_REQUESTS_TOTAL).increment(1);
            debug!(context = %context, current = %current, "Rejected request with stale epoch");
            return Err(MasterError::InvalidEpoch {
                expected: current.as_i64(),
                actual: context.epoch,
            });
        }
        Ok(())
    }

    fn assert_accessible(&self) -> Result<(), MasterError> {
        if self.spi.is_accessible() {
            Ok(())
        } else {
            Err(MasterError::Unavailable)
        }
    }

    fn respond<T>(&self, value: T) -> Response<T> {
        Response::new(
            value,
            self.spi.store_id(),
            self.spi.last_committed_tx_id(),
        )
    }

    /// Resume the transaction of `context` until the returned guard drops
    fn resume(&self, context: &RequestContext) -> Result<SuspendGuard, MasterError> {
        let transaction = self
            .transactions
            .get(context)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MasterError::TransactionNotPresent(context.to_string()))?;

        transaction.resume()?;
        if let Err(e) = self.spi.resume_transaction(transaction.handle()) {
            transaction.mark_finish_asap();
            transaction.suspend(self.clock.now_millis());
            return Err(e.into());
        }

        Ok(self.suspend_guard(transaction))
    }

    fn suspend_guard(&self, transaction: Arc<MasterTransaction>) -> SuspendGuard {
        SuspendGuard {
            transaction,
            spi: self.spi.clone(),
            clock: self.clock.clone(),
        }
    }

    // ============== Handshake ==============

    /// Verify the replica's store and hand out the current epoch
    pub fn handshake(
        &self,
        last_known_tx_id: i64,
        store_id: StoreId,
    ) -> Result<Response<HandshakeResult>, MasterError> {
        let epoch = self.current_epoch()?;
        let master_store = self.spi.store_id();
        if store_id != master_store {
            return Err(MasterError::StoreIdMismatch {
                expected: master_store,
                actual: store_id,
            });
        }

        let checksum = self
            .spi
            .transaction_checksum(last_known_tx_id)
            .map_err(MasterError::Spi)?;

        Ok(self.respond(HandshakeResult {
            master_id: self.spi.server_id(),
            checksum,
            epoch: epoch.as_i64(),
        }))
    }

    // ============== Transactions ==============

    /// Begin a transaction and a conversation for `context`
    pub async fn initialize_tx(
        &self,
        context: &RequestContext,
    ) -> Result<Response<()>, MasterError> {
        self.assert_correct_epoch(context)?;
        self.assert_accessible()?;
        self.conversations.begin(context)?;

        match self.begin_transaction(context).await {
            Ok(()) => {
                self.conversations.release(context)?;
                Ok(self.respond(()))
            }
            Err(e) => {
                if let Err(end) = self.conversations.end(context) {
                    debug!(context = %context, error = %end, "Failed to end conversation");
                }
                Err(e)
            }
        }
    }

    async fn begin_transaction(&self, context: &RequestContext) -> Result<(), MasterError> {
        let handle = self.spi.begin_transaction().await.map_err(MasterError::Spi)?;
        let transaction = Arc::new(MasterTransaction::new(handle));

        let inserted = match self.transactions.entry(context.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(transaction.clone());
                true
            }
        };

        // Detach from this task right away
        let suspend = self.suspend_guard(transaction);

        if !inserted {
            drop(suspend);
            if let Err(e) = self.spi.finish_transaction(handle, false).await {
                debug!(handle, error = %e, "Failed to roll back duplicate transaction");
            }
            return Err(MasterError::ConcurrentAccess(format!(
                "{} already has a transaction",
                context
            )));
        }

        counter!(MASTER_TRANSACTIONS_STARTED_TOTAL).increment(1);
        debug!(context = %context, handle, "Initialized transaction");
        Ok(())
    }

    /// Finish the transaction of `context` and end its conversation
    ///
    /// The transaction is removed whether the commit or rollback succeeds.
    /// A transaction resumed by another call is refused with
    /// `ConcurrentAccess` and left flagged for the reaper; ending the
    /// conversation aborts that call's lock waits.
    pub async fn finish_transaction(
        &self,
        context: &RequestContext,
        success: bool,
    ) -> Result<Response<()>, MasterError> {
        self.assert_correct_epoch(context)?;

        let result = self.finish(context, success).await;

        match self.conversations.end(context) {
            Ok(()) => {}
            Err(e) if e.is_no_such_entry() => {}
            Err(e) => debug!(context = %context, error = %e, "Failed to end conversation"),
        }

        result.map(|()| self.respond(()))
    }

    async fn finish(&self, context: &RequestContext, success: bool) -> Result<(), MasterError> {
        let transaction = self
            .transactions
            .get(context)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MasterError::TransactionNotPresent(context.to_string()))?;

        transaction.claim_for_finish()?;
        self.transactions
            .remove_if(context, |_, current| Arc::ptr_eq(current, &transaction));

        self.spi
            .finish_transaction(transaction.handle(), success)
            .await?;

        let outcome = if success { "commit" } else { "rollback" };
        counter!(MASTER_TRANSACTIONS_FINISHED_TOTAL, "outcome" => outcome).increment(1);
        debug!(context = %context, outcome, "Finished transaction");
        Ok(())
    }

    /// Apply a replica-prepared transaction
    pub async fn commit_single_resource_transaction(
        &self,
        context: &RequestContext,
        prepared: PreparedTransaction,
    ) -> Result<Response<i64>, MasterError> {
        self.assert_correct_epoch(context)?;
        self.assert_accessible()?;

        let _suspend = if self.transactions.contains_key(context) {
            Some(self.resume(context)?)
        } else {
            None
        };

        let tx_id = self
            .spi
            .apply_prepared_transaction(prepared)
            .await
            .map_err(MasterError::Spi)?;

        debug!(context = %context, tx_id, "Committed transaction");
        Ok(self.respond(tx_id))
    }

    // ============== Locks ==============

    /// Grab every resource in order with `grabber`
    ///
    /// Deadlocks and illegal resources are reported in the result. Any other
    /// lock failure flags the transaction for rollback and is returned.
    pub async fn acquire_lock(
        &self,
        context: &RequestContext,
        grabber: LockGrabber,
        resources: &[LockableResource],
    ) -> Result<Response<LockResult>, MasterError> {
        self.assert_correct_epoch(context)?;
        if !self.transactions.contains_key(context) {
            return Err(MasterError::TransactionNotPresent(context.to_string()));
        }

        let conversation = self.conversations.acquire_guarded(context)?;
        let suspend = self.resume(context)?;

        let client = conversation.locks().ok_or_else(|| {
            MasterError::NoSuchEntry(format!("{} has no open conversation", context))
        })?;

        let mut result = LockResult::locked();
        for resource in resources {
            match grabber.grab(client.as_ref(), resource).await {
                Ok(()) => {}
                Err(LockError::Deadlock(message)) => {
                    result = LockResult::dead_locked(message);
                    break;
                }
                Err(LockError::IllegalResource(message)) => {
                    result = LockResult::not_locked(message);
                    break;
                }
                Err(e) => {
                    suspend.transaction.mark_finish_asap();
                    warn!(context = %context, error = %e, "Lock grab failed");
                    return Err(e.into());
                }
            }
        }

        let status = match result.status {
            LockStatus::OkLocked => "ok_locked",
            LockStatus::NotLocked => "not_locked",
            LockStatus::DeadLocked => "dead_locked",
        };
        counter!(MASTER_LOCK_RESULTS_TOTAL, "status" => status).increment(1);

        Ok(self.respond(result))
    }

    pub async fn acquire_read_lock(
        &self,
        context: &RequestContext,
        resources: &[LockableResource],
    ) -> Result<Response<LockResult>, MasterError> {
        self.acquire_lock(context, LockGrabber::Read, resources).await
    }

    pub async fn acquire_write_lock(
        &self,
        context: &RequestContext,
        resources: &[LockableResource],
    ) -> Result<Response<LockResult>, MasterError> {
        self.acquire_lock(context, LockGrabber::Write, resources).await
    }

    // ============== Replication ==============

    pub async fn push_transaction(
        &self,
        context: &RequestContext,
        tx_id: i64,
    ) -> Result<Response<()>, MasterError> {
        self.assert_correct_epoch(context)?;
        self.spi
            .push_transaction(context.machine_id, tx_id)
            .await
            .map_err(MasterError::Spi)?;
        Ok(self.respond(()))
    }

    /// Committed transactions the replica has not applied yet
    pub async fn pull_updates(
        &self,
        context: &RequestContext,
    ) -> Result<Response<Vec<CommittedTransaction>>, MasterError> {
        let from = context.last_applied_tx_id().unwrap_or(BASE_TX_ID) + 1;
        let to = self.spi.last_committed_tx_id();
        let transactions = if from > to {
            Vec::new()
        } else {
            self.spi
                .committed_transactions(from, to)
                .await
                .map_err(MasterError::Spi)?
        };
        Ok(self.respond(transactions))
    }

    pub async fn copy_store(
        &self,
        context: &RequestContext,
    ) -> Result<Response<StoreCopy>, MasterError> {
        let copy = self.spi.copy_store().await.map_err(MasterError::Spi)?;
        debug!(context = %context, tx_id = copy.last_committed_tx_id, "Copied store");
        Ok(self.respond(copy))
    }

    /// Committed transactions with ids in `[start, end]`
    pub async fn copy_transactions(
        &self,
        context: &RequestContext,
        start: i64,
        end: i64,
    ) -> Result<Response<Vec<CommittedTransaction>>, MasterError> {
        let transactions = if start > end {
            Vec::new()
        } else {
            self.spi
                .committed_transactions(start, end)
                .await
                .map_err(MasterError::Spi)?
        };
        debug!(context = %context, start, end, count = transactions.len(), "Copied transactions");
        Ok(self.respond(transactions))
    }

    // ============== Ids and tokens ==============

    pub fn allocate_ids(
        &self,
        context: &RequestContext,
        id_type: IdType,
    ) -> Result<Response<IdAllocation>, MasterError> {
        self.assert_correct_epoch(context)?;
        let allocation = self.spi.allocate_ids(id_type).map_err(MasterError::Spi)?;
        Ok(self.respond(allocation))
    }

    pub fn create_relationship_type(
        &self,
        context: &RequestContext,
        name: &str,
    ) -> Result<Response<i32>, MasterError> {
        self.create_token(context, TokenKind::RelationshipType, name)
    }

    pub fn create_property_key(
        &self,
        context: &RequestContext,
        name: &str,
    ) -> Result<Response<i32>, MasterError> {
        self.create_token(context, TokenKind::PropertyKey, name)
    }

    pub fn create_label(
        &self,
        context: &RequestContext,
        name: &str,
    ) -> Result<Response<i32>, MasterError> {
        self.create_token(context, TokenKind::Label, name)
    }

    fn create_token(
        &self,
        context: &RequestContext,
        kind: TokenKind,
        name: &str,
    ) -> Result<Response<i32>, MasterError> {
        self.assert_correct_epoch(context)?;
        let id = self.spi.create_token(kind, name).map_err(MasterError::Spi)?;
        Ok(self.respond(id))
    }

    // ============== Reaper ==============

    /// Roll back every transaction suspended for longer than the transaction
    /// timeout, or flagged finish-asap, and return how many were reaped
    pub async fn reap_stale_transactions(&self) -> usize {
        let now = self.clock.now_millis();
        let threshold = duration_millis(self.settings.transaction_timeout());

        let snapshot: Vec<(RequestContext, Arc<MasterTransaction>)> = self
            .transactions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut reaped = 0;
        for (context, transaction) in snapshot {
            // Refused claims are transactions in use or already finishing
            if !transaction.claim_for_reap(now, threshold) {
                continue;
            }

            self.transactions
                .remove_if(&context, |_, current| Arc::ptr_eq(current, &transaction));

            match self
                .spi
                .finish_transaction(transaction.handle(), false)
                .await
            {
                Ok(()) => {}
                Err(TxError::Active(handle)) => {
                    debug!(context = %context, handle, "Transaction became active while reaping");
                }
                Err(e) => {
                    warn!(context = %context, error = %e, "Failed to roll back stale transaction");
                }
            }

            match self.conversations.end(&context) {
                Ok(()) => {}
                Err(e) if e.is_no_such_entry() => {}
                Err(e) => debug!(context = %context, error = %e, "Failed to end conversation"),
            }

            counter!(MASTER_TRANSACTIONS_REAPED_TOTAL).increment(1);
            info!(
                context = %context,
                finish_asap = transaction.finish_asap(),
                "Rolled back stale transaction"
            );
            reaped += 1;
        }

        gauge!(MASTER_TRANSACTIONS_ACTIVE).set(self.transactions.len() as f64);
        reaped
    }
}
