//! Request dispatch
//!
//! `MasterServer` sits between the transport and `MasterImpl`. It admits at
//! most one in-flight call per request context, rolls back a context's
//! transaction after an infrastructure failure, and cleans up after a
//! replica disconnects.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashSet;
use metrics::counter;
use tandem_common::{RequestContext, StoreId};
use tandem_lock::{LockResult, LockableResource};
use tracing::debug;

use crate::error::MasterError;
use crate::master::MasterImpl;
use crate::metrics::{MASTER_CONCURRENT_REJECTIONS_TOTAL, record_request};
use crate::model::{
    CommittedTransaction, HandshakeResult, IdAllocation, IdType, PreparedTransaction, Response,
    StoreCopy,
};
use crate::transaction::TransactionState;

/// Clears a context's in-flight mark when the call completes or is dropped
struct InFlight<'a> {
    in_flight: &'a DashSet<RequestContext>,
    context: RequestContext,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.context);
    }
}

pub struct MasterServer {
    master: Arc<MasterImpl>,
    in_flight: DashSet<RequestContext>,
}

impl MasterServer {
    pub fn new(master: Arc<MasterImpl>) -> Self {
        Self {
            master,
            in_flight: DashSet::new(),
        }
    }

    pub fn master(&self) -> &Arc<MasterImpl> {
        &self.master
    }

    /// Whether a call for `context` is currently being served
    pub fn is_in_flight(&self, context: &RequestContext) -> bool {
        self.in_flight.contains(context)
    }

    fn enter(&self, context: &RequestContext) -> Result<InFlight<'_>, MasterError> {
        if !self.in_flight.insert(context.clone()) {
            counter!(MASTER_CONCURRENT_REJECTIONS_TOTAL).increment(1);
            return Err(MasterError::ConcurrentAccess(format!(
                "{} already has a call in flight",
                context
            )));
        }
        Ok(InFlight {
            in_flight: &self.in_flight,
            context: context.clone(),
        })
    }

    /// Run a transactional call with in-flight exclusion and rollback on infrastructure failure
    async fn dispatch<T, F, Fut>(
        &self,
        operation: &'static str,
        context: &RequestContext,
        call: F,
    ) -> Result<T, MasterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, MasterError>>,
    {
        let _in_flight = self.enter(context)?;
        let result = call().await;
        record_request(operation, result.is_ok());

        if let Err(e) = &result
            && e.category().triggers_rollback()
        {
            debug!(context = %context, operation, error = %e, "Rolling back after failure");
            self.rollback(context).await;
        }

        result
    }

    async fn rollback(&self, context: &RequestContext) {
        if let Err(e) = self.master.finish_transaction(context, false).await {
            debug!(context = %context, error = %e, "Best-effort rollback failed");
        }
    }

    /// Clean up after the replica behind `context` disconnected
    ///
    /// Waiting lock grabs are stopped first. A transaction still resumed by
    /// a call is left for that call's failure path or the reaper.
    pub async fn channel_closed(&self, context: &RequestContext) {
        if let Err(e) = self.master.conversations().stop_conversation(context)
            && !e.is_no_such_entry()
        {
            debug!(context = %context, error = %e, "Failed to stop conversation");
        }

        match self.master.transaction_state(context) {
            None => {}
            Some(TransactionState::Resumed) => {
                self.master.mark_finish_asap(context);
            }
            Some(_) => self.rollback(context).await,
        }
    }

    // ============== Untracked calls ==============

    pub fn handshake(
        &self,
        last_known_tx_id: i64,
        store_id: StoreId,
    ) -> Result<Response<HandshakeResult>, MasterError> {
        let result = self.master.handshake(last_known_tx_id, store_id);
        record_request("handshake", result.is_ok());
        result
    }

    pub async fn pull_updates(
        &self,
        context: &RequestContext,
    ) -> Result<Response<Vec<CommittedTransaction>>, MasterError> {
        let result = self.master.pull_updates(context).await;
        record_request("pull_updates", result.is_ok());
        result
    }

    pub async fn copy_store(
        &self,
        context: &RequestContext,
    ) -> Result<Response<StoreCopy>, MasterError> {
        let result = self.master.copy_store(context).await;
        record_request("copy_store", result.is_ok());
        result
    }

    pub async fn copy_transactions(
        &self,
        context: &RequestContext,
        start: i64,
        end: i64,
    ) -> Result<Response<Vec<CommittedTransaction>>, MasterError> {
        let result = self.master.copy_transactions(context, start, end).await;
        record_request("copy_transactions", result.is_ok());
        result
    }

    // ============== Tracked calls ==============

    pub async fn initialize_tx(
        &self,
        context: &RequestContext,
    ) -> Result<Response<()>, MasterError> {
        self.dispatch("initialize_tx", context, || self.master.initialize_tx(context))
            .await
    }

    pub async fn acquire_read_lock(
        &self,
        context: &RequestContext,
        resources: &[LockableResource],
    ) -> Result<Response<LockResult>, MasterError> {
        self.dispatch("acquire_read_lock", context, || {
            self.master.acquire_read_lock(context, resources)
        })
        .await
    }

    pub async fn acquire_write_lock(
        &self,
        context: &RequestContext,
        resources: &[LockableResource],
    ) -> Result<Response<LockResult>, MasterError> {
        self.dispatch("acquire_write_lock", context, || {
            self.master.acquire_write_lock(context, resources)
        })
        .await
    }

    pub async fn commit_single_resource_transaction(
        &self,
        context: &RequestContext,
        prepared: PreparedTransaction,
    ) -> Result<Response<i64>, MasterError> {
        self.dispatch("commit_single_resource_transaction", context, || {
            self.master.commit_single_resource_transaction(context, prepared)
        })
        .await
    }

    pub async fn finish_transaction(
        &self,
        context: &RequestContext,
        success: bool,
    ) -> Result<Response<()>, MasterError> {
        self.dispatch("finish_transaction", context, || {
            self.master.finish_transaction(context, success)
        })
        .await
    }

    pub async fn push_transaction(
        &self,
        context: &RequestContext,
        tx_id: i64,
    ) -> Result<Response<()>, MasterError> {
        self.dispatch("push_transaction", context, || {
            self.master.push_transaction(context, tx_id)
        })
        .await
    }

    pub async fn allocate_ids(
        &self,
        context: &RequestContext,
        id_type: IdType,
    ) -> Result<Response<IdAllocation>, MasterError> {
        self.dispatch("allocate_ids", context, || async {
            self.master.allocate_ids(context, id_type)
        })
        .await
    }

    pub async fn create_relationship_type(
        &self,
        context: &RequestContext,
        name: &str,
    ) -> Result<Response<i32>, MasterError> {
        self.dispatch("create_relationship_type", context, || async {
            self.master.create_relationship_type(context, name)
        })
        .await
    }

    pub async fn create_property_key(
        &self,
        context: &RequestContext,
        name: &str,
    ) -> Result<Response<i32>, MasterError> {
        self.dispatch("create_property_key", context, || async {
            self.master.create_property_key(context, name)
        })
        .await
    }

    pub async fn create_label(
        &self,
        context: &RequestContext,
        name: &str,
    ) -> Result<Response<i32>, MasterError> {
        self.dispatch("create_label", context, || async {
            self.master.create_label(context, name)
        })
        .await
    }
}
