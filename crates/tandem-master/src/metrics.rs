// Metrics for the master endpoint
// Counter and gauge names plus their descriptions

use metrics::{counter, describe_counter, describe_gauge};
use tandem_core::conversation::{CONVERSATIONS_ACTIVE, CONVERSATIONS_REAPED_TOTAL};

pub const MASTER_REQUESTS_TOTAL: &str = "master_requests_total";
pub const MASTER_REQUEST_ERRORS_TOTAL: &str = "master_request_errors_total";
pub const MASTER_FENCED_REQUESTS_TOTAL: &str = "master_fenced_requests_total";
pub const MASTER_CONCURRENT_REJECTIONS_TOTAL: &str = "master_concurrent_rejections_total";
pub const MASTER_TRANSACTIONS_STARTED_TOTAL: &str = "master_transactions_started_total";
pub const MASTER_TRANSACTIONS_FINISHED_TOTAL: &str = "master_transactions_finished_total";
pub const MASTER_TRANSACTIONS_REAPED_TOTAL: &str = "master_transactions_reaped_total";
pub const MASTER_TRANSACTIONS_ACTIVE: &str = "master_transactions_active";
pub const MASTER_LOCK_RESULTS_TOTAL: &str = "master_lock_results_total";

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    // Requests
    describe_counter!(MASTER_REQUESTS_TOTAL, "Total number of replica requests");
    describe_counter!(
        MASTER_REQUEST_ERRORS_TOTAL,
        "Total number of replica requests that failed"
    );
    describe_counter!(
        MASTER_FENCED_REQUESTS_TOTAL,
        "Total number of requests rejected for carrying a stale epoch"
    );
    describe_counter!(
        MASTER_CONCURRENT_REJECTIONS_TOTAL,
        "Total number of requests rejected because their context was already in flight"
    );

    // Transactions
    describe_counter!(
        MASTER_TRANSACTIONS_STARTED_TOTAL,
        "Total number of master transactions started"
    );
    describe_counter!(
        MASTER_TRANSACTIONS_FINISHED_TOTAL,
        "Total number of master transactions finished by replicas"
    );
    describe_counter!(
        MASTER_TRANSACTIONS_REAPED_TOTAL,
        "Total number of stale master transactions rolled back by the reaper"
    );
    describe_gauge!(
        MASTER_TRANSACTIONS_ACTIVE,
        "Current number of live master transactions"
    );

    // Locks
    describe_counter!(
        MASTER_LOCK_RESULTS_TOTAL,
        "Total number of lock calls by result status"
    );

    // Conversations
    describe_counter!(
        CONVERSATIONS_REAPED_TOTAL,
        "Total number of idle conversations closed by the sweep"
    );
    describe_gauge!(CONVERSATIONS_ACTIVE, "Current number of live conversations");

    tracing::info!("Metrics initialized");
}

/// Record a dispatched replica request
pub fn record_request(operation: &'static str, success: bool) {
    counter!(MASTER_REQUESTS_TOTAL, "operation" => operation).increment(1);
    if !success {
        counter!(MASTER_REQUEST_ERRORS_TOTAL, "operation" => operation).increment(1);
    }
}
