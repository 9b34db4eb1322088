//! Tandem Common - Shared types for master-side replication coordination
//!
//! This crate provides the foundational types used across all Tandem components:
//! - Request contexts and epochs carried on every replica call
//! - Clock abstraction so timeouts can be driven deterministically
//! - Error categories shared by every error type
//! - Common constants

pub mod clock;
pub mod context;
pub mod error;
pub mod utils;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{Epoch, EpochError, RequestContext, StoreId, TxMarker};
pub use error::ErrorCategory;
pub use utils::{current_timestamp, duration_millis};

/// Margin added to the lock read timeout before an idle conversation or a
/// suspended transaction is considered abandoned
pub const TIMEOUT_MARGIN_MS: u64 = 5_000;

/// Id of the first transaction in any store
pub const BASE_TX_ID: i64 = 1;

/// Checksum reported for the base transaction
pub const BASE_TX_CHECKSUM: i64 = 0;
