//! Tandem Master - Master-side replication endpoint
//!
//! This crate provides:
//! - `MasterImpl`, the epoch-fenced endpoint serving every replica operation
//! - `MasterTransaction`, the per-replica transaction state machine
//! - The stale-transaction reaper
//! - `MasterServer`, the dispatch layer enforcing one in-flight call per context
//! - `MasterSpi`, the transaction manager contract, and an in-memory implementation

pub mod error;
pub mod master;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod server;
pub mod spi;
pub mod transaction;

// Re-export commonly used types
pub use error::MasterError;
pub use master::MasterImpl;
pub use memory::MemoryMasterSpi;
pub use model::{
    CommittedTransaction, HandshakeResult, IdAllocation, IdType, PreparedTransaction, Response,
    StoreCopy, TokenKind,
};
pub use server::MasterServer;
pub use spi::{MasterSpi, TxError, TxHandle};
pub use transaction::{MasterTransaction, TransactionState};
