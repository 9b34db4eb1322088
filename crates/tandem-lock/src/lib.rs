//! Tandem Lock - Lock manager contracts used by the master
//!
//! This crate provides:
//! - `LockableResource`, a closed tagged variant for everything a replica can lock
//! - `LockClient` / `LockManager` traits the master consumes
//! - `LockGrabber`, the read/write strategy applied to a batch of resources
//! - `MemoryLockManager`, an in-memory reader/writer lock table with
//!   wait-for-graph deadlock detection

mod grabber;
mod manager;
mod memory;
mod model;

pub use grabber::LockGrabber;
pub use manager::{LockClient, LockError, LockManager};
pub use memory::{MemoryLockClient, MemoryLockManager};
pub use model::*;
