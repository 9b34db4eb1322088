//! Tandem Core - Conversation and background job management
//!
//! This crate provides:
//! - `TimedRepository`, a TTL-bounded keyed store with exclusive creation
//! - Replica conversations bound to lock clients
//! - Conversation lifecycle management with idle reaping
//! - Recurring background job scheduling
//! - Typed HA settings

pub mod conversation;
pub mod repository;
pub mod scheduler;
pub mod settings;

// Re-export commonly used types
pub use conversation::{
    Conversation, ConversationError, ConversationLease, ConversationManager, ConversationSpi,
    DefaultConversationSpi,
};
pub use repository::{Acquired, EntryState, RepositoryError, TimedRepository};
pub use scheduler::{JobFn, JobFuture, JobHandle, JobScheduler, TokioJobScheduler};
pub use settings::HaSettings;
