//! Tandem Server - standalone replication master
//!
//! This crate provides:
//! - Layered configuration (file, environment, command line)
//! - Logging and Prometheus metrics initialization
//! - Graceful shutdown on Ctrl+C / SIGTERM
//! - Wiring of the master endpoint with in-memory collaborators

pub mod metrics;
pub mod model;
pub mod startup;
