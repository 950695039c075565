//! SurrealDB integration for the job queue system.
//!
//! This crate provides the durable job store: connection and schema setup,
//! the [`JobRepository`](repositories::JobRepository) with its atomic claim
//! protocol, the dead letter queue view, and the settings and worker tables.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `surrealkv`: Embedded persistent storage, pure Rust
//! - `rocksdb`: Use RocksDB for persistent file-based storage
//! - `remote`: Connect to a shared SurrealDB server over WebSocket

mod connection;
mod dlq;
mod schema;
mod time;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, connect};
pub use dlq::{DeadJob, DeadLetterQueue};
pub use schema::init_schema;
