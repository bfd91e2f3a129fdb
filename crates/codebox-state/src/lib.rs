//! codebox-state: SurrealDB backend for codebox
//!
//! This crate is the persistence layer shared by sandbox instances. It
//! stores the L2 tier of the execution-result cache and the durable copy of
//! the audit trail.
//!
//! ## Key Components
//!
//! - `SurrealHandle`: manages connection and queries
//! - `CacheRecord`: one shared-cache row with its expiry
//! - `AuditRecord`: one hash-chained audit event

mod error;
mod handle;
mod schema;

pub use error::StateError;
pub use handle::{RemoteConfig, SurrealHandle};
pub use schema::{AuditRecord, CacheRecord};

/// Result type for codebox-state operations
pub type Result<T> = std::result::Result<T, StateError>;
