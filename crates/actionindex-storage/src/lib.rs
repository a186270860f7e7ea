//! actionindex-storage: storage backends for the ActionIndex engine.
//!
//! Backends:
//! - [`memory`]: in-memory with an emulated audit journal (dev/testing, no persistence)
//! - `postgres`: PostgreSQL via `sqlx`, rollback through the CyanAudit extension

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "memory")]
pub use memory::{MemoryStore, MemoryTransaction};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresOptions, PostgresStore, PostgresTransaction};
