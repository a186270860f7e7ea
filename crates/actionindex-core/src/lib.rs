//! actionindex-core: a rollback-capable engine that applies blocks of
//! actions to a relational database.
//!
//! # Architecture
//!
//! ```text
//! Indexer (drive loop)
//!    ├── BlockSource        (contiguous blocks, fork → is_rollback)
//!    └── ActionHandler      (one transaction per block)
//!           ├── HandlerVersion → Updater   (user state changes)
//!           ├── MigrationRegistry → MigrationRunner → Migration
//!           └── Store / StoreTransaction   (memory / Postgres + CyanAudit)
//! ```

pub mod action_handler;
pub mod config;
pub mod error;
pub mod handler;
pub mod indexer;
pub mod migration;
pub mod migration_runner;
pub mod sequence;
pub mod source;
pub mod store;
pub mod tracker;
pub mod types;

pub use action_handler::ActionHandler;
pub use config::{HandlerConfig, IndexerConfig};
pub use error::IndexerError;
pub use handler::{BlockContext, HandlerVersion, Updater};
pub use indexer::{Indexer, IndexerState};
pub use migration::Migration;
pub use migration_runner::MigrationRunner;
pub use sequence::{MigrationRegistry, MigrationSequence};
pub use source::{BlockSource, VecBlockSource};
pub use store::{Store, StoreTransaction};
pub use tracker::BlockTracker;
pub use types::{
    Action, Block, BlockInfo, BlockMeta, BlockOutcome, BlockTxid, IndexState, MigrationRecord,
    NextBlock,
};
