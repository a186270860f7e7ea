//! Error types for the block-application engine.

use thiserror::Error;

/// Errors that can occur while bootstrapping, migrating, applying or
/// rolling back blocks.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Updater error in '{action_type}': {reason}")]
    Updater { action_type: String, reason: String },

    #[error("Migrations named {} are non-unique.", .0.join(", "))]
    NonUniqueMigrationName(Vec<String>),

    #[error("Migration sequences must have unique names; duplicated: {}.", .0.join(", "))]
    NonUniqueMigrationSequence(Vec<String>),

    #[error("Migration sequence '{0}' does not exist.")]
    NonExistentMigration(String),

    #[error(
        "Migration '{expected}' at index {index} does not match corresponding migration \
         in database; found '{actual}' instead."
    )]
    MismatchedMigrations {
        expected: String,
        actual: String,
        index: usize,
    },

    #[error(
        "Mismatched migrations. Make sure migrations are in the same order that they have \
         been previously run."
    )]
    MismatchedMigrationsHistory,

    #[error(
        "There are more migrations applied to the database than there are present on this \
         system. Make sure you have not deleted any migrations and are running up-to-date code."
    )]
    ExtraMigrationHistory,

    #[error("Schema '{0}' does not exist. Make sure you have run `setup()` before migrating")]
    MissingSchema(String),

    #[error("Table '{0}' does not exist. Make sure you have run `setup()` before migrating")]
    MissingTable(String),

    #[error("Migration '{0}' has no down query!")]
    MissingDownQuery(String),

    #[error("Malformed script for migration '{migration}': {reason}")]
    MalformedScript { migration: String, reason: String },

    #[error("Error while {} audit: {reason}", audit_direction(.enabled))]
    AuditConfiguration { enabled: bool, reason: String },

    #[error("Action handler is not initialized: {0}")]
    NotInitialized(#[source] Box<IndexerError>),

    #[error("Rollback failed at block {block_number} (txid {txid}): {reason}")]
    Rollback {
        block_number: u64,
        txid: i64,
        reason: String,
    },

    #[error("Block {block_number} is not part of the current chain: expected previous hash {expected}, got {actual}")]
    BlockHashMismatch {
        block_number: u64,
        expected: String,
        actual: String,
    },

    #[error("Handler version '{0}' is defined more than once")]
    DuplicateHandlerVersion(String),

    #[error("Handler version '{0}' does not exist")]
    UnknownHandlerVersion(String),

    #[error("Invalid schema name '{0}'")]
    InvalidSchemaName(String),

    #[error("{0}")]
    Other(String),
}

fn audit_direction(enabled: &bool) -> &'static str {
    if *enabled {
        "enabling"
    } else {
        "disabling"
    }
}

impl IndexerError {
    /// Returns `true` if the handler cannot safely continue after this error.
    ///
    /// Construction-time validation, audit toggling and rollback failures
    /// leave the engine (or the schema) in a state that needs an operator.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NonUniqueMigrationName(_)
                | Self::NonUniqueMigrationSequence(_)
                | Self::MismatchedMigrations { .. }
                | Self::MismatchedMigrationsHistory
                | Self::ExtraMigrationHistory
                | Self::MalformedScript { .. }
                | Self::AuditConfiguration { .. }
                | Self::NotInitialized(_)
                | Self::Rollback { .. }
                | Self::DuplicateHandlerVersion(_)
                | Self::InvalidSchemaName(_)
        )
    }

    /// Returns `true` if re-invoking `handle_block` with the same block may succeed.
    ///
    /// Per-block failures abort the block transaction, so nothing was persisted.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Updater { .. })
    }
}
