//! Storage capability traits.
//!
//! The engine never talks to a database driver directly. A backend supplies a
//! [`Store`] that opens serializable transactions, and a [`StoreTransaction`]
//! that executes scripts and the handful of bookkeeping reads/writes the
//! engine needs. Backends own their SQL dialect; the engine owns ordering.
//!
//! Implementations live in `actionindex-storage` (`MemoryStore`,
//! `PostgresStore`).

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::types::{BlockTxid, IndexState, MigrationRecord};

/// Migration-history ledger table.
pub const MIGRATION_TABLE: &str = "_migration";
/// Index-state singleton table.
pub const INDEX_STATE_TABLE: &str = "_index_state";
/// Block-number → transaction-id ledger table.
pub const BLOCK_TXID_TABLE: &str = "_block_number_txid";
/// Schema the audit extension installs itself into.
pub const AUDIT_SCHEMA: &str = "cyanaudit";

/// All bookkeeping tables `setup()` creates, in creation order.
pub const BOOKKEEPING_TABLES: [&str; 3] = [MIGRATION_TABLE, INDEX_STATE_TABLE, BLOCK_TXID_TABLE];

/// A transactional database: the entry point a backend hands to the engine.
#[async_trait]
pub trait Store: Send + Sync {
    /// The transaction type produced by [`Store::begin`].
    type Tx: StoreTransaction + 'static;

    /// Begin a transaction at serializable isolation.
    async fn begin(&self) -> Result<Self::Tx, IndexerError>;

    /// Switch audit journaling on or off for transactions begun afterwards.
    async fn set_audit_enabled(&self, enabled: bool) -> Result<(), IndexerError>;
}

/// A single all-or-nothing unit of work.
///
/// Dropping a transaction without committing must discard its effects.
#[async_trait]
pub trait StoreTransaction: Send {
    // ── core capability ──────────────────────────────────────────────────────

    /// Identifier of this transaction as known to the audit journal.
    async fn txid(&mut self) -> Result<i64, IndexerError>;

    /// Execute a (possibly multi-statement) script.
    async fn execute(&mut self, script: &str) -> Result<(), IndexerError>;

    /// Commit every effect of this transaction.
    async fn commit(self) -> Result<(), IndexerError>;

    /// Discard every effect of this transaction.
    async fn rollback(self) -> Result<(), IndexerError>;

    // ── bootstrap ────────────────────────────────────────────────────────────

    /// `CREATE SCHEMA IF NOT EXISTS`.
    async fn create_schema(&mut self, schema: &str) -> Result<(), IndexerError>;

    /// Create the three bookkeeping tables if they do not exist.
    async fn create_bookkeeping_tables(&mut self, schema: &str) -> Result<(), IndexerError>;

    /// Install the audit extension (idempotent).
    async fn install_audit(&mut self) -> Result<(), IndexerError>;

    /// Make the audit extension track every table currently in `schema`.
    async fn refresh_audit(&mut self, schema: &str) -> Result<(), IndexerError>;

    async fn schema_exists(&mut self, schema: &str) -> Result<bool, IndexerError>;

    async fn table_exists(&mut self, schema: &str, table: &str) -> Result<bool, IndexerError>;

    // ── migration ledger ─────────────────────────────────────────────────────

    /// Ledger rows in application order.
    async fn migration_history(&mut self, schema: &str)
        -> Result<Vec<MigrationRecord>, IndexerError>;

    async fn record_migration(
        &mut self,
        schema: &str,
        record: &MigrationRecord,
    ) -> Result<(), IndexerError>;

    // ── index state ──────────────────────────────────────────────────────────

    async fn load_index_state(&mut self, schema: &str) -> Result<Option<IndexState>, IndexerError>;

    /// Upsert the singleton index-state row.
    async fn save_index_state(&mut self, schema: &str, state: &IndexState)
        -> Result<(), IndexerError>;

    // ── block → txid ledger ──────────────────────────────────────────────────

    async fn record_block_txid(
        &mut self,
        schema: &str,
        block_number: u64,
        txid: i64,
    ) -> Result<(), IndexerError>;

    /// Rows with `block_number > after`, highest block first.
    async fn block_txids_after(
        &mut self,
        schema: &str,
        after: u64,
    ) -> Result<Vec<BlockTxid>, IndexerError>;

    /// Delete rows with `block_number > after`.
    async fn delete_block_txids_after(&mut self, schema: &str, after: u64)
        -> Result<(), IndexerError>;

    /// Revert every audited change made by transaction `txid`.
    async fn undo_transaction(&mut self, txid: i64) -> Result<(), IndexerError>;
}

/// Returns `true` if `name` is a plain SQL identifier safe to interpolate.
///
/// Uppercase is rejected: Postgres folds unquoted identifiers to lowercase, so
/// a quoted `"Todos"` and an unquoted `Todos` in migration SQL would name
/// different schemas.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_valid_identifier("public"));
        assert!(is_valid_identifier("_s1"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1abc"));
        assert!(!is_valid_identifier("a; DROP TABLE x"));
        assert!(!is_valid_identifier(&"a".repeat(64)));
        assert!(!is_valid_identifier("Todos"));
        assert!(!is_valid_identifier("todoS"));
        assert!(is_valid_identifier("todos_2"));
    }
}
