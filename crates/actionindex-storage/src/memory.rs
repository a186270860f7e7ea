//! In-memory storage backend.
//!
//! Emulates the parts of Postgres + CyanAudit the engine relies on:
//!
//! - **Transactions** work on a private snapshot of the database and replace
//!   the shared copy on commit. A commit whose snapshot is stale fails the way
//!   a serializable Postgres transaction does.
//! - **Audit**: while audit is installed and enabled, every change a
//!   transaction commits is journalled under its txid, and
//!   [`undo_transaction`](StoreTransaction::undo_transaction) replays that
//!   journal backwards. Every table a transaction touches is journalled,
//!   whichever schemas [`refresh_audit`](StoreTransaction::refresh_audit) was
//!   called for; updater tables carry no schema to gate on.
//! - **Tables** are schemaless JSON rows keyed by an auto-incrementing `id`.
//!   Updaters reach them through [`MemoryTransaction::insert`] and friends.
//!
//! All data is lost when the process exits.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use actionindex_core::error::IndexerError;
use actionindex_core::store::{
    Store, StoreTransaction, AUDIT_SCHEMA, BLOCK_TXID_TABLE, BOOKKEEPING_TABLES, INDEX_STATE_TABLE,
    MIGRATION_TABLE,
};
use actionindex_core::types::{BlockTxid, IndexState, MigrationRecord};

// ─── Database image ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, Value>,
}

/// One reversible change, as the audit journal records it.
#[derive(Debug, Clone)]
enum Change {
    Insert { table: String, id: i64 },
    Update { table: String, id: i64, before: Value },
    Delete { table: String, id: i64, before: Value },
    IndexState { schema: String, before: Option<IndexState> },
    LedgerInsert { schema: String, block_number: u64 },
    LedgerDelete { schema: String, entry: BlockTxid },
    MigrationInsert { schema: String },
    MigrationDelete { schema: String, record: MigrationRecord },
}

#[derive(Debug, Clone)]
struct MemoryDb {
    version: u64,
    schemas: BTreeSet<String>,
    /// Schemas whose bookkeeping tables exist.
    bookkeeping: BTreeSet<String>,
    tables: BTreeMap<String, Table>,
    index_states: BTreeMap<String, IndexState>,
    ledgers: BTreeMap<String, BTreeMap<u64, i64>>,
    migrations: BTreeMap<String, Vec<MigrationRecord>>,
    audit_installed: bool,
    audited_schemas: BTreeSet<String>,
    journal: BTreeMap<i64, Vec<Change>>,
    scripts: Vec<String>,
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self {
            version: 0,
            schemas: BTreeSet::from(["public".to_string()]),
            bookkeeping: BTreeSet::new(),
            tables: BTreeMap::new(),
            index_states: BTreeMap::new(),
            ledgers: BTreeMap::new(),
            migrations: BTreeMap::new(),
            audit_installed: false,
            audited_schemas: BTreeSet::new(),
            journal: BTreeMap::new(),
            scripts: Vec::new(),
        }
    }
}

fn matches(row: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields.iter().all(|(k, v)| row.get(k) == Some(v)),
        None => true,
    }
}

fn missing_relation(schema: &str, table: &str) -> IndexerError {
    IndexerError::Storage(format!("relation \"{schema}.{table}\" does not exist"))
}

// ─── MemoryStore ──────────────────────────────────────────────────────────────

/// In-memory [`Store`]. Clones share the same database.
#[derive(Clone)]
pub struct MemoryStore {
    db: Arc<Mutex<MemoryDb>>,
    next_txid: Arc<AtomicI64>,
    audit_enabled: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            db: Arc::new(Mutex::new(MemoryDb::default())),
            next_txid: Arc::new(AtomicI64::new(1)),
            audit_enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryDb> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All committed rows of `table`, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// First committed row of `table` matching every field of `filter`.
    pub fn find_one(&self, table: &str, filter: &Value) -> Option<Value> {
        self.lock()
            .tables
            .get(table)
            .and_then(|t| t.rows.values().find(|r| matches(r, filter)).cloned())
    }

    pub fn index_state(&self, schema: &str) -> Option<IndexState> {
        self.lock().index_states.get(schema).cloned()
    }

    /// Committed block→txid ledger, lowest block first.
    pub fn block_txids(&self, schema: &str) -> Vec<BlockTxid> {
        self.lock()
            .ledgers
            .get(schema)
            .map(|l| {
                l.iter()
                    .map(|(&block_number, &txid)| BlockTxid { block_number, txid })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn migration_records(&self, schema: &str) -> Vec<MigrationRecord> {
        self.lock().migrations.get(schema).cloned().unwrap_or_default()
    }

    /// Every script executed by a committed transaction, in order.
    pub fn executed_scripts(&self) -> Vec<String> {
        self.lock().scripts.clone()
    }

    pub fn audit_installed(&self) -> bool {
        self.lock().audit_installed
    }

    pub fn audit_enabled(&self) -> bool {
        self.audit_enabled.load(Ordering::SeqCst)
    }

    /// Uninstall the audit extension, as `DROP EXTENSION cyanaudit` would.
    pub fn drop_audit(&self) {
        let mut db = self.lock();
        db.audit_installed = false;
        db.audited_schemas.clear();
        db.schemas.remove(AUDIT_SCHEMA);
        db.version += 1;
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, IndexerError> {
        let snapshot = self.lock().clone();
        let txid = self.next_txid.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryTransaction {
            db: Arc::clone(&self.db),
            base_version: snapshot.version,
            snapshot,
            txid,
            journaling: self.audit_enabled.load(Ordering::SeqCst),
            changes: Vec::new(),
            dirty: false,
        })
    }

    async fn set_audit_enabled(&self, enabled: bool) -> Result<(), IndexerError> {
        if !self.lock().audit_installed {
            return Err(IndexerError::Storage(format!(
                "schema \"{AUDIT_SCHEMA}\" does not exist"
            )));
        }
        self.audit_enabled.store(enabled, Ordering::SeqCst);
        debug!(enabled, "MemoryStore audit toggled");
        Ok(())
    }
}

// ─── MemoryTransaction ────────────────────────────────────────────────────────

/// A transaction over a private snapshot of a [`MemoryStore`].
///
/// Dropping it without calling `commit` discards every change.
pub struct MemoryTransaction {
    db: Arc<Mutex<MemoryDb>>,
    snapshot: MemoryDb,
    base_version: u64,
    txid: i64,
    journaling: bool,
    changes: Vec<Change>,
    dirty: bool,
}

impl MemoryTransaction {
    fn record(&mut self, change: Change) {
        self.dirty = true;
        self.changes.push(change);
    }

    fn require_bookkeeping(&self, schema: &str, table: &str) -> Result<(), IndexerError> {
        if self.snapshot.bookkeeping.contains(schema) {
            Ok(())
        } else {
            Err(missing_relation(schema, table))
        }
    }

    /// Insert a row and return its id.
    ///
    /// A numeric `id` field is kept; otherwise the next id is assigned.
    /// Tables are created on first insert.
    pub fn insert(&mut self, table: &str, mut row: Value) -> Result<i64, IndexerError> {
        let fields = row.as_object_mut().ok_or_else(|| {
            IndexerError::Storage(format!("row for table {table} must be a JSON object"))
        })?;
        let t = self.snapshot.tables.entry(table.to_string()).or_default();
        let id = match fields.get("id").and_then(Value::as_i64) {
            Some(id) => id,
            None => t.next_id.max(1),
        };
        if t.rows.contains_key(&id) {
            return Err(IndexerError::Storage(format!(
                "duplicate key value violates unique constraint \"{table}_pkey\" (id={id})"
            )));
        }
        fields.insert("id".into(), Value::from(id));
        t.next_id = t.next_id.max(id + 1);
        t.rows.insert(id, row);
        self.record(Change::Insert {
            table: table.to_string(),
            id,
        });
        Ok(id)
    }

    /// First row matching every field of `filter`, lowest id first.
    pub fn find_one(&self, table: &str, filter: &Value) -> Option<Value> {
        self.snapshot
            .tables
            .get(table)
            .and_then(|t| t.rows.values().find(|r| matches(r, filter)).cloned())
    }

    pub fn find(&self, table: &str, filter: &Value) -> Vec<Value> {
        self.snapshot
            .tables
            .get(table)
            .map(|t| t.rows.values().filter(|r| matches(r, filter)).cloned().collect())
            .unwrap_or_default()
    }

    /// Merge `patch` into every matching row. Returns the number of rows updated.
    pub fn update(&mut self, table: &str, filter: &Value, patch: &Value) -> Result<u64, IndexerError> {
        let patch = patch.as_object().ok_or_else(|| {
            IndexerError::Storage(format!("update patch for table {table} must be a JSON object"))
        })?;
        let Some(t) = self.snapshot.tables.get_mut(table) else {
            return Ok(0);
        };
        let mut changes = Vec::new();
        for (&id, row) in t.rows.iter_mut().filter(|(_, r)| matches(r, filter)) {
            let before = row.clone();
            if let Some(fields) = row.as_object_mut() {
                for (k, v) in patch {
                    fields.insert(k.clone(), v.clone());
                }
            }
            changes.push(Change::Update {
                table: table.to_string(),
                id,
                before,
            });
        }
        let count = changes.len() as u64;
        for change in changes {
            self.record(change);
        }
        Ok(count)
    }

    /// Delete every matching row. Returns the number of rows deleted.
    pub fn delete(&mut self, table: &str, filter: &Value) -> Result<u64, IndexerError> {
        let Some(t) = self.snapshot.tables.get_mut(table) else {
            return Ok(0);
        };
        let ids: Vec<i64> = t
            .rows
            .iter()
            .filter(|(_, r)| matches(r, filter))
            .map(|(&id, _)| id)
            .collect();
        let mut changes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(before) = t.rows.remove(&id) {
                changes.push(Change::Delete {
                    table: table.to_string(),
                    id,
                    before,
                });
            }
        }
        let count = changes.len() as u64;
        for change in changes {
            self.record(change);
        }
        Ok(count)
    }

    /// Apply the inverse of `change`, journalling the inverse in turn.
    fn revert(&mut self, change: Change) {
        match change {
            Change::Insert { table, id } => {
                let removed = self
                    .snapshot
                    .tables
                    .get_mut(&table)
                    .and_then(|t| t.rows.remove(&id));
                if let Some(before) = removed {
                    self.record(Change::Delete { table, id, before });
                }
            }
            Change::Update { table, id, before } | Change::Delete { table, id, before } => {
                let t = self.snapshot.tables.entry(table.clone()).or_default();
                t.next_id = t.next_id.max(id + 1);
                match t.rows.insert(id, before) {
                    Some(current) => self.record(Change::Update {
                        table,
                        id,
                        before: current,
                    }),
                    None => self.record(Change::Insert { table, id }),
                }
            }
            Change::IndexState { schema, before } => {
                let current = match before {
                    Some(state) => self.snapshot.index_states.insert(schema.clone(), state),
                    None => self.snapshot.index_states.remove(&schema),
                };
                self.record(Change::IndexState {
                    schema,
                    before: current,
                });
            }
            Change::LedgerInsert {
                schema,
                block_number,
            } => {
                let removed = self
                    .snapshot
                    .ledgers
                    .get_mut(&schema)
                    .and_then(|l| l.remove(&block_number));
                if let Some(txid) = removed {
                    self.record(Change::LedgerDelete {
                        schema,
                        entry: BlockTxid { block_number, txid },
                    });
                }
            }
            Change::LedgerDelete { schema, entry } => {
                self.snapshot
                    .ledgers
                    .entry(schema.clone())
                    .or_default()
                    .insert(entry.block_number, entry.txid);
                self.record(Change::LedgerInsert {
                    schema,
                    block_number: entry.block_number,
                });
            }
            Change::MigrationInsert { schema } => {
                let removed = self
                    .snapshot
                    .migrations
                    .get_mut(&schema)
                    .and_then(Vec::pop);
                if let Some(record) = removed {
                    self.record(Change::MigrationDelete { schema, record });
                }
            }
            Change::MigrationDelete { schema, record } => {
                self.snapshot
                    .migrations
                    .entry(schema.clone())
                    .or_default()
                    .push(record);
                self.record(Change::MigrationInsert { schema });
            }
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn txid(&mut self) -> Result<i64, IndexerError> {
        Ok(self.txid)
    }

    async fn execute(&mut self, script: &str) -> Result<(), IndexerError> {
        self.snapshot.scripts.push(script.to_string());
        self.dirty = true;
        Ok(())
    }

    async fn commit(mut self) -> Result<(), IndexerError> {
        if !self.dirty {
            return Ok(());
        }
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        if db.version != self.base_version {
            return Err(IndexerError::Storage(
                "could not serialize access due to concurrent update".into(),
            ));
        }
        if self.journaling && self.snapshot.audit_installed && !self.changes.is_empty() {
            let changes = std::mem::take(&mut self.changes);
            self.snapshot.journal.insert(self.txid, changes);
        }
        self.snapshot.version = self.base_version + 1;
        *db = self.snapshot;
        Ok(())
    }

    async fn rollback(self) -> Result<(), IndexerError> {
        Ok(())
    }

    async fn create_schema(&mut self, schema: &str) -> Result<(), IndexerError> {
        if self.snapshot.schemas.insert(schema.to_string()) {
            self.dirty = true;
        }
        Ok(())
    }

    async fn create_bookkeeping_tables(&mut self, schema: &str) -> Result<(), IndexerError> {
        if !self.snapshot.schemas.contains(schema) {
            return Err(IndexerError::Storage(format!(
                "schema \"{schema}\" does not exist"
            )));
        }
        if self.snapshot.bookkeeping.insert(schema.to_string()) {
            self.dirty = true;
        }
        Ok(())
    }

    async fn install_audit(&mut self) -> Result<(), IndexerError> {
        if !self.snapshot.audit_installed {
            self.snapshot.audit_installed = true;
            self.snapshot.schemas.insert(AUDIT_SCHEMA.to_string());
            self.dirty = true;
        }
        Ok(())
    }

    async fn refresh_audit(&mut self, schema: &str) -> Result<(), IndexerError> {
        if !self.snapshot.audit_installed {
            return Err(IndexerError::Storage(format!(
                "schema \"{AUDIT_SCHEMA}\" does not exist"
            )));
        }
        if self.snapshot.audited_schemas.insert(schema.to_string()) {
            self.dirty = true;
        }
        Ok(())
    }

    async fn schema_exists(&mut self, schema: &str) -> Result<bool, IndexerError> {
        Ok(self.snapshot.schemas.contains(schema))
    }

    async fn table_exists(&mut self, schema: &str, table: &str) -> Result<bool, IndexerError> {
        if BOOKKEEPING_TABLES.contains(&table) {
            return Ok(self.snapshot.bookkeeping.contains(schema));
        }
        Ok(self.snapshot.tables.contains_key(table)
            || self.snapshot.tables.contains_key(&format!("{schema}.{table}")))
    }

    async fn migration_history(
        &mut self,
        schema: &str,
    ) -> Result<Vec<MigrationRecord>, IndexerError> {
        self.require_bookkeeping(schema, MIGRATION_TABLE)?;
        Ok(self
            .snapshot
            .migrations
            .get(schema)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_migration(
        &mut self,
        schema: &str,
        record: &MigrationRecord,
    ) -> Result<(), IndexerError> {
        self.require_bookkeeping(schema, MIGRATION_TABLE)?;
        self.snapshot
            .migrations
            .entry(schema.to_string())
            .or_default()
            .push(record.clone());
        self.record(Change::MigrationInsert {
            schema: schema.to_string(),
        });
        Ok(())
    }

    async fn load_index_state(&mut self, schema: &str) -> Result<Option<IndexState>, IndexerError> {
        self.require_bookkeeping(schema, INDEX_STATE_TABLE)?;
        Ok(self.snapshot.index_states.get(schema).cloned())
    }

    async fn save_index_state(
        &mut self,
        schema: &str,
        state: &IndexState,
    ) -> Result<(), IndexerError> {
        self.require_bookkeeping(schema, INDEX_STATE_TABLE)?;
        let before = self
            .snapshot
            .index_states
            .insert(schema.to_string(), state.clone());
        self.record(Change::IndexState {
            schema: schema.to_string(),
            before,
        });
        Ok(())
    }

    async fn record_block_txid(
        &mut self,
        schema: &str,
        block_number: u64,
        txid: i64,
    ) -> Result<(), IndexerError> {
        self.require_bookkeeping(schema, BLOCK_TXID_TABLE)?;
        let ledger = self.snapshot.ledgers.entry(schema.to_string()).or_default();
        if ledger.contains_key(&block_number) {
            return Err(IndexerError::Storage(format!(
                "duplicate key value violates unique constraint \"{BLOCK_TXID_TABLE}_pkey\" \
                 (block_number={block_number})"
            )));
        }
        ledger.insert(block_number, txid);
        self.record(Change::LedgerInsert {
            schema: schema.to_string(),
            block_number,
        });
        Ok(())
    }

    async fn block_txids_after(
        &mut self,
        schema: &str,
        after: u64,
    ) -> Result<Vec<BlockTxid>, IndexerError> {
        self.require_bookkeeping(schema, BLOCK_TXID_TABLE)?;
        Ok(self
            .snapshot
            .ledgers
            .get(schema)
            .map(|l| {
                l.range(after.saturating_add(1)..)
                    .rev()
                    .map(|(&block_number, &txid)| BlockTxid { block_number, txid })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_block_txids_after(
        &mut self,
        schema: &str,
        after: u64,
    ) -> Result<(), IndexerError> {
        self.require_bookkeeping(schema, BLOCK_TXID_TABLE)?;
        let removed = match self.snapshot.ledgers.get_mut(schema) {
            Some(ledger) => ledger.split_off(&after.saturating_add(1)),
            None => BTreeMap::new(),
        };
        for (block_number, txid) in removed {
            self.record(Change::LedgerDelete {
                schema: schema.to_string(),
                entry: BlockTxid { block_number, txid },
            });
        }
        Ok(())
    }

    async fn undo_transaction(&mut self, txid: i64) -> Result<(), IndexerError> {
        let changes = self.snapshot.journal.get(&txid).cloned().ok_or_else(|| {
            IndexerError::Storage(format!("no audit records for transaction {txid}"))
        })?;
        debug!(txid, changes = changes.len(), "Undoing transaction");
        for change in changes.into_iter().rev() {
            self.revert(change);
        }
        Ok(())
    }
}
