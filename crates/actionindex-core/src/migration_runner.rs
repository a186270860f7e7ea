//! Schema bootstrap and ordered migration application.
//!
//! The runner owns the migration-history ledger. Every migration it applies
//! is recorded as `(name, sequence, block_number)`; on the next run the ledger
//! is compared position-by-position with the configured list so that a
//! reordered, renamed or deleted migration is caught before anything runs.

use std::time::Instant;

use tracing::{debug, info};

use crate::error::IndexerError;
use crate::migration::Migration;
use crate::store::{is_valid_identifier, StoreTransaction, AUDIT_SCHEMA, BOOKKEEPING_TABLES};
use crate::types::{IndexState, MigrationRecord};

/// Applies an ordered list of migrations to one schema.
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    schema: String,
    migrations: Vec<Migration>,
    is_set_up: bool,
}

impl MigrationRunner {
    /// Create a runner. Migration names must be unique across `migrations`.
    pub fn new(schema: impl Into<String>, migrations: Vec<Migration>) -> Result<Self, IndexerError> {
        let schema = schema.into();
        if !is_valid_identifier(&schema) {
            return Err(IndexerError::InvalidSchemaName(schema));
        }
        let dups = find_duplicates(migrations.iter().map(Migration::name));
        if !dups.is_empty() {
            return Err(IndexerError::NonUniqueMigrationName(dups));
        }
        Ok(Self {
            schema,
            migrations,
            is_set_up: false,
        })
    }

    /// Trust that the schema is already bootstrapped; skips the pre-flight check.
    pub fn skip_setup(mut self) -> Self {
        self.is_set_up = true;
        self
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Create the schema, bookkeeping tables and audit extension if absent,
    /// and seed the index-state row with zero values.
    ///
    /// Safe to call any number of times.
    pub async fn setup<T: StoreTransaction>(&mut self, tx: &mut T) -> Result<(), IndexerError> {
        debug!(schema = %self.schema, "Setting up migration runner");
        let started = Instant::now();

        tx.create_schema(&self.schema).await?;
        tx.create_bookkeeping_tables(&self.schema).await?;
        if tx.load_index_state(&self.schema).await?.is_none() {
            tx.save_index_state(&self.schema, &IndexState::default()).await?;
            debug!(schema = %self.schema, "Index state seeded");
        }
        debug!(schema = %self.schema, "Bookkeeping tables present");

        tx.install_audit().await?;
        tx.refresh_audit(&self.schema).await?;

        self.is_set_up = true;
        info!(
            schema = %self.schema,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Migration runner set up"
        );
        Ok(())
    }

    /// Apply every configured migration the ledger does not know about yet.
    ///
    /// With `initial`, ledger entries beyond the configured list are tolerated:
    /// they belong to sequences applied later in the block stream.
    /// Returns the names of the migrations applied by this call.
    pub async fn migrate<T: StoreTransaction>(
        &mut self,
        tx: &mut T,
        sequence_name: &str,
        block_number: u64,
        initial: bool,
    ) -> Result<Vec<String>, IndexerError> {
        self.ensure_set_up(tx).await?;
        let unapplied = self.get_unapplied_migrations(tx, initial).await?;
        let mut applied = Vec::with_capacity(unapplied.len());
        for migration in unapplied {
            self.apply_migration(tx, &migration, sequence_name, block_number)
                .await?;
            applied.push(migration.name().to_string());
        }
        Ok(applied)
    }

    /// Configured migrations not yet present in the ledger, in order.
    pub async fn get_unapplied_migrations<T: StoreTransaction>(
        &self,
        tx: &mut T,
        initial: bool,
    ) -> Result<Vec<Migration>, IndexerError> {
        let history: Vec<String> = tx
            .migration_history(&self.schema)
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect();
        validate_history(&history, &self.migrations, initial)?;
        Ok(self
            .migrations
            .get(history.len()..)
            .map(<[Migration]>::to_vec)
            .unwrap_or_default())
    }

    async fn apply_migration<T: StoreTransaction>(
        &self,
        tx: &mut T,
        migration: &Migration,
        sequence_name: &str,
        block_number: u64,
    ) -> Result<(), IndexerError> {
        let started = Instant::now();
        debug!(migration = migration.name(), sequence = sequence_name, "Applying migration");

        migration.up(tx).await?;
        tx.refresh_audit(&self.schema).await?;
        tx.record_migration(
            &self.schema,
            &MigrationRecord {
                name: migration.name().to_string(),
                sequence: sequence_name.to_string(),
                block_number,
            },
        )
        .await?;

        info!(
            migration = migration.name(),
            sequence = sequence_name,
            block_number,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Applied migration"
        );
        Ok(())
    }

    /// Pre-flight check for databases provisioned without calling `setup()`.
    async fn ensure_set_up<T: StoreTransaction>(&mut self, tx: &mut T) -> Result<(), IndexerError> {
        if self.is_set_up {
            return Ok(());
        }
        if !tx.schema_exists(&self.schema).await? {
            return Err(IndexerError::MissingSchema(self.schema.clone()));
        }
        for table in BOOKKEEPING_TABLES {
            if !tx.table_exists(&self.schema, table).await? {
                return Err(IndexerError::MissingTable(table.to_string()));
            }
        }
        if !tx.schema_exists(AUDIT_SCHEMA).await? {
            return Err(IndexerError::MissingSchema(AUDIT_SCHEMA.to_string()));
        }
        self.is_set_up = true;
        Ok(())
    }
}

/// Check that the ledger is a prefix of the configured list.
pub(crate) fn validate_history(
    history: &[String],
    local: &[Migration],
    initial: bool,
) -> Result<(), IndexerError> {
    for (i, applied) in history.iter().enumerate() {
        match local.get(i) {
            None if initial => break,
            None => return Err(IndexerError::ExtraMigrationHistory),
            Some(m) if m.name() != applied => {
                return Err(IndexerError::MismatchedMigrationsHistory)
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Names occurring more than once, each listed once, in first-repeat order.
pub(crate) fn find_duplicates<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut dups: Vec<String> = Vec::new();
    for name in names {
        if !seen.insert(name) && !dups.iter().any(|d| d == name) {
            dups.push(name.to_string());
        }
    }
    dups
}
