//! The block-application engine.
//!
//! # Lifecycle
//!
//! ```text
//! UNINITIALIZED ──initialize()──▶ READY ──handle_block()──▶ READY
//!                                   │
//!                                   └── rollback_to(n) ──▶ READY (state at ≤ n)
//! ```
//!
//! Every block is applied in exactly one serializable transaction: the
//! updaters' writes, the index-state row and the block→txid ledger row commit
//! or vanish together. Rollback undoes the ledgered transactions newest first,
//! again inside a single transaction.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::HandlerConfig;
use crate::error::IndexerError;
use crate::handler::{BlockContext, HandlerVersion};
use crate::migration::Migration;
use crate::migration_runner::{find_duplicates, MigrationRunner};
use crate::sequence::{MigrationRegistry, MigrationSequence};
use crate::store::{Store, StoreTransaction};
use crate::types::{Block, BlockMeta, BlockOutcome, IndexState};

/// Applies blocks of actions to one database schema.
pub struct ActionHandler<S: Store> {
    store: S,
    config: HandlerConfig,
    versions: Vec<HandlerVersion<S::Tx>>,
    version_names: Vec<String>,
    registry: MigrationRegistry,
    initialized: bool,
    last_processed_block_number: u64,
    last_processed_block_hash: String,
    last_irreversible_block_number: u64,
    handler_version_name: String,
    is_replay: bool,
    audit_enabled: Option<bool>,
}

impl<S: Store> ActionHandler<S> {
    /// Build a handler. Nothing touches the database until the first block
    /// (or an explicit [`initialize`](Self::initialize)).
    pub fn new(
        store: S,
        config: HandlerConfig,
        versions: Vec<HandlerVersion<S::Tx>>,
        sequences: Vec<MigrationSequence>,
    ) -> Result<Self, IndexerError> {
        config.validate()?;
        let version_names: Vec<String> =
            versions.iter().map(|v| v.version_name.clone()).collect();
        if let Some(dup) = find_duplicates(version_names.iter().map(String::as_str))
            .into_iter()
            .next()
        {
            return Err(IndexerError::DuplicateHandlerVersion(dup));
        }
        let first = version_names
            .first()
            .cloned()
            .ok_or_else(|| IndexerError::Other("at least one handler version is required".into()))?;
        let registry = MigrationRegistry::new(&config.schema, sequences)?;

        Ok(Self {
            store,
            config,
            versions,
            version_names,
            registry,
            initialized: false,
            last_processed_block_number: 0,
            last_processed_block_hash: String::new(),
            last_irreversible_block_number: 0,
            handler_version_name: first,
            is_replay: false,
            audit_enabled: None,
        })
    }

    // ── lifecycle ────────────────────────────────────────────────────────────

    /// Bootstrap the schema, run the init sequence and load the checkpoint.
    pub async fn initialize(&mut self) -> Result<(), IndexerError> {
        let started = Instant::now();
        let mut tx = self.store.begin().await?;
        let result = self.initialize_in_tx(&mut tx).await;
        let (applied, state) = finish(tx, result).await?;

        self.registry.set_applied(applied);
        self.adopt_state(state)?;
        self.initialized = true;
        info!(
            schema = %self.config.schema,
            block_number = self.last_processed_block_number,
            handler_version = %self.handler_version_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Action handler initialized"
        );
        Ok(())
    }

    async fn initialize_in_tx(
        &self,
        tx: &mut S::Tx,
    ) -> Result<(Vec<Migration>, Option<IndexState>), IndexerError> {
        let mut runner = MigrationRunner::new(&self.config.schema, Vec::new())?;
        runner.setup(tx).await?;

        let init = &self.config.init_sequence;
        if self.registry.sequence(init).is_some() {
            let mut scratch = Vec::new();
            let ran = self
                .registry
                .run_sequence(tx, &mut scratch, init, 0, true)
                .await?;
            debug!(sequence = %init, applied = ran.len(), "Init sequence run");
        } else {
            warn!(
                sequence = %init,
                "No init migration sequence configured; the schema may need to be provisioned externally"
            );
        }

        let history = tx.migration_history(&self.config.schema).await?;
        let applied = self.registry.restore(&history)?;
        let state = tx.load_index_state(&self.config.schema).await?;
        Ok((applied, state))
    }

    async fn ensure_initialized(&mut self) -> Result<(), IndexerError> {
        if self.initialized {
            return Ok(());
        }
        self.initialize()
            .await
            .map_err(|e| IndexerError::NotInitialized(Box::new(e)))
    }

    /// Forget the in-memory checkpoint and audit flag.
    ///
    /// The next block reloads the checkpoint from the database and re-issues
    /// the audit toggle.
    pub fn reset(&mut self) {
        self.last_processed_block_number = 0;
        self.last_processed_block_hash.clear();
        self.audit_enabled = None;
    }

    // ── block processing ─────────────────────────────────────────────────────

    /// Handle a block, keeping the last known irreversible block number.
    pub async fn handle_block(
        &mut self,
        block: &Block,
        is_rollback: bool,
        is_first_block: bool,
    ) -> Result<BlockOutcome, IndexerError> {
        let meta = BlockMeta {
            is_rollback,
            is_first_block,
            is_replay: false,
            last_irreversible_block_number: self.last_irreversible_block_number,
        };
        self.handle_block_with(block, meta).await
    }

    /// Handle a block with full source metadata.
    pub async fn handle_block_with(
        &mut self,
        block: &Block,
        meta: BlockMeta,
    ) -> Result<BlockOutcome, IndexerError> {
        self.ensure_initialized().await?;
        let number = block.number();

        if meta.is_rollback || (meta.is_replay && meta.is_first_block) {
            self.rollback_to(number.saturating_sub(1)).await?;
        } else if self.last_processed_block_number == 0 && self.last_processed_block_hash.is_empty()
        {
            self.load_index_state().await?;
        }

        if number == self.last_processed_block_number && block.hash() == self.last_processed_block_hash
        {
            debug!(block_number = number, "Block already processed");
            return Ok(BlockOutcome::AlreadyProcessed);
        }

        let has_checkpoint = !self.last_processed_block_hash.is_empty();
        let next_block = self.last_processed_block_number + 1;
        if (has_checkpoint || !meta.is_first_block) && number != next_block {
            debug!(block_number = number, next_block, "Block out of sequence, requesting seek");
            return Ok(BlockOutcome::Seek { next_block });
        }

        if has_checkpoint && block.block_info.previous_block_hash != self.last_processed_block_hash {
            return Err(IndexerError::BlockHashMismatch {
                block_number: number,
                expected: self.last_processed_block_hash.clone(),
                actual: block.block_info.previous_block_hash.clone(),
            });
        }

        self.apply_block(block, meta).await?;
        Ok(BlockOutcome::Applied)
    }

    async fn apply_block(&mut self, block: &Block, meta: BlockMeta) -> Result<(), IndexerError> {
        let started = Instant::now();
        let number = block.number();
        let audit = audit_required(number, meta.last_irreversible_block_number);
        self.set_audit(audit).await?;

        let mut tx = self.store.begin().await?;
        let result = self.apply_in_tx(&mut tx, block, meta, audit).await;
        let (version, applied) = finish(tx, result).await?;

        if version != self.handler_version_name {
            info!(from = %self.handler_version_name, to = %version, block_number = number, "Switched handler version");
        }
        self.last_processed_block_number = number;
        self.last_processed_block_hash = block.hash().to_string();
        self.last_irreversible_block_number = meta.last_irreversible_block_number;
        self.is_replay = meta.is_replay;
        self.handler_version_name = version;
        self.registry.set_applied(applied);

        info!(
            block_number = number,
            actions = block.actions.len(),
            audit,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Applied block"
        );
        Ok(())
    }

    /// Run the block's updaters and bookkeeping inside `tx`.
    ///
    /// Returns the handler version and applied-migration list in force after
    /// the block; the caller adopts them once the transaction commits.
    async fn apply_in_tx(
        &self,
        tx: &mut S::Tx,
        block: &Block,
        meta: BlockMeta,
        audit: bool,
    ) -> Result<(String, Vec<Migration>), IndexerError> {
        let txid = tx.txid().await?;
        let mut applied = self.registry.applied().to_vec();
        let mut version = self.handler_version_name.clone();

        for action in &block.actions {
            let active = self
                .version(&version)
                .ok_or_else(|| IndexerError::UnknownHandlerVersion(version.clone()))?;
            let mut ctx = BlockContext {
                tx: &mut *tx,
                txid,
                block: &block.block_info,
                is_replay: meta.is_replay,
                registry: &self.registry,
                applied: &mut applied,
                version_names: &self.version_names,
                switched_to: None,
            };
            for updater in active.updaters_for(&action.action_type) {
                if let Err(e) = updater.apply(&action.payload, &mut ctx).await {
                    warn!(
                        block_number = block.number(),
                        action_type = %action.action_type,
                        error = %e,
                        "Updater failed, aborting block"
                    );
                    return Err(e);
                }
                if ctx.switched_to.is_some() {
                    break;
                }
            }
            if let Some(next) = ctx.switched_to.take() {
                version = next;
            }
        }

        let state = IndexState {
            block_number: block.number(),
            block_hash: block.hash().to_string(),
            last_irreversible_block_number: meta.last_irreversible_block_number,
            handler_version_name: version.clone(),
            is_replay: meta.is_replay,
        };
        tx.save_index_state(&self.config.schema, &state).await?;
        if audit {
            tx.record_block_txid(&self.config.schema, block.number(), txid)
                .await?;
        }
        Ok((version, applied))
    }

    async fn set_audit(&mut self, enabled: bool) -> Result<(), IndexerError> {
        if self.audit_enabled == Some(enabled) {
            return Ok(());
        }
        self.store
            .set_audit_enabled(enabled)
            .await
            .map_err(|e| IndexerError::AuditConfiguration {
                enabled,
                reason: e.to_string(),
            })?;
        debug!(enabled, "Audit toggled");
        self.audit_enabled = Some(enabled);
        Ok(())
    }

    // ── rollback ─────────────────────────────────────────────────────────────

    /// Undo every ledgered block above `block_number`, newest first.
    ///
    /// Blocks applied while audit was off have no ledger row and stay applied;
    /// the reloaded checkpoint then sits above `block_number`.
    pub async fn rollback_to(&mut self, block_number: u64) -> Result<(), IndexerError> {
        let started = Instant::now();
        info!(block_number, "Rolling back");
        let mut tx = self.store.begin().await?;
        let result = self.rollback_in_tx(&mut tx, block_number).await;
        let (undone, applied, state) = finish(tx, result).await?;

        self.registry.set_applied(applied);
        self.adopt_state(state)?;
        if self.last_processed_block_number > block_number {
            warn!(
                requested = block_number,
                reached = self.last_processed_block_number,
                "Blocks applied without audit cannot be rolled back"
            );
        }
        info!(
            block_number = self.last_processed_block_number,
            undone,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rollback complete"
        );
        Ok(())
    }

    async fn rollback_in_tx(
        &self,
        tx: &mut S::Tx,
        block_number: u64,
    ) -> Result<(usize, Vec<Migration>, Option<IndexState>), IndexerError> {
        let schema = &self.config.schema;
        let ledger = tx.block_txids_after(schema, block_number).await?;
        for entry in &ledger {
            info!(block_number = entry.block_number, txid = entry.txid, "Rolling back block");
            tx.undo_transaction(entry.txid)
                .await
                .map_err(|e| IndexerError::Rollback {
                    block_number: entry.block_number,
                    txid: entry.txid,
                    reason: e.to_string(),
                })?;
        }
        tx.delete_block_txids_after(schema, block_number).await?;

        let history = tx.migration_history(schema).await?;
        let applied = self.registry.restore(&history)?;
        let state = tx.load_index_state(schema).await?;
        Ok((ledger.len(), applied, state))
    }

    // ── out-of-band operations ───────────────────────────────────────────────

    /// Run a migration sequence in its own transaction, outside the block stream.
    ///
    /// Returns the names of the migrations applied.
    pub async fn migrate(
        &mut self,
        sequence_name: &str,
        block_number: u64,
    ) -> Result<Vec<String>, IndexerError> {
        self.ensure_initialized().await?;
        let mut applied = self.registry.applied().to_vec();
        let mut tx = self.store.begin().await?;
        let result = self
            .registry
            .run_sequence(&mut tx, &mut applied, sequence_name, block_number, false)
            .await;
        let ran = finish(tx, result).await?;
        self.registry.set_applied(applied);
        info!(sequence = sequence_name, block_number, applied = ran.len(), "Migration sequence complete");
        Ok(ran)
    }

    /// Reload the checkpoint from the database and adopt it.
    pub async fn load_index_state(&mut self) -> Result<IndexState, IndexerError> {
        let mut tx = self.store.begin().await?;
        let result = tx.load_index_state(&self.config.schema).await;
        let state = finish(tx, result).await?;
        self.adopt_state(state)?;
        Ok(self.index_state())
    }

    /// A zero row (seeded by setup, nothing processed yet) counts as no state.
    fn adopt_state(&mut self, state: Option<IndexState>) -> Result<(), IndexerError> {
        let Some(state) = state.filter(|s| !is_unprocessed(s)) else {
            self.last_processed_block_number = 0;
            self.last_processed_block_hash.clear();
            self.is_replay = false;
            if let Some(first) = self.version_names.first() {
                self.handler_version_name = first.clone();
            }
            return Ok(());
        };
        if !self.version_names.contains(&state.handler_version_name) {
            return Err(IndexerError::UnknownHandlerVersion(state.handler_version_name));
        }
        self.last_processed_block_number = state.block_number;
        self.last_processed_block_hash = state.block_hash;
        self.last_irreversible_block_number = state.last_irreversible_block_number;
        self.is_replay = state.is_replay;
        self.handler_version_name = state.handler_version_name;
        Ok(())
    }

    // ── accessors ────────────────────────────────────────────────────────────

    fn version(&self, name: &str) -> Option<&HandlerVersion<S::Tx>> {
        self.versions.iter().find(|v| v.version_name == name)
    }

    /// The in-memory checkpoint as an [`IndexState`].
    pub fn index_state(&self) -> IndexState {
        IndexState {
            block_number: self.last_processed_block_number,
            block_hash: self.last_processed_block_hash.clone(),
            last_irreversible_block_number: self.last_irreversible_block_number,
            handler_version_name: self.handler_version_name.clone(),
            is_replay: self.is_replay,
        }
    }

    pub fn last_processed_block_number(&self) -> u64 {
        self.last_processed_block_number
    }

    pub fn last_processed_block_hash(&self) -> &str {
        &self.last_processed_block_hash
    }

    pub fn last_irreversible_block_number(&self) -> u64 {
        self.last_irreversible_block_number
    }

    pub fn handler_version_name(&self) -> &str {
        &self.handler_version_name
    }

    /// `None` until the first toggle after construction or [`reset`](Self::reset).
    pub fn audit_enabled(&self) -> Option<bool> {
        self.audit_enabled
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

fn is_unprocessed(state: &IndexState) -> bool {
    state.block_number == 0 && state.block_hash.is_empty()
}

/// Blocks behind the last irreversible block can never be rolled back.
pub(crate) fn audit_required(block_number: u64, last_irreversible_block_number: u64) -> bool {
    block_number >= last_irreversible_block_number
}

/// Commit on success; on failure roll back and hand back the original error.
async fn finish<T: StoreTransaction, R>(
    tx: T,
    result: Result<R, IndexerError>,
) -> Result<R, IndexerError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Failed to roll back aborted transaction");
            }
            Err(e)
        }
    }
}
