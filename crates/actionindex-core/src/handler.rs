//! Updater trait, handler versions and the per-block context.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::migration::Migration;
use crate::sequence::MigrationRegistry;
use crate::store::StoreTransaction;
use crate::types::BlockInfo;

/// Trait for user-provided updaters.
///
/// An updater mutates the database in response to one action type. It runs
/// inside the block's transaction; returning an error aborts the whole block.
#[async_trait]
pub trait Updater<T: StoreTransaction>: Send + Sync {
    /// The action type this updater processes (e.g. `"add_todo"`).
    fn action_type(&self) -> &str;

    /// Apply one action's payload.
    async fn apply(
        &self,
        payload: &serde_json::Value,
        ctx: &mut BlockContext<'_, T>,
    ) -> Result<(), IndexerError>;
}

/// A named set of updaters in force for a stretch of the block stream.
pub struct HandlerVersion<T: StoreTransaction> {
    pub version_name: String,
    pub updaters: Vec<Arc<dyn Updater<T>>>,
}

impl<T: StoreTransaction> HandlerVersion<T> {
    pub fn new(version_name: impl Into<String>, updaters: Vec<Arc<dyn Updater<T>>>) -> Self {
        Self {
            version_name: version_name.into(),
            updaters,
        }
    }

    /// Updaters registered for `action_type`, in declaration order.
    pub fn updaters_for<'a>(
        &'a self,
        action_type: &'a str,
    ) -> impl Iterator<Item = &'a Arc<dyn Updater<T>>> + 'a {
        self.updaters
            .iter()
            .filter(move |u| u.action_type() == action_type)
    }
}

impl<T: StoreTransaction> std::fmt::Debug for HandlerVersion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types: Vec<&str> = self.updaters.iter().map(|u| u.action_type()).collect();
        f.debug_struct("HandlerVersion")
            .field("version_name", &self.version_name)
            .field("updaters", &types)
            .finish()
    }
}

/// Everything an updater may touch while a block is being applied.
pub struct BlockContext<'a, T: StoreTransaction> {
    pub(crate) tx: &'a mut T,
    pub(crate) txid: i64,
    pub(crate) block: &'a BlockInfo,
    pub(crate) is_replay: bool,
    pub(crate) registry: &'a MigrationRegistry,
    pub(crate) applied: &'a mut Vec<Migration>,
    pub(crate) version_names: &'a [String],
    pub(crate) switched_to: Option<String>,
}

impl<'a, T: StoreTransaction> BlockContext<'a, T> {
    /// The block transaction.
    pub fn tx(&mut self) -> &mut T {
        self.tx
    }

    /// Identifier of the block transaction.
    pub fn txid(&self) -> i64 {
        self.txid
    }

    /// Header of the block being applied.
    pub fn block(&self) -> &BlockInfo {
        self.block
    }

    pub fn is_replay(&self) -> bool {
        self.is_replay
    }

    /// Run a registered migration sequence inside the block transaction.
    ///
    /// Recorded in the ledger against the current block number; a sequence
    /// that is already applied is a no-op.
    pub async fn migrate(&mut self, sequence_name: &str) -> Result<(), IndexerError> {
        self.registry
            .run_sequence(
                &mut *self.tx,
                &mut *self.applied,
                sequence_name,
                self.block.block_number,
                false,
            )
            .await
            .map(|_| ())
    }

    /// Switch to another handler version after the current updater returns.
    ///
    /// Remaining updaters for the current action are skipped.
    pub fn switch_version(&mut self, version_name: &str) -> Result<(), IndexerError> {
        if !self.version_names.iter().any(|v| v == version_name) {
            return Err(IndexerError::UnknownHandlerVersion(version_name.to_string()));
        }
        self.switched_to = Some(version_name.to_string());
        Ok(())
    }
}
