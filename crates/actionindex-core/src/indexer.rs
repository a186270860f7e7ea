//! The drive loop: pulls blocks from a source and feeds the action handler.
//!
//! ```text
//! loop {
//!     next_block()  ── None ──▶ sleep(poll_interval)
//!         │
//!         ▼
//!     handle_block_with()
//!         ├── Applied / AlreadyProcessed ──▶ continue
//!         └── Seek { n } ──▶ source.seek(n)
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::action_handler::ActionHandler;
use crate::config::IndexerConfig;
use crate::error::IndexerError;
use crate::source::BlockSource;
use crate::store::Store;
use crate::types::BlockOutcome;

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Pulling and applying blocks.
    Running,
    /// Reached `stop_at_block`.
    Stopped,
    /// A block failed; the handler's error was returned to the caller.
    Error,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Couples a [`BlockSource`] with an [`ActionHandler`].
pub struct Indexer<S: Store, B: BlockSource> {
    handler: ActionHandler<S>,
    source: B,
    config: IndexerConfig,
    state: IndexerState,
}

impl<S: Store, B: BlockSource> Indexer<S, B> {
    pub fn new(handler: ActionHandler<S>, source: B, config: IndexerConfig) -> Self {
        Self {
            handler,
            source,
            config,
            state: IndexerState::Idle,
        }
    }

    /// Pull one block and hand it to the handler.
    ///
    /// Returns `None` when the source has nothing new.
    pub async fn step(&mut self) -> Result<Option<BlockOutcome>, IndexerError> {
        let Some(next) = self.source.next_block().await? else {
            return Ok(None);
        };
        let outcome = match self.handler.handle_block_with(&next.block, next.meta).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.state = IndexerState::Error;
                error!(block_number = next.block.number(), error = %e, "Failed to handle block");
                return Err(e);
            }
        };
        if let BlockOutcome::Seek { next_block } = outcome {
            debug!(from = next.block.number(), to = next_block, "Repositioning block source");
            self.source.seek(next_block).await?;
        }
        Ok(Some(outcome))
    }

    /// Process everything the source has right now. Returns the number of
    /// blocks applied.
    pub async fn catch_up(&mut self) -> Result<u64, IndexerError> {
        self.state = IndexerState::Running;
        let mut applied = 0;
        while let Some(outcome) = self.step().await? {
            if outcome == BlockOutcome::Applied {
                applied += 1;
            }
            if self.reached_stop() {
                self.state = IndexerState::Stopped;
                break;
            }
        }
        info!(
            applied,
            head = self.handler.last_processed_block_number(),
            "Caught up with block source"
        );
        Ok(applied)
    }

    /// Run until `stop_at_block` is reached, polling when the source is idle.
    pub async fn run(&mut self) -> Result<(), IndexerError> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        self.state = IndexerState::Running;
        info!(stop_at_block = ?self.config.stop_at_block, "Starting indexer");

        loop {
            if self.reached_stop() {
                self.state = IndexerState::Stopped;
                info!(
                    block_number = self.handler.last_processed_block_number(),
                    "Reached stop block"
                );
                return Ok(());
            }
            if self.step().await?.is_none() {
                tokio::time::sleep(poll_interval).await;
            }
        }
    }

    fn reached_stop(&self) -> bool {
        self.config
            .stop_at_block
            .is_some_and(|stop| self.handler.last_processed_block_number() >= stop)
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    pub fn handler(&self) -> &ActionHandler<S> {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut ActionHandler<S> {
        &mut self.handler
    }

    pub fn source_mut(&mut self) -> &mut B {
        &mut self.source
    }

    pub fn into_parts(self) -> (ActionHandler<S>, B) {
        (self.handler, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(IndexerState::Idle.to_string(), "idle");
        assert_eq!(IndexerState::Running.to_string(), "running");
        assert_eq!(IndexerState::Stopped.to_string(), "stopped");
        assert_eq!(IndexerState::Error.to_string(), "error");
    }
}
