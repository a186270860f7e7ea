//! Block sources feeding the engine.
//!
//! A source hands out blocks with contiguous numbering. When the chain it
//! serves forks, it rewinds to the last common ancestor and re-delivers from
//! there with [`BlockMeta::is_rollback`] set on the first replacement block.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::IndexerError;
use crate::tracker::BlockTracker;
use crate::types::{Block, BlockInfo, BlockMeta, NextBlock};

/// Number of served headers kept for fork detection.
pub const DEFAULT_TRACKER_WINDOW: usize = 128;

/// Where the engine gets its blocks from.
#[async_trait]
pub trait BlockSource: Send {
    /// The next block, or `None` if nothing new is available yet.
    async fn next_block(&mut self) -> Result<Option<NextBlock>, IndexerError>;

    /// Resume serving from `block_number`.
    async fn seek(&mut self, block_number: u64) -> Result<(), IndexerError>;
}

/// Serves an in-memory chain. The chain can be swapped out to simulate forks.
pub struct VecBlockSource {
    chain: Vec<Block>,
    position: u64,
    tracker: BlockTracker,
    first_block: bool,
    pending_rollback: bool,
    is_replay: bool,
    last_irreversible_block_number: u64,
}

impl VecBlockSource {
    /// Serve `chain` starting at its lowest block number.
    pub fn new(mut chain: Vec<Block>) -> Self {
        chain.sort_by_key(Block::number);
        let position = chain.first().map(Block::number).unwrap_or(1);
        Self {
            chain,
            position,
            tracker: BlockTracker::new(DEFAULT_TRACKER_WINDOW),
            first_block: true,
            pending_rollback: false,
            is_replay: false,
            last_irreversible_block_number: 0,
        }
    }

    /// Parse a JSON array of blocks.
    pub fn from_json(json: &str) -> Result<Self, IndexerError> {
        let chain: Vec<Block> = serde_json::from_str(json)
            .map_err(|e| IndexerError::Other(format!("invalid block JSON: {e}")))?;
        Ok(Self::new(chain))
    }

    /// Mark every served block as part of a replay.
    pub fn with_replay(mut self, is_replay: bool) -> Self {
        self.is_replay = is_replay;
        self
    }

    pub fn set_last_irreversible(&mut self, block_number: u64) {
        self.last_irreversible_block_number = block_number;
    }

    /// Swap in a different chain; a fork is detected on the next read.
    pub fn replace_chain(&mut self, mut chain: Vec<Block>) {
        chain.sort_by_key(Block::number);
        self.chain = chain;
    }

    /// Highest block number in the chain.
    pub fn head_block_number(&self) -> Option<u64> {
        self.chain.last().map(Block::number)
    }

    /// Number of the block the next read will serve.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn block_at(&self, number: u64) -> Option<&Block> {
        self.chain.iter().find(|b| b.number() == number)
    }

    fn on_chain(&self, info: &BlockInfo) -> bool {
        self.block_at(info.block_number)
            .is_some_and(|b| b.hash() == info.block_hash)
    }

    /// If the last served block left the chain, rewind to the fork point.
    fn rewind_if_forked(&mut self) {
        let Some(head) = self.tracker.head() else {
            return;
        };
        if self.on_chain(head) {
            return;
        }
        let old_head = head.block_number;
        let ancestor = self
            .tracker
            .common_ancestor(|b| self.on_chain(b))
            .map(|b| b.block_number);
        match ancestor {
            Some(number) => {
                self.tracker.rewind_to(number);
                self.position = number + 1;
            }
            None => {
                let oldest = self.tracker.oldest().map_or(self.position, |b| b.block_number);
                self.tracker.clear();
                self.position = oldest;
            }
        }
        warn!(
            old_head,
            resume_from = self.position,
            depth = old_head + 1 - self.position,
            "Fork detected, rewinding"
        );
        self.pending_rollback = true;
    }
}

#[async_trait]
impl BlockSource for VecBlockSource {
    async fn next_block(&mut self) -> Result<Option<NextBlock>, IndexerError> {
        self.rewind_if_forked();
        let Some(block) = self.block_at(self.position).cloned() else {
            return Ok(None);
        };
        if let Err(depth) = self.tracker.push(block.block_info.clone()) {
            return Err(IndexerError::Other(format!(
                "block {} does not extend the served chain (depth {depth})",
                block.number()
            )));
        }

        let meta = BlockMeta {
            is_rollback: self.pending_rollback,
            is_first_block: self.first_block,
            is_replay: self.is_replay,
            last_irreversible_block_number: self.last_irreversible_block_number,
        };
        self.pending_rollback = false;
        self.first_block = false;
        self.position += 1;
        Ok(Some(NextBlock { block, meta }))
    }

    async fn seek(&mut self, block_number: u64) -> Result<(), IndexerError> {
        debug!(block_number, "Seeking block source");
        let parent = block_number.saturating_sub(1);
        self.tracker.rewind_to(parent);
        if self.tracker.head().map(|b| b.block_number) != Some(parent) {
            self.tracker.clear();
        }
        self.position = block_number;
        self.first_block = true;
        self.pending_rollback = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;

    fn block(number: u64, hash: &str, prev: &str) -> Block {
        Block {
            block_info: BlockInfo {
                block_number: number,
                block_hash: hash.into(),
                previous_block_hash: prev.into(),
                timestamp: DateTime::<Utc>::from_timestamp(number as i64, 0).unwrap_or_default(),
            },
            actions: Vec::new(),
        }
    }

    fn main_chain() -> Vec<Block> {
        vec![block(1, "0001", "0000"), block(2, "0002", "0001"), block(3, "0003", "0002")]
    }

    #[tokio::test]
    async fn serves_in_order_with_first_flag() {
        let mut source = VecBlockSource::new(main_chain());
        let first = source.next_block().await.unwrap().unwrap();
        assert_eq!(first.block.number(), 1);
        assert!(first.meta.is_first_block);
        assert!(!first.meta.is_rollback);

        let second = source.next_block().await.unwrap().unwrap();
        assert_eq!(second.block.number(), 2);
        assert!(!second.meta.is_first_block);

        source.next_block().await.unwrap();
        assert!(source.next_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fork_rewinds_to_common_ancestor() {
        let mut source = VecBlockSource::new(main_chain());
        for _ in 0..3 {
            source.next_block().await.unwrap();
        }
        source.replace_chain(vec![
            block(1, "0001", "0000"),
            block(2, "F002", "0001"),
            block(3, "F003", "F002"),
            block(4, "F004", "F003"),
        ]);

        let next = source.next_block().await.unwrap().unwrap();
        assert_eq!(next.block.number(), 2);
        assert_eq!(next.block.hash(), "F002");
        assert!(next.meta.is_rollback);

        let after = source.next_block().await.unwrap().unwrap();
        assert_eq!(after.block.hash(), "F003");
        assert!(!after.meta.is_rollback);
    }

    #[tokio::test]
    async fn seek_repositions_and_marks_first() {
        let mut source = VecBlockSource::new(main_chain());
        source.next_block().await.unwrap();
        source.seek(3).await.unwrap();
        let next = source.next_block().await.unwrap().unwrap();
        assert_eq!(next.block.number(), 3);
        assert!(next.meta.is_first_block);
    }

    #[tokio::test]
    async fn irreversible_marker_is_reported() {
        let mut source = VecBlockSource::new(main_chain());
        source.set_last_irreversible(2);
        let next = source.next_block().await.unwrap().unwrap();
        assert_eq!(next.meta.last_irreversible_block_number, 2);
    }
}
