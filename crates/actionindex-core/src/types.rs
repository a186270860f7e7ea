//! Shared types for the block-application pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── BlockInfo ────────────────────────────────────────────────────────────────

/// Header data of a block, enough to check chain linkage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    /// Block number.
    pub block_number: u64,
    /// Block hash.
    pub block_hash: String,
    /// Hash of the parent block.
    pub previous_block_hash: String,
    /// Block production time.
    pub timestamp: DateTime<Utc>,
}

impl BlockInfo {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockInfo) -> bool {
        self.block_number == parent.block_number + 1 && self.previous_block_hash == parent.block_hash
    }
}

// ─── Action / Block ───────────────────────────────────────────────────────────

/// A typed, payload-carrying state change inside a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Type tag used to route the action to updaters (e.g. `"add_todo"`).
    #[serde(rename = "type")]
    pub action_type: String,
    /// Arbitrary action payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Action {
    pub fn new(action_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            action_type: action_type.into(),
            payload,
        }
    }
}

/// An ordered list of actions plus the header they were included under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub block_info: BlockInfo,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Block {
    /// Shorthand for `block.block_info.block_number`.
    pub fn number(&self) -> u64 {
        self.block_info.block_number
    }

    /// Shorthand for `block.block_info.block_hash`.
    pub fn hash(&self) -> &str {
        &self.block_info.block_hash
    }
}

// ─── BlockMeta / NextBlock ────────────────────────────────────────────────────

/// What the block source knows about a block it hands out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// The source detected a fork: this block replaces one already handed out.
    pub is_rollback: bool,
    /// First block surfaced in the current reading session.
    pub is_first_block: bool,
    /// The source is replaying history from a fixed start point.
    pub is_replay: bool,
    /// Last block number the source guarantees will never be rolled back.
    pub last_irreversible_block_number: u64,
}

/// A block together with its source metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct NextBlock {
    pub block: Block,
    pub meta: BlockMeta,
}

/// The engine's answer to an incoming block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The block's updaters ran and its bookkeeping was committed.
    Applied,
    /// Same number and hash as the last processed block; nothing was done.
    AlreadyProcessed,
    /// The source is out of position; it should resume from `next_block`.
    Seek { next_block: u64 },
}

// ─── Bookkeeping rows ─────────────────────────────────────────────────────────

/// Persisted checkpoint, one row per schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    /// Last processed block number.
    pub block_number: u64,
    /// Last processed block hash (empty when nothing has been processed).
    pub block_hash: String,
    /// Last irreversible block number known when the block was applied.
    pub last_irreversible_block_number: u64,
    /// Handler version in effect after the block.
    pub handler_version_name: String,
    /// Whether the block was applied as part of a replay.
    pub is_replay: bool,
}

impl Default for IndexState {
    fn default() -> Self {
        Self {
            block_number: 0,
            block_hash: String::new(),
            last_irreversible_block_number: 0,
            handler_version_name: DEFAULT_HANDLER_VERSION.to_string(),
            is_replay: false,
        }
    }
}

/// Handler version recorded before any version has been chosen.
pub const DEFAULT_HANDLER_VERSION: &str = "v1";

/// A row of the migration-history ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration name.
    pub name: String,
    /// Sequence the migration was applied as part of.
    pub sequence: String,
    /// Block number being processed when it was applied (0 for startup).
    pub block_number: u64,
}

/// A row of the block-to-transaction ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTxid {
    pub block_number: u64,
    pub txid: i64,
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn info(number: u64, hash: &str, prev: &str) -> BlockInfo {
        BlockInfo {
            block_number: number,
            block_hash: hash.into(),
            previous_block_hash: prev.into(),
            timestamp: DateTime::<Utc>::from_timestamp(1_528_285_617 + number as i64, 0)
                .unwrap_or_default(),
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = info(1, "0xaaa", "0x000");
        let child = info(2, "0xbbb", "0xaaa");
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn block_extends_false_on_gap() {
        let a = info(1, "0xaaa", "0x000");
        let c = info(3, "0xccc", "0xaaa"); // gap
        assert!(!c.extends(&a));
    }

    #[test]
    fn block_deserializes_from_camel_case_json() {
        let json = r#"{
            "blockInfo": {
                "blockNumber": 1,
                "blockHash": "0001",
                "previousBlockHash": "0000",
                "timestamp": "2018-06-06T11:53:37Z"
            },
            "actions": [
                { "type": "add_todo", "payload": { "todoName": "Groceries", "id": 1 } }
            ]
        }"#;
        let block: Block = serde_json::from_str(json).unwrap();
        assert_eq!(block.number(), 1);
        assert_eq!(block.hash(), "0001");
        assert_eq!(block.actions[0].action_type, "add_todo");
        assert_eq!(block.actions[0].payload["todoName"], "Groceries");
    }

    #[test]
    fn fresh_index_state_uses_default_version() {
        let state = IndexState::default();
        assert_eq!(state.block_number, 0);
        assert!(state.block_hash.is_empty());
        assert_eq!(state.handler_version_name, "v1");
    }
}
