//! Handler and drive-loop configuration.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::store::is_valid_identifier;

/// Configuration for an [`ActionHandler`](crate::ActionHandler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Database schema holding the indexed tables and bookkeeping tables.
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Migration sequence run once when the handler initializes.
    #[serde(default = "default_init_sequence")]
    pub init_sequence: String,
}

fn default_schema() -> String {
    "public".into()
}

fn default_init_sequence() -> String {
    "init".into()
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            init_sequence: default_init_sequence(),
        }
    }
}

impl HandlerConfig {
    /// Config for a given schema with defaults elsewhere.
    pub fn for_schema(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            ..Default::default()
        }
    }

    /// Reject schema names that cannot be interpolated into SQL safely.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if !is_valid_identifier(&self.schema) {
            return Err(IndexerError::InvalidSchemaName(self.schema.clone()));
        }
        Ok(())
    }
}

/// Configuration for the [`Indexer`](crate::Indexer) drive loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// How long to wait when the block source has nothing new (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Stop once this block has been applied. `None` = run forever.
    #[serde(default)]
    pub stop_at_block: Option<u64>,
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stop_at_block: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_json() {
        let cfg: HandlerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, HandlerConfig::default());
        assert_eq!(cfg.schema, "public");
        assert_eq!(cfg.init_sequence, "init");

        let idx: IndexerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(idx.poll_interval_ms, 500);
        assert!(idx.stop_at_block.is_none());
    }

    #[test]
    fn validate_schema_name() {
        assert!(HandlerConfig::for_schema("todos").validate().is_ok());
        let err = HandlerConfig::for_schema("todo-list").validate().unwrap_err();
        assert!(matches!(err, IndexerError::InvalidSchemaName(_)));
        let err = HandlerConfig::for_schema("Todos").validate().unwrap_err();
        assert!(matches!(err, IndexerError::InvalidSchemaName(_)));
    }
}
