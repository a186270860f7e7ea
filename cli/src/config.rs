//! `actionindex.json`: connection, schema and migration sequences.
//!
//! ```json
//! {
//!   "database_url": "postgresql://localhost/todos",
//!   "schema": "todos",
//!   "init_sequence": "init",
//!   "sequences": [
//!     { "name": "init", "migrations": [{ "name": "createTodoTable", "up": "sql/todo.sql" }] }
//!   ],
//!   "pool": { "max_connections": 4 },
//!   "log": { "level": "info", "json": false }
//! }
//! ```
//!
//! Script paths are relative to the config file.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use actionindex_core::{HandlerConfig, Migration, MigrationSequence};
use actionindex_storage::PostgresOptions;

use crate::logging::LogConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    /// Overridden by `DATABASE_URL` when set.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(flatten)]
    pub handler: HandlerConfig,
    #[serde(default)]
    pub sequences: Vec<SequenceConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Directory the config was loaded from.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequenceConfig {
    pub name: String,
    #[serde(default)]
    pub migrations: Vec<MigrationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    pub name: String,
    pub up: PathBuf,
    #[serde(default)]
    pub down: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl From<&PoolConfig> for PostgresOptions {
    fn from(pool: &PoolConfig) -> Self {
        Self {
            max_connections: pool.max_connections,
            min_connections: pool.min_connections,
            connect_timeout_secs: pool.connect_timeout_secs,
        }
    }
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read config file '{}'", path.display()))?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::parse(&json, base_dir).with_context(|| format!("parse config file '{}'", path.display()))
    }

    pub fn parse(json: &str, base_dir: PathBuf) -> Result<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        config.handler.validate()?;
        config.base_dir = base_dir;
        Ok(config)
    }

    /// `DATABASE_URL` from the environment, else the config file.
    pub fn database_url(&self) -> Result<String> {
        resolve_database_url(std::env::var("DATABASE_URL").ok(), self.database_url.as_deref())
    }

    /// Load every configured sequence's scripts from disk.
    pub fn migration_sequences(&self) -> Result<Vec<MigrationSequence>> {
        self.sequences
            .iter()
            .map(|seq| {
                let migrations = seq
                    .migrations
                    .iter()
                    .map(|m| {
                        let down = m.down.as_ref().map(|d| self.base_dir.join(d));
                        Migration::from_files(
                            m.name.as_str(),
                            self.handler.schema.as_str(),
                            self.base_dir.join(&m.up),
                            down.as_deref(),
                        )
                        .with_context(|| format!("load migration '{}' of sequence '{}'", m.name, seq.name))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(MigrationSequence::new(seq.name.as_str(), migrations))
            })
            .collect()
    }
}

fn resolve_database_url(env: Option<String>, configured: Option<&str>) -> Result<String> {
    env.filter(|url| !url.is_empty())
        .or_else(|| configured.map(str::to_string))
        .ok_or_else(|| anyhow!("no database URL: set DATABASE_URL or `database_url` in the config file"))
}
