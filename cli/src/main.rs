//! ActionIndex CLI: operate a Postgres schema indexed by ActionIndex.
//!
//! # Commands
//! ```text
//! actionindex --config actionindex.json setup
//! actionindex --config actionindex.json status
//! actionindex --config actionindex.json migrate  --sequence v2 [--block 1200]
//! actionindex --config actionindex.json rollback --to 1150
//! actionindex info
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use actionindex_core::store::{
    AUDIT_SCHEMA, BLOCK_TXID_TABLE, BOOKKEEPING_TABLES, INDEX_STATE_TABLE,
};
use actionindex_core::types::DEFAULT_HANDLER_VERSION;
use actionindex_core::{ActionHandler, HandlerVersion, IndexState, Store, StoreTransaction};
use actionindex_storage::{PostgresStore, PostgresTransaction};

mod config;
mod logging;

use config::CliConfig;

#[derive(Parser)]
#[command(
    name = "actionindex",
    about = "Block-application and rollback engine (ActionIndex CLI)",
    long_about = "
ActionIndex CLI: bootstrap, migrate, inspect and roll back a Postgres schema
maintained by the ActionIndex engine. Rollback requires the CyanAudit extension.

ENVIRONMENT VARIABLES:
  DATABASE_URL   Postgres connection URL (overrides `database_url` in the config)
  RUST_LOG       Log filter (overrides `log` in the config)
",
    version
)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, global = true, default_value = "actionindex.json")]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the schema, bookkeeping tables and audit extension, then run the init sequence
    Setup,

    /// Print the persisted index state as JSON
    Status,

    /// Run a migration sequence outside the block stream
    Migrate {
        /// Sequence name from the config file
        #[arg(long)]
        sequence: String,
        /// Block number to record in the migration ledger
        #[arg(long, default_value_t = 0)]
        block: u64,
    },

    /// Undo every audited block above the given block number
    Rollback {
        /// Last block to keep
        #[arg(long)]
        to: u64,
    },

    /// Show build and bookkeeping info
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Info => cmd_info(&cli.config),
        Commands::Setup => {
            let (store, config) = open(&cli.config, cli.verbose).await?;
            cmd_setup(store, &config).await
        }
        Commands::Status => {
            let (store, config) = open(&cli.config, cli.verbose).await?;
            cmd_status(store, &config).await
        }
        Commands::Migrate { ref sequence, block } => {
            let (store, config) = open(&cli.config, cli.verbose).await?;
            cmd_migrate(store, &config, sequence, block).await
        }
        Commands::Rollback { to } => {
            let (store, config) = open(&cli.config, cli.verbose).await?;
            cmd_rollback(store, &config, to).await
        }
    }
}

/// Load the config, install logging and connect.
async fn open(config_path: &Path, verbose: bool) -> Result<(PostgresStore, CliConfig)> {
    let mut config = CliConfig::load(config_path)?;
    if verbose {
        config.log.level = "debug".into();
    }
    logging::init_tracing(&config.log);

    let url = config.database_url()?;
    let store = PostgresStore::connect_with_options(&url, (&config.pool).into())
        .await
        .context("connect to Postgres")?;
    Ok((store, config))
}

// ─── Handler wiring ───────────────────────────────────────────────────────────

/// Persisted index state, or `None` on a schema that was never set up.
async fn persisted_state(store: &PostgresStore, schema: &str) -> Result<Option<IndexState>> {
    let mut tx = store.begin().await?;
    let state = if tx.table_exists(schema, INDEX_STATE_TABLE).await? {
        tx.load_index_state(schema).await?
    } else {
        None
    };
    tx.rollback().await?;
    Ok(state)
}

/// A handler with no updaters, registered under the schema's current version
/// name so the persisted checkpoint can be adopted.
async fn operator_handler(
    store: PostgresStore,
    config: &CliConfig,
) -> Result<ActionHandler<PostgresStore>> {
    let version = persisted_state(&store, &config.handler.schema)
        .await?
        .map(|s| s.handler_version_name)
        .unwrap_or_else(|| DEFAULT_HANDLER_VERSION.to_string());
    let versions = vec![HandlerVersion::<PostgresTransaction>::new(version, Vec::new())];
    let handler = ActionHandler::new(
        store,
        config.handler.clone(),
        versions,
        config.migration_sequences()?,
    )?;
    Ok(handler)
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_setup(store: PostgresStore, config: &CliConfig) -> Result<()> {
    let mut handler = operator_handler(store, config).await?;
    handler.initialize().await.context("initialize schema")?;
    let applied: Vec<&str> = handler.registry().applied().iter().map(|m| m.name()).collect();
    println!("Schema '{}' ready", config.handler.schema);
    println!("  Applied migrations: {}", applied.join(", "));
    println!("  Last processed block: {}", handler.last_processed_block_number());
    Ok(())
}

async fn cmd_status(store: PostgresStore, config: &CliConfig) -> Result<()> {
    let schema = &config.handler.schema;
    let Some(state) = persisted_state(&store, schema).await? else {
        println!("{}", json!({ "schema": schema, "index_state": null }));
        return Ok(());
    };

    let mut tx = store.begin().await?;
    let migrations = tx.migration_history(schema).await?;
    let rollback_points = if tx.table_exists(schema, BLOCK_TXID_TABLE).await? {
        tx.block_txids_after(schema, state.last_irreversible_block_number).await?.len()
    } else {
        0
    };
    tx.rollback().await?;

    let status = json!({
        "schema": schema,
        "index_state": state,
        "migrations": migrations,
        "reversible_blocks": rollback_points,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_migrate(
    store: PostgresStore,
    config: &CliConfig,
    sequence: &str,
    block: u64,
) -> Result<()> {
    let mut handler = operator_handler(store, config).await?;
    let applied = handler
        .migrate(sequence, block)
        .await
        .with_context(|| format!("run migration sequence '{sequence}'"))?;
    if applied.is_empty() {
        println!("Sequence '{sequence}' already applied");
    } else {
        println!("Applied {} migration(s) from '{sequence}':", applied.len());
        for name in &applied {
            println!("  {name}");
        }
    }
    Ok(())
}

async fn cmd_rollback(store: PostgresStore, config: &CliConfig, to: u64) -> Result<()> {
    let mut handler = operator_handler(store, config).await?;
    handler.load_index_state().await?;
    let from = handler.last_processed_block_number();
    if to >= from {
        println!("Nothing to roll back (last processed block is {from})");
        return Ok(());
    }
    handler
        .rollback_to(to)
        .await
        .with_context(|| format!("roll back to block {to}"))?;
    let reached = handler.last_processed_block_number();
    info!(from, to, reached, "Rollback finished");
    println!("Rolled back from block {from} to block {reached}");
    if reached > to {
        println!("  Blocks above {reached} were applied without audit and remain in place");
    }
    Ok(())
}

fn cmd_info(config_path: &Path) -> Result<()> {
    println!("ActionIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Storage backend: PostgreSQL (SERIALIZABLE transactions)");
    println!("  Audit extension schema: {AUDIT_SCHEMA}");
    println!("  Bookkeeping tables: {}", BOOKKEEPING_TABLES.join(", "));
    println!("  Default handler version: {DEFAULT_HANDLER_VERSION}");

    if config_path.exists() {
        let config = CliConfig::load(config_path)?;
        println!("  Config: {}", config_path.display());
        println!("    Schema: {}", config.handler.schema);
        println!("    Init sequence: {}", config.handler.init_sequence);
        for seq in &config.sequences {
            let names: Vec<&str> = seq.migrations.iter().map(|m| m.name.as_str()).collect();
            println!("    Sequence '{}': {}", seq.name, names.join(", "));
        }
    }
    Ok(())
}
