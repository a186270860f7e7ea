//! Shared fixtures for the engine integration tests: the todo-list chain,
//! its updaters and migration sequences.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use actionindex_core::{
    Action, ActionHandler, Block, BlockContext, BlockInfo, HandlerConfig, HandlerVersion,
    IndexerError, Migration, MigrationSequence, Updater,
};
use actionindex_storage::{MemoryStore, MemoryTransaction};

pub const SCHEMA: &str = "todos";

// ─── Chains ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Fixture {
    blockchain: Vec<Block>,
    forked: Vec<Block>,
}

fn fixture() -> Fixture {
    let mut p = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    p.push("tests/fixtures/blockchain.json");
    let json = std::fs::read_to_string(p).expect("fixture not found");
    serde_json::from_str(&json).expect("invalid fixture")
}

/// Blocks 1–3 of the canonical chain.
pub fn blockchain() -> Vec<Block> {
    fixture().blockchain
}

/// Blocks 1–4 of the chain that forks off after block 1.
pub fn forked() -> Vec<Block> {
    fixture().forked
}

/// A block with the given actions, linked to `previous_block_hash`.
pub fn block(number: u64, hash: &str, previous_block_hash: &str, actions: Vec<Action>) -> Block {
    Block {
        block_info: BlockInfo {
            block_number: number,
            block_hash: hash.into(),
            previous_block_hash: previous_block_hash.into(),
            timestamp: DateTime::<Utc>::from_timestamp(1_528_285_617 + number as i64, 0)
                .unwrap_or_default(),
        },
        actions,
    }
}

// ─── Updaters ─────────────────────────────────────────────────────────────────

pub struct AddTodo;

#[async_trait]
impl Updater<MemoryTransaction> for AddTodo {
    fn action_type(&self) -> &str {
        "add_todo"
    }

    async fn apply(
        &self,
        payload: &Value,
        ctx: &mut BlockContext<'_, MemoryTransaction>,
    ) -> Result<(), IndexerError> {
        ctx.tx()
            .insert("todo", json!({ "id": payload["id"], "name": payload["todoName"] }))?;
        Ok(())
    }
}

pub struct AddTasks;

#[async_trait]
impl Updater<MemoryTransaction> for AddTasks {
    fn action_type(&self) -> &str {
        "add_tasks"
    }

    async fn apply(
        &self,
        payload: &Value,
        ctx: &mut BlockContext<'_, MemoryTransaction>,
    ) -> Result<(), IndexerError> {
        let tasks = payload["tasks"].as_array().cloned().unwrap_or_default();
        for name in tasks {
            ctx.tx().insert(
                "task",
                json!({ "name": name, "completed": false, "todo_id": payload["todoId"] }),
            )?;
        }
        Ok(())
    }
}

pub struct UpdateTask;

#[async_trait]
impl Updater<MemoryTransaction> for UpdateTask {
    fn action_type(&self) -> &str {
        "update_task"
    }

    async fn apply(
        &self,
        payload: &Value,
        ctx: &mut BlockContext<'_, MemoryTransaction>,
    ) -> Result<(), IndexerError> {
        ctx.tx().update(
            "task",
            &json!({ "name": payload["taskName"], "todo_id": payload["todoId"] }),
            &json!({ "completed": payload["completed"] }),
        )?;
        Ok(())
    }
}

/// Fails every `action_type` action while `armed` is set.
pub struct Tripwire {
    pub action_type: String,
    pub armed: Arc<AtomicBool>,
}

#[async_trait]
impl Updater<MemoryTransaction> for Tripwire {
    fn action_type(&self) -> &str {
        &self.action_type
    }

    async fn apply(
        &self,
        _payload: &Value,
        _ctx: &mut BlockContext<'_, MemoryTransaction>,
    ) -> Result<(), IndexerError> {
        if self.armed.load(Ordering::SeqCst) {
            return Err(IndexerError::Updater {
                action_type: self.action_type.clone(),
                reason: "tripwire armed".into(),
            });
        }
        Ok(())
    }
}

/// `upgrade { sequence, version }`: migrate, then switch handler version.
pub struct Upgrade;

#[async_trait]
impl Updater<MemoryTransaction> for Upgrade {
    fn action_type(&self) -> &str {
        "upgrade"
    }

    async fn apply(
        &self,
        payload: &Value,
        ctx: &mut BlockContext<'_, MemoryTransaction>,
    ) -> Result<(), IndexerError> {
        if let Some(sequence) = payload["sequence"].as_str() {
            ctx.migrate(sequence).await?;
        }
        if let Some(version) = payload["version"].as_str() {
            ctx.switch_version(version)?;
        }
        Ok(())
    }
}

/// v2 of `add_todo`: also records who it is assigned to.
pub struct AddAssignedTodo;

#[async_trait]
impl Updater<MemoryTransaction> for AddAssignedTodo {
    fn action_type(&self) -> &str {
        "add_todo"
    }

    async fn apply(
        &self,
        payload: &Value,
        ctx: &mut BlockContext<'_, MemoryTransaction>,
    ) -> Result<(), IndexerError> {
        let id = ctx
            .tx()
            .insert("todo", json!({ "id": payload["id"], "name": payload["todoName"] }))?;
        ctx.tx()
            .insert("assignee", json!({ "todo_id": id, "name": payload["assignee"] }))?;
        Ok(())
    }
}

// ─── Handler wiring ───────────────────────────────────────────────────────────

pub fn todo_updaters() -> Vec<Arc<dyn Updater<MemoryTransaction>>> {
    vec![Arc::new(AddTodo), Arc::new(AddTasks), Arc::new(UpdateTask)]
}

pub fn v1() -> HandlerVersion<MemoryTransaction> {
    let mut updaters = todo_updaters();
    updaters.push(Arc::new(Upgrade));
    HandlerVersion::new("v1", updaters)
}

pub fn v2() -> HandlerVersion<MemoryTransaction> {
    let updaters: Vec<Arc<dyn Updater<MemoryTransaction>>> =
        vec![Arc::new(AddAssignedTodo), Arc::new(AddTasks), Arc::new(UpdateTask)];
    HandlerVersion::new("v2", updaters)
}

fn migration(name: &str, up: &str) -> Migration {
    Migration::new(name, SCHEMA, up, None).expect("valid migration")
}

pub fn sequences() -> Vec<MigrationSequence> {
    vec![
        MigrationSequence::new(
            "init",
            vec![
                migration(
                    "createTodoTable",
                    "CREATE TABLE ${schema~}.todo (id serial PRIMARY KEY, name text NOT NULL);",
                ),
                migration(
                    "createTaskTable",
                    "CREATE TABLE ${schema~}.task (id serial PRIMARY KEY, name text NOT NULL, \
                     completed boolean DEFAULT FALSE, todo_id integer REFERENCES ${schema~}.todo(id));",
                ),
            ],
        ),
        MigrationSequence::new(
            "v2",
            vec![migration(
                "createAssigneeTable",
                "CREATE TABLE ${schema~}.assignee (id serial PRIMARY KEY, name text, \
                 todo_id integer REFERENCES ${schema~}.todo(id));",
            )],
        ),
    ]
}

pub fn handler_with(
    store: &MemoryStore,
    versions: Vec<HandlerVersion<MemoryTransaction>>,
) -> ActionHandler<MemoryStore> {
    ActionHandler::new(
        store.clone(),
        HandlerConfig::for_schema(SCHEMA),
        versions,
        sequences(),
    )
    .expect("valid handler")
}

pub fn handler(store: &MemoryStore) -> ActionHandler<MemoryStore> {
    handler_with(store, vec![v1(), v2()])
}

// ─── Assertions ───────────────────────────────────────────────────────────────

/// Tasks as `(name, completed, todo_id)`, sorted, ignoring ids.
pub fn tasks(store: &MemoryStore) -> Vec<(String, bool, i64)> {
    let mut tasks: Vec<_> = store
        .rows("task")
        .iter()
        .map(|r| {
            (
                r["name"].as_str().unwrap_or_default().to_string(),
                r["completed"].as_bool().unwrap_or_default(),
                r["todo_id"].as_i64().unwrap_or_default(),
            )
        })
        .collect();
    tasks.sort();
    tasks
}
