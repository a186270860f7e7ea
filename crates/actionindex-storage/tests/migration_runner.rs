//! Migration runner behaviour against the in-memory store.

use actionindex_core::migration_runner::MigrationRunner;
use actionindex_core::{IndexState, IndexerError, Migration, Store, StoreTransaction};
use actionindex_storage::MemoryStore;

const SCHEMA: &str = "runner";

fn m(name: &str) -> Migration {
    Migration::new(
        name,
        SCHEMA,
        &format!("CREATE TABLE ${{schema~}}.{name} (id serial PRIMARY KEY);"),
        Some(&format!("DROP TABLE ${{schema~}}.{name};")),
    )
    .unwrap()
}

async fn set_up(store: &MemoryStore, migrations: Vec<Migration>) -> MigrationRunner {
    let mut runner = MigrationRunner::new(SCHEMA, migrations).unwrap();
    let mut tx = store.begin().await.unwrap();
    runner.setup(&mut tx).await.unwrap();
    tx.commit().await.unwrap();
    runner
}

async fn migrate(
    store: &MemoryStore,
    runner: &mut MigrationRunner,
    initial: bool,
) -> Result<Vec<String>, IndexerError> {
    let mut tx = store.begin().await?;
    let applied = runner.migrate(&mut tx, "default", 0, initial).await?;
    tx.commit().await?;
    Ok(applied)
}

#[tokio::test]
async fn setup_creates_schema_tables_and_audit() {
    let store = MemoryStore::new();
    set_up(&store, vec![]).await;
    // twice is fine
    set_up(&store, vec![]).await;

    let mut tx = store.begin().await.unwrap();
    assert!(tx.schema_exists(SCHEMA).await.unwrap());
    assert!(tx.schema_exists("cyanaudit").await.unwrap());
    for table in ["_migration", "_index_state", "_block_number_txid"] {
        assert!(tx.table_exists(SCHEMA, table).await.unwrap(), "{table}");
    }
    assert!(store.audit_installed());
    assert_eq!(store.index_state(SCHEMA), Some(IndexState::default()));
}

#[tokio::test]
async fn setup_keeps_existing_index_state() {
    let store = MemoryStore::new();
    set_up(&store, vec![]).await;

    let state = IndexState {
        block_number: 7,
        block_hash: "0007".into(),
        ..IndexState::default()
    };
    let mut tx = store.begin().await.unwrap();
    tx.save_index_state(SCHEMA, &state).await.unwrap();
    tx.commit().await.unwrap();

    set_up(&store, vec![]).await;
    assert_eq!(store.index_state(SCHEMA), Some(state));
}

#[tokio::test]
async fn migrate_applies_in_order_and_records_ledger() {
    let store = MemoryStore::new();
    let mut runner = set_up(&store, vec![m("todo"), m("task")]).await;
    let applied = migrate(&store, &mut runner, false).await.unwrap();
    assert_eq!(applied, vec!["todo", "task"]);

    let names: Vec<_> = store
        .migration_records(SCHEMA)
        .into_iter()
        .map(|r| (r.name, r.sequence))
        .collect();
    assert_eq!(
        names,
        vec![
            ("todo".to_string(), "default".to_string()),
            ("task".to_string(), "default".to_string())
        ]
    );
    assert_eq!(
        store.executed_scripts(),
        vec![
            "CREATE TABLE \"runner\".todo (id serial PRIMARY KEY);".to_string(),
            "CREATE TABLE \"runner\".task (id serial PRIMARY KEY);".to_string(),
        ]
    );

    // Nothing left to do.
    assert!(migrate(&store, &mut runner, false).await.unwrap().is_empty());
}

#[tokio::test]
async fn only_unapplied_migrations_are_returned() {
    let store = MemoryStore::new();
    let mut runner = set_up(&store, vec![m("a"), m("b")]).await;
    migrate(&store, &mut runner, false).await.unwrap();

    let runner = MigrationRunner::new(SCHEMA, vec![m("a"), m("b"), m("c")]).unwrap();
    let mut tx = store.begin().await.unwrap();
    let unapplied = runner.get_unapplied_migrations(&mut tx, false).await.unwrap();
    let names: Vec<_> = unapplied.iter().map(Migration::name).collect();
    assert_eq!(names, ["c"]);
}

#[tokio::test]
async fn diverging_history_is_rejected() {
    let store = MemoryStore::new();
    let mut runner = set_up(&store, vec![m("a"), m("b")]).await;
    migrate(&store, &mut runner, false).await.unwrap();

    let mut reordered = MigrationRunner::new(SCHEMA, vec![m("a"), m("x"), m("b")])
        .unwrap()
        .skip_setup();
    let err = migrate(&store, &mut reordered, false).await.unwrap_err();
    assert!(matches!(err, IndexerError::MismatchedMigrationsHistory));
    assert_eq!(store.migration_records(SCHEMA).len(), 2);
}

#[tokio::test]
async fn extra_history_is_rejected_unless_initial() {
    let store = MemoryStore::new();
    let mut runner = set_up(&store, vec![m("a"), m("b"), m("c")]).await;
    migrate(&store, &mut runner, false).await.unwrap();

    let mut shorter = MigrationRunner::new(SCHEMA, vec![m("a"), m("b")]).unwrap();
    let err = migrate(&store, &mut shorter, false).await.unwrap_err();
    assert!(matches!(err, IndexerError::ExtraMigrationHistory));

    let applied = migrate(&store, &mut shorter, true).await.unwrap();
    assert!(applied.is_empty());
}

#[tokio::test]
async fn migrate_without_setup_reports_missing_schema() {
    let store = MemoryStore::new();
    let mut runner = MigrationRunner::new("doesntexist", vec![]).unwrap();
    let err = migrate(&store, &mut runner, false).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Schema 'doesntexist' does not exist. Make sure you have run `setup()` before migrating"
    );
}

#[tokio::test]
async fn migrate_without_setup_reports_missing_table() {
    let store = MemoryStore::new();
    let mut tx = store.begin().await.unwrap();
    tx.create_schema(SCHEMA).await.unwrap();
    tx.commit().await.unwrap();

    let mut runner = MigrationRunner::new(SCHEMA, vec![m("a")]).unwrap();
    let err = migrate(&store, &mut runner, false).await.unwrap_err();
    assert!(matches!(err, IndexerError::MissingTable(t) if t == "_migration"));
}

#[tokio::test]
async fn migrate_without_audit_reports_missing_audit_schema() {
    let store = MemoryStore::new();
    let mut tx = store.begin().await.unwrap();
    tx.create_schema(SCHEMA).await.unwrap();
    tx.create_bookkeeping_tables(SCHEMA).await.unwrap();
    tx.commit().await.unwrap();

    let mut runner = MigrationRunner::new(SCHEMA, vec![m("a")]).unwrap();
    let err = migrate(&store, &mut runner, false).await.unwrap_err();
    assert!(matches!(err, IndexerError::MissingSchema(s) if s == "cyanaudit"));
}

#[tokio::test]
async fn externally_provisioned_schema_can_be_migrated() {
    let store = MemoryStore::new();
    set_up(&store, vec![]).await;

    // A fresh runner that never called setup() passes the pre-flight check.
    let mut runner = MigrationRunner::new(SCHEMA, vec![m("a")]).unwrap();
    let applied = migrate(&store, &mut runner, false).await.unwrap();
    assert_eq!(applied, vec!["a"]);
}

#[tokio::test]
async fn failed_migration_rolls_back_ledger() {
    let store = MemoryStore::new();
    let mut runner = set_up(&store, vec![m("a"), m("b")]).await;

    let mut tx = store.begin().await.unwrap();
    runner.migrate(&mut tx, "default", 0, false).await.unwrap();
    // dropped without commit
    drop(tx);

    assert!(store.migration_records(SCHEMA).is_empty());
    assert!(store.executed_scripts().is_empty());
}

#[tokio::test]
async fn down_runs_the_rendered_down_script() {
    let store = MemoryStore::new();
    let mut tx = store.begin().await.unwrap();
    m("todo").down(&mut tx).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        store.executed_scripts(),
        vec!["DROP TABLE \"runner\".todo;".to_string()]
    );

    let no_down = Migration::new("noDown", SCHEMA, "SELECT 1;", None).unwrap();
    let mut tx = store.begin().await.unwrap();
    let err = no_down.down(&mut tx).await.unwrap_err();
    assert!(matches!(err, IndexerError::MissingDownQuery(n) if n == "noDown"));
}
