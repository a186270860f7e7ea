//! Named migration batches, triggered at startup or from inside an updater.

use tracing::debug;

use crate::error::IndexerError;
use crate::migration::Migration;
use crate::migration_runner::{find_duplicates, MigrationRunner};
use crate::store::StoreTransaction;
use crate::types::MigrationRecord;

/// A named, ordered list of migrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSequence {
    pub sequence_name: String,
    pub migrations: Vec<Migration>,
}

impl MigrationSequence {
    pub fn new(sequence_name: impl Into<String>, migrations: Vec<Migration>) -> Self {
        Self {
            sequence_name: sequence_name.into(),
            migrations,
        }
    }
}

/// Every sequence a handler knows about, validated once at construction.
///
/// The applied list is the concatenation of sequences in the order they were
/// run against the schema; each run validates the ledger against it.
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    schema: String,
    sequences: Vec<MigrationSequence>,
    applied: Vec<Migration>,
}

impl MigrationRegistry {
    /// Sequence names must be unique, and migration names unique across all sequences.
    pub fn new(
        schema: impl Into<String>,
        sequences: Vec<MigrationSequence>,
    ) -> Result<Self, IndexerError> {
        let seq_dups = find_duplicates(sequences.iter().map(|s| s.sequence_name.as_str()));
        if !seq_dups.is_empty() {
            return Err(IndexerError::NonUniqueMigrationSequence(seq_dups));
        }
        let name_dups = find_duplicates(
            sequences
                .iter()
                .flat_map(|s| s.migrations.iter().map(Migration::name)),
        );
        if !name_dups.is_empty() {
            return Err(IndexerError::NonUniqueMigrationName(name_dups));
        }
        Ok(Self {
            schema: schema.into(),
            sequences,
            applied: Vec::new(),
        })
    }

    pub fn sequence(&self, name: &str) -> Option<&MigrationSequence> {
        self.sequences.iter().find(|s| s.sequence_name == name)
    }

    pub fn sequences(&self) -> &[MigrationSequence] {
        &self.sequences
    }

    /// Migrations known to be applied to the schema, in ledger order.
    pub fn applied(&self) -> &[Migration] {
        &self.applied
    }

    pub(crate) fn set_applied(&mut self, applied: Vec<Migration>) {
        self.applied = applied;
    }

    /// Run `sequence_name` inside `tx`, extending `applied` on success.
    ///
    /// `applied` is the caller's working copy; it is only adopted by the
    /// registry once the surrounding transaction commits.
    pub(crate) async fn run_sequence<T: StoreTransaction>(
        &self,
        tx: &mut T,
        applied: &mut Vec<Migration>,
        sequence_name: &str,
        block_number: u64,
        initial: bool,
    ) -> Result<Vec<String>, IndexerError> {
        let sequence = self
            .sequence(sequence_name)
            .ok_or_else(|| IndexerError::NonExistentMigration(sequence_name.to_string()))?;

        let already_applied = sequence
            .migrations
            .iter()
            .all(|m| applied.iter().any(|a| a.name() == m.name()));
        if already_applied && !sequence.migrations.is_empty() {
            debug!(sequence = sequence_name, "Migration sequence already applied");
            return Ok(Vec::new());
        }

        let mut all = applied.clone();
        all.extend(sequence.migrations.iter().cloned());
        let mut runner = MigrationRunner::new(&self.schema, all.clone())?.skip_setup();
        let ran = runner
            .migrate(tx, sequence_name, block_number, initial)
            .await?;
        *applied = all;
        Ok(ran)
    }

    /// Rebuild the applied list from ledger rows.
    pub(crate) fn restore(&self, history: &[MigrationRecord]) -> Result<Vec<Migration>, IndexerError> {
        let mut applied = Vec::with_capacity(history.len());
        for (index, record) in history.iter().enumerate() {
            let sequence = self
                .sequence(&record.sequence)
                .ok_or(IndexerError::ExtraMigrationHistory)?;
            let position = applied
                .iter()
                .filter(|m: &&Migration| sequence.migrations.iter().any(|s| s.name() == m.name()))
                .count();
            match sequence.migrations.get(position) {
                Some(m) if m.name() == record.name => applied.push(m.clone()),
                Some(m) => {
                    return Err(IndexerError::MismatchedMigrations {
                        expected: m.name().to_string(),
                        actual: record.name.clone(),
                        index,
                    })
                }
                None => return Err(IndexerError::ExtraMigrationHistory),
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(name: &str) -> Migration {
        Migration::new(name, "s1", "SELECT 1;", None).unwrap()
    }

    fn record(name: &str, sequence: &str) -> MigrationRecord {
        MigrationRecord {
            name: name.into(),
            sequence: sequence.into(),
            block_number: 0,
        }
    }

    fn registry() -> MigrationRegistry {
        MigrationRegistry::new(
            "s1",
            vec![
                MigrationSequence::new("init", vec![m("createTodoTable"), m("createTaskTable")]),
                MigrationSequence::new("v2", vec![m("createAssigneeTable")]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn duplicate_sequence_names_rejected() {
        let err = MigrationRegistry::new(
            "s1",
            vec![
                MigrationSequence::new("init", vec![m("a")]),
                MigrationSequence::new("init", vec![m("b")]),
            ],
        )
        .unwrap_err();
        match err {
            IndexerError::NonUniqueMigrationSequence(d) => assert_eq!(d, vec!["init".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn migration_names_unique_across_sequences() {
        let err = MigrationRegistry::new(
            "s1",
            vec![
                MigrationSequence::new("init", vec![m("a"), m("b")]),
                MigrationSequence::new("v2", vec![m("b"), m("a")]),
            ],
        )
        .unwrap_err();
        match err {
            IndexerError::NonUniqueMigrationName(d) => assert_eq!(d, vec!["b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn restore_follows_ledger_order() {
        let reg = registry();
        let applied = reg
            .restore(&[
                record("createTodoTable", "init"),
                record("createTaskTable", "init"),
                record("createAssigneeTable", "v2"),
            ])
            .unwrap();
        let names: Vec<_> = applied.iter().map(Migration::name).collect();
        assert_eq!(names, ["createTodoTable", "createTaskTable", "createAssigneeTable"]);
    }

    #[test]
    fn restore_rejects_unknown_sequence() {
        let err = registry().restore(&[record("x", "gone")]).unwrap_err();
        assert!(matches!(err, IndexerError::ExtraMigrationHistory));
    }

    #[test]
    fn restore_rejects_out_of_order_migration() {
        let err = registry()
            .restore(&[record("createTaskTable", "init")])
            .unwrap_err();
        match err {
            IndexerError::MismatchedMigrations {
                expected,
                actual,
                index,
            } => {
                assert_eq!(expected, "createTodoTable");
                assert_eq!(actual, "createTaskTable");
                assert_eq!(index, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
