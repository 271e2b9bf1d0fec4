//! Mock implementations of the storage traits for engine testing.
//!
//! [`MockStorage`] keeps parts, partitions, and rows in memory and emits the
//! same categorized errors a real backing store would: a write against a
//! missing table raises `NoSuchPartition`, a missing column `NoSuchColumn`,
//! a too-narrow column `DataTypeMismatch`, and a duplicate (entity,
//! timestamp) key `UniqueViolation`. Arbitrary one-shot errors can be
//! scripted per operation to exercise deadlock and non-recoverable paths
//! deterministically, without a database.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::datatype::{max_data_type, DataType};
use crate::descriptor::ColumnDescriptor;
use crate::engine::WriteBatch;
use crate::error::{StorageError, StorageResult};
use crate::partitioning::Partition;
use crate::traits::{EntityDirectory, TrendStorage};

#[derive(Clone, Debug)]
struct MockRow {
    values: HashMap<String, String>,
    modified: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
struct MockTable {
    columns: Vec<ColumnDescriptor>,
    rows: BTreeMap<(i64, DateTime<Utc>), MockRow>,
}

#[derive(Default)]
struct MockState {
    tables: HashMap<String, MockTable>,
    history: HashMap<String, Vec<MockRow>>,
    modified_log: HashMap<(String, DateTime<Utc>), DateTime<Utc>>,
    scripted_errors: HashMap<&'static str, VecDeque<StorageError>>,
}

/// In-memory store session for deterministic engine tests.
#[derive(Clone, Default)]
pub struct MockStorage {
    state: Arc<Mutex<MockState>>,
}

impl MockStorage {
    /// An empty mock store.
    pub fn new() -> MockStorage {
        MockStorage::default()
    }

    /// Create a table with the given columns, as if bootstrapped out of band.
    pub fn create_table(&mut self, table: &str, columns: Vec<ColumnDescriptor>) {
        let mut state = self.state.lock().unwrap();
        state.tables.insert(
            table.to_string(),
            MockTable {
                columns,
                rows: BTreeMap::new(),
            },
        );
    }

    /// Seed one row, bypassing all checks.
    pub fn seed_row(
        &mut self,
        table: &str,
        entity_id: i64,
        timestamp: DateTime<Utc>,
        values: &[(&str, &str)],
        modified: DateTime<Utc>,
    ) {
        let mut state = self.state.lock().unwrap();
        let table = state.tables.get_mut(table).expect("seed into missing table");
        table.rows.insert(
            (entity_id, timestamp),
            MockRow {
                values: values
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                modified,
            },
        );
    }

    /// Script a one-shot error for the named operation; consumed in order.
    pub fn fail_next(&mut self, operation: &'static str, error: StorageError) {
        let mut state = self.state.lock().unwrap();
        state
            .scripted_errors
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Number of rows in a table; 0 when the table does not exist.
    pub fn row_count(&self, table: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// A row's values, if present.
    pub fn row(
        &self,
        table: &str,
        entity_id: i64,
        timestamp: DateTime<Utc>,
    ) -> Option<HashMap<String, String>> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)?
            .rows
            .get(&(entity_id, timestamp))
            .map(|r| r.values.clone())
    }

    /// A row's modification timestamp, if present.
    pub fn row_modified(
        &self,
        table: &str,
        entity_id: i64,
        timestamp: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)?
            .rows
            .get(&(entity_id, timestamp))
            .map(|r| r.modified)
    }

    /// A column's current type, if the table and column exist.
    pub fn column_type(&self, table: &str, column: &str) -> Option<DataType> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)?
            .columns
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.data_type)
    }

    /// The recorded high-water mark for a (table, timestamp) bucket.
    pub fn modified(&self, table: &str, timestamp: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let state = self.state.lock().unwrap();
        state
            .modified_log
            .get(&(table.to_string(), timestamp))
            .copied()
    }

    /// Number of history rows recorded for a history table.
    pub fn history_len(&self, history_table: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.history.get(history_table).map_or(0, Vec::len)
    }

    fn take_scripted(state: &mut MockState, operation: &'static str) -> StorageResult<()> {
        if let Some(error) = state
            .scripted_errors
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(())
    }

    fn check_batch(state: &MockState, batch: &WriteBatch) -> StorageResult<()> {
        let table = state
            .tables
            .get(&batch.table)
            .ok_or_else(|| StorageError::NoSuchPartition {
                table: batch.table.clone(),
            })?;
        for column in &batch.columns {
            let current = table
                .columns
                .iter()
                .find(|c| c.name == column.name)
                .ok_or_else(|| StorageError::NoSuchColumn {
                    column: column.name.clone(),
                })?;
            if max_data_type(current.data_type, column.data_type) != current.data_type {
                return Err(StorageError::DataTypeMismatch {
                    column: column.name.clone(),
                    detail: format!(
                        "column is {}, batch needs {}",
                        current.data_type, column.data_type
                    ),
                });
            }
        }
        Ok(())
    }

    fn insert_checked(
        &self,
        operation: &'static str,
        batch: &WriteBatch,
    ) -> StorageResult<u64> {
        let mut state = self.state.lock().unwrap();
        Self::take_scripted(&mut state, operation)?;
        Self::check_batch(&state, batch)?;

        // All-or-nothing: reject the whole batch before touching any row.
        let table = state.tables.get_mut(&batch.table).unwrap();
        for row in &batch.rows {
            if table.rows.contains_key(&(row.entity_id, row.timestamp)) {
                return Err(StorageError::UniqueViolation);
            }
        }
        for row in &batch.rows {
            let values = batch
                .columns
                .iter()
                .zip(&row.values)
                .map(|(c, v)| (c.name.clone(), v.clone()))
                .collect();
            table.rows.insert(
                (row.entity_id, row.timestamp),
                MockRow {
                    values,
                    modified: batch.modified,
                },
            );
        }
        Ok(batch.rows.len() as u64)
    }
}

#[async_trait]
impl TrendStorage for MockStorage {
    async fn copy_rows(&mut self, batch: &WriteBatch) -> StorageResult<u64> {
        self.insert_checked("copy_rows", batch)
    }

    async fn insert_rows(&mut self, batch: &WriteBatch) -> StorageResult<u64> {
        self.insert_checked("insert_rows", batch)
    }

    async fn update_rows(&mut self, batch: &WriteBatch) -> StorageResult<u64> {
        let mut state = self.state.lock().unwrap();
        Self::take_scripted(&mut state, "update_rows")?;
        Self::check_batch(&state, batch)?;

        let mut displaced = Vec::new();
        {
            let table = state.tables.get_mut(&batch.table).unwrap();
            for row in &batch.rows {
                let values: HashMap<String, String> = batch
                    .columns
                    .iter()
                    .zip(&row.values)
                    .map(|(c, v)| (c.name.clone(), v.clone()))
                    .collect();
                match table.rows.get_mut(&(row.entity_id, row.timestamp)) {
                    Some(existing) => {
                        displaced.push(existing.clone());
                        existing.values.extend(values);
                        existing.modified = existing.modified.max(batch.modified);
                    }
                    None => {
                        table.rows.insert(
                            (row.entity_id, row.timestamp),
                            MockRow {
                                values,
                                modified: batch.modified,
                            },
                        );
                    }
                }
            }
        }
        if let Some(history_table) = &batch.history_table {
            state
                .history
                .entry(history_table.clone())
                .or_default()
                .extend(displaced);
        }
        Ok(batch.rows.len() as u64)
    }

    async fn create_partition(
        &mut self,
        table: &str,
        _partition: &Partition,
        columns: &[ColumnDescriptor],
    ) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_scripted(&mut state, "create_partition")?;
        // Concurrent creation by another writer is success, not an error.
        state
            .tables
            .entry(table.to_string())
            .or_insert_with(|| MockTable {
                columns: columns.to_vec(),
                rows: BTreeMap::new(),
            });
        Ok(())
    }

    async fn ensure_columns(
        &mut self,
        table: &str,
        columns: &[ColumnDescriptor],
    ) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_scripted(&mut state, "ensure_columns")?;
        let table = state
            .tables
            .get_mut(table)
            .ok_or_else(|| StorageError::NoSuchPartition {
                table: table.to_string(),
            })?;
        for column in columns {
            if !table.columns.iter().any(|c| c.name == column.name) {
                table.columns.push(column.clone());
            }
        }
        Ok(())
    }

    async fn ensure_column_types(
        &mut self,
        table: &str,
        columns: &[ColumnDescriptor],
    ) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_scripted(&mut state, "ensure_column_types")?;
        let table = state
            .tables
            .get_mut(table)
            .ok_or_else(|| StorageError::NoSuchPartition {
                table: table.to_string(),
            })?;
        for column in columns {
            if let Some(current) = table.columns.iter_mut().find(|c| c.name == column.name) {
                current.data_type = max_data_type(current.data_type, column.data_type);
            }
        }
        Ok(())
    }

    async fn mark_modified(
        &mut self,
        table: &str,
        timestamp: DateTime<Utc>,
        modified: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_scripted(&mut state, "mark_modified")?;
        let entry = state
            .modified_log
            .entry((table.to_string(), timestamp))
            .or_insert(modified);
        *entry = (*entry).max(modified);
        Ok(())
    }
}

/// In-memory entity directory.
#[derive(Clone, Default)]
pub struct MockEntityDirectory {
    entities: Arc<Mutex<HashMap<String, i64>>>,
}

impl MockEntityDirectory {
    /// An empty directory.
    pub fn new() -> MockEntityDirectory {
        MockEntityDirectory::default()
    }

    /// A directory pre-populated with (name, id) pairs.
    pub fn with_entities(entities: &[(&str, i64)]) -> MockEntityDirectory {
        let directory = MockEntityDirectory::new();
        {
            let mut map = directory.entities.lock().unwrap();
            for (name, id) in entities {
                map.insert(name.to_string(), *id);
            }
        }
        directory
    }

    /// Add one entity.
    pub fn add(&self, name: &str, id: i64) {
        self.entities.lock().unwrap().insert(name.to_string(), id);
    }
}

#[async_trait]
impl EntityDirectory for MockEntityDirectory {
    async fn resolve(&self, name: &str) -> StorageResult<i64> {
        self.entities
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| StorageError::EntityResolution(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_emits_categorized_errors() {
        let mut store = MockStorage::new();
        let batch = WriteBatch {
            table: "missing_123".to_string(),
            partition: None,
            columns: vec![ColumnDescriptor::new("a", DataType::SmallInt)],
            rows: Vec::new(),
            modified: Utc::now(),
            job_id: 1,
            history_table: None,
        };
        assert!(matches!(
            store.insert_rows(&batch).await,
            Err(StorageError::NoSuchPartition { .. })
        ));

        store.create_table("missing_123", vec![]);
        assert!(matches!(
            store.insert_rows(&batch).await,
            Err(StorageError::NoSuchColumn { .. })
        ));
    }
}
