//! Abstractions over the external collaborators of the storage layer.
//!
//! The write engine drives every step through [`TrendStorage`], which hides
//! whether the backing store is PostgreSQL or the in-memory mock. All
//! corrective operations have "ensure" semantics: safe to execute more than
//! once, and a store-side "already exists" answer is success, never an
//! error — concurrent writers may race on the same schema objects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::descriptor::ColumnDescriptor;
use crate::engine::WriteBatch;
use crate::error::StorageResult;
use crate::partitioning::Partition;

/// Name-to-id resolution against the entity directory.
#[async_trait]
pub trait EntityDirectory: Send + Sync {
    /// Resolve an entity name to its numeric id. A missing entity surfaces
    /// as [`crate::StorageError::EntityResolution`]; this layer never
    /// creates entities on the write path.
    async fn resolve(&self, name: &str) -> StorageResult<i64>;
}

/// One session against the backing store, driven strictly sequentially by
/// the write engine. Every operation performs at least one blocking round
/// trip and may block on store-side locks.
#[async_trait]
pub trait TrendStorage: Send {
    /// Bulk transfer: stream the whole batch in one round trip, one row per
    /// line. All-or-nothing for the batch.
    async fn copy_rows(&mut self, batch: &WriteBatch) -> StorageResult<u64>;

    /// Write the batch with one parameterized multi-row insert statement.
    async fn insert_rows(&mut self, batch: &WriteBatch) -> StorageResult<u64>;

    /// Update-merge: stage the batch, overwrite existing (entity, timestamp)
    /// rows with `modified = max(existing, new)`, then insert only rows
    /// whose key is absent. Idempotent for repeated delivery of one batch.
    async fn update_rows(&mut self, batch: &WriteBatch) -> StorageResult<u64>;

    /// Create the partition backing table covering `partition`'s interval,
    /// with the given trend columns. An already-existing table is success.
    async fn create_partition(
        &mut self,
        table: &str,
        partition: &Partition,
        columns: &[ColumnDescriptor],
    ) -> StorageResult<()>;

    /// Add any of the given columns that are missing, with their deduced
    /// types. Already-present columns are left untouched.
    async fn ensure_columns(
        &mut self,
        table: &str,
        columns: &[ColumnDescriptor],
    ) -> StorageResult<()>;

    /// Widen existing columns to at least the given types, using
    /// `max_data_type(current, deduced)` per column. Never narrows.
    async fn ensure_column_types(
        &mut self,
        table: &str,
        columns: &[ColumnDescriptor],
    ) -> StorageResult<()>;

    /// Record `modified` as the latest write timestamp for the
    /// (table, timestamp) bucket. Monotonic: an older value is a no-op.
    async fn mark_modified(
        &mut self,
        table: &str,
        timestamp: DateTime<Utc>,
        modified: DateTime<Utc>,
    ) -> StorageResult<()>;
}
