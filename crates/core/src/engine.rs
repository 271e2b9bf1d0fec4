//! The retry / self-healing write engine.
//!
//! A [`WritePlan`] is an ordered queue of [`WriteStep`]s executed strictly
//! sequentially against one store session. A step either completes, or its
//! store error is classified into a tagged [`StepOutcome`] consumed by the
//! driver loop:
//!
//! - `NoSuchPartition` recovers by splicing a `CreatePartition` immediately
//!   before the failed step;
//! - `NoSuchColumn` splices `EnsureColumnsExist` with the types deduced for
//!   this batch;
//! - `DataTypeMismatch` splices `EnsureColumnTypes`, widening to
//!   `max_data_type(current, deduced)`;
//! - `UniqueViolation` **replaces** the failed step with an `UpdateBatch`,
//!   and every remaining insert-family step in the plan switches to update
//!   semantics for good;
//! - a detected deadlock retries the same step after a fixed backoff;
//! - anything else propagates unchanged.
//!
//! A bounded recovery budget aborts with `RetriesExhausted` when corrective
//! steps do not converge. Every corrective step has idempotent "ensure"
//! semantics, so transient races making the same fix necessary twice are
//! absorbed.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::descriptor::{AttributeStore, ColumnDescriptor, TrendStorePart};
use crate::error::{StorageError, StorageResult};
use crate::package::{DataPackage, RefinedPackage, RefinedRow};
use crate::partitioning::{Partition, Partitioning};
use crate::traits::{EntityDirectory, TrendStorage};

/// Batches larger than this go through the bulk transfer protocol; smaller
/// ones use a multi-row insert statement. A latency/setup-cost trade-off,
/// not a correctness distinction.
pub const BULK_COPY_THRESHOLD: usize = 10;

/// Recovery budget per plan.
pub const MAX_RECOVERIES: u32 = 10;

/// Fixed backoff before retrying a step that hit a store-side deadlock.
pub const DEADLOCK_BACKOFF: Duration = Duration::from_secs(5);

/// One batch of rows targeting a single backing table.
#[derive(Clone, Debug)]
pub struct WriteBatch {
    /// Target table (a partition, or an attribute store's base table)
    pub table: String,
    /// The partition the table backs, if partitioned
    pub partition: Option<Partition>,
    /// Batch columns with their deduced types
    pub columns: Vec<ColumnDescriptor>,
    /// Rows to write, entity references already resolved
    pub rows: Vec<RefinedRow>,
    /// Write timestamp recorded on every row
    pub modified: DateTime<Utc>,
    /// Job that produced this batch
    pub job_id: i64,
    /// History companion table for update-merge writes, if any
    pub history_table: Option<String>,
}

/// One step of a write plan.
#[derive(Clone, Debug)]
pub enum WriteStep {
    /// Bulk transfer of a batch
    CopyBatch(WriteBatch),
    /// Multi-row insert of a batch
    InsertBatch(WriteBatch),
    /// Update-merge of a batch
    UpdateBatch(WriteBatch),
    /// Corrective: create a missing partition table
    CreatePartition {
        /// Partition table to create
        table: String,
        /// Interval the table covers
        partition: Partition,
        /// Columns to create it with
        columns: Vec<ColumnDescriptor>,
    },
    /// Corrective: add missing columns with their deduced types
    EnsureColumnsExist {
        /// Table to repair
        table: String,
        /// Columns the batch needs
        columns: Vec<ColumnDescriptor>,
    },
    /// Corrective: widen column types to hold the deduced types
    EnsureColumnTypes {
        /// Table to repair
        table: String,
        /// Columns with their deduced types
        columns: Vec<ColumnDescriptor>,
    },
    /// Record the modification high-water mark for a time bucket
    MarkModified {
        /// Bucket table
        table: String,
        /// Bucket timestamp
        timestamp: DateTime<Utc>,
        /// Write timestamp to record
        modified: DateTime<Utc>,
    },
}

/// Result of applying one step.
#[derive(Debug)]
pub enum StepOutcome {
    /// The step completed, writing this many rows.
    Done(u64),
    /// Splice these corrective steps before the failed step and retry it.
    Recover(Vec<WriteStep>),
    /// Replace the failed step with these steps; the rest of the plan
    /// switches from insert to update semantics permanently.
    Replace(Vec<WriteStep>),
}

/// An ordered queue of write steps sharing one session.
#[derive(Debug, Default)]
pub struct WritePlan {
    steps: Vec<WriteStep>,
}

/// Summary of a completed plan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlanReport {
    /// Total rows written by batch steps
    pub rows_written: u64,
    /// Steps completed, corrective ones included
    pub steps_completed: u32,
    /// Recoveries spent (fix splices, strategy switches, deadlock retries)
    pub recoveries: u32,
}

impl WriteStep {
    fn name(&self) -> &'static str {
        match self {
            WriteStep::CopyBatch(_) => "copy",
            WriteStep::InsertBatch(_) => "insert",
            WriteStep::UpdateBatch(_) => "update",
            WriteStep::CreatePartition { .. } => "create_partition",
            WriteStep::EnsureColumnsExist { .. } => "ensure_columns",
            WriteStep::EnsureColumnTypes { .. } => "ensure_column_types",
            WriteStep::MarkModified { .. } => "mark_modified",
        }
    }

    /// Apply this step against the store, classifying recoverable store
    /// errors into a corrective outcome.
    pub async fn apply<S: TrendStorage>(&self, store: &mut S) -> StorageResult<StepOutcome> {
        match self {
            WriteStep::CopyBatch(batch) => match store.copy_rows(batch).await {
                Ok(rows) => Ok(StepOutcome::Done(rows)),
                Err(error) => recover_batch(batch, error, true),
            },
            WriteStep::InsertBatch(batch) => match store.insert_rows(batch).await {
                Ok(rows) => Ok(StepOutcome::Done(rows)),
                Err(error) => recover_batch(batch, error, true),
            },
            WriteStep::UpdateBatch(batch) => match store.update_rows(batch).await {
                Ok(rows) => Ok(StepOutcome::Done(rows)),
                Err(error) => recover_batch(batch, error, false),
            },
            WriteStep::CreatePartition {
                table,
                partition,
                columns,
            } => {
                store.create_partition(table, partition, columns).await?;
                Ok(StepOutcome::Done(0))
            }
            WriteStep::EnsureColumnsExist { table, columns } => {
                store.ensure_columns(table, columns).await?;
                Ok(StepOutcome::Done(0))
            }
            WriteStep::EnsureColumnTypes { table, columns } => {
                store.ensure_column_types(table, columns).await?;
                Ok(StepOutcome::Done(0))
            }
            WriteStep::MarkModified {
                table,
                timestamp,
                modified,
            } => {
                store.mark_modified(table, *timestamp, *modified).await?;
                Ok(StepOutcome::Done(0))
            }
        }
    }
}

/// Classify a batch step's store error into its corrective outcome.
fn recover_batch(
    batch: &WriteBatch,
    error: StorageError,
    insert_path: bool,
) -> StorageResult<StepOutcome> {
    match error {
        StorageError::NoSuchPartition { .. } => match &batch.partition {
            Some(partition) => Ok(StepOutcome::Recover(vec![WriteStep::CreatePartition {
                table: batch.table.clone(),
                partition: partition.clone(),
                columns: batch.columns.clone(),
            }])),
            // Unpartitioned targets are bootstrapped, not self-healed.
            None => Err(error),
        },
        StorageError::NoSuchColumn { .. } => {
            Ok(StepOutcome::Recover(vec![WriteStep::EnsureColumnsExist {
                table: batch.table.clone(),
                columns: batch.columns.clone(),
            }]))
        }
        StorageError::DataTypeMismatch { .. } => {
            Ok(StepOutcome::Recover(vec![WriteStep::EnsureColumnTypes {
                table: batch.table.clone(),
                columns: batch.columns.clone(),
            }]))
        }
        StorageError::UniqueViolation if insert_path => Ok(StepOutcome::Replace(vec![
            WriteStep::UpdateBatch(batch.clone()),
        ])),
        other => Err(other),
    }
}

impl WritePlan {
    /// An empty plan.
    pub fn new() -> WritePlan {
        WritePlan::default()
    }

    /// Append a step.
    pub fn push(&mut self, step: WriteStep) {
        self.steps.push(step);
    }

    /// The queued steps.
    pub fn steps(&self) -> &[WriteStep] {
        &self.steps
    }

    /// Plan the storage of a refined package into a trend store part:
    /// rows grouped per partition, one batch step per partition (bulk copy
    /// above [`BULK_COPY_THRESHOLD`], multi-row insert below), each followed
    /// by the modification marks for its time buckets.
    pub fn for_trend_package(
        part: &TrendStorePart,
        partitioning: &Partitioning,
        package: &RefinedPackage,
        job_id: i64,
        modified: DateTime<Utc>,
    ) -> StorageResult<WritePlan> {
        Self::plan_trend_batches(part, partitioning, package, job_id, modified, false)
    }

    /// Like [`WritePlan::for_trend_package`], but with update-merge batch
    /// steps throughout. Used for deliveries known to overlap existing rows.
    pub fn for_trend_update(
        part: &TrendStorePart,
        partitioning: &Partitioning,
        package: &RefinedPackage,
        job_id: i64,
        modified: DateTime<Utc>,
    ) -> StorageResult<WritePlan> {
        Self::plan_trend_batches(part, partitioning, package, job_id, modified, true)
    }

    fn plan_trend_batches(
        part: &TrendStorePart,
        partitioning: &Partitioning,
        package: &RefinedPackage,
        job_id: i64,
        modified: DateTime<Utc>,
        update: bool,
    ) -> StorageResult<WritePlan> {
        let columns = deduced_columns(part.trends.as_slice(), package);

        let mut groups: BTreeMap<i64, Vec<RefinedRow>> = BTreeMap::new();
        for row in package.rows() {
            groups
                .entry(partitioning.index(row.timestamp))
                .or_default()
                .push(row.clone());
        }

        let mut plan = WritePlan::new();
        for (index, rows) in groups {
            let partition = partitioning.interval(index);
            let table = partition.table_name(&part.name);
            let mut timestamps: Vec<_> = rows.iter().map(|r| r.timestamp).collect();
            timestamps.sort_unstable();
            timestamps.dedup();

            let batch = WriteBatch {
                table: table.clone(),
                partition: Some(partition),
                columns: columns.clone(),
                rows,
                modified,
                job_id,
                history_table: None,
            };
            plan.push(if update {
                WriteStep::UpdateBatch(batch)
            } else if batch.rows.len() > BULK_COPY_THRESHOLD {
                WriteStep::CopyBatch(batch)
            } else {
                WriteStep::InsertBatch(batch)
            });
            for timestamp in timestamps {
                plan.push(WriteStep::MarkModified {
                    table: table.clone(),
                    timestamp,
                    modified,
                });
            }
        }
        Ok(plan)
    }

    /// Plan the storage of a refined package into an attribute store:
    /// always update-merge against the single backing table, with history.
    pub fn for_attribute_package(
        store: &AttributeStore,
        package: &RefinedPackage,
        job_id: i64,
        modified: DateTime<Utc>,
    ) -> StorageResult<WritePlan> {
        let columns = deduced_columns(store.attributes.as_slice(), package);
        let table = store.table_name();

        let mut plan = WritePlan::new();
        plan.push(WriteStep::UpdateBatch(WriteBatch {
            table: table.clone(),
            partition: None,
            columns,
            rows: package.rows().to_vec(),
            modified,
            job_id,
            history_table: Some(store.history_table_name()),
        }));
        for timestamp in package.timestamps() {
            plan.push(WriteStep::MarkModified {
                table: table.clone(),
                timestamp,
                modified,
            });
        }
        Ok(plan)
    }
}

/// Per-column descriptors for a batch: the deduced type, widened with the
/// part's registered type when the column is already known.
fn deduced_columns(known: &[ColumnDescriptor], package: &RefinedPackage) -> Vec<ColumnDescriptor> {
    let deduced = package.deduce_data_types();
    package
        .trend_names()
        .iter()
        .zip(deduced)
        .map(|(name, data_type)| {
            let data_type = match known.iter().find(|c| &c.name == name) {
                Some(current) => crate::datatype::max_data_type(current.data_type, data_type),
                None => data_type,
            };
            ColumnDescriptor::new(name.clone(), data_type)
        })
        .collect()
}

/// Drive a plan to completion against one store session.
///
/// Steps run strictly sequentially; corrective steps are spliced in front of
/// the failed step and the step retried, bounded by [`MAX_RECOVERIES`].
pub async fn execute_plan<S: TrendStorage>(
    store: &mut S,
    plan: WritePlan,
) -> StorageResult<PlanReport> {
    let mut queue: VecDeque<WriteStep> = plan.steps.into();
    let mut report = PlanReport::default();

    while let Some(step) = queue.pop_front() {
        debug!(step = step.name(), "executing write step");
        match step.apply(store).await {
            Ok(StepOutcome::Done(rows)) => {
                report.rows_written += rows;
                report.steps_completed += 1;
            }
            Ok(StepOutcome::Recover(fixes)) => {
                bump_recoveries(&mut report)?;
                warn!(
                    step = step.name(),
                    fixes = fixes.len(),
                    "write step failed, splicing corrective steps"
                );
                queue.push_front(step);
                for fix in fixes.into_iter().rev() {
                    queue.push_front(fix);
                }
            }
            Ok(StepOutcome::Replace(replacement)) => {
                bump_recoveries(&mut report)?;
                warn!(
                    step = step.name(),
                    "duplicate key, switching remaining plan to update semantics"
                );
                // Permanent strategy change: every queued insert-family step
                // becomes an update, not just the failed one.
                queue = queue
                    .into_iter()
                    .map(|queued| match queued {
                        WriteStep::CopyBatch(batch) | WriteStep::InsertBatch(batch) => {
                            WriteStep::UpdateBatch(batch)
                        }
                        other => other,
                    })
                    .collect();
                for step in replacement.into_iter().rev() {
                    queue.push_front(step);
                }
            }
            Err(StorageError::Deadlock) => {
                bump_recoveries(&mut report)?;
                warn!(step = step.name(), "deadlock detected, backing off");
                tokio::time::sleep(DEADLOCK_BACKOFF).await;
                queue.push_front(step);
            }
            Err(error) => return Err(error),
        }
    }
    Ok(report)
}

fn bump_recoveries(report: &mut PlanReport) -> StorageResult<()> {
    report.recoveries += 1;
    if report.recoveries > MAX_RECOVERIES {
        return Err(StorageError::RetriesExhausted {
            attempts: report.recoveries,
        });
    }
    Ok(())
}

impl TrendStorePart {
    /// Store a refined package, self-healing schema gaps along the way.
    pub async fn store<S: TrendStorage>(
        &self,
        store: &mut S,
        partitioning: &Partitioning,
        package: &RefinedPackage,
        job_id: i64,
    ) -> StorageResult<PlanReport> {
        let plan =
            WritePlan::for_trend_package(self, partitioning, package, job_id, Utc::now())?;
        execute_plan(store, plan).await
    }

    /// Resolve entity references through the directory, then store.
    pub async fn store_raw<S, D>(
        &self,
        store: &mut S,
        directory: &D,
        partitioning: &Partitioning,
        package: &DataPackage,
        job_id: i64,
    ) -> StorageResult<PlanReport>
    where
        S: TrendStorage,
        D: EntityDirectory + ?Sized,
    {
        let refined = package.refine(directory).await?;
        self.store(store, partitioning, &refined, job_id).await
    }

    /// Store with update-merge semantics from the start.
    pub async fn store_update<S: TrendStorage>(
        &self,
        store: &mut S,
        partitioning: &Partitioning,
        package: &RefinedPackage,
        job_id: i64,
    ) -> StorageResult<PlanReport> {
        let plan = WritePlan::for_trend_update(self, partitioning, package, job_id, Utc::now())?;
        execute_plan(store, plan).await
    }
}

impl AttributeStore {
    /// Store a refined package of attribute values: update-merge with
    /// history, self-healing column gaps along the way.
    pub async fn store<S: TrendStorage>(
        &self,
        store: &mut S,
        package: &RefinedPackage,
        job_id: i64,
    ) -> StorageResult<PlanReport> {
        let plan = WritePlan::for_attribute_package(self, package, job_id, Utc::now())?;
        execute_plan(store, plan).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::DataType;
    use crate::mocks::{MockEntityDirectory, MockStorage};
    use crate::package::EntityRef;
    use crate::Granularity;
    use uuid::Uuid;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn part() -> TrendStorePart {
        TrendStorePart {
            id: Uuid::new_v4(),
            name: "node_main_15m".to_string(),
            trends: Vec::new(),
        }
    }

    fn partitioning() -> Partitioning {
        Partitioning::from_seconds(86_400).unwrap()
    }

    fn refined(names: &[&str], rows: Vec<(i64, &str, Vec<&str>)>) -> RefinedPackage {
        RefinedPackage::new(
            Granularity::minutes(15),
            names.iter().map(|n| n.to_string()).collect(),
            rows.into_iter()
                .map(|(entity_id, timestamp, values)| RefinedRow {
                    entity_id,
                    timestamp: ts(timestamp),
                    values: values.into_iter().map(String::from).collect(),
                })
                .collect(),
        )
        .unwrap()
    }

    fn wide_package(count: i64) -> RefinedPackage {
        refined(
            &["CCR", "Drops"],
            (1..=count)
                .map(|id| (10_000 + id, "2023-05-01T14:00:00Z", vec!["0.9919", "17"]))
                .collect(),
        )
    }

    fn table_for(part: &TrendStorePart, t: DateTime<Utc>) -> String {
        partitioning().partition_for(t).table_name(&part.name)
    }

    #[test]
    fn test_plan_picks_copy_above_threshold() {
        let part = part();
        let modified = ts("2023-05-01T14:05:00Z");
        let plan = WritePlan::for_trend_package(
            &part,
            &partitioning(),
            &wide_package(100),
            1,
            modified,
        )
        .unwrap();
        assert!(matches!(plan.steps()[0], WriteStep::CopyBatch(_)));

        let plan =
            WritePlan::for_trend_package(&part, &partitioning(), &wide_package(3), 1, modified)
                .unwrap();
        assert!(matches!(plan.steps()[0], WriteStep::InsertBatch(_)));
    }

    #[tokio::test]
    async fn test_store_creates_partition_and_rows() {
        // First delivery against an empty store: the partition table does
        // not exist, the engine creates it and retries the copy.
        let mut store = MockStorage::new();
        let part = part();
        let package = wide_package(100);
        let modified = ts("2023-05-01T14:05:30Z");

        let plan =
            WritePlan::for_trend_package(&part, &partitioning(), &package, 42, modified).unwrap();
        let report = execute_plan(&mut store, plan).await.unwrap();

        let table = table_for(&part, ts("2023-05-01T14:00:00Z"));
        assert_eq!(report.rows_written, 100);
        assert_eq!(report.recoveries, 1);
        assert_eq!(store.row_count(&table), 100);
        assert_eq!(
            store.modified(&table, ts("2023-05-01T14:00:00Z")),
            Some(modified)
        );
        let row = store.row(&table, 10_023, ts("2023-05-01T14:00:00Z")).unwrap();
        assert_eq!(row.get("Drops").map(String::as_str), Some("17"));
    }

    #[tokio::test]
    async fn test_redelivery_updates_row_and_advances_modified() {
        let mut store = MockStorage::new();
        let part = part();
        let t = "2023-05-01T14:00:00Z";

        let first = ts("2023-05-01T14:05:00Z");
        let plan = WritePlan::for_trend_package(
            &part,
            &partitioning(),
            &refined(&["Drops"], vec![(10_023, t, vec!["17"])]),
            1,
            first,
        )
        .unwrap();
        execute_plan(&mut store, plan).await.unwrap();

        let second = ts("2023-05-01T14:21:00Z");
        let plan = WritePlan::for_trend_package(
            &part,
            &partitioning(),
            &refined(&["Drops"], vec![(10_023, t, vec!["18"])]),
            2,
            second,
        )
        .unwrap();
        let report = execute_plan(&mut store, plan).await.unwrap();

        let table = table_for(&part, ts(t));
        assert_eq!(store.row_count(&table), 1);
        let row = store.row(&table, 10_023, ts(t)).unwrap();
        assert_eq!(row.get("Drops").map(String::as_str), Some("18"));
        assert!(store.row_modified(&table, 10_023, ts(t)).unwrap() > first);
        // One recovery: the insert→update strategy switch.
        assert_eq!(report.recoveries, 1);
    }

    #[tokio::test]
    async fn test_new_column_added_automatically() {
        let mut store = MockStorage::new();
        let part = part();

        let plan = WritePlan::for_trend_package(
            &part,
            &partitioning(),
            &refined(
                &["a", "b", "c"],
                vec![(1, "2023-05-01T14:00:00Z", vec!["1", "2", "3"])],
            ),
            1,
            ts("2023-05-01T14:05:00Z"),
        )
        .unwrap();
        execute_plan(&mut store, plan).await.unwrap();

        let plan = WritePlan::for_trend_package(
            &part,
            &partitioning(),
            &refined(
                &["a", "b", "c", "d"],
                vec![(1, "2023-05-01T14:15:00Z", vec!["1", "2", "3", "4"])],
            ),
            2,
            ts("2023-05-01T14:20:00Z"),
        )
        .unwrap();
        let report = execute_plan(&mut store, plan).await.unwrap();
        assert_eq!(report.recoveries, 1);

        let table = table_for(&part, ts("2023-05-01T14:00:00Z"));
        // Prior row reads back without a value for the new column.
        let old = store.row(&table, 1, ts("2023-05-01T14:00:00Z")).unwrap();
        assert_eq!(old.get("d"), None);
        let new = store.row(&table, 1, ts("2023-05-01T14:15:00Z")).unwrap();
        assert_eq!(new.get("d").map(String::as_str), Some("4"));
    }

    #[tokio::test]
    async fn test_type_mismatch_widens_then_persists_unchanged() {
        let mut store = MockStorage::new();
        let part = part();
        let table = table_for(&part, ts("2023-05-01T14:00:00Z"));
        store.create_table(
            &table,
            vec![ColumnDescriptor::new("Drops", DataType::SmallInt)],
        );

        let literal = "2023-05-01 14:00:00";
        let plan = WritePlan::for_trend_package(
            &part,
            &partitioning(),
            &refined(&["Drops"], vec![(1, "2023-05-01T14:00:00Z", vec![literal])]),
            1,
            ts("2023-05-01T14:05:00Z"),
        )
        .unwrap();
        let report = execute_plan(&mut store, plan).await.unwrap();

        assert_eq!(report.recoveries, 1);
        assert_eq!(store.column_type(&table, "Drops"), Some(DataType::Timestamp));
        let row = store.row(&table, 1, ts("2023-05-01T14:00:00Z")).unwrap();
        assert_eq!(row.get("Drops").map(String::as_str), Some(literal));
    }

    #[tokio::test]
    async fn test_unique_violation_switches_remaining_plan() {
        let mut store = MockStorage::new();
        let part = part();
        let day1 = "2023-05-01T14:00:00Z";
        let day2 = "2023-05-02T14:00:00Z";

        // Seed both partitions with conflicting keys.
        let seed = WritePlan::for_trend_package(
            &part,
            &partitioning(),
            &refined(
                &["Drops"],
                vec![(1, day1, vec!["1"]), (1, day2, vec!["2"])],
            ),
            1,
            ts("2023-05-01T15:00:00Z"),
        )
        .unwrap();
        execute_plan(&mut store, seed).await.unwrap();

        // Redeliver across both partitions: the first batch's duplicate key
        // must flip the second batch to update semantics before it runs.
        let redeliver = WritePlan::for_trend_package(
            &part,
            &partitioning(),
            &refined(
                &["Drops"],
                vec![(1, day1, vec!["10"]), (1, day2, vec!["20"])],
            ),
            2,
            ts("2023-05-01T16:00:00Z"),
        )
        .unwrap();
        let report = execute_plan(&mut store, redeliver).await.unwrap();
        assert_eq!(report.recoveries, 1);

        let t1 = table_for(&part, ts(day1));
        let t2 = table_for(&part, ts(day2));
        assert_eq!(
            store.row(&t1, 1, ts(day1)).unwrap().get("Drops").map(String::as_str),
            Some("10")
        );
        assert_eq!(
            store.row(&t2, 1, ts(day2)).unwrap().get("Drops").map(String::as_str),
            Some("20")
        );
    }

    #[tokio::test]
    async fn test_store_twice_is_idempotent() {
        let mut store = MockStorage::new();
        let part = part();
        let package = wide_package(100);

        let plan = WritePlan::for_trend_package(
            &part,
            &partitioning(),
            &package,
            1,
            ts("2023-05-01T14:05:00Z"),
        )
        .unwrap();
        execute_plan(&mut store, plan).await.unwrap();

        let again = WritePlan::for_trend_package(
            &part,
            &partitioning(),
            &package,
            2,
            ts("2023-05-01T14:06:00Z"),
        )
        .unwrap();
        execute_plan(&mut store, again).await.unwrap();

        let table = table_for(&part, ts("2023-05-01T14:00:00Z"));
        assert_eq!(store.row_count(&table), 100);
        let row = store.row(&table, 10_050, ts("2023-05-01T14:00:00Z")).unwrap();
        assert_eq!(row.get("CCR").map(String::as_str), Some("0.9919"));
        assert_eq!(row.get("Drops").map(String::as_str), Some("17"));
    }

    #[tokio::test]
    async fn test_retries_exhausted_when_fix_does_not_converge() {
        let mut store = MockStorage::new();
        let part = part();
        // The store keeps reporting a missing partition even though the
        // corrective step succeeds.
        for _ in 0..=MAX_RECOVERIES {
            store.fail_next(
                "insert_rows",
                StorageError::NoSuchPartition {
                    table: "stuck".to_string(),
                },
            );
        }

        let plan = WritePlan::for_trend_package(
            &part,
            &partitioning(),
            &refined(&["a"], vec![(1, "2023-05-01T14:00:00Z", vec!["1"])]),
            1,
            ts("2023-05-01T14:05:00Z"),
        )
        .unwrap();
        let err = execute_plan(&mut store, plan).await.unwrap_err();
        assert!(matches!(err, StorageError::RetriesExhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlock_backs_off_and_retries() {
        let mut store = MockStorage::new();
        let part = part();
        let table = table_for(&part, ts("2023-05-01T14:00:00Z"));
        store.create_table(&table, vec![ColumnDescriptor::new("a", DataType::SmallInt)]);
        store.fail_next("insert_rows", StorageError::Deadlock);

        let plan = WritePlan::for_trend_package(
            &part,
            &partitioning(),
            &refined(&["a"], vec![(1, "2023-05-01T14:00:00Z", vec!["1"])]),
            1,
            ts("2023-05-01T14:05:00Z"),
        )
        .unwrap();
        let report = execute_plan(&mut store, plan).await.unwrap();
        assert_eq!(report.recoveries, 1);
        assert_eq!(report.rows_written, 1);
    }

    #[tokio::test]
    async fn test_unrecognized_error_propagates() {
        let mut store = MockStorage::new();
        let part = part();
        store.fail_next("insert_rows", StorageError::Database("out of disk".to_string()));

        let plan = WritePlan::for_trend_package(
            &part,
            &partitioning(),
            &refined(&["a"], vec![(1, "2023-05-01T14:00:00Z", vec!["1"])]),
            1,
            ts("2023-05-01T14:05:00Z"),
        )
        .unwrap();
        let err = execute_plan(&mut store, plan).await.unwrap_err();
        assert!(matches!(err, StorageError::Database(_)));
    }

    #[tokio::test]
    async fn test_corrective_steps_are_idempotent() {
        let mut store = MockStorage::new();
        let partition = partitioning().partition_for(ts("2023-05-01T14:00:00Z"));
        let columns = vec![ColumnDescriptor::new("a", DataType::SmallInt)];
        let step = WriteStep::CreatePartition {
            table: "node_main_15m_19478".to_string(),
            partition,
            columns: columns.clone(),
        };
        assert!(matches!(step.apply(&mut store).await, Ok(StepOutcome::Done(0))));
        // A concurrent writer may have created it first; still success.
        assert!(matches!(step.apply(&mut store).await, Ok(StepOutcome::Done(0))));

        let widen = WriteStep::EnsureColumnTypes {
            table: "node_main_15m_19478".to_string(),
            columns: vec![ColumnDescriptor::new("a", DataType::BigInt)],
        };
        assert!(matches!(widen.apply(&mut store).await, Ok(StepOutcome::Done(0))));
        assert!(matches!(widen.apply(&mut store).await, Ok(StepOutcome::Done(0))));
        assert_eq!(
            store.column_type("node_main_15m_19478", "a"),
            Some(DataType::BigInt)
        );
    }

    #[tokio::test]
    async fn test_store_raw_resolves_then_stores() {
        let mut store = MockStorage::new();
        let part = part();
        let directory = MockEntityDirectory::with_entities(&[("node=10023", 10_023)]);
        let package = DataPackage::new(
            Granularity::minutes(15),
            vec!["Drops".to_string()],
            vec![crate::package::Row {
                entity_ref: EntityRef::Name("node=10023".to_string()),
                timestamp: ts("2023-05-01T14:00:00Z"),
                values: vec!["17".to_string()],
            }],
        )
        .unwrap();

        part.store_raw(&mut store, &directory, &partitioning(), &package, 7)
            .await
            .unwrap();
        let table = table_for(&part, ts("2023-05-01T14:00:00Z"));
        assert!(store.row(&table, 10_023, ts("2023-05-01T14:00:00Z")).is_some());
    }

    #[tokio::test]
    async fn test_attribute_store_update_merge_with_history() {
        let mut store = MockStorage::new();
        let attributes = AttributeStore {
            id: Uuid::new_v4(),
            entity_type: "node".to_string(),
            data_source: "inventory".to_string(),
            attributes: Vec::new(),
        };
        let table = attributes.table_name();
        store.create_table(&table, vec![ColumnDescriptor::new("vendor", DataType::Text)]);
        store.seed_row(&table, 1, ts("2023-05-01T00:00:00Z"), &[("vendor", "acme")], ts("2023-05-01T00:00:00Z"));

        let package = refined(
            &["vendor"],
            vec![
                (1, "2023-05-01T00:00:00Z", vec!["globex"]),
                (2, "2023-05-01T00:00:00Z", vec!["acme"]),
            ],
        );
        attributes.store(&mut store, &package, 9).await.unwrap();

        assert_eq!(store.row_count(&table), 2);
        let updated = store.row(&table, 1, ts("2023-05-01T00:00:00Z")).unwrap();
        assert_eq!(updated.get("vendor").map(String::as_str), Some("globex"));
        // The overwritten version landed in history.
        assert_eq!(store.history_len(&attributes.history_table_name()), 1);
    }
}
