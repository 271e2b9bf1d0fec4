//! The batch data model.
//!
//! A `DataPackage` is an in-memory batch of same-granularity rows awaiting
//! storage: an ordered, unique set of column names and rows of
//! (entity reference, timestamp, literal values). Every row's value count
//! equals the column count; violating that is a hard, non-recoverable error
//! at construction time rather than a store-side failure later.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::datatype::{deduce_data_types, DataType};
use crate::error::{StorageError, StorageResult};
use crate::granularity::Granularity;
use crate::traits::EntityDirectory;

/// Reference to the entity a row belongs to: either an unresolved directory
/// name or an already-resolved numeric id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityRef {
    /// Unresolved directory name, e.g. `"network=n1,node=10023"`
    Name(String),
    /// Resolved numeric entity id
    Id(i64),
}

/// One batch row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// The entity this row belongs to
    pub entity_ref: EntityRef,
    /// Sample timestamp
    pub timestamp: DateTime<Utc>,
    /// Literal values, aligned with the package's column names
    pub values: Vec<String>,
}

/// A row whose entity reference has been resolved to an id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefinedRow {
    /// Resolved entity id
    pub entity_id: i64,
    /// Sample timestamp
    pub timestamp: DateTime<Utc>,
    /// Literal values, aligned with the package's column names
    pub values: Vec<String>,
}

/// A batch of trend data awaiting storage.
#[derive(Clone, Debug, PartialEq)]
pub struct DataPackage {
    granularity: Granularity,
    trend_names: Vec<String>,
    rows: Vec<Row>,
}

/// A `DataPackage` whose entity references have all been resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct RefinedPackage {
    granularity: Granularity,
    trend_names: Vec<String>,
    rows: Vec<RefinedRow>,
}

impl DataPackage {
    /// Build a package, validating shape: unique column names and, for every
    /// row, exactly one value per column.
    pub fn new(
        granularity: Granularity,
        trend_names: Vec<String>,
        rows: Vec<Row>,
    ) -> StorageResult<DataPackage> {
        validate_shape(&trend_names, rows.iter().map(|r| r.values.len()))?;
        Ok(DataPackage {
            granularity,
            trend_names,
            rows,
        })
    }

    /// The sampling interval of this batch.
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// The ordered, unique column names.
    pub fn trend_names(&self) -> &[String] {
        &self.trend_names
    }

    /// The batch rows.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Whether the batch holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of rows in the batch.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// The distinct timestamps present, ascending.
    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        let mut timestamps: Vec<_> = self.rows.iter().map(|r| r.timestamp).collect();
        timestamps.sort_unstable();
        timestamps.dedup();
        timestamps
    }

    /// The widest type needed per column to represent every observed literal.
    pub fn deduce_data_types(&self) -> Vec<DataType> {
        deduce_data_types(
            self.trend_names.len(),
            self.rows.iter().map(|r| r.values.as_slice()),
        )
    }

    /// Resolve every named entity reference to an id, preserving row order
    /// and 1:1 cardinality. An unresolvable reference fails the whole
    /// refinement; this layer does not retry it.
    pub async fn refine<D: EntityDirectory + ?Sized>(
        &self,
        directory: &D,
    ) -> StorageResult<RefinedPackage> {
        let mut rows = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let entity_id = match &row.entity_ref {
                EntityRef::Id(id) => *id,
                EntityRef::Name(name) => directory.resolve(name).await?,
            };
            rows.push(RefinedRow {
                entity_id,
                timestamp: row.timestamp,
                values: row.values.clone(),
            });
        }
        Ok(RefinedPackage {
            granularity: self.granularity,
            trend_names: self.trend_names.clone(),
            rows,
        })
    }

    /// Merge packages that share a granularity into one package per
    /// granularity. The merged column set is the union of all input columns
    /// in first-seen order; an entity missing a column from one source gets
    /// an explicit empty placeholder so row width stays constant. When two
    /// packages supply a value for the same (entity, timestamp, column), the
    /// later package in iteration order wins.
    pub fn merge(packages: Vec<DataPackage>) -> Vec<DataPackage> {
        let mut order: Vec<Granularity> = Vec::new();
        let mut groups: HashMap<Granularity, Vec<DataPackage>> = HashMap::new();
        for package in packages {
            if !groups.contains_key(&package.granularity) {
                order.push(package.granularity);
            }
            groups.entry(package.granularity).or_default().push(package);
        }
        order
            .into_iter()
            .map(|granularity| merge_group(granularity, groups.remove(&granularity).unwrap()))
            .collect()
    }

    /// Project to the columns satisfying `predicate`, preserving per-row
    /// alignment and row order.
    pub fn filter_trends<F>(&self, predicate: F) -> DataPackage
    where
        F: Fn(&str) -> bool,
    {
        let kept: Vec<usize> = self
            .trend_names
            .iter()
            .enumerate()
            .filter(|(_, name)| predicate(name))
            .map(|(i, _)| i)
            .collect();
        DataPackage {
            granularity: self.granularity,
            trend_names: kept.iter().map(|&i| self.trend_names[i].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| Row {
                    entity_ref: row.entity_ref.clone(),
                    timestamp: row.timestamp,
                    values: kept.iter().map(|&i| row.values[i].clone()).collect(),
                })
                .collect(),
        }
    }
}

impl RefinedPackage {
    /// Build an already-resolved package, validating shape like
    /// [`DataPackage::new`].
    pub fn new(
        granularity: Granularity,
        trend_names: Vec<String>,
        rows: Vec<RefinedRow>,
    ) -> StorageResult<RefinedPackage> {
        validate_shape(&trend_names, rows.iter().map(|r| r.values.len()))?;
        Ok(RefinedPackage {
            granularity,
            trend_names,
            rows,
        })
    }

    /// The sampling interval of this batch.
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// The ordered, unique column names.
    pub fn trend_names(&self) -> &[String] {
        &self.trend_names
    }

    /// The batch rows.
    pub fn rows(&self) -> &[RefinedRow] {
        &self.rows
    }

    /// Whether the batch holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of rows in the batch.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// The distinct timestamps present, ascending.
    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        let mut timestamps: Vec<_> = self.rows.iter().map(|r| r.timestamp).collect();
        timestamps.sort_unstable();
        timestamps.dedup();
        timestamps
    }

    /// The widest type needed per column to represent every observed literal.
    pub fn deduce_data_types(&self) -> Vec<DataType> {
        deduce_data_types(
            self.trend_names.len(),
            self.rows.iter().map(|r| r.values.as_slice()),
        )
    }
}

fn validate_shape(
    trend_names: &[String],
    value_counts: impl Iterator<Item = usize>,
) -> StorageResult<()> {
    let mut seen = std::collections::HashSet::new();
    for name in trend_names {
        if !seen.insert(name.as_str()) {
            return Err(StorageError::PackageShape(format!(
                "duplicate column name '{name}'"
            )));
        }
    }
    for (row_index, count) in value_counts.enumerate() {
        if count != trend_names.len() {
            return Err(StorageError::PackageShape(format!(
                "row {row_index} has {count} values for {} columns",
                trend_names.len()
            )));
        }
    }
    Ok(())
}

fn merge_group(granularity: Granularity, packages: Vec<DataPackage>) -> DataPackage {
    let mut trend_names: Vec<String> = Vec::new();
    for package in &packages {
        for name in &package.trend_names {
            if !trend_names.contains(name) {
                trend_names.push(name.clone());
            }
        }
    }

    type Key = (DateTime<Utc>, EntityRef);
    let mut row_order: Vec<Key> = Vec::new();
    let mut merged: HashMap<Key, Vec<String>> = HashMap::new();
    for package in &packages {
        let targets: Vec<usize> = package
            .trend_names
            .iter()
            .map(|name| trend_names.iter().position(|n| n == name).unwrap())
            .collect();
        for row in &package.rows {
            let key = (row.timestamp, row.entity_ref.clone());
            let values = merged.entry(key.clone()).or_insert_with(|| {
                row_order.push(key.clone());
                vec![String::new(); trend_names.len()]
            });
            for (value, &target) in row.values.iter().zip(&targets) {
                values[target] = value.clone();
            }
        }
    }

    DataPackage {
        granularity,
        trend_names,
        rows: row_order
            .into_iter()
            .map(|key| {
                let values = merged.remove(&key).unwrap();
                let (timestamp, entity_ref) = key;
                Row {
                    entity_ref,
                    timestamp,
                    values,
                }
            })
            .collect(),
    }
}
