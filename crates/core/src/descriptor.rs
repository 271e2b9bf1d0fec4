//! Registry value objects: stores, parts, and column descriptors.
//!
//! A trend store owns one part per logical table; a part knows its current
//! columns and their types. This layer only ever **adds** or **widens**
//! columns; nothing here removes or narrows.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datatype::{max_data_type, DataType};
use crate::granularity::Granularity;

/// A named, typed column of a part: a trend (periodic counter) or an
/// attribute (slowly-changing descriptive field). Immutable value object;
/// names are unique within their part.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,
    /// Current (or deduced) data type
    pub data_type: DataType,
    /// Free-form description
    pub description: String,
}

impl ColumnDescriptor {
    /// Descriptor with an empty description.
    pub fn new(name: impl Into<String>, data_type: DataType) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.into(),
            data_type,
            description: String::new(),
        }
    }
}

/// A trend store: the (entity type, data source, granularity) scope that owns
/// one or more parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrendStore {
    /// Store identifier
    pub id: Uuid,
    /// Entity type whose counters this store holds
    pub entity_type: String,
    /// Producing data source
    pub data_source: String,
    /// Sampling interval
    pub granularity: Granularity,
    /// Partition size in seconds
    pub partition_size: i64,
    /// The parts of this store
    pub parts: Vec<TrendStorePart>,
}

/// One logical table of a trend store, with its current column set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrendStorePart {
    /// Part identifier
    pub id: Uuid,
    /// Base table name; partitions are `<name>_<index>`
    pub name: String,
    /// Current columns, names unique
    pub trends: Vec<ColumnDescriptor>,
}

impl TrendStorePart {
    /// Look up a trend descriptor by name.
    pub fn trend(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.trends.iter().find(|t| t.name == name)
    }

    /// Of the given columns, those this part does not have yet.
    pub fn missing_trends(&self, columns: &[ColumnDescriptor]) -> Vec<ColumnDescriptor> {
        columns
            .iter()
            .filter(|c| self.trend(&c.name).is_none())
            .cloned()
            .collect()
    }

    /// Descriptors whose current type must widen to hold the deduced types.
    pub fn widening_changes(&self, columns: &[ColumnDescriptor]) -> Vec<ColumnDescriptor> {
        columns
            .iter()
            .filter_map(|c| {
                let current = self.trend(&c.name)?;
                let wanted = max_data_type(current.data_type, c.data_type);
                (wanted != current.data_type).then(|| ColumnDescriptor {
                    name: c.name.clone(),
                    data_type: wanted,
                    description: current.description.clone(),
                })
            })
            .collect()
    }
}

/// An attribute store: slowly-changing descriptive columns for one
/// (entity type, data source) scope, backed by a single unpartitioned table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeStore {
    /// Store identifier
    pub id: Uuid,
    /// Entity type the attributes describe
    pub entity_type: String,
    /// Producing data source
    pub data_source: String,
    /// Current attribute columns, names unique
    pub attributes: Vec<ColumnDescriptor>,
}

impl AttributeStore {
    /// The backing table name.
    pub fn table_name(&self) -> String {
        format!("attribute_{}_{}", self.data_source, self.entity_type)
    }

    /// The history companion table name.
    pub fn history_table_name(&self) -> String {
        format!("{}_history", self.table_name())
    }
}
