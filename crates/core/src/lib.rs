//! trendbase-core
//!
//! Domain model and self-healing write engine for the trendbase warehouse
//! layer: the data type registry, the `DataPackage` batch model, time
//! partitioning, and the retry/self-healing write plan engine, all
//! independent of any concrete backing store.

#![warn(missing_docs)]

mod datatype;
mod descriptor;
mod engine;
mod error;
mod granularity;
mod package;
mod partitioning;
mod traits;

pub mod mocks;

pub use datatype::{
    deduce_data_types, max_data_type, DataType, ParserConfig, Value, ALL_TYPES,
};
pub use descriptor::{AttributeStore, ColumnDescriptor, TrendStore, TrendStorePart};
pub use engine::{
    execute_plan, PlanReport, StepOutcome, WriteBatch, WritePlan, WriteStep,
    BULK_COPY_THRESHOLD, DEADLOCK_BACKOFF, MAX_RECOVERIES,
};
pub use error::{StorageError, StorageResult};
pub use granularity::Granularity;
pub use package::{DataPackage, EntityRef, RefinedPackage, RefinedRow, Row};
pub use partitioning::{Partition, Partitioning, EPOCH_OFFSET_SECONDS};
pub use traits::{EntityDirectory, TrendStorage};
