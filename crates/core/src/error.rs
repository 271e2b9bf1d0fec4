//! Error types for storage operations.
//!
//! Errors fall into two classes that the write engine treats very differently:
//!
//! - **Recoverable** store errors (`NoSuchPartition`, `NoSuchColumn`,
//!   `DataTypeMismatch`, `UniqueViolation`, `Deadlock`) trigger a corrective
//!   step and a retry of the failed step.
//! - Everything else is propagated to the caller unchanged.

use std::io;
use thiserror::Error;

/// Result alias used throughout the storage layer.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The target partition table does not exist yet.
    #[error("no partition backing table: {table}")]
    NoSuchPartition {
        /// Name of the missing partition table
        table: String,
    },

    /// A referenced trend or attribute has no backing column.
    #[error("no such column: {column}")]
    NoSuchColumn {
        /// Name of the missing column
        column: String,
    },

    /// A value does not fit the column's current type.
    #[error("data type mismatch on column {column}: {detail}")]
    DataTypeMismatch {
        /// Column whose type was too narrow
        column: String,
        /// Store-side detail message
        detail: String,
    },

    /// A row for this (entity, timestamp) key already exists.
    #[error("duplicate key for (entity, timestamp)")]
    UniqueViolation,

    /// The backing store detected a deadlock; retried after a fixed backoff.
    #[error("deadlock detected by backing store")]
    Deadlock,

    /// Corrective steps did not converge within the recovery budget.
    #[error("write plan recovery budget exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Number of recovery attempts made before giving up
        attempts: u32,
    },

    /// Malformed data package (row/column-count mismatch, duplicate names).
    #[error("malformed data package: {0}")]
    PackageShape(String),

    /// An entity reference could not be resolved to an id.
    #[error("entity resolution failed for '{0}'")]
    EntityResolution(String),

    /// A literal could not be parsed as the deduced data type.
    #[error("invalid literal '{literal}' for type {data_type}")]
    ParseValue {
        /// The offending literal
        literal: String,
        /// Name of the type the literal was parsed as
        data_type: String,
    },

    /// Unrecognized backing-store error; non-recoverable.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error from the underlying transport.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Whether the write engine may attempt a corrective step for this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::NoSuchPartition { .. }
                | StorageError::NoSuchColumn { .. }
                | StorageError::DataTypeMismatch { .. }
                | StorageError::UniqueViolation
                | StorageError::Deadlock
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(StorageError::NoSuchPartition {
            table: "node_main_15m_1234".to_string()
        }
        .is_recoverable());
        assert!(StorageError::UniqueViolation.is_recoverable());
        assert!(StorageError::Deadlock.is_recoverable());
        assert!(!StorageError::RetriesExhausted { attempts: 10 }.is_recoverable());
        assert!(!StorageError::EntityResolution("node=unknown".to_string()).is_recoverable());
        assert!(!StorageError::Database("out of disk".to_string()).is_recoverable());
    }

    #[test]
    fn test_display_messages() {
        let err = StorageError::NoSuchColumn {
            column: "Drops".to_string(),
        };
        assert_eq!(err.to_string(), "no such column: Drops");

        let err = StorageError::RetriesExhausted { attempts: 10 };
        assert!(err.to_string().contains("10 attempts"));
    }
}
