//! Classification of PostgreSQL errors into the storage error categories.
//!
//! The write engine only understands the categorized errors from
//! `trendbase_core::StorageError`; everything the server reports is mapped
//! here by SQLSTATE. Unrecognized states become the non-recoverable
//! `Database` variant.

use trendbase_core::StorageError;

/// SQLSTATE: relation does not exist.
pub const UNDEFINED_TABLE: &str = "42P01";
/// SQLSTATE: column does not exist.
pub const UNDEFINED_COLUMN: &str = "42703";
/// SQLSTATE: datatype mismatch.
pub const DATATYPE_MISMATCH: &str = "42804";
/// SQLSTATE: invalid text representation.
pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";
/// SQLSTATE: numeric value out of range.
pub const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";
/// SQLSTATE: unique constraint violation.
pub const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE: deadlock detected.
pub const DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE: relation already exists.
pub const DUPLICATE_TABLE: &str = "42P07";
/// SQLSTATE: column already exists.
pub const DUPLICATE_COLUMN: &str = "42701";

/// Map a sqlx error onto the engine's error categories.
pub fn classify(error: sqlx::Error) -> StorageError {
    let sqlx::Error::Database(db) = &error else {
        return StorageError::Database(error.to_string());
    };
    let message = db.message().to_string();
    match db.code().as_deref() {
        Some(UNDEFINED_TABLE) => StorageError::NoSuchPartition {
            table: quoted_token(&message).unwrap_or(message),
        },
        Some(UNDEFINED_COLUMN) => StorageError::NoSuchColumn {
            column: quoted_token(&message).unwrap_or(message),
        },
        Some(DATATYPE_MISMATCH) | Some(INVALID_TEXT_REPRESENTATION)
        | Some(NUMERIC_VALUE_OUT_OF_RANGE) => StorageError::DataTypeMismatch {
            column: quoted_token(&message).unwrap_or_default(),
            detail: message,
        },
        Some(UNIQUE_VIOLATION) => StorageError::UniqueViolation,
        Some(DEADLOCK_DETECTED) => StorageError::Deadlock,
        Some(code) => StorageError::Database(format!("{code}: {message}")),
        None => StorageError::Database(message),
    }
}

/// Swallow "this object already exists" responses from corrective DDL:
/// a concurrent writer winning the race is success, not a new error.
pub fn tolerate_existing(
    result: Result<(), sqlx::Error>,
    codes: &[&str],
) -> Result<(), StorageError> {
    match result {
        Ok(()) => Ok(()),
        Err(error) => {
            if let sqlx::Error::Database(db) = &error {
                if let Some(code) = db.code() {
                    if codes.contains(&code.as_ref()) {
                        return Ok(());
                    }
                }
            }
            Err(classify(error))
        }
    }
}

/// The first double-quoted token of a server message, e.g. the relation
/// name out of `relation "node_main_15m_19478" does not exist`.
fn quoted_token(message: &str) -> Option<String> {
    let start = message.find('"')? + 1;
    let end = start + message[start..].find('"')?;
    Some(message[start..end].to_string())
}
