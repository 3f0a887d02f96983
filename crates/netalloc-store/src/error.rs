//! Error types for store operations.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading or committing records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Another transaction committed a conflicting write first.
    #[error("Commit conflict on {table}:{key}")]
    Conflict {
        /// The table of the contested row.
        table: String,
        /// The primary or unique key of the contested row.
        key: String,
    },

    /// The primary or unique key already exists.
    #[error("Duplicate key {table}:{key}")]
    Duplicate {
        /// The table name.
        table: String,
        /// The duplicated key.
        key: String,
    },

    /// The row does not exist.
    #[error("Row not found: {table}:{key}")]
    NotFound {
        /// The table name.
        table: String,
        /// The missing key.
        key: String,
    },

    /// A stored document could not be converted.
    #[error("Codec error in {table}: {message}")]
    Codec {
        /// The table name.
        table: String,
        /// Error message.
        message: String,
    },
}

impl StoreError {
    /// Creates a conflict error.
    pub fn conflict(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Conflict {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Creates a duplicate key error.
    pub fn duplicate(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Duplicate {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(table: impl Into<String>, message: impl ToString) -> Self {
        Self::Codec {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Returns true if re-running the transaction may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}
