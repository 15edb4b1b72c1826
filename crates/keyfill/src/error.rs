//! Error types for keyfill
//!
//! Errors are classified so a caller can decide whether re-invoking a
//! transfer from its last checkpoint makes sense:
//! - Retriable errors (connection loss, timeouts, deadlocks)
//! - Non-retriable errors (configuration, constraint violations, conversions)

use std::fmt;
use thiserror::Error;

use crate::checkpoint::Checkpoint;
use crate::pump::TransferCounters;

/// Result type for keyfill operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors (retriable)
    Connection,
    /// Query execution errors
    Query,
    /// Transaction errors
    Transaction,
    /// Constraint violation (not retriable)
    Constraint,
    /// Type conversion errors (not retriable)
    TypeConversion,
    /// Timeout errors (retriable)
    Timeout,
    /// Deadlock detected (retriable)
    Deadlock,
    /// Authentication failure
    Authentication,
    /// Configuration error, detected before any batch runs
    Configuration,
    /// Schema-related errors
    Schema,
    /// Transfer stopped at a batch boundary on request
    Cancelled,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::Deadlock)
    }
}

/// Main error type for keyfill
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transaction error
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Rolling back a failed batch failed as well. Both errors are kept.
    #[error("rollback failed ({rollback}) after: {cause}")]
    RollbackFailed {
        cause: Box<Error>,
        rollback: Box<Error>,
    },

    /// Constraint violation (PK, FK, unique, check)
    #[error("constraint violation: {constraint_name} - {message}")]
    Constraint {
        constraint_name: String,
        message: String,
    },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Deadlock detected
    #[error("deadlock detected")]
    Deadlock,

    /// Authentication failed
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Schema error (column mismatch, unusable key)
    #[error("schema error: {message}")]
    Schema { message: String },

    /// Table not found
    #[error("table not found: {table}")]
    TableNotFound { table: String },

    /// Column not found
    #[error("column not found: {column} in table {table}")]
    ColumnNotFound { table: String, column: String },

    /// Transfer cancelled between batches
    #[error("transfer cancelled")]
    Cancelled,

    /// Unsupported operation for this backend
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } | Self::RollbackFailed { .. } => ErrorCategory::Transaction,
            Self::Constraint { .. } => ErrorCategory::Constraint,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Deadlock => ErrorCategory::Deadlock,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Schema { .. } | Self::TableNotFound { .. } | Self::ColumnNotFound { .. } => {
                ErrorCategory::Schema
            }
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Unsupported { .. } | Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create a constraint violation error
    pub fn constraint(constraint_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Constraint {
            constraint_name: constraint_name.into(),
            message: message.into(),
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Combine a batch failure with the failure of its rollback
    pub fn rollback_failed(cause: Error, rollback: Error) -> Self {
        Self::RollbackFailed {
            cause: Box::new(cause),
            rollback: Box::new(rollback),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
            Self::Constraint => write!(f, "constraint"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Timeout => write!(f, "timeout"),
            Self::Deadlock => write!(f, "deadlock"),
            Self::Authentication => write!(f, "authentication"),
            Self::Configuration => write!(f, "configuration"),
            Self::Schema => write!(f, "schema"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A transfer that terminated before completing.
///
/// Carries what an operator needs to diagnose partial progress and resume:
/// the counters accumulated so far and the last committed checkpoint.
#[derive(Error, Debug)]
#[error("transfer terminated after {} committed batches: {error}", .counters.batches_completed)]
pub struct TransferFailure {
    /// The error that stopped the transfer
    #[source]
    pub error: Error,
    /// Counters at the time of failure
    pub counters: TransferCounters,
    /// Last committed checkpoint, if any batch committed
    pub last_checkpoint: Option<Checkpoint>,
}

impl TransferFailure {
    /// Whether re-invoking the transfer from `last_checkpoint` may succeed
    pub fn is_retriable(&self) -> bool {
        self.error.is_retriable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retriable() {
        assert!(ErrorCategory::Connection.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());
        assert!(ErrorCategory::Deadlock.is_retriable());

        assert!(!ErrorCategory::Constraint.is_retriable());
        assert!(!ErrorCategory::TypeConversion.is_retriable());
        assert!(!ErrorCategory::Configuration.is_retriable());
        assert!(!ErrorCategory::Cancelled.is_retriable());
    }

    #[test]
    fn test_rollback_failure_is_not_retriable() {
        let err = Error::rollback_failed(Error::timeout("commit"), Error::connection("lost"));
        assert_eq!(err.category(), ErrorCategory::Transaction);
        assert!(!err.is_retriable());

        let msg = err.to_string();
        assert!(msg.contains("commit"));
        assert!(msg.contains("lost"));
    }

    #[test]
    fn test_error_display() {
        let err = Error::connection("connection refused");
        assert!(err.to_string().contains("connection refused"));

        let err = Error::query_with_sql("syntax error", "SELECT * FORM users");
        assert!(err.to_string().contains("syntax error"));
    }
}
