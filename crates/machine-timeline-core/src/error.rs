//! Core error types for machine-timeline-core.
//!
//! This module defines the error hierarchy using thiserror. Storage,
//! configuration and validation failures have their own enums; failures
//! raised while analysing a machine are grouped in [`AnalysisError`] and
//! always carry the machine, modification and time range they concern.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::timeline::TimeRange;

/// Core error type for machine-timeline-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Errors raised while analysing a machine timeline
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

impl CoreError {
    /// Whether retrying the same unit of work may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Database(err) => err.is_transient(),
            CoreError::Analysis(AnalysisError::TransientStorageFailure { .. }) => true,
            _ => false,
        }
    }
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// Database is busy with another writer
    #[error("Database is busy")]
    Busy,

    /// A thread panicked while holding the database handle
    #[error("Database handle poisoned")]
    Poisoned,

    /// Row referenced by id does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
}

impl DatabaseError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DatabaseError::Locked | DatabaseError::Busy)
    }
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown configuration key
    #[error("Unknown configuration key: {0}")]
    MissingKey(String),
}

/// Validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Invalid time range
    #[error("Invalid time range: end ({end}) must be greater than begin ({start})")]
    InvalidTimeRange {
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    },

    /// A bounded range was required
    #[error("Time range starting at {start} must have an end")]
    UnboundedRange { start: chrono::DateTime<chrono::Utc> },

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

/// Where an analysis error happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub machine_id: i64,
    pub modification_id: Option<i64>,
    pub range: Option<TimeRange>,
}

impl ErrorContext {
    pub fn machine(machine_id: i64) -> Self {
        Self {
            machine_id,
            modification_id: None,
            range: None,
        }
    }

    pub fn with_modification(mut self, modification_id: i64) -> Self {
        self.modification_id = Some(modification_id);
        self
    }

    pub fn with_range(mut self, range: Option<TimeRange>) -> Self {
        self.range = range;
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "machine {}", self.machine_id)?;
        if let Some(id) = self.modification_id {
            write!(f, ", modification {id}")?;
        }
        if let Some(range) = &self.range {
            write!(f, ", range {range}")?;
        }
        Ok(())
    }
}

/// Failures raised by the analysis of one machine.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// Storage kept failing after the configured number of attempts.
    #[error("Transient storage failure ({context}): {source}")]
    TransientStorageFailure {
        context: ErrorContext,
        #[source]
        source: DatabaseError,
    },

    /// A decision extension failed for one reason slot.
    #[error("Extension '{extension}' failed ({context}): {message}")]
    ExtensionDecisionFailure {
        context: ErrorContext,
        extension: String,
        message: String,
    },

    /// The partition of a timeline is broken; the machine worker stops.
    #[error("Invariant violation ({context}): {message}")]
    InvariantViolation {
        context: ErrorContext,
        message: String,
    },

    /// A modification could not be applied; its machine queue halts.
    #[error("Modification error ({context}): {message}")]
    ModificationError {
        context: ErrorContext,
        message: String,
    },
}

impl AnalysisError {
    pub fn context(&self) -> &ErrorContext {
        match self {
            AnalysisError::TransientStorageFailure { context, .. }
            | AnalysisError::ExtensionDecisionFailure { context, .. }
            | AnalysisError::InvariantViolation { context, .. }
            | AnalysisError::ModificationError { context, .. } => context,
        }
    }

    pub fn invariant(context: ErrorContext, message: impl Into<String>) -> Self {
        AnalysisError::InvariantViolation {
            context,
            message: message.into(),
        }
    }

    pub fn modification(context: ErrorContext, message: impl Into<String>) -> Self {
        AnalysisError::ModificationError {
            context,
            message: message.into(),
        }
    }
}

// Helper implementations for converting from other error types

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(err, _msg) => match err.code {
                rusqlite::ErrorCode::DatabaseLocked => DatabaseError::Locked,
                rusqlite::ErrorCode::DatabaseBusy => DatabaseError::Busy,
                _ => DatabaseError::QueryFailed(err.to_string()),
            },
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(err.into())
    }
}

impl<T> From<std::sync::PoisonError<T>> for CoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        CoreError::Database(DatabaseError::Poisoned)
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
