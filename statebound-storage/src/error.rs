//! Storage error types.

use statebound_core::{CoreError, DefinitionError, EngineError, RecordKey};
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("statechart already registered for {0}")]
    StatechartExists(String),

    #[error("no statechart registered for {0}")]
    StatechartNotFound(String),

    #[error("record already exists: {0}")]
    RecordExists(RecordKey),

    #[error("record not found: {0}")]
    RecordNotFound(RecordKey),

    #[error("invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("statechart for {record_type} rejected: {source}")]
    Definition {
        record_type: String,
        #[source]
        source: DefinitionError,
    },

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl StorageError {
    /// Returns a stable error code for reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            StorageError::Io(_) | StorageError::Json(_) => "STORAGE_ERROR",
            StorageError::StatechartExists(_) | StorageError::RecordExists(_) => "ALREADY_EXISTS",
            StorageError::StatechartNotFound(_) | StorageError::RecordNotFound(_) => "NOT_FOUND",
            StorageError::InvalidName { .. } => "INVALID_NAME",
            StorageError::Definition { .. } => "DEFINITION_ERROR",
            StorageError::Core(e) => e.error_code(),
        }
    }
}

impl From<EngineError> for StorageError {
    fn from(e: EngineError) -> Self {
        StorageError::Core(CoreError::Engine(e))
    }
}

/// Checks that a record type or id is usable as a file name.
pub(crate) fn check_name(kind: &'static str, name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}
