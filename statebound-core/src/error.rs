//! Core error types.

use crate::record::RecordKey;
use thiserror::Error;

/// Errors raised while loading a statechart from its textual source.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("statechart source is not valid YAML: {0}")]
    Syntax(#[from] serde_yaml::Error),

    #[error("invalid statechart definition: {reason}")]
    Invalid { reason: String },

    #[error("invalid guard expression: {reason}")]
    InvalidGuard { reason: String },
}

/// Errors raised while decoding or restoring a persisted configuration.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("configuration is not a JSON array of state names: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("configuration references unknown state '{state}'")]
    UnknownState { state: String },

    #[error("inconsistent configuration: {reason}")]
    Inconsistent { reason: String },
}

/// Errors raised by a record when one of its methods is invoked.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActionError {
    #[error("record of type '{record_type}' has no method '{method}'")]
    UnknownMethod { record_type: String, method: String },

    #[error("method '{method}' failed: {message}")]
    Failed { method: String, message: String },
}

/// Errors raised by an interpreter engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("interpreter has already been started")]
    AlreadyStarted,

    #[error("interpreter has not been started")]
    NotStarted,

    #[error("event '{event}' is not handled in configuration {configuration}")]
    EventNotHandled { event: String, configuration: String },

    #[error("every guard rejected event '{event}' in configuration {configuration}")]
    GuardRejected { event: String, configuration: String },

    #[error("action failed: {0}")]
    Action(#[from] ActionError),

    #[error("cannot restore: {0}")]
    Configuration(#[from] ConfigurationError),
}

/// Errors surfaced by the definition store and the interpreter cache.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("statechart for '{record_type}' failed to load: {source}")]
    Definition {
        record_type: String,
        #[source]
        source: DefinitionError,
    },

    #[error("no statechart registered for record type '{record_type}'")]
    NoDefinition { record_type: String },

    #[error("configuration of record {key} cannot be restored: {source}")]
    Configuration {
        key: RecordKey,
        #[source]
        source: ConfigurationError,
    },

    #[error("interpreter error: {0}")]
    Engine(#[from] EngineError),
}

impl CoreError {
    /// Returns a stable error code for reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::Definition { .. } => "DEFINITION_ERROR",
            CoreError::NoDefinition { .. } => "NO_DEFINITION",
            CoreError::Configuration { .. } => "CONFIGURATION_ERROR",
            CoreError::Engine(EngineError::Action(_)) => "ACTION_FAILED",
            CoreError::Engine(EngineError::EventNotHandled { .. }) => "EVENT_NOT_HANDLED",
            CoreError::Engine(EngineError::GuardRejected { .. }) => "GUARD_REJECTED",
            CoreError::Engine(_) => "ENGINE_ERROR",
        }
    }
}
