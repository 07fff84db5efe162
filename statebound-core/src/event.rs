//! Events that carry record method calls into an interpreter.

use crate::configuration::Configuration;
use serde::Serialize;
use serde_json::{Map, Value};

/// A named event wrapping a deferred record method call.
///
/// Envelopes are consumed by value when sent, so the same envelope cannot be
/// delivered twice. Deliberately not `Clone`.
#[derive(Debug, PartialEq)]
pub struct EventEnvelope {
    name: String,
    method: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl EventEnvelope {
    /// Creates an envelope whose event name and target method coincide, the
    /// usual case for record methods exposed as events.
    pub fn call(method: impl Into<String>) -> Self {
        let method = method.into();
        Self {
            name: method.clone(),
            method,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Creates an envelope with distinct event and method names.
    pub fn new(name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: method.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }
}

/// Result of delivering one envelope.
///
/// `return_value` holds what the envelope's method returned when a
/// `dispatch` action ran it; it stays `None` when the selected transition
/// never dispatched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchOutcome {
    pub event: String,
    /// State whose transition was taken.
    pub source: String,
    /// Target state; `None` for internal transitions.
    pub target: Option<String>,
    pub return_value: Option<Value>,
    pub exited: Vec<String>,
    pub entered: Vec<String>,
    pub configuration: Configuration,
}

impl DispatchOutcome {
    /// Returns true if the active-state set changed.
    pub fn changed_configuration(&self) -> bool {
        !self.exited.is_empty() || !self.entered.is_empty()
    }
}

/// A step taken by `execute_once`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum MacroStep {
    /// The initial transition ran.
    Initial { entered: Vec<String> },
    /// A queued envelope was processed.
    Event(DispatchOutcome),
}
