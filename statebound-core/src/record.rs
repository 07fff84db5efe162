//! Records and the execution context bound to their interpreters.
//!
//! A record is any durable business entity that owns a statechart run. The
//! interpreter never sees the host's storage types directly; it talks to the
//! record through the [`Record`] capability set.

use crate::error::ActionError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Name under which the owning record is bound for guard expressions.
pub const CONTEXT_SYMBOL: &str = "o";

/// Stable identity of a record: its type plus its identifier within the type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub record_type: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(record_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.record_type, self.id)
    }
}

/// Capabilities a host record exposes to its interpreter.
///
/// Implementations adapt one kind of host record. Method invocation takes
/// `&self`; records that mutate on invocation use interior mutability.
pub trait Record: Send + Sync {
    /// Returns the record identity.
    fn key(&self) -> RecordKey;

    /// Returns the durable configuration field. `None` or an empty string
    /// means the statechart was never started for this record.
    fn configuration(&self) -> Option<String>;

    /// Reads an attribute.
    fn attribute(&self, name: &str) -> Option<Value>;

    /// Invokes a method by name.
    fn invoke(
        &self,
        method: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ActionError>;
}

/// Something guard expressions can read dotted field paths from.
pub trait FieldSource {
    /// Resolves a dotted path, yielding `Value::Null` when it does not exist.
    fn field(&self, path: &str) -> Value;
}

impl FieldSource for Value {
    fn field(&self, path: &str) -> Value {
        lookup_path(self, path.split('.'))
    }
}

fn lookup_path<'a>(root: &Value, parts: impl Iterator<Item = &'a str>) -> Value {
    let mut current = root;
    for part in parts {
        match current {
            Value::Object(map) => {
                current = map.get(part).unwrap_or(&Value::Null);
            }
            _ => return Value::Null,
        }
    }
    current.clone()
}

/// Bindings made available to guards and actions of one interpreter.
///
/// Built once when the interpreter is constructed and never mutated; a
/// recreated interpreter gets a fresh context.
#[derive(Clone)]
pub struct ExecutionContext {
    record: Arc<dyn Record>,
}

impl ExecutionContext {
    /// Binds `record` under [`CONTEXT_SYMBOL`].
    pub fn new(record: Arc<dyn Record>) -> Self {
        Self { record }
    }

    /// Returns the bound record.
    pub fn record(&self) -> &Arc<dyn Record> {
        &self.record
    }

    /// Returns the identity of the bound record.
    pub fn key(&self) -> RecordKey {
        self.record.key()
    }

    /// Resolves a symbol. Only [`CONTEXT_SYMBOL`] is bound.
    pub fn resolve(&self, symbol: &str) -> Option<&Arc<dyn Record>> {
        (symbol == CONTEXT_SYMBOL).then_some(&self.record)
    }

    /// Invokes a method on the bound record.
    pub fn invoke(
        &self,
        method: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ActionError> {
        tracing::trace!("invoking {} on {}", method, self.record.key());
        self.record.invoke(method, args, kwargs)
    }
}

impl FieldSource for ExecutionContext {
    /// The first path segment names a record attribute; further segments
    /// descend into its JSON value.
    fn field(&self, path: &str) -> Value {
        let mut parts = path.split('.');
        let Some(attribute) = parts.next() else {
            return Value::Null;
        };
        match self.record.attribute(attribute) {
            Some(value) => lookup_path(&value, parts),
            None => Value::Null,
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field(CONTEXT_SYMBOL, &self.record.key())
            .finish()
    }
}
