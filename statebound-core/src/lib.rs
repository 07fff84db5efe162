//! # statebound-core
//!
//! Statechart runtime for business records.
//!
//! This crate provides:
//! - Statechart definition parsing and validation
//! - Guard expression evaluation
//! - A reference statechart interpreter
//! - Configuration encoding for persistence on the record
//! - Per-type definition cache and per-record interpreter cache

pub mod cache;
pub mod configuration;
pub mod definition;
pub mod error;
pub mod event;
pub mod guard;
pub mod interpreter;
pub mod record;
pub mod store;

pub use cache::{
    BoundInterpreter, CacheStatsSnapshot, Establishment, InterpreterCache, InvalidationHook,
    Lifecycle,
};
pub use configuration::{Configuration, ConfigurationCodec};
pub use definition::{Action, Definition, StateNode, Transition};
pub use error::{ActionError, ConfigurationError, CoreError, DefinitionError, EngineError};
pub use event::{DispatchOutcome, EventEnvelope, MacroStep};
pub use guard::GuardExpr;
pub use interpreter::{DefaultEngineFactory, EngineFactory, Interpreter, InterpreterEngine};
pub use record::{ExecutionContext, FieldSource, Record, RecordKey, CONTEXT_SYMBOL};
pub use store::{DefinitionSource, DefinitionStore};
