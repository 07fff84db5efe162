//! # statebound-storage
//!
//! Storage layer for statebound.
//!
//! This crate provides:
//! - The statechart registry (one statechart per record type)
//! - A file-backed record store holding each record's configuration
//! - A runtime wiring both to the interpreter cache

pub mod error;
pub mod records;
pub mod registry;
pub mod runtime;

pub use error::StorageError;
pub use records::{MethodTable, RecordEntry, RecordStore, StoredRecord};
pub use registry::{StatechartRegistry, StoredStatechart};
pub use runtime::{CheckReport, CheckStatus, Runtime};
