//! Registry, record store and caches wired together under one data directory.

use crate::error::StorageError;
use crate::records::RecordStore;
use crate::registry::StatechartRegistry;
use serde::Serialize;
use statebound_core::{
    BoundInterpreter, Configuration, ConfigurationCodec, CoreError, DefinitionStore,
    DispatchOutcome, EventEnvelope, InterpreterCache, RecordKey,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Restorability of one record's persisted configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckStatus {
    /// Never started; the next access cold-starts.
    Unset,
    /// Restores cleanly under the current statechart.
    Restorable { configuration: Configuration },
    /// The record type has no statechart.
    NoDefinition,
    /// Would fail at interpreter construction.
    Broken { code: &'static str, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub key: RecordKey,
    #[serde(flatten)]
    pub status: CheckStatus,
}

impl CheckReport {
    pub fn is_broken(&self) -> bool {
        matches!(self.status, CheckStatus::Broken { .. })
    }
}

/// Host runtime over a data directory.
///
/// The interpreter cache is registered as invalidation hook on both the
/// statechart registry and the record store.
pub struct Runtime {
    data_dir: PathBuf,
    registry: Arc<StatechartRegistry>,
    records: Arc<RecordStore>,
    cache: Arc<InterpreterCache>,
}

impl Runtime {
    /// Opens `<data_dir>/statecharts` and `<data_dir>/records`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let registry = Arc::new(StatechartRegistry::open(data_dir.join("statecharts"))?);
        let records = Arc::new(RecordStore::open(data_dir.join("records"))?);

        let definitions = Arc::new(DefinitionStore::new(registry.clone()));
        let cache = Arc::new(InterpreterCache::new(definitions));
        registry.add_hook(cache.clone());
        records.add_hook(cache.clone());

        Ok(Self {
            data_dir,
            registry,
            records,
            cache,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn registry(&self) -> &Arc<StatechartRegistry> {
        &self.registry
    }

    pub fn records(&self) -> &Arc<RecordStore> {
        &self.records
    }

    pub fn cache(&self) -> &Arc<InterpreterCache> {
        &self.cache
    }

    /// Returns the interpreter for a stored record.
    ///
    /// A record that was never started is cold-started and its initial
    /// configuration written back.
    pub fn interpreter(&self, key: &RecordKey) -> Result<Arc<BoundInterpreter>, StorageError> {
        let record = self.records.handle(key)?;
        let interpreter = self.cache.interpreter_for(record)?;

        let stored = self.records.get(key).and_then(|r| r.configuration);
        if ConfigurationCodec::is_unset(stored.as_deref()) {
            self.records.persist_configuration(&interpreter)?;
        }
        Ok(interpreter)
    }

    /// Delivers an envelope to a record and persists the resulting
    /// configuration when it changed.
    pub fn send(
        &self,
        key: &RecordKey,
        envelope: EventEnvelope,
    ) -> Result<DispatchOutcome, StorageError> {
        let interpreter = self.interpreter(key)?;
        let outcome = interpreter.send(envelope)?;
        if outcome.changed_configuration() {
            self.records.persist_configuration(&interpreter)?;
        }
        tracing::debug!(
            "{} handled {} in {}",
            key,
            outcome.event,
            outcome.configuration
        );
        Ok(outcome)
    }

    /// Checks whether each record's persisted configuration would restore.
    /// Nothing is started and no action runs.
    pub fn check(&self, record_type: Option<&str>) -> Result<Vec<CheckReport>, StorageError> {
        let types = match record_type {
            Some(t) => vec![t.to_string()],
            None => self.records.record_types(),
        };

        let mut reports = Vec::new();
        for record_type in types {
            let definition = self.cache.definitions().definition_for(&record_type);
            for record in self.records.list(&record_type) {
                let key = record.key();
                let status = match (&definition, record.configuration.as_deref()) {
                    (_, text) if ConfigurationCodec::is_unset(text) => CheckStatus::Unset,
                    (Err(e), _) => CheckStatus::Broken {
                        code: e.error_code(),
                        error: e.to_string(),
                    },
                    (Ok(None), _) => CheckStatus::NoDefinition,
                    (Ok(Some(definition)), text) => {
                        let text = text.unwrap_or_default();
                        match ConfigurationCodec::decode(text, definition).and_then(|c| {
                            definition.check_consistent(&c)?;
                            Ok(c)
                        }) {
                            Ok(configuration) => CheckStatus::Restorable { configuration },
                            Err(source) => {
                                let e = CoreError::Configuration {
                                    key: key.clone(),
                                    source,
                                };
                                CheckStatus::Broken {
                                    code: e.error_code(),
                                    error: e.to_string(),
                                }
                            }
                        }
                    }
                };
                reports.push(CheckReport { key, status });
            }
        }
        Ok(reports)
    }

    /// Clears a record's configuration so the next access cold-starts.
    pub fn reset(&self, key: &RecordKey) -> Result<(), StorageError> {
        self.records.clear_configuration(key)?;
        Ok(())
    }
}
