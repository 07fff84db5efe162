//! Administrative registry of statechart sources, one per record type.
//!
//! Every change notifies the registered invalidation hooks before it is
//! written to disk, while the registry write lock is held. Readers going
//! through [`DefinitionSource`] therefore never load a source that the caches
//! have not yet been told about.

use crate::error::{check_name, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use statebound_core::{CoreError, Definition, DefinitionSource, InvalidationHook};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A registered statechart as persisted on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredStatechart {
    pub record_type: String,
    /// Textual statechart source, kept verbatim.
    pub source: String,
    /// Checksum of the parsed definition.
    pub checksum: String,
    /// Last change (Unix millis).
    pub updated_at: i64,
}

/// File-backed statechart registry.
pub struct StatechartRegistry {
    dir: PathBuf,
    index: RwLock<HashMap<String, StoredStatechart>>,
    hooks: RwLock<Vec<Arc<dyn InvalidationHook>>>,
}

impl StatechartRegistry {
    /// Opens or creates a registry at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let registry = Self {
            dir,
            index: RwLock::new(HashMap::new()),
            hooks: RwLock::new(Vec::new()),
        };
        registry.load()?;
        Ok(registry)
    }

    fn load(&self) -> Result<(), StorageError> {
        let mut index = self.index.write();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let reader = BufReader::new(File::open(&path)?);
                let stored: StoredStatechart = serde_json::from_reader(reader)?;
                index.insert(stored.record_type.clone(), stored);
            }
        }
        tracing::info!("loaded {} statechart(s) from {}", index.len(), self.dir.display());
        Ok(())
    }

    /// Registers a hook notified of every statechart change.
    pub fn add_hook(&self, hook: Arc<dyn InvalidationHook>) {
        self.hooks.write().push(hook);
    }

    /// Registers the statechart for a record type that has none yet.
    pub fn create(&self, record_type: &str, source: &str) -> Result<StoredStatechart, StorageError> {
        let mut index = self.index.write();
        if index.contains_key(record_type) {
            return Err(StorageError::StatechartExists(record_type.to_string()));
        }
        let stored = self.commit(&mut index, record_type, source)?;
        tracing::info!("created statechart for {} ({})", record_type, stored.checksum);
        Ok(stored)
    }

    /// Replaces the statechart of an already registered record type.
    pub fn write(&self, record_type: &str, source: &str) -> Result<StoredStatechart, StorageError> {
        let mut index = self.index.write();
        if !index.contains_key(record_type) {
            return Err(StorageError::StatechartNotFound(record_type.to_string()));
        }
        let stored = self.commit(&mut index, record_type, source)?;
        tracing::info!("updated statechart for {} ({})", record_type, stored.checksum);
        Ok(stored)
    }

    /// Creates or replaces the statechart of a record type.
    pub fn put(&self, record_type: &str, source: &str) -> Result<StoredStatechart, StorageError> {
        let mut index = self.index.write();
        let stored = self.commit(&mut index, record_type, source)?;
        tracing::info!("stored statechart for {} ({})", record_type, stored.checksum);
        Ok(stored)
    }

    /// Removes the statechart of a record type.
    pub fn unlink(&self, record_type: &str) -> Result<StoredStatechart, StorageError> {
        let mut index = self.index.write();
        let Some(stored) = index.get(record_type).cloned() else {
            return Err(StorageError::StatechartNotFound(record_type.to_string()));
        };

        self.notify(record_type);
        fs::remove_file(self.path(record_type))?;
        index.remove(record_type);

        tracing::info!("deleted statechart for {}", record_type);
        Ok(stored)
    }

    pub fn get(&self, record_type: &str) -> Option<StoredStatechart> {
        self.index.read().get(record_type).cloned()
    }

    /// Lists registered statecharts ordered by record type.
    pub fn list(&self) -> Vec<StoredStatechart> {
        let mut all: Vec<_> = self.index.read().values().cloned().collect();
        all.sort_by(|a, b| a.record_type.cmp(&b.record_type));
        all
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Validates, notifies hooks, persists, then publishes in memory.
    fn commit(
        &self,
        index: &mut HashMap<String, StoredStatechart>,
        record_type: &str,
        source: &str,
    ) -> Result<StoredStatechart, StorageError> {
        check_name("record type", record_type)?;
        let definition = Definition::from_yaml(source).map_err(|source| StorageError::Definition {
            record_type: record_type.to_string(),
            source,
        })?;

        let stored = StoredStatechart {
            record_type: record_type.to_string(),
            source: source.to_string(),
            checksum: definition.checksum,
            updated_at: now_millis(),
        };

        self.notify(record_type);

        let mut writer = BufWriter::new(File::create(self.path(record_type))?);
        serde_json::to_writer_pretty(&mut writer, &stored)?;
        writer.flush()?;

        index.insert(record_type.to_string(), stored.clone());
        Ok(stored)
    }

    fn notify(&self, record_type: &str) {
        for hook in self.hooks.read().iter() {
            hook.definition_changed(record_type);
        }
    }

    fn path(&self, record_type: &str) -> PathBuf {
        self.dir.join(format!("{}.json", record_type))
    }
}

impl DefinitionSource for StatechartRegistry {
    fn statechart_source(&self, record_type: &str) -> Result<Option<String>, CoreError> {
        Ok(self.index.read().get(record_type).map(|s| s.source.clone()))
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
