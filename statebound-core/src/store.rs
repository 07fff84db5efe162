//! Process-wide cache of parsed statecharts, keyed by record type.

use crate::definition::Definition;
use crate::error::CoreError;
use dashmap::DashMap;
use std::sync::Arc;

/// Where statechart sources come from, typically the administrative
/// registry of statechart records.
pub trait DefinitionSource: Send + Sync {
    /// Returns the textual source registered for `record_type`, or `None` if
    /// the type has no statechart.
    fn statechart_source(&self, record_type: &str) -> Result<Option<String>, CoreError>;
}

/// Loads and caches one [`Definition`] per record type.
///
/// Types without a statechart are cached as absent too; both kinds of entry
/// are dropped by [`DefinitionStore::invalidate`].
pub struct DefinitionStore {
    source: Arc<dyn DefinitionSource>,

    /// Parsed definitions (or known absence) by record type.
    definitions: DashMap<String, Option<Arc<Definition>>>,

    /// Bumped on every invalidation. A load only publishes its result if the
    /// generation it started under is still current.
    generations: DashMap<String, u64>,
}

impl DefinitionStore {
    pub fn new(source: Arc<dyn DefinitionSource>) -> Self {
        Self {
            source,
            definitions: DashMap::new(),
            generations: DashMap::new(),
        }
    }

    /// Returns the definition for `record_type`, loading it on a miss.
    ///
    /// Parse failures are returned to the caller and not cached, so the next
    /// call tries again.
    pub fn definition_for(&self, record_type: &str) -> Result<Option<Arc<Definition>>, CoreError> {
        if let Some(cached) = self.definitions.get(record_type) {
            return Ok(cached.clone());
        }

        let generation = self.generation(record_type);
        tracing::debug!("loading statechart for {}", record_type);

        let loaded = match self.source.statechart_source(record_type)? {
            Some(text) => {
                let definition =
                    Definition::from_yaml(&text).map_err(|source| CoreError::Definition {
                        record_type: record_type.to_string(),
                        source,
                    })?;
                Some(Arc::new(definition))
            }
            None => None,
        };

        // Holding the generation entry orders this publish against
        // `invalidate`.
        let current = self
            .generations
            .entry(record_type.to_string())
            .or_insert(0);
        if *current == generation {
            self.definitions
                .insert(record_type.to_string(), loaded.clone());
        } else {
            tracing::debug!(
                "statechart for {} invalidated while loading, not cached",
                record_type
            );
        }
        drop(current);

        Ok(loaded)
    }

    /// Drops the cached definition for `record_type`.
    pub fn invalidate(&self, record_type: &str) {
        let mut generation = self
            .generations
            .entry(record_type.to_string())
            .or_insert(0);
        *generation += 1;
        self.definitions.remove(record_type);
        tracing::debug!("invalidated statechart for {}", record_type);
    }

    /// Drops every cached definition.
    pub fn clear(&self) {
        let types: Vec<String> = self.definitions.iter().map(|e| e.key().clone()).collect();
        for record_type in types {
            self.invalidate(&record_type);
        }
    }

    /// Returns true if `definition` is the one currently cached for
    /// `record_type`. False once it was invalidated.
    pub fn is_current(&self, record_type: &str, definition: &Arc<Definition>) -> bool {
        match self.definitions.get(record_type) {
            Some(cached) => cached
                .as_ref()
                .map(|d| Arc::ptr_eq(d, definition))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Returns true if a definition or known absence is cached.
    pub fn is_cached(&self, record_type: &str) -> bool {
        self.definitions.contains_key(record_type)
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    fn generation(&self, record_type: &str) -> u64 {
        self.generations.get(record_type).map(|g| *g).unwrap_or(0)
    }
}
