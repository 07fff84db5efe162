//! Per-record interpreter cache.
//!
//! Each record identity maps to at most one live interpreter per process.
//! Construction happens once per key: concurrent callers for the same record
//! wait on that key's slot while the first one builds, then share the result.
//!
//! Lifecycle of an entry: absent -> constructing -> live -> invalidated ->
//! absent. An interpreter becomes live only after exactly one of restore or
//! initial execution succeeded.

use crate::configuration::{Configuration, ConfigurationCodec};
use crate::definition::Definition;
use crate::error::{CoreError, EngineError};
use crate::event::{DispatchOutcome, EventEnvelope, MacroStep};
use crate::interpreter::{DefaultEngineFactory, EngineFactory, InterpreterEngine};
use crate::record::{ExecutionContext, Record, RecordKey};
use crate::store::DefinitionStore;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use uuid::Uuid;

/// Receives change notifications from the persistence layer.
///
/// Hosts call these from their write/delete paths before the write is
/// acknowledged.
pub trait InvalidationHook: Send + Sync {
    /// The statechart source of `record_type` was created, changed or removed.
    fn definition_changed(&self, record_type: &str);

    /// The record was deleted or its configuration was written or reset.
    fn record_changed(&self, key: &RecordKey);
}

/// How a cached interpreter reached its first configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Establishment {
    /// Resumed from the record's persisted configuration.
    Restored,
    /// Cold-started through the initial transition.
    Started,
}

/// Whether a handed-out interpreter is still the cached one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Live,
    Invalidated,
}

/// An interpreter bound to one record, as handed out by the cache.
///
/// Callers share the same instance; the engine is behind a mutex so
/// concurrent sends to one record are serialized.
pub struct BoundInterpreter {
    id: Uuid,
    key: RecordKey,
    definition: Arc<Definition>,
    established: Establishment,
    created_at: i64,
    invalidated: AtomicBool,
    engine: Mutex<Box<dyn InterpreterEngine>>,
}

impl BoundInterpreter {
    fn new(
        key: RecordKey,
        definition: Arc<Definition>,
        established: Establishment,
        engine: Box<dyn InterpreterEngine>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            definition,
            established,
            created_at: now_millis(),
            invalidated: AtomicBool::new(false),
            engine: Mutex::new(engine),
        }
    }

    /// Unique id of this interpreter instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    /// Definition this interpreter was built from.
    pub fn definition(&self) -> &Arc<Definition> {
        &self.definition
    }

    pub fn established(&self) -> Establishment {
        self.established
    }

    /// Creation timestamp (Unix millis).
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.invalidated.load(Ordering::Acquire) {
            Lifecycle::Invalidated
        } else {
            Lifecycle::Live
        }
    }

    pub fn is_live(&self) -> bool {
        self.lifecycle() == Lifecycle::Live
    }

    /// Locks the engine for a sequence of operations.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn InterpreterEngine>> {
        self.engine.lock()
    }

    /// Delivers an envelope. The caller persists the new configuration.
    pub fn send(&self, envelope: EventEnvelope) -> Result<DispatchOutcome, EngineError> {
        self.engine.lock().send(envelope)
    }

    pub fn queue(&self, envelope: EventEnvelope) {
        self.engine.lock().queue(envelope)
    }

    pub fn execute_once(&self) -> Result<Option<MacroStep>, EngineError> {
        self.engine.lock().execute_once()
    }

    pub fn configuration(&self) -> Configuration {
        self.engine.lock().configuration()
    }

    /// Returns the configuration in its durable encoding, ready to be stored
    /// into the record's configuration field.
    pub fn encoded_configuration(&self) -> String {
        ConfigurationCodec::encode(&self.configuration())
    }

    fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for BoundInterpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundInterpreter")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("definition", &self.definition.checksum)
            .field("established", &self.established)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

/// Cache counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    restores: AtomicU64,
    cold_starts: AtomicU64,
    failures: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub restores: u64,
    pub cold_starts: u64,
    pub failures: u64,
    pub invalidations: u64,
}

impl CacheStatsSnapshot {
    /// Interpreters successfully constructed.
    pub fn constructions(&self) -> u64 {
        self.restores + self.cold_starts
    }
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            restores: self.restores.load(Ordering::Relaxed),
            cold_starts: self.cold_starts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Construction slot for one record key.
#[derive(Default)]
struct Slot {
    interpreter: Mutex<Option<Arc<BoundInterpreter>>>,

    /// Thread currently building into this slot.
    builder: Mutex<Option<ThreadId>>,
}

impl Slot {
    /// Empties the slot and flags whatever it held as invalidated.
    ///
    /// Called from the thread building into this slot (an entry action
    /// removing its own record), it returns without waiting: the slot is
    /// empty and the construction will find it evicted.
    fn evict(&self) -> bool {
        if *self.builder.lock() == Some(thread::current().id()) {
            return false;
        }
        match self.interpreter.lock().take() {
            Some(interpreter) => {
                interpreter.invalidate();
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct Index {
    slots: HashMap<RecordKey, Arc<Slot>>,
    /// Record ids with a slot, by record type.
    by_type: HashMap<String, HashSet<String>>,
}

impl Index {
    fn remove(&mut self, key: &RecordKey) -> Option<Arc<Slot>> {
        let slot = self.slots.remove(key)?;
        if let Some(ids) = self.by_type.get_mut(&key.record_type) {
            ids.remove(&key.id);
            if ids.is_empty() {
                self.by_type.remove(&key.record_type);
            }
        }
        Some(slot)
    }
}

/// Hands out the single live interpreter for each record.
pub struct InterpreterCache {
    definitions: Arc<DefinitionStore>,
    factory: Arc<dyn EngineFactory>,

    /// Slot map and type index. Never held while a slot mutex is acquired.
    index: RwLock<Index>,

    stats: CacheStats,
}

impl InterpreterCache {
    /// Creates a cache building the bundled interpreter.
    pub fn new(definitions: Arc<DefinitionStore>) -> Self {
        Self::with_factory(definitions, Arc::new(DefaultEngineFactory))
    }

    /// Creates a cache building interpreters through `factory`.
    pub fn with_factory(definitions: Arc<DefinitionStore>, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            definitions,
            factory,
            index: RwLock::new(Index::default()),
            stats: CacheStats::default(),
        }
    }

    pub fn definitions(&self) -> &Arc<DefinitionStore> {
        &self.definitions
    }

    /// Returns the interpreter bound to `record`, constructing it on first
    /// access.
    ///
    /// A fresh interpreter resumes from the record's persisted configuration
    /// when there is one, and otherwise runs the initial transition. An
    /// unusable persisted configuration is an error; it never falls back to a
    /// cold start.
    pub fn interpreter_for(
        &self,
        record: Arc<dyn Record>,
    ) -> Result<Arc<BoundInterpreter>, CoreError> {
        let key = record.key();
        loop {
            let definition = self
                .definitions
                .definition_for(&key.record_type)?
                .ok_or_else(|| CoreError::NoDefinition {
                    record_type: key.record_type.clone(),
                })?;

            let slot = self.slot(&key);
            let mut held = slot.interpreter.lock();

            // Evicted while waiting, or resolved before a statechart change.
            if !self.is_current(&key, &slot)
                || !self.definitions.is_current(&key.record_type, &definition)
            {
                continue;
            }

            if let Some(existing) = held.as_ref() {
                if existing.is_live() && Arc::ptr_eq(existing.definition(), &definition) {
                    CacheStats::bump(&self.stats.hits);
                    return Ok(Arc::clone(existing));
                }
                tracing::debug!(
                    "interpreter {} for {} built from a replaced statechart, rebuilding",
                    existing.id(),
                    key
                );
                existing.invalidate();
                *held = None;
            }

            CacheStats::bump(&self.stats.misses);
            *slot.builder.lock() = Some(thread::current().id());
            let built = self.construct(&key, Arc::clone(&record), definition);
            *slot.builder.lock() = None;

            let interpreter = match built {
                Ok(interpreter) => Arc::new(interpreter),
                Err(e) => {
                    CacheStats::bump(&self.stats.failures);
                    tracing::debug!("failed to construct interpreter for {}: {}", key, e);
                    self.discard(&key, &slot);
                    return Err(e);
                }
            };

            if self.is_current(&key, &slot) {
                *held = Some(Arc::clone(&interpreter));
            } else {
                tracing::warn!(
                    "{} was invalidated while its interpreter was being built, not cached",
                    key
                );
                interpreter.invalidate();
            }

            return Ok(interpreter);
        }
    }

    /// Returns the cached live interpreter for `key` without constructing one.
    pub fn get(&self, key: &RecordKey) -> Option<Arc<BoundInterpreter>> {
        let slot = self.index.read().slots.get(key).cloned()?;
        let held = slot.interpreter.lock();
        held.as_ref().filter(|i| i.is_live()).cloned()
    }

    /// Evicts the interpreter bound to `key`. Returns true if one was cached.
    pub fn invalidate(&self, key: &RecordKey) -> bool {
        let slot = self.index.write().remove(key);
        let evicted = slot.map(|s| s.evict()).unwrap_or(false);
        if evicted {
            CacheStats::bump(&self.stats.invalidations);
            tracing::debug!("invalidated interpreter for {}", key);
        }
        evicted
    }

    /// Evicts every interpreter bound to a record of `record_type`. Returns
    /// how many were cached.
    pub fn invalidate_by_type(&self, record_type: &str) -> usize {
        let slots: Vec<Arc<Slot>> = {
            let mut index = self.index.write();
            let ids = index.by_type.remove(record_type).unwrap_or_default();
            ids.into_iter()
                .filter_map(|id| index.slots.remove(&RecordKey::new(record_type, id)))
                .collect()
        };

        let evicted = slots.iter().filter(|s| s.evict()).count();
        for _ in 0..evicted {
            CacheStats::bump(&self.stats.invalidations);
        }
        tracing::debug!(
            "invalidated {} interpreter(s) for record type {}",
            evicted,
            record_type
        );
        evicted
    }

    /// Drops the cached statechart of `record_type` and every interpreter
    /// built from it.
    pub fn invalidate_definition(&self, record_type: &str) -> usize {
        self.definitions.invalidate(record_type);
        self.invalidate_by_type(record_type)
    }

    /// Evicts everything.
    pub fn clear(&self) {
        let slots: Vec<Arc<Slot>> = {
            let mut index = self.index.write();
            index.by_type.clear();
            index.slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            if slot.evict() {
                CacheStats::bump(&self.stats.invalidations);
            }
        }
    }

    /// Returns the number of records with a cached or in-progress
    /// interpreter.
    pub fn len(&self) -> usize {
        self.index.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().slots.is_empty()
    }

    /// Returns the keys currently cached for `record_type`, sorted.
    pub fn cached_ids(&self, record_type: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .index
            .read()
            .by_type
            .get(record_type)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the slot for `key`, creating it if needed.
    fn slot(&self, key: &RecordKey) -> Arc<Slot> {
        if let Some(slot) = self.index.read().slots.get(key) {
            return Arc::clone(slot);
        }

        let mut index = self.index.write();
        if let Some(slot) = index.slots.get(key) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(Slot::default());
        index.slots.insert(key.clone(), Arc::clone(&slot));
        index
            .by_type
            .entry(key.record_type.clone())
            .or_default()
            .insert(key.id.clone());
        slot
    }

    /// Drops the slot of a failed construction from the index.
    fn discard(&self, key: &RecordKey, slot: &Arc<Slot>) {
        let mut index = self.index.write();
        if index.slots.get(key).map(|s| Arc::ptr_eq(s, slot)).unwrap_or(false) {
            index.remove(key);
        }
    }

    fn is_current(&self, key: &RecordKey, slot: &Arc<Slot>) -> bool {
        self.index
            .read()
            .slots
            .get(key)
            .map(|s| Arc::ptr_eq(s, slot))
            .unwrap_or(false)
    }

    fn construct(
        &self,
        key: &RecordKey,
        record: Arc<dyn Record>,
        definition: Arc<Definition>,
    ) -> Result<BoundInterpreter, CoreError> {
        let persisted = record.configuration();
        let context = ExecutionContext::new(record);
        let mut engine = self.factory.build(Arc::clone(&definition), context);

        let established = if ConfigurationCodec::is_unset(persisted.as_deref()) {
            engine.execute_once()?;
            CacheStats::bump(&self.stats.cold_starts);
            Establishment::Started
        } else {
            let text = persisted.unwrap_or_default();
            let configuration = ConfigurationCodec::decode(&text, &definition).map_err(|source| {
                CoreError::Configuration {
                    key: key.clone(),
                    source,
                }
            })?;
            engine.restore(configuration).map_err(|e| match e {
                EngineError::Configuration(source) => CoreError::Configuration {
                    key: key.clone(),
                    source,
                },
                other => CoreError::Engine(other),
            })?;
            CacheStats::bump(&self.stats.restores);
            Establishment::Restored
        };

        let interpreter = BoundInterpreter::new(key.clone(), definition, established, engine);
        tracing::debug!(
            "built interpreter {} for {} ({:?}, statechart {})",
            interpreter.id(),
            key,
            established,
            interpreter.definition().checksum
        );
        Ok(interpreter)
    }
}

impl InvalidationHook for InterpreterCache {
    fn definition_changed(&self, record_type: &str) {
        self.invalidate_definition(record_type);
    }

    fn record_changed(&self, key: &RecordKey) {
        self.invalidate(key);
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
