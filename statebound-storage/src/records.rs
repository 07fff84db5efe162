//! Durable business records carrying their persisted statechart configuration.

use crate::error::{check_name, StorageError};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use statebound_core::{ActionError, BoundInterpreter, InvalidationHook, Record, RecordKey};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A record as persisted on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub id: String,
    pub record_type: String,
    /// Encoded active-state set; `None` until the first write-back.
    #[serde(default)]
    pub configuration: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl RecordEntry {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.record_type.clone(), self.id.clone())
    }
}

/// A record method callable from statechart actions.
pub type Method = Arc<
    dyn Fn(&StoredRecord, &[Value], &Map<String, Value>) -> Result<Value, ActionError>
        + Send
        + Sync,
>;

/// Methods registered for one record type.
#[derive(Default, Clone)]
pub struct MethodTable {
    methods: HashMap<String, Method>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `method` under `name`, replacing any previous one.
    ///
    /// Methods run as entry actions while their record's interpreter is
    /// being built. They may write, reset or delete their own record, but
    /// must not ask the cache or runtime for that record's interpreter: the
    /// call would wait on the construction it is part of.
    pub fn register<F>(&mut self, name: impl Into<String>, method: F) -> &mut Self
    where
        F: Fn(&StoredRecord, &[Value], &Map<String, Value>) -> Result<Value, ActionError>
            + Send
            + Sync
            + 'static,
    {
        self.methods.insert(name.into(), Arc::new(method));
        self
    }

    pub fn get(&self, name: &str) -> Option<Method> {
        self.methods.get(name).cloned()
    }

    /// Returns registered method names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// File-backed record store.
///
/// Records live under `<dir>/<record_type>/<id>.json`.
pub struct RecordStore {
    dir: PathBuf,
    records: RwLock<HashMap<RecordKey, RecordEntry>>,

    /// Method tables by record type.
    methods: DashMap<String, MethodTable>,

    hooks: RwLock<Vec<Arc<dyn InvalidationHook>>>,
}

impl RecordStore {
    /// Opens or creates a record store at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            records: RwLock::new(HashMap::new()),
            methods: DashMap::new(),
            hooks: RwLock::new(Vec::new()),
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<(), StorageError> {
        let mut records = self.records.write();
        for type_dir in fs::read_dir(&self.dir)? {
            let type_dir = type_dir?.path();
            if !type_dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&type_dir)? {
                let path = entry?.path();
                if path.extension().map(|e| e == "json").unwrap_or(false) {
                    let reader = BufReader::new(File::open(&path)?);
                    let record: RecordEntry = serde_json::from_reader(reader)?;
                    records.insert(record.key(), record);
                }
            }
        }
        tracing::info!("loaded {} record(s) from {}", records.len(), self.dir.display());
        Ok(())
    }

    /// Registers a hook notified when a record is deleted or its
    /// configuration is written or reset.
    pub fn add_hook(&self, hook: Arc<dyn InvalidationHook>) {
        self.hooks.write().push(hook);
    }

    /// Installs the method table for a record type.
    pub fn register_methods(&self, record_type: impl Into<String>, table: MethodTable) {
        self.methods.insert(record_type.into(), table);
    }

    /// Creates a record. A fresh id is generated when `id` is `None`.
    pub fn create(
        &self,
        record_type: &str,
        id: Option<&str>,
        attributes: Map<String, Value>,
    ) -> Result<RecordEntry, StorageError> {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        check_name("record type", record_type)?;
        check_name("record id", &id)?;

        let record = RecordEntry {
            id,
            record_type: record_type.to_string(),
            configuration: None,
            attributes,
        };
        let key = record.key();

        let mut records = self.records.write();
        if records.contains_key(&key) {
            return Err(StorageError::RecordExists(key));
        }
        self.persist(&record)?;
        records.insert(key.clone(), record.clone());

        tracing::info!("created record {}", key);
        Ok(record)
    }

    pub fn get(&self, key: &RecordKey) -> Option<RecordEntry> {
        self.records.read().get(key).cloned()
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.records.read().contains_key(key)
    }

    /// Lists the records of a type ordered by id.
    pub fn list(&self, record_type: &str) -> Vec<RecordEntry> {
        let mut records: Vec<RecordEntry> = self
            .records
            .read()
            .values()
            .filter(|r| r.record_type == record_type)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Returns every record type with at least one record, sorted.
    pub fn record_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .records
            .read()
            .keys()
            .map(|k| k.record_type.clone())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Merges `attributes` into the record's attributes.
    pub fn update_attributes(
        &self,
        key: &RecordKey,
        attributes: Map<String, Value>,
    ) -> Result<RecordEntry, StorageError> {
        self.modify(key, |record| record.attributes.extend(attributes))
    }

    /// Stores an encoded configuration verbatim. The record's cached
    /// interpreter is evicted, so the next access restores from `configuration`.
    pub fn write_configuration(
        &self,
        key: &RecordKey,
        configuration: &str,
    ) -> Result<RecordEntry, StorageError> {
        if !self.contains(key) {
            return Err(StorageError::RecordNotFound(key.clone()));
        }
        self.notify(key);
        let record = self.store_configuration(key, configuration)?;
        self.notify(key);

        tracing::info!("wrote configuration {} to {}", configuration, key);
        Ok(record)
    }

    /// Writes back the configuration of `interpreter` to its record.
    ///
    /// The interpreter stays cached: the stored text is its own state.
    pub fn persist_configuration(
        &self,
        interpreter: &BoundInterpreter,
    ) -> Result<String, StorageError> {
        let encoded = interpreter.encoded_configuration();
        self.store_configuration(interpreter.key(), &encoded)?;
        tracing::debug!("persisted {} for {}", encoded, interpreter.key());
        Ok(encoded)
    }

    /// Resets the record to "never started". Its cached interpreter is
    /// evicted.
    pub fn clear_configuration(&self, key: &RecordKey) -> Result<RecordEntry, StorageError> {
        if !self.contains(key) {
            return Err(StorageError::RecordNotFound(key.clone()));
        }
        self.notify(key);
        let record = self.modify(key, |record| record.configuration = None)?;
        self.notify(key);

        tracing::info!("cleared configuration of {}", key);
        Ok(record)
    }

    /// Deletes the record. Its cached interpreter is evicted.
    pub fn delete(&self, key: &RecordKey) -> Result<RecordEntry, StorageError> {
        if !self.contains(key) {
            return Err(StorageError::RecordNotFound(key.clone()));
        }
        self.notify(key);
        let removed = {
            let mut records = self.records.write();
            let removed = records
                .remove(key)
                .ok_or_else(|| StorageError::RecordNotFound(key.clone()))?;
            fs::remove_file(self.path(key))?;
            removed
        };
        self.notify(key);

        tracing::info!("deleted record {}", key);
        Ok(removed)
    }

    /// Returns a [`Record`] view of a stored record, for binding to an
    /// interpreter.
    pub fn handle(self: &Arc<Self>, key: &RecordKey) -> Result<Arc<StoredRecord>, StorageError> {
        if !self.contains(key) {
            return Err(StorageError::RecordNotFound(key.clone()));
        }
        Ok(Arc::new(StoredRecord {
            store: Arc::clone(self),
            key: key.clone(),
        }))
    }

    fn store_configuration(
        &self,
        key: &RecordKey,
        configuration: &str,
    ) -> Result<RecordEntry, StorageError> {
        self.modify(key, |record| {
            record.configuration = Some(configuration.to_string())
        })
    }

    fn modify<F>(&self, key: &RecordKey, change: F) -> Result<RecordEntry, StorageError>
    where
        F: FnOnce(&mut RecordEntry),
    {
        let mut records = self.records.write();
        let current = records
            .get(key)
            .ok_or_else(|| StorageError::RecordNotFound(key.clone()))?;

        let mut updated = current.clone();
        change(&mut updated);
        self.persist(&updated)?;
        records.insert(key.clone(), updated.clone());
        Ok(updated)
    }

    /// Hooks run without the records lock held: actions executing inside an
    /// interpreter write to this store.
    fn notify(&self, key: &RecordKey) {
        for hook in self.hooks.read().iter() {
            hook.record_changed(key);
        }
    }

    fn persist(&self, record: &RecordEntry) -> Result<(), StorageError> {
        let type_dir = self.dir.join(&record.record_type);
        fs::create_dir_all(&type_dir)?;

        let path = type_dir.join(format!("{}.json", record.id));
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, record)?;
        writer.flush()?;
        Ok(())
    }

    fn path(&self, key: &RecordKey) -> PathBuf {
        self.dir
            .join(&key.record_type)
            .join(format!("{}.json", key.id))
    }
}

/// Live view of a stored record bound to an interpreter.
///
/// Attributes are read from the store on every access, so writes made by
/// earlier actions are visible to later guards.
pub struct StoredRecord {
    store: Arc<RecordStore>,
    key: RecordKey,
}

impl StoredRecord {
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Merges attributes into the record.
    pub fn write(&self, attributes: Map<String, Value>) -> Result<(), StorageError> {
        self.store.update_attributes(&self.key, attributes)?;
        Ok(())
    }

    fn builtin(
        &self,
        method: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Option<Result<Value, ActionError>> {
        let result = match method {
            "write" => self
                .write(kwargs.clone())
                .map(|_| Value::Bool(true))
                .map_err(|e| ActionError::Failed {
                    method: method.to_string(),
                    message: e.to_string(),
                }),
            "read" => Ok(args
                .first()
                .and_then(Value::as_str)
                .and_then(|name| self.attribute(name))
                .unwrap_or(Value::Null)),
            "raise_user_error" => Err(ActionError::Failed {
                method: method.to_string(),
                message: args
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("user error")
                    .to_string(),
            }),
            _ => return None,
        };
        Some(result)
    }
}

impl Record for StoredRecord {
    fn key(&self) -> RecordKey {
        self.key.clone()
    }

    fn configuration(&self) -> Option<String> {
        self.store.get(&self.key).and_then(|r| r.configuration)
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        let records = self.store.records.read();
        let record = records.get(&self.key)?;
        match name {
            "id" => Some(Value::String(record.id.clone())),
            _ => record.attributes.get(name).cloned(),
        }
    }

    fn invoke(
        &self,
        method: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ActionError> {
        // Clone the method out so no map guard is held while it runs.
        let registered = self
            .store
            .methods
            .get(&self.key.record_type)
            .and_then(|table| table.get(method));
        if let Some(registered) = registered {
            return registered(self, args, kwargs);
        }

        self.builtin(method, args, kwargs)
            .unwrap_or_else(|| {
                Err(ActionError::UnknownMethod {
                    record_type: self.key.record_type.clone(),
                    method: method.to_string(),
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn attrs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: parking_lot::Mutex<Vec<RecordKey>>,
    }

    impl InvalidationHook for Recorder {
        fn definition_changed(&self, _record_type: &str) {}

        fn record_changed(&self, key: &RecordKey) {
            self.seen.lock().push(key.clone());
        }
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let key = {
            let store = RecordStore::open(dir.path()).unwrap();
            let record = store
                .create("purchase.order", Some("po1"), attrs(json!({"amount_total": 10})))
                .unwrap();
            store.write_configuration(&record.key(), r#"["draft"]"#).unwrap();
            record.key()
        };

        let store = RecordStore::open(dir.path()).unwrap();
        let record = store.get(&key).unwrap();
        assert_eq!(record.configuration.as_deref(), Some(r#"["draft"]"#));
        assert_eq!(record.attributes.get("amount_total"), Some(&json!(10)));
    }

    #[test]
    fn test_create_generates_id_and_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();

        let record = store.create("purchase.order", None, Map::new()).unwrap();
        assert!(!record.id.is_empty());

        store.create("purchase.order", Some("po1"), Map::new()).unwrap();
        let err = store.create("purchase.order", Some("po1"), Map::new()).unwrap_err();
        assert!(matches!(err, StorageError::RecordExists(_)));
        assert_eq!(store.list("purchase.order").len(), 2);
    }

    #[test]
    fn test_hooks_on_configuration_writes_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        let hook = Arc::new(Recorder::default());
        store.add_hook(hook.clone());

        let key = store
            .create("purchase.order", Some("po1"), Map::new())
            .unwrap()
            .key();
        store.update_attributes(&key, attrs(json!({"a": 1}))).unwrap();
        assert!(hook.seen.lock().is_empty());

        store.write_configuration(&key, r#"["draft"]"#).unwrap();
        assert_eq!(*hook.seen.lock(), vec![key.clone(), key.clone()]);
        assert!(matches!(
            store.write_configuration(&RecordKey::new("purchase.order", "nope"), "[]"),
            Err(StorageError::RecordNotFound(_))
        ));

        hook.seen.lock().clear();
        store.clear_configuration(&key).unwrap();
        assert!(store.get(&key).unwrap().configuration.is_none());
        assert!(!hook.seen.lock().is_empty());

        hook.seen.lock().clear();
        store.delete(&key).unwrap();
        assert!(hook.seen.lock().iter().all(|k| *k == key));
        assert!(!store.contains(&key));
        assert!(matches!(store.delete(&key), Err(StorageError::RecordNotFound(_))));
    }

    #[test]
    fn test_stored_record_builtins() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RecordStore::open(dir.path()).unwrap());
        let key = store
            .create("purchase.order", Some("po1"), attrs(json!({"state": "draft"})))
            .unwrap()
            .key();
        let record = store.handle(&key).unwrap();

        let written = record
            .invoke("write", &[], &attrs(json!({"state": "purchase"})))
            .unwrap();
        assert_eq!(written, json!(true));
        assert_eq!(record.attribute("state"), Some(json!("purchase")));
        assert_eq!(
            record.invoke("read", &[json!("state")], &Map::new()).unwrap(),
            json!("purchase")
        );
        assert_eq!(record.attribute("id"), Some(json!("po1")));

        let err = record
            .invoke("raise_user_error", &[json!("nope")], &Map::new())
            .unwrap_err();
        assert_eq!(
            err,
            ActionError::Failed {
                method: "raise_user_error".to_string(),
                message: "nope".to_string()
            }
        );

        assert!(matches!(
            record.invoke("missing", &[], &Map::new()),
            Err(ActionError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn test_registered_methods_take_precedence() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RecordStore::open(dir.path()).unwrap());
        let mut table = MethodTable::new();
        table
            .register("approve", |_record, _args, _kwargs| Ok(json!(true)))
            .register("read", |_record, _args, _kwargs| Ok(json!("overridden")));
        store.register_methods("purchase.order", table);

        let key = store
            .create("purchase.order", Some("po1"), Map::new())
            .unwrap()
            .key();
        let record = store.handle(&key).unwrap();

        assert_eq!(record.invoke("approve", &[], &Map::new()).unwrap(), json!(true));
        assert_eq!(
            record.invoke("read", &[json!("x")], &Map::new()).unwrap(),
            json!("overridden")
        );
    }

    #[test]
    fn test_handle_requires_record() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RecordStore::open(dir.path()).unwrap());
        let missing = RecordKey::new("purchase.order", "nope");
        assert!(matches!(
            store.handle(&missing),
            Err(StorageError::RecordNotFound(_))
        ));
    }
}
