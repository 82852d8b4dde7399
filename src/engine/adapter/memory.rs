//! In-process storage engine
//!
//! Records live in ordered maps, secondary indexes in ordered sets of
//! `(index key, primary key)`. A read-write transaction holds the database
//! write lock for its whole life and works on copies of the collections it
//! touches; commit swaps the copies in, abort (or drop) throws them away.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    AdapterError, AdapterResult, Connection, Cursor, CursorRecord, Direction, ErrorKind,
    IndexSpec, Key, KeyPathConfig, OpenOutcome, Source, StorageAdapter, Transaction,
    TransactionMode, VersionChange,
};
use crate::engine::store::range::KeyRange;

/// Smallest possible key, used as the primary-key half of index seeks
const MIN_KEY: Key = Key::Number(f64::NEG_INFINITY);

#[derive(Debug, Clone)]
struct IndexData {
    spec: IndexSpec,
    entries: BTreeSet<(Key, Key)>,
}

#[derive(Debug, Clone)]
struct CollectionData {
    config: KeyPathConfig,
    /// Next value of the key generator
    next_key: f64,
    records: BTreeMap<Key, Value>,
    indexes: BTreeMap<String, IndexData>,
}

impl CollectionData {
    fn new(config: KeyPathConfig) -> Self {
        Self {
            config,
            next_key: 1.0,
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }

    fn generate_key(&mut self) -> Key {
        let key = Key::Number(self.next_key);
        self.next_key += 1.0;
        key
    }

    fn observe_key(&mut self, key: &Key) {
        if let Key::Number(n) = key {
            if self.config.auto_increment && *n >= self.next_key {
                self.next_key = n.floor() + 1.0;
            }
        }
    }

    /// Work out the primary key of a record about to be stored
    fn assign_key(&mut self, value: &mut Value, explicit: Option<Key>) -> AdapterResult<Key> {
        match (self.config.key_path.clone(), explicit) {
            (Some(_), Some(_)) => Err(AdapterError::new(
                ErrorKind::Data,
                "explicit key given for a collection with an in-line key path",
            )),
            (Some(path), None) => match path.extract(value) {
                Some(key) => {
                    self.observe_key(&key);
                    Ok(key)
                }
                None if self.config.auto_increment => {
                    let key = self.generate_key();
                    if path.inject(value, &key) {
                        Ok(key)
                    } else {
                        Err(AdapterError::new(
                            ErrorKind::Data,
                            format!("cannot write generated key at '{}'", path),
                        ))
                    }
                }
                None => Err(AdapterError::new(
                    ErrorKind::Data,
                    format!("record has no valid key at '{}'", path),
                )),
            },
            (None, Some(key)) => {
                self.observe_key(&key);
                Ok(key)
            }
            (None, None) if self.config.auto_increment => Ok(self.generate_key()),
            (None, None) => Err(AdapterError::new(
                ErrorKind::Data,
                "collection uses out-of-line keys and no key was given",
            )),
        }
    }

    fn write(&mut self, key: Key, value: Value, overwrite: bool) -> AdapterResult<()> {
        if !overwrite && self.records.contains_key(&key) {
            return Err(AdapterError::new(
                ErrorKind::Constraint,
                format!("key {} already exists", key),
            ));
        }

        for (name, index) in &self.indexes {
            if !index.spec.unique {
                continue;
            }
            if let Some(index_key) = index.spec.index.extract(&value) {
                if let Some((_, owner)) = first_entry(&index.entries, &index_key) {
                    if *owner != key {
                        return Err(AdapterError::new(
                            ErrorKind::Constraint,
                            format!("unique index '{}' already holds {}", name, index_key),
                        ));
                    }
                }
            }
        }

        self.remove(&key);
        for index in self.indexes.values_mut() {
            if let Some(index_key) = index.spec.index.extract(&value) {
                index.entries.insert((index_key, key.clone()));
            }
        }
        self.records.insert(key, value);
        Ok(())
    }

    fn remove(&mut self, key: &Key) -> bool {
        let Some(old) = self.records.remove(key) else {
            return false;
        };
        for index in self.indexes.values_mut() {
            if let Some(index_key) = index.spec.index.extract(&old) {
                index.entries.remove(&(index_key, key.clone()));
            }
        }
        true
    }

    fn clear(&mut self) {
        self.records.clear();
        for index in self.indexes.values_mut() {
            index.entries.clear();
        }
    }

    fn build_index(&mut self, name: &str, spec: &IndexSpec) -> AdapterResult<()> {
        let mut entries = BTreeSet::new();
        for (key, value) in &self.records {
            if let Some(index_key) = spec.index.extract(value) {
                if spec.unique && first_entry(&entries, &index_key).is_some() {
                    return Err(AdapterError::new(
                        ErrorKind::Constraint,
                        format!("existing records violate unique index '{}'", name),
                    ));
                }
                entries.insert((index_key, key.clone()));
            }
        }
        self.indexes.insert(name.to_string(), IndexData { spec: spec.clone(), entries });
        Ok(())
    }

    fn index(&self, source: &Source, name: &str) -> AdapterResult<&IndexData> {
        self.indexes.get(name).ok_or_else(|| {
            AdapterError::new(ErrorKind::NotFound, format!("no index '{}'", source))
        })
    }

    /// Next `(key, primary key)` position strictly after `after`
    fn seek(
        &self,
        source: &Source,
        range: &KeyRange,
        direction: Direction,
        after: Option<&CursorRecord>,
    ) -> AdapterResult<Option<(Key, Key)>> {
        let reverse = direction.is_reverse();

        let Some(index_name) = &source.index else {
            let keys: Box<dyn Iterator<Item = &Key> + '_> = match (after, reverse) {
                (Some(pos), false) => {
                    Box::new(self.records.range((Excluded(&pos.primary_key), Unbounded)).map(|(k, _)| k))
                }
                (Some(pos), true) => {
                    Box::new(self.records.range((Unbounded, Excluded(&pos.primary_key))).rev().map(|(k, _)| k))
                }
                (None, false) => match start_key(range) {
                    Some(start) => Box::new(self.records.range((Included(start), Unbounded)).map(|(k, _)| k)),
                    None => Box::new(self.records.keys()),
                },
                (None, true) => Box::new(self.records.keys().rev()),
            };
            return Ok(first_in_range(keys.map(|k| (k, k)), range, reverse, None));
        };

        let entries = &self.index(source, index_name)?.entries;
        let skip = if direction.is_unique() { after.map(|pos| &pos.key) } else { None };
        let iter: Box<dyn Iterator<Item = &(Key, Key)> + '_> = match (after, reverse) {
            (Some(pos), false) => {
                let from = (pos.key.clone(), pos.primary_key.clone());
                Box::new(entries.range((Excluded(from), Unbounded)))
            }
            (Some(pos), true) => {
                let to = (pos.key.clone(), pos.primary_key.clone());
                Box::new(entries.range((Unbounded, Excluded(to))).rev())
            }
            (None, false) => match start_key(range) {
                Some(start) => Box::new(entries.range((Included((start.clone(), MIN_KEY)), Unbounded))),
                None => Box::new(entries.iter()),
            },
            (None, true) => Box::new(entries.iter().rev()),
        };

        let found = first_in_range(iter.map(|(k, pk)| (k, pk)), range, reverse, skip);

        // Unique reverse scans report the lowest primary key of each index key
        if reverse && direction.is_unique() {
            if let Some((key, _)) = &found {
                return Ok(first_entry(entries, key).cloned());
            }
        }
        Ok(found)
    }

    fn record_at(&self, position: (Key, Key)) -> AdapterResult<CursorRecord> {
        let (key, primary_key) = position;
        let value = self.records.get(&primary_key).cloned().ok_or_else(|| {
            AdapterError::new(ErrorKind::InvalidState, format!("dangling index entry {}", primary_key))
        })?;
        Ok(CursorRecord { key, primary_key, value })
    }

    /// Primary keys of every record in range
    fn primary_keys(&self, source: &Source, range: &KeyRange) -> AdapterResult<Vec<Key>> {
        match &source.index {
            None => Ok(self.records.keys().filter(|k| range.contains(k)).cloned().collect()),
            Some(name) => Ok(self
                .index(source, name)?
                .entries
                .iter()
                .filter(|(k, _)| range.contains(k))
                .map(|(_, pk)| pk.clone())
                .collect()),
        }
    }
}

fn start_key(range: &KeyRange) -> Option<&Key> {
    match range {
        KeyRange::Only(key) => Some(key),
        _ => range.lower().map(|bound| &bound.key),
    }
}

fn first_entry<'a>(entries: &'a BTreeSet<(Key, Key)>, key: &Key) -> Option<&'a (Key, Key)> {
    entries
        .range((Included((key.clone(), MIN_KEY)), Unbounded))
        .next()
        .filter(|(k, _)| k == key)
}

/// Walk positions in scan order, returning the first one inside the range.
/// Stops as soon as the walk has passed the far end of the range.
fn first_in_range<'a>(
    positions: impl Iterator<Item = (&'a Key, &'a Key)>,
    range: &KeyRange,
    reverse: bool,
    skip: Option<&Key>,
) -> Option<(Key, Key)> {
    for (key, primary_key) in positions {
        if skip == Some(key) {
            continue;
        }
        if range.contains(key) {
            return Some((key.clone(), primary_key.clone()));
        }
        let passed = if reverse {
            range.lower().is_some_and(|b| key < &b.key) || matches!(range, KeyRange::Only(k) if key < k)
        } else {
            range.upper().is_some_and(|b| key > &b.key) || matches!(range, KeyRange::Only(k) if key > k)
        };
        if passed {
            return None;
        }
    }
    None
}

#[derive(Debug, Clone, Default)]
struct DatabaseData {
    version: u32,
    collections: BTreeMap<String, CollectionData>,
}

type SharedDatabase = Arc<RwLock<DatabaseData>>;

/// Engine keeping every database in process memory
#[derive(Default)]
pub struct MemoryAdapter {
    databases: Mutex<HashMap<String, SharedDatabase>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn open(&self, name: &str, version: u32) -> AdapterResult<OpenOutcome> {
        if version == 0 {
            return Err(AdapterError::new(ErrorKind::Data, "version must be at least 1"));
        }

        let db = {
            let mut databases = self.databases.lock().await;
            Arc::clone(databases.entry(name.to_string()).or_default())
        };

        let guard = Arc::clone(&db).write_owned().await;
        let stored = guard.version;
        debug!(database = %name, stored, requested = version, "Opening database");

        if stored > version {
            return Err(AdapterError::new(
                ErrorKind::Version,
                format!("requested version {} is lower than stored version {}", version, stored),
            ));
        }

        if stored == version {
            drop(guard);
            return Ok(OpenOutcome::Ready(Arc::new(MemoryConnection::new(name, version, db))));
        }

        let working = (*guard).clone();
        Ok(OpenOutcome::UpgradeNeeded(Box::new(MemoryVersionChange {
            name: name.to_string(),
            db,
            guard,
            working,
            new_version: version,
        })))
    }

    async fn delete_database(&self, name: &str) -> AdapterResult<()> {
        let removed = self.databases.lock().await.remove(name);
        if let Some(db) = removed {
            // Wait out running transactions before reporting success
            let _guard = db.write().await;
        }
        debug!(database = %name, "Deleted database");
        Ok(())
    }
}

struct MemoryVersionChange {
    name: String,
    db: SharedDatabase,
    guard: OwnedRwLockWriteGuard<DatabaseData>,
    working: DatabaseData,
    new_version: u32,
}

impl MemoryVersionChange {
    fn collection_mut(&mut self, name: &str) -> AdapterResult<&mut CollectionData> {
        self.working
            .collections
            .get_mut(name)
            .ok_or_else(|| AdapterError::new(ErrorKind::NotFound, format!("no collection '{}'", name)))
    }
}

#[async_trait]
impl VersionChange for MemoryVersionChange {
    fn old_version(&self) -> u32 {
        self.guard.version
    }

    fn new_version(&self) -> u32 {
        self.new_version
    }

    fn collection_names(&self) -> Vec<String> {
        self.working.collections.keys().cloned().collect()
    }

    fn create_collection(&mut self, name: &str, config: &KeyPathConfig) -> AdapterResult<()> {
        if self.working.collections.contains_key(name) {
            return Err(AdapterError::new(
                ErrorKind::Constraint,
                format!("collection '{}' already exists", name),
            ));
        }
        if config.auto_increment && config.key_path.as_ref().is_some_and(|p| p.is_compound()) {
            return Err(AdapterError::new(
                ErrorKind::Data,
                "auto-increment collections cannot use a compound key path",
            ));
        }
        self.working.collections.insert(name.to_string(), CollectionData::new(config.clone()));
        trace!(collection = %name, "Created collection");
        Ok(())
    }

    fn create_index(&mut self, collection: &str, name: &str, spec: &IndexSpec) -> AdapterResult<()> {
        self.collection_mut(collection)?.build_index(name, spec)?;
        trace!(collection = %collection, index = %name, "Declared index");
        Ok(())
    }

    fn delete_index(&mut self, collection: &str, name: &str) -> AdapterResult<()> {
        match self.collection_mut(collection)?.indexes.remove(name) {
            Some(_) => Ok(()),
            None => Err(AdapterError::new(
                ErrorKind::NotFound,
                format!("no index '{}.{}'", collection, name),
            )),
        }
    }

    fn clear(&mut self, collection: &str) -> AdapterResult<()> {
        self.collection_mut(collection)?.clear();
        Ok(())
    }

    fn delete(&mut self, collection: &str, key: &Key) -> AdapterResult<()> {
        self.collection_mut(collection)?.remove(key);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> AdapterResult<Arc<dyn Connection>> {
        let MemoryVersionChange { name, db, mut guard, mut working, new_version } = *self;
        working.version = new_version;
        *guard = working;
        drop(guard);
        debug!(database = %name, version = new_version, "Upgrade committed");
        Ok(Arc::new(MemoryConnection::new(&name, new_version, db)))
    }

    async fn abort(self: Box<Self>) {
        debug!(database = %self.name, version = self.guard.version, "Upgrade aborted");
    }
}

struct MemoryConnection {
    name: String,
    version: u32,
    db: SharedDatabase,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn new(name: &str, version: u32, db: SharedDatabase) -> Self {
        Self {
            name: name.to_string(),
            version,
            db,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    async fn collection_names(&self) -> Vec<String> {
        self.db.read().await.collections.keys().cloned().collect()
    }

    async fn transaction(
        &self,
        collections: &[&str],
        mode: TransactionMode,
    ) -> AdapterResult<Box<dyn Transaction>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AdapterError::new(ErrorKind::InvalidState, "connection is closed"));
        }

        let scope: Vec<String> = collections.iter().map(|c| c.to_string()).collect();
        let access = match mode {
            TransactionMode::ReadOnly => Access::Read(Arc::clone(&self.db).read_owned().await),
            TransactionMode::ReadWrite => {
                let guard = Arc::clone(&self.db).write_owned().await;
                let working = scope
                    .iter()
                    .filter_map(|name| guard.collections.get(name).map(|c| (name.clone(), c.clone())))
                    .collect();
                Access::Write { guard, working }
            }
        };

        let txn = MemoryTransaction { id: Uuid::new_v4(), mode, scope, access };
        for name in &txn.scope {
            txn.collection(name)?;
        }
        debug!(txn = %txn.id, ?mode, collections = ?txn.scope, "Transaction started");
        Ok(Box::new(txn))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

enum Access {
    Read(OwnedRwLockReadGuard<DatabaseData>),
    Write {
        guard: OwnedRwLockWriteGuard<DatabaseData>,
        working: BTreeMap<String, CollectionData>,
    },
}

struct MemoryTransaction {
    id: Uuid,
    mode: TransactionMode,
    scope: Vec<String>,
    access: Access,
}

impl MemoryTransaction {
    fn check_scope(&self, name: &str) -> AdapterResult<()> {
        if self.scope.iter().any(|s| s == name) {
            Ok(())
        } else {
            Err(AdapterError::new(
                ErrorKind::NotFound,
                format!("collection '{}' is not in this transaction's scope", name),
            ))
        }
    }

    fn collection(&self, name: &str) -> AdapterResult<&CollectionData> {
        self.check_scope(name)?;
        let found = match &self.access {
            Access::Read(guard) => guard.collections.get(name),
            Access::Write { working, .. } => working.get(name),
        };
        found.ok_or_else(|| AdapterError::new(ErrorKind::NotFound, format!("no collection '{}'", name)))
    }

    fn collection_mut(&mut self, name: &str) -> AdapterResult<&mut CollectionData> {
        self.check_scope(name)?;
        match &mut self.access {
            Access::Read(_) => Err(AdapterError::new(
                ErrorKind::ReadOnly,
                format!("write to '{}' in a read-only transaction", name),
            )),
            Access::Write { working, .. } => working.get_mut(name).ok_or_else(|| {
                AdapterError::new(ErrorKind::NotFound, format!("no collection '{}'", name))
            }),
        }
    }

    fn current<'a>(&self, cursor: &'a Cursor) -> AdapterResult<&'a CursorRecord> {
        cursor.current.as_ref().ok_or_else(|| {
            AdapterError::new(ErrorKind::InvalidState, "cursor is past its last record")
        })
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn key_path(&self, collection: &str) -> AdapterResult<Option<super::KeyPath>> {
        Ok(self.collection(collection)?.config.key_path.clone())
    }

    fn index_names(&self, collection: &str) -> AdapterResult<Vec<String>> {
        Ok(self.collection(collection)?.indexes.keys().cloned().collect())
    }

    async fn get(&mut self, source: &Source, key: &Key) -> AdapterResult<Option<Value>> {
        trace!(txn = %self.id, %source, %key, "get");
        let data = self.collection(&source.collection)?;
        let primary_key = match &source.index {
            None => Some(key.clone()),
            Some(name) => first_entry(&data.index(source, name)?.entries, key).map(|(_, pk)| pk.clone()),
        };
        Ok(primary_key.and_then(|pk| data.records.get(&pk).cloned()))
    }

    async fn add(&mut self, collection: &str, mut value: Value, key: Option<Key>) -> AdapterResult<Key> {
        let data = self.collection_mut(collection)?;
        let key = data.assign_key(&mut value, key)?;
        data.write(key.clone(), value, false)?;
        trace!(txn = %self.id, collection = %collection, %key, "add");
        Ok(key)
    }

    async fn put(&mut self, collection: &str, mut value: Value, key: Option<Key>) -> AdapterResult<Key> {
        let data = self.collection_mut(collection)?;
        let key = data.assign_key(&mut value, key)?;
        data.write(key.clone(), value, true)?;
        trace!(txn = %self.id, collection = %collection, %key, "put");
        Ok(key)
    }

    async fn delete(&mut self, source: &Source, range: &KeyRange) -> AdapterResult<()> {
        let keys = self.collection(&source.collection)?.primary_keys(source, range)?;
        let data = self.collection_mut(&source.collection)?;
        for key in &keys {
            data.remove(key);
        }
        trace!(txn = %self.id, %source, removed = keys.len(), "delete");
        Ok(())
    }

    async fn clear(&mut self, collection: &str) -> AdapterResult<()> {
        self.collection_mut(collection)?.clear();
        trace!(txn = %self.id, collection = %collection, "clear");
        Ok(())
    }

    async fn count(&mut self, source: &Source, range: &KeyRange) -> AdapterResult<usize> {
        Ok(self.collection(&source.collection)?.primary_keys(source, range)?.len())
    }

    async fn open_cursor(
        &mut self,
        source: &Source,
        range: &KeyRange,
        direction: Direction,
    ) -> AdapterResult<Cursor> {
        let data = self.collection(&source.collection)?;
        let current = match data.seek(source, range, direction, None)? {
            Some(position) => Some(data.record_at(position)?),
            None => None,
        };
        trace!(txn = %self.id, %source, ?direction, "open cursor");
        Ok(Cursor {
            source: source.clone(),
            range: range.clone(),
            direction,
            current,
        })
    }

    async fn advance(&mut self, cursor: &mut Cursor) -> AdapterResult<()> {
        let data = self.collection(&cursor.source.collection)?;
        let after = self.current(cursor)?;
        cursor.current = match data.seek(&cursor.source, &cursor.range, cursor.direction, Some(after))? {
            Some(position) => Some(data.record_at(position)?),
            None => None,
        };
        Ok(())
    }

    async fn update_at(&mut self, cursor: &Cursor, value: Value) -> AdapterResult<Key> {
        let primary_key = self.current(cursor)?.primary_key.clone();
        let data = self.collection_mut(&cursor.source.collection)?;
        if let Some(path) = &data.config.key_path {
            if path.extract(&value).as_ref() != Some(&primary_key) {
                return Err(AdapterError::new(
                    ErrorKind::Data,
                    format!("update would change the primary key {}", primary_key),
                ));
            }
        }
        data.write(primary_key.clone(), value, true)?;
        trace!(txn = %self.id, source = %cursor.source, key = %primary_key, "cursor update");
        Ok(primary_key)
    }

    async fn delete_at(&mut self, cursor: &Cursor) -> AdapterResult<()> {
        let primary_key = self.current(cursor)?.primary_key.clone();
        self.collection_mut(&cursor.source.collection)?.remove(&primary_key);
        trace!(txn = %self.id, source = %cursor.source, key = %primary_key, "cursor delete");
        Ok(())
    }

    async fn commit(self: Box<Self>) -> AdapterResult<()> {
        let MemoryTransaction { id, access, .. } = *self;
        if let Access::Write { mut guard, working } = access {
            for (name, data) in working {
                guard.collections.insert(name, data);
            }
        }
        debug!(txn = %id, "Transaction committed");
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        debug!(txn = %self.id, "Transaction aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn users_db(adapter: &MemoryAdapter) -> Arc<dyn Connection> {
        let OpenOutcome::UpgradeNeeded(mut upgrade) = adapter.open("test", 1).await.unwrap() else {
            panic!("fresh database must request an upgrade");
        };
        upgrade.create_collection("users", &KeyPathConfig::auto_increment("id")).unwrap();
        upgrade
            .create_index("users", "username", &IndexSpec::new("username", true))
            .unwrap();
        upgrade.create_index("users", "age", &IndexSpec::new("age", false)).unwrap();
        upgrade.commit().await.unwrap()
    }

    #[tokio::test]
    async fn test_auto_increment_and_unique_index() {
        let adapter = MemoryAdapter::new();
        let conn = users_db(&adapter).await;

        let mut txn = conn.transaction(&["users"], TransactionMode::ReadWrite).await.unwrap();
        let a = txn.add("users", json!({"username": "admin"}), None).await.unwrap();
        let b = txn.add("users", json!({"username": "hlu"}), None).await.unwrap();
        assert_eq!(a, Key::from(1i64));
        assert_eq!(b, Key::from(2i64));

        let err = txn.add("users", json!({"username": "admin"}), None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Constraint);

        let found = txn.get(&Source::index("users", "username"), &Key::from("hlu")).await.unwrap();
        assert_eq!(found, Some(json!({"id": 2, "username": "hlu"})));
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_discards_writes() {
        let adapter = MemoryAdapter::new();
        let conn = users_db(&adapter).await;

        let mut txn = conn.transaction(&["users"], TransactionMode::ReadWrite).await.unwrap();
        txn.add("users", json!({"username": "ghost"}), None).await.unwrap();
        txn.abort().await;

        let mut txn = conn.transaction(&["users"], TransactionMode::ReadOnly).await.unwrap();
        let count = txn.count(&Source::collection("users"), &KeyRange::Unbounded).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let adapter = MemoryAdapter::new();
        let conn = users_db(&adapter).await;

        let mut txn = conn.transaction(&["users"], TransactionMode::ReadOnly).await.unwrap();
        let err = txn.put("users", json!({"username": "x"}), None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ReadOnly);
    }

    #[tokio::test]
    async fn test_index_cursor_directions() {
        let adapter = MemoryAdapter::new();
        let conn = users_db(&adapter).await;

        let mut txn = conn.transaction(&["users"], TransactionMode::ReadWrite).await.unwrap();
        for (name, age) in [("a", 30), ("b", 20), ("c", 30), ("d", 40)] {
            txn.add("users", json!({"username": name, "age": age}), None).await.unwrap();
        }

        let source = Source::index("users", "age");

        let mut seen = Vec::new();
        let mut cursor = txn.open_cursor(&source, &KeyRange::Unbounded, Direction::NextUnique).await.unwrap();
        while let Some(record) = cursor.current.clone() {
            seen.push(record.value["username"].clone());
            txn.advance(&mut cursor).await.unwrap();
        }
        assert_eq!(seen, vec![json!("b"), json!("a"), json!("d")]);

        let mut seen = Vec::new();
        let mut cursor = txn.open_cursor(&source, &KeyRange::Unbounded, Direction::PrevUnique).await.unwrap();
        while let Some(record) = cursor.current.clone() {
            seen.push(record.value["username"].clone());
            txn.advance(&mut cursor).await.unwrap();
        }
        assert_eq!(seen, vec![json!("d"), json!("a"), json!("b")]);

        let mut seen = Vec::new();
        let mut cursor = txn.open_cursor(&source, &KeyRange::only(30i64), Direction::Prev).await.unwrap();
        while let Some(record) = cursor.current.clone() {
            seen.push(record.value["username"].clone());
            txn.advance(&mut cursor).await.unwrap();
        }
        assert_eq!(seen, vec![json!("c"), json!("a")]);
    }

    #[tokio::test]
    async fn test_version_checks() {
        let adapter = MemoryAdapter::new();
        let conn = users_db(&adapter).await;
        assert_eq!(conn.version(), 1);

        assert!(matches!(adapter.open("test", 1).await.unwrap(), OpenOutcome::Ready(_)));
        let err = adapter.open("test", 0).await.err().unwrap();
        assert_eq!(err.kind, ErrorKind::Data);

        let OpenOutcome::UpgradeNeeded(upgrade) = adapter.open("test", 2).await.unwrap() else {
            panic!("higher version must request an upgrade");
        };
        assert_eq!(upgrade.old_version(), 1);
        upgrade.abort().await;

        let OpenOutcome::UpgradeNeeded(upgrade) = adapter.open("test", 2).await.unwrap() else {
            panic!("aborted upgrade must not bump the version");
        };
        let conn = upgrade.commit().await.unwrap();
        assert_eq!(conn.version(), 2);

        let err = adapter.open("test", 1).await.err().unwrap();
        assert_eq!(err.kind, ErrorKind::Version);
    }
}
