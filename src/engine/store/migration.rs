//! Schema Migration System
//!
//! Versioned schema deltas applied while a store upgrades. Only deltas
//! newer than the stored version run, in ascending version order.

use chrono::{DateTime, Utc};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::{Result, StoreError};
use crate::engine::adapter::{Connection, IndexSpec, Key, KeyPath, KeyPathConfig, VersionChange};

/// A structural change to an existing collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAlter", into = "RawAlter")]
pub enum AlterOp {
    /// Delete every record
    Clear,
    /// Remove an index by name
    DeleteIndex(String),
    /// Declare (or redeclare) an index
    CreateIndex { name: String, spec: IndexSpec },
    /// Delete one record by primary key
    Delete(Key),
}

/// Wire form: `{"action": "deleteIndex", "param": ["by_name"]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawAlter {
    action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    param: Vec<Value>,
}

#[derive(Deserialize)]
struct IndexOptions {
    #[serde(default)]
    unique: bool,
}

impl TryFrom<RawAlter> for AlterOp {
    type Error = String;

    fn try_from(raw: RawAlter) -> std::result::Result<Self, Self::Error> {
        let mut param = raw.param.into_iter();
        match raw.action.as_str() {
            "clear" => Ok(AlterOp::Clear),
            "deleteIndex" | "removeIndex" => match param.next() {
                Some(Value::String(name)) => Ok(AlterOp::DeleteIndex(name)),
                _ => Err(format!("{} needs an index name", raw.action)),
            },
            "createIndex" => {
                let name = match param.next() {
                    Some(Value::String(name)) => name,
                    _ => return Err("createIndex needs an index name".to_string()),
                };
                let index: KeyPath = param
                    .next()
                    .ok_or_else(|| "createIndex needs a key path".to_string())
                    .and_then(|v| serde_json::from_value(v).map_err(|e| e.to_string()))?;
                let options: IndexOptions = match param.next() {
                    Some(v) => serde_json::from_value(v).map_err(|e| e.to_string())?,
                    None => IndexOptions { unique: false },
                };
                Ok(AlterOp::CreateIndex { name, spec: IndexSpec::new(index, options.unique) })
            }
            "delete" => param
                .next()
                .as_ref()
                .and_then(Key::from_value)
                .map(AlterOp::Delete)
                .ok_or_else(|| "delete needs a valid key".to_string()),
            other => Err(format!("unknown alter action '{}'", other)),
        }
    }
}

impl From<AlterOp> for RawAlter {
    fn from(op: AlterOp) -> Self {
        let (action, param) = match op {
            AlterOp::Clear => ("clear", Vec::new()),
            AlterOp::DeleteIndex(name) => ("deleteIndex", vec![Value::String(name)]),
            AlterOp::CreateIndex { name, spec } => (
                "createIndex",
                vec![
                    Value::String(name),
                    serde_json::to_value(&spec.index).unwrap_or(Value::Null),
                    serde_json::json!({ "unique": spec.unique }),
                ],
            ),
            AlterOp::Delete(key) => ("delete", vec![key.to_value()]),
        };
        RawAlter { action: action.to_string(), param }
    }
}

/// Named entries in the order they were declared. Declaring a name again
/// replaces the earlier entry in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Declarations<V>(Vec<(String, V)>);

impl<V> Declarations<V> {
    pub fn insert(&mut self, name: &str, value: V) {
        match self.0.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<V> Default for Declarations<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<'a, V> IntoIterator for &'a Declarations<V> {
    type Item = &'a (String, V);
    type IntoIter = std::slice::Iter<'a, (String, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<V: Serialize> Serialize for Declarations<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for Declarations<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DeclarationsVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for DeclarationsVisitor<V> {
            type Value = Declarations<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of named declarations")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                let mut declarations = Declarations::default();
                while let Some((name, value)) = map.next_entry::<String, V>()? {
                    declarations.insert(&name, value);
                }
                Ok(declarations)
            }
        }

        deserializer.deserialize_map(DeclarationsVisitor(PhantomData))
    }
}

/// Target structure of one collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    #[serde(default)]
    pub key_path: KeyPathConfig,
    #[serde(default, skip_serializing_if = "Declarations::is_empty")]
    pub indexes: Declarations<IndexSpec>,
    /// Applied in order to an existing collection, before its indexes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alter: Vec<AlterOp>,
}

impl CollectionSchema {
    pub fn new(key_path: KeyPathConfig) -> Self {
        Self { key_path, ..Self::default() }
    }

    pub fn index(mut self, name: &str, spec: IndexSpec) -> Self {
        self.indexes.insert(name, spec);
        self
    }

    pub fn alter(mut self, op: AlterOp) -> Self {
        self.alter.push(op);
        self
    }
}

/// Schema changes introduced by one store version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDelta {
    pub version: u32,
    pub schema: Declarations<CollectionSchema>,
}

impl SchemaDelta {
    pub fn new(version: u32) -> Self {
        Self { version, schema: Declarations::default() }
    }

    pub fn collection(mut self, name: &str, schema: CollectionSchema) -> Self {
        self.schema.insert(name, schema);
        self
    }
}

/// Lifecycle of a store's schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationState {
    Closed,
    Upgrading { old_version: u32 },
    Open,
    UpgradeFailed,
}

/// Outcome of a completed upgrade
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    /// Versions of the deltas that ran
    pub applied: Vec<u32>,
    pub completed_at: DateTime<Utc>,
}

/// Migration runner
pub struct MigrationEngine<'a> {
    deltas: &'a [SchemaDelta],
    /// Compound-key indexes are skipped when the engine cannot hold them
    shim_mode: bool,
    state: MigrationState,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(deltas: &'a [SchemaDelta], shim_mode: bool) -> Self {
        Self { deltas, shim_mode, state: MigrationState::Closed }
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// Apply pending deltas inside the version-change transaction and
    /// commit it. Any failure aborts the transaction so the stored version
    /// stays where it was.
    pub async fn run(
        &mut self,
        mut upgrade: Box<dyn VersionChange>,
    ) -> Result<(Arc<dyn Connection>, MigrationReport)> {
        let old_version = upgrade.old_version();
        let new_version = upgrade.new_version();
        self.state = MigrationState::Upgrading { old_version };
        info!(from = old_version, to = new_version, "Upgrading schema");

        if self.deltas.is_empty() {
            upgrade.abort().await;
            self.state = MigrationState::UpgradeFailed;
            warn!(old_version, "No schema defined");
            return Err(StoreError::MissingSchema { old_version });
        }

        let applied = match self.apply(upgrade.as_mut(), old_version) {
            Ok(applied) => applied,
            Err(err) => {
                warn!(from = old_version, to = new_version, error = %err, "Upgrade failed");
                upgrade.abort().await;
                self.state = MigrationState::UpgradeFailed;
                return Err(err);
            }
        };

        let connection = match upgrade.commit().await {
            Ok(connection) => connection,
            Err(err) => {
                self.state = MigrationState::UpgradeFailed;
                return Err(err.into());
            }
        };
        self.state = MigrationState::Open;

        let report = MigrationReport {
            from_version: old_version,
            to_version: new_version,
            applied,
            completed_at: Utc::now(),
        };
        info!(from = old_version, to = new_version, applied = ?report.applied, "Schema upgraded");
        Ok((connection, report))
    }

    fn apply(&self, upgrade: &mut dyn VersionChange, old_version: u32) -> Result<Vec<u32>> {
        let mut pending: Vec<&SchemaDelta> =
            self.deltas.iter().filter(|d| d.version > old_version).collect();
        if pending.is_empty() {
            debug!(old_version, "Schema already current");
            return Ok(Vec::new());
        }
        pending.sort_by_key(|d| d.version);

        let mut applied = Vec::new();
        for delta in pending {
            self.apply_delta(upgrade, delta)?;
            applied.push(delta.version);
        }
        Ok(applied)
    }

    fn apply_delta(&self, upgrade: &mut dyn VersionChange, delta: &SchemaDelta) -> Result<()> {
        let existing = upgrade.collection_names();

        for (name, schema) in &delta.schema {
            if existing.contains(name) {
                for op in &schema.alter {
                    apply_alter(upgrade, name, op)?;
                }
            } else {
                upgrade.create_collection(name, &schema.key_path)?;
                debug!(version = delta.version, collection = %name, "Created collection");
            }

            for (index, spec) in &schema.indexes {
                if self.shim_mode && spec.index.is_compound() {
                    debug!(collection = %name, index = %index, "Skipping compound index in shim mode");
                    continue;
                }
                upgrade.create_index(name, index, spec)?;
            }
        }

        info!(version = delta.version, collections = delta.schema.len(), "Applied schema delta");
        Ok(())
    }
}

fn apply_alter(upgrade: &mut dyn VersionChange, collection: &str, op: &AlterOp) -> Result<()> {
    debug!(collection = %collection, ?op, "Altering collection");
    match op {
        AlterOp::Clear => upgrade.clear(collection)?,
        AlterOp::DeleteIndex(name) => upgrade.delete_index(collection, name)?,
        AlterOp::CreateIndex { name, spec } => upgrade.create_index(collection, name, spec)?,
        AlterOp::Delete(key) => upgrade.delete(collection, key)?,
    }
    Ok(())
}
