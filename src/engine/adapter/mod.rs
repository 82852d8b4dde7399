//! Storage Adapter Layer
//!
//! Trait contract for the cursor-based, versioned key-value engines AirKV
//! runs on. Every request is asynchronous; an engine reports failures with
//! an [`AdapterError`] carrying a name and a message.
//! An in-process engine lives in [`memory`].

pub mod key;
pub mod memory;

pub use key::{Key, KeyPath};
pub use memory::MemoryAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::engine::store::range::KeyRange;

/// Universal result type for adapter operations
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Classes of native engine failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Uniqueness violated (duplicate primary or unique index key)
    Constraint,
    /// A value could not be used as a key
    Data,
    /// Unknown collection or index
    NotFound,
    /// Write attempted in a read-only transaction
    ReadOnly,
    /// Requested version is lower than the stored one
    Version,
    /// Request made against a finished transaction or closed connection
    InvalidState,
    /// The transaction was aborted
    Aborted,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Constraint => "ConstraintError",
            ErrorKind::Data => "DataError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::ReadOnly => "ReadOnlyError",
            ErrorKind::Version => "VersionError",
            ErrorKind::InvalidState => "InvalidStateError",
            ErrorKind::Aborted => "AbortError",
        }
    }
}

/// Native engine error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.message)
    }
}

impl std::error::Error for AdapterError {}

/// Access mode of a data transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
    #[default]
    ReadOnly,
    ReadWrite,
}

/// Cursor iteration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Next,
    NextUnique,
    Prev,
    PrevUnique,
}

impl Direction {
    pub fn is_reverse(&self) -> bool {
        matches!(self, Direction::Prev | Direction::PrevUnique)
    }

    pub fn is_unique(&self) -> bool {
        matches!(self, Direction::NextUnique | Direction::PrevUnique)
    }
}

/// How a collection keys its records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPathConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<KeyPath>,
    #[serde(default)]
    pub auto_increment: bool,
}

impl KeyPathConfig {
    pub fn key_path(path: impl Into<KeyPath>) -> Self {
        Self { key_path: Some(path.into()), auto_increment: false }
    }

    pub fn auto_increment(path: impl Into<KeyPath>) -> Self {
        Self { key_path: Some(path.into()), auto_increment: true }
    }
}

/// Secondary index declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Field(s) the index reads
    pub index: KeyPath,
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(index: impl Into<KeyPath>, unique: bool) -> Self {
        Self { index: index.into(), unique }
    }
}

/// What a cursor or lookup walks: a collection, or one of its indexes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub collection: String,
    pub index: Option<String>,
}

impl Source {
    pub fn collection(name: &str) -> Self {
        Self { collection: name.to_string(), index: None }
    }

    pub fn index(collection: &str, index: &str) -> Self {
        Self { collection: collection.to_string(), index: Some(index.to_string()) }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.index {
            Some(index) => write!(f, "{}.{}", self.collection, index),
            None => f.write_str(&self.collection),
        }
    }
}

/// Record under a cursor
#[derive(Debug, Clone, PartialEq)]
pub struct CursorRecord {
    /// Index key for index cursors, primary key otherwise
    pub key: Key,
    pub primary_key: Key,
    pub value: Value,
}

/// A positioned cursor. The engine keeps no cursor state of its own;
/// advancing resumes strictly after the current position.
#[derive(Debug, Clone)]
pub struct Cursor {
    pub source: Source,
    pub range: KeyRange,
    pub direction: Direction,
    pub current: Option<CursorRecord>,
}

impl Cursor {
    pub fn is_done(&self) -> bool {
        self.current.is_none()
    }
}

/// Result of opening a database
pub enum OpenOutcome {
    /// Stored version matches; ready for transactions
    Ready(Arc<dyn Connection>),
    /// Stored version is older; structure must be migrated first
    UpgradeNeeded(Box<dyn VersionChange>),
}

/// Storage engine entry point
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Open (creating when absent) a database at `version`
    async fn open(&self, name: &str, version: u32) -> AdapterResult<OpenOutcome>;

    /// Delete a database and everything in it
    async fn delete_database(&self, name: &str) -> AdapterResult<()>;
}

/// Exclusive structural transaction run while upgrading a database
#[async_trait]
pub trait VersionChange: Send {
    fn old_version(&self) -> u32;

    fn new_version(&self) -> u32;

    fn collection_names(&self) -> Vec<String>;

    fn create_collection(&mut self, name: &str, config: &KeyPathConfig) -> AdapterResult<()>;

    /// Declare an index, replacing any index of the same name
    fn create_index(&mut self, collection: &str, name: &str, spec: &IndexSpec) -> AdapterResult<()>;

    fn delete_index(&mut self, collection: &str, name: &str) -> AdapterResult<()>;

    fn clear(&mut self, collection: &str) -> AdapterResult<()>;

    fn delete(&mut self, collection: &str, key: &Key) -> AdapterResult<()>;

    /// Persist the new structure and version
    async fn commit(self: Box<Self>) -> AdapterResult<Arc<dyn Connection>>;

    /// Drop every change; the stored version is left untouched
    async fn abort(self: Box<Self>);
}

/// An open database
#[async_trait]
pub trait Connection: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> u32;

    async fn collection_names(&self) -> Vec<String>;

    async fn transaction(
        &self,
        collections: &[&str],
        mode: TransactionMode,
    ) -> AdapterResult<Box<dyn Transaction>>;

    fn close(&self);
}

/// Data transaction over a fixed set of collections
#[async_trait]
pub trait Transaction: Send {
    fn mode(&self) -> TransactionMode;

    fn key_path(&self, collection: &str) -> AdapterResult<Option<KeyPath>>;

    fn index_names(&self, collection: &str) -> AdapterResult<Vec<String>>;

    /// First record whose key (index key for index sources) matches
    async fn get(&mut self, source: &Source, key: &Key) -> AdapterResult<Option<Value>>;

    /// Insert; fails with `Constraint` when the primary key exists
    async fn add(&mut self, collection: &str, value: Value, key: Option<Key>) -> AdapterResult<Key>;

    /// Insert or replace
    async fn put(&mut self, collection: &str, value: Value, key: Option<Key>) -> AdapterResult<Key>;

    /// Delete every record in range; index sources delete the records the
    /// index entries point at
    async fn delete(&mut self, source: &Source, range: &KeyRange) -> AdapterResult<()>;

    async fn clear(&mut self, collection: &str) -> AdapterResult<()>;

    async fn count(&mut self, source: &Source, range: &KeyRange) -> AdapterResult<usize>;

    async fn open_cursor(
        &mut self,
        source: &Source,
        range: &KeyRange,
        direction: Direction,
    ) -> AdapterResult<Cursor>;

    /// Move past the current position; `cursor.current` is `None` at the end
    async fn advance(&mut self, cursor: &mut Cursor) -> AdapterResult<()>;

    /// Replace the record under the cursor
    async fn update_at(&mut self, cursor: &Cursor, value: Value) -> AdapterResult<Key>;

    /// Delete the record under the cursor
    async fn delete_at(&mut self, cursor: &Cursor) -> AdapterResult<()>;

    async fn commit(self: Box<Self>) -> AdapterResult<()>;

    async fn abort(self: Box<Self>);
}
