//! AirKV - Query and mutation layer for cursor-based, versioned key-value stores
//!
//! Collections of JSON records with secondary indexes, range queries over
//! cursors, ordered bulk writes and schema migrations, on top of any engine
//! implementing [`engine::adapter::StorageAdapter`].

pub mod engine;

pub use engine::adapter::{
    AdapterError, Direction, ErrorKind, IndexSpec, Key, KeyPath, KeyPathConfig, MemoryAdapter,
    StorageAdapter, TransactionMode,
};
pub use engine::config::{ConfigError, StoreConfig};
pub use engine::events::{Emitter, StoreEvent};
pub use engine::store::{
    AbortSignal, AlterOp, BulkItem, BulkItems, BulkMethod, BulkOutcome, Collection,
    CollectionSchema, Condition, Declarations, Filter, MigrationReport, MigrationState, Query, QueryOptions,
    RangeQuery, Result, SchemaDelta, StoreError, StoreSession,
};
