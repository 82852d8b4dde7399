//! AirKV Store Layer
//!
//! Query and mutation layer over a storage adapter:
//! - Declarative range queries translated into cursor scans
//! - Sequential bulk mutations in one transaction
//! - Versioned schema migrations applied at open time

pub mod range;
pub mod query;
pub mod cursor;
pub mod bulk;
pub mod collection;
pub mod migration;
pub mod session;
pub mod error;

pub use range::{build_range, Bound, KeyRange, RangeQuery};
pub use query::{Condition, ConditionOp, Filter, Query};
pub use cursor::{run_query, AbortSignal, CursorVisit, QueryOptions};
pub use bulk::{merge_data, run_bulk, BulkItem, BulkItems, BulkMethod, BulkOutcome};
pub use collection::{mixin, Collection};
pub use migration::{
    AlterOp, CollectionSchema, Declarations, MigrationEngine, MigrationReport, MigrationState, SchemaDelta,
};
pub use session::StoreSession;
pub use error::{Result, StoreError};
