//! Cursor query engine
//!
//! Walks a cursor over the range a [`Query`] describes, applies its filter,
//! hands each surviving record to an optional visitor and collects values
//! for read-only scans. One transaction per call.

use serde_json::Value;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::{Result, StoreError};
use super::query::Query;
use crate::engine::adapter::{
    Connection, CursorRecord, Key, Source, Transaction, TransactionMode,
};

/// Cooperative cancellation for a running query
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the owning transaction at its next cursor step. A query that
    /// already finished is not affected.
    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

enum CursorWrite {
    Update(Value),
    Delete,
}

/// The record under the cursor, as seen by a visitor
pub struct CursorVisit<'a> {
    record: &'a CursorRecord,
    write: Option<CursorWrite>,
}

impl<'a> CursorVisit<'a> {
    pub fn value(&self) -> &'a Value {
        &self.record.value
    }

    /// Index key for index scans, primary key otherwise
    pub fn key(&self) -> &'a Key {
        &self.record.key
    }

    pub fn primary_key(&self) -> &'a Key {
        &self.record.primary_key
    }

    /// Replace the record once the visitor returns
    pub fn update(&mut self, value: Value) {
        self.write = Some(CursorWrite::Update(value));
    }

    /// Delete the record once the visitor returns
    pub fn delete(&mut self) {
        self.write = Some(CursorWrite::Delete);
    }
}

type OnCursor<'a> = Box<dyn FnMut(&mut CursorVisit<'_>) -> ControlFlow<()> + Send + 'a>;

/// How a query runs
#[derive(Default)]
pub struct QueryOptions<'a> {
    pub mode: TransactionMode,
    on_cursor: Option<OnCursor<'a>>,
    abort: Option<AbortSignal>,
}

impl<'a> QueryOptions<'a> {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn read_write() -> Self {
        Self { mode: TransactionMode::ReadWrite, ..Self::default() }
    }

    /// Visit every matching record. `ControlFlow::Break` stops the scan
    /// after the current record.
    pub fn on_cursor(
        mut self,
        visitor: impl FnMut(&mut CursorVisit<'_>) -> ControlFlow<()> + Send + 'a,
    ) -> Self {
        self.on_cursor = Some(Box::new(visitor));
        self
    }

    pub fn abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    fn is_aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(AbortSignal::is_aborted)
    }
}

/// What a scan saw
#[derive(Debug, Default)]
pub(crate) struct Scan {
    /// Values collected by read-only scans
    pub records: Vec<Value>,
    /// Records that passed the filter
    pub matched: usize,
    /// Records updated or deleted through the cursor
    pub written: usize,
    pub aborted: bool,
}

/// Run a query in its own transaction and collect the matching records.
///
/// An aborted query resolves to an empty list; the transaction's writes
/// are rolled back.
pub async fn run_query(
    connection: &dyn Connection,
    collection: &str,
    query: &Query,
    mut options: QueryOptions<'_>,
) -> Result<Vec<Value>> {
    let mut txn = connection.transaction(&[collection], options.mode).await?;

    match scan(txn.as_mut(), collection, query, &mut options).await {
        Ok(result) if result.aborted => {
            txn.abort().await;
            debug!(collection = %collection, "Query aborted");
            Ok(Vec::new())
        }
        Ok(result) => {
            txn.commit().await?;
            Ok(result.records)
        }
        Err(err) => {
            warn!(collection = %collection, error = %err, "Query failed");
            txn.abort().await;
            Err(err)
        }
    }
}

/// Resolve the cursor source of a query, checking the index exists
pub(crate) fn query_source(
    txn: &dyn Transaction,
    collection: &str,
    index: Option<&str>,
) -> Result<Source> {
    match index {
        None => Ok(Source::collection(collection)),
        Some(index) if txn.index_names(collection)?.iter().any(|name| name == index) => {
            Ok(Source::index(collection, index))
        }
        Some(index) => Err(StoreError::IndexNotFound {
            collection: collection.to_string(),
            index: index.to_string(),
        }),
    }
}

/// Walk the cursor inside an existing transaction
pub(crate) async fn scan(
    txn: &mut dyn Transaction,
    collection: &str,
    query: &Query,
    options: &mut QueryOptions<'_>,
) -> Result<Scan> {
    let source = query_source(txn, collection, query.index.as_deref())?;
    let range = query.key_range();
    let collect = txn.mode() == TransactionMode::ReadOnly;
    let mut result = Scan::default();

    if options.is_aborted() {
        result.aborted = true;
        return Ok(result);
    }

    let mut cursor = txn.open_cursor(&source, &range, query.order).await?;

    loop {
        if options.is_aborted() {
            result.aborted = true;
            result.records.clear();
            return Ok(result);
        }

        let Some(record) = cursor.current.as_ref() else {
            break;
        };

        if let Some(filter) = &query.filter {
            if !filter.matches(&record.value) {
                txn.advance(&mut cursor).await?;
                continue;
            }
        }
        result.matched += 1;

        let mut flow = ControlFlow::Continue(());
        let mut write = None;
        if let Some(visitor) = options.on_cursor.as_mut() {
            let mut visit = CursorVisit { record, write: None };
            flow = visitor(&mut visit);
            write = visit.write;
        }

        match write {
            Some(CursorWrite::Update(value)) => {
                txn.update_at(&cursor, value).await?;
                result.written += 1;
            }
            Some(CursorWrite::Delete) => {
                txn.delete_at(&cursor).await?;
                result.written += 1;
            }
            None if collect => result.records.push(record.value.clone()),
            None => {}
        }

        if flow.is_break() {
            break;
        }
        txn.advance(&mut cursor).await?;
    }

    debug!(
        source = %source,
        matched = result.matched,
        written = result.written,
        "Scan finished"
    );
    Ok(result)
}
