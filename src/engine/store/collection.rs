//! Collection handle
//!
//! A named collection of the open store. Every call runs in its own
//! transaction on the shared connection.

use serde_json::Value;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::debug;

use super::bulk::{merge_data, run_bulk, BulkItems, BulkOutcome};
use super::cursor::{query_source, run_query, scan, QueryOptions};
use super::error::Result;
use super::query::Query;
use super::range::KeyRange;
use crate::engine::adapter::key::{assign, lookup};
use crate::engine::adapter::{Connection, Key, KeyPath, Source, Transaction, TransactionMode};

/// Handle on one collection
#[derive(Clone)]
pub struct Collection {
    name: String,
    connection: Arc<dyn Connection>,
}

impl Collection {
    pub(crate) fn new(name: &str, connection: Arc<dyn Connection>) -> Self {
        Self { name: name.to_string(), connection }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a transaction scoped to this collection
    pub async fn transaction(&self, mode: TransactionMode) -> Result<Box<dyn Transaction>> {
        Ok(self.connection.transaction(&[self.name.as_str()], mode).await?)
    }

    /// Native clear of every record
    pub async fn clear(&self) -> Result<()> {
        let mut txn = self.transaction(TransactionMode::ReadWrite).await?;
        if let Err(err) = txn.clear(&self.name).await {
            txn.abort().await;
            return Err(err.into());
        }
        txn.commit().await?;
        debug!(collection = %self.name, "Cleared collection");
        Ok(())
    }

    /// Delete every record. The collection itself stays, since only a
    /// migration may change the structure.
    pub async fn drop(&self) -> Result<usize> {
        let mut txn = self.transaction(TransactionMode::ReadWrite).await?;
        let source = Source::collection(&self.name);
        let deleted = match txn.count(&source, &KeyRange::Unbounded).await {
            Ok(count) => count,
            Err(err) => {
                txn.abort().await;
                return Err(err.into());
            }
        };
        if let Err(err) = txn.delete(&source, &KeyRange::Unbounded).await {
            txn.abort().await;
            return Err(err.into());
        }
        txn.commit().await?;
        debug!(collection = %self.name, deleted, "Dropped records");
        Ok(deleted)
    }

    /// Insert a new record; fails when its key is taken
    pub async fn insert(&self, item: Value) -> Result<Key> {
        self.write(item, false).await
    }

    /// Insert or replace a record
    pub async fn put(&self, item: Value) -> Result<Key> {
        self.write(item, true).await
    }

    async fn write(&self, item: Value, overwrite: bool) -> Result<Key> {
        let mut txn = self.transaction(TransactionMode::ReadWrite).await?;
        let written = if overwrite {
            txn.put(&self.name, item, None).await
        } else {
            txn.add(&self.name, item, None).await
        };
        match written {
            Ok(key) => {
                txn.commit().await?;
                Ok(key)
            }
            Err(err) => {
                txn.abort().await;
                Err(err.into())
            }
        }
    }

    /// Record stored under a primary key
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let mut txn = self.transaction(TransactionMode::ReadOnly).await?;
        let found = txn.get(&Source::collection(&self.name), &key.into()).await?;
        txn.commit().await?;
        Ok(found)
    }

    pub async fn find(&self, query: &Query) -> Result<Vec<Value>> {
        self.find_with(query, QueryOptions::read_only()).await
    }

    /// Run a query with a visitor, a cancellation signal or in read-write
    /// mode
    pub async fn find_with(&self, query: &Query, options: QueryOptions<'_>) -> Result<Vec<Value>> {
        run_query(self.connection.as_ref(), &self.name, query, options).await
    }

    /// First record the query matches
    pub async fn find_one(&self, query: &Query) -> Result<Option<Value>> {
        let options = QueryOptions::read_only().on_cursor(|_| ControlFlow::Break(()));
        let records = self.find_with(query, options).await?;
        Ok(records.into_iter().next())
    }

    pub async fn count(&self, query: &Query) -> Result<usize> {
        let mut txn = self.transaction(TransactionMode::ReadOnly).await?;
        let counted: Result<usize> = match &query.filter {
            None => match query_source(txn.as_ref(), &self.name, query.index.as_deref()) {
                Ok(source) => txn.count(&source, &query.key_range()).await.map_err(Into::into),
                Err(err) => Err(err),
            },
            Some(_) => {
                let mut options = QueryOptions::read_only();
                scan(txn.as_mut(), &self.name, query, &mut options).await.map(|s| s.matched)
            }
        };
        match counted {
            Ok(count) => {
                txn.commit().await?;
                Ok(count)
            }
            Err(err) => {
                txn.abort().await;
                Err(err)
            }
        }
    }

    /// Update every record the query matches, or insert `data` when none
    /// does. With `merge` the fields of `data` are laid over each record;
    /// otherwise `data` replaces it, keeping the record's primary key.
    ///
    /// Returns how many records were written.
    pub async fn upsert(&self, query: &Query, data: Value, merge: bool) -> Result<usize> {
        let mut txn = self.transaction(TransactionMode::ReadWrite).await?;
        let result = self.upsert_in(txn.as_mut(), query, &data, merge).await;
        match result {
            Ok(written) => {
                txn.commit().await?;
                debug!(collection = %self.name, written, "Upsert committed");
                Ok(written)
            }
            Err(err) => {
                txn.abort().await;
                Err(err)
            }
        }
    }

    async fn upsert_in(
        &self,
        txn: &mut dyn Transaction,
        query: &Query,
        data: &Value,
        merge: bool,
    ) -> Result<usize> {
        let key_path = txn.key_path(&self.name)?;

        let mut options = QueryOptions::read_write().on_cursor(|visit| {
            let value = if merge {
                mixin(visit.value().clone(), data)
            } else {
                with_key_fields(data.clone(), visit.value(), key_path.as_ref())
            };
            visit.update(value);
            ControlFlow::Continue(())
        });
        let result = scan(txn, &self.name, query, &mut options).await?;

        if result.matched > 0 {
            return Ok(result.written);
        }
        txn.add(&self.name, data.clone(), None).await?;
        Ok(1)
    }

    /// Single-record upsert by primary key, or by a named index when
    /// `index` is given. Merging follows [`merge_data`]; otherwise the found
    /// record's primary key is kept. Returns the record as written.
    pub async fn upsert_by_key(
        &self,
        lookup: impl Into<Key>,
        data: Value,
        index: Option<&str>,
        merge: bool,
    ) -> Result<Value> {
        let lookup = lookup.into();
        let mut txn = self.transaction(TransactionMode::ReadWrite).await?;
        match self.upsert_by_key_in(txn.as_mut(), &lookup, data, index, merge).await {
            Ok(written) => {
                txn.commit().await?;
                Ok(written)
            }
            Err(err) => {
                txn.abort().await;
                Err(err)
            }
        }
    }

    async fn upsert_by_key_in(
        &self,
        txn: &mut dyn Transaction,
        lookup: &Key,
        data: Value,
        index: Option<&str>,
        merge: bool,
    ) -> Result<Value> {
        let source = query_source(txn, &self.name, index)?;
        let key_path = txn.key_path(&self.name)?;

        let (mut record, overwrite) = match txn.get(&source, lookup).await? {
            Some(found) if merge => (merge_data(found, data), true),
            Some(found) => (with_key_fields(data, &found, key_path.as_ref()), true),
            None => (data, false),
        };

        let key = if overwrite {
            txn.put(&self.name, record.clone(), None).await?
        } else {
            txn.add(&self.name, record.clone(), None).await?
        };
        if let Some(path) = &key_path {
            path.inject(&mut record, &key);
        }
        Ok(record)
    }

    /// Delete every record the query matches; returns how many
    pub async fn remove(&self, query: &Query) -> Result<usize> {
        let mut txn = self.transaction(TransactionMode::ReadWrite).await?;
        let mut options = QueryOptions::read_write().on_cursor(|visit| {
            visit.delete();
            ControlFlow::Continue(())
        });
        match scan(txn.as_mut(), &self.name, query, &mut options).await {
            Ok(result) => {
                txn.commit().await?;
                debug!(collection = %self.name, removed = result.written, "Removed records");
                Ok(result.written)
            }
            Err(err) => {
                txn.abort().await;
                Err(err)
            }
        }
    }

    pub async fn remove_by_key(&self, key: impl Into<Key>) -> Result<()> {
        let mut txn = self.transaction(TransactionMode::ReadWrite).await?;
        let range = KeyRange::Only(key.into());
        if let Err(err) = txn.delete(&Source::collection(&self.name), &range).await {
            txn.abort().await;
            return Err(err.into());
        }
        txn.commit().await?;
        Ok(())
    }

    pub async fn bulk(&self, items: impl Into<BulkItems>) -> Result<BulkOutcome> {
        run_bulk(self.connection.as_ref(), &self.name, items).await
    }
}

/// Shallow copy of `data`'s fields over `target`. Nulls are copied as is.
pub fn mixin(target: Value, data: &Value) -> Value {
    match (target, data) {
        (Value::Object(mut target), Value::Object(fields)) => {
            for (field, value) in fields {
                target.insert(field.clone(), value.clone());
            }
            Value::Object(target)
        }
        (_, data) => data.clone(),
    }
}

/// `data` with the primary key field(s) of `existing` carried over
fn with_key_fields(mut data: Value, existing: &Value, key_path: Option<&KeyPath>) -> Value {
    for field in key_path.map(KeyPath::fields).unwrap_or_default() {
        if let Some(value) = lookup(existing, field) {
            assign(&mut data, field, value.clone());
        }
    }
    data
}
