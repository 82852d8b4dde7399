//! Bulk mutation pipeline
//!
//! Runs a list of add/put/delete/upsert items against one collection in a
//! single read-write transaction. Items run strictly one after another, so
//! writes land in input order and `results[i]` always belongs to item `i`.

use serde::de::{Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

use super::cursor::query_source;
use super::error::{Result, StoreError};
use super::range::KeyRange;
use crate::engine::adapter::key::{assign, lookup};
use crate::engine::adapter::{Connection, Key, KeyPath, Source, Transaction, TransactionMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkMethod {
    Add,
    Put,
    Delete,
    Upsert,
}

impl fmt::Display for BulkMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BulkMethod::Add => "add",
            BulkMethod::Put => "put",
            BulkMethod::Delete => "delete",
            BulkMethod::Upsert => "upsert",
        };
        f.write_str(name)
    }
}

/// One unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkItem {
    pub method: BulkMethod,
    /// Record for add/put/upsert, key for delete
    pub data: Value,
    /// Secondary index for delete and upsert lookups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Upsert lookup field(s); defaults to the index name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyPath>,
    /// Upsert: merge into the existing record instead of replacing it
    #[serde(default)]
    pub merge: bool,
}

impl BulkItem {
    fn new(method: BulkMethod, data: Value) -> Self {
        Self { method, data, index: None, key: None, merge: false }
    }

    pub fn add(data: Value) -> Self {
        Self::new(BulkMethod::Add, data)
    }

    pub fn put(data: Value) -> Self {
        Self::new(BulkMethod::Put, data)
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        Self::new(BulkMethod::Delete, key.into().to_value())
    }

    pub fn upsert(data: Value) -> Self {
        Self::new(BulkMethod::Upsert, data)
    }

    pub fn with_index(mut self, index: &str) -> Self {
        self.index = Some(index.to_string());
        self
    }

    pub fn with_key(mut self, key: impl Into<KeyPath>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn merge(mut self, merge: bool) -> Self {
        self.merge = merge;
        self
    }
}

/// Upsert payload in the grouped form
#[derive(Debug, Deserialize)]
struct UpsertPayload {
    #[serde(default)]
    index: Option<String>,
    #[serde(default)]
    key: Option<KeyPath>,
    data: Value,
    #[serde(default)]
    merge: bool,
}

/// Input of a bulk run
#[derive(Debug, Clone, PartialEq)]
pub enum BulkItems {
    /// Items in execution order
    List(Vec<BulkItem>),
    /// Payloads grouped by method. Groups run in the order given; order
    /// inside a group is kept.
    Grouped(Vec<(BulkMethod, Vec<Value>)>),
}

impl BulkItems {
    /// Flatten into execution order
    pub fn into_items(self) -> Result<Vec<BulkItem>> {
        match self {
            BulkItems::List(items) => Ok(items),
            BulkItems::Grouped(groups) => {
                let mut items = Vec::new();
                for (method, payloads) in groups {
                    for payload in payloads {
                        items.push(grouped_item(method, payload)?);
                    }
                }
                Ok(items)
            }
        }
    }
}

fn grouped_item(method: BulkMethod, payload: Value) -> Result<BulkItem> {
    if method != BulkMethod::Upsert {
        return Ok(BulkItem::new(method, payload));
    }
    let upsert: UpsertPayload = serde_json::from_value(payload)
        .map_err(|e| StoreError::InvalidBulkItem(format!("upsert payload: {}", e)))?;
    Ok(BulkItem {
        method,
        data: upsert.data,
        index: upsert.index,
        key: upsert.key,
        merge: upsert.merge,
    })
}

impl From<Vec<BulkItem>> for BulkItems {
    fn from(items: Vec<BulkItem>) -> Self {
        BulkItems::List(items)
    }
}

impl<'de> Deserialize<'de> for BulkItems {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ItemsVisitor;

        impl<'de> Visitor<'de> for ItemsVisitor {
            type Value = BulkItems;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list of bulk items or an object of payload lists keyed by method")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<BulkItems, A::Error> {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(BulkItems::List(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<BulkItems, A::Error> {
                let mut groups = Vec::new();
                while let Some((method, payloads)) = map.next_entry::<BulkMethod, Vec<Value>>()? {
                    groups.push((method, payloads));
                }
                Ok(BulkItems::Grouped(groups))
            }
        }

        deserializer.deserialize_any(ItemsVisitor)
    }
}

/// Result of a bulk run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkOutcome {
    /// Written primary key per item; `None` for deletes
    pub results: Vec<Option<Key>>,
    pub collection: String,
}

/// Shallow merge of `data` into `src`. A `null` in `data` removes the
/// field instead of storing it.
pub fn merge_data(src: Value, data: Value) -> Value {
    match (src, data) {
        (Value::Object(mut src), Value::Object(data)) => {
            for (field, value) in data {
                if value.is_null() {
                    src.remove(&field);
                } else {
                    src.insert(field, value);
                }
            }
            Value::Object(src)
        }
        (_, data) => data,
    }
}

/// Run every item in one read-write transaction.
///
/// The first failing item aborts the transaction; the error names the item
/// and its position.
pub async fn run_bulk(
    connection: &dyn Connection,
    collection: &str,
    items: impl Into<BulkItems>,
) -> Result<BulkOutcome> {
    let items = items.into().into_items()?;
    let mut txn = connection.transaction(&[collection], TransactionMode::ReadWrite).await?;
    let mut results: Vec<Option<Key>> = vec![None; items.len()];

    debug!(collection = %collection, items = items.len(), "Bulk started");

    for (position, item) in items.into_iter().enumerate() {
        match apply(txn.as_mut(), collection, &item).await {
            Ok(key) => results[position] = key,
            Err(err) => {
                warn!(
                    collection = %collection,
                    position,
                    method = %item.method,
                    error = %err,
                    "Bulk item failed"
                );
                txn.abort().await;
                return Err(StoreError::BulkItem {
                    position,
                    item: Box::new(item),
                    source: Box::new(err),
                });
            }
        }
    }

    txn.commit().await?;
    debug!(collection = %collection, "Bulk committed");

    Ok(BulkOutcome { results, collection: collection.to_string() })
}

async fn apply(txn: &mut dyn Transaction, collection: &str, item: &BulkItem) -> Result<Option<Key>> {
    match item.method {
        BulkMethod::Add | BulkMethod::Put if item.index.is_some() => Err(StoreError::InvalidBulkItem(
            format!("{} cannot target an index", item.method),
        )),
        BulkMethod::Add => Ok(Some(txn.add(collection, item.data.clone(), None).await?)),
        BulkMethod::Put => Ok(Some(txn.put(collection, item.data.clone(), None).await?)),
        BulkMethod::Delete => {
            let key = Key::from_value(&item.data).ok_or_else(|| {
                StoreError::InvalidBulkItem(format!("delete needs a key, got {}", item.data))
            })?;
            let source = query_source(txn, collection, item.index.as_deref())?;
            txn.delete(&source, &KeyRange::Only(key)).await?;
            Ok(None)
        }
        BulkMethod::Upsert => upsert(txn, collection, item).await.map(Some),
    }
}

/// Look the record up by index or primary key, then write the payload over
/// it (merged or with the existing key fields carried over)
async fn upsert(txn: &mut dyn Transaction, collection: &str, item: &BulkItem) -> Result<Key> {
    let key_path = txn.key_path(collection)?;
    let mut data = item.data.clone();

    let lookup_path = match &item.index {
        Some(index) => Some(item.key.clone().unwrap_or_else(|| KeyPath::Single(index.clone()))),
        None => None,
    };

    let found = match (&item.index, &lookup_path) {
        (Some(index), Some(path)) => {
            let source = query_source(txn, collection, Some(index.as_str()))?;
            match path.extract(&data) {
                Some(key) => txn.get(&source, &key).await?,
                None => None,
            }
        }
        _ => match key_path.as_ref().and_then(|path| path.extract(&data)) {
            Some(key) => txn.get(&Source::collection(collection), &key).await?,
            None => None,
        },
    };

    if let Some(existing) = found {
        if item.merge {
            data = merge_data(existing, data);
        } else {
            let inherited = lookup_path.iter().chain(key_path.iter()).flat_map(KeyPath::fields);
            for field in inherited {
                if let Some(value) = lookup(&existing, field) {
                    assign(&mut data, field, value.clone());
                }
            }
        }
    }

    Ok(txn.put(collection, data, None).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::adapter::{
        IndexSpec, KeyPathConfig, MemoryAdapter, OpenOutcome, StorageAdapter,
    };
    use serde_json::json;
    use std::sync::Arc;

    async fn users() -> Arc<dyn Connection> {
        let adapter = MemoryAdapter::new();
        let OpenOutcome::UpgradeNeeded(mut upgrade) = adapter.open("bulk", 1).await.unwrap() else {
            panic!("expected upgrade");
        };
        upgrade.create_collection("users", &KeyPathConfig::auto_increment("id")).unwrap();
        upgrade.create_index("users", "username", &IndexSpec::new("username", true)).unwrap();
        upgrade.create_index("users", "age", &IndexSpec::new("age", false)).unwrap();
        upgrade
            .create_index("users", "username_mail", &IndexSpec::new(vec!["username", "email"], true))
            .unwrap();
        upgrade.commit().await.unwrap()
    }

    async fn all(conn: &dyn Connection) -> Vec<Value> {
        let mut txn = conn.transaction(&["users"], TransactionMode::ReadOnly).await.unwrap();
        let mut cursor = txn
            .open_cursor(&Source::collection("users"), &KeyRange::Unbounded, Default::default())
            .await
            .unwrap();
        let mut out = Vec::new();
        while let Some(record) = cursor.current.clone() {
            out.push(record.value);
            txn.advance(&mut cursor).await.unwrap();
        }
        out
    }

    #[test]
    fn test_merge_data_null_deletes() {
        assert_eq!(merge_data(json!({"a": 1, "b": 2}), json!({"b": null})), json!({"a": 1}));
        assert_eq!(
            merge_data(json!({"a": 1}), json!({"a": 3, "c": [1]})),
            json!({"a": 3, "c": [1]})
        );
    }

    #[test]
    fn test_grouped_items_keep_group_order() {
        let items: BulkItems = serde_json::from_str(
            r#"{
                "put": [{"username": "b"}, {"username": "a"}],
                "delete": [1],
                "upsert": [{"index": "username", "data": {"username": "a", "tel": "1"}, "merge": true}]
            }"#,
        )
        .unwrap();

        let items = items.into_items().unwrap();
        let methods: Vec<_> = items.iter().map(|i| i.method).collect();
        assert_eq!(
            methods,
            vec![BulkMethod::Put, BulkMethod::Put, BulkMethod::Delete, BulkMethod::Upsert]
        );
        assert_eq!(items[0].data, json!({"username": "b"}));
        assert_eq!(items[3].index.as_deref(), Some("username"));
        assert!(items[3].merge);
    }

    #[test]
    fn test_list_items_from_json() {
        let items: BulkItems = serde_json::from_str(
            r#"[{"method": "add", "data": {"username": "x"}}, {"method": "delete", "data": "x", "index": "username"}]"#,
        )
        .unwrap();
        let items = items.into_items().unwrap();
        assert_eq!(items[1], BulkItem::delete("x").with_index("username"));
    }

    #[tokio::test]
    async fn test_results_follow_input_order() {
        let conn = users().await;
        let outcome = run_bulk(
            conn.as_ref(),
            "users",
            vec![
                BulkItem::add(json!({"username": "A"})),
                BulkItem::add(json!({"username": "B"})),
                BulkItem::delete(1i64),
            ],
        )
        .await
        .unwrap();

        assert_eq!(outcome.results, vec![Some(Key::from(1i64)), Some(Key::from(2i64)), None]);
        assert_eq!(outcome.collection, "users");
        assert_eq!(all(conn.as_ref()).await, vec![json!({"id": 2, "username": "B"})]);
    }

    #[tokio::test]
    async fn test_delete_by_index_removes_every_match() {
        let conn = users().await;
        let ages = [1i64, 2, 2, 3];
        let adds = ages.iter().map(|age| BulkItem::add(json!({"age": age}))).collect::<Vec<_>>();
        run_bulk(conn.as_ref(), "users", adds).await.unwrap();

        let outcome = run_bulk(conn.as_ref(), "users", vec![BulkItem::delete(2i64).with_index("age")])
            .await
            .unwrap();

        assert_eq!(outcome.results, vec![None]);
        assert_eq!(
            all(conn.as_ref()).await,
            vec![json!({"id": 1, "age": 1}), json!({"id": 4, "age": 3})]
        );
    }

    #[tokio::test]
    async fn test_upsert_by_index_replaces_or_merges() {
        let conn = users().await;
        run_bulk(
            conn.as_ref(),
            "users",
            vec![BulkItem::add(json!({"username": "admin", "email": "a@x.com", "tel": "0"}))],
        )
        .await
        .unwrap();

        run_bulk(
            conn.as_ref(),
            "users",
            vec![BulkItem::upsert(json!({"username": "admin", "tel": "1"})).with_index("username")],
        )
        .await
        .unwrap();
        assert_eq!(all(conn.as_ref()).await, vec![json!({"id": 1, "username": "admin", "tel": "1"})]);

        run_bulk(
            conn.as_ref(),
            "users",
            vec![BulkItem::upsert(json!({"username": "admin", "tel": null, "email": "b@x.com"}))
                .with_index("username")
                .merge(true)],
        )
        .await
        .unwrap();
        assert_eq!(
            all(conn.as_ref()).await,
            vec![json!({"id": 1, "username": "admin", "email": "b@x.com"})]
        );
    }

    #[tokio::test]
    async fn test_upsert_compound_key_and_fresh_insert() {
        let conn = users().await;
        let outcome = run_bulk(
            conn.as_ref(),
            "users",
            vec![
                BulkItem::add(json!({"username": "hlu", "email": "h@x.com"})),
                BulkItem::upsert(json!({"username": "hlu", "email": "h@x.com", "tel": "9"}))
                    .with_index("username_mail")
                    .with_key(vec!["username", "email"]),
                BulkItem::upsert(json!({"username": "new"})),
            ],
        )
        .await
        .unwrap();

        assert_eq!(
            outcome.results,
            vec![Some(Key::from(1i64)), Some(Key::from(1i64)), Some(Key::from(2i64))]
        );
        assert_eq!(
            all(conn.as_ref()).await,
            vec![
                json!({"id": 1, "username": "hlu", "email": "h@x.com", "tel": "9"}),
                json!({"id": 2, "username": "new"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_names_item_and_rolls_back() {
        let conn = users().await;
        let err = run_bulk(
            conn.as_ref(),
            "users",
            vec![
                BulkItem::add(json!({"username": "dup"})),
                BulkItem::add(json!({"username": "dup"})),
            ],
        )
        .await
        .unwrap_err();

        let StoreError::BulkItem { position, item, source } = &err else {
            panic!("unexpected error {err}");
        };
        assert_eq!(*position, 1);
        assert_eq!(item.data, json!({"username": "dup"}));
        assert_eq!(
            source.adapter_error().map(|e| e.name()),
            Some("ConstraintError")
        );
        assert!(all(conn.as_ref()).await.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_with_unknown_index_fails_before_lookup() {
        let conn = users().await;
        let err = run_bulk(
            conn.as_ref(),
            "users",
            vec![BulkItem::upsert(json!({"username": "x"})).with_index("missing")],
        )
        .await
        .unwrap_err();

        let StoreError::BulkItem { source, .. } = err else {
            panic!("expected a bulk item error");
        };
        assert!(matches!(*source, StoreError::IndexNotFound { .. }));
    }
}
