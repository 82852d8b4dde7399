use airkv::{
    AbortSignal, BulkItem, BulkItems, CollectionSchema, Condition, Filter, IndexSpec, Key, KeyPathConfig,
    MemoryAdapter, MigrationState, Query, QueryOptions, SchemaDelta, StorageAdapter, StoreConfig,
    StoreSession,
};
use futures_util::future::join_all;
use serde_json::json;
use std::ops::ControlFlow;
use std::sync::Arc;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn users_schema() -> Vec<SchemaDelta> {
    vec![SchemaDelta::new(1).collection(
        "users",
        CollectionSchema::new(KeyPathConfig::auto_increment("id"))
            .index("username", IndexSpec::new("username", true))
            .index("age", IndexSpec::new("age", false)),
    )]
}

async fn open_users(name: &str) -> Result<StoreSession, Box<dyn std::error::Error>> {
    let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryAdapter::new());
    let mut session = StoreSession::new(adapter, StoreConfig::new(name, 1).with_schema(users_schema()));
    session.open().await?;
    Ok(session)
}

#[tokio::test]
async fn test_users_lifecycle() -> TestResult {
    init_tracing();
    let session = open_users("lifecycle").await?;
    let users = session.require("users")?;

    // 1. Insert admin
    users.insert(json!({"username": "admin", "age": 40})).await?;

    // 2. Look it up through the unique index
    let admin = Query::index("username").eq("admin");
    let found = users.find_one(&admin).await?;
    assert_eq!(found, Some(json!({"id": 1, "username": "admin", "age": 40})));

    // 3. Remove it and confirm it is gone
    assert_eq!(users.remove(&admin).await?, 1);
    assert!(users.find(&admin).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_eq_on_non_unique_index() -> TestResult {
    let session = open_users("eq").await?;
    let users = session.require("users")?;

    for (name, age) in [("a", 30), ("b", 20), ("c", 30), ("d", 30)] {
        users.insert(json!({"username": name, "age": age})).await?;
    }

    let thirty = users.find(&Query::index("age").eq(30i64)).await?;
    let names: Vec<_> = thirty.iter().map(|r| r["username"].clone()).collect();
    assert_eq!(names, vec![json!("a"), json!("c"), json!("d")]);

    assert!(users.find(&Query::index("age").eq(99i64)).await?.is_empty());
    assert_eq!(users.find(&Query::index("username").eq("b")).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_open_and_closed_ranges() -> TestResult {
    let session = open_users("ranges").await?;
    let users = session.require("users")?;

    for age in 5..=10 {
        users.insert(json!({"username": format!("u{}", age), "age": age})).await?;
    }

    let closed = users.find(&Query::index("age").gte(5i64).lte(10i64)).await?;
    let open = users.find(&Query::index("age").gt(5i64).lt(10i64)).await?;

    let ages = |records: &[serde_json::Value]| -> Vec<i64> {
        records.iter().filter_map(|r| r["age"].as_i64()).collect()
    };
    assert_eq!(ages(&closed), vec![5, 6, 7, 8, 9, 10]);
    assert_eq!(ages(&open), vec![6, 7, 8, 9]);
    Ok(())
}

#[tokio::test]
async fn test_bulk_keeps_order_and_rolls_back() -> TestResult {
    let session = open_users("bulk").await?;
    let users = session.require("users")?;

    // 1. Results line up with the input
    let outcome = users
        .bulk(vec![
            BulkItem::add(json!({"username": "A"})),
            BulkItem::add(json!({"username": "B"})),
        ])
        .await?;
    assert_eq!(outcome.results, vec![Some(Key::from(1i64)), Some(Key::from(2i64))]);

    // 2. Grouped form from JSON, groups in the order written
    let items: BulkItems = serde_json::from_value(json!({
        "delete": [1],
        "put": [{"username": "C"}],
        "upsert": [{"index": "username", "data": {"username": "B", "age": 3}, "merge": true}]
    }))?;
    let outcome = users.bulk(items).await?;
    assert_eq!(
        outcome.results,
        vec![None, Some(Key::from(3i64)), Some(Key::from(2i64))]
    );
    assert_eq!(users.get(2i64).await?, Some(json!({"id": 2, "username": "B", "age": 3})));

    // 3. A failing item discards the whole batch
    let err = users
        .bulk(vec![
            BulkItem::add(json!({"username": "D"})),
            BulkItem::add(json!({"username": "C"})),
        ])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Bulk item 1 failed"));
    assert!(users.find(&Query::index("username").eq("D")).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_upsert_twice_keeps_one_record() -> TestResult {
    let session = open_users("upsert").await?;
    let users = session.require("users")?;
    users.insert(json!({"username": "admin"})).await?;

    let admin = Query::index("username").eq("admin");
    users.upsert(&admin, json!({"tel": "x"}), true).await?;
    users.upsert(&admin, json!({"tel": "x"}), true).await?;

    let all = users.find(&Query::new()).await?;
    assert_eq!(all, vec![json!({"id": 1, "username": "admin", "tel": "x"})]);
    Ok(())
}

#[tokio::test]
async fn test_migrations_from_config_file() -> TestResult {
    let dir = tempfile::tempdir()?;
    let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryAdapter::new());

    // 1. Version 2 from a config file
    let mut deltas = users_schema();
    deltas.push(SchemaDelta::new(2).collection(
        "orders",
        CollectionSchema::new(KeyPathConfig::key_path("orderId")),
    ));
    StoreConfig::new("shop", 2).with_schema(deltas.clone()).save(dir.path())?;

    let mut session = StoreSession::new(Arc::clone(&adapter), StoreConfig::load(dir.path())?);
    let report = session.open().await?.ok_or("expected a migration")?;
    assert_eq!(report.applied, vec![1, 2]);
    assert_eq!(session.collection_names(), vec!["orders", "users"]);
    session.close();

    // 2. Version 3 applies only the new delta
    deltas.push(SchemaDelta::new(3).collection(
        "orders",
        CollectionSchema::default().index("total", IndexSpec::new("total", false)),
    ));
    let mut session = StoreSession::new(Arc::clone(&adapter), StoreConfig::new("shop", 3).with_schema(deltas.clone()));
    let report = session.open().await?.ok_or("expected a migration")?;
    assert_eq!(report.from_version, 2);
    assert_eq!(report.applied, vec![3]);

    let orders = session.require("orders")?;
    orders.insert(json!({"orderId": "o-1", "total": 12})).await?;
    orders.insert(json!({"orderId": "o-2", "total": 8})).await?;
    let big = Query::index("total").gt(10i64);
    assert_eq!(orders.find(&big).await?, vec![json!({"orderId": "o-1", "total": 12})]);
    session.close();

    // 3. Same deltas at a higher version apply nothing
    let mut session = StoreSession::new(adapter, StoreConfig::new("shop", 4).with_schema(deltas));
    let report = session.open().await?.ok_or("expected a migration")?;
    assert!(report.applied.is_empty());
    assert_eq!(session.version(), 4);
    assert_eq!(session.state(), MigrationState::Open);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_calls_use_separate_transactions() -> TestResult {
    let session = open_users("concurrent").await?;
    let users = session.require("users")?;

    let writes = (0..20).map(|n| {
        let users = users.clone();
        async move { users.insert(json!({"username": format!("user{}", n), "age": n})).await }
    });
    let keys = join_all(writes).await.into_iter().collect::<Result<Vec<_>, _>>()?;
    assert_eq!(keys.len(), 20);

    let all = Query::new();
    let reads = (0..5).map(|_| users.count(&all));
    for count in join_all(reads).await {
        assert_eq!(count?, 20);
    }
    Ok(())
}

#[tokio::test]
async fn test_filtered_scan_and_abort() -> TestResult {
    let session = open_users("abort").await?;
    let users = session.require("users")?;
    for n in 0..10 {
        users.insert(json!({"username": format!("u{}", n), "age": n})).await?;
    }

    // 1. Post-filter over an index scan
    let query = Query::index("age")
        .gte(2i64)
        .filter(Filter::all([Condition::lt("age", 5)]));
    assert_eq!(users.find(&query).await?.len(), 3);

    // 2. Aborting mid-scan discards writes and resolves empty
    let signal = AbortSignal::new();
    let trigger = signal.clone();
    let options = QueryOptions::read_write()
        .abort_signal(signal)
        .on_cursor(move |visit| {
            visit.delete();
            if visit.value()["age"] == json!(4) {
                trigger.abort();
            }
            ControlFlow::Continue(())
        });
    assert!(users.find_with(&Query::new(), options).await?.is_empty());
    assert_eq!(users.count(&Query::new()).await?, 10);
    Ok(())
}
