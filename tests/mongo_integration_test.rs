// Copyright (c) 2025 - Cowboy AI, Inc.
//! MongoDB Integration Tests
//!
//! These require a running MongoDB replica set (transactions and change
//! streams need one) and are marked with `#[ignore]`. Run them with:
//!
//! ```text
//! MONGODB_URI=mongodb://localhost:27017/?replicaSet=rs0 cargo test -- --ignored
//! ```

mod fixtures;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use occurrent::competing::{LeaseStore, MongoLeaseStore};
use occurrent::errors::OccurrentError;
use occurrent::store::{
    EventStore, MongoEventStore, MongoEventStoreConfig, StreamConsistencyGuarantee,
    WriteCondition,
};
use occurrent::subscription::{
    EventConsumer, MongoSubscriptionModel, MongoSubscriptionModelConfig, PositionedEvent,
    StartAt, SubscriptionModel,
};
use occurrent::{Condition, Filter, TimeRepresentation};
use uuid::Uuid;

use fixtures::numbered_event;

fn mongodb_uri() -> String {
    std::env::var("MONGODB_URI")
        .unwrap_or_else(|_| "mongodb://localhost:27017/?replicaSet=rs0".to_string())
}

/// Fresh database per test so runs do not interfere
fn test_database() -> String {
    format!("occurrent_test_{}", Uuid::now_v7().simple())
}

async fn connect(consistency: StreamConsistencyGuarantee) -> MongoEventStore {
    let config = MongoEventStoreConfig {
        stream_consistency: consistency,
        ..MongoEventStoreConfig::default()
    };
    MongoEventStore::connect(&mongodb_uri(), &test_database(), config)
        .await
        .expect("MongoDB must be reachable")
}

#[derive(Clone, Default)]
struct Collector {
    seen: Arc<StdMutex<Vec<String>>>,
}

#[async_trait]
impl EventConsumer for Collector {
    async fn consume(&self, event: PositionedEvent) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(event.event.id.clone());
        Ok(())
    }
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn test_write_and_read_assigns_versions() {
    let store = connect(StreamConsistencyGuarantee::Transactional {
        stream_version_collection: "stream_versions".to_string(),
    })
    .await;

    let version = store
        .write("name", vec![numbered_event(1), numbered_event(2)])
        .await
        .unwrap();
    assert_eq!(version, 2);

    let stream = store.read("name", 0, None).await.unwrap();
    assert_eq!(stream.version, 2);
    let events = stream.collect().await.unwrap();
    assert_eq!(events[0].stream_version(), Some(1));
    assert_eq!(events[1].stream_version(), Some(2));
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn test_write_condition_failure_message() {
    let store = connect(StreamConsistencyGuarantee::IndexOnly).await;
    store.write("name", vec![numbered_event(1)]).await.unwrap();

    let err = store
        .write_conditionally(
            "name",
            WriteCondition::stream_version_eq(10),
            vec![numbered_event(2)],
        )
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .ends_with("Expected version to be equal to 10 but was 1."));
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn test_duplicate_event_rejected() {
    let store = connect(StreamConsistencyGuarantee::IndexOnly).await;
    store.write("a", vec![numbered_event(1)]).await.unwrap();

    let err = store.write("b", vec![numbered_event(1)]).await.unwrap_err();
    assert!(matches!(err, OccurrentError::DuplicateEvent { .. }));
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn test_concurrent_writers_with_same_condition() {
    let store = Arc::new(
        connect(StreamConsistencyGuarantee::Transactional {
            stream_version_collection: "stream_versions".to_string(),
        })
        .await,
    );
    store.write("name", vec![numbered_event(0)]).await.unwrap();

    let mut handles = Vec::new();
    for writer in 1..=4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .write_conditionally(
                    "name",
                    WriteCondition::stream_version_eq(1),
                    vec![numbered_event(writer)],
                )
                .await
        }));
    }

    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(store.read("name", 0, None).await.unwrap().version, 2);
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn test_delete_stream_resets_tracked_version() {
    let store = connect(StreamConsistencyGuarantee::Transactional {
        stream_version_collection: "stream_versions".to_string(),
    })
    .await;

    store
        .write("name", vec![numbered_event(1), numbered_event(2)])
        .await
        .unwrap();
    store.delete_stream("name").await.unwrap();
    assert_eq!(store.read("name", 0, None).await.unwrap().version, 0);

    // The tracked entry was cleared: the resurrected stream restarts at 1
    let version = store.write("name", vec![numbered_event(3)]).await.unwrap();
    assert_eq!(version, 1);
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn test_query_filter_and_count() {
    let store = connect(StreamConsistencyGuarantee::IndexOnly).await;
    store
        .write("name", fixtures::numbered_events(0..10))
        .await
        .unwrap();

    let filter = Filter::stream_id("name")
        .and(Filter::data("guess", Condition::gte(5_i64.into())).unwrap());
    assert_eq!(store.count(filter.clone()).await.unwrap(), 5);

    let deleted = store.delete(filter).await.unwrap();
    assert_eq!(deleted, 5);
    assert_eq!(store.count(Filter::stream_id("name")).await.unwrap(), 5);
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn test_date_representation_rejects_sub_millisecond_time() {
    let config = MongoEventStoreConfig {
        time_representation: TimeRepresentation::Date,
        ..MongoEventStoreConfig::default()
    };
    let store = MongoEventStore::connect(&mongodb_uri(), &test_database(), config)
        .await
        .unwrap();

    let time = chrono::DateTime::parse_from_rfc3339("2026-01-19T12:00:00.123456789Z").unwrap();
    let event = occurrent::CloudEvent::builder("e1", fixtures::SOURCE, "T")
        .time(time)
        .build()
        .unwrap();

    let err = store.write("name", vec![event]).await.unwrap_err();
    assert!(matches!(err, OccurrentError::InvalidArgument(_)));
    assert!(err.to_string().contains("Rfc3339String"));
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn test_change_stream_subscription_delivers_and_resumes() {
    let uri = mongodb_uri();
    let database_name = test_database();
    let store =
        MongoEventStore::connect(&uri, &database_name, MongoEventStoreConfig::default())
            .await
            .unwrap();

    let client = mongodb::Client::with_uri_str(&uri).await.unwrap();
    let model = MongoSubscriptionModel::new(
        client.database(&database_name),
        MongoSubscriptionModelConfig::default(),
    );

    let collector = Collector::default();
    model
        .subscribe("sub", None, StartAt::Now, Arc::new(collector.clone()))
        .await
        .unwrap();

    store.write("name", vec![numbered_event(1)]).await.unwrap();
    for _ in 0..100 {
        if !collector.seen.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(*collector.seen.lock().unwrap(), vec!["event-0001"]);

    // Pause, write, resume: the resume token skips nothing
    model.pause("sub").await.unwrap();
    store.write("name", vec![numbered_event(2)]).await.unwrap();
    model.resume("sub").await.unwrap();

    for _ in 0..100 {
        if collector.seen.lock().unwrap().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        *collector.seen.lock().unwrap(),
        vec!["event-0001", "event-0002"]
    );
    model.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn test_lease_store_acquire_refresh_release() {
    let client = mongodb::Client::with_uri_str(&mongodb_uri()).await.unwrap();
    let database = client.database(&test_database());
    let leases = MongoLeaseStore::new(&database, "leases").unwrap();
    let duration = Duration::from_secs(1);

    let v1 = leases.acquire_or_refresh("s", "p1", duration).await.unwrap();
    assert_eq!(v1, Some(1));
    assert_eq!(leases.acquire_or_refresh("s", "p2", duration).await.unwrap(), None);

    let refreshed = leases.refresh("s", "p1", duration).await.unwrap();
    assert_eq!(refreshed, 1);

    let err = leases.refresh("s", "p2", duration).await.unwrap_err();
    assert!(matches!(err, OccurrentError::LostLease { .. }));

    // Expired leases change hands with a version bump
    leases
        .acquire_or_refresh("s2", "p1", Duration::from_millis(10))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let taken = leases.acquire_or_refresh("s2", "p2", duration).await.unwrap();
    assert_eq!(taken, Some(2));

    leases.release("s", "p1").await.unwrap();
    assert_eq!(leases.acquire_or_refresh("s", "p2", duration).await.unwrap(), Some(1));
}
