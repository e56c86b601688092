// Copyright (c) 2025 - Cowboy AI, Inc.
//! Subscription, Durability, Catch-up and Competing-Consumer Scenarios
//!
//! End-to-end scenarios over the in-memory stack: the same wrappers and the
//! same coordinator run against MongoDB in production, with the in-memory
//! store standing in for the backend.

mod fixtures;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use occurrent::competing::{
    CompetingConsumerCoordinator, CompetingConsumerConfig, ConsumerState, InMemoryLeaseStore,
};
use occurrent::store::{EventStore, InMemoryEventStore};
use occurrent::subscription::{
    CatchupConfig, CatchupSubscriptionModel, DurableSubscriptionModel, EventConsumer,
    InMemorySubscriptionModel, InMemorySubscriptionPositionStore, PositionedEvent, StartAt,
    SubscriptionModel, SubscriptionPositionStore,
};

use fixtures::{numbered_event, numbered_events};

/// Collects delivered event ids in order
#[derive(Clone, Default)]
struct Collector {
    seen: Arc<StdMutex<Vec<String>>>,
}

impl Collector {
    fn ids(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn distinct(&self) -> usize {
        let ids = self.ids();
        let mut unique: Vec<&String> = ids.iter().collect();
        unique.sort();
        unique.dedup();
        unique.len()
    }

    fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl EventConsumer for Collector {
    async fn consume(&self, event: PositionedEvent) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(event.event.id.clone());
        Ok(())
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..600 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

async fn wait_for_state(
    coordinator: &CompetingConsumerCoordinator,
    subscription_id: &str,
    subscriber_id: &str,
    expected: ConsumerState,
) {
    for _ in 0..600 {
        if coordinator.state(subscription_id, subscriber_id).await == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for '{}' to reach {:?}",
        subscriber_id, expected
    );
}

fn durable_stack(
    store: &InMemoryEventStore,
    positions: Arc<dyn SubscriptionPositionStore>,
    persist_every: u64,
) -> DurableSubscriptionModel {
    let live = Arc::new(InMemorySubscriptionModel::new(store.clone()));
    DurableSubscriptionModel::new(live, positions).with_position_persistence_every(persist_every)
}

#[tokio::test]
async fn test_durable_subscription_survives_restart() {
    fixtures::init_tracing();
    let store = InMemoryEventStore::new();
    let positions: Arc<dyn SubscriptionPositionStore> =
        Arc::new(InMemorySubscriptionPositionStore::new());

    // First incarnation: deliver the first half
    let durable = durable_stack(&store, positions.clone(), 10);
    let collector = Collector::default();
    durable
        .subscribe("durable", None, StartAt::BeginningOfTime, Arc::new(collector.clone()))
        .await
        .unwrap();

    store.write("numbers", numbered_events(0..50)).await.unwrap();
    wait_until("first 50 deliveries", || collector.len() >= 50).await;

    // Crash: the process dies without cancelling, so the persisted position
    // stays behind
    durable.shutdown().await;

    store.write("numbers", numbered_events(50..100)).await.unwrap();

    // Second incarnation resumes from the persisted position
    let durable = durable_stack(&store, positions.clone(), 10);
    durable
        .subscribe("durable", None, StartAt::Default, Arc::new(collector.clone()))
        .await
        .unwrap();

    wait_until("all 100 distinct deliveries", || collector.distinct() >= 100).await;

    // At-least-once: everything arrives, re-deliveries bounded by the
    // persistence interval
    assert_eq!(collector.distinct(), 100);
    assert!(collector.len() <= 110, "deliveries: {}", collector.len());
    durable.shutdown().await;
}

#[tokio::test]
async fn test_durable_cancel_deletes_position() {
    let store = InMemoryEventStore::new();
    let positions: Arc<dyn SubscriptionPositionStore> =
        Arc::new(InMemorySubscriptionPositionStore::new());

    let durable = durable_stack(&store, positions.clone(), 1);
    durable
        .subscribe("durable", None, StartAt::Default, Arc::new(Collector::default()))
        .await
        .unwrap();
    assert!(positions.read("durable").await.unwrap().is_some());

    durable.cancel("durable").await.unwrap();
    assert!(positions.read("durable").await.unwrap().is_none());
}

#[tokio::test]
async fn test_catchup_bridges_history_into_live_feed() {
    let store = InMemoryEventStore::new();
    let positions: Arc<dyn SubscriptionPositionStore> =
        Arc::new(InMemorySubscriptionPositionStore::new());

    store.write("numbers", numbered_events(0..100)).await.unwrap();

    let live = Arc::new(InMemorySubscriptionModel::new(store.clone()));
    let catchup = CatchupSubscriptionModel::new(
        live,
        Arc::new(store.clone()),
        positions.clone(),
        CatchupConfig {
            batch_size: 20,
            persist_every: 10,
            ..CatchupConfig::default()
        },
    )
    .unwrap();

    let collector = Collector::default();
    catchup
        .subscribe("catchup", None, StartAt::BeginningOfTime, Arc::new(collector.clone()))
        .await
        .unwrap();

    // Written while the historical phase runs: observed by the buffered live
    // feed, possibly also by the query, and must not be delivered twice
    store.write("numbers", numbered_events(100..105)).await.unwrap();
    wait_until("105 distinct deliveries", || collector.distinct() >= 105).await;

    // Continuous phase
    store.write("numbers", numbered_events(105..110)).await.unwrap();
    wait_until("110 distinct deliveries", || collector.distinct() >= 110).await;

    let ids = collector.ids();
    assert_eq!(collector.distinct(), 110);
    assert_eq!(ids.len(), 110, "no duplicate deliveries without a restart");

    // The historical prefix arrives in ascending time order
    let prefix: Vec<String> = ids.iter().take(100).cloned().collect();
    let mut sorted = prefix.clone();
    sorted.sort();
    assert_eq!(prefix, sorted);

    catchup.shutdown().await;
}

#[tokio::test]
async fn test_catchup_restart_redelivers_at_most_persistence_window() {
    let store = InMemoryEventStore::new();
    let positions: Arc<dyn SubscriptionPositionStore> =
        Arc::new(InMemorySubscriptionPositionStore::new());

    store.write("numbers", numbered_events(0..100)).await.unwrap();

    let collector = Collector::default();
    {
        let live = Arc::new(InMemorySubscriptionModel::new(store.clone()));
        let catchup = CatchupSubscriptionModel::new(
            live,
            Arc::new(store.clone()),
            positions.clone(),
            CatchupConfig {
                batch_size: 20,
                persist_every: 10,
                ..CatchupConfig::default()
            },
        )
        .unwrap();

        catchup
            .subscribe("catchup", None, StartAt::BeginningOfTime, Arc::new(collector.clone()))
            .await
            .unwrap();
        wait_until("100 deliveries", || collector.distinct() >= 100).await;
        catchup.shutdown().await;
    }

    store.write("numbers", numbered_events(100..110)).await.unwrap();

    // Restart: the persisted position is time-based, so the new incarnation
    // re-enters the historical phase from there
    let live = Arc::new(InMemorySubscriptionModel::new(store.clone()));
    let catchup = CatchupSubscriptionModel::new(
        live,
        Arc::new(store.clone()),
        positions.clone(),
        CatchupConfig {
            batch_size: 20,
            persist_every: 10,
            ..CatchupConfig::default()
        },
    )
    .unwrap();
    catchup
        .subscribe("catchup", None, StartAt::Default, Arc::new(collector.clone()))
        .await
        .unwrap();

    wait_until("110 distinct deliveries", || collector.distinct() >= 110).await;
    assert_eq!(collector.distinct(), 110);
    // Duplicates are bounded by the persistence window
    assert!(
        collector.len() <= 120,
        "deliveries: {} (expected at most 10 duplicates)",
        collector.len()
    );
    catchup.shutdown().await;
}

#[tokio::test]
async fn test_competing_consumers_exactly_one_runs() {
    fixtures::init_tracing();
    let store = InMemoryEventStore::new();
    let leases = Arc::new(InMemoryLeaseStore::new());
    let positions: Arc<dyn SubscriptionPositionStore> =
        Arc::new(InMemorySubscriptionPositionStore::new());
    let config = CompetingConsumerConfig::with_lease_duration(Duration::from_millis(400));

    // Two "processes", each with its own subscription stack but shared lease
    // and position stores
    let durable1 = Arc::new(durable_stack(&store, positions.clone(), 1));
    let coordinator1 = CompetingConsumerCoordinator::new(
        leases.clone(),
        durable1.clone(),
        durable1.fencing_tokens(),
        config.clone(),
    );
    let durable2 = Arc::new(durable_stack(&store, positions.clone(), 1));
    let coordinator2 = CompetingConsumerCoordinator::new(
        leases.clone(),
        durable2.clone(),
        durable2.fencing_tokens(),
        config.clone(),
    );

    let c1 = Collector::default();
    let c2 = Collector::default();

    coordinator1
        .subscribe("game", "p1", None, StartAt::Default, Arc::new(c1.clone()))
        .await
        .unwrap();
    coordinator2
        .subscribe("game", "p2", None, StartAt::Default, Arc::new(c2.clone()))
        .await
        .unwrap();

    let p1 = coordinator1.state("game", "p1").await.unwrap();
    let p2 = coordinator2.state("game", "p2").await.unwrap();
    assert_eq!(p1, ConsumerState::Running);
    assert!(matches!(p2, ConsumerState::Waiting | ConsumerState::Paused));

    store.write("numbers", vec![numbered_event(1)]).await.unwrap();
    wait_until("single delivery", || c1.len() + c2.len() >= 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Exactly one action invocation across all subscribers
    assert_eq!(c1.len() + c2.len(), 1);
    assert_eq!(c1.len(), 1);

    coordinator1.shutdown().await;
    coordinator2.shutdown().await;
    durable1.shutdown().await;
    durable2.shutdown().await;
}

#[tokio::test]
async fn test_competing_consumer_failover_resumes_from_position() {
    let store = InMemoryEventStore::new();
    let leases = Arc::new(InMemoryLeaseStore::new());
    let positions: Arc<dyn SubscriptionPositionStore> =
        Arc::new(InMemorySubscriptionPositionStore::new());
    let config = CompetingConsumerConfig::with_lease_duration(Duration::from_millis(200));

    let durable1 = Arc::new(durable_stack(&store, positions.clone(), 1));
    let coordinator1 = CompetingConsumerCoordinator::new(
        leases.clone(),
        durable1.clone(),
        durable1.fencing_tokens(),
        config.clone(),
    );
    let durable2 = Arc::new(durable_stack(&store, positions.clone(), 1));
    let coordinator2 = CompetingConsumerCoordinator::new(
        leases.clone(),
        durable2.clone(),
        durable2.fencing_tokens(),
        config.clone(),
    );

    let c1 = Collector::default();
    let c2 = Collector::default();

    coordinator1
        .subscribe("game", "p1", None, StartAt::Default, Arc::new(c1.clone()))
        .await
        .unwrap();
    coordinator2
        .subscribe("game", "p2", None, StartAt::Default, Arc::new(c2.clone()))
        .await
        .unwrap();

    store.write("numbers", vec![numbered_event(1)]).await.unwrap();
    wait_until("first delivery to p1", || c1.len() >= 1).await;

    // P1 goes away; P2 must take over within one lease period
    coordinator1.unregister("game", "p1").await.unwrap();
    wait_for_state(&coordinator2, "game", "p2", ConsumerState::Running).await;

    store.write("numbers", vec![numbered_event(2)]).await.unwrap();
    wait_until("second delivery to p2", || c2.len() >= 1).await;

    // P2 delivers the second event, not the first
    assert_eq!(c2.ids(), vec!["event-0002"]);
    assert_eq!(c1.ids(), vec!["event-0001"]);

    coordinator2.shutdown().await;
    durable1.shutdown().await;
    durable2.shutdown().await;
}

#[tokio::test]
async fn test_lease_loss_pauses_previous_holder() {
    let store = InMemoryEventStore::new();
    let leases = Arc::new(InMemoryLeaseStore::new());
    let positions: Arc<dyn SubscriptionPositionStore> =
        Arc::new(InMemorySubscriptionPositionStore::new());

    // P1 refreshes too slowly to keep its lease alive
    let slow = CompetingConsumerConfig {
        lease_duration: Duration::from_millis(100),
        refresh_interval: Duration::from_millis(500),
    };
    let fast = CompetingConsumerConfig {
        lease_duration: Duration::from_millis(100),
        refresh_interval: Duration::from_millis(50),
    };

    let durable1 = Arc::new(durable_stack(&store, positions.clone(), 1));
    let coordinator1 = CompetingConsumerCoordinator::new(
        leases.clone(),
        durable1.clone(),
        durable1.fencing_tokens(),
        slow,
    );
    let durable2 = Arc::new(durable_stack(&store, positions.clone(), 1));
    let coordinator2 = CompetingConsumerCoordinator::new(
        leases.clone(),
        durable2.clone(),
        durable2.fencing_tokens(),
        fast,
    );

    let mut statuses = coordinator1.status_listener();

    coordinator1
        .subscribe("game", "p1", None, StartAt::Default, Arc::new(Collector::default()))
        .await
        .unwrap();
    coordinator2
        .subscribe("game", "p2", None, StartAt::Default, Arc::new(Collector::default()))
        .await
        .unwrap();

    wait_for_state(&coordinator2, "game", "p2", ConsumerState::Running).await;
    wait_for_state(&coordinator1, "game", "p1", ConsumerState::Paused).await;

    // At most one consumer runs at any time, and the loser was told
    let p2 = coordinator2.state("game", "p2").await.unwrap();
    assert_eq!(p2, ConsumerState::Running);

    let mut saw_prohibited = false;
    while let Ok(status) = statuses.try_recv() {
        if matches!(
            status,
            occurrent::competing::ConsumerStatus::Prohibited { ref subscriber_id, .. }
                if subscriber_id == "p1"
        ) {
            saw_prohibited = true;
        }
    }
    assert!(saw_prohibited);

    coordinator1.shutdown().await;
    coordinator2.shutdown().await;
    durable1.shutdown().await;
    durable2.shutdown().await;
}
