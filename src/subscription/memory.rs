// Copyright (c) 2025 - Cowboy AI, Inc.
//! In-memory subscription model
//!
//! Drives subscriptions from the in-memory store's broadcast change feed.
//! Positions are global offsets into the store's log, which also lets this
//! model replay history: `StartAt::BeginningOfTime` and offset positions are
//! served by reading the log before switching to the live feed,
//! de-duplicated on the offset.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{OccurrentError, OccurrentResult};
use crate::filter::Filter;
use crate::retry::RetryStrategy;
use crate::store::memory::{InMemoryEventStore, StoredChange};
use crate::subscription::{
    deliver_with_retry, EventConsumer, PositionedEvent, StartAt, SubscriptionModel,
    SubscriptionPosition, SubscriptionState,
};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

struct Worker {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

struct Entry {
    filter: Option<Filter>,
    consumer: Arc<dyn EventConsumer>,
    /// Offset of the last successfully delivered event
    restart_after: Arc<AtomicU64>,
    worker: Option<Worker>,
}

struct Registry {
    shut_down: bool,
    subscriptions: HashMap<String, Entry>,
}

/// Subscription model over the [`InMemoryEventStore`] change feed
pub struct InMemorySubscriptionModel {
    store: InMemoryEventStore,
    retry: RetryStrategy,
    shutdown_timeout: Duration,
    registry: Arc<Mutex<Registry>>,
}

impl InMemorySubscriptionModel {
    /// Create a model over the given store
    pub fn new(store: InMemoryEventStore) -> Self {
        Self {
            store,
            retry: RetryStrategy::None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            registry: Arc::new(Mutex::new(Registry {
                shut_down: false,
                subscriptions: HashMap::new(),
            })),
        }
    }

    /// Apply a retry strategy around every delivery
    pub fn with_retry_strategy(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound the wait for an in-flight callback on cancel/shutdown
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Lifecycle state of a subscription, if registered
    pub async fn state(&self, subscription_id: &str) -> Option<SubscriptionState> {
        let registry = self.registry.lock().await;
        registry.subscriptions.get(subscription_id).map(|entry| {
            if entry.worker.is_some() {
                SubscriptionState::Running
            } else {
                SubscriptionState::Paused
            }
        })
    }

    fn spawn_worker(
        &self,
        subscription_id: String,
        filter: Option<Filter>,
        consumer: Arc<dyn EventConsumer>,
        restart_after: Arc<AtomicU64>,
    ) -> Worker {
        let (stop, mut stop_rx) = watch::channel(false);
        let store = self.store.clone();
        let retry = self.retry.clone();

        let join = tokio::spawn(async move {
            let mut live = store.subscribe_changes();

            // Replay the log past the restart position before going live;
            // the live receiver was attached first so nothing is lost in
            // between, and the offset check below drops the overlap
            let backlog = store.changes_since(restart_after.load(Ordering::SeqCst));
            for change in backlog {
                if *stop_rx.borrow() {
                    return;
                }
                deliver(&subscription_id, &filter, &consumer, &retry, &restart_after, change)
                    .await;
            }

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    received = live.recv() => match received {
                        Ok(change) => {
                            deliver(
                                &subscription_id,
                                &filter,
                                &consumer,
                                &retry,
                                &restart_after,
                                change,
                            )
                            .await;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(
                                "Subscription '{}' lagged by {} events, resynchronizing from log",
                                subscription_id, missed
                            );
                            let catchup =
                                store.changes_since(restart_after.load(Ordering::SeqCst));
                            for change in catchup {
                                if *stop_rx.borrow() {
                                    return;
                                }
                                deliver(
                                    &subscription_id,
                                    &filter,
                                    &consumer,
                                    &retry,
                                    &restart_after,
                                    change,
                                )
                                .await;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Worker { stop, join }
    }

    async fn stop_worker(&self, worker: Worker) {
        let _ = worker.stop.send(true);
        if tokio::time::timeout(self.shutdown_timeout, worker.join)
            .await
            .is_err()
        {
            warn!("Timed out waiting for subscription worker to finish");
        }
    }

    fn resolve_start(&self, start_at: &StartAt) -> OccurrentResult<u64> {
        match start_at {
            StartAt::Default | StartAt::Now => Ok(self.store.current_global_position()),
            StartAt::BeginningOfTime => Ok(0),
            StartAt::Position(SubscriptionPosition::Offset(offset)) => Ok(*offset),
            StartAt::Position(other) => Err(OccurrentError::InvalidArgument(format!(
                "the in-memory subscription model only supports offset positions, got {:?}",
                other
            ))),
        }
    }
}

async fn deliver(
    subscription_id: &str,
    filter: &Option<Filter>,
    consumer: &Arc<dyn EventConsumer>,
    retry: &RetryStrategy,
    restart_after: &Arc<AtomicU64>,
    change: StoredChange,
) {
    // Overlap between replay and live feed resolves here
    if change.position <= restart_after.load(Ordering::SeqCst) {
        return;
    }
    if let Some(filter) = filter {
        if !filter.matches(&change.event) {
            // Filtered events still advance the restart position so they are
            // not rescanned on resume
            restart_after.store(change.position, Ordering::SeqCst);
            return;
        }
    }

    let positioned = PositionedEvent {
        event: change.event,
        position: SubscriptionPosition::Offset(change.position),
    };

    if deliver_with_retry(subscription_id, consumer, retry, positioned).await {
        restart_after.store(change.position, Ordering::SeqCst);
    }
}

#[async_trait]
impl SubscriptionModel for InMemorySubscriptionModel {
    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: Option<Filter>,
        start_at: StartAt,
        consumer: Arc<dyn EventConsumer>,
    ) -> OccurrentResult<()> {
        if subscription_id.is_empty() {
            return Err(OccurrentError::InvalidArgument(
                "subscription id must not be empty".to_string(),
            ));
        }
        let start_offset = self.resolve_start(&start_at)?;

        let mut registry = self.registry.lock().await;
        if registry.shut_down {
            return Err(OccurrentError::SubscriptionShutdown);
        }
        if registry.subscriptions.contains_key(subscription_id) {
            return Err(OccurrentError::InvalidArgument(format!(
                "subscription '{}' is already registered",
                subscription_id
            )));
        }

        let restart_after = Arc::new(AtomicU64::new(start_offset));
        let worker = self.spawn_worker(
            subscription_id.to_string(),
            filter.clone(),
            consumer.clone(),
            restart_after.clone(),
        );

        registry.subscriptions.insert(
            subscription_id.to_string(),
            Entry {
                filter,
                consumer,
                restart_after,
                worker: Some(worker),
            },
        );
        info!("Subscription '{}' started at offset {}", subscription_id, start_offset);
        Ok(())
    }

    async fn cancel(&self, subscription_id: &str) -> OccurrentResult<()> {
        let entry = {
            let mut registry = self.registry.lock().await;
            registry.subscriptions.remove(subscription_id)
        };
        if let Some(mut entry) = entry {
            if let Some(worker) = entry.worker.take() {
                self.stop_worker(worker).await;
            }
            info!("Subscription '{}' cancelled", subscription_id);
        }
        Ok(())
    }

    async fn pause(&self, subscription_id: &str) -> OccurrentResult<()> {
        let worker = {
            let mut registry = self.registry.lock().await;
            let entry = registry.subscriptions.get_mut(subscription_id).ok_or_else(|| {
                OccurrentError::InvalidArgument(format!(
                    "subscription '{}' is not registered",
                    subscription_id
                ))
            })?;
            entry.worker.take()
        };
        if let Some(worker) = worker {
            self.stop_worker(worker).await;
            debug!("Subscription '{}' paused", subscription_id);
        }
        Ok(())
    }

    async fn resume(&self, subscription_id: &str) -> OccurrentResult<()> {
        let mut registry = self.registry.lock().await;
        if registry.shut_down {
            return Err(OccurrentError::SubscriptionShutdown);
        }
        let entry = registry.subscriptions.get_mut(subscription_id).ok_or_else(|| {
            OccurrentError::InvalidArgument(format!(
                "subscription '{}' is not registered",
                subscription_id
            ))
        })?;

        if entry.worker.is_none() {
            let worker = self.spawn_worker(
                subscription_id.to_string(),
                entry.filter.clone(),
                entry.consumer.clone(),
                entry.restart_after.clone(),
            );
            entry.worker = Some(worker);
            debug!("Subscription '{}' resumed", subscription_id);
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let entries: Vec<Entry> = {
            let mut registry = self.registry.lock().await;
            registry.shut_down = true;
            registry.subscriptions.drain().map(|(_, e)| e).collect()
        };
        for mut entry in entries {
            if let Some(worker) = entry.worker.take() {
                self.stop_worker(worker).await;
            }
        }
        info!("In-memory subscription model shut down");
    }

    async fn global_subscription_position(&self) -> OccurrentResult<SubscriptionPosition> {
        Ok(SubscriptionPosition::Offset(
            self.store.current_global_position(),
        ))
    }
}
