// Copyright (c) 2025 - Cowboy AI, Inc.
//! MongoDB change-stream subscription model
//!
//! Each subscription owns one worker task consuming a change stream on the
//! event collection. Insert notifications are decoded back into CloudEvents
//! and delivered sequentially with their resume token as the position.
//!
//! Filters are pushed into the change-stream `$match` pipeline where
//! expressible and re-evaluated in memory as a safety net.
//!
//! Change streams cannot replay history, so `StartAt::BeginningOfTime` is
//! rejected here; wrap this model in
//! [`CatchupSubscriptionModel`](crate::subscription::CatchupSubscriptionModel)
//! to bridge historical events into the live feed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Document};
use futures::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::{Collection, Database};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::document::{EventFormat, TimeRepresentation};
use crate::errors::{OccurrentError, OccurrentResult};
use crate::filter::Filter;
use crate::retry::RetryStrategy;
use crate::subscription::{
    deliver_with_retry, EventConsumer, PositionedEvent, StartAt, SubscriptionModel,
    SubscriptionPosition, SubscriptionState,
};

/// Configuration for [`MongoSubscriptionModel`]
#[derive(Debug, Clone)]
pub struct MongoSubscriptionModelConfig {
    /// Collection whose change stream is watched
    pub event_collection: String,

    /// Must match the event store's representation for filter pushdown
    pub time_representation: TimeRepresentation,

    /// Retry applied around each delivery
    pub retry: RetryStrategy,

    /// Bound on waiting for an in-flight callback on cancel/shutdown
    pub shutdown_timeout: Duration,
}

impl Default for MongoSubscriptionModelConfig {
    fn default() -> Self {
        Self {
            event_collection: "events".to_string(),
            time_representation: TimeRepresentation::Rfc3339String,
            retry: RetryStrategy::None,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

type EventChangeStream = ChangeStream<ChangeStreamEvent<Document>>;

struct Worker {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

struct Entry {
    filter: Option<Filter>,
    consumer: Arc<dyn EventConsumer>,
    /// Position of the last successfully delivered event
    restart_at: Arc<StdMutex<Option<SubscriptionPosition>>>,
    worker: Option<Worker>,
}

struct Registry {
    shut_down: bool,
    subscriptions: HashMap<String, Entry>,
}

/// Change-stream-driven subscription model
pub struct MongoSubscriptionModel {
    database: Database,
    events: Collection<Document>,
    format: EventFormat,
    config: MongoSubscriptionModelConfig,
    registry: Arc<Mutex<Registry>>,
}

impl MongoSubscriptionModel {
    /// Create a model over the given database
    pub fn new(database: Database, config: MongoSubscriptionModelConfig) -> Self {
        let events = database.collection::<Document>(&config.event_collection);
        Self {
            database,
            events,
            format: EventFormat::new(config.time_representation),
            config,
            registry: Arc::new(Mutex::new(Registry {
                shut_down: false,
                subscriptions: HashMap::new(),
            })),
        }
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

    async fn open_change_stream(
        &self,
        filter: &Option<Filter>,
        restart_at: &Option<SubscriptionPosition>,
    ) -> OccurrentResult<EventChangeStream> {
        let mut match_stage = doc! { "operationType": "insert" };
        if let Some(filter) = filter {
            if !filter.is_empty() {
                let pushdown =
                    filter.to_query_prefixed("fullDocument.", self.config.time_representation);
                match_stage = doc! { "$and": [ match_stage, pushdown ] };
            }
        }

        let mut watch = self.events.watch().pipeline(vec![doc! { "$match": match_stage }]);

        match restart_at {
            Some(SubscriptionPosition::ResumeToken(token)) => {
                let token: ResumeToken = bson::from_document(token.clone())?;
                watch = watch.resume_after(token);
            }
            Some(SubscriptionPosition::OperationTime(timestamp)) => {
                watch = watch.start_at_operation_time(*timestamp);
            }
            Some(other) => {
                return Err(OccurrentError::InvalidArgument(format!(
                    "the MongoDB subscription model cannot start from {:?}",
                    other
                )));
            }
            None => {}
        }

        Ok(watch.await?)
    }

    fn spawn_worker(
        &self,
        subscription_id: String,
        filter: Option<Filter>,
        consumer: Arc<dyn EventConsumer>,
        restart_at: Arc<StdMutex<Option<SubscriptionPosition>>>,
        mut stream: EventChangeStream,
    ) -> Worker {
        let (stop, mut stop_rx) = watch::channel(false);
        let format = self.format;
        let retry = self.config.retry.clone();

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    received = stream.next() => match received {
                        Some(Ok(change)) => {
                            handle_change(
                                &subscription_id,
                                &format,
                                &filter,
                                &consumer,
                                &retry,
                                &restart_at,
                                change,
                            )
                            .await;
                        }
                        Some(Err(err)) => {
                            // The driver resumes transparently where it can;
                            // an error here means the stream is dead
                            error!(
                                "Subscription '{}': change stream failed: {}",
                                subscription_id, err
                            );
                            break;
                        }
                        None => {
                            warn!("Subscription '{}': change stream ended", subscription_id);
                            break;
                        }
                    }
                }
            }
            // Dropping the stream closes the server-side cursor
        });

        Worker { stop, join }
    }

    async fn stop_worker(&self, worker: Worker) {
        let _ = worker.stop.send(true);
        if tokio::time::timeout(self.config.shutdown_timeout, worker.join)
            .await
            .is_err()
        {
            warn!("Timed out waiting for subscription worker to finish");
        }
    }
}

async fn handle_change(
    subscription_id: &str,
    format: &EventFormat,
    filter: &Option<Filter>,
    consumer: &Arc<dyn EventConsumer>,
    retry: &RetryStrategy,
    restart_at: &Arc<StdMutex<Option<SubscriptionPosition>>>,
    change: ChangeStreamEvent<Document>,
) {
    if change.operation_type != OperationType::Insert {
        return;
    }
    let Some(document) = change.full_document else {
        return;
    };

    let event = match format.decode(document) {
        Ok(event) => event,
        Err(err) => {
            error!(
                "Subscription '{}': skipping undecodable change event: {}",
                subscription_id, err
            );
            return;
        }
    };

    let position = match bson::to_document(&change.id) {
        Ok(token) => SubscriptionPosition::ResumeToken(token),
        Err(err) => {
            error!(
                "Subscription '{}': could not serialize resume token: {}",
                subscription_id, err
            );
            return;
        }
    };

    // Safety net on top of the $match pushdown
    if let Some(filter) = filter {
        if !filter.matches(&event) {
            set_position(restart_at, position);
            return;
        }
    }

    debug!("Subscription '{}': delivering event '{}'", subscription_id, event.id);
    let delivered = deliver_with_retry(
        subscription_id,
        consumer,
        retry,
        PositionedEvent {
            event,
            position: position.clone(),
        },
    )
    .await;

    if delivered {
        set_position(restart_at, position);
    }
}

fn set_position(
    restart_at: &Arc<StdMutex<Option<SubscriptionPosition>>>,
    position: SubscriptionPosition,
) {
    *restart_at
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(position);
}

#[async_trait]
impl SubscriptionModel for MongoSubscriptionModel {
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

        let initial_position = match start_at {
            StartAt::Default | StartAt::Now => None,
            StartAt::BeginningOfTime => {
                return Err(OccurrentError::InvalidArgument(
                    "change streams cannot replay history; wrap this model in a \
                     CatchupSubscriptionModel to start from the beginning of time"
                        .to_string(),
                ));
            }
            StartAt::Position(position) => Some(position),
        };

        // Establish the stream before registering so that events written
        // after this call returns are guaranteed to be observed
        let stream = self.open_change_stream(&filter, &initial_position).await?;

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

        let restart_at = Arc::new(StdMutex::new(initial_position));
        let worker = self.spawn_worker(
            subscription_id.to_string(),
            filter.clone(),
            consumer.clone(),
            restart_at.clone(),
            stream,
        );

        registry.subscriptions.insert(
            subscription_id.to_string(),
            Entry {
                filter,
                consumer,
                restart_at,
                worker: Some(worker),
            },
        );
        info!("Subscription '{}' watching '{}'", subscription_id, self.config.event_collection);
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
        // Snapshot what is needed to rebuild the stream without holding the
        // registry lock across the watch round-trip
        let (filter, consumer, restart_at) = {
            let registry = self.registry.lock().await;
            if registry.shut_down {
                return Err(OccurrentError::SubscriptionShutdown);
            }
            let entry = registry.subscriptions.get(subscription_id).ok_or_else(|| {
                OccurrentError::InvalidArgument(format!(
                    "subscription '{}' is not registered",
                    subscription_id
                ))
            })?;
            if entry.worker.is_some() {
                return Ok(());
            }
            (
                entry.filter.clone(),
                entry.consumer.clone(),
                entry.restart_at.clone(),
            )
        };

        let position = restart_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let stream = self.open_change_stream(&filter, &position).await?;

        let mut registry = self.registry.lock().await;
        let Some(entry) = registry.subscriptions.get_mut(subscription_id) else {
            return Ok(());
        };
        if entry.worker.is_none() {
            let worker = self.spawn_worker(
                subscription_id.to_string(),
                filter,
                consumer,
                restart_at,
                stream,
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
        info!("MongoDB subscription model shut down");
    }

    async fn global_subscription_position(&self) -> OccurrentResult<SubscriptionPosition> {
        let mut session = self.database.client().start_session().await?;
        self.database
            .run_command(doc! { "ping": 1 })
            .session(&mut session)
            .await?;

        let observed = session.operation_time().ok_or_else(|| {
            OccurrentError::TransientIo("server did not report an operation time".to_string())
        })?;

        // Advance by the minimum quantum so a subscription started from this
        // token does not re-deliver events observed before the call
        Ok(SubscriptionPosition::OperationTime(bson::Timestamp {
            time: observed.time,
            increment: observed.increment + 1,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MongoSubscriptionModelConfig::default();
        assert_eq!(config.event_collection, "events");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
    }
}
