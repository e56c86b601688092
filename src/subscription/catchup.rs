// Copyright (c) 2025 - Cowboy AI, Inc.
//! Catch-up subscriptions
//!
//! [`CatchupSubscriptionModel`] bridges historical events into the live
//! feed. Subscribing from the beginning of time (or from a time-based
//! position) runs two phases:
//!
//! 1. **Historical** — the live subscription is opened immediately but its
//!    events are buffered; meanwhile a bounded-batch query streams stored
//!    events in ascending time order to the consumer, persisting a
//!    time-based position every N events.
//! 2. **Continuous** — once the query is exhausted the buffer is drained,
//!    skipping events already delivered historically (de-duplicated on
//!    `(id, source)`), and the subscription follows the live feed with
//!    backend-native positions.
//!
//! The de-dup set is bounded: it is dropped as soon as a live event's time
//! strictly exceeds the last historical time. A crash during the historical
//! phase resumes from the last persisted time-based position, re-delivering
//! at most the window since then (at-least-once).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::condition::Condition;
use crate::errors::{OccurrentError, OccurrentResult};
use crate::event::CloudEvent;
use crate::filter::Filter;
use crate::retry::RetryStrategy;
use crate::store::{EventStore, QueryOptions, SortBy};
use crate::subscription::{
    deliver_with_retry, EventConsumer, FencingTokens, PositionedEvent, StartAt,
    SubscriptionModel, SubscriptionPosition, SubscriptionPositionStore,
};

/// Configuration for [`CatchupSubscriptionModel`]
#[derive(Debug, Clone)]
pub struct CatchupConfig {
    /// Events fetched per historical query batch (≥ 1)
    pub batch_size: u64,

    /// Persist a time-based position every N historical deliveries (≥ 1)
    pub persist_every: u64,

    /// Retry applied around historical deliveries
    pub retry: RetryStrategy,
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            persist_every: 10,
            retry: RetryStrategy::None,
        }
    }
}

enum Phase {
    /// Live events are buffered while the historical query runs
    Historical { buffer: Vec<PositionedEvent> },
    /// Live events are delivered, de-duplicated against the historical set
    Continuous {
        dedup: HashSet<(String, String)>,
        last_historical_time: Option<DateTime<Utc>>,
    },
}

struct CatchupState {
    phase: StdMutex<Phase>,
}

impl CatchupState {
    fn lock(&self) -> std::sync::MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wraps the user consumer on the live path: buffer during Historical,
/// de-duplicate during Continuous
struct BufferingConsumer {
    state: Arc<CatchupState>,
    inner: Arc<dyn EventConsumer>,
}

#[async_trait]
impl EventConsumer for BufferingConsumer {
    async fn consume(&self, event: PositionedEvent) -> anyhow::Result<()> {
        // Decide under the lock, deliver outside it
        {
            let mut phase = self.state.lock();
            match &mut *phase {
                Phase::Historical { buffer } => {
                    buffer.push(event);
                    return Ok(());
                }
                Phase::Continuous {
                    dedup,
                    last_historical_time,
                } => {
                    let event_time = event.event.time.map(|t| t.with_timezone(&Utc));
                    if !dedup.is_empty() {
                        if let (Some(event_time), Some(last)) = (event_time, *last_historical_time)
                        {
                            // Past the switchover window: the de-dup set has
                            // served its purpose
                            if event_time > last {
                                dedup.clear();
                            }
                        }
                        if dedup.remove(&(event.event.id.clone(), event.event.source.clone())) {
                            return Ok(());
                        }
                    }
                }
            }
        }
        self.inner.consume(event).await
    }
}

struct CatchupTask {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Subscription model wrapper that replays history before going live
pub struct CatchupSubscriptionModel {
    delegate: Arc<dyn SubscriptionModel>,
    store: Arc<dyn EventStore>,
    positions: Arc<dyn SubscriptionPositionStore>,
    config: CatchupConfig,
    fencing: FencingTokens,
    tasks: Arc<Mutex<HashMap<String, CatchupTask>>>,
}

impl CatchupSubscriptionModel {
    /// Wrap a live model with historical replay from the given store
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the batch size or persistence interval is zero
    pub fn new(
        delegate: Arc<dyn SubscriptionModel>,
        store: Arc<dyn EventStore>,
        positions: Arc<dyn SubscriptionPositionStore>,
        config: CatchupConfig,
    ) -> OccurrentResult<Self> {
        Self::validate_config(&config)?;
        Ok(Self {
            delegate,
            store,
            positions,
            config,
            fencing: FencingTokens::default(),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Share a fencing-token registry for historical position writes
    pub fn with_fencing_tokens(mut self, fencing: FencingTokens) -> Self {
        self.fencing = fencing;
        self
    }

    /// Where to restart history for the given start point, or `None` when
    /// no catch-up is needed
    async fn catchup_from(
        &self,
        subscription_id: &str,
        start_at: &StartAt,
    ) -> OccurrentResult<Option<Option<DateTime<Utc>>>> {
        match start_at {
            StartAt::BeginningOfTime => Ok(Some(None)),
            StartAt::Position(SubscriptionPosition::Time(time)) => Ok(Some(Some(*time))),
            StartAt::Default => match self.positions.read(subscription_id).await? {
                Some(SubscriptionPosition::Time(time)) => Ok(Some(Some(time))),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_historical(
    subscription_id: String,
    filter: Option<Filter>,
    consumer: Arc<dyn EventConsumer>,
    state: Arc<CatchupState>,
    store: Arc<dyn EventStore>,
    positions: Arc<dyn SubscriptionPositionStore>,
    config: CatchupConfig,
    fencing: FencingTokens,
    from: Option<DateTime<Utc>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut dedup: HashSet<(String, String)> = HashSet::new();
    let mut last_time: Option<DateTime<Utc>> = from;
    let mut delivered: u64 = 0;
    let mut skip: u64 = 0;

    'query: loop {
        let mut query_filter = filter.clone().unwrap_or_else(Filter::all);
        if let Some(from) = from {
            query_filter = query_filter.and(Filter::time(Condition::gte(from)));
        }
        let options = QueryOptions::default()
            .sort(SortBy::TimeAsc)
            .skip(skip)
            .limit(config.batch_size);

        let batch: Vec<CloudEvent> = match store.query(query_filter, options).await {
            Ok(events) => match futures::TryStreamExt::try_collect(events).await {
                Ok(batch) => batch,
                Err(err) => {
                    error!(
                        "Subscription '{}': historical query failed, going live: {}",
                        subscription_id, err
                    );
                    break 'query;
                }
            },
            Err(err) => {
                error!(
                    "Subscription '{}': historical query failed, going live: {}",
                    subscription_id, err
                );
                break 'query;
            }
        };
        let batch_len = batch.len() as u64;

        for event in batch {
            if *stop.borrow_and_update() {
                return;
            }

            let event_time = event
                .time
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
            let key = (event.id.clone(), event.source.clone());

            let positioned = PositionedEvent {
                event,
                position: SubscriptionPosition::Time(event_time),
            };
            if deliver_with_retry(&subscription_id, &consumer, &config.retry, positioned).await {
                dedup.insert(key);
                last_time = Some(event_time);
                delivered += 1;
                if delivered % config.persist_every == 0 {
                    if let Err(err) = positions
                        .save(
                            &subscription_id,
                            &SubscriptionPosition::Time(event_time),
                            fencing.get(&subscription_id),
                        )
                        .await
                    {
                        warn!(
                            "Subscription '{}': could not persist catch-up position: {}",
                            subscription_id, err
                        );
                    }
                }
            }
        }

        if batch_len < config.batch_size {
            break;
        }
        skip += config.batch_size;
    }

    info!(
        "Subscription '{}': historical phase delivered {} event(s), switching to live",
        subscription_id, delivered
    );

    // Drain the buffer in rounds; the live consumer keeps buffering until
    // the phase flips, so deliveries never interleave
    loop {
        let drained = {
            let mut phase = state.lock();
            match &mut *phase {
                Phase::Historical { buffer } => {
                    if buffer.is_empty() {
                        *phase = Phase::Continuous {
                            dedup: std::mem::take(&mut dedup),
                            last_historical_time: last_time,
                        };
                        break;
                    }
                    std::mem::take(buffer)
                }
                Phase::Continuous { .. } => break,
            }
        };

        for positioned in drained {
            if *stop.borrow_and_update() {
                return;
            }
            let key = (positioned.event.id.clone(), positioned.event.source.clone());
            if dedup.contains(&key) {
                debug!(
                    "Subscription '{}': skipping '{}' already delivered during catch-up",
                    subscription_id, key.0
                );
                continue;
            }
            deliver_with_retry(&subscription_id, &consumer, &config.retry, positioned).await;
        }
    }
}

#[async_trait]
impl SubscriptionModel for CatchupSubscriptionModel {
    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: Option<Filter>,
        start_at: StartAt,
        consumer: Arc<dyn EventConsumer>,
    ) -> OccurrentResult<()> {
        let Some(from) = self.catchup_from(subscription_id, &start_at).await? else {
            // Nothing to replay; behave exactly like the wrapped model
            return self
                .delegate
                .subscribe(subscription_id, filter, start_at, consumer)
                .await;
        };

        let state = Arc::new(CatchupState {
            phase: StdMutex::new(Phase::Historical { buffer: Vec::new() }),
        });

        // Live subscription first so no event between "now" and the end of
        // the historical query is lost; it buffers until the phase flips
        self.delegate
            .subscribe(
                subscription_id,
                filter.clone(),
                StartAt::Now,
                Arc::new(BufferingConsumer {
                    state: state.clone(),
                    inner: consumer.clone(),
                }),
            )
            .await?;

        let (stop, stop_rx) = watch::channel(false);
        let join = tokio::spawn(run_historical(
            subscription_id.to_string(),
            filter,
            consumer,
            state,
            self.store.clone(),
            self.positions.clone(),
            self.config.clone(),
            self.fencing.clone(),
            from,
            stop_rx,
        ));

        self.tasks
            .lock()
            .await
            .insert(subscription_id.to_string(), CatchupTask { stop, join });

        info!(
            "Subscription '{}' catching up from {:?}",
            subscription_id, from
        );
        Ok(())
    }

    async fn cancel(&self, subscription_id: &str) -> OccurrentResult<()> {
        if let Some(task) = self.tasks.lock().await.remove(subscription_id) {
            let _ = task.stop.send(true);
            let _ = task.join.await;
        }
        self.delegate.cancel(subscription_id).await?;
        self.positions.delete(subscription_id).await?;
        Ok(())
    }

    async fn pause(&self, subscription_id: &str) -> OccurrentResult<()> {
        self.delegate.pause(subscription_id).await
    }

    async fn resume(&self, subscription_id: &str) -> OccurrentResult<()> {
        self.delegate.resume(subscription_id).await
    }

    async fn shutdown(&self) {
        let tasks: Vec<CatchupTask> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().map(|(_, t)| t).collect()
        };
        for task in tasks {
            let _ = task.stop.send(true);
            let _ = task.join.await;
        }
        self.delegate.shutdown().await;
    }

    async fn global_subscription_position(&self) -> OccurrentResult<SubscriptionPosition> {
        self.delegate.global_subscription_position().await
    }
}

impl CatchupSubscriptionModel {
    /// Validate configuration values
    pub fn validate_config(config: &CatchupConfig) -> OccurrentResult<()> {
        if config.batch_size == 0 {
            return Err(OccurrentError::InvalidArgument(
                "catch-up batch size must be at least 1".to_string(),
            ));
        }
        if config.persist_every == 0 {
            return Err(OccurrentError::InvalidArgument(
                "position persistence interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CatchupConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.persist_every, 10);
        CatchupSubscriptionModel::validate_config(&config).unwrap();
    }

    #[test]
    fn test_config_validation() {
        let config = CatchupConfig {
            batch_size: 0,
            ..CatchupConfig::default()
        };
        assert!(CatchupSubscriptionModel::validate_config(&config).is_err());
    }
}
