// Copyright (c) 2025 - Cowboy AI, Inc.
//! Competing-consumer coordination
//!
//! Out of M processes subscribing with the same subscription id, exactly one
//! drives the underlying subscription at a time. Coordination is a
//! cooperative lease per subscription id: a document
//! `{subscriptionId, subscriberId, version, expiresAt}` where `version` is a
//! fencing token incremented on every change of ownership.
//!
//! # State machine
//!
//! ```text
//! Waiting --acquired--> Running
//! Running --lost/expired--> Paused
//! Paused  --acquired--> Running
//! Running --unregister/shutdown--> (removed)
//! ```
//!
//! A background ticker refreshes every held lease each half lease duration
//! and attempts acquisition for every waiting consumer, so a crashed holder
//! is replaced within one lease period. [`ConsumerStatus`] messages are
//! fanned out on a broadcast channel; the coordinator also resumes/pauses
//! the delegate subscription model itself and records the fencing token so
//! durable position writes from a stale holder are rejected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use mongodb::options::ReturnDocument;
use mongodb::{Collection, Database};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{OccurrentError, OccurrentResult};
use crate::filter::Filter;
use crate::store::mongo::duplicate_key;
use crate::subscription::{
    EventConsumer, FencingTokens, StartAt, SubscriptionModel,
};

/// A lease record: time-bounded exclusive ownership with a fencing token
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    /// Subscription the lease guards
    pub subscription_id: String,
    /// Current owner
    pub subscriber_id: String,
    /// Fencing token, incremented whenever ownership changes subscribers
    pub version: u64,
    /// When the lease lapses unless refreshed
    pub expires_at: DateTime<Utc>,
}

/// Storage for leases, keyed by subscription id
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomically acquire a free/expired lease or refresh an owned one
    ///
    /// Returns the fencing version on success, `None` when another
    /// subscriber holds an unexpired lease.
    async fn acquire_or_refresh(
        &self,
        subscription_id: &str,
        subscriber_id: &str,
        lease_duration: Duration,
    ) -> OccurrentResult<Option<u64>>;

    /// Extend an owned lease
    ///
    /// # Errors
    ///
    /// `LostLease` when the lease is no longer owned by `subscriber_id`
    async fn refresh(
        &self,
        subscription_id: &str,
        subscriber_id: &str,
        lease_duration: Duration,
    ) -> OccurrentResult<u64>;

    /// Delete the lease if owned by `subscriber_id`
    async fn release(&self, subscription_id: &str, subscriber_id: &str) -> OccurrentResult<()>;
}

fn expiry(now: DateTime<Utc>, lease_duration: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease_duration).unwrap_or(chrono::Duration::zero())
}

/// A process-unique subscriber id (time-ordered UUID v7)
pub fn generate_subscriber_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// MongoDB lease store
///
/// Documents: `{_id: subscriptionId, subscriberId, version, expiresAt}`.
pub struct MongoLeaseStore {
    leases: Collection<Document>,
}

impl MongoLeaseStore {
    /// Create a store over the given collection
    pub fn new(database: &Database, collection_name: &str) -> OccurrentResult<Self> {
        if collection_name.is_empty() {
            return Err(OccurrentError::InvalidArgument(
                "lease collection name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            leases: database.collection::<Document>(collection_name),
        })
    }
}

#[async_trait]
impl LeaseStore for MongoLeaseStore {
    async fn acquire_or_refresh(
        &self,
        subscription_id: &str,
        subscriber_id: &str,
        lease_duration: Duration,
    ) -> OccurrentResult<Option<u64>> {
        let now = Utc::now();
        let now_bson = Bson::DateTime(bson::DateTime::from_chrono(now));
        let expires_bson =
            Bson::DateTime(bson::DateTime::from_chrono(expiry(now, lease_duration)));

        // Matched when the lease is absent, expired, or already ours
        let filter = doc! {
            "_id": subscription_id,
            "$or": [
                { "expiresAt": { "$exists": false } },
                { "expiresAt": { "$lte": now_bson } },
                { "subscriberId": subscriber_id },
            ],
        };

        // Pipeline update: the version bumps only when the subscriber changes
        let update = vec![doc! {
            "$set": {
                "subscriberId": subscriber_id,
                "expiresAt": expires_bson,
                "version": {
                    "$cond": [
                        { "$eq": [ { "$ifNull": ["$subscriberId", subscriber_id] }, subscriber_id ] },
                        { "$ifNull": ["$version", 1_i64] },
                        { "$add": [ { "$ifNull": ["$version", 0_i64] }, 1_i64 ] },
                    ]
                },
            }
        }];

        match self
            .leases
            .find_one_and_update(filter, update)
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
        {
            Ok(Some(lease)) => Ok(lease.get_i64("version").ok().map(|v| v.max(0) as u64)),
            Ok(None) => Ok(None),
            // The upsert races on _id when another subscriber holds an
            // unexpired lease
            Err(error) if duplicate_key(&error).is_some() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn refresh(
        &self,
        subscription_id: &str,
        subscriber_id: &str,
        lease_duration: Duration,
    ) -> OccurrentResult<u64> {
        let expires_bson = Bson::DateTime(bson::DateTime::from_chrono(expiry(
            Utc::now(),
            lease_duration,
        )));

        let updated = self
            .leases
            .find_one_and_update(
                doc! { "_id": subscription_id, "subscriberId": subscriber_id },
                doc! { "$set": { "expiresAt": expires_bson } },
            )
            .return_document(ReturnDocument::After)
            .await?;

        match updated.and_then(|d| d.get_i64("version").ok()) {
            Some(version) => Ok(version.max(0) as u64),
            None => Err(OccurrentError::LostLease {
                subscription_id: subscription_id.to_string(),
            }),
        }
    }

    async fn release(&self, subscription_id: &str, subscriber_id: &str) -> OccurrentResult<()> {
        self.leases
            .delete_one(doc! { "_id": subscription_id, "subscriberId": subscriber_id })
            .await?;
        Ok(())
    }
}

/// In-memory lease store for tests and single-process deployments
#[derive(Default)]
pub struct InMemoryLeaseStore {
    leases: StdMutex<HashMap<String, Lease>>,
}

impl InMemoryLeaseStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn acquire_or_refresh(
        &self,
        subscription_id: &str,
        subscriber_id: &str,
        lease_duration: Duration,
    ) -> OccurrentResult<Option<u64>> {
        let now = Utc::now();
        let mut leases = self.lock();

        let version = match leases.get(subscription_id) {
            None => 1,
            Some(lease) if lease.subscriber_id == subscriber_id => lease.version,
            Some(lease) if lease.expires_at <= now => lease.version + 1,
            Some(_) => return Ok(None),
        };

        leases.insert(
            subscription_id.to_string(),
            Lease {
                subscription_id: subscription_id.to_string(),
                subscriber_id: subscriber_id.to_string(),
                version,
                expires_at: expiry(now, lease_duration),
            },
        );
        Ok(Some(version))
    }

    async fn refresh(
        &self,
        subscription_id: &str,
        subscriber_id: &str,
        lease_duration: Duration,
    ) -> OccurrentResult<u64> {
        let now = Utc::now();
        let mut leases = self.lock();

        match leases.get_mut(subscription_id) {
            Some(lease) if lease.subscriber_id == subscriber_id => {
                lease.expires_at = expiry(now, lease_duration);
                Ok(lease.version)
            }
            _ => Err(OccurrentError::LostLease {
                subscription_id: subscription_id.to_string(),
            }),
        }
    }

    async fn release(&self, subscription_id: &str, subscriber_id: &str) -> OccurrentResult<()> {
        let mut leases = self.lock();
        if leases
            .get(subscription_id)
            .is_some_and(|l| l.subscriber_id == subscriber_id)
        {
            leases.remove(subscription_id);
        }
        Ok(())
    }
}

/// Consumption grant messages fanned out to listeners
#[derive(Debug, Clone)]
pub enum ConsumerStatus {
    /// The subscriber may drive the subscription
    Granted {
        /// Subscription id
        subscription_id: String,
        /// Subscriber the grant applies to
        subscriber_id: String,
        /// Fencing token for writes on behalf of the subscription
        lease_version: u64,
    },
    /// The subscriber must stop driving the subscription
    Prohibited {
        /// Subscription id
        subscription_id: String,
        /// Subscriber the prohibition applies to
        subscriber_id: String,
    },
}

/// Lifecycle of one competing consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Never held the lease; attempting acquisition on every tick
    Waiting,
    /// Holds the lease and drives the delegate subscription
    Running,
    /// Lost the lease; attempting re-acquisition on every tick
    Paused,
}

/// Coordinator parameters
#[derive(Debug, Clone)]
pub struct CompetingConsumerConfig {
    /// Exclusive ownership window
    pub lease_duration: Duration,
    /// Ticker interval for refresh and acquisition attempts
    pub refresh_interval: Duration,
}

impl CompetingConsumerConfig {
    /// Lease duration with the conventional half-duration refresh
    pub fn with_lease_duration(lease_duration: Duration) -> Self {
        Self {
            lease_duration,
            refresh_interval: lease_duration / 2,
        }
    }
}

impl Default for CompetingConsumerConfig {
    fn default() -> Self {
        Self::with_lease_duration(Duration::from_secs(20))
    }
}

struct SubscriptionSpec {
    filter: Option<Filter>,
    start_at: StartAt,
    consumer: Arc<dyn EventConsumer>,
}

struct TransitionState {
    state: ConsumerState,
    /// Whether the delegate subscription has been established
    subscribed: bool,
    spec: SubscriptionSpec,
}

struct ConsumerEntry {
    subscription_id: String,
    subscriber_id: String,
    /// Serializes state transitions for this (subscription, subscriber).
    /// Never held across I/O: lease and delegate round-trips run unlocked,
    /// and their outcomes are committed under a brief re-acquire
    transition: Mutex<TransitionState>,
}

type ConsumerMap = Arc<Mutex<HashMap<(String, String), Arc<ConsumerEntry>>>>;

/// Shared context cloned into the ticker task
#[derive(Clone)]
struct CoordinatorCtx {
    leases: Arc<dyn LeaseStore>,
    delegate: Arc<dyn SubscriptionModel>,
    fencing: FencingTokens,
    config: CompetingConsumerConfig,
    status: broadcast::Sender<ConsumerStatus>,
}

/// Lease-based competing-consumer coordinator
pub struct CompetingConsumerCoordinator {
    ctx: CoordinatorCtx,
    consumers: ConsumerMap,
    ticker_stop: watch::Sender<bool>,
    ticker: StdMutex<Option<JoinHandle<()>>>,
}

impl CompetingConsumerCoordinator {
    /// Create a coordinator driving `delegate` under leases from `leases`
    ///
    /// `fencing` should be the registry consulted by the durable position
    /// store wrapper, so stale holders cannot commit positions.
    pub fn new(
        leases: Arc<dyn LeaseStore>,
        delegate: Arc<dyn SubscriptionModel>,
        fencing: FencingTokens,
        config: CompetingConsumerConfig,
    ) -> Self {
        let (ticker_stop, mut stop_rx) = watch::channel(false);
        let (status, _) = broadcast::channel(64);

        let ctx = CoordinatorCtx {
            leases,
            delegate,
            fencing,
            config,
            status,
        };

        let consumers: ConsumerMap = Arc::new(Mutex::new(HashMap::new()));

        let ticker_ctx = ctx.clone();
        let ticker_consumers = consumers.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ticker_ctx.config.refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {
                        let entries: Vec<Arc<ConsumerEntry>> = {
                            let map = ticker_consumers.lock().await;
                            map.values().cloned().collect()
                        };
                        for entry in entries {
                            tick_consumer(&ticker_ctx, &entry).await;
                        }
                    }
                }
            }
        });

        Self {
            ctx,
            consumers,
            ticker_stop,
            ticker: StdMutex::new(Some(ticker)),
        }
    }

    /// Register a competing subscriber and attempt acquisition immediately
    ///
    /// The delegate `subscribe` happens only once this subscriber is granted
    /// consumption; until then (and whenever the lease is lost) it waits.
    pub async fn subscribe(
        &self,
        subscription_id: &str,
        subscriber_id: &str,
        filter: Option<Filter>,
        start_at: StartAt,
        consumer: Arc<dyn EventConsumer>,
    ) -> OccurrentResult<()> {
        if subscription_id.is_empty() || subscriber_id.is_empty() {
            return Err(OccurrentError::InvalidArgument(
                "subscription id and subscriber id must not be empty".to_string(),
            ));
        }

        let key = (subscription_id.to_string(), subscriber_id.to_string());
        let entry = Arc::new(ConsumerEntry {
            subscription_id: subscription_id.to_string(),
            subscriber_id: subscriber_id.to_string(),
            transition: Mutex::new(TransitionState {
                state: ConsumerState::Waiting,
                subscribed: false,
                spec: SubscriptionSpec {
                    filter,
                    start_at,
                    consumer,
                },
            }),
        });

        {
            let mut map = self.consumers.lock().await;
            if map.contains_key(&key) {
                return Err(OccurrentError::InvalidArgument(format!(
                    "subscriber '{}' already competes for subscription '{}'",
                    subscriber_id, subscription_id
                )));
            }
            map.insert(key, entry.clone());
        }

        // Fast path so a single competitor starts without waiting a tick
        tick_consumer(&self.ctx, &entry).await;
        Ok(())
    }

    /// Stop competing; releases the lease so another subscriber can take
    /// over, leaving any persisted position in place
    pub async fn unregister(
        &self,
        subscription_id: &str,
        subscriber_id: &str,
    ) -> OccurrentResult<()> {
        let key = (subscription_id.to_string(), subscriber_id.to_string());
        let entry = { self.consumers.lock().await.remove(&key) };
        let Some(entry) = entry else {
            return Ok(());
        };

        // Apply the state change under the lock; the delegate and lease
        // round-trips happen after it is released
        let (was_running, pause_delegate) = {
            let mut transition = entry.transition.lock().await;
            let was_running = transition.state == ConsumerState::Running;
            if was_running {
                transition.state = ConsumerState::Paused;
                let _ = self.ctx.status.send(ConsumerStatus::Prohibited {
                    subscription_id: subscription_id.to_string(),
                    subscriber_id: subscriber_id.to_string(),
                });
            }
            (was_running, was_running && transition.subscribed)
        };

        if pause_delegate {
            if let Err(err) = self.ctx.delegate.pause(subscription_id).await {
                warn!("Could not pause subscription '{}': {}", subscription_id, err);
            }
        }
        if was_running {
            self.ctx
                .leases
                .release(subscription_id, subscriber_id)
                .await?;
            info!(
                "Subscriber '{}' released lease for '{}'",
                subscriber_id, subscription_id
            );
        }
        Ok(())
    }

    /// Current state of a registered consumer
    pub async fn state(
        &self,
        subscription_id: &str,
        subscriber_id: &str,
    ) -> Option<ConsumerState> {
        let key = (subscription_id.to_string(), subscriber_id.to_string());
        let entry = { self.consumers.lock().await.get(&key).cloned() }?;
        let transition = entry.transition.lock().await;
        Some(transition.state)
    }

    /// Listen for grant/prohibition messages
    pub fn status_listener(&self) -> broadcast::Receiver<ConsumerStatus> {
        self.ctx.status.subscribe()
    }

    /// Stop the ticker and unregister every consumer
    pub async fn shutdown(&self) {
        let _ = self.ticker_stop.send(true);
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticker) = ticker {
            let _ = ticker.await;
        }

        let keys: Vec<(String, String)> = {
            let map = self.consumers.lock().await;
            map.keys().cloned().collect()
        };
        for (subscription_id, subscriber_id) in keys {
            if let Err(err) = self.unregister(&subscription_id, &subscriber_id).await {
                warn!(
                    "Error unregistering '{}'/'{}' on shutdown: {}",
                    subscription_id, subscriber_id, err
                );
            }
        }
        info!("Competing-consumer coordinator shut down");
    }
}

/// What a granted consumer must do to drive the delegate, snapshotted
/// under the transition mutex so the call itself runs unlocked
enum GrantAction {
    Resume {
        previous: ConsumerState,
    },
    Subscribe {
        previous: ConsumerState,
        filter: Option<Filter>,
        start_at: StartAt,
        consumer: Arc<dyn EventConsumer>,
    },
}

/// One refresh/acquisition round for a single consumer
///
/// The transition mutex is never held across I/O: the lease outcome is
/// computed without it, the state change is applied atomically under it,
/// and the delegate round-trip runs unlocked with its outcome committed
/// (or rolled back) under a brief re-acquire.
async fn tick_consumer(ctx: &CoordinatorCtx, entry: &Arc<ConsumerEntry>) {
    let current = { entry.transition.lock().await.state };
    let subscription_id = entry.subscription_id.as_str();
    let subscriber_id = entry.subscriber_id.as_str();

    match current {
        ConsumerState::Running => {
            let refreshed = ctx
                .leases
                .refresh(subscription_id, subscriber_id, ctx.config.lease_duration)
                .await;

            match refreshed {
                Ok(version) => {
                    ctx.fencing.set(subscription_id, version);
                }
                Err(err) => {
                    if !matches!(err, OccurrentError::LostLease { .. }) {
                        warn!(
                            "Refresh failed for '{}'/'{}', treating lease as lost: {}",
                            subscription_id, subscriber_id, err
                        );
                    }
                    let pause_delegate = {
                        let mut transition = entry.transition.lock().await;
                        if transition.state != ConsumerState::Running {
                            return;
                        }
                        transition.state = ConsumerState::Paused;
                        let _ = ctx.status.send(ConsumerStatus::Prohibited {
                            subscription_id: subscription_id.to_string(),
                            subscriber_id: subscriber_id.to_string(),
                        });
                        transition.subscribed
                    };
                    if pause_delegate {
                        if let Err(err) = ctx.delegate.pause(subscription_id).await {
                            warn!(
                                "Could not pause subscription '{}': {}",
                                subscription_id, err
                            );
                        }
                    }
                    info!(
                        "Subscriber '{}' lost lease for '{}'",
                        subscriber_id, subscription_id
                    );
                }
            }
        }
        ConsumerState::Waiting | ConsumerState::Paused => {
            let acquired = ctx
                .leases
                .acquire_or_refresh(subscription_id, subscriber_id, ctx.config.lease_duration)
                .await;

            match acquired {
                Ok(Some(version)) => {
                    // Commit Running and snapshot the delegate work
                    let action = {
                        let mut transition = entry.transition.lock().await;
                        if transition.state == ConsumerState::Running {
                            return;
                        }
                        let previous = transition.state;
                        transition.state = ConsumerState::Running;
                        ctx.fencing.set(subscription_id, version);
                        let _ = ctx.status.send(ConsumerStatus::Granted {
                            subscription_id: subscription_id.to_string(),
                            subscriber_id: subscriber_id.to_string(),
                            lease_version: version,
                        });
                        if transition.subscribed {
                            GrantAction::Resume { previous }
                        } else {
                            GrantAction::Subscribe {
                                previous,
                                filter: transition.spec.filter.clone(),
                                start_at: transition.spec.start_at.clone(),
                                consumer: transition.spec.consumer.clone(),
                            }
                        }
                    };

                    // Drive the delegate with no lock held
                    let (previous, was_subscribe, outcome) = match action {
                        GrantAction::Resume { previous } => {
                            (previous, false, ctx.delegate.resume(subscription_id).await)
                        }
                        GrantAction::Subscribe {
                            previous,
                            filter,
                            start_at,
                            consumer,
                        } => (
                            previous,
                            true,
                            ctx.delegate
                                .subscribe(subscription_id, filter, start_at, consumer)
                                .await,
                        ),
                    };

                    match outcome {
                        Ok(()) => {
                            if was_subscribe {
                                let mut transition = entry.transition.lock().await;
                                transition.subscribed = true;
                            }
                            info!(
                                "Subscriber '{}' granted lease v{} for '{}'",
                                subscriber_id, version, subscription_id
                            );
                        }
                        Err(err) => {
                            warn!(
                                "Could not start subscription '{}' after grant, \
                                 surrendering the lease: {}",
                                subscription_id, err
                            );
                            // Roll back so the next tick retries the grant and
                            // a competitor can take over in the meantime
                            {
                                let mut transition = entry.transition.lock().await;
                                if transition.state == ConsumerState::Running {
                                    transition.state = previous;
                                    let _ = ctx.status.send(ConsumerStatus::Prohibited {
                                        subscription_id: subscription_id.to_string(),
                                        subscriber_id: subscriber_id.to_string(),
                                    });
                                }
                            }
                            if let Err(release_err) =
                                ctx.leases.release(subscription_id, subscriber_id).await
                            {
                                warn!(
                                    "Could not release lease for '{}'/'{}': {}",
                                    subscription_id, subscriber_id, release_err
                                );
                            }
                        }
                    }
                }
                Ok(None) => {
                    debug!(
                        "Subscriber '{}' waiting for lease on '{}'",
                        subscriber_id, subscription_id
                    );
                }
                Err(err) => {
                    warn!(
                        "Lease acquisition failed for '{}'/'{}': {}",
                        subscription_id, subscriber_id, err
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{FencingTokens, SubscriptionPosition};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Delegate whose `subscribe` fails the first `failures` times
    struct FlakyModel {
        failures_left: AtomicU32,
        subscribe_calls: AtomicU32,
        subscribed: AtomicBool,
        paused: AtomicBool,
    }

    impl FlakyModel {
        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicU32::new(failures),
                subscribe_calls: AtomicU32::new(0),
                subscribed: AtomicBool::new(false),
                paused: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl SubscriptionModel for FlakyModel {
        async fn subscribe(
            &self,
            _subscription_id: &str,
            _filter: Option<Filter>,
            _start_at: StartAt,
            _consumer: Arc<dyn EventConsumer>,
        ) -> OccurrentResult<()> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(OccurrentError::TransientIo(
                    "change stream unavailable".to_string(),
                ));
            }
            self.subscribed.store(true, Ordering::SeqCst);
            self.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn cancel(&self, _subscription_id: &str) -> OccurrentResult<()> {
            self.subscribed.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn pause(&self, _subscription_id: &str) -> OccurrentResult<()> {
            self.paused.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn resume(&self, _subscription_id: &str) -> OccurrentResult<()> {
            self.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) {}

        async fn global_subscription_position(&self) -> OccurrentResult<SubscriptionPosition> {
            Ok(SubscriptionPosition::Offset(0))
        }
    }

    struct NoopConsumer;

    #[async_trait]
    impl EventConsumer for NoopConsumer {
        async fn consume(
            &self,
            _event: crate::subscription::PositionedEvent,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_delegate_subscribe_rolls_back_and_releases_lease() {
        let leases = Arc::new(InMemoryLeaseStore::new());
        let delegate = FlakyModel::failing(u32::MAX);

        // A refresh interval far in the future: only the registration-time
        // acquisition attempt runs
        let config = CompetingConsumerConfig {
            lease_duration: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(3600),
        };
        let coordinator = CompetingConsumerCoordinator::new(
            leases.clone(),
            delegate.clone(),
            FencingTokens::default(),
            config,
        );

        coordinator
            .subscribe("game", "p1", None, StartAt::Default, Arc::new(NoopConsumer))
            .await
            .unwrap();

        // The grant was rolled back: not Running, nothing subscribed
        assert_eq!(
            coordinator.state("game", "p1").await,
            Some(ConsumerState::Waiting)
        );
        assert!(!delegate.subscribed.load(Ordering::SeqCst));

        // The lease was surrendered, so a competitor acquires immediately
        assert_eq!(
            leases
                .acquire_or_refresh("game", "p2", Duration::from_secs(5))
                .await
                .unwrap(),
            Some(1)
        );

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_grant_is_retried_until_delegate_subscribe_succeeds() {
        let leases = Arc::new(InMemoryLeaseStore::new());
        let delegate = FlakyModel::failing(2);

        let config = CompetingConsumerConfig {
            lease_duration: Duration::from_millis(200),
            refresh_interval: Duration::from_millis(20),
        };
        let coordinator = CompetingConsumerCoordinator::new(
            leases.clone(),
            delegate.clone(),
            FencingTokens::default(),
            config,
        );

        coordinator
            .subscribe("game", "p1", None, StartAt::Default, Arc::new(NoopConsumer))
            .await
            .unwrap();

        for _ in 0..200 {
            if coordinator.state("game", "p1").await == Some(ConsumerState::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(
            coordinator.state("game", "p1").await,
            Some(ConsumerState::Running)
        );
        assert!(delegate.subscribed.load(Ordering::SeqCst));
        assert!(delegate.subscribe_calls.load(Ordering::SeqCst) >= 3);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_then_competitor_is_rejected() {
        let store = InMemoryLeaseStore::new();
        let duration = Duration::from_secs(1);

        let v1 = store.acquire_or_refresh("s", "p1", duration).await.unwrap();
        assert_eq!(v1, Some(1));

        let v2 = store.acquire_or_refresh("s", "p2", duration).await.unwrap();
        assert_eq!(v2, None);

        // The holder can re-acquire without a version bump
        let again = store.acquire_or_refresh("s", "p1", duration).await.unwrap();
        assert_eq!(again, Some(1));
    }

    #[tokio::test]
    async fn test_takeover_after_expiry_bumps_version() {
        let store = InMemoryLeaseStore::new();
        let short = Duration::from_millis(10);

        assert_eq!(
            store.acquire_or_refresh("s", "p1", short).await.unwrap(),
            Some(1)
        );
        tokio::time::sleep(Duration::from_millis(30)).await;

        let v2 = store
            .acquire_or_refresh("s", "p2", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(v2, Some(2));

        // Fencing version is strictly monotonic across ownership changes
        tokio::time::sleep(Duration::from_millis(1)).await;
        let err = store.refresh("s", "p1", short).await.unwrap_err();
        assert!(matches!(err, OccurrentError::LostLease { .. }));
    }

    #[tokio::test]
    async fn test_release_only_by_owner() {
        let store = InMemoryLeaseStore::new();
        let duration = Duration::from_secs(1);

        store.acquire_or_refresh("s", "p1", duration).await.unwrap();
        store.release("s", "p2").await.unwrap();
        // p1 still owns it
        assert_eq!(
            store.acquire_or_refresh("s", "p2", duration).await.unwrap(),
            None
        );

        // Releasing deletes the lease; the next acquisition starts a fresh
        // ownership history
        store.release("s", "p1").await.unwrap();
        assert_eq!(
            store.acquire_or_refresh("s", "p2", duration).await.unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_refresh_extends_expiry() {
        let store = InMemoryLeaseStore::new();
        let duration = Duration::from_millis(50);

        store.acquire_or_refresh("s", "p1", duration).await.unwrap();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store.refresh("s", "p1", duration).await.unwrap();
        }
        // Still held well past the original duration
        assert_eq!(
            store
                .acquire_or_refresh("s", "p2", Duration::from_secs(1))
                .await
                .unwrap(),
            None
        );
    }
}
