// Copyright (c) 2025 - Cowboy AI, Inc.
//! Durable subscriptions
//!
//! [`DurableSubscriptionModel`] wraps any subscription model and persists
//! the position of each successfully delivered event (or every N-th) to a
//! [`SubscriptionPositionStore`]. Subscribing with [`StartAt::Default`]
//! resumes from the persisted position; when none exists, the model persists
//! the current global position and starts from it. Cancelling deletes the
//! persisted position.
//!
//! A successful callback implies its position is persistable: when
//! persistence fails, the delivery is reported as failed so the position is
//! not committed and the event is re-delivered on restart. This is the
//! at-least-once contract.
//!
//! Position writes carry an optional fencing token (the competing-consumer
//! lease version); the store rejects writes with a stale token so a
//! split-brain consumer cannot corrupt the persisted position.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use bson::{doc, Document};
use mongodb::{Collection, Database};
use tracing::{debug, info};

use crate::errors::{OccurrentError, OccurrentResult};
use crate::filter::Filter;
use crate::store::mongo::duplicate_key;
use crate::subscription::{
    EventConsumer, PositionedEvent, StartAt, SubscriptionModel, SubscriptionPosition,
};

/// Persistence for subscription positions, keyed by subscription id
#[async_trait]
pub trait SubscriptionPositionStore: Send + Sync {
    /// The last persisted position, if any
    async fn read(&self, subscription_id: &str) -> OccurrentResult<Option<SubscriptionPosition>>;

    /// Persist a position
    ///
    /// With a `lease_version`, the write is conditional: a stored version
    /// greater than the given one means another subscriber has taken over
    /// and the write fails with `LostLease`.
    async fn save(
        &self,
        subscription_id: &str,
        position: &SubscriptionPosition,
        lease_version: Option<u64>,
    ) -> OccurrentResult<()>;

    /// Forget the position
    async fn delete(&self, subscription_id: &str) -> OccurrentResult<()>;
}

/// Shared map of current lease versions, written by the competing-consumer
/// coordinator and read on every position persist
#[derive(Clone, Default)]
pub struct FencingTokens {
    inner: Arc<StdMutex<HashMap<String, u64>>>,
}

impl FencingTokens {
    /// Record the lease version for a subscription
    pub fn set(&self, subscription_id: &str, version: u64) {
        self.lock().insert(subscription_id.to_string(), version);
    }

    /// Forget the lease version for a subscription
    pub fn clear(&self, subscription_id: &str) {
        self.lock().remove(subscription_id);
    }

    /// The current lease version for a subscription
    pub fn get(&self, subscription_id: &str) -> Option<u64> {
        self.lock().get(subscription_id).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// MongoDB-backed position store
///
/// Documents: `{_id: subscriptionId, position, leaseVersion?}`.
pub struct MongoSubscriptionPositionStore {
    positions: Collection<Document>,
}

impl MongoSubscriptionPositionStore {
    /// Create a store over the given collection
    pub fn new(database: &Database, collection_name: &str) -> OccurrentResult<Self> {
        if collection_name.is_empty() {
            return Err(OccurrentError::InvalidArgument(
                "position collection name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            positions: database.collection::<Document>(collection_name),
        })
    }
}

#[async_trait]
impl SubscriptionPositionStore for MongoSubscriptionPositionStore {
    async fn read(&self, subscription_id: &str) -> OccurrentResult<Option<SubscriptionPosition>> {
        let Some(mut document) = self
            .positions
            .find_one(doc! { "_id": subscription_id })
            .await?
        else {
            return Ok(None);
        };
        match document.remove("position") {
            Some(position) => Ok(Some(bson::from_bson(position)?)),
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        subscription_id: &str,
        position: &SubscriptionPosition,
        lease_version: Option<u64>,
    ) -> OccurrentResult<()> {
        let encoded = bson::to_bson(position)?;

        let Some(version) = lease_version else {
            self.positions
                .update_one(
                    doc! { "_id": subscription_id },
                    doc! { "$set": { "position": encoded } },
                )
                .upsert(true)
                .await?;
            return Ok(());
        };

        // Conditional on the fencing token: a stored version greater than
        // ours means the lease moved on
        let filter = doc! {
            "_id": subscription_id,
            "$or": [
                { "leaseVersion": { "$exists": false } },
                { "leaseVersion": { "$lte": version as i64 } },
            ],
        };
        let update = doc! {
            "$set": { "position": encoded, "leaseVersion": version as i64 },
        };

        match self.positions.update_one(filter, update).upsert(true).await {
            Ok(result) if result.matched_count > 0 || result.upserted_id.is_some() => Ok(()),
            Ok(_) => Err(OccurrentError::LostLease {
                subscription_id: subscription_id.to_string(),
            }),
            // The guarded upsert races on _id when the stored version is
            // newer; the duplicate key means we lost
            Err(error) if duplicate_key(&error).is_some() => Err(OccurrentError::LostLease {
                subscription_id: subscription_id.to_string(),
            }),
            Err(error) => Err(error.into()),
        }
    }

    async fn delete(&self, subscription_id: &str) -> OccurrentResult<()> {
        self.positions
            .delete_one(doc! { "_id": subscription_id })
            .await?;
        Ok(())
    }
}

/// In-memory position store for tests and the in-memory stack
#[derive(Default)]
pub struct InMemorySubscriptionPositionStore {
    inner: StdMutex<HashMap<String, (SubscriptionPosition, Option<u64>)>>,
}

impl InMemorySubscriptionPositionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionPositionStore for InMemorySubscriptionPositionStore {
    async fn read(&self, subscription_id: &str) -> OccurrentResult<Option<SubscriptionPosition>> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subscription_id)
            .map(|(position, _)| position.clone()))
    }

    async fn save(
        &self,
        subscription_id: &str,
        position: &SubscriptionPosition,
        lease_version: Option<u64>,
    ) -> OccurrentResult<()> {
        let mut positions = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let (Some(version), Some((_, Some(stored)))) =
            (lease_version, positions.get(subscription_id))
        {
            if *stored > version {
                return Err(OccurrentError::LostLease {
                    subscription_id: subscription_id.to_string(),
                });
            }
        }
        positions.insert(
            subscription_id.to_string(),
            (position.clone(), lease_version),
        );
        Ok(())
    }

    async fn delete(&self, subscription_id: &str) -> OccurrentResult<()> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subscription_id);
        Ok(())
    }
}

/// Subscription model wrapper that persists positions across restarts
pub struct DurableSubscriptionModel {
    delegate: Arc<dyn SubscriptionModel>,
    positions: Arc<dyn SubscriptionPositionStore>,
    persist_every: u64,
    fencing: FencingTokens,
}

impl DurableSubscriptionModel {
    /// Wrap a model, persisting every delivered position
    pub fn new(
        delegate: Arc<dyn SubscriptionModel>,
        positions: Arc<dyn SubscriptionPositionStore>,
    ) -> Self {
        Self {
            delegate,
            positions,
            persist_every: 1,
            fencing: FencingTokens::default(),
        }
    }

    /// Persist only every `n`-th position (n ≥ 1)
    ///
    /// Re-delivery after a restart grows to at most `n - 1` events.
    pub fn with_position_persistence_every(mut self, n: u64) -> Self {
        self.persist_every = n.max(1);
        self
    }

    /// The fencing-token registry consulted on every position write
    pub fn fencing_tokens(&self) -> FencingTokens {
        self.fencing.clone()
    }
}

struct PersistingConsumer {
    subscription_id: String,
    inner: Arc<dyn EventConsumer>,
    positions: Arc<dyn SubscriptionPositionStore>,
    persist_every: u64,
    delivered: AtomicU64,
    fencing: FencingTokens,
}

#[async_trait]
impl EventConsumer for PersistingConsumer {
    async fn consume(&self, event: PositionedEvent) -> anyhow::Result<()> {
        let position = event.position.clone();
        self.inner.consume(event).await?;

        let delivered = self.delivered.fetch_add(1, Ordering::SeqCst) + 1;
        if delivered % self.persist_every != 0 {
            return Ok(());
        }

        // A failed persist fails the delivery: the position is only
        // committed once it is durable
        self.positions
            .save(
                &self.subscription_id,
                &position,
                self.fencing.get(&self.subscription_id),
            )
            .await?;
        debug!(
            "Subscription '{}': persisted position after {} deliveries",
            self.subscription_id, delivered
        );
        Ok(())
    }
}

#[async_trait]
impl SubscriptionModel for DurableSubscriptionModel {
    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: Option<Filter>,
        start_at: StartAt,
        consumer: Arc<dyn EventConsumer>,
    ) -> OccurrentResult<()> {
        let start_at = match start_at {
            StartAt::Default => match self.positions.read(subscription_id).await? {
                Some(position) => {
                    info!(
                        "Subscription '{}' resuming from persisted position",
                        subscription_id
                    );
                    StartAt::Position(position)
                }
                None => {
                    let position = self.delegate.global_subscription_position().await?;
                    self.positions
                        .save(
                            subscription_id,
                            &position,
                            self.fencing.get(subscription_id),
                        )
                        .await?;
                    StartAt::Position(position)
                }
            },
            explicit => explicit,
        };

        let persisting = Arc::new(PersistingConsumer {
            subscription_id: subscription_id.to_string(),
            inner: consumer,
            positions: self.positions.clone(),
            persist_every: self.persist_every,
            delivered: AtomicU64::new(0),
            fencing: self.fencing.clone(),
        });

        self.delegate
            .subscribe(subscription_id, filter, start_at, persisting)
            .await
    }

    async fn cancel(&self, subscription_id: &str) -> OccurrentResult<()> {
        self.delegate.cancel(subscription_id).await?;
        self.positions.delete(subscription_id).await?;
        info!(
            "Subscription '{}' cancelled and persisted position deleted",
            subscription_id
        );
        Ok(())
    }

    async fn pause(&self, subscription_id: &str) -> OccurrentResult<()> {
        self.delegate.pause(subscription_id).await
    }

    async fn resume(&self, subscription_id: &str) -> OccurrentResult<()> {
        self.delegate.resume(subscription_id).await
    }

    async fn shutdown(&self) {
        self.delegate.shutdown().await;
    }

    async fn global_subscription_position(&self) -> OccurrentResult<SubscriptionPosition> {
        self.delegate.global_subscription_position().await
    }
}
