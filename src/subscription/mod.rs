// Copyright (c) 2025 - Cowboy AI, Inc.
//! Position-aware subscriptions
//!
//! A subscription is a named long-running consumer of the store's change
//! feed. Each delivered event is annotated with an opaque
//! [`SubscriptionPosition`] that can be persisted and later handed back via
//! [`StartAt::Position`] to resume past already-delivered events.
//!
//! # Architecture
//!
//! ```text
//! change feed ──→ worker task ──→ filter check ──→ retry ──→ consumer
//!                     │ (one per subscription, sequential callbacks)
//!                     └──→ restart position
//! ```
//!
//! Delivery is strictly ordered by global position within a subscription;
//! workers for different subscriptions run in parallel. Cancellation is
//! cooperative: after `cancel` no new callbacks are delivered, and an
//! in-flight callback is allowed to complete.
//!
//! Layered on the base models:
//!
//! - [`DurableSubscriptionModel`] persists positions across restarts
//! - [`CatchupSubscriptionModel`] replays history before joining the feed

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::errors::OccurrentResult;
use crate::event::CloudEvent;
use crate::filter::Filter;
use crate::retry::RetryStrategy;

pub mod catchup;
pub mod durable;
pub mod memory;
pub mod mongo;

pub use catchup::{CatchupConfig, CatchupSubscriptionModel};
pub use durable::{
    DurableSubscriptionModel, FencingTokens, InMemorySubscriptionPositionStore,
    MongoSubscriptionPositionStore, SubscriptionPositionStore,
};
pub use memory::InMemorySubscriptionModel;
pub use mongo::{MongoSubscriptionModel, MongoSubscriptionModelConfig};

/// Opaque token addressing a point in the event feed
///
/// Issued by the backend a subscription runs against; hand it back via
/// [`StartAt::Position`] to resume without re-delivering what came before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubscriptionPosition {
    /// MongoDB change-stream resume token
    ResumeToken(bson::Document),
    /// MongoDB cluster operation time
    OperationTime(bson::Timestamp),
    /// Global offset in the in-memory store's log
    Offset(u64),
    /// Wall-clock position used during catch-up replay
    Time(DateTime<Utc>),
}

/// Where a subscription starts delivering
#[derive(Debug, Clone, PartialEq, Default)]
pub enum StartAt {
    /// Let a wrapping model decide: resume from a persisted position when
    /// one exists, otherwise start at now
    #[default]
    Default,
    /// Only events written after the subscription is established
    Now,
    /// Every event ever stored (requires a model that can replay history)
    BeginningOfTime,
    /// Events past the given position
    Position(SubscriptionPosition),
}

/// A CloudEvent annotated with its resumable position
#[derive(Debug, Clone)]
pub struct PositionedEvent {
    /// The delivered event
    pub event: CloudEvent,
    /// Position to resume from after this event
    pub position: SubscriptionPosition,
}

/// Receiver of subscription deliveries
///
/// Callbacks for one subscription are never invoked concurrently.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Handle one delivered event
    ///
    /// Returning an error triggers the subscription's retry strategy; the
    /// position does not advance until the delivery succeeds.
    async fn consume(&self, event: PositionedEvent) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`EventConsumer`]
pub struct FnConsumer {
    f: Box<dyn Fn(PositionedEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>,
}

impl FnConsumer {
    /// Wrap a closure returning a future
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(PositionedEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            f: Box::new(move |event| Box::pin(f(event))),
        }
    }
}

#[async_trait]
impl EventConsumer for FnConsumer {
    async fn consume(&self, event: PositionedEvent) -> anyhow::Result<()> {
        (self.f)(event).await
    }
}

/// Lifecycle state of a registered subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Worker attached to the feed, delivering events
    Running,
    /// Registered but detached; `resume` re-attaches from the restart
    /// position
    Paused,
}

/// Subscription management contract shared by all models
///
/// Implementations keep a registry keyed by `subscription_id`; a paused
/// subscription keeps its registration (filter, consumer, restart position)
/// and can be resumed without re-subscribing.
#[async_trait]
pub trait SubscriptionModel: Send + Sync {
    /// Start a subscription
    ///
    /// `action` receives every event matching `filter` (all events when
    /// `None`), in ascending global position, each annotated with its
    /// position.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if the id is empty, already subscribed, or the
    ///   start position is not supported by this model
    /// - `SubscriptionShutdown` after `shutdown`
    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: Option<Filter>,
        start_at: StartAt,
        consumer: Arc<dyn EventConsumer>,
    ) -> OccurrentResult<()>;

    /// Cancel and forget a subscription
    ///
    /// No new callbacks are delivered after this returns; an in-flight
    /// callback completes first.
    async fn cancel(&self, subscription_id: &str) -> OccurrentResult<()>;

    /// Detach a subscription's worker, keeping its registration
    async fn pause(&self, subscription_id: &str) -> OccurrentResult<()>;

    /// Re-attach a paused subscription from its restart position
    async fn resume(&self, subscription_id: &str) -> OccurrentResult<()>;

    /// Cancel every subscription and refuse further operations
    async fn shutdown(&self);

    /// A position representing "now"
    ///
    /// A subscription started from the returned token does not re-deliver
    /// events observed before this call.
    async fn global_subscription_position(&self) -> OccurrentResult<SubscriptionPosition>;
}

/// Deliver one event through the retry strategy
///
/// Returns whether the delivery eventually succeeded. On exhaustion the
/// event is dropped and the caller must not advance the position.
pub(crate) async fn deliver_with_retry(
    subscription_id: &str,
    consumer: &Arc<dyn EventConsumer>,
    retry: &RetryStrategy,
    event: PositionedEvent,
) -> bool {
    let result = retry
        .execute(|| {
            let event = event.clone();
            async move { consumer.consume(event).await }
        })
        .await;

    match result {
        Ok(()) => true,
        Err(err) => {
            error!(
                "Subscription '{}': dropping event '{}' after exhausted retries: {}",
                subscription_id, event.event.id, err
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_consumer_invokes_closure() {
        let consumer = FnConsumer::new(|event: PositionedEvent| async move {
            assert_eq!(event.event.id, "e1");
            Ok(())
        });

        let event = PositionedEvent {
            event: CloudEvent::builder("e1", "urn:test", "T").build().unwrap(),
            position: SubscriptionPosition::Offset(1),
        };
        consumer.consume(event).await.unwrap();
    }

    #[test]
    fn test_position_serialization_round_trip() {
        let positions = vec![
            SubscriptionPosition::Offset(42),
            SubscriptionPosition::OperationTime(bson::Timestamp {
                time: 7,
                increment: 3,
            }),
            SubscriptionPosition::Time(Utc::now()),
            SubscriptionPosition::ResumeToken(bson::doc! { "_data": "abc" }),
        ];

        for position in positions {
            let encoded = bson::to_bson(&position).unwrap();
            let decoded: SubscriptionPosition = bson::from_bson(encoded).unwrap();
            assert_eq!(decoded, position);
        }
    }
}
