//! Event sourcing for CloudEvents on MongoDB
//!
//! This library persists CloudEvents into append-only streams with
//! optimistic concurrency, pushes new events to subscriptions over the
//! store's change feed, and coordinates competing consumers with leases:
//!
//! - **Event store**: per-stream append gated by a write condition over the
//!   dense 1-based stream version, plus query/delete/update across streams
//!   by attribute filter
//! - **Subscriptions**: resumable, position-annotated delivery with
//!   filtering and retry; durable and catch-up wrappers layer persistence
//!   and historical replay on top
//! - **Competing consumers**: lease-based single-consumer-per-subscription
//!   selection across processes, with fencing tokens and automatic failover
//!
//! # Architecture
//!
//! ```text
//! write ──→ EventStore ──→ event documents (streamid, streamversion)
//!                               ↓ change feed
//!            SubscriptionModel ──→ Durable ──→ Catchup ──→ consumer
//!                               ↑
//!            CompetingConsumerCoordinator (leases, fencing)
//! ```
//!
//! # Modules
//!
//! - [`event`] - CloudEvent envelope and attribute values
//! - [`condition`] - comparison/composition condition DSL
//! - [`filter`] - attribute filters with backend and in-memory lowerings
//! - [`document`] - CloudEvent ↔ BSON document mapping
//! - [`store`] - event stream storage (MongoDB and in-memory)
//! - [`subscription`] - position-aware subscription models and wrappers
//! - [`competing`] - lease-based competing-consumer coordination
//! - [`retry`] - retry strategies
//! - [`errors`] - error types
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use occurrent::event::CloudEvent;
//! use occurrent::store::{EventStore, MongoEventStore, MongoEventStoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoEventStore::connect(
//!         "mongodb://localhost:27017",
//!         "occurrent",
//!         MongoEventStoreConfig::default(),
//!     )
//!     .await?;
//!
//!     let event = CloudEvent::builder("1", "urn:game", "GameStarted").build()?;
//!     store.write("game-42", vec![event]).await?;
//!
//!     let stream = store.read("game-42", 0, None).await?;
//!     assert_eq!(stream.version, 1);
//!
//!     Ok(())
//! }
//! ```

// Core modules
pub mod competing;
pub mod condition;
pub mod document;
pub mod errors;
pub mod event;
pub mod filter;
pub mod retry;
pub mod store;
pub mod subscription;

// Re-export commonly used types
pub use competing::{
    CompetingConsumerConfig, CompetingConsumerCoordinator, ConsumerState, ConsumerStatus,
    InMemoryLeaseStore, Lease, LeaseStore, MongoLeaseStore,
};
pub use condition::Condition;
pub use document::{EventFormat, TimeRepresentation};
pub use errors::{OccurrentError, OccurrentResult};
pub use event::{AttributeValue, CloudEvent, EventData};
pub use filter::Filter;
pub use retry::RetryStrategy;
pub use store::{
    EventStore, EventStream, InMemoryEventStore, MongoEventStore, MongoEventStoreConfig,
    QueryOptions, SortBy, StreamConsistencyGuarantee, WriteCondition,
};
pub use subscription::{
    CatchupConfig, CatchupSubscriptionModel, DurableSubscriptionModel, EventConsumer, FnConsumer,
    InMemorySubscriptionModel, InMemorySubscriptionPositionStore, MongoSubscriptionModel,
    MongoSubscriptionModelConfig, MongoSubscriptionPositionStore, PositionedEvent, StartAt,
    SubscriptionModel, SubscriptionPosition, SubscriptionPositionStore,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
