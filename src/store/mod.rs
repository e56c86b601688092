// Copyright (c) 2025 - Cowboy AI, Inc.
//! Event stream storage
//!
//! This module defines the storage interface for CloudEvent streams:
//! append-only per-stream persistence with optimistic concurrency on a
//! dense, 1-based stream version, plus query/delete/update across streams
//! by attribute filter.
//!
//! # Architecture
//!
//! ```text
//! Writer → EventStore::write ──→ event documents (streamid, streamversion)
//!                                      ↓
//!                               change feed → subscriptions
//! ```
//!
//! Two implementations share the contract: [`MongoEventStore`] against a
//! MongoDB collection and [`InMemoryEventStore`] for tests and small
//! deployments.
//!
//! # Example
//!
//! ```rust,no_run
//! use occurrent::store::{EventStore, WriteCondition};
//! use occurrent::event::CloudEvent;
//!
//! # async fn example(store: impl EventStore) -> occurrent::errors::OccurrentResult<()> {
//! let event = CloudEvent::builder("1", "urn:game", "GameStarted").build()?;
//! store
//!     .write_conditionally("game-42", WriteCondition::stream_version_eq(0), vec![event])
//!     .await?;
//!
//! let stream = store.read("game-42", 0, None).await?;
//! assert_eq!(stream.version, 1);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::condition::Condition;
use crate::errors::OccurrentResult;
use crate::event::CloudEvent;
use crate::filter::Filter;

pub mod memory;
pub mod mongo;

pub use memory::InMemoryEventStore;
pub use mongo::{MongoEventStore, MongoEventStoreConfig, StreamConsistencyGuarantee};

/// Lazy sequence of events; the iterator owns the backend cursor and closes
/// it when dropped
pub type EventIterator = BoxStream<'static, OccurrentResult<CloudEvent>>;

/// The result of reading one event stream
pub struct EventStream {
    /// The stream id
    pub id: String,
    /// Current version: the highest `streamversion`, or 0 for an empty stream
    pub version: u64,
    /// Events in ascending `streamversion` order
    pub events: EventIterator,
}

impl EventStream {
    /// Whether the stream has no events
    pub fn is_empty(&self) -> bool {
        self.version == 0
    }

    /// Collect the remaining events into memory
    pub async fn collect(self) -> OccurrentResult<Vec<CloudEvent>> {
        use futures::TryStreamExt;
        self.events.try_collect().await
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish()
    }
}

/// Predicate over the current stream version gating an append
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCondition {
    /// Append regardless of the current version
    AnyStreamVersion,
    /// Append only if the current version satisfies the condition
    StreamVersion(Condition<u64>),
}

impl WriteCondition {
    /// Require the current version to equal `version` exactly
    pub fn stream_version_eq(version: u64) -> Self {
        WriteCondition::StreamVersion(Condition::eq(version))
    }

    /// Human-readable description used in failure messages
    pub fn description(&self) -> String {
        match self {
            WriteCondition::AnyStreamVersion => "any".to_string(),
            WriteCondition::StreamVersion(condition) => condition.description(),
        }
    }

    /// Evaluate against a current stream version
    pub fn is_fulfilled_by(&self, current_version: u64) -> bool {
        match self {
            WriteCondition::AnyStreamVersion => true,
            WriteCondition::StreamVersion(condition) => condition.evaluate(&current_version),
        }
    }
}

/// Sort order for cross-stream queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    /// Ascending global position (insertion order)
    #[default]
    NaturalAsc,
    /// Descending global position
    NaturalDesc,
    /// Ascending occurrence time
    TimeAsc,
    /// Descending occurrence time
    TimeDesc,
}

/// Pagination and ordering for [`EventStore::query`]
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Number of matching events to skip
    pub skip: u64,
    /// Maximum number of events to return
    pub limit: Option<u64>,
    /// Sort order
    pub sort: SortBy,
}

impl QueryOptions {
    /// Skip the first `skip` matching events
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    /// Return at most `limit` events
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Order the results
    pub fn sort(mut self, sort: SortBy) -> Self {
        self.sort = sort;
        self
    }
}

/// Event stream storage contract
///
/// Implementations must guarantee:
///
/// - **Atomicity**: a multi-event append succeeds or fails as a unit
/// - **Dense versioning**: within a stream, versions are 1,2,…,N with no
///   gaps or duplicates (gaps may appear later through `delete`)
/// - **Uniqueness**: `(id, source)` is unique across the store
/// - **Order**: readers observe ascending `streamversion` within a stream
///   and ascending global position across streams
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Read a stream, optionally skipping and limiting events
    ///
    /// An absent stream yields `version = 0` and no events.
    async fn read(
        &self,
        stream_id: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> OccurrentResult<EventStream>;

    /// Append events with the `any-version` write condition
    ///
    /// Returns the stream version after the append.
    async fn write(&self, stream_id: &str, events: Vec<CloudEvent>) -> OccurrentResult<u64> {
        self.write_conditionally(stream_id, WriteCondition::AnyStreamVersion, events)
            .await
    }

    /// Append events only if the current version satisfies the condition
    ///
    /// On success the events are assigned versions `current+1 ..= current+N`
    /// and inserted atomically. On a failed condition the error carries the
    /// condition's description and the observed version.
    ///
    /// # Errors
    ///
    /// - `WriteConditionNotFulfilled` when the version check fails (also for
    ///   concurrent writers losing the `(streamid, streamversion)` race)
    /// - `DuplicateEvent` when `(id, source)` already exists
    /// - `TransientIo` when the backend is unreachable
    async fn write_conditionally(
        &self,
        stream_id: &str,
        condition: WriteCondition,
        events: Vec<CloudEvent>,
    ) -> OccurrentResult<u64>;

    /// Whether any event belongs to the stream
    async fn exists(&self, stream_id: &str) -> OccurrentResult<bool>;

    /// Query events across all streams by attribute filter
    async fn query(&self, filter: Filter, options: QueryOptions)
        -> OccurrentResult<EventIterator>;

    /// Number of events matching the filter
    async fn count(&self, filter: Filter) -> OccurrentResult<u64>;

    /// Delete every event matching the filter
    ///
    /// Surviving events keep their original `streamversion`; gaps become
    /// visible to `read`. Returns the number of deleted events.
    async fn delete(&self, filter: Filter) -> OccurrentResult<u64>;

    /// Delete all events of a stream; a subsequent `read` yields version 0
    /// and appends restart at version 1
    async fn delete_stream(&self, stream_id: &str) -> OccurrentResult<u64>;

    /// Delete a single event identified by `(id, source)`
    ///
    /// Returns whether an event was deleted.
    async fn delete_event(&self, id: &str, source: &str) -> OccurrentResult<bool>;

    /// Apply a pure transformation to a stored event, in place
    ///
    /// Returns the updated event, or `None` if no event matched.
    async fn update_event(
        &self,
        id: &str,
        source: &str,
        f: Box<dyn FnOnce(CloudEvent) -> CloudEvent + Send>,
    ) -> OccurrentResult<Option<CloudEvent>>;
}
