// Copyright (c) 2025 - Cowboy AI, Inc.
//! In-memory reference event store
//!
//! Implements the full [`EventStore`] contract against an ordered in-process
//! log guarded by a monitor, for tests and small deployments. Stream
//! versions are derived from the surviving events, so deleting a whole
//! stream naturally resets it to version 0.
//!
//! Every successful append is fanned out on a broadcast channel so the
//! in-memory subscription model can deliver it; see
//! [`InMemoryEventStore::subscribe_changes`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::broadcast;

use crate::errors::{OccurrentError, OccurrentResult};
use crate::event::CloudEvent;
use crate::filter::Filter;
use crate::store::{
    EventIterator, EventStore, EventStream, QueryOptions, SortBy, WriteCondition,
};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// An event together with its engine-assigned global position
#[derive(Debug, Clone)]
pub struct StoredChange {
    /// The stored event, carrying its stream coordinates
    pub event: CloudEvent,
    /// Opaque, strictly increasing global position
    pub position: u64,
}

struct LogEntry {
    position: u64,
    event: CloudEvent,
}

struct Inner {
    log: Vec<LogEntry>,
    next_position: u64,
}

impl Inner {
    fn current_version(&self, stream_id: &str) -> u64 {
        self.log
            .iter()
            .filter(|e| e.event.stream_id() == Some(stream_id))
            .filter_map(|e| e.event.stream_version())
            .max()
            .unwrap_or(0)
    }
}

/// In-memory event store with an internal change feed
#[derive(Clone)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<Inner>>,
    changes: broadcast::Sender<StoredChange>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                log: Vec::new(),
                next_position: 1,
            })),
            changes,
        }
    }

    /// Subscribe to the in-process change feed
    ///
    /// Receives every event appended after the call, in global-position
    /// order. A lagging receiver can resynchronize from
    /// [`InMemoryEventStore::changes_since`].
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoredChange> {
        self.changes.subscribe()
    }

    /// The highest global position assigned so far (0 when empty)
    pub fn current_global_position(&self) -> u64 {
        self.lock().next_position - 1
    }

    /// Snapshot of all stored events with a global position greater than
    /// `position`, in ascending order
    pub fn changes_since(&self, position: u64) -> Vec<StoredChange> {
        self.lock()
            .log
            .iter()
            .filter(|e| e.position > position)
            .map(|e| StoredChange {
                event: e.event.clone(),
                position: e.position,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sorted(mut matches: Vec<StoredChange>, sort: SortBy) -> Vec<StoredChange> {
    match sort {
        SortBy::NaturalAsc => {}
        SortBy::NaturalDesc => matches.reverse(),
        SortBy::TimeAsc => {
            matches.sort_by_key(|c| (c.event.time.and_then(|t| t.timestamp_nanos_opt()), c.position))
        }
        SortBy::TimeDesc => {
            matches.sort_by_key(|c| (c.event.time.and_then(|t| t.timestamp_nanos_opt()), c.position));
            matches.reverse();
        }
    }
    matches
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn read(
        &self,
        stream_id: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> OccurrentResult<EventStream> {
        let inner = self.lock();
        let version = inner.current_version(stream_id);
        let events: Vec<CloudEvent> = inner
            .log
            .iter()
            .filter(|e| e.event.stream_id() == Some(stream_id))
            .map(|e| e.event.clone())
            .skip(skip as usize)
            .take(limit.map(|l| l as usize).unwrap_or(usize::MAX))
            .collect();

        Ok(EventStream {
            id: stream_id.to_string(),
            version,
            events: Box::pin(stream::iter(events.into_iter().map(Ok))),
        })
    }

    async fn write_conditionally(
        &self,
        stream_id: &str,
        condition: WriteCondition,
        events: Vec<CloudEvent>,
    ) -> OccurrentResult<u64> {
        if stream_id.is_empty() {
            return Err(OccurrentError::InvalidArgument(
                "stream id must not be empty".to_string(),
            ));
        }

        let mut inner = self.lock();
        let current = inner.current_version(stream_id);

        if !condition.is_fulfilled_by(current) {
            return Err(OccurrentError::WriteConditionNotFulfilled {
                condition: condition.description(),
                actual: current,
            });
        }

        // (id, source) uniqueness across the store and within the batch
        let mut batch_keys = HashSet::new();
        for event in &events {
            let key = (event.id.clone(), event.source.clone());
            let duplicate_in_log = inner
                .log
                .iter()
                .any(|e| e.event.id == event.id && e.event.source == event.source);
            if duplicate_in_log || !batch_keys.insert(key) {
                return Err(OccurrentError::DuplicateEvent {
                    id: event.id.clone(),
                    event_source: event.source.clone(),
                });
            }
        }

        let mut version = current;
        for event in events {
            version += 1;
            let position = inner.next_position;
            inner.next_position += 1;

            let stored = event.with_stream_coordinates(stream_id, version);
            inner.log.push(LogEntry {
                position,
                event: stored.clone(),
            });
            // Dispatched under the monitor so receivers observe
            // global-position order; send only fails with no receivers
            let _ = self.changes.send(StoredChange {
                event: stored,
                position,
            });
        }

        Ok(version)
    }

    async fn exists(&self, stream_id: &str) -> OccurrentResult<bool> {
        Ok(self
            .lock()
            .log
            .iter()
            .any(|e| e.event.stream_id() == Some(stream_id)))
    }

    async fn query(
        &self,
        filter: Filter,
        options: QueryOptions,
    ) -> OccurrentResult<EventIterator> {
        let matches: Vec<StoredChange> = self
            .lock()
            .log
            .iter()
            .filter(|e| filter.matches(&e.event))
            .map(|e| StoredChange {
                event: e.event.clone(),
                position: e.position,
            })
            .collect();

        let events: Vec<CloudEvent> = sorted(matches, options.sort)
            .into_iter()
            .map(|c| c.event)
            .skip(options.skip as usize)
            .take(options.limit.map(|l| l as usize).unwrap_or(usize::MAX))
            .collect();

        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    async fn count(&self, filter: Filter) -> OccurrentResult<u64> {
        Ok(self
            .lock()
            .log
            .iter()
            .filter(|e| filter.matches(&e.event))
            .count() as u64)
    }

    async fn delete(&self, filter: Filter) -> OccurrentResult<u64> {
        let mut inner = self.lock();
        let before = inner.log.len();
        inner.log.retain(|e| !filter.matches(&e.event));
        Ok((before - inner.log.len()) as u64)
    }

    async fn delete_stream(&self, stream_id: &str) -> OccurrentResult<u64> {
        let mut inner = self.lock();
        let before = inner.log.len();
        inner.log.retain(|e| e.event.stream_id() != Some(stream_id));
        Ok((before - inner.log.len()) as u64)
    }

    async fn delete_event(&self, id: &str, source: &str) -> OccurrentResult<bool> {
        let mut inner = self.lock();
        let before = inner.log.len();
        inner
            .log
            .retain(|e| !(e.event.id == id && e.event.source == source));
        Ok(inner.log.len() < before)
    }

    async fn update_event(
        &self,
        id: &str,
        source: &str,
        f: Box<dyn FnOnce(CloudEvent) -> CloudEvent + Send>,
    ) -> OccurrentResult<Option<CloudEvent>> {
        let mut inner = self.lock();
        let entry = inner
            .log
            .iter_mut()
            .find(|e| e.event.id == id && e.event.source == source);

        let Some(entry) = entry else {
            return Ok(None);
        };

        let stream_id = entry.event.stream_id().unwrap_or_default().to_string();
        let stream_version = entry.event.stream_version().unwrap_or(1);

        let updated = f(entry.event.clone());
        if updated.id != id || updated.source != source {
            return Err(OccurrentError::InvalidArgument(
                "update_event must not change the event's (id, source) identity".to_string(),
            ));
        }

        // The engine owns the stream coordinates; transformations cannot move
        // an event between streams
        let updated = updated.with_stream_coordinates(&stream_id, stream_version);
        entry.event = updated.clone();
        Ok(Some(updated))
    }
}
