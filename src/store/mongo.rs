// Copyright (c) 2025 - Cowboy AI, Inc.
//! MongoDB event store implementation
//!
//! Implements the [`EventStore`] trait against a MongoDB collection, with
//! optimistic concurrency on the stream version and a choice of consistency
//! strategy:
//!
//! - [`StreamConsistencyGuarantee::Transactional`] tracks the current
//!   version of every stream in a side collection updated in the same
//!   transaction as the event insert
//! - [`StreamConsistencyGuarantee::IndexOnly`] derives the current version
//!   from the events themselves and lets the unique
//!   `(streamid, streamversion)` index arbitrate concurrent writers
//! - [`StreamConsistencyGuarantee::None`] derives the version without
//!   transactional protection, for single-writer deployments
//!
//! Conflicting concurrent writers lose with a duplicate-key error that is
//! translated to `WriteConditionNotFulfilled`.

use bson::{doc, Document};
use futures::StreamExt;
use mongodb::error::{ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT};
use mongodb::options::IndexOptions;
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use tracing::{debug, info};

use async_trait::async_trait;

use crate::document::{EventFormat, TimeRepresentation};
use crate::errors::{OccurrentError, OccurrentResult};
use crate::event::CloudEvent;
use crate::filter::Filter;
use crate::retry::RetryStrategy;
use crate::store::{
    EventIterator, EventStore, EventStream, QueryOptions, SortBy, WriteCondition,
};

/// How stream versions are kept consistent under concurrent writers
#[derive(Debug, Clone)]
pub enum StreamConsistencyGuarantee {
    /// Derive the version from the events, without transactions
    None,
    /// Track versions in a side collection, updated transactionally with the
    /// event insert
    Transactional {
        /// Collection holding `{_id: streamid, version}` documents
        stream_version_collection: String,
    },
    /// Derive the version from the events; the unique
    /// `(streamid, streamversion)` index arbitrates races
    IndexOnly,
}

/// Configuration for [`MongoEventStore`]
#[derive(Debug, Clone)]
pub struct MongoEventStoreConfig {
    /// Collection the event documents live in
    pub event_collection: String,

    /// How event times are persisted; immutable after construction
    pub time_representation: TimeRepresentation,

    /// Stream-version bookkeeping strategy
    pub stream_consistency: StreamConsistencyGuarantee,

    /// Retry applied to transactions that fail with a transient label
    pub transaction_retry: RetryStrategy,
}

impl Default for MongoEventStoreConfig {
    fn default() -> Self {
        Self {
            event_collection: "events".to_string(),
            time_representation: TimeRepresentation::Rfc3339String,
            stream_consistency: StreamConsistencyGuarantee::Transactional {
                stream_version_collection: "stream_versions".to_string(),
            },
            transaction_retry: RetryStrategy::fixed(std::time::Duration::from_millis(50))
                .with_max_attempts(5),
        }
    }
}

/// MongoDB-backed event store
///
/// # Example
///
/// ```rust,no_run
/// use occurrent::store::{MongoEventStore, MongoEventStoreConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MongoEventStore::connect(
///         "mongodb://localhost:27017",
///         "occurrent",
///         MongoEventStoreConfig::default(),
///     )
///     .await?;
///     // Use store...
///     Ok(())
/// }
/// ```
pub struct MongoEventStore {
    database: Database,
    events: Collection<Document>,
    format: EventFormat,
    config: MongoEventStoreConfig,
}

/// Internal error split so transaction retries can inspect driver labels
enum TxnError {
    Occurrent(OccurrentError),
    Mongo(mongodb::error::Error),
}

impl From<mongodb::error::Error> for TxnError {
    fn from(e: mongodb::error::Error) -> Self {
        TxnError::Mongo(e)
    }
}

impl From<OccurrentError> for TxnError {
    fn from(e: OccurrentError) -> Self {
        TxnError::Occurrent(e)
    }
}

impl MongoEventStore {
    /// Connect to MongoDB and initialize the store
    ///
    /// Creates the required indexes if they do not exist.
    pub async fn connect(
        uri: &str,
        database: &str,
        config: MongoEventStoreConfig,
    ) -> OccurrentResult<Self> {
        let client = Client::with_uri_str(uri).await?;
        info!("Connected to MongoDB at {}", uri);
        Self::new(client.database(database), config).await
    }

    /// Initialize the store on an existing database handle
    pub async fn new(database: Database, config: MongoEventStoreConfig) -> OccurrentResult<Self> {
        if config.event_collection.is_empty() {
            return Err(OccurrentError::InvalidArgument(
                "event collection name must not be empty".to_string(),
            ));
        }
        if let StreamConsistencyGuarantee::Transactional {
            stream_version_collection,
        } = &config.stream_consistency
        {
            if stream_version_collection.is_empty() {
                return Err(OccurrentError::InvalidArgument(
                    "stream version collection name must not be empty".to_string(),
                ));
            }
        }

        let events = database.collection::<Document>(&config.event_collection);
        let store = Self {
            database,
            events,
            format: EventFormat::new(config.time_representation),
            config,
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    /// The format used to encode and decode events
    pub fn format(&self) -> EventFormat {
        self.format
    }

    async fn ensure_indexes(&self) -> OccurrentResult<()> {
        self.events
            .create_index(IndexModel::builder().keys(doc! { "streamid": 1 }).build())
            .await?;
        self.events
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "id": 1, "source": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await?;
        // Created for every strategy: it is the concurrency arbiter for the
        // derived strategies and a correctness guard for the tracked one
        self.events
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "streamid": 1, "streamversion": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await?;
        debug!("Event store indexes ensured on '{}'", self.config.event_collection);
        Ok(())
    }

    fn version_collection(&self) -> Option<Collection<Document>> {
        match &self.config.stream_consistency {
            StreamConsistencyGuarantee::Transactional {
                stream_version_collection,
            } => Some(self.database.collection::<Document>(stream_version_collection)),
            _ => None,
        }
    }

    /// Highest `streamversion` stored for the stream, or 0
    async fn derived_version(&self, stream_id: &str) -> OccurrentResult<u64> {
        let newest = self
            .events
            .find_one(doc! { "streamid": stream_id })
            .sort(doc! { "streamversion": -1 })
            .await?;
        Ok(newest
            .and_then(|d| d.get_i64("streamversion").ok())
            .map(|v| v.max(0) as u64)
            .unwrap_or(0))
    }

    fn encode_batch(
        &self,
        stream_id: &str,
        current_version: u64,
        events: &[CloudEvent],
    ) -> OccurrentResult<Vec<Document>> {
        events
            .iter()
            .enumerate()
            .map(|(i, event)| {
                self.format
                    .encode(event, stream_id, current_version + 1 + i as u64)
            })
            .collect()
    }

    async fn write_transactional(
        &self,
        versions: &Collection<Document>,
        stream_id: &str,
        condition: &WriteCondition,
        events: &[CloudEvent],
    ) -> Result<u64, TxnError> {
        let mut session = self.database.client().start_session().await?;
        session.start_transaction().await?;

        let result = self
            .transactional_append(&mut session, versions, stream_id, condition, events)
            .await;

        match result {
            Ok(version) => {
                commit_with_retry(&mut session).await?;
                Ok(version)
            }
            Err(err) => {
                let _ = session.abort_transaction().await;
                Err(err)
            }
        }
    }

    async fn transactional_append(
        &self,
        session: &mut ClientSession,
        versions: &Collection<Document>,
        stream_id: &str,
        condition: &WriteCondition,
        events: &[CloudEvent],
    ) -> Result<u64, TxnError> {
        let current = versions
            .find_one(doc! { "_id": stream_id })
            .session(&mut *session)
            .await?
            .and_then(|d| d.get_i64("version").ok())
            .map(|v| v.max(0) as u64)
            .unwrap_or(0);

        if !condition.is_fulfilled_by(current) {
            return Err(OccurrentError::WriteConditionNotFulfilled {
                condition: condition.description(),
                actual: current,
            }
            .into());
        }

        let documents = self.encode_batch(stream_id, current, events)?;
        let new_version = current + events.len() as u64;

        if let Err(error) = self
            .events
            .insert_many(documents)
            .session(&mut *session)
            .await
        {
            return Err(self
                .translate_insert_error(error, stream_id, condition, events)
                .await
                .into());
        }

        versions
            .update_one(
                doc! { "_id": stream_id },
                doc! { "$set": { "version": new_version as i64 } },
            )
            .upsert(true)
            .session(&mut *session)
            .await?;

        Ok(new_version)
    }

    async fn write_derived(
        &self,
        stream_id: &str,
        condition: &WriteCondition,
        events: &[CloudEvent],
    ) -> OccurrentResult<u64> {
        let current = self.derived_version(stream_id).await?;

        if !condition.is_fulfilled_by(current) {
            return Err(OccurrentError::WriteConditionNotFulfilled {
                condition: condition.description(),
                actual: current,
            });
        }

        let documents = self.encode_batch(stream_id, current, events)?;

        match self.events.insert_many(documents).await {
            Ok(_) => Ok(current + events.len() as u64),
            Err(error) => Err(self
                .translate_insert_error(error, stream_id, condition, events)
                .await),
        }
    }

    /// Map duplicate-key failures onto the error taxonomy
    ///
    /// A conflict on `(streamid, streamversion)` means a concurrent writer
    /// won the race: the write condition is no longer fulfilled. A conflict
    /// on `(id, source)` is a duplicate event.
    async fn translate_insert_error(
        &self,
        error: mongodb::error::Error,
        stream_id: &str,
        condition: &WriteCondition,
        events: &[CloudEvent],
    ) -> OccurrentError {
        let Some((index, message)) = duplicate_key(&error) else {
            return error.into();
        };

        if message.contains("streamversion") {
            let actual = self.derived_version(stream_id).await.unwrap_or(0);
            return OccurrentError::WriteConditionNotFulfilled {
                condition: condition.description(),
                actual,
            };
        }

        let offender = index.and_then(|i| events.get(i));
        OccurrentError::DuplicateEvent {
            id: offender.map(|e| e.id.clone()).unwrap_or_default(),
            event_source: offender.map(|e| e.source.clone()).unwrap_or_default(),
        }
    }

    fn sort_document(sort: SortBy) -> Document {
        match sort {
            SortBy::NaturalAsc => doc! { "$natural": 1 },
            SortBy::NaturalDesc => doc! { "$natural": -1 },
            SortBy::TimeAsc => doc! { "time": 1 },
            SortBy::TimeDesc => doc! { "time": -1 },
        }
    }

    fn decoding_stream(&self, cursor: mongodb::Cursor<Document>) -> EventIterator {
        let format = self.format;
        Box::pin(cursor.map(move |item| match item {
            Ok(document) => format.decode(document),
            Err(error) => Err(error.into()),
        }))
    }
}

async fn commit_with_retry(session: &mut ClientSession) -> Result<(), TxnError> {
    // Standard driver pattern: the commit itself is retried on the
    // unknown-commit label before the whole transaction is retried
    for _ in 0..3 {
        match session.commit_transaction().await {
            Ok(()) => return Ok(()),
            Err(error) if error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) => continue,
            Err(error) => return Err(error.into()),
        }
    }
    session.commit_transaction().await.map_err(TxnError::from)
}

/// Extract `(failing batch index, message)` from a duplicate-key error
pub(crate) fn duplicate_key(error: &mongodb::error::Error) -> Option<(Option<usize>, String)> {
    match &*error.kind {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == 11000 => {
            Some((None, write_error.message.clone()))
        }
        ErrorKind::InsertMany(insert_error) => insert_error
            .write_errors
            .as_ref()?
            .iter()
            .find(|e| e.code == 11000)
            .map(|e| (Some(e.index), e.message.clone())),
        _ => None,
    }
}

#[async_trait]
impl EventStore for MongoEventStore {
    async fn read(
        &self,
        stream_id: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> OccurrentResult<EventStream> {
        let version = self.derived_version(stream_id).await?;

        let mut find = self
            .events
            .find(doc! { "streamid": stream_id })
            .sort(doc! { "streamversion": 1 })
            .skip(skip);
        if let Some(limit) = limit {
            find = find.limit(limit as i64);
        }
        let cursor = find.await?;

        Ok(EventStream {
            id: stream_id.to_string(),
            version,
            events: self.decoding_stream(cursor),
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
        if events.is_empty() {
            return self.derived_version(stream_id).await;
        }

        debug!(
            "Writing {} event(s) to stream '{}' with condition '{}'",
            events.len(),
            stream_id,
            condition.description()
        );

        let Some(versions) = self.version_collection() else {
            return self.write_derived(stream_id, &condition, &events).await;
        };

        let mut delays = self.config.transaction_retry.delays();
        loop {
            match self
                .write_transactional(&versions, stream_id, &condition, &events)
                .await
            {
                Ok(version) => return Ok(version),
                Err(TxnError::Occurrent(error)) => return Err(error),
                Err(TxnError::Mongo(error))
                    if error.contains_label(TRANSIENT_TRANSACTION_ERROR) =>
                {
                    match delays.next() {
                        Some(delay) => {
                            debug!(
                                "Transient transaction error on stream '{}', retrying in {:?}",
                                stream_id, delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(error.into()),
                    }
                }
                Err(TxnError::Mongo(error)) => return Err(error.into()),
            }
        }
    }

    async fn exists(&self, stream_id: &str) -> OccurrentResult<bool> {
        Ok(self
            .events
            .find_one(doc! { "streamid": stream_id })
            .await?
            .is_some())
    }

    async fn query(
        &self,
        filter: Filter,
        options: QueryOptions,
    ) -> OccurrentResult<EventIterator> {
        let query = filter.to_query(self.config.time_representation);

        let mut find = self
            .events
            .find(query)
            .sort(Self::sort_document(options.sort))
            .skip(options.skip);
        if let Some(limit) = options.limit {
            find = find.limit(limit as i64);
        }
        let cursor = find.await?;

        Ok(self.decoding_stream(cursor))
    }

    async fn count(&self, filter: Filter) -> OccurrentResult<u64> {
        let query = filter.to_query(self.config.time_representation);
        Ok(self.events.count_documents(query).await?)
    }

    async fn delete(&self, filter: Filter) -> OccurrentResult<u64> {
        let query = filter.to_query(self.config.time_representation);
        let result = self.events.delete_many(query).await?;
        Ok(result.deleted_count)
    }

    async fn delete_stream(&self, stream_id: &str) -> OccurrentResult<u64> {
        let Some(versions) = self.version_collection() else {
            let result = self.events.delete_many(doc! { "streamid": stream_id }).await?;
            return Ok(result.deleted_count);
        };

        // The tracked version entry is cleared in the same transaction, so a
        // resurrected stream starts again at version 1
        let mut session = self.database.client().start_session().await?;
        session.start_transaction().await?;

        let deleted = async {
            let result = self
                .events
                .delete_many(doc! { "streamid": stream_id })
                .session(&mut session)
                .await?;
            versions
                .delete_one(doc! { "_id": stream_id })
                .session(&mut session)
                .await?;
            Ok::<u64, mongodb::error::Error>(result.deleted_count)
        }
        .await;

        match deleted {
            Ok(count) => {
                session.commit_transaction().await?;
                Ok(count)
            }
            Err(error) => {
                let _ = session.abort_transaction().await;
                Err(error.into())
            }
        }
    }

    async fn delete_event(&self, id: &str, source: &str) -> OccurrentResult<bool> {
        let result = self
            .events
            .delete_one(doc! { "id": id, "source": source })
            .await?;
        Ok(result.deleted_count > 0)
    }

    async fn update_event(
        &self,
        id: &str,
        source: &str,
        f: Box<dyn FnOnce(CloudEvent) -> CloudEvent + Send>,
    ) -> OccurrentResult<Option<CloudEvent>> {
        let Some(document) = self
            .events
            .find_one(doc! { "id": id, "source": source })
            .await?
        else {
            return Ok(None);
        };

        let stored = self.format.decode(document)?;
        let stream_id = stored.stream_id().unwrap_or_default().to_string();
        let stream_version = stored.stream_version().unwrap_or(1);

        let updated = f(stored);
        if updated.id != id || updated.source != source {
            return Err(OccurrentError::InvalidArgument(
                "update_event must not change the event's (id, source) identity".to_string(),
            ));
        }

        let replacement = self.format.encode(&updated, &stream_id, stream_version)?;
        self.events
            .replace_one(doc! { "id": id, "source": source }, replacement)
            .await?;

        Ok(Some(updated.with_stream_coordinates(&stream_id, stream_version)))
    }
}
