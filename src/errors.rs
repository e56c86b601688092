//! Error types for event store and subscription operations

use thiserror::Error;

/// Errors that can occur across the event store, subscription, and
/// competing-consumer APIs
#[derive(Debug, Error)]
pub enum OccurrentError {
    /// The stream's current version did not satisfy the write condition.
    ///
    /// The message text is part of the public contract: the condition's
    /// human-readable description followed by the actual version.
    #[error("Expected version {condition} but was {actual}.")]
    WriteConditionNotFulfilled {
        /// Human-readable condition description, e.g. "to be equal to 10"
        condition: String,
        /// The stream version observed at write time
        actual: u64,
    },

    /// An event with the same `(id, source)` already exists
    #[error("Duplicate event: an event with id '{id}' and source '{event_source}' already exists")]
    DuplicateEvent {
        /// CloudEvent id
        id: String,
        /// CloudEvent source
        event_source: String,
    },

    /// Caller contract violation (empty id, unsupported time, malformed filter)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Recoverable backend fault; the caller may retry
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// The competing-consumer lease was taken over by another subscriber
    #[error("Lease for subscription '{subscription_id}' is held by another subscriber")]
    LostLease {
        /// Subscription the lease guards
        subscription_id: String,
    },

    /// A subscription operation was invoked after shutdown
    #[error("Subscription model has been shut down")]
    SubscriptionShutdown,

    /// Event could not be encoded to or decoded from its document form
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for event store and subscription operations
pub type OccurrentResult<T> = Result<T, OccurrentError>;

impl From<mongodb::error::Error> for OccurrentError {
    fn from(err: mongodb::error::Error) -> Self {
        OccurrentError::TransientIo(err.to_string())
    }
}

impl From<bson::ser::Error> for OccurrentError {
    fn from(err: bson::ser::Error) -> Self {
        OccurrentError::Serialization(err.to_string())
    }
}

impl From<bson::de::Error> for OccurrentError {
    fn from(err: bson::de::Error) -> Self {
        OccurrentError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for OccurrentError {
    fn from(err: serde_json::Error) -> Self {
        OccurrentError::Serialization(err.to_string())
    }
}
