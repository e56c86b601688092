// Copyright (c) 2025 - Cowboy AI, Inc.
//! CloudEvent envelope
//!
//! The unit of storage and delivery for the whole library: a CloudEvents 1.0
//! envelope carrying the required attributes, optional attributes, a payload
//! that is either structured JSON or raw bytes, and arbitrary named extension
//! attributes.
//!
//! Two extensions are owned by the engine and assigned on write:
//!
//! - [`STREAM_ID`] groups events into a stream
//! - [`STREAM_VERSION`] is the dense, 1-based position within that stream
//!
//! # Example
//!
//! ```rust
//! use occurrent::event::CloudEvent;
//!
//! let event = CloudEvent::builder("1", "urn:test", "GameStarted")
//!     .subject("game-42")
//!     .json_data(serde_json::json!({"players": 2}))
//!     .build()
//!     .unwrap();
//! assert_eq!(event.specversion, "1.0");
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{OccurrentError, OccurrentResult};

/// CloudEvents specification version written into every event
pub const SPEC_VERSION: &str = "1.0";

/// Extension attribute grouping events into a stream
pub const STREAM_ID: &str = "streamid";

/// Extension attribute carrying the 1-based position within a stream
pub const STREAM_VERSION: &str = "streamversion";

/// Event payload: structured JSON or opaque bytes
///
/// JSON payloads are stored structured in the backing document and are
/// exposed both as a tree and as serialized bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventData {
    /// Structured payload (stored as a document when the content type is JSON)
    Json(serde_json::Value),
    /// Opaque payload (stored as binary)
    Binary(Vec<u8>),
}

impl EventData {
    /// The payload as bytes, serializing structured data on demand
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            EventData::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
            EventData::Binary(bytes) => bytes.clone(),
        }
    }

    /// The structured view of the payload, if it is JSON
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            EventData::Json(value) => Some(value),
            EventData::Binary(_) => None,
        }
    }
}

/// A typed attribute value, used for extension attributes and filter operands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AttributeValue {
    /// UTF-8 string
    String(String),
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit float
    Float(f64),
    /// Boolean
    Boolean(bool),
    /// Point in time (UTC)
    Timestamp(DateTime<Utc>),
}

impl AttributeValue {
    /// Whether values of this kind have a defined ordering
    ///
    /// Booleans only support equality; comparing them with lt/gt/lte/gte is
    /// rejected when the filter is built.
    pub fn is_orderable(&self) -> bool {
        !matches!(self, AttributeValue::Boolean(_))
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Integer(n) => Some(*n as f64),
            AttributeValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AttributeValue::String(a), AttributeValue::String(b)) => a == b,
            (AttributeValue::Boolean(a), AttributeValue::Boolean(b)) => a == b,
            (AttributeValue::Timestamp(a), AttributeValue::Timestamp(b)) => a == b,
            // Integers and floats compare numerically
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl PartialOrd for AttributeValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (AttributeValue::String(a), AttributeValue::String(b)) => a.partial_cmp(b),
            (AttributeValue::Timestamp(a), AttributeValue::Timestamp(b)) => a.partial_cmp(b),
            (AttributeValue::Boolean(_), _) | (_, AttributeValue::Boolean(_)) => None,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => write!(f, "{}", s),
            AttributeValue::Integer(n) => write!(f, "{}", n),
            AttributeValue::Float(x) => write!(f, "{}", x),
            AttributeValue::Boolean(b) => write!(f, "{}", b),
            AttributeValue::Timestamp(t) => {
                write!(f, "{}", t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(n: i64) -> Self {
        AttributeValue::Integer(n)
    }
}

impl From<u64> for AttributeValue {
    fn from(n: u64) -> Self {
        AttributeValue::Integer(n as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(x: f64) -> Self {
        AttributeValue::Float(x)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Boolean(b)
    }
}

impl From<DateTime<Utc>> for AttributeValue {
    fn from(t: DateTime<Utc>) -> Self {
        AttributeValue::Timestamp(t)
    }
}

/// CloudEvents 1.0 envelope
///
/// `(source, id)` is globally unique within a store. The engine-owned
/// `streamid`/`streamversion` extensions are present on events read back
/// from a store and absent (ignored if set) on events handed to `write`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    /// Event identifier, unique per source
    pub id: String,

    /// Identifies the context in which the event happened (a URI reference)
    pub source: String,

    /// Event type, e.g. "com.example.game.started"
    #[serde(rename = "type")]
    pub event_type: String,

    /// CloudEvents spec version, always "1.0"
    pub specversion: String,

    /// Subject of the event within the source's context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Occurrence timestamp with offset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<FixedOffset>>,

    /// Content type of `data`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,

    /// Schema the payload adheres to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,

    /// Event payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<EventData>,

    /// Extension attributes, including `streamid`/`streamversion` once stored
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, AttributeValue>,
}

impl CloudEvent {
    /// Start building an event with a generated, time-ordered (UUID v7) id
    pub fn builder_with_generated_id(
        source: impl Into<String>,
        event_type: impl Into<String>,
    ) -> CloudEventBuilder {
        Self::builder(uuid::Uuid::now_v7().to_string(), source, event_type)
    }

    /// Start building an event from the required attributes
    pub fn builder(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
    ) -> CloudEventBuilder {
        CloudEventBuilder {
            event: CloudEvent {
                id: id.into(),
                source: source.into(),
                event_type: event_type.into(),
                specversion: SPEC_VERSION.to_string(),
                subject: None,
                time: None,
                datacontenttype: None,
                dataschema: None,
                data: None,
                extensions: BTreeMap::new(),
            },
        }
    }

    /// The stream this event belongs to, if it has been stored
    pub fn stream_id(&self) -> Option<&str> {
        match self.extensions.get(STREAM_ID) {
            Some(AttributeValue::String(s)) => Some(s),
            _ => None,
        }
    }

    /// The 1-based position within its stream, if it has been stored
    pub fn stream_version(&self) -> Option<u64> {
        match self.extensions.get(STREAM_VERSION) {
            Some(AttributeValue::Integer(n)) if *n > 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Look up an extension attribute by name
    pub fn extension(&self, name: &str) -> Option<&AttributeValue> {
        self.extensions.get(name)
    }

    /// Stamp the engine-owned stream coordinates onto this event
    pub fn with_stream_coordinates(mut self, stream_id: &str, stream_version: u64) -> Self {
        self.extensions
            .insert(STREAM_ID.to_string(), AttributeValue::String(stream_id.to_string()));
        self.extensions.insert(
            STREAM_VERSION.to_string(),
            AttributeValue::Integer(stream_version as i64),
        );
        self
    }
}

/// Builder for [`CloudEvent`] with validation on `build`
#[derive(Debug, Clone)]
pub struct CloudEventBuilder {
    event: CloudEvent,
}

impl CloudEventBuilder {
    /// Set the subject
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.event.subject = Some(subject.into());
        self
    }

    /// Set the occurrence time
    pub fn time(mut self, time: DateTime<FixedOffset>) -> Self {
        self.event.time = Some(time);
        self
    }

    /// Set the occurrence time from a UTC timestamp
    pub fn time_utc(mut self, time: DateTime<Utc>) -> Self {
        self.event.time = Some(time.fixed_offset());
        self
    }

    /// Set the data content type
    pub fn datacontenttype(mut self, content_type: impl Into<String>) -> Self {
        self.event.datacontenttype = Some(content_type.into());
        self
    }

    /// Set the data schema
    pub fn dataschema(mut self, schema: impl Into<String>) -> Self {
        self.event.dataschema = Some(schema.into());
        self
    }

    /// Attach a structured JSON payload and set the content type to
    /// `application/json`
    pub fn json_data(mut self, value: serde_json::Value) -> Self {
        self.event.datacontenttype = Some("application/json".to_string());
        self.event.data = Some(EventData::Json(value));
        self
    }

    /// Attach an opaque binary payload
    pub fn binary_data(mut self, bytes: Vec<u8>) -> Self {
        self.event.data = Some(EventData::Binary(bytes));
        self
    }

    /// Add an extension attribute
    pub fn extension(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.event.extensions.insert(name.into(), value.into());
        self
    }

    /// Validate and produce the event
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `id`, `source`, or `type` is empty
    pub fn build(self) -> OccurrentResult<CloudEvent> {
        if self.event.id.is_empty() {
            return Err(OccurrentError::InvalidArgument(
                "CloudEvent id must not be empty".to_string(),
            ));
        }
        if self.event.source.is_empty() {
            return Err(OccurrentError::InvalidArgument(
                "CloudEvent source must not be empty".to_string(),
            ));
        }
        if self.event.event_type.is_empty() {
            return Err(OccurrentError::InvalidArgument(
                "CloudEvent type must not be empty".to_string(),
            ));
        }
        Ok(self.event)
    }
}
