// Copyright (c) 2025 - Cowboy AI, Inc.
//! CloudEvent ↔ BSON document mapping
//!
//! [`EventFormat`] is the bijective encoder between a [`CloudEvent`] plus its
//! stream coordinates and the persisted document. The time representation is
//! chosen at store construction and immutable thereafter:
//!
//! - [`TimeRepresentation::Rfc3339String`] keeps the full sub-second
//!   precision and the original offset as a canonical RFC 3339 string
//! - [`TimeRepresentation::Date`] stores a native timestamp with millisecond
//!   precision; times with sub-millisecond components or a non-UTC offset
//!   are rejected with guidance toward the string representation
//!
//! Decoding strips the backend-private `_id` field and is the exact inverse
//! of encoding for every event that satisfies the representation's
//! preconditions.

use bson::spec::BinarySubtype;
use bson::{Bson, Document};
use chrono::{DateTime, FixedOffset, SecondsFormat};

use crate::errors::{OccurrentError, OccurrentResult};
use crate::event::{AttributeValue, CloudEvent, EventData, STREAM_ID, STREAM_VERSION};

/// How event occurrence times are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRepresentation {
    /// Canonical RFC 3339 string, lossless for precision and offset
    Rfc3339String,
    /// Native BSON date, millisecond precision, UTC only
    Date,
}

/// Canonical RFC 3339 rendering used for storage and query operands
pub(crate) fn format_rfc3339(time: &DateTime<FixedOffset>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn is_json_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => {
            let essence = ct.split(';').next().unwrap_or("").trim();
            essence.eq_ignore_ascii_case("application/json")
        }
        None => false,
    }
}

/// Encoder/decoder between CloudEvents and persisted documents
///
/// Passed explicitly into the stores at construction; there is no global
/// format registry.
#[derive(Debug, Clone, Copy)]
pub struct EventFormat {
    time_representation: TimeRepresentation,
}

impl EventFormat {
    /// Create a format with the given time representation
    pub fn new(time_representation: TimeRepresentation) -> Self {
        Self {
            time_representation,
        }
    }

    /// The configured time representation
    pub fn time_representation(&self) -> TimeRepresentation {
        self.time_representation
    }

    /// Encode an event together with its stream coordinates
    ///
    /// Every CloudEvent attribute and extension becomes a top-level field;
    /// `streamid` and `streamversion` are written explicitly. JSON payloads
    /// are stored structured, everything else as binary.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the stream id is empty, the version is zero, or
    /// the event time violates the representation's preconditions
    pub fn encode(
        &self,
        event: &CloudEvent,
        stream_id: &str,
        stream_version: u64,
    ) -> OccurrentResult<Document> {
        if stream_id.is_empty() {
            return Err(OccurrentError::InvalidArgument(
                "stream id must not be empty".to_string(),
            ));
        }
        if stream_version == 0 {
            return Err(OccurrentError::InvalidArgument(
                "stream version is 1-based; 0 is not a valid version".to_string(),
            ));
        }

        let mut doc = Document::new();
        doc.insert("id", event.id.clone());
        doc.insert("source", event.source.clone());
        doc.insert("type", event.event_type.clone());
        doc.insert("specversion", event.specversion.clone());

        if let Some(subject) = &event.subject {
            doc.insert("subject", subject.clone());
        }
        if let Some(content_type) = &event.datacontenttype {
            doc.insert("datacontenttype", content_type.clone());
        }
        if let Some(schema) = &event.dataschema {
            doc.insert("dataschema", schema.clone());
        }
        if let Some(time) = &event.time {
            doc.insert("time", self.encode_time(time)?);
        }
        if let Some(data) = &event.data {
            doc.insert(
                "data",
                encode_data(data, event.datacontenttype.as_deref())?,
            );
        }

        doc.insert("streamid", stream_id);
        doc.insert("streamversion", stream_version as i64);

        for (name, value) in &event.extensions {
            if name == STREAM_ID || name == STREAM_VERSION {
                continue;
            }
            doc.insert(name.clone(), attribute_to_bson(value));
        }

        Ok(doc)
    }

    /// Decode a persisted document back into a CloudEvent
    ///
    /// The backend-private `_id` field is stripped; `streamid` and
    /// `streamversion` surface as extension attributes.
    pub fn decode(&self, mut doc: Document) -> OccurrentResult<CloudEvent> {
        doc.remove("_id");

        let id = take_string(&mut doc, "id")?;
        let source = take_string(&mut doc, "source")?;
        let event_type = take_string(&mut doc, "type")?;
        let specversion = take_string(&mut doc, "specversion")?;
        let subject = take_optional_string(&mut doc, "subject")?;
        let datacontenttype = take_optional_string(&mut doc, "datacontenttype")?;
        let dataschema = take_optional_string(&mut doc, "dataschema")?;

        let time = match doc.remove("time") {
            Some(value) => Some(self.decode_time(value)?),
            None => None,
        };

        let data = match doc.remove("data") {
            Some(Bson::Binary(binary)) => Some(EventData::Binary(binary.bytes)),
            Some(value) => Some(EventData::Json(value.into_relaxed_extjson())),
            None => None,
        };

        let mut extensions = std::collections::BTreeMap::new();
        for (name, value) in doc {
            extensions.insert(name.clone(), bson_to_attribute(&name, value)?);
        }

        Ok(CloudEvent {
            id,
            source,
            event_type,
            specversion,
            subject,
            time,
            datacontenttype,
            dataschema,
            data,
            extensions,
        })
    }

    fn encode_time(&self, time: &DateTime<FixedOffset>) -> OccurrentResult<Bson> {
        match self.time_representation {
            TimeRepresentation::Rfc3339String => Ok(Bson::String(format_rfc3339(time))),
            TimeRepresentation::Date => {
                if time.offset().local_minus_utc() != 0 {
                    return Err(OccurrentError::InvalidArgument(format!(
                        "time '{}' has a non-UTC offset which TimeRepresentation::Date cannot \
                         represent; normalise the time to UTC or configure \
                         TimeRepresentation::Rfc3339String",
                        format_rfc3339(time)
                    )));
                }
                if time.timestamp_subsec_nanos() % 1_000_000 != 0 {
                    return Err(OccurrentError::InvalidArgument(format!(
                        "time '{}' has sub-millisecond precision which \
                         TimeRepresentation::Date cannot represent; truncate the time to \
                         milliseconds or configure TimeRepresentation::Rfc3339String",
                        format_rfc3339(time)
                    )));
                }
                Ok(Bson::DateTime(bson::DateTime::from_millis(
                    time.timestamp_millis(),
                )))
            }
        }
    }

    fn decode_time(&self, value: Bson) -> OccurrentResult<DateTime<FixedOffset>> {
        match (self.time_representation, value) {
            (TimeRepresentation::Rfc3339String, Bson::String(s)) => {
                DateTime::parse_from_rfc3339(&s).map_err(|e| {
                    OccurrentError::Serialization(format!("invalid RFC 3339 time '{}': {}", s, e))
                })
            }
            (TimeRepresentation::Date, Bson::DateTime(dt)) => Ok(dt.to_chrono().fixed_offset()),
            (_, other) => Err(OccurrentError::Serialization(format!(
                "time field has unexpected BSON type: {:?}",
                other.element_type()
            ))),
        }
    }
}

fn encode_data(data: &EventData, content_type: Option<&str>) -> OccurrentResult<Bson> {
    let json = is_json_content_type(content_type);
    match data {
        EventData::Json(value) if json => Ok(bson::to_bson(value)?),
        EventData::Json(value) => Ok(binary(serde_json::to_vec(value)?)),
        EventData::Binary(bytes) if json => {
            // Declared JSON: store structured when the payload parses,
            // raw bytes when it does not
            match serde_json::from_slice::<serde_json::Value>(bytes) {
                Ok(value) => Ok(bson::to_bson(&value)?),
                Err(_) => Ok(binary(bytes.clone())),
            }
        }
        EventData::Binary(bytes) => Ok(binary(bytes.clone())),
    }
}

fn binary(bytes: Vec<u8>) -> Bson {
    Bson::Binary(bson::Binary {
        subtype: BinarySubtype::Generic,
        bytes,
    })
}

fn attribute_to_bson(value: &AttributeValue) -> Bson {
    match value {
        AttributeValue::String(s) => Bson::String(s.clone()),
        AttributeValue::Integer(n) => Bson::Int64(*n),
        AttributeValue::Float(x) => Bson::Double(*x),
        AttributeValue::Boolean(b) => Bson::Boolean(*b),
        AttributeValue::Timestamp(t) => Bson::DateTime(bson::DateTime::from_chrono(*t)),
    }
}

fn bson_to_attribute(name: &str, value: Bson) -> OccurrentResult<AttributeValue> {
    match value {
        Bson::String(s) => Ok(AttributeValue::String(s)),
        Bson::Int32(n) => Ok(AttributeValue::Integer(n as i64)),
        Bson::Int64(n) => Ok(AttributeValue::Integer(n)),
        Bson::Double(x) => Ok(AttributeValue::Float(x)),
        Bson::Boolean(b) => Ok(AttributeValue::Boolean(b)),
        Bson::DateTime(dt) => Ok(AttributeValue::Timestamp(dt.to_chrono())),
        other => Err(OccurrentError::Serialization(format!(
            "extension attribute '{}' has unsupported BSON type: {:?}",
            name,
            other.element_type()
        ))),
    }
}

fn take_string(doc: &mut Document, key: &str) -> OccurrentResult<String> {
    match doc.remove(key) {
        Some(Bson::String(s)) => Ok(s),
        Some(other) => Err(OccurrentError::Serialization(format!(
            "field '{}' has unexpected BSON type: {:?}",
            key,
            other.element_type()
        ))),
        None => Err(OccurrentError::Serialization(format!(
            "document is missing required field '{}'",
            key
        ))),
    }
}

fn take_optional_string(doc: &mut Document, key: &str) -> OccurrentResult<Option<String>> {
    match doc.remove(key) {
        Some(Bson::String(s)) => Ok(Some(s)),
        Some(other) => Err(OccurrentError::Serialization(format!(
            "field '{}' has unexpected BSON type: {:?}",
            key,
            other.element_type()
        ))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn sample_event(time: DateTime<FixedOffset>) -> CloudEvent {
        CloudEvent::builder("e1", "urn:test", "OrderPlaced")
            .subject("order-1")
            .time(time)
            .json_data(serde_json::json!({"total": 42, "lines": ["a", "b"]}))
            .extension("tenant", "acme")
            .build()
            .unwrap()
    }

    #[test]
    fn test_rfc3339_round_trip_preserves_offset_and_precision() {
        let format = EventFormat::new(TimeRepresentation::Rfc3339String);
        let time = DateTime::parse_from_rfc3339("2026-01-19T12:00:00.123456789+02:00").unwrap();
        let event = sample_event(time);

        let doc = format.encode(&event, "orders", 1).unwrap();
        assert_eq!(
            doc.get_str("time").unwrap(),
            "2026-01-19T12:00:00.123456789+02:00"
        );

        let decoded = format.decode(doc).unwrap();
        assert_eq!(decoded.time, Some(time));
        assert_eq!(decoded, event.clone().with_stream_coordinates("orders", 1));
    }

    #[test]
    fn test_date_round_trip_at_millis() {
        let format = EventFormat::new(TimeRepresentation::Date);
        let time = Utc
            .with_ymd_and_hms(2026, 1, 19, 12, 0, 0)
            .unwrap()
            .fixed_offset();
        let event = sample_event(time);

        let doc = format.encode(&event, "orders", 2).unwrap();
        let decoded = format.decode(doc).unwrap();
        assert_eq!(decoded.time, Some(time));
        assert_eq!(decoded.stream_version(), Some(2));
    }

    #[test]
    fn test_date_rejects_sub_millisecond_precision() {
        let format = EventFormat::new(TimeRepresentation::Date);
        let time = DateTime::parse_from_rfc3339("2026-01-19T12:00:00.123456789Z").unwrap();
        let event = sample_event(time);

        let err = format.encode(&event, "orders", 1).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, OccurrentError::InvalidArgument(_)));
        assert!(message.contains("Rfc3339String"));
        assert!(message.contains("truncate"));
    }

    #[test]
    fn test_date_rejects_non_utc_offset() {
        let format = EventFormat::new(TimeRepresentation::Date);
        let time = DateTime::parse_from_rfc3339("2026-01-19T12:00:00+02:00").unwrap();
        let event = sample_event(time);

        let err = format.encode(&event, "orders", 1).unwrap_err();
        assert!(err.to_string().contains("UTC"));
    }

    #[test]
    fn test_decode_strips_backend_id() {
        let format = EventFormat::new(TimeRepresentation::Date);
        let event = CloudEvent::builder("e1", "urn:test", "T").build().unwrap();
        let mut doc = format.encode(&event, "s", 1).unwrap();
        doc.insert("_id", bson::oid::ObjectId::new());

        let decoded = format.decode(doc).unwrap();
        assert!(decoded.extensions.get("_id").is_none());
        assert_eq!(decoded.id, "e1");
    }

    #[test]
    fn test_non_json_payload_stored_as_binary() {
        let format = EventFormat::new(TimeRepresentation::Date);
        let event = CloudEvent::builder("e1", "urn:test", "T")
            .datacontenttype("application/octet-stream")
            .binary_data(vec![0xde, 0xad])
            .build()
            .unwrap();

        let doc = format.encode(&event, "s", 1).unwrap();
        assert!(matches!(doc.get("data"), Some(Bson::Binary(_))));

        let decoded = format.decode(doc).unwrap();
        assert_eq!(decoded.data, Some(EventData::Binary(vec![0xde, 0xad])));
    }

    #[test]
    fn test_declared_json_bytes_stored_structured() {
        let format = EventFormat::new(TimeRepresentation::Date);
        let event = CloudEvent::builder("e1", "urn:test", "T")
            .datacontenttype("application/json")
            .binary_data(br#"{"a": 1}"#.to_vec())
            .build()
            .unwrap();

        let doc = format.encode(&event, "s", 1).unwrap();
        let decoded = format.decode(doc).unwrap();
        let json = decoded.data.unwrap();
        assert_eq!(json.as_json().unwrap()["a"], 1);
    }

    #[test]
    fn test_stream_version_must_be_positive() {
        let format = EventFormat::new(TimeRepresentation::Date);
        let event = CloudEvent::builder("e1", "urn:test", "T").build().unwrap();
        assert!(format.encode(&event, "s", 0).is_err());
        assert!(format.encode(&event, "", 1).is_err());
    }
}
