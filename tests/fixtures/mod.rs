// Copyright (c) 2025 - Cowboy AI, Inc.
//! Test fixtures
//!
//! Deterministic CloudEvents for store and subscription tests. All ids and
//! timestamps are fixed constants so tests are reproducible; tests that need
//! "now" say so explicitly.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use occurrent::event::CloudEvent;

/// Initialize test logging once; respects `RUST_LOG`
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Source shared by all fixture events
pub const SOURCE: &str = "urn:occurrent:test";

/// Fixed base timestamp (2026-01-19T12:00:00Z)
pub const BASE_TIME: &str = "2026-01-19T12:00:00Z";

/// Parse the fixed base timestamp
pub fn base_time() -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(BASE_TIME).expect("Invalid timestamp in test fixture")
}

/// A minimal event with a deterministic time derived from its sequence
/// number (one second apart, ascending)
pub fn numbered_event(n: usize) -> CloudEvent {
    CloudEvent::builder(format!("event-{:04}", n), SOURCE, "NumberGuessed")
        .subject(format!("guess-{}", n))
        .time(base_time() + Duration::seconds(n as i64))
        .json_data(serde_json::json!({ "guess": n }))
        .build()
        .expect("Invalid fixture event")
}

/// A batch of numbered events covering `range`
pub fn numbered_events(range: std::ops::Range<usize>) -> Vec<CloudEvent> {
    range.map(numbered_event).collect()
}

/// An event of the given type occurring at `time`
pub fn typed_event_at(id: &str, event_type: &str, time: DateTime<Utc>) -> CloudEvent {
    CloudEvent::builder(id, SOURCE, event_type)
        .time_utc(time)
        .json_data(serde_json::json!({ "id": id }))
        .build()
        .expect("Invalid fixture event")
}
