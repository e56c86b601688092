// Copyright (c) 2025 - Cowboy AI, Inc.
//! Event attribute filters
//!
//! A [`Filter`] is a conjunction of `(attribute path, condition)` pairs over
//! CloudEvent attributes. Recognized paths are the CloudEvents attributes,
//! the engine-owned `streamid`/`streamversion` extensions, and dotted paths
//! into a JSON payload (`data.order.total`).
//!
//! Filters lower two ways, and the two agree on every event population:
//!
//! - [`Filter::to_query`] produces the MongoDB query document
//! - [`Filter::matches`] evaluates the same predicate in memory, used by the
//!   in-memory store and as a safety net on the subscription path
//!
//! # Example
//!
//! ```rust
//! use occurrent::condition::Condition;
//! use occurrent::filter::Filter;
//!
//! let filter = Filter::stream_id("game-42")
//!     .and(Filter::stream_version(Condition::gte(3)));
//! ```

use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};

use crate::condition::{ComparisonOperator, Condition, CompositionOperator};
use crate::document::{format_rfc3339, TimeRepresentation};
use crate::errors::{OccurrentError, OccurrentResult};
use crate::event::{AttributeValue, CloudEvent, STREAM_ID, STREAM_VERSION};

/// Attribute paths addressable without a `data.` prefix
const KNOWN_ATTRIBUTES: &[&str] = &[
    "id",
    "source",
    "type",
    "specversion",
    "subject",
    "time",
    "datacontenttype",
    "dataschema",
    STREAM_ID,
    STREAM_VERSION,
];

/// One attribute-path constraint within a filter
#[derive(Debug, Clone, PartialEq)]
struct Constraint {
    path: String,
    condition: Condition<AttributeValue>,
}

/// A conjunction of attribute conditions over CloudEvents
///
/// The empty filter matches every event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    constraints: Vec<Constraint>,
}

impl Filter {
    /// The filter that matches every event
    pub fn all() -> Self {
        Filter::default()
    }

    /// Whether this filter has no constraints
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Constrain an arbitrary recognized attribute path
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the path is not a CloudEvent attribute,
    /// `streamid`, `streamversion`, or a dotted `data.` path, or if an
    /// ordering comparison is applied to a non-orderable operand.
    pub fn attribute(
        path: impl Into<String>,
        condition: Condition<AttributeValue>,
    ) -> OccurrentResult<Self> {
        let path = path.into();
        validate_path(&path)?;
        validate_condition(&path, &condition)?;
        Ok(Filter {
            constraints: vec![Constraint { path, condition }],
        })
    }

    /// Events belonging to the given stream
    pub fn stream_id(stream_id: impl Into<String>) -> Self {
        Filter {
            constraints: vec![Constraint {
                path: STREAM_ID.to_string(),
                condition: Condition::eq(AttributeValue::String(stream_id.into())),
            }],
        }
    }

    /// Events whose stream version satisfies the condition
    pub fn stream_version(condition: Condition<u64>) -> Self {
        Filter {
            constraints: vec![Constraint {
                path: STREAM_VERSION.to_string(),
                condition: condition.map(&|v| AttributeValue::Integer(v as i64)),
            }],
        }
    }

    /// Events with the given id
    pub fn id(id: impl Into<String>) -> Self {
        Filter {
            constraints: vec![Constraint {
                path: "id".to_string(),
                condition: Condition::eq(AttributeValue::String(id.into())),
            }],
        }
    }

    /// Events with the given source
    pub fn source(source: impl Into<String>) -> Self {
        Filter {
            constraints: vec![Constraint {
                path: "source".to_string(),
                condition: Condition::eq(AttributeValue::String(source.into())),
            }],
        }
    }

    /// Events of the given type
    pub fn event_type(event_type: impl Into<String>) -> Self {
        Filter {
            constraints: vec![Constraint {
                path: "type".to_string(),
                condition: Condition::eq(AttributeValue::String(event_type.into())),
            }],
        }
    }

    /// Events with the given subject
    pub fn subject(subject: impl Into<String>) -> Self {
        Filter {
            constraints: vec![Constraint {
                path: "subject".to_string(),
                condition: Condition::eq(AttributeValue::String(subject.into())),
            }],
        }
    }

    /// Events whose occurrence time satisfies the condition
    pub fn time(condition: Condition<DateTime<Utc>>) -> Self {
        Filter {
            constraints: vec![Constraint {
                path: "time".to_string(),
                condition: condition.map(&AttributeValue::Timestamp),
            }],
        }
    }

    /// Events whose JSON payload satisfies the condition at a dotted path
    ///
    /// `path` is relative to the payload root, e.g. `"order.total"`.
    pub fn data(
        path: impl Into<String>,
        condition: Condition<AttributeValue>,
    ) -> OccurrentResult<Self> {
        Filter::attribute(format!("data.{}", path.into()), condition)
    }

    /// Conjoin with another filter
    pub fn and(mut self, other: Filter) -> Self {
        self.constraints.extend(other.constraints);
        self
    }

    /// Lower to a MongoDB query document
    pub fn to_query(&self, time_representation: TimeRepresentation) -> Document {
        self.to_query_prefixed("", time_representation)
    }

    /// Lower to a MongoDB query document with every field prefixed
    ///
    /// Used for change-stream pipelines where event fields live under
    /// `fullDocument.`.
    pub fn to_query_prefixed(
        &self,
        prefix: &str,
        time_representation: TimeRepresentation,
    ) -> Document {
        let mut parts: Vec<Document> = self
            .constraints
            .iter()
            .map(|c| {
                condition_to_query(
                    &format!("{}{}", prefix, c.path),
                    &c.path,
                    &c.condition,
                    time_representation,
                )
            })
            .collect();

        match parts.len() {
            0 => Document::new(),
            1 => parts.remove(0),
            _ => doc! { "$and": parts },
        }
    }

    /// Evaluate the filter against a decoded event
    ///
    /// Agrees with [`Filter::to_query`] on every event, including the
    /// missing-attribute semantics of `$ne` and `$nor`.
    pub fn matches(&self, event: &CloudEvent) -> bool {
        self.constraints.iter().all(|c| {
            let value = attribute_value(event, &c.path);
            evaluate(&c.condition, value.as_ref())
        })
    }
}

fn validate_path(path: &str) -> OccurrentResult<()> {
    if KNOWN_ATTRIBUTES.contains(&path) {
        return Ok(());
    }
    if let Some(rest) = path.strip_prefix("data.") {
        if !rest.is_empty() {
            return Ok(());
        }
    }
    Err(OccurrentError::InvalidArgument(format!(
        "unknown filter attribute path '{}'",
        path
    )))
}

fn validate_condition(path: &str, condition: &Condition<AttributeValue>) -> OccurrentResult<()> {
    for (operator, operand) in condition.comparisons() {
        if operator.requires_ordering() && !operand.is_orderable() {
            return Err(OccurrentError::InvalidArgument(format!(
                "attribute '{}': ordering comparison on non-orderable value '{}'",
                path, operand
            )));
        }
        if path == STREAM_VERSION && !matches!(operand, AttributeValue::Integer(_)) {
            return Err(OccurrentError::InvalidArgument(format!(
                "attribute '{}': operand must be an integer",
                STREAM_VERSION
            )));
        }
    }
    Ok(())
}

fn operator_key(operator: ComparisonOperator) -> &'static str {
    match operator {
        ComparisonOperator::Eq => "$eq",
        ComparisonOperator::Lt => "$lt",
        ComparisonOperator::Gt => "$gt",
        ComparisonOperator::Lte => "$lte",
        ComparisonOperator::Gte => "$gte",
        ComparisonOperator::Ne => "$ne",
    }
}

fn condition_to_query(
    field: &str,
    logical_path: &str,
    condition: &Condition<AttributeValue>,
    time_representation: TimeRepresentation,
) -> Document {
    match condition {
        Condition::Single { operator, operand } => {
            let value = operand_to_bson(logical_path, operand, time_representation);
            doc! { field: { operator_key(*operator): value } }
        }
        Condition::Multi { operator, operands } => {
            let children: Vec<Document> = operands
                .iter()
                .map(|c| condition_to_query(field, logical_path, c, time_representation))
                .collect();
            match operator {
                CompositionOperator::And => doc! { "$and": children },
                CompositionOperator::Or => doc! { "$or": children },
                // $nor over the single child gives mongo's logical negation,
                // including matching documents that lack the field
                CompositionOperator::Not => doc! { "$nor": children },
            }
        }
    }
}

fn operand_to_bson(
    logical_path: &str,
    operand: &AttributeValue,
    time_representation: TimeRepresentation,
) -> Bson {
    match operand {
        AttributeValue::String(s) => Bson::String(s.clone()),
        AttributeValue::Integer(n) => Bson::Int64(*n),
        AttributeValue::Float(x) => Bson::Double(*x),
        AttributeValue::Boolean(b) => Bson::Boolean(*b),
        AttributeValue::Timestamp(t) => {
            // The `time` attribute is stored per the configured representation;
            // timestamps elsewhere are native dates
            if logical_path == "time"
                && time_representation == TimeRepresentation::Rfc3339String
            {
                Bson::String(format_rfc3339(&t.fixed_offset()))
            } else {
                Bson::DateTime(bson::DateTime::from_chrono(*t))
            }
        }
    }
}

fn attribute_value(event: &CloudEvent, path: &str) -> Option<AttributeValue> {
    match path {
        "id" => Some(AttributeValue::String(event.id.clone())),
        "source" => Some(AttributeValue::String(event.source.clone())),
        "type" => Some(AttributeValue::String(event.event_type.clone())),
        "specversion" => Some(AttributeValue::String(event.specversion.clone())),
        "subject" => event.subject.clone().map(AttributeValue::String),
        "time" => event
            .time
            .map(|t| AttributeValue::Timestamp(t.with_timezone(&Utc))),
        "datacontenttype" => event.datacontenttype.clone().map(AttributeValue::String),
        "dataschema" => event.dataschema.clone().map(AttributeValue::String),
        path if path == STREAM_ID || path == STREAM_VERSION => {
            event.extensions.get(path).cloned()
        }
        path => {
            let rest = path.strip_prefix("data.")?;
            let json = event.data.as_ref()?.as_json()?;
            let pointer = format!("/{}", rest.replace('.', "/"));
            json_scalar(json.pointer(&pointer)?)
        }
    }
}

fn json_scalar(value: &serde_json::Value) -> Option<AttributeValue> {
    match value {
        serde_json::Value::String(s) => Some(AttributeValue::String(s.clone())),
        serde_json::Value::Bool(b) => Some(AttributeValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(AttributeValue::Integer(i))
            } else {
                n.as_f64().map(AttributeValue::Float)
            }
        }
        _ => None,
    }
}

fn evaluate(condition: &Condition<AttributeValue>, value: Option<&AttributeValue>) -> bool {
    match condition {
        Condition::Single { operator, operand } => match (operator, value) {
            // $ne matches documents missing the field
            (ComparisonOperator::Ne, None) => true,
            (ComparisonOperator::Ne, Some(v)) => v != operand,
            (ComparisonOperator::Eq, Some(v)) => v == operand,
            (ComparisonOperator::Lt, Some(v)) => v < operand,
            (ComparisonOperator::Gt, Some(v)) => v > operand,
            (ComparisonOperator::Lte, Some(v)) => v <= operand,
            (ComparisonOperator::Gte, Some(v)) => v >= operand,
            (_, None) => false,
        },
        Condition::Multi { operator, operands } => match operator {
            CompositionOperator::And => operands.iter().all(|c| evaluate(c, value)),
            CompositionOperator::Or => operands.iter().any(|c| evaluate(c, value)),
            CompositionOperator::Not => !evaluate(&operands[0], value),
        },
    }
}
