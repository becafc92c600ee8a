use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Logical topic that receives terminal failure records.
pub const ERROR_TOPIC: &str = "change-prop.error";

/// Prefix of the per-rule retry topics.
pub const RETRY_TOPIC_PREFIX: &str = "change-prop.retry.";

/// Logical topic carrying dynamic rule registrations.
pub const RULES_TOPIC: &str = "change-prop.rules";

pub const RETRY_SCHEMA_URI: &str = "retry/1";
pub const ERROR_SCHEMA_URI: &str = "error/1";

/// Retry topic for a rule topic, without any datacenter prefix.
pub fn retry_topic(rule_topic: &str) -> String {
    format!("{RETRY_TOPIC_PREFIX}{rule_topic}")
}

/// Identifier stamped on retry and error messages emitted on behalf of a rule.
pub fn emitter_id(rule_name: &str) -> String {
    format!("change-prop#{rule_name}")
}

/// Turns a rule name into something usable as a metric label.
pub fn normalize_stat_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The `meta` block every event on the bus carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    #[serde(default)]
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_uri: Option<String>,
    #[serde(default)]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl EventMeta {
    /// Parsed `dt`, if present and well-formed.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.dt
            .as_deref()
            .and_then(|dt| DateTime::parse_from_rfc3339(dt).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Anything that contributes a hop to a triggered-by chain.
pub trait Traceable {
    fn meta(&self) -> &EventMeta;

    fn triggered_by(&self) -> Option<&str>;

    /// The chain inherited by actions taken on behalf of this message:
    /// the previous chain with `<topic>:<uri>` of this message appended.
    fn trigger_chain(&self) -> String {
        append_trigger(self.triggered_by(), self.meta())
    }
}

pub fn append_trigger(previous: Option<&str>, meta: &EventMeta) -> String {
    match previous {
        Some(prev) if !prev.is_empty() => format!("{prev},{}:{}", meta.topic, meta.uri),
        _ => format!("{}:{}", meta.topic, meta.uri),
    }
}

/// An immutable event consumed from the bus. The full JSON document is kept
/// as-is so rules can match on rule-specific fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    meta: EventMeta,
    body: Value,
}

impl Event {
    pub fn from_value(body: Value) -> Result<Self> {
        let meta = body
            .get("meta")
            .ok_or_else(|| Error::InvalidEvent("event has no meta property".to_string()))?;
        let meta: EventMeta = serde_json::from_value(meta.clone())
            .map_err(|e| Error::InvalidEvent(format!("malformed meta: {e}")))?;
        if meta.topic.is_empty() {
            return Err(Error::InvalidEvent(
                "event must have a meta.topic property".to_string(),
            ));
        }
        Ok(Self { meta, body })
    }

    pub fn meta(&self) -> &EventMeta {
        &self.meta
    }

    pub fn as_value(&self) -> &Value {
        &self.body
    }

    pub fn into_value(self) -> Value {
        self.body
    }
}

impl Traceable for Event {
    fn meta(&self) -> &EventMeta {
        &self.meta
    }

    fn triggered_by(&self) -> Option<&str> {
        self.body.get("triggered_by").and_then(Value::as_str)
    }
}

/// Wraps an event whose processing failed and should be attempted again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryMessage {
    pub meta: EventMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    pub emitter_id: String,
    pub retries_left: i64,
    pub original_event: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RetryMessage {
    /// `meta.id` and `meta.dt` stay empty; they are assigned when the
    /// message is published.
    pub fn for_event(
        event: &Event,
        rule_topic: &str,
        emitter_id: String,
        retries_left: i64,
        triggered_by: String,
        reason: Option<String>,
    ) -> Self {
        let origin = event.meta();
        Self {
            meta: EventMeta {
                topic: retry_topic(rule_topic),
                schema_uri: Some(RETRY_SCHEMA_URI.to_string()),
                uri: origin.uri.clone(),
                request_id: origin.request_id.clone(),
                id: None,
                dt: None,
                domain: origin.domain.clone(),
            },
            triggered_by: Some(triggered_by),
            emitter_id,
            retries_left,
            original_event: event.as_value().clone(),
            reason,
        }
    }
}

impl Traceable for RetryMessage {
    fn meta(&self) -> &EventMeta {
        &self.meta
    }

    fn triggered_by(&self) -> Option<&str> {
        self.triggered_by.as_deref()
    }
}

/// Transport-level information attached to an error record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

/// What could not be processed: either a payload that never parsed,
/// or a structured message.
#[derive(Debug, Clone, Copy)]
pub enum FailedInput<'a> {
    Raw(&'a str),
    Message(&'a Value),
}

/// A terminal failure record published to the error topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub meta: EventMeta,
    pub emitter_id: String,
    pub raw_event: String,
    pub message: String,
    pub stack: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

impl ErrorMessage {
    pub fn new(
        input: FailedInput<'_>,
        emitter_id: String,
        message: String,
        stack: String,
        details: Option<ErrorDetails>,
    ) -> Self {
        let now = Utc::now();
        let (uri, request_id, domain, raw_event) = match input {
            FailedInput::Raw(raw) => (
                "/error/uri".to_string(),
                None,
                "unknown".to_string(),
                raw.to_string(),
            ),
            FailedInput::Message(value) => {
                let meta = value.get("meta");
                let field = |name: &str| {
                    meta.and_then(|m| m.get(name))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                };
                (
                    field("uri").unwrap_or_else(|| "/error/uri".to_string()),
                    field("request_id"),
                    field("domain").unwrap_or_else(|| "unknown".to_string()),
                    value.to_string(),
                )
            }
        };

        Self {
            meta: EventMeta {
                topic: ERROR_TOPIC.to_string(),
                schema_uri: Some(ERROR_SCHEMA_URI.to_string()),
                uri,
                request_id,
                id: Some(Uuid::new_v4().to_string()),
                dt: Some(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
                domain: Some(domain),
            },
            emitter_id,
            raw_event,
            message,
            stack,
            details,
        }
    }
}

/// Assigns `meta.id` and `meta.dt` when absent. Values that are already
/// present are never touched.
pub fn stamp_meta(event: &mut Value) -> Result<()> {
    let meta = event
        .get_mut("meta")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::InvalidEvent("event has no meta property".to_string()))?;

    let missing = |v: Option<&Value>| v.map_or(true, Value::is_null);
    if missing(meta.get("id")) {
        meta.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
    }
    if missing(meta.get("dt")) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        meta.insert("dt".to_string(), Value::String(now));
    }
    Ok(())
}
