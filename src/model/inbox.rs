use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

/// A message kept in the user's inbox until it expires or is deleted.
///
/// Unlike in-app messages, inbox entries always carry a queue id and a send
/// time; server entries missing either are dropped on intake.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxMessage {
    pub queue_id: String,
    pub delivery_id: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,
    pub topics: Vec<String>,
    pub message_type: String,
    pub opened: bool,
    pub priority: Option<i32>,
    pub properties: Map<String, Value>,
}

/// Wire form of an inbox entry. Every field is optional on the wire.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxMessageResponse {
    #[serde(default)]
    pub queue_id: Option<String>,
    #[serde(default)]
    pub delivery_id: Option<String>,
    #[serde(default)]
    pub expiry: Option<Value>,
    #[serde(default)]
    pub sent_at: Option<Value>,
    #[serde(default)]
    pub topics: Option<Vec<String>>,
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub opened: Option<bool>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

/// Timestamps arrive either as epoch milliseconds or RFC 3339 text.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

impl InboxMessage {
    pub fn new(queue_id: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self {
            queue_id: queue_id.into(),
            delivery_id: None,
            expiry: None,
            sent_at,
            topics: Vec::new(),
            message_type: String::new(),
            opened: false,
            priority: None,
            properties: Map::new(),
        }
    }

    /// Builds the domain value, or `None` when the queue id or send time is
    /// missing or unreadable.
    pub fn from_response(response: InboxMessageResponse) -> Option<Self> {
        let queue_id = response.queue_id?;
        let sent_at = response.sent_at.as_ref().and_then(parse_timestamp)?;
        Some(Self {
            queue_id,
            delivery_id: response.delivery_id,
            expiry: response.expiry.as_ref().and_then(parse_timestamp),
            sent_at,
            topics: response.topics.unwrap_or_default(),
            message_type: response.message_type.unwrap_or_default(),
            opened: response.opened.unwrap_or(false),
            priority: response.priority,
            properties: response.properties.unwrap_or_default(),
        })
    }

    pub fn with_delivery_id(mut self, delivery_id: impl Into<String>) -> Self {
        self.delivery_id = Some(delivery_id.into());
        self
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_opened(mut self, opened: bool) -> Self {
        self.opened = opened;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Case-insensitive topic membership.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t.eq_ignore_ascii_case(topic))
    }

    /// Identity used to drop duplicates: the delivery id, else the queue id.
    pub fn dedup_key(&self) -> &str {
        self.delivery_id.as_deref().unwrap_or(&self.queue_id)
    }
}
