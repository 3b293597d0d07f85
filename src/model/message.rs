use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error};

/// Where a modal message is anchored on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePosition {
    Top,
    #[default]
    Center,
    Bottom,
}

impl MessagePosition {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "top" => Some(Self::Top),
            "center" => Some(Self::Center),
            "bottom" => Some(Self::Bottom),
            _ => None,
        }
    }
}

/// Display cap and cooldown for broadcast messages.
///
/// `count == 0` means unlimited. `delay` is in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastFrequency {
    pub count: i64,
    pub delay: i64,
    pub ignore_dismiss: bool,
}

impl BroadcastFrequency {
    /// Negative values make the whole message invalid.
    pub fn is_valid(&self) -> bool {
        self.count >= 0 && self.delay >= 0
    }

    pub fn shows_always(&self) -> bool {
        self.count == 0 && self.delay == 0
    }
}

/// The `gist` section of a message's property bag, parsed once.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GistProperties {
    pub route_rule: Option<String>,
    pub element_id: Option<String>,
    pub campaign_id: Option<String>,
    pub position: MessagePosition,
    pub persistent: bool,
    /// Formatted as `#RRGGBBAA`.
    pub overlay_color: Option<String>,
    pub broadcast: Option<BroadcastFrequency>,
}

impl GistProperties {
    fn from_properties(properties: &Map<String, Value>) -> Self {
        let Some(gist) = properties.get("gist").and_then(Value::as_object) else {
            return Self::default();
        };

        let string = |key: &str| gist.get(key).and_then(Value::as_str).map(str::to_owned);

        Self {
            route_rule: string("routeRule").or_else(|| string("routeRuleAndroid")),
            element_id: string("elementId"),
            campaign_id: string("campaignId"),
            position: gist
                .get("position")
                .and_then(Value::as_str)
                .and_then(MessagePosition::parse)
                .unwrap_or_default(),
            persistent: gist
                .get("persistent")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            overlay_color: string("overlayColor"),
            broadcast: parse_broadcast(gist),
        }
    }
}

fn parse_broadcast(gist: &Map<String, Value>) -> Option<BroadcastFrequency> {
    let frequency = gist
        .get("broadcast")?
        .as_object()?
        .get("frequency")?
        .as_object()?;

    let number = |key: &str| {
        let value = frequency.get(key)?;
        value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
    };
    let count = number("count");
    let delay = number("delay");

    match (count, delay) {
        (Some(count), Some(delay)) => Some(BroadcastFrequency {
            count,
            delay,
            ignore_dismiss: frequency
                .get("ignoreDismiss")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        _ => {
            error!(?count, ?delay, "broadcast message has invalid frequency data, skipping it");
            None
        }
    }
}

/// A server-delivered in-app message.
///
/// Messages are immutable values; two messages are equal when every field
/// is equal. The `gist` properties are parsed when the message is built and
/// kept alongside the raw property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawMessage", into = "RawMessage")]
pub struct Message {
    pub message_id: String,
    pub queue_id: Option<String>,
    pub priority: Option<i32>,
    pub properties: Map<String, Value>,
    gist: GistProperties,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    queue_id: Option<String>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
}

impl From<RawMessage> for Message {
    fn from(raw: RawMessage) -> Self {
        let properties = raw.properties.unwrap_or_default();
        Self {
            gist: GistProperties::from_properties(&properties),
            message_id: raw.message_id,
            queue_id: raw.queue_id,
            priority: raw.priority,
            properties,
        }
    }
}

impl From<Message> for RawMessage {
    fn from(message: Message) -> Self {
        Self {
            message_id: message.message_id,
            priority: message.priority,
            queue_id: message.queue_id,
            properties: Some(message.properties),
        }
    }
}

impl Message {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            queue_id: None,
            priority: None,
            properties: Map::new(),
            gist: GistProperties::default(),
        }
    }

    pub fn with_queue_id(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Replaces the property bag and re-parses the `gist` section.
    ///
    /// Non-object values leave the bag empty.
    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = match properties {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.gist = GistProperties::from_properties(&self.properties);
        self
    }

    pub fn gist(&self) -> &GistProperties {
        &self.gist
    }

    pub fn element_id(&self) -> Option<&str> {
        self.gist.element_id.as_deref()
    }

    /// Inline messages are bound to an element; everything else is modal.
    pub fn is_embedded(&self) -> bool {
        self.gist.element_id.is_some()
    }

    pub fn is_persistent(&self) -> bool {
        self.gist.persistent
    }

    pub fn broadcast(&self) -> Option<&BroadcastFrequency> {
        self.gist.broadcast.as_ref()
    }

    pub fn is_broadcast(&self) -> bool {
        self.gist.broadcast.is_some()
    }

    /// Full-string match of the route rule against `route`.
    ///
    /// A message without a rule matches everywhere. With a rule, an unknown
    /// route or an invalid pattern never matches.
    pub fn matches_route(&self, route: Option<&str>) -> bool {
        match (&self.gist.route_rule, route) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(rule), Some(route)) => match compile_route_rule(rule) {
                Some(regex) => regex.is_match(route),
                None => false,
            },
        }
    }

    /// Like [`Message::matches_route`] but an invalid pattern counts as a match.
    pub fn route_allows(&self, route: Option<&str>) -> bool {
        match (&self.gist.route_rule, route) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(rule), Some(route)) => match compile_route_rule(rule) {
                Some(regex) => regex.is_match(route),
                None => true,
            },
        }
    }
}

fn compile_route_rule(rule: &str) -> Option<Regex> {
    match Regex::new(&format!("^(?:{rule})$")) {
        Ok(regex) => Some(regex),
        Err(e) => {
            debug!(rule, error = %e, "problem processing route rule regex");
            None
        }
    }
}
