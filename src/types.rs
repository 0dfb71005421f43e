// OMChat Client: Core types
// Data structures shared across the token, conversation, and stream layers.
// The wire format is loosely shaped JSON, so payloads stay `serde_json::Value`
// and only the envelope fields are typed.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Header/field name of the client instance identifier. Known to arrive
/// comma-duplicated from upstream; every ingestion path collapses it.
pub const CLIENT_INSTANCE_KEY: &str = "Client-Instance-Identifier";

// ── Token set ──────────────────────────────────────────────────────────

/// The raw token material captured at login or refresh.
///
/// Keys mix response-header names (`OM-Access-Token`, …) with body fields
/// (`access_token`, `expires_in`, …), so this stays an open map with typed
/// accessors rather than a fixed struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenSet(pub Map<String, Value>);

impl TokenSet {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), Value::String(value.into()));
    }

    /// A session is usable when either access-token spelling is present
    /// and non-empty.
    pub fn has_access_token(&self) -> bool {
        self.get_str("OM-Access-Token")
            .or_else(|| self.get_str("access_token"))
            .is_some_and(|t| !t.is_empty())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.get_str("refresh_token").filter(|t| !t.is_empty())
    }

    pub fn client_instance_identifier(&self) -> Option<&str> {
        self.get_str(CLIENT_INSTANCE_KEY)
    }

    /// `expires_at` as epoch seconds. Accepts a JSON number or a numeric
    /// string; anything else reads as absent.
    pub fn expires_at_secs(&self) -> Option<i64> {
        self.0.get("expires_at").and_then(value_as_secs)
    }

    /// `expires_in` as relative seconds from now.
    pub fn expires_in_secs(&self) -> Option<i64> {
        self.0.get("expires_in").and_then(value_as_secs)
    }
}

fn value_as_secs(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Collapse a comma-duplicated identifier to its first segment.
/// Returns the sanitized value and whether duplication was detected.
pub fn sanitize_instance_id(raw: &str) -> (String, bool) {
    match raw.split_once(',') {
        Some((first, _)) => (first.trim().to_string(), true),
        None => (raw.to_string(), false),
    }
}

// ── Stream events ──────────────────────────────────────────────────────

/// Normalized envelope for one decoded wire event. Every non-blank frame
/// maps to exactly one of these before reaching the caller's sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// SSE frame id, informational only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl StreamEvent {
    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent {
            status: Some(EventStatus::Error),
            event_type: Some(EventKind::Error),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        StreamEvent {
            status: Some(EventStatus::Info),
            event_type: Some(EventKind::Info),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// The synthesized terminal event sent when the byte stream ends.
    pub fn completed(data: Value) -> Self {
        StreamEvent {
            status: Some(EventStatus::Completed),
            event_type: Some(EventKind::Completion),
            data: Some(data),
            ..Default::default()
        }
    }
}

/// Wire `status` of an event. The server vocabulary is open-ended, so
/// unrecognized statuses are carried through verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum EventStatus {
    ToolCall,
    Completed,
    PartialResult,
    Error,
    Info,
    Other(String),
}

impl EventStatus {
    pub fn as_str(&self) -> &str {
        match self {
            EventStatus::ToolCall => "tool_call",
            EventStatus::Completed => "completed",
            EventStatus::PartialResult => "partial_result",
            EventStatus::Error => "error",
            EventStatus::Info => "info",
            EventStatus::Other(s) => s,
        }
    }
}

impl From<&str> for EventStatus {
    fn from(s: &str) -> Self {
        match s {
            "tool_call" => EventStatus::ToolCall,
            "completed" => EventStatus::Completed,
            "partial_result" => EventStatus::PartialResult,
            "error" => EventStatus::Error,
            "info" => EventStatus::Info,
            other => EventStatus::Other(other.to_string()),
        }
    }
}

impl Serialize for EventStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventStatus::from(s.as_str()))
    }
}

/// Derived `event_type` of an event, parallel to `EventStatus`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    AgentThinks,
    AgentMessage,
    Completion,
    Error,
    Info,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::AgentThinks => "agent_thinks",
            EventKind::AgentMessage => "agent_message",
            EventKind::Completion => "completion",
            EventKind::Error => "error",
            EventKind::Info => "info",
            EventKind::Other(s) => s,
        }
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "agent_thinks" => EventKind::AgentThinks,
            "agent_message" => EventKind::AgentMessage,
            "completion" => EventKind::Completion,
            "error" => EventKind::Error,
            "info" => EventKind::Info,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventKind::from(s.as_str()))
    }
}

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence.
/// Used to keep server error bodies out of log-flooding territory.
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ── Session outcomes & signals ─────────────────────────────────────────

/// Result of a login attempt, surfaced to the host UI.
#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenSet>,
}

/// Cross-component signals the facade broadcasts to subscribers, so
/// hosts learn about session changes without a global event bus.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// Tokens were cleared after an unrecoverable refresh failure; the
    /// host should navigate to login.
    AuthFailure,
    /// The user logged out explicitly.
    LoggedOut,
}

// ── Tests ──────────────────────────────────────────────────────────────
