// OMChat Client: SSE wire format
// Pure decoding layer: no I/O. A frame is a blank-line-delimited block of
// `field: value` lines. The agent API emits several payload shapes for the
// same logical events, so decoding ends with a fixed normalization cascade
// that maps every non-blank frame to exactly one `StreamEvent`.

use crate::types::{EventKind, EventStatus, StreamEvent};
use serde_json::{Map, Value};

/// One parsed frame, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// The last `data:` line, JSON-parsed when possible, else the raw string.
    pub payload: Option<Value>,
    /// The `event:` name, if any.
    pub event: Option<String>,
    /// The `id:` line, informational only.
    pub id: Option<String>,
}

/// Parse a frame into its fields. Returns `None` for blank frames.
/// Unrecognized lines are ignored. A malformed JSON `data:` line is kept
/// as a raw string payload rather than failing the frame.
pub fn parse_frame(frame: &str) -> Option<RawFrame> {
    if frame.trim().is_empty() {
        return None;
    }

    let mut payload = None;
    let mut event = None;
    let mut id = None;

    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.trim();
            payload = Some(
                serde_json::from_str::<Value>(rest)
                    .unwrap_or_else(|_| Value::String(rest.to_string())),
            );
        } else if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("id:") {
            id = Some(rest.trim().to_string());
        }
    }

    Some(RawFrame { payload, event, id })
}

/// Normalize a raw frame into the envelope the UI consumes.
///
/// The inference rules run in a fixed order and apply cumulatively:
///   1. an `event:` name fills a missing `event_type`
///   2. payload `status == "tool_call"` fills a missing `event_type`
///      with `agent_thinks`
///   3. a payload `tool` field without a `status` marks the event a tool
///      call (`status = tool_call`, `event_type = agent_thinks`)
///   4. a payload `ai_message` field fills a missing `event_type` with
///      `agent_message`
///   5. an `event:` name fills a missing payload `status`
///
/// The result is flattened one level: `data` carries the payload's nested
/// `data` object when present, else the payload itself, so downstream
/// reads (`data.tool`, `data.conversation_id`, `data.content`) always go
/// through `event.data`. Tool-call events additionally get their top-level
/// `tool`/`ai_message` fields migrated into the nested object.
pub fn normalize(frame: RawFrame) -> StreamEvent {
    let RawFrame { payload, event, id } = frame;

    let mut event_type: Option<EventKind> = None;
    let mut status: Option<EventStatus> = None;

    let payload_obj = payload.as_ref().and_then(Value::as_object);
    let payload_status = payload_obj
        .and_then(|p| p.get("status"))
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    let has_tool = payload_obj.is_some_and(|p| p.contains_key("tool"));
    let has_ai_message = payload_obj.is_some_and(|p| p.contains_key("ai_message"));

    // Rule 1: event name → event_type
    if let Some(name) = &event {
        event_type = Some(EventKind::from(name.as_str()));
    }
    // Rule 2: status tool_call → agent_thinks
    if event_type.is_none() && payload_status.as_deref() == Some("tool_call") {
        event_type = Some(EventKind::AgentThinks);
    }
    // Rule 3: bare tool field → tool call
    if has_tool && payload_status.is_none() {
        if event_type.is_none() {
            event_type = Some(EventKind::AgentThinks);
        }
        status = Some(EventStatus::ToolCall);
    }
    // Rule 4: ai_message → agent_message
    if event_type.is_none() && has_ai_message {
        event_type = Some(EventKind::AgentMessage);
    }
    // Rule 5: event name → status, unless the payload carried one
    if status.is_none() {
        if let Some(s) = &payload_status {
            status = Some(EventStatus::from(s.as_str()));
        } else if let Some(name) = &event {
            status = Some(EventStatus::from(name.as_str()));
        }
    }

    let message = payload_obj
        .and_then(|p| p.get("message"))
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    let detail = payload_obj
        .and_then(|p| p.get("detail"))
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    let is_tool_call =
        status == Some(EventStatus::ToolCall) || event_type == Some(EventKind::AgentThinks);

    let data = match payload {
        Some(Value::Object(mut p)) => {
            let nested = p.remove("data");
            if is_tool_call {
                // Ensure a nested object exists and migrate the loose
                // tool/ai_message fields into it.
                let mut map = match nested {
                    Some(Value::Object(m)) => m,
                    Some(other) => {
                        // Non-object nested data on a tool call: keep as-is,
                        // nothing to migrate into.
                        return StreamEvent {
                            status: status.or(Some(EventStatus::ToolCall)),
                            event_type: event_type.or(Some(EventKind::AgentThinks)),
                            data: Some(other),
                            message,
                            detail,
                            id,
                        };
                    }
                    None => Map::new(),
                };
                if let Some(tool) = p.remove("tool") {
                    map.entry("tool").or_insert(tool);
                }
                if let Some(ai_message) = p.remove("ai_message") {
                    map.entry("ai_message").or_insert(ai_message);
                }
                if map.is_empty() && !p.is_empty() {
                    // Nothing recognizable to migrate; fall back to the
                    // remaining payload so content is never dropped.
                    map = p;
                }
                Some(Value::Object(map))
            } else {
                // Flatten: nested data when present, else the payload itself.
                nested.or(if p.is_empty() { None } else { Some(Value::Object(p)) })
            }
        }
        Some(other) => Some(other),
        None => None,
    };

    let (status, event_type) = if is_tool_call {
        (
            status.or(Some(EventStatus::ToolCall)),
            event_type.or(Some(EventKind::AgentThinks)),
        )
    } else {
        (status, event_type)
    };

    StreamEvent { status, event_type, data, message, detail, id }
}

/// Parse and normalize in one step. Returns `None` for blank frames.
pub fn decode_frame(frame: &str) -> Option<StreamEvent> {
    parse_frame(frame).map(normalize)
}

/// Extract the terminal result from a completion payload.
///
/// Objects are taken as-is with `content` mirrored into `result` when no
/// `result` field exists. Strings are re-parsed as JSON when possible and
/// otherwise wrapped as `{ result, content }`. When nothing usable is
/// found, a generic success payload stands in. A `conversation_id` on the
/// original payload is always carried across.
pub fn extract_result(data: &Value) -> Value {
    let mut result: Map<String, Value> = match data {
        Value::Object(obj) => {
            let mut r = obj.clone();
            if let Some(content) = obj.get("content").cloned() {
                if !r.contains_key("result") {
                    r.insert("result".into(), content);
                }
            }
            r
        }
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(mut parsed)) => {
                if let Some(content) = parsed.get("content").cloned() {
                    if !parsed.contains_key("result") {
                        parsed.insert("result".into(), content);
                    }
                }
                parsed
            }
            // Scalars and parse failures both wrap the raw string.
            _ => {
                let mut r = Map::new();
                r.insert("result".into(), Value::String(s.clone()));
                r.insert("content".into(), Value::String(s.clone()));
                r
            }
        },
        _ => Map::new(),
    };

    if result.is_empty() {
        result.insert(
            "result".into(),
            Value::String("Operation completed successfully.".into()),
        );
    }

    if let Some(cid) = data.get("conversation_id").cloned() {
        result.entry("conversation_id").or_insert(cid);
    }

    Value::Object(result)
}

// ── Tests ──────────────────────────────────────────────────────────────
