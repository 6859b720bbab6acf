//! Wire envelopes exchanged with the JS runtime.
//!
//! Native → JS: [`CallEnvelope`] `{ id, method, params }`.
//! JS → native: `{ kind: "response", id, result | error }` or
//! `{ kind: "event", type, payload, id? }`. [`classify`] turns a raw inbound
//! payload into an [`InboundMessage`] without ever failing.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RESPONSE_KIND: &str = "response";
pub const EVENT_KIND: &str = "event";

const JS_ERROR_FALLBACK: &str = "JS evaluation failed";

static CALL_ID_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#""id"\s*:\s*(?:"([^"\\]+)"|(\d+))"#).ok());

/// A call sent into the JS runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub id: String,
    pub method: String,
    pub params: Option<Value>,
}

impl CallEnvelope {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A decoded response; `outcome` is `Err` when the JS side threw.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub id: String,
    pub outcome: Result<Value, String>,
}

/// An unsolicited event emitted by the JS runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub id: Option<String>,
    pub event_type: String,
    pub payload: Value,
}

/// Classification of one inbound transport payload.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response(ResponseEnvelope),
    Event(EventEnvelope),
    /// The payload could not be decoded; `id` is set when one was recoverable.
    Malformed { id: Option<String>, reason: String },
    /// Valid JSON that is neither a response nor an event.
    Unroutable { reason: String },
}

/// Classify a raw inbound payload.
pub fn classify(raw: &str) -> InboundMessage {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            return InboundMessage::Malformed {
                id: recover_call_id(raw),
                reason: format!("unparseable payload: {e}"),
            };
        }
    };
    classify_value(value)
}

/// Classify an already-parsed inbound payload.
pub fn classify_value(value: Value) -> InboundMessage {
    let Value::Object(mut map) = value else {
        return InboundMessage::Unroutable {
            reason: "payload is not a JSON object".into(),
        };
    };

    let kind = match map.get("kind") {
        Some(Value::String(k)) => k.clone(),
        Some(other) => {
            return InboundMessage::Unroutable {
                reason: format!("unrecognized kind {other}"),
            };
        }
        None => {
            return InboundMessage::Unroutable {
                reason: "missing kind".into(),
            };
        }
    };

    match kind.as_str() {
        RESPONSE_KIND => {
            let Some(id) = map.get("id").and_then(id_to_string) else {
                return InboundMessage::Malformed {
                    id: None,
                    reason: "response without a usable id".into(),
                };
            };
            let outcome = match map.remove("error") {
                Some(Value::Null) | None => Ok(map.remove("result").unwrap_or(Value::Null)),
                Some(error) => Err(js_error_message(&error)),
            };
            InboundMessage::Response(ResponseEnvelope { id, outcome })
        }
        EVENT_KIND => {
            let event_type = match map.remove("type") {
                Some(Value::String(t)) => t,
                Some(other) => {
                    return InboundMessage::Unroutable {
                        reason: format!("event type is not a string: {other}"),
                    };
                }
                None => {
                    return InboundMessage::Unroutable {
                        reason: "event without a type".into(),
                    };
                }
            };
            InboundMessage::Event(EventEnvelope {
                id: map.get("id").and_then(id_to_string),
                event_type,
                payload: map.remove("payload").unwrap_or(Value::Null),
            })
        }
        other => InboundMessage::Unroutable {
            reason: format!("unrecognized kind {other:?}"),
        },
    }
}

/// Best-effort extraction of a call id from a payload that failed to parse.
pub fn recover_call_id(raw: &str) -> Option<String> {
    let pattern = CALL_ID_PATTERN.as_ref()?;
    let captures = pattern.captures(raw)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str().to_string())
}

/// Human-readable message for a JS-side error value.
pub fn js_error_message(error: &Value) -> String {
    let message = match error {
        Value::String(s) => s.clone(),
        Value::Object(obj) => match obj.get("message") {
            Some(Value::String(s)) => s.clone(),
            _ => error.to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    };
    if message.is_empty() {
        JS_ERROR_FALLBACK.to_string()
    } else {
        message
    }
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
