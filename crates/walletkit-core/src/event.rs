use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::envelope::EventEnvelope;

/// The closed set of event types the JS runtime may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    ConnectRequest,
    TransactionRequest,
    SignDataRequest,
    Disconnect,
    SessionsChanged,
    NetworkChanged,
}

impl EventType {
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "connectRequest" => Some(Self::ConnectRequest),
            "transactionRequest" => Some(Self::TransactionRequest),
            "signDataRequest" => Some(Self::SignDataRequest),
            "disconnect" => Some(Self::Disconnect),
            "sessionsChanged" => Some(Self::SessionsChanged),
            "networkChanged" => Some(Self::NetworkChanged),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectRequest => "connectRequest",
            Self::TransactionRequest => "transactionRequest",
            Self::SignDataRequest => "signDataRequest",
            Self::Disconnect => "disconnect",
            Self::SessionsChanged => "sessionsChanged",
            Self::NetworkChanged => "networkChanged",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dApp asking to connect to a wallet (often arriving via deep link).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub id: String,
    #[serde(default)]
    pub dapp_name: Option<String>,
    #[serde(default)]
    pub dapp_url: Option<String>,
    #[serde(default)]
    pub manifest_url: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub id: String,
    #[serde(default)]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub valid_until: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignDataRequest {
    pub id: String,
    #[serde(default)]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disconnect {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsChanged {
    #[serde(default)]
    pub sessions: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkChanged {
    pub network: String,
    #[serde(default)]
    pub api_base_url: Option<String>,
}

/// Typed event body, one variant per [`EventType`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    ConnectRequest(ConnectRequest),
    TransactionRequest(TransactionRequest),
    SignDataRequest(SignDataRequest),
    Disconnect(Disconnect),
    SessionsChanged(SessionsChanged),
    NetworkChanged(NetworkChanged),
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::ConnectRequest(_) => EventType::ConnectRequest,
            Self::TransactionRequest(_) => EventType::TransactionRequest,
            Self::SignDataRequest(_) => EventType::SignDataRequest,
            Self::Disconnect(_) => EventType::Disconnect,
            Self::SessionsChanged(_) => EventType::SessionsChanged,
            Self::NetworkChanged(_) => EventType::NetworkChanged,
        }
    }
}

/// An event as delivered to handlers.
///
/// `payload` keeps the raw JSON so handlers can read fields the typed
/// schema does not model.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub payload: Value,
}

/// Outcome of parsing an [`EventEnvelope`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    Known(Event),
    /// The type is not one we route; dropped by the dispatcher.
    Unknown { event_type: String },
    /// The type is known but the payload does not fit its schema.
    Invalid { event_type: EventType, reason: String },
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    /// Parse a wire envelope into a typed event.
    pub fn parse(envelope: EventEnvelope) -> ParsedEvent {
        let Some(event_type) = EventType::from_wire(&envelope.event_type) else {
            return ParsedEvent::Unknown {
                event_type: envelope.event_type,
            };
        };

        let kind = match event_type {
            EventType::ConnectRequest => decode(&envelope.payload).map(EventKind::ConnectRequest),
            EventType::TransactionRequest => {
                decode(&envelope.payload).map(EventKind::TransactionRequest)
            }
            EventType::SignDataRequest => decode(&envelope.payload).map(EventKind::SignDataRequest),
            EventType::Disconnect => decode(&envelope.payload).map(EventKind::Disconnect),
            EventType::SessionsChanged => decode(&envelope.payload).map(EventKind::SessionsChanged),
            EventType::NetworkChanged => decode(&envelope.payload).map(EventKind::NetworkChanged),
        };

        match kind {
            Ok(kind) => {
                let id = envelope
                    .id
                    .or_else(|| payload_id(&envelope.payload))
                    .unwrap_or_else(|| content_id(event_type, &envelope.payload));
                ParsedEvent::Known(Event {
                    id,
                    kind,
                    payload: envelope.payload,
                })
            }
            Err(e) => ParsedEvent::Invalid {
                event_type,
                reason: e.to_string(),
            },
        }
    }
}

/// A null payload decodes like an empty object so all-optional schemas
/// still produce an event with defaults.
fn decode<T: DeserializeOwned>(payload: &Value) -> Result<T, serde_json::Error> {
    match payload {
        Value::Null => serde_json::from_value(Value::Object(Default::default())),
        other => T::deserialize(other),
    }
}

fn payload_id(payload: &Value) -> Option<String> {
    match payload.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Stable id for events that carry none, so a redelivered event maps to
/// the same durable record.
fn content_id(event_type: EventType, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(payload.to_string().as_bytes());
    format!("evt_{}", &hex::encode(hasher.finalize())[..32])
}
