//! Wire types for the server's event stream and the collections it mutates.
//!
//! Every frame on the stream is `{ "type": "...", "properties": { ... } }`. Known
//! types decode into typed payloads; anything else is kept as [`Event::Other`]
//! so newer servers do not break older clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque session identifier assigned by the server.
pub type SessionId = String;

pub const MESSAGE_UPDATED: &str = "message.updated";
pub const MESSAGE_PART_UPDATED: &str = "message.part.updated";
pub const SESSION_CREATED: &str = "session.created";
pub const SESSION_UPDATED: &str = "session.updated";
pub const SESSION_IDLE: &str = "session.idle";
pub const SESSION_ERROR: &str = "session.error";

fn millis_to_datetime(ms: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms as i64)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: f64,
    #[serde(default)]
    pub updated: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionShare {
    pub url: String,
}

/// Mutable session record (`session.created` / `session.updated` payload and `GET /session` item).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub directory: String,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<SessionShare>,
    #[serde(default)]
    pub time: SessionTime,
    /// Fields this client does not interpret (version, projectID, ...), kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionInfo {
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.time.updated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTime {
    pub created: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<f64>,
}

/// Message header: everything about a message except its parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    pub role: Role,
    pub time: MessageTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageInfo {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.time.created)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
}

/// One piece of a message: text, file, tool call, patch, reasoning, step markers, ...
///
/// Only the fields needed for placement are typed; the rest of the payload
/// (text, tool state, file url, ...) stays in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<PartTime>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Part {
    /// Start timestamp, when the part carries one.
    pub fn start(&self) -> Option<f64> {
        self.time.as_ref().and_then(|t| t.start)
    }

    /// Text content for text and reasoning parts.
    pub fn text(&self) -> Option<&str> {
        self.extra.get("text").and_then(Value::as_str)
    }
}

/// A cached message: header plus ordered parts (`GET /session/{id}/message` item).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// One notification from the server's event stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawEvent")]
pub enum Event {
    MessageUpdated { info: MessageInfo },
    MessagePartUpdated { part: Part },
    SessionCreated { info: SessionInfo },
    SessionUpdated { info: SessionInfo },
    SessionIdle { session_id: SessionId },
    SessionError {
        session_id: Option<SessionId>,
        error: Option<Value>,
    },
    /// A type this client does not route. Kept so it can be logged and skipped.
    Other { kind: String, properties: Value },
}

impl Event {
    /// Decode one stream frame.
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &str {
        match self {
            Event::MessageUpdated { .. } => MESSAGE_UPDATED,
            Event::MessagePartUpdated { .. } => MESSAGE_PART_UPDATED,
            Event::SessionCreated { .. } => SESSION_CREATED,
            Event::SessionUpdated { .. } => SESSION_UPDATED,
            Event::SessionIdle { .. } => SESSION_IDLE,
            Event::SessionError { .. } => SESSION_ERROR,
            Event::Other { kind, .. } => kind,
        }
    }

    /// Session the event belongs to, if it names one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Event::MessageUpdated { info } => Some(&info.session_id),
            Event::MessagePartUpdated { part } => Some(&part.session_id),
            Event::SessionCreated { info } | Event::SessionUpdated { info } => Some(&info.id),
            Event::SessionIdle { session_id } => Some(session_id),
            Event::SessionError { session_id, .. } => session_id.as_deref(),
            Event::Other { .. } => None,
        }
    }
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    properties: Value,
}

#[derive(Deserialize)]
struct InfoProperties<T> {
    info: T,
}

#[derive(Deserialize)]
struct PartProperties {
    part: Part,
}

#[derive(Deserialize)]
struct IdleProperties {
    #[serde(rename = "sessionID")]
    session_id: SessionId,
}

#[derive(Deserialize)]
struct ErrorProperties {
    #[serde(rename = "sessionID", default)]
    session_id: Option<SessionId>,
    #[serde(default)]
    error: Option<Value>,
}

impl TryFrom<RawEvent> for Event {
    type Error = serde_json::Error;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let RawEvent { kind, properties } = raw;
        let event = match kind.as_str() {
            MESSAGE_UPDATED => {
                let p: InfoProperties<MessageInfo> = serde_json::from_value(properties)?;
                Event::MessageUpdated { info: p.info }
            }
            MESSAGE_PART_UPDATED => {
                let p: PartProperties = serde_json::from_value(properties)?;
                Event::MessagePartUpdated { part: p.part }
            }
            SESSION_CREATED => {
                let p: InfoProperties<SessionInfo> = serde_json::from_value(properties)?;
                Event::SessionCreated { info: p.info }
            }
            SESSION_UPDATED => {
                let p: InfoProperties<SessionInfo> = serde_json::from_value(properties)?;
                Event::SessionUpdated { info: p.info }
            }
            SESSION_IDLE => {
                let p: IdleProperties = serde_json::from_value(properties)?;
                Event::SessionIdle {
                    session_id: p.session_id,
                }
            }
            SESSION_ERROR => {
                let p: ErrorProperties = serde_json::from_value(properties)?;
                Event::SessionError {
                    session_id: p.session_id,
                    error: p.error,
                }
            }
            _ => Event::Other { kind, properties },
        };
        Ok(event)
    }
}
