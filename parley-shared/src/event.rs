//! Server → client stream protocol: one JSON document per line,
//! `{"event": "<name>", "data": [<arguments>]}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::StreamingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Content,
    ToolCall,
    Error,
    Abort,
    End,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Content => "content",
            EventKind::ToolCall => "toolCall",
            EventKind::Error => "error",
            EventKind::Abort => "abort",
            EventKind::End => "end",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `content` event. `snapshot` is every delta of the response so
/// far, so a consumer that only keeps the latest event still renders correctly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDelta {
    pub delta: String,
    pub snapshot: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connect,
    Content(ContentDelta),
    ToolCall { name: String, arguments: String },
    Error(StreamingError),
    Abort,
    End,
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Connect => EventKind::Connect,
            StreamEvent::Content(_) => EventKind::Content,
            StreamEvent::ToolCall { .. } => EventKind::ToolCall,
            StreamEvent::Error(_) => EventKind::Error,
            StreamEvent::Abort => EventKind::Abort,
            StreamEvent::End => EventKind::End,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum WireDecodeError {
    #[error("unknown stream event '{0}'")]
    UnknownEvent(String),
    #[error("malformed data for '{event}' event: {reason}")]
    BadData { event: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub event: String,
    #[serde(default)]
    pub data: Vec<Value>,
}

impl WireEvent {
    fn new(kind: EventKind, data: Vec<Value>) -> Self {
        Self {
            event: kind.as_str().to_string(),
            data,
        }
    }

    pub fn connect() -> Self {
        Self::new(EventKind::Connect, vec![])
    }

    pub fn content(delta: impl Into<String>, snapshot: impl Into<String>) -> Self {
        Self::new(
            EventKind::Content,
            vec![serde_json::json!({ "delta": delta.into(), "snapshot": snapshot.into() })],
        )
    }

    pub fn tool_call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self::new(
            EventKind::ToolCall,
            vec![Value::String(name.into()), Value::String(arguments.into())],
        )
    }

    pub fn error(error: &StreamingError) -> Self {
        Self::new(EventKind::Error, vec![error.to_wire()])
    }

    pub fn end() -> Self {
        Self::new(EventKind::End, vec![])
    }

    /// Serialized form including the terminating newline.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"event":"{}","data":[]}}"#, self.event)
        });
        line.push('\n');
        line
    }

    /// Converts the wire shape into a typed event. `error` payloads go through
    /// [`StreamingError::from_wire`], so they always yield a typed error.
    pub fn decode(self) -> Result<StreamEvent, WireDecodeError> {
        let bad = |reason: &str| WireDecodeError::BadData {
            event: self.event.clone(),
            reason: reason.to_string(),
        };
        match self.event.as_str() {
            "connect" => Ok(StreamEvent::Connect),
            "end" => Ok(StreamEvent::End),
            "content" => {
                let first = self.data.first().ok_or_else(|| bad("missing payload"))?;
                let content = serde_json::from_value::<ContentDelta>(first.clone())
                    .map_err(|e| bad(&e.to_string()))?;
                Ok(StreamEvent::Content(content))
            }
            "toolCall" => {
                let name = self
                    .data
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| bad("missing function name"))?;
                let arguments = match self.data.get(1) {
                    Some(Value::String(raw)) => raw.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                Ok(StreamEvent::ToolCall {
                    name: name.to_string(),
                    arguments,
                })
            }
            "error" => {
                let error = self
                    .data
                    .first()
                    .map(StreamingError::from_wire)
                    .unwrap_or_else(StreamingError::unknown);
                Ok(StreamEvent::Error(error))
            }
            other => Err(WireDecodeError::UnknownEvent(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lines_match_the_protocol_shape() {
        assert_eq!(WireEvent::connect().to_line(), "{\"event\":\"connect\",\"data\":[]}\n");
        assert_eq!(
            serde_json::to_value(WireEvent::content("lo", "Hello")).unwrap(),
            json!({"event": "content", "data": [{"delta": "lo", "snapshot": "Hello"}]})
        );
        assert_eq!(
            serde_json::to_value(WireEvent::tool_call("web_search", "{\"query\":\"x\"}")).unwrap(),
            json!({"event": "toolCall", "data": ["web_search", "{\"query\":\"x\"}"]})
        );
    }

    #[test]
    fn decode_builds_typed_events() {
        let event = WireEvent::content("a", "ba").decode().unwrap();
        assert_eq!(
            event,
            StreamEvent::Content(ContentDelta {
                delta: "a".into(),
                snapshot: "ba".into()
            })
        );

        let event = WireEvent::error(&StreamingError::rate_limited("slow", Some(3)))
            .decode()
            .unwrap();
        assert_eq!(
            event,
            StreamEvent::Error(StreamingError::rate_limited("slow", Some(3)))
        );
        assert_eq!(event.kind(), EventKind::Error);
    }

    #[test]
    fn decode_rejects_unknown_and_malformed_events() {
        let unknown: WireEvent = serde_json::from_value(json!({"event": "ping"})).unwrap();
        assert_eq!(
            unknown.decode(),
            Err(WireDecodeError::UnknownEvent("ping".into()))
        );

        let malformed: WireEvent =
            serde_json::from_value(json!({"event": "content", "data": [42]})).unwrap();
        assert!(matches!(
            malformed.decode(),
            Err(WireDecodeError::BadData { .. })
        ));
    }

    #[test]
    fn error_without_payload_is_unknown() {
        let bare: WireEvent = serde_json::from_value(json!({"event": "error"})).unwrap();
        assert_eq!(
            bare.decode().unwrap(),
            StreamEvent::Error(StreamingError::unknown())
        );
    }
}
