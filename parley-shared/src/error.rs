//! The closed set of failures a chat stream can end with, plus the JSON body
//! the server answers with when a request fails before streaming starts.
//!
//! On the wire an error travels as `{"name": …, "message": …, …fields}`; the
//! `name` discriminant picks the variant when the client rebuilds it.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const AUTH_ERROR_MESSAGE: &str =
    "Invalid or missing API key. Check the OpenAI API key and try again.";
pub const NOT_ENOUGH_TOKENS_MESSAGE: &str = "Not enough tokens to send a message.";
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error";

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum StreamingError {
    #[serde(rename = "OpenAIAuthError")]
    #[error("{message}")]
    Auth {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "OpenAIRateLimited")]
    #[error("{message}")]
    RateLimited {
        #[serde(default)]
        message: String,
        #[serde(
            rename = "retryAfterSeconds",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        retry_after_seconds: Option<u64>,
    },

    #[serde(rename = "OpenAILimitExceeded")]
    #[error("{message}")]
    LimitExceeded {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requested: Option<usize>,
    },

    #[serde(rename = "GenericOpenAIError")]
    #[error("{message} (type: {kind}, param: {param}, code: {code})")]
    GenericOpenAi {
        #[serde(default)]
        message: String,
        #[serde(rename = "type", default)]
        kind: String,
        #[serde(default)]
        param: String,
        #[serde(default)]
        code: String,
    },

    #[serde(rename = "StreamingError")]
    #[error("{message}")]
    Generic {
        #[serde(default)]
        message: String,
    },
}

impl StreamingError {
    pub fn auth() -> Self {
        StreamingError::Auth {
            message: AUTH_ERROR_MESSAGE.to_string(),
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_seconds: Option<u64>) -> Self {
        StreamingError::RateLimited {
            message: message.into(),
            retry_after_seconds,
        }
    }

    pub fn limit_exceeded(
        message: impl Into<String>,
        limit: Option<usize>,
        requested: Option<usize>,
    ) -> Self {
        StreamingError::LimitExceeded {
            message: message.into(),
            limit,
            requested,
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        StreamingError::Generic {
            message: message.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::generic(UNKNOWN_ERROR_MESSAGE)
    }

    /// A read that produced nothing within `after`. The message always
    /// contains "timeout" so callers can tell it apart from provider errors.
    pub fn timeout(after: Duration) -> Self {
        Self::generic(format!("Stream read timeout after {}s", after.as_secs()))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamingError::Generic { message } if message.to_lowercase().contains("timeout"))
    }

    /// Wire discriminant.
    pub fn name(&self) -> &'static str {
        match self {
            StreamingError::Auth { .. } => "OpenAIAuthError",
            StreamingError::RateLimited { .. } => "OpenAIRateLimited",
            StreamingError::LimitExceeded { .. } => "OpenAILimitExceeded",
            StreamingError::GenericOpenAi { .. } => "GenericOpenAIError",
            StreamingError::Generic { .. } => "StreamingError",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StreamingError::Auth { message }
            | StreamingError::RateLimited { message, .. }
            | StreamingError::LimitExceeded { message, .. }
            | StreamingError::GenericOpenAi { message, .. }
            | StreamingError::Generic { message } => message,
        }
    }

    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .unwrap_or_else(|_| serde_json::json!({ "name": self.name(), "message": self.message() }))
    }

    /// Rebuilds the typed error from its wire object. Anything without a known
    /// `name` becomes a generic "Unknown error".
    pub fn from_wire(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| Self::unknown())
    }

    /// Text suitable for showing to the person chatting.
    pub fn user_message(&self) -> String {
        match self {
            StreamingError::Auth { .. } => {
                "Invalid API key. Check your key and try again.".to_string()
            }
            StreamingError::RateLimited {
                retry_after_seconds: Some(secs),
                ..
            } => format!("Too many requests. Wait {secs} seconds and try again."),
            StreamingError::RateLimited { .. } => {
                "Too many requests. Wait a moment and try again.".to_string()
            }
            StreamingError::LimitExceeded {
                limit: Some(limit),
                requested: Some(requested),
                ..
            } => format!(
                "Conversation too long. Remove some messages: it uses {requested} tokens where the limit is {limit}."
            ),
            StreamingError::LimitExceeded { .. } => {
                "Conversation too long. Remove some messages and try again.".to_string()
            }
            StreamingError::GenericOpenAi { message, .. } => {
                format!("The model provider rejected the request: {message}")
            }
            error if error.is_timeout() => {
                "The server took too long to respond. Check your connection and try again."
                    .to_string()
            }
            StreamingError::Generic { .. } => "Something went wrong. Try again later.".to_string(),
        }
    }
}

/// JSON body of a non-200 `/api/chat` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "errorType")]
pub enum ErrorBody {
    #[serde(rename = "openai_auth_error")]
    OpenAiAuth,
    #[serde(rename = "context_length_exceeded")]
    ContextLengthExceeded {
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        requested: Option<usize>,
    },
    #[serde(rename = "rate_limit")]
    RateLimit {
        #[serde(rename = "retryAfter", default)]
        retry_after: Option<u64>,
    },
    #[serde(rename = "generic_openai_error")]
    GenericOpenAi { message: String },
    #[serde(rename = "openai_error")]
    OpenAi { message: String },
    #[serde(rename = "unexpected_error")]
    Unexpected { message: String },
}

impl ErrorBody {
    pub fn unexpected(message: impl Into<String>) -> Self {
        ErrorBody::Unexpected {
            message: message.into(),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ErrorBody::OpenAiAuth => 401,
            ErrorBody::ContextLengthExceeded { .. } => 400,
            ErrorBody::RateLimit { .. } => 429,
            ErrorBody::GenericOpenAi { .. } => 400,
            ErrorBody::OpenAi { .. } => 500,
            ErrorBody::Unexpected { .. } => 500,
        }
    }

    pub fn into_streaming_error(self) -> StreamingError {
        match self {
            ErrorBody::OpenAiAuth => StreamingError::auth(),
            ErrorBody::ContextLengthExceeded { limit, requested } => {
                StreamingError::limit_exceeded(NOT_ENOUGH_TOKENS_MESSAGE, limit, requested)
            }
            ErrorBody::RateLimit { retry_after } => {
                StreamingError::rate_limited("Rate limit reached", retry_after)
            }
            ErrorBody::GenericOpenAi { message } => StreamingError::GenericOpenAi {
                message,
                kind: String::new(),
                param: String::new(),
                code: String::new(),
            },
            ErrorBody::OpenAi { message } | ErrorBody::Unexpected { message } => {
                StreamingError::generic(message)
            }
        }
    }
}

impl From<&StreamingError> for ErrorBody {
    fn from(error: &StreamingError) -> Self {
        match error {
            StreamingError::Auth { .. } => ErrorBody::OpenAiAuth,
            StreamingError::LimitExceeded {
                limit, requested, ..
            } => ErrorBody::ContextLengthExceeded {
                limit: *limit,
                requested: *requested,
            },
            StreamingError::RateLimited {
                retry_after_seconds,
                ..
            } => ErrorBody::RateLimit {
                retry_after: *retry_after_seconds,
            },
            StreamingError::GenericOpenAi { message, .. } => ErrorBody::GenericOpenAi {
                message: message.clone(),
            },
            StreamingError::Generic { message } => ErrorBody::OpenAi {
                message: message.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn taxonomy() -> Vec<StreamingError> {
        vec![
            StreamingError::auth(),
            StreamingError::rate_limited("slow down", Some(20)),
            StreamingError::rate_limited("slow down", None),
            StreamingError::limit_exceeded("too long", Some(4000), Some(5120)),
            StreamingError::limit_exceeded("too long", None, None),
            StreamingError::GenericOpenAi {
                message: "bad param".into(),
                kind: "invalid_request_error".into(),
                param: "temperature".into(),
                code: "invalid_value".into(),
            },
            StreamingError::generic("boom"),
        ]
    }

    #[test]
    fn every_member_survives_the_wire() {
        for error in taxonomy() {
            let wire = error.to_wire();
            assert_eq!(wire["name"], error.name());
            assert_eq!(wire["message"], error.message());
            assert_eq!(StreamingError::from_wire(&wire), error);
        }
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let wire = StreamingError::rate_limited("wait", Some(7)).to_wire();
        assert_eq!(
            wire,
            json!({"name": "OpenAIRateLimited", "message": "wait", "retryAfterSeconds": 7})
        );

        let wire = StreamingError::GenericOpenAi {
            message: "m".into(),
            kind: "t".into(),
            param: "p".into(),
            code: "c".into(),
        }
        .to_wire();
        assert_eq!(wire["type"], "t");
    }

    #[test]
    fn unknown_name_becomes_unknown_error() {
        let rebuilt = StreamingError::from_wire(&json!({"name": "TypeError", "message": "x"}));
        assert_eq!(rebuilt, StreamingError::generic("Unknown error"));

        let rebuilt = StreamingError::from_wire(&json!("not an object"));
        assert_eq!(rebuilt, StreamingError::unknown());
    }

    #[test]
    fn extra_wire_fields_are_ignored() {
        let rebuilt = StreamingError::from_wire(
            &json!({"name": "OpenAIAuthError", "message": "nope", "stack": "at foo"}),
        );
        assert_eq!(
            rebuilt,
            StreamingError::Auth {
                message: "nope".into()
            }
        );
    }

    #[test]
    fn timeout_is_recognisable() {
        let error = StreamingError::timeout(Duration::from_secs(30));
        assert!(error.is_timeout());
        assert!(error.message().contains("timeout"));
        assert!(!StreamingError::generic("boom").is_timeout());
        assert!(error.user_message().contains("too long to respond"));
    }

    #[test]
    fn user_messages_carry_the_numbers() {
        let msg = StreamingError::rate_limited("x", Some(12)).user_message();
        assert!(msg.contains("12 seconds"));

        let msg = StreamingError::limit_exceeded("x", Some(8000), Some(9100)).user_message();
        assert!(msg.contains("9100 tokens"));
        assert!(msg.contains("limit is 8000"));

        let msg = StreamingError::generic("database exploded").user_message();
        assert!(!msg.contains("database"));
    }

    #[test]
    fn error_body_statuses_and_tags() {
        let cases = [
            (StreamingError::auth(), 401, "openai_auth_error"),
            (
                StreamingError::limit_exceeded("x", Some(1), Some(2)),
                400,
                "context_length_exceeded",
            ),
            (StreamingError::rate_limited("x", Some(3)), 429, "rate_limit"),
            (taxonomy()[5].clone(), 400, "generic_openai_error"),
            (StreamingError::generic("x"), 500, "openai_error"),
        ];
        for (error, status, tag) in cases {
            let body = ErrorBody::from(&error);
            assert_eq!(body.status(), status);
            assert_eq!(serde_json::to_value(&body).unwrap()["errorType"], tag);
        }

        let body = ErrorBody::unexpected("oops");
        assert_eq!(body.status(), 500);
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"errorType": "unexpected_error", "message": "oops"})
        );
    }

    #[test]
    fn error_body_maps_back_to_the_taxonomy() {
        let body: ErrorBody = serde_json::from_value(
            json!({"errorType": "context_length_exceeded", "limit": 4000, "requested": 4100}),
        )
        .unwrap();
        assert_eq!(
            body.into_streaming_error(),
            StreamingError::limit_exceeded(NOT_ENOUGH_TOKENS_MESSAGE, Some(4000), Some(4100))
        );

        let body: ErrorBody =
            serde_json::from_value(json!({"errorType": "rate_limit", "retryAfter": 9})).unwrap();
        assert!(matches!(
            body.into_streaming_error(),
            StreamingError::RateLimited {
                retry_after_seconds: Some(9),
                ..
            }
        ));

        let body: ErrorBody = serde_json::from_value(json!({"errorType": "openai_auth_error"})).unwrap();
        assert_eq!(body.into_streaming_error(), StreamingError::auth());
    }
}
