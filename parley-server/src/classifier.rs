//! Maps provider failures onto the [`StreamingError`] taxonomy.
//!
//! The HTTP status and the error `code` decide which variant applies. Numbers
//! are pulled out of the provider's prose on a best-effort basis; a message
//! without them still classifies, just without the extra fields.

use parley_shared::StreamingError;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;

static RETRY_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry after (\d+) sec").expect("valid retry-after pattern")
});

static CONTEXT_LENGTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)max.*?length.*?(\d+) tokens.*?requested (\d+) tokens")
        .expect("valid context-length pattern")
});

/// The `error` object of an OpenAI-style error response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProviderErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub param: Option<Value>,
    #[serde(default)]
    pub code: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderErrorEnvelope {
    pub error: ProviderErrorBody,
}

/// `param` and `code` arrive as strings, numbers or null depending on the
/// provider; normalize them to strings.
fn field_text(value: &Option<Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

impl ProviderErrorBody {
    pub fn code_text(&self) -> String {
        field_text(&self.code)
    }
}

#[derive(Debug)]
pub enum ProviderFailure {
    /// The provider answered with an error. `status` is `None` for error
    /// frames that arrive inside an otherwise successful stream.
    Api {
        status: Option<u16>,
        body: Option<ProviderErrorBody>,
        raw: String,
        retry_after: Option<u64>,
    },
    Transport(String),
    Timeout(Duration),
    /// The request could not be built; nothing was sent.
    Invalid(String),
}

impl ProviderFailure {
    pub fn from_response(status: u16, raw: String, retry_after: Option<u64>) -> Self {
        let body = serde_json::from_str::<ProviderErrorEnvelope>(&raw)
            .ok()
            .map(|envelope| envelope.error);
        ProviderFailure::Api {
            status: Some(status),
            body,
            raw,
            retry_after,
        }
    }

    pub fn from_stream_frame(body: ProviderErrorBody, raw: String) -> Self {
        ProviderFailure::Api {
            status: None,
            body: Some(body),
            raw,
            retry_after: None,
        }
    }
}

impl From<reqwest::Error> for ProviderFailure {
    fn from(error: reqwest::Error) -> Self {
        ProviderFailure::Transport(error.to_string())
    }
}

pub fn parse_retry_after(message: &str) -> Option<u64> {
    RETRY_AFTER
        .captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn parse_context_length(message: &str) -> (Option<usize>, Option<usize>) {
    match CONTEXT_LENGTH.captures(message) {
        Some(captures) => (
            captures.get(1).and_then(|m| m.as_str().parse().ok()),
            captures.get(2).and_then(|m| m.as_str().parse().ok()),
        ),
        None => (None, None),
    }
}

pub fn transform_error(failure: ProviderFailure) -> StreamingError {
    let (status, body, raw, retry_after) = match failure {
        ProviderFailure::Timeout(after) => return StreamingError::timeout(after),
        ProviderFailure::Transport(message) | ProviderFailure::Invalid(message) => {
            return StreamingError::generic(message)
        }
        ProviderFailure::Api {
            status,
            body,
            raw,
            retry_after,
        } => (status, body, raw, retry_after),
    };

    // The 401 body is not worth showing; the canned message says what to do.
    if status == Some(401) {
        return StreamingError::auth();
    }

    let message = body
        .as_ref()
        .and_then(|b| b.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| raw.clone());

    if status == Some(429) {
        let retry_after = parse_retry_after(&message).or(retry_after);
        return StreamingError::rate_limited(message, retry_after);
    }

    if let Some(body) = body {
        let bad_request = status.map_or(true, |s| s == 400);
        if bad_request && body.code_text() == "context_length_exceeded" {
            let (limit, requested) = parse_context_length(&message);
            return StreamingError::limit_exceeded(message, limit, requested);
        }
        if body.message.is_some() {
            return StreamingError::GenericOpenAi {
                message,
                kind: body.kind.unwrap_or_default(),
                param: field_text(&body.param),
                code: field_text(&body.code),
            };
        }
    }

    if message.trim().is_empty() {
        return match status {
            Some(status) => StreamingError::generic(format!("Provider returned HTTP {status}")),
            None => StreamingError::unknown(),
        };
    }
    StreamingError::generic(message)
}
