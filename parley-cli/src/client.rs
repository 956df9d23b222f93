use crate::events::EventStreamClient;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parley_shared::{ChatRequest, ErrorBody, StreamingError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type ByteStream = BoxStream<'static, reqwest::Result<Vec<u8>>>;

pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    read_timeout: Option<Duration>,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            read_timeout: None,
        }
    }

    pub fn with_read_timeout(mut self, limit: Duration) -> Self {
        self.read_timeout = Some(limit);
        self
    }

    pub async fn health(&self) -> bool {
        match self.http.get(format!("{}/health", self.base_url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "health check failed");
                false
            }
        }
    }

    /// Posts `request` and returns the event stream of the reply.
    ///
    /// Rejections the server reports through the status line come back as
    /// `Err`. Cancelling `cancel` before the response arrives yields a stream
    /// that aborts immediately.
    pub async fn send(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<EventStreamClient<ByteStream>, StreamingError> {
        let url = format!("{}/api/chat", self.base_url);
        debug!(%url, messages = request.messages.len(), "sending chat request");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let empty: ByteStream = futures_util::stream::empty().boxed();
                return Ok(self.events(empty, cancel));
            }
            response = self.http.post(&url).json(request).send() => response,
        };
        let response = response.map_err(|e| {
            warn!(error = %e, "chat request failed");
            StreamingError::generic(format!("Could not reach {url}: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "server rejected the chat request");
            return Err(match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => body.into_streaming_error(),
                Err(_) => StreamingError::generic(format!("Server returned HTTP {status}: {text}")),
            });
        }

        let bytes: ByteStream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Ok(self.events(bytes, cancel))
    }

    fn events(&self, bytes: ByteStream, cancel: CancellationToken) -> EventStreamClient<ByteStream> {
        let client = EventStreamClient::new(bytes, cancel);
        match self.read_timeout {
            Some(limit) => client.with_read_timeout(limit),
            None => client,
        }
    }
}
