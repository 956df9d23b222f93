use crate::classifier::{ProviderErrorEnvelope, ProviderFailure};
use crate::config::{ApiFlavor, ServerConfig};
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionTool, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    CreateChatCompletionStreamResponse,
};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use parley_shared::{ChatMessage, LineDecoder, MessageRole};
use reqwest::header::RETRY_AFTER;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Everything needed to open one completion stream.
#[derive(Debug, Clone)]
pub struct PreparedChat {
    pub model_id: String,
    pub system_prompt: String,
    /// Already reduced to fit the model's context window.
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub api_key: String,
    pub tools: Vec<ChatCompletionTool>,
}

pub struct ProviderClient {
    http: reqwest::Client,
    config: Arc<ServerConfig>,
}

impl ProviderClient {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn endpoint(&self, model_id: &str) -> String {
        let host = self.config.api_host.trim_end_matches('/');
        match self.config.api_flavor {
            ApiFlavor::OpenAi => format!("{host}/v1/chat/completions"),
            ApiFlavor::Azure => format!(
                "{host}/openai/deployments/{}/chat/completions?api-version={}",
                self.config.deployment_for(model_id),
                self.config.api_version
            ),
        }
    }

    pub fn build_request(
        &self,
        chat: &PreparedChat,
    ) -> Result<CreateChatCompletionRequest, OpenAIError> {
        let mut messages = Vec::with_capacity(chat.messages.len() + 1);
        messages.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(chat.system_prompt.clone())
                .build()?,
        ));
        for message in &chat.messages {
            messages.push(convert_message(message)?);
        }

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&chat.model_id)
            .messages(messages)
            .temperature(chat.temperature)
            .max_tokens(chat.max_tokens)
            .stream(true);
        if !chat.tools.is_empty() {
            args.tools(chat.tools.clone());
        }
        args.build()
    }

    /// Sends the request and waits for the response head. Non-2xx answers
    /// come back as [`ProviderFailure::Api`] with the body read in full.
    pub async fn open_stream(&self, chat: &PreparedChat) -> Result<ProviderStream, ProviderFailure> {
        let request = self
            .build_request(chat)
            .map_err(|e| ProviderFailure::Invalid(e.to_string()))?;
        let url = self.endpoint(&chat.model_id);
        debug!(
            endpoint = %url,
            model = %chat.model_id,
            messages = request.messages.len(),
            tools = chat.tools.len(),
            "opening provider stream"
        );

        let builder = match self.config.api_flavor {
            ApiFlavor::OpenAi => {
                let builder = self.http.post(&url).bearer_auth(&chat.api_key);
                match &self.config.organization {
                    Some(organization) => builder.header("OpenAI-Organization", organization),
                    None => builder,
                }
            }
            ApiFlavor::Azure => self.http.post(&url).header("api-key", &chat.api_key),
        };

        let timeout = self.config.stream_timeout;
        let response = tokio::time::timeout(timeout, builder.json(&request).send())
            .await
            .map_err(|_| ProviderFailure::Timeout(timeout))??;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            let raw = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %raw, "provider rejected the request");
            return Err(ProviderFailure::from_response(
                status.as_u16(),
                raw,
                retry_after,
            ));
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(ProviderFailure::from));
        Ok(ProviderStream::new(bytes, timeout))
    }
}

fn convert_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let converted = match message.role {
        MessageRole::System => ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(message.content.clone())
                .build()?,
        ),
        MessageRole::User => ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(message.content.clone())
                .build()?,
        ),
        // Recorded tool calls stay client-side; only the text goes back.
        MessageRole::Assistant => ChatCompletionRequestMessage::Assistant(
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(message.content.clone())
                .build()?,
        ),
    };
    Ok(converted)
}

enum SseLine {
    Skip,
    /// A data frame that is not a completion chunk, such as Azure's
    /// delta-less content-filter results.
    Unparsed,
    Done,
    Chunk(Box<CreateChatCompletionStreamResponse>),
}

fn parse_sse_line(line: &str) -> Result<SseLine, ProviderFailure> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(SseLine::Skip);
    }
    let Some(payload) = line.strip_prefix("data:") else {
        // event:, id: and retry: fields carry nothing we use
        return Ok(SseLine::Skip);
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if let Ok(envelope) = serde_json::from_str::<ProviderErrorEnvelope>(payload) {
        return Err(ProviderFailure::from_stream_frame(
            envelope.error,
            payload.to_string(),
        ));
    }
    match serde_json::from_str::<CreateChatCompletionStreamResponse>(payload) {
        Ok(chunk) => Ok(SseLine::Chunk(Box::new(chunk))),
        Err(e) => {
            warn!(
                error = %e,
                payload,
                "skipping provider frame that is not a completion chunk (content filter results look like this)"
            );
            Ok(SseLine::Unparsed)
        }
    }
}

/// Server-sent events from the provider, one completion chunk at a time.
pub struct ProviderStream {
    bytes: BoxStream<'static, Result<Vec<u8>, ProviderFailure>>,
    decoder: LineDecoder,
    pending: VecDeque<String>,
    read_timeout: Duration,
    finished: bool,
    skipped: usize,
}

impl ProviderStream {
    pub fn new(
        bytes: impl Stream<Item = Result<Vec<u8>, ProviderFailure>> + Send + 'static,
        read_timeout: Duration,
    ) -> Self {
        Self {
            bytes: bytes.boxed(),
            decoder: LineDecoder::new(),
            pending: VecDeque::new(),
            read_timeout,
            finished: false,
            skipped: 0,
        }
    }

    /// Data frames dropped because they did not parse as completion chunks.
    pub fn skipped_frames(&self) -> usize {
        self.skipped
    }

    /// `Ok(None)` once `[DONE]` arrives or the body ends.
    pub async fn next_chunk(
        &mut self,
    ) -> Result<Option<CreateChatCompletionStreamResponse>, ProviderFailure> {
        loop {
            while let Some(line) = self.pending.pop_front() {
                match parse_sse_line(&line)? {
                    SseLine::Skip => continue,
                    SseLine::Unparsed => self.skipped += 1,
                    SseLine::Done => {
                        self.finished = true;
                        self.pending.clear();
                        return Ok(None);
                    }
                    SseLine::Chunk(chunk) => return Ok(Some(*chunk)),
                }
            }
            if self.finished {
                return Ok(None);
            }

            match tokio::time::timeout(self.read_timeout, self.bytes.next()).await {
                Err(_) => return Err(ProviderFailure::Timeout(self.read_timeout)),
                Ok(Some(Ok(bytes))) => self.pending.extend(self.decoder.decode_line(&bytes)),
                Ok(Some(Err(failure))) => return Err(failure),
                Ok(None) => {
                    self.finished = true;
                    self.pending.extend(self.decoder.flush());
                }
            }
        }
    }
}
