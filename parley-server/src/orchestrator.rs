//! Drives one chat completion from a validated request to wire events.
//!
//! [`Orchestrator::prepare`] resolves defaults and budgets the conversation;
//! every failure there happens before the provider is contacted.
//! [`Orchestrator::start`] then opens the provider stream on a task of its own
//! and republishes what arrives as [`WireEvent`]s. A run emits `connect` once
//! the provider accepts the request, then content and tool calls, and ends
//! with exactly one of `end` or `error`. Dropping the receiver aborts the run.

use crate::classifier::{transform_error, ProviderFailure};
use crate::config::ServerConfig;
use crate::llm::{PreparedChat, ProviderClient};
use crate::tools::ToolRegistry;
use async_openai::types::{ChatCompletionMessageToolCallChunk, FinishReason};
use parley_shared::models;
use parley_shared::reducer::prepare_messages;
use parley_shared::tokens::TokenizerHandle;
use parley_shared::{ChatRequest, StreamingError, WireEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
    Aborted,
}

fn invalid_request(message: impl Into<String>, param: &str, code: &str) -> StreamingError {
    StreamingError::GenericOpenAi {
        message: message.into(),
        kind: "invalid_request_error".to_string(),
        param: param.to_string(),
        code: code.to_string(),
    }
}

pub struct Orchestrator {
    provider: Arc<ProviderClient>,
    config: Arc<ServerConfig>,
    tokenizer: TokenizerHandle,
    tools: ToolRegistry,
}

impl Orchestrator {
    pub fn new(config: Arc<ServerConfig>, tokenizer: TokenizerHandle) -> Self {
        Self {
            provider: Arc::new(ProviderClient::new(config.clone())),
            config,
            tokenizer,
            tools: ToolRegistry::builtin(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub async fn prepare(&self, request: ChatRequest) -> Result<PreparedChat, StreamingError> {
        let model_id = match request.model_id.trim() {
            "" => self.config.default_model.clone(),
            id => id.to_string(),
        };
        let token_limit = models::token_limit(&model_id);
        if token_limit == 0 {
            return Err(invalid_request(
                format!("The model `{model_id}` is not supported"),
                "model",
                "model_not_found",
            ));
        }

        let api_key = request
            .api_key
            .filter(|key| !key.trim().is_empty())
            .or_else(|| self.config.api_key.clone())
            .ok_or_else(StreamingError::auth)?;

        let temperature = request
            .temperature
            .unwrap_or(self.config.default_temperature);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(invalid_request(
                format!("temperature must be between 0 and 2, got {temperature}"),
                "temperature",
                "invalid_value",
            ));
        }
        let max_tokens = request.max_tokens.unwrap_or(self.config.default_max_tokens);
        if max_tokens == 0 {
            return Err(invalid_request(
                "maxTokens must be greater than 0",
                "max_tokens",
                "invalid_value",
            ));
        }
        if request.messages.is_empty() {
            return Err(invalid_request(
                "messages must not be empty",
                "messages",
                "invalid_value",
            ));
        }

        let system_prompt = request
            .prompt
            .filter(|prompt| !prompt.trim().is_empty())
            .unwrap_or_else(|| self.config.default_system_prompt.clone());

        let messages = prepare_messages(
            &self.tokenizer,
            token_limit,
            max_tokens as usize,
            &system_prompt,
            &request.messages,
            &model_id,
        )
        .await?;
        if messages.len() < request.messages.len() {
            info!(
                model = %model_id,
                dropped = request.messages.len() - messages.len(),
                "trimmed conversation to fit the context window"
            );
        }

        let tools = self
            .tools
            .select(&request.selected_tools, &request.tool_configurations);

        Ok(PreparedChat {
            model_id,
            system_prompt,
            messages,
            temperature,
            max_tokens,
            api_key,
            tools,
        })
    }

    /// Spawns the run and hands back its events.
    pub fn start(&self, chat: PreparedChat) -> mpsc::Receiver<WireEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let provider = self.provider.clone();
        tokio::spawn(async move {
            run(&provider, chat, tx).await;
        });
        rx
    }
}

#[derive(Default)]
struct PendingToolCall {
    name: String,
    arguments: String,
}

/// Tool calls arrive in fragments keyed by index; arguments are concatenated.
#[derive(Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<i32, PendingToolCall>,
}

impl ToolCallAccumulator {
    fn absorb(&mut self, chunks: &[ChatCompletionMessageToolCallChunk]) {
        for chunk in chunks {
            let call = self.calls.entry(chunk.index).or_default();
            if let Some(function) = &chunk.function {
                if let Some(name) = &function.name {
                    call.name.push_str(name);
                }
                if let Some(arguments) = &function.arguments {
                    call.arguments.push_str(arguments);
                }
            }
        }
    }

    fn drain(&mut self) -> Vec<PendingToolCall> {
        std::mem::take(&mut self.calls).into_values().collect()
    }
}

struct Run<'a> {
    model_id: &'a str,
    state: OrchestratorState,
    tx: mpsc::Sender<WireEvent>,
}

impl Run<'_> {
    fn transition(&mut self, next: OrchestratorState) {
        debug!(model = %self.model_id, from = ?self.state, to = ?next, "orchestrator state");
        self.state = next;
    }

    /// False once the receiver is gone.
    async fn send(&self, event: WireEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    fn abort(&mut self) -> OrchestratorState {
        info!(model = %self.model_id, "client went away, abandoning provider stream");
        self.transition(OrchestratorState::Aborted);
        self.state
    }

    async fn fail(&mut self, failure: ProviderFailure) -> OrchestratorState {
        let error = transform_error(failure);
        warn!(model = %self.model_id, error = %error, kind = error.name(), "completion failed");
        if !self.send(WireEvent::error(&error)).await {
            return self.abort();
        }
        self.transition(OrchestratorState::Failed);
        self.state
    }

    async fn emit_tool_calls(&self, calls: &mut ToolCallAccumulator) -> bool {
        for call in calls.drain() {
            debug!(model = %self.model_id, tool = %call.name, "tool call");
            if !self.send(WireEvent::tool_call(call.name, call.arguments)).await {
                return false;
            }
        }
        true
    }
}

pub(crate) async fn run(
    provider: &ProviderClient,
    chat: PreparedChat,
    tx: mpsc::Sender<WireEvent>,
) -> OrchestratorState {
    let mut run = Run {
        model_id: &chat.model_id,
        state: OrchestratorState::Idle,
        tx,
    };

    run.transition(OrchestratorState::Connecting);
    let mut stream = match provider.open_stream(&chat).await {
        Ok(stream) => stream,
        Err(failure) => return run.fail(failure).await,
    };
    if !run.send(WireEvent::connect()).await {
        return run.abort();
    }
    run.transition(OrchestratorState::Streaming);

    let mut snapshot = String::new();
    let mut tool_calls = ToolCallAccumulator::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = run.tx.closed() => None,
            next = stream.next_chunk() => Some(next),
        };
        let Some(next) = next else {
            return run.abort();
        };
        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(failure) => return run.fail(failure).await,
        };

        for choice in chunk.choices.into_iter().filter(|c| c.index == 0) {
            if let Some(delta) = choice.delta.content.filter(|d| !d.is_empty()) {
                snapshot.push_str(&delta);
                if !run.send(WireEvent::content(delta, snapshot.as_str())).await {
                    return run.abort();
                }
            }
            if let Some(chunks) = &choice.delta.tool_calls {
                tool_calls.absorb(chunks);
            }
            if choice.finish_reason == Some(FinishReason::ToolCalls)
                && !run.emit_tool_calls(&mut tool_calls).await
            {
                return run.abort();
            }
        }
    }

    if !run.emit_tool_calls(&mut tool_calls).await || !run.send(WireEvent::end()).await {
        return run.abort();
    }
    info!(
        model = %chat.model_id,
        chars = snapshot.len(),
        skipped_frames = stream.skipped_frames(),
        "completion finished"
    );
    run.transition(OrchestratorState::Completed);
    run.state
}
