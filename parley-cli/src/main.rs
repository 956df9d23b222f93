mod client;
mod events;

use anyhow::{Context, Result};
use client::BackendClient;
use events::Terminal;
use parley_shared::{ChatMessage, ChatRequest, EventKind, StreamEvent, ToolCall};
use serde_json::Value;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";

#[derive(Debug, PartialEq)]
struct Settings {
    server_url: String,
    /// Empty lets the server pick.
    model: String,
    api_key: Option<String>,
    read_timeout: Duration,
}

impl Settings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let read_timeout = match get("PARLEY_READ_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("PARLEY_READ_TIMEOUT_SECS is not a number: '{raw}'"))?;
                anyhow::ensure!(secs > 0, "PARLEY_READ_TIMEOUT_SECS must be greater than 0");
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(60),
        };
        Ok(Self {
            server_url: get("PARLEY_SERVER_URL").unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
            model: get("PARLEY_MODEL").unwrap_or_default(),
            api_key: get("PARLEY_API_KEY"),
            read_timeout,
        })
    }
}

#[derive(Default)]
struct Reply {
    snapshot: String,
    tool_calls: Vec<ToolCall>,
}

impl Reply {
    fn into_message(self) -> Option<ChatMessage> {
        if self.snapshot.is_empty() && self.tool_calls.is_empty() {
            return None;
        }
        let mut message = ChatMessage::assistant(self.snapshot);
        if !self.tool_calls.is_empty() {
            message.tool_calls = Some(self.tool_calls);
        }
        Some(message)
    }
}

/// Streams one reply to stdout. Returns the assistant message to keep, if any.
async fn ask(client: &BackendClient, request: &ChatRequest) -> Option<ChatMessage> {
    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let events = match client.send(request, cancel).await {
        Ok(events) => events,
        Err(e) => {
            ctrl_c.abort();
            error!(error = %e, kind = e.name(), "chat request rejected");
            eprintln!("{}", e.user_message());
            return None;
        }
    };

    let reply = Arc::new(Mutex::new(Reply::default()));
    let (on_content, on_tool_call) = (reply.clone(), reply.clone());
    let terminal = events
        .on(EventKind::Content, move |event| {
            if let StreamEvent::Content(content) = event {
                print!("{}", content.delta);
                let _ = std::io::stdout().flush();
                if let Ok(mut reply) = on_content.lock() {
                    reply.snapshot = content.snapshot.clone();
                }
            }
        })
        .on(EventKind::ToolCall, move |event| {
            if let StreamEvent::ToolCall { name, arguments } = event {
                println!("\n[tool call] {name}({arguments})");
                let arguments = serde_json::from_str(arguments)
                    .unwrap_or_else(|_| Value::String(arguments.clone()));
                if let Ok(mut reply) = on_tool_call.lock() {
                    reply.tool_calls.push(ToolCall {
                        function_name: name.clone(),
                        arguments,
                    });
                }
            }
        })
        .on(EventKind::Error, |event| {
            if let StreamEvent::Error(e) = event {
                eprintln!("\n{}", e.user_message());
            }
        })
        .on(EventKind::Abort, |_| eprintln!("\n(cancelled)"))
        .run()
        .await;
    ctrl_c.abort();
    println!();

    info!(terminal = ?terminal, "reply finished");
    let reply = std::mem::take(&mut *reply.lock().ok()?);
    match terminal {
        // A cancelled reply keeps whatever arrived.
        Terminal::End | Terminal::Abort => reply.into_message(),
        Terminal::Error(_) => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // stdout belongs to the conversation; logs go to a file
    if let Ok(file) = std::fs::File::create("parley-cli.log") {
        tracing_subscriber::fmt()
            .with_writer(file)
            .with_ansi(false)
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley=debug")),
            )
            .init();
    }

    let settings = Settings::from_lookup(|key| std::env::var(key).ok())?;
    info!(server_url = %settings.server_url, model = %settings.model, "starting");
    let client = BackendClient::new(&settings.server_url).with_read_timeout(settings.read_timeout);
    if !client.health().await {
        eprintln!("warning: {} is not answering /health", settings.server_url);
    }

    println!("Connected to {}. /reset clears the conversation, /quit exits.", settings.server_url);
    let mut history: Vec<ChatMessage> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                history.clear();
                println!("(conversation cleared)");
                continue;
            }
            text => history.push(ChatMessage::user(text)),
        }

        let request = ChatRequest {
            model_id: settings.model.clone(),
            messages: history.clone(),
            api_key: settings.api_key.clone(),
            ..ChatRequest::default()
        };
        match ask(&client, &request).await {
            Some(reply) => history.push(reply),
            // nothing usable came back; drop the turn so it is not resent
            None => {
                history.pop();
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn settings_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.server_url, DEFAULT_SERVER_URL);
        assert_eq!(settings.model, "");
        assert_eq!(settings.api_key, None);
        assert_eq!(settings.read_timeout, Duration::from_secs(60));
    }

    #[test]
    fn settings_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("PARLEY_SERVER_URL", "http://chat.internal:8080"),
            ("PARLEY_MODEL", "gpt-4o"),
            ("PARLEY_API_KEY", "sk-mine"),
            ("PARLEY_READ_TIMEOUT_SECS", "15"),
        ]))
        .unwrap();
        assert_eq!(settings.server_url, "http://chat.internal:8080");
        assert_eq!(settings.model, "gpt-4o");
        assert_eq!(settings.api_key.as_deref(), Some("sk-mine"));
        assert_eq!(settings.read_timeout, Duration::from_secs(15));

        assert!(Settings::from_lookup(lookup(&[("PARLEY_READ_TIMEOUT_SECS", "soon")])).is_err());
    }

    #[test]
    fn zero_read_timeout_is_rejected() {
        let err = Settings::from_lookup(lookup(&[("PARLEY_READ_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(err.to_string().contains("greater than 0"));
    }

    #[test]
    fn reply_keeps_tool_calls() {
        let reply = Reply {
            snapshot: String::new(),
            tool_calls: vec![ToolCall {
                function_name: "web_search".into(),
                arguments: serde_json::json!({"query": "rust"}),
            }],
        };
        let message = reply.into_message().unwrap();
        assert_eq!(message.content, "");
        assert_eq!(message.tool_calls.unwrap().len(), 1);
        assert!(Reply::default().into_message().is_none());
    }
}
