//! Token counting. The per-message overheads are the simplified accounting
//! OpenAI documents for chat markup; they are fixed constants, not derived.

use std::sync::Arc;
use thiserror::Error;
use tiktoken_rs::CoreBPE;
use tokio::sync::OnceCell;
use tracing::info;

use crate::ChatMessage;

/// Reply priming (`<|start|>assistant<|message|>`).
pub const FIXED_TOKENS_PER_REPLY: usize = 3;

/// Turns text into a token count. Implementations must be pure.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("failed to load tokenizer: {0}")]
    Load(String),
}

/// BPE tokenizer backed by tiktoken's cl100k_base table.
pub struct TiktokenTokenizer {
    bpe: CoreBPE,
}

impl TiktokenTokenizer {
    pub fn cl100k() -> Result<Self, TokenizerError> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| TokenizerError::Load(e.to_string()))?;
        Ok(Self { bpe })
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

static SHARED_TOKENIZER: OnceCell<Arc<dyn Tokenizer>> = OnceCell::const_new();

/// Handle to the tokenizer used for budgeting.
///
/// [`TokenizerHandle::shared`] loads the BPE table once per process, on a
/// blocking thread, the first time it is needed; concurrent first callers wait
/// on the same load. [`TokenizerHandle::with`] substitutes another tokenizer.
#[derive(Clone, Default)]
pub struct TokenizerHandle {
    fixed: Option<Arc<dyn Tokenizer>>,
}

impl TokenizerHandle {
    pub fn shared() -> Self {
        Self { fixed: None }
    }

    pub fn with(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            fixed: Some(tokenizer),
        }
    }

    pub async fn get(&self) -> Result<Arc<dyn Tokenizer>, TokenizerError> {
        if let Some(tokenizer) = &self.fixed {
            return Ok(tokenizer.clone());
        }
        let tokenizer = SHARED_TOKENIZER
            .get_or_try_init(|| async {
                info!("loading cl100k_base tokenizer table");
                let loaded = tokio::task::spawn_blocking(TiktokenTokenizer::cl100k)
                    .await
                    .map_err(|e| TokenizerError::Load(e.to_string()))??;
                Ok::<_, TokenizerError>(Arc::new(loaded) as Arc<dyn Tokenizer>)
            })
            .await?;
        Ok(tokenizer.clone())
    }
}

pub fn number_of_tokens_in_string(tokenizer: &dyn Tokenizer, text: &str) -> usize {
    tokenizer.count_tokens(text)
}

/// Framing overhead per message: GPT-3 family chat markup costs one more.
pub fn fixed_tokens_per_message(model_id: &str) -> usize {
    if model_id.starts_with("gpt-3") {
        4
    } else {
        3
    }
}

pub fn number_of_tokens_in_conversation(
    tokenizer: &dyn Tokenizer,
    messages: &[ChatMessage],
    model_id: &str,
) -> usize {
    let per_message = fixed_tokens_per_message(model_id);
    let body: usize = messages
        .iter()
        .map(|m| {
            per_message
                + tokenizer.count_tokens(m.role.as_str())
                + tokenizer.count_tokens(&m.content)
        })
        .sum();
    body + FIXED_TOKENS_PER_REPLY
}
