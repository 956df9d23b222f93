use crate::error::{StreamingError, NOT_ENOUGH_TOKENS_MESSAGE};
use crate::tokens::{number_of_tokens_in_conversation, Tokenizer, TokenizerHandle};
use crate::ChatMessage;

/// Trims `messages` so the system prompt, the history and `max_reply_tokens`
/// fit into `token_limit`.
///
/// Messages are dropped from index 1 onward, oldest first; the first and the
/// last message are always kept. Fails with `OpenAILimitExceeded` when even
/// the smallest conversation does not fit.
pub fn prepare_messages_to_send(
    tokenizer: &dyn Tokenizer,
    token_limit: usize,
    max_reply_tokens: usize,
    system_prompt: &str,
    messages: &[ChatMessage],
    model_id: &str,
) -> Result<Vec<ChatMessage>, StreamingError> {
    // Index 0 holds the system prompt: history starts at 1 and the message
    // evicted is always at 2, right after the first one.
    let mut conversation = Vec::with_capacity(messages.len() + 1);
    conversation.push(ChatMessage::system(system_prompt));
    conversation.extend_from_slice(messages);

    let required_for = |conversation: &[ChatMessage]| {
        number_of_tokens_in_conversation(tokenizer, conversation, model_id) + max_reply_tokens
    };

    let mut required = required_for(&conversation);
    while conversation.len() > 3 && required > token_limit {
        conversation.remove(2);
        required = required_for(&conversation);
    }

    if required > token_limit {
        return Err(StreamingError::limit_exceeded(
            NOT_ENOUGH_TOKENS_MESSAGE,
            Some(token_limit),
            Some(required),
        ));
    }

    conversation.remove(0);
    Ok(conversation)
}

/// [`prepare_messages_to_send`] after waiting for the tokenizer to be loaded.
pub async fn prepare_messages(
    tokenizer: &TokenizerHandle,
    token_limit: usize,
    max_reply_tokens: usize,
    system_prompt: &str,
    messages: &[ChatMessage],
    model_id: &str,
) -> Result<Vec<ChatMessage>, StreamingError> {
    let tokenizer = tokenizer
        .get()
        .await
        .map_err(|e| StreamingError::generic(e.to_string()))?;
    prepare_messages_to_send(
        tokenizer.as_ref(),
        token_limit,
        max_reply_tokens,
        system_prompt,
        messages,
        model_id,
    )
}
