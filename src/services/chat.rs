use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{Message, MessagePart};
use crate::providers::{
    AiProvider, ChatMessage, ChatRequest, ProviderError, ProviderOptions, StreamEvent,
};

/// Shown in the chat for any failed exchange unless verbose errors are on.
pub const GENERIC_ERROR_MESSAGE: &str = "An error occurred.";

/// How chat failures are described to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    #[default]
    Generic,
    Verbose,
}

impl ErrorPolicy {
    pub fn surface(&self, error: &ProviderError) -> String {
        match self {
            ErrorPolicy::Generic => GENERIC_ERROR_MESSAGE.to_string(),
            ErrorPolicy::Verbose => error.to_string(),
        }
    }
}

/// Parameters needed to dispatch a chat request to the daemon.
pub struct ChatDispatchParams {
    pub request: ChatRequest,
    pub conversation_id: String,
    pub message_id: String,
}

/// Result from streaming: a delta, completion, abort, or error.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamResult {
    Token {
        conversation_id: String,
        message_id: String,
        delta: String,
    },
    Thinking {
        conversation_id: String,
        message_id: String,
        delta: String,
    },
    Done {
        conversation_id: String,
        message_id: String,
    },
    Aborted {
        conversation_id: String,
        message_id: String,
    },
    Error {
        conversation_id: String,
        message_id: String,
        error: String,
    },
}

/// Build a `ChatRequest` from the live history.
pub fn build_request(model: &str, messages: &[Message], think: bool) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages: messages_to_chat_messages(messages),
        options: ProviderOptions { think },
    }
}

/// Convert `Message` list to `ChatMessage` list for the daemon.
///
/// Reasoning is not sent back. Image attachments travel as raw base64.
pub fn messages_to_chat_messages(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| ChatMessage {
            role: m.role,
            content: m.text(),
            images: image_payloads(&m.parts),
        })
        .collect()
}

fn image_payloads(parts: &[MessagePart]) -> Vec<String> {
    parts
        .iter()
        .filter_map(|p| match p {
            MessagePart::File {
                media_type, url, ..
            } if media_type.starts_with("image/") => url
                .strip_prefix("data:")
                .and_then(|rest| rest.split_once(";base64,"))
                .map(|(_, data)| data.to_string()),
            _ => None,
        })
        .collect()
}

/// Run a streaming chat request, reporting `StreamResult` events through a callback.
///
/// Exactly one terminal event (`Done`, `Aborted` or `Error`) is reported last.
pub async fn run_streaming<F>(
    provider: Arc<dyn AiProvider>,
    params: ChatDispatchParams,
    cancel_token: CancellationToken,
    policy: ErrorPolicy,
    mut on_event: F,
) where
    F: FnMut(StreamResult) + Send,
{
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);

    let ChatDispatchParams {
        request,
        conversation_id: conv_id,
        message_id,
    } = params;

    let stream_cancel = cancel_token.clone();
    let handle = tokio::spawn(async move { provider.stream_chat(request, tx, stream_cancel).await });

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Token(delta) => on_event(StreamResult::Token {
                conversation_id: conv_id.clone(),
                message_id: message_id.clone(),
                delta,
            }),
            StreamEvent::Thinking(delta) => on_event(StreamResult::Thinking {
                conversation_id: conv_id.clone(),
                message_id: message_id.clone(),
                delta,
            }),
            StreamEvent::Done {
                prompt_tokens,
                completion_tokens,
            } => {
                tracing::debug!(
                    "Chat {} finished (prompt tokens: {:?}, completion tokens: {:?})",
                    conv_id,
                    prompt_tokens,
                    completion_tokens
                );
            }
        }
    }

    let outcome = match handle.await {
        Ok(result) => result,
        Err(e) => Err(ProviderError::NetworkError(format!("Stream task failed: {}", e))),
    };

    // A stop that lands after the last chunk still counts as a stop.
    let outcome = match outcome {
        Ok(()) if cancel_token.is_cancelled() => Err(ProviderError::Aborted),
        other => other,
    };

    match outcome {
        Ok(()) => on_event(StreamResult::Done {
            conversation_id: conv_id,
            message_id,
        }),
        Err(e) if e.is_abort() => {
            tracing::info!("Chat {} stopped by user", conv_id);
            on_event(StreamResult::Aborted {
                conversation_id: conv_id,
                message_id,
            });
        }
        Err(e) => {
            tracing::warn!("Chat {} failed: {}", conv_id, e);
            on_event(StreamResult::Error {
                conversation_id: conv_id,
                message_id,
                error: policy.surface(&e),
            });
        }
    }
}

/// Generate a new message or conversation ID.
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}
