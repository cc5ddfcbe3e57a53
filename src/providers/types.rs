use thiserror::Error;

use crate::models::Role;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("{operation}: {status}{}", body_suffix(.body))]
    RequestFailed {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("Request aborted")]
    Aborted,
}

fn body_suffix(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(" {}", body)
    }
}

impl ProviderError {
    /// True for user-initiated cancellation, which callers must not treat as a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, ProviderError::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderOptions {
    /// Ask the daemon for a separate reasoning channel.
    pub think: bool,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self { think: true }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Base64 image payloads, without a data URL prefix.
    pub images: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub options: ProviderOptions,
}

/// A normalized chunk of a streaming chat response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    Thinking(String),
    Done {
        prompt_tokens: Option<u64>,
        completion_tokens: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_failed_display() {
        let list = ProviderError::RequestFailed {
            operation: "Failed to fetch models",
            status: 503,
            body: String::new(),
        };
        assert_eq!(list.to_string(), "Failed to fetch models: 503");

        let pull = ProviderError::RequestFailed {
            operation: "Pull failed",
            status: 404,
            body: "{\"error\":\"model not found\"}".to_string(),
        };
        assert_eq!(
            pull.to_string(),
            "Pull failed: 404 {\"error\":\"model not found\"}"
        );
        assert!(!pull.is_abort());
        assert!(ProviderError::Aborted.is_abort());
    }
}
