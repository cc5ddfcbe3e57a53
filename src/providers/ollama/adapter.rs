use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::models::*;
use super::stream::{parse_chat_stream, parse_pull_stream};
use crate::models::{ModelInfo, PullProgress};
use crate::providers::traits::AiProvider;
use crate::providers::types::{ChatMessage, ChatRequest, ProviderError, StreamEvent};

/// Client for the Ollama REST API.
pub struct OllamaProvider {
    client: Client,
    base_url: Url,
}

impl OllamaProvider {
    pub fn new(base_url: &str) -> Result<Self, url::ParseError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client: Client::new(),
            base_url: base,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|e| ProviderError::NetworkError(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn build_messages(messages: &[ChatMessage]) -> Vec<OllamaMessage> {
        messages
            .iter()
            .map(|msg| OllamaMessage {
                role: msg.role.as_str().to_string(),
                content: msg.content.clone(),
                images: msg.images.clone(),
            })
            .collect()
    }

    async fn send(
        &self,
        req: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<Response, ProviderError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Aborted),
            result = req.send() => result.map_err(|e| {
                ProviderError::NetworkError(format!(
                    "Failed to connect to {}: {}",
                    self.base_url, e
                ))
            }),
        }
    }

    /// Turn a non-2xx response into `RequestFailed`, keeping the body text when asked.
    async fn check_status(
        response: Response,
        operation: &'static str,
        with_body: bool,
    ) -> Result<Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = if with_body {
            response.text().await.unwrap_or_default()
        } else {
            String::new()
        };
        Err(ProviderError::RequestFailed {
            operation,
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl AiProvider for OllamaProvider {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let url = self.endpoint("api/tags")?;
        let response = self
            .send(self.client.get(url), &CancellationToken::new())
            .await?;
        let response = Self::check_status(response, "Failed to fetch models", false).await?;

        let tags: OllamaTagList = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse model list: {}", e))
        })?;
        Ok(tags.models)
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError> {
        let url = self.endpoint("api/chat")?;
        let body = OllamaChatRequest {
            model: request.model,
            messages: Self::build_messages(&request.messages),
            stream: true,
            think: request.options.think,
        };

        tracing::debug!(model = %body.model, messages = body.messages.len(), "Starting chat stream");

        let req = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(&body);
        let response = self.send(req, &cancel).await?;
        let response = Self::check_status(response, "Chat request failed", true).await?;

        parse_chat_stream(response.bytes_stream(), tx, cancel).await
    }

    async fn reconnect_to_stream(&self, chat_id: &str) -> Option<mpsc::Receiver<StreamEvent>> {
        // The daemon keeps no per-chat session, so there is never anything to resume
        tracing::debug!(chat_id, "No resumable stream");
        None
    }

    async fn pull_model(
        &self,
        name: &str,
        on_progress: &mut (dyn FnMut(PullProgress) + Send),
        cancel: CancellationToken,
    ) -> Result<(), ProviderError> {
        let url = self.endpoint("api/pull")?;
        let req = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(&OllamaPullRequest { name, stream: true });
        let response = self.send(req, &cancel).await?;
        let response = Self::check_status(response, "Pull failed", true).await?;

        parse_pull_stream(response.bytes_stream(), on_progress, cancel).await
    }

    async fn delete_model(&self, name: &str) -> Result<(), ProviderError> {
        let url = self.endpoint("api/delete")?;
        let req = self
            .client
            .delete(url)
            .header("content-type", "application/json")
            .json(&OllamaDeleteRequest { name });
        let response = self.send(req, &CancellationToken::new()).await?;
        Self::check_status(response, "Delete failed", true).await?;
        Ok(())
    }
}
