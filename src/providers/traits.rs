use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::{ChatRequest, ProviderError, StreamEvent};
use crate::models::{ModelInfo, PullProgress};

#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;

    /// Stream a chat completion into `tx`.
    ///
    /// Returns `Ok(())` once the response is complete. Cancelling `cancel`
    /// makes the call return `ProviderError::Aborted` promptly; anything already
    /// sent on `tx` stays sent.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError>;

    /// Resume a stream after a reload. `None` means there is nothing to resume.
    async fn reconnect_to_stream(&self, chat_id: &str) -> Option<mpsc::Receiver<StreamEvent>>;

    async fn pull_model(
        &self,
        name: &str,
        on_progress: &mut (dyn FnMut(PullProgress) + Send),
        cancel: CancellationToken,
    ) -> Result<(), ProviderError>;

    async fn delete_model(&self, name: &str) -> Result<(), ProviderError>;
}
