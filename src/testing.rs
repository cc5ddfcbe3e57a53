//! In-process fakes shared by the service tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{Conversation, ModelDetails, ModelInfo, PullProgress};
use crate::providers::{AiProvider, ChatRequest, ProviderError, StreamEvent};
use crate::services::repository::ConversationRepository;

/// Pull names the fake treats specially.
pub const PULL_HANGS: &str = "hangs";
pub const MISSING_MODEL: &str = "missing";

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Token(&'static str),
    Thinking(&'static str),
    /// Fail the stream with a daemon error.
    Fail(&'static str),
    /// Block until cancelled.
    Hang,
}

/// A provider that replays one scripted response per chat request.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    requests: Mutex<Vec<ChatRequest>>,
    models: Mutex<Vec<ModelInfo>>,
    list_failures: AtomicUsize,
    list_calls: AtomicUsize,
    pull_progress: Mutex<Vec<PullProgress>>,
    deleted: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        }
    }

    pub fn with_models(self, names: &[&str]) -> Self {
        *self.models.lock().unwrap() = names.iter().map(|n| model_info(n)).collect();
        self
    }

    pub fn failing_list(self, times: usize) -> Self {
        self.list_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn with_pull_progress(self, progress: Vec<PullProgress>) -> Self {
        *self.pull_progress.lock().unwrap() = progress;
        self
    }

    pub fn set_models(&self, names: &[&str]) {
        *self.models.lock().unwrap() = names.iter().map(|n| model_info(n)).collect();
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

pub fn model_info(name: &str) -> ModelInfo {
    ModelInfo {
        name: name.to_string(),
        model: name.to_string(),
        modified_at: None,
        size: 0,
        digest: String::new(),
        details: ModelDetails::default(),
    }
}

#[async_trait]
impl AiProvider for ScriptedProvider {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.list_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.list_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::RequestFailed {
                operation: "Failed to fetch models",
                status: 500,
                body: String::new(),
            });
        }
        Ok(self.models.lock().unwrap().clone())
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError> {
        self.requests.lock().unwrap().push(request);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();

        for step in script {
            if cancel.is_cancelled() {
                return Err(ProviderError::Aborted);
            }
            match step {
                ScriptStep::Token(t) => tx
                    .send(StreamEvent::Token(t.to_string()))
                    .await
                    .map_err(|_| ProviderError::Aborted)?,
                ScriptStep::Thinking(t) => tx
                    .send(StreamEvent::Thinking(t.to_string()))
                    .await
                    .map_err(|_| ProviderError::Aborted)?,
                ScriptStep::Fail(msg) => return Err(ProviderError::Daemon(msg.to_string())),
                ScriptStep::Hang => {
                    cancel.cancelled().await;
                    return Err(ProviderError::Aborted);
                }
            }
        }

        tx.send(StreamEvent::Done {
            prompt_tokens: None,
            completion_tokens: None,
        })
        .await
        .map_err(|_| ProviderError::Aborted)
    }

    async fn reconnect_to_stream(&self, _chat_id: &str) -> Option<mpsc::Receiver<StreamEvent>> {
        None
    }

    async fn pull_model(
        &self,
        name: &str,
        on_progress: &mut (dyn FnMut(PullProgress) + Send),
        cancel: CancellationToken,
    ) -> Result<(), ProviderError> {
        if name == MISSING_MODEL {
            return Err(ProviderError::RequestFailed {
                operation: "Pull failed",
                status: 404,
                body: "model not found".to_string(),
            });
        }
        let progress = self.pull_progress.lock().unwrap().clone();
        for p in progress {
            on_progress(p);
        }
        if name == PULL_HANGS {
            cancel.cancelled().await;
            return Err(ProviderError::Aborted);
        }
        self.models.lock().unwrap().push(model_info(name));
        Ok(())
    }

    async fn delete_model(&self, name: &str) -> Result<(), ProviderError> {
        if name == MISSING_MODEL {
            return Err(ProviderError::RequestFailed {
                operation: "Delete failed",
                status: 404,
                body: "model not found".to_string(),
            });
        }
        self.deleted.lock().unwrap().push(name.to_string());
        self.models.lock().unwrap().retain(|m| m.name != name);
        Ok(())
    }
}

/// Conversation store that keeps records in memory and logs every write.
#[derive(Default)]
pub struct RecordingRepository {
    records: Mutex<Vec<Conversation>>,
    saves: Mutex<Vec<Conversation>>,
    deletes: Mutex<Vec<String>>,
}

impl RecordingRepository {
    pub fn with_records(records: Vec<Conversation>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Default::default()
        }
    }

    pub fn saves(&self) -> Vec<Conversation> {
        self.saves.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn stored(&self, id: &str) -> Option<Conversation> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }
}

#[async_trait]
impl ConversationRepository for RecordingRepository {
    async fn get_all(&self) -> Result<Vec<Conversation>> {
        Ok(self.records.lock().unwrap().clone())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self.stored(id))
    }

    async fn save(&self, conversation: &Conversation) -> Result<()> {
        self.saves.lock().unwrap().push(conversation.clone());
        let mut records = self.records.lock().unwrap();
        match records.iter().position(|c| c.id == conversation.id) {
            Some(idx) => records[idx] = conversation.clone(),
            None => records.insert(0, conversation.clone()),
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.deletes.lock().unwrap().push(id.to_string());
        self.records.lock().unwrap().retain(|c| c.id != id);
        Ok(())
    }
}
