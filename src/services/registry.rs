use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use super::chat::new_message_id;
use super::repository::ConversationRepository;
use crate::models::Conversation;

enum WriteOp {
    Save(Conversation),
    Delete(String),
    Flush(oneshot::Sender<()>),
}

/// In-memory list of conversations plus the active pointer.
///
/// Mutations apply to the list immediately and are written through to the
/// store by a background task, in call order.
pub struct ConversationRegistry {
    repository: Arc<dyn ConversationRepository>,
    conversations: Vec<Conversation>,
    active_id: Option<String>,
    loading: bool,
    writes: mpsc::UnboundedSender<WriteOp>,
}

impl ConversationRegistry {
    /// Must be called inside a tokio runtime.
    pub fn new(repository: Arc<dyn ConversationRepository>) -> Self {
        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_through(repository.clone(), rx));
        Self {
            repository,
            conversations: Vec::new(),
            active_id: None,
            loading: true,
            writes,
        }
    }

    /// Replace the in-memory list with the stored one.
    pub async fn load(&mut self) -> Result<()> {
        self.loading = true;
        let result = self.repository.get_all().await;
        self.loading = false;
        self.conversations = result?;
        Ok(())
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active_id.as_deref()
    }

    pub fn active(&self) -> Option<&Conversation> {
        self.active_id.as_deref().and_then(|id| self.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn set_active(&mut self, id: Option<&str>) {
        self.active_id = id.map(str::to_string);
    }

    /// Insert a placeholder conversation at the front and make it active.
    ///
    /// The id is usable immediately; the store write happens in the background.
    pub fn create_new(&mut self) -> String {
        let id = new_message_id();
        let conversation = Conversation::placeholder(id.clone(), Utc::now());
        self.conversations.insert(0, conversation.clone());
        self.active_id = Some(id.clone());
        self.write(WriteOp::Save(conversation));
        id
    }

    pub fn upsert(&mut self, conversation: Conversation) {
        match self
            .conversations
            .iter()
            .position(|c| c.id == conversation.id)
        {
            Some(idx) => self.conversations[idx] = conversation.clone(),
            None => self.conversations.insert(0, conversation.clone()),
        }
        self.write(WriteOp::Save(conversation));
    }

    pub fn delete(&mut self, id: &str) {
        self.conversations.retain(|c| c.id != id);
        if self.active_id.as_deref() == Some(id) {
            self.active_id = None;
        }
        self.write(WriteOp::Delete(id.to_string()));
    }

    /// Wait until every write issued so far has reached the store.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.write(WriteOp::Flush(tx));
        let _ = rx.await;
    }

    fn write(&self, op: WriteOp) {
        if self.writes.send(op).is_err() {
            tracing::error!("Conversation store writer has stopped");
        }
    }
}

async fn write_through(
    repository: Arc<dyn ConversationRepository>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Save(conversation) => {
                if let Err(e) = repository.save(&conversation).await {
                    tracing::error!("Failed to save conversation {}: {:#}", conversation.id, e);
                }
            }
            WriteOp::Delete(id) => {
                if let Err(e) = repository.delete(&id).await {
                    tracing::error!("Failed to delete conversation {}: {:#}", id, e);
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
