use anyhow::{Context, Result};
use async_trait::async_trait;

use super::database::Database;
use crate::config::CONVERSATIONS_KEY;
use crate::models::Conversation;

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn get_all(&self) -> Result<Vec<Conversation>>;

    async fn get_by_id(&self, id: &str) -> Result<Option<Conversation>>;

    /// Replace the stored record with the same id, or insert it at the front.
    async fn save(&self, conversation: &Conversation) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// Keeps every conversation as a single JSON array under one key.
#[derive(Debug, Clone)]
pub struct LocalConversationRepository {
    db: Database,
}

impl LocalConversationRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn write_all(&self, conversations: &[Conversation]) -> Result<()> {
        let json = serde_json::to_string(conversations)?;
        self.db.set(CONVERSATIONS_KEY, &json).await
    }
}

#[async_trait]
impl ConversationRepository for LocalConversationRepository {
    async fn get_all(&self) -> Result<Vec<Conversation>> {
        match self.db.get(CONVERSATIONS_KEY).await? {
            Some(raw) if !raw.is_empty() => {
                serde_json::from_str(&raw).context("Failed to parse stored conversations")
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Conversation>> {
        let all = self.get_all().await?;
        Ok(all.into_iter().find(|c| c.id == id))
    }

    async fn save(&self, conversation: &Conversation) -> Result<()> {
        let mut all = self.get_all().await?;
        match all.iter().position(|c| c.id == conversation.id) {
            Some(idx) => all[idx] = conversation.clone(),
            None => all.insert(0, conversation.clone()),
        }
        self.write_all(&all).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut all = self.get_all().await?;
        all.retain(|c| c.id != id);
        self.write_all(&all).await
    }
}
