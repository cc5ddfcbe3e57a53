use std::collections::BTreeMap;

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{Message, Role};

pub const DEFAULT_TITLE: &str = "New Chat";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Assistant message id -> name of the model that produced it.
    #[serde(default)]
    pub message_models: BTreeMap<String, String>,
}

impl Conversation {
    /// An empty conversation with the placeholder title and no model.
    pub fn placeholder(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
            model: String::new(),
            messages: Vec::new(),
            message_models: BTreeMap::new(),
        }
    }

    /// Drop attribution entries that do not point at an assistant message.
    pub fn prune_attribution(&mut self) {
        let messages = &self.messages;
        self.message_models.retain(|id, model| {
            !model.is_empty()
                && messages
                    .iter()
                    .any(|m| &m.id == id && m.role == Role::Assistant)
        });
    }
}
