use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::chat::{
    build_request, new_message_id, run_streaming, ChatDispatchParams, ErrorPolicy, StreamResult,
};
use super::conversation::{build_user_message, derive_title, prepare_regeneration};
use super::registry::ConversationRegistry;
use super::settings::AppSettings;
use crate::models::{Attachment, Conversation, Message, ModelInfo, Role};
use crate::providers::AiProvider;

/// What the user typed plus any attached files.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl Submission {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionStatus {
    #[default]
    Idle,
    /// Request sent, nothing received yet.
    Submitted,
    Streaming,
    Error(String),
}

/// Why a submit did not send anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitRejected {
    #[error("Nothing to send.")]
    Empty,
    #[error("Still answering. /stop to interrupt.")]
    Busy,
}

impl SessionStatus {
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionStatus::Submitted | SessionStatus::Streaming)
    }
}

/// A first message held until the conversation it belongs to is live.
struct PendingSend {
    target_id: String,
    message: Message,
}

/// Live state of one conversation's exchange.
#[derive(Default)]
struct LiveChat {
    messages: Vec<Message>,
    message_models: BTreeMap<String, String>,
    status: SessionStatus,
    cancel: Option<CancellationToken>,
    /// Model selected when the current exchange was dispatched.
    pending_model: String,
    streaming_id: Option<String>,
}

impl LiveChat {
    fn from_conversation(conversation: Option<&Conversation>) -> Self {
        match conversation {
            Some(c) => Self {
                messages: c.messages.clone(),
                message_models: c.message_models.clone(),
                ..Default::default()
            },
            None => Self::default(),
        }
    }

    fn is_busy(&self) -> bool {
        self.status.is_busy()
    }

    fn assistant_message(&mut self, id: &str) -> &mut Message {
        if !self.messages.last().is_some_and(|m| m.id == id) {
            self.messages
                .push(Message::new(id, Role::Assistant, Vec::new()));
        }
        let last = self.messages.len() - 1;
        &mut self.messages[last]
    }

    fn finish_message(&mut self, id: &str) {
        if let Some(message) = self.messages.iter_mut().rev().find(|m| m.id == id) {
            message.finish_parts();
        }
    }

    /// Stamp the trailing assistant message with the pending model, once.
    fn reconcile_attribution(&mut self) {
        let Some(last) = self.messages.last() else {
            return;
        };
        if last.role != Role::Assistant
            || self.pending_model.is_empty()
            || self.message_models.contains_key(&last.id)
        {
            return;
        }
        self.message_models
            .insert(last.id.clone(), self.pending_model.clone());
    }

    fn settle(&mut self, status: SessionStatus) {
        self.status = status;
        self.cancel = None;
        self.streaming_id = None;
    }
}

/// Chat controller: owns the model selection, the live chats and the
/// conversation registry. All state changes go through `&mut self`;
/// in-flight streams report back through `next_event`.
pub struct ChatSession {
    provider: Arc<dyn AiProvider>,
    registry: ConversationRegistry,
    error_policy: ErrorPolicy,
    think: bool,
    model: String,
    default_model_applied: bool,
    /// Conversation the live view is keyed to.
    keyed_id: Option<String>,
    chats: HashMap<String, LiveChat>,
    pending: Option<PendingSend>,
    events_tx: mpsc::UnboundedSender<StreamResult>,
    events_rx: mpsc::UnboundedReceiver<StreamResult>,
}

impl ChatSession {
    pub fn new(
        provider: Arc<dyn AiProvider>,
        registry: ConversationRegistry,
        settings: &AppSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            provider,
            registry,
            error_policy: settings.error_policy(),
            think: settings.think,
            model: String::new(),
            default_model_applied: false,
            keyed_id: None,
            chats: HashMap::new(),
            pending: None,
            events_tx,
            events_rx,
        }
    }

    pub fn registry(&self) -> &ConversationRegistry {
        &self.registry
    }

    pub async fn load_conversations(&mut self) -> Result<()> {
        self.registry.load().await?;
        self.sync_identity();
        Ok(())
    }

    pub fn active_id(&self) -> Option<&str> {
        self.keyed_id.as_deref()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    /// Pick the first installed model when nothing has been chosen yet.
    pub fn on_models_available(&mut self, models: &[ModelInfo]) {
        if self.default_model_applied || !self.model.is_empty() {
            return;
        }
        if let Some(first) = models.first() {
            tracing::debug!("Selecting default model {}", first.name);
            self.model = first.name.clone();
            self.default_model_applied = true;
        }
    }

    pub fn messages(&self) -> &[Message] {
        self.current().map(|c| c.messages.as_slice()).unwrap_or(&[])
    }

    pub fn status(&self) -> SessionStatus {
        self.current().map(|c| c.status.clone()).unwrap_or_default()
    }

    pub fn message_models(&self) -> BTreeMap<String, String> {
        self.current()
            .map(|c| c.message_models.clone())
            .unwrap_or_default()
    }

    pub fn is_busy(&self) -> bool {
        self.chats.values().any(LiveChat::is_busy)
    }

    fn current(&self) -> Option<&LiveChat> {
        self.keyed_id.as_ref().and_then(|id| self.chats.get(id))
    }

    /// Send a user message.
    ///
    /// Without an active conversation a new one is created first and the
    /// message goes out once the session is keyed to it.
    pub fn submit(&mut self, submission: Submission) -> Result<(), SubmitRejected> {
        let Some(message) =
            build_user_message(new_message_id(), &submission.text, &submission.attachments)
        else {
            return Err(SubmitRejected::Empty);
        };

        let Some(id) = self.keyed_id.clone() else {
            let id = self.registry.create_new();
            tracing::debug!("Created conversation {} for first message", id);
            self.pending = Some(PendingSend {
                target_id: id,
                message,
            });
            self.sync_identity();
            return Ok(());
        };

        let chat = self.chats.entry(id.clone()).or_default();
        if chat.is_busy() {
            tracing::debug!("Ignoring submit while conversation {} is busy", id);
            return Err(SubmitRejected::Busy);
        }
        chat.messages.push(message);
        self.dispatch(&id);
        Ok(())
    }

    /// Re-run the last exchange with the current model, replacing the previous answer.
    pub fn regenerate(&mut self) -> bool {
        let Some(id) = self.keyed_id.clone() else {
            return false;
        };
        let Some(chat) = self.chats.get_mut(&id) else {
            return false;
        };
        if chat.is_busy() || !prepare_regeneration(&mut chat.messages, &mut chat.message_models) {
            return false;
        }
        self.dispatch(&id);
        true
    }

    /// Abort the active conversation's exchange. Partial output is kept.
    pub fn stop(&mut self) -> bool {
        let Some(token) = self.current().and_then(|c| c.cancel.as_ref()) else {
            return false;
        };
        token.cancel();
        true
    }

    pub fn new_conversation(&mut self) -> String {
        let id = self.registry.create_new();
        self.sync_identity();
        id
    }

    /// Make `id` the active conversation, or clear the selection with `None`.
    pub fn switch_to(&mut self, id: Option<&str>) -> bool {
        if let Some(id) = id {
            if self.registry.get(id).is_none() {
                return false;
            }
        }
        self.registry.set_active(id);
        self.sync_identity();
        true
    }

    pub fn delete_conversation(&mut self, id: &str) {
        if let Some(chat) = self.chats.remove(id) {
            if let Some(token) = chat.cancel {
                token.cancel();
            }
        }
        self.registry.delete(id);
        self.sync_identity();
    }

    pub async fn next_event(&mut self) -> Option<StreamResult> {
        self.events_rx.recv().await
    }

    pub fn handle_event(&mut self, event: StreamResult) {
        match event {
            StreamResult::Token {
                conversation_id,
                message_id,
                delta,
            } => {
                if let Some(chat) = self.streaming_chat(&conversation_id, &message_id) {
                    chat.status = SessionStatus::Streaming;
                    chat.assistant_message(&message_id).append_text_delta(&delta);
                    chat.reconcile_attribution();
                }
            }
            StreamResult::Thinking {
                conversation_id,
                message_id,
                delta,
            } => {
                if let Some(chat) = self.streaming_chat(&conversation_id, &message_id) {
                    chat.status = SessionStatus::Streaming;
                    chat.assistant_message(&message_id)
                        .append_reasoning_delta(&delta);
                    chat.reconcile_attribution();
                }
            }
            StreamResult::Done {
                conversation_id,
                message_id,
            } => {
                let Some(chat) = self.streaming_chat(&conversation_id, &message_id) else {
                    return;
                };
                chat.assistant_message(&message_id).finish_parts();
                chat.reconcile_attribution();
                chat.settle(SessionStatus::Idle);
                self.persist(&conversation_id);
                self.release(&conversation_id);
            }
            StreamResult::Aborted {
                conversation_id,
                message_id,
            } => {
                let Some(chat) = self.streaming_chat(&conversation_id, &message_id) else {
                    return;
                };
                chat.finish_message(&message_id);
                chat.settle(SessionStatus::Idle);
                self.release(&conversation_id);
            }
            StreamResult::Error {
                conversation_id,
                message_id,
                error,
            } => {
                let Some(chat) = self.streaming_chat(&conversation_id, &message_id) else {
                    return;
                };
                chat.finish_message(&message_id);
                chat.settle(SessionStatus::Error(error));
                self.release(&conversation_id);
            }
        }
    }

    /// Process events until no exchange is in flight.
    pub async fn run_until_idle(&mut self) {
        while self.is_busy() {
            match self.events_rx.recv().await {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }
    }

    fn streaming_chat(&mut self, conversation_id: &str, message_id: &str) -> Option<&mut LiveChat> {
        self.chats
            .get_mut(conversation_id)
            .filter(|c| c.streaming_id.as_deref() == Some(message_id))
    }

    fn dispatch(&mut self, conversation_id: &str) {
        let Some(chat) = self.chats.get_mut(conversation_id) else {
            return;
        };
        let message_id = new_message_id();
        let cancel = CancellationToken::new();

        chat.pending_model = self.model.clone();
        chat.status = SessionStatus::Submitted;
        chat.cancel = Some(cancel.clone());
        chat.streaming_id = Some(message_id.clone());

        let params = ChatDispatchParams {
            request: build_request(&self.model, &chat.messages, self.think),
            conversation_id: conversation_id.to_string(),
            message_id,
        };
        let provider = self.provider.clone();
        let events = self.events_tx.clone();
        let policy = self.error_policy;

        tokio::spawn(async move {
            run_streaming(provider, params, cancel, policy, move |event| {
                let _ = events.send(event);
            })
            .await;
        });
    }

    /// Write the finished exchange through the registry.
    fn persist(&mut self, conversation_id: &str) {
        let Some(chat) = self.chats.get(conversation_id) else {
            return;
        };
        let now = Utc::now();
        let created_at = self
            .registry
            .get(conversation_id)
            .map(|c| c.created_at)
            .unwrap_or(now);
        let model = if self.keyed_id.as_deref() == Some(conversation_id) {
            self.model.clone()
        } else {
            chat.pending_model.clone()
        };

        let mut conversation = Conversation {
            id: conversation_id.to_string(),
            title: derive_title(&chat.messages),
            created_at,
            updated_at: now,
            model,
            messages: chat.messages.clone(),
            message_models: chat.message_models.clone(),
        };
        conversation.prune_attribution();
        self.registry.upsert(conversation);
    }

    /// Drop live state of a settled chat the view no longer shows.
    fn release(&mut self, conversation_id: &str) {
        if self.keyed_id.as_deref() == Some(conversation_id) {
            return;
        }
        if self.chats.get(conversation_id).is_some_and(|c| !c.is_busy()) {
            self.chats.remove(conversation_id);
        }
    }

    /// Re-key the live view when the registry's active id changed, then
    /// release a held first message if its conversation is now live.
    fn sync_identity(&mut self) {
        let active = self.registry.active_id().map(str::to_string);
        if active != self.keyed_id {
            self.rekey(active);
        }
        self.fire_pending();
    }

    fn rekey(&mut self, next: Option<String>) {
        if let Some(previous) = self.keyed_id.take() {
            self.release(&previous);
        }

        let stale = self
            .pending
            .as_ref()
            .is_some_and(|p| next.as_deref() != Some(p.target_id.as_str()));
        if stale {
            if let Some(pending) = self.pending.take() {
                tracing::warn!(
                    "Dropping held message for conversation {}",
                    pending.target_id
                );
            }
        }

        if let Some(id) = &next {
            let conversation = self.registry.get(id);
            if let Some(model) = conversation.map(|c| &c.model).filter(|m| !m.is_empty()) {
                self.model = model.clone();
            }
            if !self.chats.contains_key(id) {
                self.chats
                    .insert(id.clone(), LiveChat::from_conversation(conversation));
            }
        }

        self.keyed_id = next;
    }

    fn fire_pending(&mut self) {
        let Some(id) = self.keyed_id.clone() else {
            return;
        };
        if !self.pending.as_ref().is_some_and(|p| p.target_id == id) {
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };
        self.chats
            .entry(id.clone())
            .or_default()
            .messages
            .push(pending.message);
        self.dispatch(&id);
    }
}
