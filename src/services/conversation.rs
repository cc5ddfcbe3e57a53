use std::collections::BTreeMap;

use chrono::{DateTime, Local, Utc};

use crate::models::{Attachment, Message, MessagePart, Role, DEFAULT_TITLE};

const TITLE_MAX_CHARS: usize = 40;

/// Text sent in place of an empty prompt when only files are attached.
pub const ATTACHMENTS_ONLY_TEXT: &str = "Sent with attachments";

/// Build the outgoing user message, or `None` when there is nothing to send.
pub fn build_user_message(id: String, text: &str, attachments: &[Attachment]) -> Option<Message> {
    let blank = text.trim().is_empty();
    if blank && attachments.is_empty() {
        return None;
    }
    let text = if blank {
        ATTACHMENTS_ONLY_TEXT
    } else {
        text
    };
    Some(Message::user(id, text, attachments))
}

/// Title for a conversation, taken from the first user message's text.
pub fn derive_title(messages: &[Message]) -> String {
    let Some(first) = messages.iter().find(|m| m.role == Role::User) else {
        return DEFAULT_TITLE.to_string();
    };

    let text = first
        .parts
        .iter()
        .filter_map(|p| match p {
            MessagePart::Text { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ");
    let text = text.trim();

    if text.is_empty() {
        return DEFAULT_TITLE.to_string();
    }

    if text.chars().count() > TITLE_MAX_CHARS {
        let head: String = text.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}\u{2026}", head)
    } else {
        text.to_string()
    }
}

/// Sidebar-style date label: "Today", "Yesterday", or the calendar date.
pub fn format_relative_date(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let today = now.with_timezone(&Local).date_naive();
    let day = timestamp.with_timezone(&Local).date_naive();
    match (today - day).num_days() {
        0 => "Today".to_string(),
        1 => "Yesterday".to_string(),
        _ => day.format("%Y-%m-%d").to_string(),
    }
}

/// Prepare the live history for regeneration: drop a trailing assistant
/// answer together with its attribution entry.
///
/// Returns `false`, leaving both untouched, when there is no user message to answer.
pub fn prepare_regeneration(
    messages: &mut Vec<Message>,
    message_models: &mut BTreeMap<String, String>,
) -> bool {
    let answers_from = match messages.last() {
        Some(last) if last.role == Role::Assistant => messages.len() - 1,
        _ => messages.len(),
    };
    if !messages[..answers_from].iter().any(|m| m.role == Role::User) {
        return false;
    }
    if answers_from < messages.len() {
        if let Some(replaced) = messages.pop() {
            message_models.remove(&replaced.id);
        }
    }
    true
}
