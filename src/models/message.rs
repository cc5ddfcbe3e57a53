use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::attachment::Attachment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartState {
    Streaming,
    Done,
}

/// A typed fragment of a message.
///
/// Part kinds this crate does not interpret are kept verbatim in `Other`.
/// Known kinds keep any fields they do not model in `extra`, so stored
/// conversations survive a load/save cycle unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text {
        text: String,
        state: Option<PartState>,
        extra: Map<String, Value>,
    },
    Reasoning {
        text: String,
        state: Option<PartState>,
        extra: Map<String, Value>,
    },
    File {
        media_type: String,
        filename: Option<String>,
        url: String,
        extra: Map<String, Value>,
    },
    Other(Value),
}

#[derive(Serialize, Deserialize)]
struct TextFields {
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<PartState>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct FileFields {
    #[serde(rename = "mediaType")]
    media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    url: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn tagged<T: Serialize>(kind: &str, fields: T) -> serde_json::Result<Value> {
    let mut value = serde_json::to_value(fields)?;
    if let Value::Object(map) = &mut value {
        map.insert("type".to_string(), Value::String(kind.to_string()));
    }
    Ok(value)
}

impl Serialize for MessagePart {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = match self {
            MessagePart::Text { text, state, extra } => tagged(
                "text",
                TextFields {
                    text: text.clone(),
                    state: *state,
                    extra: extra.clone(),
                },
            ),
            MessagePart::Reasoning { text, state, extra } => tagged(
                "reasoning",
                TextFields {
                    text: text.clone(),
                    state: *state,
                    extra: extra.clone(),
                },
            ),
            MessagePart::File {
                media_type,
                filename,
                url,
                extra,
            } => tagged(
                "file",
                FileFields {
                    media_type: media_type.clone(),
                    filename: filename.clone(),
                    url: url.clone(),
                    extra: extra.clone(),
                },
            ),
            MessagePart::Other(value) => return value.serialize(serializer),
        };
        value
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessagePart {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind @ ("text" | "reasoning" | "file")) => kind.to_string(),
            _ => return Ok(MessagePart::Other(value)),
        };
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => return Ok(MessagePart::Other(other)),
        };
        fields.remove("type");
        let fields = Value::Object(fields);

        Ok(match kind.as_str() {
            "file" => {
                let FileFields {
                    media_type,
                    filename,
                    url,
                    extra,
                } = serde_json::from_value(fields).map_err(serde::de::Error::custom)?;
                MessagePart::File {
                    media_type,
                    filename,
                    url,
                    extra,
                }
            }
            _ => {
                let TextFields { text, state, extra } =
                    serde_json::from_value(fields).map_err(serde::de::Error::custom)?;
                if kind == "text" {
                    MessagePart::Text { text, state, extra }
                } else {
                    MessagePart::Reasoning { text, state, extra }
                }
            }
        })
    }
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text {
            text: text.into(),
            state: None,
            extra: Map::new(),
        }
    }

    fn finish(&mut self) {
        match self {
            MessagePart::Text { state, .. } | MessagePart::Reasoning { state, .. } => {
                if *state == Some(PartState::Streaming) {
                    *state = Some(PartState::Done);
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Stored fields this crate does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, parts: Vec<MessagePart>) -> Self {
        Self {
            id: id.into(),
            role,
            parts,
            metadata: None,
            extra: Map::new(),
        }
    }

    /// Build a user message from typed text plus any attached files.
    pub fn user(id: impl Into<String>, text: &str, attachments: &[Attachment]) -> Self {
        let mut parts: Vec<MessagePart> = attachments.iter().map(Attachment::to_part).collect();
        parts.push(MessagePart::text(text));
        Self::new(id, Role::User, parts)
    }

    /// All literal text parts, concatenated in order.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn reasoning(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Reasoning { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn append_text_delta(&mut self, delta: &str) {
        if let Some(MessagePart::Text {
            text,
            state: Some(PartState::Streaming),
            ..
        }) = self.parts.last_mut()
        {
            text.push_str(delta);
            return;
        }
        self.finish_parts();
        self.parts.push(MessagePart::Text {
            text: delta.to_string(),
            state: Some(PartState::Streaming),
            extra: Map::new(),
        });
    }

    pub fn append_reasoning_delta(&mut self, delta: &str) {
        if let Some(MessagePart::Reasoning {
            text,
            state: Some(PartState::Streaming),
            ..
        }) = self.parts.last_mut()
        {
            text.push_str(delta);
            return;
        }
        self.finish_parts();
        self.parts.push(MessagePart::Reasoning {
            text: delta.to_string(),
            state: Some(PartState::Streaming),
            extra: Map::new(),
        });
    }

    /// Mark every still-streaming part as done. Content is left untouched.
    pub fn finish_parts(&mut self) {
        for part in &mut self.parts {
            part.finish();
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.parts.iter().any(|p| {
            matches!(
                p,
                MessagePart::Text {
                    state: Some(PartState::Streaming),
                    ..
                } | MessagePart::Reasoning {
                    state: Some(PartState::Streaming),
                    ..
                }
            )
        })
    }
}
