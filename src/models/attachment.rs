use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::message::MessagePart;

/// A file the user attached to a submission, held in memory until sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub mime_type: String,
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.data))
    }

    pub fn to_part(&self) -> MessagePart {
        MessagePart::File {
            media_type: self.mime_type.clone(),
            filename: self.filename.clone(),
            url: self.data_url(),
            extra: Default::default(),
        }
    }
}

/// Guess a MIME type from a file name's extension.
pub fn mime_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "txt" | "md" => "text/plain",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
