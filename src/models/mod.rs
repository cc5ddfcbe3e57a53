pub mod attachment;
pub mod conversation;
pub mod message;
pub mod model_info;

pub use attachment::Attachment;
pub use conversation::{Conversation, DEFAULT_TITLE};
pub use message::{Message, MessagePart, PartState, Role};
pub use model_info::{ModelDetails, ModelInfo, PullProgress};
