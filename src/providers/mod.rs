pub mod ollama;
pub mod traits;
pub mod types;

pub use ollama::OllamaProvider;
pub use traits::AiProvider;
pub use types::{ChatMessage, ChatRequest, ProviderError, ProviderOptions, StreamEvent};
