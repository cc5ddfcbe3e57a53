pub mod chat;
pub mod conversation;
pub mod database;
pub mod models;
pub mod registry;
pub mod repository;
pub mod session;
pub mod settings;

pub use database::Database;
pub use models::{ModelCatalog, PullTracker};
pub use registry::ConversationRegistry;
pub use repository::{ConversationRepository, LocalConversationRepository};
pub use session::{ChatSession, SessionStatus, SubmitRejected, Submission};
pub use settings::SettingsService;
