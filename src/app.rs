use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config;
use crate::models::attachment::mime_type_for;
use crate::models::{Attachment, PullProgress, Role};
use crate::providers::{AiProvider, OllamaProvider};
use crate::services::chat::StreamResult;
use crate::services::conversation::format_relative_date;
use crate::services::models::{format_bytes, ModelCatalog, PullPhase, PullTracker};
use crate::services::registry::ConversationRegistry;
use crate::services::repository::LocalConversationRepository;
use crate::services::session::{ChatSession, SessionStatus, Submission};
use crate::services::{Database, SettingsService};

const HELP: &str = "\
Type a message and press Enter to send it.
  /attach <path>   attach a file to the next message
  /send [text]     send, even with only attachments
  /regen           regenerate the last answer
  /stop            stop the current answer
  /new             start a new conversation
  /list            list conversations
  /open <n>        open conversation n from /list
  /delete <n>      delete conversation n (repeat to confirm)
  /model <name>    select a model
  /models          list installed models
  /pull <name>     download a model (Ctrl-C cancels)
  /rm <name>       delete an installed model (repeat to confirm)
  /quit            exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMsg {
    Send(String),
    Attach(PathBuf),
    Regenerate,
    Stop,
    NewChat,
    ListConversations,
    OpenConversation(usize),
    DeleteConversation(usize),
    SelectModel(String),
    ListModels,
    PullModel(String),
    RemoveModel(String),
    Help,
    Quit,
}

impl AppMsg {
    /// Parse one input line. Blank lines and unknown commands give `None`.
    pub fn parse(line: &str) -> Option<AppMsg> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let Some(command) = trimmed.strip_prefix('/') else {
            return Some(AppMsg::Send(line.to_string()));
        };

        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        let index = || arg.parse::<usize>().ok().filter(|n| *n > 0);

        match (name, arg.is_empty()) {
            ("attach", false) => Some(AppMsg::Attach(PathBuf::from(arg))),
            ("send", _) => Some(AppMsg::Send(arg.to_string())),
            ("regen", _) => Some(AppMsg::Regenerate),
            ("stop", _) => Some(AppMsg::Stop),
            ("new", _) => Some(AppMsg::NewChat),
            ("list", _) => Some(AppMsg::ListConversations),
            ("open", false) => index().map(AppMsg::OpenConversation),
            ("delete", false) => index().map(AppMsg::DeleteConversation),
            ("model", false) => Some(AppMsg::SelectModel(arg.to_string())),
            ("models", _) => Some(AppMsg::ListModels),
            ("pull", false) => Some(AppMsg::PullModel(arg.to_string())),
            ("rm", false) => Some(AppMsg::RemoveModel(arg.to_string())),
            ("help", _) => Some(AppMsg::Help),
            ("quit", _) | ("exit", _) => Some(AppMsg::Quit),
            _ => None,
        }
    }
}

/// Destructive actions take two identical requests: the first arms, the second runs.
fn confirm(armed: &mut Option<String>, target: &str) -> bool {
    if armed.as_deref() == Some(target) {
        *armed = None;
        true
    } else {
        *armed = Some(target.to_string());
        false
    }
}

pub struct App {
    session: ChatSession,
    catalog: ModelCatalog,
    pull: PullTracker,
    attachments: Vec<Attachment>,
    armed_conversation: Option<String>,
    armed_model: Option<String>,
}

impl App {
    pub fn new(session: ChatSession, catalog: ModelCatalog) -> Self {
        Self {
            session,
            catalog,
            pull: PullTracker::new(),
            attachments: Vec::new(),
            armed_conversation: None,
            armed_model: None,
        }
    }

    async fn init(&mut self) {
        if let Err(e) = self.session.load_conversations().await {
            tracing::error!("Failed to load conversations: {:#}", e);
        }
        self.refresh_models().await;
        println!(
            "{} conversations, model: {}. Type /help for commands.",
            self.session.registry().conversations().len(),
            display_model(self.session.model())
        );
    }

    async fn refresh_models(&mut self) {
        match self.catalog.models().await {
            Ok(models) => self.session.on_models_available(&models),
            Err(e) => {
                tracing::warn!("Could not list models: {}", e);
                println!("{}", e);
            }
        }
    }

    pub async fn update(&mut self, msg: AppMsg) {
        if !matches!(msg, AppMsg::DeleteConversation(_)) {
            self.armed_conversation = None;
        }
        if !matches!(msg, AppMsg::RemoveModel(_)) {
            self.armed_model = None;
        }

        match msg {
            AppMsg::Send(text) => {
                let submission = Submission {
                    text,
                    attachments: std::mem::take(&mut self.attachments),
                };
                if let Err(rejected) = self.session.submit(submission) {
                    println!("{}", rejected);
                }
            }
            AppMsg::Attach(path) => match read_attachment(&path).await {
                Ok(attachment) => {
                    println!(
                        "Attached {} ({})",
                        path.display(),
                        attachment.mime_type
                    );
                    self.attachments.push(attachment);
                }
                Err(e) => println!("{:#}", e),
            },
            AppMsg::Regenerate => {
                if !self.session.regenerate() {
                    println!("Nothing to regenerate.");
                }
            }
            AppMsg::Stop => {
                self.session.stop();
            }
            AppMsg::NewChat => {
                self.session.new_conversation();
                println!("New conversation.");
            }
            AppMsg::ListConversations => self.print_conversations(),
            AppMsg::OpenConversation(n) => {
                let id = self.conversation_id(n);
                match id {
                    Some(id) => {
                        self.session.switch_to(Some(&id));
                        self.print_history();
                    }
                    None => println!("No conversation {}.", n),
                }
            }
            AppMsg::DeleteConversation(n) => {
                let Some(id) = self.conversation_id(n) else {
                    println!("No conversation {}.", n);
                    return;
                };
                if confirm(&mut self.armed_conversation, &id) {
                    self.session.delete_conversation(&id);
                    println!("Deleted.");
                } else {
                    println!("Run /delete {} again to confirm.", n);
                }
            }
            AppMsg::SelectModel(name) => {
                self.session.set_model(name);
                println!("Model: {}", self.session.model());
            }
            AppMsg::ListModels => {
                self.refresh_models().await;
                if let Some(models) = self.catalog.cached() {
                    for m in models {
                        let marker = if m.name == self.session.model() { "*" } else { " " };
                        println!(
                            "{} {:<32} {:>8}  {}",
                            marker,
                            m.name,
                            format_bytes(m.size),
                            m.details.parameter_size
                        );
                    }
                }
            }
            AppMsg::PullModel(name) => self.pull_model(&name).await,
            AppMsg::RemoveModel(name) => {
                if !confirm(&mut self.armed_model, &name) {
                    println!("Run /rm {} again to confirm.", name);
                    return;
                }
                match self.catalog.delete(&name).await {
                    Ok(()) => println!("Removed {}.", name),
                    Err(e) => println!("{}", e),
                }
            }
            AppMsg::Help => println!("{}", HELP),
            AppMsg::Quit => {}
        }
    }

    async fn pull_model(&mut self, name: &str) {
        let token = self.pull.begin();
        let pull = &mut self.pull;
        let mut on_progress = |progress: PullProgress| {
            pull.progress(&progress);
            print_pull_phase(pull.phase());
        };

        let result = tokio::select! {
            result = self.catalog.pull(name, &mut on_progress, token) => Some(result),
            _ = tokio::signal::ctrl_c() => None,
        };

        match result {
            Some(result) => {
                self.pull.finish(result);
                print_pull_phase(self.pull.phase());
                self.pull.acknowledge();
            }
            None => {
                self.pull.close();
                self.catalog.invalidate();
                println!("\nPull cancelled.");
            }
        }
        self.refresh_models().await;
    }

    pub fn on_stream_event(&mut self, event: StreamResult) {
        let visible = match &event {
            StreamResult::Token {
                conversation_id, ..
            }
            | StreamResult::Thinking {
                conversation_id, ..
            }
            | StreamResult::Done {
                conversation_id, ..
            }
            | StreamResult::Aborted {
                conversation_id, ..
            }
            | StreamResult::Error {
                conversation_id, ..
            } => self.session.active_id() == Some(conversation_id.as_str()),
        };

        if visible {
            match &event {
                StreamResult::Token { delta, .. } | StreamResult::Thinking { delta, .. } => {
                    print!("{}", delta);
                    let _ = std::io::stdout().flush();
                }
                StreamResult::Done { .. } => println!(),
                StreamResult::Aborted { .. } => println!("\n[stopped]"),
                StreamResult::Error { .. } => {}
            }
        }

        self.session.handle_event(event);

        if visible {
            if let SessionStatus::Error(message) = self.session.status() {
                println!("\n[error] {}", message);
            }
        }
    }

    fn conversation_id(&self, n: usize) -> Option<String> {
        self.session
            .registry()
            .conversations()
            .get(n.checked_sub(1)?)
            .map(|c| c.id.clone())
    }

    fn print_conversations(&self) {
        let registry = self.session.registry();
        if registry.is_loading() {
            println!("Loading...");
            return;
        }
        let now = Utc::now();
        for (i, c) in registry.conversations().iter().enumerate() {
            let marker = if registry.active_id() == Some(c.id.as_str()) { "*" } else { " " };
            println!(
                "{}{:>3}. {:<44} {}",
                marker,
                i + 1,
                c.title,
                format_relative_date(c.updated_at, now)
            );
        }
    }

    fn print_history(&self) {
        let models = self.session.message_models();
        for message in self.session.messages() {
            match message.role {
                Role::User => println!("> {}", message.text()),
                Role::Assistant => {
                    if let Some(model) = models.get(&message.id) {
                        println!("[{}]", model);
                    }
                    println!("{}", message.text());
                }
                Role::System => {}
            }
        }
        println!("Model: {}", display_model(self.session.model()));
    }
}

fn display_model(model: &str) -> &str {
    if model.is_empty() {
        "(none)"
    } else {
        model
    }
}

fn print_pull_phase(phase: &PullPhase) {
    match phase {
        PullPhase::Idle => {}
        PullPhase::Pulling {
            status,
            percent: Some(pct),
        } => print!("\r{} {}%   ", status, pct),
        PullPhase::Pulling { status, .. } => print!("\r{}   ", status),
        PullPhase::Error(message) => print!("\n{}", message),
        PullPhase::Done => print!("\nModel pulled successfully."),
    }
    println!();
}

async fn read_attachment(path: &std::path::Path) -> Result<Attachment> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());
    let mime_type = mime_type_for(filename.as_deref().unwrap_or_default()).to_string();
    Ok(Attachment {
        mime_type,
        filename,
        data,
    })
}

pub async fn run() -> Result<()> {
    let db = Database::new().await?;
    let settings = SettingsService::load(&db).await;

    let base_url = config::ollama_base_url(&settings);
    let provider: Arc<dyn AiProvider> = Arc::new(
        OllamaProvider::new(&base_url)
            .with_context(|| format!("Invalid daemon URL: {}", base_url))?,
    );
    tracing::info!("Using daemon at {}", base_url);

    let repository = Arc::new(LocalConversationRepository::new(db));
    let registry = ConversationRegistry::new(repository);
    let session = ChatSession::new(provider.clone(), registry, &settings);
    let mut app = App::new(session, ModelCatalog::new(provider));
    app.init().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match AppMsg::parse(&line) {
                    Some(AppMsg::Quit) => break,
                    Some(msg) => app.update(msg).await,
                    None => {}
                }
            }
            Some(event) = app.session.next_event() => app.on_stream_event(event),
        }
    }

    app.session.stop();
    app.session.registry().flush().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_messages_and_commands() {
        assert_eq!(AppMsg::parse("  "), None);
        assert_eq!(
            AppMsg::parse("    indented code"),
            Some(AppMsg::Send("    indented code".to_string()))
        );
        assert_eq!(AppMsg::parse("/regen"), Some(AppMsg::Regenerate));
        assert_eq!(AppMsg::parse("/open 2"), Some(AppMsg::OpenConversation(2)));
        assert_eq!(AppMsg::parse("/open 0"), None);
        assert_eq!(AppMsg::parse("/open x"), None);
        assert_eq!(
            AppMsg::parse("/pull llama3:8b"),
            Some(AppMsg::PullModel("llama3:8b".to_string()))
        );
        assert_eq!(AppMsg::parse("/pull"), None);
        assert_eq!(
            AppMsg::parse("/attach ./my file.png"),
            Some(AppMsg::Attach(PathBuf::from("./my file.png")))
        );
        assert_eq!(AppMsg::parse("/send"), Some(AppMsg::Send(String::new())));
        assert_eq!(AppMsg::parse("/unknown"), None);
        assert_eq!(AppMsg::parse("/exit"), Some(AppMsg::Quit));
    }

    #[test]
    fn test_confirm_requires_repeat_on_same_target() {
        let mut armed = None;
        assert!(!confirm(&mut armed, "a"));
        assert!(!confirm(&mut armed, "b"));
        assert!(confirm(&mut armed, "b"));
        assert!(armed.is_none());
        assert!(!confirm(&mut armed, "b"));
    }

    #[tokio::test]
    async fn test_read_attachment_guesses_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.PNG");
        std::fs::write(&path, b"png").unwrap();

        let attachment = read_attachment(&path).await.unwrap();
        assert_eq!(attachment.mime_type, "image/png");
        assert_eq!(attachment.filename.as_deref(), Some("photo.PNG"));
        assert_eq!(attachment.data, b"png");

        assert!(read_attachment(&dir.path().join("missing")).await.is_err());
    }
}
