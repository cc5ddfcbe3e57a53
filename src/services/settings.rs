use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::chat::ErrorPolicy;
use super::database::Database;
use crate::config::SETTINGS_KEY;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub ollama_url: Option<String>,
    #[serde(default = "default_think")]
    pub think: bool,
    /// Show raw daemon errors in the chat instead of a generic message.
    #[serde(default)]
    pub verbose_errors: bool,
}

fn default_think() -> bool {
    true
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            ollama_url: None,
            think: true,
            verbose_errors: false,
        }
    }
}

impl AppSettings {
    pub fn error_policy(&self) -> ErrorPolicy {
        if self.verbose_errors {
            ErrorPolicy::Verbose
        } else {
            ErrorPolicy::Generic
        }
    }
}

pub struct SettingsService;

impl SettingsService {
    pub async fn load(db: &Database) -> AppSettings {
        match db.get(SETTINGS_KEY).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable settings: {}", e);
                AppSettings::default()
            }),
            _ => AppSettings::default(),
        }
    }

    pub async fn save(db: &Database, settings: &AppSettings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        db.set(SETTINGS_KEY, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults_when_missing_or_corrupt() {
        let db = Database::new_in_memory().unwrap();
        assert_eq!(SettingsService::load(&db).await, AppSettings::default());

        db.set(SETTINGS_KEY, "{not json").await.unwrap();
        assert_eq!(SettingsService::load(&db).await, AppSettings::default());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let db = Database::new_in_memory().unwrap();
        let settings = AppSettings {
            ollama_url: Some("http://10.0.0.5:11434".to_string()),
            think: false,
            verbose_errors: true,
        };
        SettingsService::save(&db, &settings).await.unwrap();

        let loaded = SettingsService::load(&db).await;
        assert_eq!(loaded, settings);
        assert_eq!(loaded.error_policy(), ErrorPolicy::Verbose);
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: AppSettings = serde_json::from_str("{\"verbose_errors\":true}").unwrap();
        assert!(settings.think);
        assert!(settings.verbose_errors);
        assert!(settings.ollama_url.is_none());
    }
}
