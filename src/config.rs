use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::services::settings::AppSettings;

pub const APP_NAME: &str = "local-ai";

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Overrides the daemon base URL from settings.
pub const OLLAMA_URL_ENV: &str = "LOCAL_AI_OLLAMA_URL";

/// Overrides the directory holding the database.
pub const DATA_DIR_ENV: &str = "LOCAL_AI_DATA_DIR";

/// Key under which every conversation is stored as one JSON array.
pub const CONVERSATIONS_KEY: &str = "local-ai:conversations";

pub const SETTINGS_KEY: &str = "app_settings";

/// How long a fetched model list is served from cache.
pub const MODELS_STALE_AFTER: Duration = Duration::from_secs(30);

pub const MODELS_RETRY_DELAY: Duration = Duration::from_secs(1);

pub fn ollama_base_url(settings: &AppSettings) -> String {
    std::env::var(OLLAMA_URL_ENV)
        .ok()
        .filter(|url| !url.trim().is_empty())
        .or_else(|| settings.ollama_url.clone())
        .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string())
}

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let base = match std::env::var("XDG_DATA_HOME") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            let home = std::env::var("HOME").map_err(|_| anyhow!("HOME not set"))?;
            PathBuf::from(home).join(".local/share")
        }
    };
    Ok(base.join(APP_NAME))
}
