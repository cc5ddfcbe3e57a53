use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{MODELS_RETRY_DELAY, MODELS_STALE_AFTER};
use crate::models::{ModelInfo, PullProgress};
use crate::providers::{AiProvider, ProviderError};

/// Cached view of the models installed in the daemon.
pub struct ModelCatalog {
    provider: Arc<dyn AiProvider>,
    stale_after: Duration,
    retry_delay: Duration,
    cached: Option<(Instant, Vec<ModelInfo>)>,
}

impl ModelCatalog {
    pub fn new(provider: Arc<dyn AiProvider>) -> Self {
        Self::with_timing(provider, MODELS_STALE_AFTER, MODELS_RETRY_DELAY)
    }

    pub fn with_timing(
        provider: Arc<dyn AiProvider>,
        stale_after: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            provider,
            stale_after,
            retry_delay,
            cached: None,
        }
    }

    /// Installed models, served from cache while fresh. A failed fetch is retried once.
    pub async fn models(&mut self) -> Result<Vec<ModelInfo>, ProviderError> {
        if let Some((fetched_at, models)) = &self.cached {
            if fetched_at.elapsed() < self.stale_after {
                return Ok(models.clone());
            }
        }

        let models = match self.provider.list_models().await {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!("Model list fetch failed, retrying once: {}", e);
                tokio::time::sleep(self.retry_delay).await;
                self.provider.list_models().await?
            }
        };

        self.cached = Some((Instant::now(), models.clone()));
        Ok(models)
    }

    pub fn cached(&self) -> Option<&[ModelInfo]> {
        self.cached.as_ref().map(|(_, models)| models.as_slice())
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Download a model. Blank names are ignored.
    pub async fn pull(
        &mut self,
        name: &str,
        on_progress: &mut (dyn FnMut(PullProgress) + Send),
        cancel: CancellationToken,
    ) -> Result<(), ProviderError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(());
        }
        let result = self.provider.pull_model(name, on_progress, cancel).await;
        self.invalidate();
        result
    }

    pub async fn delete(&mut self, name: &str) -> Result<(), ProviderError> {
        let result = self.provider.delete_model(name).await;
        self.invalidate();
        result
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullPhase {
    Idle,
    Pulling { status: String, percent: Option<u8> },
    Error(String),
    Done,
}

/// State of the model-download surface, including the token of the pull it owns.
#[derive(Debug)]
pub struct PullTracker {
    phase: PullPhase,
    cancel: Option<CancellationToken>,
}

impl Default for PullTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PullTracker {
    pub fn new() -> Self {
        Self {
            phase: PullPhase::Idle,
            cancel: None,
        }
    }

    pub fn phase(&self) -> &PullPhase {
        &self.phase
    }

    pub fn is_pulling(&self) -> bool {
        matches!(self.phase, PullPhase::Pulling { .. })
    }

    /// Start a new pull and hand back the token that aborts it.
    pub fn begin(&mut self) -> CancellationToken {
        if let Some(previous) = self.cancel.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        self.phase = PullPhase::Pulling {
            status: "Starting...".to_string(),
            percent: None,
        };
        token
    }

    pub fn progress(&mut self, progress: &PullProgress) {
        if self.is_pulling() {
            self.phase = PullPhase::Pulling {
                status: progress.status.clone(),
                percent: progress.percent(),
            };
        }
    }

    pub fn finish(&mut self, result: Result<(), ProviderError>) {
        self.cancel = None;
        self.phase = match result {
            Ok(()) => PullPhase::Done,
            Err(e) if e.is_abort() => PullPhase::Idle,
            Err(e) => PullPhase::Error(e.to_string()),
        };
    }

    /// Abort the outstanding pull, if any. The phase settles through `finish`.
    pub fn cancel(&mut self) {
        if let Some(token) = &self.cancel {
            token.cancel();
        }
    }

    /// Closing the surface aborts its pull and forgets any result.
    pub fn close(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.phase = PullPhase::Idle;
    }

    /// Clear a shown success message.
    pub fn acknowledge(&mut self) {
        if self.phase == PullPhase::Done {
            self.phase = PullPhase::Idle;
        }
    }
}

/// Human-readable model size.
pub fn format_bytes(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = MIB * 1024.0;
    let bytes = bytes as f64;
    if bytes < GIB {
        format!("{:.0} MB", bytes / MIB)
    } else {
        format!("{:.1} GB", bytes / GIB)
    }
}
