use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use parley_types::{ModelInfo, ProviderInfo};

mod gemini;
mod retry;

pub use gemini::{is_valid_model_id, GeminiProvider, DEFAULT_GEMINI_MODEL, DEFAULT_GEMINI_URL};
pub use retry::{
    is_auth_status, is_retryable_status, matches_transient_pattern, parse_retry_after,
    should_retry, RetryPolicy, MAX_RETRIES,
};

pub const GEMINI_PROVIDER_ID: &str = "gemini";
pub const LOCAL_PROVIDER_ID: &str = "local";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Transport(String),
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("provider rate limited the request: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },
    #[error("provider rejected the credentials ({status}): {message}")]
    Auth { status: u16, message: String },
    #[error("response blocked by the provider: {0}")]
    Blocked(String),
    #[error("provider returned no text (finish reason: {0})")]
    EmptyResponse(String),
    #[error("provider returned an unreadable response: {0}")]
    InvalidResponse(String),
    #[error("invalid model id `{0}`")]
    InvalidModel(String),
    #[error("{0}")]
    NotConfigured(String),
}

impl ProviderError {
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Transport(_) => "PROVIDER_TRANSPORT",
            ProviderError::Api { .. } => "PROVIDER_API_ERROR",
            ProviderError::RateLimited { .. } => "PROVIDER_RATE_LIMITED",
            ProviderError::Auth { .. } => "PROVIDER_AUTH",
            ProviderError::Blocked(_) => "PROVIDER_BLOCKED",
            ProviderError::EmptyResponse(_) => "PROVIDER_EMPTY_RESPONSE",
            ProviderError::InvalidResponse(_) => "PROVIDER_INVALID_RESPONSE",
            ProviderError::InvalidModel(_) => "INVALID_MODEL",
            ProviderError::NotConfigured(_) => "PROVIDER_NOT_CONFIGURED",
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;
    async fn complete(
        &self,
        prompt: &str,
        model_override: Option<&str>,
    ) -> Result<String, ProviderError>;
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new(config: AppConfig) -> Self {
        let providers = build_providers(&config);
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(config.default_provider)),
        }
    }

    pub async fn reload(&self, config: AppConfig) {
        let rebuilt = build_providers(&config);
        *self.providers.write().await = rebuilt;
        *self.default_provider.write().await = config.default_provider;
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| p.info())
            .collect()
    }

    /// True when the only thing answering prompts is the offline echo.
    pub async fn is_offline(&self) -> bool {
        self.providers
            .read()
            .await
            .iter()
            .all(|p| p.info().id == LOCAL_PROVIDER_ID)
    }

    pub async fn default_complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let provider = self.select_provider(None).await?;
        provider.complete(prompt, None).await
    }

    pub async fn complete_for_provider(
        &self,
        provider_id: Option<&str>,
        prompt: &str,
        model_id: Option<&str>,
    ) -> Result<String, ProviderError> {
        let provider = self.select_provider(provider_id).await?;
        provider.complete(prompt, model_id).await
    }

    pub async fn select_provider(
        &self,
        provider_id: Option<&str>,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            return Err(ProviderError::NotConfigured(format!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            )));
        };

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
        };

        let Some(provider) = providers.first() else {
            return Err(ProviderError::NotConfigured(
                "No provider configured.".to_string(),
            ));
        };
        Ok(provider.clone())
    }
}

fn build_providers(config: &AppConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    if let Some(entry) = config.providers.get(GEMINI_PROVIDER_ID) {
        let api_key = entry
            .api_key
            .as_deref()
            .filter(|key| !is_placeholder_api_key(key));
        if let Some(api_key) = api_key {
            providers.push(Arc::new(GeminiProvider::new(
                api_key,
                entry.url.as_deref(),
                entry.default_model.as_deref(),
                config.retry.clone(),
            )));
        }
    }

    if providers.is_empty() {
        tracing::warn!(
            "no Gemini API key configured (set GEMINI_API_KEY); replies come from the local echo provider"
        );
        providers.push(Arc::new(LocalEchoProvider));
    }

    providers
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
        || trimmed.eq_ignore_ascii_case("your_api_key_here")
}

/// Answers without a network so the UI stays usable when no key is set.
struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: LOCAL_PROVIDER_ID.to_string(),
            name: "Local Echo".to_string(),
            models: vec![ModelInfo {
                id: "echo-1".to_string(),
                provider_id: LOCAL_PROVIDER_ID.to_string(),
                display_name: "Echo Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn complete(
        &self,
        prompt: &str,
        _model_override: Option<&str>,
    ) -> Result<String, ProviderError> {
        let last_user_line = prompt
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix("User: "))
            .unwrap_or(prompt)
            .trim();
        Ok(format!("Echo: {last_user_line}"))
    }
}

pub(crate) fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}
