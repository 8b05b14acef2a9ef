mod ollama;
mod openai;
mod registry;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::types::ChatTurn;

pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use registry::{ModelEntry, ModelInfo, ModelRegistry};

/// Result type for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// Errors that can occur during LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Provider '{0}' is not configured")]
    NotConfigured(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Response parsing failed: {0}")]
    ParseError(String),

    #[error("Stream ended before a terminal event")]
    Truncated,
}

/// Normalized completion request handed to a provider
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    /// Prior turns, ending with the turn to answer
    pub messages: Vec<ChatTurn>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    /// Maximum response length in tokens (provider-dependent)
    pub max_output_length: Option<u32>,
    /// Ask the backend to expose intermediate reasoning, if it can
    pub reasoning: bool,
}

/// One item produced by a streaming provider
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A fragment of the answer
    Content(String),
    /// A fragment of intermediate reasoning ("thinking")
    Reasoning(String),
    /// Terminal success
    Finished { finish_reason: String },
}

pub type CompletionStream = BoxStream<'static, LlmResult<StreamEvent>>;

/// Trait that all streaming LLM backends must implement.
///
/// Implementations must stop yielding items once `cancel` is set.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Backend name used for routing (e.g. "openai", "ollama")
    fn name(&self) -> &str;

    /// Whether the backend has the credentials/endpoint it needs
    fn is_configured(&self) -> bool;

    /// Model used when a request names a backend but no model
    fn default_model(&self) -> &str;

    async fn stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> LlmResult<CompletionStream>;
}

/// Provider status reported to peers
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub name: String,
    pub configured: bool,
    pub default_model: String,
}

/// Backends by name, plus the model registry used to route requests
pub struct LlmManager {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    pub models: ModelRegistry,
}

impl LlmManager {
    /// Create a new LLM manager with the given providers
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>, models: ModelRegistry) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        Self { providers, models }
    }

    /// Look up a backend and make sure it can take work
    pub fn configured(&self, name: &str) -> LlmResult<Arc<dyn LlmProvider>> {
        match self.providers.get(name) {
            Some(provider) if provider.is_configured() => Ok(provider.clone()),
            _ => Err(LlmError::NotConfigured(name.to_string())),
        }
    }

    /// Names of all backends that are currently usable, sorted
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .values()
            .filter(|p| p.is_configured())
            .map(|p| p.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn provider_info(&self) -> Vec<ProviderInfo> {
        let mut info: Vec<ProviderInfo> = self
            .providers
            .values()
            .map(|p| ProviderInfo {
                name: p.name().to_string(),
                configured: p.is_configured(),
                default_model: p.default_model().to_string(),
            })
            .collect();
        info.sort_by(|a, b| a.name.cmp(&b.name));
        info
    }

    pub fn model_info(&self) -> Vec<ModelInfo> {
        self.models.list(|backend| {
            self.providers
                .get(backend)
                .is_some_and(|p| p.is_configured())
        })
    }
}

/// Configuration for LLM providers
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI API key
    pub openai_api_key: Option<String>,
    /// OpenAI default model
    pub openai_model: String,
    /// Ollama base URL
    pub ollama_base_url: Option<String>,
    /// Ollama default model
    pub ollama_model: String,
    /// Default max tokens for responses when the request has no cap
    pub default_max_tokens: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            ollama_base_url: Some("http://localhost:11434".to_string()),
            ollama_model: "llama3.2".to_string(),
            default_max_tokens: None,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

impl LlmConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let ollama_base_url = match std::env::var("OLLAMA_BASE_URL") {
            Ok(url) => {
                let trimmed = url.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(_) => Some("http://localhost:11434".to_string()),
        };

        Self {
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            openai_model: non_empty_env("OPENAI_MODEL")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            ollama_base_url,
            ollama_model: non_empty_env("OLLAMA_MODEL").unwrap_or_else(|| "llama3.2".to_string()),
            default_max_tokens: std::env::var("LLM_MAX_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }

    /// Build an LlmManager with every known backend.
    ///
    /// Backends without credentials are still registered so they can be
    /// reported as unconfigured.
    pub fn build_manager(&self) -> LlmResult<LlmManager> {
        let providers: Vec<Arc<dyn LlmProvider>> = vec![
            Arc::new(OpenAiProvider::new(
                self.openai_api_key.clone(),
                self.openai_model.clone(),
                self.default_max_tokens,
            )),
            Arc::new(OllamaProvider::new(
                self.ollama_base_url.clone(),
                self.ollama_model.clone(),
                self.default_max_tokens,
            )?),
        ];

        let manager = LlmManager::new(providers, ModelRegistry::with_defaults(self));
        if manager.available().is_empty() {
            tracing::warn!(
                "No LLM providers configured. Set OPENAI_API_KEY or OLLAMA_BASE_URL to enable completions"
            );
        }
        Ok(manager)
    }
}
