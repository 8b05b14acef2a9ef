//! Model identifier → backend routing table

use super::LlmConfig;
use serde::Serialize;
use std::collections::BTreeMap;

/// Where a model lives and what it can do
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEntry {
    pub backend: String,
    /// Whether the backend streams intermediate reasoning for this model
    pub supports_reasoning: bool,
}

/// Model info reported to peers
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub backend: String,
    pub supports_reasoning: bool,
    /// Whether the model's backend is currently configured
    pub available: bool,
}

/// Static list of OpenAI models to offer: (id, reasoning)
const OPENAI_MODELS: &[(&str, bool)] = &[
    ("gpt-5-mini", false),
    ("gpt-5", false),
    ("gpt-4.1", false),
    ("gpt-4o", false),
    ("gpt-4o-mini", false),
];

/// Ollama models known to expose a thinking channel
const OLLAMA_REASONING_MODELS: &[&str] = &["deepseek-r1", "qwen3", "magistral"];

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: BTreeMap<String, ModelEntry>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the OpenAI catalogue and the configured Ollama models
    pub fn with_defaults(config: &LlmConfig) -> Self {
        let mut registry = Self::new();
        for (id, reasoning) in OPENAI_MODELS {
            registry.register(*id, "openai", *reasoning);
        }
        if !registry.entries.contains_key(&config.openai_model) {
            registry.register(config.openai_model.clone(), "openai", false);
        }

        registry.register(
            config.ollama_model.clone(),
            "ollama",
            Self::is_reasoning_model(&config.ollama_model),
        );
        for id in OLLAMA_REASONING_MODELS {
            registry.register(*id, "ollama", true);
        }
        registry
    }

    /// Check if an Ollama model name indicates a thinking model
    fn is_reasoning_model(model: &str) -> bool {
        let model_lower = model.to_lowercase();
        OLLAMA_REASONING_MODELS
            .iter()
            .any(|known| model_lower.starts_with(known))
    }

    pub fn register(&mut self, id: impl Into<String>, backend: impl Into<String>, reasoning: bool) {
        self.entries.insert(
            id.into(),
            ModelEntry {
                backend: backend.into(),
                supports_reasoning: reasoning,
            },
        );
    }

    pub fn lookup(&self, id: &str) -> Option<&ModelEntry> {
        self.entries.get(id)
    }

    /// Reasoning support for a model on a given backend, falling back to name heuristics
    pub fn supports_reasoning(&self, backend: &str, model: &str) -> bool {
        match self.entries.get(model) {
            Some(entry) if entry.backend == backend => entry.supports_reasoning,
            _ => backend == "ollama" && Self::is_reasoning_model(model),
        }
    }

    pub fn list(&self, is_available: impl Fn(&str) -> bool) -> Vec<ModelInfo> {
        self.entries
            .iter()
            .map(|(id, entry)| ModelInfo {
                id: id.clone(),
                backend: entry.backend.clone(),
                supports_reasoning: entry.supports_reasoning,
                available: is_available(&entry.backend),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_routes_models() {
        let registry = ModelRegistry::with_defaults(&LlmConfig::default());

        assert_eq!(registry.lookup("gpt-4o").unwrap().backend, "openai");
        assert_eq!(registry.lookup("llama3.2").unwrap().backend, "ollama");
        assert!(registry.lookup("deepseek-r1").unwrap().supports_reasoning);
        assert!(registry.lookup("unknown-model").is_none());
    }

    #[test]
    fn test_reasoning_heuristics() {
        let registry = ModelRegistry::new();
        assert!(registry.supports_reasoning("ollama", "deepseek-r1:14b"));
        assert!(registry.supports_reasoning("ollama", "Qwen3:8b"));
        assert!(!registry.supports_reasoning("ollama", "llama3.2"));
        assert!(!registry.supports_reasoning("openai", "deepseek-r1"));
    }

    #[test]
    fn test_list_marks_availability() {
        let mut registry = ModelRegistry::new();
        registry.register("m1", "ghost", false);
        registry.register("m2", "openai", false);

        let models = registry.list(|backend| backend == "openai");
        assert_eq!(models.len(), 2);
        assert!(!models[0].available);
        assert!(models[1].available);
    }
}
