//! LLM Module - completion service used by the decision stages
//!
//! Every stage that asks the model for a decision goes through
//! [`LLMManager`], which owns the provider, enforces the request timeout and
//! turns replies into typed structs. Callers treat any error as a signal to
//! take their rule-based fallback.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub mod simple_external;
pub mod structured;

pub use simple_external::SimpleExternalProvider;

/// LLM operation mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LLMMode {
    /// External API provider
    External {
        provider: ApiProvider,
        api_key: String,
        model: String,
    },
    /// No completion service; every stage runs its rule-based path
    Disabled,
}

/// External API providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApiProvider {
    OpenAI,
    Anthropic,
    OpenRouter,
    Ollama,
    Custom { endpoint: String },
}

/// LLM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    pub mode: LLMMode,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    /// Upper bound for a single completion round-trip.
    pub request_timeout_secs: u64,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            mode: LLMMode::Disabled,
            max_tokens: 512,
            temperature: 0.1,
            top_p: 0.95,
            request_timeout_secs: 15,
        }
    }
}

/// Generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
}

impl From<&LLMConfig> for GenerationConfig {
    fn from(config: &LLMConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub model: String,
}

/// Core trait for LLM providers
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Generate a completion
    async fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String>;

    /// Get provider info
    fn info(&self) -> ProviderInfo;
}

/// Main LLM manager
pub struct LLMManager {
    config: LLMConfig,
    provider: Option<Arc<dyn LLMProvider>>,
}

impl LLMManager {
    /// Create new LLM manager; call [`initialize`](Self::initialize) before use.
    pub fn new(config: LLMConfig) -> Self {
        Self {
            config,
            provider: None,
        }
    }

    /// Manager around an already constructed provider.
    pub fn with_provider(config: LLMConfig, provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            config,
            provider: Some(provider),
        }
    }

    /// Manager with no provider; every structured call fails fast.
    pub fn disabled() -> Self {
        Self::new(LLMConfig::default())
    }

    /// Build the provider described by the configured mode.
    pub fn initialize(&mut self) -> Result<()> {
        match &self.config.mode {
            LLMMode::External {
                provider,
                api_key,
                model,
            } => {
                let provider =
                    SimpleExternalProvider::new(provider.clone(), api_key.clone(), model.clone())?;
                tracing::info!(provider = %provider.info().name, model = %model, "LLM provider initialized");
                self.provider = Some(Arc::new(provider));
                Ok(())
            }
            LLMMode::Disabled => {
                tracing::info!("LLM disabled, decision stages run rule-based");
                self.provider = None;
                Ok(())
            }
        }
    }

    /// Whether a provider is configured. A disabled manager is a deployment
    /// choice, distinct from a provider that fails at request time.
    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    pub fn info(&self) -> Option<ProviderInfo> {
        self.provider.as_ref().map(|p| p.info())
    }

    /// Generate completion with custom max_tokens, bounded by the request timeout.
    pub async fn generate_custom(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| anyhow!("LLM is disabled or not initialized"))?;

        let mut config = GenerationConfig::from(&self.config);
        config.max_tokens = max_tokens;

        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        match tokio::time::timeout(timeout, provider.generate(prompt, &config)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "LLM request timed out after {}s",
                self.config.request_timeout_secs
            )),
        }
    }

    /// `LLMComplete(prompt, schemaHint)`: ask for a JSON object shaped like
    /// `schema_hint` and deserialize it into `T`. Malformed output is an error
    /// like any other, so callers have a single fallback path.
    pub async fn complete_structured<T: DeserializeOwned>(
        &self,
        prompt: &str,
        schema_hint: &str,
        max_tokens: usize,
    ) -> Result<T> {
        let full_prompt = format!(
            "{}\n\nRespond ONLY with a JSON object of this shape, nothing else:\n{}\nJSON:",
            prompt.trim_end(),
            schema_hint
        );
        let raw = self.generate_custom(&full_prompt, max_tokens).await?;
        structured::parse_json_object::<T>(&raw).with_context(|| {
            format!(
                "malformed completion: {}",
                raw.chars().take(200).collect::<String>()
            )
        })
    }
}

/// Quick token estimate (chars / 4).
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingProvider, ScriptedProvider};

    #[derive(Debug, Deserialize)]
    struct Probe {
        answer: String,
    }

    #[tokio::test]
    async fn test_disabled_manager_errors() {
        let manager = LLMManager::disabled();
        assert!(!manager.is_enabled());
        assert!(manager.generate_custom("hola", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_complete_structured_parses_fenced_json() {
        let provider = ScriptedProvider::new().on("probe", "```json\n{\"answer\": \"sí\"}\n```");
        let manager = LLMManager::with_provider(LLMConfig::default(), Arc::new(provider));
        let probe: Probe = manager
            .complete_structured("### task: probe", "{\"answer\": \"...\"}", 50)
            .await
            .unwrap();
        assert_eq!(probe.answer, "sí");
    }

    #[tokio::test]
    async fn test_complete_structured_rejects_wrong_shape() {
        let provider = ScriptedProvider::new().on("probe", "{\"other\": 1}");
        let manager = LLMManager::with_provider(LLMConfig::default(), Arc::new(provider));
        let result: Result<Probe> = manager.complete_structured("### task: probe", "{}", 50).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_provider_errors_propagate() {
        let manager = LLMManager::with_provider(LLMConfig::default(), Arc::new(FailingProvider));
        assert!(manager.generate_custom("x", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_generation_times_out() {
        let provider = ScriptedProvider::new()
            .on("slow", "{}")
            .with_delay(Duration::from_millis(1500));
        let config = LLMConfig {
            request_timeout_secs: 1,
            ..LLMConfig::default()
        };
        let manager = LLMManager::with_provider(config, Arc::new(provider));
        let err = manager.generate_custom("slow", 10).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
