use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::llm::{LLMConfig, LLMMode};
use crate::types::Channel;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub llm: LLMConfig,
    pub search: SearchSettings,
    pub validation: ValidationSettings,
    pub escalation: EscalationSettings,
    pub display: DisplaySettings,
    pub services: ServiceEndpoints,
    /// JSON synonym table; the built-in table is used when absent.
    pub synonyms_path: Option<PathBuf>,
    pub catalog_cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub max_attempts: usize,
    /// Below this many primary results the alternates are searched too.
    pub target_results: usize,
    pub max_alternates_per_attempt: usize,
    pub results_per_query: usize,
    pub search_timeout_ms: u64,
    pub catalog_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    pub too_general_min_results: usize,
    /// Max score spread across the top results for a set to count as flat.
    pub uniform_score_spread: f32,
    pub max_best_results: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationSettings {
    /// Failed episodes per session before handing off.
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    pub web: usize,
    pub whatsapp: usize,
    pub telegram: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceEndpoints {
    pub search_url: Option<String>,
    pub catalog_url: Option<String>,
    pub escalation_webhook: Option<String>,
}

impl SearchSettings {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_millis(self.catalog_timeout_ms)
    }
}

impl DisplaySettings {
    pub fn limit_for(&self, channel: Channel) -> usize {
        match channel {
            Channel::Web => self.web,
            Channel::WhatsApp => self.whatsapp,
            Channel::Telegram => self.telegram,
        }
    }
}

impl AssistantConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.search.max_attempts == 0 {
            return Err("search.max_attempts must be > 0".into());
        }
        if self.search.results_per_query == 0 {
            return Err("search.results_per_query must be > 0".into());
        }
        if self.search.search_timeout_ms == 0 || self.search.catalog_timeout_ms == 0 {
            return Err("search timeouts must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.validation.uniform_score_spread) {
            return Err("validation.uniform_score_spread must be in [0.0, 1.0]".into());
        }
        if self.validation.max_best_results == 0 {
            return Err("validation.max_best_results must be > 0".into());
        }
        if self.escalation.failure_threshold == 0 {
            return Err("escalation.failure_threshold must be > 0".into());
        }
        if self.display.web == 0 || self.display.whatsapp == 0 || self.display.telegram == 0 {
            return Err("display limits must be > 0".into());
        }
        if self.llm.request_timeout_secs == 0 {
            return Err("llm.request_timeout_secs must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Conventional location: `<config dir>/voltio-search/config.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voltio-search")
            .join("config.json")
    }

    /// Secrets and endpoints from the environment win over the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("VOLTIO_LLM_API_KEY") {
            if let LLMMode::External { api_key, .. } = &mut self.llm.mode {
                *api_key = key;
            }
        }
        if let Some(url) = non_empty("VOLTIO_SEARCH_URL") {
            self.services.search_url = Some(url);
        }
        if let Some(url) = non_empty("VOLTIO_CATALOG_URL") {
            self.services.catalog_url = Some(url);
        }
        if let Some(url) = non_empty("VOLTIO_ESCALATION_WEBHOOK") {
            self.services.escalation_webhook = Some(url);
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            llm: LLMConfig::default(),
            search: SearchSettings::default(),
            validation: ValidationSettings::default(),
            escalation: EscalationSettings::default(),
            display: DisplaySettings::default(),
            services: ServiceEndpoints::default(),
            synonyms_path: None,
            catalog_cache_size: 512,
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            target_results: 5,
            max_alternates_per_attempt: 2,
            results_per_query: 20,
            search_timeout_ms: 8000,
            catalog_timeout_ms: 5000,
        }
    }
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            too_general_min_results: 20,
            uniform_score_spread: 0.05,
            max_best_results: 10,
        }
    }
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
        }
    }
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            web: 6,
            whatsapp: 3,
            telegram: 5,
        }
    }
}
