//! External completion API provider (OpenAI-compatible and Anthropic)

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{ApiProvider, GenerationConfig, LLMProvider, ProviderInfo};

/// External API provider
pub struct SimpleExternalProvider {
    provider: ApiProvider,
    api_key: String,
    model: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

impl SimpleExternalProvider {
    /// Parse a response body as JSON, returning a clear error if the server returned HTML
    /// (e.g. a gateway error page) instead of valid JSON.
    async fn parse_json_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        endpoint: &str,
    ) -> Result<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read response body from {}: {}", endpoint, e))?;

        let trimmed = body.trim_start();
        if trimmed.starts_with('<') {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(anyhow!(
                "Endpoint {} returned HTML instead of JSON (HTTP {}): {}",
                endpoint,
                status,
                preview
            ));
        }

        serde_json::from_str::<T>(&body).map_err(|e| {
            let preview: String = body.chars().take(300).collect();
            anyhow!(
                "Failed to parse JSON from {} (HTTP {}): {}. Response body: {}",
                endpoint,
                status,
                e,
                preview
            )
        })
    }

    pub fn new(provider: ApiProvider, api_key: String, model: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(60))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        tracing::debug!(provider = ?provider, model = %model, "Creating SimpleExternalProvider");

        Ok(Self {
            provider,
            api_key,
            model,
            client,
        })
    }

    fn get_endpoint(&self) -> String {
        match &self.provider {
            ApiProvider::OpenAI => "https://api.openai.com/v1/chat/completions".to_string(),
            ApiProvider::Anthropic => "https://api.anthropic.com/v1/messages".to_string(),
            ApiProvider::OpenRouter => "https://openrouter.ai/api/v1/chat/completions".to_string(),
            ApiProvider::Ollama => "http://localhost:11434/v1/chat/completions".to_string(),
            ApiProvider::Custom { endpoint } => endpoint.clone(),
        }
    }

    async fn openai_compatible_generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String> {
        let endpoint = self.get_endpoint();
        tracing::debug!(
            endpoint = %endpoint,
            model = %self.model,
            max_tokens = config.max_tokens,
            prompt_len = prompt.len(),
            "Sending OpenAI-compatible request"
        );

        let request = json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "top_p": config.top_p,
            "stream": false
        });

        let response = self
            .client
            .post(&endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("Request to {} timed out", endpoint)
                } else if e.is_connect() {
                    anyhow!("Failed to connect to {}: {}", endpoint, e)
                } else {
                    anyhow!("Request to {} failed: {}", endpoint, e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error = response.text().await?;
            return Err(anyhow!("API error ({}): {}", status, error));
        }

        let result: OpenAIResponse = Self::parse_json_response(response, &endpoint).await?;
        let choice = result
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No choices returned from API"))?;

        tracing::debug!(chars = choice.message.content.len(), "API response received");
        Ok(choice.message.content)
    }

    async fn anthropic_generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String> {
        let endpoint = self.get_endpoint();
        let request = json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "top_p": config.top_p
        });

        let response = self
            .client
            .post(&endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error = response.text().await?;
            return Err(anyhow!("Anthropic API error ({}): {}", status, error));
        }

        let result: AnthropicResponse = Self::parse_json_response(response, &endpoint).await?;
        result
            .content
            .into_iter()
            .next()
            .map(|c| c.text)
            .ok_or_else(|| anyhow!("No content returned from Anthropic API"))
    }
}

#[async_trait]
impl LLMProvider for SimpleExternalProvider {
    async fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String> {
        match &self.provider {
            ApiProvider::Anthropic => self.anthropic_generate(prompt, config).await,
            ApiProvider::OpenAI
            | ApiProvider::OpenRouter
            | ApiProvider::Ollama
            | ApiProvider::Custom { .. } => self.openai_compatible_generate(prompt, config).await,
        }
    }

    fn info(&self) -> ProviderInfo {
        let name = match &self.provider {
            ApiProvider::OpenAI => "OpenAI",
            ApiProvider::Anthropic => "Anthropic",
            ApiProvider::OpenRouter => "OpenRouter",
            ApiProvider::Ollama => "Ollama",
            ApiProvider::Custom { .. } => "Custom",
        };
        ProviderInfo {
            name: name.to_string(),
            model: self.model.clone(),
        }
    }
}
