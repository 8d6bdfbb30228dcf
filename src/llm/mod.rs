//! LLM integration.
//!
//! A single OpenAI-compatible backend is provided; anything else plugs in
//! through the `LlmProvider` trait.

pub mod openai;
pub mod provider;

pub use openai::OpenAiProvider;
pub use provider::*;

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    pub timeout: Duration,
}

impl LlmConfig {
    /// Build from `LLM_BASE_URL`, `LLM_API_KEY` (required) and `LLM_MODEL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("LLM_API_KEY".into()))?;
        Ok(Self {
            base_url: std::env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: SecretString::from(api_key),
            model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            timeout: Duration::from_secs(
                std::env::var("LLM_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Arc<dyn LlmProvider> {
    tracing::info!(
        model = %config.model,
        base_url = %config.base_url,
        "Using OpenAI-compatible LLM"
    );
    Arc::new(OpenAiProvider::new(
        &config.base_url,
        config.api_key.clone(),
        &config.model,
        config.timeout,
    ))
}

/// Extract a JSON object from model output that may be wrapped in prose or
/// a markdown code fence.
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_from_fence_and_prose() {
        assert_eq!(extract_json_object(r#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(
            extract_json_object("```json\n{\"start\": true}\n```"),
            r#"{"start": true}"#
        );
        assert_eq!(
            extract_json_object("Sure! here you go {\"x\": 2} hope it helps"),
            r#"{"x": 2}"#
        );
        assert_eq!(extract_json_object("no json here"), "no json here");
    }

    #[test]
    fn create_provider_reports_model() {
        let config = LlmConfig {
            base_url: "http://localhost:11434/v1".into(),
            api_key: SecretString::from("sk-test"),
            model: "llama3".into(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(create_provider(&config).model_name(), "llama3");
    }
}
