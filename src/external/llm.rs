use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[cfg(test)]
use mockall::automock;

use crate::external::error::ExternalError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    pub model: String,
    pub host: String,
    pub port: u16,
    pub temperature: f32,
    pub top_p: f32,
    /// Upper bound on a single model call
    pub timeout_secs: u64,
}

impl LLMConfig {
    /// Get the full URL for the Ollama service
    pub fn get_url(&self) -> Result<String, ExternalError> {
        let url = if self.host.starts_with("http://") || self.host.starts_with("https://") {
            format!("{}:{}", self.host.trim_end_matches('/'), self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        };

        // Validate the URL
        Url::parse(&url).map_err(|e| ExternalError::ConfigError(format!("Invalid URL: {}", e)))?;

        Ok(url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            model: "mistral".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            temperature: 0.2,
            top_p: 0.9,
            timeout_secs: 60,
        }
    }
}

/// A single prompt plus the output contract the reply must satisfy
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: String,
    pub prompt: String,
    /// JSON schema describing the expected reply
    pub schema: Value,
}

/// Text-in, text-out language model service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<String, ExternalError>;
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

/// Ollama chat endpoint with structured (schema-constrained) output
pub struct OllamaClient {
    endpoint: String,
    config: LLMConfig,
    client: Client,
}

impl OllamaClient {
    pub fn new(config: LLMConfig) -> Result<Self, ExternalError> {
        let endpoint = config.get_url()?;
        Ok(Self {
            endpoint,
            config,
            client: Client::new(),
        })
    }

    fn chat_body(&self, request: &ModelRequest) -> Value {
        serde_json::json!({
            "model": &self.config.model,
            "messages": [
                {
                    "role": "system",
                    "content": &request.system
                },
                {
                    "role": "user",
                    "content": &request.prompt
                }
            ],
            "stream": false,
            "format": &request.schema,
            "options": {
                "temperature": self.config.temperature,
                "top_p": self.config.top_p
            }
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    async fn complete(&self, request: &ModelRequest) -> Result<String, ExternalError> {
        debug!(model = %self.config.model, prompt_len = request.prompt.len(), "Sending chat request");

        let response = self
            .client
            .post(format!("{}/api/chat", self.endpoint))
            .json(&self.chat_body(request))
            .send()
            .await
            .map_err(|e| ExternalError::ConnectionError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ExternalError::OllamaError(format!(
                "{}: {}",
                status, error_text
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ExternalError::OllamaError(format!("Malformed chat response: {}", e)))?;

        Ok(chat.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(host: &str) -> LLMConfig {
        LLMConfig {
            host: host.to_string(),
            model: "test".to_string(),
            ..LLMConfig::default()
        }
    }

    #[test]
    fn test_url_generation() {
        // Test with plain hostname
        assert_eq!(config_for("localhost").get_url().unwrap(), "http://localhost:11434");

        // Test with http:// prefix
        assert_eq!(
            config_for("http://example.com/").get_url().unwrap(),
            "http://example.com:11434"
        );

        // Test with https:// prefix
        assert_eq!(
            config_for("https://example.com").get_url().unwrap(),
            "https://example.com:11434"
        );
    }

    #[test]
    fn test_invalid_host_is_config_error() {
        let result = OllamaClient::new(config_for("http://exa mple.com"));
        assert!(matches!(result, Err(ExternalError::ConfigError(_))));
    }

    #[test]
    fn test_chat_body_carries_schema_and_options() {
        let client = OllamaClient::new(config_for("localhost")).unwrap();
        let request = ModelRequest {
            system: "Return JSON.".to_string(),
            prompt: "Extract concepts.".to_string(),
            schema: serde_json::json!({"type": "object"}),
        };

        let body = client.chat_body(&request);

        assert_eq!(body["model"], "test");
        assert_eq!(body["stream"], false);
        assert_eq!(body["format"]["type"], "object");
        assert_eq!(body["messages"][1]["content"], "Extract concepts.");
        assert!(body["options"]["temperature"].is_number());
    }

    #[tokio::test]
    async fn test_mocked_completion() {
        let mut mock = MockLanguageModel::new();

        mock.expect_complete()
            .times(1)
            .returning(|_| Ok("{\"answer\": \"Paris\"}".to_string()));

        let request = ModelRequest {
            system: String::new(),
            prompt: "What is the capital of France?".to_string(),
            schema: Value::Null,
        };
        let response = mock.complete(&request).await.unwrap();
        assert!(response.contains("Paris"));
    }
}
