//! Answer generation over the Ollama chat API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::GenerationSettings;
use crate::error::GenerationError;

/// Trait for generation backends.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce a completion for one system/user message pair.
    async fn complete(&self, system: &str, user: &str) -> Result<String, GenerationError>;

    /// Stable identifier of the backend configuration. Two generators with
    /// the same fingerprint produce interchangeable answers; cached
    /// responses are scoped by it.
    fn fingerprint(&self) -> &str;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Generation backend talking to a local Ollama server.
pub struct OllamaGenerator {
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    fingerprint: String,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(settings: &GenerationSettings) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            fingerprint: fingerprint_for(settings),
            client,
        })
    }
}

/// Fingerprint covering everything that changes what the model would say:
/// the model, the sampling parameters, and the system template.
pub fn fingerprint_for(settings: &GenerationSettings) -> String {
    let mut hasher = Sha256::new();
    hasher.update(settings.system_prompt.as_bytes());
    let sys_digest = format!("{:x}", hasher.finalize());
    format!(
        "ollama/{}?temperature={}&max_tokens={}&sys={}",
        settings.model,
        settings.temperature,
        settings.max_tokens,
        &sys_digest[..12]
    )
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn complete(&self, system: &str, user: &str) -> Result<String, GenerationError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            stream: false,
            options: ChatOptions {
                temperature: self.temperature,
                num_predict: self.max_tokens,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let result: ChatResponse = response.json().await?;
        Ok(result.message.content)
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(model: &str, temperature: f64) -> GenerationSettings {
        GenerationSettings {
            base_url: "http://localhost:11434".to_string(),
            model: model.to_string(),
            temperature,
            max_tokens: 512,
            system_prompt: "test".to_string(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_fingerprint_changes_with_model_and_sampling() {
        let a = fingerprint_for(&settings("llama3.2", 0.7));
        let b = fingerprint_for(&settings("mistral", 0.7));
        let c = fingerprint_for(&settings("llama3.2", 0.2));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, fingerprint_for(&settings("llama3.2", 0.7)));
    }

    #[test]
    fn test_fingerprint_changes_with_system_prompt() {
        let mut changed = settings("llama3.2", 0.7);
        changed.system_prompt = "answer only in haiku".to_string();
        assert_ne!(
            fingerprint_for(&settings("llama3.2", 0.7)),
            fingerprint_for(&changed)
        );
    }

    #[test]
    fn test_chat_response_shape() {
        let json = r#"{"model":"llama3.2","message":{"role":"assistant","content":"hi"},"done":true}"#;
        let resp: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.message.content, "hi");
    }
}
