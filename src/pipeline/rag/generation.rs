use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::GenerationConfig;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Ollama not reachable at {0}")]
    Connection(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Ollama returned error ({status}): {body}")]
    Service { status: u16, body: String },

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model returned an empty response")]
    EmptyResponse,
}

/// Text in, text out. The analyzer only depends on this seam.
#[async_trait]
pub trait LlmGenerate: Send + Sync {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String, GenerationError>;
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
}

/// Response body from Ollama /api/generate (non-streaming)
#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Generator backed by a local Ollama instance.
pub struct OllamaGenerator {
    base_url: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
            client,
        })
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self, GenerationError> {
        Self::new(&config.ollama_url, &config.model, config.timeout())
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LlmGenerate for OllamaGenerator {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String, GenerationError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerateRequest {
            model: &self.model,
            prompt,
            system,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    GenerationError::Connection(self.base_url.clone())
                } else if e.is_timeout() {
                    GenerationError::Timeout(self.timeout)
                } else {
                    GenerationError::HttpClient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::ResponseParsing(e.to_string()))?;

        if parsed.response.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        tracing::debug!(model = %self.model, chars = parsed.response.len(), "Generation complete");
        Ok(parsed.response)
    }
}

/// Scripted generator for tests: replays responses in order, repeating the
/// last one, and records every prompt it receives.
#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Mutex;

    use super::*;

    pub struct ScriptedLlm {
        responses: Vec<Option<String>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        pub fn new(responses: &[&str]) -> Self {
            Self {
                responses: responses.iter().map(|r| Some(r.to_string())).collect(),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                responses: vec![None],
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmGenerate for ScriptedLlm {
        async fn generate(&self, _system: &str, prompt: &str) -> Result<String, GenerationError> {
            let index = {
                let mut prompts = self.prompts.lock().unwrap();
                prompts.push(prompt.to_string());
                prompts.len() - 1
            };
            let response = self
                .responses
                .get(index)
                .or_else(|| self.responses.last())
                .cloned()
                .flatten();
            response.ok_or_else(|| GenerationError::Connection("http://localhost:11434".into()))
        }
    }
}
