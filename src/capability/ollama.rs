use crate::capability::{Completion, Embedding, PromptRequest};
use crate::config::CapabilityConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
    embedding_model: String,
}

#[derive(Serialize, Debug)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize, Debug)]
struct OllamaOptions {
    temperature: f32,
    num_predict: usize,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    response: String,
    #[serde(flatten)]
    _extra: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct OllamaEmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}

impl OllamaProvider {
    pub fn new(config: &CapabilityConfig) -> Result<Self> {
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
        })
    }

    fn map_request_error(e: reqwest::Error) -> PipelineError {
        if e.is_timeout() {
            PipelineError::CapabilityTimeout(e.to_string())
        } else {
            PipelineError::Unavailable(e.to_string())
        }
    }
}

#[async_trait]
impl Completion for OllamaProvider {
    async fn complete(&self, request: &PromptRequest) -> Result<String> {
        let body = OllamaRequest {
            model: self.model.clone(),
            prompt: request.prompt.clone(),
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        debug!("Sending completion request to Ollama model {}", self.model);

        let response = self
            .client
            .post(format!("{}/api/generate", self.api_url))
            .json(&body)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            error!("Ollama API responded with status {}: {}", status, detail);
            return Err(PipelineError::Unavailable(format!(
                "Ollama API status {}: {}",
                status, detail
            )));
        }

        let response_text = response
            .text()
            .await
            .map_err(|e| PipelineError::Unavailable(e.to_string()))?;

        let parsed: OllamaResponse = serde_json::from_str(&response_text).map_err(|e| {
            PipelineError::MalformedCapabilityOutput(format!(
                "failed to parse Ollama response: {} - body was: {}",
                e, response_text
            ))
        })?;

        if parsed.response.trim().is_empty() {
            return Err(PipelineError::MalformedCapabilityOutput(
                "Ollama returned an empty response".to_string(),
            ));
        }

        Ok(parsed.response)
    }
}

#[async_trait]
impl Embedding for OllamaProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = OllamaEmbedRequest {
            model: self.embedding_model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.api_url))
            .json(&body)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        if !response.status().is_success() {
            return Err(PipelineError::Unavailable(format!(
                "Ollama embedding API status {}",
                response.status()
            )));
        }

        let parsed: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::MalformedCapabilityOutput(e.to_string()))?;

        if parsed.embedding.is_empty() {
            return Err(PipelineError::MalformedCapabilityOutput(
                "Ollama returned an empty embedding vector".to_string(),
            ));
        }

        Ok(parsed.embedding)
    }
}
