use crate::capability::{Completion, Embedding, PromptRequest};
use crate::config::CapabilityConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

const DEFAULT_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    embedding_model: String,
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: usize,
}

#[derive(Deserialize)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    content: Content,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

impl GeminiProvider {
    pub fn new(config: &CapabilityConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            PipelineError::Config("API key is required for the gemini backend".to_string())
        })?;

        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            api_key,
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
impl Completion for GeminiProvider {
    async fn complete(&self, request: &PromptRequest) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_url, self.model, self.api_key
        );

        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: request.prompt.clone(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        };

        debug!("Sending completion request to Gemini model {}", self.model);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            error!("Gemini API responded with status {}: {}", status, detail);
            return Err(PipelineError::Unavailable(format!(
                "Gemini API status {}: {}",
                status, detail
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::MalformedCapabilityOutput(e.to_string()))?;

        let text = parsed
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| {
                PipelineError::MalformedCapabilityOutput(
                    "Gemini response contained no candidates".to_string(),
                )
            })?;

        Ok(text)
    }
}

#[async_trait]
impl Embedding for GeminiProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!(
            "{}/models/{}:embedContent?key={}",
            self.api_url, self.embedding_model, self.api_key
        );

        let body = EmbedRequest {
            model: format!("models/{}", self.embedding_model),
            content: Content {
                parts: vec![Part {
                    text: text.to_string(),
                }],
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        if !response.status().is_success() {
            return Err(PipelineError::Unavailable(format!(
                "Gemini embedding API status {}",
                response.status()
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::MalformedCapabilityOutput(e.to_string()))?;

        if parsed.embedding.values.is_empty() {
            return Err(PipelineError::MalformedCapabilityOutput(
                "Gemini returned an empty embedding vector".to_string(),
            ));
        }

        Ok(parsed.embedding.values)
    }
}
