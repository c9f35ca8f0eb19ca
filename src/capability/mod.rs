pub mod gemini;
pub mod ollama;

use crate::config::CapabilityConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// A single prompt sent to the text-generation capability.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl PromptRequest {
    pub fn new(prompt: impl Into<String>, temperature: f32) -> Self {
        Self {
            prompt: prompt.into(),
            temperature,
            max_tokens: 2000,
        }
    }
}

/// Text-generation capability. Every pipeline stage that needs a model response
/// goes through this trait, so providers are swappable without touching stage logic.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, request: &PromptRequest) -> Result<String>;
}

/// Embedding capability, used by the schema retriever and similarity scoring.
#[async_trait]
pub trait Embedding: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Selects a backing provider from configuration and hands out shared handles.
pub struct CapabilityManager {
    completion: Arc<dyn Completion>,
    embedding: Arc<dyn Embedding>,
}

impl CapabilityManager {
    pub fn new(config: &CapabilityConfig) -> Result<Self> {
        match config.backend.as_str() {
            "gemini" => {
                let provider = Arc::new(gemini::GeminiProvider::new(config)?);
                Ok(Self {
                    completion: provider.clone(),
                    embedding: provider,
                })
            }
            "ollama" => {
                let provider = Arc::new(ollama::OllamaProvider::new(config)?);
                Ok(Self {
                    completion: provider.clone(),
                    embedding: provider,
                })
            }
            other => Err(PipelineError::Config(format!(
                "unsupported capability backend: {}",
                other
            ))),
        }
    }

    pub fn completion(&self) -> Arc<dyn Completion> {
        self.completion.clone()
    }

    pub fn embedding(&self) -> Arc<dyn Embedding> {
        self.embedding.clone()
    }
}

/// Strips markdown code fences from a model response and returns the inner text.
///
/// Handles ```sql ... ```, plain ``` ... ```, and unfenced responses.
pub fn strip_code_fences(content: &str) -> String {
    if let Some(start) = content.find("```sql") {
        if let Some(end) = content[start + 6..].find("```") {
            return content[start + 6..start + 6 + end].trim().to_string();
        }
    }

    if let Some(start) = content.find("```json") {
        if let Some(end) = content[start + 7..].find("```") {
            return content[start + 7..start + 7 + end].trim().to_string();
        }
    }

    if let Some(start) = content.find("```") {
        let after = &content[start + 3..];
        if let Some(end) = after.find("```") {
            // A bare fence may still carry a language tag on its first line.
            let inner = &after[..end];
            let inner = inner
                .strip_prefix("sql\n")
                .or_else(|| inner.strip_prefix("json\n"))
                .unwrap_or(inner);
            return inner.trim().to_string();
        }
    }

    content.trim().to_string()
}

/// Parses a typed JSON object out of a completion response.
///
/// The pipeline never trusts raw model text as structured data: anything that does
/// not deserialize into the expected shape is a malformed-output error the caller
/// can reject or retry.
pub fn parse_json_response<T: serde::de::DeserializeOwned>(content: &str) -> Result<T> {
    let stripped = strip_code_fences(content);

    // Tolerate prose around the object by slicing the outermost braces.
    let candidate = match (stripped.find('{'), stripped.rfind('}')) {
        (Some(start), Some(end)) if end > start => &stripped[start..=end],
        _ => stripped.as_str(),
    };

    serde_json::from_str(candidate).map_err(|e| {
        PipelineError::MalformedCapabilityOutput(format!(
            "expected a JSON object, got parse error `{}` in: {}",
            e,
            truncate_for_log(&stripped)
        ))
    })
}

/// Extracts a SQL statement from a completion response, falling back to scanning
/// for a line that opens with a SELECT/WITH keyword.
pub fn extract_sql(content: &str) -> String {
    let stripped = strip_code_fences(content);

    let upper = stripped.to_uppercase();
    if upper.trim_start().starts_with("SELECT") || upper.trim_start().starts_with("WITH") {
        return stripped.trim().to_string();
    }

    // Scan line by line for the start of a statement and collect to the semicolon.
    let lines: Vec<&str> = stripped.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim().to_uppercase();
        if trimmed.starts_with("SELECT") || trimmed.starts_with("WITH") {
            let mut sql = line.trim().to_string();
            for next_line in lines.iter().skip(i + 1) {
                let next = next_line.trim();
                if next.starts_with("```") {
                    break;
                }
                sql.push(' ');
                sql.push_str(next);
                if next.ends_with(';') {
                    break;
                }
            }
            return sql;
        }
    }

    stripped.trim().to_string()
}

fn truncate_for_log(text: &str) -> String {
    const MAX: usize = 200;
    if text.len() <= MAX {
        text.to_string()
    } else {
        let mut cut = MAX;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    }
}
