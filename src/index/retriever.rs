use crate::capability::Embedding;
use crate::config::RetrievalConfig;
use crate::error::{PipelineError, Result};
use crate::index::{cosine_similarity, SchemaChunk, SchemaIndex};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// One retrieved chunk with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: SchemaChunk,
    pub score: f32,
}

/// The relevance-ranked schema context for one question. Bounded to top-k and
/// never persisted beyond the request.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub chunks: Vec<ScoredChunk>,
}

impl RetrievalResult {
    /// Formatted schema context for prompt consumption.
    pub fn context_text(&self) -> String {
        if self.chunks.is_empty() {
            return "No relevant schema found.".to_string();
        }

        let mut context = String::from("Relevant Database Schema:\n\n");
        for (i, scored) in self.chunks.iter().enumerate() {
            context.push_str(&format!(
                "Schema {} (Relevance Score: {:.3}):\n{}\n\n",
                i + 1,
                scored.score,
                scored.chunk.content
            ));
        }
        context
    }

    /// Table names present in the retrieved context, as stored in the schema.
    pub fn table_names(&self) -> Vec<String> {
        self.chunks.iter().map(|s| s.chunk.table.clone()).collect()
    }

    /// Union of column names across all retrieved tables.
    pub fn column_names(&self) -> BTreeSet<String> {
        self.chunks
            .iter()
            .flat_map(|s| s.chunk.columns.iter().cloned())
            .collect()
    }

    /// Case-insensitive lookup of a table's stored name.
    pub fn resolve_table(&self, name: &str) -> Option<String> {
        self.chunks
            .iter()
            .map(|s| s.chunk.table.as_str())
            .find(|t| t.eq_ignore_ascii_case(name))
            .map(|t| t.to_string())
    }

    /// Case-insensitive lookup of a column's stored name.
    pub fn resolve_column(&self, name: &str) -> Option<String> {
        self.chunks
            .iter()
            .flat_map(|s| s.chunk.columns.iter())
            .find(|c| c.eq_ignore_ascii_case(name))
            .map(|c| c.to_string())
    }
}

/// Read-only similarity search over the schema index.
pub struct SchemaRetriever {
    index: Arc<SchemaIndex>,
    embedding: Arc<dyn Embedding>,
    score_floor: f32,
}

impl SchemaRetriever {
    pub fn new(
        index: Arc<SchemaIndex>,
        embedding: Arc<dyn Embedding>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embedding,
            score_floor: config.score_floor,
        }
    }

    /// Returns the k most similar schema chunks for the question.
    ///
    /// Fails closed: an embedding failure propagates instead of degrading to an
    /// empty context, which would let later stages hallucinate schema.
    pub async fn retrieve(&self, question: &str, k: usize) -> Result<RetrievalResult> {
        if question.trim().is_empty() {
            return Err(PipelineError::Config(
                "cannot retrieve schema for an empty question".to_string(),
            ));
        }
        if k == 0 {
            return Err(PipelineError::Config(
                "retrieval top_k must be at least 1".to_string(),
            ));
        }

        let query_vector = self
            .embedding
            .embed(question)
            .await
            .map_err(|e| PipelineError::RetrievalUnavailable(e.to_string()))?;

        let snapshot = self.index.snapshot().await;
        if snapshot.chunks.is_empty() {
            return Err(PipelineError::RetrievalUnavailable(
                "schema index is empty; build it before asking questions".to_string(),
            ));
        }

        // Stable sort keeps index-insertion order for tied scores.
        let mut scored: Vec<(usize, f32)> = snapshot
            .chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| (i, cosine_similarity(&query_vector, &chunk.embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let chunks: Vec<ScoredChunk> = scored
            .into_iter()
            .filter(|(_, score)| *score >= self.score_floor)
            .take(k)
            .map(|(i, score)| ScoredChunk {
                chunk: snapshot.chunks[i].clone(),
                score,
            })
            .collect();

        info!("Retrieved {} relevant schema chunks", chunks.len());
        for scored in &chunks {
            debug!(
                "  chunk {} score {:.3}",
                scored.chunk.id, scored.score
            );
        }

        Ok(RetrievalResult { chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::index::{SchemaDoc, SchemaIndex};
    use async_trait::async_trait;

    struct AxisEmbedding;

    #[async_trait]
    impl Embedding for AxisEmbedding {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains("unavailable") {
                return Err(PipelineError::Unavailable("embedding down".to_string()));
            }
            let hcp = text.to_lowercase().matches("consultant").count() as f32 + 0.1;
            let reps = text.to_lowercase().matches("interaction").count() as f32 + 0.1;
            Ok(vec![hcp, reps])
        }
    }

    fn retrieval_config(floor: f32) -> RetrievalConfig {
        RetrievalConfig {
            top_k: 2,
            score_floor: floor,
            index_path: String::new(),
            schema_docs_path: String::new(),
        }
    }

    async fn built_index(dir: &tempfile::TempDir) -> Arc<SchemaIndex> {
        let index = SchemaIndex::open(dir.path().join("index.json")).unwrap();
        let docs = vec![
            SchemaDoc {
                id: "HCP".to_string(),
                table: "HCP".to_string(),
                columns: vec!["id".to_string(), "isconsultant".to_string()],
                content: "consultant consultant consultant".to_string(),
            },
            SchemaDoc {
                id: "MedicalReps".to_string(),
                table: "MedicalReps".to_string(),
                columns: vec!["MRId".to_string(), "InteractionId".to_string()],
                content: "interaction interaction interaction".to_string(),
            },
        ];
        index.rebuild(&docs, &AxisEmbedding).await.unwrap();
        Arc::new(index)
    }

    #[tokio::test]
    async fn retrieve_ranks_by_similarity_and_bounds_k() {
        let dir = tempfile::tempdir().unwrap();
        let index = built_index(&dir).await;
        let retriever =
            SchemaRetriever::new(index, Arc::new(AxisEmbedding), &retrieval_config(0.0));

        let result = retriever.retrieve("show all consultant doctors", 1).await.unwrap();
        assert_eq!(result.chunks.len(), 1);
        assert_eq!(result.chunks[0].chunk.table, "HCP");

        let result = retriever.retrieve("show all consultant doctors", 5).await.unwrap();
        assert!(result.chunks.len() <= 2);
    }

    #[tokio::test]
    async fn retrieve_fails_closed_when_embedding_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let index = built_index(&dir).await;
        let retriever =
            SchemaRetriever::new(index, Arc::new(AxisEmbedding), &retrieval_config(0.0));

        let err = retriever.retrieve("unavailable question", 2).await.unwrap_err();
        assert_eq!(err.reason_code(), "retrieval_unavailable");
    }

    #[tokio::test]
    async fn context_exposes_grounding_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let index = built_index(&dir).await;
        let retriever =
            SchemaRetriever::new(index, Arc::new(AxisEmbedding), &retrieval_config(0.0));

        let result = retriever.retrieve("consultant interaction counts", 2).await.unwrap();
        assert_eq!(result.resolve_table("hcp").as_deref(), Some("HCP"));
        assert_eq!(result.resolve_column("ISCONSULTANT").as_deref(), Some("isconsultant"));
        assert!(result.resolve_column("no_such_column").is_none());
        assert!(result.context_text().starts_with("Relevant Database Schema:"));
    }
}
