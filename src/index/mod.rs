pub mod retriever;

use crate::capability::Embedding;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One documented schema element: a table with its columns, relationship notes,
/// and the free-text description that gets embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDoc {
    pub id: String,
    pub table: String,
    pub columns: Vec<String>,
    pub content: String,
}

/// A schema doc plus its embedding vector. Created at index-build time and
/// read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaChunk {
    pub id: String,
    pub table: String,
    pub columns: Vec<String>,
    pub content: String,
    pub embedding: Vec<f32>,
}

/// An immutable set of embedded chunks. Retrieval always runs against one whole
/// snapshot so a concurrent rebuild can never interleave old and new chunks.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub chunks: Vec<SchemaChunk>,
    pub built_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Process-scoped handle to the persisted schema index.
pub struct SchemaIndex {
    snapshot: RwLock<Arc<SchemaSnapshot>>,
    index_path: PathBuf,
}

impl SchemaIndex {
    /// Opens the index at `index_path`, loading the persisted snapshot when one
    /// exists and starting empty otherwise.
    pub fn open(index_path: impl Into<PathBuf>) -> Result<Self> {
        let index_path = index_path.into();

        let snapshot = if index_path.exists() {
            let data = std::fs::read_to_string(&index_path)?;
            let snapshot: SchemaSnapshot = serde_json::from_str(&data)?;
            info!(
                "Loaded schema index with {} chunks from {}",
                snapshot.chunks.len(),
                index_path.display()
            );
            snapshot
        } else {
            warn!(
                "No schema index found at {}; starting empty",
                index_path.display()
            );
            SchemaSnapshot::default()
        };

        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            index_path,
        })
    }

    /// Current snapshot. Cheap to clone; holds no lock beyond the read.
    pub async fn snapshot(&self) -> Arc<SchemaSnapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn chunk_ids(&self) -> Vec<String> {
        let snapshot = self.snapshot().await;
        snapshot.chunks.iter().map(|c| c.id.clone()).collect()
    }

    /// Rebuilds the whole index from schema docs, embedding every chunk, then
    /// swaps the snapshot and persists it atomically.
    pub async fn rebuild(&self, docs: &[SchemaDoc], embedding: &dyn Embedding) -> Result<()> {
        info!("Rebuilding schema index with {} docs", docs.len());

        let mut chunks = Vec::with_capacity(docs.len());
        for doc in docs {
            debug!("Embedding schema chunk {}", doc.id);
            let vector = embedding.embed(&doc.content).await?;
            chunks.push(SchemaChunk {
                id: doc.id.clone(),
                table: doc.table.clone(),
                columns: doc.columns.clone(),
                content: doc.content.clone(),
                embedding: vector,
            });
        }

        let snapshot = SchemaSnapshot {
            chunks,
            built_at: Some(chrono::Utc::now()),
        };

        self.persist(&snapshot)?;
        *self.snapshot.write().await = Arc::new(snapshot);

        info!("Schema index rebuilt successfully");
        Ok(())
    }

    /// Adds or replaces a single chunk, keeping the rest of the snapshot intact.
    pub async fn upsert_chunk(&self, doc: &SchemaDoc, embedding: &dyn Embedding) -> Result<()> {
        let vector = embedding.embed(&doc.content).await?;
        let chunk = SchemaChunk {
            id: doc.id.clone(),
            table: doc.table.clone(),
            columns: doc.columns.clone(),
            content: doc.content.clone(),
            embedding: vector,
        };

        let mut guard = self.snapshot.write().await;
        let mut chunks = guard.chunks.clone();
        match chunks.iter_mut().find(|c| c.id == chunk.id) {
            Some(existing) => *existing = chunk,
            None => chunks.push(chunk),
        }

        let snapshot = SchemaSnapshot {
            chunks,
            built_at: guard.built_at,
        };
        self.persist(&snapshot)?;
        *guard = Arc::new(snapshot);
        Ok(())
    }

    pub async fn remove_chunk(&self, chunk_id: &str) -> Result<()> {
        let mut guard = self.snapshot.write().await;
        let mut chunks = guard.chunks.clone();
        let before = chunks.len();
        chunks.retain(|c| c.id != chunk_id);
        if chunks.len() == before {
            return Err(PipelineError::Config(format!(
                "unknown schema chunk: {}",
                chunk_id
            )));
        }

        let snapshot = SchemaSnapshot {
            chunks,
            built_at: guard.built_at,
        };
        self.persist(&snapshot)?;
        *guard = Arc::new(snapshot);
        Ok(())
    }

    // Durable write: temp file in the same directory, then rename over the old
    // index so concurrent readers of the file never see a partial write.
    fn persist(&self, snapshot: &SchemaSnapshot) -> Result<()> {
        if let Some(parent) = self.index_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.index_path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &self.index_path)?;
        Ok(())
    }
}

/// Loads schema documentation from the JSON file the index is rebuilt from.
pub fn load_schema_docs(path: impl AsRef<Path>) -> Result<Vec<SchemaDoc>> {
    let data = std::fs::read_to_string(path.as_ref())?;
    let docs: Vec<SchemaDoc> = serde_json::from_str(&data)?;
    if docs.is_empty() {
        return Err(PipelineError::Config(format!(
            "schema doc file {} contains no entries",
            path.as_ref().display()
        )));
    }
    Ok(docs)
}

/// Cosine similarity between two vectors; 0.0 when either has no magnitude or
/// the dimensions disagree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Embedding;
    use async_trait::async_trait;

    struct KeywordEmbedding;

    #[async_trait]
    impl Embedding for KeywordEmbedding {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            // Two-dimensional toy space: HCP-ness vs interaction-ness.
            let hcp = text.matches("HCP").count() as f32;
            let reps = text.matches("interaction").count() as f32;
            Ok(vec![hcp, reps])
        }
    }

    fn docs() -> Vec<SchemaDoc> {
        vec![
            SchemaDoc {
                id: "HCP".to_string(),
                table: "HCP".to_string(),
                columns: vec!["id".to_string(), "englishname".to_string()],
                content: "TABLE: HCP HCP HCP".to_string(),
            },
            SchemaDoc {
                id: "MedicalReps".to_string(),
                table: "MedicalReps".to_string(),
                columns: vec!["MRId".to_string(), "HCPId".to_string()],
                content: "TABLE: interaction interaction".to_string(),
            },
        ]
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn rebuild_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index = SchemaIndex::open(&path).unwrap();
        index.rebuild(&docs(), &KeywordEmbedding).await.unwrap();

        let reopened = SchemaIndex::open(&path).unwrap();
        let snapshot = reopened.snapshot().await;
        assert_eq!(snapshot.chunks.len(), 2);
        assert_eq!(snapshot.chunks[0].table, "HCP");
        assert!(snapshot.built_at.is_some());
    }

    #[tokio::test]
    async fn upsert_and_remove_maintain_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index = SchemaIndex::open(&path).unwrap();
        index.rebuild(&docs(), &KeywordEmbedding).await.unwrap();

        let extra = SchemaDoc {
            id: "Notes".to_string(),
            table: "Notes".to_string(),
            columns: vec!["id".to_string()],
            content: "TABLE: notes".to_string(),
        };
        index.upsert_chunk(&extra, &KeywordEmbedding).await.unwrap();
        assert_eq!(index.chunk_ids().await.len(), 3);

        index.remove_chunk("Notes").await.unwrap();
        assert_eq!(index.chunk_ids().await.len(), 2);

        let err = index.remove_chunk("Notes").await.unwrap_err();
        assert_eq!(err.reason_code(), "invalid_config");
    }
}
