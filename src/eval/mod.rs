use crate::capability::Embedding;
use crate::error::{PipelineError, Result};
use crate::index::cosine_similarity;
use crate::pipeline::{QueryPipeline, Question};
use serde::{Deserialize, Serialize};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// One labeled evaluation case. Ground-truth SQL is optional; similarity and
/// exact-match are only computed when it is present.
#[derive(Debug, Clone, Deserialize)]
pub struct LabeledCase {
    pub question: String,
    pub expected_sql: Option<String>,
}

/// One evaluated question. The field set is the externally-observed report
/// contract and is reproduced field for field.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationRecord {
    pub question: String,
    pub expected_sql: Option<String>,
    pub generated_sql: String,
    pub similarity: Option<f64>,
    pub exact_match: bool,
    pub response_time: f64,
    pub original_sql: String,
    pub sql_query: String,
    pub was_corrected: bool,
    pub is_valid: bool,
    pub security_check_passed: bool,
}

/// Pluggable similarity scoring between generated and expected text.
/// Must be deterministic for identical inputs.
#[async_trait::async_trait]
pub trait Similarity: Send + Sync {
    async fn score(&self, generated: &str, expected: &str) -> Result<f64>;
}

/// Default scorer: difflib-style sequence ratio over normalized SQL.
/// Fully offline and reproducible.
pub struct SequenceSimilarity;

#[async_trait::async_trait]
impl Similarity for SequenceSimilarity {
    async fn score(&self, generated: &str, expected: &str) -> Result<f64> {
        Ok(sequence_ratio(
            &normalize_sql(generated),
            &normalize_sql(expected),
        ))
    }
}

/// Cosine similarity over the embedding capability, for natural-language
/// answer ground truth.
pub struct EmbeddingSimilarity {
    embedding: Arc<dyn Embedding>,
}

impl EmbeddingSimilarity {
    pub fn new(embedding: Arc<dyn Embedding>) -> Self {
        Self { embedding }
    }
}

#[async_trait::async_trait]
impl Similarity for EmbeddingSimilarity {
    async fn score(&self, generated: &str, expected: &str) -> Result<f64> {
        let a = self.embedding.embed(generated).await?;
        let b = self.embedding.embed(expected).await?;
        Ok(cosine_similarity(&a, &b).clamp(0.0, 1.0) as f64)
    }
}

/// Canonicalizes SQL for fair comparison: parse and re-render every statement
/// when the input parses, otherwise lowercase and collapse whitespace. Either
/// path strips the trailing semicolon, so the function is idempotent.
pub fn normalize_sql(sql: &str) -> String {
    match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) if !statements.is_empty() => statements
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("; ")
            .to_lowercase(),
        _ => {
            let stripped = sql.trim().trim_end_matches(';');
            stripped
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase()
        }
    }
}

/// Ratio of matching content between two strings in [0,1]:
/// 2·LCS / (len(a) + len(b)) over characters.
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    // Single-row LCS table keeps memory linear in the shorter string.
    let mut prev = vec![0usize; b_chars.len() + 1];
    let mut curr = vec![0usize; b_chars.len() + 1];
    for &ca in &a_chars {
        for (j, &cb) in b_chars.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let lcs = prev[b_chars.len()];
    (2.0 * lcs as f64) / ((a_chars.len() + b_chars.len()) as f64)
}

pub fn load_cases(path: impl AsRef<Path>) -> Result<Vec<LabeledCase>> {
    let data = std::fs::read_to_string(path.as_ref())?;
    let cases: Vec<LabeledCase> = serde_json::from_str(&data)?;
    if cases.is_empty() {
        return Err(PipelineError::Config(format!(
            "evaluation case file {} contains no cases",
            path.as_ref().display()
        )));
    }
    Ok(cases)
}

/// Offline harness: runs the pipeline in SQL-only mode over labeled cases and
/// scores the output against ground truth.
pub struct Evaluator {
    pipeline: Arc<QueryPipeline>,
    similarity: Arc<dyn Similarity>,
    concurrency: usize,
}

impl Evaluator {
    pub fn new(
        pipeline: Arc<QueryPipeline>,
        similarity: Arc<dyn Similarity>,
        concurrency: usize,
    ) -> Self {
        Self {
            pipeline,
            similarity,
            concurrency: concurrency.max(1),
        }
    }

    /// Evaluates every case. Case pipelines are mutually independent, so they
    /// run under a bounded concurrency limit; records come back in input order.
    /// A single case's failure never aborts the batch.
    pub async fn run(&self, cases: &[LabeledCase]) -> Vec<EvaluationRecord> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();

        for (index, case) in cases.iter().cloned().enumerate() {
            let pipeline = self.pipeline.clone();
            let similarity = self.similarity.clone();
            let semaphore = semaphore.clone();

            join_set.spawn(async move {
                // Semaphore closed only on runtime shutdown.
                let _permit = semaphore.acquire().await;
                let record = evaluate_case(&pipeline, similarity.as_ref(), &case).await;
                (index, record)
            });
        }

        let mut records: Vec<(usize, EvaluationRecord)> = Vec::with_capacity(cases.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(entry) => records.push(entry),
                Err(e) => warn!("Evaluation task panicked: {}", e),
            }
        }

        records.sort_by_key(|(index, _)| *index);
        records.into_iter().map(|(_, record)| record).collect()
    }

    /// Writes the report as pretty JSON and logs a summary.
    pub fn write_report(
        &self,
        records: &[EvaluationRecord],
        path: impl AsRef<Path>,
    ) -> Result<()> {
        let data = serde_json::to_string_pretty(records)?;
        std::fs::write(path.as_ref(), data)?;

        let exact = records.iter().filter(|r| r.exact_match).count();
        let valid = records.iter().filter(|r| r.is_valid).count();
        info!(
            "Evaluation complete: {}/{} exact matches, {}/{} valid, report at {}",
            exact,
            records.len(),
            valid,
            records.len(),
            path.as_ref().display()
        );
        for record in records {
            info!(
                "  {:.2}s exact={} valid={} corrected={} | {}",
                record.response_time,
                record.exact_match,
                record.is_valid,
                record.was_corrected,
                record.question
            );
        }
        Ok(())
    }
}

async fn evaluate_case(
    pipeline: &QueryPipeline,
    similarity: &dyn Similarity,
    case: &LabeledCase,
) -> EvaluationRecord {
    let question = Question::new(case.question.clone());
    let start = Instant::now();
    let outcome = pipeline.resolve_sql(&question).await;
    let response_time = start.elapsed().as_secs_f64();

    let (generated_sql, details) = match outcome {
        Ok(resolution) => (resolution.candidate.sql.clone(), resolution.details),
        Err((e, details)) => {
            warn!("Case `{}` did not produce SQL: {}", case.question, e);
            (String::new(), details)
        }
    };

    let (similarity_score, exact_match) = match (&case.expected_sql, generated_sql.is_empty()) {
        (Some(expected), false) => {
            let score = match similarity.score(&generated_sql, expected).await {
                Ok(score) => Some(score),
                Err(e) => {
                    warn!("Similarity scoring failed for `{}`: {}", case.question, e);
                    None
                }
            };
            let exact = normalize_sql(&generated_sql) == normalize_sql(expected);
            (score, exact)
        }
        _ => (None, false),
    };

    EvaluationRecord {
        question: case.question.clone(),
        expected_sql: case.expected_sql.clone(),
        generated_sql: generated_sql.clone(),
        similarity: similarity_score,
        exact_match,
        response_time,
        original_sql: details.original_sql.unwrap_or_default(),
        sql_query: details.sql_query.unwrap_or(generated_sql),
        was_corrected: details.was_corrected,
        is_valid: details.is_valid,
        security_check_passed: details.security_check_passed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let sql = "SELECT   *\nFROM HCP   WHERE isconsultant = TRUE;";
        let once = normalize_sql(sql);
        let twice = normalize_sql(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn multi_statement_input_keeps_every_statement() {
        let normalized = normalize_sql("SELECT 1; SELECT 2");
        assert_eq!(normalized, "select 1; select 2");
        assert_ne!(normalized, normalize_sql("SELECT 1"));
        assert_eq!(normalize_sql(&normalized), normalized);
    }

    #[test]
    fn whitespace_and_keyword_case_normalize_identically() {
        let a = "SELECT * FROM HCP WHERE isconsultant = TRUE;";
        let b = "select *   from HCP\n  where isconsultant = true";
        assert_eq!(normalize_sql(a), normalize_sql(b));
    }

    #[test]
    fn normalize_falls_back_on_unparseable_text() {
        let broken = "SELEC *  FROM ;;";
        let normalized = normalize_sql(broken);
        assert_eq!(normalized, normalize_sql(&normalized));
    }

    #[test]
    fn sequence_ratio_bounds() {
        assert_eq!(sequence_ratio("abc", "abc"), 1.0);
        assert_eq!(sequence_ratio("abc", ""), 0.0);
        assert_eq!(sequence_ratio("", ""), 1.0);

        let partial = sequence_ratio("select a from t", "select b from t");
        assert!(partial > 0.8 && partial < 1.0);
    }

    #[tokio::test]
    async fn sequence_similarity_is_deterministic() {
        let scorer = SequenceSimilarity;
        let a = scorer
            .score("SELECT * FROM HCP", "select * from HCP;")
            .await
            .unwrap();
        let b = scorer
            .score("SELECT * FROM HCP", "select * from HCP;")
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a, 1.0);
    }
}
