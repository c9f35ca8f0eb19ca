pub mod formatter;
pub mod generator;
pub mod guard;
pub mod planner;
pub mod validator;

use crate::capability::Completion;
use crate::config::AppConfig;
use crate::db::Database;
use crate::error::PipelineError;
use crate::index::retriever::SchemaRetriever;
use crate::pipeline::formatter::{Answer, Formatter};
use crate::pipeline::generator::{Generator, SqlCandidate, Validity};
use crate::pipeline::guard::SafetyGuard;
use crate::pipeline::planner::Planner;
use crate::pipeline::validator::Validator;
use std::sync::Arc;
use tracing::{info, warn};

/// An incoming question. Immutable once received.
#[derive(Debug, Clone)]
pub struct Question {
    pub id: String,
    pub text: String,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        let received_at = chrono::Utc::now();
        Self {
            id: format!("q-{}", received_at.timestamp_nanos_opt().unwrap_or_default()),
            text: text.into(),
            received_at,
        }
    }
}

/// Per-request processing detail, kept for the "show query details" surface and
/// for evaluation records.
#[derive(Debug, Clone, Default)]
pub struct QueryDetails {
    pub retrieved_chunks: Vec<(String, f32)>,
    pub original_sql: Option<String>,
    pub sql_query: Option<String>,
    pub attempts: usize,
    pub was_corrected: bool,
    pub is_valid: bool,
    pub security_check_passed: bool,
}

/// Terminal outcome of one pipeline run.
#[derive(Debug)]
pub enum PipelineResponse {
    Answered {
        answer: Answer,
        details: QueryDetails,
    },
    Rejected {
        reason: String,
        details: QueryDetails,
    },
    Failed {
        message: String,
        reason_code: &'static str,
        details: QueryDetails,
    },
}

/// Result of the SQL-resolution stages (guard through validation), before any
/// execution happens. The evaluator consumes this directly.
#[derive(Debug)]
pub struct SqlResolution {
    pub candidate: SqlCandidate,
    pub details: QueryDetails,
}

/// The grounded SQL-generation pipeline: guard → retrieve → plan → generate →
/// validate/correct → execute → format, strictly sequential per question.
///
/// Every component holds injected capability handles; nothing is process-global,
/// so each piece is testable in isolation with fakes.
pub struct QueryPipeline {
    guard: SafetyGuard,
    retriever: SchemaRetriever,
    planner: Planner,
    generator: Generator,
    validator: Validator,
    formatter: Formatter,
    database: Arc<dyn Database>,
    top_k: usize,
}

impl QueryPipeline {
    pub fn new(
        config: &AppConfig,
        completion: Arc<dyn Completion>,
        retriever: SchemaRetriever,
        database: Arc<dyn Database>,
    ) -> Self {
        Self {
            guard: SafetyGuard::new(completion.clone()),
            retriever,
            planner: Planner::new(completion.clone()),
            generator: Generator::new(completion.clone()),
            validator: Validator::new(
                completion.clone(),
                database.clone(),
                config.validation.max_correction_attempts,
            ),
            formatter: Formatter::new(completion),
            database,
            top_k: config.retrieval.top_k,
        }
    }

    /// Full pipeline run for one question, through execution and formatting.
    pub async fn process(&self, question: &Question) -> PipelineResponse {
        let resolution = match self.resolve_sql(question).await {
            Ok(resolution) => resolution,
            Err((e, details)) => return Self::failure_response(e, details),
        };

        let details = resolution.details;

        let result = match self.database.execute(&resolution.candidate.sql).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Execution failed for question {}: {}", question.id, e);
                return Self::failure_response(e, details);
            }
        };

        match self
            .formatter
            .format(&question.text, &resolution.candidate, &result)
            .await
        {
            Ok(answer) => PipelineResponse::Answered { answer, details },
            Err(e) => Self::failure_response(e, details),
        }
    }

    /// Guard through validation, producing a validated candidate but executing
    /// nothing. On failure the partial details collected so far come back with
    /// the error so callers can still report flags.
    pub async fn resolve_sql(
        &self,
        question: &Question,
    ) -> std::result::Result<SqlResolution, (PipelineError, QueryDetails)> {
        let mut details = QueryDetails::default();

        info!("Processing question {}: {}", question.id, question.text);

        // Safety gate. A reject is terminal: no plan, no candidate, no execution.
        let decision = match self.guard.check(&question.text).await {
            Ok(decision) => decision,
            Err(e) => return Err((e, details)),
        };
        if !decision.is_allowed() {
            return Err((PipelineError::GuardRejected(decision.reason), details));
        }
        details.security_check_passed = true;

        let retrieval = match self.retriever.retrieve(&question.text, self.top_k).await {
            Ok(retrieval) => retrieval,
            Err(e) => return Err((e, details)),
        };
        details.retrieved_chunks = retrieval
            .chunks
            .iter()
            .map(|s| (s.chunk.id.clone(), s.score))
            .collect();

        let plan = match self.planner.plan(&question.text, &retrieval).await {
            Ok(plan) => plan,
            Err(e) => return Err((e, details)),
        };

        let mut candidate = match self.generator.generate(&plan, &retrieval).await {
            Ok(candidate) => candidate,
            Err(e) => return Err((e, details)),
        };
        details.original_sql = Some(candidate.original_sql.clone());

        let validation = self
            .validator
            .validate(&mut candidate, &plan, &retrieval)
            .await;

        details.sql_query = Some(candidate.sql.clone());
        details.attempts = candidate.attempts.len();
        details.was_corrected = candidate.was_corrected();
        details.is_valid = candidate.validity == Validity::Valid;

        match validation {
            Ok(()) => Ok(SqlResolution { candidate, details }),
            Err(e) => Err((e, details)),
        }
    }

    fn failure_response(e: PipelineError, details: QueryDetails) -> PipelineResponse {
        let reason_code = e.reason_code();
        let message = e.user_message();
        match e {
            PipelineError::GuardRejected(_) => PipelineResponse::Rejected {
                reason: message,
                details,
            },
            _ => PipelineResponse::Failed {
                message,
                reason_code,
                details,
            },
        }
    }
}
