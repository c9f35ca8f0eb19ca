use thiserror::Error;

/// Canonical pipeline error taxonomy.
///
/// Classification guidance:
/// - [`PipelineError::GuardRejected`]: the safety gate refused the question; terminal,
///   the reason is user-visible
/// - [`PipelineError::RetrievalUnavailable`]: embedding/index failure while grounding;
///   the pipeline fails closed instead of planning against an empty context
/// - [`PipelineError::PlanningAmbiguous`]: the question could not be resolved to a
///   concrete plan; carries the clarification to show the user
/// - [`PipelineError::GenerationRuleViolation`]: generated SQL broke a structural rule;
///   consumed internally as a correction trigger, never user-visible on its own
/// - [`PipelineError::ValidationFailed`]: a syntax or dry-run defect; drives the
///   bounded correction loop
/// - [`PipelineError::CorrectionExhausted`]: the correction budget ran out; terminal,
///   carries the last diagnostic
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("question rejected: {0}")]
    GuardRejected(String),

    #[error("schema retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("cannot plan this question: {0}")]
    PlanningAmbiguous(String),

    #[error("generated SQL violates a structural rule: {0}")]
    GenerationRuleViolation(String),

    #[error("SQL validation failed: {0}")]
    ValidationFailed(String),

    #[error("could not produce a valid query: {0}")]
    CorrectionExhausted(String),

    #[error("query execution failed: {0}")]
    ExecutionError(String),

    #[error("capability call timed out: {0}")]
    CapabilityTimeout(String),

    /// An external capability (completion, embedding, database) could not be reached.
    #[error("capability unavailable: {0}")]
    Unavailable(String),

    /// A capability returned text that does not satisfy its typed contract.
    #[error("malformed capability output: {0}")]
    MalformedCapabilityOutput(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Stable reason code for logging and evaluation records.
    pub fn reason_code(&self) -> &'static str {
        match self {
            PipelineError::GuardRejected(_) => "guard_rejected",
            PipelineError::RetrievalUnavailable(_) => "retrieval_unavailable",
            PipelineError::PlanningAmbiguous(_) => "planning_ambiguous",
            PipelineError::GenerationRuleViolation(_) => "generation_rule_violation",
            PipelineError::ValidationFailed(_) => "validation_failed",
            PipelineError::CorrectionExhausted(_) => "correction_exhausted",
            PipelineError::ExecutionError(_) => "execution_error",
            PipelineError::CapabilityTimeout(_) => "capability_timeout",
            PipelineError::Unavailable(_) => "capability_unavailable",
            PipelineError::MalformedCapabilityOutput(_) => "malformed_capability_output",
            PipelineError::Config(_) => "invalid_config",
            PipelineError::Io(_) => "io_error",
            PipelineError::Json(_) => "serialization_error",
        }
    }

    /// Message shown to the end user at the pipeline boundary.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::GuardRejected(reason) => format!(
                "This question was rejected by the security check: {}. Please rephrase it \
                 using only standard data retrieval language.",
                reason
            ),
            PipelineError::PlanningAmbiguous(clarification) => format!(
                "The question is ambiguous: {}. Please restate it with a concrete condition.",
                clarification
            ),
            PipelineError::CorrectionExhausted(diag) => format!(
                "Could not produce a valid query for this question (last problem: {}).",
                diag
            ),
            PipelineError::ExecutionError(_) => "Could not run this query.".to_string(),
            PipelineError::CapabilityTimeout(_) | PipelineError::Unavailable(_) => {
                "A backing service did not respond in time. Please try again shortly.".to_string()
            }
            other => format!("The request could not be processed: {}", other),
        }
    }
}

/// Standard result alias used across the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
