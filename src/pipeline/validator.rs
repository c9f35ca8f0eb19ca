use crate::capability::{extract_sql, Completion, PromptRequest};
use crate::db::{Database, DryRun};
use crate::error::{PipelineError, Result};
use crate::index::retriever::RetrievalResult;
use crate::pipeline::generator::{check_structural_rules, CorrectionAttempt, SqlCandidate, Validity};
use crate::pipeline::planner::QueryPlan;
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;
use tracing::{info, warn};

const CORRECTION_PROMPT: &str = r#"You are an expert SQL corrector. Fix the flagged defect in the SQL query below and output valid SQL.

Rules:
- Fix ONLY the flagged defect. Do not change the logic or intent of the query: keep the same tables, filters, grouping and aggregations from the plan.
- Use only tables and columns from the provided schema, with their exact spelling and case.
- Keep every join an explicit JOIN ... ON clause.
- Output ONLY the corrected SQL query, ending with a semicolon. No explanations, no markdown.

Schema:
{schema_context}

Original query plan (JSON):
{plan}

SQL query to fix:
{sql}

Detected problem:
{diagnostic}

Corrected SQL:"#;

/// Bounded validate/correct loop over one [`SqlCandidate`].
///
/// Per iteration: syntax parse, read-only statement check, then a non-mutating
/// dry run against the live schema. Any diagnostic goes to the corrector, which
/// must preserve the plan's intent while fixing only the flagged defect. The
/// loop never exceeds the configured attempt budget; exhaustion marks the
/// candidate `Failed` and it is never executed.
pub struct Validator {
    completion: Arc<dyn Completion>,
    database: Arc<dyn Database>,
    max_attempts: usize,
}

impl Validator {
    pub fn new(
        completion: Arc<dyn Completion>,
        database: Arc<dyn Database>,
        max_attempts: usize,
    ) -> Self {
        Self {
            completion,
            database,
            max_attempts,
        }
    }

    pub async fn validate(
        &self,
        candidate: &mut SqlCandidate,
        plan: &QueryPlan,
        retrieval: &RetrievalResult,
    ) -> Result<()> {
        loop {
            match self.inspect(&candidate.sql, plan, retrieval).await? {
                None => {
                    candidate.validity = Validity::Valid;
                    if candidate.was_corrected() {
                        info!(
                            "SQL valid after {} correction attempt(s)",
                            candidate.attempts.len()
                        );
                    } else {
                        info!("SQL query is valid");
                    }
                    return Ok(());
                }
                Some(diagnostic) => {
                    if candidate.attempts.len() >= self.max_attempts {
                        candidate.validity = Validity::Failed;
                        warn!(
                            "Correction budget ({}) exhausted; last diagnostic: {}",
                            self.max_attempts, diagnostic
                        );
                        return Err(PipelineError::CorrectionExhausted(diagnostic));
                    }

                    info!("Invalid SQL detected, correcting: {}", diagnostic);
                    let corrected = self
                        .correct(&candidate.sql, &diagnostic, plan, retrieval)
                        .await?;

                    candidate.attempts.push(CorrectionAttempt {
                        prior_sql: candidate.sql.clone(),
                        diagnostic,
                        corrected_sql: corrected.clone(),
                    });
                    candidate.sql = corrected;
                }
            }
        }
    }

    /// One pass of the checks. `None` means the statement is clean.
    async fn inspect(
        &self,
        sql: &str,
        plan: &QueryPlan,
        retrieval: &RetrievalResult,
    ) -> Result<Option<String>> {
        // Syntax gate.
        let statements = match Parser::parse_sql(&GenericDialect {}, sql) {
            Ok(statements) if !statements.is_empty() => statements,
            Ok(_) => return Ok(Some("empty SQL statement".to_string())),
            Err(e) => return Ok(Some(format!("syntax error: {}", e))),
        };

        // Read-only gate. A write statement is never sent anywhere, dry run included.
        if let Some(problem) = read_only_violation(&statements) {
            return Ok(Some(problem));
        }

        // Structural rule gate (wildcards, joins, identifier grounding).
        match check_structural_rules(sql, plan, retrieval) {
            Ok(()) => {}
            Err(PipelineError::GenerationRuleViolation(diag))
            | Err(PipelineError::ValidationFailed(diag)) => return Ok(Some(diag)),
            Err(other) => return Err(other),
        }

        // Semantic gate: plan-only execution against live schema.
        match self.database.dry_run(sql).await? {
            DryRun::Ok => Ok(None),
            DryRun::Diagnostic(diag) => Ok(Some(format!("dry run failed: {}", diag))),
        }
    }

    async fn correct(
        &self,
        sql: &str,
        diagnostic: &str,
        plan: &QueryPlan,
        retrieval: &RetrievalResult,
    ) -> Result<String> {
        let plan_json = serde_json::to_string_pretty(plan)?;
        let prompt = CORRECTION_PROMPT
            .replace("{schema_context}", &retrieval.context_text())
            .replace("{plan}", &plan_json)
            .replace("{sql}", sql)
            .replace("{diagnostic}", diagnostic);

        let response = self
            .completion
            .complete(&PromptRequest::new(prompt, 0.1))
            .await?;

        let corrected = extract_sql(&response);
        if corrected.trim().is_empty() {
            return Err(PipelineError::MalformedCapabilityOutput(
                "corrector returned no SQL".to_string(),
            ));
        }
        Ok(corrected)
    }
}

fn read_only_violation(statements: &[Statement]) -> Option<String> {
    if statements.len() != 1 {
        return Some("expected exactly one SQL statement".to_string());
    }

    match &statements[0] {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(_) => None,
            _ => Some("only plain SELECT queries may be validated".to_string()),
        },
        _ => Some("statement is not a read-only query".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ExecutionResult;
    use crate::index::retriever::{RetrievalResult, ScoredChunk};
    use crate::index::SchemaChunk;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedCompletion {
        responses: Mutex<VecDeque<String>>,
    }

    impl ScriptedCompletion {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl Completion for ScriptedCompletion {
        async fn complete(&self, _request: &PromptRequest) -> Result<String> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| PipelineError::Unavailable("script exhausted".to_string()))
        }
    }

    /// Fake collaborator: statements containing a marker fail the dry run.
    struct FakeDatabase {
        failing_marker: Option<&'static str>,
    }

    #[async_trait]
    impl Database for FakeDatabase {
        async fn dry_run(&self, sql: &str) -> Result<DryRun> {
            if let Some(marker) = self.failing_marker {
                if sql.contains(marker) {
                    return Ok(DryRun::Diagnostic(format!("unknown column `{}`", marker)));
                }
            }
            Ok(DryRun::Ok)
        }

        async fn execute(&self, _sql: &str) -> Result<ExecutionResult> {
            panic!("execute must never be called from the validator");
        }
    }

    fn retrieval() -> RetrievalResult {
        RetrievalResult {
            chunks: vec![ScoredChunk {
                chunk: SchemaChunk {
                    id: "HCP".to_string(),
                    table: "HCP".to_string(),
                    columns: vec![
                        "id".to_string(),
                        "englishname".to_string(),
                        "isconsultant".to_string(),
                    ],
                    content: String::new(),
                    embedding: vec![],
                },
                score: 1.0,
            }],
        }
    }

    fn plan() -> QueryPlan {
        QueryPlan {
            tables: vec!["HCP".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn clean_candidate_validates_without_corrections() {
        let validator = Validator::new(
            Arc::new(ScriptedCompletion::new(vec![])),
            Arc::new(FakeDatabase { failing_marker: None }),
            2,
        );

        let mut candidate =
            SqlCandidate::new("SELECT englishname FROM HCP WHERE isconsultant = TRUE".to_string());
        validator
            .validate(&mut candidate, &plan(), &retrieval())
            .await
            .unwrap();

        assert_eq!(candidate.validity, Validity::Valid);
        assert!(!candidate.was_corrected());
    }

    #[tokio::test]
    async fn syntax_error_is_corrected_and_history_kept() {
        let validator = Validator::new(
            Arc::new(ScriptedCompletion::new(vec![
                "SELECT englishname FROM HCP WHERE isconsultant = TRUE;",
            ])),
            Arc::new(FakeDatabase { failing_marker: None }),
            2,
        );

        let mut candidate =
            SqlCandidate::new("SELEC englishname FROM HCP WHERE".to_string());
        validator
            .validate(&mut candidate, &plan(), &retrieval())
            .await
            .unwrap();

        assert_eq!(candidate.validity, Validity::Valid);
        assert_eq!(candidate.attempts.len(), 1);
        assert!(candidate.attempts[0].diagnostic.contains("syntax error"));
        assert_eq!(candidate.original_sql, "SELEC englishname FROM HCP WHERE");
    }

    #[tokio::test]
    async fn dry_run_diagnostic_drives_one_correction() {
        // `englsnhname` is not in the schema, so the structural gate flags it;
        // the corrector fixes the name using the plan context.
        let validator = Validator::new(
            Arc::new(ScriptedCompletion::new(vec![
                "SELECT englishname FROM HCP WHERE isconsultant = TRUE;",
            ])),
            Arc::new(FakeDatabase { failing_marker: None }),
            2,
        );

        let mut candidate =
            SqlCandidate::new("SELECT englsnhname FROM HCP WHERE isconsultant = TRUE".to_string());
        validator
            .validate(&mut candidate, &plan(), &retrieval())
            .await
            .unwrap();

        assert_eq!(candidate.validity, Validity::Valid);
        assert!(candidate.was_corrected());
        assert_eq!(candidate.attempts.len(), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_is_terminal_failure() {
        // The corrector keeps returning broken SQL; the loop must stop at 2.
        let validator = Validator::new(
            Arc::new(ScriptedCompletion::new(vec![
                "SELEC still broken",
                "SELEC broken again",
                "SELECT englishname FROM HCP", // never reached
            ])),
            Arc::new(FakeDatabase { failing_marker: None }),
            2,
        );

        let mut candidate = SqlCandidate::new("SELEC englishname FRM HCP".to_string());
        let err = validator
            .validate(&mut candidate, &plan(), &retrieval())
            .await
            .unwrap_err();

        assert_eq!(err.reason_code(), "correction_exhausted");
        assert_eq!(candidate.validity, Validity::Failed);
        assert_eq!(candidate.attempts.len(), 2);
    }

    #[tokio::test]
    async fn write_statement_never_reaches_dry_run() {
        struct PanickingDb;

        #[async_trait]
        impl Database for PanickingDb {
            async fn dry_run(&self, _sql: &str) -> Result<DryRun> {
                panic!("dry run must not see write statements");
            }
            async fn execute(&self, _sql: &str) -> Result<ExecutionResult> {
                panic!("execute must not be called");
            }
        }

        let validator = Validator::new(
            Arc::new(ScriptedCompletion::new(vec![])),
            Arc::new(PanickingDb),
            0,
        );

        let mut candidate = SqlCandidate::new("DROP TABLE HCP".to_string());
        let err = validator
            .validate(&mut candidate, &plan(), &retrieval())
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "correction_exhausted");
        assert_eq!(candidate.validity, Validity::Failed);
    }
}
