use crate::capability::{parse_json_response, Completion, PromptRequest};
use crate::error::{PipelineError, Result};
use crate::index::retriever::RetrievalResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// One explicit join between two retrieved tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinSpec {
    pub left_table: String,
    pub right_table: String,
    /// Join condition naming both sides, e.g. `MedicalReps.HCPId = HCP.id`.
    pub condition: String,
}

/// One filter predicate extracted from the question's stated conditions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterSpec {
    pub column: String,
    /// Operator and operand, e.g. `= 'Egypt'` or `> '2025-07-01'`.
    pub condition: String,
}

/// Structured query plan: tables, joins, filters, grouping and metrics, with no
/// SQL text yet. Owned exclusively by the request that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryPlan {
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub joins: Vec<JoinSpec>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Aggregations like `COUNT(InteractionId)`; empty for plain projections.
    #[serde(default)]
    pub metrics: Vec<String>,
    /// Columns to project; ignored when `select_all_columns` is set.
    #[serde(default)]
    pub select_columns: Vec<String>,
    #[serde(default)]
    pub select_all_columns: bool,
    /// Set when the question has an unresolved quantifier the model could not
    /// pin to a concrete condition.
    #[serde(default)]
    pub clarification: Option<String>,
}

const PLANNING_PROMPT: &str = r#"You are an expert SQL reasoning assistant. Analyze the user's question and the database schema, then produce a structured query plan as a JSON object.

Think through:
- Which tables and columns are involved?
- What filters, conditions, and joins are required?
- What aggregation, grouping, ordering, or limits are necessary?

Rules:
- Use ONLY tables and columns that appear in the schema below. Never invent names.
- Every join must name both tables and its condition. Never plan an implicit cross join.
- Filters must come from conditions the question actually states.
- If the question uses a vague quantifier (like "recent" or "top") that you cannot resolve to a concrete stated condition, set "clarification" to a short question for the user and leave the rest minimal. Do not guess.
- Set "select_all_columns" to true only when the question explicitly asks for everything about the rows.

Output only a JSON object with this shape (no prose, no markdown):
{
  "tables": ["HCP"],
  "joins": [{"left_table": "MedicalReps", "right_table": "HCP", "condition": "MedicalReps.HCPId = HCP.id"}],
  "filters": [{"column": "isconsultant", "condition": "= TRUE"}],
  "group_by": [],
  "metrics": [],
  "select_columns": ["englishname"],
  "select_all_columns": false,
  "clarification": null
}

Schema:
{schema_context}

User question: {question}

JSON plan:"#;

/// Turns (question, retrieved schema) into a grounded [`QueryPlan`].
pub struct Planner {
    completion: Arc<dyn Completion>,
}

impl Planner {
    pub fn new(completion: Arc<dyn Completion>) -> Self {
        Self { completion }
    }

    pub async fn plan(&self, question: &str, retrieval: &RetrievalResult) -> Result<QueryPlan> {
        let prompt = PLANNING_PROMPT
            .replace("{schema_context}", &retrieval.context_text())
            .replace("{question}", question);

        let response = self
            .completion
            .complete(&PromptRequest::new(prompt, 0.3))
            .await?;
        debug!("Planner raw response: {}", response);

        let mut plan: QueryPlan = parse_json_response(&response)?;

        if let Some(clarification) = plan.clarification.take() {
            if !clarification.trim().is_empty() {
                return Err(PipelineError::PlanningAmbiguous(clarification));
            }
        }

        if plan.tables.is_empty() {
            return Err(PipelineError::PlanningAmbiguous(
                "the question does not map to any retrieved table".to_string(),
            ));
        }

        self.ground(&mut plan, retrieval)?;

        info!(
            "Planned query over tables {:?} with {} joins, {} filters",
            plan.tables,
            plan.joins.len(),
            plan.filters.len()
        );
        Ok(plan)
    }

    /// Grounding guarantee: every schema element the plan references must exist
    /// in the retrieval context. Names are canonicalized to the stored case so
    /// the generator can rely on them verbatim.
    fn ground(&self, plan: &mut QueryPlan, retrieval: &RetrievalResult) -> Result<()> {
        for table in plan.tables.iter_mut() {
            *table = retrieval.resolve_table(table).ok_or_else(|| {
                PipelineError::PlanningAmbiguous(format!(
                    "the plan references table `{}` which is not in the retrieved schema",
                    table
                ))
            })?;
        }

        for join in plan.joins.iter_mut() {
            join.left_table = retrieval.resolve_table(&join.left_table).ok_or_else(|| {
                PipelineError::PlanningAmbiguous(format!(
                    "join references unknown table `{}`",
                    join.left_table
                ))
            })?;
            join.right_table = retrieval.resolve_table(&join.right_table).ok_or_else(|| {
                PipelineError::PlanningAmbiguous(format!(
                    "join references unknown table `{}`",
                    join.right_table
                ))
            })?;
        }

        for filter in plan.filters.iter_mut() {
            filter.column = retrieval.resolve_column(&filter.column).ok_or_else(|| {
                PipelineError::PlanningAmbiguous(format!(
                    "filter references unknown column `{}`",
                    filter.column
                ))
            })?;
        }

        for column in plan.group_by.iter_mut().chain(plan.select_columns.iter_mut()) {
            *column = retrieval.resolve_column(column).ok_or_else(|| {
                PipelineError::PlanningAmbiguous(format!(
                    "the plan references column `{}` which is not in the retrieved schema",
                    column
                ))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::retriever::{RetrievalResult, ScoredChunk};
    use crate::index::SchemaChunk;
    use async_trait::async_trait;

    struct Scripted(String);

    #[async_trait]
    impl Completion for Scripted {
        async fn complete(&self, _request: &PromptRequest) -> Result<String> {
            Ok(self.0.clone())
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
                        "Country".to_string(),
                    ],
                    content: "TABLE: HCP".to_string(),
                    embedding: vec![1.0],
                },
                score: 0.9,
            }],
        }
    }

    #[tokio::test]
    async fn plan_parses_and_canonicalizes_names() {
        let response = r#"{"tables": ["hcp"], "joins": [], "filters": [{"column": "ISCONSULTANT", "condition": "= TRUE"}], "group_by": [], "metrics": [], "select_columns": ["englishname"], "select_all_columns": false, "clarification": null}"#;
        let planner = Planner::new(Arc::new(Scripted(response.to_string())));

        let plan = planner.plan("Show all consultants", &retrieval()).await.unwrap();
        assert_eq!(plan.tables, vec!["HCP"]);
        assert_eq!(plan.filters[0].column, "isconsultant");
    }

    #[tokio::test]
    async fn hallucinated_table_fails_grounding() {
        let response = r#"{"tables": ["Prescriptions"], "select_columns": []}"#;
        let planner = Planner::new(Arc::new(Scripted(response.to_string())));

        let err = planner.plan("Show prescriptions", &retrieval()).await.unwrap_err();
        assert_eq!(err.reason_code(), "planning_ambiguous");
    }

    #[tokio::test]
    async fn clarification_surfaces_as_ambiguity() {
        let response = r#"{"tables": ["HCP"], "clarification": "What time range does 'recent' mean?"}"#;
        let planner = Planner::new(Arc::new(Scripted(response.to_string())));

        let err = planner.plan("Show recent consultants", &retrieval()).await.unwrap_err();
        match err {
            PipelineError::PlanningAmbiguous(msg) => assert!(msg.contains("recent")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn malformed_plan_json_is_rejected() {
        let planner = Planner::new(Arc::new(Scripted("SELECT * FROM HCP".to_string())));
        let err = planner.plan("Show all consultants", &retrieval()).await.unwrap_err();
        assert_eq!(err.reason_code(), "malformed_capability_output");
    }
}
