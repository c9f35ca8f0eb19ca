use crate::capability::{Completion, PromptRequest};
use crate::db::ExecutionResult;
use crate::error::{PipelineError, Result};
use crate::pipeline::generator::{SqlCandidate, Validity};
use std::sync::Arc;
use tracing::warn;

/// The user-facing answer: prose, an optional display table, and caveats such
/// as truncation notes.
#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub table: Option<String>,
    pub caveats: Vec<String>,
}

const NO_RESULTS_PROMPT: &str = r#"The user asked: "{question}"

No data was found matching the request.

Provide a brief response (2-3 sentences max) that:
1. States clearly that no results were found
2. Gives 2-3 practical suggestions for what the user can modify or try differently
3. Does not mention SQL queries, database tables, or any technical implementation details

Response:"#;

const RESULTS_PROMPT: &str = r#"User asked: "{question}"

Found {row_count} records. Here's a sample:

{data_sample}

1. Answer the user's question in simple, natural language. Be brief and direct.
2. Summarize only values present in the data above; never invent numbers or names.
3. Use language a business user would understand.
4. Keep the tone professional and helpful.

Response:"#;

const SAMPLE_ROWS: usize = 10;

/// Turns executed rows into a natural-language answer plus a display table.
/// No re-querying and no schema access: everything comes from its inputs.
pub struct Formatter {
    completion: Arc<dyn Completion>,
}

impl Formatter {
    pub fn new(completion: Arc<dyn Completion>) -> Self {
        Self { completion }
    }

    pub async fn format(
        &self,
        question: &str,
        candidate: &SqlCandidate,
        result: &ExecutionResult,
    ) -> Result<Answer> {
        // Only validated statements ever reach formatting.
        if candidate.validity != Validity::Valid {
            return Err(PipelineError::ValidationFailed(
                "attempted to format results for an unvalidated candidate".to_string(),
            ));
        }

        let mut caveats = Vec::new();
        if result.truncated {
            caveats.push(format!(
                "Results truncated to the first {} of {} rows.",
                result.rows.len(),
                result.row_count
            ));
        }

        if result.row_count == 0 {
            let prompt = NO_RESULTS_PROMPT.replace("{question}", question);
            let text = match self.completion.complete(&PromptRequest::new(prompt, 0.3)).await {
                // Whatever the prose says, the no-results statement must be explicit.
                Ok(text) if text.to_lowercase().contains("no results")
                    || text.to_lowercase().contains("no data") => text.trim().to_string(),
                Ok(_) | Err(_) => {
                    "No results were found for this question. Try broadening the \
                     conditions or checking the spelling of names."
                        .to_string()
                }
            };

            return Ok(Answer {
                text,
                table: None,
                caveats,
            });
        }

        let sample = data_sample(result);
        let prompt = RESULTS_PROMPT
            .replace("{question}", question)
            .replace("{row_count}", &result.row_count.to_string())
            .replace("{data_sample}", &sample);

        let text = match self.completion.complete(&PromptRequest::new(prompt, 0.2)).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                // Prose is a nicety; the table already holds the facts.
                warn!("Answer phrasing unavailable, returning table only: {}", e);
                caveats.push("A prose summary could not be generated.".to_string());
                format!("Found {} matching rows.", result.row_count)
            }
        };

        Ok(Answer {
            text,
            table: Some(render_table(result)),
            caveats,
        })
    }
}

/// Plain-text table with column-width padding.
pub fn render_table(result: &ExecutionResult) -> String {
    if result.rows.is_empty() {
        return "No data found.".to_string();
    }

    let mut widths: Vec<usize> = result.columns.iter().map(|c| c.len()).collect();
    for row in &result.rows {
        for (i, value) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(value.len());
            }
        }
    }

    let header = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{:<width$}", c, width = widths[i]))
        .collect::<Vec<_>>()
        .join(" | ");
    let separator = "-".repeat(header.len());

    let mut lines = vec![header, separator];
    for row in &result.rows {
        let line = row
            .iter()
            .enumerate()
            .map(|(i, v)| format!("{:<width$}", v, width = widths.get(i).copied().unwrap_or(0)))
            .collect::<Vec<_>>()
            .join(" | ");
        lines.push(line);
    }

    lines.join("\n")
}

/// Capped sample of the rows for prompt consumption, with a marker for rows
/// beyond the sample.
fn data_sample(result: &ExecutionResult) -> String {
    let mut lines = Vec::new();
    lines.push(result.columns.join(" | "));
    lines.push("-".repeat(lines[0].len()));

    for row in result.rows.iter().take(SAMPLE_ROWS) {
        lines.push(row.join(" | "));
    }

    let sampled = result.rows.len().min(SAMPLE_ROWS);
    if result.row_count > sampled {
        lines.push(format!("... and {} more records", result.row_count - sampled));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use async_trait::async_trait;

    struct Scripted(&'static str);

    #[async_trait]
    impl Completion for Scripted {
        async fn complete(&self, _request: &PromptRequest) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Down;

    #[async_trait]
    impl Completion for Down {
        async fn complete(&self, _request: &PromptRequest) -> Result<String> {
            Err(PipelineError::Unavailable("offline".to_string()))
        }
    }

    fn valid_candidate() -> SqlCandidate {
        let mut candidate = SqlCandidate::new("SELECT englishname FROM HCP".to_string());
        candidate.validity = Validity::Valid;
        candidate
    }

    fn result(rows: Vec<Vec<&str>>, total: usize) -> ExecutionResult {
        ExecutionResult {
            columns: vec!["englishname".to_string(), "Country".to_string()],
            rows: rows
                .into_iter()
                .map(|r| r.into_iter().map(String::from).collect())
                .collect(),
            row_count: total,
            truncated: false,
        }
    }

    #[tokio::test]
    async fn empty_result_states_no_results_explicitly() {
        let formatter = Formatter::new(Arc::new(Scripted("Sure, here is a table:")));
        let answer = formatter
            .format("Which HCPs are in Mars?", &valid_candidate(), &result(vec![], 0))
            .await
            .unwrap();

        let lower = answer.text.to_lowercase();
        assert!(lower.contains("no results") || lower.contains("no data"));
        assert!(answer.table.is_none());
    }

    #[tokio::test]
    async fn rows_produce_prose_and_table() {
        let formatter = Formatter::new(Arc::new(Scripted(
            "Two consultants were found: Dr. Ahmed in Egypt and Dr. Mona in Egypt.",
        )));
        let answer = formatter
            .format(
                "Show all consultants",
                &valid_candidate(),
                &result(vec![vec!["Dr. Ahmed", "Egypt"], vec!["Dr. Mona", "Egypt"]], 2),
            )
            .await
            .unwrap();

        assert!(answer.text.contains("Dr. Ahmed"));
        let table = answer.table.unwrap();
        assert!(table.starts_with("englishname"));
        assert!(table.contains("Dr. Mona"));
        assert!(answer.caveats.is_empty());
    }

    #[tokio::test]
    async fn prose_outage_still_returns_table() {
        let formatter = Formatter::new(Arc::new(Down));
        let answer = formatter
            .format(
                "Show all consultants",
                &valid_candidate(),
                &result(vec![vec!["Dr. Ahmed", "Egypt"]], 1),
            )
            .await
            .unwrap();

        assert!(answer.table.is_some());
        assert_eq!(answer.caveats.len(), 1);
    }

    #[tokio::test]
    async fn truncation_is_reported_as_caveat() {
        let mut truncated = result(vec![vec!["Dr. Ahmed", "Egypt"]], 500);
        truncated.truncated = true;

        let formatter = Formatter::new(Arc::new(Scripted("Many consultants were found.")));
        let answer = formatter
            .format("Show all consultants", &valid_candidate(), &truncated)
            .await
            .unwrap();
        assert!(answer.caveats[0].contains("truncated"));
    }

    #[tokio::test]
    async fn unvalidated_candidate_is_refused() {
        let formatter = Formatter::new(Arc::new(Scripted("text")));
        let candidate = SqlCandidate::new("SELECT 1".to_string());
        let err = formatter
            .format("anything", &candidate, &result(vec![], 0))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "validation_failed");
    }

    #[test]
    fn render_table_pads_columns() {
        let table = render_table(&result(vec![vec!["Dr. Ahmed", "Egypt"]], 1));
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("englishname"));
        assert_eq!(lines[1].chars().collect::<Vec<_>>()[0], '-');
    }
}
