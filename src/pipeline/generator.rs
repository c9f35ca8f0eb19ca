use crate::capability::{extract_sql, Completion, PromptRequest};
use crate::error::{PipelineError, Result};
use crate::index::retriever::RetrievalResult;
use crate::pipeline::planner::QueryPlan;
use serde::Serialize;
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, JoinConstraint,
    JoinOperator, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Validation status of a candidate. `Unknown` until the validator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Validity {
    Unknown,
    Valid,
    Failed,
}

/// One corrector iteration: what was wrong and what replaced it.
#[derive(Debug, Clone, Serialize)]
pub struct CorrectionAttempt {
    pub prior_sql: String,
    pub diagnostic: String,
    pub corrected_sql: String,
}

/// A generated SQL statement with its correction history. Mutated only by the
/// validator loop; attempts append monotonically and are never truncated.
#[derive(Debug, Clone, Serialize)]
pub struct SqlCandidate {
    pub sql: String,
    pub original_sql: String,
    pub validity: Validity,
    pub attempts: Vec<CorrectionAttempt>,
}

impl SqlCandidate {
    pub fn new(sql: String) -> Self {
        Self {
            original_sql: sql.clone(),
            sql,
            validity: Validity::Unknown,
            attempts: Vec::new(),
        }
    }

    pub fn was_corrected(&self) -> bool {
        !self.attempts.is_empty()
    }
}

const GENERATION_PROMPT: &str = r#"You are an expert SQL generator. Given a structured query plan, generate the exact SQL query.

Follow these rules:
- Use only the tables and columns listed in the schema, with their exact spelling and case.
- Use explicit JOIN ... ON clauses for every join in the plan. Never use comma joins.
- Never select all columns with * unless the plan sets select_all_columns.
- Escape single quotes inside string literals by doubling them.
- Apply the plan's filters, grouping and aggregations exactly; do not add or drop conditions.
- Output only a single valid SQL query, ending with a semicolon. No explanations, no markdown.

Schema:
{schema_context}

Query plan (JSON):
{plan}

SQL:"#;

/// Turns a grounded plan into a [`SqlCandidate`], enforcing the structural rule
/// set on the output text rather than trusting the prompt.
pub struct Generator {
    completion: Arc<dyn Completion>,
}

impl Generator {
    pub fn new(completion: Arc<dyn Completion>) -> Self {
        Self { completion }
    }

    pub async fn generate(
        &self,
        plan: &QueryPlan,
        retrieval: &RetrievalResult,
    ) -> Result<SqlCandidate> {
        let plan_json = serde_json::to_string_pretty(plan)?;
        let prompt = GENERATION_PROMPT
            .replace("{schema_context}", &retrieval.context_text())
            .replace("{plan}", &plan_json);

        let response = self
            .completion
            .complete(&PromptRequest::new(prompt, 0.1))
            .await?;

        let sql = extract_sql(&response);
        if sql.trim().is_empty() {
            return Err(PipelineError::MalformedCapabilityOutput(
                "generator returned no SQL".to_string(),
            ));
        }

        debug!("Generated SQL: {}", sql);
        info!("Initial SQL query generated");
        Ok(SqlCandidate::new(sql))
    }
}

/// Checks the deterministic rule set against the parsed statement.
///
/// Returns a diagnostic on the first violation; violations are correction
/// triggers, not user-visible errors.
pub fn check_structural_rules(
    sql: &str,
    plan: &QueryPlan,
    retrieval: &RetrievalResult,
) -> Result<()> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| PipelineError::ValidationFailed(e.to_string()))?;

    if statements.len() != 1 {
        return Err(PipelineError::GenerationRuleViolation(
            "expected exactly one SQL statement".to_string(),
        ));
    }

    let query = match &statements[0] {
        Statement::Query(query) => query,
        other => {
            return Err(PipelineError::GenerationRuleViolation(format!(
                "only SELECT queries are allowed, got: {}",
                statement_kind(other)
            )))
        }
    };

    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select.as_ref(),
        _ => {
            return Err(PipelineError::GenerationRuleViolation(
                "only plain SELECT queries are allowed (no UNION/EXCEPT/INTERSECT)".to_string(),
            ))
        }
    };

    check_projection(select, plan)?;
    check_joins(select)?;
    check_identifiers(query, retrieval)?;
    Ok(())
}

fn statement_kind(stmt: &Statement) -> &'static str {
    match stmt {
        Statement::Insert(_) => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete(_) => "DELETE",
        Statement::Drop { .. } => "DROP",
        _ => "a non-query statement",
    }
}

fn check_projection(select: &Select, plan: &QueryPlan) -> Result<()> {
    let has_wildcard = select.projection.iter().any(|item| {
        matches!(
            item,
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _)
        )
    });

    if has_wildcard && !plan.select_all_columns {
        return Err(PipelineError::GenerationRuleViolation(
            "unscoped wildcard projection, but the plan does not request all columns".to_string(),
        ));
    }
    Ok(())
}

fn check_joins(select: &Select) -> Result<()> {
    // sqlparser renders `FROM a, b` as multiple FROM entries: an implicit comma join.
    if select.from.len() > 1 {
        return Err(PipelineError::GenerationRuleViolation(
            "implicit comma join; use an explicit JOIN ... ON clause".to_string(),
        ));
    }

    for table in &select.from {
        for join in &table.joins {
            let constraint = match &join.join_operator {
                JoinOperator::Inner(c)
                | JoinOperator::LeftOuter(c)
                | JoinOperator::RightOuter(c)
                | JoinOperator::FullOuter(c) => c,
                JoinOperator::CrossJoin => {
                    return Err(PipelineError::GenerationRuleViolation(
                        "cross join without a condition".to_string(),
                    ))
                }
                _ => {
                    return Err(PipelineError::GenerationRuleViolation(
                        "unsupported join operator".to_string(),
                    ))
                }
            };

            match constraint {
                JoinConstraint::On(_) | JoinConstraint::Using(_) => {}
                JoinConstraint::Natural | JoinConstraint::None => {
                    return Err(PipelineError::GenerationRuleViolation(
                        "join without an explicit ON/USING condition".to_string(),
                    ))
                }
            }
        }
    }
    Ok(())
}

/// Every table and column identifier must match the retrieved schema's stored
/// names exactly, case included. Recurses into derived-table subqueries.
fn check_identifiers(query: &Query, retrieval: &RetrievalResult) -> Result<()> {
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select.as_ref(),
        _ => {
            return Err(PipelineError::GenerationRuleViolation(
                "only plain SELECT queries are allowed (no UNION/EXCEPT/INTERSECT)".to_string(),
            ))
        }
    };

    let known_tables: BTreeSet<&str> = retrieval
        .chunks
        .iter()
        .map(|s| s.chunk.table.as_str())
        .collect();
    let known_columns: BTreeSet<String> = retrieval.column_names();

    let mut aliases: BTreeSet<String> = BTreeSet::new();
    for table in &select.from {
        collect_table_factor(&table.relation, retrieval, &known_tables, &mut aliases)?;
        for join in &table.joins {
            collect_table_factor(&join.relation, retrieval, &known_tables, &mut aliases)?;
        }
    }

    let mut columns: BTreeSet<String> = BTreeSet::new();
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                collect_columns(expr, &aliases, &mut columns)
            }
            _ => {}
        }
    }
    if let Some(selection) = &select.selection {
        collect_columns(selection, &aliases, &mut columns);
    }
    if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
        for expr in exprs {
            collect_columns(expr, &aliases, &mut columns);
        }
    }
    if let Some(having) = &select.having {
        collect_columns(having, &aliases, &mut columns);
    }
    // ORDER BY hangs off the query, not the SELECT body.
    if let Some(order_by) = &query.order_by {
        for entry in &order_by.exprs {
            collect_columns(&entry.expr, &aliases, &mut columns);
        }
    }

    for column in &columns {
        if !known_columns.contains(column) {
            return Err(PipelineError::GenerationRuleViolation(format!(
                "column `{}` does not match any retrieved schema column (case-sensitive)",
                column
            )));
        }
    }
    Ok(())
}

fn collect_table_factor(
    factor: &TableFactor,
    retrieval: &RetrievalResult,
    known_tables: &BTreeSet<&str>,
    aliases: &mut BTreeSet<String>,
) -> Result<()> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let table_name = name
                .0
                .last()
                .map(|ident| ident.value.clone())
                .unwrap_or_default();

            if !known_tables.contains(table_name.as_str()) {
                return Err(PipelineError::GenerationRuleViolation(format!(
                    "table `{}` does not match any retrieved schema table (case-sensitive)",
                    table_name
                )));
            }

            // Table names and aliases both qualify columns, so track them together.
            aliases.insert(table_name);
            if let Some(alias) = alias {
                aliases.insert(alias.name.value.clone());
            }
        }
        TableFactor::Derived {
            subquery, alias, ..
        } => {
            check_identifiers(subquery, retrieval)?;
            if let Some(alias) = alias {
                aliases.insert(alias.name.value.clone());
            }
        }
        _ => {}
    }
    Ok(())
}

/// Walks an expression collecting column identifiers, qualified or bare.
fn collect_columns(expr: &Expr, aliases: &BTreeSet<String>, columns: &mut BTreeSet<String>) {
    match expr {
        Expr::Identifier(ident) => {
            columns.insert(ident.value.clone());
        }
        Expr::CompoundIdentifier(parts) => {
            // The last part is the column; the qualifier is a table or alias and
            // was already checked while walking the FROM clause.
            if let Some(column) = parts.last() {
                columns.insert(column.value.clone());
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_columns(left, aliases, columns);
            collect_columns(right, aliases, columns);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::IsNull(expr)
        | Expr::IsNotNull(expr) | Expr::IsTrue(expr) | Expr::IsFalse(expr) => {
            collect_columns(expr, aliases, columns);
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_columns(expr, aliases, columns);
            collect_columns(low, aliases, columns);
            collect_columns(high, aliases, columns);
        }
        Expr::InList { expr, list, .. } => {
            collect_columns(expr, aliases, columns);
            for item in list {
                collect_columns(item, aliases, columns);
            }
        }
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            collect_columns(expr, aliases, columns);
            collect_columns(pattern, aliases, columns);
        }
        Expr::Cast { expr, .. } => collect_columns(expr, aliases, columns),
        Expr::Function(function) => {
            if let FunctionArguments::List(list) = &function.args {
                for arg in &list.args {
                    if let FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) = arg {
                        collect_columns(expr, aliases, columns);
                    }
                }
            }
        }
        // Literals and anything else carry no column references we police.
        _ => {}
    }
}
