pub mod duckdb;

use crate::error::Result;
use async_trait::async_trait;

/// Outcome of a non-mutating semantic check of a statement against live schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DryRun {
    Ok,
    /// The statement references unknown tables/columns or has a type problem;
    /// carries the engine diagnostic for the corrector.
    Diagnostic(String),
}

/// Read-only result rows as handed to the formatter.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub row_count: usize,
    /// True when rows were cut to the display limit.
    pub truncated: bool,
}

/// The database collaborator. The pipeline only ever submits read-only
/// statements; `dry_run` must not touch data.
#[async_trait]
pub trait Database: Send + Sync {
    async fn dry_run(&self, sql: &str) -> Result<DryRun>;
    async fn execute(&self, sql: &str) -> Result<ExecutionResult>;
}
