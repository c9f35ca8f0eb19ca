use crate::config::DatabaseConfig;
use crate::db::{Database, DryRun, ExecutionResult};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use duckdb::types::Value;
use duckdb::Connection;
use r2d2::{ManageConnection, Pool};
use tracing::{debug, info};

/// Renders a typed DuckDB value for display. Variants without a natural
/// text form fall back to their Debug output.
fn render_value(value: Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::TinyInt(v) => v.to_string(),
        Value::SmallInt(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::BigInt(v) => v.to_string(),
        Value::HugeInt(v) => v.to_string(),
        Value::UTinyInt(v) => v.to_string(),
        Value::USmallInt(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::UBigInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Decimal(v) => v.to_string(),
        Value::Text(s) | Value::Enum(s) => s,
        Value::Blob(b) => format!("<{} bytes>", b.len()),
        other => format!("{:?}", other),
    }
}

pub struct DuckDbConnectionManager {
    connection_string: String,
}

impl DuckDbConnectionManager {
    pub fn new(connection_string: String) -> Self {
        Self { connection_string }
    }
}

impl ManageConnection for DuckDbConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        Connection::open(&self.connection_string)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.execute("SELECT 1", [])?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// DuckDB-backed collaborator: EXPLAIN for dry runs, prepared SELECTs for
/// execution, rows rendered to strings and capped at the display limit.
pub struct DuckDbDatabase {
    pool: Pool<DuckDbConnectionManager>,
    max_display_rows: usize,
}

impl DuckDbDatabase {
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        info!(
            "Initializing DuckDB connection pool for {}",
            config.connection_string
        );
        let manager = DuckDbConnectionManager::new(config.connection_string.clone());
        let pool = Pool::builder()
            .max_size(config.pool_size as u32)
            .build(manager)
            .map_err(|e| PipelineError::Unavailable(e.to_string()))?;

        Ok(Self {
            pool,
            max_display_rows: config.max_display_rows,
        })
    }
}

#[async_trait]
impl Database for DuckDbDatabase {
    async fn dry_run(&self, sql: &str) -> Result<DryRun> {
        let pool = self.pool.clone();
        let explain_sql = format!("EXPLAIN {}", sql);
        debug!("Dry-running statement: {}", explain_sql);

        // DuckDB connections are not Sync; keep all driver work on a blocking thread.
        tokio::task::spawn_blocking(move || -> Result<DryRun> {
            let conn = pool
                .get()
                .map_err(|e| PipelineError::Unavailable(e.to_string()))?;

            let mut stmt = match conn.prepare(&explain_sql) {
                Ok(stmt) => stmt,
                Err(e) => return Ok(DryRun::Diagnostic(e.to_string())),
            };
            match stmt.query([]) {
                Ok(mut rows) => {
                    // Drain the plan rows; we only care that planning succeeded.
                    while let Ok(Some(_)) = rows.next() {}
                    Ok(DryRun::Ok)
                }
                Err(e) => Ok(DryRun::Diagnostic(e.to_string())),
            }
        })
        .await
        .map_err(|e| PipelineError::ExecutionError(e.to_string()))?
    }

    async fn execute(&self, sql: &str) -> Result<ExecutionResult> {
        let trimmed = sql.trim_start().to_uppercase();
        if !(trimmed.starts_with("SELECT") || trimmed.starts_with("WITH")) {
            return Err(PipelineError::ExecutionError(
                "refusing to execute a non-SELECT statement".to_string(),
            ));
        }

        let pool = self.pool.clone();
        let sql = sql.to_string();
        let max_rows = self.max_display_rows;

        tokio::task::spawn_blocking(move || -> Result<ExecutionResult> {
            let conn = pool
                .get()
                .map_err(|e| PipelineError::Unavailable(e.to_string()))?;

            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| PipelineError::ExecutionError(e.to_string()))?;

            let mut rows = stmt
                .query([])
                .map_err(|e| PipelineError::ExecutionError(e.to_string()))?;

            // Column metadata is only available once the statement has run,
            // so it has to be read back through the rows handle.
            let (column_count, columns) = match rows.as_ref() {
                Some(executed) => (executed.column_count(), executed.column_names()),
                None => (0, Vec::new()),
            };

            let mut rendered: Vec<Vec<String>> = Vec::new();
            let mut row_count = 0usize;
            while let Some(row) = rows
                .next()
                .map_err(|e| PipelineError::ExecutionError(e.to_string()))?
            {
                row_count += 1;
                if rendered.len() >= max_rows {
                    continue;
                }

                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    let value = match row.get::<_, Value>(i) {
                        Ok(value) => render_value(value),
                        Err(_) => "?".to_string(),
                    };
                    values.push(value);
                }
                rendered.push(values);
            }

            let truncated = row_count > rendered.len();
            info!("Query returned {} rows (kept {})", row_count, rendered.len());

            Ok(ExecutionResult {
                columns,
                rows: rendered,
                row_count,
                truncated,
            })
        })
        .await
        .map_err(|e| PipelineError::ExecutionError(e.to_string()))?
    }
}
