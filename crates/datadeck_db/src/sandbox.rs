//! Post-processing of fetched frames.
//!
//! External datasets may carry an expression that reshapes the fetched frame
//! before it reaches the caller. The expression runs in a throwaway
//! in-memory DuckDB that sees the frame as table `df` and nothing else.

use sqlparser::ast::Statement;
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::backend::DbConnection;
use crate::error::{CatalogError, Result};
use crate::frame::{load_table, DataFrame};

/// Name the frame is bound to inside the sandbox.
pub const FRAME_BINDING: &str = "df";

/// Evaluates a post-process expression against a frame.
pub trait PostProcessor: Send + Sync {
    fn apply(&self, expression: &str, frame: DataFrame) -> Result<DataFrame>;
}

/// Runs a single read-only SQL query over `df`.
///
/// The database has external access disabled, so the query cannot read or
/// write files, reach the network, or load extensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuckDbSandbox;

impl DuckDbSandbox {
    pub fn new() -> Self {
        Self
    }
}

impl PostProcessor for DuckDbSandbox {
    fn apply(&self, expression: &str, frame: DataFrame) -> Result<DataFrame> {
        ensure_single_query(expression)?;

        let config = duckdb::Config::default()
            .enable_external_access(false)
            .map_err(|e| CatalogError::PostProcess(format!("sandbox config: {}", e)))?;
        let raw = duckdb::Connection::open_in_memory_with_flags(config)
            .map_err(|e| CatalogError::PostProcess(format!("sandbox open: {}", e)))?;
        let conn = DbConnection::from_raw(raw);

        load_table(&conn, "main", FRAME_BINDING, &frame)?;
        conn.execute_batch("SET lock_configuration = true")?;

        let result = conn
            .query_frame(expression, &[])
            .map_err(|e| CatalogError::PostProcess(e.to_string()))?;
        debug!(
            rows_in = frame.num_rows(),
            rows_out = result.num_rows(),
            "Post-process applied"
        );
        Ok(result)
    }
}

/// Rejects every expression; for deployments without post-processing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPostProcessor;

impl PostProcessor for NoopPostProcessor {
    fn apply(&self, _expression: &str, _frame: DataFrame) -> Result<DataFrame> {
        Err(CatalogError::PostProcess(
            "post-processing is disabled".to_string(),
        ))
    }
}

fn ensure_single_query(expression: &str) -> Result<()> {
    let statements = Parser::parse_sql(&DuckDbDialect {}, expression)
        .map_err(|e| CatalogError::PostProcess(format!("cannot parse expression: {}", e)))?;
    match statements.as_slice() {
        [Statement::Query(_)] => Ok(()),
        [] => Err(CatalogError::PostProcess("expression is empty".to_string())),
        [_] => Err(CatalogError::PostProcess(
            "expression must be a read-only query".to_string(),
        )),
        _ => Err(CatalogError::PostProcess(
            "expression must be a single statement".to_string(),
        )),
    }
}
