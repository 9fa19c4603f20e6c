//! Query middleware: runs SQL against the embedded store and keeps the
//! catalog's hit/update counters.
//!
//! Counter increments race when several workers hit the same rows. A
//! transaction conflict on an increment is dropped (the count is best-effort);
//! any other failure propagates.

use std::collections::BTreeSet;

use chrono::Utc;
use tracing::debug;

use crate::backend::{BackendError, DbConnection, DbValue};
use crate::error::Result;
use crate::frame::{DataFrame, STAGE_PREFIX};
use crate::references::find_referenced_tables;
use crate::schema::{CATALOG_TABLE, DATASETS_SCHEMA};
use crate::DatadeckDb;

/// Dashboard bookkeeping tables that never count as datasets.
pub const SYSTEM_TABLES: [&str; 4] = [
    "current_notebook_id",
    "has_onboarded",
    "notebooks",
    "notebook_versions",
];

/// LIKE pattern of the client cache namespace.
pub const CLIENT_CACHE_PATTERN: &str = "mdClientCache_%";

#[derive(Debug, Clone, Copy)]
enum Counter {
    Hits,
    Updates,
}

impl Counter {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Hits => "hits",
            Self::Updates => "updates",
        }
    }

    fn assignments(&self) -> &'static str {
        match self {
            Self::Hits => "hits = hits + 1, last_hit = ?",
            Self::Updates => "updates = updates + 1, updated = ?",
        }
    }
}

impl DatadeckDb {
    // ========================================================================
    // Middleware Operations
    // ========================================================================

    /// Materialized dataset tables, excluding system and cache tables.
    pub fn available_local_tables(&self, conn: Option<&DbConnection>) -> Result<Vec<String>> {
        self.with_conn(conn, available_local_tables)
    }

    /// Run `sql` and return its result, first counting a hit on every
    /// dataset the text mentions unless `skip_logging` is set.
    pub fn execute_and_log(
        &self,
        sql: &str,
        conn: Option<&DbConnection>,
        skip_logging: bool,
    ) -> Result<DataFrame> {
        self.with_conn(conn, |conn| {
            if !skip_logging {
                let tables = available_local_tables(conn)?;
                let referenced = find_referenced_tables(sql, &tables);
                if !referenced.is_empty() {
                    bump(conn, Counter::Hits, &referenced)?;
                }
            }
            Ok(conn.query_frame(sql, &[])?)
        })
    }

    /// Count one hit on each named catalog entry.
    ///
    /// Returns `false` when the increment lost a transaction conflict and was
    /// dropped. Names without a catalog row are ignored.
    pub fn log_table_usage<S: AsRef<str>>(
        &self,
        table_names: &[S],
        conn: Option<&DbConnection>,
    ) -> Result<bool> {
        if table_names.is_empty() {
            return Ok(true);
        }
        self.with_conn(conn, |conn| bump(conn, Counter::Hits, table_names))
    }

    /// Count one update on each named catalog entry.
    ///
    /// Same conflict policy as [`DatadeckDb::log_table_usage`].
    pub fn log_table_update<S: AsRef<str>>(
        &self,
        table_names: &[S],
        conn: Option<&DbConnection>,
    ) -> Result<bool> {
        if table_names.is_empty() {
            return Ok(true);
        }
        self.with_conn(conn, |conn| bump(conn, Counter::Updates, table_names))
    }
}

pub(crate) fn available_local_tables(conn: &DbConnection) -> Result<Vec<String>> {
    let placeholders = vec!["?"; SYSTEM_TABLES.len()].join(", ");
    let sql = format!(
        "SELECT table_name FROM duckdb_tables() \
         WHERE database_name = current_database() AND schema_name = ? \
         AND table_name NOT IN ({}) \
         AND table_name NOT LIKE ? \
         AND NOT starts_with(table_name, ?) \
         ORDER BY table_name",
        placeholders
    );

    let mut params = vec![DbValue::from(DATASETS_SCHEMA)];
    params.extend(SYSTEM_TABLES.iter().map(|t| DbValue::from(*t)));
    params.push(DbValue::from(CLIENT_CACHE_PATTERN));
    params.push(DbValue::from(STAGE_PREFIX));

    let rows = conn.query_all(&sql, &params)?;
    let mut names = Vec::with_capacity(rows.len());
    for row in &rows {
        names.push(row.get::<String>(0)?);
    }
    Ok(names)
}

/// Increment `counter` once for each distinct name in one statement.
fn bump<S: AsRef<str>>(conn: &DbConnection, counter: Counter, table_names: &[S]) -> Result<bool> {
    let names: BTreeSet<&str> = table_names.iter().map(|n| n.as_ref()).collect();
    if names.is_empty() {
        return Ok(true);
    }

    let placeholders = vec!["?"; names.len()].join(", ");
    let sql = format!(
        "UPDATE {} SET {} WHERE table_name IN ({})",
        CATALOG_TABLE,
        counter.assignments(),
        placeholders
    );
    let mut params = Vec::with_capacity(names.len() + 1);
    params.push(DbValue::from(Utc::now()));
    params.extend(names.iter().map(|n| DbValue::from(*n)));

    match conn.execute(&sql, &params) {
        Ok(rows) => {
            debug!(counter = counter.as_str(), tables = ?names, rows, "Catalog counters bumped");
            Ok(true)
        }
        Err(err) => swallow_conflict(err, counter, &names),
    }
}

fn swallow_conflict(err: BackendError, counter: Counter, names: &BTreeSet<&str>) -> Result<bool> {
    if err.is_conflict() {
        debug!(
            counter = counter.as_str(),
            tables = ?names,
            error = %err,
            "Dropped counter increment after transaction conflict"
        );
        Ok(false)
    } else {
        Err(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::types::CatalogUpdate;

    fn db_with_tables(names: &[&str]) -> DatadeckDb {
        let db = DatadeckDb::open_in_memory(Default::default()).unwrap();
        let conn = db.connect().unwrap();
        for name in names {
            conn.execute_batch(&format!("CREATE TABLE datasets.\"{}\" (id BIGINT)", name))
                .unwrap();
            catalog::upsert(&conn, name, &CatalogUpdate::new()).unwrap();
        }
        db
    }

    #[test]
    fn test_available_tables_skip_system_and_cache() {
        let db = db_with_tables(&["iris", "notebooks", "mdClientCache_abc", "economics"]);
        assert_eq!(
            db.available_local_tables(None).unwrap(),
            vec!["economics", "iris"]
        );
    }

    #[test]
    fn test_empty_name_list_is_noop() {
        let db = db_with_tables(&[]);
        let none: Vec<String> = Vec::new();
        assert!(db.log_table_usage(&none, None).unwrap());
        assert!(db.log_table_update(&none, None).unwrap());
    }

    #[test]
    fn test_update_counter_and_timestamp() {
        let db = db_with_tables(&["iris"]);
        let before = db.catalog_get("iris", None).unwrap().unwrap();
        assert!(db.log_table_update(&["iris", "iris"], None).unwrap());

        let after = db.catalog_get("iris", None).unwrap().unwrap();
        assert_eq!(after.updates, before.updates + 1);
        assert!(after.updated >= before.updated);
        assert_eq!(after.hits, 0);
    }

    #[test]
    fn test_skip_logging_leaves_counters() {
        let db = db_with_tables(&["iris"]);
        let frame = db
            .execute_and_log("SELECT * FROM iris", None, true)
            .unwrap();
        assert_eq!(frame.num_rows(), 0);
        assert_eq!(db.catalog_get("iris", None).unwrap().unwrap().hits, 0);
    }

    #[test]
    fn test_query_error_propagates() {
        let db = db_with_tables(&["iris"]);
        assert!(db
            .execute_and_log("SELECT * FROM no_such_table", None, false)
            .is_err());
    }
}
