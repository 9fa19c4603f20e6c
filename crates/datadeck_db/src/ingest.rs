//! Ingestion: materialized datasets and external (pseudo) registrations.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::backend::DbConnection;
use crate::catalog;
use crate::definitions::{definition_files, DatasetDefinition};
use crate::error::{CatalogError, Result};
use crate::frame::{materialize, DataFrame, STAGE_PREFIX};
use crate::types::{ExternalSource, TableMeta, TableSource};
use crate::DatadeckDb;

/// A definition file that was registered.
#[derive(Debug, Clone, Serialize)]
pub struct IngestSuccess {
    pub path: PathBuf,
    pub table_name: String,
}

/// A definition file that was rejected, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct IngestFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of a batch registration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub succeeded: Vec<IngestSuccess>,
    pub failed: Vec<IngestFailure>,
}

impl IngestReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Reject names that cannot be a dataset.
pub fn validate_table_name(table_name: &str) -> Result<()> {
    if table_name.trim().is_empty() {
        return Err(CatalogError::validation("table name must not be empty"));
    }
    if table_name.trim() != table_name {
        return Err(CatalogError::validation(format!(
            "table name '{}' has leading or trailing whitespace",
            table_name
        )));
    }
    if table_name.chars().any(char::is_control) {
        return Err(CatalogError::validation(
            "table name must not contain control characters",
        ));
    }
    if table_name.starts_with(STAGE_PREFIX) {
        return Err(CatalogError::validation(format!(
            "table names starting with '{}' are reserved",
            STAGE_PREFIX
        )));
    }
    Ok(())
}

impl DatadeckDb {
    // ========================================================================
    // Ingestion Operations
    // ========================================================================

    /// Materialize `frame` as `datasets.<table_name>` and record it in the
    /// catalog, replacing earlier contents of the same name.
    ///
    /// Returns the number of rows written.
    pub fn ingest(
        &self,
        frame: &DataFrame,
        table_name: &str,
        meta: TableMeta,
        conn: Option<&DbConnection>,
    ) -> Result<u64> {
        validate_table_name(table_name)?;
        if frame.num_columns() == 0 {
            return Err(CatalogError::validation(format!(
                "cannot ingest '{}': dataframe has no columns",
                table_name
            )));
        }

        self.with_conn(conn, |conn| {
            let rows = materialize(conn, table_name, frame)?;
            catalog::upsert(conn, table_name, &meta.into_update(TableSource::Local))?;
            info!(table = table_name, rows, "Ingested dataset");
            Ok(rows)
        })
    }

    /// Read a CSV file and ingest it.
    pub fn ingest_csv(
        &self,
        path: &Path,
        table_name: &str,
        meta: TableMeta,
        conn: Option<&DbConnection>,
    ) -> Result<u64> {
        validate_table_name(table_name)?;
        let frame = DataFrame::read_csv(path)?;
        self.ingest(&frame, table_name, meta, conn)
    }

    /// Register an external dataset without copying its data.
    ///
    /// `etc` is validated for `external_type` and checked against the cluster
    /// registry before anything is written.
    pub fn pseudo_ingest(
        &self,
        table_name: &str,
        meta: TableMeta,
        external_type: &str,
        etc: serde_json::Value,
        conn: Option<&DbConnection>,
    ) -> Result<()> {
        validate_table_name(table_name)?;
        let source = ExternalSource::from_value(external_type, etc)?;
        match &source {
            ExternalSource::Postgres(pg) => {
                self.registry().check(&pg.cluster, &pg.database)?;
            }
        }

        self.with_conn(conn, |conn| {
            if let Some(existing) = catalog::get(conn, table_name)? {
                if existing.external_type.is_none() {
                    return Err(CatalogError::validation(format!(
                        "'{}' is a materialized dataset and cannot be re-registered as external",
                        table_name
                    )));
                }
            }

            let kind = source.external_type();
            catalog::upsert(
                conn,
                table_name,
                &meta.into_update(TableSource::External(source)),
            )?;
            info!(table = table_name, external_type = %kind, "Registered external dataset");
            Ok(())
        })
    }

    /// Pseudo-ingest every definition document directly inside `dir`.
    ///
    /// A failing file is recorded in the report and does not stop the others.
    pub fn ingest_from_definition_files(&self, dir: &Path) -> Result<IngestReport> {
        let files = definition_files(dir)?;
        let mut report = IngestReport::default();

        for path in files {
            let outcome = DatasetDefinition::load(&path).and_then(|def| {
                self.pseudo_ingest(
                    &def.table_name,
                    def.meta(),
                    &def.external_type,
                    def.etc(),
                    None,
                )?;
                Ok(def.table_name)
            });

            match outcome {
                Ok(table_name) => report.succeeded.push(IngestSuccess { path, table_name }),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Dataset definition rejected");
                    report.failed.push(IngestFailure {
                        path,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            dir = %dir.display(),
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Processed dataset definitions"
        );
        Ok(report)
    }

    /// Record a data refresh of tables whose catalog rows are otherwise unchanged.
    pub fn touch<S: AsRef<str>>(
        &self,
        table_names: &[S],
        conn: Option<&DbConnection>,
    ) -> Result<bool> {
        self.log_table_update(table_names, conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("iris").is_ok());
        assert!(validate_table_name("my table").is_ok());
        assert!(validate_table_name("").unwrap_err().is_validation());
        assert!(validate_table_name("  ").unwrap_err().is_validation());
        assert!(validate_table_name(" iris").unwrap_err().is_validation());
        assert!(validate_table_name("a\nb").unwrap_err().is_validation());
        assert!(validate_table_name("__datadeck_stage_x")
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_report_counts() {
        let mut report = IngestReport::default();
        assert!(report.is_clean());
        report.failed.push(IngestFailure {
            path: PathBuf::from("bad.yaml"),
            error: "nope".to_string(),
        });
        assert!(!report.is_clean());
        assert_eq!(report.total(), 1);
    }
}
