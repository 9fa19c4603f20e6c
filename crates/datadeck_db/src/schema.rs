//! Embedded store schema.
//!
//! All CREATE statements live here - single source of truth.

use tracing::info;

use crate::backend::{BackendError, EmbeddedStore};

/// Schema holding one physical table per local dataset.
pub const DATASETS_SCHEMA: &str = "datasets";

/// Fully qualified catalog table.
pub const CATALOG_TABLE: &str = "administrative.table_catalog";

impl EmbeddedStore {
    /// Ensure schemas and the catalog table exist.
    pub(crate) fn ensure_schema(&self) -> Result<(), BackendError> {
        let conn = self.connect_unscoped()?;
        conn.execute_batch(
            r#"
            CREATE SCHEMA IF NOT EXISTS datasets;
            CREATE SCHEMA IF NOT EXISTS administrative;

            CREATE TABLE IF NOT EXISTS administrative.table_catalog (
                table_name TEXT PRIMARY KEY,
                table_description TEXT,
                table_type TEXT NOT NULL DEFAULT 'user_persistent'
                    CHECK (table_type IN ('system', 'user_temporary', 'user_persistent')),
                owned_by TEXT NOT NULL DEFAULT 'unknown',
                created TIMESTAMP NOT NULL,
                updated TIMESTAMP NOT NULL,
                last_hit TIMESTAMP,
                updates BIGINT NOT NULL DEFAULT 0,
                hits BIGINT NOT NULL DEFAULT 0,
                is_pseudo_table BOOLEAN NOT NULL DEFAULT FALSE,
                external_type TEXT,
                etc TEXT,
                CHECK (is_pseudo_table = (external_type IS NOT NULL))
            );
            "#,
        )?;

        info!("Catalog schema verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        store.ensure_schema().unwrap();

        let conn = store.connect().unwrap();
        let count: i64 = conn
            .query_scalar(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = 'administrative' AND table_name = 'table_catalog'",
                &[],
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_pseudo_flag_must_match_external_type() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        let conn = store.connect().unwrap();
        let err = conn
            .execute(
                "INSERT INTO administrative.table_catalog \
                 (table_name, created, updated, is_pseudo_table, external_type) \
                 VALUES ('broken', TIMESTAMP '2024-01-01', TIMESTAMP '2024-01-01', TRUE, NULL)",
                &[],
            )
            .unwrap_err();
        assert!(!err.is_conflict());
    }
}
