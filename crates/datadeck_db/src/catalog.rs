//! Catalog store operations (`administrative.table_catalog`).

use chrono::Utc;

use crate::backend::{DbConnection, DbRow, DbValue};
use crate::error::{CatalogError, Result};
use crate::schema::CATALOG_TABLE;
use crate::types::*;
use crate::DatadeckDb;

const ENTRY_COLUMNS: &str = "table_name, table_description, table_type, owned_by, created, \
     updated, last_hit, updates, hits, is_pseudo_table, external_type, etc";

impl DatadeckDb {
    // ========================================================================
    // Catalog Operations
    // ========================================================================

    /// Insert a catalog row, or update the supplied fields of an existing one.
    ///
    /// Updating bumps `updates` and refreshes `updated`.
    pub fn catalog_upsert(
        &self,
        table_name: &str,
        update: &CatalogUpdate,
        conn: Option<&DbConnection>,
    ) -> Result<()> {
        self.with_conn(conn, |conn| upsert(conn, table_name, update))
    }

    /// Whether a catalog row exists for `table_name`.
    pub fn catalog_exists(&self, table_name: &str, conn: Option<&DbConnection>) -> Result<bool> {
        self.with_conn(conn, |conn| exists(conn, table_name))
    }

    /// Table names matching `filter`, sorted.
    pub fn catalog_list(
        &self,
        filter: CatalogFilter,
        conn: Option<&DbConnection>,
    ) -> Result<Vec<String>> {
        self.with_conn(conn, |conn| list(conn, filter))
    }

    /// Full catalog row for `table_name`.
    pub fn catalog_get(
        &self,
        table_name: &str,
        conn: Option<&DbConnection>,
    ) -> Result<Option<CatalogEntry>> {
        self.with_conn(conn, |conn| get(conn, table_name))
    }

    /// Every catalog row, sorted by name.
    pub fn catalog_entries(&self, conn: Option<&DbConnection>) -> Result<Vec<CatalogEntry>> {
        self.with_conn(conn, list_entries)
    }
}

pub(crate) fn upsert(conn: &DbConnection, table_name: &str, update: &CatalogUpdate) -> Result<()> {
    let now = Utc::now();
    let source = update.source.as_ref();
    let (is_pseudo, external_type, etc) = match source {
        None | Some(TableSource::Local) => (false, None, None),
        Some(TableSource::External(ext)) => {
            (true, Some(ext.external_type().as_str()), Some(ext.to_etc()?))
        }
    };

    let mut assignments = vec![
        "updates = updates + 1".to_string(),
        "updated = excluded.updated".to_string(),
    ];
    if update.table_description.is_some() {
        assignments.push("table_description = excluded.table_description".to_string());
    }
    if update.table_type.is_some() {
        assignments.push("table_type = excluded.table_type".to_string());
    }
    if update.owned_by.is_some() {
        assignments.push("owned_by = excluded.owned_by".to_string());
    }
    if source.is_some() {
        assignments.push("is_pseudo_table = excluded.is_pseudo_table".to_string());
        assignments.push("external_type = excluded.external_type".to_string());
        assignments.push("etc = excluded.etc".to_string());
    }

    let sql = format!(
        "INSERT INTO {} (table_name, table_description, table_type, owned_by, created, updated, \
         updates, hits, is_pseudo_table, external_type, etc) \
         VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?) \
         ON CONFLICT (table_name) DO UPDATE SET {}",
        CATALOG_TABLE,
        assignments.join(", ")
    );

    conn.execute(
        &sql,
        &[
            DbValue::from(table_name),
            DbValue::from(update.table_description.clone()),
            DbValue::from(update.table_type.unwrap_or_default().as_str()),
            DbValue::from(update.owned_by.as_deref().unwrap_or("unknown")),
            DbValue::from(now),
            DbValue::from(now),
            DbValue::from(is_pseudo),
            DbValue::from(external_type),
            DbValue::from(etc),
        ],
    )?;
    Ok(())
}

pub(crate) fn exists(conn: &DbConnection, table_name: &str) -> Result<bool> {
    let count: i64 = conn.query_scalar(
        &format!("SELECT COUNT(*) FROM {} WHERE table_name = ?", CATALOG_TABLE),
        &[DbValue::from(table_name)],
    )?;
    Ok(count > 0)
}

pub(crate) fn list(conn: &DbConnection, filter: CatalogFilter) -> Result<Vec<String>> {
    let rows = match filter {
        CatalogFilter::Local => conn.query_all(
            &format!(
                "SELECT table_name FROM {} WHERE external_type IS NULL ORDER BY table_name",
                CATALOG_TABLE
            ),
            &[],
        )?,
        CatalogFilter::External(kind) => conn.query_all(
            &format!(
                "SELECT table_name FROM {} WHERE external_type = ? ORDER BY table_name",
                CATALOG_TABLE
            ),
            &[DbValue::from(kind.as_str())],
        )?,
    };
    rows.iter()
        .map(|row| row.get::<String>(0).map_err(CatalogError::from))
        .collect()
}

pub(crate) fn get(conn: &DbConnection, table_name: &str) -> Result<Option<CatalogEntry>> {
    let row = conn.query_optional(
        &format!(
            "SELECT {} FROM {} WHERE table_name = ?",
            ENTRY_COLUMNS, CATALOG_TABLE
        ),
        &[DbValue::from(table_name)],
    )?;
    row.as_ref().map(row_to_entry).transpose()
}

pub(crate) fn list_entries(conn: &DbConnection) -> Result<Vec<CatalogEntry>> {
    let rows = conn.query_all(
        &format!(
            "SELECT {} FROM {} ORDER BY table_name",
            ENTRY_COLUMNS, CATALOG_TABLE
        ),
        &[],
    )?;
    rows.iter().map(row_to_entry).collect()
}

fn row_to_entry(row: &DbRow) -> Result<CatalogEntry> {
    let table_name: String = row.get(0)?;
    let table_type_raw: String = row.get(2)?;
    let table_type = TableType::parse(&table_type_raw).ok_or_else(|| {
        CatalogError::validation(format!(
            "catalog entry '{}' has unknown table_type '{}'",
            table_name, table_type_raw
        ))
    })?;
    let external_type = row
        .get::<Option<String>>(10)?
        .map(|raw| ExternalType::parse(&raw).ok_or(CatalogError::UnknownExternalType(raw)))
        .transpose()?;

    Ok(CatalogEntry {
        table_description: row.get(1)?,
        table_type,
        owned_by: row.get(3)?,
        created: row.get(4)?,
        updated: row.get(5)?,
        last_hit: row.get(6)?,
        updates: row.get(7)?,
        hits: row.get(8)?,
        is_pseudo_table: row.get(9)?,
        external_type,
        etc: row.get(11)?,
        table_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EmbeddedStore;

    fn pg_source() -> TableSource {
        TableSource::External(ExternalSource::Postgres(PostgresSource {
            cluster: "c1".to_string(),
            friendly_name: None,
            database: "d1".to_string(),
            query: "SELECT 1".to_string(),
            post_process: None,
        }))
    }

    #[test]
    fn test_insert_uses_defaults() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        let conn = store.connect().unwrap();
        upsert(&conn, "t1", &CatalogUpdate::new()).unwrap();

        let entry = get(&conn, "t1").unwrap().unwrap();
        assert_eq!(entry.table_type, TableType::UserPersistent);
        assert_eq!(entry.owned_by, "unknown");
        assert_eq!(entry.updates, 0);
        assert_eq!(entry.hits, 0);
        assert!(entry.last_hit.is_none());
        assert!(!entry.is_pseudo_table);
        assert_eq!(entry.source().unwrap(), TableSource::Local);
    }

    #[test]
    fn test_update_touches_only_supplied_fields() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        let conn = store.connect().unwrap();
        upsert(
            &conn,
            "t1",
            &CatalogUpdate::new()
                .description("first")
                .owned_by("alice")
                .table_type(TableType::System),
        )
        .unwrap();
        upsert(&conn, "t1", &CatalogUpdate::new().description("second")).unwrap();

        let entry = get(&conn, "t1").unwrap().unwrap();
        assert_eq!(entry.table_description.as_deref(), Some("second"));
        assert_eq!(entry.owned_by, "alice");
        assert_eq!(entry.table_type, TableType::System);
        assert_eq!(entry.updates, 1);
        assert!(entry.updated >= entry.created);
    }

    #[test]
    fn test_list_filters_by_backend() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        let conn = store.connect().unwrap();
        upsert(&conn, "b_local", &CatalogUpdate::new()).unwrap();
        upsert(&conn, "a_local", &CatalogUpdate::new()).unwrap();
        upsert(&conn, "remote", &CatalogUpdate::new().source(pg_source())).unwrap();

        assert_eq!(
            list(&conn, CatalogFilter::Local).unwrap(),
            vec!["a_local", "b_local"]
        );
        assert_eq!(
            list(&conn, CatalogFilter::External(ExternalType::Postgres)).unwrap(),
            vec!["remote"]
        );
        assert!(exists(&conn, "remote").unwrap());
        assert!(!exists(&conn, "missing").unwrap());
        assert_eq!(list_entries(&conn).unwrap().len(), 3);
    }

    #[test]
    fn test_external_entry_round_trips_source() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        let conn = store.connect().unwrap();
        upsert(&conn, "remote", &CatalogUpdate::new().source(pg_source())).unwrap();

        let entry = get(&conn, "remote").unwrap().unwrap();
        assert!(entry.is_pseudo_table);
        assert_eq!(entry.external_type, Some(ExternalType::Postgres));
        assert_eq!(entry.source().unwrap(), pg_source());
    }
}
