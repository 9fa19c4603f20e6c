//! Catalog types.
//!
//! These are the shapes stored in `administrative.table_catalog` and handed
//! to callers; the CLI renders them directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

// ============================================================================
// Enumerations
// ============================================================================

/// Retention class of a catalog entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    /// Reseeded when the store is wiped
    System,
    /// Dropped when the owning session ends
    UserTemporary,
    /// Kept until explicitly removed
    #[default]
    UserPersistent,
}

impl TableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::UserTemporary => "user_temporary",
            Self::UserPersistent => "user_persistent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "system" => Some(Self::System),
            "user_temporary" => Some(Self::UserTemporary),
            "user_persistent" => Some(Self::UserPersistent),
            _ => None,
        }
    }
}

impl std::fmt::Display for TableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Backend kind of an external (pseudo) table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalType {
    Postgres,
}

impl ExternalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExternalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// External payloads
// ============================================================================

/// Connection coordinates of a dataset living in a PostgreSQL cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresSource {
    /// Cluster name in the cluster registry
    pub cluster: String,
    /// Display name overriding the cluster's own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    /// Database on the cluster
    pub database: String,
    /// Query text producing the dataset
    pub query: String,
    /// Expression applied to the fetched frame (bound as `df`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_process: Option<String>,
}

impl PostgresSource {
    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("cluster", &self.cluster),
            ("database", &self.database),
            ("query", &self.query),
        ] {
            if value.trim().is_empty() {
                return Err(CatalogError::validation(format!(
                    "postgres payload field '{}' must not be empty",
                    field
                )));
            }
        }
        if let Some(expr) = &self.post_process {
            if expr.trim().is_empty() {
                return Err(CatalogError::validation(
                    "postgres payload field 'post_process' must not be blank when present",
                ));
            }
        }
        Ok(())
    }
}

/// Validated `etc` payload, one shape per [`ExternalType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalSource {
    Postgres(PostgresSource),
}

impl ExternalSource {
    pub fn external_type(&self) -> ExternalType {
        match self {
            Self::Postgres(_) => ExternalType::Postgres,
        }
    }

    /// Decode and validate a JSON payload stored for `external_type`.
    pub fn decode(external_type: &str, etc: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(etc)
            .map_err(|e| CatalogError::validation(format!("etc is not valid JSON: {}", e)))?;
        Self::from_value(external_type, value)
    }

    /// Validate an already-parsed payload for `external_type`.
    pub fn from_value(external_type: &str, value: serde_json::Value) -> Result<Self> {
        let kind = ExternalType::parse(external_type)
            .ok_or_else(|| CatalogError::UnknownExternalType(external_type.to_string()))?;
        match kind {
            ExternalType::Postgres => {
                let source: PostgresSource = serde_json::from_value(value).map_err(|e| {
                    CatalogError::validation(format!("invalid postgres payload: {}", e))
                })?;
                source.validate()?;
                Ok(Self::Postgres(source))
            }
        }
    }

    /// Payload as stored in the `etc` column.
    pub fn to_etc(&self) -> Result<String> {
        let json = match self {
            Self::Postgres(source) => serde_json::to_string(source)?,
        };
        Ok(json)
    }
}

/// Where a catalog entry's data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSource {
    /// Materialized in the `datasets` schema
    Local,
    /// Metadata only; fetched from an external backend
    External(ExternalSource),
}

impl TableSource {
    pub fn is_pseudo_table(&self) -> bool {
        matches!(self, Self::External(_))
    }

    pub fn external_type(&self) -> Option<ExternalType> {
        match self {
            Self::Local => None,
            Self::External(source) => Some(source.external_type()),
        }
    }
}

// ============================================================================
// Catalog rows
// ============================================================================

/// One row of the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub table_name: String,
    pub table_description: Option<String>,
    pub table_type: TableType,
    pub owned_by: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub last_hit: Option<DateTime<Utc>>,
    pub updates: i64,
    pub hits: i64,
    pub is_pseudo_table: bool,
    pub external_type: Option<ExternalType>,
    /// Raw payload; decode with [`CatalogEntry::source`]
    pub etc: Option<String>,
}

impl CatalogEntry {
    /// Decode the `(external_type, etc)` pair.
    pub fn source(&self) -> Result<TableSource> {
        match (&self.external_type, &self.etc) {
            (None, _) => Ok(TableSource::Local),
            (Some(kind), Some(etc)) => {
                ExternalSource::decode(kind.as_str(), etc).map(TableSource::External)
            }
            (Some(kind), None) => Err(CatalogError::validation(format!(
                "{} entry '{}' has no etc payload",
                kind, self.table_name
            ))),
        }
    }
}

/// Fields supplied to a catalog upsert; `None` leaves the stored value alone
/// (or takes the column default on insert).
#[derive(Debug, Clone, Default)]
pub struct CatalogUpdate {
    pub table_description: Option<String>,
    pub table_type: Option<TableType>,
    pub owned_by: Option<String>,
    pub source: Option<TableSource>,
}

impl CatalogUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.table_description = Some(description.into());
        self
    }

    pub fn table_type(mut self, table_type: TableType) -> Self {
        self.table_type = Some(table_type);
        self
    }

    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owned_by = Some(owner.into());
        self
    }

    pub fn source(mut self, source: TableSource) -> Self {
        self.source = Some(source);
        self
    }
}

/// Optional descriptive fields shared by both ingestion paths.
#[derive(Debug, Clone, Default)]
pub struct TableMeta {
    pub description: Option<String>,
    pub table_type: Option<TableType>,
    pub owned_by: Option<String>,
}

impl TableMeta {
    pub(crate) fn into_update(self, source: TableSource) -> CatalogUpdate {
        CatalogUpdate {
            table_description: self.description,
            table_type: self.table_type,
            owned_by: self.owned_by,
            source: Some(source),
        }
    }
}

/// Selects which catalog entries [`crate::DatadeckDb::catalog_list`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogFilter {
    /// Materialized tables (`external_type IS NULL`)
    Local,
    /// Pseudo tables of one backend kind
    External(ExternalType),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_type_round_trip() {
        for t in [
            TableType::System,
            TableType::UserTemporary,
            TableType::UserPersistent,
        ] {
            assert_eq!(TableType::parse(t.as_str()), Some(t));
        }
        assert_eq!(TableType::parse("nope"), None);
        assert_eq!(TableType::default(), TableType::UserPersistent);
    }

    #[test]
    fn test_postgres_payload_accepts_optional_fields() {
        let source = ExternalSource::from_value(
            "postgres",
            json!({
                "cluster": "c1",
                "database": "d1",
                "query": "SELECT 1",
                "friendly_name": "Analytics",
                "post_process": "SELECT * FROM df"
            }),
        )
        .unwrap();
        let ExternalSource::Postgres(pg) = &source;
        assert_eq!(pg.friendly_name.as_deref(), Some("Analytics"));

        let decoded = ExternalSource::decode("postgres", &source.to_etc().unwrap()).unwrap();
        assert_eq!(decoded, source);
    }

    #[test]
    fn test_postgres_payload_rejects_bad_shapes() {
        let missing_query = json!({"cluster": "c1", "database": "d1"});
        assert!(ExternalSource::from_value("postgres", missing_query)
            .unwrap_err()
            .is_validation());

        let unknown_field = json!({"cluster": "c1", "database": "d1", "query": "q", "port": 1});
        assert!(ExternalSource::from_value("postgres", unknown_field)
            .unwrap_err()
            .is_validation());

        let empty_cluster = json!({"cluster": " ", "database": "d1", "query": "q"});
        assert!(ExternalSource::from_value("postgres", empty_cluster)
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_unknown_external_type() {
        let err = ExternalSource::decode("mysql", "{}").unwrap_err();
        assert!(matches!(err, CatalogError::UnknownExternalType(_)));
    }

    #[test]
    fn test_entry_without_payload_is_invalid() {
        let now = Utc::now();
        let entry = CatalogEntry {
            table_name: "t2".to_string(),
            table_description: None,
            table_type: TableType::UserPersistent,
            owned_by: "unknown".to_string(),
            created: now,
            updated: now,
            last_hit: None,
            updates: 0,
            hits: 0,
            is_pseudo_table: true,
            external_type: Some(ExternalType::Postgres),
            etc: None,
        };
        assert!(entry.source().unwrap_err().is_validation());
    }
}
