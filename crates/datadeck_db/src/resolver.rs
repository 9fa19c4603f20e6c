//! Table name resolution and the connection map.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::{quote_ident, DbConnection};
use crate::catalog;
use crate::error::{CatalogError, Result};
use crate::external::PostgresConnection;
use crate::frame::DataFrame;
use crate::registry::ClusterRegistry;
use crate::schema::DATASETS_SCHEMA;
use crate::types::{CatalogEntry, ExternalSource, TableSource};
use crate::DatadeckDb;

/// A dataset materialized in the embedded store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConnection {
    table_name: String,
}

impl LocalConnection {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn friendly_name(&self) -> String {
        self.table_name.clone()
    }

    pub fn connect(&self, db: &DatadeckDb) -> Result<DbConnection> {
        Ok(db.connect()?)
    }

    /// Read the whole table through the middleware, counting a hit.
    pub async fn get_dataframe(&self, db: &DatadeckDb) -> Result<DataFrame> {
        let sql = format!(
            "SELECT * FROM {}.{}",
            DATASETS_SCHEMA,
            quote_ident(&self.table_name)
        );
        let db = db.clone();
        tokio::task::spawn_blocking(move || db.execute_and_log(&sql, None, false)).await?
    }
}

/// How to reach the data behind a catalog entry.
#[derive(Debug, Clone)]
pub enum ConnectionDetail {
    Local(LocalConnection),
    Postgres(PostgresConnection),
}

/// An open connection to whichever backend holds a dataset.
pub enum BackendConnection {
    Local(DbConnection),
    Postgres(sqlx::PgConnection),
}

impl ConnectionDetail {
    pub fn table_name(&self) -> &str {
        match self {
            Self::Local(local) => local.table_name(),
            Self::Postgres(pg) => pg.table_name(),
        }
    }

    /// Short backend label for display.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Postgres(_) => "postgres",
        }
    }

    /// Human-readable label; never empty.
    pub fn friendly_name(&self) -> String {
        match self {
            Self::Local(local) => local.friendly_name(),
            Self::Postgres(pg) => pg.friendly_name(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub async fn connect(&self, db: &DatadeckDb) -> Result<BackendConnection> {
        match self {
            Self::Local(_) => {
                let db = db.clone();
                let conn = tokio::task::spawn_blocking(move || db.connect()).await??;
                Ok(BackendConnection::Local(conn))
            }
            Self::Postgres(pg) => Ok(BackendConnection::Postgres(pg.connect().await?)),
        }
    }

    pub async fn get_dataframe(&self, db: &DatadeckDb) -> Result<DataFrame> {
        match self {
            Self::Local(local) => local.get_dataframe(db).await,
            Self::Postgres(pg) => pg.get_dataframe(db).await,
        }
    }
}

/// Why a table name has no connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum MissReason {
    /// No catalog row
    NotRegistered,
    /// Catalog points at a cluster the registry no longer has
    ClusterMissing { cluster: String },
    /// Cluster exists but no longer lists the database
    DatabaseMissing { cluster: String, database: String },
    /// Stored payload fails validation
    InvalidPayload { message: String },
}

impl std::fmt::Display for MissReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRegistered => write!(f, "not registered in the catalog"),
            Self::ClusterMissing { cluster } => {
                write!(f, "cluster '{}' is not in the registry", cluster)
            }
            Self::DatabaseMissing { cluster, database } => write!(
                f,
                "database '{}' is not registered for cluster '{}'",
                database, cluster
            ),
            Self::InvalidPayload { message } => write!(f, "invalid stored payload: {}", message),
        }
    }
}

/// Outcome of resolving one table name.
#[derive(Debug, Clone)]
pub enum Resolution {
    Found(ConnectionDetail),
    Missing(MissReason),
}

impl Resolution {
    pub fn found(self) -> Option<ConnectionDetail> {
        match self {
            Self::Found(detail) => Some(detail),
            Self::Missing(_) => None,
        }
    }
}

/// Build the connection for one catalog row.
pub(crate) fn resolve_entry(entry: &CatalogEntry, registry: &ClusterRegistry) -> Resolution {
    let source = match entry.source() {
        Ok(source) => source,
        Err(err) => {
            return Resolution::Missing(MissReason::InvalidPayload {
                message: err.to_string(),
            })
        }
    };

    match source {
        TableSource::Local => {
            Resolution::Found(ConnectionDetail::Local(LocalConnection::new(&entry.table_name)))
        }
        TableSource::External(ExternalSource::Postgres(pg)) => {
            match registry.check(&pg.cluster, &pg.database) {
                Ok(cluster) => Resolution::Found(ConnectionDetail::Postgres(
                    PostgresConnection::new(&entry.table_name, pg, cluster),
                )),
                Err(CatalogError::UnknownDatabase { cluster, database }) => {
                    Resolution::Missing(MissReason::DatabaseMissing { cluster, database })
                }
                Err(_) => Resolution::Missing(MissReason::ClusterMissing {
                    cluster: pg.cluster.clone(),
                }),
            }
        }
    }
}

impl DatadeckDb {
    // ========================================================================
    // Resolution
    // ========================================================================

    /// Resolve `table_name`, reporting why it has no connection.
    pub fn resolve_detailed(&self, table_name: &str) -> Result<Resolution> {
        let entry = self.with_conn(None, |conn| catalog::get(conn, table_name))?;
        Ok(match entry {
            Some(entry) => resolve_entry(&entry, self.registry()),
            None => Resolution::Missing(MissReason::NotRegistered),
        })
    }

    /// Resolve `table_name` to a connection; `None` if it cannot be reached.
    pub fn resolve(&self, table_name: &str) -> Result<Option<ConnectionDetail>> {
        match self.resolve_detailed(table_name)? {
            Resolution::Found(detail) => Ok(Some(detail)),
            Resolution::Missing(reason) => {
                warn!(table = table_name, reason = %reason, "No connection available");
                Ok(None)
            }
        }
    }
}

/// Every reachable dataset keyed by table name.
///
/// A snapshot: ingestion after [`ConnectionMap::build`] is not reflected
/// until [`ConnectionMap::rebuild`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionMap {
    entries: BTreeMap<String, ConnectionDetail>,
    unresolved: BTreeMap<String, MissReason>,
}

impl ConnectionMap {
    pub fn build(db: &DatadeckDb) -> Result<Self> {
        let mut map = Self::default();
        map.rebuild(db)?;
        Ok(map)
    }

    /// Re-resolve every catalog entry, replacing the current contents.
    pub fn rebuild(&mut self, db: &DatadeckDb) -> Result<()> {
        let entries = db.with_conn(None, catalog::list_entries)?;
        let (local, external): (Vec<CatalogEntry>, Vec<CatalogEntry>) = entries
            .into_iter()
            .partition(|e| e.external_type.is_none());

        let mut resolved = BTreeMap::new();
        let mut unresolved = BTreeMap::new();
        for entry in local.iter().chain(external.iter()) {
            match resolve_entry(entry, db.registry()) {
                Resolution::Found(detail) => {
                    resolved.insert(entry.table_name.clone(), detail);
                }
                Resolution::Missing(reason) => {
                    warn!(table = %entry.table_name, reason = %reason, "Catalog entry unreachable");
                    unresolved.insert(entry.table_name.clone(), reason);
                }
            }
        }

        debug!(
            resolved = resolved.len(),
            unresolved = unresolved.len(),
            "Connection map rebuilt"
        );
        self.entries = resolved;
        self.unresolved = unresolved;
        Ok(())
    }

    pub fn get(&self, table_name: &str) -> Option<&ConnectionDetail> {
        self.entries.get(table_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reachable table names, sorted.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConnectionDetail)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Catalog entries that could not be resolved at the last rebuild.
    pub fn unresolved(&self) -> &BTreeMap<String, MissReason> {
        &self.unresolved
    }
}
