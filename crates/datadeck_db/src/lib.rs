//! Dataset catalog and query middleware for Datadeck.
//!
//! Datasets live either in the embedded DuckDB store (materialized under the
//! `datasets` schema) or in external PostgreSQL clusters (registered as
//! pseudo tables). Both kinds share one catalog with ownership and usage
//! statistics.
//!
//! # Usage
//!
//! ```rust,ignore
//! use datadeck_db::{ClusterRegistry, ConnectionMap, DatadeckDb, TableMeta};
//!
//! let registry = ClusterRegistry::load("clusters.toml".as_ref())?;
//! let db = DatadeckDb::open("~/.datadeck/dash.duckdb", registry)?;
//!
//! db.ingest_csv("iris.csv".as_ref(), "iris", TableMeta::default(), None)?;
//! db.ingest_from_definition_files("definitions".as_ref())?;
//!
//! let map = ConnectionMap::build(&db)?;
//! if let Some(detail) = map.get("iris") {
//!     let frame = detail.get_dataframe(&db).await?;
//! }
//! ```

mod backend;
mod catalog;
mod error;
mod frame;
mod lock;
mod schema;
mod types;

pub mod definitions;
pub mod external;
pub mod ingest;
pub mod middleware;
pub mod references;
pub mod registry;
pub mod resolver;
pub mod sandbox;

pub use backend::{
    BackendError, DbConnection, DbRow, DbTransaction, DbValue, EmbeddedStore, FromDbValue,
};
pub use definitions::{DatasetDefinition, DefinitionFormat};
pub use error::{CatalogError, Result};
pub use external::{ColumnKind, PostgresConnection};
pub use frame::DataFrame;
pub use ingest::{IngestFailure, IngestReport, IngestSuccess};
pub use lock::{lock_path_for, LockError};
pub use references::find_referenced_tables;
pub use registry::{ClusterConfig, ClusterRegistry};
pub use resolver::{
    BackendConnection, ConnectionDetail, ConnectionMap, LocalConnection, MissReason, Resolution,
};
pub use sandbox::{DuckDbSandbox, NoopPostProcessor, PostProcessor};
pub use schema::{CATALOG_TABLE, DATASETS_SCHEMA};
pub use types::*;

/// Arrow types used in [`DataFrame`], re-exported from DuckDB's build.
pub use duckdb::arrow;

use std::path::Path;
use std::sync::Arc;

/// Catalog, middleware and resolver over one embedded store.
///
/// Cheap to clone; clones share the store, the registry and the
/// post-processor.
#[derive(Clone)]
pub struct DatadeckDb {
    store: Arc<EmbeddedStore>,
    registry: Arc<ClusterRegistry>,
    post_processor: Arc<dyn PostProcessor>,
}

impl std::fmt::Debug for DatadeckDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatadeckDb")
            .field("store", &self.store)
            .field("clusters", &self.registry.len())
            .finish()
    }
}

impl DatadeckDb {
    pub fn new(store: EmbeddedStore, registry: ClusterRegistry) -> Self {
        Self {
            store: Arc::new(store),
            registry: Arc::new(registry),
            post_processor: Arc::new(DuckDbSandbox::new()),
        }
    }

    /// Open a store file that other processes may open concurrently.
    pub fn open(path: impl AsRef<Path>, registry: ClusterRegistry) -> Result<Self> {
        Ok(Self::new(EmbeddedStore::open(path)?, registry))
    }

    /// Open a store file this process owns; connections run concurrently.
    pub fn open_shared(path: impl AsRef<Path>, registry: ClusterRegistry) -> Result<Self> {
        Ok(Self::new(EmbeddedStore::open_shared(path)?, registry))
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory(registry: ClusterRegistry) -> Result<Self> {
        Ok(Self::new(EmbeddedStore::open_in_memory()?, registry))
    }

    /// Replace the evaluator for post-process expressions.
    pub fn with_post_processor(mut self, post_processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = post_processor;
        self
    }

    pub fn store(&self) -> &EmbeddedStore {
        &self.store
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    pub fn post_processor(&self) -> Arc<dyn PostProcessor> {
        Arc::clone(&self.post_processor)
    }

    /// Open a connection to the embedded store.
    pub fn connect(&self) -> Result<DbConnection> {
        Ok(self.store.connect()?)
    }

    /// Run `op` on the caller's connection, or on a fresh one that is
    /// released when `op` returns.
    pub(crate) fn with_conn<T, F>(&self, conn: Option<&DbConnection>, op: F) -> Result<T>
    where
        F: FnOnce(&DbConnection) -> Result<T>,
    {
        match conn {
            Some(conn) => op(conn),
            None => {
                let conn = self.connect()?;
                op(&conn)
            }
        }
    }
}
