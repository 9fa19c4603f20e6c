//! Cluster registry: external PostgreSQL clusters and their databases.
//!
//! Read-only after load. Pseudo-ingestion checks new definitions against it
//! and the resolver looks up connection coordinates in it.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Connection coordinates of one cluster.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub friendly_name: Option<String>,
    /// Databases datasets may reference on this cluster
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub application_name: Option<String>,
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("friendly_name", &self.friendly_name)
            .field("databases", &self.databases)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl ClusterConfig {
    pub fn has_database(&self, database: &str) -> bool {
        self.databases.iter().any(|d| d == database)
    }

    /// Copy of this config with per-dataset overrides applied.
    pub fn with_overrides(&self, friendly_name: Option<&str>) -> Self {
        let mut merged = self.clone();
        if let Some(name) = friendly_name.filter(|n| !n.trim().is_empty()) {
            merged.friendly_name = Some(name.to_string());
        }
        merged
    }
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    clusters: BTreeMap<String, ClusterConfig>,
}

/// Named clusters, keyed by cluster name.
#[derive(Debug, Clone, Default)]
pub struct ClusterRegistry {
    clusters: BTreeMap<String, ClusterConfig>,
}

impl ClusterRegistry {
    pub fn new(clusters: BTreeMap<String, ClusterConfig>) -> Self {
        Self { clusters }
    }

    /// Registry with no clusters; every external definition fails validation.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a TOML document with `[clusters.<name>]` tables.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: RegistryFile = toml::from_str(content)
            .map_err(|e| CatalogError::config(format!("invalid cluster registry: {}", e)))?;
        Ok(Self::new(file.clusters))
    }

    /// Load a TOML registry file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CatalogError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn insert(&mut self, name: impl Into<String>, config: ClusterConfig) {
        self.clusters.insert(name.into(), config);
    }

    pub fn get(&self, cluster: &str) -> Option<&ClusterConfig> {
        self.clusters.get(cluster)
    }

    pub fn cluster_names(&self) -> impl Iterator<Item = &str> {
        self.clusters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Look up `cluster`, requiring `database` to be registered on it.
    pub fn check(&self, cluster: &str, database: &str) -> Result<&ClusterConfig> {
        let config = self
            .get(cluster)
            .ok_or_else(|| CatalogError::UnknownCluster(cluster.to_string()))?;
        if !config.has_database(database) {
            return Err(CatalogError::UnknownDatabase {
                cluster: cluster.to_string(),
                database: database.to_string(),
            });
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [clusters.c1]
        host = "localhost"
        user = "reader"
        password = "secret"
        friendly_name = "Analytics"
        databases = ["d1", "d2"]

        [clusters.bare]
        host = "db.internal"
        port = 6543
        user = "svc"
    "#;

    #[test]
    fn test_parse_applies_defaults() {
        let registry = ClusterRegistry::from_toml_str(SAMPLE).unwrap();
        assert_eq!(registry.len(), 2);

        let c1 = registry.get("c1").unwrap();
        assert_eq!(c1.port, 5432);
        assert_eq!(c1.connect_timeout_secs, 10);

        let bare = registry.get("bare").unwrap();
        assert_eq!(bare.port, 6543);
        assert!(bare.databases.is_empty());
        assert!(bare.password.is_none());
    }

    #[test]
    fn test_check_cluster_and_database() {
        let registry = ClusterRegistry::from_toml_str(SAMPLE).unwrap();
        assert!(registry.check("c1", "d2").is_ok());
        assert!(matches!(
            registry.check("c9", "d1"),
            Err(CatalogError::UnknownCluster(_))
        ));
        assert!(matches!(
            registry.check("c1", "d9"),
            Err(CatalogError::UnknownDatabase { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_password() {
        let registry = ClusterRegistry::from_toml_str(SAMPLE).unwrap();
        let rendered = format!("{:?}", registry.get("c1").unwrap());
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_overrides_keep_base_name_when_blank() {
        let registry = ClusterRegistry::from_toml_str(SAMPLE).unwrap();
        let c1 = registry.get("c1").unwrap();
        assert_eq!(
            c1.with_overrides(Some("Sales")).friendly_name.as_deref(),
            Some("Sales")
        );
        assert_eq!(
            c1.with_overrides(Some("  ")).friendly_name.as_deref(),
            Some("Analytics")
        );
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = ClusterRegistry::from_toml_str("[clusters.c1]\nport = 1").unwrap_err();
        assert!(matches!(err, CatalogError::Config(_)));
    }
}
