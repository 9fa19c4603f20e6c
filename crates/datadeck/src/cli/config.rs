//! `datadeck.toml`: where the store lives, where definitions are read from,
//! and which clusters external datasets may use.
//!
//! All keys are optional; a missing default file means an empty registry
//! and a store under `$DATADECK_HOME`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use datadeck_db::{ClusterConfig, ClusterRegistry, DatadeckDb};
use datadeck_logging::datadeck_home;
use serde::Deserialize;
use tracing::debug;

use crate::cli::error::HelpfulError;

pub const CONFIG_FILE: &str = "datadeck.toml";
const STORE_FILE: &str = "dash.duckdb";
const DEFINITIONS_DIR: &str = "definitions";

const STARTER_CONFIG: &str = r#"# Datadeck configuration

# store_path = "~/.datadeck/dash.duckdb"
# definitions_dir = "~/.datadeck/definitions"

# [clusters.analytics]
# host = "localhost"
# port = 5432
# user = "reader"
# password = "secret"
# friendly_name = "Analytics"
# databases = ["warehouse"]
# connect_timeout_secs = 10
"#;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatadeckConfig {
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default)]
    pub definitions_dir: Option<PathBuf>,
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterConfig>,
}

impl DatadeckConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load `explicit`, or the default file if it exists.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, PathBuf)> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(HelpfulError::config_not_found(path).into());
                }
                path.to_path_buf()
            }
            None => default_config_path()?,
        };

        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok((Self::default(), path));
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        Ok((config, path))
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(path) => Ok(expand_home(path)),
            None => Ok(datadeck_home()?.join(STORE_FILE)),
        }
    }

    pub fn definitions_dir(&self) -> Result<PathBuf> {
        match &self.definitions_dir {
            Some(path) => Ok(expand_home(path)),
            None => Ok(datadeck_home()?.join(DEFINITIONS_DIR)),
        }
    }

    pub fn registry(&self) -> ClusterRegistry {
        ClusterRegistry::new(self.clusters.clone())
    }

    /// Open the store in file mode so other worker processes can share it.
    pub fn open_db(&self) -> Result<DatadeckDb> {
        let path = self.store_path()?;
        DatadeckDb::open(&path, self.registry())
            .with_context(|| format!("Failed to open store: {}", path.display()))
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(datadeck_home()?.join(CONFIG_FILE))
}

/// Expand a leading `~/`.
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Show resolved paths as JSON
    #[arg(long)]
    pub json: bool,
}

/// Show the resolved configuration.
pub fn run(config: &DatadeckConfig, config_path: &Path, args: ConfigArgs) -> Result<()> {
    let store = config.store_path()?;
    let definitions = config.definitions_dir()?;
    let clusters: Vec<&str> = config.clusters.keys().map(String::as_str).collect();

    if args.json {
        let value = serde_json::json!({
            "config": { "path": config_path.to_string_lossy(), "exists": config_path.exists() },
            "store": { "path": store.to_string_lossy(), "exists": store.exists() },
            "definitions_dir": { "path": definitions.to_string_lossy(), "exists": definitions.exists() },
            "clusters": clusters,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let exists = |p: &Path| if p.exists() { "" } else { " (missing)" };
    println!("Config:      {}{}", config_path.display(), exists(config_path));
    println!("Store:       {}{}", store.display(), exists(&store));
    println!("Definitions: {}{}", definitions.display(), exists(&definitions));
    if clusters.is_empty() {
        println!("Clusters:    (none)");
    } else {
        println!("Clusters:    {}", clusters.join(", "));
    }
    Ok(())
}

/// Create the store (and a starter config if none exists).
pub fn run_init(config: &DatadeckConfig, config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(config_path, STARTER_CONFIG)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("Wrote starter config: {}", config_path.display());
    }

    let db = config.open_db()?;
    let tables = db.catalog_entries(None)?.len();
    println!(
        "Store ready: {} ({} catalog entr{})",
        config.store_path()?.display(),
        tables,
        if tables == 1 { "y" } else { "ies" }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = DatadeckConfig::from_toml_str(
            r#"
store_path = "/data/dash.duckdb"
definitions_dir = "/data/defs"

[clusters.c1]
host = "db.internal"
user = "reader"
databases = ["d1", "d2"]
"#,
        )
        .unwrap();
        assert_eq!(config.store_path().unwrap(), PathBuf::from("/data/dash.duckdb"));
        assert_eq!(config.definitions_dir().unwrap(), PathBuf::from("/data/defs"));
        let registry = config.registry();
        assert!(registry.check("c1", "d2").is_ok());
        assert_eq!(registry.get("c1").unwrap().port, 5432);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = DatadeckConfig::from_toml_str("").unwrap();
        assert!(config.store_path.is_none());
        assert!(config.registry().is_empty());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(DatadeckConfig::from_toml_str("store = \"x\"").is_err());
    }

    #[test]
    fn test_explicit_missing_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DatadeckConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.downcast_ref::<HelpfulError>().is_some());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datadeck.toml");
        std::fs::write(&path, "definitions_dir = \"defs\"\n").unwrap();
        let (config, loaded_from) = DatadeckConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded_from, path);
        assert_eq!(config.definitions_dir().unwrap(), PathBuf::from("defs"));
    }

    #[test]
    fn test_starter_config_parses() {
        let config = DatadeckConfig::from_toml_str(STARTER_CONFIG).unwrap();
        assert!(config.clusters.is_empty());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/abs/x")), PathBuf::from("/abs/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/x.duckdb")), home.join("x.duckdb"));
        }
    }
}
