//! Dataset definition documents.
//!
//! One YAML, TOML or JSON document per external dataset:
//!
//! ```yaml
//! table_name: sales
//! description: Daily sales
//! owned_by: finance
//! cluster: c1
//! friendly_name: Sales warehouse
//! database: d1
//! query: SELECT * FROM sales
//! post_process: SELECT * FROM df WHERE amount > 0
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CatalogError, Result};
use crate::types::{ExternalType, TableMeta, TableType};

fn default_external_type() -> String {
    ExternalType::Postgres.as_str().to_string()
}

/// Document format, picked by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Yaml,
    Toml,
    Json,
}

impl DefinitionFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// A declared external dataset.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetDefinition {
    pub table_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owned_by: Option<String>,
    #[serde(default)]
    pub table_type: Option<TableType>,
    #[serde(default = "default_external_type")]
    pub external_type: String,
    pub cluster: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    pub database: String,
    pub query: String,
    #[serde(default)]
    pub post_process: Option<String>,
}

impl DatasetDefinition {
    pub fn parse(content: &str, format: DefinitionFormat) -> Result<Self> {
        match format {
            DefinitionFormat::Yaml => serde_yaml::from_str(content)
                .map_err(|e| CatalogError::validation(format!("invalid YAML definition: {}", e))),
            DefinitionFormat::Toml => toml::from_str(content)
                .map_err(|e| CatalogError::validation(format!("invalid TOML definition: {}", e))),
            DefinitionFormat::Json => serde_json::from_str(content)
                .map_err(|e| CatalogError::validation(format!("invalid JSON definition: {}", e))),
        }
    }

    /// Read and parse one definition file.
    pub fn load(path: &Path) -> Result<Self> {
        let format = DefinitionFormat::from_path(path).ok_or_else(|| {
            CatalogError::validation(format!(
                "{} is not a .yaml, .yml, .toml or .json file",
                path.display()
            ))
        })?;
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, format)
    }

    /// The `etc` payload this definition declares.
    pub fn etc(&self) -> serde_json::Value {
        let mut etc = serde_json::Map::new();
        etc.insert("cluster".into(), self.cluster.clone().into());
        if let Some(name) = &self.friendly_name {
            etc.insert("friendly_name".into(), name.clone().into());
        }
        etc.insert("database".into(), self.database.clone().into());
        etc.insert("query".into(), self.query.clone().into());
        if let Some(expr) = &self.post_process {
            etc.insert("post_process".into(), expr.clone().into());
        }
        serde_json::Value::Object(etc)
    }

    pub fn meta(&self) -> TableMeta {
        TableMeta {
            description: self.description.clone(),
            table_type: self.table_type,
            owned_by: self.owned_by.clone(),
        }
    }
}

/// Definition files directly inside `dir`, sorted by file name.
pub fn definition_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && DefinitionFormat::from_path(&path).is_some() {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}
