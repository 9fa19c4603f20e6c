//! Errors with a suggested fix, for failures the user can act on.

use std::fmt;
use std::path::Path;

use datadeck_db::MissReason;

/// An error with context and suggestions.
#[derive(Debug)]
pub struct HelpfulError {
    pub message: String,
    pub context: Option<String>,
    pub suggestions: Vec<String>,
}

impl HelpfulError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            suggestions: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn file_not_found(path: &Path) -> Self {
        Self::new(format!("File not found: {}", path.display()))
            .with_suggestion(format!("TRY: Check the path: ls -la {}", path.display()))
    }

    pub fn not_a_directory(path: &Path) -> Self {
        Self::new(format!("Not a directory: {}", path.display()))
            .with_context("Definition documents are read from a directory")
            .with_suggestion("TRY: Pass the directory holding the .yaml/.toml/.json files")
    }

    /// `--config` pointed at a file that does not exist.
    pub fn config_not_found(path: &Path) -> Self {
        Self::new(format!("Config file not found: {}", path.display()))
            .with_suggestion("TRY: Run 'datadeck init' to write a starter config")
            .with_suggestion("TRY: Omit --config to use $DATADECK_HOME/datadeck.toml")
    }

    pub fn no_definitions_dir() -> Self {
        Self::new("No definitions directory given")
            .with_suggestion("TRY: datadeck register <DIR>")
            .with_suggestion("TRY: Set definitions_dir in datadeck.toml")
    }

    /// A table name that resolves to nothing.
    pub fn unreachable_table(table: &str, reason: &MissReason) -> Self {
        let err = Self::new(format!("Table '{}' is not reachable", table))
            .with_context(reason.to_string());
        match reason {
            MissReason::NotRegistered => err
                .with_suggestion("TRY: List known tables: datadeck catalog")
                .with_suggestion("TRY: Register it: datadeck ingest <CSV> --table NAME"),
            MissReason::ClusterMissing { cluster } => err.with_suggestion(format!(
                "TRY: Add [clusters.{}] to datadeck.toml",
                cluster
            )),
            MissReason::DatabaseMissing { cluster, database } => err.with_suggestion(format!(
                "TRY: Add \"{}\" to databases under [clusters.{}]",
                database, cluster
            )),
            MissReason::InvalidPayload { .. } => {
                err.with_suggestion("TRY: Re-register the dataset from its definition file")
            }
        }
    }

    /// Batch registration finished with rejected files.
    pub fn definitions_failed(failed: usize, total: usize) -> Self {
        Self::new(format!("{} of {} definition files failed", failed, total))
            .with_suggestion("TRY: Fix the files listed above and run register again")
    }
}

impl fmt::Display for HelpfulError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ERROR: {}", self.message)?;
        if let Some(ctx) = &self.context {
            writeln!(f, "CONTEXT: {}", ctx)?;
        }
        if !self.suggestions.is_empty() {
            writeln!(f)?;
            for suggestion in &self.suggestions {
                writeln!(f, "  {}", suggestion)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for HelpfulError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_layout() {
        let err = HelpfulError::new("Something went wrong")
            .with_context("While registering")
            .with_suggestion("TRY: again");
        let display = err.to_string();
        assert!(display.starts_with("ERROR: Something went wrong\n"));
        assert!(display.contains("CONTEXT: While registering"));
        assert!(display.contains("  TRY: again"));
    }

    #[test]
    fn test_unreachable_table_suggests_cluster_fix() {
        let err = HelpfulError::unreachable_table(
            "sales",
            &MissReason::ClusterMissing {
                cluster: "c9".to_string(),
            },
        );
        let display = err.to_string();
        assert!(display.contains("'sales'"));
        assert!(display.contains("[clusters.c9]"));
    }

    #[test]
    fn test_unregistered_table_points_at_catalog() {
        let err = HelpfulError::unreachable_table("nope", &MissReason::NotRegistered);
        assert!(err.to_string().contains("datadeck catalog"));
    }
}
