//! Catalog listing and name resolution.

use anyhow::Result;
use clap::Args;
use datadeck_db::{CatalogEntry, DatadeckDb, Resolution};

use crate::cli::error::HelpfulError;
use crate::cli::output::{format_number, format_timestamp, print_table};

/// Arguments for the `catalog` command
#[derive(Debug, Args)]
pub struct CatalogArgs {
    /// Only materialized tables
    #[arg(long, conflicts_with = "external")]
    pub local: bool,

    /// Only external (pseudo) tables
    #[arg(long)]
    pub external: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run_catalog(db: &DatadeckDb, args: CatalogArgs) -> Result<()> {
    let entries: Vec<CatalogEntry> = db
        .catalog_entries(None)?
        .into_iter()
        .filter(|e| {
            if args.local {
                !e.is_pseudo_table
            } else if args.external {
                e.is_pseudo_table
            } else {
                true
            }
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("Catalog is empty");
        return Ok(());
    }

    let rows = entries.iter().map(entry_row).collect();
    print_table(
        &["table", "source", "type", "owner", "hits", "last hit", "updates", "description"],
        rows,
    );
    Ok(())
}

fn entry_row(entry: &CatalogEntry) -> Vec<String> {
    let source = match entry.external_type {
        Some(kind) => kind.to_string(),
        None => "local".to_string(),
    };
    vec![
        entry.table_name.clone(),
        source,
        entry.table_type.to_string(),
        entry.owned_by.clone(),
        format_number(entry.hits),
        format_timestamp(entry.last_hit),
        format_number(entry.updates),
        entry.table_description.clone().unwrap_or_default(),
    ]
}

/// Arguments for the `resolve` command
#[derive(Debug, Args)]
pub struct ResolveArgs {
    pub table: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run_resolve(db: &DatadeckDb, args: ResolveArgs) -> Result<()> {
    let detail = match db.resolve_detailed(&args.table)? {
        Resolution::Found(detail) => detail,
        Resolution::Missing(reason) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&reason)?);
            }
            return Err(HelpfulError::unreachable_table(&args.table, &reason).into());
        }
    };

    if args.json {
        let value = serde_json::json!({
            "table": detail.table_name(),
            "kind": detail.kind(),
            "friendly_name": detail.friendly_name(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!(
            "{} -> {} ({})",
            detail.table_name(),
            detail.kind(),
            detail.friendly_name()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datadeck_db::arrow::array::{ArrayRef, Int64Array};
    use datadeck_db::{ClusterRegistry, DataFrame, TableMeta};
    use std::sync::Arc;

    fn db() -> DatadeckDb {
        let db = DatadeckDb::open_in_memory(ClusterRegistry::empty()).unwrap();
        let frame = DataFrame::from_columns(vec![(
            "id",
            Arc::new(Int64Array::from(vec![1])) as ArrayRef,
        )])
        .unwrap();
        let meta = TableMeta {
            description: Some("Flowers".to_string()),
            ..Default::default()
        };
        db.ingest(&frame, "iris", meta, None).unwrap();
        db
    }

    #[test]
    fn test_entry_row() {
        let db = db();
        let entry = db.catalog_get("iris", None).unwrap().unwrap();
        let row = entry_row(&entry);
        assert_eq!(row[0], "iris");
        assert_eq!(row[1], "local");
        assert_eq!(row[2], "user_persistent");
        assert_eq!(row[3], "unknown");
        assert_eq!(row[5], "never");
        assert_eq!(row[7], "Flowers");
    }

    #[test]
    fn test_resolve_unknown_table_is_helpful() {
        let db = db();
        let args = ResolveArgs {
            table: "nope".to_string(),
            json: false,
        };
        let err = run_resolve(&db, args).unwrap_err();
        assert!(err.downcast_ref::<HelpfulError>().is_some());
    }

    #[test]
    fn test_resolve_local_table() {
        let db = db();
        let args = ResolveArgs {
            table: "iris".to_string(),
            json: true,
        };
        run_resolve(&db, args).unwrap();
    }
}
