//! Ingest, register and touch commands: everything that writes the catalog.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use datadeck_db::{DatadeckDb, IngestReport, TableMeta, TableType};

use crate::cli::config::DatadeckConfig;
use crate::cli::error::HelpfulError;
use crate::cli::output::{format_number, print_table};

fn parse_table_type(s: &str) -> Result<TableType, String> {
    TableType::parse(s).ok_or_else(|| {
        format!(
            "unknown table type '{}' (expected system, user_temporary or user_persistent)",
            s
        )
    })
}

/// Arguments for the `ingest` command
#[derive(Debug, Args)]
pub struct IngestArgs {
    /// CSV file to materialize
    pub csv: PathBuf,

    /// Logical table name
    #[arg(short, long)]
    pub table: String,

    #[arg(long)]
    pub description: Option<String>,

    #[arg(long)]
    pub owner: Option<String>,

    /// system, user_temporary or user_persistent
    #[arg(long = "type", value_parser = parse_table_type)]
    pub table_type: Option<TableType>,
}

pub fn run_ingest(db: &DatadeckDb, args: IngestArgs) -> Result<()> {
    if !args.csv.is_file() {
        return Err(HelpfulError::file_not_found(&args.csv).into());
    }
    let meta = TableMeta {
        description: args.description,
        table_type: args.table_type,
        owned_by: args.owner,
    };
    let rows = db
        .ingest_csv(&args.csv, &args.table, meta, None)
        .with_context(|| format!("Failed to ingest {}", args.csv.display()))?;
    println!(
        "Ingested {} rows into '{}'",
        format_number(rows as i64),
        args.table
    );
    Ok(())
}

/// Arguments for the `register` command
#[derive(Debug, Args)]
pub struct RegisterArgs {
    /// Directory of definition documents (default: definitions_dir from config)
    pub dir: Option<PathBuf>,

    /// Output the report as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run_register(db: &DatadeckDb, config: &DatadeckConfig, args: RegisterArgs) -> Result<()> {
    let dir = match args.dir {
        Some(dir) => dir,
        None if config.definitions_dir.is_some() => config.definitions_dir()?,
        None => return Err(HelpfulError::no_definitions_dir().into()),
    };
    if !dir.is_dir() {
        return Err(HelpfulError::not_a_directory(&dir).into());
    }

    let report = db.ingest_from_definition_files(&dir)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&dir, &report);
    }

    if report.is_clean() {
        Ok(())
    } else {
        Err(HelpfulError::definitions_failed(report.failed.len(), report.total()).into())
    }
}

fn print_report(dir: &Path, report: &IngestReport) {
    if report.total() == 0 {
        println!("No definition files in {}", dir.display());
        return;
    }
    let mut rows: Vec<Vec<String>> = report
        .succeeded
        .iter()
        .map(|ok| vec![file_name(&ok.path), ok.table_name.clone(), "registered".to_string()])
        .collect();
    rows.extend(
        report
            .failed
            .iter()
            .map(|err| vec![file_name(&err.path), String::new(), err.error.clone()]),
    );
    print_table(&["file", "table", "result"], rows);
    println!(
        "{} registered, {} failed",
        report.succeeded.len(),
        report.failed.len()
    );
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Arguments for the `touch` command
#[derive(Debug, Args)]
pub struct TouchArgs {
    /// Tables whose data was refreshed
    #[arg(required = true)]
    pub tables: Vec<String>,
}

pub fn run_touch(db: &DatadeckDb, args: TouchArgs) -> Result<()> {
    if db.touch(&args.tables, None)? {
        println!("Recorded update for {}", args.tables.join(", "));
    } else {
        println!("Update skipped: catalog row busy, try again");
    }
    Ok(())
}
