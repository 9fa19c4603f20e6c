//! Query and fetch commands: read data through the middleware.

use anyhow::{Context, Result};
use clap::Args;
use datadeck_db::{DataFrame, DatadeckDb, Resolution};

use crate::cli::error::HelpfulError;
use crate::cli::output::{frame_to_json, print_frame};

/// Arguments for the `query` command
#[derive(Debug, Args)]
pub struct QueryArgs {
    /// SQL to run against the embedded store
    pub sql: String,

    /// Do not count hits for referenced datasets
    #[arg(long)]
    pub skip_logging: bool,

    /// Maximum rows to print
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Output rows as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run_query(db: &DatadeckDb, args: QueryArgs) -> Result<()> {
    let frame = db
        .execute_and_log(&args.sql, None, args.skip_logging)
        .context("Query failed")?;
    show(&frame, args.limit, args.json)
}

/// Arguments for the `fetch` command
#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Logical table name, local or external
    pub table: String,

    /// Maximum rows to print
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Output rows as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run_fetch(db: &DatadeckDb, args: FetchArgs) -> Result<()> {
    let detail = match db.resolve_detailed(&args.table)? {
        Resolution::Found(detail) => detail,
        Resolution::Missing(reason) => {
            return Err(HelpfulError::unreachable_table(&args.table, &reason).into())
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let frame = runtime
        .block_on(detail.get_dataframe(db))
        .with_context(|| {
            format!(
                "Failed to fetch '{}' from {}",
                args.table,
                detail.friendly_name()
            )
        })?;
    show(&frame, args.limit, args.json)
}

fn show(frame: &DataFrame, limit: usize, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&frame_to_json(frame, limit))?);
    } else {
        print_frame(frame, limit);
    }
    Ok(())
}
