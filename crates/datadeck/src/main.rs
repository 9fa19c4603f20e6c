//! Datadeck command-line front end.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use datadeck_logging::{init_logging, LogConfig};

mod cli;

use cli::catalog::{CatalogArgs, ResolveArgs};
use cli::config::{ConfigArgs, DatadeckConfig};
use cli::ingest::{IngestArgs, RegisterArgs, TouchArgs};
use cli::query::{FetchArgs, QueryArgs};
use cli::HelpfulError;

#[derive(Parser, Debug)]
#[command(name = "datadeck", version, about = "Dataset catalog and query middleware")]
struct Cli {
    /// Show info/debug logs on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Config file (default: $DATADECK_HOME/datadeck.toml)
    #[arg(long, global = true, env = "DATADECK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the store and a starter config
    Init,
    /// Show resolved paths and clusters
    Config(ConfigArgs),
    /// Materialize a CSV file as a dataset
    Ingest(IngestArgs),
    /// Register external datasets from definition documents
    Register(RegisterArgs),
    /// List catalog entries
    Catalog(CatalogArgs),
    /// Show where a table's data comes from
    Resolve(ResolveArgs),
    /// Run SQL against the store, counting dataset hits
    Query(QueryArgs),
    /// Load a dataset by name, local or external
    Fetch(FetchArgs),
    /// Record an out-of-band refresh of datasets
    Touch(TouchArgs),
}

fn run_command(cli: Cli) -> Result<()> {
    let (config, config_path) = DatadeckConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => cli::config::run_init(&config, &config_path),
        Commands::Config(args) => cli::config::run(&config, &config_path, args),
        Commands::Ingest(args) => cli::ingest::run_ingest(&config.open_db()?, args),
        Commands::Register(args) => cli::ingest::run_register(&config.open_db()?, &config, args),
        Commands::Catalog(args) => cli::catalog::run_catalog(&config.open_db()?, args),
        Commands::Resolve(args) => cli::catalog::run_resolve(&config.open_db()?, args),
        Commands::Query(args) => cli::query::run_query(&config.open_db()?, args),
        Commands::Fetch(args) => cli::query::run_fetch(&config.open_db()?, args),
        Commands::Touch(args) => cli::ingest::run_touch(&config.open_db()?, args),
    }
}

fn print_error(err: &anyhow::Error) {
    if let Some(helpful) = err.downcast_ref::<HelpfulError>() {
        eprint!("{}", helpful);
        return;
    }
    if std::io::stderr().is_terminal() {
        eprintln!("\x1b[31merror:\x1b[0m {:#}", err);
    } else {
        eprintln!("error: {:#}", err);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(LogConfig {
        app_name: "datadeck",
        verbose: cli.verbose,
    }) {
        eprintln!("Warning: failed to initialize logging: {:#}", err);
    }

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            print_error(&err);
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_query_flags() {
        let cli = Cli::try_parse_from([
            "datadeck",
            "query",
            "SELECT 1",
            "--skip-logging",
            "-n",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Query(args) => {
                assert!(args.skip_logging);
                assert_eq!(args.limit, 5);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ingest_type() {
        let cli = Cli::try_parse_from([
            "datadeck", "ingest", "iris.csv", "--table", "iris", "--type", "system",
        ])
        .unwrap();
        match cli.command {
            Commands::Ingest(args) => {
                assert_eq!(args.table, "iris");
                assert_eq!(args.table_type, Some(datadeck_db::TableType::System));
            }
            other => panic!("unexpected command: {:?}", other),
        }
        let bogus = ["datadeck", "ingest", "x.csv", "-t", "x", "--type", "bogus"];
        assert!(Cli::try_parse_from(bogus).is_err());
    }

    #[test]
    fn test_touch_requires_table() {
        assert!(Cli::try_parse_from(["datadeck", "touch"]).is_err());
    }
}
