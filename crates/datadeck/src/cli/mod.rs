//! Command-line interface for Datadeck.
//!
//! Every command opens the store from `datadeck.toml`, does one thing, and
//! exits; several invocations may run against the same store at once.

pub mod catalog;
pub mod config;
pub mod error;
pub mod ingest;
pub mod output;
pub mod query;

pub use error::HelpfulError;
