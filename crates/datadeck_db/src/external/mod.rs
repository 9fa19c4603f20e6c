//! External backends reached through federation.
//!
//! One submodule per [`crate::ExternalType`].

pub mod postgres;

pub use postgres::{ColumnKind, PostgresConnection};
