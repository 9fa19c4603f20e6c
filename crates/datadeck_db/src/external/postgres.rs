//! PostgreSQL federation: runs a dataset's stored query on its cluster and
//! converts the rows into a [`DataFrame`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use duckdb::arrow::array::{
    ArrayRef, BooleanArray, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    StringArray,
};
use duckdb::arrow::datatypes::{DataType, Field, Schema};
use duckdb::arrow::record_batch::RecordBatch;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, Connection, Decode, Executor, Postgres, Row, Statement, Type, TypeInfo};
use tracing::{debug, info};

use crate::backend::BackendError;
use crate::error::{CatalogError, Result};
use crate::frame::DataFrame;
use crate::registry::ClusterConfig;
use crate::types::PostgresSource;
use crate::DatadeckDb;

/// How a result column is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Boolean,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    /// NUMERIC, carried as float64
    Numeric,
    Text,
    Date,
    Timestamp,
    TimestampTz,
    Json,
    Uuid,
    /// Anything else: text when decodable, else null
    Other,
}

impl ColumnKind {
    /// Map a PostgreSQL type name (as reported by sqlx) to a decode strategy.
    pub fn from_type_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "BOOL" => Self::Boolean,
            "INT2" => Self::Int16,
            "INT4" => Self::Int32,
            "INT8" => Self::Int64,
            "FLOAT4" => Self::Float32,
            "FLOAT8" => Self::Float64,
            "NUMERIC" => Self::Numeric,
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" | "\"CHAR\"" | "CITEXT" => Self::Text,
            "DATE" => Self::Date,
            "TIMESTAMP" => Self::Timestamp,
            "TIMESTAMPTZ" => Self::TimestampTz,
            "JSON" | "JSONB" => Self::Json,
            "UUID" => Self::Uuid,
            _ => Self::Other,
        }
    }

    pub fn arrow_type(&self) -> DataType {
        match self {
            Self::Boolean => DataType::Boolean,
            Self::Int16 => DataType::Int16,
            Self::Int32 => DataType::Int32,
            Self::Int64 => DataType::Int64,
            Self::Float32 => DataType::Float32,
            Self::Float64 | Self::Numeric => DataType::Float64,
            Self::Text
            | Self::Date
            | Self::Timestamp
            | Self::TimestampTz
            | Self::Json
            | Self::Uuid
            | Self::Other => DataType::Utf8,
        }
    }
}

/// A resolved external dataset: the stored query plus the cluster it runs on.
#[derive(Debug, Clone)]
pub struct PostgresConnection {
    table_name: String,
    source: PostgresSource,
    cluster: ClusterConfig,
}

impl PostgresConnection {
    /// `cluster` is the registry entry; per-dataset overrides are applied here.
    pub(crate) fn new(table_name: &str, source: PostgresSource, cluster: &ClusterConfig) -> Self {
        let cluster = cluster.with_overrides(source.friendly_name.as_deref());
        Self {
            table_name: table_name.to_string(),
            source,
            cluster,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn cluster_name(&self) -> &str {
        &self.source.cluster
    }

    pub fn database(&self) -> &str {
        &self.source.database
    }

    pub fn source(&self) -> &PostgresSource {
        &self.source
    }

    /// Cluster coordinates after per-dataset overrides.
    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    /// Display name: dataset override, else the cluster's, else `cluster/database`.
    pub fn friendly_name(&self) -> String {
        match self
            .cluster
            .friendly_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
        {
            Some(name) => name.to_string(),
            None => format!("{}/{}", self.source.cluster, self.source.database),
        }
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.cluster.host)
            .port(self.cluster.port)
            .username(&self.cluster.user)
            .database(&self.source.database);
        if let Some(password) = &self.cluster.password {
            options = options.password(password);
        }
        if let Some(app) = &self.cluster.application_name {
            options = options.application_name(app);
        }
        options
    }

    /// Open one connection to the dataset's database.
    pub async fn connect(&self) -> Result<PgConnection> {
        let timeout = Duration::from_secs(self.cluster.connect_timeout_secs);
        let options = self.connect_options();
        match tokio::time::timeout(timeout, PgConnection::connect_with(&options)).await {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(CatalogError::External(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!(
                    "connecting to cluster '{}' timed out after {:?}",
                    self.source.cluster, timeout
                ),
            )))),
        }
    }

    /// Run the stored query, apply the post-process expression if any, and
    /// count a hit on the dataset's catalog entry.
    pub async fn get_dataframe(&self, db: &DatadeckDb) -> Result<DataFrame> {
        let mut conn = self.connect().await?;
        let fetched = fetch_frame(&mut conn, &self.source.query).await;
        if let Err(err) = conn.close().await {
            debug!(cluster = %self.source.cluster, error = %err, "Error closing cluster connection");
        }
        let mut frame = fetched?;
        info!(
            table = %self.table_name,
            cluster = %self.source.cluster,
            database = %self.source.database,
            rows = frame.num_rows(),
            "Fetched external dataset"
        );

        if let Some(expression) = self.source.post_process.clone() {
            let processor = db.post_processor();
            frame =
                tokio::task::spawn_blocking(move || processor.apply(&expression, frame)).await??;
        }

        let db = db.clone();
        let name = self.table_name.clone();
        tokio::task::spawn_blocking(move || db.log_table_usage(&[name], None)).await??;
        Ok(frame)
    }
}

/// Run `query` on `conn` and collect the full result.
///
/// The statement is prepared first so an empty result still has columns.
pub async fn fetch_frame(conn: &mut PgConnection, query: &str) -> Result<DataFrame> {
    let statement = (&mut *conn).prepare(query).await?;
    let columns: Vec<(String, ColumnKind)> = statement
        .columns()
        .iter()
        .map(|c| (c.name().to_string(), ColumnKind::from_type_name(c.type_info().name())))
        .collect();
    let rows = statement.query().fetch_all(&mut *conn).await?;
    rows_to_frame(&columns, &rows)
}

fn rows_to_frame(columns: &[(String, ColumnKind)], rows: &[PgRow]) -> Result<DataFrame> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, kind)| Field::new(name, kind.arrow_type(), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));
    if columns.is_empty() {
        return Ok(DataFrame::empty(schema));
    }

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for (index, (_, kind)) in columns.iter().enumerate() {
        arrays.push(build_array(*kind, rows, index)?);
    }
    let batch = RecordBatch::try_new(schema, arrays).map_err(BackendError::from)?;
    Ok(DataFrame::new(batch))
}

fn collect<T>(rows: &[PgRow], index: usize) -> Result<Vec<Option<T>>>
where
    T: for<'r> Decode<'r, Postgres> + Type<Postgres>,
{
    rows.iter()
        .map(|row| row.try_get::<Option<T>, _>(index).map_err(CatalogError::from))
        .collect()
}

fn to_text<T, F>(rows: &[PgRow], index: usize, render: F) -> Result<ArrayRef>
where
    T: for<'r> Decode<'r, Postgres> + Type<Postgres>,
    F: Fn(T) -> String,
{
    let values: Vec<Option<String>> = collect::<T>(rows, index)?
        .into_iter()
        .map(|v| v.map(&render))
        .collect();
    Ok(Arc::new(StringArray::from(values)))
}

fn build_array(kind: ColumnKind, rows: &[PgRow], index: usize) -> Result<ArrayRef> {
    let array: ArrayRef = match kind {
        ColumnKind::Boolean => Arc::new(BooleanArray::from(collect::<bool>(rows, index)?)),
        ColumnKind::Int16 => Arc::new(Int16Array::from(collect::<i16>(rows, index)?)),
        ColumnKind::Int32 => Arc::new(Int32Array::from(collect::<i32>(rows, index)?)),
        ColumnKind::Int64 => Arc::new(Int64Array::from(collect::<i64>(rows, index)?)),
        ColumnKind::Float32 => Arc::new(Float32Array::from(collect::<f32>(rows, index)?)),
        ColumnKind::Float64 => Arc::new(Float64Array::from(collect::<f64>(rows, index)?)),
        ColumnKind::Numeric => {
            let values: Vec<Option<f64>> = collect::<Decimal>(rows, index)?
                .into_iter()
                .map(|v| v.and_then(|d| d.to_f64()))
                .collect();
            Arc::new(Float64Array::from(values))
        }
        ColumnKind::Text => Arc::new(StringArray::from(collect::<String>(rows, index)?)),
        ColumnKind::Date => to_text::<NaiveDate, _>(rows, index, |d| d.to_string())?,
        ColumnKind::Timestamp => to_text::<NaiveDateTime, _>(rows, index, |ts| {
            ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
        })?,
        ColumnKind::TimestampTz => {
            to_text::<DateTime<Utc>, _>(rows, index, |ts| ts.to_rfc3339())?
        }
        ColumnKind::Json => to_text::<serde_json::Value, _>(rows, index, |v| v.to_string())?,
        ColumnKind::Uuid => to_text::<sqlx::types::Uuid, _>(rows, index, |u| u.to_string())?,
        ColumnKind::Other => {
            let values: Vec<Option<String>> = rows
                .iter()
                .map(|row| row.try_get::<Option<String>, _>(index).ok().flatten())
                .collect();
            Arc::new(StringArray::from(values))
        }
    };
    Ok(array)
}
