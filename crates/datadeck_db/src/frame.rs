//! In-memory tabular data exchanged between the stores and callers.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use duckdb::arrow::array::{Array, ArrayRef};
use duckdb::arrow::compute::concat_batches;
use duckdb::arrow::datatypes::{DataType, Schema, SchemaRef};
use duckdb::arrow::record_batch::RecordBatch;
use duckdb::arrow::util::display::array_value_to_string;
use tracing::{debug, info};

use crate::backend::{hash_sql, quote_ident, BackendError, DbConnection};
use crate::schema::DATASETS_SCHEMA;

/// Prefix of the transient tables used while replacing a dataset.
pub(crate) const STAGE_PREFIX: &str = "__datadeck_stage_";

/// A query result or ingestion payload: one Arrow record batch.
#[derive(Debug, Clone)]
pub struct DataFrame {
    batch: RecordBatch,
}

impl DataFrame {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    /// Frame with the given columns and no rows.
    pub fn empty(schema: SchemaRef) -> Self {
        Self {
            batch: RecordBatch::new_empty(schema),
        }
    }

    /// Build a frame from named columns of equal length.
    pub fn from_columns(columns: Vec<(&str, ArrayRef)>) -> Result<Self, BackendError> {
        let batch = RecordBatch::try_from_iter(columns)?;
        Ok(Self { batch })
    }

    /// Concatenate result batches sharing `schema` into one frame.
    pub fn from_batches(schema: SchemaRef, batches: &[RecordBatch]) -> Result<Self, BackendError> {
        let batch = match batches.len() {
            0 => RecordBatch::new_empty(schema),
            1 => batches[0].clone(),
            _ => concat_batches(&schema, batches)?,
        };
        Ok(Self { batch })
    }

    /// Read a CSV file through DuckDB's type sniffing.
    ///
    /// Runs in a private in-memory database, so the file never touches a store.
    pub fn read_csv(path: &Path) -> Result<Self, BackendError> {
        if !path.is_file() {
            return Err(BackendError::InvalidInput(format!(
                "CSV file not found: {}",
                path.display()
            )));
        }
        let conn = DbConnection::from_raw(duckdb::Connection::open_in_memory()?);
        let literal = path.to_string_lossy().replace('\'', "''");
        let frame = conn.query_frame(&format!("SELECT * FROM read_csv_auto('{}')", literal), &[])?;
        debug!(
            path = %path.display(),
            rows = frame.num_rows(),
            columns = frame.num_columns(),
            "Read CSV"
        );
        Ok(frame)
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&ArrayRef> {
        self.batch.column_by_name(name)
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_batch(self) -> RecordBatch {
        self.batch
    }

    /// First `n` rows (or fewer).
    pub fn head(&self, n: usize) -> Self {
        let len = n.min(self.batch.num_rows());
        Self {
            batch: self.batch.slice(0, len),
        }
    }

    /// Values of one column rendered as text, `None` for nulls.
    pub fn column_as_strings(&self, name: &str) -> Option<Vec<Option<String>>> {
        let column = self.batch.column_by_name(name)?;
        Some(
            (0..column.len())
                .map(|row| {
                    if column.is_null(row) {
                        None
                    } else {
                        array_value_to_string(column, row).ok()
                    }
                })
                .collect(),
        )
    }

    /// All rows rendered as text (nulls as empty strings), for display.
    pub fn to_string_rows(&self) -> Vec<Vec<String>> {
        (0..self.batch.num_rows())
            .map(|row| {
                self.batch
                    .columns()
                    .iter()
                    .map(|col| {
                        if col.is_null(row) {
                            String::new()
                        } else {
                            array_value_to_string(col, row)
                                .unwrap_or_else(|_| format!("<{}>", col.data_type()))
                        }
                    })
                    .collect()
            })
            .collect()
    }
}

fn arrow_to_duckdb_type(dt: &DataType) -> String {
    match dt {
        DataType::Boolean => "BOOLEAN".to_string(),
        DataType::Int8 => "TINYINT".to_string(),
        DataType::Int16 => "SMALLINT".to_string(),
        DataType::Int32 => "INTEGER".to_string(),
        DataType::Int64 => "BIGINT".to_string(),
        DataType::UInt8 => "UTINYINT".to_string(),
        DataType::UInt16 => "USMALLINT".to_string(),
        DataType::UInt32 => "UINTEGER".to_string(),
        DataType::UInt64 => "UBIGINT".to_string(),
        DataType::Float16 | DataType::Float32 => "FLOAT".to_string(),
        DataType::Float64 => "DOUBLE".to_string(),
        DataType::Utf8 | DataType::LargeUtf8 => "VARCHAR".to_string(),
        DataType::Binary | DataType::LargeBinary => "BLOB".to_string(),
        DataType::Date32 => "DATE".to_string(),
        DataType::Timestamp(_, tz) => {
            if tz.is_some() {
                "TIMESTAMPTZ".to_string()
            } else {
                "TIMESTAMP".to_string()
            }
        }
        DataType::Decimal128(precision, scale) => {
            format!("DECIMAL({}, {})", precision, scale)
        }
        _ => "VARCHAR".to_string(),
    }
}

fn stage_table_name(table_name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seed = format!("{}:{}", table_name, nanos);
    format!("{}{}", STAGE_PREFIX, hash_sql(&seed))
}

/// Replace `datasets.<table_name>` with the contents of `frame`.
///
/// Rows land in a stage table first; the old table is dropped and the stage
/// renamed inside one transaction, so readers see either the old or the new
/// contents.
pub(crate) fn materialize(
    conn: &DbConnection,
    table_name: &str,
    frame: &DataFrame,
) -> Result<u64, BackendError> {
    let stage_table = stage_table_name(table_name);
    let stage = format!("{}.{}", DATASETS_SCHEMA, quote_ident(&stage_table));
    let target = format!("{}.{}", DATASETS_SCHEMA, quote_ident(table_name));

    create_table_for(conn, &stage, frame)?;

    let staged = append_rows(conn, DATASETS_SCHEMA, &stage_table, frame).and_then(|rows| {
        conn.transaction(|tx| {
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", target))?;
            tx.execute_batch(&format!(
                "ALTER TABLE {} RENAME TO {}",
                stage,
                quote_ident(table_name)
            ))?;
            Ok(rows)
        })
    });

    match staged {
        Ok(rows) => {
            info!(table = table_name, rows, "Materialized dataset");
            Ok(rows)
        }
        Err(err) => {
            if let Err(cleanup) = conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", stage)) {
                debug!(stage = %stage_table, error = %cleanup, "Failed to drop stage table");
            }
            Err(err)
        }
    }
}

/// Create `schema_name.table` with the frame's columns and copy its rows in.
pub(crate) fn load_table(
    conn: &DbConnection,
    schema_name: &str,
    table: &str,
    frame: &DataFrame,
) -> Result<u64, BackendError> {
    let qualified = format!("{}.{}", quote_ident(schema_name), quote_ident(table));
    create_table_for(conn, &qualified, frame)?;
    append_rows(conn, schema_name, table, frame)
}

fn create_table_for(
    conn: &DbConnection,
    qualified: &str,
    frame: &DataFrame,
) -> Result<(), BackendError> {
    let schema: &Schema = &frame.schema();
    let columns: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| {
            let sql_type = arrow_to_duckdb_type(f.data_type());
            let nullable = if f.is_nullable() { "" } else { " NOT NULL" };
            format!("{} {}{}", quote_ident(f.name()), sql_type, nullable)
        })
        .collect();
    conn.execute_batch(&format!(
        "CREATE TABLE {} ({})",
        qualified,
        columns.join(", ")
    ))
}

fn append_rows(
    conn: &DbConnection,
    schema_name: &str,
    table: &str,
    frame: &DataFrame,
) -> Result<u64, BackendError> {
    let rows = frame.num_rows() as u64;
    if rows == 0 {
        return Ok(0);
    }
    let mut appender = conn.raw().appender_to_db(table, schema_name)?;
    appender.append_record_batch(frame.batch().clone())?;
    appender.flush()?;
    Ok(rows)
}
