//! Bulk loading of parsed datasets into their staging tables.
//!
//! Rows go in through columnar `UNNEST` inserts, one array bind per
//! column, in chunks sized by configuration. When a chunk is rejected
//! the loader falls back to row-at-a-time inserts for that chunk so a
//! single bad row costs one row, not the whole file. Cells are converted
//! to typed values first; blank cells become NULL in every non-text
//! column, while text columns keep the empty string.

use crate::import::dataset::TabularDataset;
use crate::import::error::ImportError;
use crate::import::schema::{StorageType, quote_identifier};
use chrono::NaiveDateTime;
use rocket_db_pools::sqlx::postgres::PgArguments;
use rocket_db_pools::sqlx::query::Query;
use rocket_db_pools::sqlx::{self, PgPool, Postgres};

/// Outcome of one load: how many rows landed and what went wrong with
/// the rest. Row errors name the source line in the uploaded file,
/// counting the header as line one.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub rows_copied: usize,
    pub row_errors: Vec<String>,
}

impl LoadReport {
    pub fn succeeded(&self) -> bool {
        self.row_errors.is_empty()
    }
}

/// One cell converted for binding, tagged with its storage type.
#[derive(Debug, Clone)]
enum TypedValue {
    Null,
    Text(String),
    Real(f32),
    Int(i32),
    BigInt(i64),
    Timestamp(NaiveDateTime),
}

impl TypedValue {
    fn as_text(&self) -> Option<String> {
        match self {
            TypedValue::Text(value) => Some(value.clone()),
            _ => None,
        }
    }

    fn as_real(&self) -> Option<f32> {
        match self {
            TypedValue::Real(value) => Some(*value),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i32> {
        match self {
            TypedValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    fn as_bigint(&self) -> Option<i64> {
        match self {
            TypedValue::BigInt(value) => Some(*value),
            _ => None,
        }
    }

    fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            TypedValue::Timestamp(value) => Some(*value),
            _ => None,
        }
    }
}

pub struct BulkLoader {
    pool: PgPool,
    chunk_size: usize,
}

impl BulkLoader {
    pub fn new(pool: PgPool, chunk_size: usize) -> Self {
        Self {
            pool,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Copy every dataset row into `table`, which must already exist with
    /// the given storage layout.
    pub async fn load(
        &self,
        table: &str,
        dataset: &TabularDataset,
        storage: &[StorageType],
    ) -> Result<LoadReport, ImportError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(ImportError::ConnectionFailure)?;

        let column_names: Vec<&str> = dataset
            .columns()
            .iter()
            .map(|column| column.name.as_str())
            .collect();
        let bulk_sql = build_bulk_insert(table, &column_names, storage);
        let row_sql = build_row_insert(table, &column_names);

        let mut report = LoadReport::default();

        for (chunk_index, chunk) in dataset.rows().chunks(self.chunk_size).enumerate() {
            let base_row = chunk_index * self.chunk_size;

            // Convert the chunk first; rows that do not convert are
            // recorded and skipped without touching the database.
            let mut file_rows = Vec::with_capacity(chunk.len());
            let mut typed_rows: Vec<Vec<TypedValue>> = Vec::with_capacity(chunk.len());
            for (offset, row) in chunk.iter().enumerate() {
                let file_row = base_row + offset + 2;
                match convert_row(row, &column_names, storage) {
                    Ok(values) => {
                        file_rows.push(file_row);
                        typed_rows.push(values);
                    }
                    Err(why) => {
                        log::warn!("load into \"{}\": row {} skipped: {}", table, file_row, why);
                        report.row_errors.push(format!("row {}: {}", file_row, why));
                    }
                }
            }

            if typed_rows.is_empty() {
                continue;
            }

            let query = bind_columns(sqlx::query(&bulk_sql), storage, &typed_rows);
            match query.execute(&mut *conn).await {
                Ok(result) => {
                    report.rows_copied += result.rows_affected() as usize;
                }
                Err(e) => {
                    log::warn!(
                        "bulk insert of {} rows into \"{}\" failed ({}); retrying row by row",
                        typed_rows.len(),
                        table,
                        e
                    );
                    for (file_row, row) in file_rows.iter().zip(&typed_rows) {
                        let query = bind_row(sqlx::query(&row_sql), storage, row);
                        match query.execute(&mut *conn).await {
                            Ok(_) => report.rows_copied += 1,
                            Err(e) => {
                                log::warn!(
                                    "load into \"{}\": row {} failed: {}",
                                    table,
                                    file_row,
                                    e
                                );
                                report.row_errors.push(format!("row {}: {}", file_row, e));
                            }
                        }
                    }
                }
            }
        }

        log::info!(
            "loaded {} of {} rows into \"{}\" ({} errors)",
            report.rows_copied,
            dataset.row_count(),
            table,
            report.row_errors.len()
        );

        Ok(report)
    }
}

fn build_bulk_insert(table: &str, column_names: &[&str], storage: &[StorageType]) -> String {
    let columns = column_names
        .iter()
        .map(|name| format!("\"{}\"", quote_identifier(name)))
        .collect::<Vec<_>>()
        .join(", ");
    let arrays = storage
        .iter()
        .enumerate()
        .map(|(index, st)| format!("${}::{}[]", index + 1, array_type(*st)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO \"{}\" ({}) SELECT * FROM UNNEST({})",
        quote_identifier(table),
        columns,
        arrays
    )
}

fn build_row_insert(table: &str, column_names: &[&str]) -> String {
    let columns = column_names
        .iter()
        .map(|name| format!("\"{}\"", quote_identifier(name)))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=column_names.len())
        .map(|position| format!("${}", position))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        quote_identifier(table),
        columns,
        placeholders
    )
}

fn array_type(storage: StorageType) -> &'static str {
    match storage {
        StorageType::Varchar(_) => "varchar",
        StorageType::Real => "real",
        StorageType::Int => "int",
        StorageType::BigInt => "bigint",
        StorageType::Timestamp => "timestamp",
    }
}

fn convert_row(
    row: &[String],
    column_names: &[&str],
    storage: &[StorageType],
) -> Result<Vec<TypedValue>, String> {
    row.iter()
        .zip(storage)
        .zip(column_names)
        .map(|((cell, st), name)| {
            typed_cell(cell, *st).map_err(|why| format!("column \"{}\": {}", name, why))
        })
        .collect()
}

fn typed_cell(value: &str, storage: StorageType) -> Result<TypedValue, String> {
    match storage {
        StorageType::Varchar(_) => Ok(TypedValue::Text(value.to_string())),
        _ if value.trim().is_empty() => Ok(TypedValue::Null),
        StorageType::Real => value
            .trim()
            .parse::<f32>()
            .map(TypedValue::Real)
            .map_err(|_| format!("'{}' is not a REAL", value)),
        StorageType::Int => value
            .trim()
            .parse::<i32>()
            .map(TypedValue::Int)
            .map_err(|_| format!("'{}' is not an INT", value)),
        StorageType::BigInt => value
            .trim()
            .parse::<i64>()
            .map(TypedValue::BigInt)
            .map_err(|_| format!("'{}' is not a BIGINT", value)),
        StorageType::Timestamp => dateparser::parse(value.trim())
            .map(|parsed| TypedValue::Timestamp(parsed.naive_utc()))
            .map_err(|_| format!("'{}' is not a TIMESTAMP", value)),
    }
}

fn bind_columns<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    storage: &[StorageType],
    rows: &[Vec<TypedValue>],
) -> Query<'q, Postgres, PgArguments> {
    for (index, st) in storage.iter().enumerate() {
        query = match st {
            StorageType::Varchar(_) => query.bind(collect_column(rows, index, TypedValue::as_text)),
            StorageType::Real => query.bind(collect_column(rows, index, TypedValue::as_real)),
            StorageType::Int => query.bind(collect_column(rows, index, TypedValue::as_int)),
            StorageType::BigInt => query.bind(collect_column(rows, index, TypedValue::as_bigint)),
            StorageType::Timestamp => {
                query.bind(collect_column(rows, index, TypedValue::as_timestamp))
            }
        };
    }
    query
}

fn collect_column<T>(
    rows: &[Vec<TypedValue>],
    index: usize,
    accessor: fn(&TypedValue) -> Option<T>,
) -> Vec<Option<T>> {
    rows.iter().map(|row| accessor(&row[index])).collect()
}

fn bind_row<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    storage: &[StorageType],
    row: &[TypedValue],
) -> Query<'q, Postgres, PgArguments> {
    for (st, value) in storage.iter().zip(row) {
        query = match st {
            StorageType::Varchar(_) => query.bind(value.as_text()),
            StorageType::Real => query.bind(value.as_real()),
            StorageType::Int => query.bind(value.as_int()),
            StorageType::BigInt => query.bind(value.as_bigint()),
            StorageType::Timestamp => query.bind(value.as_timestamp()),
        };
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_insert_sql_shape() {
        let sql = build_bulk_insert(
            "donors",
            &["Name", "Amount"],
            &[StorageType::Varchar(255), StorageType::Real],
        );
        assert_eq!(
            sql,
            "INSERT INTO \"donors\" (\"Name\", \"Amount\") \
             SELECT * FROM UNNEST($1::varchar[], $2::real[])"
        );
    }

    #[test]
    fn test_row_insert_sql_shape() {
        let sql = build_row_insert("donors", &["Name", "Amount"]);
        assert_eq!(
            sql,
            "INSERT INTO \"donors\" (\"Name\", \"Amount\") VALUES ($1, $2)"
        );
    }

    #[test]
    fn test_typed_cell_text_keeps_empty_string() {
        let value = typed_cell("", StorageType::Varchar(255)).expect("converted");
        assert!(matches!(value, TypedValue::Text(ref s) if s.is_empty()));
    }

    #[test]
    fn test_typed_cell_blank_becomes_null_for_numbers() {
        assert!(matches!(
            typed_cell("  ", StorageType::Real).expect("converted"),
            TypedValue::Null
        ));
        assert!(matches!(
            typed_cell("", StorageType::Timestamp).expect("converted"),
            TypedValue::Null
        ));
    }

    #[test]
    fn test_typed_cell_parses_numbers() {
        assert!(matches!(
            typed_cell("10.50", StorageType::Real).expect("converted"),
            TypedValue::Real(_)
        ));
        assert!(matches!(
            typed_cell("42", StorageType::Int).expect("converted"),
            TypedValue::Int(42)
        ));
        assert!(matches!(
            typed_cell("3000000000", StorageType::BigInt).expect("converted"),
            TypedValue::BigInt(3_000_000_000)
        ));
    }

    #[test]
    fn test_typed_cell_rejects_garbage_numbers() {
        let err = typed_cell("ten", StorageType::Int).expect_err("rejected");
        assert!(err.contains("'ten'"));
    }

    #[test]
    fn test_typed_cell_parses_timestamps() {
        let value = typed_cell("2024-01-15 10:30:00", StorageType::Timestamp).expect("converted");
        assert!(matches!(value, TypedValue::Timestamp(_)));
    }

    #[test]
    fn test_convert_row_names_the_failing_column() {
        let err = convert_row(
            &["Ann".to_string(), "lots".to_string()],
            &["Name", "Amount"],
            &[StorageType::Varchar(255), StorageType::Real],
        )
        .expect_err("rejected");

        assert!(err.contains("column \"Amount\""));
        assert!(err.contains("'lots'"));
    }

    #[test]
    fn test_load_report_success_tracks_row_errors() {
        let clean = LoadReport {
            rows_copied: 2,
            row_errors: Vec::new(),
        };
        let dirty = LoadReport {
            rows_copied: 1,
            row_errors: vec!["row 3: bad".to_string()],
        };

        assert!(clean.succeeded());
        assert!(!dirty.succeeded());
    }
}
