//! Spreadsheet-to-database import pipeline.
//!
//! This module turns an uploaded `.csv`, `.xls` or `.xlsx` file into a
//! freshly created PostgreSQL table, bulk-loads the file's rows into it,
//! and hands the table to a stored procedure for domain-specific
//! post-processing.
//!
//! # Architecture Overview
//!
//! - **`parser`**: Reads the uploaded file into a [`TabularDataset`],
//!   taking the first row as column names and detecting each column's
//!   value type from its cells.
//!
//! - **`schema`**: Maps detected value types onto the storage types the
//!   staging table will declare, and sanitizes table names.
//!
//! - **`provisioner`**: Renders and executes the `CREATE TABLE`
//!   statement for the staging table.
//!
//! - **`loader`**: Bulk-copies dataset rows into the staging table in
//!   chunks, falling back to row-at-a-time inserts when a chunk fails.
//!
//! - **`runner`**: Runs DDL and stored procedures on background tasks
//!   with cooperative cancellation, one job per session.
//!
//! - **`progress`**: Session-scoped message log the polling endpoint
//!   drains while a job runs.
//!
//! # Data Flow
//!
//! 1. **Upload**: The HTTP layer saves the raw file and remembers it on
//!    the session.
//! 2. **Parse**: The parser produces columns, rows and detected types.
//! 3. **Provision**: A staging table named after the file is created and
//!    the DDL is awaited.
//! 4. **Load**: Rows are bulk-copied into the staging table.
//! 5. **Post-process**: When every row landed, the configured stored
//!    procedure is started in the background and the client follows it
//!    through the progress endpoint.
//!
//! A load with row errors stops the pipeline before the stored
//! procedure: partial staging data is never post-processed.

pub mod dataset;
pub mod error;
pub mod loader;
pub mod parser;
pub mod progress;
pub mod provisioner;
pub mod runner;
pub mod schema;

pub use dataset::{Column, NativeType, TabularDataset};
pub use error::ImportError;
pub use loader::{BulkLoader, LoadReport};
pub use progress::ProgressLog;
pub use runner::{CommandParameter, CommandSpec, JobHandle, JobRunner, ParamValue};
pub use schema::StorageType;

use crate::config::ImportConfig;
use crate::session::{SessionContext, UploadedSpreadsheet};
use rocket_db_pools::sqlx::PgPool;
use std::path::Path;

/// Result of one full import run.
#[derive(Debug)]
pub struct ImportOutcome {
    /// Sanitized name of the staging table that was created.
    pub table_name: String,
    /// Column names with the storage types they were declared with.
    pub columns: Vec<(String, StorageType)>,
    /// Number of data rows parsed from the file.
    pub rows_parsed: usize,
    /// What the bulk load did.
    pub load: LoadReport,
    /// Stored procedure started after the load, when the load was clean.
    pub procedure: Option<String>,
}

/// Drives one upload through parse, provision, load and post-process.
pub struct ImportCoordinator {
    pool: PgPool,
    config: ImportConfig,
}

impl ImportCoordinator {
    pub fn new(pool: PgPool, config: ImportConfig) -> Self {
        Self { pool, config }
    }

    /// Import the session's uploaded spreadsheet.
    ///
    /// Type mapping happens before any database work, so a file with an
    /// unmappable column fails without creating a table. The stored
    /// procedure runs in the background; everything before it completes
    /// before this returns.
    pub async fn run(
        &self,
        session: &SessionContext,
        upload: &UploadedSpreadsheet,
        procedure_override: Option<&str>,
    ) -> Result<ImportOutcome, ImportError> {
        let dataset = parser::parse_spreadsheet(&upload.path).await?;

        let stem = Path::new(&upload.file_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        let table_name = schema::sanitize_table_name(stem);
        if table_name.is_empty() {
            return Err(ImportError::MalformedInput(format!(
                "file name '{}' leaves no usable table name",
                upload.file_name
            )));
        }

        let mut columns = Vec::with_capacity(dataset.column_count());
        for column in dataset.columns() {
            columns.push((column.name.clone(), schema::storage_type(column.native)?));
        }
        let storage: Vec<StorageType> = columns.iter().map(|(_, st)| *st).collect();

        log::info!(
            "session {}: importing {} rows x {} columns from '{}' into \"{}\"",
            session.id,
            dataset.row_count(),
            dataset.column_count(),
            upload.file_name,
            table_name
        );

        let runner = JobRunner::new(self.pool.clone());
        provisioner::provision_table(&runner, session, &table_name, &columns).await?;

        let loader = BulkLoader::new(self.pool.clone(), self.config.insert_chunk_size);
        let load = loader.load(&table_name, &dataset, &storage).await?;

        if !load.succeeded() {
            log::warn!(
                "session {}: load into \"{}\" had {} row errors; stored procedure skipped",
                session.id,
                table_name,
                load.row_errors.len()
            );
            return Ok(ImportOutcome {
                table_name,
                columns,
                rows_parsed: dataset.row_count(),
                load,
                procedure: None,
            });
        }

        let procedure = procedure_override
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_procedure.clone());

        let mut parameters = vec![CommandParameter::new(
            "TransactionTable",
            ParamValue::Text(table_name.clone()),
        )];
        if self.config.cleanup_parameter {
            parameters.push(CommandParameter::new(
                "CleanupTable",
                ParamValue::Boolean(true),
            ));
        }

        runner
            .start(session, CommandSpec::procedure(procedure.clone(), parameters))
            .await?;

        Ok(ImportOutcome {
            table_name,
            columns,
            rows_parsed: dataset.row_count(),
            load,
            procedure: Some(procedure),
        })
    }
}
