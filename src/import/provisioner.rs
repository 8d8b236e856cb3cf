//! Staging table creation for parsed datasets.
//!
//! The statement is executed through the job runner like any other
//! background command, but provisioning waits for it to finish before
//! returning: the loader must never race its own CREATE TABLE. No
//! existence check is made first; re-importing a file whose table is
//! still present fails loudly in the progress log instead of silently
//! appending to stale data.

use crate::import::error::ImportError;
use crate::import::runner::{CommandSpec, JobRunner};
use crate::import::schema::{StorageType, quote_identifier};
use crate::session::SessionContext;

/// Render the `CREATE TABLE` statement for `table` with one line per
/// column. Identifiers are double-quoted so detected column names keep
/// their case and spacing.
pub fn create_table_statement(table: &str, columns: &[(String, StorageType)]) -> String {
    let mut sql = format!("CREATE TABLE \"{}\" (\n", quote_identifier(table));
    for (name, storage) in columns {
        sql.push_str(&format!("\"{}\" {},\n", quote_identifier(name), storage));
    }
    let trimmed = sql.trim_end_matches([',', '\n']).to_string();
    format!("{}\n)", trimmed)
}

/// Create the staging table and wait for the DDL to finish.
pub async fn provision_table(
    runner: &JobRunner,
    session: &SessionContext,
    table: &str,
    columns: &[(String, StorageType)],
) -> Result<(), ImportError> {
    let statement = create_table_statement(table, columns);
    log::debug!("session {}: provisioning table \"{}\"", session.id, table);

    let handle = runner
        .start(session, CommandSpec::statement(statement))
        .await?;
    handle.wait().await;

    Ok(())
}
