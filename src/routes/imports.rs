//! Import endpoints: upload, start, progress polling, cancel, and the
//! stored-procedure listing.

use crate::config::ImportConfig;
use crate::error::ApiError;
use crate::import::progress::render_html;
use crate::import::{ImportCoordinator, ImportError, parser};
use crate::session::{ImportSession, SessionContext, UploadedSpreadsheet};
use chrono::Utc;
use rocket::data::{Data, ToByteUnit};
use rocket::{State, get, post, serde::json::Json};
use rocket_db_pools::sqlx;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest accepted upload.
const MAX_UPLOAD_MIB: u64 = 512;

/// How many row errors a failed load reports before truncating.
const MAX_REPORTED_ROW_ERRORS: usize = 5;

/// Response returned once an upload has been staged.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct UploadResponse {
    /// Original file name, stripped of any path components.
    #[serde(rename = "fileName")]
    pub file_name: String,
    /// Bytes written to disk.
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
    /// Human-readable summary message.
    pub message: String,
}

/// One staging table column as declared by the import.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ColumnInfo {
    /// Column name taken from the file's header row.
    pub name: String,
    /// Declared storage type, e.g. `VARCHAR(255)`.
    pub storage: String,
}

/// Response returned when an import has loaded cleanly.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct StartImportResponse {
    /// Name of the staging table that was created.
    #[serde(rename = "tableName")]
    pub table_name: String,
    /// Columns the staging table was declared with.
    pub columns: Vec<ColumnInfo>,
    /// Data rows parsed from the file.
    #[serde(rename = "rowsParsed")]
    pub rows_parsed: usize,
    /// Rows copied into the staging table.
    #[serde(rename = "rowsCopied")]
    pub rows_copied: usize,
    /// Stored procedure now running in the background.
    pub procedure: Option<String>,
    /// Human-readable summary message.
    pub message: String,
}

/// Progress lines drained by one poll.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ProgressResponse {
    /// Whether the session's job is still running.
    pub running: bool,
    /// Messages queued since the last poll, oldest first.
    pub lines: Vec<String>,
    /// The same messages escaped and joined with `<br>`.
    pub html: String,
}

/// Simple message wrapper for acknowledgement responses.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MessageResponse {
    /// Response text.
    pub message: String,
}

/// Stored procedures callable by imports.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ProceduresResponse {
    pub procedures: Vec<String>,
}

/// Receive a spreadsheet as the raw request body and stage it for the
/// session's next import.
///
/// Only `.csv`, `.xls` and `.xlsx` files are kept; anything else is
/// deleted from disk and rejected. Uploading again replaces the
/// session's staged file.
#[openapi(skip)]
#[post("/imports/upload?<filename>", data = "<file>")]
pub async fn upload_spreadsheet(
    session: ImportSession,
    config: &State<ImportConfig>,
    filename: &str,
    file: Data<'_>,
) -> Result<Json<UploadResponse>, ApiError> {
    let context = session.0;

    let file_name = Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid file name '{}'", filename)))?;

    // Saved under a session-specific name so concurrent sessions
    // uploading the same file name cannot clobber each other.
    let destination = config
        .upload_dir
        .join(staged_file_name(&context, &file_name));

    let saved = file
        .open(MAX_UPLOAD_MIB.mebibytes())
        .into_file(&destination)
        .await
        .map_err(|e| ApiError::InternalError(format!("could not save upload: {}", e)))?;

    if !saved.is_complete() {
        let _ = tokio::fs::remove_file(&destination).await;
        return Err(ApiError::BadRequest(format!(
            "upload exceeds the {} MiB limit",
            MAX_UPLOAD_MIB
        )));
    }

    if parser::accepted_extension(Path::new(&file_name)).is_none() {
        if let Err(e) = tokio::fs::remove_file(&destination).await {
            log::warn!(
                "could not delete rejected upload '{}': {}",
                destination.display(),
                e
            );
        }
        let extension = Path::new(&file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        return Err(ImportError::unsupported_format(extension).into());
    }

    let size_bytes = saved.n.written;
    log::info!(
        "session {}: staged upload '{}' ({} bytes)",
        context.id,
        file_name,
        size_bytes
    );

    let displaced = context.replace_upload(UploadedSpreadsheet {
        file_name: file_name.clone(),
        path: destination.clone(),
    });
    if let Some(previous) = displaced {
        if previous.path != destination {
            if let Err(e) = tokio::fs::remove_file(&previous.path).await {
                log::debug!(
                    "could not delete superseded upload '{}': {}",
                    previous.path.display(),
                    e
                );
            }
        }
    }

    Ok(Json(UploadResponse {
        file_name,
        size_bytes,
        message: "Upload staged for import.".to_string(),
    }))
}

/// Staged uploads are named `<sanitized id>_<session tag>_<original name>`.
/// Sanitizing is lossy, so it is the per-session tag that keeps files of
/// different sessions apart.
fn staged_file_name(context: &SessionContext, file_name: &str) -> String {
    format!("{}_{}_{}", disk_safe(&context.id), context.disk_tag, file_name)
}

fn disk_safe(session_id: &str) -> String {
    let cleaned: String = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .collect();
    if cleaned.is_empty() {
        "session".to_string()
    } else {
        cleaned
    }
}

/// Import the session's staged spreadsheet.
///
/// Parses the file, creates a staging table named after it, bulk-loads
/// every row, and starts the stored procedure in the background. The
/// procedure's progress is followed through the progress endpoint. A
/// load with row errors stops before the stored procedure and reports
/// the failing rows.
#[openapi(tag = "Imports")]
#[post("/imports/start?<procedure>")]
pub async fn start_import(
    session: ImportSession,
    pool: &State<sqlx::PgPool>,
    config: &State<ImportConfig>,
    procedure: Option<String>,
) -> Result<Json<StartImportResponse>, ApiError> {
    let context = session.0;
    let upload = context.current_upload().ok_or(ImportError::NothingUploaded)?;

    let coordinator = ImportCoordinator::new(pool.inner().clone(), config.inner().clone());
    let outcome = coordinator
        .run(&context, &upload, procedure.as_deref())
        .await?;

    if !outcome.load.succeeded() {
        let shown = outcome
            .load
            .row_errors
            .iter()
            .take(MAX_REPORTED_ROW_ERRORS)
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        let rest = outcome
            .load
            .row_errors
            .len()
            .saturating_sub(MAX_REPORTED_ROW_ERRORS);
        let suffix = if rest > 0 {
            format!(" (and {} more)", rest)
        } else {
            String::new()
        };
        return Err(ApiError::BadRequest(format!(
            "Could not load this spreadsheet into the database: {}{}",
            shown, suffix
        )));
    }

    let columns = outcome
        .columns
        .iter()
        .map(|(name, storage)| ColumnInfo {
            name: name.clone(),
            storage: storage.to_string(),
        })
        .collect();

    let message = match &outcome.procedure {
        Some(procedure) => format!(
            "Loaded {} rows into \"{}\"; stored procedure \"{}\" running.",
            outcome.load.rows_copied, outcome.table_name, procedure
        ),
        None => format!(
            "Loaded {} rows into \"{}\".",
            outcome.load.rows_copied, outcome.table_name
        ),
    };

    Ok(Json(StartImportResponse {
        table_name: outcome.table_name,
        columns,
        rows_parsed: outcome.rows_parsed,
        rows_copied: outcome.load.rows_copied,
        procedure: outcome.procedure,
        message,
    }))
}

/// Drain queued progress lines for the session's job.
///
/// Clients poll this while a job runs; each line is delivered exactly
/// once. Once a finished job has been observed its record is released,
/// and a poll with no job on record reports not running and discards
/// any stale lines.
#[openapi(tag = "Imports")]
#[get("/imports/progress")]
pub async fn poll_progress(session: ImportSession) -> Json<ProgressResponse> {
    let context = session.0;
    let mut slot = context.job.lock().await;

    match slot.as_ref() {
        Some(handle) => {
            // Flag first, then drain: a drain observing the job finished
            // always includes the job's final message.
            let running = handle.is_running();
            let lines = context.progress.drain();
            if !running {
                *slot = None;
            }
            Json(ProgressResponse {
                running,
                html: render_html(&lines),
                lines,
            })
        }
        None => {
            context.progress.clear();
            Json(ProgressResponse {
                running: false,
                lines: Vec::new(),
                html: String::new(),
            })
        }
    }
}

/// Stop the session's background job.
///
/// Cancellation is cooperative and best-effort: the client side stops
/// immediately, but the database server may still finish the statement
/// it was executing.
#[openapi(tag = "Imports")]
#[post("/imports/cancel")]
pub async fn cancel_import(session: ImportSession) -> Json<MessageResponse> {
    let context = session.0;
    let handle = context.job.lock().await.take();

    match handle {
        Some(handle) => {
            handle.stop().await;
            let ran_for = Utc::now().signed_duration_since(handle.started_at);
            log::info!(
                "session {}: job {} ({}) stopped by request after {}s",
                context.id,
                handle.id,
                handle.label(),
                ran_for.num_seconds()
            );
            Json(MessageResponse {
                message: "Job stopped. The server may still finish the statement it was executing."
                    .to_string(),
            })
        }
        None => Json(MessageResponse {
            message: "No job is running for this session.".to_string(),
        }),
    }
}

/// List stored procedures an import may invoke after loading.
#[openapi(tag = "Imports")]
#[get("/imports/procedures")]
pub async fn list_procedures(
    pool: &State<sqlx::PgPool>,
) -> Result<Json<ProceduresResponse>, ApiError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT routine_name FROM information_schema.routines \
         WHERE routine_type = 'PROCEDURE' \
         AND specific_schema NOT IN ('pg_catalog', 'information_schema') \
         ORDER BY routine_name",
    )
    .fetch_all(pool.inner())
    .await?;

    Ok(Json(ProceduresResponse {
        procedures: rows.into_iter().map(|(name,)| name).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;

    #[test]
    fn test_disk_safe_keeps_only_filename_characters() {
        assert_eq!(disk_safe("alpha"), "alpha");
        assert_eq!(disk_safe("a b/c"), "abc");
        assert_eq!(disk_safe("under_score-dash"), "under_score-dash");
        assert_eq!(disk_safe("../.."), "session");
    }

    #[test]
    fn test_staged_names_differ_for_ids_that_sanitize_alike() {
        let registry = SessionRegistry::new();
        let first = registry.context("a b");
        let second = registry.context("ab");

        let first_name = staged_file_name(&first, "donors.csv");
        let second_name = staged_file_name(&second, "donors.csv");
        assert_ne!(first_name, second_name);

        // Re-uploading the same file in the same session reuses the name,
        // so the replacement lands on top of the original.
        assert_eq!(first_name, staged_file_name(&first, "donors.csv"));
    }
}
