//! Environment-driven configuration for the import pipeline.

use std::env;
use std::path::PathBuf;

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Settings controlling uploads and the post-load stored procedure.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Directory uploaded spreadsheets are saved into.
    pub upload_dir: PathBuf,
    /// Stored procedure invoked after a clean load unless the request
    /// names another one.
    pub default_procedure: String,
    /// Whether the stored procedure receives a `CleanupTable` parameter
    /// asking it to drop the staging table when it is done.
    pub cleanup_parameter: bool,
    /// Rows per bulk-insert statement.
    pub insert_chunk_size: usize,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self {
            upload_dir: PathBuf::from(env_string("IMPORT_UPLOAD_DIR", "./uploads")),
            default_procedure: env_string("IMPORT_DEFAULT_PROCEDURE", "import_transactions"),
            cleanup_parameter: env_bool("IMPORT_CLEANUP_PARAMETER", true),
            insert_chunk_size: env_usize("IMPORT_INSERT_CHUNK_SIZE", 1000),
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
