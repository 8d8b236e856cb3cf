use rocket_db_pools::sqlx;
use thiserror::Error;

/// Errors that occur while parsing an upload or moving it into the database.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unsupported file format '.{extension}', expected .csv, .xls or .xlsx")]
    UnsupportedFormat { extension: String },
    #[error("no storage mapping for {native} columns")]
    UnsupportedType { native: String },
    #[error("could not connect to the database: {0}")]
    ConnectionFailure(sqlx::Error),
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("no spreadsheet has been uploaded for this session")]
    NothingUploaded,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("workbook error: {0}")]
    Workbook(#[from] calamine::Error),
}

impl ImportError {
    pub fn unsupported_format(extension: impl Into<String>) -> Self {
        ImportError::UnsupportedFormat {
            extension: extension.into(),
        }
    }

    pub fn unsupported_type(native: impl Into<String>) -> Self {
        ImportError::UnsupportedType {
            native: native.into(),
        }
    }
}
