//! Mapping from detected column types to PostgreSQL storage types.

use crate::import::dataset::NativeType;
use crate::import::error::ImportError;
use std::fmt;

/// Width given to text columns whose size is unknown.
pub const DEFAULT_TEXT_WIDTH: u32 = 255;

/// Column types the provisioner knows how to declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Varchar(u32),
    Real,
    Int,
    BigInt,
    Timestamp,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Varchar(width) => write!(f, "VARCHAR({})", width),
            StorageType::Real => write!(f, "REAL"),
            StorageType::Int => write!(f, "INT"),
            StorageType::BigInt => write!(f, "BIGINT"),
            StorageType::Timestamp => write!(f, "TIMESTAMP"),
        }
    }
}

/// Map a detected column type onto a storage type.
///
/// Decimals with a fractional part become `REAL`; whole-number decimals
/// become `INT` or `BIGINT` depending on whether their precision fits in
/// ten digits. Types with no mapping (booleans, for instance) abort the
/// import before any table is created.
pub fn storage_type(native: NativeType) -> Result<StorageType, ImportError> {
    match native {
        NativeType::Text { size } => {
            let width = if size < 0 {
                DEFAULT_TEXT_WIDTH
            } else {
                size as u32
            };
            Ok(StorageType::Varchar(width))
        }
        NativeType::Decimal { scale, .. } if scale > 0 => Ok(StorageType::Real),
        NativeType::Decimal { precision, .. } if precision > 10 => Ok(StorageType::BigInt),
        NativeType::Decimal { .. } => Ok(StorageType::Int),
        NativeType::Double | NativeType::Single => Ok(StorageType::Real),
        NativeType::Int64 => Ok(StorageType::BigInt),
        NativeType::Int32 | NativeType::Int16 => Ok(StorageType::Int),
        NativeType::DateTime => Ok(StorageType::Timestamp),
        other => Err(ImportError::unsupported_type(other.name())),
    }
}

/// Strip every character that is not ASCII alphanumeric or an underscore.
///
/// Applying it to an already-sanitized name returns the name unchanged.
pub fn sanitize_table_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Escape an identifier for embedding between double quotes.
pub(crate) fn quote_identifier(raw: &str) -> String {
    raw.replace('"', "\"\"")
}
