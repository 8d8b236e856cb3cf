use crate::import::error::ImportError;
use std::collections::HashSet;

/// Value type detected for a column before any storage mapping is applied.
///
/// `Text` carries the declared maximum width in characters, with `-1`
/// meaning "unknown"; parsed files never know widths up front, so the
/// parser always reports `-1` and the storage mapping falls back to its
/// default bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeType {
    Text { size: i32 },
    Decimal { precision: u32, scale: u32 },
    Double,
    Single,
    Int64,
    Int32,
    Int16,
    DateTime,
    Bool,
}

impl NativeType {
    /// Short name used in error messages when no storage mapping exists.
    pub fn name(&self) -> &'static str {
        match self {
            NativeType::Text { .. } => "text",
            NativeType::Decimal { .. } => "decimal",
            NativeType::Double => "double",
            NativeType::Single => "single",
            NativeType::Int64 => "64-bit integer",
            NativeType::Int32 => "32-bit integer",
            NativeType::Int16 => "16-bit integer",
            NativeType::DateTime => "date-time",
            NativeType::Bool => "boolean",
        }
    }
}

/// A named column together with its detected value type.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub native: NativeType,
}

/// In-memory table produced by the parser: an ordered list of columns and
/// row-major cell data. Every row has exactly one cell per column; cells
/// are kept as strings and only converted to typed values at load time.
#[derive(Debug, Clone)]
pub struct TabularDataset {
    columns: Vec<Column>,
    rows: Vec<Vec<String>>,
}

impl TabularDataset {
    /// Assemble a dataset, validating the shape invariants: at least one
    /// column, non-blank unique column names, and uniform row width.
    pub fn from_parts(columns: Vec<Column>, rows: Vec<Vec<String>>) -> Result<Self, ImportError> {
        if columns.is_empty() {
            return Err(ImportError::MalformedInput(
                "file has no columns".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for column in &columns {
            if column.name.trim().is_empty() {
                return Err(ImportError::MalformedInput(
                    "header row contains a blank column name".to_string(),
                ));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(ImportError::MalformedInput(format!(
                    "duplicate column name '{}'",
                    column.name
                )));
            }
        }

        for (index, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(ImportError::MalformedInput(format!(
                    "row {} has {} fields, expected {}",
                    index + 2,
                    row.len(),
                    columns.len()
                )));
            }
        }

        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}
