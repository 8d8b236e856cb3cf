//! Spreadsheet parsing and column type detection.
//!
//! Turns an uploaded `.csv`, `.xls` or `.xlsx` file into a
//! [`TabularDataset`]: the first row supplies column names, every later
//! row becomes string cell data, and each column's value type is
//! detected by scanning its cells. Parsing runs on the blocking thread
//! pool since both readers do synchronous file I/O.

use crate::import::dataset::{Column, NativeType, TabularDataset};
use crate::import::error::ImportError;
use calamine::{Data, Reader, open_workbook_auto};
use csv::ReaderBuilder;
use std::path::{Path, PathBuf};

/// File extensions the importer accepts, lowercase without the dot.
pub const ACCEPTED_EXTENSIONS: [&str; 3] = ["csv", "xls", "xlsx"];

/// Return the lowercased extension of `path` when it is one the importer
/// accepts.
pub fn accepted_extension(path: &Path) -> Option<String> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    ACCEPTED_EXTENSIONS
        .contains(&extension.as_str())
        .then_some(extension)
}

/// Parse the uploaded file at `path` into a dataset.
pub async fn parse_spreadsheet(path: &Path) -> Result<TabularDataset, ImportError> {
    let path = PathBuf::from(path);
    tokio::task::spawn_blocking(move || parse_file(&path))
        .await
        .map_err(|e| ImportError::Io(std::io::Error::other(e)))?
}

fn parse_file(path: &Path) -> Result<TabularDataset, ImportError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let (headers, rows) = match extension.as_str() {
        "csv" => read_delimited(path)?,
        "xls" | "xlsx" => read_workbook(path)?,
        other => return Err(ImportError::unsupported_format(other)),
    };

    build_dataset(headers, rows)
}

fn read_delimited(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>), ImportError> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }

    Ok((headers, rows))
}

fn read_workbook(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>), ImportError> {
    let mut workbook = open_workbook_auto(path)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ImportError::MalformedInput("workbook has no worksheets".to_string()))??;

    let mut sheet_rows = range.rows();
    let headers: Vec<String> = match sheet_rows.next() {
        Some(row) => row.iter().map(cell_text).collect(),
        None => {
            return Err(ImportError::MalformedInput(
                "first worksheet has no used cells".to_string(),
            ));
        }
    };

    let rows: Vec<Vec<String>> = sheet_rows
        .map(|row| row.iter().map(cell_text).collect())
        .collect();

    Ok((headers, rows))
}

/// Render one worksheet cell the way it would appear as text.
pub(crate) fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(text) => text.clone(),
        Data::Int(value) => value.to_string(),
        Data::Float(value) => {
            // Whole floats print without the trailing ".0" Excel never shows
            if value.fract() == 0.0 && value.abs() < 1e15 {
                format!("{}", *value as i64)
            } else {
                value.to_string()
            }
        }
        Data::Bool(value) => if *value { "TRUE" } else { "FALSE" }.to_string(),
        Data::DateTime(value) => value
            .as_datetime()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| value.as_f64().to_string()),
        Data::DateTimeIso(text) => text.clone(),
        Data::DurationIso(text) => text.clone(),
        Data::Error(error) => error.to_string(),
    }
}

fn build_dataset(
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> Result<TabularDataset, ImportError> {
    let columns = headers
        .into_iter()
        .enumerate()
        .map(|(index, name)| Column {
            native: detect_column_type(&rows, index),
            name: name.trim().to_string(),
        })
        .collect();

    TabularDataset::from_parts(columns, rows)
}

/// Scan one column's cells and pick the narrowest type every non-blank
/// cell fits. Blank cells carry no type information and are skipped; a
/// column with no values at all stays text.
fn detect_column_type(rows: &[Vec<String>], index: usize) -> NativeType {
    let mut saw_value = false;
    let mut all_int = true;
    let mut needs_i64 = false;
    let mut all_decimal = true;
    let mut max_integral: u32 = 0;
    let mut max_scale: u32 = 0;
    let mut all_float = true;
    let mut all_datetime = true;

    for row in rows {
        let Some(value) = row.get(index) else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        saw_value = true;

        if all_int {
            match value.parse::<i64>() {
                Ok(parsed) => {
                    if i32::try_from(parsed).is_err() {
                        needs_i64 = true;
                    }
                }
                Err(_) => all_int = false,
            }
        }

        if all_decimal {
            match decimal_shape(value) {
                Some((precision, scale)) => {
                    max_integral = max_integral.max(precision - scale);
                    max_scale = max_scale.max(scale);
                }
                None => all_decimal = false,
            }
        }

        if all_float && value.parse::<f64>().is_err() {
            all_float = false;
        }

        if all_datetime && !parses_as_datetime(value) {
            all_datetime = false;
        }

        if !all_int && !all_decimal && !all_float && !all_datetime {
            break;
        }
    }

    if !saw_value {
        return NativeType::Text { size: -1 };
    }
    if all_datetime {
        return NativeType::DateTime;
    }
    if all_int {
        return if needs_i64 {
            NativeType::Int64
        } else {
            NativeType::Int32
        };
    }
    if all_decimal {
        // Widest scale seen plus the widest integral part: the column
        // envelope must hold every value after rescaling.
        return NativeType::Decimal {
            precision: (max_integral + max_scale).max(1),
            scale: max_scale,
        };
    }
    if all_float {
        return NativeType::Double;
    }
    NativeType::Text { size: -1 }
}

/// Digit envelope of a plain decimal literal: significant integer digits
/// plus fraction digits, and the fraction length as scale. Returns `None`
/// for anything that is not `[+-]digits[.digits]`.
fn decimal_shape(value: &str) -> Option<(u32, u32)> {
    let unsigned = value.strip_prefix(['-', '+']).unwrap_or(value);
    if unsigned.is_empty() {
        return None;
    }

    let (integral, fraction) = match unsigned.split_once('.') {
        Some((integral, fraction)) => (integral, fraction),
        None => (unsigned, ""),
    };

    if integral.is_empty() && fraction.is_empty() {
        return None;
    }
    if !integral.chars().all(|c| c.is_ascii_digit())
        || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    let integral_digits = integral.trim_start_matches('0').len() as u32;
    let scale = fraction.len() as u32;
    Some(((integral_digits + scale).max(1), scale))
}

/// Cheap shape check before handing the value to the date parser, so
/// bare numbers are never misread as timestamps.
fn parses_as_datetime(value: &str) -> bool {
    if value.parse::<f64>().is_ok() {
        return false;
    }
    let shaped = value.contains('-') || value.contains('/') || value.contains(':');
    shaped && dateparser::parse(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_csv(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("create fixture");
        file.write_all(contents.as_bytes()).expect("write fixture");
        path
    }

    #[tokio::test]
    async fn test_parse_csv_detects_text_and_decimal_columns() {
        let dir = TempDir::new().expect("temp dir");
        let path = write_csv(&dir, "donors.csv", "Name,Amount\nAnn,10.50\nBob,20.00\n");

        let dataset = parse_spreadsheet(&path).await.expect("parsed");

        assert_eq!(dataset.column_count(), 2);
        assert_eq!(dataset.row_count(), 2);
        assert_eq!(dataset.columns()[0].name, "Name");
        assert_eq!(dataset.columns()[0].native, NativeType::Text { size: -1 });
        assert_eq!(
            dataset.columns()[1].native,
            NativeType::Decimal {
                precision: 4,
                scale: 2
            }
        );
        assert_eq!(dataset.rows()[0], vec!["Ann", "10.50"]);
        assert_eq!(dataset.rows()[1], vec!["Bob", "20.00"]);
    }

    #[tokio::test]
    async fn test_parse_xlsx_preserves_column_order_and_renders_numbers() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/donors.xlsx");

        let dataset = parse_spreadsheet(&path).await.expect("parsed");

        let names: Vec<&str> = dataset
            .columns()
            .iter()
            .map(|column| column.name.as_str())
            .collect();
        assert_eq!(names, ["Name", "Region", "Amount"]);
        assert_eq!(dataset.row_count(), 2);

        // Numeric cells come back the way Excel shows them: no trailing
        // ".0" on whole numbers.
        assert_eq!(dataset.rows()[0], vec!["Ann", "North", "10.5"]);
        assert_eq!(dataset.rows()[1], vec!["Bob", "South", "20"]);

        assert_eq!(
            dataset.columns()[2].native,
            NativeType::Decimal {
                precision: 3,
                scale: 1
            }
        );
    }

    #[tokio::test]
    async fn test_parse_rejects_unknown_extension() {
        let dir = TempDir::new().expect("temp dir");
        let path = write_csv(&dir, "notes.txt", "just some notes\n");

        let err = parse_spreadsheet(&path).await.expect_err("rejected");
        match err {
            ImportError::UnsupportedFormat { extension } => assert_eq!(extension, "txt"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_parse_rejects_duplicate_headers() {
        let dir = TempDir::new().expect("temp dir");
        let path = write_csv(&dir, "dup.csv", "Name,Name\nAnn,Bob\n");

        let err = parse_spreadsheet(&path).await.expect_err("rejected");
        assert!(matches!(err, ImportError::MalformedInput(_)));
    }

    #[tokio::test]
    async fn test_parse_rejects_ragged_csv_rows() {
        let dir = TempDir::new().expect("temp dir");
        let path = write_csv(&dir, "ragged.csv", "Name,Amount\nAnn,10.50,extra\n");

        // The CSV reader enforces uniform record length itself
        let err = parse_spreadsheet(&path).await.expect_err("rejected");
        assert!(matches!(err, ImportError::Csv(_)));
    }

    #[test]
    fn test_accepted_extension_is_case_insensitive() {
        assert_eq!(
            accepted_extension(Path::new("Donors.CSV")),
            Some("csv".to_string())
        );
        assert_eq!(
            accepted_extension(Path::new("book.XLSX")),
            Some("xlsx".to_string())
        );
        assert_eq!(accepted_extension(Path::new("notes.txt")), None);
        assert_eq!(accepted_extension(Path::new("no_extension")), None);
    }

    #[test]
    fn test_detect_small_integers() {
        let rows = vec![
            vec!["1".to_string()],
            vec!["42".to_string()],
            vec!["-7".to_string()],
        ];
        assert_eq!(detect_column_type(&rows, 0), NativeType::Int32);
    }

    #[test]
    fn test_detect_wide_integers() {
        let rows = vec![
            vec!["1".to_string()],
            vec!["3000000000".to_string()], // past i32
        ];
        assert_eq!(detect_column_type(&rows, 0), NativeType::Int64);
    }

    #[test]
    fn test_detect_decimal_envelope() {
        let rows = vec![
            vec!["10.50".to_string()],
            vec!["3.125".to_string()],
            vec!["700".to_string()],
        ];
        assert_eq!(
            detect_column_type(&rows, 0),
            NativeType::Decimal {
                precision: 6,
                scale: 3
            }
        );
    }

    #[test]
    fn test_detect_datetime_column() {
        let rows = vec![
            vec!["2024-01-15".to_string()],
            vec!["2024-02-20 10:30:00".to_string()],
        ];
        assert_eq!(detect_column_type(&rows, 0), NativeType::DateTime);
    }

    #[test]
    fn test_negative_numbers_are_not_dates() {
        let rows = vec![vec!["-5".to_string()], vec!["-12".to_string()]];
        assert_eq!(detect_column_type(&rows, 0), NativeType::Int32);
    }

    #[test]
    fn test_mixed_values_fall_back_to_text() {
        let rows = vec![vec!["12".to_string()], vec!["twelve".to_string()]];
        assert_eq!(detect_column_type(&rows, 0), NativeType::Text { size: -1 });
    }

    #[test]
    fn test_blank_cells_do_not_influence_detection() {
        let rows = vec![
            vec!["".to_string()],
            vec!["5".to_string()],
            vec!["  ".to_string()],
        ];
        assert_eq!(detect_column_type(&rows, 0), NativeType::Int32);
    }

    #[test]
    fn test_all_blank_column_stays_text() {
        let rows = vec![vec!["".to_string()], vec!["".to_string()]];
        assert_eq!(detect_column_type(&rows, 0), NativeType::Text { size: -1 });
    }

    #[test]
    fn test_scientific_notation_becomes_double() {
        let rows = vec![vec!["1e10".to_string()], vec!["2.5e-3".to_string()]];
        assert_eq!(detect_column_type(&rows, 0), NativeType::Double);
    }

    #[test]
    fn test_decimal_shape_examples() {
        assert_eq!(decimal_shape("10.50"), Some((4, 2)));
        assert_eq!(decimal_shape("-3.125"), Some((4, 3)));
        assert_eq!(decimal_shape(".5"), Some((1, 1)));
        assert_eq!(decimal_shape("007"), Some((1, 0)));
        assert_eq!(decimal_shape("1e5"), None);
        assert_eq!(decimal_shape("ten"), None);
        assert_eq!(decimal_shape(""), None);
        assert_eq!(decimal_shape("-"), None);
    }

    #[test]
    fn test_cell_text_rendering() {
        assert_eq!(cell_text(&Data::Empty), "");
        assert_eq!(cell_text(&Data::String("Ann".to_string())), "Ann");
        assert_eq!(cell_text(&Data::Int(42)), "42");
        assert_eq!(cell_text(&Data::Float(20.0)), "20");
        assert_eq!(cell_text(&Data::Float(10.5)), "10.5");
        assert_eq!(cell_text(&Data::Bool(true)), "TRUE");
        assert_eq!(
            cell_text(&Data::DateTimeIso("2024-01-15T10:30:00".to_string())),
            "2024-01-15T10:30:00"
        );
    }
}
