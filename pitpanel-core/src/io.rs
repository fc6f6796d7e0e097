//! Panel and membership files (CSV and Parquet).
//!
//! Identifier columns are always read as text so leading zeros survive.
//! `date` must parse as a calendar date. Other CSV columns are typed by
//! content: dates, then integers, then floats, falling back to text.

use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::{self as pl, LazyFileListReader, SerReader, SerWriter};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::columns::{date_column, date_values, float_column, int_column, str_values, text_column};
use crate::identifiers::{IdentifierError, KeyScheme};
use crate::membership::{CurrentMapping, IdentifierMapping, IdentifierMaps, MembershipInterval};
use crate::panel::{Panel, PanelError, DATE, SECURITY_KEY, SECURITY_KEY_ABBREV, SECURITY_KEY_NAME};

/// Columns that are never type-inferred.
pub const IDENTIFIER_COLUMNS: [&str; 6] = [
    SECURITY_KEY,
    SECURITY_KEY_ABBREV,
    SECURITY_KEY_NAME,
    "gvkey",
    "entity",
    "abbrev",
];

#[derive(Debug, Error)]
pub enum IoError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("polars error: {0}")]
    Polars(String),

    #[error("unsupported file format '{0}' (expected .csv or .parquet)")]
    UnsupportedFormat(String),

    #[error("column '{column}' row {row}: cannot parse '{value}' as {expected}")]
    Parse {
        column: String,
        row: usize,
        value: String,
        expected: &'static str,
    },

    #[error("column '{column}' has unsupported type {dtype}")]
    UnsupportedType { column: String, dtype: String },

    #[error(transparent)]
    Panel(#[from] PanelError),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

impl From<pl::PolarsError> for IoError {
    fn from(e: pl::PolarsError) -> Self {
        IoError::Polars(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Csv,
    Parquet,
}

fn format_of(path: &Path) -> Result<Format, IoError> {
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("csv") => Ok(Format::Csv),
        Some("parquet") | Some("pq") => Ok(Format::Parquet),
        other => Err(IoError::UnsupportedFormat(other.unwrap_or("").to_string())),
    }
}

// ─── Cell parsing ───────────────────────────────────────────────────

fn parse_date_cell(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok().map(|t| t.date()))
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").ok().map(|t| t.date()))
}

fn is_missing(s: &str) -> bool {
    s.trim().is_empty()
}

fn cell(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !is_missing(s))
}

/// Type a column of raw strings by content.
fn infer_column(name: &str, raw: &[Option<String>]) -> pl::Column {
    let present = || raw.iter().flatten().filter(|s| !is_missing(s));
    let has_values = present().next().is_some();

    if has_values && present().all(|s| parse_date_cell(s).is_some()) {
        let dates: Vec<_> = raw.iter().map(|s| cell(s).and_then(parse_date_cell)).collect();
        return date_column(name, &dates);
    }
    if has_values && present().all(|s| s.trim().parse::<i64>().is_ok()) {
        let ints: Vec<_> = raw.iter().map(|s| cell(s).and_then(|v| v.trim().parse().ok())).collect();
        return int_column(name, &ints);
    }
    if has_values && present().all(|s| s.trim().parse::<f64>().is_ok()) {
        let floats: Vec<_> = raw.iter().map(|s| cell(s).and_then(|v| v.trim().parse().ok())).collect();
        return float_column(name, &floats);
    }
    let text: Vec<_> = raw.iter().map(|s| cell(s).map(str::to_string)).collect();
    text_column(name, &text)
}

fn parse_dates(column: &str, raw: &[Option<String>]) -> Result<pl::Column, IoError> {
    let dates = raw
        .iter()
        .enumerate()
        .map(|(row, s)| match cell(s) {
            None => Ok(None),
            Some(v) => parse_date_cell(v).map(Some).ok_or_else(|| IoError::Parse {
                column: column.to_string(),
                row,
                value: v.to_string(),
                expected: "date",
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(date_column(column, &dates))
}

// ─── Column typing ──────────────────────────────────────────────────

fn strings_of(col: &pl::Column) -> Result<Vec<Option<String>>, IoError> {
    let casted = col.cast(&pl::DataType::String)?;
    Ok(casted
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

/// Normalise a freshly read frame: identifiers as text, `date` as a date,
/// CSV columns typed by content and Parquet columns widened to 64 bits.
fn normalise(df: &pl::DataFrame, raw_strings: bool) -> Result<pl::DataFrame, IoError> {
    let mut columns = Vec::with_capacity(df.width());
    for col in df.get_columns() {
        let name = col.name().to_string();
        let column = if IDENTIFIER_COLUMNS.contains(&name.as_str()) {
            col.cast(&pl::DataType::String)?
        } else if name == DATE {
            match col.dtype() {
                pl::DataType::Date | pl::DataType::Datetime(_, _) => col.cast(&pl::DataType::Date)?,
                _ => parse_dates(&name, &strings_of(col)?)?,
            }
        } else if raw_strings {
            infer_column(&name, &strings_of(col)?)
        } else {
            typed_column(&name, col)?
        };
        columns.push(column);
    }
    Ok(pl::DataFrame::new(columns)?)
}

fn typed_column(name: &str, col: &pl::Column) -> Result<pl::Column, IoError> {
    use pl::DataType as T;
    let dtype = col.dtype().clone();
    Ok(match dtype {
        T::String => col.clone(),
        T::Date | T::Datetime(_, _) => col.cast(&T::Date)?,
        T::Boolean | T::Int8 | T::Int16 | T::Int32 | T::Int64 | T::UInt8 | T::UInt16 | T::UInt32 | T::UInt64 => {
            col.cast(&T::Int64)?
        }
        T::Float32 | T::Float64 => col.cast(&T::Float64)?,
        T::Null => pl::Column::full_null(name.into(), col.len(), &T::Float64),
        other => {
            return Err(IoError::UnsupportedType {
                column: name.to_string(),
                dtype: other.to_string(),
            })
        }
    })
}

// ─── Public API ─────────────────────────────────────────────────────

/// Read a CSV or Parquet file into a frame.
pub fn read_frame(path: &Path) -> Result<pl::DataFrame, IoError> {
    let format = format_of(path)?;
    let df = match format {
        Format::Csv => pl::LazyCsvReader::new(path)
            .with_has_header(true)
            .with_infer_schema_length(Some(0))
            .finish()?
            .collect()?,
        Format::Parquet => {
            let file = fs::File::open(path).map_err(|source| IoError::Io {
                path: path.display().to_string(),
                source,
            })?;
            pl::ParquetReader::new(file).finish()?
        }
    };
    let frame = normalise(&df, format == Format::Csv)?;
    tracing::debug!(path = %path.display(), rows = frame.height(), columns = frame.width(), "read frame");
    Ok(frame)
}

/// Write a frame as CSV or Parquet, chosen by extension.
///
/// The file is written next to its destination and renamed into place.
pub fn write_frame(frame: &pl::DataFrame, path: &Path) -> Result<(), IoError> {
    let format = format_of(path)?;
    let mut df = frame.clone();
    let io_err = |source| IoError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        match format {
            Format::Csv => pl::CsvWriter::new(&mut file).include_header(true).finish(&mut df)?,
            Format::Parquet => {
                pl::ParquetWriter::new(&mut file).finish(&mut df)?;
            }
        }
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        io_err(e)
    })?;
    tracing::debug!(path = %path.display(), rows = df.height(), "wrote frame");
    Ok(())
}

pub fn load_panel(path: &Path) -> Result<Panel, IoError> {
    Ok(Panel::new(read_frame(path)?)?)
}

pub fn save_panel(panel: &Panel, path: &Path) -> Result<(), IoError> {
    write_frame(panel.frame(), path)
}

// ─── Membership files ───────────────────────────────────────────────

fn has_column(frame: &pl::DataFrame, name: &str) -> bool {
    frame.get_column_index(name).is_some()
}

fn optional_dates(frame: &pl::DataFrame, name: &str) -> Result<Vec<Option<NaiveDate>>, IoError> {
    let all_null = frame
        .column(name)
        .map_or(true, |c| c.null_count() == c.len());
    if !all_null {
        Ok(date_values(frame, name)?)
    } else {
        Ok(vec![None; frame.height()])
    }
}

fn required_dates(frame: &pl::DataFrame, name: &str) -> Result<Vec<NaiveDate>, IoError> {
    date_values(frame, name)?
        .into_iter()
        .enumerate()
        .map(|(row, d)| {
            d.ok_or_else(|| IoError::Parse {
                column: name.to_string(),
                row,
                value: String::new(),
                expected: "date",
            })
        })
        .collect()
}

fn required_text(frame: &pl::DataFrame, name: &str) -> Result<Vec<String>, IoError> {
    strings_of(frame.column(name)?)?
        .into_iter()
        .enumerate()
        .map(|(row, s)| {
            s.ok_or_else(|| IoError::Parse {
                column: name.to_string(),
                row,
                value: String::new(),
                expected: "text",
            })
        })
        .collect()
}

fn schemes(frame: &pl::DataFrame) -> Result<Vec<KeyScheme>, IoError> {
    required_text(frame, "scheme")?
        .iter()
        .map(|s| Ok(s.parse::<KeyScheme>()?))
        .collect()
}

/// Membership intervals with columns `entity`, `since`, optional `until`
/// and optional `source`.
pub fn load_intervals(path: &Path) -> Result<Vec<MembershipInterval>, IoError> {
    let frame = read_frame(path)?;
    let entities = required_text(&frame, "entity")?;
    let since = required_dates(&frame, "since")?;
    let until = optional_dates(&frame, "until")?;
    let source: Vec<Option<String>> = if has_column(&frame, "source") {
        str_values(&frame, "source")?
    } else {
        vec![None; frame.height()]
    };
    Ok(entities
        .into_iter()
        .zip(since)
        .zip(until)
        .zip(source)
        .map(|(((entity, since), until), source)| MembershipInterval {
            entity,
            since,
            until,
            source,
        })
        .collect())
}

/// Identifier tables: a point-in-time file with `entity`, `scheme`,
/// `abbrev`, `valid_from`, optional `valid_until`, and optionally a current
/// file with `entity`, `scheme`, `abbrev`.
pub fn load_identifier_maps(point_in_time: &Path, current: Option<&Path>) -> Result<IdentifierMaps, IoError> {
    let frame = read_frame(point_in_time)?;
    let pit = required_text(&frame, "entity")?
        .into_iter()
        .zip(schemes(&frame)?)
        .zip(required_text(&frame, "abbrev")?)
        .zip(required_dates(&frame, "valid_from")?)
        .zip(optional_dates(&frame, "valid_until")?)
        .map(|((((entity, scheme), abbrev), valid_from), valid_until)| IdentifierMapping {
            entity,
            scheme,
            abbrev,
            valid_from,
            valid_until,
        })
        .collect();

    let current = match current {
        Some(path) => {
            let frame = read_frame(path)?;
            required_text(&frame, "entity")?
                .into_iter()
                .zip(schemes(&frame)?)
                .zip(required_text(&frame, "abbrev")?)
                .map(|((entity, scheme), abbrev)| CurrentMapping {
                    entity,
                    scheme,
                    abbrev,
                })
                .collect()
        }
        None => Vec::new(),
    };
    Ok(IdentifierMaps {
        point_in_time: pit,
        current,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::i64_values;
    use pl::DataType;

    fn s(v: &[Option<&str>]) -> Vec<Option<String>> {
        v.iter().map(|x| x.map(str::to_string)).collect()
    }

    #[test]
    fn inference_prefers_dates_then_ints_then_floats() {
        let dtype = |v: &[Option<&str>]| infer_column("x", &s(v)).dtype().clone();
        assert_eq!(dtype(&[Some("2020-01-31"), None]), DataType::Date);
        assert_eq!(dtype(&[Some("1"), Some(""), Some("0")]), DataType::Int64);
        assert_eq!(dtype(&[Some("1"), Some("2.5")]), DataType::Float64);
        assert_eq!(dtype(&[Some("1"), Some("x")]), DataType::String);
        assert_eq!(dtype(&[None, None]), DataType::String);
    }

    #[test]
    fn empty_cells_become_nulls() {
        let col = infer_column("x", &s(&[Some("1"), Some(" "), Some("3")]));
        let df = pl::DataFrame::new(vec![col]).unwrap();
        assert_eq!(i64_values(&df, "x").unwrap(), vec![Some(1), None, Some(3)]);
    }

    #[test]
    fn datetime_strings_parse_to_dates() {
        assert_eq!(
            parse_date_cell("2020-01-31 00:00:00"),
            NaiveDate::from_ymd_opt(2020, 1, 31)
        );
        assert!(parse_date_cell("31/01/2020").is_none());
    }

    #[test]
    fn bad_date_reports_row() {
        let err = parse_dates(DATE, &s(&[Some("2020-01-01"), Some("soon")])).unwrap_err();
        assert!(matches!(err, IoError::Parse { row: 1, .. }));
    }

    #[test]
    fn parquet_integers_widen_and_identifiers_stay_text() {
        let df = pl::df!(
            SECURITY_KEY => &[37833100i64],
            "count" => &[3i32],
            "flag" => &[true],
        )
        .unwrap();
        let out = normalise(&df, false).unwrap();
        assert_eq!(out.column(SECURITY_KEY).unwrap().dtype(), &DataType::String);
        assert_eq!(out.column("count").unwrap().dtype(), &DataType::Int64);
        assert_eq!(i64_values(&out, "flag").unwrap(), vec![Some(1)]);
    }

    #[test]
    fn unsupported_extension() {
        assert!(matches!(
            read_frame(Path::new("panel.xlsx")),
            Err(IoError::UnsupportedFormat(ext)) if ext == "xlsx"
        ));
    }
}
