//! The panel: one row per security per date.
//!
//! A panel is a polars [`DataFrame`] that carries the composite key
//! (`security_key_name`, `security_key`, `date`). Every engine in this crate
//! consumes and produces panels; each call returns a fresh value.

use chrono::NaiveDate;
use polars::prelude::*;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::calendar::{CalendarError, CalendarOffset};
use crate::columns::{date_column, date_values, f64_values, str_values, text_column};
use crate::identifiers::KeyScheme;

pub const SECURITY_KEY_NAME: &str = "security_key_name";
pub const SECURITY_KEY: &str = "security_key";
pub const SECURITY_KEY_ABBREV: &str = "security_key_abbrev";
pub const DATE: &str = "date";
pub const IN_INDEX: &str = "in_index";
pub const INDEX_WEIGHT: &str = "index_weight";

/// Default unit key of a panel.
pub const UNIT_KEY: [&str; 2] = [SECURITY_KEY, SECURITY_KEY_NAME];

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("panel is missing required column '{0}'")]
    MissingColumn(&'static str),

    #[error("panel column '{column}' has type {actual}, expected {expected}")]
    ColumnType {
        column: &'static str,
        expected: DataType,
        actual: DataType,
    },

    #[error("panel date is null at row {row}")]
    NullDate { row: usize },

    #[error("panel has no rows")]
    Empty,

    #[error(transparent)]
    Polars(#[from] PolarsError),

    #[error(transparent)]
    Calendar(#[from] CalendarError),
}

/// A validated panel frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Panel {
    frame: DataFrame,
}

impl Panel {
    /// Validate `frame` as a panel.
    ///
    /// Key columns must be strings and `date` must be a non-null date column.
    /// Rows whose key scheme is neither cusip nor sedol are kept, with a warning.
    pub fn new(frame: DataFrame) -> Result<Self, PanelError> {
        for (required, expected) in key_schema() {
            let column = frame
                .column(required)
                .map_err(|_| PanelError::MissingColumn(required))?;
            if column.dtype() != &expected {
                return Err(PanelError::ColumnType {
                    column: required,
                    expected,
                    actual: column.dtype().clone(),
                });
            }
        }
        let dates = frame.column(DATE)?;
        if dates.null_count() > 0 {
            let row = dates
                .is_null()
                .into_iter()
                .position(|null| null == Some(true))
                .unwrap_or_default();
            return Err(PanelError::NullDate { row });
        }

        let unsupported: BTreeSet<String> = frame
            .column(SECURITY_KEY_NAME)?
            .str()?
            .into_iter()
            .flatten()
            .filter(|n| n.parse::<KeyScheme>().is_err())
            .map(str::to_string)
            .collect();
        if !unsupported.is_empty() {
            tracing::warn!(
                schemes = ?unsupported,
                "panel contains unsupported security key names; only cusip and sedol are recognised"
            );
        }
        Ok(Self { frame })
    }

    /// Dense grid of every `(scheme, key)` pair at every date, ordered by key then date.
    pub fn grid(entities: &[(KeyScheme, String)], dates: &[NaiveDate]) -> Result<Self, PanelError> {
        let n = entities.len() * dates.len();
        let mut names = Vec::with_capacity(n);
        let mut keys = Vec::with_capacity(n);
        let mut grid_dates = Vec::with_capacity(n);
        for (scheme, key) in entities {
            for date in dates {
                names.push(Some(scheme.as_str().to_string()));
                keys.push(Some(key.clone()));
                grid_dates.push(Some(*date));
            }
        }
        let frame = DataFrame::new(vec![
            text_column(SECURITY_KEY_NAME, &names),
            text_column(SECURITY_KEY, &keys),
            date_column(DATE, &grid_dates),
        ])?;
        Self::new(frame)
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn into_frame(self) -> DataFrame {
        self.frame
    }

    pub fn lazy(&self) -> LazyFrame {
        self.frame.clone().lazy()
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.frame.get_column_index(name).is_some()
    }

    pub fn column(&self, name: &str) -> Result<&Column, PanelError> {
        Ok(self.frame.column(name)?)
    }

    /// Apply a frame transformation and re-validate the result.
    pub fn map_frame<F>(self, f: F) -> Result<Self, PanelError>
    where
        F: FnOnce(DataFrame) -> PolarsResult<DataFrame>,
    {
        Self::new(f(self.frame)?)
    }

    /// Collect a lazy query over this panel and re-validate the result.
    pub fn map_lazy<F>(self, f: F) -> Result<Self, PanelError>
    where
        F: FnOnce(LazyFrame) -> LazyFrame,
    {
        Self::new(f(self.frame.lazy()).collect()?)
    }

    /// Add or replace one column.
    pub fn with_column(mut self, column: Column) -> Result<Self, PanelError> {
        self.frame.with_column(column)?;
        Self::new(self.frame)
    }

    /// Per-row dates. Validation guarantees there are no nulls.
    pub fn row_dates(&self) -> Vec<NaiveDate> {
        date_values(&self.frame, DATE)
            .map(|v| v.into_iter().flatten().collect())
            .unwrap_or_default()
    }

    /// Distinct panel dates, ascending.
    pub fn dates(&self) -> Vec<NaiveDate> {
        let set: BTreeSet<NaiveDate> = self.row_dates().into_iter().collect();
        set.into_iter().collect()
    }

    /// `(min date - tolerance, max date + tolerance)`.
    pub fn date_span(&self, tolerance: CalendarOffset) -> Result<(NaiveDate, NaiveDate), PanelError> {
        let dates = self.dates();
        let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
            return Err(PanelError::Empty);
        };
        Ok((tolerance.subtract_from(*first)?, tolerance.apply(*last)?))
    }

    /// Distinct keys of `scheme`, sorted. With `abbreviated`, check digits are stripped.
    pub fn keys(&self, scheme: KeyScheme, abbreviated: bool) -> Result<Vec<String>, PanelError> {
        let names = str_values(&self.frame, SECURITY_KEY_NAME)?;
        let keys = str_values(&self.frame, SECURITY_KEY)?;
        let mut out = BTreeSet::new();
        for (name, key) in names.into_iter().zip(keys) {
            let (Some(name), Some(key)) = (name, key) else {
                continue;
            };
            if name.parse::<KeyScheme>().ok() != Some(scheme) {
                continue;
            }
            if abbreviated {
                match scheme.abbreviate(&key) {
                    Ok(abbrev) => {
                        out.insert(abbrev);
                    }
                    Err(err) => tracing::warn!(%err, "skipping malformed identifier"),
                }
            } else {
                out.insert(key);
            }
        }
        Ok(out.into_iter().collect())
    }

    /// Add or refresh `security_key_abbrev` from `security_key`.
    ///
    /// Rows with an unsupported scheme or a malformed identifier get a null abbreviation.
    pub fn with_abbrev(self) -> Result<Self, PanelError> {
        let names = str_values(&self.frame, SECURITY_KEY_NAME)?;
        let keys = str_values(&self.frame, SECURITY_KEY)?;
        let mut malformed = 0usize;
        let abbrev: Vec<Option<String>> = names
            .iter()
            .zip(&keys)
            .map(|(name, key)| {
                let scheme = name.as_deref()?.parse::<KeyScheme>().ok()?;
                let key = key.as_deref()?;
                match scheme.abbreviate(key) {
                    Ok(a) => Some(a),
                    Err(_) => {
                        malformed += 1;
                        None
                    }
                }
            })
            .collect();
        if malformed > 0 {
            tracing::warn!(malformed, "identifiers could not be abbreviated");
        }
        self.with_column(text_column(SECURITY_KEY_ABBREV, &abbrev))
    }

    /// `in_index == 1` per row. Missing column or null flags count as out of universe.
    pub fn universe_mask(&self) -> Vec<bool> {
        universe_mask(&self.frame)
    }
}

/// `in_index == 1` per row of an arbitrary frame.
pub fn universe_mask(frame: &DataFrame) -> Vec<bool> {
    match f64_values(frame, IN_INDEX) {
        Ok(values) => values.iter().map(|v| *v == Some(1.0)).collect(),
        Err(_) => vec![false; frame.height()],
    }
}

/// Schema of the identifying columns.
pub fn key_schema() -> [(&'static str, DataType); 3] {
    [
        (SECURITY_KEY_NAME, DataType::String),
        (SECURITY_KEY, DataType::String),
        (DATE, DataType::Date),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn two_cusips() -> Panel {
        Panel::grid(
            &[
                (KeyScheme::Cusip, "037833100".to_string()),
                (KeyScheme::Cusip, "000000000".to_string()),
            ],
            &[d("2020-01-01"), d("2020-02-01")],
        )
        .unwrap()
    }

    #[test]
    fn grid_is_dense() {
        let panel = two_cusips();
        assert_eq!(panel.height(), 4);
        assert_eq!(panel.dates(), vec![d("2020-01-01"), d("2020-02-01")]);
    }

    #[test]
    fn missing_key_column_is_fatal() {
        let frame = DataFrame::new(vec![date_column(DATE, &[Some(d("2020-01-01"))])]).unwrap();
        assert!(matches!(
            Panel::new(frame),
            Err(PanelError::MissingColumn(SECURITY_KEY_NAME))
        ));
    }

    #[test]
    fn null_date_is_fatal() {
        let frame = df!(
            SECURITY_KEY_NAME => &["cusip"],
            SECURITY_KEY => &["037833100"],
        )
        .unwrap()
        .hstack(&[date_column(DATE, &[None])])
        .unwrap();
        assert!(matches!(Panel::new(frame), Err(PanelError::NullDate { row: 0 })));
    }

    #[test]
    fn unsupported_scheme_is_kept() {
        let frame = df!(
            SECURITY_KEY_NAME => &["isin"],
            SECURITY_KEY => &["US0378331005"],
            DATE => &[d("2020-01-01")],
        )
        .unwrap();
        let panel = Panel::new(frame).unwrap().with_abbrev().unwrap();
        assert_eq!(panel.column(SECURITY_KEY_ABBREV).unwrap().null_count(), 1);
    }

    #[test]
    fn integer_security_key_is_rejected() {
        let frame = df!(
            SECURITY_KEY_NAME => &["cusip"],
            SECURITY_KEY => &[37833100i64],
            DATE => &[d("2020-01-01")],
        )
        .unwrap();
        assert!(matches!(
            Panel::new(frame),
            Err(PanelError::ColumnType { column: SECURITY_KEY, .. })
        ));
    }

    #[test]
    fn keys_abbreviated_and_full() {
        let panel = two_cusips();
        assert_eq!(
            panel.keys(KeyScheme::Cusip, true).unwrap(),
            vec!["00000000".to_string(), "03783310".to_string()]
        );
        assert_eq!(panel.keys(KeyScheme::Sedol, false).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn date_span_applies_tolerance() {
        let (lo, hi) = two_cusips().date_span(CalendarOffset::days(10)).unwrap();
        assert_eq!(lo, d("2019-12-22"));
        assert_eq!(hi, d("2020-02-11"));
    }
}
