//! Typed reads and writes of polars columns.
//!
//! Engines express joins, sorts and window statistics as polars operations.
//! The point-in-time rules that are easier to state row by row (interval
//! containment, duplicate resolution, identifier backfill) read plain
//! vectors through these helpers.

use chrono::NaiveDate;
use polars::prelude::*;

/// Days since 1970-01-01, the physical value of a polars `Date`.
pub fn days_since_epoch(date: NaiveDate) -> i32 {
    (date - NaiveDate::default()).num_days() as i32
}

/// Date literal usable inside lazy expressions.
pub fn date_lit(date: NaiveDate) -> Expr {
    lit(days_since_epoch(date)).cast(DataType::Date)
}

pub fn date_column(name: &str, values: &[Option<NaiveDate>]) -> Column {
    Column::new(name.into(), values)
}

pub fn text_column(name: &str, values: &[Option<String>]) -> Column {
    Column::new(name.into(), values)
}

pub fn float_column(name: &str, values: &[Option<f64>]) -> Column {
    Column::new(name.into(), values)
}

pub fn int_column(name: &str, values: &[Option<i64>]) -> Column {
    Column::new(name.into(), values)
}

/// Dates of a `Date` column. Any other dtype is a schema mismatch.
pub fn date_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<NaiveDate>>> {
    Ok(df.column(name)?.date()?.as_date_iter().collect())
}

/// Values of a numeric or boolean column as `f64`.
pub fn f64_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<f64>>> {
    let column = df.column(name)?;
    let dtype = column.dtype();
    if !(dtype.is_primitive_numeric() || dtype.is_bool() || dtype.is_null()) {
        polars_bail!(SchemaMismatch: "column '{}' has type {}, expected a numeric column", name, dtype);
    }
    let cast = column.cast(&DataType::Float64)?;
    Ok(cast.f64()?.into_iter().collect())
}

/// Values of an integer or boolean column as `i64`.
pub fn i64_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<i64>>> {
    let column = df.column(name)?;
    let dtype = column.dtype();
    if !(dtype.is_integer() || dtype.is_bool() || dtype.is_null()) {
        polars_bail!(SchemaMismatch: "column '{}' has type {}, expected an integer column", name, dtype);
    }
    let cast = column.cast(&DataType::Int64)?;
    Ok(cast.i64()?.into_iter().collect())
}

/// Values of a `String` column.
pub fn str_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<String>>> {
    Ok(df
        .column(name)?
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

pub fn row_mask(mask: &[bool]) -> BooleanChunked {
    BooleanChunked::from_slice(PlSmallStr::EMPTY, mask)
}

/// Row positions per distinct combination of `keys`, in first-appearance order.
///
/// Rows with a null in any key column belong to no group.
pub fn group_rows(df: &DataFrame, keys: &[&str]) -> PolarsResult<Vec<Vec<usize>>> {
    let mut valid = vec![true; df.height()];
    for key in keys {
        for (row, null) in df.column(key)?.is_null().into_iter().enumerate() {
            if null == Some(true) {
                valid[row] = false;
            }
        }
    }

    let grouped = df.group_by_stable(keys.iter().copied())?;
    let mut out = Vec::new();
    for group in grouped.get_groups().iter() {
        let rows: Vec<usize> = match group {
            GroupsIndicator::Idx((_, idx)) => idx.iter().map(|&i| i as usize).collect(),
            GroupsIndicator::Slice([first, len]) => {
                (first as usize..(first + len) as usize).collect()
            }
        };
        if rows.first().is_some_and(|&r| valid[r]) {
            out.push(rows);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn dates_round_trip_through_physical_days() {
        assert_eq!(days_since_epoch(d("1970-01-02")), 1);
        let df = DataFrame::new(vec![date_column("date", &[Some(d("2020-02-29")), None])]).unwrap();
        assert_eq!(date_values(&df, "date").unwrap(), vec![Some(d("2020-02-29")), None]);
    }

    #[test]
    fn numeric_reads_reject_text() {
        let df = df!("x" => &["a"], "n" => &[1i32]).unwrap();
        assert!(f64_values(&df, "x").is_err());
        assert_eq!(f64_values(&df, "n").unwrap(), vec![Some(1.0)]);
        assert_eq!(i64_values(&df, "n").unwrap(), vec![Some(1)]);
    }

    #[test]
    fn null_keys_form_no_group() {
        let df = DataFrame::new(vec![
            text_column(
                "k",
                &[Some("a".into()), None, Some("b".into()), Some("a".into())],
            ),
            float_column("x", &[Some(1.0), Some(2.0), Some(3.0), Some(4.0)]),
        ])
        .unwrap();
        assert_eq!(group_rows(&df, &["k"]).unwrap(), vec![vec![0, 3], vec![2]]);
    }
}
