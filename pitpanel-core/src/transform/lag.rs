//! Discrete-step and calendar-offset lags.

use chrono::NaiveDate;
use polars::prelude::*;

use super::{TransformError, ROW_INDEX};
use crate::calendar::CalendarOffset;
use crate::columns::{date_column, date_values};
use crate::join::{asof_merge, AsofOptions};
use crate::panel::{Panel, DATE};

pub fn lag_column_name(feature: &str, steps: i64) -> String {
    format!("{feature}_lag({steps})")
}

pub fn offset_lag_column_name(feature: &str, offset: CalendarOffset) -> String {
    format!("{feature}_lag({offset})")
}

/// Shift `feature` by `steps` panel positions within each `key` group.
///
/// Positions follow date order inside each group, not calendar distance.
/// A positive lag brings earlier values forward; a negative lag pulls later
/// values back. The first `steps` rows of each group (or the last `-steps`
/// for a negative lag) get null, as do rows whose key is null. Row order is
/// preserved and the result is stored in `{feature}_lag({steps})`.
pub fn lag(panel: Panel, feature: &str, key: &[&str], steps: i64) -> Result<Panel, TransformError> {
    let name = lag_column_name(feature, steps);
    let dtype = panel.column(feature)?.dtype().clone();

    // No group is longer than the panel, so every row lacks a partner.
    if steps.unsigned_abs() >= panel.height() as u64 {
        let nulls = Column::full_null(name.as_str().into(), panel.height(), &dtype);
        return Ok(panel.with_column(nulls)?);
    }

    let partition: Vec<Expr> = key.iter().map(|k| col(*k)).collect();
    let shifted = col(feature).shift(lit(steps));
    let shifted = if partition.is_empty() {
        shifted
    } else {
        shifted.over(partition)
    };
    let valid_key = key
        .iter()
        .fold(lit(true), |acc, k| acc.and(col(*k).is_not_null()));
    let mut order: Vec<&str> = key.to_vec();
    order.push(DATE);

    Ok(panel.map_lazy(|lf| {
        lf.with_row_index(ROW_INDEX, None)
            .sort(
                order,
                SortMultipleOptions::default().with_maintain_order(true),
            )
            .with_column(
                when(valid_key)
                    .then(shifted)
                    .otherwise(lit(NULL).cast(dtype))
                    .alias(name.as_str()),
            )
            .sort([ROW_INDEX], SortMultipleOptions::default())
            .drop([ROW_INDEX])
    })?)
}

/// Lag `feature` by a calendar offset and snap it back onto the panel grid.
///
/// A copy of `(key, date, feature)` is shifted to `date + offset` and
/// as-of merged (backward) onto the panel by `key`. When the offset is smaller
/// than the panel step, a row can match its own value. The result is stored in
/// `{feature}_lag({offset})` and rows come back in date order.
pub fn offset_lag(
    panel: Panel,
    feature: &str,
    key: &[&str],
    offset: CalendarOffset,
) -> Result<Panel, TransformError> {
    if offset.months != 0 {
        tracing::warn!(%offset, "month offsets can be unintuitive near month ends");
    }
    let name = offset_lag_column_name(feature, offset);
    let mut columns: Vec<&str> = key.to_vec();
    columns.push(DATE);
    columns.push(feature);
    let mut shifted = panel.frame().select(columns)?;
    shifted.rename(feature, name.as_str().into())?;

    let moved: Vec<Option<NaiveDate>> = date_values(&shifted, DATE)?
        .into_iter()
        .map(|d| d.map(|d| offset.apply(d)).transpose())
        .collect::<Result<_, _>>()?;
    shifted.with_column(date_column(DATE, &moved))?;

    let opts = AsofOptions::on(DATE).by(key);
    let merged = asof_merge(panel.frame(), &shifted, &opts)?;
    Ok(Panel::new(merged)?)
}
