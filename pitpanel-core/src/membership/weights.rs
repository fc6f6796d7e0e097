//! Universe restriction and index weight renormalization.

use polars::prelude::*;

use super::MembershipError;
use crate::columns::row_mask;
use crate::panel::{Panel, DATE, INDEX_WEIGHT};

/// Scale `index_weight` so weights sum to one within each date.
///
/// Dates whose weights sum to zero (or are all null) get null weights and a
/// warning.
pub fn renormalize_weights(panel: Panel) -> Result<Panel, MembershipError> {
    tracing::info!("re-normalizing index weights to sum to 1 over the requested universe");
    let weight = col(INDEX_WEIGHT).cast(DataType::Float64);

    let zero_dates = panel
        .lazy()
        .group_by_stable([col(DATE)])
        .agg([weight.clone().sum().alias(INDEX_WEIGHT)])
        .filter(col(INDEX_WEIGHT).eq(lit(0.0)))
        .collect()?
        .height();
    if zero_dates > 0 {
        tracing::warn!(zero_dates, "dates with zero total index weight");
    }

    let total = weight.clone().sum().over([col(DATE)]);
    Ok(panel.map_lazy(|lf| {
        lf.with_column(
            when(total.clone().eq(lit(0.0)))
                .then(lit(NULL).cast(DataType::Float64))
                .otherwise(weight / total)
                .alias(INDEX_WEIGHT),
        )
    })?)
}

/// Keep rows whose text `column` starts with `prefix` (e.g. a GIC sector code).
///
/// Integer columns are compared through their decimal text.
pub fn filter_by_prefix(panel: Panel, column: &str, prefix: &str) -> Result<Panel, MembershipError> {
    let dtype = panel.column(column)?.dtype().clone();
    let text = match dtype {
        DataType::String => col(column),
        ref int if int.is_integer() => col(column).cast(DataType::String),
        other => {
            return Err(polars_err!(
                SchemaMismatch: "column '{}' has type {}, expected text", column, other
            )
            .into())
        }
    };
    Ok(panel.map_lazy(|lf| lf.filter(text.str().starts_with(lit(prefix.to_string()))))?)
}

/// Prefix filter followed by optional weight renormalization.
pub fn restrict_universe(
    panel: Panel,
    column: &str,
    prefix: &str,
    renormalize: bool,
) -> Result<Panel, MembershipError> {
    let panel = if prefix.is_empty() {
        panel
    } else {
        filter_by_prefix(panel, column, prefix)?
    };
    if renormalize {
        renormalize_weights(panel)
    } else {
        Ok(panel)
    }
}

/// Drop rows with `in_index != 1`.
pub fn keep_in_index_only(panel: Panel) -> Result<Panel, MembershipError> {
    let mask = row_mask(&panel.universe_mask());
    Ok(panel.map_frame(|frame| frame.filter(&mask))?)
}
