//! Return series derived from panel columns.

use polars::prelude::*;

use super::lag::{lag, lag_column_name, offset_lag, offset_lag_column_name};
use super::TransformError;
use crate::calendar::CalendarOffset;
use crate::columns::date_lit;
use crate::join::{left_join, JoinCardinality};
use crate::membership::TOTAL_RETURN_INDEX;
use crate::panel::{Panel, DATE, IN_INDEX, UNIT_KEY};

pub const RETURNS: &str = "returns";
pub const PORTFOLIO_RETURN: &str = "portfolio_return";
pub const BENCHMARK_RETURN: &str = "benchmark_return";
pub const EXCESS_RETURN: &str = "excess_return";

fn keep_columns(panel: Panel, names: &[String], extra: &str) -> Result<Panel, TransformError> {
    let mut cols: Vec<&str> = names.iter().map(String::as_str).filter(|n| *n != extra).collect();
    cols.push(extra);
    Ok(panel.map_frame(|frame| frame.select(cols))?)
}

fn column_names(panel: &Panel) -> Vec<String> {
    panel
        .frame()
        .get_column_names_str()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// `num / den`, or `num / den - 1`; null when either side is null or `den` is zero.
fn ratio(num: &str, den: &str, minus_one: bool) -> Expr {
    let num = col(num).cast(DataType::Float64);
    let den = col(den).cast(DataType::Float64);
    let quotient = num / den.clone();
    let quotient = if minus_one { quotient - lit(1.0) } else { quotient };
    when(den.neq(lit(0.0)))
        .then(quotient)
        .otherwise(lit(NULL).cast(DataType::Float64))
}

/// Gross return since the previous panel date: `tri / tri_lag(1)`.
///
/// Adds `total_return_index_lag(1)` and `returns`.
pub fn returns(panel: Panel) -> Result<Panel, TransformError> {
    let panel = lag(panel, TOTAL_RETURN_INDEX, &UNIT_KEY, 1)?;
    let prev = lag_column_name(TOTAL_RETURN_INDEX, 1);
    let gross = ratio(TOTAL_RETURN_INDEX, &prev, false).alias(RETURNS);
    Ok(panel.map_lazy(|lf| lf.with_column(gross))?)
}

/// Equal weights over the universe: `in_index / sum(in_index)` per date.
///
/// Dates without members get null.
fn equal_weights(panel: &Panel) -> Expr {
    let member = if panel.has_column(IN_INDEX) {
        col(IN_INDEX)
            .cast(DataType::Float64)
            .eq(lit(1.0))
            .fill_null(lit(false))
    } else {
        lit(false)
    };
    let members = member
        .clone()
        .cast(DataType::Float64)
        .sum()
        .over([col(DATE)]);
    when(members.clone().gt(lit(0.0)))
        .then(
            when(member)
                .then(lit(1.0) / members)
                .otherwise(lit(0.0)),
        )
        .otherwise(lit(NULL).cast(DataType::Float64))
}

/// Weighted portfolio gross return per date, stored in `output`.
///
/// Each row contributes `weight_lag(-1) * (returns - 1)`; the per-date sum
/// plus one is broadcast to every row of that date. The first date has no
/// prior period and gets null. When `weight_column` is missing, equal
/// universe weights are used. Only the input columns plus `output` are kept.
pub fn portfolio_return(
    panel: Panel,
    weight_column: &str,
    output: &str,
) -> Result<Panel, TransformError> {
    let original = column_names(&panel);
    let mut panel = panel;
    if !panel.has_column(RETURNS) {
        panel = returns(panel)?;
    }
    if !panel.has_column(weight_column) {
        tracing::warn!(column = weight_column, "weight column not found; using equal weights");
        let weights = equal_weights(&panel).alias(weight_column);
        panel = panel.map_lazy(|lf| lf.with_column(weights))?;
    }
    let panel = lag(panel, weight_column, &UNIT_KEY, -1)?;
    let Some(first) = panel.dates().first().copied() else {
        return keep_columns(
            panel.with_column(Column::full_null(output.into(), 0, &DataType::Float64))?,
            &original,
            output,
        );
    };

    let next_weight = col(lag_column_name(weight_column, -1)).cast(DataType::Float64);
    let contribution = next_weight * (col(RETURNS).cast(DataType::Float64) - lit(1.0));
    let per_date = panel
        .lazy()
        .filter(col(DATE).neq(date_lit(first)))
        .group_by_stable([col(DATE)])
        .agg([(contribution.sum() + lit(1.0)).alias(output)])
        .collect()?;

    let joined = left_join(panel.frame(), &per_date, &[DATE], JoinCardinality::ManyToOne)?;
    keep_columns(Panel::new(joined)?, &original, output)
}

/// Asset return minus the benchmark portfolio return weighted by
/// `benchmark_weight_column`, stored in `excess_return`.
pub fn excess_return(panel: Panel, benchmark_weight_column: &str) -> Result<Panel, TransformError> {
    tracing::warn!(
        weights = benchmark_weight_column,
        "calculating excess return over the weighted benchmark"
    );
    let original = column_names(&panel);
    let panel = portfolio_return(panel, benchmark_weight_column, BENCHMARK_RETURN)?;
    let panel = returns(panel)?;
    let excess = (col(RETURNS).cast(DataType::Float64)
        - col(BENCHMARK_RETURN).cast(DataType::Float64))
    .alias(EXCESS_RETURN);
    let panel = panel.map_lazy(|lf| lf.with_column(excess))?;
    keep_columns(panel, &original, EXCESS_RETURN)
}

/// Momentum between two calendar lags: `feature_lag(end) / feature_lag(start) - 1`.
///
/// With `start = 12M` and `end = 1M` this is the classic 12-1 momentum.
pub fn offset_momentum(
    panel: Panel,
    feature: &str,
    start: CalendarOffset,
    end: CalendarOffset,
    output: &str,
) -> Result<Panel, TransformError> {
    let original = column_names(&panel);
    let panel = offset_lag(panel, feature, &UNIT_KEY, start)?;
    let panel = offset_lag(panel, feature, &UNIT_KEY, end)?;
    let from = offset_lag_column_name(feature, start);
    let to = offset_lag_column_name(feature, end);
    let momentum = ratio(&to, &from, true).alias(output);
    let panel = panel.map_lazy(|lf| lf.with_column(momentum))?;
    keep_columns(panel, &original, output)
}

/// Fill nulls in each numeric variable with that variable's mean.
///
/// Not restricted to the universe. Non-numeric variables are left untouched,
/// as are variables with no values at all.
pub fn interpolate_missing_with_mean(
    panel: Panel,
    variables: &[&str],
) -> Result<Panel, TransformError> {
    let mut fills = Vec::with_capacity(variables.len());
    for variable in variables {
        let column = panel.column(variable)?;
        if !column.dtype().is_primitive_numeric() {
            tracing::debug!(column = *variable, "skipping non-numeric column");
            continue;
        }
        if column.null_count() == column.len() {
            continue;
        }
        let values = col(*variable).cast(DataType::Float64);
        fills.push(values.clone().fill_null(values.mean()).alias(*variable));
    }
    if fills.is_empty() {
        return Ok(panel);
    }
    Ok(panel.map_lazy(|lf| lf.with_columns(fills))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::{f64_values, float_column};
    use crate::panel::{INDEX_WEIGHT, SECURITY_KEY, SECURITY_KEY_NAME};
    use chrono::NaiveDate;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    /// Two securities over three month starts.
    fn panel(with_weights: bool) -> Panel {
        let dates = [d("2020-01-01"), d("2020-02-01"), d("2020-03-01")];
        let mut frame = df!(
            SECURITY_KEY_NAME => &["cusip"; 6],
            SECURITY_KEY => &["a", "a", "a", "b", "b", "b"],
            DATE => &[dates[0], dates[1], dates[2], dates[0], dates[1], dates[2]],
            IN_INDEX => &[1i64; 6],
            TOTAL_RETURN_INDEX => &[100.0, 110.0, 121.0, 50.0, 50.0, 45.0],
        )
        .unwrap();
        if with_weights {
            frame
                .with_column(Column::new(
                    INDEX_WEIGHT.into(),
                    &[0.5, 0.75, 0.75, 0.5, 0.25, 0.25],
                ))
                .unwrap();
        }
        Panel::new(frame).unwrap()
    }

    fn sorted_values(panel: &Panel, by: [&str; 2], name: &str) -> Vec<Option<f64>> {
        let sorted = panel
            .frame()
            .sort(by, SortMultipleOptions::default())
            .unwrap();
        f64_values(&sorted, name).unwrap()
    }

    fn close(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 1e-12)
    }

    #[test]
    fn returns_are_gross_ratios() {
        let out = returns(panel(false)).unwrap();
        let r = f64_values(out.frame(), RETURNS).unwrap();
        assert_eq!(r[0], None);
        assert!(close(r[1], 1.1));
        assert!(close(r[5], 0.9));
    }

    #[test]
    fn portfolio_return_uses_next_step_weights() {
        let out = portfolio_return(panel(true), INDEX_WEIGHT, PORTFOLIO_RETURN).unwrap();
        assert!(!out.has_column(RETURNS));
        let p = sorted_values(&out, [DATE, SECURITY_KEY], PORTFOLIO_RETURN);
        assert_eq!(p[0], None);
        assert_eq!(p[1], None);
        // February: a returns 10% with March weight 0.75, b flat with 0.25.
        assert!(close(p[2], 1.075));
        // March has no following weights.
        assert!(close(p[4], 1.0));
    }

    #[test]
    fn missing_weights_fall_back_to_equal() {
        let out = portfolio_return(panel(false), INDEX_WEIGHT, PORTFOLIO_RETURN).unwrap();
        assert!(!out.has_column(INDEX_WEIGHT));
        let p = sorted_values(&out, [DATE, SECURITY_KEY], PORTFOLIO_RETURN);
        assert!(close(p[2], 1.05));
    }

    #[test]
    fn excess_return_subtracts_benchmark() {
        let out = excess_return(panel(true), INDEX_WEIGHT).unwrap();
        let e = sorted_values(&out, [DATE, SECURITY_KEY], EXCESS_RETURN);
        assert_eq!(e[0], None);
        assert!(close(e[2], 1.1 - 1.075));
        assert!(close(e[3], 1.0 - 1.075));
    }

    #[test]
    fn momentum_between_month_lags() {
        let out = offset_momentum(
            panel(false),
            TOTAL_RETURN_INDEX,
            CalendarOffset::months(2),
            CalendarOffset::months(1),
            "momentum",
        )
        .unwrap();
        let m = sorted_values(&out, [SECURITY_KEY, DATE], "momentum");
        assert_eq!(m[0], None);
        assert_eq!(m[1], None);
        assert!(close(m[2], 0.1));
        assert!(close(m[5], 0.0));
    }

    #[test]
    fn interpolation_fills_with_mean() {
        let panel = panel(false)
            .with_column(float_column(
                "x",
                &[Some(1.0), None, Some(3.0), None, None, None],
            ))
            .unwrap();
        let out = interpolate_missing_with_mean(panel, &["x", SECURITY_KEY]).unwrap();
        assert_eq!(out.column("x").unwrap().null_count(), 0);
        assert_eq!(f64_values(out.frame(), "x").unwrap()[1], Some(2.0));
    }
}
