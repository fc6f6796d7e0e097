//! Per-date, per-group statistics restricted to the investment universe.
//!
//! Groups are formed by `date` plus the caller's key columns. When a
//! statistic is restricted to the universe, only `in_index == 1` rows feed
//! it. Rows with a null key belong to no group and get null.

use polars::prelude::*;

use super::TransformError;
use crate::columns::{f64_values, float_column, group_rows};
use crate::panel::{universe_mask, Panel, DATE, IN_INDEX};

const COLLAPSED: &str = "__collapsed";
const DISTINCT: &str = "__distinct";

/// Result of a group function.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupOutput {
    /// One value for the whole group, broadcast to every row of the group
    /// at that date, in or out of the universe.
    Scalar(Option<f64>),
    /// One value per input row, in input order. Rows that did not feed the
    /// function get null.
    PerRow(Vec<Option<f64>>),
}

fn group_columns<'a>(key: &[&'a str]) -> Vec<&'a str> {
    let mut cols = Vec::with_capacity(key.len() + 1);
    cols.push(DATE);
    cols.extend(key.iter().filter(|k| **k != DATE));
    cols
}

fn require_numeric(panel: &Panel, feature: &str) -> Result<(), TransformError> {
    let dtype = panel.column(feature)?.dtype();
    if dtype.is_primitive_numeric() || dtype.is_bool() || dtype.is_null() {
        Ok(())
    } else {
        Err(TransformError::NotNumeric(feature.to_string()))
    }
}

/// `feature` as `Float64` on rows that feed the group statistic, null elsewhere.
fn fed_values(panel: &Panel, feature: &str, group: &[&str], restrict_to_universe: bool) -> Expr {
    let universe = if !restrict_to_universe {
        lit(true)
    } else if panel.has_column(IN_INDEX) {
        col(IN_INDEX)
            .cast(DataType::Float64)
            .eq(lit(1.0))
            .fill_null(lit(false))
    } else {
        lit(false)
    };
    let fed = group
        .iter()
        .fold(universe, |acc, k| acc.and(col(*k).is_not_null()));
    when(fed)
        .then(col(feature).cast(DataType::Float64))
        .otherwise(lit(NULL).cast(DataType::Float64))
}

fn partition(group: &[&str]) -> Vec<Expr> {
    group.iter().map(|k| col(*k)).collect()
}

/// Key values of `row` joined with `/`, for error messages.
fn describe(frame: &DataFrame, group: &[&str], row: usize) -> Result<String, TransformError> {
    let mut parts = Vec::with_capacity(group.len());
    for name in group {
        let text = frame.column(name)?.cast(&DataType::String)?;
        parts.push(text.str()?.get(row).unwrap_or("null").to_string());
    }
    Ok(parts.join("/"))
}

/// Apply `f` to `feature` within each (date, key) group and store the result
/// in `output`.
pub fn apply_within_group<F>(
    panel: Panel,
    feature: &str,
    key: &[&str],
    restrict_to_universe: bool,
    output: &str,
    f: F,
) -> Result<Panel, TransformError>
where
    F: Fn(&[Option<f64>]) -> GroupOutput,
{
    require_numeric(&panel, feature)?;
    let frame = panel.frame();
    let values = f64_values(frame, feature)?;
    let mask = if restrict_to_universe {
        universe_mask(frame)
    } else {
        vec![true; frame.height()]
    };
    let mut out = vec![None; frame.height()];
    for rows in group_rows(frame, &group_columns(key))? {
        let fed: Vec<usize> = rows.iter().copied().filter(|&r| mask[r]).collect();
        if fed.is_empty() {
            continue;
        }
        let inputs: Vec<Option<f64>> = fed.iter().map(|&r| values[r]).collect();
        match f(&inputs) {
            GroupOutput::Scalar(v) => {
                for &r in &rows {
                    out[r] = v;
                }
            }
            GroupOutput::PerRow(vs) => {
                if vs.len() != fed.len() {
                    return Err(TransformError::GroupOutputLength {
                        expected: fed.len(),
                        actual: vs.len(),
                    });
                }
                for (&r, v) in fed.iter().zip(vs) {
                    out[r] = v;
                }
            }
        }
    }
    Ok(panel.with_column(float_column(output, &out))?)
}

/// Ordinal rank of `feature` within each (date, key) group into
/// `{feature}_ranked`, starting at 1. Ties get distinct consecutive ranks.
pub fn rank(
    panel: Panel,
    feature: &str,
    key: &[&str],
    ascending: bool,
    restrict_to_universe: bool,
) -> Result<Panel, TransformError> {
    require_numeric(&panel, feature)?;
    let group = group_columns(key);
    let options = RankOptions {
        method: RankMethod::Ordinal,
        descending: !ascending,
    };
    let ranked = fed_values(&panel, feature, &group, restrict_to_universe)
        .rank(options, None)
        .over(partition(&group))
        .cast(DataType::Int64)
        .alias(format!("{feature}_ranked"));
    Ok(panel.map_lazy(|lf| lf.with_column(ranked))?)
}

/// Split `feature` into `buckets` equal-frequency buckets labelled
/// `0..buckets` within each (date, key) group, into `{feature}_quantile`.
///
/// Bucket edges are the group's linearly interpolated quantiles at
/// `i / buckets`; a value falls in the first bucket whose upper edge it does
/// not exceed, so tied values always share a bucket. A group whose edges
/// coincide, because it has fewer than `buckets` distinct values or because
/// ties would leave a bucket empty, is an error.
pub fn quantile(
    panel: Panel,
    feature: &str,
    key: &[&str],
    restrict_to_universe: bool,
    buckets: usize,
) -> Result<Panel, TransformError> {
    if buckets == 0 {
        return Err(TransformError::ZeroBuckets);
    }
    require_numeric(&panel, feature)?;
    let group = group_columns(key);
    let fed = fed_values(&panel, feature, &group, restrict_to_universe);
    let edges: Vec<Expr> = (0..=buckets)
        .map(|i| {
            fed.clone()
                .quantile(lit(i as f64 / buckets as f64), QuantileMethod::Linear)
                .over(partition(&group))
        })
        .collect();

    let bucket = (1..buckets).fold(lit(0i64), |acc, i| {
        acc + fed.clone().gt(edges[i].clone()).cast(DataType::Int64)
    });
    let bucket = when(fed.clone().is_not_null())
        .then(bucket)
        .otherwise(lit(NULL).cast(DataType::Int64));
    let collapsed = if buckets > 1 {
        (1..=buckets).fold(lit(false), |acc, i| {
            acc.or(edges[i].clone().lt_eq(edges[i - 1].clone()).fill_null(lit(false)))
        })
    } else {
        lit(false)
    };
    let distinct = fed
        .clone()
        .drop_nulls()
        .n_unique()
        .over(partition(&group));
    let too_few = distinct
        .clone()
        .gt(lit(0i64))
        .and(distinct.clone().lt(lit(buckets as i64)));
    let collapsed = collapsed.or(too_few);

    let name = format!("{feature}_quantile");
    let out = panel
        .lazy()
        .with_columns([
            bucket.alias(name.as_str()),
            collapsed.alias(COLLAPSED),
            distinct.alias(DISTINCT),
        ])
        .collect()?;

    let flagged = out
        .column(COLLAPSED)?
        .bool()?
        .into_iter()
        .position(|c| c == Some(true));
    if let Some(row) = flagged {
        let distinct = out
            .column(DISTINCT)?
            .cast(&DataType::UInt64)?
            .u64()?
            .get(row)
            .unwrap_or_default() as usize;
        return Err(TransformError::TooFewDistinctValues {
            column: feature.to_string(),
            group: describe(&out, &group, row)?,
            distinct,
            buckets,
        });
    }
    Ok(Panel::new(out.drop_many([COLLAPSED, DISTINCT]))?)
}

/// Subtract the in-universe (key, date) mean of each feature from every row
/// of that group, in or out of the universe.
///
/// Rows in a group with no in-universe values get null.
pub fn mean_center(panel: Panel, features: &[&str], key: &[&str]) -> Result<Panel, TransformError> {
    let group = group_columns(key);
    let mut exprs = Vec::with_capacity(features.len());
    for feature in features {
        require_numeric(&panel, feature)?;
        let mean = fed_values(&panel, feature, &group, true)
            .mean()
            .over(partition(&group));
        exprs.push((col(*feature).cast(DataType::Float64) - mean).alias(*feature));
    }
    Ok(panel.map_lazy(|lf| lf.with_columns(exprs))?)
}

/// Divide each feature by its in-universe standard deviation.
///
/// The deviation is taken per (key, date, `in_index`) group over
/// `in_index == 1` rows, so out-of-universe rows have no deviation and become
/// null. This grouping is finer than [`mean_center`]'s (key, date). Groups
/// with fewer than two values, or zero spread, also give null.
pub fn standardize(panel: Panel, features: &[&str], key: &[&str]) -> Result<Panel, TransformError> {
    let mut group_key: Vec<&str> = key.to_vec();
    if !group_key.contains(&IN_INDEX) {
        group_key.push(IN_INDEX);
    }
    let group = group_columns(&group_key);
    let mut exprs = Vec::with_capacity(features.len());
    for feature in features {
        require_numeric(&panel, feature)?;
        let fed = fed_values(&panel, feature, &group, true);
        let std = fed.clone().std(1).over(partition(&group));
        let count = fed.count().over(partition(&group));
        exprs.push(
            when(count.gt_eq(lit(2)).and(std.clone().gt(lit(0.0))))
                .then(col(*feature).cast(DataType::Float64) / std)
                .otherwise(lit(NULL).cast(DataType::Float64))
                .alias(*feature),
        );
    }
    Ok(panel.map_lazy(|lf| lf.with_columns(exprs))?)
}

/// Standardize, then mean-center, each feature within `key` groups.
pub fn center_and_standardize(
    panel: Panel,
    features: &[&str],
    key: &[&str],
) -> Result<Panel, TransformError> {
    let panel = standardize(panel, features, key)?;
    mean_center(panel, features, key)
}
