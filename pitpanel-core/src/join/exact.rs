//! Exact-key left join with cardinality validation.

use polars::prelude::*;

use super::JoinError;
use crate::columns::group_rows;

/// Expected relationship between left and right keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinCardinality {
    /// Each key appears at most once on both sides.
    OneToOne,
    /// Right keys are unique; left keys may repeat.
    ManyToOne,
    /// No restriction. Left rows may be duplicated.
    ManyToMany,
}

/// Left join of `right` onto `left` on equally named key columns.
///
/// Left row order is preserved. Null keys never match. Right non-key columns
/// replace same-named left columns. For `OneToOne` and `ManyToOne`, a right
/// key that would duplicate a left row is a `RowCountMismatch`.
pub fn left_join(
    left: &DataFrame,
    right: &DataFrame,
    on: &[&str],
    cardinality: JoinCardinality,
) -> Result<DataFrame, JoinError> {
    let keys = || on.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    if cardinality == JoinCardinality::OneToOne {
        let groups = group_rows(left, on)?;
        let grouped_rows: usize = groups.iter().map(Vec::len).sum();
        let distinct_rows = groups.len() + (left.height() - grouped_rows);
        if distinct_rows != left.height() {
            return Err(JoinError::RowCountMismatch {
                keys: keys(),
                expected: distinct_rows,
                actual: left.height(),
            });
        }
    }

    let payload: Vec<&str> = right
        .get_column_names_str()
        .into_iter()
        .filter(|name| !on.contains(name))
        .collect();
    let mut left_df = left.clone();
    for &name in &payload {
        if left_df.get_column_index(name).is_some() {
            tracing::warn!(column = name, "left join overwrites existing column");
            left_df = left_df.drop(name)?;
        }
    }
    let right_df = right.select(on.iter().copied().chain(payload.iter().copied()))?;

    let args = JoinArgs {
        maintain_order: MaintainOrderJoin::Left,
        ..JoinArgs::new(JoinType::Left)
    };
    let out = left_df.join(&right_df, on.iter().copied(), on.iter().copied(), args, None)?;

    if cardinality != JoinCardinality::ManyToMany && out.height() != left.height() {
        return Err(JoinError::RowCountMismatch {
            keys: keys(),
            expected: left.height(),
            actual: out.height(),
        });
    }
    Ok(out)
}
