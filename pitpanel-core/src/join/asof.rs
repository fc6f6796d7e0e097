//! As-of merge on top of the polars asof join.

use polars::prelude::*;
use serde::{Deserialize, Serialize};

use super::JoinError;
use crate::columns::row_mask;
use crate::panel::{DATE, UNIT_KEY};

/// Which side of the left row's time the matched right row may lie on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsofDirection {
    /// Latest right row at or before the left time.
    #[default]
    Backward,
    /// Earliest right row at or after the left time.
    Forward,
}

/// Options for [`asof_merge`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsofOptions {
    pub left_on: String,
    pub right_on: String,
    pub left_by: Vec<String>,
    pub right_by: Vec<String>,
    pub direction: AsofDirection,
    /// When false, a right row with the same time as the left row never matches.
    pub allow_exact_matches: bool,
}

impl Default for AsofOptions {
    /// Backward join on `date` by the panel unit key, exact matches allowed.
    fn default() -> Self {
        Self {
            left_on: DATE.to_string(),
            right_on: DATE.to_string(),
            left_by: UNIT_KEY.iter().map(|s| s.to_string()).collect(),
            right_by: UNIT_KEY.iter().map(|s| s.to_string()).collect(),
            direction: AsofDirection::Backward,
            allow_exact_matches: true,
        }
    }
}

impl AsofOptions {
    /// Join on the same time column name on both sides, without by-keys.
    pub fn on(time: &str) -> Self {
        Self {
            left_on: time.to_string(),
            right_on: time.to_string(),
            left_by: Vec::new(),
            right_by: Vec::new(),
            ..Self::default()
        }
    }

    pub fn left_on(mut self, column: &str) -> Self {
        self.left_on = column.to_string();
        self
    }

    pub fn right_on(mut self, column: &str) -> Self {
        self.right_on = column.to_string();
        self
    }

    /// Same by-key column names on both sides.
    pub fn by(mut self, keys: &[&str]) -> Self {
        self.left_by = keys.iter().map(|s| s.to_string()).collect();
        self.right_by = self.left_by.clone();
        self
    }

    pub fn left_by(mut self, keys: &[&str]) -> Self {
        self.left_by = keys.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn right_by(mut self, keys: &[&str]) -> Self {
        self.right_by = keys.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn direction(mut self, direction: AsofDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn allow_exact_matches(mut self, allow: bool) -> Self {
        self.allow_exact_matches = allow;
        self
    }
}

fn time_dtype(frame: &DataFrame, name: &str) -> Result<DataType, JoinError> {
    let dtype = frame.column(name)?.dtype().clone();
    if dtype == DataType::Date || dtype.is_integer() {
        Ok(dtype)
    } else {
        Err(JoinError::InvalidTimeKey {
            column: name.to_string(),
            dtype,
        })
    }
}

fn check_same_type(
    left: &DataFrame,
    left_name: &str,
    right: &DataFrame,
    right_name: &str,
) -> Result<(), JoinError> {
    let l = left.column(left_name)?.dtype();
    let r = right.column(right_name)?.dtype();
    if l != r {
        return Err(JoinError::KeyTypeMismatch {
            left: left_name.to_string(),
            left_dtype: l.clone(),
            right: right_name.to_string(),
            right_dtype: r.clone(),
        });
    }
    Ok(())
}

/// As-of merge of `right` onto `left`.
///
/// The output holds every left row, ordered by the left time column (stable,
/// nulls last), followed by the right columns other than `right_by` (and
/// `right_on` when it shares the left time column's name). A right column
/// whose name already exists on the left replaces it, with a warning; the
/// left join keys themselves are never replaced.
///
/// For each left row, only right rows with equal by-keys are candidates;
/// null by-keys and null times never match. Among candidates with the same
/// time, a backward search takes the last in input order and a forward
/// search the first.
pub fn asof_merge(
    left: &DataFrame,
    right: &DataFrame,
    opts: &AsofOptions,
) -> Result<DataFrame, JoinError> {
    if opts.left_by.len() != opts.right_by.len() {
        return Err(JoinError::ByArity {
            left: opts.left_by.len(),
            right: opts.right_by.len(),
        });
    }
    time_dtype(left, &opts.left_on)?;
    time_dtype(right, &opts.right_on)?;
    check_same_type(left, &opts.left_on, right, &opts.right_on)?;
    for (l, r) in opts.left_by.iter().zip(&opts.right_by) {
        check_same_type(left, l, right, r)?;
    }

    let left_keys: Vec<&str> = std::iter::once(opts.left_on.as_str())
        .chain(opts.left_by.iter().map(String::as_str))
        .collect();
    let mut payload = Vec::new();
    for name in right.get_column_names_str() {
        if opts.right_by.iter().any(|b| b == name) {
            continue;
        }
        if name == opts.right_on && name == opts.left_on {
            continue;
        }
        if left_keys.contains(&name) {
            tracing::warn!(column = name, "asof merge keeps the left join key over a right column");
            continue;
        }
        payload.push(name);
    }

    let mut left_df = left.clone();
    let kept_right_time =
        (opts.right_on != opts.left_on && !left_keys.contains(&opts.right_on.as_str()))
            .then_some(opts.right_on.as_str());
    for name in payload.iter().copied().chain(kept_right_time) {
        if left_df.get_column_index(name).is_some() {
            tracing::warn!(column = name, "asof merge overwrites existing column");
            left_df = left_df.drop(name)?;
        }
    }
    let left_df = left_df.sort(
        [opts.left_on.as_str()],
        SortMultipleOptions::default()
            .with_maintain_order(true)
            .with_nulls_last(true),
    )?;

    // Right rows with a null time or by-key can never match.
    let right_cols: Vec<&str> = opts
        .right_by
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(opts.right_on.as_str()))
        .chain(payload.iter().copied())
        .collect();
    let mut right_df = right.select(right_cols.iter().copied())?;
    let mut keep = vec![true; right_df.height()];
    for key in opts.right_by.iter().chain(std::iter::once(&opts.right_on)) {
        for (row, null) in right_df.column(key)?.is_null().into_iter().enumerate() {
            if null == Some(true) {
                keep[row] = false;
            }
        }
    }
    if keep.contains(&false) {
        right_df = right_df.filter(&row_mask(&keep))?;
    }
    let right_df = right_df.sort(
        [opts.right_on.as_str()],
        SortMultipleOptions::default().with_maintain_order(true),
    )?;

    let by = |keys: &[String]| -> Option<Vec<PlSmallStr>> {
        (!keys.is_empty()).then(|| keys.iter().map(|k| k.as_str().into()).collect())
    };
    let strategy = match opts.direction {
        AsofDirection::Backward => AsofStrategy::Backward,
        AsofDirection::Forward => AsofStrategy::Forward,
    };
    let how = JoinType::AsOf(AsOfOptions {
        strategy,
        left_by: by(&opts.left_by),
        right_by: by(&opts.right_by),
        allow_eq: opts.allow_exact_matches,
        check_sortedness: false,
        ..AsOfOptions::default()
    });
    let out = left_df.join(
        &right_df,
        [opts.left_on.as_str()],
        [opts.right_on.as_str()],
        JoinArgs::new(how),
        None,
    )?;
    Ok(out)
}
