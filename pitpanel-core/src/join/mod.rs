//! Temporal and exact-key joins.
//!
//! [`asof_merge`] attaches, to each left row, the nearest eligible right row
//! in time within the same by-key group. [`left_join`] is the exact-key join
//! with cardinality validation used wherever a merge must not add rows.

mod asof;
mod exact;

pub use asof::{asof_merge, AsofDirection, AsofOptions};
pub use exact::{left_join, JoinCardinality};

use polars::prelude::{DataType, PolarsError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("asof key '{column}' must be a date or integer column, found {dtype}")]
    InvalidTimeKey { column: String, dtype: DataType },

    #[error("join keys '{left}' ({left_dtype}) and '{right}' ({right_dtype}) have different types")]
    KeyTypeMismatch {
        left: String,
        left_dtype: DataType,
        right: String,
        right_dtype: DataType,
    },

    #[error("left_by has {left} columns but right_by has {right}")]
    ByArity { left: usize, right: usize },

    #[error("join on {keys:?} changed row count: expected {expected}, got {actual}")]
    RowCountMismatch {
        keys: Vec<String>,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Polars(#[from] PolarsError),
}
