//! Feature transforms over panels: lags, cross-sectional statistics and
//! derived return series.

pub mod cross_section;
pub mod derived;
pub mod lag;

pub use cross_section::{
    apply_within_group, center_and_standardize, mean_center, quantile, rank, standardize,
    GroupOutput,
};
pub use derived::{
    excess_return, interpolate_missing_with_mean, offset_momentum, portfolio_return, returns,
};
pub use lag::{lag, lag_column_name, offset_lag, offset_lag_column_name};

use polars::prelude::PolarsError;
use thiserror::Error;

use crate::calendar::CalendarError;
use crate::join::JoinError;
use crate::panel::PanelError;

/// Scratch column that carries the original row position through a sort.
pub(crate) const ROW_INDEX: &str = "__row_index";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("cannot split {distinct} distinct values of '{column}' into {buckets} buckets (group {group})")]
    TooFewDistinctValues {
        column: String,
        group: String,
        distinct: usize,
        buckets: usize,
    },

    #[error("bucket count must be positive")]
    ZeroBuckets,

    #[error("column '{0}' is not numeric")]
    NotNumeric(String),

    #[error("group function returned {actual} values for a group of {expected} rows")]
    GroupOutputLength { expected: usize, actual: usize },

    #[error(transparent)]
    Polars(#[from] PolarsError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error(transparent)]
    Panel(#[from] PanelError),
}
