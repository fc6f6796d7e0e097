//! Walk-forward evaluation over panel dates.
//!
//! Every panel date past the burn-in becomes a "present". Its past is every
//! row dated from `present - lookback` up to and including the present, and
//! its future is the panel date `prediction_steps` ahead. Registered window
//! functions see the full panel, the window descriptor and the three slices,
//! and their outputs are collected per function name.
//!
//! Windows are independent of each other, so the parallel path is a plain
//! rayon map over windows.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use polars::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pitpanel_core::calendar::CalendarOffset;
use pitpanel_core::columns::date_lit;
use pitpanel_core::panel::{Panel, DATE};

/// Error type returned by window functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Roughly a century: an expanding past.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 36_500;

// ─── Configuration ───────────────────────────────────────────────────

/// How windows are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Execution {
    /// One window at a time, in date order, with progress callbacks.
    #[default]
    Sequential,
    /// Windows mapped across a rayon pool. `n_jobs = None` uses the global pool.
    Parallel {
        #[serde(default)]
        n_jobs: Option<usize>,
    },
}

/// Configuration for walk-forward evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkForwardConfig {
    /// Panel steps between the present and the future date (default 1).
    pub prediction_steps: usize,
    /// Panel steps skipped before the first present (default 0).
    pub burn_in_steps: usize,
    /// How far back the past reaches from the present.
    pub lookback: CalendarOffset,
    /// Date column holding the latest information each row contains.
    /// Past rows are kept only when this is strictly before the present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train_lt: Option<String>,
    pub execution: Execution,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            prediction_steps: 1,
            burn_in_steps: 0,
            lookback: CalendarOffset::days(DEFAULT_LOOKBACK_DAYS),
            train_lt: None,
            execution: Execution::Sequential,
        }
    }
}

impl WalkForwardConfig {
    pub fn validate(&self) -> Result<(), WalkForwardError> {
        if self.lookback.months < 0 || self.lookback.days < 0 {
            return Err(WalkForwardError::NegativeLookback(self.lookback.to_string()));
        }
        if let Execution::Parallel { n_jobs: Some(0) } = self.execution {
            return Err(WalkForwardError::ZeroJobs);
        }
        Ok(())
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WalkForwardError {
    #[error("lookback must not be negative, got {0}")]
    NegativeLookback(String),

    #[error("parallel execution needs at least one job")]
    ZeroJobs,

    #[error("no window functions registered")]
    NoFunctions,

    #[error("window function '{0}' is already registered")]
    DuplicateFunction(String),

    #[error("window function '{name}' failed at {present_date}: {source}")]
    FunctionFailed {
        name: String,
        present_date: NaiveDate,
        #[source]
        source: BoxError,
    },

    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Polars(#[from] PolarsError),
}

// ─── Windows ─────────────────────────────────────────────────────────

/// One past/present/future split point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    /// Position of the present among the distinct panel dates.
    pub index: usize,
    pub present_date: NaiveDate,
    pub past_begin: NaiveDate,
    pub past_end: NaiveDate,
    pub future_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_lt: Option<String>,
}

/// Lazy sequence of windows over sorted distinct dates.
///
/// Date `i` is a present iff `i >= burn_in_steps`, `i >= prediction_steps`,
/// `i + prediction_steps` is still a date, and it is later than the first
/// date. The iterator is consumed once; build a new one to start over.
#[derive(Debug, Clone)]
pub struct DateWindows {
    dates: Vec<NaiveDate>,
    position: usize,
    prediction_steps: usize,
    burn_in_steps: usize,
    lookback: CalendarOffset,
    train_lt: Option<String>,
}

impl DateWindows {
    pub fn new(mut dates: Vec<NaiveDate>, config: &WalkForwardConfig) -> Self {
        dates.sort_unstable();
        dates.dedup();
        Self {
            dates,
            position: 0,
            prediction_steps: config.prediction_steps,
            burn_in_steps: config.burn_in_steps,
            lookback: config.lookback,
            train_lt: config.train_lt.clone(),
        }
    }

    pub fn for_panel(panel: &Panel, config: &WalkForwardConfig) -> Self {
        Self::new(panel.dates(), config)
    }

    fn window_at(&self, i: usize) -> Option<DateWindow> {
        let steps = self.prediction_steps;
        let present = *self.dates.get(i)?;
        let first = *self.dates.first()?;
        let future = *self.dates.get(i.checked_add(steps)?)?;
        if i < self.burn_in_steps || i < steps || present <= first {
            return None;
        }
        // A lookback reaching past the calendar range covers everything.
        let past_begin = self.lookback.subtract_from(present).unwrap_or(NaiveDate::MIN);
        Some(DateWindow {
            index: i,
            present_date: present,
            past_begin,
            past_end: present,
            future_date: future,
            train_lt: self.train_lt.clone(),
        })
    }
}

impl Iterator for DateWindows {
    type Item = DateWindow;

    fn next(&mut self) -> Option<DateWindow> {
        while self.position < self.dates.len() {
            let i = self.position;
            self.position += 1;
            if let Some(window) = self.window_at(i) {
                return Some(window);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.dates.len().saturating_sub(self.position)))
    }
}

// ─── Temporal split ──────────────────────────────────────────────────

/// Rows of one window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSlices {
    pub past: DataFrame,
    pub present: DataFrame,
    pub future: DataFrame,
}

/// Slice the panel into the window's past, present and future rows.
///
/// With `train_lt` set, past rows whose `train_lt` value is null or not
/// strictly before `past_end` are dropped as well.
pub fn temporal_split(panel: &Panel, window: &DateWindow) -> Result<WindowSlices, WalkForwardError> {
    let mut past = col(DATE)
        .gt_eq(date_lit(window.past_begin))
        .and(col(DATE).lt_eq(date_lit(window.past_end)));
    if let Some(column) = &window.train_lt {
        panel.frame().column(column)?.date()?;
        past = past.and(col(column.as_str()).lt(date_lit(window.past_end)));
    }
    let rows = |predicate: Expr| panel.lazy().filter(predicate).collect();

    Ok(WindowSlices {
        past: rows(past)?,
        present: rows(col(DATE).eq(date_lit(window.present_date)))?,
        future: rows(col(DATE).eq(date_lit(window.future_date)))?,
    })
}

// ─── Window functions ────────────────────────────────────────────────

/// What a window function sees.
pub struct WindowInput<'a> {
    pub panel: &'a Panel,
    pub window: &'a DateWindow,
    pub past: &'a DataFrame,
    pub present: &'a DataFrame,
    pub future: &'a DataFrame,
}

type WindowFn<R> = dyn Fn(&WindowInput<'_>) -> Result<R, BoxError> + Send + Sync;

/// Named window functions, kept in registration order.
///
/// Extra arguments are captured by the closures.
pub struct WindowFunctions<R> {
    functions: Vec<(String, Box<WindowFn<R>>)>,
}

impl<R> Default for WindowFunctions<R> {
    fn default() -> Self {
        Self {
            functions: Vec::new(),
        }
    }
}

impl<R> std::fmt::Debug for WindowFunctions<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowFunctions")
            .field("names", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

impl<R> WindowFunctions<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> Result<(), WalkForwardError>
    where
        F: Fn(&WindowInput<'_>) -> Result<R, BoxError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.functions.iter().any(|(n, _)| *n == name) {
            return Err(WalkForwardError::DuplicateFunction(name));
        }
        self.functions.push((name, Box::new(function)));
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(mut self, name: impl Into<String>, function: F) -> Result<Self, WalkForwardError>
    where
        F: Fn(&WindowInput<'_>) -> Result<R, BoxError> + Send + Sync + 'static,
    {
        self.register(name, function)?;
        Ok(self)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn evaluate(&self, panel: &Panel, window: &DateWindow) -> Result<Vec<R>, WalkForwardError> {
        let slices = temporal_split(panel, window)?;
        let input = WindowInput {
            panel,
            window,
            past: &slices.past,
            present: &slices.present,
            future: &slices.future,
        };
        self.functions
            .iter()
            .map(|(name, function)| {
                function(&input).map_err(|source| WalkForwardError::FunctionFailed {
                    name: name.clone(),
                    present_date: window.present_date,
                    source,
                })
            })
            .collect()
    }
}

// ─── Results and progress ────────────────────────────────────────────

/// Outputs per function name, one per window.
///
/// `get(name)[i]` belongs to `windows()[i]`. Sequential runs produce
/// windows in date order; parallel callers should pair outputs with
/// `windows()` instead of assuming an order.
#[derive(Debug, Clone)]
pub struct WindowResults<R> {
    windows: Vec<DateWindow>,
    results: BTreeMap<String, Vec<R>>,
}

impl<R> WindowResults<R> {
    pub fn windows(&self) -> &[DateWindow] {
        &self.windows
    }

    pub fn get(&self, name: &str) -> Option<&[R]> {
        self.results.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.results.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn into_map(self) -> BTreeMap<String, Vec<R>> {
        self.results
    }
}

/// Progress snapshot after each window of a sequential run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowProgress {
    pub completed: usize,
    pub total: usize,
    pub present_date: NaiveDate,
}

// ─── Execution ───────────────────────────────────────────────────────

/// Apply every registered function to every window of `panel`.
///
/// The first failing function aborts the run.
pub fn apply_time_windowed_functions<R: Send>(
    panel: &Panel,
    functions: &WindowFunctions<R>,
    config: &WalkForwardConfig,
    progress_cb: Option<&dyn Fn(&WindowProgress)>,
) -> Result<WindowResults<R>, WalkForwardError> {
    config.validate()?;
    if functions.is_empty() {
        return Err(WalkForwardError::NoFunctions);
    }
    let windows: Vec<DateWindow> = DateWindows::for_panel(panel, config).collect();
    tracing::info!(
        windows = windows.len(),
        functions = functions.len(),
        execution = ?config.execution,
        "applying time-windowed functions"
    );

    let per_window = match config.execution {
        Execution::Sequential => run_sequential(panel, functions, &windows, progress_cb)?,
        Execution::Parallel { n_jobs } => run_parallel(panel, functions, &windows, n_jobs)?,
    };

    let mut results: BTreeMap<String, Vec<R>> = functions
        .names()
        .map(|name| (name.to_string(), Vec::with_capacity(windows.len())))
        .collect();
    for outputs in per_window {
        for (name, output) in functions.names().zip(outputs) {
            if let Some(list) = results.get_mut(name) {
                list.push(output);
            }
        }
    }
    Ok(WindowResults { windows, results })
}

fn run_sequential<R>(
    panel: &Panel,
    functions: &WindowFunctions<R>,
    windows: &[DateWindow],
    progress_cb: Option<&dyn Fn(&WindowProgress)>,
) -> Result<Vec<Vec<R>>, WalkForwardError> {
    let total = windows.len();
    let mut out = Vec::with_capacity(total);
    for (i, window) in windows.iter().enumerate() {
        out.push(functions.evaluate(panel, window)?);
        tracing::debug!(present = %window.present_date, completed = i + 1, total, "window done");
        if let Some(cb) = progress_cb {
            cb(&WindowProgress {
                completed: i + 1,
                total,
                present_date: window.present_date,
            });
        }
    }
    Ok(out)
}

fn run_parallel<R: Send>(
    panel: &Panel,
    functions: &WindowFunctions<R>,
    windows: &[DateWindow],
    n_jobs: Option<usize>,
) -> Result<Vec<Vec<R>>, WalkForwardError> {
    let map = || {
        windows
            .par_iter()
            .map(|window| functions.evaluate(panel, window))
            .collect::<Result<Vec<_>, _>>()
    };
    match n_jobs {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(n).build()?;
            pool.install(map)
        }
        None => map(),
    }
}
