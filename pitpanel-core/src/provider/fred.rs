//! FRED / ALFRED economic series provider.
//!
//! Fetches every vintage of a series from the St. Louis Fed observations API,
//! keeps the first release of each observation and keys it on its release
//! date, so that as-of alignment never sees a value before it was published.
//! Handles retries with exponential backoff and response parsing.

use chrono::{Days, NaiveDate};
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{FeatureProvider, FeatureRequest, ProviderError};
use crate::columns::{date_column, float_column};
use crate::join::{asof_merge, AsofOptions};
use crate::panel::DATE;

/// Observation date of a point-in-time series row.
pub const PERIOD_DATE: &str = "period_date";

/// Initial claims releases before this date all carry it as their release date.
const ICSA_BACKFILL_RELEASE: (i32, u32, u32) = (2009, 5, 28);
/// Claims are published this many days after the week they describe.
const ICSA_RELEASE_LAG_DAYS: u64 = 5;

// ─── Configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FredConfig {
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for FredConfig {
    fn default() -> Self {
        Self {
            api_key_env: "FRED_API_KEY".into(),
            base_url: "https://api.stlouisfed.org/fred".into(),
            timeout_secs: 30,
            max_retries: 3,
            base_delay_ms: 500,
        }
    }
}

// ─── Wire types ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ObservationsResponse {
    observations: Option<Vec<WireObservation>>,
    error_code: Option<u16>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireObservation {
    realtime_start: String,
    date: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    seriess: Option<Vec<SeriesInfo>>,
    error_message: Option<String>,
}

/// One vintage of one observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FredObservation {
    /// Period the value describes.
    pub date: NaiveDate,
    /// Date this value became public.
    pub realtime_start: NaiveDate,
    /// `None` when FRED reports the value as missing (`"."`).
    pub value: Option<f64>,
}

/// Series metadata returned by a full-text search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub seasonal_adjustment: Option<String>,
    #[serde(default)]
    pub observation_start: Option<String>,
    #[serde(default)]
    pub observation_end: Option<String>,
    #[serde(default)]
    pub popularity: Option<i64>,
}

// ─── Parsing ────────────────────────────────────────────────────────

fn parse_date(s: &str) -> Result<NaiveDate, ProviderError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| ProviderError::ResponseFormatChanged(format!("bad date '{s}': {e}")))
}

fn parse_observations(series: &str, body: &str) -> Result<Vec<FredObservation>, ProviderError> {
    let resp: ObservationsResponse = serde_json::from_str(body).map_err(|e| {
        ProviderError::ResponseFormatChanged(format!("failed to parse response for {series}: {e}"))
    })?;
    let observations = resp.observations.ok_or_else(|| match (resp.error_code, resp.error_message) {
        (Some(400), Some(msg)) if msg.contains("does not exist") => {
            ProviderError::SeriesNotFound(series.to_string())
        }
        (_, Some(msg)) => ProviderError::ResponseFormatChanged(msg),
        _ => ProviderError::ResponseFormatChanged("no observations and no error".into()),
    })?;

    observations
        .into_iter()
        .map(|o| {
            let value = match o.value.trim() {
                "." | "" => None,
                v => Some(v.parse::<f64>().map_err(|e| {
                    ProviderError::ResponseFormatChanged(format!("bad value '{v}' for {series}: {e}"))
                })?),
            };
            Ok(FredObservation {
                date: parse_date(&o.date)?,
                realtime_start: parse_date(&o.realtime_start)?,
                value,
            })
        })
        .collect()
}

// ─── Point-in-time shaping ──────────────────────────────────────────

/// First release of each observation, keyed on its release date.
///
/// Columns: `period_date` (observation), `date` (release), `feature`.
/// Sorted by release date. Among vintages with the same earliest release,
/// the first one reported wins.
pub fn first_releases(
    observations: &[FredObservation],
    feature: &str,
) -> Result<DataFrame, ProviderError> {
    let mut first: BTreeMap<NaiveDate, &FredObservation> = BTreeMap::new();
    for obs in observations {
        first
            .entry(obs.date)
            .and_modify(|cur| {
                if obs.realtime_start < cur.realtime_start {
                    *cur = obs;
                }
            })
            .or_insert(obs);
    }
    let mut rows: Vec<&FredObservation> = first.into_values().collect();
    rows.sort_by_key(|o| (o.realtime_start, o.date));

    let periods: Vec<Option<NaiveDate>> = rows.iter().map(|o| Some(o.date)).collect();
    let releases: Vec<Option<NaiveDate>> = rows.iter().map(|o| Some(o.realtime_start)).collect();
    let values: Vec<Option<f64>> = rows.iter().map(|o| o.value).collect();
    Ok(DataFrame::new(vec![
        date_column(PERIOD_DATE, &periods),
        date_column(DATE, &releases),
        float_column(feature, &values),
    ])?)
}

/// The value of a series as it was known on each of `dates`.
///
/// Output has one row per distinct date with `date`, `period_date` and `feature`.
pub fn fred_point_in_time(
    observations: &[FredObservation],
    dates: &[NaiveDate],
    feature: &str,
) -> Result<DataFrame, ProviderError> {
    let mut dates: Vec<Option<NaiveDate>> = dates.iter().copied().map(Some).collect();
    dates.sort_unstable();
    dates.dedup();
    let grid = DataFrame::new(vec![date_column(DATE, &dates)])?;
    let releases = first_releases(observations, feature)?;
    Ok(asof_merge(&grid, &releases, &AsofOptions::on(DATE))?)
}

/// Initial claims before mid-2009 were backfilled with a single release
/// date. Move those releases to the observation date plus the publication lag.
pub fn correct_initial_claims_releases(observations: &mut [FredObservation]) {
    let (y, m, d) = ICSA_BACKFILL_RELEASE;
    let Some(cutoff) = NaiveDate::from_ymd_opt(y, m, d) else {
        return;
    };
    let mut corrected = 0usize;
    for obs in observations.iter_mut() {
        if obs.date < cutoff && obs.realtime_start == cutoff {
            if let Some(release) = obs.date.checked_add_days(Days::new(ICSA_RELEASE_LAG_DAYS)) {
                obs.realtime_start = release;
                corrected += 1;
            }
        }
    }
    tracing::debug!(corrected, "corrected backfilled initial claims release dates");
}

// ─── Retry policy ───────────────────────────────────────────────────

/// Pause before retry `attempt` (1-based).
///
/// Exponential backoff from `base`, never shorter than a rate limiter's
/// `Retry-After` from the previous response.
pub fn retry_delay(base: Duration, attempt: u32, retry_after: Option<Duration>) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let backoff = base.saturating_mul(factor);
    retry_after.map_or(backoff, |wait| backoff.max(wait))
}

/// Seconds to wait from a `Retry-After` header, 60 when absent or not numeric.
fn retry_after_secs(header: Option<&reqwest::header::HeaderValue>) -> u64 {
    header
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(60)
}

// ─── Provider ───────────────────────────────────────────────────────

/// Named features and the series behind them.
const NAMED_SERIES: [(&str, &str); 2] = [("gdp", "GDP"), ("initial_claims", "ICSA")];

/// FRED provider. Features are either the named ones (`gdp`,
/// `initial_claims`) or raw series ids such as `UNRATE`.
pub struct FredProvider {
    client: reqwest::blocking::Client,
    config: FredConfig,
    api_key: Option<String>,
}

impl FredProvider {
    pub fn new(config: FredConfig) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            api_key: None,
        })
    }

    /// Use an explicit key instead of reading the environment on connect.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn series_id(feature: &str) -> &str {
        NAMED_SERIES
            .iter()
            .find(|(name, _)| *name == feature)
            .map_or(feature, |(_, id)| *id)
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or_else(|| {
            ProviderError::AuthenticationRequired(format!(
                "FRED API key not set; export {} or connect the provider first",
                self.config.api_key_env
            ))
        })
    }

    /// GET `url` with retry and exponential backoff, returning the body.
    fn get_with_retry(&self, url: &str, what: &str) -> Result<String, ProviderError> {
        let base_delay = Duration::from_millis(self.config.base_delay_ms);
        let mut last_error = None;
        let mut retry_after = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = retry_delay(base_delay, attempt, retry_after.take());
                tracing::debug!(attempt, ?delay, what, "retrying FRED request");
                std::thread::sleep(delay);
            }

            match self.client.get(url).send() {
                Ok(resp) => {
                    let status = resp.status();

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        let secs = retry_after_secs(resp.headers().get(reqwest::header::RETRY_AFTER));
                        tracing::warn!(what, retry_after_secs = secs, "rate limited by FRED");
                        retry_after = Some(Duration::from_secs(secs));
                        last_error = Some(ProviderError::RateLimited {
                            retry_after_secs: secs,
                        });
                        continue;
                    }

                    if status == reqwest::StatusCode::UNAUTHORIZED
                        || status == reqwest::StatusCode::FORBIDDEN
                    {
                        return Err(ProviderError::AuthenticationRequired(format!(
                            "FRED rejected the API key (HTTP {status})"
                        )));
                    }

                    // FRED reports unknown series as 400 with a JSON body.
                    if status == reqwest::StatusCode::BAD_REQUEST {
                        return resp
                            .text()
                            .map_err(|e| ProviderError::NetworkUnreachable(e.to_string()));
                    }

                    if status.is_server_error() {
                        last_error = Some(ProviderError::Other(format!("HTTP {status} for {what}")));
                        continue;
                    }

                    if !status.is_success() {
                        return Err(ProviderError::Other(format!("HTTP {status} for {what}")));
                    }

                    return resp
                        .text()
                        .map_err(|e| ProviderError::NetworkUnreachable(e.to_string()));
                }
                Err(e) => {
                    if e.is_connect() || e.is_timeout() {
                        last_error = Some(ProviderError::NetworkUnreachable(e.to_string()));
                        continue;
                    }
                    return Err(ProviderError::NetworkUnreachable(e.to_string()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::Other("max retries exceeded".into())))
    }

    /// Every vintage of `series` released within `[since, until]`.
    pub fn all_releases(
        &self,
        series: &str,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<FredObservation>, ProviderError> {
        let url = format!(
            "{}/series/observations?series_id={series}&api_key={}&file_type=json\
             &realtime_start={since}&realtime_end={until}",
            self.config.base_url.trim_end_matches('/'),
            self.api_key()?,
        );
        let body = self.get_with_retry(&url, series)?;
        let observations = parse_observations(series, &body)?;
        tracing::debug!(series, vintages = observations.len(), "fetched FRED series");
        Ok(observations)
    }

    /// Full-text series search.
    pub fn search(&self, text: &str, limit: usize) -> Result<Vec<SeriesInfo>, ProviderError> {
        let query: String = text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("+");
        let url = format!(
            "{}/series/search?search_text={query}&api_key={}&file_type=json&limit={limit}",
            self.config.base_url.trim_end_matches('/'),
            self.api_key()?,
        );
        let body = self.get_with_retry(&url, text)?;
        let resp: SearchResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::ResponseFormatChanged(format!("search response: {e}")))?;
        match (resp.seriess, resp.error_message) {
            (Some(series), _) => Ok(series),
            (None, Some(msg)) => Err(ProviderError::ResponseFormatChanged(msg)),
            (None, None) => Ok(Vec::new()),
        }
    }
}

impl FeatureProvider for FredProvider {
    fn name(&self) -> &str {
        "fred"
    }

    fn features(&self) -> Vec<String> {
        NAMED_SERIES.iter().map(|(name, _)| name.to_string()).collect()
    }

    fn supports(&self, feature: &str) -> bool {
        !feature.is_empty()
            && feature
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    /// First-release table of the series, keyed on release date.
    fn fetch(&self, request: &FeatureRequest) -> Result<DataFrame, ProviderError> {
        let series = Self::series_id(&request.feature);
        let mut observations = self.all_releases(series, request.since, request.until)?;
        if series == "ICSA" {
            correct_initial_claims_releases(&mut observations);
        }
        first_releases(&observations, &request.feature)
    }

    fn connect(&mut self) -> Result<(), ProviderError> {
        if self.api_key.is_some() {
            return Ok(());
        }
        match std::env::var(&self.config.api_key_env) {
            Ok(key) if !key.is_empty() => {
                self.api_key = Some(key);
                Ok(())
            }
            _ => Err(ProviderError::AuthenticationRequired(format!(
                "environment variable {} is not set",
                self.config.api_key_env
            ))),
        }
    }

    fn disconnect(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }
}
