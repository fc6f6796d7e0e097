//! Feature providers and feature attachment.
//!
//! A provider serves long-format feature tables (`security_key_name`,
//! `security_key`, `date`, value) or, for macro series, plain date-keyed
//! tables. Providers are looked up by source name in a [`ProviderRegistry`]
//! and their output is as-of merged onto a panel by [`attach_feature`].

pub mod fred;
mod registry;
mod resource;
mod table;

pub use fred::{
    correct_initial_claims_releases, first_releases, fred_point_in_time, FredConfig, FredObservation,
    FredProvider, SeriesInfo, PERIOD_DATE,
};
pub use registry::ProviderRegistry;
pub use resource::{ResourceContext, ResourceError};
pub use table::TableProvider;

use chrono::NaiveDate;
use polars::prelude::{DataFrame, PolarsError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::calendar::{CalendarError, CalendarOffset};
use crate::identifiers::KeyScheme;
use crate::join::{asof_merge, AsofDirection, AsofOptions, JoinError};
use crate::panel::{Panel, PanelError, DATE, SECURITY_KEY, SECURITY_KEY_NAME, UNIT_KEY};

// ─── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no provider registered for source '{0}'")]
    UnknownSource(String),

    #[error("source '{source_name}' has no feature '{feature}'")]
    UnknownFeature { source_name: String, feature: String },

    #[error("provider '{0}' is already registered")]
    DuplicateSource(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("series not found: {0}")]
    SeriesNotFound(String),

    #[error("provider error: {0}")]
    Other(String),

    #[error(transparent)]
    Polars(#[from] PolarsError),

    #[error(transparent)]
    Panel(#[from] PanelError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Calendar(#[from] CalendarError),
}

// ─── Requests ───────────────────────────────────────────────────────

/// One feature over a set of securities and a date range (inclusive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRequest {
    pub feature: String,
    /// Full identifiers per scheme. Empty for date-keyed series.
    #[serde(default)]
    pub keys: BTreeMap<KeyScheme, Vec<String>>,
    pub since: NaiveDate,
    pub until: NaiveDate,
}

impl FeatureRequest {
    pub fn new(feature: impl Into<String>, since: NaiveDate, until: NaiveDate) -> Self {
        Self {
            feature: feature.into(),
            keys: BTreeMap::new(),
            since,
            until,
        }
    }

    pub fn with_keys(mut self, scheme: KeyScheme, keys: Vec<String>) -> Self {
        if !keys.is_empty() {
            self.keys.insert(scheme, keys);
        }
        self
    }

    /// True when `(scheme name, key)` was requested.
    pub fn wants(&self, scheme: &str, key: &str) -> bool {
        scheme
            .parse::<KeyScheme>()
            .ok()
            .and_then(|s| self.keys.get(&s))
            .is_some_and(|keys| keys.iter().any(|k| k == key))
    }

    pub fn covers(&self, date: NaiveDate) -> bool {
        self.since <= date && date <= self.until
    }
}

// ─── Provider trait ─────────────────────────────────────────────────

/// A source of feature tables.
///
/// `fetch` returns either a long table keyed by `security_key_name`,
/// `security_key` and `date`, or a table keyed by `date` alone. The value
/// column is named after the requested feature. Rows need not be
/// point-in-time clean; alignment is done by the caller.
pub trait FeatureProvider: Send + Sync {
    /// Source name used for registry lookup.
    fn name(&self) -> &str;

    /// Features this provider is known to serve.
    fn features(&self) -> Vec<String>;

    /// Whether `feature` can be requested. Defaults to membership in [`features`](Self::features).
    fn supports(&self, feature: &str) -> bool {
        self.features().iter().any(|f| f == feature)
    }

    fn fetch(&self, request: &FeatureRequest) -> Result<DataFrame, ProviderError>;

    /// Acquire whatever the provider needs before serving requests.
    fn connect(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }
}

// ─── Attachment ─────────────────────────────────────────────────────

/// Where a feature comes from and how it is aligned onto the panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub source: String,
    pub feature: String,
    /// Column name on the panel. Defaults to `feature`.
    #[serde(default, rename = "as")]
    pub as_name: Option<String>,
    #[serde(default)]
    pub direction: AsofDirection,
    #[serde(default = "default_true")]
    pub exact_match_allowed: bool,
    /// Widens the fetched date range on both sides.
    #[serde(default)]
    pub tolerance: CalendarOffset,
}

fn default_true() -> bool {
    true
}

impl FeatureSpec {
    pub fn new(source: impl Into<String>, feature: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            feature: feature.into(),
            as_name: None,
            direction: AsofDirection::Backward,
            exact_match_allowed: true,
            tolerance: CalendarOffset::default(),
        }
    }

    pub fn column_name(&self) -> &str {
        self.as_name.as_deref().unwrap_or(&self.feature)
    }
}

/// Fetch `spec.feature` for the panel's securities and dates and as-of merge
/// it onto the panel.
///
/// Keyed tables are merged by the unit key; date-keyed tables by date alone.
/// The output is in date order.
pub fn attach_feature(
    panel: Panel,
    registry: &ProviderRegistry,
    spec: &FeatureSpec,
) -> Result<Panel, ProviderError> {
    let provider = registry.resolve(&spec.source, &spec.feature)?;
    let (since, until) = panel.date_span(spec.tolerance)?;
    let mut request = FeatureRequest::new(spec.feature.clone(), since, until);
    for scheme in KeyScheme::ALL {
        request = request.with_keys(scheme, panel.keys(scheme, false)?);
    }

    let mut table = provider.fetch(&request)?;
    if table.get_column_index(&spec.feature).is_none() {
        return Err(ProviderError::ResponseFormatChanged(format!(
            "'{}' returned no '{}' column",
            spec.source, spec.feature
        )));
    }
    if spec.column_name() != spec.feature {
        table.rename(&spec.feature, spec.column_name().into())?;
    }
    tracing::debug!(
        source = %spec.source,
        feature = %spec.feature,
        rows = table.height(),
        %since,
        %until,
        "attaching feature"
    );

    let keyed = table.get_column_index(SECURITY_KEY).is_some()
        && table.get_column_index(SECURITY_KEY_NAME).is_some();
    let by: &[&str] = if keyed { &UNIT_KEY } else { &[] };
    let opts = AsofOptions::on(DATE)
        .by(by)
        .direction(spec.direction)
        .allow_exact_matches(spec.exact_match_allowed);
    let merged = asof_merge(panel.frame(), &table, &opts)?;
    Ok(Panel::new(merged)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::f64_values;
    use polars::prelude::{df, SortMultipleOptions};

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn panel() -> Panel {
        Panel::grid(
            &[
                (KeyScheme::Cusip, "037833100".into()),
                (KeyScheme::Cusip, "594918104".into()),
            ],
            &[d("2020-01-31"), d("2020-02-29")],
        )
        .unwrap()
    }

    fn sorted(panel: &Panel) -> DataFrame {
        panel
            .frame()
            .sort([SECURITY_KEY, DATE], SortMultipleOptions::default())
            .unwrap()
    }

    fn registry() -> ProviderRegistry {
        let prices = df!(
            SECURITY_KEY_NAME => &["cusip", "cusip", "cusip"],
            SECURITY_KEY => &["037833100", "037833100", "594918104"],
            DATE => &[d("2020-01-31"), d("2020-02-15"), d("2020-01-31")],
            "price" => &[10.0, 11.0, 20.0],
        )
        .unwrap();
        let rates = df!(
            DATE => &[d("2020-01-01"), d("2020-02-01")],
            "rate" => &[1.5, 1.75],
        )
        .unwrap();
        let table = TableProvider::new("vendor")
            .with_table("price", prices)
            .unwrap()
            .with_table("rate", rates)
            .unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register(Box::new(table)).unwrap();
        registry
    }

    #[test]
    fn keyed_feature_merges_by_security() {
        let out = attach_feature(panel(), &registry(), &FeatureSpec::new("vendor", "price")).unwrap();
        let sorted = sorted(&out);
        assert_eq!(
            f64_values(&sorted, "price").unwrap(),
            vec![Some(10.0), Some(11.0), Some(20.0), Some(20.0)]
        );
    }

    #[test]
    fn date_keyed_feature_broadcasts_to_all_securities() {
        let mut spec = FeatureSpec::new("vendor", "rate");
        spec.as_name = Some("policy_rate".into());
        spec.tolerance = CalendarOffset::months(1);
        let out = attach_feature(panel(), &registry(), &spec).unwrap();
        assert!(!out.has_column("rate"));
        let sorted = sorted(&out);
        assert_eq!(
            f64_values(&sorted, "policy_rate").unwrap(),
            vec![Some(1.5), Some(1.75), Some(1.5), Some(1.75)]
        );
    }

    #[test]
    fn strict_match_skips_same_day_value() {
        let mut spec = FeatureSpec::new("vendor", "price");
        spec.exact_match_allowed = false;
        let out = attach_feature(panel(), &registry(), &spec).unwrap();
        assert_eq!(f64_values(&sorted(&out), "price").unwrap()[0], None);
    }

    #[test]
    fn unknown_source_and_feature_are_errors() {
        let registry = registry();
        assert!(matches!(
            attach_feature(panel(), &registry, &FeatureSpec::new("nope", "price")),
            Err(ProviderError::UnknownSource(_))
        ));
        assert!(matches!(
            attach_feature(panel(), &registry, &FeatureSpec::new("vendor", "volume")),
            Err(ProviderError::UnknownFeature { .. })
        ));
    }

    #[test]
    fn feature_spec_reads_from_toml_style_json() {
        let spec: FeatureSpec = serde_json::from_str(
            r#"{"source":"fred","feature":"gdp","as":"gdp_pit","direction":"forward","tolerance":{"months":3}}"#,
        )
        .unwrap();
        assert_eq!(spec.column_name(), "gdp_pit");
        assert_eq!(spec.direction, AsofDirection::Forward);
        assert!(spec.exact_match_allowed);
        assert_eq!(spec.tolerance, CalendarOffset::months(3));
    }
}
