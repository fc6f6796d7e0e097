//! Serializable panel configuration.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pitpanel_core::calendar::{CalendarOffset, Frequency};
use pitpanel_core::membership::IndexSelector;
use pitpanel_core::provider::{FeatureSpec, FredConfig};

use crate::walk_forward::WalkForwardConfig;

/// Content hash of a panel configuration.
pub type ConfigId = String;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything needed to rebuild a panel:
/// - the date grid (`since`, `until`, `frequency`)
/// - the universe (explicit securities, or an index reconstructed from files)
/// - feature attachments and lags
/// - resources (file-backed tables, FRED)
/// - walk-forward settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelConfig {
    pub since: NaiveDate,
    pub until: NaiveDate,
    #[serde(default = "default_frequency")]
    pub frequency: Frequency,
    pub universe: UniverseConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrict: Option<RestrictConfig>,
    #[serde(default)]
    pub tables: Vec<TableSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fred: Option<FredConfig>,
    #[serde(default)]
    pub features: Vec<FeatureSpec>,
    #[serde(default)]
    pub lags: Vec<LagConfig>,
    #[serde(default)]
    pub walk_forward: WalkForwardConfig,
    /// Where `pitpanel build` writes the panel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

fn default_frequency() -> Frequency {
    Frequency::MonthEnd
}

/// Which securities make up the panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UniverseConfig {
    /// Explicit identifiers, all in the universe on every date.
    Securities {
        #[serde(default)]
        cusips: Vec<String>,
        #[serde(default)]
        sedols: Vec<String>,
    },
    /// Point-in-time index membership loaded from files.
    Index {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        name: Option<String>,
        /// `entity, since, until, source` rows.
        intervals: PathBuf,
        /// `entity, scheme, abbrev, valid_from, valid_until` rows.
        identifier_maps: PathBuf,
        /// `entity, scheme, abbrev` rows used for backfill.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_maps: Option<PathBuf>,
        #[serde(default)]
        keep_in_index_only: bool,
    },
}

impl UniverseConfig {
    pub fn selector(&self) -> Option<IndexSelector> {
        match self {
            UniverseConfig::Index { code, name, .. } => Some(IndexSelector {
                code: code.clone(),
                name: name.clone(),
            }),
            UniverseConfig::Securities { .. } => None,
        }
    }
}

/// Keep rows whose `column` starts with `prefix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictConfig {
    pub column: String,
    pub prefix: String,
    #[serde(default)]
    pub renormalize: bool,
}

/// A feature table read from a panel file and served under `source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSource {
    pub source: String,
    pub feature: String,
    pub path: PathBuf,
}

/// One lag applied after features are attached. Exactly one of `steps` and
/// `offset` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagConfig {
    pub feature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<CalendarOffset>,
}

impl PanelConfig {
    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a configuration.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: PanelConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.since > self.until {
            return Err(ConfigError::Invalid(format!(
                "since {} is after until {}",
                self.since, self.until
            )));
        }
        if let UniverseConfig::Securities { cusips, sedols } = &self.universe {
            if cusips.is_empty() && sedols.is_empty() {
                return Err(ConfigError::Invalid(
                    "securities universe lists no cusips or sedols".into(),
                ));
            }
        }
        if let UniverseConfig::Index { code: None, name: None, .. } = &self.universe {
            return Err(ConfigError::Invalid(
                "index universe needs a code or a name".into(),
            ));
        }

        let mut columns = BTreeSet::new();
        for spec in &self.features {
            if !columns.insert(spec.column_name()) {
                return Err(ConfigError::Invalid(format!(
                    "feature column '{}' is attached twice",
                    spec.column_name()
                )));
            }
        }
        for lag in &self.lags {
            if lag.steps.is_some() == lag.offset.is_some() {
                return Err(ConfigError::Invalid(format!(
                    "lag of '{}' needs exactly one of steps and offset",
                    lag.feature
                )));
            }
        }
        self.walk_forward
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Deterministic BLAKE3 hash of this configuration.
    ///
    /// Two configs with the same content share an id, which is recorded next
    /// to built panels for provenance.
    pub fn config_id(&self) -> Result<ConfigId, ConfigError> {
        let json = serde_json::to_string(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}
