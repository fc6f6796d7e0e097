//! Panel construction from a [`PanelConfig`].
//!
//! `resource_context` turns the config's resource sections into providers
//! and a membership source; `build_panel` then runs
//! universe → restriction → feature attachment → lags against an open
//! context.

use std::collections::BTreeMap;

use thiserror::Error;

use pitpanel_core::io::{load_identifier_maps, load_intervals, read_frame, IoError};
use pitpanel_core::membership::{
    index_membership_panel, restrict_universe, security_panel, MembershipError, ReconstructOptions,
    StaticMembershipSource,
};
use pitpanel_core::panel::{Panel, UNIT_KEY};
use pitpanel_core::provider::{
    attach_feature, FredProvider, ProviderError, ProviderRegistry, ResourceContext, ResourceError,
    TableProvider,
};
use pitpanel_core::transform::{lag, offset_lag, TransformError};

use crate::config::{ConfigError, PanelConfig, UniverseConfig};

/// Source name the FRED provider registers under.
pub const FRED_SOURCE: &str = "fred";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("transform error: {0}")]
    Transform(#[from] TransformError),
}

/// Build the (unopened) resources `config` refers to.
///
/// File-backed tables are grouped into one [`TableProvider`] per source
/// name. FRED is registered when configured or when a feature asks for it.
pub fn resource_context(config: &PanelConfig) -> Result<ResourceContext, PipelineError> {
    let mut registry = ProviderRegistry::new();

    let mut by_source: BTreeMap<&str, TableProvider> = BTreeMap::new();
    for table in &config.tables {
        let frame = read_frame(&table.path)?;
        let provider = by_source
            .remove(table.source.as_str())
            .unwrap_or_else(|| TableProvider::new(table.source.clone()));
        by_source.insert(table.source.as_str(), provider.with_table(table.feature.clone(), frame)?);
    }
    for (_, provider) in by_source {
        registry.register(Box::new(provider))?;
    }

    let wants_fred = config.fred.is_some() || config.features.iter().any(|f| f.source == FRED_SOURCE);
    if wants_fred {
        let fred = FredProvider::new(config.fred.clone().unwrap_or_default())?;
        registry.register(Box::new(fred))?;
    }

    let membership = match &config.universe {
        UniverseConfig::Index {
            code,
            name,
            intervals,
            identifier_maps,
            current_maps,
            ..
        } => {
            let index_code = code.clone().or_else(|| name.clone()).unwrap_or_default();
            StaticMembershipSource::default()
                .with_index(index_code, name.clone(), load_intervals(intervals)?)
                .with_maps(load_identifier_maps(identifier_maps, current_maps.as_deref())?)
        }
        UniverseConfig::Securities { .. } => StaticMembershipSource::default(),
    };

    tracing::debug!(providers = registry.len(), "resource context assembled");
    Ok(ResourceContext::new(registry, Box::new(membership)))
}

/// Build the panel described by `config` using an open `context`.
pub fn build_panel(config: &PanelConfig, context: &ResourceContext) -> Result<Panel, PipelineError> {
    config.validate()?;
    let config_id = config.config_id()?;
    tracing::info!(
        config_id = %config_id,
        since = %config.since,
        until = %config.until,
        frequency = %config.frequency,
        "building panel"
    );

    let mut panel = match &config.universe {
        UniverseConfig::Securities { cusips, sedols } => {
            security_panel(config.since, config.until, cusips, sedols, config.frequency)?
        }
        UniverseConfig::Index {
            keep_in_index_only, ..
        } => {
            let selector = config.universe.selector().unwrap_or_default();
            index_membership_panel(
                context.membership()?,
                &selector,
                config.since,
                config.until,
                config.frequency,
                ReconstructOptions {
                    keep_in_index_only: *keep_in_index_only,
                },
            )?
        }
    };

    if let Some(restrict) = &config.restrict {
        panel = restrict_universe(panel, &restrict.column, &restrict.prefix, restrict.renormalize)?;
    }

    let registry = context.registry()?;
    for spec in &config.features {
        panel = attach_feature(panel, registry, spec)?;
    }

    for lag_config in &config.lags {
        panel = match (lag_config.steps, lag_config.offset) {
            (Some(steps), _) => lag(panel, &lag_config.feature, &UNIT_KEY, steps)?,
            (None, Some(offset)) => offset_lag(panel, &lag_config.feature, &UNIT_KEY, offset)?,
            (None, None) => panel,
        };
    }

    tracing::info!(rows = panel.height(), dates = panel.dates().len(), "panel built");
    Ok(panel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fred_is_registered_on_demand() {
        let config = PanelConfig::from_toml(
            r#"
since = "2020-01-01"
until = "2020-03-31"

[universe]
kind = "securities"
cusips = ["037833100"]

[[features]]
source = "fred"
feature = "gdp"
"#,
        )
        .unwrap();
        let context = resource_context(&config).unwrap();
        // Not opened: accessors refuse.
        assert!(matches!(context.registry(), Err(ResourceError::Closed)));
    }
}
