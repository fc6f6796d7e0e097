//! PitPanel Core: point-in-time security panels.
//!
//! This crate contains everything needed to build a look-ahead-free panel:
//! - The validated panel over a polars `DataFrame` (`security_key_name`, `security_key`, `date`)
//! - As-of and exact-key joins
//! - Index membership reconstruction from intervals or daily weighted lists
//! - Discrete and calendar-offset lags
//! - Cross-sectional rank, quantile, centering and standardization
//! - Feature providers (in-memory tables, FRED) behind an explicit resource context
//! - CSV and Parquet panel files

pub mod calendar;
pub mod columns;
pub mod identifiers;
pub mod io;
pub mod join;
pub mod membership;
pub mod money;
pub mod panel;
pub mod provider;
pub mod transform;

pub use panel::Panel;

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::DataFrame;

    /// Compile-time check: panels, sources and providers can cross threads.
    ///
    /// The walk-forward runner shares the panel and the resource context
    /// across worker threads.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<DataFrame>();
        require_sync::<DataFrame>();
        require_send::<Panel>();
        require_sync::<Panel>();
        require_send::<calendar::CalendarOffset>();
        require_sync::<calendar::CalendarOffset>();
        require_send::<join::AsofOptions>();
        require_sync::<join::AsofOptions>();

        require_send::<membership::StaticMembershipSource>();
        require_sync::<membership::StaticMembershipSource>();
        require_send::<provider::ProviderRegistry>();
        require_sync::<provider::ProviderRegistry>();
        require_send::<provider::ResourceContext>();
        require_sync::<provider::ResourceContext>();
        require_send::<provider::FredProvider>();
        require_sync::<provider::FredProvider>();
        require_send::<provider::TableProvider>();
        require_sync::<provider::TableProvider>();
    }

    /// Providers only see a request, never the panel they are attached to.
    #[test]
    fn feature_provider_trait_has_no_panel_parameter() {
        fn _check_trait_object_builds(
            provider: &dyn provider::FeatureProvider,
            request: &provider::FeatureRequest,
        ) -> Result<DataFrame, provider::ProviderError> {
            provider.fetch(request)
        }
    }
}
