//! PitPanel Runner: walk-forward evaluation and panel building.
//!
//! This crate builds on `pitpanel-core` to provide:
//! - Walk-forward window generation, temporal splits and window functions
//!   (sequential or rayon-parallel)
//! - TOML panel configuration with content-hash ids
//! - The config → resources → panel pipeline
//! - Window descriptor export (CSV, JSON)

pub mod config;
pub mod export;
pub mod pipeline;
pub mod walk_forward;

pub use config::{ConfigError, ConfigId, LagConfig, PanelConfig, RestrictConfig, TableSource, UniverseConfig};
pub use export::{export_windows_csv, export_windows_json, import_windows_json, save_windows};
pub use pipeline::{build_panel, resource_context, PipelineError, FRED_SOURCE};
pub use walk_forward::{
    apply_time_windowed_functions, temporal_split, BoxError, DateWindow, DateWindows, Execution,
    WalkForwardConfig, WalkForwardError, WindowFunctions, WindowInput, WindowProgress,
    WindowResults, WindowSlices,
};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn window_types_are_send_sync() {
        assert_send::<DateWindow>();
        assert_sync::<DateWindow>();
        assert_send::<WindowFunctions<f64>>();
        assert_sync::<WindowFunctions<f64>>();
        assert_send::<WalkForwardError>();
    }

    #[test]
    fn config_types_are_send_sync() {
        assert_send::<PanelConfig>();
        assert_sync::<PanelConfig>();
        assert_send::<WalkForwardConfig>();
        assert_sync::<WalkForwardConfig>();
    }
}
