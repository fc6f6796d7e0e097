//! PitPanel CLI: build point-in-time panels and inspect walk-forward windows.
//!
//! Commands:
//! - `security-panel`: dense panel of explicit cusips/sedols
//! - `build`: panel from a TOML config (universe, features, lags)
//! - `lag`: add a discrete or calendar-offset lag to a panel file
//! - `windows`: list or export walk-forward windows of a panel file

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use pitpanel_core::calendar::{CalendarOffset, Frequency};
use pitpanel_core::io::{load_panel, save_panel};
use pitpanel_core::membership::security_panel;
use pitpanel_core::panel::UNIT_KEY;
use pitpanel_core::transform::{lag, offset_lag};
use pitpanel_core::Panel;
use pitpanel_runner::{
    build_panel, export_windows_csv, resource_context, save_windows, DateWindows, PanelConfig,
    WalkForwardConfig,
};

#[derive(Parser)]
#[command(name = "pitpanel", about = "PitPanel CLI: point-in-time security panels")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a panel of explicit identifiers, all in the universe.
    SecurityPanel {
        /// First grid date (YYYY-MM-DD).
        #[arg(long)]
        since: NaiveDate,

        /// Last grid date (YYYY-MM-DD).
        #[arg(long)]
        until: NaiveDate,

        /// Full 9-character cusips. Repeatable.
        #[arg(long = "cusip")]
        cusips: Vec<String>,

        /// Full 7-character sedols. Repeatable.
        #[arg(long = "sedol")]
        sedols: Vec<String>,

        /// Grid frequency: D, B, W, MS, M, BM, Q, A.
        #[arg(long, default_value = "M")]
        frequency: Frequency,

        /// Output panel file (.csv or .parquet).
        #[arg(long)]
        output: PathBuf,
    },
    /// Build a panel from a TOML config file.
    Build {
        /// Path to the panel config.
        #[arg(long)]
        config: PathBuf,

        /// Output panel file. Overrides `output` in the config.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Lag a column of a panel file within each security.
    Lag {
        /// Input panel file.
        #[arg(long)]
        input: PathBuf,

        /// Output panel file. Defaults to overwriting the input.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Column to lag.
        #[arg(long)]
        feature: String,

        /// Discrete panel steps (negative pulls later values back).
        #[arg(long, allow_hyphen_values = true, conflicts_with = "offset")]
        steps: Option<i64>,

        /// Calendar offset such as 1M, 5D or 1Y.
        #[arg(long, allow_hyphen_values = true)]
        offset: Option<CalendarOffset>,
    },
    /// List walk-forward windows of a panel file.
    Windows {
        /// Input panel file.
        #[arg(long)]
        input: PathBuf,

        #[arg(long, default_value_t = 1)]
        prediction_steps: usize,

        #[arg(long, default_value_t = 0)]
        burn_in_steps: usize,

        /// How far back the past reaches, e.g. 5Y. Defaults to an expanding past.
        #[arg(long)]
        lookback: Option<CalendarOffset>,

        /// Date column holding when each row's information became known.
        #[arg(long)]
        train_lt: Option<String>,

        /// Write windows to a .csv or .json file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pitpanel=info,pitpanel_core=info,pitpanel_runner=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::SecurityPanel {
            since,
            until,
            cusips,
            sedols,
            frequency,
            output,
        } => run_security_panel(since, until, &cusips, &sedols, frequency, &output),
        Commands::Build { config, output } => run_build(&config, output),
        Commands::Lag {
            input,
            output,
            feature,
            steps,
            offset,
        } => run_lag(&input, output.as_deref(), &feature, steps, offset),
        Commands::Windows {
            input,
            prediction_steps,
            burn_in_steps,
            lookback,
            train_lt,
            output,
        } => {
            let mut config = WalkForwardConfig {
                prediction_steps,
                burn_in_steps,
                train_lt,
                ..Default::default()
            };
            if let Some(lookback) = lookback {
                config.lookback = lookback;
            }
            run_windows(&input, &config, output.as_deref())
        }
    }
}

fn run_security_panel(
    since: NaiveDate,
    until: NaiveDate,
    cusips: &[String],
    sedols: &[String],
    frequency: Frequency,
    output: &Path,
) -> Result<()> {
    let panel = security_panel(since, until, cusips, sedols, frequency)
        .context("failed to build security panel")?;
    save_panel(&panel, output).with_context(|| format!("failed to write {}", output.display()))?;
    print_summary(&panel, output);
    Ok(())
}

fn run_build(config_path: &Path, output: Option<PathBuf>) -> Result<()> {
    let config = PanelConfig::from_file(config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    let Some(output) = output.or_else(|| config.output.clone()) else {
        bail!("no output path: pass --output or set `output` in the config");
    };
    let config_id = config.config_id()?;
    tracing::info!(config = %config_path.display(), %config_id, output = %output.display(), "building panel from config");

    let mut context = resource_context(&config).context("failed to assemble resources")?;
    context.open().context("failed to open resources")?;
    let panel = build_panel(&config, &context).context("failed to build panel")?;
    context.close().context("failed to close resources")?;

    save_panel(&panel, &output).with_context(|| format!("failed to write {}", output.display()))?;
    println!("Config id:      {config_id}");
    print_summary(&panel, &output);
    Ok(())
}

fn run_lag(
    input: &Path,
    output: Option<&Path>,
    feature: &str,
    steps: Option<i64>,
    offset: Option<CalendarOffset>,
) -> Result<()> {
    let panel = load_panel(input).with_context(|| format!("failed to read {}", input.display()))?;
    let panel = match (steps, offset) {
        (Some(steps), None) => lag(panel, feature, &UNIT_KEY, steps)?,
        (None, Some(offset)) => offset_lag(panel, feature, &UNIT_KEY, offset)?,
        _ => bail!("exactly one of --steps or --offset is required"),
    };
    let output = output.unwrap_or(input);
    save_panel(&panel, output).with_context(|| format!("failed to write {}", output.display()))?;
    print_summary(&panel, output);
    Ok(())
}

fn run_windows(input: &Path, config: &WalkForwardConfig, output: Option<&Path>) -> Result<()> {
    config.validate()?;
    let panel = load_panel(input).with_context(|| format!("failed to read {}", input.display()))?;
    let windows: Vec<_> = DateWindows::for_panel(&panel, config).collect();
    match output {
        Some(path) => {
            save_windows(&windows, path)?;
            println!("{} windows written to {}", windows.len(), path.display());
        }
        None => print!("{}", export_windows_csv(&windows)?),
    }
    Ok(())
}

fn print_summary(panel: &Panel, path: &Path) {
    let dates = panel.dates();
    println!();
    println!("=== Panel ===");
    println!("File:           {}", path.display());
    println!("Rows:           {}", panel.height());
    if let (Some(first), Some(last)) = (dates.first(), dates.last()) {
        println!("Dates:          {} ({first} to {last})", dates.len());
    }
    println!("Columns:        {}", panel.frame().get_column_names_str().join(", "));
    let in_universe = panel.universe_mask().iter().filter(|m| **m).count();
    println!("In universe:    {in_universe}");
}
