//! Window descriptor export for external tools.
//!
//! - **CSV**: one row per window
//! - **JSON**: the descriptors as an array, round-trippable

use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::walk_forward::DateWindow;

// ─── CSV export ─────────────────────────────────────────────────────

/// Columns: index, present_date, past_begin, past_end, future_date, train_lt
pub fn export_windows_csv(windows: &[DateWindow]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "index",
        "present_date",
        "past_begin",
        "past_end",
        "future_date",
        "train_lt",
    ])?;
    for w in windows {
        wtr.write_record([
            w.index.to_string(),
            w.present_date.to_string(),
            w.past_begin.to_string(),
            w.past_end.to_string(),
            w.future_date.to_string(),
            w.train_lt.clone().unwrap_or_default(),
        ])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

// ─── JSON export ────────────────────────────────────────────────────

pub fn export_windows_json(windows: &[DateWindow]) -> Result<String> {
    serde_json::to_string_pretty(windows).context("failed to serialize windows to JSON")
}

pub fn import_windows_json(json: &str) -> Result<Vec<DateWindow>> {
    serde_json::from_str(json).context("failed to deserialize windows from JSON")
}

/// Write windows to `path`, choosing CSV or JSON by extension.
pub fn save_windows(windows: &[DateWindow], path: &Path) -> Result<()> {
    let body = match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => export_windows_csv(windows)?,
        Some("json") => export_windows_json(windows)?,
        _ => bail!("unsupported window export format: {}", path.display()),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn window(index: usize, month: u32) -> DateWindow {
        let present = NaiveDate::from_ymd_opt(2020, month, 1).unwrap();
        DateWindow {
            index,
            present_date: present,
            past_begin: NaiveDate::from_ymd_opt(1920, 1, 1).unwrap(),
            past_end: present,
            future_date: NaiveDate::from_ymd_opt(2020, month + 1, 1).unwrap(),
            train_lt: None,
        }
    }

    #[test]
    fn csv_has_header_and_rows() {
        let csv = export_windows_csv(&[window(1, 2), window(2, 3)]).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "index,present_date,past_begin,past_end,future_date,train_lt");
        assert_eq!(lines[1], "1,2020-02-01,1920-01-01,2020-02-01,2020-03-01,");
    }

    #[test]
    fn json_round_trip() {
        let mut w = window(1, 2);
        w.train_lt = Some("known_at".into());
        let json = export_windows_json(&[w.clone()]).unwrap();
        assert_eq!(import_windows_json(&json).unwrap(), vec![w]);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(save_windows(&[window(1, 2)], &dir.path().join("windows.txt")).is_err());
        save_windows(&[window(1, 2)], &dir.path().join("out").join("windows.csv")).unwrap();
        assert!(dir.path().join("out").join("windows.csv").exists());
    }
}
