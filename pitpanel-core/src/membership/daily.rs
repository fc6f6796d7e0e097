//! Membership panels from daily weighted constituent lists.

use chrono::NaiveDate;
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{MembershipError, TOTAL_RETURN_INDEX};
use crate::calendar::{date_range, Frequency};
use crate::columns::{date_column, float_column, int_column, text_column};
use crate::identifiers::KeyScheme;
use crate::join::{asof_merge, AsofOptions};
use crate::panel::{
    Panel, DATE, INDEX_WEIGHT, IN_INDEX, SECURITY_KEY, SECURITY_KEY_ABBREV, SECURITY_KEY_NAME,
};

/// One constituent row of a daily index composition report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMembership {
    pub scheme: KeyScheme,
    pub abbrev: String,
    pub date: NaiveDate,
    pub index_weight: f64,
    #[serde(default)]
    pub total_return_index: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Combined {
    weight: f64,
    total_return_index: Option<f64>,
    top_weight: f64,
}

/// Daily membership state per (scheme, abbrev, date), after collapsing duplicates.
fn combine_reports(
    records: &[DailyMembership],
) -> BTreeMap<(KeyScheme, String, NaiveDate), (bool, Combined)> {
    // Weights are summed within each in_index state; the total return index
    // comes from the heaviest row of that state.
    let mut states: BTreeMap<(KeyScheme, String, NaiveDate, bool), Combined> = BTreeMap::new();
    for rec in records {
        let in_index = rec.index_weight > 0.0;
        let entry = states
            .entry((rec.scheme, rec.abbrev.clone(), rec.date, in_index))
            .or_insert(Combined {
                top_weight: f64::NEG_INFINITY,
                ..Combined::default()
            });
        entry.weight += rec.index_weight;
        if rec.index_weight >= entry.top_weight {
            entry.top_weight = rec.index_weight;
            if rec.total_return_index.is_some() {
                entry.total_return_index = rec.total_return_index;
            }
        }
    }

    let mut combined = BTreeMap::new();
    for ((scheme, abbrev, date, in_index), state) in states {
        let key = (scheme, abbrev, date);
        // BTreeMap order visits in_index = false before true, so true wins.
        combined.insert(key, (in_index, state));
    }
    combined
}

/// Membership panel from daily constituent reports.
///
/// A security is in the index on a report day when its weight is positive.
/// On days with at least one constituent, known securities missing from the
/// report are out of the index. The daily states are then carried backward
/// onto the `frequency` grid over `[since, until]`, so grid dates falling on
/// weekends or holidays inherit the last reported state.
///
/// Output columns: key columns, `in_index`, `index_weight`, `total_return_index`.
pub fn daily_membership_panel(
    records: &[DailyMembership],
    since: NaiveDate,
    until: NaiveDate,
    frequency: Frequency,
) -> Result<Panel, MembershipError> {
    let constituents: BTreeSet<(KeyScheme, String)> = records
        .iter()
        .filter(|r| !r.abbrev.is_empty())
        .map(|r| (r.scheme, r.abbrev.clone()))
        .collect();
    let report_dates: BTreeSet<NaiveDate> = records.iter().map(|r| r.date).collect();

    let mut constituent_count: HashMap<NaiveDate, usize> = HashMap::new();
    for rec in records.iter().filter(|r| r.index_weight > 0.0) {
        *constituent_count.entry(rec.date).or_default() += 1;
    }

    let combined = combine_reports(records);

    // Report-day states for every known constituent.
    let mut names = Vec::new();
    let mut abbrevs = Vec::new();
    let mut dates = Vec::new();
    let mut flags = Vec::new();
    let mut weights = Vec::new();
    let mut tris = Vec::new();
    for (scheme, abbrev) in &constituents {
        for date in &report_dates {
            let state = match combined.get(&(*scheme, abbrev.clone(), *date)) {
                Some((in_index, c)) => Some((*in_index, Some(c.weight), c.total_return_index)),
                None if constituent_count.get(date).copied().unwrap_or(0) > 0 => {
                    Some((false, Some(0.0), None))
                }
                None => None,
            };
            let Some((in_index, weight, tri)) = state else {
                continue;
            };
            names.push(Some(scheme.as_str().to_string()));
            abbrevs.push(Some(abbrev.clone()));
            dates.push(Some(*date));
            flags.push(Some(i64::from(in_index)));
            weights.push(weight);
            tris.push(tri);
        }
    }
    let reported = DataFrame::new(vec![
        text_column(SECURITY_KEY_NAME, &names),
        text_column(SECURITY_KEY_ABBREV, &abbrevs),
        date_column(DATE, &dates),
        int_column(IN_INDEX, &flags),
        float_column(INDEX_WEIGHT, &weights),
        float_column(TOTAL_RETURN_INDEX, &tris),
    ])?;

    // Panel grid: constituents × frequency dates.
    let grid_dates = date_range(since, until, frequency)?;
    let mut names = Vec::new();
    let mut abbrevs = Vec::new();
    let mut keys = Vec::new();
    let mut dates = Vec::new();
    for (scheme, abbrev) in &constituents {
        let full = match scheme.to_full(abbrev) {
            Ok(full) => Some(full),
            Err(err) => {
                tracing::warn!(%err, "constituent without a valid check digit");
                None
            }
        };
        for date in &grid_dates {
            names.push(Some(scheme.as_str().to_string()));
            abbrevs.push(Some(abbrev.clone()));
            keys.push(full.clone());
            dates.push(Some(*date));
        }
    }
    let grid = DataFrame::new(vec![
        text_column(SECURITY_KEY_NAME, &names),
        text_column(SECURITY_KEY_ABBREV, &abbrevs),
        text_column(SECURITY_KEY, &keys),
        date_column(DATE, &dates),
    ])?;

    let opts = AsofOptions::on(DATE).by(&[SECURITY_KEY_NAME, SECURITY_KEY_ABBREV]);
    let merged = asof_merge(&grid, &reported, &opts)?;
    let mapped = merged.column(SECURITY_KEY)?.is_not_null();
    Ok(Panel::new(merged.filter(&mapped)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::{f64_values, i64_values};
    use polars::prelude::SortMultipleOptions;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn rec(abbrev: &str, date: &str, weight: f64) -> DailyMembership {
        DailyMembership {
            scheme: KeyScheme::Cusip,
            abbrev: abbrev.into(),
            date: d(date),
            index_weight: weight,
            total_return_index: Some(100.0),
        }
    }

    #[test]
    fn weekend_grid_dates_inherit_friday() {
        // 2020-02-29 is a Saturday; the last report is on Friday 2020-02-28.
        let records = vec![
            rec("03783310", "2020-01-31", 0.6),
            rec("59491810", "2020-01-31", 0.4),
            rec("03783310", "2020-02-28", 1.0),
        ];
        let panel =
            daily_membership_panel(&records, d("2020-01-01"), d("2020-02-29"), Frequency::MonthEnd)
                .unwrap();
        let sorted = panel
            .frame()
            .sort([SECURITY_KEY_ABBREV, DATE], SortMultipleOptions::default())
            .unwrap();
        assert_eq!(
            i64_values(&sorted, IN_INDEX).unwrap(),
            vec![Some(1), Some(1), Some(1), Some(0)]
        );
        assert_eq!(
            f64_values(&sorted, INDEX_WEIGHT).unwrap(),
            vec![Some(0.6), Some(1.0), Some(0.4), Some(0.0)]
        );
    }

    #[test]
    fn identifier_change_duplicates_prefer_member_row() {
        let records = vec![
            rec("03783310", "2020-03-31", 0.0),
            rec("03783310", "2020-03-31", 0.25),
            rec("03783310", "2020-03-31", 0.25),
        ];
        let panel =
            daily_membership_panel(&records, d("2020-03-01"), d("2020-03-31"), Frequency::MonthEnd)
                .unwrap();
        assert_eq!(panel.height(), 1);
        assert_eq!(i64_values(panel.frame(), IN_INDEX).unwrap(), vec![Some(1)]);
        assert_eq!(f64_values(panel.frame(), INDEX_WEIGHT).unwrap(), vec![Some(0.5)]);
    }

    #[test]
    fn grid_dates_before_first_report_are_null() {
        let records = vec![rec("03783310", "2020-02-28", 1.0)];
        let panel =
            daily_membership_panel(&records, d("2020-01-01"), d("2020-02-29"), Frequency::MonthEnd)
                .unwrap();
        assert_eq!(
            i64_values(panel.frame(), IN_INDEX).unwrap(),
            vec![None, Some(1)]
        );
    }
}
