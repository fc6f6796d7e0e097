//! Membership panels from since/until intervals.
//!
//! The reconstruction runs in four passes:
//! 1. grid: every evaluation date × every entity, flagged by interval containment;
//! 2. identifiers: each cell is mapped to a security identifier valid at its
//!    date, falling back to the current (non point-in-time) mapping when the
//!    entity has exactly one;
//! 3. dedupe: one row per (scheme, identifier, date), preferring `in_index = 1`;
//! 4. check digits: the full identifier is derived from the abbreviation.

use chrono::NaiveDate;
use polars::prelude::DataFrame;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{IdentifierMaps, IdentifierMapping, MembershipError, MembershipInterval, SOURCE_INDEX};
use crate::columns::{date_column, int_column, text_column};
use crate::identifiers::KeyScheme;
use crate::panel::{Panel, DATE, IN_INDEX, SECURITY_KEY, SECURITY_KEY_ABBREV, SECURITY_KEY_NAME};

/// Options for [`build_membership_panel`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconstructOptions {
    /// Drop rows with `in_index = 0`.
    pub keep_in_index_only: bool,
}

/// One (entity, date) cell of the membership grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipCell {
    pub entity: String,
    pub date: NaiveDate,
    pub in_index: bool,
    /// Label of the latest interval starting on or before `date`.
    pub source: Option<String>,
}

/// Dense date × entity grid flagged by interval containment.
///
/// Cells are ordered by entity, then date. An entity with several intervals
/// covering the same date yields a single cell with `in_index = true`; such
/// overlaps are logged.
pub fn membership_grid(intervals: &[MembershipInterval], dates: &[NaiveDate]) -> Vec<MembershipCell> {
    let mut by_entity: BTreeMap<&str, Vec<&MembershipInterval>> = BTreeMap::new();
    for interval in intervals {
        by_entity.entry(interval.entity.as_str()).or_default().push(interval);
    }
    for list in by_entity.values_mut() {
        list.sort_by_key(|iv| iv.since);
    }

    let mut overlaps = 0usize;
    let mut cells = Vec::with_capacity(by_entity.len() * dates.len());
    for (entity, list) in &by_entity {
        for &date in dates {
            let containing = list.iter().filter(|iv| iv.contains(date)).count();
            if containing > 1 {
                overlaps += 1;
            }
            let started = list.partition_point(|iv| iv.since <= date);
            let source = started
                .checked_sub(1)
                .and_then(|i| list[i].source.clone());
            cells.push(MembershipCell {
                entity: entity.to_string(),
                date,
                in_index: containing > 0,
                source,
            });
        }
    }
    if overlaps > 0 {
        tracing::warn!(
            overlaps,
            "entities with more than one membership interval covering the same date"
        );
    }
    cells
}

#[derive(Debug, Clone)]
struct ResolvedRow {
    entity: String,
    date: NaiveDate,
    in_index: bool,
    source: Option<String>,
    id: Option<(KeyScheme, String)>,
}

impl ResolvedRow {
    fn from_cell(cell: &MembershipCell, id: Option<(KeyScheme, String)>) -> Self {
        Self {
            entity: cell.entity.clone(),
            date: cell.date,
            in_index: cell.in_index,
            source: cell.source.clone(),
            id,
        }
    }
}

/// Map every cell to exactly one row.
///
/// A single point-in-time mapping valid at the cell's date wins. Cells with
/// none fall back to the entity's current mapping when it has exactly one,
/// and stay unmapped otherwise. More than one valid point-in-time mapping
/// would multiply the cell and is a `RowCountMismatch` naming the entity.
fn resolve_identifiers(
    cells: &[MembershipCell],
    maps: &IdentifierMaps,
) -> Result<Vec<ResolvedRow>, MembershipError> {
    let mut pit: HashMap<&str, Vec<&IdentifierMapping>> = HashMap::new();
    for mapping in &maps.point_in_time {
        pit.entry(mapping.entity.as_str()).or_default().push(mapping);
    }

    let mut current_counts: HashMap<&str, usize> = HashMap::new();
    for mapping in &maps.current {
        *current_counts.entry(mapping.entity.as_str()).or_default() += 1;
    }
    let unambiguous: HashMap<&str, (KeyScheme, String)> = maps
        .current
        .iter()
        .filter(|m| current_counts.get(m.entity.as_str()) == Some(&1))
        .map(|m| (m.entity.as_str(), (m.scheme, m.abbrev.clone())))
        .collect();

    let mut rows = Vec::with_capacity(cells.len());
    let mut backfilled = 0usize;
    let mut unresolved = 0usize;
    for cell in cells {
        let valid: Vec<&IdentifierMapping> = pit
            .get(cell.entity.as_str())
            .map(|list| list.iter().copied().filter(|m| m.is_valid_at(cell.date)).collect())
            .unwrap_or_default();
        let id = match valid.as_slice() {
            [mapping] => Some((mapping.scheme, mapping.abbrev.clone())),
            [] => {
                let id = unambiguous.get(cell.entity.as_str()).cloned();
                if id.is_some() {
                    backfilled += 1;
                } else {
                    unresolved += 1;
                }
                id
            }
            _ => {
                return Err(MembershipError::RowCountMismatch {
                    entity: cell.entity.clone(),
                    date: cell.date,
                    expected: 1,
                    actual: valid.len(),
                })
            }
        };
        rows.push(ResolvedRow::from_cell(cell, id));
    }

    if backfilled + unresolved > 0 {
        tracing::debug!(
            backfilled,
            unresolved,
            "cells without a point-in-time identifier"
        );
    }
    Ok(rows)
}

/// Build a point-in-time membership panel from raw intervals.
///
/// The output has `security_key_name`, `security_key_abbrev`, `security_key`,
/// `date`, `in_index` (0/1) and, when any interval is labelled,
/// `source_index`. Rows that cannot be mapped to an identifier are logged
/// and dropped. When two entities map to the same identifier at the same date,
/// the `in_index = 1` row wins; among equal flags the lexicographically
/// smallest entity wins.
pub fn build_membership_panel(
    intervals: &[MembershipInterval],
    dates: &[NaiveDate],
    maps: &IdentifierMaps,
    options: ReconstructOptions,
) -> Result<Panel, MembershipError> {
    let cells = membership_grid(intervals, dates);
    let rows = resolve_identifiers(&cells, maps)?;

    let unmapped: BTreeSet<&str> = rows
        .iter()
        .filter(|r| r.id.is_none() && r.in_index)
        .map(|r| r.entity.as_str())
        .collect();
    if !unmapped.is_empty() {
        tracing::warn!(
            count = unmapped.len(),
            entities = ?unmapped,
            "index members without an identifier mapping"
        );
    }

    // Duplicate in-index rows for one identifier usually mean an identifier change.
    let mut in_index_counts: HashMap<(KeyScheme, &str, NaiveDate), usize> = HashMap::new();
    for row in rows.iter().filter(|r| r.in_index) {
        if let Some((scheme, abbrev)) = &row.id {
            *in_index_counts.entry((*scheme, abbrev.as_str(), row.date)).or_default() += 1;
        }
    }
    let duplicated = in_index_counts.values().filter(|&&n| n > 1).count();
    if duplicated > 0 {
        tracing::warn!(duplicated, "more than one in-index row for a security key and date");
    }

    let mut chosen: BTreeMap<(KeyScheme, String, NaiveDate), &ResolvedRow> = BTreeMap::new();
    let mut ties = 0usize;
    for row in &rows {
        let Some((scheme, abbrev)) = &row.id else {
            continue;
        };
        let key = (*scheme, abbrev.clone(), row.date);
        match chosen.get(&key) {
            None => {
                chosen.insert(key, row);
            }
            Some(existing) => {
                let replace = match (row.in_index, existing.in_index) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => {
                        if row.entity != existing.entity {
                            ties += 1;
                        }
                        row.entity < existing.entity
                    }
                };
                if replace {
                    chosen.insert(key, row);
                }
            }
        }
    }
    if ties > 0 {
        tracing::debug!(ties, "membership ties resolved by smallest entity");
    }

    let labelled = intervals.iter().any(|iv| iv.source.is_some());
    let mut names = Vec::new();
    let mut abbrevs = Vec::new();
    let mut keys = Vec::new();
    let mut out_dates = Vec::new();
    let mut flags = Vec::new();
    let mut sources = Vec::new();
    let mut bad_check_digits = 0usize;
    for ((scheme, abbrev, date), row) in &chosen {
        if options.keep_in_index_only && !row.in_index {
            continue;
        }
        let full = match scheme.to_full(abbrev) {
            Ok(full) => full,
            Err(_) => {
                bad_check_digits += 1;
                continue;
            }
        };
        names.push(Some(scheme.as_str().to_string()));
        abbrevs.push(Some(abbrev.clone()));
        keys.push(Some(full));
        out_dates.push(Some(*date));
        flags.push(Some(i64::from(row.in_index)));
        sources.push(row.source.clone());
    }
    if bad_check_digits > 0 {
        tracing::warn!(bad_check_digits, "dropping rows whose identifier has no valid check digit");
    }

    let mut columns = vec![
        text_column(SECURITY_KEY_NAME, &names),
        text_column(SECURITY_KEY_ABBREV, &abbrevs),
        text_column(SECURITY_KEY, &keys),
        date_column(DATE, &out_dates),
        int_column(IN_INDEX, &flags),
    ];
    if labelled {
        columns.push(text_column(SOURCE_INDEX, &sources));
    }
    Ok(Panel::new(DataFrame::new(columns)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::{i64_values, str_values};
    use crate::membership::CurrentMapping;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn interval(entity: &str, since: &str, until: Option<&str>) -> MembershipInterval {
        MembershipInterval {
            entity: entity.into(),
            since: d(since),
            until: until.map(d),
            source: None,
        }
    }

    fn pit(entity: &str, abbrev: &str, from: &str, until: Option<&str>) -> IdentifierMapping {
        IdentifierMapping {
            entity: entity.into(),
            scheme: KeyScheme::Sedol,
            abbrev: abbrev.into(),
            valid_from: d(from),
            valid_until: until.map(d),
        }
    }

    fn dates() -> Vec<NaiveDate> {
        vec![d("2020-01-31"), d("2020-02-28"), d("2020-03-31")]
    }

    #[test]
    fn grid_flags_containment() {
        let cells = membership_grid(&[interval("e1", "2020-02-01", Some("2020-02-29"))], &dates());
        let flags: Vec<bool> = cells.iter().map(|c| c.in_index).collect();
        assert_eq!(flags, vec![false, true, false]);
    }

    #[test]
    fn overlapping_intervals_yield_one_cell() {
        let cells = membership_grid(
            &[
                interval("e1", "2020-01-01", None),
                interval("e1", "2020-02-01", Some("2020-02-29")),
            ],
            &dates(),
        );
        assert_eq!(cells.len(), 3);
        assert!(cells.iter().all(|c| c.in_index));
    }

    #[test]
    fn source_label_follows_latest_start() {
        let mut a = interval("e1", "2020-01-01", Some("2020-02-15"));
        a.source = Some("A".into());
        let mut b = interval("e1", "2020-02-16", None);
        b.source = Some("B".into());
        let cells = membership_grid(&[a, b], &dates());
        let labels: Vec<Option<&str>> = cells.iter().map(|c| c.source.as_deref()).collect();
        assert_eq!(labels, vec![Some("A"), Some("B"), Some("B")]);
    }

    #[test]
    fn identifier_change_mid_period() {
        let maps = IdentifierMaps {
            point_in_time: vec![
                pit("e1", "026349", "2000-01-01", Some("2020-02-15")),
                pit("e1", "B0YBKJ", "2020-02-16", None),
            ],
            current: vec![],
        };
        let panel = build_membership_panel(
            &[interval("e1", "2020-01-01", None)],
            &dates(),
            &maps,
            ReconstructOptions::default(),
        )
        .unwrap();
        assert_eq!(panel.height(), 3);
        let keys = str_values(panel.frame(), SECURITY_KEY_ABBREV).unwrap();
        assert_eq!(keys[0].as_deref(), Some("026349"));
        assert_eq!(keys[1].as_deref(), Some("B0YBKJ"));
    }

    #[test]
    fn current_mapping_fills_gaps_only_when_unambiguous() {
        let maps = IdentifierMaps {
            point_in_time: vec![],
            current: vec![
                CurrentMapping {
                    entity: "e1".into(),
                    scheme: KeyScheme::Sedol,
                    abbrev: "026349".into(),
                },
                CurrentMapping {
                    entity: "e2".into(),
                    scheme: KeyScheme::Sedol,
                    abbrev: "B0YBKJ".into(),
                },
                CurrentMapping {
                    entity: "e2".into(),
                    scheme: KeyScheme::Sedol,
                    abbrev: "B0YBKL".into(),
                },
            ],
        };
        let panel = build_membership_panel(
            &[interval("e1", "2020-01-01", None), interval("e2", "2020-01-01", None)],
            &dates(),
            &maps,
            ReconstructOptions::default(),
        )
        .unwrap();
        assert_eq!(panel.height(), 3);
        assert_eq!(panel.keys(KeyScheme::Sedol, false).unwrap(), vec!["0263494".to_string()]);
    }

    #[test]
    fn in_index_row_wins_over_stale_entity() {
        // Two entities share one identifier; only e2 is a member in March.
        let maps = IdentifierMaps {
            point_in_time: vec![
                pit("e1", "026349", "2000-01-01", None),
                pit("e2", "026349", "2000-01-01", None),
            ],
            current: vec![],
        };
        let panel = build_membership_panel(
            &[
                interval("e1", "2020-01-01", Some("2020-02-29")),
                interval("e2", "2020-03-01", None),
            ],
            &dates(),
            &maps,
            ReconstructOptions::default(),
        )
        .unwrap();
        assert_eq!(panel.height(), 3);
        assert_eq!(
            i64_values(panel.frame(), IN_INDEX).unwrap(),
            vec![Some(1), Some(1), Some(1)]
        );
    }

    #[test]
    fn keep_in_index_only_drops_outsiders() {
        let maps = IdentifierMaps {
            point_in_time: vec![pit("e1", "026349", "2000-01-01", None)],
            current: vec![],
        };
        let panel = build_membership_panel(
            &[interval("e1", "2020-02-01", Some("2020-02-29"))],
            &dates(),
            &maps,
            ReconstructOptions {
                keep_in_index_only: true,
            },
        )
        .unwrap();
        assert_eq!(panel.dates(), vec![d("2020-02-28")]);
        assert_eq!(
            str_values(panel.frame(), SECURITY_KEY).unwrap(),
            vec![Some("0263494".to_string())]
        );
    }

    fn two_scheme_maps() -> IdentifierMaps {
        let mut cusip = pit("e1", "03783310", "2000-01-01", None);
        cusip.scheme = KeyScheme::Cusip;
        IdentifierMaps {
            point_in_time: vec![cusip, pit("e1", "026349", "2000-01-01", None)],
            current: vec![],
        }
    }

    #[test]
    fn two_point_in_time_mappings_for_one_cell_are_fatal() {
        let err = build_membership_panel(
            &[interval("e1", "2020-01-01", None)],
            &dates(),
            &two_scheme_maps(),
            ReconstructOptions::default(),
        )
        .unwrap_err();
        match err {
            MembershipError::RowCountMismatch {
                entity,
                date,
                expected,
                actual,
            } => {
                assert_eq!(entity, "e1");
                assert_eq!(date, d("2020-01-31"));
                assert_eq!((expected, actual), (1, 2));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn backfilled_cells_do_not_mask_duplicated_point_in_time_rows() {
        let mut maps = two_scheme_maps();
        maps.current.push(CurrentMapping {
            entity: "e2".into(),
            scheme: KeyScheme::Sedol,
            abbrev: "B0YBKJ".into(),
        });
        let err = build_membership_panel(
            &[interval("e1", "2020-01-01", None), interval("e2", "2020-01-01", None)],
            &dates(),
            &maps,
            ReconstructOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MembershipError::RowCountMismatch { ref entity, expected: 1, actual: 2, .. } if entity == "e1"
        ));
    }

    #[test]
    fn every_cell_resolves_to_one_row() {
        let maps = IdentifierMaps {
            point_in_time: vec![pit("e1", "026349", "2000-01-01", None)],
            current: vec![CurrentMapping {
                entity: "e2".into(),
                scheme: KeyScheme::Sedol,
                abbrev: "B0YBKJ".into(),
            }],
        };
        let cells = membership_grid(
            &[interval("e1", "2020-01-01", None), interval("e2", "2020-01-01", None)],
            &dates(),
        );
        let rows = resolve_identifiers(&cells, &maps).unwrap();
        assert_eq!(rows.len(), cells.len());
        assert!(rows.iter().all(|r| r.id.is_some()));
    }
}
