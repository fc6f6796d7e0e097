//! Index selection and the membership source capability.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{
    build_membership_panel, IdentifierMaps, MembershipError, MembershipInterval, ReconstructOptions,
};
use crate::calendar::{date_range, Frequency};
use crate::columns::int_column;
use crate::identifiers::KeyScheme;
use crate::panel::{Panel, IN_INDEX};

/// Which index to reconstruct. The code wins when both are given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSelector {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl IndexSelector {
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            name: None,
        }
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self {
            code: None,
            name: Some(name.into()),
        }
    }

    /// Resolve to an index code through `source`.
    pub fn resolve(&self, source: &dyn MembershipSource) -> Result<String, MembershipError> {
        if let Some(code) = &self.code {
            return Ok(code.clone());
        }
        let name = self.name.as_ref().ok_or(MembershipError::MissingSelector)?;
        source
            .index_code(name)?
            .ok_or_else(|| MembershipError::IndexNameNotFound(name.clone()))
    }
}

/// Vendor capability that serves raw index membership.
pub trait MembershipSource: Send + Sync {
    /// Index code for a human-readable index name, if known.
    fn index_code(&self, name: &str) -> Result<Option<String>, MembershipError>;

    /// Every membership interval of `code` overlapping `[since, until]`.
    fn constituents(
        &self,
        code: &str,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<MembershipInterval>, MembershipError>;

    /// Identifier mappings for the given entities.
    fn identifier_maps(&self, entities: &[String]) -> Result<IdentifierMaps, MembershipError>;

    /// Index names containing `fragment` (case-insensitive), with their codes.
    fn search(&self, fragment: Option<&str>) -> Result<Vec<(String, String)>, MembershipError>;
}

/// In-memory membership source, typically loaded from files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticMembershipSource {
    /// Index name → index code.
    #[serde(default)]
    pub names: BTreeMap<String, String>,
    /// Index code → intervals.
    #[serde(default)]
    pub intervals: BTreeMap<String, Vec<MembershipInterval>>,
    #[serde(default)]
    pub maps: IdentifierMaps,
}

impl StaticMembershipSource {
    pub fn with_index(
        mut self,
        code: impl Into<String>,
        name: Option<String>,
        intervals: Vec<MembershipInterval>,
    ) -> Self {
        let code = code.into();
        if let Some(name) = name {
            self.names.insert(name, code.clone());
        }
        self.intervals.entry(code).or_default().extend(intervals);
        self
    }

    pub fn with_maps(mut self, maps: IdentifierMaps) -> Self {
        self.maps.point_in_time.extend(maps.point_in_time);
        self.maps.current.extend(maps.current);
        self
    }
}

impl MembershipSource for StaticMembershipSource {
    fn index_code(&self, name: &str) -> Result<Option<String>, MembershipError> {
        Ok(self.names.get(name).cloned())
    }

    fn constituents(
        &self,
        code: &str,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<MembershipInterval>, MembershipError> {
        Ok(self
            .intervals
            .get(code)
            .map(|list| {
                list.iter()
                    .filter(|iv| iv.since <= until && iv.until.map_or(true, |u| u >= since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn identifier_maps(&self, entities: &[String]) -> Result<IdentifierMaps, MembershipError> {
        Ok(self.maps.for_entities(entities))
    }

    fn search(&self, fragment: Option<&str>) -> Result<Vec<(String, String)>, MembershipError> {
        let fragment = fragment.map(str::to_uppercase);
        Ok(self
            .names
            .iter()
            .filter(|(name, _)| {
                fragment
                    .as_deref()
                    .map_or(true, |f| name.to_uppercase().contains(f))
            })
            .map(|(name, code)| (name.clone(), code.clone()))
            .collect())
    }
}

/// Reconstruct the membership panel of the selected index on a `frequency` grid.
pub fn index_membership_panel(
    source: &dyn MembershipSource,
    selector: &IndexSelector,
    since: NaiveDate,
    until: NaiveDate,
    frequency: Frequency,
    options: ReconstructOptions,
) -> Result<Panel, MembershipError> {
    if !frequency.is_monthly_or_coarser() {
        tracing::warn!(
            %frequency,
            "membership intervals are reported monthly; sub-monthly grids repeat month states"
        );
    }
    if !options.keep_in_index_only {
        tracing::info!("rows with in_index = 0 are kept only where an identifier mapping exists");
    }
    let code = selector.resolve(source)?;
    let intervals = source.constituents(&code, since, until)?;
    if intervals.is_empty() {
        return Err(MembershipError::NoMembershipData { code, since, until });
    }
    let mut entities: Vec<String> = intervals.iter().map(|iv| iv.entity.clone()).collect();
    entities.sort();
    entities.dedup();
    let maps = source.identifier_maps(&entities)?;
    let dates = date_range(since, until, frequency)?;
    tracing::info!(
        index = %code,
        entities = entities.len(),
        dates = dates.len(),
        "reconstructing index membership"
    );
    build_membership_panel(&intervals, &dates, &maps, options)
}

/// Dense panel of explicit identifiers, all in the universe.
pub fn security_panel(
    since: NaiveDate,
    until: NaiveDate,
    cusips: &[String],
    sedols: &[String],
    frequency: Frequency,
) -> Result<Panel, MembershipError> {
    if cusips.is_empty() && sedols.is_empty() {
        return Err(MembershipError::NoSecurities);
    }
    let dates = date_range(since, until, frequency)?;
    let entities: Vec<(KeyScheme, String)> = cusips
        .iter()
        .map(|c| (KeyScheme::Cusip, c.clone()))
        .chain(sedols.iter().map(|s| (KeyScheme::Sedol, s.clone())))
        .collect();
    let panel = Panel::grid(&entities, &dates)?;
    let height = panel.height();
    Ok(panel.with_column(int_column(IN_INDEX, &vec![Some(1); height]))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::IdentifierMapping;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn source() -> StaticMembershipSource {
        StaticMembershipSource::default()
            .with_index(
                "3670",
                Some("FTSE 100".into()),
                vec![MembershipInterval {
                    entity: "e1".into(),
                    since: d("2019-01-01"),
                    until: None,
                    source: None,
                }],
            )
            .with_index("9999", Some("EMPTY".into()), vec![])
            .with_maps(IdentifierMaps {
                point_in_time: vec![IdentifierMapping {
                    entity: "e1".into(),
                    scheme: KeyScheme::Sedol,
                    abbrev: "026349".into(),
                    valid_from: d("2000-01-01"),
                    valid_until: None,
                }],
                current: vec![],
            })
    }

    #[test]
    fn code_wins_over_name() {
        let sel = IndexSelector {
            code: Some("3670".into()),
            name: Some("nonsense".into()),
        };
        assert_eq!(sel.resolve(&source()).unwrap(), "3670");
    }

    #[test]
    fn selector_errors() {
        let src = source();
        assert!(matches!(
            IndexSelector::default().resolve(&src),
            Err(MembershipError::MissingSelector)
        ));
        assert!(matches!(
            IndexSelector::name("DAX").resolve(&src),
            Err(MembershipError::IndexNameNotFound(_))
        ));
        let err = index_membership_panel(
            &src,
            &IndexSelector::name("EMPTY"),
            d("2020-01-01"),
            d("2020-03-31"),
            Frequency::BusinessMonthEnd,
            ReconstructOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MembershipError::NoMembershipData { .. }));
    }

    #[test]
    fn index_by_name() {
        let panel = index_membership_panel(
            &source(),
            &IndexSelector::name("FTSE 100"),
            d("2020-01-01"),
            d("2020-03-31"),
            Frequency::BusinessMonthEnd,
            ReconstructOptions::default(),
        )
        .unwrap();
        assert_eq!(panel.height(), 3);
        assert_eq!(panel.universe_mask(), vec![true; 3]);
    }

    #[test]
    fn search_is_case_insensitive() {
        let hits = source().search(Some("ftse")).unwrap();
        assert_eq!(hits, vec![("FTSE 100".to_string(), "3670".to_string())]);
        assert_eq!(source().search(None).unwrap().len(), 2);
    }

    #[test]
    fn security_panel_needs_identifiers() {
        assert!(matches!(
            security_panel(d("2020-01-01"), d("2020-02-01"), &[], &[], Frequency::MonthStart),
            Err(MembershipError::NoSecurities)
        ));
        let panel = security_panel(
            d("2020-01-01"),
            d("2020-02-01"),
            &["037833100".to_string()],
            &["0263494".to_string()],
            Frequency::MonthStart,
        )
        .unwrap();
        assert_eq!(panel.height(), 4);
        assert_eq!(panel.universe_mask(), vec![true; 4]);
    }
}
