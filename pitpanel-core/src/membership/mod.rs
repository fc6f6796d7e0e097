//! Point-in-time index membership.
//!
//! Raw vendor membership arrives either as since/until intervals per entity
//! ([`MembershipInterval`]) or as daily weighted constituent lists
//! ([`DailyMembership`]). Both are turned into a panel with an `in_index`
//! flag that is correct as of each panel date.

mod daily;
mod reconstruct;
mod selector;
mod weights;

pub use daily::{daily_membership_panel, DailyMembership};
pub use reconstruct::{build_membership_panel, membership_grid, MembershipCell, ReconstructOptions};
pub use selector::{
    index_membership_panel, security_panel, IndexSelector, MembershipSource, StaticMembershipSource,
};
pub use weights::{filter_by_prefix, keep_in_index_only, renormalize_weights, restrict_universe};

use chrono::NaiveDate;
use polars::prelude::PolarsError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calendar::CalendarError;
use crate::identifiers::{IdentifierError, KeyScheme};
use crate::join::JoinError;
use crate::panel::PanelError;

pub const SOURCE_INDEX: &str = "source_index";
pub const TOTAL_RETURN_INDEX: &str = "total_return_index";

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("an index code or an index name is required")]
    MissingSelector,

    #[error("no index code found for index name '{0}'")]
    IndexNameNotFound(String),

    #[error("no membership data found for index '{code}' between {since} and {until}")]
    NoMembershipData {
        code: String,
        since: NaiveDate,
        until: NaiveDate,
    },

    #[error("at least one cusip or sedol is required")]
    NoSecurities,

    #[error("identifiers for entity '{entity}' at {date} resolve to {actual} rows, expected {expected}")]
    RowCountMismatch {
        entity: String,
        date: NaiveDate,
        expected: usize,
        actual: usize,
    },

    #[error("membership source failed: {0}")]
    Source(String),

    #[error(transparent)]
    Panel(#[from] PanelError),

    #[error(transparent)]
    Polars(#[from] PolarsError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

/// A period during which `entity` belonged to an index.
///
/// `until == None` means the membership is still current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipInterval {
    pub entity: String,
    pub since: NaiveDate,
    pub until: Option<NaiveDate>,
    /// Sub-index the membership was reported under, when the source has one.
    #[serde(default)]
    pub source: Option<String>,
}

impl MembershipInterval {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.since <= date && self.until.map_or(true, |until| date <= until)
    }
}

/// Point-in-time link from a vendor entity to a security identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierMapping {
    pub entity: String,
    pub scheme: KeyScheme,
    /// Identifier without check digit.
    pub abbrev: String,
    pub valid_from: NaiveDate,
    pub valid_until: Option<NaiveDate>,
}

impl IdentifierMapping {
    pub fn is_valid_at(&self, date: NaiveDate) -> bool {
        self.valid_from <= date && self.valid_until.map_or(true, |until| date <= until)
    }
}

/// Today's link from a vendor entity to a security identifier. Not point-in-time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentMapping {
    pub entity: String,
    pub scheme: KeyScheme,
    pub abbrev: String,
}

/// Both identifier tables for a set of entities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierMaps {
    #[serde(default)]
    pub point_in_time: Vec<IdentifierMapping>,
    #[serde(default)]
    pub current: Vec<CurrentMapping>,
}

impl IdentifierMaps {
    /// Keep only mappings for `entities`.
    pub fn for_entities(&self, entities: &[String]) -> IdentifierMaps {
        IdentifierMaps {
            point_in_time: self
                .point_in_time
                .iter()
                .filter(|m| entities.contains(&m.entity))
                .cloned()
                .collect(),
            current: self
                .current
                .iter()
                .filter(|m| entities.contains(&m.entity))
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn open_interval_contains_later_dates() {
        let iv = MembershipInterval {
            entity: "e".into(),
            since: d("2020-01-01"),
            until: None,
            source: None,
        };
        assert!(iv.contains(d("2030-01-01")));
        assert!(iv.contains(d("2020-01-01")));
        assert!(!iv.contains(d("2019-12-31")));
    }

    #[test]
    fn closed_interval_is_inclusive() {
        let iv = MembershipInterval {
            entity: "e".into(),
            since: d("2020-01-01"),
            until: Some(d("2020-03-31")),
            source: None,
        };
        assert!(iv.contains(d("2020-03-31")));
        assert!(!iv.contains(d("2020-04-01")));
    }
}
