//! As-of merge semantics across the panel boundary.

use chrono::NaiveDate;
use pitpanel_core::columns::{date_values, f64_values, str_values};
use pitpanel_core::join::{asof_merge, left_join, AsofDirection, AsofOptions, JoinCardinality, JoinError};
use pitpanel_core::panel::{DATE, SECURITY_KEY, SECURITY_KEY_NAME};
use polars::prelude::*;

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// Two cusips on three month-ends.
fn panel_frame() -> DataFrame {
    let dates = [d("2020-01-31"), d("2020-02-29"), d("2020-03-31")];
    df!(
        SECURITY_KEY_NAME => &["cusip"; 6],
        SECURITY_KEY => &["A", "A", "A", "B", "B", "B"],
        DATE => &[dates[0], dates[1], dates[2], dates[0], dates[1], dates[2]],
    )
    .unwrap()
}

/// Quarterly-ish feature reported on irregular days.
fn feature_frame() -> DataFrame {
    df!(
        SECURITY_KEY_NAME => &["cusip"; 4],
        SECURITY_KEY => &["A", "A", "B", "B"],
        DATE => &[d("2020-01-31"), d("2020-03-15"), d("2020-02-01"), d("2020-04-01")],
        "eps" => &[1.0, 2.0, 10.0, 20.0],
    )
    .unwrap()
}

fn eps_by_key_then_date(out: &DataFrame) -> Vec<Option<f64>> {
    let sorted = out
        .sort([SECURITY_KEY, DATE], SortMultipleOptions::default())
        .unwrap();
    f64_values(&sorted, "eps").unwrap()
}

#[test]
fn backward_merge_carries_last_known_value() {
    let out = asof_merge(&panel_frame(), &feature_frame(), &AsofOptions::default()).unwrap();
    assert_eq!(out.height(), 6);
    assert_eq!(
        eps_by_key_then_date(&out),
        vec![Some(1.0), Some(1.0), Some(2.0), None, Some(10.0), Some(10.0)]
    );
}

#[test]
fn strict_backward_merge_never_matches_same_date() {
    let opts = AsofOptions::default().allow_exact_matches(false);
    let out = asof_merge(&panel_frame(), &feature_frame(), &opts).unwrap();
    assert_eq!(
        eps_by_key_then_date(&out),
        vec![None, Some(1.0), Some(2.0), None, Some(10.0), Some(10.0)]
    );
}

#[test]
fn forward_merge_takes_next_value() {
    let opts = AsofOptions::default().direction(AsofDirection::Forward);
    let out = asof_merge(&panel_frame(), &feature_frame(), &opts).unwrap();
    assert_eq!(
        eps_by_key_then_date(&out),
        vec![Some(1.0), Some(2.0), None, Some(10.0), Some(20.0), Some(20.0)]
    );
}

#[test]
fn output_is_in_date_order() {
    let out = asof_merge(&panel_frame(), &feature_frame(), &AsofOptions::default()).unwrap();
    let dates = date_values(&out, DATE).unwrap();
    assert!(dates.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn different_time_column_names_are_supported() {
    let mut feature = feature_frame();
    feature.rename(DATE, "report_date".into()).unwrap();
    let opts = AsofOptions::default().right_on("report_date");
    let out = asof_merge(&panel_frame(), &feature, &opts).unwrap();
    assert!(out.get_column_index("report_date").is_some());
    assert_eq!(eps_by_key_then_date(&out)[2], Some(2.0));
}

#[test]
fn mismatched_by_arity_is_an_error() {
    let opts = AsofOptions::default().right_by(&[SECURITY_KEY]);
    assert!(matches!(
        asof_merge(&panel_frame(), &feature_frame(), &opts),
        Err(JoinError::ByArity { left: 2, right: 1 })
    ));
}

#[test]
fn many_to_one_join_rejects_duplicated_right_keys() {
    let right = df!(SECURITY_KEY => &["A", "A"], "sector" => &["45", "40"]).unwrap();
    let err = left_join(&panel_frame(), &right, &[SECURITY_KEY], JoinCardinality::ManyToOne).unwrap_err();
    assert!(matches!(err, JoinError::RowCountMismatch { expected: 6, .. }));
}

#[test]
fn many_to_one_join_keeps_left_rows() {
    let right = df!(SECURITY_KEY => &["A"], "sector" => &["45"]).unwrap();
    let out = left_join(&panel_frame(), &right, &[SECURITY_KEY], JoinCardinality::ManyToOne).unwrap();
    assert_eq!(out.height(), 6);
    let sectors = str_values(&out, "sector").unwrap();
    assert_eq!(sectors[0].as_deref(), Some("45"));
    assert_eq!(sectors[3], None);
}
