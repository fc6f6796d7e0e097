//! Panel date grids and calendar offsets.

use chrono::{Datelike, Days, Months, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalendarError {
    #[error("unknown frequency code: {0}")]
    UnknownFrequency(String),

    #[error("invalid calendar offset '{0}' (expected e.g. 1M, -5D, 1Y2M)")]
    InvalidOffset(String),

    #[error("date {date} shifted by {offset} is out of range")]
    OutOfRange { date: NaiveDate, offset: String },

    #[error("since {since} is after until {until}")]
    InvertedRange { since: NaiveDate, until: NaiveDate },
}

// ─── Frequencies ─────────────────────────────────────────────────────

/// Panel grid frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    /// Every calendar day (`D`).
    #[serde(rename = "D")]
    Daily,
    /// Monday to Friday (`B`).
    #[serde(rename = "B")]
    BusinessDaily,
    /// Every Sunday (`W`).
    #[serde(rename = "W")]
    Weekly,
    /// First day of each month (`MS`).
    #[serde(rename = "MS")]
    MonthStart,
    /// Last day of each month (`M`).
    #[serde(rename = "M")]
    MonthEnd,
    /// Last weekday of each month (`BM`).
    #[serde(rename = "BM")]
    BusinessMonthEnd,
    /// Last day of March, June, September and December (`Q`).
    #[serde(rename = "Q")]
    QuarterEnd,
    /// December 31st (`A`).
    #[serde(rename = "A")]
    YearEnd,
}

impl Frequency {
    pub fn code(self) -> &'static str {
        match self {
            Frequency::Daily => "D",
            Frequency::BusinessDaily => "B",
            Frequency::Weekly => "W",
            Frequency::MonthStart => "MS",
            Frequency::MonthEnd => "M",
            Frequency::BusinessMonthEnd => "BM",
            Frequency::QuarterEnd => "Q",
            Frequency::YearEnd => "A",
        }
    }

    /// True when consecutive grid dates are at least a month apart.
    pub fn is_monthly_or_coarser(self) -> bool {
        !matches!(
            self,
            Frequency::Daily | Frequency::BusinessDaily | Frequency::Weekly
        )
    }

    /// Whether `date` lies on this grid.
    pub fn contains(self, date: NaiveDate) -> bool {
        match self {
            Frequency::Daily => true,
            Frequency::BusinessDaily => is_weekday(date),
            Frequency::Weekly => date.weekday() == Weekday::Sun,
            Frequency::MonthStart => date.day() == 1,
            Frequency::MonthEnd => date == month_end(date),
            Frequency::BusinessMonthEnd => date == business_month_end(date),
            Frequency::QuarterEnd => date.month() % 3 == 0 && date == month_end(date),
            Frequency::YearEnd => date.month() == 12 && date.day() == 31,
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Frequency {
    type Err = CalendarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "D" => Ok(Frequency::Daily),
            "B" => Ok(Frequency::BusinessDaily),
            "W" => Ok(Frequency::Weekly),
            "MS" => Ok(Frequency::MonthStart),
            "M" | "ME" => Ok(Frequency::MonthEnd),
            "BM" | "BME" => Ok(Frequency::BusinessMonthEnd),
            "Q" | "QE" => Ok(Frequency::QuarterEnd),
            "A" | "Y" | "YE" => Ok(Frequency::YearEnd),
            _ => Err(CalendarError::UnknownFrequency(s.to_string())),
        }
    }
}

fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn month_end(date: NaiveDate) -> NaiveDate {
    month_start(date)
        .checked_add_months(Months::new(1))
        .and_then(|d| d.pred_opt())
        .unwrap_or(date)
}

fn business_month_end(date: NaiveDate) -> NaiveDate {
    let mut d = month_end(date);
    while !is_weekday(d) {
        match d.pred_opt() {
            Some(prev) => d = prev,
            None => break,
        }
    }
    d
}

/// All grid dates of `frequency` in `[since, until]`, ascending.
pub fn date_range(
    since: NaiveDate,
    until: NaiveDate,
    frequency: Frequency,
) -> Result<Vec<NaiveDate>, CalendarError> {
    if since > until {
        return Err(CalendarError::InvertedRange { since, until });
    }
    let mut dates = Vec::new();
    match frequency {
        Frequency::Daily | Frequency::BusinessDaily | Frequency::Weekly => {
            let mut d = since;
            while d <= until {
                if frequency.contains(d) {
                    dates.push(d);
                }
                match d.succ_opt() {
                    Some(next) => d = next,
                    None => break,
                }
            }
        }
        _ => {
            // Walk month by month and pick the anchor within each month.
            let mut month = month_start(since);
            while month <= until {
                let anchor = match frequency {
                    Frequency::MonthStart => Some(month),
                    Frequency::MonthEnd => Some(month_end(month)),
                    Frequency::BusinessMonthEnd => Some(business_month_end(month)),
                    Frequency::QuarterEnd => (month.month() % 3 == 0).then(|| month_end(month)),
                    Frequency::YearEnd => (month.month() == 12).then(|| month_end(month)),
                    _ => None,
                };
                if let Some(anchor) = anchor {
                    if anchor >= since && anchor <= until {
                        dates.push(anchor);
                    }
                }
                match month.checked_add_months(Months::new(1)) {
                    Some(next) => month = next,
                    None => break,
                }
            }
        }
    }
    Ok(dates)
}

// ─── Offsets ─────────────────────────────────────────────────────────

/// Calendar offset of whole months followed by days.
///
/// Month arithmetic clamps to the end of the target month, so
/// `2020-01-31 + 1M == 2020-02-29`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CalendarOffset {
    #[serde(default)]
    pub months: i32,
    #[serde(default)]
    pub days: i64,
}

impl CalendarOffset {
    pub const fn new(months: i32, days: i64) -> Self {
        Self { months, days }
    }

    pub const fn days(days: i64) -> Self {
        Self { months: 0, days }
    }

    pub const fn months(months: i32) -> Self {
        Self { months, days: 0 }
    }

    pub fn is_zero(&self) -> bool {
        self.months == 0 && self.days == 0
    }

    pub fn negate(self) -> Self {
        Self {
            months: -self.months,
            days: -self.days,
        }
    }

    /// `date + self`.
    pub fn apply(&self, date: NaiveDate) -> Result<NaiveDate, CalendarError> {
        let out_of_range = || CalendarError::OutOfRange {
            date,
            offset: self.to_string(),
        };
        let shifted = if self.months >= 0 {
            date.checked_add_months(Months::new(self.months.unsigned_abs()))
        } else {
            date.checked_sub_months(Months::new(self.months.unsigned_abs()))
        }
        .ok_or_else(out_of_range)?;
        let shifted = if self.days >= 0 {
            shifted.checked_add_days(Days::new(self.days.unsigned_abs()))
        } else {
            shifted.checked_sub_days(Days::new(self.days.unsigned_abs()))
        };
        shifted.ok_or_else(out_of_range)
    }

    /// `date - self`.
    pub fn subtract_from(&self, date: NaiveDate) -> Result<NaiveDate, CalendarError> {
        self.negate().apply(date)
    }
}

impl fmt::Display for CalendarOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.months, self.days) {
            (0, d) => write!(f, "{d}D"),
            (m, 0) => write!(f, "{m}M"),
            (m, d) => write!(f, "{m}M{d}D"),
        }
    }
}

impl FromStr for CalendarOffset {
    type Err = CalendarError;

    /// Parses sequences like `1M`, `-5D`, `1Y2M`, `2W`, `-1M-3D`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CalendarError::InvalidOffset(s.to_string());
        let text = s.trim();
        if text.is_empty() {
            return Err(invalid());
        }
        let mut offset = CalendarOffset::default();
        let mut number = String::new();
        for ch in text.chars() {
            if ch.is_ascii_digit() || ((ch == '-' || ch == '+') && number.is_empty()) {
                number.push(ch);
                continue;
            }
            let n: i64 = number.parse().map_err(|_| invalid())?;
            number.clear();
            match ch.to_ascii_uppercase() {
                'Y' => offset.months += i32::try_from(n * 12).map_err(|_| invalid())?,
                'M' => offset.months += i32::try_from(n).map_err(|_| invalid())?,
                'W' => offset.days += n * 7,
                'D' => offset.days += n,
                _ => return Err(invalid()),
            }
        }
        if !number.is_empty() {
            return Err(invalid());
        }
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn month_start_grid() {
        let dates = date_range(d("2020-01-01"), d("2020-06-01"), Frequency::MonthStart).unwrap();
        assert_eq!(dates.len(), 6);
        assert_eq!(dates[0], d("2020-01-01"));
        assert_eq!(dates[5], d("2020-06-01"));
    }

    #[test]
    fn month_end_grid_handles_leap_year() {
        let dates = date_range(d("2020-01-15"), d("2020-03-31"), Frequency::MonthEnd).unwrap();
        assert_eq!(dates, vec![d("2020-01-31"), d("2020-02-29"), d("2020-03-31")]);
    }

    #[test]
    fn business_month_end_skips_weekends() {
        // 2020-05-31 is a Sunday.
        let dates =
            date_range(d("2020-05-01"), d("2020-05-31"), Frequency::BusinessMonthEnd).unwrap();
        assert_eq!(dates, vec![d("2020-05-29")]);
    }

    #[test]
    fn business_daily_has_no_weekends() {
        let dates = date_range(d("2020-01-01"), d("2020-01-31"), Frequency::BusinessDaily).unwrap();
        assert_eq!(dates.len(), 23);
        assert!(dates.iter().all(|d| is_weekday(*d)));
    }

    #[test]
    fn weekly_lands_on_sundays() {
        let dates = date_range(d("2020-01-01"), d("2020-01-31"), Frequency::Weekly).unwrap();
        assert_eq!(dates.first(), Some(&d("2020-01-05")));
        assert_eq!(dates.len(), 4);
    }

    #[test]
    fn quarter_and_year_ends() {
        let q = date_range(d("2019-01-01"), d("2019-12-31"), Frequency::QuarterEnd).unwrap();
        assert_eq!(q, vec![d("2019-03-31"), d("2019-06-30"), d("2019-09-30"), d("2019-12-31")]);
        let a = date_range(d("2018-06-01"), d("2020-06-01"), Frequency::YearEnd).unwrap();
        assert_eq!(a, vec![d("2018-12-31"), d("2019-12-31")]);
    }

    #[test]
    fn inverted_range_is_an_error() {
        assert!(date_range(d("2020-02-01"), d("2020-01-01"), Frequency::Daily).is_err());
    }

    #[test]
    fn offset_clamps_month_end() {
        let off = CalendarOffset::months(1);
        assert_eq!(off.apply(d("2020-01-31")).unwrap(), d("2020-02-29"));
        assert_eq!(off.subtract_from(d("2020-03-31")).unwrap(), d("2020-02-29"));
    }

    #[test]
    fn offset_parses_and_displays() {
        let off: CalendarOffset = "1Y2M".parse().unwrap();
        assert_eq!(off, CalendarOffset::new(14, 0));
        let off: CalendarOffset = "-5D".parse().unwrap();
        assert_eq!(off, CalendarOffset::days(-5));
        assert_eq!(off.to_string(), "-5D");
        assert_eq!(CalendarOffset::new(1, 5).to_string(), "1M5D");
        assert!("5".parse::<CalendarOffset>().is_err());
        assert!("5X".parse::<CalendarOffset>().is_err());
    }

    #[test]
    fn frequency_codes_round_trip() {
        for code in ["D", "B", "W", "MS", "M", "BM", "Q", "A"] {
            let f: Frequency = code.parse().unwrap();
            assert_eq!(f.code(), code);
        }
    }
}
