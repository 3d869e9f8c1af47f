//! Calendar classification of ridership dates.
//!
//! [`BusinessCalendar`] holds the ascending list of non-holiday weekdays over
//! a fixed span. It is built once, never mutated, and passed by reference to
//! whoever needs to classify dates.

use crate::error::{Result, ValidationError};
use crate::records::RideRecord;
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

use super::recode::Recoder;

/// Days past "today" the default calendar extends to.
pub const HORIZON_DAYS: i64 = 90;

/// Comparable-day class of a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CalendarLabel {
    Weekday,
    Saturday,
    Sunday,
    Holiday,
}

impl CalendarLabel {
    /// Labels kept for weekday/weekend analysis.
    pub fn working() -> BTreeSet<CalendarLabel> {
        [
            CalendarLabel::Weekday,
            CalendarLabel::Saturday,
            CalendarLabel::Sunday,
        ]
        .into_iter()
        .collect()
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Weekday" => Some(CalendarLabel::Weekday),
            "Saturday" => Some(CalendarLabel::Saturday),
            "Sunday" => Some(CalendarLabel::Sunday),
            "Holiday" => Some(CalendarLabel::Holiday),
            _ => None,
        }
    }
}

impl fmt::Display for CalendarLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CalendarLabel::Weekday => "Weekday",
            CalendarLabel::Saturday => "Saturday",
            CalendarLabel::Sunday => "Sunday",
            CalendarLabel::Holiday => "Holiday",
        };
        f.write_str(s)
    }
}

/// Month bucket of a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn of(date: NaiveDate) -> Self {
        MonthKey {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Parses the `YYYY-MM` form.
    pub fn parse(s: &str) -> Option<Self> {
        let (y, m) = s.split_once('-')?;
        let key = MonthKey {
            year: y.parse().ok()?,
            month: m.parse().ok()?,
        };
        key.first_day().map(|_| key)
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    /// First day of the following month.
    pub fn next_first_day(&self) -> Option<NaiveDate> {
        if self.month == 12 {
            NaiveDate::from_ymd_opt(self.year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(self.year, self.month + 1, 1)
        }
    }

    /// Display form, e.g. `Mar-23`.
    pub fn label(&self) -> String {
        self.first_day()
            .map(|d| d.format("%b-%y").to_string())
            .unwrap_or_default()
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Non-holiday business days between two dates (inclusive).
#[derive(Debug, Clone)]
pub struct BusinessCalendar {
    start: NaiveDate,
    end: NaiveDate,
    business_days: Vec<NaiveDate>,
}

impl BusinessCalendar {
    /// Builds the calendar of weekdays in `[start, end]` that are not US
    /// federal holidays (observed).
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        let holidays: BTreeSet<NaiveDate> = (start.year() - 1..=end.year() + 1)
            .flat_map(federal_holidays)
            .collect();

        let business_days: Vec<NaiveDate> = start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| !is_weekend(*d) && !holidays.contains(d))
            .collect();

        debug!(%start, %end, days = business_days.len(), "Business calendar built");

        BusinessCalendar {
            start,
            end,
            business_days,
        }
    }

    /// Calendar from 2019-01-01 through `today` plus [`HORIZON_DAYS`].
    pub fn through_horizon(today: NaiveDate) -> Self {
        let epoch = NaiveDate::from_ymd_opt(2019, 1, 1).unwrap_or(today);
        Self::new(epoch, today + Duration::days(HORIZON_DAYS))
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn covers(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        self.business_days.binary_search(&date).is_ok()
    }

    pub fn business_days(&self) -> &[NaiveDate] {
        &self.business_days
    }

    pub fn classify(&self, date: NaiveDate) -> CalendarLabel {
        if self.is_business_day(date) {
            return CalendarLabel::Weekday;
        }
        match date.weekday() {
            Weekday::Sat => CalendarLabel::Saturday,
            Weekday::Sun => CalendarLabel::Sunday,
            _ => CalendarLabel::Holiday,
        }
    }

    /// Number of days in `[start, end)` carrying `label`.
    pub fn count_days(&self, label: CalendarLabel, start: NaiveDate, end: NaiveDate) -> usize {
        start
            .iter_days()
            .take_while(|d| *d < end)
            .filter(|d| self.classify(*d) == label)
            .count()
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Saturday holidays move to Friday, Sunday holidays to Monday.
fn nearest_workday(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    nth_weekday(year, month, weekday, 5).or_else(|| nth_weekday(year, month, weekday, 4))
}

/// Observed US federal holidays of a year.
fn federal_holidays(year: i32) -> Vec<NaiveDate> {
    let fixed = |month: u32, day: u32| NaiveDate::from_ymd_opt(year, month, day).map(nearest_workday);

    let mut days = vec![
        fixed(1, 1),
        nth_weekday(year, 1, Weekday::Mon, 3),
        nth_weekday(year, 2, Weekday::Mon, 3),
        last_weekday(year, 5, Weekday::Mon),
        fixed(7, 4),
        nth_weekday(year, 9, Weekday::Mon, 1),
        nth_weekday(year, 10, Weekday::Mon, 2),
        fixed(11, 11),
        nth_weekday(year, 11, Weekday::Thu, 4),
        fixed(12, 25),
    ];
    if year >= 2021 {
        days.push(fixed(6, 19));
    }

    days.into_iter().flatten().collect()
}

/// A record with its derived calendar attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledRecord {
    pub record: RideRecord,
    pub label: CalendarLabel,
    pub month: MonthKey,
    /// Recoded time-of-day block, e.g. `6am-9am`.
    pub time_block: Option<String>,
    pub rider_type: Option<String>,
}

/// Full labeled record set, holidays included.
#[derive(Debug, Clone, Default)]
pub struct LabeledSet {
    rows: Vec<LabeledRecord>,
}

impl LabeledSet {
    /// Labels every record. Source records are left untouched.
    ///
    /// Fails if a date lies outside the calendar span or a time-block code
    /// has no mapping.
    pub fn label(
        records: &[RideRecord],
        calendar: &BusinessCalendar,
        time_blocks: &Recoder,
    ) -> Result<Self> {
        let mut rows = Vec::with_capacity(records.len());

        for record in records {
            if !calendar.covers(record.date) {
                return Err(ValidationError::OutsideCalendar {
                    date: record.date.to_string(),
                    start: calendar.start().to_string(),
                    end: calendar.end().to_string(),
                }
                .into());
            }

            let time_block = match &record.time_block {
                Some(code) => Some(time_blocks.recode(code)?.to_string()),
                None => None,
            };

            rows.push(LabeledRecord {
                label: calendar.classify(record.date),
                month: MonthKey::of(record.date),
                time_block,
                rider_type: record.rider_type(),
                record: record.clone(),
            });
        }

        Ok(LabeledSet { rows })
    }

    /// Every labeled row, holidays included.
    pub fn all(&self) -> &[LabeledRecord] {
        &self.rows
    }

    /// Rows whose label is in `labels`.
    pub fn working_set(&self, labels: &BTreeSet<CalendarLabel>) -> Vec<LabeledRecord> {
        let kept: Vec<LabeledRecord> = self
            .rows
            .iter()
            .filter(|r| labels.contains(&r.label))
            .cloned()
            .collect();

        debug!(
            total = self.rows.len(),
            kept = kept.len(),
            "Calendar label filter applied"
        );
        kept
    }

    /// Rows for weekday/weekend analysis (holidays dropped).
    pub fn without_holidays(&self) -> Vec<LabeledRecord> {
        self.working_set(&CalendarLabel::working())
    }
}
