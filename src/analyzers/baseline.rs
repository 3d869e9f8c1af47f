//! Baseline averages and proportion-of-baseline ratios.
//!
//! Both sides use the same two-stage reduction: sum the metric per group per
//! day, then reduce the daily sums to a mean per day, a total and a count of
//! observed days. Day counts are checked against the number of days the
//! calendar allows for the group's label, which catches grouping keys that
//! silently merge groups.

use crate::analyzers::aggregate::{Dimension, GroupKey, rank_partitions};
use crate::analyzers::calendar::{BusinessCalendar, CalendarLabel, LabeledRecord, MonthKey};
use crate::analyzers::types::{Cell, Column, ColumnRole, Table};
use crate::error::{ConsistencyError, Result, ValidationError};
use crate::records::Metric;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Half-open date range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BaselineWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        let window = BaselineWindow { start, end };
        window.validate()?;
        Ok(window)
    }

    /// The whole calendar year.
    pub fn year(year: i32) -> Result<Self> {
        let start = NaiveDate::from_ymd_opt(year, 1, 1);
        let end = NaiveDate::from_ymd_opt(year + 1, 1, 1);
        match (start, end) {
            (Some(s), Some(e)) => Self::new(s, e),
            _ => Err(ValidationError::InvalidWindow {
                start: year.to_string(),
                end: (year + 1).to_string(),
            }
            .into()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.start >= self.end {
            return Err(ValidationError::InvalidWindow {
                start: self.start.to_string(),
                end: self.end.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end
    }

    pub fn days(&self) -> usize {
        (self.end - self.start).num_days().max(0) as usize
    }
}

/// Mean daily metric of one peer group over the baseline window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Baseline {
    pub key: Vec<String>,
    pub total: f64,
    pub mean_daily: f64,
    pub day_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BaselineTable {
    pub key: GroupKey,
    pub window: BaselineWindow,
    pub metric: Metric,
    pub entries: BTreeMap<Vec<String>, Baseline>,
}

impl BaselineTable {
    pub fn get(&self, key: &[String]) -> Option<&Baseline> {
        self.entries.get(key)
    }
}

/// Why a proportion is or is not defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BaselineStatus {
    Present,
    /// Baseline mean is zero; the ratio is undefined.
    Zero,
    /// No baseline exists for this group.
    Missing,
}

impl BaselineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaselineStatus::Present => "present",
            BaselineStatus::Zero => "zero",
            BaselineStatus::Missing => "missing",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProportionRow {
    pub key: Vec<String>,
    pub month_daily_avg: f64,
    pub month_total: f64,
    pub month_day_count: usize,
    pub baseline: Option<Baseline>,
    pub status: BaselineStatus,
    pub proportion: Option<f64>,
    pub percentile: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProportionTable {
    /// `Period` followed by the baseline key.
    pub key: GroupKey,
    pub metric: Metric,
    pub rows: Vec<ProportionRow>,
}

struct DailyStats {
    total: f64,
    mean: f64,
    days: usize,
}

/// Sums the metric per key per day, then reduces the days per key.
fn daily_reduce(
    records: &[LabeledRecord],
    key: &GroupKey,
    metric: Metric,
) -> Result<BTreeMap<Vec<String>, DailyStats>> {
    let mut per_day: BTreeMap<Vec<String>, BTreeMap<NaiveDate, f64>> = BTreeMap::new();
    for r in records {
        *per_day
            .entry(key.values_of(r)?)
            .or_default()
            .entry(r.record.date)
            .or_default() += r.record.metric(metric);
    }

    Ok(per_day
        .into_iter()
        .map(|(k, days)| {
            let total: f64 = days.values().sum();
            let n = days.len();
            (
                k,
                DailyStats {
                    total,
                    mean: total / n as f64,
                    days: n,
                },
            )
        })
        .collect())
}

/// Most days a group can be observed on within `[start, end)`.
fn max_days(
    key: &GroupKey,
    values: &[String],
    calendar: &BusinessCalendar,
    start: NaiveDate,
    end: NaiveDate,
) -> usize {
    let label = key
        .position(&Dimension::CalendarLabel)
        .and_then(|i| CalendarLabel::parse(&values[i]));

    match label {
        Some(label) => calendar.count_days(label, start, end),
        None => (end - start).num_days().max(0) as usize,
    }
}

fn check_days(key: &[String], days: usize, max: usize) -> Result<()> {
    if days > max {
        warn!(?key, days, max, "Day count exceeds calendar maximum");
        return Err(ConsistencyError::DayCountExceeded {
            key: key.to_vec(),
            days,
            max,
        }
        .into());
    }
    Ok(())
}

/// Computes the mean daily metric per `key` over `window`.
///
/// `key` holds the peer dimension and usually the calendar label, so weekday
/// and weekend baselines stay apart. Records outside the window are ignored.
#[tracing::instrument(skip(records, calendar), fields(records = records.len()))]
pub fn compute_baselines(
    records: &[LabeledRecord],
    key: &GroupKey,
    metric: Metric,
    window: BaselineWindow,
    calendar: &BusinessCalendar,
) -> Result<BaselineTable> {
    window.validate()?;
    if key.is_empty() {
        return Err(ValidationError::EmptyGroupKey.into());
    }
    if let Some(d) = key
        .dimensions()
        .iter()
        .find(|d| matches!(d, Dimension::Period | Dimension::Date))
    {
        return Err(ValidationError::BaselineKeyDimension(d.to_string()).into());
    }

    let in_window: Vec<LabeledRecord> = records
        .iter()
        .filter(|r| window.contains(r.record.date))
        .cloned()
        .collect();

    let mut entries = BTreeMap::new();
    for (k, stats) in daily_reduce(&in_window, key, metric)? {
        let max = max_days(key, &k, calendar, window.start, window.end);
        check_days(&k, stats.days, max)?;

        entries.insert(
            k.clone(),
            Baseline {
                key: k,
                total: stats.total,
                mean_daily: stats.mean,
                day_count: stats.days,
            },
        );
    }

    debug!(groups = entries.len(), "Baselines computed");

    Ok(BaselineTable {
        key: key.clone(),
        window,
        metric,
        entries,
    })
}

/// Expresses each period's mean daily metric as a ratio to the matching
/// baseline.
///
/// Groups are the baseline key prefixed with `Period`. A zero or absent
/// baseline leaves the proportion undefined and flags the row; it is never
/// reported as zero. Proportions are ranked within each period and every
/// non-column dimension of the key (calendar label, time block).
#[tracing::instrument(skip(records, baselines, calendar), fields(records = records.len()))]
pub fn proportion_of_baseline(
    records: &[LabeledRecord],
    baselines: &BaselineTable,
    calendar: &BusinessCalendar,
) -> Result<ProportionTable> {
    let mut dims = vec![Dimension::Period];
    dims.extend(baselines.key.dimensions().iter().cloned());
    let key = GroupKey::new(dims);

    let mut rows = Vec::new();
    for (k, stats) in daily_reduce(records, &key, baselines.metric)? {
        let month = MonthKey::parse(&k[0]);
        if let Some((start, end)) = month.and_then(|m| Some((m.first_day()?, m.next_first_day()?)))
        {
            check_days(&k, stats.days, max_days(&key, &k, calendar, start, end))?;
        }

        let baseline = baselines.get(&k[1..]).cloned();
        let (status, proportion) = match &baseline {
            None => (BaselineStatus::Missing, None),
            Some(b) if b.mean_daily == 0.0 => (BaselineStatus::Zero, None),
            Some(b) => (BaselineStatus::Present, Some(stats.mean / b.mean_daily)),
        };

        rows.push(ProportionRow {
            key: k,
            month_daily_avg: stats.mean,
            month_total: stats.total,
            month_day_count: stats.days,
            baseline,
            status,
            proportion,
            percentile: None,
        });
    }

    let undefined = rows.iter().filter(|r| r.proportion.is_none()).count();
    if undefined > 0 {
        warn!(undefined, "Rows without a usable baseline");
    }

    let partition: Vec<usize> = key
        .dimensions()
        .iter()
        .enumerate()
        .filter(|(_, d)| !matches!(d, Dimension::Column(_)))
        .map(|(i, _)| i)
        .collect();
    rank_partitions(
        &mut rows,
        |row| partition.iter().map(|&i| row.key[i].clone()).collect(),
        |row| row.proportion,
        |row, pct| row.percentile = pct,
    );

    Ok(ProportionTable {
        key,
        metric: baselines.metric,
        rows,
    })
}

impl ProportionTable {
    pub fn to_table(&self) -> Result<Table> {
        let mut columns: Vec<Column> = self
            .key
            .dimensions()
            .iter()
            .map(|d| Column::new(d.name(), d.role()))
            .collect();
        columns.extend([
            Column::new("month_label", ColumnRole::Label),
            Column::new("month_daily_avg", ColumnRole::Mean),
            Column::new("month_total", ColumnRole::Total),
            Column::new("month_day_count", ColumnRole::Count),
            Column::new("baseline_total", ColumnRole::Total),
            Column::new("baseline_mean", ColumnRole::Baseline),
            Column::new("baseline_days", ColumnRole::Count),
            Column::new("prop_return", ColumnRole::Proportion),
            Column::new("pctile_return", ColumnRole::Percentile),
            Column::new("baseline_status", ColumnRole::Label),
        ]);

        let mut table = Table::new(columns);
        for row in &self.rows {
            let label = MonthKey::parse(&row.key[0])
                .map(|m| m.label())
                .unwrap_or_default();
            let mut cells: Vec<Cell> = row.key.iter().map(Cell::text).collect();
            cells.extend([
                Cell::text(label),
                Cell::Number(row.month_daily_avg),
                Cell::Number(row.month_total),
                Cell::Number(row.month_day_count as f64),
                Cell::number(row.baseline.as_ref().map(|b| b.total)),
                Cell::number(row.baseline.as_ref().map(|b| b.mean_daily)),
                Cell::number(row.baseline.as_ref().map(|b| b.day_count as f64)),
                Cell::number(row.proportion),
                Cell::number(row.percentile),
                Cell::text(row.status.as_str()),
            ]);
            table.push_row(cells)?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RollupError;
    use crate::records::RideRecord;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn calendar() -> BusinessCalendar {
        BusinessCalendar::new(d(2019, 1, 1), d(2023, 12, 31))
    }

    fn rec(cal: &BusinessCalendar, date: NaiveDate, zip: &str, riders: f64) -> LabeledRecord {
        LabeledRecord {
            record: RideRecord::new(date, riders).with_dimension("ZIPCODE", zip),
            label: cal.classify(date),
            month: MonthKey::of(date),
            time_block: None,
            rider_type: None,
        }
    }

    fn peer_key() -> GroupKey {
        GroupKey::new(vec![
            Dimension::Column("ZIPCODE".into()),
            Dimension::CalendarLabel,
        ])
    }

    #[test]
    fn test_window_rules() {
        assert!(BaselineWindow::new(d(2019, 2, 1), d(2019, 1, 1)).is_err());
        let w = BaselineWindow::year(2019).unwrap();
        assert_eq!(w.days(), 365);
        assert!(w.contains(d(2019, 12, 31)));
        assert!(!w.contains(d(2020, 1, 1)));
    }

    #[test]
    fn test_two_stage_mean() {
        let cal = calendar();
        // two records on Jan 2 (summed first), one on Jan 3
        let recs = vec![
            rec(&cal, d(2019, 1, 2), "10001", 40.0),
            rec(&cal, d(2019, 1, 2), "10001", 60.0),
            rec(&cal, d(2019, 1, 3), "10001", 50.0),
            rec(&cal, d(2020, 1, 3), "10001", 999.0),
        ];
        let window = BaselineWindow::year(2019).unwrap();
        let t = compute_baselines(&recs, &peer_key(), Metric::Ridership, window, &cal).unwrap();

        let b = t.get(&["10001".to_string(), "Weekday".to_string()]).unwrap();
        assert_eq!(b.total, 150.0);
        assert_eq!(b.day_count, 2);
        assert_eq!(b.mean_daily, 75.0);
    }

    #[test]
    fn test_day_count_guard_without_label() {
        let cal = calendar();
        let key = GroupKey::new(vec![Dimension::Column("ZIPCODE".into())]);

        // without a calendar label the bound is the window length
        let recs = vec![rec(&cal, d(2019, 1, 2), "1", 1.0)];
        let window = BaselineWindow::new(d(2019, 1, 2), d(2019, 1, 3)).unwrap();
        let baselines = compute_baselines(&recs, &key, Metric::Ridership, window, &cal).unwrap();

        // 32 distinct days all bucketed into March
        let march = MonthKey::of(d(2023, 3, 1));
        let later: Vec<LabeledRecord> = (0..32)
            .map(|i| {
                let mut r = rec(&cal, d(2023, 3, 1) + chrono::Duration::days(i), "1", 1.0);
                r.month = march;
                r
            })
            .collect();
        let err = proportion_of_baseline(&later, &baselines, &cal).unwrap_err();
        assert!(matches!(
            err,
            RollupError::Consistency(ConsistencyError::DayCountExceeded { days: 32, max: 31, .. })
        ));
    }

    #[test]
    fn test_mislabeled_rows_exceed_day_count() {
        let cal = calendar();
        // every day of January 2019 forced to "Saturday": only 4 Saturdays exist
        let recs: Vec<LabeledRecord> = (1..=31)
            .map(|day| {
                let mut r = rec(&cal, d(2019, 1, day), "10001", 1.0);
                r.label = CalendarLabel::Saturday;
                r
            })
            .collect();
        let window = BaselineWindow::new(d(2019, 1, 1), d(2019, 2, 1)).unwrap();
        let err = compute_baselines(&recs, &peer_key(), Metric::Ridership, window, &cal)
            .unwrap_err();
        assert!(matches!(
            err,
            RollupError::Consistency(ConsistencyError::DayCountExceeded { days: 31, max: 4, .. })
        ));
    }

    #[test]
    fn test_period_in_baseline_key_rejected() {
        let cal = calendar();
        let key = GroupKey::new(vec![Dimension::Period]);
        let window = BaselineWindow::year(2019).unwrap();
        assert!(compute_baselines(&[], &key, Metric::Ridership, window, &cal).is_err());
    }

    #[test]
    fn test_proportion_flags_missing_and_zero_baselines() {
        let cal = calendar();
        let base = vec![
            rec(&cal, d(2019, 1, 2), "A", 100.0),
            rec(&cal, d(2019, 1, 2), "Z", 0.0),
        ];
        let window = BaselineWindow::year(2019).unwrap();
        let baselines =
            compute_baselines(&base, &peer_key(), Metric::Ridership, window, &cal).unwrap();

        let later = vec![
            rec(&cal, d(2023, 3, 1), "A", 60.0),
            rec(&cal, d(2023, 3, 2), "A", 80.0),
            rec(&cal, d(2023, 3, 1), "Z", 10.0),
            rec(&cal, d(2023, 3, 1), "N", 10.0),
        ];
        let t = proportion_of_baseline(&later, &baselines, &cal).unwrap();

        let by_zip = |zip: &str| t.rows.iter().find(|r| r.key[1] == zip).unwrap();
        assert_eq!(by_zip("A").proportion, Some(0.7));
        assert_eq!(by_zip("A").status, BaselineStatus::Present);
        assert_eq!(by_zip("A").percentile, Some(100.0));
        assert_eq!(by_zip("Z").proportion, None);
        assert_eq!(by_zip("Z").status, BaselineStatus::Zero);
        assert_eq!(by_zip("N").status, BaselineStatus::Missing);
        assert_eq!(by_zip("N").percentile, None);

        let table = t.to_table().unwrap();
        assert_eq!(table.column("prop_return").unwrap().role, ColumnRole::Proportion);
        let idx = table.column_index("prop_return").unwrap();
        assert!(table.rows().iter().filter(|r| r[idx].is_missing()).count() == 2);
    }

    proptest::proptest! {
        #[test]
        fn test_correctly_labeled_days_stay_within_bound(
            offsets in proptest::collection::vec(0i64..365, 1..120),
            zips in proptest::collection::vec(0u8..3, 1..120),
        ) {
            let cal = calendar();
            let start = d(2019, 1, 1);
            let recs: Vec<LabeledRecord> = offsets
                .iter()
                .zip(zips.iter().cycle())
                .map(|(off, zip)| rec(&cal, start + chrono::Duration::days(*off), &zip.to_string(), 1.0))
                .collect();

            let window = BaselineWindow::year(2019).unwrap();
            let t = compute_baselines(&recs, &peer_key(), Metric::Ridership, window, &cal).unwrap();
            for b in t.entries.values() {
                let label = CalendarLabel::parse(&b.key[1]).unwrap();
                proptest::prop_assert!(b.day_count <= cal.count_days(label, window.start, window.end));
            }
        }
    }
}
