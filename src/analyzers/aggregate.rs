use crate::analyzers::calendar::LabeledRecord;
use crate::analyzers::types::{Cell, Column, ColumnRole, Table};
use crate::analyzers::utility::percentile_ranks;
use crate::error::{ConsistencyError, Result, ValidationError};
use crate::records::{EMPLOYEE_RIDE_TYPE, Metric, RideRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

/// Shares may drift past the bounds by float noise, never by more.
const SHARE_TOLERANCE: f64 = 1e-9;

/// One element of a grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Month bucket, `YYYY-MM`.
    Period,
    CalendarLabel,
    TimeBlock,
    RiderType,
    Date,
    /// Named dimension column on the record (station, zip, route...).
    Column(String),
}

impl Dimension {
    /// Parses a configured column name.
    pub fn parse(name: &str) -> Self {
        match name {
            "period" => Dimension::Period,
            "calendar_label" => Dimension::CalendarLabel,
            "time_block" => Dimension::TimeBlock,
            "rider_type" => Dimension::RiderType,
            "date" => Dimension::Date,
            other => Dimension::Column(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Dimension::Period => "period",
            Dimension::CalendarLabel => "calendar_label",
            Dimension::TimeBlock => "time_block",
            Dimension::RiderType => "rider_type",
            Dimension::Date => "date",
            Dimension::Column(name) => name,
        }
    }

    pub fn role(&self) -> ColumnRole {
        match self {
            Dimension::Period => ColumnRole::Period,
            _ => ColumnRole::Key,
        }
    }

    /// Value of this dimension on a labeled record.
    pub fn value_of(&self, r: &LabeledRecord) -> Result<String> {
        let value = match self {
            Dimension::Period => Some(r.month.to_string()),
            Dimension::CalendarLabel => Some(r.label.to_string()),
            Dimension::TimeBlock => r.time_block.clone(),
            Dimension::RiderType => r.rider_type.clone(),
            Dimension::Date => Some(r.record.date.to_string()),
            Dimension::Column(name) => r.record.dimension(name).map(str::to_string),
        };

        value.ok_or_else(|| {
            ValidationError::MissingValue {
                column: self.name().to_string(),
                date: r.record.date.to_string(),
            }
            .into()
        })
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered grouping key; the last dimension is the finest partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey(Vec<Dimension>);

impl GroupKey {
    pub fn new(dimensions: Vec<Dimension>) -> Self {
        GroupKey(dimensions)
    }

    pub fn parse<S: AsRef<str>>(names: &[S]) -> Self {
        GroupKey(names.iter().map(|n| Dimension::parse(n.as_ref())).collect())
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The key with its last element dropped.
    pub fn parent(&self) -> GroupKey {
        let mut dims = self.0.clone();
        dims.pop();
        GroupKey(dims)
    }

    pub fn position(&self, dimension: &Dimension) -> Option<usize> {
        self.0.iter().position(|d| d == dimension)
    }

    pub fn contains(&self, dimension: &Dimension) -> bool {
        self.position(dimension).is_some()
    }

    /// Positions of `other`'s dimensions inside this key.
    pub fn positions_of(&self, other: &GroupKey) -> Result<Vec<usize>> {
        other
            .0
            .iter()
            .map(|d| {
                self.position(d)
                    .ok_or_else(|| ValidationError::PartitionNotInKey(d.to_string()).into())
            })
            .collect()
    }

    pub fn with(&self, dimension: Dimension) -> GroupKey {
        let mut dims = self.0.clone();
        dims.push(dimension);
        GroupKey(dims)
    }

    /// Values of every dimension on a record.
    pub fn values_of(&self, r: &LabeledRecord) -> Result<Vec<String>> {
        self.0.iter().map(|d| d.value_of(r)).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFn {
    #[default]
    Sum,
    Mean,
    Count,
}

/// Value a percentile rank is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankColumn {
    Value,
    Share,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollupRow {
    pub key: Vec<String>,
    pub value: f64,
    /// Records that contributed to `value`.
    pub count: usize,
    pub parent_total: Option<f64>,
    /// Percent of the parent total, 0–100.
    pub share: Option<f64>,
    pub percentile: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollupTable {
    pub key: GroupKey,
    pub metric: Metric,
    pub rows: Vec<RollupRow>,
}

/// Groups `records` by `key` and reduces `metric` with `agg`.
///
/// Rows come back ordered by key value; callers that display them should sort
/// by their own criteria.
pub fn rollup(
    records: &[LabeledRecord],
    key: &GroupKey,
    metric: Metric,
    agg: AggFn,
) -> Result<RollupTable> {
    if key.is_empty() {
        return Err(ValidationError::EmptyGroupKey.into());
    }

    let mut groups: BTreeMap<Vec<String>, (f64, usize)> = BTreeMap::new();
    for r in records {
        let entry = groups.entry(key.values_of(r)?).or_insert((0.0, 0));
        entry.0 += r.record.metric(metric);
        entry.1 += 1;
    }

    let rows = groups
        .into_iter()
        .map(|(k, (sum, count))| RollupRow {
            key: k,
            value: match agg {
                AggFn::Sum => sum,
                AggFn::Mean => sum / count as f64,
                AggFn::Count => count as f64,
            },
            count,
            parent_total: None,
            share: None,
            percentile: None,
        })
        .collect::<Vec<_>>();

    debug!(
        key = ?key.dimensions(),
        records = records.len(),
        groups = rows.len(),
        "Rollup computed"
    );

    Ok(RollupTable {
        key: key.clone(),
        metric,
        rows,
    })
}

/// Fills `parent_total` and `share` for every row.
///
/// The parent is the table key minus its last dimension. A share outside
/// [0, 100] means the parent total does not match its children and aborts
/// the call.
pub fn share_of_parent(mut table: RollupTable) -> Result<RollupTable> {
    let width = table.key.len().saturating_sub(1);

    let mut totals: HashMap<Vec<String>, f64> = HashMap::new();
    for row in &table.rows {
        *totals.entry(row.key[..width].to_vec()).or_default() += row.value;
    }

    for row in &mut table.rows {
        let total = totals[&row.key[..width]];
        row.parent_total = Some(total);
        row.share = if total == 0.0 {
            None
        } else {
            Some(row.value / total * 100.0)
        };

        if let Some(share) = row.share {
            if !(-SHARE_TOLERANCE..=100.0 + SHARE_TOLERANCE).contains(&share) {
                return Err(ConsistencyError::ShareOutOfRange {
                    key: row.key.clone(),
                    share,
                }
                .into());
            }
        }
    }

    Ok(table)
}

/// Ranks rows within each partition of `partition` (a subset of the table
/// key) by `column`, ties sharing the average rank.
pub fn percentile_rank(
    mut table: RollupTable,
    partition: &GroupKey,
    column: RankColumn,
) -> Result<RollupTable> {
    let positions = table.key.positions_of(partition)?;

    rank_partitions(
        &mut table.rows,
        |row| positions.iter().map(|&i| row.key[i].clone()).collect(),
        |row| match column {
            RankColumn::Value => Some(row.value),
            RankColumn::Share => row.share,
        },
        |row, pct| row.percentile = pct,
    );

    Ok(table)
}

/// Keeps rows whose finest (last) key value equals `category`.
///
/// Apply only after shares and ranks are computed: both are defined relative
/// to the unfiltered group.
pub fn filter_finest(mut table: RollupTable, category: &str) -> RollupTable {
    table
        .rows
        .retain(|row| row.key.last().map(String::as_str) == Some(category));
    table
}

/// Assigns percentile ranks to `rows` within partitions.
///
/// Rows whose value is `None` get no rank and do not count toward their
/// partition's size.
pub(crate) fn rank_partitions<T>(
    rows: &mut [T],
    partition_of: impl Fn(&T) -> Vec<String>,
    value_of: impl Fn(&T) -> Option<f64>,
    mut set: impl FnMut(&mut T, Option<f64>),
) {
    let mut members: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        if value_of(row).is_some() {
            members.entry(partition_of(row)).or_default().push(i);
        }
    }

    let mut ranks: Vec<Option<f64>> = vec![None; rows.len()];
    for idx in members.values() {
        let values: Vec<f64> = idx.iter().filter_map(|&i| value_of(&rows[i])).collect();
        for (&i, pct) in idx.iter().zip(percentile_ranks(&values)) {
            ranks[i] = Some(pct);
        }
    }

    for (row, pct) in rows.iter_mut().zip(ranks) {
        set(row, pct);
    }
}

impl RollupTable {
    /// Converts to a role-tagged [`Table`].
    pub fn to_table(&self) -> Result<Table> {
        let mut columns: Vec<Column> = self
            .key
            .dimensions()
            .iter()
            .map(|d| Column::new(d.name(), d.role()))
            .collect();
        columns.extend([
            Column::new(self.metric.name(), ColumnRole::Total),
            Column::new("record_count", ColumnRole::Count),
            Column::new("parent_total", ColumnRole::Total),
            Column::new("percent_use", ColumnRole::Percent),
            Column::new("percentile", ColumnRole::Percentile),
        ]);

        let mut table = Table::new(columns);
        for row in &self.rows {
            let mut cells: Vec<Cell> = row.key.iter().map(Cell::text).collect();
            cells.extend([
                Cell::Number(row.value),
                Cell::Number(row.count as f64),
                Cell::number(row.parent_total),
                Cell::number(row.share),
                Cell::number(row.percentile),
            ]);
            table.push_row(cells)?;
        }
        Ok(table)
    }
}

/// Drops employee rides and sums ridership and revenue over all remaining
/// attributes, so one row remains per date, time block, fare class and
/// dimension set.
pub fn collapse_ride_types(records: &[RideRecord]) -> Vec<RideRecord> {
    let mut groups: BTreeMap<_, RideRecord> = BTreeMap::new();

    for r in records {
        if r.ride_type == Some(EMPLOYEE_RIDE_TYPE) {
            continue;
        }

        let key = (
            r.date,
            r.time_block.clone(),
            r.fare_class,
            r.rider_type.clone(),
            r.dimensions.clone(),
        );
        let entry = groups.entry(key).or_insert_with(|| RideRecord {
            ride_type: None,
            ridership: 0.0,
            revenue: None,
            ..r.clone()
        });
        entry.ridership += r.ridership;
        if let Some(rev) = r.revenue {
            *entry.revenue.get_or_insert(0.0) += rev;
        }
    }

    let out: Vec<RideRecord> = groups.into_values().collect();
    debug!(input = records.len(), output = out.len(), "Ride types collapsed");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::calendar::{CalendarLabel, MonthKey};
    use crate::error::RollupError;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn rec(station: &str, rider_type: &str, riders: f64) -> LabeledRecord {
        let date = NaiveDate::from_ymd_opt(2023, 3, 1).unwrap();
        LabeledRecord {
            record: RideRecord::new(date, riders).with_dimension("station", station),
            label: CalendarLabel::Weekday,
            month: MonthKey::of(date),
            time_block: None,
            rider_type: Some(rider_type.to_string()),
        }
    }

    fn usage_key() -> GroupKey {
        GroupKey::new(vec![
            Dimension::Period,
            Dimension::Column("station".into()),
            Dimension::RiderType,
        ])
    }

    fn sample() -> Vec<LabeledRecord> {
        vec![
            rec("A", "OMNY", 30.0),
            rec("A", "OMNY", 10.0),
            rec("A", "MetroCard/Other", 60.0),
            rec("B", "OMNY", 25.0),
            rec("B", "MetroCard/Other", 75.0),
            rec("C", "OMNY", 50.0),
            rec("C", "MetroCard/Other", 50.0),
        ]
    }

    fn find<'a>(t: &'a RollupTable, key: &[&str]) -> &'a RollupRow {
        t.rows
            .iter()
            .find(|r| r.key.iter().map(String::as_str).eq(key.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_rollup_sum_mean_count() {
        let recs = sample();
        let key = usage_key();

        let sum = rollup(&recs, &key, Metric::Ridership, AggFn::Sum).unwrap();
        assert_eq!(sum.rows.len(), 6);
        assert_eq!(find(&sum, &["2023-03", "A", "OMNY"]).value, 40.0);

        let mean = rollup(&recs, &key, Metric::Ridership, AggFn::Mean).unwrap();
        assert_eq!(find(&mean, &["2023-03", "A", "OMNY"]).value, 20.0);

        let count = rollup(&recs, &key, Metric::Ridership, AggFn::Count).unwrap();
        assert_eq!(find(&count, &["2023-03", "A", "OMNY"]).value, 2.0);
    }

    #[test]
    fn test_rollup_missing_dimension_fails() {
        let mut recs = sample();
        recs[0].rider_type = None;
        let err = rollup(&recs, &usage_key(), Metric::Ridership, AggFn::Sum).unwrap_err();
        assert!(matches!(
            err,
            RollupError::Validation(ValidationError::MissingValue { .. })
        ));
    }

    #[test]
    fn test_empty_key_fails() {
        let err = rollup(&sample(), &GroupKey::new(vec![]), Metric::Ridership, AggFn::Sum);
        assert!(err.is_err());
    }

    #[test]
    fn test_share_of_parent() {
        let t = rollup(&sample(), &usage_key(), Metric::Ridership, AggFn::Sum).unwrap();
        let t = share_of_parent(t).unwrap();

        let a = find(&t, &["2023-03", "A", "OMNY"]);
        assert_eq!(a.parent_total, Some(100.0));
        assert_eq!(a.share, Some(40.0));
        assert_eq!(find(&t, &["2023-03", "B", "OMNY"]).share, Some(25.0));
    }

    proptest! {
        #[test]
        fn test_shares_sum_to_100_per_parent(
            rides in prop::collection::vec((0u8..4, 0u8..3, 1.0f64..1000.0), 1..40),
        ) {
            let recs: Vec<LabeledRecord> = rides
                .iter()
                .map(|(station, rider, riders)| {
                    rec(&format!("S{station}"), &format!("R{rider}"), *riders)
                })
                .collect();
            let t = rollup(&recs, &usage_key(), Metric::Ridership, AggFn::Sum).unwrap();
            let t = share_of_parent(t).unwrap();

            let mut sums: HashMap<Vec<String>, f64> = HashMap::new();
            for row in &t.rows {
                *sums.entry(row.key[..2].to_vec()).or_default() += row.share.unwrap();
            }
            for total in sums.values() {
                prop_assert!((total - 100.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_share_out_of_range_is_consistency_error() {
        let recs = vec![rec("A", "OMNY", 30.0), rec("A", "MetroCard/Other", -10.0)];
        let t = rollup(&recs, &usage_key(), Metric::Ridership, AggFn::Sum).unwrap();
        let err = share_of_parent(t).unwrap_err();
        assert!(matches!(
            err,
            RollupError::Consistency(ConsistencyError::ShareOutOfRange { .. })
        ));
    }

    #[test]
    fn test_zero_parent_gives_undefined_share() {
        let recs = vec![rec("A", "OMNY", 0.0), rec("A", "MetroCard/Other", 0.0)];
        let t = rollup(&recs, &usage_key(), Metric::Ridership, AggFn::Sum).unwrap();
        let t = share_of_parent(t).unwrap();
        assert!(t.rows.iter().all(|r| r.share.is_none()));
    }

    #[test]
    fn test_percentile_then_filter() {
        let key = usage_key();
        let t = rollup(&sample(), &key, Metric::Ridership, AggFn::Sum).unwrap();
        let t = share_of_parent(t).unwrap();
        let partition = GroupKey::new(vec![Dimension::Period, Dimension::RiderType]);
        let t = percentile_rank(t, &partition, RankColumn::Share).unwrap();
        let t = filter_finest(t, "OMNY");

        assert_eq!(t.rows.len(), 3);
        // OMNY shares: A 40, B 25, C 50
        assert!((find(&t, &["2023-03", "B", "OMNY"]).percentile.unwrap() - 100.0 / 3.0).abs() < 1e-9);
        assert!((find(&t, &["2023-03", "A", "OMNY"]).percentile.unwrap() - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(find(&t, &["2023-03", "C", "OMNY"]).percentile, Some(100.0));
    }

    #[test]
    fn test_partition_outside_key_fails() {
        let t = rollup(&sample(), &usage_key(), Metric::Ridership, AggFn::Sum).unwrap();
        let partition = GroupKey::new(vec![Dimension::TimeBlock]);
        assert!(percentile_rank(t, &partition, RankColumn::Value).is_err());
    }

    #[test]
    fn test_percentile_independent_of_row_order() {
        let key = usage_key();
        let partition = GroupKey::new(vec![Dimension::Period, Dimension::RiderType]);
        let mut recs = sample();

        let forward = percentile_rank(
            rollup(&recs, &key, Metric::Ridership, AggFn::Sum).unwrap(),
            &partition,
            RankColumn::Value,
        )
        .unwrap();
        recs.reverse();
        let backward = percentile_rank(
            rollup(&recs, &key, Metric::Ridership, AggFn::Sum).unwrap(),
            &partition,
            RankColumn::Value,
        )
        .unwrap();

        assert_eq!(forward, backward);
    }

    #[test]
    fn test_to_table_roles() {
        let t = share_of_parent(
            rollup(&sample(), &usage_key(), Metric::Ridership, AggFn::Sum).unwrap(),
        )
        .unwrap()
        .to_table()
        .unwrap();
        assert_eq!(t.column("period").unwrap().role, ColumnRole::Period);
        assert_eq!(t.column("percent_use").unwrap().role, ColumnRole::Percent);
        assert_eq!(t.len(), 6);
    }

    #[test]
    fn test_collapse_ride_types_drops_employees() {
        let date = NaiveDate::from_ymd_opt(2023, 3, 1).unwrap();
        let base = RideRecord::new(date, 0.0).with_dimension("ROUTE", "M15");
        let mut rides = vec![];
        for (ride_type, riders, revenue) in [(0, 5.0, 0.0), (1, 10.0, 27.5), (2, 4.0, 5.0)] {
            let mut r = base.clone();
            r.ride_type = Some(ride_type);
            r.ridership = riders;
            r.revenue = Some(revenue);
            rides.push(r);
        }

        let out = collapse_ride_types(&rides);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ridership, 14.0);
        assert_eq!(out[0].revenue, Some(32.5));
        assert_eq!(out[0].ride_type, None);
    }
}
