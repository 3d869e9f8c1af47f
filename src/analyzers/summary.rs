//! Facts for narrative text, reduced from result tables.

use crate::analyzers::types::Table;
use crate::analyzers::utility::mean;
use crate::error::{Result, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Band within which the 3- and 6-period change means count as equal.
pub const STEADY_BAND: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub above: f64,
    pub below: f64,
    pub increase: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            above: 50.0,
            below: 25.0,
            increase: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThresholdCounts {
    pub above: usize,
    pub below: usize,
    pub decreased: usize,
    pub increased_at_least: usize,
}

/// Counts rows above `thresholds.above`, below `thresholds.below`, with a
/// negative change, and with a change of at least `thresholds.increase`.
/// Missing cells are not counted.
pub fn threshold_counts(
    table: &Table,
    value_col: &str,
    change_col: &str,
    thresholds: &Thresholds,
) -> Result<ThresholdCounts> {
    let values: Vec<f64> = table.numbers(value_col)?.into_iter().flatten().collect();
    let changes: Vec<f64> = table.numbers(change_col)?.into_iter().flatten().collect();

    Ok(ThresholdCounts {
        above: values.iter().filter(|v| **v > thresholds.above).count(),
        below: values.iter().filter(|v| **v < thresholds.below).count(),
        decreased: changes.iter().filter(|c| **c < 0.0).count(),
        increased_at_least: changes.iter().filter(|c| **c >= thresholds.increase).count(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extremes {
    pub min: f64,
    pub min_groups: Vec<String>,
    pub max: f64,
    pub max_groups: Vec<String>,
}

/// Smallest and largest value of `value_col`, with every group attaining
/// each. `None` when the column has no values.
pub fn extremes(table: &Table, group_col: &str, value_col: &str) -> Result<Option<Extremes>> {
    let group_idx = table.column_index(group_col)?;
    let values = table.numbers(value_col)?;

    let pairs: Vec<(String, f64)> = table
        .rows()
        .iter()
        .zip(values)
        .filter_map(|(row, v)| v.map(|v| (row[group_idx].key_string(), v)))
        .collect();
    if pairs.is_empty() {
        return Ok(None);
    }

    let min = pairs.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min);
    let max = pairs.iter().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max);
    let groups_at = |target: f64| -> Vec<String> {
        pairs
            .iter()
            .filter(|(_, v)| *v == target)
            .map(|(g, _)| g.clone())
            .collect()
    };

    Ok(Some(Extremes {
        min,
        min_groups: groups_at(min),
        max,
        max_groups: groups_at(max),
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Increased,
    Decreased,
    Steady,
}

impl Direction {
    /// Sign of a mean change; zero reads as an increase.
    fn of_change(change: f64) -> Self {
        if change >= 0.0 {
            Direction::Increased
        } else {
            Direction::Decreased
        }
    }

    /// Whether `difference` leaves the steady band.
    fn of_difference(difference: f64) -> Self {
        if difference > STEADY_BAND {
            Direction::Increased
        } else if difference < -STEADY_BAND {
            Direction::Decreased
        } else {
            Direction::Steady
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Increased => "increased",
            Direction::Decreased => "decreased",
            Direction::Steady => "remained steady",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSummary {
    pub latest_period: String,
    pub latest_mean: f64,
    pub last6_change: f64,
    pub last3_change: f64,
    pub last6_direction: Direction,
    pub last3_direction: Direction,
    /// `last3_change - last6_change`
    pub difference: f64,
    pub recent_trend: Direction,
}

/// Mean of `change_col` over rows whose period is in `periods`.
fn mean_change(table: &Table, period_idx: usize, change_idx: usize, periods: &[String]) -> f64 {
    let changes: Vec<f64> = table
        .rows()
        .iter()
        .filter(|row| periods.contains(&row[period_idx].key_string()))
        .filter_map(|row| row[change_idx].as_number())
        .collect();
    mean(&changes)
}

/// Summarizes the latest period's mean value and how the mean change over
/// the last 3 periods compares to the last 6. `None` on an empty table.
pub fn trend_summary(
    table: &Table,
    period_col: &str,
    value_col: &str,
    change_col: &str,
) -> Result<Option<TrendSummary>> {
    let period_idx = table.column_index(period_col)?;
    let value_idx = table.column_index(value_col)?;
    let change_idx = table.column_index(change_col)?;

    let periods = table.unique_values(period_col)?;
    let Some(latest) = periods.last().cloned() else {
        return Ok(None);
    };
    let tail = |n: usize| &periods[periods.len().saturating_sub(n)..];

    let last6 = mean_change(table, period_idx, change_idx, tail(6));
    let last3 = mean_change(table, period_idx, change_idx, tail(3));

    let latest_values: Vec<f64> = table
        .rows()
        .iter()
        .filter(|row| row[period_idx].key_string() == latest)
        .filter_map(|row| row[value_idx].as_number())
        .collect();

    let difference = last3 - last6;
    Ok(Some(TrendSummary {
        latest_period: latest,
        latest_mean: mean(&latest_values),
        last6_change: last6,
        last3_change: last3,
        last6_direction: Direction::of_change(last6),
        last3_direction: Direction::of_change(last3),
        difference,
        recent_trend: Direction::of_difference(difference),
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    /// Absolute gap between the two 6-period change means.
    pub difference: f64,
    pub higher: bool,
}

/// Compares a selection's 6-period change to the overall one.
pub fn compare_to_overall(selected: &TrendSummary, overall: &TrendSummary) -> Comparison {
    Comparison {
        difference: (selected.last6_change - overall.last6_change).abs(),
        higher: selected.last6_change > overall.last6_change,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockCounts {
    pub counts: BTreeMap<String, usize>,
    pub most: Vec<String>,
    pub fewest: Vec<String>,
}

/// Row count per time block. Blocks in `blocks` that never appear count as
/// zero; ties in `most` and `fewest` keep the order of `blocks`.
pub fn block_counts(table: &Table, block_col: &str, blocks: &[String]) -> Result<BlockCounts> {
    let idx = table.column_index(block_col)?;

    let mut counts: BTreeMap<String, usize> = blocks.iter().map(|b| (b.clone(), 0)).collect();
    for row in table.rows() {
        if !row[idx].is_missing() {
            *counts.entry(row[idx].key_string()).or_default() += 1;
        }
    }

    let order: Vec<String> = blocks
        .iter()
        .cloned()
        .chain(counts.keys().filter(|k| !blocks.contains(*k)).cloned())
        .collect();
    let hi = counts.values().copied().max().unwrap_or(0);
    let lo = counts.values().copied().min().unwrap_or(0);

    Ok(BlockCounts {
        most: order.iter().filter(|b| counts[*b] == hi).cloned().collect(),
        fewest: order.iter().filter(|b| counts[*b] == lo).cloned().collect(),
        counts,
    })
}

/// Joins items as an English list: `a`, `a and b`, `a, b, and c`.
pub fn commafy<S: AsRef<str>>(items: &[S]) -> Result<String> {
    let items: Vec<&str> = items.iter().map(AsRef::as_ref).collect();
    match items.as_slice() {
        [] => Err(ValidationError::EmptyList.into()),
        [one] => Ok(one.to_string()),
        [a, b] => Ok(format!("{a} and {b}")),
        [head @ .., last] => Ok(format!("{}, and {last}", head.join(", "))),
    }
}
