use crate::analyzers::aggregate::{
    Dimension, GroupKey, RankColumn, collapse_ride_types, filter_finest, percentile_rank, rollup,
    share_of_parent,
};
use crate::analyzers::baseline::{compute_baselines, proportion_of_baseline};
use crate::analyzers::calendar::{BusinessCalendar, LabeledRecord, LabeledSet};
use crate::analyzers::delta::add_deltas;
use crate::analyzers::recode::reclassify_routes;
use crate::analyzers::summary::{
    BlockCounts, Extremes, ThresholdCounts, TrendSummary, block_counts, extremes,
    threshold_counts, trend_summary,
};
use crate::analyzers::timeblocks::TimeBlockCombiner;
use crate::analyzers::types::Table;
use crate::config::RollupConfig;
use crate::error::Result;
use crate::records::RideRecord;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Applies the record-level rewrites the config asks for: ride-type
/// collapse, then route reclassification.
pub fn prepare(records: &[RideRecord], config: &RollupConfig) -> Result<Vec<RideRecord>> {
    let mut out = if config.collapse_ride_types {
        collapse_ride_types(records)
    } else {
        records.to_vec()
    };

    if let Some(routes) = &config.routes {
        out = reclassify_routes(
            &out,
            &routes.route_column,
            &routes.type_column,
            routes.lookup.as_ref(),
        )?;
    }

    Ok(out)
}

/// Labels `records` and keeps the configured calendar labels.
pub fn label(
    records: &[RideRecord],
    calendar: &BusinessCalendar,
    config: &RollupConfig,
) -> Result<Vec<LabeledRecord>> {
    let set = LabeledSet::label(records, calendar, &config.time_block_recoder())?;
    Ok(set.working_set(&config.calendar_label_filter))
}

/// Names of every key dimension except the period.
fn group_columns(key: &GroupKey) -> Vec<&str> {
    key.dimensions()
        .iter()
        .filter(|d| **d != Dimension::Period)
        .map(|d| d.name())
        .collect()
}

/// Share of each group in its parent, ranked within the period (or the
/// coarsest dimension when there is none) and the finest dimension.
///
/// The rider-type filter is applied last so shares and ranks keep the
/// unfiltered groups as their reference.
#[tracing::instrument(skip_all, fields(records = records.len()))]
pub fn usage_share(records: &[LabeledRecord], config: &RollupConfig) -> Result<Table> {
    let key = config.group_key();
    config.schema.validate(records, &key)?;

    let table = rollup(records, &key, config.metric, config.agg_fn)?;
    let table = share_of_parent(table)?;

    let dims = key.dimensions();
    let coarsest = if key.contains(&Dimension::Period) {
        Dimension::Period
    } else {
        dims[0].clone()
    };
    let mut partition = vec![coarsest];
    if let Some(last) = dims.last().filter(|d| !partition.contains(d)) {
        partition.push(last.clone());
    }
    let mut table = percentile_rank(table, &GroupKey::new(partition), RankColumn::Share)?;

    if let Some(rider) = &config.rider_type_filter {
        table = filter_finest(table, rider);
    }

    let mut out = table.to_table()?;
    if key.contains(&Dimension::Period) {
        out = add_deltas(&out, &group_columns(&key), "period", &["percent_use"])?;
    }

    info!(rows = out.len(), "Usage shares computed");
    Ok(out)
}

fn restrict(
    records: &[LabeledRecord],
    blocks: Option<&BTreeSet<String>>,
    rider: Option<&str>,
) -> Vec<LabeledRecord> {
    records
        .iter()
        .filter(|r| match blocks {
            Some(b) => r.time_block.as_ref().is_some_and(|t| b.contains(t)),
            None => true,
        })
        .filter(|r| rider.is_none() || r.rider_type.as_deref() == rider)
        .cloned()
        .collect()
}

/// Mean daily metric per peer group and period as a proportion of its
/// baseline mean.
#[tracing::instrument(skip_all, fields(records = records.len(), baseline = baseline.len()))]
pub fn ridership_return(
    records: &[LabeledRecord],
    baseline: &[LabeledRecord],
    config: &RollupConfig,
    calendar: &BusinessCalendar,
) -> Result<Table> {
    return_for_blocks(
        records,
        baseline,
        config,
        calendar,
        config.time_block_subset.as_ref(),
    )
}

fn return_for_blocks(
    records: &[LabeledRecord],
    baseline: &[LabeledRecord],
    config: &RollupConfig,
    calendar: &BusinessCalendar,
    blocks: Option<&BTreeSet<String>>,
) -> Result<Table> {
    let rider = config.rider_type_filter.as_deref();
    let current = restrict(records, blocks, rider);
    let base = restrict(baseline, blocks, rider);
    debug!(
        current = current.len(),
        baseline = base.len(),
        "Records restricted"
    );

    let key = config.baseline_key();
    config.schema.validate(&current, &key)?;
    config.schema.validate(&base, &key)?;

    let baselines = compute_baselines(
        &base,
        &key,
        config.metric,
        config.baseline_window,
        calendar,
    )?;
    let proportions = proportion_of_baseline(&current, &baselines, calendar)?;

    add_deltas(
        &proportions.to_table()?,
        &group_columns(&proportions.key),
        "period",
        &["prop_return", "month_daily_avg"],
    )
}

/// Runs the return pipeline once per partial time-block combination.
#[tracing::instrument(skip_all)]
pub fn time_groups(
    records: &[LabeledRecord],
    baseline: &[LabeledRecord],
    config: &RollupConfig,
    calendar: &BusinessCalendar,
) -> Result<Table> {
    let mut grouped = config.clone();
    grouped.include_time_blocks = false;

    TimeBlockCombiner::new(config.time_blocks.clone())
        .sweep(|blocks| return_for_blocks(records, baseline, &grouped, calendar, Some(blocks)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub latest_counts: ThresholdCounts,
    pub latest_extremes: Option<Extremes>,
    pub trend: Option<TrendSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReturnSummary {
    pub latest_extremes: Option<Extremes>,
    pub trend: Option<TrendSummary>,
    pub block_counts: Option<BlockCounts>,
}

fn latest_period(table: &Table) -> Result<Table> {
    match table.unique_values("period")?.last() {
        Some(latest) => table.filter_eq("period", latest),
        None => Ok(table.clone()),
    }
}

/// Narrative facts for a usage table.
pub fn summarize_usage(table: &Table, config: &RollupConfig) -> Result<UsageSummary> {
    let key = config.group_key();
    let group = group_columns(&key).first().copied().unwrap_or("period");
    let latest = latest_period(table)?;

    Ok(UsageSummary {
        latest_counts: threshold_counts(
            &latest,
            "percent_use",
            "chng_percent_use",
            &config.thresholds,
        )?,
        latest_extremes: extremes(&latest, group, "percent_use")?,
        trend: trend_summary(table, "period", "percent_use", "chng_percent_use")?,
    })
}

/// Narrative facts for a return table.
pub fn summarize_return(table: &Table, config: &RollupConfig) -> Result<ReturnSummary> {
    let latest = latest_period(table)?;
    let blocks = if table.column_index("time_block").is_ok() {
        Some(block_counts(&latest, "time_block", &config.time_blocks)?)
    } else {
        None
    };

    Ok(ReturnSummary {
        latest_extremes: extremes(&latest, &config.peer_column, "prop_return")?,
        trend: trend_summary(table, "period", "prop_return", "chng_prop_return")?,
        block_counts: blocks,
    })
}
