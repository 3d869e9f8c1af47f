//! Ridership rollups: calendar labeling, grouping and shares, baselines and
//! proportions, time-block sweeps, period deltas, narrative facts and
//! dataset checks.
//!
//! Every stage works on labeled records or role-tagged [`types::Table`]s and
//! is a pure function of its inputs; the business-day calendar is built once
//! and passed in.

pub mod aggregate;
pub mod analyzer;
pub mod baseline;
pub mod calendar;
pub mod delta;
pub mod quality;
pub mod recode;
pub mod summary;
pub mod timeblocks;
pub mod types;
pub mod utility;
