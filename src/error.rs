//! Error taxonomy for the rollup engine.
//!
//! [`ValidationError`] means the input does not match what the caller
//! declared (unmapped codes, mistyped or missing columns). [`ConsistencyError`]
//! means a computed result broke one of the engine's invariants. Both abort
//! the call. An undefined baseline ratio is not an error; it is carried as a
//! missing value in the output row.

use thiserror::Error;

/// Result type for rollup operations.
pub type Result<T> = std::result::Result<T, RollupError>;

#[derive(Debug, Error)]
pub enum RollupError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("consistency error: {0}")]
    Consistency(#[from] ConsistencyError),
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("codes not present in mapping `{mapping}`: {codes:?}")]
    UnmappedCodes { mapping: String, codes: Vec<String> },

    #[error("column `{0}` is not declared in the schema")]
    UndeclaredColumn(String),

    #[error("column `{column}` is declared {expected} but holds `{value}`")]
    ColumnType {
        column: String,
        expected: String,
        value: String,
    },

    #[error("record dated {date} has no value for `{column}`")]
    MissingValue { column: String, date: String },

    #[error("metric `{metric}` is not finite on {date}")]
    NonFiniteMetric { metric: String, date: String },

    #[error("date {date} lies outside the business calendar ({start} to {end})")]
    OutsideCalendar {
        date: String,
        start: String,
        end: String,
    },

    #[error("table has no column `{0}`")]
    UnknownColumn(String),

    #[error("row has {actual} cells, table has {expected} columns")]
    RowWidth { expected: usize, actual: usize },

    #[error("partition dimension `{0}` is not part of the grouping key")]
    PartitionNotInKey(String),

    #[error("grouping key is empty")]
    EmptyGroupKey,

    #[error("`{0}` cannot be part of a baseline key")]
    BaselineKeyDimension(String),

    #[error("list is empty")]
    EmptyList,

    #[error("invalid window: start {start} is not before end {end}")]
    InvalidWindow { start: String, end: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum ConsistencyError {
    #[error("share {share} for group {key:?} is outside [0, 100]")]
    ShareOutOfRange { key: Vec<String>, share: f64 },

    #[error("group {key:?} counts {days} days, at most {max} are possible")]
    DayCountExceeded {
        key: Vec<String>,
        days: usize,
        max: usize,
    },

    #[error("`{value}` maps to multiple categories: {categories:?}")]
    AmbiguousCategory {
        value: String,
        categories: Vec<String>,
    },

    #[error("tables to combine have different columns")]
    ColumnMismatch,
}
