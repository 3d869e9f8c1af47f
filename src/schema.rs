//! Declared column types for grouping columns.
//!
//! Every named dimension used in a grouping key must be declared here before
//! aggregation. A value that does not fit its declared type, or a column that
//! was never declared, fails the call instead of silently widening or
//! splitting groups.

use crate::analyzers::aggregate::{Dimension, GroupKey};
use crate::analyzers::calendar::LabeledRecord;
use crate::error::{Result, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Any string; zip codes and route ids belong here.
    Text,
    /// Base-10 integer.
    Integer,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Text => f.write_str("text"),
            ColumnType::Integer => f.write_str("integer"),
        }
    }
}

impl ColumnType {
    /// Integers must be canonical; groups key on the raw string, so `07030`
    /// and `7030` would land in different groups.
    fn accepts(&self, value: &str) -> bool {
        match self {
            ColumnType::Text => true,
            ColumnType::Integer => value
                .parse::<i64>()
                .is_ok_and(|n| n.to_string() == value),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    columns: BTreeMap<String, ColumnType>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: &str, column_type: ColumnType) -> Self {
        self.columns.insert(name.to_string(), column_type);
        self
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns.get(name).copied()
    }

    /// Checks that every named column in `key` is declared, present on every
    /// record, and holds values of its declared type, and that metrics are
    /// finite.
    pub fn validate(&self, records: &[LabeledRecord], key: &GroupKey) -> Result<()> {
        let named: Vec<(&str, ColumnType)> = key
            .dimensions()
            .iter()
            .filter_map(|d| match d {
                Dimension::Column(name) => Some(name.as_str()),
                _ => None,
            })
            .map(|name| {
                self.column_type(name)
                    .map(|t| (name, t))
                    .ok_or_else(|| ValidationError::UndeclaredColumn(name.to_string()))
            })
            .collect::<std::result::Result<_, _>>()?;

        for r in records {
            for (name, column_type) in &named {
                let value =
                    r.record
                        .dimension(name)
                        .ok_or_else(|| ValidationError::MissingValue {
                            column: name.to_string(),
                            date: r.record.date.to_string(),
                        })?;
                if !column_type.accepts(value) {
                    return Err(ValidationError::ColumnType {
                        column: name.to_string(),
                        expected: column_type.to_string(),
                        value: value.to_string(),
                    }
                    .into());
                }
            }

            if !r.record.ridership.is_finite() || r.record.revenue.is_some_and(|v| !v.is_finite())
            {
                return Err(ValidationError::NonFiniteMetric {
                    metric: "ridership/revenue".to_string(),
                    date: r.record.date.to_string(),
                }
                .into());
            }
        }

        Ok(())
    }
}
