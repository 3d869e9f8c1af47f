//! Dataset checks run before a file is trusted for rollups.
//!
//! Each check returns a [`Finding`] when something is off and logs the
//! result either way. Checks never abort; only a malformed request (an
//! unknown column) is an error.

use crate::analyzers::types::Table;
use crate::analyzers::utility::{mean, sample_stddev};
use crate::error::Result;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Largest difference tolerated between a total and the sum of its parts.
pub const DERIVED_TOLERANCE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    /// The data is wrong as published.
    Issue,
    /// The data may be fine but deserves a look.
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub check: &'static str,
    pub column: Option<String>,
    pub message: String,
    /// Offending row indices.
    pub rows: Vec<usize>,
    /// Offending values that are not rows, such as missing dates.
    pub values: Vec<String>,
}

impl Finding {
    fn new(severity: Severity, check: &'static str, column: Option<&str>, message: String) -> Self {
        Finding {
            severity,
            check,
            column: column.map(String::from),
            message,
            rows: Vec::new(),
            values: Vec::new(),
        }
    }

    fn with_rows(mut self, rows: Vec<usize>) -> Self {
        self.rows = rows;
        self
    }

    fn with_values(mut self, values: Vec<String>) -> Self {
        self.values = values;
        self
    }
}

fn log_result(check: &str, column: &str, finding: Option<Finding>) -> Option<Finding> {
    match &finding {
        Some(f) => warn!(check, column, severity = ?f.severity, "{}", f.message),
        None => info!(check, column, "Check passed"),
    }
    finding
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    #[default]
    Daily,
    /// One row per month, dated the first.
    MonthStart,
}

/// Dates missing from the span of `dates` at the given frequency; for
/// monthly data, also dates whose day is not the first.
pub fn date_check(dates: &[NaiveDate], freq: Frequency) -> Vec<Finding> {
    let mut out = Vec::new();
    let (Some(&min), Some(&max)) = (dates.iter().min(), dates.iter().max()) else {
        return out;
    };

    let present: BTreeSet<NaiveDate> = match freq {
        Frequency::Daily => dates.iter().copied().collect(),
        Frequency::MonthStart => dates.iter().filter_map(|d| d.with_day(1)).collect(),
    };
    let expected: Vec<NaiveDate> = match freq {
        Frequency::Daily => min.iter_days().take_while(|d| *d <= max).collect(),
        Frequency::MonthStart => {
            let mut months = Vec::new();
            let mut cur = min.with_day(1);
            let last = max.with_day(1);
            while let (Some(c), Some(l)) = (cur, last) {
                if c > l {
                    break;
                }
                months.push(c);
                cur = c.checked_add_months(chrono::Months::new(1));
            }
            months
        }
    };

    let missing: Vec<String> = expected
        .iter()
        .filter(|d| !present.contains(d))
        .map(|d| d.to_string())
        .collect();
    if !missing.is_empty() {
        out.push(
            Finding::new(
                Severity::Warning,
                "missing_dates",
                Some("date"),
                format!("{} {:?} dates missing between {min} and {max}", missing.len(), freq),
            )
            .with_values(missing),
        );
    }

    if freq == Frequency::MonthStart {
        let rows: Vec<usize> = dates
            .iter()
            .enumerate()
            .filter(|(_, d)| d.day() != 1)
            .map(|(i, _)| i)
            .collect();
        if !rows.is_empty() {
            out.push(
                Finding::new(
                    Severity::Issue,
                    "month_start",
                    Some("date"),
                    format!("{} monthly dates do not fall on the first", rows.len()),
                )
                .with_rows(rows),
            );
        }
    }

    for f in &out {
        warn!(check = f.check, "{}", f.message);
    }
    if out.is_empty() {
        info!(check = "dates", "Check passed");
    }
    out
}

/// Flags separate year or month columns, which should be a single date.
pub fn column_names_check(table: &Table) -> Option<Finding> {
    let redundant: Vec<String> = table
        .columns()
        .iter()
        .map(|c| c.name.to_lowercase())
        .filter(|n| n == "year" || n == "month")
        .collect();

    let finding = (!redundant.is_empty()).then(|| {
        Finding::new(
            Severity::Issue,
            "column_names",
            None,
            "separate month or year columns present; use one date column".to_string(),
        )
        .with_values(redundant)
    });
    log_result("column_names", "*", finding)
}

/// Rows of a numeric column below `min` or above `max`.
pub fn range_check(
    table: &Table,
    column: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<Option<Finding>> {
    let rows: Vec<usize> = table
        .numbers(column)?
        .iter()
        .enumerate()
        .filter(|(_, v)| {
            v.is_some_and(|v| min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m))
        })
        .map(|(i, _)| i)
        .collect();

    let finding = (!rows.is_empty()).then(|| {
        Finding::new(
            Severity::Issue,
            "range",
            Some(column),
            format!(
                "{} rows outside expected range [{}, {}]",
                rows.len(),
                min.map_or("-".to_string(), |m| m.to_string()),
                max.map_or("-".to_string(), |m| m.to_string()),
            ),
        )
        .with_rows(rows)
    });
    Ok(log_result("range", column, finding))
}

/// Hours of the day must be 0 through 23.
pub fn hour_check(table: &Table, column: &str) -> Result<Option<Finding>> {
    range_check(table, column, Some(0.0), Some(23.0))
}

/// Values outside `expected`. Without an expected set the column's distinct
/// values are reported so one can be defined.
pub fn category_check(
    table: &Table,
    column: &str,
    expected: Option<&BTreeSet<String>>,
) -> Result<Option<Finding>> {
    let idx = table.column_index(column)?;

    let finding = match expected {
        None => Some(
            Finding::new(
                Severity::Issue,
                "categories",
                Some(column),
                "no expected categories defined".to_string(),
            )
            .with_values(table.unique_values(column)?),
        ),
        Some(expected) => {
            let rows: Vec<usize> = table
                .rows()
                .iter()
                .enumerate()
                .filter(|(_, r)| !r[idx].is_missing() && !expected.contains(&r[idx].key_string()))
                .map(|(i, _)| i)
                .collect();
            let unexpected: BTreeSet<String> = rows
                .iter()
                .map(|&i| table.rows()[i][idx].key_string())
                .collect();

            (!rows.is_empty()).then(|| {
                Finding::new(
                    Severity::Issue,
                    "categories",
                    Some(column),
                    format!("{} rows hold unexpected categories", rows.len()),
                )
                .with_rows(rows)
                .with_values(unexpected.into_iter().collect())
            })
        }
    };
    Ok(log_result("categories", column, finding))
}

/// Values more than `n_std` sample standard deviations from the mean.
pub fn outlier_check(table: &Table, column: &str, n_std: f64) -> Result<Option<Finding>> {
    let values = table.numbers(column)?;
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    let mu = mean(&present);
    let sd = sample_stddev(&present, mu);
    let (lo, hi) = (mu - n_std * sd, mu + n_std * sd);

    let rows: Vec<usize> = values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_some_and(|v| v < lo || v > hi))
        .map(|(i, _)| i)
        .collect();

    let finding = (!rows.is_empty()).then(|| {
        Finding::new(
            Severity::Warning,
            "outliers",
            Some(column),
            format!(
                "{} outliers; mean {mu:.2}, std dev {sd:.2}, bounds ({lo:.2}, {hi:.2})",
                rows.len()
            ),
        )
        .with_rows(rows)
    });
    Ok(log_result("outliers", column, finding))
}

/// Rows with a missing value in any of `columns` (every column when `None`).
pub fn missing_check(table: &Table, columns: Option<&[String]>) -> Result<Option<Finding>> {
    let names: Vec<String> = match columns {
        Some(c) => c.to_vec(),
        None => table.columns().iter().map(|c| c.name.clone()).collect(),
    };
    let idx = names
        .iter()
        .map(|n| table.column_index(n))
        .collect::<Result<Vec<_>>>()?;

    let mut per_column: BTreeMap<&str, usize> = BTreeMap::new();
    let mut rows = Vec::new();
    for (r, row) in table.rows().iter().enumerate() {
        let mut any = false;
        for (name, &i) in names.iter().zip(&idx) {
            if row[i].is_missing() {
                *per_column.entry(name.as_str()).or_default() += 1;
                any = true;
            }
        }
        if any {
            rows.push(r);
        }
    }

    let finding = (!rows.is_empty()).then(|| {
        Finding::new(
            Severity::Warning,
            "missing_values",
            None,
            format!("{} rows with missing values", rows.len()),
        )
        .with_rows(rows)
        .with_values(per_column.iter().map(|(c, n)| format!("{c}: {n}")).collect())
    });
    Ok(log_result("missing_values", "*", finding))
}

/// Rows where `total` differs from the sum of `parts` by more than
/// [`DERIVED_TOLERANCE`].
pub fn total_derived_check(table: &Table, parts: &[String], total: &str) -> Result<Option<Finding>> {
    let totals = table.numbers(total)?;
    let part_values = parts
        .iter()
        .map(|p| table.numbers(p))
        .collect::<Result<Vec<_>>>()?;

    let rows: Vec<usize> = (0..table.len())
        .filter(|&r| {
            let sum: Option<f64> = part_values.iter().map(|col| col[r]).sum();
            matches!((sum, totals[r]), (Some(s), Some(t)) if (s - t).abs() > DERIVED_TOLERANCE)
        })
        .collect();

    let finding = (!rows.is_empty()).then(|| {
        Finding::new(
            Severity::Issue,
            "derived_total",
            Some(total),
            format!("{} rows where {total} is not the sum of {parts:?}", rows.len()),
        )
        .with_rows(rows)
    });
    Ok(log_result("derived_total", total, finding))
}

/// Rows where a component exceeds its total, one finding per component.
pub fn component_check(table: &Table, total: &str, components: &[String]) -> Result<Vec<Finding>> {
    let totals = table.numbers(total)?;
    let mut out = Vec::new();

    for comp in components {
        let values = table.numbers(comp)?;
        let rows: Vec<usize> = values
            .iter()
            .zip(&totals)
            .enumerate()
            .filter(|(_, (v, t))| matches!((v, t), (Some(v), Some(t)) if v > t))
            .map(|(i, _)| i)
            .collect();

        let finding = (!rows.is_empty()).then(|| {
            Finding::new(
                Severity::Issue,
                "component",
                Some(comp),
                format!("{} rows where {comp} exceeds {total}", rows.len()),
            )
            .with_rows(rows)
        });
        out.extend(log_result("component", comp, finding));
    }
    Ok(out)
}

/// Range bounds for one column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotalSpec {
    pub total: String,
    pub parts: Vec<String>,
}

/// Which checks to run on a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub date_column: String,
    pub frequency: Frequency,
    pub ranges: BTreeMap<String, Bounds>,
    pub hour_columns: Vec<String>,
    pub categories: BTreeMap<String, BTreeSet<String>>,
    pub outlier_columns: Vec<String>,
    pub outlier_std: f64,
    /// Columns where no value may be missing; every column when `None`.
    pub no_missing: Option<Vec<String>>,
    pub totals: Vec<TotalSpec>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        QualityConfig {
            date_column: "date".to_string(),
            frequency: Frequency::Daily,
            ranges: BTreeMap::new(),
            hour_columns: Vec::new(),
            categories: BTreeMap::new(),
            outlier_columns: Vec::new(),
            outlier_std: 3.0,
            no_missing: None,
            totals: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityReport {
    pub findings: Vec<Finding>,
}

impl QualityReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn issues(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Issue)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Warning)
    }
}

/// Runs every configured check over `table`.
#[tracing::instrument(skip_all, fields(rows = table.len()))]
pub fn run_checks(table: &Table, config: &QualityConfig) -> Result<QualityReport> {
    let mut report = QualityReport::default();
    report.findings.extend(column_names_check(table));

    let idx = table.column_index(&config.date_column)?;
    let mut dates = Vec::with_capacity(table.len());
    let mut unparsed = Vec::new();
    for (i, row) in table.rows().iter().enumerate() {
        match NaiveDate::parse_from_str(&row[idx].key_string(), "%Y-%m-%d") {
            Ok(d) => dates.push(d),
            Err(_) => unparsed.push(i),
        }
    }
    if !unparsed.is_empty() {
        let f = Finding::new(
            Severity::Issue,
            "date_format",
            Some(config.date_column.as_str()),
            format!("{} values are not YYYY-MM-DD dates", unparsed.len()),
        )
        .with_rows(unparsed);
        warn!(check = f.check, "{}", f.message);
        report.findings.push(f);
    }
    report.findings.extend(date_check(&dates, config.frequency));

    for (column, bounds) in &config.ranges {
        report
            .findings
            .extend(range_check(table, column, bounds.min, bounds.max)?);
    }
    for column in &config.hour_columns {
        report.findings.extend(hour_check(table, column)?);
    }
    for (column, expected) in &config.categories {
        report
            .findings
            .extend(category_check(table, column, Some(expected))?);
    }
    for column in &config.outlier_columns {
        report
            .findings
            .extend(outlier_check(table, column, config.outlier_std)?);
    }
    report
        .findings
        .extend(missing_check(table, config.no_missing.as_deref())?);
    for totals in &config.totals {
        report
            .findings
            .extend(total_derived_check(table, &totals.parts, &totals.total)?);
        report
            .findings
            .extend(component_check(table, &totals.total, &totals.parts)?);
    }

    info!(
        issues = report.issues().count(),
        warnings = report.warnings().count(),
        "Quality checks complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::types::{Cell, Column, ColumnRole};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn table() -> Table {
        let mut t = Table::new(vec![
            Column::new("date", ColumnRole::Key),
            Column::new("fare_class", ColumnRole::Key),
            Column::new("omny", ColumnRole::Total),
            Column::new("metrocard", ColumnRole::Total),
            Column::new("total", ColumnRole::Total),
        ]);
        let rows = [
            ("2023-03-01", "A", Some(10.0), Some(5.0), Some(15.0)),
            ("2023-03-02", "B", Some(20.0), Some(5.0), Some(25.0)),
            ("2023-03-04", "Z", Some(30.0), None, Some(20.0)),
        ];
        for (date, fare, a, b, tot) in rows {
            t.push_row(vec![
                Cell::text(date),
                Cell::text(fare),
                Cell::number(a),
                Cell::number(b),
                Cell::number(tot),
            ])
            .unwrap();
        }
        t
    }

    #[test]
    fn test_daily_missing_dates() {
        let found = date_check(&[d(2023, 3, 1), d(2023, 3, 4)], Frequency::Daily);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].values, vec!["2023-03-02", "2023-03-03"]);
    }

    #[test]
    fn test_monthly_dates() {
        let found = date_check(&[d(2023, 1, 1), d(2023, 3, 1)], Frequency::MonthStart);
        assert_eq!(found[0].values, vec!["2023-02-01"]);

        let found = date_check(&[d(2023, 1, 1), d(2023, 2, 15)], Frequency::MonthStart);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].check, "month_start");
        assert_eq!(found[0].rows, vec![1]);
    }

    #[test]
    fn test_range_and_categories() {
        let t = table();
        let f = range_check(&t, "omny", Some(0.0), Some(25.0)).unwrap().unwrap();
        assert_eq!(f.rows, vec![2]);
        assert!(range_check(&t, "omny", None, None).unwrap().is_none());

        let expected: BTreeSet<String> = ["A", "B"].iter().map(|s| s.to_string()).collect();
        let f = category_check(&t, "fare_class", Some(&expected)).unwrap().unwrap();
        assert_eq!(f.values, vec!["Z"]);
        let f = category_check(&t, "fare_class", None).unwrap().unwrap();
        assert_eq!(f.values.len(), 3);
    }

    #[test]
    fn test_outliers() {
        let mut t = Table::new(vec![Column::new("v", ColumnRole::Total)]);
        for v in [10.0, 11.0, 9.0, 10.0, 10.0, 11.0, 9.0, 10.0, 10.0, 100.0] {
            t.push_row(vec![Cell::Number(v)]).unwrap();
        }
        let f = outlier_check(&t, "v", 2.0).unwrap().unwrap();
        assert_eq!(f.rows, vec![9]);
        assert!(outlier_check(&t, "v", 10.0).unwrap().is_none());
    }

    #[test]
    fn test_missing_and_derived() {
        let t = table();
        let f = missing_check(&t, None).unwrap().unwrap();
        assert_eq!(f.rows, vec![2]);
        assert_eq!(f.values, vec!["metrocard: 1"]);

        let parts = vec!["omny".to_string(), "metrocard".to_string()];
        // row 2 has a missing part and is skipped
        assert!(total_derived_check(&t, &parts, "total").unwrap().is_none());

        let found = component_check(&t, "total", &parts).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].column.as_deref(), Some("omny"));
        assert_eq!(found[0].rows, vec![2]);
    }

    #[test]
    fn test_run_checks_report() {
        let t = table();
        let config = QualityConfig {
            no_missing: Some(vec!["omny".to_string()]),
            ..QualityConfig::default()
        };
        let report = run_checks(&t, &config).unwrap();
        // only the 2023-03-03 gap
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.warnings().count(), 1);
        assert!(!report.is_clean());

        let bad = QualityConfig {
            date_column: "day".to_string(),
            ..QualityConfig::default()
        };
        assert!(run_checks(&t, &bad).is_err());
    }

    #[test]
    fn test_year_column_flagged() {
        let t = Table::new(vec![Column::new("Year", ColumnRole::Key)]);
        assert!(column_names_check(&t).is_some());
    }
}
