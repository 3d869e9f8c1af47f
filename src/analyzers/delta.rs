//! Period-over-period change.

use crate::analyzers::types::{Cell, Column, ColumnRole, Table};
use crate::error::Result;
use std::collections::HashMap;

/// Adds `prev_<col>` and `chng_<col>` for every column in `value_cols`.
///
/// Rows are stably sorted by `period_col` first; within each group of
/// `group_cols` the previous row's value becomes `prev_<col>` and the signed
/// difference becomes `chng_<col>`. The first period of a group has both
/// missing. A missing value on either side also yields a missing change.
pub fn add_deltas(
    table: &Table,
    group_cols: &[&str],
    period_col: &str,
    value_cols: &[&str],
) -> Result<Table> {
    let mut out = table.clone();
    out.sort_by_columns(&[period_col])?;

    let group_idx = group_cols
        .iter()
        .map(|c| out.column_index(c))
        .collect::<Result<Vec<_>>>()?;

    for col in value_cols {
        let value_idx = out.column_index(col)?;
        let role = out.columns()[value_idx].role;

        let mut last: HashMap<Vec<String>, Option<f64>> = HashMap::new();
        let mut prev_cells = Vec::with_capacity(out.len());
        let mut chng_cells = Vec::with_capacity(out.len());

        for row in 0..out.len() {
            let current = out.number(row, value_idx);
            let previous = last
                .insert(out.row_key(row, &group_idx), current)
                .flatten();

            prev_cells.push(Cell::number(previous));
            chng_cells.push(Cell::number(current.zip(previous).map(|(c, p)| c - p)));
        }

        out.add_column(Column::new(&format!("prev_{col}"), role), prev_cells)?;
        out.add_column(
            Column::new(&format!("chng_{col}"), ColumnRole::Change),
            chng_cells,
        )?;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RollupError, ValidationError};
    use proptest::prelude::*;

    fn table(rows: &[(&str, &str, f64)]) -> Table {
        let mut t = Table::new(vec![
            Column::new("period", ColumnRole::Period),
            Column::new("station", ColumnRole::Key),
            Column::new("percent_use", ColumnRole::Percent),
        ]);
        for (period, station, value) in rows {
            t.push_row(vec![Cell::text(*period), Cell::text(*station), Cell::Number(*value)])
                .unwrap();
        }
        t
    }

    #[test]
    fn test_first_period_is_missing() {
        let t = table(&[
            ("2023-02", "A", 40.0),
            ("2023-01", "A", 30.0),
            ("2023-01", "B", 10.0),
            ("2023-03", "A", 35.0),
        ]);
        let out = add_deltas(&t, &["station"], "period", &["percent_use"]).unwrap();

        let chng = out.numbers("chng_percent_use").unwrap();
        let prev = out.numbers("prev_percent_use").unwrap();
        // sorted: 01 A, 01 B, 02 A, 03 A
        assert_eq!(chng, vec![None, None, Some(10.0), Some(-5.0)]);
        assert_eq!(prev, vec![None, None, Some(30.0), Some(40.0)]);
        assert_eq!(
            out.column("chng_percent_use").unwrap().role,
            ColumnRole::Change
        );
        assert_eq!(
            out.column("prev_percent_use").unwrap().role,
            ColumnRole::Percent
        );
    }

    #[test]
    fn test_several_value_columns() {
        let mut t = table(&[("2023-01", "A", 1.0), ("2023-02", "A", 4.0)]);
        t.add_column(
            Column::new("riders", ColumnRole::Total),
            vec![Cell::Number(100.0), Cell::Number(90.0)],
        )
        .unwrap();

        let out = add_deltas(&t, &["station"], "period", &["percent_use", "riders"]).unwrap();
        assert_eq!(out.columns().len(), 8);
        assert_eq!(out.numbers("chng_riders").unwrap(), vec![None, Some(-10.0)]);
        // row identity unchanged
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_unknown_column_fails() {
        let t = table(&[("2023-01", "A", 1.0)]);
        let err = add_deltas(&t, &["zip"], "period", &["percent_use"]).unwrap_err();
        assert!(matches!(
            err,
            RollupError::Validation(ValidationError::UnknownColumn(_))
        ));
    }

    proptest! {
        #[test]
        fn test_delta_matches_difference_for_any_order(
            values in prop::collection::vec(-1000.0f64..1000.0, 2..24),
            seed in any::<u64>(),
        ) {
            let rows: Vec<(String, String, f64)> = values
                .iter()
                .enumerate()
                .map(|(i, v)| (format!("2023-{:02}", i / 2 + 1), format!("S{}", i % 2), *v))
                .collect();

            // rotate to scramble input order
            let shift = (seed % rows.len() as u64) as usize;
            let mut scrambled = rows.clone();
            scrambled.rotate_left(shift);
            let borrowed: Vec<(&str, &str, f64)> = scrambled
                .iter()
                .map(|(p, s, v)| (p.as_str(), s.as_str(), *v))
                .collect();

            let out = add_deltas(&table(&borrowed), &["station"], "period", &["percent_use"]).unwrap();
            let period = out.column_index("period").unwrap();
            let station = out.column_index("station").unwrap();
            let chng = out.column_index("chng_percent_use").unwrap();

            for (i, row) in out.rows().iter().enumerate() {
                let p = row[period].key_string();
                let s = row[station].key_string();
                let idx = rows.iter().position(|r| r.0 == p && r.1 == s).unwrap();
                let month: usize = p[5..].parse().unwrap();
                if month == 1 {
                    prop_assert!(row[chng].is_missing());
                } else {
                    let before = idx - 2;
                    prop_assert_eq!(out.number(i, chng), Some(rows[idx].2 - rows[before].2));
                }
            }
        }
    }
}
