//! Tabular result model shared by every rollup stage.
//!
//! Each [`Column`] carries an explicit [`ColumnRole`] assigned when the table
//! is built, so formatting downstream is a lookup on the role rather than a
//! guess from the column name.

use crate::error::{ConsistencyError, Result, ValidationError};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// What a column holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    /// Grouping value such as a station or zip code.
    Key,
    /// Sortable period key (`YYYY-MM`).
    Period,
    Count,
    Total,
    Mean,
    Baseline,
    /// Percentage in 0–100.
    Percent,
    /// Ratio to a baseline.
    Proportion,
    Percentile,
    Change,
    /// Free text (flags, descriptions).
    Label,
}

impl ColumnRole {
    /// Decimal places used at the display boundary, `None` for text columns.
    pub fn decimals(&self) -> Option<usize> {
        match self {
            ColumnRole::Proportion | ColumnRole::Change => Some(2),
            ColumnRole::Percent | ColumnRole::Percentile => Some(1),
            ColumnRole::Count | ColumnRole::Total | ColumnRole::Mean | ColumnRole::Baseline => {
                Some(0)
            }
            ColumnRole::Key | ColumnRole::Period | ColumnRole::Label => None,
        }
    }

    /// Whether displayed numbers get thousands separators.
    pub fn grouped(&self) -> bool {
        !matches!(self, ColumnRole::Proportion)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    pub role: ColumnRole,
}

impl Column {
    pub fn new(name: &str, role: ColumnRole) -> Self {
        Column {
            name: name.to_string(),
            role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Text(String),
    Number(f64),
    Missing,
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn number(value: Option<f64>) -> Self {
        value.map_or(Cell::Missing, Cell::Number)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Missing)
    }

    /// Ordering used for sorting: missing first, then numbers, then text.
    fn sort_cmp(&self, other: &Cell) -> Ordering {
        match (self, other) {
            (Cell::Missing, Cell::Missing) => Ordering::Equal,
            (Cell::Missing, _) => Ordering::Less,
            (_, Cell::Missing) => Ordering::Greater,
            (Cell::Number(a), Cell::Number(b)) => a.total_cmp(b),
            (Cell::Number(_), Cell::Text(_)) => Ordering::Less,
            (Cell::Text(_), Cell::Number(_)) => Ordering::Greater,
            (Cell::Text(a), Cell::Text(b)) => a.cmp(b),
        }
    }

    /// Plain string form used for grouping and labels.
    pub fn key_string(&self) -> String {
        match self {
            Cell::Text(s) => s.clone(),
            Cell::Number(n) => n.to_string(),
            Cell::Missing => String::new(),
        }
    }
}

/// A result table: named, role-tagged columns and rows of cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Self {
        Table {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(ValidationError::RowWidth {
                expected: self.columns.len(),
                actual: row.len(),
            }
            .into());
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| ValidationError::UnknownColumn(name.to_string()).into())
    }

    pub fn column(&self, name: &str) -> Result<&Column> {
        let idx = self.column_index(name)?;
        Ok(&self.columns[idx])
    }

    /// Numeric value at (`row`, `column`), `None` if missing or text.
    pub fn number(&self, row: usize, column: usize) -> Option<f64> {
        self.rows.get(row)?.get(column)?.as_number()
    }

    /// All values of a numeric column, in row order.
    pub fn numbers(&self, name: &str) -> Result<Vec<Option<f64>>> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(|r| r[idx].as_number()).collect())
    }

    /// Appends a column; `values` must have one cell per row.
    pub fn add_column(&mut self, column: Column, values: Vec<Cell>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(ValidationError::RowWidth {
                expected: self.rows.len(),
                actual: values.len(),
            }
            .into());
        }
        self.columns.push(column);
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(())
    }

    /// Inserts a constant-valued column in front of the others.
    pub fn prepend_constant(&mut self, column: Column, value: Cell) {
        self.columns.insert(0, column);
        for row in &mut self.rows {
            row.insert(0, value.clone());
        }
    }

    /// Appends all rows of `other`. Both tables must have identical columns.
    pub fn append(&mut self, other: Table) -> Result<()> {
        if self.columns.is_empty() && self.rows.is_empty() {
            *self = other;
            return Ok(());
        }
        if self.columns != other.columns {
            return Err(ConsistencyError::ColumnMismatch.into());
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    /// Stable sort by the given columns, ascending.
    pub fn sort_by_columns(&mut self, names: &[&str]) -> Result<()> {
        let idx = names
            .iter()
            .map(|n| self.column_index(n))
            .collect::<Result<Vec<_>>>()?;

        self.rows.sort_by(|a, b| {
            idx.iter()
                .map(|&i| a[i].sort_cmp(&b[i]))
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        });
        Ok(())
    }

    /// Keeps rows whose `name` column equals `value`.
    pub fn filter_eq(&self, name: &str, value: &str) -> Result<Table> {
        let idx = self.column_index(name)?;
        Ok(Table {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .filter(|r| r[idx].as_text() == Some(value))
                .cloned()
                .collect(),
        })
    }

    /// Keeps rows whose `name` column is one of `values`.
    pub fn filter_in(&self, name: &str, values: &BTreeSet<String>) -> Result<Table> {
        let idx = self.column_index(name)?;
        Ok(Table {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .filter(|r| r[idx].as_text().is_some_and(|v| values.contains(v)))
                .cloned()
                .collect(),
        })
    }

    /// Sorted distinct text values of a column.
    pub fn unique_values(&self, name: &str) -> Result<Vec<String>> {
        let idx = self.column_index(name)?;
        let set: BTreeSet<String> = self
            .rows
            .iter()
            .filter(|r| !r[idx].is_missing())
            .map(|r| r[idx].key_string())
            .collect();
        Ok(set.into_iter().collect())
    }

    /// Composite text key of a row over several columns.
    pub(crate) fn row_key(&self, row: usize, idx: &[usize]) -> Vec<String> {
        idx.iter().map(|&i| self.rows[row][i].key_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        let mut t = Table::new(vec![
            Column::new("station", ColumnRole::Key),
            Column::new("riders", ColumnRole::Total),
        ]);
        t.push_row(vec![Cell::text("B"), Cell::Number(20.0)]).unwrap();
        t.push_row(vec![Cell::text("A"), Cell::Missing]).unwrap();
        t.push_row(vec![Cell::text("C"), Cell::Number(5.0)]).unwrap();
        t
    }

    #[test]
    fn test_push_row_rejects_wrong_width() {
        let mut t = sample();
        let err = t.push_row(vec![Cell::text("D")]).unwrap_err();
        assert!(err.to_string().contains("1 cells"));
    }

    #[test]
    fn test_unknown_column() {
        let t = sample();
        assert!(t.column_index("zip").is_err());
        assert_eq!(t.column_index("riders").unwrap(), 1);
    }

    #[test]
    fn test_sort_puts_missing_first() {
        let mut t = sample();
        t.sort_by_columns(&["riders"]).unwrap();
        let order: Vec<_> = t.rows().iter().map(|r| r[0].key_string()).collect();
        assert_eq!(order, vec!["A", "C", "B"]);
    }

    #[test]
    fn test_filter_and_unique() {
        let t = sample();
        assert_eq!(t.filter_eq("station", "C").unwrap().len(), 1);
        assert_eq!(t.unique_values("station").unwrap(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_append_requires_same_columns() {
        let mut t = sample();
        let other = Table::new(vec![Column::new("zip", ColumnRole::Key)]);
        assert!(t.append(other).is_err());

        let same = sample();
        t.append(same).unwrap();
        assert_eq!(t.len(), 6);
    }

    #[test]
    fn test_role_decimals() {
        assert_eq!(ColumnRole::Proportion.decimals(), Some(2));
        assert_eq!(ColumnRole::Percent.decimals(), Some(1));
        assert_eq!(ColumnRole::Mean.decimals(), Some(0));
        assert_eq!(ColumnRole::Key.decimals(), None);
    }
}
