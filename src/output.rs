//! Output formatting and persistence for result tables.
//!
//! Supports JSON logging, CSV files, and gzip-compressed CSV.
//! Numbers are rounded here and nowhere else, by column role.

use anyhow::Result;
use tracing::{debug, info};

use crate::analyzers::types::{Cell, ColumnRole, Table};
use csv::WriterBuilder;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::fs::File;
use std::io::Write;

/// Inserts thousands separators into the integer part of a formatted number.
fn group_thousands(formatted: &str) -> String {
    let (sign, unsigned) = match formatted.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", formatted),
    };
    let (int, frac) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };

    let mut grouped = String::with_capacity(int.len() + int.len() / 3);
    for (i, ch) in int.chars().enumerate() {
        if i > 0 && (int.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    match frac {
        Some(f) => format!("{sign}{grouped}.{f}"),
        None => format!("{sign}{grouped}"),
    }
}

/// Display form of a number for a column role.
pub fn format_number(value: f64, role: ColumnRole) -> String {
    let Some(decimals) = role.decimals() else {
        return value.to_string();
    };
    let mut s = format!("{value:.decimals$}");
    if s.starts_with('-') && s[1..].chars().all(|c| c == '0' || c == '.') {
        s.remove(0);
    }
    if role.grouped() {
        group_thousands(&s)
    } else {
        s
    }
}

pub fn format_cell(cell: &Cell, role: ColumnRole) -> String {
    match cell {
        Cell::Text(s) => s.clone(),
        Cell::Number(n) => format_number(*n, role),
        Cell::Missing => String::new(),
    }
}

fn raw_cell(cell: &Cell) -> String {
    match cell {
        Cell::Number(n) => n.to_string(),
        other => other.key_string(),
    }
}

/// Writes `table` as CSV. `formatted` rounds and groups numbers by role;
/// otherwise numbers keep full precision.
pub fn write_table<W: Write>(writer: W, table: &Table, formatted: bool, headers: bool) -> Result<()> {
    let mut wtr = WriterBuilder::new().has_headers(false).from_writer(writer);

    if headers {
        wtr.write_record(table.columns().iter().map(|c| c.name.as_str()))?;
    }
    for row in table.rows() {
        wtr.write_record(row.iter().zip(table.columns()).map(|(cell, col)| {
            if formatted {
                format_cell(cell, col.role)
            } else {
                raw_cell(cell)
            }
        }))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes `table` to a new CSV file at `path`, replacing any existing file.
pub fn write_csv(path: &str, table: &Table, formatted: bool) -> Result<()> {
    debug!(path, rows = table.len(), "Writing CSV");
    write_table(File::create(path)?, table, formatted, true)?;
    info!(path, rows = table.len(), "CSV written");
    Ok(())
}

/// Writes `table` as gzip-compressed CSV.
pub fn write_csv_gz(path: &str, table: &Table, formatted: bool) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    write_table(&mut encoder, table, formatted, true)?;
    let compressed = encoder.finish()?;

    std::fs::write(path, &compressed)?;
    info!(path, rows = table.len(), bytes = compressed.len(), "Gzipped CSV written");
    Ok(())
}

/// Logs any serializable value as pretty-printed JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
