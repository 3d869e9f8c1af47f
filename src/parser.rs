//! CSV readers for ridership records and generic datasets.

use crate::analyzers::types::{Cell, Column, ColumnRole, Table};
use crate::records::RideRecord;
use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::Path;
use tracing::debug;

const DATE: &str = "date";
const RIDERSHIP: &str = "ridership";
const TIME_BLOCK: &str = "time_block";
const FARE_CLASS: &str = "fare_class";
const RIDE_TYPE: &str = "ride_type";
const RIDER_TYPE: &str = "rider_type";
const REVENUE: &str = "revenue";

const RESERVED: [&str; 7] = [
    DATE, RIDERSHIP, TIME_BLOCK, FARE_CLASS, RIDE_TYPE, RIDER_TYPE, REVENUE,
];

/// Reads a file, gunzipping it when the name ends in `.gz`.
pub fn read_input(path: &str) -> Result<Vec<u8>> {
    let raw = std::fs::read(path).with_context(|| format!("reading {path}"))?;
    if Path::new(path).extension().and_then(|e| e.to_str()) == Some("gz") {
        let mut out = Vec::new();
        GzDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
        debug!(path, compressed = raw.len(), bytes = out.len(), "Input decompressed");
        return Ok(out);
    }
    Ok(raw)
}

fn field<'a>(headers: &StringRecord, row: &'a StringRecord, name: &str) -> Option<&'a str> {
    let idx = headers.iter().position(|h| h == name)?;
    row.get(idx).map(str::trim).filter(|v| !v.is_empty())
}

fn parse_num<T: std::str::FromStr>(value: Option<&str>, name: &str, line: usize) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .map(|v| v.parse::<T>())
        .transpose()
        .with_context(|| format!("line {line}: bad `{name}` value"))
}

/// Decodes ridership records from CSV bytes.
///
/// `date` (YYYY-MM-DD) and `ridership` are required. `time_block`,
/// `fare_class`, `ride_type`, `rider_type` and `revenue` are optional; every
/// other column is kept as a text dimension, so codes such as zip codes keep
/// their leading zeros.
pub fn parse_records(bytes: &[u8]) -> Result<Vec<RideRecord>> {
    let mut rdr = ReaderBuilder::new().trim(csv::Trim::Headers).from_reader(bytes);
    let headers = rdr.headers()?.clone();

    for required in [DATE, RIDERSHIP] {
        if !headers.iter().any(|h| h == required) {
            bail!("records file has no `{required}` column");
        }
    }
    let dims: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !RESERVED.contains(h))
        .map(|(i, h)| (i, h.to_string()))
        .collect();

    let mut records = Vec::new();
    for (n, row) in rdr.records().enumerate() {
        let row = row?;
        let line = n + 2;

        let date = field(&headers, &row, DATE)
            .with_context(|| format!("line {line}: missing date"))?;
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .with_context(|| format!("line {line}: bad date `{date}`"))?;
        let ridership = parse_num::<f64>(field(&headers, &row, RIDERSHIP), RIDERSHIP, line)?
            .with_context(|| format!("line {line}: missing ridership"))?;

        let mut record = RideRecord::new(date, ridership);
        record.time_block = field(&headers, &row, TIME_BLOCK).map(String::from);
        record.fare_class = parse_num(field(&headers, &row, FARE_CLASS), FARE_CLASS, line)?;
        record.ride_type = parse_num(field(&headers, &row, RIDE_TYPE), RIDE_TYPE, line)?;
        record.rider_type = field(&headers, &row, RIDER_TYPE).map(String::from);
        record.revenue = parse_num(field(&headers, &row, REVENUE), REVENUE, line)?;

        for (i, name) in &dims {
            if let Some(value) = row.get(*i).map(str::trim).filter(|v| !v.is_empty()) {
                record.dimensions.insert(name.clone(), value.to_string());
            }
        }
        records.push(record);
    }

    debug!(records = records.len(), dimensions = dims.len(), "Records parsed");
    Ok(records)
}

/// Reads any CSV into a [`Table`] for dataset checks.
///
/// Numeric-looking cells become numbers and empty cells become missing;
/// every column is tagged as a key.
pub fn parse_table(bytes: &[u8]) -> Result<Table> {
    let mut rdr = ReaderBuilder::new().trim(csv::Trim::All).from_reader(bytes);
    let columns = rdr
        .headers()?
        .iter()
        .map(|h| Column::new(h, ColumnRole::Key))
        .collect();

    let mut table = Table::new(columns);
    for row in rdr.records() {
        let cells = row?
            .iter()
            .map(|v| match v {
                "" => Cell::Missing,
                v => v
                    .parse::<f64>()
                    .map(Cell::Number)
                    .unwrap_or_else(|_| Cell::text(v)),
            })
            .collect();
        table.push_row(cells)?;
    }

    debug!(rows = table.len(), columns = table.columns().len(), "Table parsed");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    const SAMPLE: &str = "\
date,ZIPCODE,fare_class,time_block,ridership,revenue
2023-03-01,07030,500,2,120,
2023-03-01,10001,100,3,80.5,20.25
";

    #[test]
    fn test_parse_records() {
        let records = parse_records(SAMPLE.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.date, NaiveDate::from_ymd_opt(2023, 3, 1).unwrap());
        assert_eq!(first.dimension("ZIPCODE"), Some("07030"));
        assert_eq!(first.fare_class, Some(500));
        assert_eq!(first.time_block.as_deref(), Some("2"));
        assert_eq!(first.revenue, None);
        assert_eq!(first.rider_type().as_deref(), Some("OMNY"));

        assert_eq!(records[1].ridership, 80.5);
        assert_eq!(records[1].revenue, Some(20.25));
        assert!(records[1].dimension("ridership").is_none());
    }

    #[test]
    fn test_missing_required_column() {
        let err = parse_records(b"date,station\n2023-03-01,A\n").unwrap_err();
        assert!(err.to_string().contains("ridership"));
    }

    #[test]
    fn test_bad_values_report_line() {
        let err = parse_records(b"date,ridership\n2023-13-01,4\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));

        let err = parse_records(b"date,ridership,fare_class\n2023-03-01,4,abc\n").unwrap_err();
        assert!(err.to_string().contains("fare_class"));
    }

    #[test]
    fn test_parse_table_types_cells() {
        let t = parse_table(b"date,hour,name\n2023-03-01,5,\n").unwrap();
        assert_eq!(t.rows()[0][0], Cell::text("2023-03-01"));
        assert_eq!(t.rows()[0][1], Cell::Number(5.0));
        assert!(t.rows()[0][2].is_missing());
    }

    #[test]
    fn test_read_gzipped_input() {
        let path = format!("{}/ridership_rollup_input.csv.gz", std::env::temp_dir().display());
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(SAMPLE.as_bytes()).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let bytes = read_input(&path).unwrap();
        assert_eq!(parse_records(&bytes).unwrap().len(), 2);

        std::fs::remove_file(&path).unwrap();
    }
}
