//! Recoding of raw category codes into readable labels.

use crate::error::{ConsistencyError, Result, ValidationError};
use crate::records::RideRecord;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Which route-type mapping to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecodeMode {
    /// One-letter code to full label, e.g. `S` to `Select Bus Service`.
    Primary,
    /// Full label to abbreviation, e.g. `Select Bus Service` to `SBS`.
    Shorthand,
}

/// A fixed code→label mapping that refuses unknown codes.
#[derive(Debug, Clone, PartialEq)]
pub struct Recoder {
    name: String,
    mapping: BTreeMap<String, String>,
}

impl Recoder {
    pub fn new<K, V>(name: &str, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Recoder {
            name: name.to_string(),
            mapping: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn route_types(mode: RecodeMode) -> Self {
        match mode {
            RecodeMode::Primary => Recoder::new(
                "route_type",
                [
                    ("E", "Express"),
                    ("L", "Local / limited"),
                    ("S", "Select Bus Service"),
                ],
            ),
            RecodeMode::Shorthand => Recoder::new(
                "route_type_shorthand",
                [
                    ("Express", "Exp"),
                    ("Local / limited", "Local"),
                    ("Select Bus Service", "SBS"),
                ],
            ),
        }
    }

    /// Turnstile tour codes to time-of-day blocks.
    pub fn time_blocks() -> Self {
        Recoder::new(
            "time_block",
            [
                ("1", "12am-6am"),
                ("2", "6am-9am"),
                ("3", "9am-4pm"),
                ("4", "4pm-7pm"),
                ("5", "7pm-12am"),
            ],
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.mapping.keys().map(String::as_str)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.mapping.values().map(String::as_str)
    }

    pub fn recode(&self, code: &str) -> Result<&str> {
        self.mapping
            .get(code)
            .map(String::as_str)
            .ok_or_else(|| self.unmapped(vec![code.to_string()]))
    }

    /// Recodes every value, or reports all unmapped codes at once.
    pub fn recode_all<'a>(&self, codes: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>> {
        let codes: Vec<&str> = codes.into_iter().collect();

        let missing: BTreeSet<&str> = codes
            .iter()
            .copied()
            .filter(|c| !self.mapping.contains_key(*c))
            .collect();
        if !missing.is_empty() {
            return Err(self.unmapped(missing.into_iter().map(String::from).collect()));
        }

        Ok(codes
            .into_iter()
            .map(|c| self.mapping[c].clone())
            .collect())
    }

    /// The label→code mapping. Fails if two codes share a label.
    pub fn inverse(&self) -> Result<Recoder> {
        let mut by_label: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (code, label) in &self.mapping {
            by_label.entry(label).or_default().push(code);
        }

        if let Some((label, codes)) = by_label.iter().find(|(_, c)| c.len() > 1) {
            return Err(ConsistencyError::AmbiguousCategory {
                value: label.to_string(),
                categories: codes.iter().map(|c| c.to_string()).collect(),
            }
            .into());
        }

        Ok(Recoder::new(
            &format!("{}_inverse", self.name),
            self.mapping.iter().map(|(k, v)| (v.clone(), k.clone())),
        ))
    }

    /// Composes `self` with `next`: every label of `self` must be a code of `next`.
    pub fn then(&self, next: &Recoder) -> Result<Recoder> {
        let labels = next.recode_all(self.labels())?;
        Ok(Recoder::new(
            &format!("{}_{}", self.name, next.name),
            self.mapping.keys().cloned().zip(labels),
        ))
    }

    fn unmapped(&self, codes: Vec<String>) -> crate::error::RollupError {
        ValidationError::UnmappedCodes {
            mapping: self.name.clone(),
            codes,
        }
        .into()
    }
}

/// Verifies that every value of `key_column` carries exactly one value of
/// `category_column`.
pub fn check_one_category(
    records: &[RideRecord],
    key_column: &str,
    category_column: &str,
) -> Result<()> {
    let mut seen: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for r in records {
        if let (Some(k), Some(c)) = (r.dimension(key_column), r.dimension(category_column)) {
            seen.entry(k).or_default().insert(c);
        }
    }

    match seen.iter().find(|(_, cats)| cats.len() > 1) {
        Some((key, cats)) => Err(ConsistencyError::AmbiguousCategory {
            value: key.to_string(),
            categories: cats.iter().map(|c| c.to_string()).collect(),
        }
        .into()),
        None => Ok(()),
    }
}

/// Rewrites bus routes to carry their route type.
///
/// If `lookup` is given, the route type is first joined from it by route
/// (overriding any value on the record). The type code is then recoded to
/// its full label in `type_column` and to its shorthand in
/// `<type_column>_SHORT`, and the route becomes `"<shorthand>: <route>"`.
/// Returns new records; the input is not modified.
pub fn reclassify_routes(
    records: &[RideRecord],
    route_column: &str,
    type_column: &str,
    lookup: Option<&BTreeMap<String, String>>,
) -> Result<Vec<RideRecord>> {
    let primary = Recoder::route_types(RecodeMode::Primary);
    let shorthand = Recoder::route_types(RecodeMode::Shorthand);
    let short_column = format!("{type_column}_SHORT");

    let mut joined = Vec::with_capacity(records.len());
    for r in records {
        let route = required(r, route_column)?;
        let mut out = r.clone();
        if let Some(table) = lookup {
            match table.get(route) {
                Some(code) => {
                    out.dimensions.insert(type_column.to_string(), code.clone());
                }
                None => {
                    out.dimensions.remove(type_column);
                }
            }
        }
        joined.push(out);
    }
    check_one_category(&joined, route_column, type_column)?;

    let codes: Vec<&str> = joined
        .iter()
        .map(|r| required(r, type_column))
        .collect::<Result<_>>()?;
    let labels = primary.recode_all(codes)?;
    let shorts = shorthand.recode_all(labels.iter().map(String::as_str))?;

    let mut out = Vec::with_capacity(joined.len());
    for ((mut r, label), short) in joined.into_iter().zip(labels).zip(shorts) {
        let route = required(&r, route_column)?.to_string();
        r.dimensions
            .insert(route_column.to_string(), format!("{short}: {route}"));
        r.dimensions.insert(type_column.to_string(), label);
        r.dimensions.insert(short_column.clone(), short);
        out.push(r);
    }

    check_one_category(&out, route_column, type_column)?;
    debug!(records = out.len(), "Routes reclassified");
    Ok(out)
}

fn required<'a>(record: &'a RideRecord, column: &str) -> Result<&'a str> {
    record.dimension(column).ok_or_else(|| {
        ValidationError::MissingValue {
            column: column.to_string(),
            date: record.date.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RollupError;
    use chrono::NaiveDate;

    fn bus(route: &str, route_type: Option<&str>) -> RideRecord {
        let mut r = RideRecord::new(NaiveDate::from_ymd_opt(2023, 3, 1).unwrap(), 10.0)
            .with_dimension("ROUTE", route);
        if let Some(t) = route_type {
            r = r.with_dimension("ROUTE_TYPE", t);
        }
        r
    }

    #[test]
    fn test_recode_known_and_unknown() {
        let rc = Recoder::route_types(RecodeMode::Primary);
        assert_eq!(rc.recode("S").unwrap(), "Select Bus Service");

        let err = rc.recode("X").unwrap_err();
        assert!(matches!(
            err,
            RollupError::Validation(ValidationError::UnmappedCodes { .. })
        ));
    }

    #[test]
    fn test_recode_all_reports_every_missing_code() {
        let rc = Recoder::route_types(RecodeMode::Primary);
        let err = rc.recode_all(["E", "Q", "L", "Z", "Q"]).unwrap_err();
        match err {
            RollupError::Validation(ValidationError::UnmappedCodes { codes, .. }) => {
                assert_eq!(codes, vec!["Q", "Z"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_round_trip_through_inverse() {
        for rc in [
            Recoder::route_types(RecodeMode::Primary),
            Recoder::route_types(RecodeMode::Shorthand),
            Recoder::time_blocks(),
        ] {
            let inv = rc.inverse().unwrap();
            for code in rc.codes() {
                let label = rc.recode(code).unwrap();
                assert_eq!(inv.recode(label).unwrap(), code);
            }
        }
    }

    #[test]
    fn test_inverse_rejects_shared_labels() {
        let rc = Recoder::new("dup", [("A", "Same"), ("B", "Same")]);
        assert!(matches!(
            rc.inverse(),
            Err(RollupError::Consistency(ConsistencyError::AmbiguousCategory { .. }))
        ));
    }

    #[test]
    fn test_chain_primary_then_shorthand() {
        let chained = Recoder::route_types(RecodeMode::Primary)
            .then(&Recoder::route_types(RecodeMode::Shorthand))
            .unwrap();
        assert_eq!(chained.recode("S").unwrap(), "SBS");
        assert_eq!(chained.recode("L").unwrap(), "Local");

        let broken = Recoder::new("partial", [("E", "Express"), ("X", "Nope")]);
        assert!(broken.then(&Recoder::route_types(RecodeMode::Shorthand)).is_err());
    }

    #[test]
    fn test_reclassify_routes() {
        let records = vec![bus("M15", Some("S")), bus("Q10", Some("L"))];
        let out = reclassify_routes(&records, "ROUTE", "ROUTE_TYPE", None).unwrap();

        assert_eq!(out[0].dimension("ROUTE"), Some("SBS: M15"));
        assert_eq!(out[0].dimension("ROUTE_TYPE"), Some("Select Bus Service"));
        assert_eq!(out[0].dimension("ROUTE_TYPE_SHORT"), Some("SBS"));
        assert_eq!(out[1].dimension("ROUTE"), Some("Local: Q10"));
        // input untouched
        assert_eq!(records[0].dimension("ROUTE"), Some("M15"));
    }

    #[test]
    fn test_reclassify_with_lookup() {
        let lookup: BTreeMap<String, String> = [("BX12".to_string(), "S".to_string())].into();
        let out = reclassify_routes(&[bus("BX12", None)], "ROUTE", "ROUTE_TYPE", Some(&lookup))
            .unwrap();
        assert_eq!(out[0].dimension("ROUTE"), Some("SBS: BX12"));
    }

    #[test]
    fn test_reclassify_route_missing_from_lookup() {
        let lookup = BTreeMap::new();
        let err = reclassify_routes(&[bus("B6", Some("L"))], "ROUTE", "ROUTE_TYPE", Some(&lookup))
            .unwrap_err();
        assert!(matches!(err, RollupError::Validation(ValidationError::MissingValue { .. })));
    }

    #[test]
    fn test_reclassify_rejects_route_with_two_types() {
        let records = vec![bus("M15", Some("S")), bus("M15", Some("L"))];
        let err = reclassify_routes(&records, "ROUTE", "ROUTE_TYPE", None).unwrap_err();
        assert!(matches!(
            err,
            RollupError::Consistency(ConsistencyError::AmbiguousCategory { .. })
        ));
    }
}
