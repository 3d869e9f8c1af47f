use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Fare-class codes at or above this value were paid with OMNY.
pub const OMNY_FARE_CLASS_MIN: i64 = 500;

/// Ride-type code for employee rides in bus farebox data.
pub const EMPLOYEE_RIDE_TYPE: i64 = 0;

/// One observed (or pre-aggregated) ridership count, as handed over by the loader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RideRecord {
    pub date: NaiveDate,
    /// Raw time-of-day block code, e.g. `"3"`.
    pub time_block: Option<String>,
    /// Raw fare-class code used to derive the rider type.
    pub fare_class: Option<i64>,
    /// Bus ride-type code; `0` is an employee ride.
    pub ride_type: Option<i64>,
    /// Pre-derived rider type; takes precedence over `fare_class`.
    pub rider_type: Option<String>,
    pub ridership: f64,
    pub revenue: Option<f64>,

    // station, zip, route, route type...
    pub dimensions: BTreeMap<String, String>,
}

impl RideRecord {
    pub fn new(date: NaiveDate, ridership: f64) -> Self {
        RideRecord {
            date,
            ridership,
            ..Default::default()
        }
    }

    /// Set a named dimension value
    pub fn with_dimension(mut self, name: &str, value: &str) -> Self {
        self.dimensions.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_time_block(mut self, code: &str) -> Self {
        self.time_block = Some(code.to_string());
        self
    }

    pub fn with_fare_class(mut self, code: i64) -> Self {
        self.fare_class = Some(code);
        self
    }

    pub fn with_rider_type(mut self, rider_type: &str) -> Self {
        self.rider_type = Some(rider_type.to_string());
        self
    }

    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions.get(name).map(String::as_str)
    }

    /// Rider type of this record: the pre-derived value if present, otherwise
    /// derived from the fare class.
    pub fn rider_type(&self) -> Option<String> {
        if let Some(r) = &self.rider_type {
            return Some(r.clone());
        }

        self.fare_class
            .map(|code| RiderType::from_fare_class(code).to_string())
    }

    pub fn metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Ridership => self.ridership,
            Metric::Revenue => self.revenue.unwrap_or(0.0),
        }
    }
}

/// Binary rider type derived from the fare-class code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RiderType {
    Omny,
    MetroCard,
}

impl RiderType {
    pub fn from_fare_class(code: i64) -> Self {
        if code >= OMNY_FARE_CLASS_MIN {
            RiderType::Omny
        } else {
            RiderType::MetroCard
        }
    }
}

impl fmt::Display for RiderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiderType::Omny => f.write_str("OMNY"),
            RiderType::MetroCard => f.write_str("MetroCard/Other"),
        }
    }
}

/// Numeric column a rollup reduces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Ridership,
    Revenue,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Ridership => "ridership",
            Metric::Revenue => "revenue",
        }
    }
}
