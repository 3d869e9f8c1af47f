//! Rollup configuration, read from a JSON file.
//!
//! Every field has a default, so a config file only needs the keys it
//! changes:
//! ```json
//! {
//!   "group_key": ["period", "ZIPCODE", "rider_type"],
//!   "peer_column": "ZIPCODE",
//!   "schema": { "ZIPCODE": "text" },
//!   "rider_type_filter": "OMNY"
//! }
//! ```

use crate::analyzers::aggregate::{AggFn, Dimension, GroupKey};
use crate::analyzers::baseline::BaselineWindow;
use crate::analyzers::calendar::CalendarLabel;
use crate::analyzers::quality::QualityConfig;
use crate::analyzers::recode::Recoder;
use crate::analyzers::summary::Thresholds;
use crate::records::Metric;
use crate::schema::Schema;
use anyhow::{Result, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Bus route reclassification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub route_column: String,
    pub type_column: String,
    /// Route to route-type code; overrides the type on the records.
    #[serde(default)]
    pub lookup: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    /// Dimension names, coarsest first. `period`, `calendar_label`,
    /// `time_block`, `rider_type` and `date` are derived; anything else names
    /// a record column.
    pub group_key: Vec<String>,
    pub agg_fn: AggFn,
    pub metric: Metric,
    /// Peer dimension baselines are computed for.
    pub peer_column: String,
    pub baseline_window: BaselineWindow,
    pub calendar_label_filter: BTreeSet<CalendarLabel>,
    /// Restricts both baseline and later records to these time blocks.
    pub time_block_subset: Option<BTreeSet<String>>,
    /// Adds the time block to the baseline grouping.
    pub include_time_blocks: bool,
    pub rider_type_filter: Option<String>,
    /// Time-block code to label.
    pub time_block_codes: BTreeMap<String, String>,
    /// Ordered block labels the combiner enumerates.
    pub time_blocks: Vec<String>,
    pub schema: Schema,
    /// Drop employee rides and sum over ride types first.
    pub collapse_ride_types: bool,
    pub routes: Option<RouteConfig>,
    pub thresholds: Thresholds,
    pub quality: QualityConfig,
}

impl Default for RollupConfig {
    fn default() -> Self {
        let blocks = Recoder::time_blocks();
        let start = NaiveDate::from_ymd_opt(2019, 1, 1).unwrap_or_default();
        let end = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default();

        RollupConfig {
            group_key: vec!["period".to_string(), "rider_type".to_string()],
            agg_fn: AggFn::Sum,
            metric: Metric::Ridership,
            peer_column: "ZIPCODE".to_string(),
            baseline_window: BaselineWindow { start, end },
            calendar_label_filter: CalendarLabel::working(),
            time_block_subset: None,
            include_time_blocks: false,
            rider_type_filter: None,
            time_block_codes: blocks
                .codes()
                .zip(blocks.labels())
                .map(|(c, l)| (c.to_string(), l.to_string()))
                .collect(),
            time_blocks: blocks.labels().map(String::from).collect(),
            schema: Schema::default(),
            collapse_ride_types: false,
            routes: None,
            thresholds: Thresholds::default(),
            quality: QualityConfig::default(),
        }
    }
}

impl RollupConfig {
    /// Loads and validates the config from a JSON file at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: RollupConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_key.is_empty() {
            bail!("group_key must name at least one dimension");
        }
        if self.calendar_label_filter.is_empty() {
            bail!("calendar_label_filter must keep at least one label");
        }
        self.baseline_window.validate()?;
        Ok(())
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey::parse(&self.group_key)
    }

    /// Peer dimension and calendar label, plus the time block when requested.
    pub fn baseline_key(&self) -> GroupKey {
        let mut dims = vec![
            Dimension::Column(self.peer_column.clone()),
            Dimension::CalendarLabel,
        ];
        if self.include_time_blocks {
            dims.push(Dimension::TimeBlock);
        }
        GroupKey::new(dims)
    }

    pub fn time_block_recoder(&self) -> Recoder {
        Recoder::new("time_block", self.time_block_codes.clone())
    }
}
