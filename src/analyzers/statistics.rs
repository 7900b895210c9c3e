use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::models::{MatchedRecord, MatchedTable, Season};
use crate::utils::constants::{DEFAULT_MIN_OBS, MODEL_COLUMN, UNKNOWN};

/// How matched pairs are grouped before computing metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Location,
    Region,
    All,
}

impl GroupBy {
    fn key(&self, record: &MatchedRecord) -> String {
        match self {
            GroupBy::Location => record.observation.location.clone(),
            GroupBy::Region => record
                .region
                .as_ref()
                .map(|r| r.region.clone())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            GroupBy::All => "all".to_string(),
        }
    }
}

/// Agreement metrics of one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRow {
    pub group: String,
    pub n: usize,
    pub obs_mean: f64,
    pub mod_mean: f64,
    pub bias: f64,
    pub rmse: f64,
    pub nmb: f64,
    pub ioa: f64,
    pub r2: f64,
}

impl fmt::Display for StatsRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<20} n={:<6} obs={:>9.3} mod={:>9.3} bias={:>8.3} rmse={:>8.3} nmb={:>7.3} ioa={:>6.3} r2={:>6.3}",
            self.group, self.n, self.obs_mean, self.mod_mean, self.bias, self.rmse, self.nmb, self.ioa, self.r2
        )
    }
}

/// Collects (model, observation) pairs and reduces them in two passes:
/// sums first, then deviations from the group means
#[derive(Debug, Clone, Default)]
pub struct PairAccumulator {
    pairs: Vec<(f64, f64)>,
}

impl PairAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, model: f64, obs: f64) {
        self.pairs.push((model, obs));
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn finish(&self, group: impl Into<String>) -> Option<StatsRow> {
        if self.pairs.is_empty() {
            return None;
        }
        let n = self.pairs.len() as f64;

        let mut sum_mod = 0.0;
        let mut sum_obs = 0.0;
        let mut sum_bias = 0.0;
        let mut sum_bias2 = 0.0;
        let mut sum_abs_err = 0.0;
        for &(m, o) in &self.pairs {
            let bias = m - o;
            sum_mod += m;
            sum_obs += o;
            sum_bias += bias;
            sum_bias2 += bias * bias;
            sum_abs_err += bias.abs();
        }
        let mod_mean = sum_mod / n;
        let obs_mean = sum_obs / n;

        let mut diff_product = 0.0;
        let mut mod_variance = 0.0;
        let mut obs_variance = 0.0;
        let mut abs_err_sum = 0.0;
        for &(m, o) in &self.pairs {
            let dm = m - mod_mean;
            let dobs = o - obs_mean;
            diff_product += dm * dobs;
            mod_variance += dm * dm;
            obs_variance += dobs * dobs;
            abs_err_sum += (m - obs_mean).abs() + dobs.abs();
        }

        let r = diff_product / (mod_variance.sqrt() * obs_variance.sqrt());
        Some(StatsRow {
            group: group.into(),
            n: self.pairs.len(),
            obs_mean,
            mod_mean,
            bias: sum_bias / n,
            rmse: (sum_bias2 / n).sqrt(),
            nmb: sum_bias / sum_obs,
            ioa: 1.0 - sum_abs_err / abs_err_sum,
            r2: r * r,
        })
    }
}

/// Model/observation agreement statistics of a matched table
pub struct AggregateStatistics {
    model_column: String,
    min_obs: usize,
    season: Option<Season>,
    obstype: Option<String>,
}

impl AggregateStatistics {
    pub fn new() -> Self {
        Self {
            model_column: MODEL_COLUMN.to_string(),
            min_obs: DEFAULT_MIN_OBS,
            season: None,
            obstype: None,
        }
    }

    pub fn with_model_column(mut self, column: impl Into<String>) -> Self {
        self.model_column = column.into();
        self
    }

    pub fn with_min_obs(mut self, min_obs: usize) -> Self {
        self.min_obs = min_obs;
        self
    }

    pub fn with_season(mut self, season: Option<Season>) -> Self {
        self.season = season;
        self
    }

    pub fn with_obstype(mut self, obstype: Option<String>) -> Self {
        self.obstype = obstype;
        self
    }

    /// Metrics per group, ordered by group name. Rows without both values are
    /// ignored; groups with fewer than `min_obs` pairs are dropped unless
    /// everything is pooled into a single group.
    pub fn compute(&self, table: &MatchedTable, group_by: GroupBy) -> Vec<StatsRow> {
        let mut groups: BTreeMap<String, PairAccumulator> = BTreeMap::new();

        for record in table.iter() {
            if self.season.is_some_and(|s| record.season != s) {
                continue;
            }
            if self
                .obstype
                .as_ref()
                .is_some_and(|o| &record.observation.obstype != o)
            {
                continue;
            }
            if let Some((model, obs)) = record.pair(&self.model_column) {
                if model.is_nan() || obs.is_nan() {
                    continue;
                }
                groups.entry(group_by.key(record)).or_default().add(model, obs);
            }
        }

        groups
            .into_iter()
            .filter(|(_, acc)| group_by == GroupBy::All || acc.len() >= self.min_obs)
            .filter_map(|(group, acc)| acc.finish(group))
            .collect()
    }
}

impl Default for AggregateStatistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Bias and absolute error of a single matched row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowMetrics {
    #[serde(rename = "ISO8601")]
    pub timestamp: NaiveDateTime,
    pub location: String,
    pub obstype: String,
    pub bias: Option<f64>,
    #[serde(rename = "AbsErr")]
    pub abs_err: Option<f64>,
}

pub fn unaggregated_metrics(table: &MatchedTable, model_column: &str) -> Vec<RowMetrics> {
    table
        .iter()
        .map(|record| {
            let bias = record.bias(model_column);
            RowMetrics {
                timestamp: record.observation.timestamp,
                location: record.observation.location.clone(),
                obstype: record.observation.obstype.clone(),
                bias,
                abs_err: bias.map(f64::abs),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ObsUnit, ObservationRecord, RegionLabel};
    use chrono::NaiveDate;

    fn record(month: u32, location: &str, model: Option<f64>, obs: Option<f64>) -> MatchedRecord {
        let timestamp = NaiveDate::from_ymd_opt(2020, month, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let observation = ObservationRecord::new(timestamp, location, 0.0, 0.0, "o3", ObsUnit::Ppbv, 0.0)
            .with_location(location);
        let mut record = MatchedRecord::new(observation);
        record.model.insert(MODEL_COLUMN.to_string(), model);
        record.obs_model_units = obs;
        record
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_reference_values() {
        let mut acc = PairAccumulator::new();
        for (m, o) in [(2.0, 1.0), (2.0, 2.0), (4.0, 3.0)] {
            acc.add(m, o);
        }
        let row = acc.finish("S").unwrap();

        assert_eq!(row.n, 3);
        assert!(close(row.obs_mean, 2.0));
        assert!(close(row.mod_mean, 8.0 / 3.0));
        assert!(close(row.bias, 2.0 / 3.0));
        assert!(close(row.rmse, (2.0f64 / 3.0).sqrt()));
        assert!(close(row.nmb, 1.0 / 3.0));
        assert!(close(row.ioa, 0.5));
        assert!(close(row.r2, 0.75));
    }

    #[test]
    fn test_perfect_agreement() {
        let mut acc = PairAccumulator::new();
        for v in [1.0, 5.0, 9.0] {
            acc.add(v, v);
        }
        let row = acc.finish("S").unwrap();
        assert!(close(row.bias, 0.0));
        assert!(close(row.rmse, 0.0));
        assert!(close(row.ioa, 1.0));
        assert!(close(row.r2, 1.0));
    }

    #[test]
    fn test_grouping_and_min_obs() {
        let table = MatchedTable::new(vec![
            record(1, "A", Some(2.0), Some(1.0)),
            record(2, "A", Some(2.0), Some(2.0)),
            record(3, "A", Some(4.0), Some(3.0)),
            record(1, "B", Some(1.0), Some(1.0)),
            record(2, "B", None, Some(1.0)),
            record(3, "B", Some(1.0), None),
        ]);

        let stats = AggregateStatistics::new();
        let by_location = stats.compute(&table, GroupBy::Location);
        assert_eq!(by_location.len(), 1);
        assert_eq!(by_location[0].group, "A");
        assert!(close(by_location[0].r2, 0.75));

        let all = stats.compute(&table, GroupBy::All);
        assert_eq!(all[0].n, 4);

        let winter = AggregateStatistics::new().with_min_obs(1).with_season(Some(Season::DJF));
        let rows = winter.compute(&table, GroupBy::Location);
        assert_eq!(rows.iter().map(|r| r.n).sum::<usize>(), 3);
    }

    #[test]
    fn test_group_by_region() {
        let mut a = record(1, "A", Some(1.0), Some(2.0));
        a.region = Some(RegionLabel {
            region_id: 1,
            region: "Europe".to_string(),
            region_short_name: "EU".to_string(),
        });
        let b = record(1, "B", Some(1.0), Some(2.0));
        let table = MatchedTable::new(vec![a, b]);

        let rows = AggregateStatistics::new().with_min_obs(1).compute(&table, GroupBy::Region);
        let groups: Vec<&str> = rows.iter().map(|r| r.group.as_str()).collect();
        assert_eq!(groups, vec!["Europe", "unknown"]);
    }

    #[test]
    fn test_unaggregated_metrics() {
        let table = MatchedTable::new(vec![record(1, "A", Some(2.0), Some(5.0)), record(1, "B", None, Some(1.0))]);
        let metrics = unaggregated_metrics(&table, MODEL_COLUMN);
        assert_eq!(metrics[0].bias, Some(-3.0));
        assert_eq!(metrics[0].abs_err, Some(3.0));
        assert_eq!(metrics[1].bias, None);
    }
}
