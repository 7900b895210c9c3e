use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::warn;

use crate::error::{ProcessingError, Result};
use crate::models::ObservationRecord;
use crate::readers::{GriddedFieldReader, MapVariable, TimeAverageRequest};

/// One monthly value of one labelled series at one location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactRow {
    #[serde(rename = "ISO8601")]
    pub month: NaiveDate,
    pub loc_name: String,
    pub lat: f64,
    pub lon: f64,
    pub obstype: String,
    pub unit: String,
    pub value: f64,
    pub label: String,
}

/// Aggregates observations to monthly means per station
pub struct MonthlyCompactor {
    label: String,
    obstype: Option<String>,
    nmin: usize,
    nmin_agg: Option<usize>,
    remove_nan: bool,
}

impl MonthlyCompactor {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            obstype: None,
            nmin: 0,
            nmin_agg: None,
            remove_nan: true,
        }
    }

    pub fn with_obstype(mut self, obstype: impl Into<String>) -> Self {
        self.obstype = Some(obstype.into());
        self
    }

    /// Months built from fewer raw values are masked
    pub fn with_nmin(mut self, nmin: usize) -> Self {
        self.nmin = nmin;
        self
    }

    /// Locations with fewer valid months are dropped
    pub fn with_nmin_agg(mut self, nmin_agg: Option<usize>) -> Self {
        self.nmin_agg = nmin_agg;
        self
    }

    pub fn with_remove_nan(mut self, remove_nan: bool) -> Self {
        self.remove_nan = remove_nan;
        self
    }

    /// Monthly means per (original station, obstype, unit), every month between
    /// the first and last observation of a station included
    pub fn compact(&self, records: &[ObservationRecord]) -> Vec<CompactRow> {
        type Key = (String, String, String);
        let mut stations: BTreeMap<Key, BTreeMap<NaiveDate, MonthSums>> = BTreeMap::new();

        for record in records {
            if self.obstype.as_ref().is_some_and(|o| &record.obstype != o) {
                continue;
            }
            let key = (
                record.original_station_name.clone(),
                record.obstype.clone(),
                record.unit.to_string(),
            );
            stations
                .entry(key)
                .or_default()
                .entry(first_of_month(record.timestamp.date()))
                .or_default()
                .add(record);
        }

        let mut rows = Vec::new();
        for ((station, obstype, unit), months) in stations {
            let (Some(&first), Some(&last)) = (months.keys().next(), months.keys().next_back()) else {
                continue;
            };
            let (lat, lon) = mean_position(months.values());
            let loc_name = format!("{} ({:.1}N {:.1}E)", station, lat, lon);

            let mut location_rows = Vec::new();
            let mut month = first;
            while month <= last {
                let value = match months.get(&month) {
                    Some(sums) if sums.count >= self.nmin.max(1) => sums.mean(),
                    _ => f64::NAN,
                };
                location_rows.push(CompactRow {
                    month,
                    loc_name: loc_name.clone(),
                    lat,
                    lon,
                    obstype: obstype.clone(),
                    unit: unit.clone(),
                    value,
                    label: self.label.clone(),
                });
                month = match month.checked_add_months(Months::new(1)) {
                    Some(next) => next,
                    None => break,
                };
            }

            let valid = location_rows.iter().filter(|r| !r.value.is_nan()).count();
            if self.remove_nan && valid == 0 {
                continue;
            }
            if self.nmin_agg.is_some_and(|n| valid < n) {
                continue;
            }
            rows.extend(location_rows);
        }

        rows
    }
}

#[derive(Debug, Default)]
struct MonthSums {
    count: usize,
    value: f64,
    valid: usize,
    lat: f64,
    lon: f64,
}

impl MonthSums {
    fn add(&mut self, record: &ObservationRecord) {
        self.count += 1;
        self.lat += record.lat;
        self.lon += record.lon;
        if !record.value.is_nan() {
            self.value += record.value;
            self.valid += 1;
        }
    }

    fn mean(&self) -> f64 {
        if self.valid == 0 {
            f64::NAN
        } else {
            self.value / self.valid as f64
        }
    }
}

fn mean_position<'a>(months: impl Iterator<Item = &'a MonthSums>) -> (f64, f64) {
    let (mut lat, mut lon, mut n) = (0.0, 0.0, 0usize);
    for sums in months {
        lat += sums.lat;
        lon += sums.lon;
        n += sums.count;
    }
    if n == 0 {
        (f64::NAN, f64::NAN)
    } else {
        (lat / n as f64, lon / n as f64)
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Model variable sampled into a compact series
pub struct CompactModelSeries {
    pub label: String,
    pub obstype: String,
    pub unit: String,
    pub template: String,
    pub variable: String,
    pub scal: f64,
}

impl CompactModelSeries {
    /// Monthly model means at every location of `rows`, for each month of
    /// `start..=end`. Months without model output are NaN.
    pub fn sample(
        &self,
        reader: &GriddedFieldReader,
        rows: &[CompactRow],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<CompactRow> {
        let mut locations: BTreeMap<&str, (f64, f64, usize)> = BTreeMap::new();
        for row in rows {
            let (lat, lon, n) = locations.entry(row.loc_name.as_str()).or_default();
            *lat += row.lat;
            *lon += row.lon;
            *n += 1;
        }

        let mut sampled = Vec::new();
        let mut month = first_of_month(start);
        while month <= end {
            let next = month.checked_add_months(Months::new(1));
            let last_day = next.and_then(|n| n.pred_opt()).unwrap_or(month);
            let request = TimeAverageRequest::new(
                self.template.clone(),
                month,
                last_day,
                MapVariable::from_name(&self.variable),
            )
            .with_scale(self.scal);

            let field = match reader.read_time_averaged_map(&request) {
                Ok(field) => Some(field),
                Err(e) => {
                    warn!("No model output for {}: {}", month.format("%Y-%m"), e);
                    None
                }
            };

            for (loc_name, (lat, lon, n)) in &locations {
                let (lat, lon) = (lat / *n as f64, lon / *n as f64);
                sampled.push(CompactRow {
                    month,
                    loc_name: loc_name.to_string(),
                    lat,
                    lon,
                    obstype: self.obstype.clone(),
                    unit: self.unit.clone(),
                    value: field
                        .as_ref()
                        .and_then(|f| f.nearest_value(lat, lon))
                        .unwrap_or(f64::NAN),
                    label: self.label.clone(),
                });
            }

            match next {
                Some(next) => month = next,
                None => break,
            }
        }

        sampled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactMetric {
    Rmse,
    Nmb,
    Mape,
}

impl CompactMetric {
    pub fn name(&self) -> &'static str {
        match self {
            CompactMetric::Rmse => "RMSE",
            CompactMetric::Nmb => "NMB",
            CompactMetric::Mape => "MAPE",
        }
    }
}

impl FromStr for CompactMetric {
    type Err = ProcessingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "RMSE" => Ok(CompactMetric::Rmse),
            "NMB" => Ok(CompactMetric::Nmb),
            "MAPE" => Ok(CompactMetric::Mape),
            other => Err(ProcessingError::Config(format!(
                "Metric not supported: {}. Must be one of RMSE, NMB, MAPE",
                other
            ))),
        }
    }
}

/// Compare every labelled series against the observation series `obs_label`,
/// per month and location (or per month when `group_all`)
pub fn compact_stats(rows: &[CompactRow], obs_label: &str, metric: CompactMetric, group_all: bool) -> Vec<CompactRow> {
    let observations: BTreeMap<(NaiveDate, &str, &str), f64> = rows
        .iter()
        .filter(|r| r.label == obs_label)
        .map(|r| ((r.month, r.loc_name.as_str(), r.obstype.as_str()), r.value))
        .collect();

    #[derive(Default)]
    struct Sums {
        n: usize,
        bias: f64,
        bias2: f64,
        ape: f64,
        obs: f64,
        lat: f64,
        lon: f64,
    }

    let mut groups: BTreeMap<(String, NaiveDate, String, String), (Sums, String)> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.label != obs_label) {
        let Some(&obs) = observations.get(&(row.month, row.loc_name.as_str(), row.obstype.as_str())) else {
            continue;
        };
        let loc_name = if group_all {
            "all_locations".to_string()
        } else {
            row.loc_name.clone()
        };
        let (sums, _) = groups
            .entry((row.label.clone(), row.month, loc_name, row.obstype.clone()))
            .or_insert_with(|| (Sums::default(), row.unit.clone()));

        let bias = row.value - obs;
        sums.n += 1;
        sums.bias += bias;
        sums.bias2 += bias * bias;
        sums.ape += bias.abs() / obs;
        sums.obs += obs;
        sums.lat += row.lat;
        sums.lon += row.lon;
    }

    groups
        .into_iter()
        .map(|((label, month, loc_name, obstype), (sums, unit))| {
            let n = sums.n as f64;
            let value = match metric {
                CompactMetric::Rmse => (sums.bias2 / n).sqrt(),
                CompactMetric::Nmb => sums.bias / sums.obs,
                CompactMetric::Mape => sums.ape / n,
            };
            let (lat, lon) = if group_all {
                (f64::NAN, f64::NAN)
            } else {
                (sums.lat / n, sums.lon / n)
            };
            CompactRow {
                month,
                loc_name,
                lat,
                lon,
                obstype,
                unit,
                value,
                label: format!("{}:_{}", metric.name(), label),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObsUnit;
    use crate::readers::{MemoryDataset, MemoryOpener};
    use ndarray::Array3;
    use std::sync::Arc;

    fn obs(month: u32, day: u32, station: &str, value: f64) -> ObservationRecord {
        let timestamp = NaiveDate::from_ymd_opt(2021, month, day)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        ObservationRecord::new(timestamp, station, 10.0, 20.0, "o3", ObsUnit::Ppbv, value)
    }

    fn month(m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, m, 1).unwrap()
    }

    #[test]
    fn test_monthly_means_with_gap_and_nmin() {
        let records = vec![
            obs(1, 1, "A", 10.0),
            obs(1, 20, "A", 20.0),
            obs(3, 5, "A", 7.0),
            obs(2, 1, "B", f64::NAN),
        ];

        let rows = MonthlyCompactor::new("obs").compact(&records);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].month, month(1));
        assert_eq!(rows[0].value, 15.0);
        assert!(rows[1].value.is_nan());
        assert_eq!(rows[2].value, 7.0);
        assert_eq!(rows[0].loc_name, "A (10.0N 20.0E)");

        let strict = MonthlyCompactor::new("obs").with_nmin(2).compact(&records);
        assert_eq!(strict.iter().filter(|r| !r.value.is_nan()).count(), 1);

        let kept = MonthlyCompactor::new("obs").with_nmin_agg(Some(3)).compact(&records);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_compact_stats() -> Result<()> {
        let row = |label: &str, loc: &str, value: f64| CompactRow {
            month: month(1),
            loc_name: loc.to_string(),
            lat: 1.0,
            lon: 2.0,
            obstype: "o3".to_string(),
            unit: "ppbv".to_string(),
            value,
            label: label.to_string(),
        };
        let rows = vec![
            row("obs", "A", 10.0),
            row("obs", "B", 20.0),
            row("cf", "A", 12.0),
            row("cf", "B", 15.0),
        ];

        let rmse = compact_stats(&rows, "obs", "rmse".parse()?, false);
        assert_eq!(rmse.len(), 2);
        assert_eq!(rmse[0].value, 2.0);
        assert_eq!(rmse[0].label, "RMSE:_cf");

        let nmb = compact_stats(&rows, "obs", CompactMetric::Nmb, true);
        assert_eq!(nmb.len(), 1);
        assert_eq!(nmb[0].loc_name, "all_locations");
        assert!((nmb[0].value - (-3.0 / 30.0)).abs() < 1e-12);

        let mape = compact_stats(&rows, "obs", CompactMetric::Mape, true);
        assert!((mape[0].value - 0.225).abs() < 1e-12);

        assert!("R2".parse::<CompactMetric>().is_err());
        Ok(())
    }

    #[test]
    fn test_model_series_sampling() {
        let times: Vec<_> = (1..=31)
            .map(|d| NaiveDate::from_ymd_opt(2021, 1, d).unwrap().and_hms_opt(0, 0, 0).unwrap())
            .collect();
        let values = Array3::from_shape_fn((31, 2, 2), |(t, _, _)| t as f64);
        let dataset = MemoryDataset::new(vec![-45.0, 45.0], vec![-90.0, 90.0], times).with_variable("O3", values);
        let reader = GriddedFieldReader::new(Arc::new(
            MemoryOpener::new().with_dataset("/model/o3.202101.nc4", dataset),
        ));

        let observed = MonthlyCompactor::new("obs").compact(&[obs(1, 3, "A", 1.0)]);
        let series = CompactModelSeries {
            label: "cf".to_string(),
            obstype: "o3".to_string(),
            unit: "ppbv".to_string(),
            template: "/model/o3.%Y%m.nc4".to_string(),
            variable: "O3".to_string(),
            scal: 2.0,
        };
        let sampled = series.sample(&reader, &observed, month(1), month(2));

        assert_eq!(sampled.len(), 2);
        assert_eq!(sampled[0].value, 30.0);
        assert!(sampled[1].value.is_nan());
    }
}
