use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::{ProcessingError, Result};
use crate::models::{MatchedRecord, MatchedTable};
use crate::utils::constants::{MODEL_COLUMN, OBS_COLUMN};
use crate::utils::coordinates::nearest_index;

/// Mean of one (obstype, column) at one output cell and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct GriddedCell {
    pub timestamp: NaiveDateTime,
    pub lat: f64,
    pub lon: f64,
    pub obstype: String,
    /// `<column>_<obstype>`
    pub variable: String,
    pub value: f64,
    pub count: u32,
}

/// Maps matched values onto a regular lat/lon grid
pub struct Gridder {
    lats: Vec<f64>,
    lons: Vec<f64>,
    obstypes: Vec<String>,
    columns: Vec<String>,
    obs_filter_low: Option<f64>,
    obs_filter_high: Option<f64>,
}

impl Gridder {
    /// Grid nodes run from -90 to 90 and -180 to 180 inclusive
    pub fn new(dlat: f64, dlon: f64) -> Result<Self> {
        if !(dlat > 0.0 && dlon > 0.0) || !dlat.is_finite() || !dlon.is_finite() {
            return Err(ProcessingError::Config(format!(
                "Invalid grid resolution {}x{}",
                dlat, dlon
            )));
        }
        Ok(Self {
            lats: node_axis(-90.0, 90.0, dlat),
            lons: node_axis(-180.0, 180.0, dlon),
            obstypes: ["o3", "no2", "pm25"].iter().map(|s| s.to_string()).collect(),
            columns: vec![MODEL_COLUMN.to_string(), OBS_COLUMN.to_string()],
            obs_filter_low: None,
            obs_filter_high: Some(0.99),
        })
    }

    /// Parse a `<dlat>x<dlon>` resolution such as `2x2.5`
    pub fn from_resolution(resolution: &str) -> Result<Self> {
        let invalid = || ProcessingError::Config(format!("Invalid resolution '{}', expected <dlat>x<dlon>", resolution));
        let (dlat, dlon) = resolution.split_once('x').ok_or_else(invalid)?;
        let dlat = dlat.trim().parse::<f64>().map_err(|_| invalid())?;
        let dlon = dlon.trim().parse::<f64>().map_err(|_| invalid())?;
        Self::new(dlat, dlon)
    }

    pub fn with_obstypes(mut self, obstypes: &[&str]) -> Self {
        self.obstypes = obstypes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Quantiles outside which observation columns are dropped; `None` disables a side
    pub fn with_obs_filter(mut self, low: Option<f64>, high: Option<f64>) -> Result<Self> {
        for q in [low, high].into_iter().flatten() {
            if !(0.0..=1.0).contains(&q) {
                return Err(ProcessingError::Config(format!("Quantile {} is outside [0, 1]", q)));
            }
        }
        self.obs_filter_low = low;
        self.obs_filter_high = high;
        Ok(self)
    }

    pub fn lats(&self) -> &[f64] {
        &self.lats
    }

    pub fn lons(&self) -> &[f64] {
        &self.lons
    }

    /// Cell means per timestamp, ordered by variable, time and cell
    pub fn grid(&self, table: &MatchedTable) -> Result<Vec<GriddedCell>> {
        let mut cells = Vec::new();

        for obstype in &self.obstypes {
            let records: Vec<(&MatchedRecord, usize, usize)> = table
                .iter()
                .filter(|r| &r.observation.obstype == obstype)
                .filter_map(|r| {
                    let i = nearest_index(&self.lats, r.observation.lat)?;
                    let j = nearest_index(&self.lons, r.observation.lon)?;
                    Some((r, i, j))
                })
                .collect();
            if records.is_empty() {
                debug!("No {} records to grid", obstype);
                continue;
            }

            for column in &self.columns {
                let mut values: Vec<(NaiveDateTime, usize, usize, f64)> = records
                    .iter()
                    .filter_map(|(r, i, j)| {
                        column_value(r, column)
                            .filter(|v| !v.is_nan())
                            .map(|v| (r.observation.timestamp, *i, *j, v))
                    })
                    .collect();
                if values.is_empty() {
                    warn!("Column {} has no values for {}", column, obstype);
                    continue;
                }

                if column.contains("obs") {
                    values = self.filter_outliers(values);
                }

                let mut sums: BTreeMap<(NaiveDateTime, usize, usize), (f64, u32)> = BTreeMap::new();
                for (timestamp, i, j, value) in values {
                    let (sum, count) = sums.entry((timestamp, i, j)).or_default();
                    *sum += value;
                    *count += 1;
                }

                let variable = format!("{}_{}", column, obstype);
                cells.extend(sums.into_iter().map(|((timestamp, i, j), (sum, count))| GriddedCell {
                    timestamp,
                    lat: self.lats[i],
                    lon: self.lons[j],
                    obstype: obstype.clone(),
                    variable: variable.clone(),
                    value: sum / count as f64,
                    count,
                }));
            }
        }

        Ok(cells)
    }

    /// Keep values strictly inside the configured quantiles
    fn filter_outliers(
        &self,
        values: Vec<(NaiveDateTime, usize, usize, f64)>,
    ) -> Vec<(NaiveDateTime, usize, usize, f64)> {
        let mut sorted: Vec<f64> = values.iter().map(|v| v.3).collect();
        sorted.sort_by(f64::total_cmp);

        let high = self.obs_filter_high.and_then(|q| quantile(&sorted, q));
        let low = self.obs_filter_low.and_then(|q| quantile(&sorted, q));

        values
            .into_iter()
            .filter(|v| high.map_or(true, |h| v.3 < h))
            .filter(|v| low.map_or(true, |l| v.3 > l))
            .collect()
    }
}

fn column_value(record: &MatchedRecord, column: &str) -> Option<f64> {
    if column == OBS_COLUMN {
        record.obs_model_units
    } else {
        record.model_value(column)
    }
}

fn node_axis(start: f64, end: f64, step: f64) -> Vec<f64> {
    let n = ((end - start) / step + 1.0e-4).floor() as usize + 1;
    (0..n).map(|i| start + i as f64 * step).collect()
}

/// Linearly interpolated quantile of sorted values
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ObsUnit, ObservationRecord};
    use chrono::NaiveDate;

    fn record(hour: u32, lat: f64, lon: f64, model: f64, obs: f64) -> MatchedRecord {
        let timestamp = NaiveDate::from_ymd_opt(2020, 4, 7)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap();
        let mut record = MatchedRecord::new(ObservationRecord::new(timestamp, "S", lat, lon, "o3", ObsUnit::Ppbv, obs));
        record.model.insert(MODEL_COLUMN.to_string(), Some(model));
        record.obs_model_units = Some(obs);
        record
    }

    #[test]
    fn test_resolution_parsing() -> Result<()> {
        let gridder = Gridder::from_resolution("2x2.5")?;
        assert_eq!(gridder.lats().len(), 91);
        assert_eq!(gridder.lons().len(), 145);
        assert_eq!(gridder.lons()[144], 180.0);
        assert!(Gridder::from_resolution("2by2").is_err());
        assert!(Gridder::from_resolution("0x1").is_err());
        Ok(())
    }

    #[test]
    fn test_cell_means() -> Result<()> {
        let table = MatchedTable::new(vec![
            record(0, 10.2, 20.3, 1.0, 10.0),
            record(0, 9.8, 19.9, 3.0, 20.0),
            record(1, 10.0, 20.0, 5.0, 30.0),
        ]);
        let gridder = Gridder::new(1.0, 1.0)?.with_obs_filter(None, None)?;
        let cells = gridder.grid(&table)?;

        let model: Vec<&GriddedCell> = cells.iter().filter(|c| c.variable == "conc_mod_o3").collect();
        assert_eq!(model.len(), 2);
        assert_eq!(model[0].value, 2.0);
        assert_eq!(model[0].count, 2);
        assert_eq!((model[0].lat, model[0].lon), (10.0, 20.0));

        let obs: Vec<&GriddedCell> = cells.iter().filter(|c| c.variable == "conc_obs_o3").collect();
        assert_eq!(obs[0].value, 15.0);
        Ok(())
    }

    #[test]
    fn test_high_quantile_filters_observations_only() -> Result<()> {
        let mut records: Vec<MatchedRecord> = (0..10).map(|i| record(0, 0.0, 0.0, 1.0, i as f64)).collect();
        records.push(record(0, 0.0, 0.0, 1.0, 1000.0));
        let table = MatchedTable::new(records);

        let cells = Gridder::new(1.0, 1.0)?.grid(&table)?;
        let obs = cells.iter().find(|c| c.variable == "conc_obs_o3").unwrap();
        let model = cells.iter().find(|c| c.variable == "conc_mod_o3").unwrap();

        assert_eq!(obs.count, 10);
        assert_eq!(obs.value, 4.5);
        assert_eq!(model.count, 11);
        Ok(())
    }

    #[test]
    fn test_quantile_interpolation() {
        assert_eq!(quantile(&[1.0, 2.0, 3.0, 4.0], 0.5), Some(2.5));
        assert_eq!(quantile(&[], 0.5), None);
    }
}
