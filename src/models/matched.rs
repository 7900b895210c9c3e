use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{ObservationRecord, RegionLabel, Season};
use crate::utils::constants::{MODEL_COLUMN, OBS_COLUMN, UNKNOWN};

/// An aggregated observation with the model values sampled at its cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedRecord {
    pub observation: ObservationRecord,

    /// Model columns (`conc_mod` plus any configured suffixes)
    pub model: BTreeMap<String, Option<f64>>,

    /// Observation expressed in the model unit (`conc_obs`)
    pub obs_model_units: Option<f64>,

    /// Unit of the model columns (`conc_unit`)
    pub model_unit: String,

    /// False when the observation unit could not be converted to the model unit
    pub unit_known: bool,

    pub season: Season,
    pub region: Option<RegionLabel>,
}

impl MatchedRecord {
    pub fn new(observation: ObservationRecord) -> Self {
        let season = Season::from_datetime(&observation.timestamp);
        Self {
            observation,
            model: BTreeMap::new(),
            obs_model_units: None,
            model_unit: UNKNOWN.to_string(),
            unit_known: true,
            season,
            region: None,
        }
    }

    pub fn model_value(&self, column: &str) -> Option<f64> {
        self.model.get(column).copied().flatten()
    }

    /// Model and observation values when both are present
    pub fn pair(&self, column: &str) -> Option<(f64, f64)> {
        Some((self.model_value(column)?, self.obs_model_units?))
    }

    /// Model minus observation
    pub fn bias(&self, column: &str) -> Option<f64> {
        self.pair(column).map(|(m, o)| m - o)
    }
}

/// One row of the (timestamp, location) pivot of a matched table
#[derive(Debug, Clone, PartialEq)]
pub struct WideRow {
    pub timestamp: NaiveDateTime,
    pub location: String,
    pub values: BTreeMap<String, Option<f64>>,
}

impl WideRow {
    pub fn get(&self, column: &str) -> Option<f64> {
        self.values.get(column).copied().flatten()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchedTable {
    pub records: Vec<MatchedRecord>,
    /// Model columns in creation order
    pub model_columns: Vec<String>,
}

impl MatchedTable {
    pub fn new(records: Vec<MatchedRecord>) -> Self {
        Self {
            records,
            model_columns: vec![MODEL_COLUMN.to_string()],
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MatchedRecord> {
        self.records.iter()
    }

    /// Register a model column, keeping first-seen order
    pub fn ensure_model_column(&mut self, column: &str) {
        if !self.model_columns.iter().any(|c| c == column) {
            self.model_columns.push(column.to_string());
        }
    }

    pub fn filter_season(&self, season: Season) -> MatchedTable {
        MatchedTable {
            records: self
                .records
                .iter()
                .filter(|r| r.season == season)
                .cloned()
                .collect(),
            model_columns: self.model_columns.clone(),
        }
    }

    /// Pivot to one row per (timestamp, location) with `<column>_<obstype>` values
    pub fn to_wide(&self) -> Vec<WideRow> {
        let mut rows: BTreeMap<(NaiveDateTime, String), BTreeMap<String, Option<f64>>> =
            BTreeMap::new();

        for record in &self.records {
            let key = (
                record.observation.timestamp,
                record.observation.location.clone(),
            );
            let values = rows.entry(key).or_default();
            let obstype = &record.observation.obstype;

            for column in &self.model_columns {
                values.insert(
                    format!("{}_{}", column, obstype),
                    record.model_value(column),
                );
            }
            values.insert(format!("{}_{}", OBS_COLUMN, obstype), record.obs_model_units);
        }

        rows.into_iter()
            .map(|((timestamp, location), values)| WideRow {
                timestamp,
                location,
                values,
            })
            .collect()
    }
}
