use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::{CollectionConfig, VariableConfig};
use crate::error::{ProcessingError, Result};
use crate::models::{GriddedField, ObservationRecord};
use crate::readers::GriddedFieldReader;

/// Attaches the nearest-cell value of a static gridded field (such as
/// population density) to every record as a numeric column
pub struct FieldSampler {
    path: String,
    variable: String,
    column: String,
    timeslice: NaiveDateTime,
}

impl FieldSampler {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            variable: "PopulationDensity".to_string(),
            column: "popdens".to_string(),
            timeslice: NaiveDate::from_ymd_opt(2020, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap_or_default(),
        }
    }

    pub fn with_variable(mut self, variable: impl Into<String>) -> Self {
        self.variable = variable.into();
        self
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Time slice used when the file holds more than one; the nearest step is taken
    pub fn with_timeslice(mut self, timeslice: NaiveDateTime) -> Self {
        self.timeslice = timeslice;
        self
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn load_field(&self, reader: &GriddedFieldReader) -> Result<GriddedField> {
        let collection = CollectionConfig::new(self.path.replace('%', "%%"))
            .with_var(self.column.clone(), VariableConfig::new(self.variable.clone()));
        let collections = BTreeMap::from([(self.column.clone(), collection)]);

        let mut fields = reader.read(self.timeslice, &collections)?;
        debug!("Read {} from {}", self.variable, self.path);
        fields
            .fields
            .remove(&self.column)
            .ok_or_else(|| ProcessingError::MissingData(format!("{} in {}", self.variable, self.path)))
    }

    /// Records over a missing cell get no value
    pub fn sample(&self, records: &mut [ObservationRecord], field: &GriddedField) {
        let mut sampled = 0;
        for record in records.iter_mut() {
            if let Some(value) = field.nearest_value(record.lat, record.lon) {
                record.numeric.insert(self.column.clone(), value);
                sampled += 1;
            }
        }
        info!("Set {} for {} of {} records", self.column, sampled, records.len());
    }
}
