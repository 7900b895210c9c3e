use chrono::{DateTime, FixedOffset, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

use crate::models::ObsUnit;

/// One normalized measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ObservationRecord {
    /// UTC timestamp
    pub timestamp: NaiveDateTime,
    pub local_time: Option<DateTime<FixedOffset>>,

    /// Canonical station name, empty until the station registry assigns one
    pub location: String,
    pub original_station_name: String,
    pub country: Option<String>,

    #[validate(range(min = -90.0, max = 90.0))]
    pub lat: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub lon: f64,

    pub latlon_id: Option<f64>,
    pub location_gridded: Option<String>,
    pub lat_gridded: Option<f64>,
    pub lon_gridded: Option<f64>,

    #[validate(length(min = 1))]
    pub obstype: String,

    pub unit: ObsUnit,
    pub value: f64,
    pub source: Option<String>,

    /// Provider-specific numeric columns
    pub numeric: BTreeMap<String, f64>,
    /// Provider-specific text columns
    pub metadata: BTreeMap<String, String>,
}

impl ObservationRecord {
    pub fn new(
        timestamp: NaiveDateTime,
        original_station_name: impl Into<String>,
        lat: f64,
        lon: f64,
        obstype: impl Into<String>,
        unit: ObsUnit,
        value: f64,
    ) -> Self {
        Self {
            timestamp,
            local_time: None,
            location: String::new(),
            original_station_name: original_station_name.into(),
            country: None,
            lat,
            lon,
            latlon_id: None,
            location_gridded: None,
            lat_gridded: None,
            lon_gridded: None,
            obstype: obstype.into(),
            unit,
            value,
            source: None,
            numeric: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_local_time(mut self, local_time: DateTime<FixedOffset>) -> Self {
        self.local_time = Some(local_time);
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_numeric(mut self, column: impl Into<String>, value: f64) -> Self {
        self.numeric.insert(column.into(), value);
        self
    }

    pub fn with_metadata(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(column.into(), value.into());
        self
    }

    /// Timestamp truncated to the full hour
    pub fn hour(&self) -> NaiveDateTime {
        self.timestamp
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(self.timestamp)
    }

    /// Rows without a usable position or value are dropped before matching
    pub fn is_usable(&self) -> bool {
        !self.lat.is_nan() && !self.lon.is_nan() && !self.value.is_nan()
    }

    /// Text columns that do not survive numeric aggregation, in column order
    pub fn text_columns(&self) -> Vec<(String, String)> {
        let mut columns = vec![(
            "original_station_name".to_string(),
            self.original_station_name.clone(),
        )];
        if let Some(country) = &self.country {
            columns.push(("country".to_string(), country.clone()));
        }
        if let Some(gridded) = &self.location_gridded {
            columns.push(("location_gridded".to_string(), gridded.clone()));
        }
        if let Some(source) = &self.source {
            columns.push(("source".to_string(), source.clone()));
        }
        columns.extend(
            self.metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        columns
    }

    /// Overwrite the text columns from `(column, value)` pairs
    pub fn set_text_columns(&mut self, columns: &[(String, String)]) {
        for (column, value) in columns {
            match column.as_str() {
                "original_station_name" => self.original_station_name = value.clone(),
                "country" => self.country = Some(value.clone()),
                "location_gridded" => self.location_gridded = Some(value.clone()),
                "source" => self.source = Some(value.clone()),
                other => {
                    self.metadata.insert(other.to_string(), value.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_record() -> ObservationRecord {
        let timestamp = NaiveDate::from_ymd_opt(2019, 12, 1)
            .unwrap()
            .and_hms_opt(7, 42, 13)
            .unwrap();
        ObservationRecord::new(
            timestamp,
            "London Marylebone Road",
            51.5225,
            -0.1546,
            "no2",
            ObsUnit::MassConcentration,
            48.5,
        )
        .with_country("GB")
        .with_source("openaq")
        .with_metadata("sourceType", "government")
    }

    #[test]
    fn test_hour_truncation() {
        let record = sample_record();
        assert_eq!(
            record.hour(),
            NaiveDate::from_ymd_opt(2019, 12, 1)
                .unwrap()
                .and_hms_opt(7, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn test_record_validation() {
        let record = sample_record();
        assert!(record.validate().is_ok());
        assert!(record.is_usable());

        let mut invalid = sample_record();
        invalid.lat = 95.0;
        assert!(invalid.validate().is_err());

        let mut missing = sample_record();
        missing.value = f64::NAN;
        assert!(!missing.is_usable());
    }

    #[test]
    fn test_text_columns_roundtrip() {
        let record = sample_record();
        let columns = record.text_columns();
        assert_eq!(columns[0].1, "London Marylebone Road");
        assert!(columns.contains(&("sourceType".to_string(), "government".to_string())));

        let mut other = ObservationRecord::new(
            record.timestamp,
            "",
            record.lat,
            record.lon,
            "no2",
            ObsUnit::MassConcentration,
            1.0,
        );
        other.set_text_columns(&columns);
        assert_eq!(other.text_columns(), columns);
    }
}
