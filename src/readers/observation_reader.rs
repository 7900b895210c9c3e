use crate::error::{ProcessingError, Result};
use crate::models::{ObsUnit, ObservationRecord};
use crate::utils::constants::TIMESTAMP_FORMAT;
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Timelike};
use csv::StringRecord;
use encoding_rs::WINDOWS_1252;
use memmap2::Mmap;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// Columns with a dedicated field on `ObservationRecord`
const KNOWN_COLUMNS: [&str; 15] = [
    "ISO8601",
    "localtime",
    "location",
    "original_station_name",
    "country",
    "lat",
    "lon",
    "latlon_id",
    "location_gridded",
    "lat_gridded",
    "lon_gridded",
    "obstype",
    "unit",
    "value",
    "source",
];

/// Reads normalized observation CSV files
pub struct ObservationReader {
    use_mmap: bool,
    round_minutes: bool,
    delimiter: u8,
}

impl ObservationReader {
    pub fn new() -> Self {
        Self {
            use_mmap: false,
            round_minutes: false,
            delimiter: b',',
        }
    }

    pub fn with_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }

    /// Round timestamps to the nearest full hour on load
    pub fn with_round_minutes(mut self, round_minutes: bool) -> Self {
        self.round_minutes = round_minutes;
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn read_observations(&self, path: &Path) -> Result<Vec<ObservationRecord>> {
        let records = if self.use_mmap {
            let file = File::open(path)?;
            let mmap = unsafe { Mmap::map(&file)? };
            self.parse_bytes(&mmap)?
        } else {
            let bytes = std::fs::read(path)?;
            self.parse_bytes(&bytes)?
        };

        debug!("Read {} observations from {}", records.len(), path.display());
        Ok(records)
    }

    pub fn parse_bytes(&self, bytes: &[u8]) -> Result<Vec<ObservationRecord>> {
        let content = decode(bytes);
        self.parse_str(&content)
    }

    pub fn parse_str(&self, content: &str) -> Result<Vec<ObservationRecord>> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(content.as_bytes());

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| canonical_header(h.trim()).to_string())
            .collect();
        let columns: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.as_str(), i))
            .collect();

        for required in ["ISO8601", "lat", "lon", "obstype", "unit", "value"] {
            if !columns.contains_key(required) {
                return Err(ProcessingError::InvalidFormat(format!(
                    "observation file has no '{}' column",
                    required
                )));
            }
        }

        let rows: Vec<StringRecord> = reader.records().collect::<std::result::Result<_, _>>()?;

        // An extra column is numeric when every non-empty value parses
        let extra: Vec<(usize, &str, bool)> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| !KNOWN_COLUMNS.contains(&h.as_str()))
            .map(|(i, h)| {
                let numeric = rows.iter().all(|row| match cell(row, Some(i)) {
                    Some(value) => value.parse::<f64>().is_ok(),
                    None => true,
                });
                (i, h.as_str(), numeric)
            })
            .collect();

        let col = |name: &str| columns.get(name).copied();
        let mut records = Vec::with_capacity(rows.len());

        for (line, row) in rows.iter().enumerate() {
            let line = line + 2;
            let raw_time = cell(row, col("ISO8601"))
                .ok_or_else(|| ProcessingError::InvalidFormat(format!("missing ISO8601 on line {}", line)))?;
            let mut timestamp = parse_timestamp(raw_time)?;
            if self.round_minutes {
                timestamp = round_to_hour(timestamp);
            }

            let location = cell(row, col("location")).unwrap_or_default();
            let original = cell(row, col("original_station_name")).unwrap_or(location);
            let obstype = cell(row, col("obstype")).unwrap_or_default();
            let unit = ObsUnit::parse(cell(row, col("unit")).unwrap_or_default());

            let mut record = ObservationRecord::new(
                timestamp,
                original,
                float_or_nan(row, col("lat"), line)?,
                float_or_nan(row, col("lon"), line)?,
                obstype,
                unit,
                float_or_nan(row, col("value"), line)?,
            )
            .with_location(location);

            if let Some(raw) = cell(row, col("localtime")) {
                record.local_time = Some(parse_local_time(raw)?);
            }
            record.country = cell(row, col("country")).map(str::to_string);
            record.source = cell(row, col("source")).map(str::to_string);
            record.location_gridded = cell(row, col("location_gridded")).map(str::to_string);
            record.latlon_id = optional_float(row, col("latlon_id"), line)?;
            record.lat_gridded = optional_float(row, col("lat_gridded"), line)?;
            record.lon_gridded = optional_float(row, col("lon_gridded"), line)?;

            for &(i, name, numeric) in &extra {
                let Some(raw) = cell(row, Some(i)) else {
                    continue;
                };
                if numeric {
                    if let Ok(value) = raw.parse::<f64>() {
                        record.numeric.insert(name.to_string(), value);
                    }
                } else {
                    record.metadata.insert(name.to_string(), raw.to_string());
                }
            }

            records.push(record);
        }

        Ok(records)
    }
}

impl Default for ObservationReader {
    fn default() -> Self {
        Self::new()
    }
}

/// UTF-8 when valid, Windows-1252 otherwise
fn decode(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(content) => Cow::Borrowed(content),
        Err(_) => {
            debug!("Input is not valid UTF-8, decoding as Windows-1252");
            let (content, _, _) = WINDOWS_1252.decode(bytes);
            content
        }
    }
}

fn canonical_header(header: &str) -> &str {
    match header {
        "Location" | "station" => "location",
        "Value" => "value",
        "Lat" => "lat",
        "Lon" => "lon",
        other => other,
    }
}

fn cell(row: &StringRecord, col: Option<usize>) -> Option<&str> {
    col.and_then(|c| row.get(c))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn optional_float(row: &StringRecord, col: Option<usize>, line: usize) -> Result<Option<f64>> {
    match cell(row, col) {
        Some(raw) => raw.parse::<f64>().map(Some).map_err(|_| {
            ProcessingError::InvalidFormat(format!("Invalid number '{}' on line {}", raw, line))
        }),
        None => Ok(None),
    }
}

/// Empty cells become NaN and are removed later by the quality filter
fn float_or_nan(row: &StringRecord, col: Option<usize>, line: usize) -> Result<f64> {
    Ok(optional_float(row, col, line)?.unwrap_or(f64::NAN))
}

pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    if let Ok(timestamp) = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT) {
        return Ok(timestamp);
    }
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.naive_utc());
    }
    Ok(NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")?)
}

/// Local times carry their offset; a bare UTC timestamp is read at offset zero
pub fn parse_local_time(raw: &str) -> Result<DateTime<FixedOffset>> {
    if let Ok(local) = DateTime::parse_from_rfc3339(raw) {
        return Ok(local);
    }
    let naive = parse_timestamp(raw)?;
    Ok(naive.and_utc().fixed_offset())
}

fn round_to_hour(timestamp: NaiveDateTime) -> NaiveDateTime {
    let shifted = timestamp + Duration::minutes(30);
    shifted
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(timestamp)
}
