use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{ProcessingError, Result};
use crate::models::{MatchedRecord, MatchedTable, ObservationRecord, StationEntry};
use crate::utils::constants::{OBS_COLUMN, OBS_HEADER_ORDER, REGISTRY_COLUMNS, TIMESTAMP_FORMAT, UNIT_COLUMN};
use crate::utils::filename::expand_date_template;

/// Format of the local time column, offset included
pub const LOCAL_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

const FLOAT_DECIMALS: usize = 4;

type Row = Vec<(String, String)>;

/// Writes observation, matched and registry tables as CSV
pub struct CsvWriter {
    nfloats: Option<usize>,
    append: bool,
    opened_files: Vec<PathBuf>,
}

impl CsvWriter {
    pub fn new() -> Self {
        Self {
            nfloats: None,
            append: false,
            opened_files: Vec::new(),
        }
    }

    /// Round floats to `nfloats` decimals before writing
    pub fn with_nfloats(mut self, nfloats: usize) -> Self {
        self.nfloats = Some(nfloats);
        self
    }

    /// Append to files that already exist instead of replacing them
    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// Files written by this writer, in first-write order
    pub fn opened_files(&self) -> &[PathBuf] {
        &self.opened_files
    }

    /// Write the station registry with 4-decimal floats
    pub fn write_registry(&self, entries: &[&StationEntry], path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(REGISTRY_COLUMNS)?;

        for entry in entries {
            writer.write_record([
                entry.location.clone(),
                float4(Some(entry.lat)),
                float4(Some(entry.lon)),
                float4(Some(entry.latlon_id.value())),
                entry.original_station_name.clone(),
                entry.location_gridded.clone(),
                float4(entry.lat_gridded),
                float4(entry.lon_gridded),
                float4(entry.latlon_id_gridded.map(|id| id.value())),
            ])?;
        }

        writer.flush()?;
        Ok(())
    }

    pub fn write_observations(&mut self, records: &[ObservationRecord], path: &Path) -> Result<usize> {
        let rows: Vec<Row> = records.iter().map(|r| self.observation_row(r)).collect();
        self.write_rows(rows, path)
    }

    /// Write one day's records to a dated file from `template` (`%Y%m%d` tokens)
    pub fn write_daily(
        &mut self,
        records: &[ObservationRecord],
        template: &str,
        day: NaiveDate,
    ) -> Result<PathBuf> {
        let path = PathBuf::from(expand_date_template(template, &day.and_time(chrono::NaiveTime::MIN))?);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.write_observations(records, &path)?;
        Ok(path)
    }

    pub fn write_matched(&mut self, table: &MatchedTable, path: &Path) -> Result<usize> {
        let rows: Vec<Row> = table
            .records
            .iter()
            .map(|r| self.matched_row(r, &table.model_columns))
            .collect();
        self.write_rows(rows, path)
    }

    /// Write serializable rows (statistics tables) with a derived header
    pub fn write_serialized<T: Serialize>(&self, rows: &[T], path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn write_rows(&mut self, rows: Vec<Row>, path: &Path) -> Result<usize> {
        let exists = path.is_file();
        let path_buf = path.to_path_buf();
        let append = exists && (self.append || self.opened_files.contains(&path_buf));

        let header = if append {
            existing_header(path)?
        } else {
            ordered_header(&rows)
        };

        if append {
            let known: HashSet<&str> = header.iter().map(String::as_str).collect();
            let dropped: HashSet<&str> = rows
                .iter()
                .flat_map(|r| r.iter().map(|(c, _)| c.as_str()))
                .filter(|c| !known.contains(c))
                .collect();
            if !dropped.is_empty() {
                warn!(
                    "Columns {:?} are not in the header of {} and are not written",
                    dropped,
                    path.display()
                );
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        let mut writer = csv::Writer::from_writer(file);
        if !append {
            writer.write_record(&header)?;
        }

        for row in &rows {
            let values: HashMap<&str, &str> = row.iter().map(|(c, v)| (c.as_str(), v.as_str())).collect();
            writer.write_record(header.iter().map(|c| values.get(c.as_str()).copied().unwrap_or("")))?;
        }
        writer.flush()?;

        info!("{} values written to {}", rows.len(), path.display());
        if !self.opened_files.contains(&path_buf) {
            self.opened_files.push(path_buf);
        }
        Ok(rows.len())
    }

    fn float(&self, value: Option<f64>) -> String {
        match value {
            Some(v) if !v.is_nan() => {
                let v = match self.nfloats {
                    Some(n) => {
                        let scale = 10f64.powi(n as i32);
                        (v * scale).round() / scale
                    }
                    None => v,
                };
                format!("{:.*}", FLOAT_DECIMALS, v)
            }
            _ => String::new(),
        }
    }

    fn observation_row(&self, record: &ObservationRecord) -> Row {
        let mut row: Row = vec![
            ("ISO8601".to_string(), record.timestamp.format(TIMESTAMP_FORMAT).to_string()),
        ];
        if let Some(local) = record.local_time {
            row.push(("localtime".to_string(), local.format(LOCAL_TIME_FORMAT).to_string()));
        }
        row.push(("location".to_string(), record.location.clone()));
        row.push(("original_station_name".to_string(), record.original_station_name.clone()));
        if let Some(country) = &record.country {
            row.push(("country".to_string(), country.clone()));
        }
        row.push(("lat".to_string(), self.float(Some(record.lat))));
        row.push(("lon".to_string(), self.float(Some(record.lon))));
        if record.latlon_id.is_some() {
            row.push(("latlon_id".to_string(), float4(record.latlon_id)));
        }
        if let Some(gridded) = &record.location_gridded {
            row.push(("location_gridded".to_string(), gridded.clone()));
            row.push(("lat_gridded".to_string(), self.float(record.lat_gridded)));
            row.push(("lon_gridded".to_string(), self.float(record.lon_gridded)));
        }
        row.push(("obstype".to_string(), record.obstype.clone()));
        row.push(("unit".to_string(), record.unit.to_string()));
        row.push(("value".to_string(), self.float(Some(record.value))));
        if let Some(source) = &record.source {
            row.push(("source".to_string(), source.clone()));
        }
        for (column, value) in &record.numeric {
            row.push((column.clone(), self.float(Some(*value))));
        }
        for (column, value) in &record.metadata {
            row.push((column.clone(), value.clone()));
        }
        row
    }

    fn matched_row(&self, record: &MatchedRecord, model_columns: &[String]) -> Row {
        let mut row = self.observation_row(&record.observation);
        for column in model_columns {
            row.push((column.clone(), self.float(record.model_value(column))));
        }
        row.push((OBS_COLUMN.to_string(), self.float(record.obs_model_units)));
        row.push((UNIT_COLUMN.to_string(), record.model_unit.clone()));
        row.push(("season".to_string(), record.season.to_string()));
        if let Some(region) = &record.region {
            row.push(("regionID".to_string(), region.region_id.to_string()));
            row.push(("region".to_string(), region.region.clone()));
            row.push(("regionShortName".to_string(), region.region_short_name.clone()));
        }
        row
    }
}

impl Default for CsvWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn float4(value: Option<f64>) -> String {
    match value {
        Some(v) if !v.is_nan() => format!("{:.4}", v),
        _ => String::new(),
    }
}

/// Known leading columns first, the rest in first-seen order
fn ordered_header(rows: &[Row]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut all = Vec::new();
    for row in rows {
        for (column, _) in row {
            if seen.insert(column.as_str()) {
                all.push(column.clone());
            }
        }
    }

    let mut header: Vec<String> = OBS_HEADER_ORDER
        .iter()
        .filter(|c| seen.contains(**c))
        .map(|c| c.to_string())
        .collect();
    header.extend(all.into_iter().filter(|c| !OBS_HEADER_ORDER.contains(&c.as_str())));
    header
}

fn existing_header(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)?;
    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if header.is_empty() {
        return Err(ProcessingError::InvalidFormat(format!(
            "{} has no header to append to",
            path.display()
        )));
    }
    Ok(header)
}
