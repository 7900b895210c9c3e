use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::config::{MappingEntry, MatchConfig};
use crate::error::{ProcessingError, Result};
use crate::models::{GriddedField, GriddedFields, MatchedRecord, MatchedTable, ObsUnit, ObservationRecord};
use crate::processors::quality_filter::QualityFilter;
use crate::processors::units::{conversion_field, convert_to_ppbv};
use crate::readers::GriddedFieldReader;
use crate::utils::constants::UNKNOWN;
use crate::utils::progress::ProgressReporter;

const PPBV: &str = "ppbv";

/// Matches aggregated hourly observations with the nearest model grid cell
pub struct ObservationMatcher {
    reader: GriddedFieldReader,
    show_progress: bool,
}

/// A mapping entry with everything needed to apply it
struct ActiveEntry<'a> {
    name: &'a str,
    entry: &'a MappingEntry,
    obstype: &'a str,
    cfvars: Vec<String>,
    column: String,
}

impl ActiveEntry<'_> {
    fn converts_to_ppbv(&self) -> bool {
        self.entry.unit.as_deref() == Some(PPBV)
    }
}

impl ObservationMatcher {
    pub fn new(reader: GriddedFieldReader) -> Self {
        Self {
            reader,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Aggregate observations to hourly station means and attach model values.
    ///
    /// A failed model read for any hour fails the whole call; no partial table
    /// is returned.
    pub fn match_observations(
        &self,
        rows: Vec<ObservationRecord>,
        config: &MatchConfig,
    ) -> Result<MatchedTable> {
        let entries = active_entries(config);
        check_conversion_prerequisites(&entries, config)?;

        let (rows, _) = QualityFilter::new().filter(rows);
        let rows: Vec<ObservationRecord> = rows
            .into_iter()
            .map(|mut row| {
                row.timestamp = row.hour();
                row
            })
            .collect();

        let Some(min_hour) = rows.iter().map(|r| r.timestamp).min() else {
            info!("No usable observations to match");
            return Ok(MatchedTable::new(Vec::new()));
        };

        let text_columns = most_frequent_text_columns(&rows);
        let raw_count = rows.len();
        let (aggregated, local_times) = aggregate(rows, min_hour);
        debug!("Aggregated {} rows into {} hourly means", raw_count, aggregated.len());

        let mut table = MatchedTable::new(aggregated.into_iter().map(MatchedRecord::new).collect());

        let mut by_hour: BTreeMap<NaiveDateTime, Vec<usize>> = BTreeMap::new();
        for (i, record) in table.records.iter().enumerate() {
            by_hour.entry(record.observation.timestamp).or_default().push(i);
        }

        let needs_conversion = entries.iter().any(ActiveEntry::converts_to_ppbv);
        let progress = ProgressReporter::new(by_hour.len() as u64, "Matching observations", !self.show_progress);

        for (hour, indices) in &by_hour {
            let fields = match self.reader.read(*hour, &config.cf_config) {
                Ok(fields) => fields,
                Err(e) => {
                    progress.abandon_with_message(&format!("Model read failed for {}", hour));
                    return Err(e);
                }
            };
            debug!("Read {} model fields for {}", fields.len(), hour);

            let conversion = if needs_conversion {
                Some(
                    conversion_field(&fields, &config.met.temperature, &config.met.pressure, 1.0)
                        .ok_or_else(|| ProcessingError::UnitConversion {
                            entry: hour.to_string(),
                            reason: format!(
                                "fields '{}' and '{}' were not read",
                                config.met.temperature, config.met.pressure
                            ),
                        })?,
                )
            } else {
                None
            };

            for entry in &entries {
                apply_entry(&mut table, indices, &fields, entry, conversion.as_ref())?;
            }
            progress.increment(1);
        }
        progress.finish_with_message("Matching complete");

        for record in &mut table.records {
            if let Some(columns) = text_columns.get(station_key(&record.observation)) {
                restore_text_columns(&mut record.observation, columns);
            }
        }

        for (record, local) in table.records.iter_mut().zip(local_times) {
            record.observation.local_time = local.and_then(|l| l.restore(min_hour));
        }

        info!(
            "Matched {} observations over {} hours with {} mapping entries",
            table.len(),
            by_hour.len(),
            entries.len()
        );
        Ok(table)
    }
}

fn active_entries(config: &MatchConfig) -> Vec<ActiveEntry<'_>> {
    let mut entries = Vec::new();
    for (name, entry) in &config.mapping {
        let Some(obstype) = entry.obstype.as_deref() else {
            warn!("`obstype` not defined for mapping {} - skipping", name);
            continue;
        };
        let cfvars = entry.source_variables();
        if cfvars.is_empty() {
            warn!("`cfvars` not defined for mapping {} - skipping", name);
            continue;
        }
        entries.push(ActiveEntry {
            name,
            entry,
            obstype,
            cfvars,
            column: entry.model_column(),
        });
    }
    entries
}

fn check_conversion_prerequisites(entries: &[ActiveEntry], config: &MatchConfig) -> Result<()> {
    for active in entries.iter().filter(|e| e.converts_to_ppbv()) {
        if active.entry.mw.is_none() {
            return Err(ProcessingError::UnitConversion {
                entry: active.name.to_string(),
                reason: "molecular weight (mw) is not set".to_string(),
            });
        }
        if !config.provides_meteorology() {
            return Err(ProcessingError::UnitConversion {
                entry: active.name.to_string(),
                reason: format!(
                    "no collection provides '{}' and '{}'",
                    config.met.temperature, config.met.pressure
                ),
            });
        }
    }
    Ok(())
}

fn apply_entry(
    table: &mut MatchedTable,
    indices: &[usize],
    fields: &GriddedFields,
    active: &ActiveEntry,
    conversion: Option<&GriddedField>,
) -> Result<()> {
    let sources: Vec<&GriddedField> = active
        .cfvars
        .iter()
        .filter_map(|var| {
            let field = fields.get(var);
            if field.is_none() {
                warn!("Variable {} of mapping {} was not read - skipping", var, active.name);
            }
            field
        })
        .collect();

    table.ensure_model_column(&active.column);
    let molar_scale = active.entry.mw.map_or(1.0, |mw| 1.0 / mw);
    let model_unit = active.entry.unit.clone().unwrap_or_else(|| UNKNOWN.to_string());

    for &i in indices {
        let record = &mut table.records[i];
        if record.observation.obstype != active.obstype {
            continue;
        }
        let (lat, lon) = (record.observation.lat, record.observation.lon);

        // A missing cell restarts the sum at zero on the next variable
        let mut sum = record.model_value(&active.column);
        for field in &sources {
            sum = field.nearest_value(lat, lon).map(|v| sum.unwrap_or(0.0) + v);
        }
        record.model.insert(active.column.clone(), sum);
        record.model_unit = model_unit.clone();

        let value = record.observation.value;
        if active.converts_to_ppbv() {
            let conv = conversion.and_then(|c| c.nearest_value(lat, lon));
            if conv.is_none() && record.observation.unit == ObsUnit::MassConcentration {
                record.obs_model_units = None;
                continue;
            }
            let converted = convert_to_ppbv(value, &record.observation.unit, conv, molar_scale)?;
            record.obs_model_units = Some(converted.value());
            record.unit_known = converted.is_known();
        } else {
            record.obs_model_units = Some(value);
        }
    }

    Ok(())
}

/// Station used for grouping; falls back to the provider name before registry resolution
fn station_key(record: &ObservationRecord) -> &str {
    if record.location.is_empty() {
        &record.original_station_name
    } else {
        &record.location
    }
}

/// Mean local time of a group, stored as seconds after the earliest hour
#[derive(Debug, Clone, Copy)]
struct LocalSeconds {
    seconds: f64,
    offset: FixedOffset,
}

impl LocalSeconds {
    fn restore(self, min_hour: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
        let utc = min_hour + Duration::milliseconds((self.seconds * 1000.0).round() as i64);
        Some(self.offset.from_utc_datetime(&utc))
    }
}

#[derive(Default)]
struct GroupAccumulator {
    first: Option<ObservationRecord>,
    count: usize,
    value: f64,
    lat: f64,
    lon: f64,
    numeric: BTreeMap<String, (f64, usize)>,
    local: Option<(f64, usize, FixedOffset)>,
}

impl GroupAccumulator {
    fn add(&mut self, record: ObservationRecord, min_hour: NaiveDateTime) {
        self.count += 1;
        self.value += record.value;
        self.lat += record.lat;
        self.lon += record.lon;

        for (column, value) in &record.numeric {
            if value.is_nan() {
                continue;
            }
            let (sum, n) = self.numeric.entry(column.clone()).or_default();
            *sum += value;
            *n += 1;
        }

        if let Some(local) = record.local_time {
            let seconds = (local.naive_utc() - min_hour).num_milliseconds() as f64 / 1000.0;
            let (sum, n, _) = self.local.get_or_insert((0.0, 0, *local.offset()));
            *sum += seconds;
            *n += 1;
        }

        if self.first.is_none() {
            self.first = Some(record);
        }
    }

    fn finish(self) -> Option<(ObservationRecord, Option<LocalSeconds>)> {
        let mut record = self.first?;
        let n = self.count as f64;
        record.value = self.value / n;
        record.lat = self.lat / n;
        record.lon = self.lon / n;
        record.numeric = self
            .numeric
            .into_iter()
            .map(|(column, (sum, count))| (column, sum / count as f64))
            .collect();
        record.local_time = None;

        let local = self.local.map(|(sum, count, offset)| LocalSeconds {
            seconds: sum / count as f64,
            offset,
        });
        Some((record, local))
    }
}

/// Mean of every (hour, station, obstype, unit) group, ordered by that key
fn aggregate(
    rows: Vec<ObservationRecord>,
    min_hour: NaiveDateTime,
) -> (Vec<ObservationRecord>, Vec<Option<LocalSeconds>>) {
    let mut groups: BTreeMap<(NaiveDateTime, String, String, ObsUnit), GroupAccumulator> = BTreeMap::new();
    for row in rows {
        let key = (
            row.timestamp,
            station_key(&row).to_string(),
            row.obstype.clone(),
            row.unit.clone(),
        );
        groups.entry(key).or_default().add(row, min_hour);
    }

    groups.into_values().filter_map(GroupAccumulator::finish).unzip()
}

/// Most frequent text column combination per station; ties go to the
/// lexicographically smallest combination
fn most_frequent_text_columns(rows: &[ObservationRecord]) -> HashMap<String, Vec<(String, String)>> {
    let mut counts: HashMap<String, HashMap<Vec<(String, String)>, usize>> = HashMap::new();
    for row in rows {
        *counts
            .entry(station_key(row).to_string())
            .or_default()
            .entry(row.text_columns())
            .or_default() += 1;
    }

    counts
        .into_iter()
        .filter_map(|(station, combinations)| {
            combinations
                .into_iter()
                .max_by(|(a, count_a), (b, count_b)| count_a.cmp(count_b).then_with(|| b.cmp(a)))
                .map(|(columns, _)| (station, columns))
        })
        .collect()
}

fn restore_text_columns(record: &mut ObservationRecord, columns: &[(String, String)]) {
    record.country = None;
    record.source = None;
    record.location_gridded = None;
    record.metadata.clear();
    record.set_text_columns(columns);
}
