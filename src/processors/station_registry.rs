use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ProcessingError, Result};
use crate::models::{LatLonId, ObservationRecord, StationEntry};
use crate::readers::StationReader;
use crate::utils::constants::DEFAULT_STATION_PREFIX;
use crate::utils::coordinates::{nearest_index, round_coordinate};
use crate::utils::filename::substitute_key;
use crate::writers::CsvWriter;

/// Append-only mapping from rounded coordinates to canonical station names
#[derive(Debug, Clone)]
pub struct StationRegistry {
    entries: Vec<StationEntry>,
    index: HashMap<LatLonId, usize>,
    prefix: String,
}

impl StationRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            prefix: DEFAULT_STATION_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn from_entries(entries: Vec<StationEntry>) -> Self {
        let mut registry = Self::new();
        for entry in entries {
            if entry.is_placeholder() || registry.index.contains_key(&entry.latlon_id) {
                continue;
            }
            registry.index.insert(entry.latlon_id, registry.entries.len());
            registry.entries.push(entry);
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[StationEntry] {
        &self.entries
    }

    pub fn get(&self, id: &LatLonId) -> Option<&StationEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    /// Assign canonical and gridded station names to every row, registering
    /// unseen coordinates first. Rows come back stably sorted by timestamp.
    ///
    /// `grid` holds the cell-centre latitudes and longitudes of the coarse
    /// output grid; without it new stations get no gridded cell.
    pub fn resolve(
        &mut self,
        rows: Vec<ObservationRecord>,
        grid: Option<(&[f64], &[f64])>,
    ) -> Result<Vec<ObservationRecord>> {
        let total = rows.len();
        let mut rows: Vec<ObservationRecord> = rows
            .into_iter()
            .filter(|row| row.lat.is_finite() && row.lon.is_finite())
            .collect();
        if rows.len() < total {
            debug!("Skipped {} rows without a finite position", total - rows.len());
        }
        let mut ids = Vec::with_capacity(rows.len());

        for row in rows.iter_mut() {
            row.lat = round_coordinate(row.lat);
            row.lon = round_coordinate(row.lon);
            ids.push(LatLonId::from_coordinates(row.lat, row.lon));
        }

        // New identities in ascending order, lexicographically smallest name wins
        let mut unseen: BTreeMap<LatLonId, (&ObservationRecord, &str)> = BTreeMap::new();
        for (row, id) in rows.iter().zip(&ids) {
            if self.index.contains_key(id) {
                continue;
            }
            unseen
                .entry(*id)
                .and_modify(|(_, name)| {
                    if row.original_station_name.as_str() < *name {
                        *name = row.original_station_name.as_str();
                    }
                })
                .or_insert((row, row.original_station_name.as_str()));
        }

        let first_new = self.entries.len();
        let new_entries: Vec<StationEntry> = unseen
            .into_iter()
            .enumerate()
            .map(|(i, (_, (row, name)))| {
                let location = format!("{}{:07}", self.prefix, first_new + i);
                let entry = StationEntry::new(location, row.lat, row.lon, name);
                match grid.and_then(|(lats, lons)| {
                    Some((
                        lats[nearest_index(lats, row.lat)?],
                        lons[nearest_index(lons, row.lon)?],
                    ))
                }) {
                    Some((lat_gridded, lon_gridded)) => entry.with_grid_cell(lat_gridded, lon_gridded),
                    None => entry,
                }
            })
            .collect();

        if !new_entries.is_empty() {
            debug!(
                "Registering {} new stations ({} known)",
                new_entries.len(),
                first_new
            );
        }
        for entry in new_entries {
            self.index.insert(entry.latlon_id, self.entries.len());
            self.entries.push(entry);
        }

        for (row, id) in rows.iter_mut().zip(&ids) {
            let entry = self.get(id).ok_or_else(|| {
                ProcessingError::MissingData(format!("station for identity {}", id))
            })?;
            row.location = entry.location.clone();
            row.latlon_id = Some(id.value());
            row.location_gridded = Some(entry.location_gridded.clone());
            row.lat_gridded = entry.lat_gridded;
            row.lon_gridded = entry.lon_gridded;
        }

        rows.sort_by_key(|row| row.timestamp);
        Ok(rows)
    }

    /// Load a registry; `%t` in the path is replaced by `obs_key`. A missing
    /// file yields an empty registry.
    pub fn load(path: &str, obs_key: &str) -> Result<Self> {
        let path = PathBuf::from(substitute_key(path, obs_key));
        if !path.is_file() {
            info!("No station registry at {}, starting empty", path.display());
            return Ok(Self::new());
        }

        let entries = StationReader::new().read_registry(&path)?;
        info!("Loaded {} stations from {}", entries.len(), path.display());
        Ok(Self::from_entries(entries))
    }

    /// Write the registry; nothing is written for an empty registry
    pub fn save(&self, path: &str, obs_key: &str) -> Result<Option<PathBuf>> {
        let entries: Vec<&StationEntry> = self.entries.iter().filter(|e| !e.is_placeholder()).collect();
        if entries.is_empty() {
            return Ok(None);
        }

        let path = PathBuf::from(substitute_key(path, obs_key));
        create_parent_dir(&path)?;
        CsvWriter::new().write_registry(&entries, &path)?;
        info!("Wrote {} stations to {}", entries.len(), path.display());
        Ok(Some(path))
    }
}

impl Default for StationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObsUnit;
    use crate::utils::coordinates::regular_grid;
    use chrono::{NaiveDate, NaiveDateTime};
    use tempfile::TempDir;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 3, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn row(hour: u32, name: &str, lat: f64, lon: f64) -> ObservationRecord {
        ObservationRecord::new(at(hour), name, lat, lon, "no2", ObsUnit::MassConcentration, 1.0)
    }

    #[test]
    fn test_new_stations_are_named_in_identity_order() -> Result<()> {
        let mut registry = StationRegistry::new();
        let rows = vec![
            row(3, "North", 60.0, 10.0),
            row(1, "South", -30.0, 10.0),
            row(2, "South B", -30.00001, 10.0),
        ];

        let resolved = registry.resolve(rows, None)?;

        assert_eq!(registry.len(), 2);
        // sorted by timestamp
        assert_eq!(resolved[0].original_station_name, "South");
        assert_eq!(resolved[0].location, "Station0000000");
        assert_eq!(resolved[1].location, "Station0000000");
        assert_eq!(resolved[2].location, "Station0000001");
        assert_eq!(registry.entries()[0].original_station_name, "South");
        assert_eq!(resolved[0].location_gridded.as_deref(), Some("unknown"));
        assert_eq!(resolved[0].lat_gridded, None);
        Ok(())
    }

    #[test]
    fn test_resolve_is_idempotent() -> Result<()> {
        let mut registry = StationRegistry::new();
        let rows = vec![row(0, "A", 12.34567, 98.76543), row(0, "B", -1.0, -2.0)];

        let first = registry.resolve(rows.clone(), None)?;
        let second = registry.resolve(rows, None)?;

        assert_eq!(registry.len(), 2);
        let names = |rows: &[ObservationRecord]| rows.iter().map(|r| r.location.clone()).collect::<Vec<_>>();
        assert_eq!(names(&first), names(&second));
        Ok(())
    }

    #[test]
    fn test_numbering_continues_from_registry_size() -> Result<()> {
        let mut registry = StationRegistry::new();
        registry.resolve(vec![row(0, "A", 1.0, 1.0)], None)?;
        let resolved = registry.resolve(vec![row(0, "B", 2.0, 2.0), row(0, "A", 1.0, 1.0)], None)?;

        assert_eq!(resolved[0].location, "Station0000001");
        assert_eq!(resolved[1].location, "Station0000000");
        Ok(())
    }

    #[test]
    fn test_gridded_snapping() -> Result<()> {
        let (lats, lons) = regular_grid(1.0)?;
        let mut registry = StationRegistry::new().with_prefix("Site");
        let resolved = registry.resolve(vec![row(0, "Milano", 45.4642, 9.19)], Some((&lats, &lons)))?;

        assert_eq!(resolved[0].location, "Site0000000");
        assert_eq!(resolved[0].lat_gridded, Some(45.5));
        assert_eq!(resolved[0].lon_gridded, Some(9.5));
        assert_eq!(resolved[0].location_gridded.as_deref(), Some("Station_0009.50E_045.50N"));
        Ok(())
    }

    #[test]
    fn test_rows_without_position_are_skipped() -> Result<()> {
        let mut registry = StationRegistry::new();
        let rows = vec![row(0, "A", f64::NAN, 1.0), row(1, "B", 2.0, f64::INFINITY), row(2, "C", 3.0, 3.0)];

        let resolved = registry.resolve(rows, None)?;

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].original_station_name, "C");
        assert_eq!(resolved[0].location, "Station0000000");
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn test_save_and_load_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let template = dir.path().join("stations_%t.csv");
        let template = template.to_str().unwrap();

        let empty = StationRegistry::new();
        assert_eq!(empty.save(template, "openaq")?, None);

        let (lats, lons) = regular_grid(2.0)?;
        let mut registry = StationRegistry::new();
        let rows = vec![row(0, "A", 12.34567, 98.76543), row(0, "B", -1.0, -2.0)];
        let first = registry.resolve(rows.clone(), Some((&lats, &lons)))?;

        let written = registry.save(template, "openaq")?.unwrap();
        assert!(written.ends_with("stations_openaq.csv"));

        let mut reloaded = StationRegistry::load(template, "openaq")?;
        assert_eq!(reloaded.entries(), registry.entries());

        let second = reloaded.resolve(rows, Some((&lats, &lons)))?;
        assert_eq!(reloaded.len(), 2);
        assert_eq!(first, second);

        let missing = StationRegistry::load(template, "other")?;
        assert!(missing.is_empty());
        Ok(())
    }
}
