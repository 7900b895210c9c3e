use crate::error::{ProcessingError, Result};
use crate::models::StationEntry;
use crate::utils::constants::UNKNOWN;
use crate::utils::coordinates::round_coordinate;
use csv::StringRecord;
use std::path::Path;

/// Reads a station registry CSV written by a previous run
pub struct StationReader {
    delimiter: u8,
}

impl StationReader {
    pub fn new() -> Self {
        Self { delimiter: b',' }
    }

    /// Read registry entries in file order.
    ///
    /// Identity scalars are recomputed from the rounded coordinates rather than
    /// parsed, so they match ids computed for new observations bit for bit.
    pub fn read_registry(&self, path: &Path) -> Result<Vec<StationEntry>> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;

        let headers = reader.headers()?.clone();
        let column = |name: &str| headers.iter().position(|h| h.trim() == name);
        let location_col = column("location")
            .ok_or_else(|| ProcessingError::InvalidFormat("registry has no 'location' column".to_string()))?;
        let lat_col = column("lat")
            .ok_or_else(|| ProcessingError::InvalidFormat("registry has no 'lat' column".to_string()))?;
        let lon_col = column("lon")
            .ok_or_else(|| ProcessingError::InvalidFormat("registry has no 'lon' column".to_string()))?;
        let name_col = column("original_station_name");
        let gridded_col = column("location_gridded");
        let lat_gridded_col = column("lat_gridded");
        let lon_gridded_col = column("lon_gridded");

        let mut entries = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let location = field(&record, Some(location_col)).unwrap_or_default();
            if location.is_empty() || location == UNKNOWN {
                continue;
            }

            let lat = parse_float(&record, lat_col, line)?
                .ok_or_else(|| ProcessingError::InvalidFormat(format!("missing lat on line {}", line + 2)))?;
            let lon = parse_float(&record, lon_col, line)?
                .ok_or_else(|| ProcessingError::InvalidFormat(format!("missing lon on line {}", line + 2)))?;

            let original = field(&record, name_col).unwrap_or_else(|| location.clone());
            let mut entry = StationEntry::new(location, round_coordinate(lat), round_coordinate(lon), original);

            let lat_gridded = match lat_gridded_col {
                Some(col) => parse_float(&record, col, line)?,
                None => None,
            };
            let lon_gridded = match lon_gridded_col {
                Some(col) => parse_float(&record, col, line)?,
                None => None,
            };
            if let (Some(lat_g), Some(lon_g)) = (lat_gridded, lon_gridded) {
                entry = entry.with_grid_cell(lat_g, lon_g);
                if let Some(name) = field(&record, gridded_col) {
                    entry.location_gridded = name;
                }
            }

            entries.push(entry);
        }

        Ok(entries)
    }
}

impl Default for StationReader {
    fn default() -> Self {
        Self::new()
    }
}

fn field(record: &StringRecord, col: Option<usize>) -> Option<String> {
    col.and_then(|c| record.get(c))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Empty, NaN and the -999 bootstrap value are missing
fn parse_float(record: &StringRecord, col: usize, line: usize) -> Result<Option<f64>> {
    let Some(raw) = field(record, Some(col)) else {
        return Ok(None);
    };
    let value = raw.parse::<f64>().map_err(|_| {
        ProcessingError::InvalidFormat(format!("Invalid number '{}' on line {}", raw, line + 2))
    })?;
    if value.is_nan() || value == -999.0 {
        Ok(None)
    } else {
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_registry_file() -> Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        writeln!(
            temp_file,
            "location,lat,lon,latlon_id,original_station_name,location_gridded,lat_gridded,lon_gridded,latlon_id_gridded"
        )?;
        writeln!(
            temp_file,
            "Station0000000,51.5225,-0.1546,1415225179.8454,London Marylebone Road,Station_-000.50E_051.50N,51.5000,-0.5000,1415000179.5000"
        )?;
        writeln!(temp_file, "Station0000001,48.8566,2.3522,1388566182.3522,Paris,unknown,,,")?;
        writeln!(temp_file, "unknown,-999.0000,-999.0000,-999.0000,unknown,unknown,-999.0000,-999.0000,-999.0000")?;
        temp_file.flush()?;

        let entries = StationReader::new().read_registry(temp_file.path())?;
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].location, "Station0000000");
        assert_eq!(entries[0].original_station_name, "London Marylebone Road");
        assert_eq!(entries[0].lat_gridded, Some(51.5));
        assert_eq!(entries[0].location_gridded, "Station_-000.50E_051.50N");

        assert_eq!(entries[1].location_gridded, "unknown");
        assert_eq!(entries[1].lat_gridded, None);
        Ok(())
    }

    #[test]
    fn test_missing_required_column() -> Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        writeln!(temp_file, "location,lat")?;
        writeln!(temp_file, "Station0000000,10.0")?;
        temp_file.flush()?;

        assert!(StationReader::new().read_registry(temp_file.path()).is_err());
        Ok(())
    }
}
