use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use validator::Validate;

use crate::utils::coordinates::{latlon_scalar, round_coordinate};

/// Station identity scalar derived from a rounded (lat, lon) pair.
///
/// Equality and hashing are bitwise, ordering is total, so the id can key
/// maps and sort deterministically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LatLonId(f64);

impl LatLonId {
    /// Identity of an unrounded coordinate pair
    pub fn from_coordinates(lat: f64, lon: f64) -> Self {
        LatLonId(latlon_scalar(round_coordinate(lat), round_coordinate(lon)))
    }

    pub fn from_raw(value: f64) -> Self {
        LatLonId(value)
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl PartialEq for LatLonId {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for LatLonId {}

impl Hash for LatLonId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for LatLonId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LatLonId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for LatLonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

/// One row of the station registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct StationEntry {
    #[validate(length(min = 1))]
    pub location: String,

    #[validate(range(min = -90.0, max = 90.0))]
    pub lat: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub lon: f64,

    pub latlon_id: LatLonId,
    pub original_station_name: String,
    pub location_gridded: String,
    pub lat_gridded: Option<f64>,
    pub lon_gridded: Option<f64>,
    pub latlon_id_gridded: Option<LatLonId>,
}

impl StationEntry {
    /// Entry for an already rounded coordinate pair without a gridded cell
    pub fn new(
        location: impl Into<String>,
        lat: f64,
        lon: f64,
        original_station_name: impl Into<String>,
    ) -> Self {
        Self {
            location: location.into(),
            lat,
            lon,
            latlon_id: LatLonId::from_raw(latlon_scalar(lat, lon)),
            original_station_name: original_station_name.into(),
            location_gridded: crate::utils::constants::UNKNOWN.to_string(),
            lat_gridded: None,
            lon_gridded: None,
            latlon_id_gridded: None,
        }
    }

    /// Snap this station onto a grid cell centre
    pub fn with_grid_cell(mut self, lat_gridded: f64, lon_gridded: f64) -> Self {
        self.location_gridded = gridded_station_name(lat_gridded, lon_gridded);
        self.lat_gridded = Some(lat_gridded);
        self.lon_gridded = Some(lon_gridded);
        self.latlon_id_gridded = Some(LatLonId::from_coordinates(lat_gridded, lon_gridded));
        self
    }

    pub fn is_placeholder(&self) -> bool {
        self.location == crate::utils::constants::UNKNOWN
    }
}

/// Human-readable name of a grid cell, e.g. `Station_0010.50E_045.50N`
pub fn gridded_station_name(lat: f64, lon: f64) -> String {
    format!("Station_{:07.2}E_{:06.2}N", lon, lat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_latlon_id_equality() {
        let a = LatLonId::from_coordinates(51.50741, -0.12784);
        let b = LatLonId::from_coordinates(51.50739, -0.12776);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));

        let c = LatLonId::from_coordinates(51.5075, -0.1278);
        assert!(a < c);
    }

    #[test]
    fn test_station_entry_with_grid_cell() {
        let station = StationEntry::new("Station0000001", 45.1234, 10.4321, "Milano Verziere")
            .with_grid_cell(45.5, 10.5);

        assert!(station.validate().is_ok());
        assert_eq!(station.location_gridded, "Station_0010.50E_045.50N");
        assert_eq!(station.lat_gridded, Some(45.5));
        assert!(!station.is_placeholder());
    }

    #[test]
    fn test_gridded_station_name_negative() {
        assert_eq!(gridded_station_name(-33.5, -70.5), "Station_-070.50E_-33.50N");
    }

    #[test]
    fn test_invalid_coordinates() {
        let station = StationEntry::new("Station0000001", 91.0, 0.0, "Nowhere");
        assert!(station.validate().is_err());
    }
}
