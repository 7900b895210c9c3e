use crate::error::{ProcessingError, Result};
use crate::utils::constants::{COORDINATE_DECIMALS, LATLON_ID_SCALE};

/// Round a coordinate to 4 decimals, ties to even
///
/// # Examples
/// ```
/// use cfobs_processor::utils::round_coordinate;
///
/// assert_eq!(round_coordinate(51.50745), 51.5074);
/// assert_eq!(round_coordinate(round_coordinate(-0.127849)), -0.1278);
/// ```
pub fn round_coordinate(value: f64) -> f64 {
    let scale = 10f64.powi(COORDINATE_DECIMALS);
    (value * scale).round_ties_even() / scale
}

/// Combine a (lat, lon) pair into a single monotonic scalar.
///
/// Both inputs are expected to be rounded to 4 decimals already: one step in
/// latitude (1e-4 * 1e7 = 1000) is wider than the whole longitude range (360),
/// so no two rounded pairs collide.
pub fn latlon_scalar(lat: f64, lon: f64) -> f64 {
    (lat + 90.0) * LATLON_ID_SCALE + (lon + 180.0)
}

/// Index of the axis value closest to `target`; the first one wins on ties
pub fn nearest_index(axis: &[f64], target: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;

    for (i, value) in axis.iter().enumerate() {
        let distance = (value - target).abs();
        if distance.is_nan() {
            continue;
        }
        match best {
            Some((_, d)) if distance >= d => {}
            _ => best = Some((i, distance)),
        }
    }

    best.map(|(i, _)| i)
}

/// Cell-centre latitudes and longitudes of a global regular grid
pub fn regular_grid(resolution: f64) -> Result<(Vec<f64>, Vec<f64>)> {
    if !(resolution > 0.0) || !resolution.is_finite() {
        return Err(ProcessingError::Config(format!(
            "Invalid grid resolution: {}",
            resolution
        )));
    }

    Ok((
        centred_axis(-90.0, 90.0, resolution),
        centred_axis(-180.0, 180.0, resolution),
    ))
}

fn centred_axis(start: f64, end: f64, step: f64) -> Vec<f64> {
    let first = start + step / 2.0;
    let mut axis = Vec::new();
    let mut i = 0usize;
    loop {
        let value = first + i as f64 * step;
        if value >= end {
            break;
        }
        axis.push(value);
        i += 1;
    }
    axis
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_round_coordinate_is_idempotent() {
        for value in [51.50745, -0.127849, 89.99995, -179.99996, 0.00005, 12.34567891] {
            let once = round_coordinate(value);
            assert_eq!(round_coordinate(once), once);
        }
    }

    #[test]
    fn test_round_coordinate_values() {
        assert_eq!(round_coordinate(-33.86881), -33.8688);
        assert_eq!(round_coordinate(151.20929), 151.2093);
        assert_eq!(round_coordinate(10.0), 10.0);
    }

    #[test]
    fn test_latlon_scalar_is_injective() {
        let mut seen = HashSet::new();
        for i in -20..20 {
            for j in -20..20 {
                let lat = round_coordinate(45.0 + i as f64 * 1.0e-4);
                let lon = round_coordinate(179.99 + j as f64 * 1.0e-4);
                assert!(seen.insert(latlon_scalar(lat, lon).to_bits()));
            }
        }
        // Extremes of the longitude range never reach the next latitude step
        assert!(latlon_scalar(10.0, 180.0) < latlon_scalar(10.0001, -180.0));
    }

    #[test]
    fn test_nearest_index_first_occurrence() {
        let axis = [0.0, 1.0, 2.0, 3.0];
        assert_eq!(nearest_index(&axis, 1.4), Some(1));
        assert_eq!(nearest_index(&axis, 1.5), Some(1));
        assert_eq!(nearest_index(&axis, -7.0), Some(0));
        assert_eq!(nearest_index(&axis, 10.0), Some(3));
        assert_eq!(nearest_index(&[], 1.0), None);
    }

    #[test]
    fn test_regular_grid() {
        let (lats, lons) = regular_grid(1.0).unwrap();
        assert_eq!(lats.len(), 180);
        assert_eq!(lons.len(), 360);
        assert_eq!(lats[0], -89.5);
        assert_eq!(lons[359], 179.5);

        let (lats, lons) = regular_grid(2.5).unwrap();
        assert_eq!(lats.len(), 72);
        assert_eq!(lons.len(), 144);

        assert!(regular_grid(0.0).is_err());
        assert!(regular_grid(-1.0).is_err());
    }
}
