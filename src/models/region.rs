use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// A named lat/lon box; bounds are half-open, `[min, max)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_bounds"))]
pub struct RegionBox {
    #[serde(default)]
    pub name: String,

    #[validate(range(min = -90.0, max = 90.0))]
    pub minlat: f64,

    #[validate(range(min = -90.0, max = 90.0))]
    pub maxlat: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub minlon: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub maxlon: f64,

    #[serde(rename = "regionID")]
    pub region_id: i64,

    #[serde(default)]
    pub region_shortname: Option<String>,
}

fn validate_bounds(region: &RegionBox) -> Result<(), ValidationError> {
    if region.minlat >= region.maxlat || region.minlon >= region.maxlon {
        return Err(ValidationError::new("region_bounds_not_ordered"));
    }
    Ok(())
}

impl RegionBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.minlat && lat < self.maxlat && lon >= self.minlon && lon < self.maxlon
    }
}

/// Region columns attached to a matched record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLabel {
    pub region_id: i64,
    pub region: String,
    pub region_short_name: String,
}

impl Default for RegionLabel {
    fn default() -> Self {
        Self {
            region_id: 0,
            region: crate::utils::constants::UNKNOWN.to_string(),
            region_short_name: crate::utils::constants::UNKNOWN.to_string(),
        }
    }
}

impl From<&RegionBox> for RegionLabel {
    fn from(region: &RegionBox) -> Self {
        Self {
            region_id: region.region_id,
            region: region.name.clone(),
            region_short_name: region
                .region_shortname
                .clone()
                .unwrap_or_else(|| crate::utils::constants::UNKNOWN.to_string()),
        }
    }
}
