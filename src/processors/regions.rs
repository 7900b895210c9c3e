use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;
use validator::Validate;

use crate::error::{ProcessingError, Result};
use crate::models::{MatchedTable, RegionBox, RegionLabel};

/// Named lat/lon boxes used to label matched records
#[derive(Debug, Clone, Default)]
pub struct RegionSet {
    regions: Vec<RegionBox>,
}

impl RegionSet {
    pub fn new(regions: Vec<RegionBox>) -> Result<Self> {
        for region in &regions {
            region.validate()?;
        }
        Ok(Self { regions })
    }

    /// Load a YAML map of region name to box; boxes are checked in name order
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProcessingError::Config(format!("Cannot read regions file {}: {}", path.display(), e))
        })?;
        let set = Self::from_yaml_str(&content)?;
        info!("Loaded {} regions from {}", set.len(), path.display());
        Ok(set)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let named: BTreeMap<String, RegionBox> = serde_yaml::from_str(content)?;
        let regions = named
            .into_iter()
            .map(|(name, mut region)| {
                region.name = name;
                region
            })
            .collect();
        Self::new(regions)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn regions(&self) -> &[RegionBox] {
        &self.regions
    }

    /// Label of the last box containing the point, `unknown` when none does
    pub fn label(&self, lat: f64, lon: f64) -> RegionLabel {
        self.regions
            .iter()
            .rev()
            .find(|region| region.contains(lat, lon))
            .map(RegionLabel::from)
            .unwrap_or_default()
    }

    pub fn assign(&self, table: &mut MatchedTable) {
        for record in &mut table.records {
            record.region = Some(self.label(record.observation.lat, record.observation.lon));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchedRecord, ObsUnit, ObservationRecord};
    use chrono::NaiveDate;

    const REGIONS_YAML: &str = r#"
Europe:
  minlat: 35.0
  maxlat: 70.0
  minlon: -10.0
  maxlon: 40.0
  regionID: 1
  region_shortname: EU
Mediterranean:
  minlat: 30.0
  maxlat: 45.0
  minlon: -5.0
  maxlon: 36.0
  regionID: 2
"#;

    #[test]
    fn test_load_regions_from_yaml() -> Result<()> {
        let regions = RegionSet::from_yaml_str(REGIONS_YAML)?;
        assert_eq!(regions.len(), 2);
        assert_eq!(regions.regions()[0].name, "Europe");
        assert_eq!(regions.regions()[1].region_shortname, None);
        Ok(())
    }

    #[test]
    fn test_last_matching_region_wins() -> Result<()> {
        let regions = RegionSet::from_yaml_str(REGIONS_YAML)?;

        let overlap = regions.label(40.0, 10.0);
        assert_eq!(overlap.region, "Mediterranean");
        assert_eq!(overlap.region_short_name, "unknown");

        let north = regions.label(60.0, 10.0);
        assert_eq!(north.region_id, 1);
        assert_eq!(north.region_short_name, "EU");

        assert_eq!(regions.label(-30.0, 150.0), RegionLabel::default());
        Ok(())
    }

    #[test]
    fn test_assign_labels_every_record() -> Result<()> {
        let regions = RegionSet::from_yaml_str(REGIONS_YAML)?;
        let timestamp = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let mut table = MatchedTable::new(vec![
            MatchedRecord::new(ObservationRecord::new(timestamp, "A", 60.0, 10.0, "o3", ObsUnit::Ppbv, 1.0)),
            MatchedRecord::new(ObservationRecord::new(timestamp, "B", 0.0, 0.0, "o3", ObsUnit::Ppbv, 1.0)),
        ]);

        regions.assign(&mut table);
        assert_eq!(table.records[0].region.as_ref().map(|r| r.region_id), Some(1));
        assert_eq!(table.records[1].region.as_ref().map(|r| r.region_id), Some(0));
        Ok(())
    }

    #[test]
    fn test_invalid_box_rejected() {
        let yaml = "Broken:\n  minlat: 10\n  maxlat: 5\n  minlon: 0\n  maxlon: 1\n  regionID: 9\n";
        assert!(RegionSet::from_yaml_str(yaml).is_err());
    }
}
