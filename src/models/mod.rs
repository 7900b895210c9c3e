pub mod grid;
pub mod matched;
pub mod observation;
pub mod region;
pub mod season;
pub mod station;
pub mod unit;

pub use grid::{GriddedField, GriddedFields};
pub use matched::{MatchedRecord, MatchedTable, WideRow};
pub use observation::ObservationRecord;
pub use region::{RegionBox, RegionLabel};
pub use season::Season;
pub use station::{gridded_station_name, LatLonId, StationEntry};
pub use unit::ObsUnit;
