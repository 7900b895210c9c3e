pub mod field_sampler;
pub mod gridder;
pub mod observation_matcher;
pub mod quality_filter;
pub mod regions;
pub mod station_registry;
pub mod units;

pub use field_sampler::FieldSampler;
pub use gridder::{GriddedCell, Gridder};
pub use observation_matcher::ObservationMatcher;
pub use quality_filter::{QualityFilter, QualityReport};
pub use regions::RegionSet;
pub use station_registry::StationRegistry;
pub use units::{conversion_factor_ugm3_to_ppbv, conversion_field, convert_to_ppbv, ConversionRule, Converted};
