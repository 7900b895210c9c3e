pub mod concurrent_reader;
pub mod gridded_reader;
pub mod observation_reader;
pub mod station_reader;

pub use concurrent_reader::ConcurrentObservationLoader;
pub use gridded_reader::{
    CompositeVariable, DatasetOpener, GridDataset, GriddedFieldReader, MapVariable, MemoryDataset,
    MemoryOpener, TimeAverageRequest,
};
pub use observation_reader::ObservationReader;
pub use station_reader::StationReader;
