/// Gas constant, J K-1 mol-1
pub const R_GAS: f64 = 8.3145;

/// Conversion factor from ppmv to ppbv
pub const PPM_TO_PPB: f64 = 1.0e3;

/// Default column names written by the matcher
pub const MODEL_COLUMN: &str = "conc_mod";
pub const OBS_COLUMN: &str = "conc_obs";
pub const UNIT_COLUMN: &str = "conc_unit";

/// Label used for unassigned units, stations and regions
pub const UNKNOWN: &str = "unknown";

/// Timestamp format of the observation CSV files
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Leading columns of an observation CSV, in write order
pub const OBS_HEADER_ORDER: [&str; 14] = [
    "ISO8601",
    "localtime",
    "location",
    "original_station_name",
    "country",
    "lat",
    "lon",
    "latlon_id",
    "location_gridded",
    "lat_gridded",
    "lon_gridded",
    "obstype",
    "unit",
    "value",
];

/// Columns of the station registry file
pub const REGISTRY_COLUMNS: [&str; 9] = [
    "location",
    "lat",
    "lon",
    "latlon_id",
    "original_station_name",
    "location_gridded",
    "lat_gridded",
    "lon_gridded",
    "latlon_id_gridded",
];

/// Station identities
pub const DEFAULT_STATION_PREFIX: &str = "Station";
pub const COORDINATE_DECIMALS: i32 = 4;
pub const LATLON_ID_SCALE: f64 = 1.0e7;

/// Matching defaults
pub const DEFAULT_GRID_RESOLUTION: f64 = 1.0;
pub const DEFAULT_MIN_OBS: usize = 2;
pub const DEFAULT_TEMPERATURE_FIELD: &str = "t10m";
pub const DEFAULT_PRESSURE_FIELD: &str = "ps";

/// Environment prefix for configuration overrides
pub const CONFIG_ENV_PREFIX: &str = "CFOBS";

/// Processing defaults
pub const DEFAULT_ROW_GROUP_SIZE: usize = 10000;

/// Parquet compression options
pub const COMPRESSION_SNAPPY: &str = "snappy";
pub const COMPRESSION_GZIP: &str = "gzip";
pub const COMPRESSION_LZ4: &str = "lz4";
pub const COMPRESSION_ZSTD: &str = "zstd";
pub const COMPRESSION_NONE: &str = "none";
