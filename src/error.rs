use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessingError>;

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Failed to read gridded data from {path}: {reason}")]
    GridRead { path: String, reason: String },

    #[error("Cannot convert {entry} to ppbv: {reason}")]
    UnitConversion { entry: String, reason: String },

    #[error("Parquet write error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Missing required data: {0}")]
    MissingData(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Async task error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl ProcessingError {
    pub fn grid_read(path: impl Into<String>, reason: impl ToString) -> Self {
        ProcessingError::GridRead {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(feature = "netcdf")]
impl From<netcdf::Error> for ProcessingError {
    fn from(e: netcdf::Error) -> Self {
        ProcessingError::grid_read("<netcdf>", e)
    }
}
