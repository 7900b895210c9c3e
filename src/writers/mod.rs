pub mod csv_writer;
pub mod parquet_writer;

pub use csv_writer::CsvWriter;
pub use parquet_writer::{MatchedSample, ParquetFileInfo, ParquetWriter};
