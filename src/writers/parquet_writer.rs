use crate::error::{ProcessingError, Result};
use crate::models::{MatchedRecord, MatchedTable, ObsUnit, ObservationRecord, RegionLabel};
use crate::processors::gridder::GriddedCell;
use crate::utils::constants::{
    COMPRESSION_GZIP, COMPRESSION_LZ4, COMPRESSION_NONE, COMPRESSION_SNAPPY, COMPRESSION_ZSTD, DEFAULT_ROW_GROUP_SIZE,
    OBS_COLUMN, UNIT_COLUMN, UNKNOWN,
};
use arrow::array::*;
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDateTime;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel};
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

pub struct ParquetWriter {
    compression: Compression,
    row_group_size: usize,
}

/// Summary of a written Parquet file
#[derive(Debug)]
pub struct ParquetFileInfo {
    pub total_rows: i64,
    pub row_groups: i32,
    pub row_group_sizes: Vec<i64>,
    pub file_size: u64,
    pub compression: Compression,
    pub columns: Vec<String>,
}

impl ParquetFileInfo {
    pub fn summary(&self) -> String {
        format!(
            "Rows: {}\nRow groups: {}\nFile size: {:.1} MB\nCompression: {:?}\nColumns: {}",
            self.total_rows,
            self.row_groups,
            self.file_size as f64 / (1024.0 * 1024.0),
            self.compression,
            self.columns.join(", ")
        )
    }
}

/// One matched pair read back from a Parquet file
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedSample {
    pub timestamp: NaiveDateTime,
    pub location: String,
    pub obstype: String,
    pub model: Option<f64>,
    pub observation: Option<f64>,
}

impl ParquetWriter {
    pub fn new() -> Self {
        Self {
            compression: Compression::SNAPPY,
            row_group_size: DEFAULT_ROW_GROUP_SIZE,
        }
    }

    pub fn with_compression(mut self, compression: &str) -> Result<Self> {
        self.compression = match compression.to_lowercase().as_str() {
            COMPRESSION_SNAPPY => Compression::SNAPPY,
            COMPRESSION_GZIP => Compression::GZIP(GzipLevel::default()),
            COMPRESSION_LZ4 => Compression::LZ4,
            COMPRESSION_ZSTD => Compression::ZSTD(parquet::basic::ZstdLevel::default()),
            COMPRESSION_NONE => Compression::UNCOMPRESSED,
            _ => {
                return Err(ProcessingError::Config(format!(
                    "Unsupported compression: {}",
                    compression
                )))
            }
        };
        Ok(self)
    }

    pub fn with_row_group_size(mut self, size: usize) -> Self {
        self.row_group_size = size;
        self
    }

    fn properties(&self) -> WriterProperties {
        WriterProperties::builder()
            .set_compression(self.compression)
            .set_max_row_group_size(self.row_group_size)
            .build()
    }

    /// Write a matched table, one row per aggregated observation
    pub fn write_matched(&self, table: &MatchedTable, path: &Path) -> Result<()> {
        self.write_matched_batched(table, path, table.len().max(1))
    }

    /// Write a matched table in record batches of `batch_size` rows
    pub fn write_matched_batched(&self, table: &MatchedTable, path: &Path, batch_size: usize) -> Result<()> {
        if table.is_empty() {
            return Ok(());
        }

        let schema = self.create_matched_schema(&table.model_columns);
        let file = File::create(path)?;
        let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(self.properties()))?;

        for chunk in table.records.chunks(batch_size.max(1)) {
            let batch = self.matched_to_batch(chunk, &table.model_columns, schema.clone())?;
            writer.write(&batch)?;
        }

        writer.close()?;
        Ok(())
    }

    fn create_matched_schema(&self, model_columns: &[String]) -> Arc<Schema> {
        let mut fields = vec![
            Field::new("ISO8601", DataType::Timestamp(TimeUnit::Second, None), false),
            Field::new("location", DataType::Utf8, false),
            Field::new("original_station_name", DataType::Utf8, false),
            Field::new("lat", DataType::Float64, false),
            Field::new("lon", DataType::Float64, false),
            Field::new("location_gridded", DataType::Utf8, true),
            Field::new("obstype", DataType::Utf8, false),
            Field::new("unit", DataType::Utf8, false),
            Field::new("value", DataType::Float64, false),
        ];
        for column in model_columns {
            fields.push(Field::new(column, DataType::Float64, true));
        }
        fields.extend([
            Field::new(OBS_COLUMN, DataType::Float64, true),
            Field::new(UNIT_COLUMN, DataType::Utf8, false),
            Field::new("season", DataType::Utf8, false),
            Field::new("regionID", DataType::Int64, true),
            Field::new("region", DataType::Utf8, true),
        ]);

        Arc::new(Schema::new(fields))
    }

    fn matched_to_batch(
        &self,
        records: &[MatchedRecord],
        model_columns: &[String],
        schema: Arc<Schema>,
    ) -> Result<RecordBatch> {
        let timestamps: Vec<i64> = records
            .iter()
            .map(|r| r.observation.timestamp.and_utc().timestamp())
            .collect();
        let locations: Vec<&str> = records.iter().map(|r| r.observation.location.as_str()).collect();
        let names: Vec<&str> = records
            .iter()
            .map(|r| r.observation.original_station_name.as_str())
            .collect();
        let lats: Vec<f64> = records.iter().map(|r| r.observation.lat).collect();
        let lons: Vec<f64> = records.iter().map(|r| r.observation.lon).collect();
        let gridded: Vec<Option<&str>> = records
            .iter()
            .map(|r| r.observation.location_gridded.as_deref())
            .collect();
        let obstypes: Vec<&str> = records.iter().map(|r| r.observation.obstype.as_str()).collect();
        let units: Vec<String> = records.iter().map(|r| r.observation.unit.to_string()).collect();
        let values: Vec<f64> = records.iter().map(|r| r.observation.value).collect();

        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(TimestampSecondArray::from(timestamps)),
            Arc::new(StringArray::from(locations)),
            Arc::new(StringArray::from(names)),
            Arc::new(Float64Array::from(lats)),
            Arc::new(Float64Array::from(lons)),
            Arc::new(StringArray::from(gridded)),
            Arc::new(StringArray::from(obstypes)),
            Arc::new(StringArray::from(units)),
            Arc::new(Float64Array::from(values)),
        ];

        for column in model_columns {
            let model: Vec<Option<f64>> = records.iter().map(|r| r.model_value(column)).collect();
            columns.push(Arc::new(Float64Array::from(model)));
        }

        let obs: Vec<Option<f64>> = records.iter().map(|r| r.obs_model_units).collect();
        let model_units: Vec<&str> = records.iter().map(|r| r.model_unit.as_str()).collect();
        let seasons: Vec<&str> = records.iter().map(|r| r.season.name()).collect();
        let region_ids: Vec<Option<i64>> = records
            .iter()
            .map(|r| r.region.as_ref().map(|reg| reg.region_id))
            .collect();
        let regions: Vec<Option<&str>> = records
            .iter()
            .map(|r| r.region.as_ref().map(|reg| reg.region.as_str()))
            .collect();

        columns.push(Arc::new(Float64Array::from(obs)));
        columns.push(Arc::new(StringArray::from(model_units)));
        columns.push(Arc::new(StringArray::from(seasons)));
        columns.push(Arc::new(Int64Array::from(region_ids)));
        columns.push(Arc::new(StringArray::from(regions)));

        Ok(RecordBatch::try_new(schema, columns)?)
    }

    /// Write gridded cell means in long format
    pub fn write_gridded(&self, cells: &[GriddedCell], path: &Path) -> Result<()> {
        if cells.is_empty() {
            return Ok(());
        }

        let schema = Arc::new(Schema::new(vec![
            Field::new("time", DataType::Timestamp(TimeUnit::Second, None), false),
            Field::new("lat", DataType::Float64, false),
            Field::new("lon", DataType::Float64, false),
            Field::new("obstype", DataType::Utf8, false),
            Field::new("variable", DataType::Utf8, false),
            Field::new("value", DataType::Float64, false),
            Field::new("count", DataType::UInt32, false),
        ]));

        let times: Vec<i64> = cells.iter().map(|c| c.timestamp.and_utc().timestamp()).collect();
        let lats: Vec<f64> = cells.iter().map(|c| c.lat).collect();
        let lons: Vec<f64> = cells.iter().map(|c| c.lon).collect();
        let obstypes: Vec<&str> = cells.iter().map(|c| c.obstype.as_str()).collect();
        let variables: Vec<&str> = cells.iter().map(|c| c.variable.as_str()).collect();
        let values: Vec<f64> = cells.iter().map(|c| c.value).collect();
        let counts: Vec<u32> = cells.iter().map(|c| c.count).collect();

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(TimestampSecondArray::from(times)),
                Arc::new(Float64Array::from(lats)),
                Arc::new(Float64Array::from(lons)),
                Arc::new(StringArray::from(obstypes)),
                Arc::new(StringArray::from(variables)),
                Arc::new(Float64Array::from(values)),
                Arc::new(UInt32Array::from(counts)),
            ],
        )?;

        let file = File::create(path)?;
        let mut writer = ArrowWriter::try_new(file, schema, Some(self.properties()))?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    }

    /// Read the first `limit` matched pairs of `model_column` back from a file
    pub fn read_sample(&self, path: &Path, model_column: &str, limit: usize) -> Result<Vec<MatchedSample>> {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

        let file = File::open(path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
            .with_batch_size(limit.clamp(1, 8192))
            .build()?;

        let mut samples = Vec::new();
        for batch in reader {
            let batch = batch?;
            let times = column::<TimestampSecondArray>(&batch, "ISO8601")?;
            let locations = column::<StringArray>(&batch, "location")?;
            let obstypes = column::<StringArray>(&batch, "obstype")?;
            let model = column::<Float64Array>(&batch, model_column)?;
            let obs = column::<Float64Array>(&batch, OBS_COLUMN)?;

            for i in 0..batch.num_rows() {
                if samples.len() >= limit {
                    return Ok(samples);
                }
                let timestamp = chrono::DateTime::from_timestamp(times.value(i), 0)
                    .ok_or_else(|| ProcessingError::InvalidFormat("Invalid timestamp in Parquet file".to_string()))?
                    .naive_utc();
                samples.push(MatchedSample {
                    timestamp,
                    location: locations.value(i).to_string(),
                    obstype: obstypes.value(i).to_string(),
                    model: (!model.is_null(i)).then(|| model.value(i)),
                    observation: (!obs.is_null(i)).then(|| obs.value(i)),
                });
            }
        }

        Ok(samples)
    }

    /// Read a whole matched table back. Model columns are the nullable float
    /// columns between `value` and `conc_obs`.
    pub fn read_matched(&self, path: &Path) -> Result<MatchedTable> {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

        let file = File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let names: Vec<String> = builder.schema().fields().iter().map(|f| f.name().clone()).collect();
        let first = names.iter().position(|n| n == "value").map(|i| i + 1);
        let last = names.iter().position(|n| n == OBS_COLUMN);
        let model_columns: Vec<String> = match (first, last) {
            (Some(first), Some(last)) if first <= last => names[first..last].to_vec(),
            _ => {
                return Err(ProcessingError::InvalidFormat(format!(
                    "{} is not a matched table",
                    path.display()
                )))
            }
        };

        let mut records = Vec::new();
        for batch in builder.build()? {
            let batch = batch?;
            let times = column::<TimestampSecondArray>(&batch, "ISO8601")?;
            let locations = column::<StringArray>(&batch, "location")?;
            let names = column::<StringArray>(&batch, "original_station_name")?;
            let lats = column::<Float64Array>(&batch, "lat")?;
            let lons = column::<Float64Array>(&batch, "lon")?;
            let gridded = column::<StringArray>(&batch, "location_gridded")?;
            let obstypes = column::<StringArray>(&batch, "obstype")?;
            let units = column::<StringArray>(&batch, "unit")?;
            let values = column::<Float64Array>(&batch, "value")?;
            let obs = column::<Float64Array>(&batch, OBS_COLUMN)?;
            let model_units = column::<StringArray>(&batch, UNIT_COLUMN)?;
            let region_ids = column::<Int64Array>(&batch, "regionID")?;
            let regions = column::<StringArray>(&batch, "region")?;
            let models = model_columns
                .iter()
                .map(|name| Ok((name, column::<Float64Array>(&batch, name)?)))
                .collect::<Result<Vec<_>>>()?;

            for i in 0..batch.num_rows() {
                let timestamp = chrono::DateTime::from_timestamp(times.value(i), 0)
                    .ok_or_else(|| ProcessingError::InvalidFormat("Invalid timestamp in Parquet file".to_string()))?
                    .naive_utc();
                let mut observation = ObservationRecord::new(
                    timestamp,
                    names.value(i),
                    lats.value(i),
                    lons.value(i),
                    obstypes.value(i),
                    ObsUnit::parse(units.value(i)),
                    values.value(i),
                )
                .with_location(locations.value(i));
                observation.location_gridded = (!gridded.is_null(i)).then(|| gridded.value(i).to_string());

                let mut record = MatchedRecord::new(observation);
                for (name, array) in &models {
                    record
                        .model
                        .insert(name.to_string(), (!array.is_null(i)).then(|| array.value(i)));
                }
                record.obs_model_units = (!obs.is_null(i)).then(|| obs.value(i));
                record.model_unit = model_units.value(i).to_string();
                if !region_ids.is_null(i) {
                    record.region = Some(RegionLabel {
                        region_id: region_ids.value(i),
                        region: if regions.is_null(i) {
                            UNKNOWN.to_string()
                        } else {
                            regions.value(i).to_string()
                        },
                        region_short_name: UNKNOWN.to_string(),
                    });
                }
                records.push(record);
            }
        }

        let mut table = MatchedTable::new(records);
        table.model_columns = model_columns;
        Ok(table)
    }

    /// Get file statistics
    pub fn get_file_info(&self, path: &Path) -> Result<ParquetFileInfo> {
        use parquet::file::reader::{FileReader, SerializedFileReader};

        let file = File::open(path)?;
        let reader = SerializedFileReader::new(file)?;
        let metadata = reader.metadata();

        let file_metadata = metadata.file_metadata();
        let row_groups = metadata.num_row_groups();
        let total_rows = file_metadata.num_rows();
        let file_size = std::fs::metadata(path)?.len();
        let columns = file_metadata
            .schema_descr()
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let row_group_sizes = (0..row_groups)
            .map(|i| metadata.row_group(i).num_rows())
            .collect();

        let compression = if row_groups > 0 && metadata.row_group(0).num_columns() > 0 {
            metadata.row_group(0).column(0).compression()
        } else {
            self.compression
        };

        Ok(ParquetFileInfo {
            total_rows,
            row_groups: row_groups as i32,
            row_group_sizes,
            file_size,
            compression,
            columns,
        })
    }
}

impl Default for ParquetWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| ProcessingError::InvalidFormat(format!("Invalid or missing column '{}'", name)))
}
