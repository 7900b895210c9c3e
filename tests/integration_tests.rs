use cfobs_processor::analyzers::{AggregateStatistics, GroupBy};
use cfobs_processor::config::MatchConfig;
use cfobs_processor::models::{MatchedRecord, MatchedTable, ObsUnit, ObservationRecord};
use cfobs_processor::processors::{ObservationMatcher, RegionSet, StationRegistry};
use cfobs_processor::readers::{ConcurrentObservationLoader, GriddedFieldReader, MemoryDataset, MemoryOpener};
use cfobs_processor::utils::coordinates::regular_grid;
use cfobs_processor::writers::{CsvWriter, ParquetWriter};
use cfobs_processor::Result;
use chrono::{NaiveDate, NaiveDateTime};
use ndarray::{array, Array2, Array3};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const MAPPING_YAML: &str = r#"
cf_config:
  met:
    template: '/model/met.%Y%m%d.nc4'
    vars:
      t10m:
        name_on_file: 'T10M'
      ps:
        name_on_file: 'PS'
  chm:
    template: '/model/chm.%Y%m%d.nc4'
    vars:
      o3:
        name_on_file: 'O3'
      pm25_su:
        name_on_file: 'PM25su'
      pm25_ss:
        name_on_file: 'PM25ss'
mapping:
  o3:
    obstype: 'o3'
    cfvars: 'o3'
    unit: 'ppbv'
    mw: 48.0
  pm25:
    obstype: 'pm25'
    cfvars: ['pm25_su', 'pm25_ss']
    unit: 'ugm-3'
  incomplete:
    cfvars: 'o3'
"#;

const REGIONS_YAML: &str = r#"
Asia:
  minlat: 0.0
  maxlat: 60.0
  minlon: 60.0
  maxlon: 150.0
  regionID: 4
  region_shortname: AS
"#;

const OBS_CSV: &str = "\
ISO8601,location,lat,lon,obstype,unit,value
2020-07-01T10:15:00Z,Delhi Chanakyapuri,40.0,80.0,o3,ppbv,30
2020-07-01T10:45:00Z,Delhi Chanakyapuri,40.0,80.0,o3,ppbv,50
2020-07-01T10:20:00Z,Delhi Chanakyapuri,40.0,80.0,pm25,ugm-3,15
2020-07-01T10:30:00Z,Delhi Chanakyapuri,40.0,80.0,o3,ppbv,
";

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 7, 1).unwrap()
}

/// 2x2 grid at lats [-45, 45], lons [-90, 90], constant over the day
fn hourly(dataset: MemoryDataset, name: &str, grid: Array2<f64>) -> MemoryDataset {
    let series = Array3::from_shape_fn((24, 2, 2), |(_, i, j)| grid[[i, j]]);
    dataset.with_variable(name, series)
}

fn model_reader() -> GriddedFieldReader {
    let times: Vec<NaiveDateTime> = (0..24).map(|h| day().and_hms_opt(h, 0, 0).unwrap()).collect();
    let empty = || MemoryDataset::new(vec![-45.0, 45.0], vec![-90.0, 90.0], times.clone());

    let met = hourly(
        hourly(empty(), "T10M", Array2::from_elem((2, 2), 298.15)),
        "PS",
        Array2::from_elem((2, 2), 101325.0),
    );
    let chm = [
        ("O3", array![[0.0, 0.0], [0.0, 35.0]]),
        ("PM25su", array![[0.0, 0.0], [0.0, 12.0]]),
        ("PM25ss", array![[0.0, 0.0], [0.0, 8.0]]),
    ]
    .into_iter()
    .fold(empty(), |dataset, (name, grid)| hourly(dataset, name, grid));

    let opener = MemoryOpener::new()
        .with_dataset("/model/met.20200701.nc4", met)
        .with_dataset("/model/chm.20200701.nc4", chm);
    GriddedFieldReader::new(Arc::new(opener))
}

fn write_daily_file(dir: &Path) -> Result<()> {
    std::fs::write(dir.join("obs_20200701.csv"), OBS_CSV)?;
    Ok(())
}

#[tokio::test]
async fn test_end_to_end_matching() -> Result<()> {
    let dir = TempDir::new()?;
    write_daily_file(dir.path())?;

    let template = dir.path().join("%t_%Y%m%d.csv").display().to_string();
    let records = ConcurrentObservationLoader::new(template)
        .with_obs_key("obs")
        .load_range(day(), day())
        .await?;
    assert_eq!(records.len(), 4);

    let (lats, lons) = regular_grid(1.0)?;
    let mut registry = StationRegistry::new();
    let records = registry.resolve(records, Some((&lats, &lons)))?;
    assert_eq!(registry.len(), 1);

    let config = MatchConfig::from_yaml_str(MAPPING_YAML, dir.path())?;
    let mut table = ObservationMatcher::new(model_reader()).match_observations(records, &config)?;
    RegionSet::from_yaml_str(REGIONS_YAML)?.assign(&mut table);

    let wide = table.to_wide();
    assert_eq!(wide.len(), 1);
    let row = &wide[0];
    assert_eq!(row.timestamp, day().and_hms_opt(10, 0, 0).unwrap());
    assert_eq!(row.location, "Station0000000");
    assert_eq!(row.get("conc_mod_o3"), Some(35.0));
    assert_eq!(row.get("conc_obs_o3"), Some(40.0));
    assert_eq!(row.get("conc_mod_pm25"), Some(20.0));
    assert_eq!(row.get("conc_obs_pm25"), Some(15.0));

    let o3 = table.iter().find(|r| r.observation.obstype == "o3").unwrap();
    assert_eq!(o3.model_unit, "ppbv");
    assert_eq!(o3.observation.original_station_name, "Delhi Chanakyapuri");
    assert_eq!(o3.region.as_ref().map(|r| r.region_short_name.as_str()), Some("AS"));

    let path = dir.path().join("matched.parquet");
    let writer = ParquetWriter::new();
    writer.write_matched(&table, &path)?;
    let read_back = writer.read_matched(&path)?;
    assert_eq!(read_back.len(), table.len());
    assert_eq!(read_back.to_wide()[0].get("conc_obs_o3"), Some(40.0));

    let stats = AggregateStatistics::new().compute(&read_back, GroupBy::All);
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].n, 2);
    assert!((stats[0].bias - 0.0).abs() < 1e-9);
    Ok(())
}

#[tokio::test]
async fn test_rows_without_position_do_not_abort_matching() -> Result<()> {
    let dir = TempDir::new()?;
    let content = format!(
        "{}2020-07-01T10:40:00Z,Nowhere,,80.0,o3,ppbv,31\n2020-07-01T10:50:00Z,Nowhere,40.0,,o3,ppbv,33\n",
        OBS_CSV
    );
    std::fs::write(dir.path().join("obs_20200701.csv"), content)?;

    let template = dir.path().join("obs_%Y%m%d.csv").display().to_string();
    let records = ConcurrentObservationLoader::new(template).load_range(day(), day()).await?;
    assert_eq!(records.len(), 6);

    let mut registry = StationRegistry::new();
    let records = registry.resolve(records, None)?;
    assert_eq!(records.len(), 4);
    assert_eq!(registry.len(), 1);

    let config = MatchConfig::from_yaml_str(MAPPING_YAML, dir.path())?;
    let table = ObservationMatcher::new(model_reader()).match_observations(records, &config)?;

    let wide = table.to_wide();
    assert_eq!(wide.len(), 1);
    assert_eq!(wide[0].get("conc_obs_o3"), Some(40.0));
    assert_eq!(wide[0].get("conc_mod_o3"), Some(35.0));
    Ok(())
}

#[tokio::test]
async fn test_missing_daily_files() -> Result<()> {
    let dir = TempDir::new()?;
    write_daily_file(dir.path())?;
    let template = dir.path().join("obs_%Y%m%d.csv").display().to_string();
    let end = NaiveDate::from_ymd_opt(2020, 7, 2).unwrap();

    let strict = ConcurrentObservationLoader::new(template.clone());
    assert!(strict.load_range(day(), end).await.is_err());

    let lenient = ConcurrentObservationLoader::new(template).with_file_not_found_ok(true);
    assert_eq!(lenient.load_range(day(), end).await?.len(), 4);
    Ok(())
}

#[test]
fn test_registry_round_trip_is_idempotent() -> Result<()> {
    let dir = TempDir::new()?;
    let registry_path = dir.path().join("stations_%t.csv").display().to_string();
    let timestamp = day().and_hms_opt(0, 0, 0).unwrap();
    let rows = || {
        vec![
            ObservationRecord::new(timestamp, "Zurich", 47.37771, 8.54117, "no2", ObsUnit::Ppbv, 10.0),
            ObservationRecord::new(timestamp, "Paris", 48.8566, 2.3522, "no2", ObsUnit::Ppbv, 12.0),
        ]
    };

    let mut first = StationRegistry::load(&registry_path, "obs")?;
    let named = first.resolve(rows(), None)?;
    first.save(&registry_path, "obs")?;

    let mut second = StationRegistry::load(&registry_path, "obs")?;
    let renamed = second.resolve(rows(), None)?;

    let names = |records: &[ObservationRecord]| -> Vec<String> {
        records.iter().map(|r| r.location.clone()).collect()
    };
    assert_eq!(names(&named), names(&renamed));
    assert_eq!(second.len(), 2);
    assert!(dir.path().join("stations_obs.csv").exists());
    Ok(())
}

#[test]
fn test_statistics_from_matched_file() -> Result<()> {
    let dir = TempDir::new()?;
    let records: Vec<MatchedRecord> = [(2.0, 1.0), (2.0, 2.0), (4.0, 3.0)]
        .into_iter()
        .enumerate()
        .map(|(hour, (model, obs))| {
            let timestamp = day().and_hms_opt(hour as u32, 0, 0).unwrap();
            let observation = ObservationRecord::new(timestamp, "S", 1.0, 1.0, "o3", ObsUnit::Ppbv, obs)
                .with_location("Station0000000");
            let mut record = MatchedRecord::new(observation);
            record.model.insert("conc_mod".to_string(), Some(model));
            record.obs_model_units = Some(obs);
            record
        })
        .collect();

    let path = dir.path().join("matched.parquet");
    ParquetWriter::new().write_matched(&MatchedTable::new(records), &path)?;
    let table = ParquetWriter::new().read_matched(&path)?;

    let rows = AggregateStatistics::new().compute(&table, GroupBy::Location);
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.group, "Station0000000");
    assert!((row.nmb - 1.0 / 3.0).abs() < 1e-9);
    assert!((row.ioa - 0.5).abs() < 1e-9);
    assert!((row.r2 - 0.75).abs() < 1e-9);

    let csv_path = dir.path().join("stats.csv");
    CsvWriter::new().write_serialized(&rows, &csv_path)?;
    let content = std::fs::read_to_string(&csv_path)?;
    assert!(content.starts_with("group,n,obs_mean,mod_mean,bias,rmse,nmb,ioa,r2"));
    Ok(())
}
