use chrono::Duration;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::analyzers::{
    compact_stats, unaggregated_metrics, AggregateStatistics, CompactMetric, CompactModelSeries, GroupBy,
    MonthlyCompactor,
};
use crate::cli::args::{Cli, Commands};
use crate::config::{MatchConfig, Settings};
use crate::error::{ProcessingError, Result};
use crate::models::{MatchedTable, ObservationRecord, Season};
use crate::processors::{FieldSampler, Gridder, ObservationMatcher, QualityFilter, RegionSet, StationRegistry};
use crate::readers::{ConcurrentObservationLoader, GriddedFieldReader, ObservationReader};
use crate::utils::coordinates::regular_grid;
use crate::utils::filename::{expand_wildcard, generate_default_output_filename};
use crate::utils::progress::ProgressReporter;
use crate::writers::{CsvWriter, ParquetWriter};

pub async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Stations {
            input,
            registry,
            output_file,
            round_minutes,
        } => {
            let registry_file = registry.or_else(|| settings.registry_file.clone()).ok_or_else(|| {
                ProcessingError::Config("No registry file given and registry_file is not set".to_string())
            })?;

            let mut paths = Vec::new();
            for pattern in &input {
                paths.extend(expand_wildcard(pattern)?);
            }
            println!("Reading {} observation files...", paths.len());

            let reader = ObservationReader::new().with_round_minutes(round_minutes);
            let progress = ProgressReporter::new(paths.len() as u64, "Reading observations", false);
            let mut records = Vec::new();
            for path in &paths {
                records.extend(reader.read_observations(path)?);
                progress.increment(1);
            }
            progress.finish_with_message(&format!("Read {} observations", records.len()));

            let (records, _) = QualityFilter::new().filter(records);
            let mut stations = load_registry(&registry_file, &settings)?;
            let known = stations.len();
            let records = resolve_stations(&mut stations, records, &settings)?;
            println!("Registry: {} known stations, {} new", known, stations.len() - known);

            if let Some(saved) = stations.save(&registry_file, &settings.obs_key)? {
                println!("Registry written to {}", saved.display());
            }

            if let Some(output_file) = output_file {
                create_parent_dir(&output_file)?;
                let mut writer = csv_writer(&settings);
                let rows = writer.write_observations(&records, &output_file)?;
                println!("Wrote {} observations to {}", rows, output_file.display());
            }
        }

        Commands::Match {
            mapping,
            obs_template,
            start,
            end,
            output_file,
            compression,
            regions,
            popdens,
            time_delta,
            file_not_found_ok,
            mmap,
            no_progress,
            chunk_size,
            max_workers,
        } => {
            let end = end.unwrap_or(start);
            if end < start {
                return Err(ProcessingError::Config(format!("End {} is before start {}", end, start)));
            }
            let output_file =
                output_file.unwrap_or_else(|| generate_default_output_filename("parquet"));

            println!("Matching observations from {} to {}", start, end);
            println!("Mapping: {}", mapping.display());
            println!("Output file: {}", output_file.display());

            let config = MatchConfig::from_yaml_file(&mapping)?;
            if let Err(e) = rayon::ThreadPoolBuilder::new()
                .num_threads(max_workers.max(1))
                .build_global()
            {
                warn!("Cannot configure {} workers: {}", max_workers, e);
            }
            let loader = ConcurrentObservationLoader::new(obs_template)
                .with_obs_key(&settings.obs_key)
                .with_file_not_found_ok(file_not_found_ok)
                .with_mmap(mmap);
            let spinner = ProgressReporter::new_spinner("Loading observations...", no_progress);
            let records = loader.load_range(start, end).await?;

            let filter = match time_delta {
                Some(_) if start != end => {
                    return Err(ProcessingError::Config(
                        "--time-delta applies to single-day runs only".to_string(),
                    ));
                }
                Some(hours) => QualityFilter::new().with_day_window(start, Duration::hours(hours))?,
                None => QualityFilter::new(),
            };
            let (mut records, report) = filter.filter(records);
            if report.dropped_records() > 0 {
                println!("\n{}", filter.generate_summary(&report));
            }

            spinner.set_message(&format!("Resolving stations of {} observations...", records.len()));
            if let Some(registry_file) = &settings.registry_file {
                let mut stations = load_registry(registry_file, &settings)?;
                records = resolve_stations(&mut stations, records, &settings)?;
                stations.save(registry_file, &settings.obs_key)?;
            } else {
                let mut stations = StationRegistry::new().with_prefix(settings.station_prefix.clone());
                records = resolve_stations(&mut stations, records, &settings)?;
            }
            spinner.finish_with_message(&format!("Loaded {} observations", records.len()));

            let reader = model_reader()?;
            if let Some(popdens) = popdens {
                let sampler = FieldSampler::new(popdens);
                let field = sampler.load_field(&reader)?;
                sampler.sample(&mut records, &field);
            }

            let matcher = ObservationMatcher::new(reader).with_progress(!no_progress);
            let mut table =
                tokio::task::spawn_blocking(move || matcher.match_observations(records, &config)).await??;

            if let Some(path) = regions.or_else(|| settings.regions_file.as_ref().map(PathBuf::from)) {
                RegionSet::load(&path)?.assign(&mut table);
            }

            if table.is_empty() {
                println!("No matched records to write");
                return Ok(());
            }

            create_parent_dir(&output_file)?;
            let compression = compression.unwrap_or_else(|| settings.compression.clone());
            write_table(&table, &output_file, &compression, chunk_size, &settings)?;
            print_overall_stats(&table);
            println!("Matching complete!");
        }

        Commands::Stats {
            input,
            group_by,
            model_column,
            min_obs,
            season,
            obstype,
            unaggregated,
            output_file,
            json,
        } => {
            let table = ParquetWriter::new().read_matched(&input)?;
            if !table.model_columns.contains(&model_column) {
                return Err(ProcessingError::MissingData(format!(
                    "model column '{}' in {}",
                    model_column,
                    input.display()
                )));
            }

            if unaggregated {
                let metrics = unaggregated_metrics(&table, &model_column);
                let output_file = output_file.ok_or_else(|| {
                    ProcessingError::Config("--unaggregated needs --output-file".to_string())
                })?;
                CsvWriter::new().write_serialized(&metrics, &output_file)?;
                println!("Wrote {} rows to {}", metrics.len(), output_file.display());
                return Ok(());
            }

            let season = season
                .map(|name| {
                    Season::from_name(&name)
                        .ok_or_else(|| ProcessingError::Config(format!("Unknown season '{}'", name)))
                })
                .transpose()?;
            let stats = AggregateStatistics::new()
                .with_model_column(model_column)
                .with_min_obs(min_obs.unwrap_or(settings.min_obs))
                .with_season(season)
                .with_obstype(obstype);
            let rows = stats.compute(&table, group_by.into());

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!("Statistics for {} ({} groups):", input.display(), rows.len());
                for row in &rows {
                    println!("{}", row);
                }
            }

            if let Some(output_file) = output_file {
                CsvWriter::new().write_serialized(&rows, &output_file)?;
                println!("Statistics written to {}", output_file.display());
            }
        }

        Commands::Grid {
            input,
            output_file,
            resolution,
            obstypes,
            columns,
            obs_filter_low,
            obs_filter_high,
            no_obs_filter,
        } => {
            let table = ParquetWriter::new().read_matched(&input)?;
            let obstypes: Vec<&str> = obstypes.iter().map(String::as_str).collect();
            let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
            let high = (!no_obs_filter).then_some(obs_filter_high);

            let gridder = Gridder::from_resolution(&resolution)?
                .with_obstypes(&obstypes)
                .with_columns(&columns)
                .with_obs_filter(obs_filter_low, high)?;
            let cells = gridder.grid(&table)?;

            create_parent_dir(&output_file)?;
            ParquetWriter::new()
                .with_compression(&settings.compression)?
                .write_gridded(&cells, &output_file)?;
            println!(
                "Gridded {} records into {} cells on a {} grid ({}x{} nodes)",
                table.len(),
                cells.len(),
                resolution,
                gridder.lats().len(),
                gridder.lons().len()
            );
        }

        Commands::Compact {
            obs_template,
            start,
            end,
            output_file,
            label,
            obstype,
            nmin,
            nmin_agg,
            keep_nan,
            model_template,
            model_variable,
            model_label,
            model_scale,
            metric,
            group_all,
            file_not_found_ok,
        } => {
            let metric = metric.map(|m| m.parse::<CompactMetric>()).transpose()?;
            let records = ConcurrentObservationLoader::new(obs_template)
                .with_obs_key(&settings.obs_key)
                .with_file_not_found_ok(file_not_found_ok)
                .load_range(start, end)
                .await?;

            let mut compactor = MonthlyCompactor::new(label.clone())
                .with_nmin(nmin)
                .with_nmin_agg(nmin_agg)
                .with_remove_nan(!keep_nan);
            if let Some(obstype) = &obstype {
                compactor = compactor.with_obstype(obstype.clone());
            }
            let mut rows = compactor.compact(&records);
            info!("Compacted {} observations into {} monthly values", records.len(), rows.len());

            if let Some(template) = model_template {
                let variable = model_variable.ok_or_else(|| {
                    ProcessingError::Config("--model-template needs --model-variable".to_string())
                })?;
                let series = CompactModelSeries {
                    label: model_label,
                    obstype: obstype.unwrap_or_else(|| variable.to_lowercase()),
                    unit: rows.first().map(|r| r.unit.clone()).unwrap_or_default(),
                    template,
                    variable,
                    scal: model_scale,
                };
                let sampled = series.sample(&model_reader()?, &rows, start, end);
                rows.extend(sampled);
            }

            if let Some(metric) = metric {
                rows = compact_stats(&rows, &label, metric, group_all);
            }

            create_parent_dir(&output_file)?;
            CsvWriter::new().write_serialized(&rows, &output_file)?;
            println!("Wrote {} rows to {}", rows.len(), output_file.display());
        }

        Commands::Info {
            file,
            sample,
            model_column,
        } => {
            println!("Analyzing Parquet file: {}", file.display());

            let writer = ParquetWriter::new();
            let file_info = writer.get_file_info(&file)?;
            let table = writer.read_matched(&file)?;
            print_overall_stats(&table);

            println!("\nFile Details:");
            println!("{}", file_info.summary());

            if sample > 0 {
                println!("\nSample Records (showing {} records):", sample);
                match writer.read_sample(&file, &model_column, sample) {
                    Ok(samples) => {
                        for (i, s) in samples.iter().enumerate() {
                            println!(
                                "{}. {} {} {}: model={} obs={}",
                                i + 1,
                                s.timestamp.format("%Y-%m-%d %H:%M"),
                                s.location,
                                s.obstype,
                                format_value(s.model),
                                format_value(s.observation)
                            );
                        }
                    }
                    Err(e) => println!("Error reading sample data: {}", e),
                }
            }
        }
    }

    Ok(())
}

/// Gridded model reader, available when built with the `netcdf` feature
#[cfg(feature = "netcdf")]
fn model_reader() -> Result<GriddedFieldReader> {
    Ok(GriddedFieldReader::netcdf())
}

#[cfg(not(feature = "netcdf"))]
fn model_reader() -> Result<GriddedFieldReader> {
    Err(ProcessingError::Config(
        "Built without the `netcdf` feature, model files cannot be read".to_string(),
    ))
}

fn load_registry(path: &str, settings: &Settings) -> Result<StationRegistry> {
    Ok(StationRegistry::load(path, &settings.obs_key)?.with_prefix(settings.station_prefix.clone()))
}

fn resolve_stations(
    stations: &mut StationRegistry,
    records: Vec<ObservationRecord>,
    settings: &Settings,
) -> Result<Vec<ObservationRecord>> {
    let (lats, lons) = regular_grid(settings.grid_resolution)?;
    stations.resolve(records, Some((&lats, &lons)))
}

fn csv_writer(settings: &Settings) -> CsvWriter {
    match settings.nfloats {
        Some(n) => CsvWriter::new().with_nfloats(n),
        None => CsvWriter::new(),
    }
}

fn write_table(
    table: &MatchedTable,
    path: &Path,
    compression: &str,
    chunk_size: usize,
    settings: &Settings,
) -> Result<()> {
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));

    println!("Writing {} matched records...", table.len());
    if is_csv {
        csv_writer(settings).write_matched(table, path)?;
    } else {
        let writer = ParquetWriter::new().with_compression(compression)?;
        writer.write_matched_batched(table, path, chunk_size)?;
        println!("\n{}", writer.get_file_info(path)?.summary());
    }
    Ok(())
}

fn print_overall_stats(table: &MatchedTable) {
    let mut obstypes: Vec<&str> = table.iter().map(|r| r.observation.obstype.as_str()).collect();
    obstypes.sort_unstable();
    obstypes.dedup();

    println!("\nOverall agreement:");
    for column in &table.model_columns {
        for obstype in &obstypes {
            let rows = AggregateStatistics::new()
                .with_model_column(column.clone())
                .with_obstype(Some(obstype.to_string()))
                .compute(table, GroupBy::All);
            match rows.into_iter().next() {
                Some(mut row) => {
                    row.group = obstype.to_string();
                    println!("{:<12} {}", column, row);
                }
                None => warn!("No {} pairs for {}", column, obstype),
            }
        }
    }
}

fn format_value(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.3}", v))
}

fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
