use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::analyzers::GroupBy;

#[derive(Parser)]
#[command(name = "cfobs-processor")]
#[command(about = "Match air quality observations against gridded chemistry model output")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Log file path")]
    pub log_file: Option<PathBuf>,

    #[arg(long, global = true, help = "Settings file (YAML), overridden by CFOBS_* variables")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Assign canonical station names to observation files and update the registry
    Stations {
        #[arg(short, long, required = true, num_args = 1.., help = "Observation CSV files (wildcards allowed)")]
        input: Vec<String>,

        #[arg(short, long, help = "Station registry file [default: registry_file setting]")]
        registry: Option<String>,

        #[arg(short, long, help = "Write the renamed observations to this CSV file")]
        output_file: Option<PathBuf>,

        #[arg(long, help = "Round timestamps to the nearest hour")]
        round_minutes: bool,
    },

    /// Match observations of a date range against model output
    Match {
        #[arg(short, long, help = "Mapping YAML with cf_config and mapping sections")]
        mapping: PathBuf,

        #[arg(long, help = "Daily observation file template, e.g. 'obs/%t_%Y%m%d.csv'")]
        obs_template: String,

        #[arg(long)]
        start: NaiveDate,

        #[arg(long, help = "Last day, inclusive [default: start]")]
        end: Option<NaiveDate>,

        #[arg(
            short,
            long,
            help = "Output file, CSV when the extension is .csv [default: output/cfobs-matched-{YYMMDD}.parquet]"
        )]
        output_file: Option<PathBuf>,

        #[arg(short, long, help = "Parquet compression [default: compression setting]")]
        compression: Option<String>,

        #[arg(long, help = "Regions YAML [default: regions_file setting]")]
        regions: Option<PathBuf>,

        #[arg(long, help = "Gridded population density file sampled into a 'popdens' column")]
        popdens: Option<String>,

        #[arg(long, help = "Keep observations up to this many hours around a single day")]
        time_delta: Option<i64>,

        #[arg(long, help = "Skip missing daily files instead of failing")]
        file_not_found_ok: bool,

        #[arg(long, help = "Memory-map observation files")]
        mmap: bool,

        #[arg(long, help = "Hide the progress bar")]
        no_progress: bool,

        #[arg(long, default_value = "10000")]
        chunk_size: usize,

        #[arg(long, default_value_t = num_cpus::get(), help = "Threads for parallel model reads")]
        max_workers: usize,
    },

    /// Model/observation agreement statistics of a matched Parquet file
    Stats {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long, value_enum, default_value = "location")]
        group_by: Grouping,

        #[arg(long, default_value = "conc_mod")]
        model_column: String,

        #[arg(long, help = "Minimum pairs per group [default: min_obs setting]")]
        min_obs: Option<usize>,

        #[arg(long, help = "Restrict to one season (DJF, MAM, JJA, SON)")]
        season: Option<String>,

        #[arg(long)]
        obstype: Option<String>,

        #[arg(long, help = "Write per-row bias and absolute error instead of group metrics")]
        unaggregated: bool,

        #[arg(short, long, help = "Write the statistics to this CSV file")]
        output_file: Option<PathBuf>,

        #[arg(long, help = "Print the statistics as JSON")]
        json: bool,
    },

    /// Map matched values onto a regular lat/lon grid
    Grid {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output_file: PathBuf,

        #[arg(short, long, default_value = "2x2.5", help = "Grid resolution <dlat>x<dlon>")]
        resolution: String,

        #[arg(long, value_delimiter = ',', default_value = "o3,no2,pm25")]
        obstypes: Vec<String>,

        #[arg(long, value_delimiter = ',', default_value = "conc_mod,conc_obs")]
        columns: Vec<String>,

        #[arg(long, help = "Drop observation values at or below this quantile")]
        obs_filter_low: Option<f64>,

        #[arg(long, default_value = "0.99", help = "Drop observation values at or above this quantile")]
        obs_filter_high: f64,

        #[arg(long, help = "Disable the high-quantile filter")]
        no_obs_filter: bool,
    },

    /// Aggregate observations to monthly means and compare labelled series
    Compact {
        #[arg(long)]
        obs_template: String,

        #[arg(long)]
        start: NaiveDate,

        #[arg(long)]
        end: NaiveDate,

        #[arg(short, long)]
        output_file: PathBuf,

        #[arg(long, default_value = "obs")]
        label: String,

        #[arg(long)]
        obstype: Option<String>,

        #[arg(long, default_value = "0", help = "Minimum raw values per month")]
        nmin: usize,

        #[arg(long, help = "Minimum valid months per location")]
        nmin_agg: Option<usize>,

        #[arg(long, help = "Keep locations without any valid month")]
        keep_nan: bool,

        #[arg(long, help = "Model file template sampled at every location (needs --model-variable)")]
        model_template: Option<String>,

        #[arg(long)]
        model_variable: Option<String>,

        #[arg(long, default_value = "model")]
        model_label: String,

        #[arg(long, default_value = "1.0")]
        model_scale: f64,

        #[arg(long, help = "Compare every series against the observations (RMSE, NMB, MAPE)")]
        metric: Option<String>,

        #[arg(long, help = "Pool all locations when computing --metric")]
        group_all: bool,

        #[arg(long, help = "Skip missing daily files instead of failing")]
        file_not_found_ok: bool,
    },

    /// Display information about a matched Parquet file
    Info {
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long, default_value = "10")]
        sample: usize,

        #[arg(long, default_value = "conc_mod")]
        model_column: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Grouping {
    Location,
    Region,
    All,
}

impl From<Grouping> for GroupBy {
    fn from(grouping: Grouping) -> Self {
        match grouping {
            Grouping::Location => GroupBy::Location,
            Grouping::Region => GroupBy::Region,
            Grouping::All => GroupBy::All,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_match_command() {
        let cli = Cli::try_parse_from([
            "cfobs-processor",
            "match",
            "--mapping",
            "mapping.yaml",
            "--obs-template",
            "obs/%t_%Y%m%d.csv",
            "--start",
            "2020-04-07",
            "--verbose",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Match { start, end, .. } => {
                assert_eq!(start, NaiveDate::from_ymd_opt(2020, 4, 7).unwrap());
                assert_eq!(end, None);
            }
            _ => panic!("expected match command"),
        }
    }

    #[test]
    fn test_parse_grid_lists() {
        let cli = Cli::try_parse_from([
            "cfobs-processor",
            "grid",
            "-i",
            "in.parquet",
            "-o",
            "out.parquet",
            "--obstypes",
            "o3,no2",
        ])
        .unwrap();

        match cli.command {
            Commands::Grid { obstypes, columns, resolution, .. } => {
                assert_eq!(obstypes, vec!["o3", "no2"]);
                assert_eq!(columns, vec!["conc_mod", "conc_obs"]);
                assert_eq!(resolution, "2x2.5");
            }
            _ => panic!("expected grid command"),
        }
    }

    #[test]
    fn test_stats_grouping() {
        let cli = Cli::try_parse_from(["cfobs-processor", "stats", "-i", "m.parquet", "-g", "region"]).unwrap();
        match cli.command {
            Commands::Stats { group_by, .. } => assert_eq!(GroupBy::from(group_by), GroupBy::Region),
            _ => panic!("expected stats command"),
        }
    }
}
