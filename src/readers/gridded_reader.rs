use chrono::{Duration, NaiveDate, NaiveDateTime};
use ndarray::{concatenate, Array2, Array3, Array4, ArrayView3, Axis};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::CollectionConfig;
use crate::error::{ProcessingError, Result};
use crate::models::{GriddedField, GriddedFields, Season};
use crate::utils::filename::{expand_date_template, expand_wildcard, wildcard_match};

/// An opened model output file
pub trait GridDataset {
    fn lats(&self) -> &[f64];
    fn lons(&self) -> &[f64];
    fn times(&self) -> &[NaiveDateTime];

    /// Values of a variable as (time, lat, lon) at the given vertical level
    fn read_variable(&self, name: &str, level: usize) -> Result<Array3<f64>>;
}

/// Opens model output files; the seam between the reader and the storage format
pub trait DatasetOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn GridDataset>>;

    /// Files matching a resolved template, sorted
    fn resolve(&self, path: &str) -> Result<Vec<PathBuf>> {
        expand_wildcard(path)
    }
}

/// In-memory dataset, used by tests and benchmarks
#[derive(Debug, Clone, Default)]
pub struct MemoryDataset {
    lats: Vec<f64>,
    lons: Vec<f64>,
    times: Vec<NaiveDateTime>,
    /// (time, lev, lat, lon)
    variables: BTreeMap<String, Array4<f64>>,
}

impl MemoryDataset {
    pub fn new(lats: Vec<f64>, lons: Vec<f64>, times: Vec<NaiveDateTime>) -> Self {
        Self {
            lats,
            lons,
            times,
            variables: BTreeMap::new(),
        }
    }

    /// Add a (time, lat, lon) variable without a level dimension
    pub fn with_variable(self, name: impl Into<String>, values: Array3<f64>) -> Self {
        self.with_levelled_variable(name, values.insert_axis(Axis(1)))
    }

    pub fn with_levelled_variable(mut self, name: impl Into<String>, values: Array4<f64>) -> Self {
        self.variables.insert(name.into(), values);
        self
    }

    /// Add a variable that is constant in time and space
    pub fn with_constant(self, name: impl Into<String>, value: f64) -> Self {
        let shape = (self.times.len().max(1), self.lats.len(), self.lons.len());
        self.with_variable(name, Array3::from_elem(shape, value))
    }
}

impl GridDataset for MemoryDataset {
    fn lats(&self) -> &[f64] {
        &self.lats
    }

    fn lons(&self) -> &[f64] {
        &self.lons
    }

    fn times(&self) -> &[NaiveDateTime] {
        &self.times
    }

    fn read_variable(&self, name: &str, level: usize) -> Result<Array3<f64>> {
        let values = self
            .variables
            .get(name)
            .ok_or_else(|| ProcessingError::MissingData(format!("variable '{}'", name)))?;
        if level >= values.len_of(Axis(1)) {
            return Err(ProcessingError::MissingData(format!(
                "level {} of variable '{}'",
                level, name
            )));
        }
        Ok(values.index_axis(Axis(1), level).to_owned())
    }
}

/// Serves registered in-memory datasets by path
#[derive(Debug, Clone, Default)]
pub struct MemoryOpener {
    datasets: BTreeMap<PathBuf, MemoryDataset>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, path: impl Into<PathBuf>, dataset: MemoryDataset) -> Self {
        self.datasets.insert(path.into(), dataset);
        self
    }
}

impl DatasetOpener for MemoryOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn GridDataset>> {
        self.datasets
            .get(path)
            .cloned()
            .map(|d| Box::new(d) as Box<dyn GridDataset>)
            .ok_or_else(|| ProcessingError::grid_read(path.display().to_string(), "no such dataset"))
    }

    fn resolve(&self, path: &str) -> Result<Vec<PathBuf>> {
        let requested = Path::new(path);
        let pattern = match requested.file_name().and_then(|f| f.to_str()) {
            Some(name) if name.contains(|c: char| c == '*' || c == '?') => name,
            _ => return Ok(vec![requested.to_path_buf()]),
        };
        Ok(self
            .datasets
            .keys()
            .filter(|candidate| {
                candidate.parent() == requested.parent()
                    && candidate
                        .file_name()
                        .and_then(|f| f.to_str())
                        .is_some_and(|name| wildcard_match(pattern, name))
            })
            .cloned()
            .collect())
    }
}

/// Time series of several variables read from one or more files
struct FieldSeries {
    lats: Arc<Vec<f64>>,
    lons: Arc<Vec<f64>>,
    times: Vec<NaiveDateTime>,
    values: BTreeMap<String, Array3<f64>>,
}

impl FieldSeries {
    fn load(
        opener: &dyn DatasetOpener,
        resolved: &str,
        names: &[&str],
        level: usize,
    ) -> Result<Self> {
        let paths = opener.resolve(resolved)?;
        if paths.is_empty() {
            return Err(ProcessingError::grid_read(resolved, "no files match"));
        }

        let mut lats = Vec::new();
        let mut lons = Vec::new();
        let mut times = Vec::new();
        let mut parts: BTreeMap<String, Vec<Array3<f64>>> = BTreeMap::new();

        for (i, path) in paths.iter().enumerate() {
            debug!("Reading {}", path.display());
            let dataset = opener.open(path)?;
            if i == 0 {
                lats = dataset.lats().to_vec();
                lons = dataset.lons().to_vec();
            }
            times.extend_from_slice(dataset.times());
            for name in names {
                let values = dataset
                    .read_variable(name, level)
                    .map_err(|e| ProcessingError::grid_read(path.display().to_string(), e))?;
                parts.entry(name.to_string()).or_default().push(values);
            }
        }

        let mut values = BTreeMap::new();
        for (name, arrays) in parts {
            let combined = if arrays.len() == 1 {
                arrays.into_iter().next().unwrap_or_default()
            } else {
                let views: Vec<ArrayView3<f64>> = arrays.iter().map(|a| a.view()).collect();
                concatenate(Axis(0), &views)
                    .map_err(|e| ProcessingError::grid_read(resolved, e))?
            };
            values.insert(name, combined);
        }

        Ok(Self {
            lats: Arc::new(lats),
            lons: Arc::new(lons),
            times,
            values,
        })
    }

    fn steps(&self, name: &str) -> usize {
        self.values.get(name).map(|v| v.len_of(Axis(0))).unwrap_or(0)
    }

    fn field(&self, name: &str, selection: &StepSelection, path: &str) -> Result<Array2<f64>> {
        let values = self
            .values
            .get(name)
            .ok_or_else(|| ProcessingError::grid_read(path, format!("variable '{}' not read", name)))?;
        match selection {
            StepSelection::Single(i) => Ok(values.index_axis(Axis(0), *i).to_owned()),
            StepSelection::Mean(indices) => Ok(nan_mean(values, indices)),
        }
    }
}

enum StepSelection {
    Single(usize),
    Mean(Vec<usize>),
}

fn nearest_step(times: &[NaiveDateTime], target: NaiveDateTime) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    for (i, t) in times.iter().enumerate() {
        let distance = (*t - target).num_seconds().abs();
        match best {
            Some((_, d)) if distance >= d => {}
            _ => best = Some((i, distance)),
        }
    }
    best.map(|(i, _)| i)
}

/// Mean over the selected time steps, skipping NaN; all-NaN cells stay NaN
fn nan_mean(values: &Array3<f64>, indices: &[usize]) -> Array2<f64> {
    let (_, nlat, nlon) = values.dim();
    let mut sum = Array2::<f64>::zeros((nlat, nlon));
    let mut count = Array2::<f64>::zeros((nlat, nlon));

    for &i in indices {
        let step = values.index_axis(Axis(0), i);
        ndarray::Zip::from(&mut sum)
            .and(&mut count)
            .and(&step)
            .for_each(|s, c, &v| {
                if !v.is_nan() {
                    *s += v;
                    *c += 1.0;
                }
            });
    }

    ndarray::Zip::from(&sum)
        .and(&count)
        .map_collect(|&s, &c| if c > 0.0 { s / c } else { f64::NAN })
}

/// A derived map variable summed from several file variables
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeVariable {
    pub name: String,
    pub components: Vec<String>,
}

impl CompositeVariable {
    pub fn new(name: impl Into<String>, components: &[&str]) -> Self {
        Self {
            name: name.into(),
            components: components.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Total 550 nm aerosol optical depth
    pub fn aod550_total() -> Self {
        Self::new(
            "AOD550_TOTAL",
            &[
                "AOD550_BC",
                "AOD550_OC",
                "AOD550_DUST",
                "AOD550_SULFATE",
                "AOD550_SALA",
                "AOD550_SALC",
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MapVariable {
    Single(String),
    Composite(CompositeVariable),
}

impl MapVariable {
    /// Known composites by name, anything else is read as is
    pub fn from_name(name: &str) -> Self {
        if name == "AOD550_TOTAL" {
            MapVariable::Composite(CompositeVariable::aod550_total())
        } else {
            MapVariable::Single(name.to_string())
        }
    }

    pub fn name(&self) -> &str {
        match self {
            MapVariable::Single(name) => name,
            MapVariable::Composite(c) => &c.name,
        }
    }

    fn components(&self) -> Vec<&str> {
        match self {
            MapVariable::Single(name) => vec![name.as_str()],
            MapVariable::Composite(c) => c.components.iter().map(String::as_str).collect(),
        }
    }
}

/// Parameters of a time-averaged overview map
#[derive(Debug, Clone)]
pub struct TimeAverageRequest {
    /// File template, date tokens resolved with the start date
    pub template: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub season: Option<Season>,
    pub variable: MapVariable,
    pub scal: f64,
    pub level: usize,
}

impl TimeAverageRequest {
    pub fn new(template: impl Into<String>, start: NaiveDate, end: NaiveDate, variable: MapVariable) -> Self {
        Self {
            template: template.into(),
            start: start.and_time(chrono::NaiveTime::MIN),
            end: end.and_time(chrono::NaiveTime::MIN) + Duration::days(1) - Duration::seconds(1),
            season: None,
            variable,
            scal: 1.0,
            level: 0,
        }
    }

    pub fn with_season(mut self, season: Season) -> Self {
        self.season = Some(season);
        self
    }

    pub fn with_scale(mut self, scal: f64) -> Self {
        self.scal = scal;
        self
    }
}

/// Reads 2-D model fields for a timestamp from configured collections
#[derive(Clone)]
pub struct GriddedFieldReader {
    opener: Arc<dyn DatasetOpener>,
    parallel: bool,
}

impl GriddedFieldReader {
    pub fn new(opener: Arc<dyn DatasetOpener>) -> Self {
        Self {
            opener,
            parallel: true,
        }
    }

    #[cfg(feature = "netcdf")]
    pub fn netcdf() -> Self {
        Self::new(Arc::new(netcdf_backend::NetcdfOpener))
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Read every configured variable at `timestamp`.
    ///
    /// Collections without `template` or `vars` are skipped; any open or read
    /// failure fails the whole read.
    pub fn read(
        &self,
        timestamp: NaiveDateTime,
        collections: &BTreeMap<String, CollectionConfig>,
    ) -> Result<GriddedFields> {
        let per_collection: Vec<Vec<GriddedField>> = if self.parallel {
            collections
                .par_iter()
                .map(|(name, collection)| self.read_collection(name, collection, timestamp))
                .collect::<Result<Vec<_>>>()?
        } else {
            collections
                .iter()
                .map(|(name, collection)| self.read_collection(name, collection, timestamp))
                .collect::<Result<Vec<_>>>()?
        };

        let mut fields = GriddedFields::new();
        for field in per_collection.into_iter().flatten() {
            fields.insert(field);
        }
        Ok(fields)
    }

    fn read_collection(
        &self,
        name: &str,
        collection: &CollectionConfig,
        timestamp: NaiveDateTime,
    ) -> Result<Vec<GriddedField>> {
        let Some(template) = &collection.template else {
            warn!("`template` not defined for collection {} - skipping", name);
            return Ok(Vec::new());
        };
        let Some(vars) = &collection.vars else {
            warn!("`vars` not defined for collection {} - skipping", name);
            return Ok(Vec::new());
        };

        let resolved = expand_date_template(template, &timestamp)?;
        let file_names: Vec<&str> = vars.values().map(|v| v.name_on_file.as_str()).collect();
        let series = FieldSeries::load(self.opener.as_ref(), &resolved, &file_names, collection.level())?;

        let mut fields = Vec::with_capacity(vars.len());
        for (key, var) in vars {
            let steps = series.steps(&var.name_on_file);
            if steps == 0 {
                return Err(ProcessingError::grid_read(
                    resolved.clone(),
                    format!("variable '{}' has no time steps", var.name_on_file),
                ));
            }

            let selection = if steps == 1 {
                StepSelection::Single(0)
            } else if series.times.len() != steps {
                return Err(ProcessingError::grid_read(
                    resolved.clone(),
                    format!("{} time values for {} time steps", series.times.len(), steps),
                ));
            } else if let Some((before, after)) = collection.averaging_window() {
                let start = timestamp - before;
                let end = timestamp + after;
                let indices: Vec<usize> = series
                    .times
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| **t >= start && **t <= end)
                    .map(|(i, _)| i)
                    .collect();
                if indices.is_empty() {
                    return Err(ProcessingError::grid_read(
                        resolved.clone(),
                        format!("no time steps between {} and {}", start, end),
                    ));
                }
                StepSelection::Mean(indices)
            } else {
                let index = nearest_step(&series.times, timestamp).unwrap_or(0);
                StepSelection::Single(index)
            };

            let values = series.field(&var.name_on_file, &selection, &resolved)? * var.scal;
            fields.push(GriddedField::new(
                key.clone(),
                series.lats.clone(),
                series.lons.clone(),
                values,
            )?);
        }

        Ok(fields)
    }

    /// Mean map of one (possibly composite) variable over a date range
    pub fn read_time_averaged_map(&self, request: &TimeAverageRequest) -> Result<GriddedField> {
        let resolved = expand_date_template(&request.template, &request.start)?;
        let components = request.variable.components();
        let series = FieldSeries::load(self.opener.as_ref(), &resolved, &components, request.level)?;

        let indices: Vec<usize> = series
            .times
            .iter()
            .enumerate()
            .filter(|(_, t)| **t >= request.start && **t <= request.end)
            .filter(|(_, t)| request.season.map_or(true, |s| s.contains(t)))
            .map(|(i, _)| i)
            .collect();

        if indices.is_empty() {
            return Err(ProcessingError::grid_read(
                resolved,
                format!(
                    "no time steps between {} and {}{}",
                    request.start,
                    request.end,
                    request
                        .season
                        .map(|s| format!(" in {}", s))
                        .unwrap_or_default()
                ),
            ));
        }

        let selection = StepSelection::Mean(indices);
        let mut total: Option<Array2<f64>> = None;
        for component in components {
            let mean = series.field(component, &selection, &resolved)?;
            total = Some(match total {
                Some(acc) => acc + mean,
                None => mean,
            });
        }

        let values = total
            .ok_or_else(|| ProcessingError::MissingData("map variable components".to_string()))?
            * request.scal;
        GriddedField::new(
            request.variable.name(),
            series.lats.clone(),
            series.lons.clone(),
            values,
        )
    }
}

/// Parse CF time units such as `hours since 2019-12-01 00:00:00` into a step
/// length in seconds and a reference time
pub fn parse_cf_time_units(units: &str) -> Result<(f64, NaiveDateTime)> {
    let (step, reference) = units
        .split_once(" since ")
        .ok_or_else(|| ProcessingError::InvalidFormat(format!("Unsupported time units '{}'", units)))?;

    let seconds = match step.trim().to_lowercase().as_str() {
        "seconds" | "second" | "s" => 1.0,
        "minutes" | "minute" | "min" => 60.0,
        "hours" | "hour" | "h" => 3600.0,
        "days" | "day" | "d" => 86400.0,
        other => {
            return Err(ProcessingError::InvalidFormat(format!(
                "Unsupported time step '{}'",
                other
            )))
        }
    };

    let reference = reference.trim().trim_end_matches('Z');
    let reference = reference.split('.').next().unwrap_or(reference);
    let parsed = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(reference, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(reference, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(chrono::NaiveTime::MIN))
        })
        .ok_or_else(|| {
            ProcessingError::InvalidFormat(format!("Unsupported reference time '{}'", reference))
        })?;

    Ok((seconds, parsed))
}

#[cfg(feature = "netcdf")]
mod netcdf_backend {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    const LAT_NAMES: [&str; 2] = ["lat", "latitude"];
    const LON_NAMES: [&str; 2] = ["lon", "longitude"];
    const LEVEL_NAMES: [&str; 3] = ["lev", "level", "plev"];

    pub struct NetcdfOpener;

    impl DatasetOpener for NetcdfOpener {
        fn open(&self, path: &Path) -> Result<Box<dyn GridDataset>> {
            let label = path.display().to_string();
            let file = netcdf::open(path).map_err(|e| ProcessingError::grid_read(label.clone(), e))?;

            let lats = read_axis(&file, &LAT_NAMES, &label)?;
            let lons = read_axis(&file, &LON_NAMES, &label)?;
            let times = read_times(&file, &label)?;

            Ok(Box::new(NetcdfDataset {
                file,
                label,
                lats,
                lons,
                times,
            }))
        }
    }

    struct NetcdfDataset {
        file: netcdf::File,
        label: String,
        lats: Vec<f64>,
        lons: Vec<f64>,
        times: Vec<NaiveDateTime>,
    }

    fn read_axis(file: &netcdf::File, names: &[&str], label: &str) -> Result<Vec<f64>> {
        let var = names
            .iter()
            .find_map(|name| file.variable(name))
            .ok_or_else(|| ProcessingError::grid_read(label, format!("missing coordinate {}", names[0])))?;
        var.get_values::<f64, _>(..)
            .map_err(|e| ProcessingError::grid_read(label, e))
    }

    fn read_times(file: &netcdf::File, label: &str) -> Result<Vec<NaiveDateTime>> {
        let Some(var) = file.variable("time") else {
            return Ok(Vec::new());
        };
        let units = match var.attribute_value("units") {
            Some(Ok(netcdf::AttributeValue::Str(units))) => units,
            _ => return Err(ProcessingError::grid_read(label, "time variable has no units")),
        };
        let (step_seconds, reference) = parse_cf_time_units(&units)?;
        let offsets: Vec<f64> = var
            .get_values::<f64, _>(..)
            .map_err(|e| ProcessingError::grid_read(label, e))?;

        Ok(offsets
            .into_iter()
            .map(|offset| reference + Duration::seconds((offset * step_seconds).round() as i64))
            .collect())
    }

    fn fill_value(var: &netcdf::Variable) -> Option<f64> {
        ["_FillValue", "missing_value"].iter().find_map(|name| {
            if !var.attributes().any(|attr| attr.name() == *name) {
                return None;
            }
            let value = var.attribute_value(name)?.ok()?;
            f64::try_from(value).ok()
        })
    }

    impl GridDataset for NetcdfDataset {
        fn lats(&self) -> &[f64] {
            &self.lats
        }

        fn lons(&self) -> &[f64] {
            &self.lons
        }

        fn times(&self) -> &[NaiveDateTime] {
            &self.times
        }

        fn read_variable(&self, name: &str, level: usize) -> Result<Array3<f64>> {
            let var = self
                .file
                .variable(name)
                .ok_or_else(|| ProcessingError::grid_read(self.label.clone(), format!("missing variable {}", name)))?;

            let dims: Vec<(String, usize)> = var
                .dimensions()
                .iter()
                .map(|d| (d.name(), d.len()))
                .collect();
            let shape: Vec<usize> = dims.iter().map(|(_, len)| *len).collect();

            let mut raw: Vec<f64> = var
                .get_values::<f64, _>(..)
                .map_err(|e| ProcessingError::grid_read(self.label.clone(), e))?;
            if let Some(fill) = fill_value(&var) {
                raw.iter_mut().filter(|v| **v == fill).for_each(|v| *v = f64::NAN);
            }

            let mut values = ArrayD::from_shape_vec(IxDyn(&shape), raw)
                .map_err(|e| ProcessingError::grid_read(self.label.clone(), e))?;

            let position = |names: &[&str]| dims.iter().position(|(n, _)| names.contains(&n.as_str()));

            if let Some(lev) = position(&LEVEL_NAMES) {
                if level >= dims[lev].1 {
                    return Err(ProcessingError::grid_read(
                        self.label.clone(),
                        format!("level {} out of range for {}", level, name),
                    ));
                }
                values = values.index_axis_move(Axis(lev), level);
            }

            let values = match values.ndim() {
                2 => values.insert_axis(Axis(0)),
                3 => values,
                n => {
                    return Err(ProcessingError::grid_read(
                        self.label.clone(),
                        format!("variable {} has {} dimensions after level selection", name, n),
                    ))
                }
            };

            values
                .into_dimensionality::<ndarray::Ix3>()
                .map_err(|e| ProcessingError::grid_read(self.label.clone(), e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VariableConfig;
    use ndarray::array;

    fn hour(day: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2019, 12, day)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn hourly_dataset(values: &[f64]) -> MemoryDataset {
        let times: Vec<NaiveDateTime> = (0..values.len() as u32).map(|h| hour(1, h)).collect();
        let series = Array3::from_shape_fn((values.len(), 2, 2), |(t, _, _)| values[t]);
        MemoryDataset::new(vec![-45.0, 45.0], vec![-90.0, 90.0], times).with_variable("O3", series)
    }

    fn chm_collection() -> CollectionConfig {
        CollectionConfig::new("/model/chm.%Y%m%d.nc4").with_var("o3", VariableConfig::new("O3"))
    }

    fn reader(dataset: MemoryDataset) -> GriddedFieldReader {
        let opener = MemoryOpener::new().with_dataset("/model/chm.20191201.nc4", dataset);
        GriddedFieldReader::new(Arc::new(opener))
    }

    #[test]
    fn test_nearest_time_step() -> Result<()> {
        let values: Vec<f64> = (0..24).map(|h| h as f64).collect();
        let collections = BTreeMap::from([("chm".to_string(), chm_collection())]);

        let fields = reader(hourly_dataset(&values)).read(hour(1, 7), &collections)?;
        let o3 = fields.get("o3").unwrap();
        assert_eq!(o3.values[[0, 0]], 7.0);
        assert_eq!(fields.lats.as_slice(), &[-45.0, 45.0]);
        Ok(())
    }

    #[test]
    fn test_window_average_of_constant_series() -> Result<()> {
        let collection = chm_collection().with_averaging_window(12.0, 12.0);
        let collections = BTreeMap::from([("chm".to_string(), collection)]);

        let fields = reader(hourly_dataset(&[5.0; 24])).read(hour(1, 12), &collections)?;
        assert_eq!(fields.get("o3").unwrap().values[[1, 1]], 5.0);
        Ok(())
    }

    #[test]
    fn test_window_average_skips_nan() -> Result<()> {
        let mut values = vec![2.0; 24];
        values[10] = f64::NAN;
        values[11] = 8.0;
        let collection = chm_collection().with_averaging_window(1.0, 0.0);
        let collections = BTreeMap::from([("chm".to_string(), collection)]);

        let fields = reader(hourly_dataset(&values)).read(hour(1, 11), &collections)?;
        assert_eq!(fields.get("o3").unwrap().values[[0, 0]], 8.0);
        Ok(())
    }

    #[test]
    fn test_scale_and_level_selection() -> Result<()> {
        let levels = Array4::from_shape_fn((1, 3, 2, 2), |(_, lev, _, _)| lev as f64 + 1.0);
        let dataset = MemoryDataset::new(vec![-45.0, 45.0], vec![-90.0, 90.0], vec![hour(1, 0)])
            .with_levelled_variable("O3", levels);
        let mut collection = CollectionConfig::new("/model/chm.%Y%m%d.nc4")
            .with_var("o3", VariableConfig::new("O3").with_scale(1.0e9));
        collection.level_index = Some(2);
        let collections = BTreeMap::from([("chm".to_string(), collection)]);

        let fields = reader(dataset).read(hour(1, 5), &collections)?;
        assert_eq!(fields.get("o3").unwrap().values[[0, 1]], 3.0e9);
        Ok(())
    }

    #[test]
    fn test_incomplete_collection_is_skipped() -> Result<()> {
        let collections = BTreeMap::from([
            ("chm".to_string(), chm_collection()),
            (
                "met".to_string(),
                CollectionConfig {
                    template: Some("/model/met.nc4".to_string()),
                    vars: None,
                    ..Default::default()
                },
            ),
            (
                "aer".to_string(),
                CollectionConfig {
                    template: None,
                    ..Default::default()
                },
            ),
        ]);

        let fields = reader(hourly_dataset(&[1.0])).read(hour(1, 0), &collections)?;
        assert_eq!(fields.len(), 1);
        Ok(())
    }

    #[test]
    fn test_missing_file_fails_read() {
        let collections = BTreeMap::from([("chm".to_string(), chm_collection())]);
        let result = reader(hourly_dataset(&[1.0])).read(hour(2, 0), &collections);
        assert!(matches!(result, Err(ProcessingError::GridRead { .. })));
    }

    #[test]
    fn test_parallel_matches_sequential() -> Result<()> {
        let values: Vec<f64> = (0..24).map(|h| h as f64 * 0.5).collect();
        let opener = MemoryOpener::new()
            .with_dataset("/model/chm.20191201.nc4", hourly_dataset(&values))
            .with_dataset(
                "/model/met.20191201.nc4",
                MemoryDataset::new(vec![-45.0, 45.0], vec![-90.0, 90.0], vec![hour(1, 0)])
                    .with_constant("T10M", 290.0)
                    .with_constant("PS", 100000.0),
            );
        let collections = BTreeMap::from([
            ("chm".to_string(), chm_collection()),
            (
                "met".to_string(),
                CollectionConfig::new("/model/met.%Y%m%d.nc4")
                    .with_var("t10m", VariableConfig::new("T10M"))
                    .with_var("ps", VariableConfig::new("PS")),
            ),
        ]);

        let reader = GriddedFieldReader::new(Arc::new(opener));
        let parallel = reader.read(hour(1, 9), &collections)?;
        let sequential = reader.clone().with_parallel(false).read(hour(1, 9), &collections)?;
        assert_eq!(parallel.fields, sequential.fields);
        assert_eq!(parallel.len(), 3);
        Ok(())
    }

    #[test]
    fn test_wildcard_files_are_concatenated() -> Result<()> {
        let first = MemoryDataset::new(vec![0.0], vec![0.0], vec![hour(1, 0)])
            .with_variable("O3", array![[[1.0]]]);
        let second = MemoryDataset::new(vec![0.0], vec![0.0], vec![hour(1, 1)])
            .with_variable("O3", array![[[3.0]]]);
        let opener = MemoryOpener::new()
            .with_dataset("/model/chm.20191201_0030z.nc4", first)
            .with_dataset("/model/chm.20191201_0130z.nc4", second);
        let collection = CollectionConfig::new("/model/chm.%Y%m%d_*.nc4")
            .with_var("o3", VariableConfig::new("O3"));
        let collections = BTreeMap::from([("chm".to_string(), collection)]);

        let fields = GriddedFieldReader::new(Arc::new(opener)).read(hour(1, 1), &collections)?;
        assert_eq!(fields.get("o3").unwrap().values[[0, 0]], 3.0);
        Ok(())
    }

    #[test]
    fn test_time_averaged_composite_map() -> Result<()> {
        let times = vec![hour(1, 0), hour(15, 0), hour(31, 0)];
        let mut dataset = MemoryDataset::new(vec![0.0], vec![0.0, 1.0], times);
        for (i, component) in CompositeVariable::aod550_total().components.iter().enumerate() {
            let series = Array3::from_shape_fn((3, 1, 2), |(t, _, _)| (i + t) as f64);
            dataset = dataset.with_variable(component.clone(), series);
        }
        let opener = MemoryOpener::new().with_dataset("/model/aer.nc4", dataset);
        let reader = GriddedFieldReader::new(Arc::new(opener));

        let request = TimeAverageRequest::new(
            "/model/aer.nc4",
            NaiveDate::from_ymd_opt(2019, 12, 1).unwrap(),
            NaiveDate::from_ymd_opt(2019, 12, 15).unwrap(),
            MapVariable::from_name("AOD550_TOTAL"),
        );
        let map = reader.read_time_averaged_map(&request)?;
        // components 0..6 averaged over the first two steps: sum(i + 0.5)
        assert_eq!(map.name, "AOD550_TOTAL");
        assert!((map.values[[0, 0]] - 18.0).abs() < 1e-12);

        let summer = request.clone().with_season(Season::JJA);
        assert!(reader.read_time_averaged_map(&summer).is_err());
        Ok(())
    }

    #[test]
    fn test_parse_cf_time_units() -> Result<()> {
        let (step, reference) = parse_cf_time_units("minutes since 2019-12-01 00:30:00")?;
        assert_eq!(step, 60.0);
        assert_eq!(reference, hour(1, 0) + Duration::minutes(30));

        let (step, reference) = parse_cf_time_units("days since 2019-12-01")?;
        assert_eq!(step, 86400.0);
        assert_eq!(reference, hour(1, 0));

        assert!(parse_cf_time_units("fortnights since 2019-12-01").is_err());
        assert!(parse_cf_time_units("hours").is_err());
        Ok(())
    }
}
