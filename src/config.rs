use chrono::Duration;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use validator::Validate;

use crate::error::{ProcessingError, Result};
use crate::utils::constants::{
    COMPRESSION_SNAPPY, CONFIG_ENV_PREFIX, DEFAULT_GRID_RESOLUTION, DEFAULT_MIN_OBS,
    DEFAULT_PRESSURE_FIELD, DEFAULT_STATION_PREFIX, DEFAULT_TEMPERATURE_FIELD, MODEL_COLUMN,
};

fn default_scale() -> f64 {
    1.0
}

/// A model variable inside a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct VariableConfig {
    #[validate(length(min = 1))]
    pub name_on_file: String,

    #[serde(default = "default_scale")]
    pub scal: f64,
}

impl VariableConfig {
    pub fn new(name_on_file: impl Into<String>) -> Self {
        Self {
            name_on_file: name_on_file.into(),
            scal: 1.0,
        }
    }

    pub fn with_scale(mut self, scal: f64) -> Self {
        self.scal = scal;
        self
    }
}

/// A group of model variables sharing one file template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub template: Option<String>,
    pub vars: Option<BTreeMap<String, VariableConfig>>,

    #[serde(default, alias = "offset_before_hours")]
    pub average_offset_before: Option<f64>,

    #[serde(default, alias = "offset_after_hours")]
    pub average_offset_after: Option<f64>,

    /// Vertical level kept when the dataset has a level dimension
    #[serde(default)]
    pub level_index: Option<usize>,
}

impl CollectionConfig {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: Some(template.into()),
            vars: Some(BTreeMap::new()),
            ..Default::default()
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, var: VariableConfig) -> Self {
        self.vars.get_or_insert_with(BTreeMap::new).insert(key.into(), var);
        self
    }

    pub fn with_averaging_window(mut self, before_hours: f64, after_hours: f64) -> Self {
        self.average_offset_before = Some(before_hours);
        self.average_offset_after = Some(after_hours);
        self
    }

    /// Offsets before and after the target time; `None` selects the nearest step
    pub fn averaging_window(&self) -> Option<(Duration, Duration)> {
        if self.average_offset_before.is_none() && self.average_offset_after.is_none() {
            return None;
        }
        let to_duration = |hours: Option<f64>| {
            Duration::seconds((hours.unwrap_or(0.0) * 3600.0).round() as i64)
        };
        Some((
            to_duration(self.average_offset_before),
            to_duration(self.average_offset_after),
        ))
    }

    pub fn level(&self) -> usize {
        self.level_index.unwrap_or(0)
    }
}

/// Source variables of a mapping entry, a single name or a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(name) => vec![name.clone()],
            OneOrMany::Many(names) => names.clone(),
        }
    }
}

/// Pairs an observation type with one or more model variables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct MappingEntry {
    pub cfvars: Option<OneOrMany>,
    pub obstype: Option<String>,
    pub unit: Option<String>,

    /// Molecular weight, g/mol
    #[validate(range(exclusive_min = 0.0))]
    pub mw: Option<f64>,

    pub modcol_suffix: Option<String>,
}

impl MappingEntry {
    pub fn new(obstype: impl Into<String>, cfvars: &[&str]) -> Self {
        let cfvars = if cfvars.len() == 1 {
            OneOrMany::One(cfvars[0].to_string())
        } else {
            OneOrMany::Many(cfvars.iter().map(|v| v.to_string()).collect())
        };
        Self {
            cfvars: Some(cfvars),
            obstype: Some(obstype.into()),
            ..Default::default()
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_molecular_weight(mut self, mw: f64) -> Self {
        self.mw = Some(mw);
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.modcol_suffix = Some(suffix.into());
        self
    }

    /// Model column written by this entry
    pub fn model_column(&self) -> String {
        format!("{}{}", MODEL_COLUMN, self.modcol_suffix.as_deref().unwrap_or(""))
    }

    pub fn source_variables(&self) -> Vec<String> {
        self.cfvars.as_ref().map(OneOrMany::to_vec).unwrap_or_default()
    }
}

/// Names of the meteorological fields used for unit conversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetFields {
    #[serde(default = "MetFields::default_temperature")]
    pub temperature: String,

    #[serde(default = "MetFields::default_pressure")]
    pub pressure: String,
}

impl MetFields {
    fn default_temperature() -> String {
        DEFAULT_TEMPERATURE_FIELD.to_string()
    }

    fn default_pressure() -> String {
        DEFAULT_PRESSURE_FIELD.to_string()
    }
}

impl Default for MetFields {
    fn default() -> Self {
        Self {
            temperature: Self::default_temperature(),
            pressure: Self::default_pressure(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CfConfigFile {
    configuration_file: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CfConfigSource {
    File(CfConfigFile),
    Inline(BTreeMap<String, CollectionConfig>),
}

#[derive(Debug, Deserialize)]
struct RawMatchConfig {
    cf_config: CfConfigSource,
    mapping: BTreeMap<String, MappingEntry>,
    #[serde(default)]
    met: MetFields,
}

/// Model collections plus the observation/model mapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchConfig {
    pub cf_config: BTreeMap<String, CollectionConfig>,
    pub mapping: BTreeMap<String, MappingEntry>,
    pub met: MetFields,
}

impl MatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, name: impl Into<String>, collection: CollectionConfig) -> Self {
        self.cf_config.insert(name.into(), collection);
        self
    }

    pub fn with_mapping(mut self, name: impl Into<String>, entry: MappingEntry) -> Self {
        self.mapping.insert(name.into(), entry);
        self
    }

    /// Load a mapping file. A `cf_config: {configuration_file: ...}` indirection is
    /// resolved as given, then relative to the mapping file's directory.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProcessingError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_yaml_str(&content, &base_dir)
    }

    pub fn from_yaml_str(content: &str, base_dir: &Path) -> Result<Self> {
        let raw: RawMatchConfig = serde_yaml::from_str(content)?;

        let cf_config = match raw.cf_config {
            CfConfigSource::Inline(collections) => collections,
            CfConfigSource::File(file) => {
                let path = resolve_relative(&file.configuration_file, base_dir);
                debug!("Loading model collections from {}", path.display());
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    ProcessingError::Config(format!("Cannot read {}: {}", path.display(), e))
                })?;
                serde_yaml::from_str(&content)?
            }
        };

        let config = Self {
            cf_config,
            mapping: raw.mapping,
            met: raw.met,
        };
        config.validate_entries()?;
        Ok(config)
    }

    /// Validate the typed values. Missing keys are not errors here, the
    /// reader and matcher skip those entries with a warning.
    pub fn validate_entries(&self) -> Result<()> {
        for (name, collection) in &self.cf_config {
            if let Some(vars) = &collection.vars {
                for (key, var) in vars {
                    var.validate()?;
                    if !var.scal.is_finite() {
                        return Err(ProcessingError::Config(format!(
                            "Scale factor of '{}' in collection '{}' is not finite",
                            key, name
                        )));
                    }
                }
            }
            for offset in [collection.average_offset_before, collection.average_offset_after]
                .into_iter()
                .flatten()
            {
                if !(offset >= 0.0) {
                    return Err(ProcessingError::Config(format!(
                        "Averaging offsets of collection '{}' must be non-negative",
                        name
                    )));
                }
            }
        }
        for entry in self.mapping.values() {
            entry.validate()?;
        }
        Ok(())
    }

    /// True when some collection provides both meteorological fields
    pub fn provides_meteorology(&self) -> bool {
        let declared = |key: &str| {
            self.cf_config
                .values()
                .filter_map(|c| c.vars.as_ref())
                .any(|vars| vars.contains_key(key))
        };
        declared(&self.met.temperature) && declared(&self.met.pressure)
    }
}

fn resolve_relative(file: &str, base_dir: &Path) -> PathBuf {
    let path = PathBuf::from(file);
    if path.is_file() {
        return path;
    }
    let relative = base_dir.join(&path);
    if !relative.is_file() {
        warn!(
            "Collection configuration {} not found, also tried {}",
            path.display(),
            relative.display()
        );
    }
    relative
}

/// Run-wide settings layered from defaults, an optional YAML file and
/// `CFOBS_*` environment variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Settings {
    #[validate(range(exclusive_min = 0.0))]
    pub grid_resolution: f64,

    #[validate(range(min = 1))]
    pub min_obs: usize,

    #[validate(length(min = 1))]
    pub station_prefix: String,

    /// Key substituted for `%t` in registry and output paths
    pub obs_key: String,

    pub registry_file: Option<String>,
    pub regions_file: Option<String>,
    pub nfloats: Option<usize>,
    pub compression: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            grid_resolution: DEFAULT_GRID_RESOLUTION,
            min_obs: DEFAULT_MIN_OBS,
            station_prefix: DEFAULT_STATION_PREFIX.to_string(),
            obs_key: "obs".to_string(),
            registry_file: None,
            regions_file: None,
            nfloats: None,
            compression: COMPRESSION_SNAPPY.to_string(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Settings::default();
        let mut builder = Config::builder()
            .set_default("grid_resolution", defaults.grid_resolution)?
            .set_default("min_obs", defaults.min_obs as i64)?
            .set_default("station_prefix", defaults.station_prefix)?
            .set_default("obs_key", defaults.obs_key)?
            .set_default("compression", defaults.compression)?;

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Yaml)
                    .required(true),
            );
        }

        let settings: Settings = builder
            .add_source(Environment::with_prefix(CONFIG_ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }
}
