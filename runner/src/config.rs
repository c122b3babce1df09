use crate::{adapters::Adapters, catalog::RunId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read configuration file {path:?}: {source}")]
    Read { path: PathBuf, source: Error },
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Filter patterns were invalid: {0}")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Crop model '{0}' has no configuration entry")]
    UnknownCropModel(String),
    #[error("Adaptation '{0}' has no configuration entry")]
    UnknownAdaptation(String),
    #[error("Climate source '{0}' has no configuration entry")]
    UnknownClimateSource(String),
    #[error("Period '{period}' is not defined for climate source '{source_name}'")]
    UnknownPeriod { source_name: String, period: String },
    #[error("Location '{0}' has no configuration entry")]
    UnknownLocation(String),
    #[error("Crop model '{model}' requests adapter '{adapter}' which is not registered")]
    UnsupportedAdapter { model: String, adapter: String },
    #[error("Invalid worker environment: {0}")]
    WorkerEnvironment(String),
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Configuration failed the preflight checks, see the log for details")]
    Preflight,
}

/// Complete, immutable configuration of a simulation batch
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub paths: PathsConfig,
    pub locations: BTreeMap<String, Location>,
    pub climate: ClimateConfig,
    pub crop_models: BTreeMap<String, CropModelConfig>,
    #[serde(default = "default_adaptations")]
    pub adaptations: BTreeMap<String, AdaptationConfig>,
    pub simulation: SimulationConfig,
    // standardized variable -> crop model -> raw model variable
    #[serde(default)]
    pub variable_mapping: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub parallel: ParallelConfig,

    // path the configuration was loaded from, handed down to worker processes
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    pub simulation_setup_dir: PathBuf,
    // defaults to <simulation_setup_dir>/simulation_status.db
    pub ledger: Option<PathBuf>,
    pub climate_dir: PathBuf,
    #[serde(default = "default_climate_file_template")]
    pub climate_file_template: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub elevation: f64,
    pub soil: SoilProfile,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SoilProfile {
    pub id: String,
    #[serde(default)]
    pub layers: Vec<SoilLayer>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SoilLayer {
    // bottom depth of the layer in cm
    pub depth: f64,
    #[serde(default)]
    pub clay: Option<f64>,
    #[serde(default)]
    pub sand: Option<f64>,
    #[serde(default)]
    pub silt: Option<f64>,
    #[serde(default)]
    pub organic_carbon: Option<f64>,
    #[serde(default)]
    pub bulk_density: Option<f64>,
}

impl SoilLayer {
    /// silt fraction, derived from clay and sand if not given explicitly
    pub fn silt(&self) -> Option<f64> {
        self.silt.or_else(|| match (self.clay, self.sand) {
            (Some(clay), Some(sand)) => Some((100.0 - clay - sand).max(0.0)),
            _ => None,
        })
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClimateConfig {
    pub sources: BTreeMap<String, ClimateSource>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClimateSource {
    pub models: Vec<ClimateModel>,
    pub periods: BTreeMap<String, PeriodConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClimateModel {
    pub gcm: String,
    #[serde(default)]
    pub rcm: Option<String>,
    pub scenarios: Vec<String>,
    // empty means every period of the source
    #[serde(default)]
    pub periods: Vec<String>,
}

impl ClimateModel {
    /// name used in file names and filters, `gcm` or `gcm-rcm`
    pub fn name(&self) -> String {
        match &self.rcm {
            Some(rcm) => format!("{}-{rcm}", self.gcm),
            None => self.gcm.clone(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PeriodConfig {
    // first and last simulated year (inclusive)
    pub years: (i32, i32),
    // scenarios this period is available for, empty means all
    #[serde(default)]
    pub scenarios: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CropModelConfig {
    // name of the registered adapter, defaults to the lowercased crop model name
    pub adapter: Option<String>,
    pub executable: PathBuf,
    // overrides the adapter's default command line, supports {experiment} and {working_dir}
    pub arguments: Option<Vec<String>>,
    // wall clock limit in seconds, defaults to execution.run_timeout
    pub timeout: Option<u64>,
    // overrides the adapter's default output file name
    pub output_file: Option<String>,
    pub cultivar: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

impl CropModelConfig {
    pub fn adapter_name(&self, model: &str) -> String {
        self.adapter
            .clone()
            .unwrap_or_else(|| model.to_owned())
            .to_lowercase()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct AdaptationConfig {
    pub description: Option<String>,
    // crop model name -> overrides of that model's defaults
    #[serde(default)]
    pub overrides: BTreeMap<String, ModelOverride>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ModelOverride {
    pub cultivar: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    pub crop: String,
    pub sowing_dates: Vec<NaiveDate>,
    // selections, empty means everything that is configured
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub adaptations: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    // experiment parameters shared by every crop model, e.g. fertilizer rates
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    // seconds
    #[serde(default = "default_run_timeout")]
    pub run_timeout: u64,
    // seconds a RUNNING record may go without update before it is considered abandoned
    #[serde(default = "default_stale_after")]
    pub stale_after: u64,
    // seconds
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,
    #[serde(default = "default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            run_timeout: default_run_timeout(),
            stale_after: default_stale_after(),
            lock_timeout: default_lock_timeout(),
            lock_retry_interval_ms: default_lock_retry_interval_ms(),
        }
    }
}

impl ExecutionConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ParallelConfig {
    // -1 uses every logical core
    #[serde(default = "default_num_workers")]
    pub num_workers: i64,
    pub hpc: Option<HpcConfig>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            hpc: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct HpcConfig {
    pub task_id_var: String,
    pub task_count_var: String,
    // set for schedulers that number array tasks from 0
    #[serde(default)]
    pub zero_based: bool,
}

/// Parameters of one experiment after applying adaptation overrides
#[derive(Clone, Debug, PartialEq)]
pub struct ExperimentSettings {
    pub cultivar: Option<String>,
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

/// Models, adaptations and climate sources selected for the catalog
#[derive(Clone, Debug)]
pub struct Selection<'a> {
    pub crop_models: Vec<(&'a str, &'a CropModelConfig)>,
    pub adaptations: Vec<&'a str>,
    pub sources: Vec<(&'a str, &'a ClimateSource)>,
}

impl Config {
    /// load and validate the configuration at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = serde_yaml::from_str(&raw)?;

        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.resolve_paths(&base);
        config.source = Some(fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()));

        if config.preflight_checks() {
            Err(ConfigErrors::Preflight)
        } else {
            Ok(config)
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        resolve(&mut self.paths.simulation_setup_dir);
        resolve(&mut self.paths.climate_dir);
        if let Some(ledger) = self.paths.ledger.as_mut() {
            resolve(ledger);
        }
        for model in self.crop_models.values_mut() {
            resolve(&mut model.executable);
        }
    }

    /// returns true if any error was found, every problem is logged
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.crop_models.is_empty() {
            error!("No crop model was defined, unable to build a catalog");
            contains_error = true;
        }

        if self.locations.is_empty() {
            error!("No location was defined, unable to build a catalog");
            contains_error = true;
        }

        if self.simulation.sowing_dates.is_empty() {
            error!("simulation.sowing_dates must contain at least one date");
            contains_error = true;
        }

        if let Err(error) = self.selection() {
            error!("Invalid selection: {error}");
            contains_error = true;
        }

        let mut longest_timeout = self.execution.run_timeout;

        for (name, model) in self.crop_models.iter() {
            let adapter = model.adapter_name(name);
            if Adapters::by_name(&adapter).is_none() {
                error!("crop_models.{name}.adapter '{adapter}' is not a registered adapter");
                contains_error = true;
            }

            match check_executable(&model.executable) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "crop_models.{name}.executable {} is not executable",
                        model.executable.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if crop_models.{name}.executable ({}) is an executable: {e}",
                        model.executable.to_string_lossy()
                    );
                    contains_error = true;
                }
            }

            match model.timeout {
                Some(0) => {
                    error!("crop_models.{name}.timeout cannot be 0");
                    contains_error = true;
                }
                Some(timeout) => longest_timeout = longest_timeout.max(timeout),
                None => {}
            }
        }

        for (name, source) in self.climate.sources.iter() {
            for model in source.models.iter() {
                for period in model.periods.iter() {
                    if !source.periods.contains_key(period) {
                        error!(
                            "climate.sources.{name} model {} references undefined period {period}",
                            model.name()
                        );
                        contains_error = true;
                    }
                }
            }

            for (period, config) in source.periods.iter() {
                if config.years.0 > config.years.1 {
                    error!("climate.sources.{name}.periods.{period} ends before it starts");
                    contains_error = true;
                }
            }
        }

        for (adaptation, config) in self.adaptations.iter() {
            for model in config.overrides.keys() {
                if !self.crop_models.contains_key(model) {
                    warn!("adaptations.{adaptation} overrides unknown crop model {model}, ignoring");
                }
            }
        }

        for (variable, models) in self.variable_mapping.iter() {
            for model in models.keys() {
                if !self.crop_models.contains_key(model) {
                    warn!("variable_mapping.{variable} maps unknown crop model {model}, ignoring");
                }
            }
        }

        if self.execution.max_retries == 0 {
            error!("execution.max_retries must be at least 1");
            contains_error = true;
        }

        if self.execution.run_timeout == 0 {
            error!("execution.run_timeout cannot be 0");
            contains_error = true;
        }

        if self.execution.stale_after <= longest_timeout {
            error!(
                "execution.stale_after ({}s) must exceed the longest run timeout ({longest_timeout}s), otherwise live runs would be recovered",
                self.execution.stale_after
            );
            contains_error = true;
        }

        if self.parallel.num_workers == 0 || self.parallel.num_workers < -1 {
            error!("parallel.num_workers must be -1 or a positive number");
            contains_error = true;
        }

        if let Some(hpc) = &self.parallel.hpc {
            if hpc.task_id_var.is_empty() || hpc.task_count_var.is_empty() {
                error!("parallel.hpc requires non-empty task_id_var and task_count_var");
                contains_error = true;
            }
        }

        contains_error
    }

    /// resolve the selected models, adaptations and sources against their configuration entries
    pub fn selection(&self) -> Result<Selection<'_>, ConfigErrors> {
        let crop_models = if self.simulation.models.is_empty() {
            self.crop_models
                .iter()
                .map(|(name, config)| (name.as_str(), config))
                .collect()
        } else {
            self.simulation
                .models
                .iter()
                .map(|name| self.crop_model(name).map(|config| (name.as_str(), config)))
                .collect::<Result<Vec<_>, _>>()?
        };

        let adaptations = if self.simulation.adaptations.is_empty() {
            self.adaptations.keys().map(String::as_str).collect()
        } else {
            self.simulation
                .adaptations
                .iter()
                .map(|name| self.adaptation(name).map(|_| name.as_str()))
                .collect::<Result<Vec<_>, _>>()?
        };

        let sources = if self.simulation.sources.is_empty() {
            self.climate
                .sources
                .iter()
                .map(|(name, source)| (name.as_str(), source))
                .collect()
        } else {
            self.simulation
                .sources
                .iter()
                .map(|name| self.climate_source(name).map(|source| (name.as_str(), source)))
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Selection {
            crop_models,
            adaptations,
            sources,
        })
    }

    pub fn crop_model(&self, name: &str) -> Result<&CropModelConfig, ConfigErrors> {
        self.crop_models
            .get(name)
            .ok_or_else(|| ConfigErrors::UnknownCropModel(name.to_owned()))
    }

    pub fn adaptation(&self, name: &str) -> Result<&AdaptationConfig, ConfigErrors> {
        self.adaptations
            .get(name)
            .ok_or_else(|| ConfigErrors::UnknownAdaptation(name.to_owned()))
    }

    pub fn climate_source(&self, name: &str) -> Result<&ClimateSource, ConfigErrors> {
        self.climate
            .sources
            .get(name)
            .ok_or_else(|| ConfigErrors::UnknownClimateSource(name.to_owned()))
    }

    pub fn location(&self, id: &str) -> Result<&Location, ConfigErrors> {
        self.locations
            .get(id)
            .ok_or_else(|| ConfigErrors::UnknownLocation(id.to_owned()))
    }

    pub fn period(&self, source: &str, period: &str) -> Result<&PeriodConfig, ConfigErrors> {
        self.climate_source(source)?
            .periods
            .get(period)
            .ok_or_else(|| ConfigErrors::UnknownPeriod {
                source_name: source.to_owned(),
                period: period.to_owned(),
            })
    }

    /// merge model defaults with the overrides of an adaptation, the adaptation wins
    pub fn experiment_settings(
        &self,
        model: &str,
        adaptation: &str,
    ) -> Result<ExperimentSettings, ConfigErrors> {
        let defaults = self.crop_model(model)?;
        let adaptation = self.adaptation(adaptation)?;

        let mut parameters = self.simulation.parameters.clone();
        parameters.extend(defaults.parameters.clone());
        let mut cultivar = defaults.cultivar.clone();

        if let Some(overrides) = adaptation.overrides.get(model) {
            parameters.extend(overrides.parameters.clone());
            if overrides.cultivar.is_some() {
                cultivar = overrides.cultivar.clone();
            }
        }

        Ok(ExperimentSettings {
            cultivar,
            parameters,
        })
    }

    /// standardized variable -> raw variable name for one crop model
    pub fn variables_for(&self, model: &str) -> BTreeMap<String, String> {
        self.variable_mapping
            .iter()
            .filter_map(|(variable, models)| {
                models
                    .get(model)
                    .map(|raw| (variable.clone(), raw.clone()))
            })
            .collect()
    }

    pub fn run_timeout(&self, model: &str) -> Duration {
        Duration::from_secs(
            self.crop_models
                .get(model)
                .and_then(|config| config.timeout)
                .unwrap_or(self.execution.run_timeout),
        )
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.paths
            .ledger
            .clone()
            .unwrap_or_else(|| self.paths.simulation_setup_dir.join("simulation_status.db"))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.paths.simulation_setup_dir.join("batch_snapshot.json")
    }

    pub fn working_dir(&self, run_id: &RunId) -> PathBuf {
        self.paths.simulation_setup_dir.join(run_id.as_str())
    }

    /// location of the prepared climate series for one run
    pub fn climate_file(
        &self,
        location: &str,
        source: &str,
        model: &str,
        scenario: &str,
        period: &str,
    ) -> PathBuf {
        let file_name = self
            .paths
            .climate_file_template
            .replace("{location}", location)
            .replace("{source}", source)
            .replace("{model}", model)
            .replace("{scenario}", scenario)
            .replace("{period}", period);

        self.paths.climate_dir.join(file_name)
    }
}

fn default_adaptations() -> BTreeMap<String, AdaptationConfig> {
    BTreeMap::from([("baseline".to_owned(), AdaptationConfig::default())])
}

fn default_climate_file_template() -> String {
    "{location}_{source}_{model}_{scenario}_{period}.csv".to_owned()
}

fn default_max_retries() -> u32 {
    3
}

fn default_run_timeout() -> u64 {
    3600
}

fn default_stale_after() -> u64 {
    4 * 3600
}

fn default_lock_timeout() -> u64 {
    120
}

fn default_lock_retry_interval_ms() -> u64 {
    50
}

fn default_num_workers() -> i64 {
    -1
}
