pub mod apsim;
pub mod climate;
pub mod dssat;
pub mod output;
pub mod process;
pub mod stics;

use crate::{
    catalog::RunSpec,
    config::{Config, ConfigErrors, CropModelConfig, ExperimentSettings, Location, PeriodConfig},
    ledger::{ErrorKind, RunError, Stage},
};
use climate::ClimateSeries;
use once_cell::sync::Lazy;
use std::{
    collections::BTreeMap,
    fmt::Display,
    fs,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Failed to generate {stage} input: {message}")]
    Setup { stage: Stage, message: String },
    #[error("Failed to spawn {executable:?}: {source}")]
    Spawn { executable: PathBuf, source: io::Error },
    #[error("Model exited with {code:?}, see {log:?}")]
    Exit { code: Option<i32>, log: PathBuf },
    #[error("Model did not finish within {0:?} and was killed")]
    Timeout(Duration),
    #[error("Failed to read {stage} of the model: {message}")]
    Parse { stage: Stage, message: String },
    #[error(transparent)]
    Configuration(#[from] ConfigErrors),
}

impl AdapterError {
    pub fn setup(stage: Stage, message: impl Display) -> Self {
        Self::Setup {
            stage,
            message: message.to_string(),
        }
    }

    pub fn parse(message: impl Display) -> Self {
        Self::Parse {
            stage: Stage::Output,
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Setup { .. } => ErrorKind::Setup,
            Self::Spawn { .. } | Self::Exit { .. } => ErrorKind::Execution,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::Setup { stage, .. } | Self::Parse { stage, .. } => *stage,
            Self::Spawn { .. } | Self::Exit { .. } | Self::Timeout(_) => Stage::Model,
            Self::Configuration(_) => Stage::Prepare,
        }
    }

    pub fn to_run_error(&self) -> RunError {
        RunError {
            kind: self.kind(),
            stage: self.stage(),
            message: self.to_string(),
        }
    }
}

/// Everything an adapter needs to know about one run
#[derive(Clone, Debug)]
pub struct RunContext<'a> {
    pub spec: &'a RunSpec,
    pub crop: &'a str,
    pub model: &'a CropModelConfig,
    pub location: &'a Location,
    pub period: &'a PeriodConfig,
    pub settings: ExperimentSettings,
    // standardized variable -> raw variable of this crop model
    pub variables: BTreeMap<String, String>,
    pub climate_file: PathBuf,
    pub working_dir: &'a Path,
    pub timeout: Duration,
}

impl<'a> RunContext<'a> {
    pub fn new(config: &'a Config, spec: &'a RunSpec, working_dir: &'a Path) -> Result<Self, ConfigErrors> {
        Ok(Self {
            spec,
            crop: &config.simulation.crop,
            model: config.crop_model(&spec.crop_model)?,
            location: config.location(&spec.location_id)?,
            period: config.period(&spec.climate_source, &spec.period)?,
            settings: config.experiment_settings(&spec.crop_model, &spec.adaptation)?,
            variables: config.variables_for(&spec.crop_model),
            climate_file: config.climate_file(
                &spec.location_id,
                &spec.climate_source,
                &spec.climate_model(),
                &spec.scenario,
                &spec.period,
            ),
            working_dir,
            timeout: config.run_timeout(&spec.crop_model),
        })
    }

    /// daily climate of the run's period
    pub fn climate(&self) -> Result<ClimateSeries, AdapterError> {
        let series = ClimateSeries::read(&self.climate_file)
            .map_err(|error| AdapterError::setup(Stage::Weather, error))?
            .within_years(self.period.years);

        if series.is_empty() {
            return Err(AdapterError::setup(
                Stage::Weather,
                format!(
                    "{:?} has no days within {}-{}",
                    self.climate_file, self.period.years.0, self.period.years.1
                ),
            ));
        }

        Ok(series)
    }

    /// write a generated input file into the working directory
    pub fn write_input(&self, stage: Stage, name: &str, content: impl AsRef<[u8]>) -> Result<PathBuf, AdapterError> {
        let path = self.working_dir.join(name);
        fs::write(&path, content)
            .map_err(|error| AdapterError::setup(stage, format!("failed to write {path:?}: {error}")))?;
        debug!(path = ?path, "Generated {stage} input");

        Ok(path)
    }

    /// raw output file, overridable per crop model
    pub fn output_file(&self, default: &str) -> PathBuf {
        self.working_dir
            .join(self.model.output_file.as_deref().unwrap_or(default))
    }
}

/// Paths of the inputs generated for one run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedInputs {
    pub weather: PathBuf,
    pub soil: PathBuf,
}

/// Result of a finished model process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelRun {
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

/// Standardized values of one run and the raw files they were read from
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedOutput {
    pub values: BTreeMap<String, f64>,
    pub output_paths: BTreeMap<String, PathBuf>,
}

/// Capabilities every crop model integration provides
pub trait ModelAdapter {
    fn name(&self) -> &'static str;

    fn generate_weather(&self, context: &RunContext<'_>) -> Result<PathBuf, AdapterError>;

    fn generate_soil(&self, context: &RunContext<'_>) -> Result<PathBuf, AdapterError>;

    fn generate_experiment(
        &self,
        context: &RunContext<'_>,
        inputs: &GeneratedInputs,
    ) -> Result<PathBuf, AdapterError>;

    /// run the model binary in the working directory, bounded by the context's timeout
    fn run_model(&self, context: &RunContext<'_>, experiment: &Path) -> Result<ModelRun, AdapterError>;

    fn parse_output(&self, context: &RunContext<'_>) -> Result<ParsedOutput, AdapterError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Adapters {
    Dssat(dssat::DssatAdapter),
    Apsim(apsim::ApsimAdapter),
    Stics(stics::SticsAdapter),
}

static BUILTIN: Lazy<BTreeMap<&'static str, Adapters>> = Lazy::new(|| {
    [
        Adapters::Dssat(dssat::DssatAdapter),
        Adapters::Apsim(apsim::ApsimAdapter),
        Adapters::Stics(stics::SticsAdapter),
    ]
    .into_iter()
    .map(|adapter| (adapter.name(), adapter))
    .collect()
});

impl Adapters {
    pub fn by_name(name: &str) -> Option<Self> {
        BUILTIN.get(name.to_lowercase().as_str()).copied()
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        BUILTIN.keys().copied()
    }

    fn inner(&self) -> &dyn ModelAdapter {
        match self {
            Self::Dssat(adapter) => adapter,
            Self::Apsim(adapter) => adapter,
            Self::Stics(adapter) => adapter,
        }
    }
}

impl ModelAdapter for Adapters {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn generate_weather(&self, context: &RunContext<'_>) -> Result<PathBuf, AdapterError> {
        self.inner().generate_weather(context)
    }

    fn generate_soil(&self, context: &RunContext<'_>) -> Result<PathBuf, AdapterError> {
        self.inner().generate_soil(context)
    }

    fn generate_experiment(
        &self,
        context: &RunContext<'_>,
        inputs: &GeneratedInputs,
    ) -> Result<PathBuf, AdapterError> {
        self.inner().generate_experiment(context, inputs)
    }

    fn run_model(&self, context: &RunContext<'_>, experiment: &Path) -> Result<ModelRun, AdapterError> {
        self.inner().run_model(context, experiment)
    }

    fn parse_output(&self, context: &RunContext<'_>) -> Result<ParsedOutput, AdapterError> {
        self.inner().parse_output(context)
    }
}

/// Adapter of every configured crop model
#[derive(Clone, Debug)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Adapters>,
}

impl AdapterRegistry {
    pub fn load(config: &Config) -> Result<Self, ConfigErrors> {
        let adapters = config
            .crop_models
            .iter()
            .map(|(model, model_config)| {
                let name = model_config.adapter_name(model);

                Adapters::by_name(&name)
                    .map(|adapter| (model.clone(), adapter))
                    .ok_or_else(|| ConfigErrors::UnsupportedAdapter {
                        model: model.clone(),
                        adapter: name,
                    })
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(Self { adapters })
    }

    pub fn require(&self, crop_model: &str) -> Result<&Adapters, ConfigErrors> {
        self.adapters
            .get(crop_model)
            .ok_or_else(|| ConfigErrors::UnknownCropModel(crop_model.to_owned()))
    }
}

/// plain text rendering of a parameter value for the model input formats
pub fn render_value(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => "-99".to_owned(),
        serde_yaml::Value::Bool(value) => value.to_string(),
        serde_yaml::Value::Number(value) => value.to_string(),
        serde_yaml::Value::String(value) => value.clone(),
        other => serde_yaml::to_string(other)
            .map(|rendered| rendered.trim().replace('\n', " "))
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[test]
    fn builtin_adapters_are_found_case_insensitively() {
        assert_eq!(
            Adapters::by_name("DSSAT"),
            Some(Adapters::Dssat(dssat::DssatAdapter))
        );
        assert_eq!(Adapters::by_name("wofost"), None);
        assert_eq!(Adapters::names().collect::<Vec<_>>(), vec!["apsim", "dssat", "stics"]);
    }

    #[test]
    fn registry_maps_crop_models_to_adapters() {
        let fixture = Fixture::new();
        let mut config = fixture.config();

        let registry = AdapterRegistry::load(&config).unwrap();
        assert_eq!(registry.require("A").unwrap().name(), "dssat");
        assert_eq!(registry.require("B").unwrap().name(), "apsim");
        assert!(matches!(
            registry.require("C"),
            Err(ConfigErrors::UnknownCropModel(_))
        ));

        config.crop_models.get_mut("B").unwrap().adapter = Some("wofost".to_owned());
        assert!(matches!(
            AdapterRegistry::load(&config),
            Err(ConfigErrors::UnsupportedAdapter { model, adapter }) if model == "B" && adapter == "wofost"
        ));
    }

    #[test]
    fn errors_are_classified() {
        let exit = AdapterError::Exit {
            code: Some(3),
            log: PathBuf::from("execution.log"),
        };
        assert_eq!(exit.kind(), ErrorKind::Execution);
        assert_eq!(exit.to_run_error().stage, Stage::Model);

        let timeout = AdapterError::Timeout(Duration::from_secs(1));
        assert_eq!(timeout.to_run_error().kind, ErrorKind::Timeout);
        assert_eq!(timeout.stage(), Stage::Model);

        let setup = AdapterError::setup(Stage::Soil, "no layers");
        assert_eq!(setup.kind(), ErrorKind::Setup);
        assert_eq!(setup.stage(), Stage::Soil);
        assert_eq!(AdapterError::parse("missing HWAM").kind(), ErrorKind::Parse);
    }

    #[test]
    fn parameter_values_render_as_plain_text() {
        assert_eq!(render_value(&serde_yaml::Value::from(150)), "150");
        assert_eq!(render_value(&serde_yaml::Value::from("IB0001")), "IB0001");
        assert_eq!(render_value(&serde_yaml::Value::Null), "-99");
    }
}
