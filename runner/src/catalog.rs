use crate::{
    adapters::AdapterRegistry,
    config::{ClimateModel, Config, ConfigErrors},
};
use chrono::NaiveDate;
use globset::{Glob, GlobSet, GlobSetBuilder};
use itertools::{iproduct, Itertools};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display};
use tracing::{debug, info, instrument};

/// Deterministic identifier of a run, derived from all of its dimensions
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Immutable description of a single simulation run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    pub run_id: RunId,
    pub location_id: String,
    pub climate_source: String,
    pub gcm: String,
    pub rcm: Option<String>,
    pub scenario: String,
    pub period: String,
    pub crop_model: String,
    pub adaptation: String,
    pub sowing_date: NaiveDate,
}

impl RunSpec {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        location_id: &str,
        climate_source: &str,
        climate_model: &ClimateModel,
        scenario: &str,
        period: &str,
        crop_model: &str,
        adaptation: &str,
        sowing_date: NaiveDate,
    ) -> Self {
        let mut spec = Self {
            run_id: RunId(String::new()),
            location_id: location_id.to_owned(),
            climate_source: climate_source.to_owned(),
            gcm: climate_model.gcm.clone(),
            rcm: climate_model.rcm.clone(),
            scenario: scenario.to_owned(),
            period: period.to_owned(),
            crop_model: crop_model.to_owned(),
            adaptation: adaptation.to_owned(),
            sowing_date,
        };
        spec.run_id = spec.derive_run_id();

        spec
    }

    /// `gcm` or `gcm-rcm`
    pub fn climate_model(&self) -> String {
        match &self.rcm {
            Some(rcm) => format!("{}-{rcm}", self.gcm),
            None => self.gcm.clone(),
        }
    }

    // readable prefix for locality when sorting, hash suffix against sanitizing collisions
    fn derive_run_id(&self) -> RunId {
        let sowing = self.sowing_date.format("%Y-%m-%d").to_string();
        let exact = [
            self.location_id.as_str(),
            self.climate_source.as_str(),
            self.gcm.as_str(),
            self.rcm.as_deref().unwrap_or(""),
            self.scenario.as_str(),
            self.period.as_str(),
            self.crop_model.as_str(),
            self.adaptation.as_str(),
            sowing.as_str(),
        ];

        let mut hasher = Sha256::new();
        for (index, part) in exact.iter().enumerate() {
            if index > 0 {
                hasher.update([0u8]);
            }
            hasher.update(part.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());

        let readable = [
            self.location_id.clone(),
            self.climate_source.clone(),
            self.climate_model(),
            self.scenario.clone(),
            self.period.clone(),
            self.crop_model.clone(),
            self.adaptation.clone(),
            self.sowing_date.format("%Y%m%d").to_string(),
        ]
        .iter()
        .map(|part| sanitize(part))
        .join("_");

        RunId(format!("{readable}_{}", &digest[..8]))
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Glob patterns narrowing a catalog, as given on the command line
#[derive(clap::Args, Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterPatterns {
    /// Climate sources to include (comma separated globs)
    #[arg(long, value_delimiter = ',')]
    pub sources: Vec<String>,
    /// Climate models (gcm or gcm-rcm) to include
    #[arg(long, value_delimiter = ',')]
    pub models: Vec<String>,
    /// Climate scenarios to include
    #[arg(long, value_delimiter = ',')]
    pub scenarios: Vec<String>,
    /// Climate periods to include
    #[arg(long, value_delimiter = ',')]
    pub periods: Vec<String>,
    /// Crop models to include
    #[arg(long, value_delimiter = ',')]
    pub crop_models: Vec<String>,
}

impl FilterPatterns {
    pub fn compile(&self) -> Result<RunFilter, ConfigErrors> {
        Ok(RunFilter {
            sources: compile_globs(&self.sources)?,
            models: compile_globs(&self.models)?,
            scenarios: compile_globs(&self.scenarios)?,
            periods: compile_globs(&self.periods)?,
            crop_models: compile_globs(&self.crop_models)?,
        })
    }

    /// turn the patterns back into command line arguments for worker processes
    pub fn to_args(&self) -> Vec<String> {
        [
            ("--sources", &self.sources),
            ("--models", &self.models),
            ("--scenarios", &self.scenarios),
            ("--periods", &self.periods),
            ("--crop-models", &self.crop_models),
        ]
        .into_iter()
        .filter(|(_, patterns)| !patterns.is_empty())
        .flat_map(|(flag, patterns)| [flag.to_owned(), patterns.join(",")])
        .collect()
    }
}

fn compile_globs(patterns: &[String]) -> Result<Option<GlobSet>, globset::Error> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }

    builder.build().map(Some)
}

/// Compiled filter over run dimensions, an empty filter matches everything
#[derive(Clone, Debug, Default)]
pub struct RunFilter {
    sources: Option<GlobSet>,
    models: Option<GlobSet>,
    scenarios: Option<GlobSet>,
    periods: Option<GlobSet>,
    crop_models: Option<GlobSet>,
}

impl RunFilter {
    pub fn matches(&self, spec: &RunSpec) -> bool {
        fn check(set: &Option<GlobSet>, values: &[&str]) -> bool {
            set.as_ref()
                .map_or(true, |set| values.iter().any(|value| set.is_match(value)))
        }

        let climate_model = spec.climate_model();

        check(&self.sources, &[spec.climate_source.as_str()])
            && check(&self.models, &[climate_model.as_str(), spec.gcm.as_str()])
            && check(&self.scenarios, &[spec.scenario.as_str()])
            && check(&self.periods, &[spec.period.as_str()])
            && check(&self.crop_models, &[spec.crop_model.as_str()])
    }
}

/// The expanded set of runs for a configuration, sorted by run id
#[derive(Clone, Debug)]
pub struct Catalog {
    specs: Vec<RunSpec>,
}

impl Catalog {
    /// expand the configuration into every compatible combination that passes `filter`
    #[instrument(skip_all, level = "info")]
    pub fn build(
        config: &Config,
        registry: &AdapterRegistry,
        filter: &RunFilter,
    ) -> Result<Self, ConfigErrors> {
        let selection = config.selection()?;

        // an unknown adapter has to fail here and not deep inside execution
        for (name, _) in selection.crop_models.iter() {
            registry.require(name)?;
        }

        let mut skipped = 0usize;
        let mut climate = Vec::new();
        for (source_name, source) in selection.sources.iter() {
            for model in source.models.iter() {
                let periods: Vec<&str> = if model.periods.is_empty() {
                    source.periods.keys().map(String::as_str).collect()
                } else {
                    model.periods.iter().map(String::as_str).collect()
                };

                for (scenario, period) in iproduct!(model.scenarios.iter(), periods.iter().copied()) {
                    let period_config = config.period(source_name, period)?;

                    if !period_config.scenarios.is_empty()
                        && !period_config.scenarios.contains(scenario)
                    {
                        skipped += 1;
                        debug!(
                            source = *source_name,
                            model = %model.name(),
                            scenario = %scenario,
                            period,
                            "Skipping incompatible climate combination"
                        );
                        continue;
                    }

                    climate.push((*source_name, model, scenario.as_str(), period));
                }
            }
        }

        let mut specs = iproduct!(
            config.locations.keys(),
            climate.iter(),
            selection.crop_models.iter(),
            selection.adaptations.iter(),
            config.simulation.sowing_dates.iter()
        )
        .map(
            |(location, (source, model, scenario, period), (crop_model, _), adaptation, sowing)| {
                RunSpec::new(
                    location,
                    source,
                    model,
                    scenario,
                    period,
                    crop_model,
                    adaptation,
                    *sowing,
                )
            },
        )
        .filter(|spec| filter.matches(spec))
        .collect_vec();

        specs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        specs.dedup_by(|a, b| a.run_id == b.run_id);

        info!(
            runs = specs.len(),
            skipped_climate_combinations = skipped,
            "Built run catalog"
        );

        Ok(Self { specs })
    }

    pub fn specs(&self) -> &[RunSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
