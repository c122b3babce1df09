use super::{
    output::{self, TableFormat},
    process, render_value, AdapterError, GeneratedInputs, ModelAdapter, ModelRun, ParsedOutput,
    RunContext,
};
use crate::ledger::Stage;
use chrono::Datelike;
use std::{
    fmt::Write,
    path::{Path, PathBuf},
};

const WEATHER_FILE: &str = "climat.txt";
const SOIL_FILE: &str = "param.sol";
const EXPERIMENT_FILE: &str = "new_travail.usm";
const OUTPUT_FILE: &str = "mod_rapport.sti";
const DEFAULT_ARGUMENTS: [&str; 1] = ["-noscreen"];
const MISSING: f64 = -999.9;

/// STICS soil crop model
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SticsAdapter;

impl ModelAdapter for SticsAdapter {
    fn name(&self) -> &'static str {
        "stics"
    }

    fn generate_weather(&self, context: &RunContext<'_>) -> Result<PathBuf, AdapterError> {
        let climate = context.climate()?;
        let station = &context.spec.location_id;

        // station year month day doy tmin tmax rad etp rain wind vapour co2
        let mut content = String::new();
        for day in climate.days() {
            let _ = writeln!(
                content,
                "{station} {} {:>2} {:>2} {:>3} {:>6.1} {:>6.1} {:>6.1} {MISSING:>6.1} {:>6.1} {MISSING:>6.1} {MISSING:>6.1} {MISSING:>6.1}",
                day.date.year(),
                day.date.month(),
                day.date.day(),
                day.date.ordinal(),
                day.tasmin,
                day.tasmax,
                day.rsds,
                day.pr,
            );
        }

        context.write_input(Stage::Weather, WEATHER_FILE, content)
    }

    fn generate_soil(&self, context: &RunContext<'_>) -> Result<PathBuf, AdapterError> {
        let soil = &context.location.soil;
        if soil.layers.is_empty() {
            return Err(AdapterError::setup(
                Stage::Soil,
                format!("soil profile {} has no layers", soil.id),
            ));
        }

        let mut content = format!("{} {}\n", soil.id, soil.layers.len());
        let mut top = 0.0;
        for (index, layer) in soil.layers.iter().enumerate() {
            let _ = writeln!(
                content,
                "{} {:.0} {:.1} {:.1} {:.2} {:.2}",
                index + 1,
                layer.depth - top,
                layer.clay.unwrap_or(MISSING),
                layer.sand.unwrap_or(MISSING),
                layer.organic_carbon.unwrap_or(MISSING),
                layer.bulk_density.unwrap_or(MISSING)
            );
            top = layer.depth;
        }

        context.write_input(Stage::Soil, SOIL_FILE, content)
    }

    fn generate_experiment(
        &self,
        context: &RunContext<'_>,
        inputs: &GeneratedInputs,
    ) -> Result<PathBuf, AdapterError> {
        let file_name = |path: &Path| {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| AdapterError::setup(Stage::Experiment, format!("{path:?} has no file name")))
        };

        let (first, last) = context.period.years;
        let mut entries = vec![
            ("nom", context.spec.run_id.to_string()),
            ("datedebut", "1".to_owned()),
            ("datefin", (last - first + 1).to_string()),
            ("finit", file_name(&inputs.soil)?),
            ("fclim1", file_name(&inputs.weather)?),
            ("culturean", first.to_string()),
            ("plante", context.crop.to_owned()),
            ("variete", context.settings.cultivar.clone().unwrap_or_default()),
            ("iplt0", context.spec.sowing_date.ordinal().to_string()),
        ];
        entries.extend(
            context
                .settings
                .parameters
                .iter()
                .map(|(name, value)| (name.as_str(), render_value(value))),
        );

        let mut content = String::new();
        for (key, value) in entries {
            let _ = writeln!(content, ":{key}\n{value}");
        }

        context.write_input(Stage::Experiment, EXPERIMENT_FILE, content)
    }

    fn run_model(&self, context: &RunContext<'_>, experiment: &Path) -> Result<ModelRun, AdapterError> {
        process::run(context, &DEFAULT_ARGUMENTS, experiment)
    }

    fn parse_output(&self, context: &RunContext<'_>) -> Result<ParsedOutput, AdapterError> {
        output::standardize(
            &context.output_file(OUTPUT_FILE),
            TableFormat::Delimited(';'),
            &context.variables,
        )
    }
}
