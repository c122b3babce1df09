use super::{
    output::{self, TableFormat},
    process, render_value, AdapterError, GeneratedInputs, ModelAdapter, ModelRun, ParsedOutput,
    RunContext,
};
use crate::ledger::Stage;
use std::{
    fmt::Write,
    path::{Path, PathBuf},
};

const WEATHER_FILE: &str = "WEATHER.WTH";
const SOIL_FILE: &str = "SOIL.SOL";
const EXPERIMENT_FILE: &str = "EXPERIMENT.MZX";
const OUTPUT_FILE: &str = "Summary.OUT";
// batch mode on the generated experiment
const DEFAULT_ARGUMENTS: [&str; 2] = ["B", "{experiment}"];
const MISSING: f64 = -99.0;

/// DSSAT cropping system model
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DssatAdapter;

// two letter DSSAT crop code
fn crop_code(crop: &str) -> String {
    match crop.to_lowercase().as_str() {
        "maize" | "corn" => "MZ".to_owned(),
        "wheat" => "WH".to_owned(),
        "rice" => "RI".to_owned(),
        "soybean" => "SB".to_owned(),
        "sorghum" => "SG".to_owned(),
        other => other.chars().take(2).collect::<String>().to_uppercase(),
    }
}

// four character institute/site code from the location id
fn site_code(location: &str) -> String {
    let code: String = location
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(4)
        .collect::<String>()
        .to_uppercase();

    format!("{code:X<4}")
}

impl ModelAdapter for DssatAdapter {
    fn name(&self) -> &'static str {
        "dssat"
    }

    fn generate_weather(&self, context: &RunContext<'_>) -> Result<PathBuf, AdapterError> {
        let climate = context.climate()?;
        let (tav, amp) = climate.tav_amp();
        let spec = context.spec;
        let location = context.location;

        let mut content = format!(
            "*WEATHER DATA : {} {} {} {} {}\n\n",
            spec.location_id,
            spec.climate_source,
            spec.climate_model(),
            spec.scenario,
            spec.period
        );
        content.push_str("@ INSI      LAT     LONG  ELEV   TAV   AMP REFHT WNDHT\n");
        let _ = writeln!(
            content,
            "  {:<4} {:>8.3} {:>8.3} {:>5.0} {:>5.1} {:>5.1} {:>5.1} {:>5.1}",
            site_code(&spec.location_id),
            location.lat,
            location.lon,
            location.elevation,
            tav,
            amp,
            MISSING,
            MISSING
        );
        content.push_str("@  DATE  SRAD  TMAX  TMIN  RAIN\n");

        for day in climate.days() {
            let _ = writeln!(
                content,
                "{} {:>5.1} {:>5.1} {:>5.1} {:>5.1}",
                day.date.format("%Y%j"),
                day.rsds,
                day.tasmax,
                day.tasmin,
                day.pr
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

        let depth = soil.layers.iter().map(|layer| layer.depth).fold(0.0, f64::max);
        let mut content = format!("*SOILS: {} simulation\n\n", context.crop);
        let _ = writeln!(content, "*{:<10}  CROPSIM     -99   {depth:>5.0} -99", soil.id);
        content.push_str("@SITE        COUNTRY          LAT     LONG SCS FAMILY\n");
        let _ = writeln!(
            content,
            " {:<11} -99       {:>8.3} {:>8.3} -99",
            context.spec.location_id, context.location.lat, context.location.lon
        );
        content.push_str("@  SLB  SLCL  SLSI  SLOC  SBDM\n");

        for layer in soil.layers.iter() {
            let _ = writeln!(
                content,
                "{:>6.0} {:>5.1} {:>5.1} {:>5.2} {:>5.2}",
                layer.depth,
                layer.clay.unwrap_or(MISSING),
                layer.silt().unwrap_or(MISSING),
                layer.organic_carbon.unwrap_or(MISSING),
                layer.bulk_density.unwrap_or(MISSING)
            );
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

        let spec = context.spec;
        let (first, last) = context.period.years;
        let start = chrono::NaiveDate::from_ymd_opt(first, 1, 1)
            .ok_or_else(|| AdapterError::setup(Stage::Experiment, format!("invalid start year {first}")))?;

        let mut content = format!("*EXP.DETAILS: {}\n\n", spec.run_id);

        content.push_str("*FILES\n@N WEATHER         SOIL\n");
        let _ = writeln!(
            content,
            " 1 {:<15} {}\n",
            file_name(&inputs.weather)?,
            file_name(&inputs.soil)?
        );

        content.push_str("*CULTIVARS\n@C CR INGENO\n");
        let _ = writeln!(
            content,
            " 1 {} {}\n",
            crop_code(context.crop),
            context.settings.cultivar.as_deref().unwrap_or("-99")
        );

        content.push_str("*PLANTING DETAILS\n@P PDATE\n");
        let _ = writeln!(content, " 1 {}\n", spec.sowing_date.format("%Y%j"));

        content.push_str("*PARAMETERS\n@NAME                 VALUE\n");
        for (name, value) in context.settings.parameters.iter() {
            let _ = writeln!(content, " {name:<20} {}", render_value(value));
        }
        content.push('\n');

        content.push_str("*SIMULATION CONTROLS\n@N GENERAL     NYERS SDATE\n");
        let _ = writeln!(
            content,
            " 1 GE          {:>5} {}",
            last - first + 1,
            start.format("%Y%j")
        );

        context.write_input(Stage::Experiment, EXPERIMENT_FILE, content)
    }

    fn run_model(&self, context: &RunContext<'_>, experiment: &Path) -> Result<ModelRun, AdapterError> {
        process::run(context, &DEFAULT_ARGUMENTS, experiment)
    }

    fn parse_output(&self, context: &RunContext<'_>) -> Result<ParsedOutput, AdapterError> {
        output::standardize(
            &context.output_file(OUTPUT_FILE),
            TableFormat::Fixed,
            &context.variables,
        )
    }
}
