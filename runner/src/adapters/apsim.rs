use super::{
    output::{self, TableFormat},
    process, AdapterError, GeneratedInputs, ModelAdapter, ModelRun, ParsedOutput, RunContext,
};
use crate::ledger::Stage;
use chrono::{Datelike, NaiveDate};
use serde_json::json;
use std::{
    fmt::Write,
    path::{Path, PathBuf},
};

const WEATHER_FILE: &str = "weather.met";
const SOIL_FILE: &str = "soil.json";
const EXPERIMENT_FILE: &str = "simulation.apsimx";
const OUTPUT_FILE: &str = "simulation.Report.csv";
const DEFAULT_ARGUMENTS: [&str; 2] = ["{experiment}", "--csv"];

/// APSIM Next Generation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApsimAdapter;

impl ModelAdapter for ApsimAdapter {
    fn name(&self) -> &'static str {
        "apsim"
    }

    fn generate_weather(&self, context: &RunContext<'_>) -> Result<PathBuf, AdapterError> {
        let climate = context.climate()?;
        let (tav, amp) = climate.tav_amp();

        let mut content = String::from("[weather.met.weather]\n");
        let _ = writeln!(
            content,
            "!station = {} {} {} {}",
            context.spec.location_id,
            context.spec.climate_model(),
            context.spec.scenario,
            context.spec.period
        );
        let _ = writeln!(content, "latitude = {:.3} (DECIMAL DEGREES)", context.location.lat);
        let _ = writeln!(content, "longitude = {:.3} (DECIMAL DEGREES)", context.location.lon);
        let _ = writeln!(content, "tav = {tav:.2} (oC)");
        let _ = writeln!(content, "amp = {amp:.2} (oC)\n");
        content.push_str("year day radn maxt mint rain\n");
        content.push_str("() () (MJ/m^2) (oC) (oC) (mm)\n");

        for day in climate.days() {
            let _ = writeln!(
                content,
                "{} {} {:.1} {:.1} {:.1} {:.1}",
                day.date.year(),
                day.date.ordinal(),
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

        let mut top = 0.0;
        let layers = soil
            .layers
            .iter()
            .map(|layer| {
                // APSIM wants thickness in mm
                let thickness = (layer.depth - top) * 10.0;
                top = layer.depth;

                json!({
                    "Thickness": thickness,
                    "Clay": layer.clay,
                    "Sand": layer.sand,
                    "Silt": layer.silt(),
                    "Carbon": layer.organic_carbon,
                    "BD": layer.bulk_density,
                })
            })
            .collect::<Vec<_>>();

        let document = json!({
            "$type": "Models.Soils.Soil, Models",
            "Name": soil.id,
            "Latitude": context.location.lat,
            "Longitude": context.location.lon,
            "Layers": layers,
        });
        let content = serde_json::to_vec_pretty(&document)
            .map_err(|error| AdapterError::setup(Stage::Soil, error))?;

        context.write_input(Stage::Soil, SOIL_FILE, content)
    }

    fn generate_experiment(
        &self,
        context: &RunContext<'_>,
        inputs: &GeneratedInputs,
    ) -> Result<PathBuf, AdapterError> {
        let (first, last) = context.period.years;
        let (start, end) = match (
            NaiveDate::from_ymd_opt(first, 1, 1),
            NaiveDate::from_ymd_opt(last, 12, 31),
        ) {
            (Some(start), Some(end)) => (start, end),
            _ => {
                return Err(AdapterError::setup(
                    Stage::Experiment,
                    format!("invalid period {first}-{last}"),
                ))
            }
        };

        let parameters = serde_json::to_value(&context.settings.parameters)
            .map_err(|error| AdapterError::setup(Stage::Experiment, error))?;

        let document = json!({
            "$type": "Models.Core.Simulations, Models",
            "Name": context.spec.run_id,
            "Clock": {
                "Start": start.format("%Y-%m-%dT00:00:00").to_string(),
                "End": end.format("%Y-%m-%dT00:00:00").to_string(),
            },
            "Weather": inputs.weather.file_name().map(|name| name.to_string_lossy()),
            "Soil": inputs.soil.file_name().map(|name| name.to_string_lossy()),
            "Crop": context.crop,
            "Cultivar": context.settings.cultivar,
            "SowDate": context.spec.sowing_date.format("%d-%b").to_string(),
            "Parameters": parameters,
        });
        let content = serde_json::to_vec_pretty(&document)
            .map_err(|error| AdapterError::setup(Stage::Experiment, error))?;

        context.write_input(Stage::Experiment, EXPERIMENT_FILE, content)
    }

    fn run_model(&self, context: &RunContext<'_>, experiment: &Path) -> Result<ModelRun, AdapterError> {
        process::run(context, &DEFAULT_ARGUMENTS, experiment)
    }

    fn parse_output(&self, context: &RunContext<'_>) -> Result<ParsedOutput, AdapterError> {
        output::standardize(
            &context.output_file(OUTPUT_FILE),
            TableFormat::Delimited(','),
            &context.variables,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use std::fs;

    #[test]
    fn generates_json_inputs() {
        let fixture = Fixture::new();
        let config = fixture.config();
        let spec = fixture.spec(&config, "B");
        let dir = tempfile::tempdir().unwrap();
        let context = RunContext::new(&config, &spec, dir.path()).unwrap();

        let weather = ApsimAdapter.generate_weather(&context).unwrap();
        let soil = ApsimAdapter.generate_soil(&context).unwrap();
        let experiment = ApsimAdapter
            .generate_experiment(&context, &GeneratedInputs { weather: weather.clone(), soil: soil.clone() })
            .unwrap();

        let met = fs::read_to_string(weather).unwrap();
        assert!(met.starts_with("[weather.met.weather]"));
        assert!(met.contains("2021 121 "));

        let soil: serde_json::Value = serde_json::from_slice(&fs::read(soil).unwrap()).unwrap();
        assert_eq!(soil["Layers"][0]["Thickness"], json!(300.0));
        assert_eq!(soil["Layers"][1]["Thickness"], json!(300.0));

        let simulation: serde_json::Value =
            serde_json::from_slice(&fs::read(experiment).unwrap()).unwrap();
        assert_eq!(simulation["Weather"], json!("weather.met"));
        assert_eq!(simulation["Cultivar"], json!("IB0002"));
        assert_eq!(simulation["Parameters"]["fertilizer_n"], json!(150));
        assert_eq!(simulation["Clock"]["Start"], json!("2021-01-01T00:00:00"));
    }

    #[test]
    fn parses_report_csv() {
        let fixture = Fixture::new();
        let config = fixture.config();
        let spec = fixture.spec(&config, "B");
        let dir = tempfile::tempdir().unwrap();
        let context = RunContext::new(&config, &spec, dir.path()).unwrap();

        fs::write(
            dir.path().join(OUTPUT_FILE),
            "Date,Yield\n2021-09-30,4100.0\n2022-09-30,4321.5\n",
        )
        .unwrap();

        let parsed = ApsimAdapter.parse_output(&context).unwrap();
        assert_eq!(parsed.values.get("yield"), Some(&4321.5));
        assert_eq!(
            parsed.output_paths.get("yield"),
            Some(&dir.path().join(OUTPUT_FILE))
        );
    }
}
