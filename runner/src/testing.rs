//! Throwaway batch setups for the unit tests

use crate::{
    adapters::AdapterRegistry,
    catalog::{Catalog, RunFilter, RunSpec},
    config::Config,
};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

const CONFIG: &str = r#"
paths:
  simulation_setup_dir: setup
  climate_dir: climate
locations:
  loc1:
    lat: 48.52
    lon: 9.06
    elevation: 350
    soil:
      id: SOIL01
      layers:
        - {depth: 30, clay: 20, sand: 40, organic_carbon: 1.2, bulk_density: 1.35}
        - {depth: 60, clay: 25, sand: 35, organic_carbon: 0.6, bulk_density: 1.45}
  loc2:
    lat: 52.39
    lon: 13.06
    soil:
      id: SOIL02
      layers:
        - {depth: 40, clay: 10, sand: 70, organic_carbon: 0.9, bulk_density: 1.5}
climate:
  sources:
    cmip6:
      models:
        - gcm: MPI-ESM
          scenarios: [ssp245]
      periods:
        near: {years: [2021, 2022]}
        historical: {years: [1991, 1992], scenarios: [historical]}
crop_models:
  A: {adapter: dssat, executable: bin/dssat_ok, cultivar: IB0001, timeout: 20}
  B: {adapter: apsim, executable: bin/apsim_fail_once, cultivar: IB0002, timeout: 20}
adaptations:
  baseline: {}
  late_cultivar:
    overrides:
      A: {cultivar: IB0099, parameters: {fertilizer_n: 200}}
simulation:
  crop: maize
  sowing_dates: [2021-05-01]
  parameters: {fertilizer_n: 150}
variable_mapping:
  yield: {A: HWAM, B: Yield}
execution:
  run_timeout: 30
  lock_timeout: 5
parallel:
  num_workers: 2
"#;

const CLIMATE: &str = "date,tasmax,tasmin,pr,rsds
2020-12-31,3.0,-4.0,0.0,3.5
2021-05-01,20.0,8.0,0.0,18.0
2021-05-02,22.0,10.0,1.5,19.0
2021-06-01,28.0,14.0,4.0,24.0
2022-05-01,19.0,7.0,2.0,17.0
";

const SCRIPTS: [(&str, &str); 6] = [
    (
        "dssat_ok",
        "printf '*SUMMARY\\n@RUNNO TRNO HWAM CWAM\\n 1 1 5123 9000\\n' > Summary.OUT",
    ),
    ("apsim_ok", "printf 'Date,Yield\\n2021-09-01,4321.5\\n' > simulation.Report.csv"),
    (
        "apsim_fail_once",
        "if [ ! -f attempted ]; then\n  touch attempted\n  exit 3\nfi\nprintf 'Date,Yield\\n2021-09-01,4321.5\\n' > simulation.Report.csv",
    ),
    ("fail", "echo 'model crashed' >&2\nexit 3"),
    ("sleep", "sleep 30"),
    ("noisy", "echo \"to stdout $1\"\necho 'to stderr' >&2"),
];

pub struct Fixture {
    root: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bin");
        let climate = root.path().join("climate");
        fs::create_dir_all(&bin).unwrap();
        fs::create_dir_all(&climate).unwrap();

        for (name, body) in SCRIPTS {
            let path = bin.join(name);
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }

        for location in ["loc1", "loc2"] {
            fs::write(
                climate.join(format!("{location}_cmip6_MPI-ESM_ssp245_near.csv")),
                CLIMATE,
            )
            .unwrap();
        }

        fs::write(root.path().join("config.yaml"), CONFIG).unwrap();

        Self { root }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.root().join("config.yaml")
    }

    pub fn config(&self) -> Config {
        Config::load(&self.config_path()).unwrap()
    }

    pub fn setup_dir(&self) -> PathBuf {
        self.root().join("setup")
    }

    pub fn climate_dir(&self) -> PathBuf {
        self.root().join("climate")
    }

    pub fn script(&self, name: &str) -> PathBuf {
        self.root().join("bin").join(name)
    }

    /// baseline run of `crop_model` at loc1
    pub fn spec(&self, config: &Config, crop_model: &str) -> RunSpec {
        let registry = AdapterRegistry::load(config).unwrap();
        let catalog = Catalog::build(config, &registry, &RunFilter::default()).unwrap();

        catalog
            .specs()
            .iter()
            .find(|spec| {
                spec.crop_model == crop_model
                    && spec.adaptation == "baseline"
                    && spec.location_id == "loc1"
            })
            .cloned()
            .unwrap()
    }
}
