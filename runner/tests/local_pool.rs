//! Runs the `cropsim` binary end to end with a pool of worker processes

use cropsim_runner::{
    config::Config,
    ledger::{Ledger, LedgerSettings, RunRecord, RunStatus},
};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    process::{Command, Output},
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
    soil:
      id: SOIL01
      layers:
        - {depth: 30, clay: 20, sand: 40, organic_carbon: 1.2, bulk_density: 1.35}
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
crop_models:
  A: {adapter: dssat, executable: bin/dssat_ok, cultivar: IB0001, timeout: 20}
  B: {adapter: apsim, executable: bin/MODEL_B, cultivar: IB0002, timeout: 20}
simulation:
  crop: maize
  sowing_dates: [2021-05-01]
variable_mapping:
  yield: {A: HWAM, B: Yield}
execution:
  run_timeout: 30
  lock_timeout: 5
parallel:
  num_workers: 2
"#;

const CLIMATE: &str = "date,tasmax,tasmin,pr,rsds
2021-05-01,20.0,8.0,0.0,18.0
2021-05-02,22.0,10.0,1.5,19.0
2022-05-01,19.0,7.0,2.0,17.0
";

const SCRIPTS: [(&str, &str); 3] = [
    (
        "dssat_ok",
        "printf '*SUMMARY\\n@RUNNO TRNO HWAM CWAM\\n 1 1 5123 9000\\n' > Summary.OUT",
    ),
    (
        "apsim_fail_once",
        "if [ ! -f attempted ]; then\n  touch attempted\n  exit 3\nfi\nprintf 'Date,Yield\\n2021-09-01,4321.5\\n' > simulation.Report.csv",
    ),
    // the working directory sits next to the ledger
    ("corrupt_ledger", "printf 'not a database' > ../simulation_status.db\nexit 3"),
];

struct Batch {
    root: TempDir,
}

impl Batch {
    fn new(model_b: &str) -> Self {
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

        fs::write(
            root.path().join("config.yaml"),
            CONFIG.replace("MODEL_B", model_b),
        )
        .unwrap();

        Self { root }
    }

    fn config_path(&self) -> PathBuf {
        self.root.path().join("config.yaml")
    }

    fn cropsim(&self, arguments: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_cropsim"))
            .arg("--config")
            .arg(self.config_path())
            .args(arguments)
            .current_dir(self.root.path())
            .env_remove("RUST_LOG")
            .output()
            .unwrap()
    }

    fn records(&self) -> Vec<RunRecord> {
        let config = Config::load(&self.config_path()).unwrap();
        let ledger = Ledger::open(&config.ledger_path(), LedgerSettings::from_config(&config)).unwrap();

        ledger.snapshot().unwrap().records().to_vec()
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn two_workers_complete_the_batch_over_two_runs() {
    let batch = Batch::new("apsim_fail_once");

    let first = batch.cropsim(&["run"]);
    assert!(first.status.success(), "{}", stderr(&first));
    assert!(
        stdout(&first).contains("2 completed, 2 error, 0 exhausted, 0 skipped"),
        "{}",
        stdout(&first)
    );

    let second = batch.cropsim(&["run"]);
    assert!(second.status.success(), "{}", stderr(&second));
    assert!(
        stdout(&second).contains("2 completed, 0 error, 0 exhausted, 0 skipped"),
        "{}",
        stdout(&second)
    );

    let records = batch.records();
    assert_eq!(records.len(), 4);
    for record in records.iter() {
        assert_eq!(record.status, RunStatus::Completed, "{}", record.run_id());
        assert_eq!(record.last_error, None);

        let expected = if record.spec.crop_model == "B" { 2 } else { 1 };
        assert_eq!(record.attempts, expected, "{}", record.run_id());
    }

    let status = batch.cropsim(&["status"]);
    assert!(status.status.success());
    let status_out = stdout(&status);
    let completed = status_out
        .lines()
        .find(|line| line.starts_with("COMPLETED"))
        .map(|line| line.split_whitespace().collect::<Vec<_>>());
    assert_eq!(completed, Some(vec!["COMPLETED", "4"]));
}

#[test]
fn a_failing_worker_fails_the_batch() {
    let batch = Batch::new("corrupt_ledger");

    let output = batch.cropsim(&["run"]);
    assert!(!output.status.success(), "{}", stdout(&output));
    assert!(stderr(&output).contains("Worker failed"), "{}", stderr(&output));
}
