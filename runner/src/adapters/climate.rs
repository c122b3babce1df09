use chrono::{Datelike, NaiveDate};
use itertools::Itertools;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

const COLUMNS: [&str; 5] = ["date", "tasmax", "tasmin", "pr", "rsds"];

#[derive(Error, Debug)]
pub enum ClimateError {
    #[error("Failed to read climate series {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Climate series lacks the '{0}' column")]
    MissingColumn(&'static str),
    #[error("Climate series line {line}: {message}")]
    Malformed { line: usize, message: String },
}

/// One day of the bias-corrected climate series
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DailyWeather {
    pub date: NaiveDate,
    // degC
    pub tasmax: f64,
    pub tasmin: f64,
    // mm/day
    pub pr: f64,
    // MJ/m2/day
    pub rsds: f64,
}

impl DailyWeather {
    pub fn mean_temperature(&self) -> f64 {
        (self.tasmax + self.tasmin) / 2.0
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClimateSeries {
    days: Vec<DailyWeather>,
}

impl ClimateSeries {
    pub fn read(path: &Path) -> Result<Self, ClimateError> {
        let raw = fs::read_to_string(path).map_err(|source| ClimateError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&raw)
    }

    /// parse a CSV series with a `date,tasmax,tasmin,pr,rsds` header, extra columns are ignored
    pub fn parse(raw: &str) -> Result<Self, ClimateError> {
        let mut lines = raw
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());

        let header = match lines.next() {
            Some((_, header)) => header.split(',').map(str::trim).collect_vec(),
            None => return Ok(Self::default()),
        };

        let mut positions = [0usize; 5];
        for (slot, column) in positions.iter_mut().zip(COLUMNS) {
            *slot = header
                .iter()
                .position(|name| name.eq_ignore_ascii_case(column))
                .ok_or(ClimateError::MissingColumn(column))?;
        }

        let mut days = Vec::new();
        for (number, line) in lines {
            let fields = line.split(',').map(str::trim).collect_vec();
            let field = |index: usize| {
                fields
                    .get(positions[index])
                    .copied()
                    .ok_or_else(|| ClimateError::Malformed {
                        line: number + 1,
                        message: format!("missing value for {}", COLUMNS[index]),
                    })
            };
            let number_at = |index: usize| {
                field(index)?
                    .parse::<f64>()
                    .map_err(|error| ClimateError::Malformed {
                        line: number + 1,
                        message: format!("{}: {error}", COLUMNS[index]),
                    })
            };

            let date = NaiveDate::parse_from_str(field(0)?, "%Y-%m-%d").map_err(|error| {
                ClimateError::Malformed {
                    line: number + 1,
                    message: format!("date: {error}"),
                }
            })?;

            days.push(DailyWeather {
                date,
                tasmax: number_at(1)?,
                tasmin: number_at(2)?,
                pr: number_at(3)?,
                rsds: number_at(4)?,
            });
        }

        days.sort_by_key(|day| day.date);

        Ok(Self { days })
    }

    /// keep the days of the inclusive year range
    pub fn within_years(self, (first, last): (i32, i32)) -> Self {
        Self {
            days: self
                .days
                .into_iter()
                .filter(|day| (first..=last).contains(&day.date.year()))
                .collect(),
        }
    }

    pub fn days(&self) -> &[DailyWeather] {
        &self.days
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// long-term mean temperature and amplitude of the monthly means
    pub fn tav_amp(&self) -> (f64, f64) {
        if self.days.is_empty() {
            return (-99.0, -99.0);
        }

        let tav = self.days.iter().map(DailyWeather::mean_temperature).sum::<f64>()
            / self.days.len() as f64;

        let monthly = self
            .days
            .iter()
            .into_group_map_by(|day| day.date.month())
            .into_values()
            .map(|days| days.iter().map(|day| day.mean_temperature()).sum::<f64>() / days.len() as f64)
            .collect_vec();
        let amp = match monthly.iter().copied().minmax() {
            itertools::MinMaxResult::MinMax(min, max) => max - min,
            _ => 0.0,
        };

        (tav, amp)
    }
}
