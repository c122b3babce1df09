use super::{AdapterError, ParsedOutput};
use itertools::Itertools;
use std::{collections::BTreeMap, fs, path::Path};
use tracing::debug;

/// Layout of a tabular model output file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableFormat {
    /// `@`-prefixed header line, whitespace separated columns, `*`/`!` comments
    Fixed,
    /// header in the first line, fields separated by the given character
    Delimited(char),
}

/// the last data row of a table, keyed by column name
pub fn last_row(raw: &str, format: TableFormat) -> Result<BTreeMap<String, String>, String> {
    let mut header: Option<Vec<&str>> = None;
    let mut row: Option<Vec<&str>> = None;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        match format {
            TableFormat::Fixed => {
                if line.starts_with('*') || line.starts_with('!') {
                    continue;
                }

                if let Some(columns) = line.strip_prefix('@') {
                    header = Some(columns.split_whitespace().collect());
                    row = None;
                } else if header.is_some() {
                    row = Some(line.split_whitespace().collect());
                }
            }
            TableFormat::Delimited(delimiter) => {
                let fields = line.split(delimiter).map(str::trim).collect_vec();
                if header.is_none() {
                    header = Some(fields);
                } else {
                    row = Some(fields);
                }
            }
        }
    }

    let header = header.ok_or_else(|| "no header line found".to_owned())?;
    let row = row.ok_or_else(|| "no data row found".to_owned())?;

    Ok(header
        .into_iter()
        .zip(row)
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .collect())
}

/// read `file` and translate the mapped raw variables into standardized ones
pub fn standardize(
    file: &Path,
    format: TableFormat,
    variables: &BTreeMap<String, String>,
) -> Result<ParsedOutput, AdapterError> {
    let raw = fs::read_to_string(file)
        .map_err(|error| AdapterError::parse(format!("failed to read {file:?}: {error}")))?;
    let row = last_row(&raw, format).map_err(|error| AdapterError::parse(format!("{file:?}: {error}")))?;

    let mut output = ParsedOutput::default();
    for (standard, name) in variables.iter() {
        let value = row.get(name).ok_or_else(|| {
            AdapterError::parse(format!("{file:?} has no variable {name} (mapped to {standard})"))
        })?;
        let value = value.parse::<f64>().map_err(|_| {
            AdapterError::parse(format!("{name} in {file:?} is not numeric: '{value}'"))
        })?;

        output.values.insert(standard.clone(), value);
        output.output_paths.insert(standard.clone(), file.to_path_buf());
    }

    debug!(file = ?file, variables = output.values.len(), "Standardized model output");

    Ok(output)
}
