use ndarray::{Array1, Array2, ArrayView1};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

use crate::config::ColumnConfig;

/// Column index of centered release age inside `OutcomeData::covariates`.
pub const RELEASE_AGE_COLUMN: usize = 0;
/// Column index of the centered dACC measurement inside `OutcomeData::covariates`.
pub const DACC_COLUMN: usize = 1;

/// Errors surfaced while reading or validating the subject table.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Error from the underlying Polars library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The required column '{0}' was not found in the input file.")]
    ColumnNotFound(String),
    #[error(
        "Column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the column '{0}'.")]
    MissingValues(String),
    #[error("Column '{column}' contains the invalid value {value} at row {row}: {reason}")]
    InvalidValue {
        column: String,
        row: usize,
        value: f64,
        reason: &'static str,
    },
    #[error("Column '{column_name}' has {found} rows but {expected} were expected.")]
    LengthMismatch {
        column_name: String,
        expected: usize,
        found: usize,
    },
    #[error("The input table contains no subjects.")]
    Empty,
    #[error("Neither the violent nor the nonviolent outcome columns are present.")]
    NoOutcomes,
    #[error("The {0} outcome columns were not loaded from the input table.")]
    OutcomeUnavailable(OutcomeKind),
}

/// Which rearrest outcome an analysis is run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Violent,
    Nonviolent,
}

impl OutcomeKind {
    pub const ALL: [OutcomeKind; 2] = [OutcomeKind::Violent, OutcomeKind::Nonviolent];

    pub fn label(self) -> &'static str {
        match self {
            Self::Violent => "violent",
            Self::Nonviolent => "nonviolent",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Violent => "violent crimes",
            Self::Nonviolent => "nonviolent crimes",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
struct OutcomeColumnsData {
    time: Array1<f64>,
    event: Array1<bool>,
}

/// One row per subject, holding predictors shared by both outcomes and the
/// outcome-specific follow-up columns that were present in the input.
#[derive(Debug, Clone)]
pub struct SubjectTable {
    release_age: Array1<f64>,
    dacc: Array1<f64>,
    dacc_group: Array1<u8>,
    violent: Option<OutcomeColumnsData>,
    nonviolent: Option<OutcomeColumnsData>,
}

impl SubjectTable {
    /// Builds a table from in-memory columns, validating every value.
    ///
    /// `dacc_group` is derived from a median split of `dacc` when `None`.
    pub fn from_columns(
        release_age: Vec<f64>,
        dacc: Vec<f64>,
        dacc_group: Option<Vec<u8>>,
        violent: Option<(Vec<f64>, Vec<bool>)>,
        nonviolent: Option<(Vec<f64>, Vec<bool>)>,
    ) -> Result<Self, DataError> {
        let n = release_age.len();
        if n == 0 {
            return Err(DataError::Empty);
        }
        check_length("dacc", n, dacc.len())?;
        check_finite("release_age", &release_age)?;
        check_finite("dacc", &dacc)?;

        let dacc_group = match dacc_group {
            Some(groups) => {
                check_length("dacc_group", n, groups.len())?;
                for (row, &g) in groups.iter().enumerate() {
                    if g > 1 {
                        return Err(DataError::InvalidValue {
                            column: "dacc_group".to_string(),
                            row,
                            value: g as f64,
                            reason: "group must be 0 or 1",
                        });
                    }
                }
                Array1::from_vec(groups)
            }
            None => median_split(ArrayView1::from(&dacc)),
        };

        let violent = violent
            .map(|(time, event)| build_outcome("time_violent", n, time, event))
            .transpose()?;
        let nonviolent = nonviolent
            .map(|(time, event)| build_outcome("time_nonviolent", n, time, event))
            .transpose()?;
        if violent.is_none() && nonviolent.is_none() {
            return Err(DataError::NoOutcomes);
        }

        Ok(Self {
            release_age: Array1::from_vec(release_age),
            dacc: Array1::from_vec(dacc),
            dacc_group,
            violent,
            nonviolent,
        })
    }

    pub fn num_subjects(&self) -> usize {
        self.release_age.len()
    }

    pub fn has_outcome(&self, kind: OutcomeKind) -> bool {
        self.outcome_columns(kind).is_some()
    }

    fn outcome_columns(&self, kind: OutcomeKind) -> Option<&OutcomeColumnsData> {
        match kind {
            OutcomeKind::Violent => self.violent.as_ref(),
            OutcomeKind::Nonviolent => self.nonviolent.as_ref(),
        }
    }

    /// Returns an owned, immutable view of the table for a single outcome.
    pub fn outcome(&self, kind: OutcomeKind) -> Result<OutcomeData, DataError> {
        let columns = self
            .outcome_columns(kind)
            .ok_or(DataError::OutcomeUnavailable(kind))?;
        let n = self.num_subjects();
        let mut covariates = Array2::<f64>::zeros((n, 2));
        covariates
            .column_mut(RELEASE_AGE_COLUMN)
            .assign(&self.release_age);
        covariates.column_mut(DACC_COLUMN).assign(&self.dacc);
        Ok(OutcomeData {
            kind,
            time: columns.time.clone(),
            event: columns.event.clone(),
            covariates,
            dacc_group: self.dacc_group.clone(),
        })
    }
}

/// Survival response and predictors for one outcome.
#[derive(Debug, Clone)]
pub struct OutcomeData {
    pub kind: OutcomeKind,
    pub time: Array1<f64>,
    pub event: Array1<bool>,
    /// `n × 2` matrix: centered release age, centered dACC.
    pub covariates: Array2<f64>,
    pub dacc_group: Array1<u8>,
}

impl OutcomeData {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn num_events(&self) -> usize {
        self.event.iter().filter(|&&e| e).count()
    }

    pub fn max_time(&self) -> f64 {
        self.time.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Rows selected by `indices`, in order. Repeated indices produce repeated rows.
    pub fn subset(&self, indices: &[usize]) -> OutcomeData {
        let p = self.covariates.ncols();
        let mut covariates = Array2::<f64>::zeros((indices.len(), p));
        for (row, &idx) in indices.iter().enumerate() {
            covariates.row_mut(row).assign(&self.covariates.row(idx));
        }
        OutcomeData {
            kind: self.kind,
            time: indices.iter().map(|&i| self.time[i]).collect(),
            event: indices.iter().map(|&i| self.event[i]).collect(),
            covariates,
            dacc_group: indices.iter().map(|&i| self.dacc_group[i]).collect(),
        }
    }

    /// Distinct event times, ascending.
    pub fn event_times(&self) -> Vec<f64> {
        let mut times: Vec<f64> = self
            .time
            .iter()
            .zip(self.event.iter())
            .filter(|&(_, &e)| e)
            .map(|(&t, _)| t)
            .collect();
        times.sort_by(f64::total_cmp);
        times.dedup();
        times
    }
}

/// Loads the subject table from a delimited file. Files ending in `.csv` are
/// read as comma-separated, everything else as tab-separated.
pub fn load_subject_table(path: &Path, columns: &ColumnConfig) -> Result<SubjectTable, DataError> {
    let df = read_tabular(path)?;
    let name_map = build_case_insensitive_map(
        df.get_column_names()
            .into_iter()
            .map(|name| name.as_str().to_string()),
    );

    let release_age = extract_f64_column(&df, &name_map, &columns.release_age)?;
    let dacc = extract_f64_column(&df, &name_map, &columns.dacc)?;
    let dacc_group = if name_map.contains_key(&columns.dacc_group.to_ascii_lowercase()) {
        let groups = extract_u8_column(&df, &name_map, &columns.dacc_group)?;
        Some(groups.to_vec())
    } else {
        log::info!(
            "Column '{}' not present; deriving the dACC median split",
            columns.dacc_group
        );
        None
    };

    let violent = read_outcome_pair(&df, &name_map, &columns.violent.time, &columns.violent.event)?;
    let nonviolent = read_outcome_pair(
        &df,
        &name_map,
        &columns.nonviolent.time,
        &columns.nonviolent.event,
    )?;

    SubjectTable::from_columns(
        release_age.to_vec(),
        dacc.to_vec(),
        dacc_group,
        violent,
        nonviolent,
    )
}

/// Both columns of an outcome must be present, or neither.
fn read_outcome_pair(
    df: &DataFrame,
    map: &HashMap<String, String>,
    time_column: &str,
    event_column: &str,
) -> Result<Option<(Vec<f64>, Vec<bool>)>, DataError> {
    let has_time = map.contains_key(&time_column.to_ascii_lowercase());
    let has_event = map.contains_key(&event_column.to_ascii_lowercase());
    match (has_time, has_event) {
        (false, false) => Ok(None),
        (true, false) => Err(DataError::ColumnNotFound(event_column.to_string())),
        (false, true) => Err(DataError::ColumnNotFound(time_column.to_string())),
        (true, true) => {
            let time = extract_f64_column(df, map, time_column)?;
            let event = extract_u8_column(df, map, event_column)?;
            let mut flags = Vec::with_capacity(event.len());
            for (row, &value) in event.iter().enumerate() {
                match value {
                    0 => flags.push(false),
                    1 => flags.push(true),
                    other => {
                        return Err(DataError::InvalidValue {
                            column: event_column.to_string(),
                            row,
                            value: other as f64,
                            reason: "event indicator must be 0 or 1",
                        });
                    }
                }
            }
            Ok(Some((time.to_vec(), flags)))
        }
    }
}

fn build_outcome(
    time_name: &str,
    n: usize,
    time: Vec<f64>,
    event: Vec<bool>,
) -> Result<OutcomeColumnsData, DataError> {
    check_length(time_name, n, time.len())?;
    check_length("event", n, event.len())?;
    for (row, &t) in time.iter().enumerate() {
        if !t.is_finite() || t <= 0.0 {
            return Err(DataError::InvalidValue {
                column: time_name.to_string(),
                row,
                value: t,
                reason: "follow-up time must be finite and positive",
            });
        }
    }
    Ok(OutcomeColumnsData {
        time: Array1::from_vec(time),
        event: Array1::from_vec(event),
    })
}

fn check_length(column: &str, expected: usize, found: usize) -> Result<(), DataError> {
    if expected != found {
        return Err(DataError::LengthMismatch {
            column_name: column.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

fn check_finite(column: &str, values: &[f64]) -> Result<(), DataError> {
    for (row, &value) in values.iter().enumerate() {
        if !value.is_finite() {
            return Err(DataError::InvalidValue {
                column: column.to_string(),
                row,
                value,
                reason: "value must be finite",
            });
        }
    }
    Ok(())
}

/// Group 1 holds subjects strictly above the sample median.
pub fn median_split(values: ArrayView1<'_, f64>) -> Array1<u8> {
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    if n == 0 {
        return Array1::zeros(0);
    }
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    };
    values.mapv(|v| u8::from(v > median))
}

fn read_tabular(path: &Path) -> Result<DataFrame, DataError> {
    let separator = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("csv") => b',',
        _ => b'\t',
    };
    let file = File::open(path)?;
    CsvReadOptions::default()
        .with_has_header(true)
        .map_parse_options(|options| options.with_separator(separator))
        .into_reader_with_file_handle(file)
        .finish()
        .map_err(DataError::from)
}

fn build_case_insensitive_map<I, S>(names: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut map = HashMap::new();
    for name in names {
        let original = name.as_ref().to_string();
        map.insert(original.to_ascii_lowercase(), original);
    }
    map
}

fn extract_f64_column(
    df: &DataFrame,
    map: &HashMap<String, String>,
    key: &str,
) -> Result<Array1<f64>, DataError> {
    let actual = map
        .get(&key.to_ascii_lowercase())
        .ok_or_else(|| DataError::ColumnNotFound(key.to_string()))?;
    let series = df
        .column(actual)
        .map_err(|_| DataError::ColumnNotFound(actual.clone()))?;
    let dtype = series.dtype().clone();
    let series = if dtype != DataType::Float64 {
        series
            .cast(&DataType::Float64)
            .map_err(|_| DataError::ColumnWrongType {
                column_name: actual.clone(),
                expected_type: "float",
                found_type: dtype.to_string(),
            })?
    } else {
        series.clone()
    };
    let values = series.f64().map_err(|_| DataError::ColumnWrongType {
        column_name: actual.clone(),
        expected_type: "float",
        found_type: dtype.to_string(),
    })?;
    if values.null_count() > 0 {
        return Err(DataError::MissingValues(actual.clone()));
    }
    Ok(Array1::from_iter(values.into_no_null_iter()))
}

fn extract_u8_column(
    df: &DataFrame,
    map: &HashMap<String, String>,
    key: &str,
) -> Result<Array1<u8>, DataError> {
    let actual = map
        .get(&key.to_ascii_lowercase())
        .ok_or_else(|| DataError::ColumnNotFound(key.to_string()))?;
    let series = df
        .column(actual)
        .map_err(|_| DataError::ColumnNotFound(actual.clone()))?;
    let dtype = series.dtype().clone();
    let wrong_type = || DataError::ColumnWrongType {
        column_name: actual.clone(),
        expected_type: "integer",
        found_type: dtype.to_string(),
    };
    // Read as Float64: a direct integer cast would truncate fractional codes.
    let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    let values = casted.f64().map_err(|_| wrong_type())?;
    if values.null_count() > 0 {
        return Err(DataError::MissingValues(actual.clone()));
    }
    let mut result = Array1::<u8>::zeros(values.len());
    for (idx, value) in values.into_no_null_iter().enumerate() {
        if !value.is_finite() || value.fract() != 0.0 || value < 0.0 || value > f64::from(u8::MAX) {
            return Err(DataError::InvalidValue {
                column: actual.clone(),
                row: idx,
                value,
                reason: "expected a small non-negative integer",
            });
        }
        result[idx] = value as u8;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{Builder, NamedTempFile};

    const SAMPLE: &str = "id\trelease_age\tdacc\tdacc_group\ttime_violent\tevent_violent\ttime_nonviolent\tevent_nonviolent\n\
1\t-3.5\t0.20\t1\t12.0\t1\t5.0\t1\n\
2\t1.5\t-0.40\t0\t30.5\t0\t30.5\t0\n\
3\t4.0\t0.10\t1\t8.0\t1\t8.0\t1\n\
4\t-2.0\t-0.10\t0\t44.0\t0\t20.0\t1\n";

    fn write_table(contents: &str, suffix: &str) -> NamedTempFile {
        let file = Builder::new().suffix(suffix).tempfile().expect("tempfile");
        fs::write(file.path(), contents).expect("write table");
        file
    }

    #[test]
    fn loader_reads_both_outcomes() {
        let file = write_table(SAMPLE, ".tsv");
        let table = load_subject_table(file.path(), &ColumnConfig::default()).expect("load table");
        assert_eq!(table.num_subjects(), 4);
        assert!(table.has_outcome(OutcomeKind::Violent));
        assert!(table.has_outcome(OutcomeKind::Nonviolent));

        let violent = table.outcome(OutcomeKind::Violent).expect("violent outcome");
        assert_eq!(violent.num_events(), 2);
        assert_eq!(violent.covariates[[2, RELEASE_AGE_COLUMN]], 4.0);
        assert_eq!(violent.covariates[[1, DACC_COLUMN]], -0.40);

        let nonviolent = table.outcome(OutcomeKind::Nonviolent).expect("nonviolent outcome");
        assert_eq!(nonviolent.num_events(), 3);
        assert_eq!(nonviolent.time[0], 5.0);
    }

    #[test]
    fn loader_reads_comma_separated_files() {
        let csv = SAMPLE.replace('\t', ",");
        let file = write_table(&csv, ".csv");
        let table = load_subject_table(file.path(), &ColumnConfig::default()).expect("load csv");
        assert_eq!(table.num_subjects(), 4);
    }

    #[test]
    fn missing_predictor_is_fatal() {
        let without_dacc = SAMPLE.replace("\tdacc\t", "\tother\t");
        let file = write_table(&without_dacc, ".tsv");
        match load_subject_table(file.path(), &ColumnConfig::default()) {
            Err(DataError::ColumnNotFound(name)) => assert_eq!(name, "dacc"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn half_present_outcome_is_fatal() {
        let without_event = SAMPLE.replace("event_nonviolent", "unrelated");
        let file = write_table(&without_event, ".tsv");
        match load_subject_table(file.path(), &ColumnConfig::default()) {
            Err(DataError::ColumnNotFound(name)) => assert_eq!(name, "event_nonviolent"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn invalid_event_code_is_rejected() {
        let bad = SAMPLE.replacen("12.0\t1", "12.0\t2", 1);
        let file = write_table(&bad, ".tsv");
        let err = load_subject_table(file.path(), &ColumnConfig::default()).expect_err("bad event");
        assert!(matches!(err, DataError::InvalidValue { row: 0, .. }));
    }

    #[test]
    fn fractional_event_code_is_rejected() {
        let bad = SAMPLE.replacen("30.5\t0\t30.5", "30.5\t0.5\t30.5", 1);
        let file = write_table(&bad, ".tsv");
        match load_subject_table(file.path(), &ColumnConfig::default()) {
            Err(DataError::InvalidValue { column, row, value, .. }) => {
                assert_eq!(column, "event_violent");
                assert_eq!(row, 1);
                assert_eq!(value, 0.5);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn fractional_group_code_is_rejected() {
        let bad = SAMPLE.replacen("0.10\t1\t8.0", "0.10\t1.9\t8.0", 1);
        let file = write_table(&bad, ".tsv");
        let err = load_subject_table(file.path(), &ColumnConfig::default()).expect_err("bad group");
        assert!(matches!(err, DataError::InvalidValue { row: 2, .. }));
    }

    #[test]
    fn median_split_is_derived_when_group_column_absent() {
        let table = SubjectTable::from_columns(
            vec![0.0, 1.0, 2.0, 3.0],
            vec![0.4, -0.2, 0.1, -0.5],
            None,
            Some((vec![1.0, 2.0, 3.0, 4.0], vec![true, false, true, false])),
            None,
        )
        .expect("table");
        let data = table.outcome(OutcomeKind::Violent).expect("violent");
        assert_eq!(data.dacc_group.to_vec(), vec![1, 0, 1, 0]);
        assert!(matches!(
            table.outcome(OutcomeKind::Nonviolent),
            Err(DataError::OutcomeUnavailable(OutcomeKind::Nonviolent))
        ));
    }

    #[test]
    fn non_positive_time_is_rejected() {
        let err = SubjectTable::from_columns(
            vec![0.0, 1.0],
            vec![0.0, 1.0],
            None,
            Some((vec![0.0, 2.0], vec![true, false])),
            None,
        )
        .expect_err("zero time");
        assert!(matches!(err, DataError::InvalidValue { row: 0, .. }));
    }

    #[test]
    fn subset_repeats_rows() {
        let table = SubjectTable::from_columns(
            vec![0.0, 1.0, 2.0],
            vec![0.5, 0.6, 0.7],
            None,
            Some((vec![1.0, 2.0, 3.0], vec![true, false, true])),
            None,
        )
        .expect("table");
        let data = table.outcome(OutcomeKind::Violent).expect("violent");
        let boot = data.subset(&[2, 2, 0]);
        assert_eq!(boot.time.to_vec(), vec![3.0, 3.0, 1.0]);
        assert_eq!(boot.covariates[[1, DACC_COLUMN]], 0.7);
        assert_eq!(boot.num_events(), 3);
        assert_eq!(data.event_times(), vec![1.0, 3.0]);
    }
}
