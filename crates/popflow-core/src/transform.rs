use std::collections::HashMap;
use std::path::Path;

use polars::prelude::*;
use tracing::{info, warn};

use crate::config::ZeroPopulationPolicy;
use crate::error::{ArithmeticError, SchemaError, TransformError};
use crate::table::{
    sixty_plus_percent, PopulationTable, Snapshot, COUNTRY, POPULATION, POPULATION_60_PLUS,
    POPULATION_60_PLUS_PERCENT, YEAR,
};

const SOURCE_TOTAL_POPULATION: &str = "total_population";

/// Columns the snapshot must carry once its header has been normalized.
pub const REQUIRED_COLUMNS: [&str; 4] =
    [YEAR, COUNTRY, SOURCE_TOTAL_POPULATION, POPULATION_60_PLUS];

/// Canonical column form: surrounding whitespace dropped, lower-cased, and each
/// remaining whitespace character replaced by `_`.
pub fn normalize_column_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn transform_snapshot(
    snapshot: &Snapshot,
    policy: ZeroPopulationPolicy,
) -> Result<PopulationTable, TransformError> {
    let df = read_snapshot(&snapshot.path)?;
    let table = transform_frame(df, policy)?;
    info!(
        path = %snapshot.path.display(),
        rows = table.height(),
        "Transformation completed"
    );
    Ok(table)
}

fn read_snapshot(path: &Path) -> Result<DataFrame, SchemaError> {
    CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .and_then(|reader| reader.finish())
        .map_err(|source| SchemaError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Normalizes, validates and derives the percentage column for an already
/// loaded frame.
pub fn transform_frame(
    mut df: DataFrame,
    policy: ZeroPopulationPolicy,
) -> Result<PopulationTable, TransformError> {
    normalize_columns(&mut df)?;
    require_columns(&df)?;
    for column in [YEAR, SOURCE_TOTAL_POPULATION, POPULATION_60_PLUS] {
        reject_fractional(&df, column)?;
    }

    let typed = df
        .lazy()
        .select([
            col(YEAR).cast(DataType::Int32).alias(YEAR),
            col(COUNTRY)
                .cast(DataType::String)
                .str()
                .strip_chars(lit(NULL))
                .alias(COUNTRY),
            col(SOURCE_TOTAL_POPULATION)
                .cast(DataType::Int64)
                .alias(POPULATION),
            col(POPULATION_60_PLUS)
                .cast(DataType::Int64)
                .alias(POPULATION_60_PLUS),
        ])
        .collect()
        .map_err(SchemaError::from)?;

    derive_percent(typed, policy)
}

fn normalize_columns(df: &mut DataFrame) -> Result<(), SchemaError> {
    let original: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();

    let mut seen: HashMap<String, &str> = HashMap::with_capacity(original.len());
    let mut normalized = Vec::with_capacity(original.len());
    for name in &original {
        let canonical = normalize_column_name(name);
        if let Some(first) = seen.insert(canonical.clone(), name.as_str()) {
            return Err(SchemaError::DuplicateColumn {
                first: first.to_string(),
                second: name.clone(),
                normalized: canonical,
            });
        }
        normalized.push(canonical);
    }

    df.set_column_names(normalized.iter().map(String::as_str))?;
    Ok(())
}

fn require_columns(df: &DataFrame) -> Result<(), SchemaError> {
    let found: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|required| !found.iter().any(|name| name == *required))
        .map(|required| required.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::MissingColumns { missing, found })
    }
}

/// Integer casts truncate floats, so a float column must already hold whole
/// numbers.
fn reject_fractional(df: &DataFrame, column: &'static str) -> Result<(), SchemaError> {
    let values = df.column(column)?;
    if !values.dtype().is_float() {
        return Ok(());
    }
    let values = values.cast(&DataType::Float64)?;
    for (row, value) in values.f64()?.into_iter().enumerate() {
        if let Some(value) = value.filter(|v| v.fract() != 0.0) {
            return Err(SchemaError::FractionalValue { row, column, value });
        }
    }
    Ok(())
}

fn derive_percent(
    mut df: DataFrame,
    policy: ZeroPopulationPolicy,
) -> Result<PopulationTable, TransformError> {
    let len = df.height();
    let year = df.column(YEAR).and_then(|c| c.i32()).map_err(SchemaError::from)?;
    let country = df.column(COUNTRY).and_then(|c| c.str()).map_err(SchemaError::from)?;
    let population = df.column(POPULATION).and_then(|c| c.i64()).map_err(SchemaError::from)?;
    let sixty_plus = df
        .column(POPULATION_60_PLUS)
        .and_then(|c| c.i64())
        .map_err(SchemaError::from)?;

    let mut percent: Vec<Option<f64>> = Vec::with_capacity(len);
    let mut keep: Vec<bool> = Vec::with_capacity(len);
    let mut skipped = 0usize;

    for row in 0..len {
        let row_year = year.get(row).ok_or(SchemaError::NullValue { row, column: YEAR })?;
        let row_country = country
            .get(row)
            .ok_or(SchemaError::NullValue { row, column: COUNTRY })?;
        let total = population.get(row).ok_or(SchemaError::NullValue {
            row,
            column: SOURCE_TOTAL_POPULATION,
        })?;
        let older = sixty_plus.get(row).ok_or(SchemaError::NullValue {
            row,
            column: POPULATION_60_PLUS,
        })?;

        match sixty_plus_percent(total, older) {
            Some(value) => {
                percent.push(Some(value));
                keep.push(true);
            }
            None => match policy {
                ZeroPopulationPolicy::Fail => {
                    return Err(ArithmeticError::NonPositivePopulation {
                        row,
                        year: row_year,
                        country: row_country.to_string(),
                        population: total,
                    }
                    .into());
                }
                ZeroPopulationPolicy::Null => {
                    percent.push(None);
                    keep.push(true);
                }
                ZeroPopulationPolicy::Skip => {
                    warn!(
                        row,
                        year = row_year,
                        country = row_country,
                        population = total,
                        "Skipping row without a usable total_population"
                    );
                    percent.push(None);
                    keep.push(false);
                    skipped += 1;
                }
            },
        }
    }

    df.hstack_mut(&[Series::new(POPULATION_60_PLUS_PERCENT.into(), percent).into()])
        .map_err(SchemaError::from)?;

    if skipped > 0 {
        let mask = BooleanChunked::from_slice("keep".into(), &keep);
        df = df.filter(&mask).map_err(SchemaError::from)?;
    }

    Ok(PopulationTable::from_frame(df))
}
