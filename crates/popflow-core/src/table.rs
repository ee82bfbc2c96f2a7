use std::path::PathBuf;

use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::Serialize;

use crate::error::SchemaError;

pub const YEAR: &str = "year";
pub const COUNTRY: &str = "country";
pub const POPULATION: &str = "population";
pub const POPULATION_60_PLUS: &str = "population_60_plus";
pub const POPULATION_60_PLUS_PERCENT: &str = "population_60_plus_percent";

/// Handle to a dataset written to scratch storage by the extract stage.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Snapshot {
    pub source_url: String,
    pub retrieved_at: DateTime<Utc>,
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl Snapshot {
    /// Wraps a file that already sits in scratch storage, e.g. one fetched by an
    /// earlier `extract` invocation.
    pub fn from_existing(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let metadata = std::fs::metadata(&path)?;
        let retrieved_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Self {
            source_url: format!("file://{}", path.display()),
            retrieved_at,
            path,
            size_bytes: metadata.len(),
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PopulationRecord {
    pub year: i32,
    pub country: String,
    pub population: i64,
    pub population_60_plus: i64,
    pub population_60_plus_percent: Option<f64>,
}

impl PopulationRecord {
    /// Builds a record with the derived percentage, or `None` when the total is
    /// not positive.
    pub fn new(year: i32, country: impl Into<String>, population: i64, population_60_plus: i64) -> Self {
        Self {
            year,
            country: country.into(),
            population,
            population_60_plus,
            population_60_plus_percent: sixty_plus_percent(population, population_60_plus),
        }
    }
}

pub fn sixty_plus_percent(population: i64, population_60_plus: i64) -> Option<f64> {
    if population > 0 {
        Some(population_60_plus as f64 / population as f64 * 100.0)
    } else {
        None
    }
}

/// Output of the transform stage: a frame holding exactly the canonical
/// destination columns, in destination order.
#[derive(Debug, Clone)]
pub struct PopulationTable {
    df: DataFrame,
}

impl PopulationTable {
    pub(crate) fn from_frame(df: DataFrame) -> Self {
        Self { df }
    }

    pub fn from_records(records: &[PopulationRecord]) -> Result<Self, SchemaError> {
        let years: Vec<i32> = records.iter().map(|r| r.year).collect();
        let countries: Vec<&str> = records.iter().map(|r| r.country.as_str()).collect();
        let populations: Vec<i64> = records.iter().map(|r| r.population).collect();
        let sixty_plus: Vec<i64> = records.iter().map(|r| r.population_60_plus).collect();
        let percents: Vec<Option<f64>> = records
            .iter()
            .map(|r| r.population_60_plus_percent)
            .collect();

        let df = DataFrame::new(vec![
            Series::new(YEAR.into(), years).into(),
            Series::new(COUNTRY.into(), countries).into(),
            Series::new(POPULATION.into(), populations).into(),
            Series::new(POPULATION_60_PLUS.into(), sixty_plus).into(),
            Series::new(POPULATION_60_PLUS_PERCENT.into(), percents).into(),
        ])?;
        Ok(Self { df })
    }

    pub fn frame(&self) -> &DataFrame {
        &self.df
    }

    pub fn height(&self) -> usize {
        self.df.height()
    }

    pub fn is_empty(&self) -> bool {
        self.df.height() == 0
    }

    pub fn records(&self) -> Result<Vec<PopulationRecord>, SchemaError> {
        let year = self.df.column(YEAR)?.i32()?;
        let country = self.df.column(COUNTRY)?.str()?;
        let population = self.df.column(POPULATION)?.i64()?;
        let sixty_plus = self.df.column(POPULATION_60_PLUS)?.i64()?;
        let percent = self.df.column(POPULATION_60_PLUS_PERCENT)?.f64()?;

        let mut records = Vec::with_capacity(self.df.height());
        for row in 0..self.df.height() {
            records.push(PopulationRecord {
                year: year.get(row).ok_or(SchemaError::NullValue { row, column: YEAR })?,
                country: country
                    .get(row)
                    .ok_or(SchemaError::NullValue { row, column: COUNTRY })?
                    .to_string(),
                population: population
                    .get(row)
                    .ok_or(SchemaError::NullValue { row, column: POPULATION })?,
                population_60_plus: sixty_plus.get(row).ok_or(SchemaError::NullValue {
                    row,
                    column: POPULATION_60_PLUS,
                })?,
                population_60_plus_percent: percent.get(row),
            });
        }
        Ok(records)
    }
}
