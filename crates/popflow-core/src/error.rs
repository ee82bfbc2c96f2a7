// crates/popflow-core/src/error.rs

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::RunState;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} responded with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("content from {url} is not tabular: {reason}")]
    NotTabular { url: String, reason: String },

    #[error("failed to write snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("failed to read snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: polars::error::PolarsError,
    },

    #[error("missing required columns {missing:?} (found {found:?})")]
    MissingColumns {
        missing: Vec<String>,
        found: Vec<String>,
    },

    #[error("columns {first:?} and {second:?} both normalize to {normalized:?}")]
    DuplicateColumn {
        first: String,
        second: String,
        normalized: String,
    },

    #[error("row {row}: column {column} is empty or not a valid value")]
    NullValue { row: usize, column: &'static str },

    #[error("row {row}: column {column} holds {value}, expected a whole number")]
    FractionalValue {
        row: usize,
        column: &'static str,
        value: f64,
    },

    #[error("Polars operation failed: {0}")]
    Polars(#[from] polars::error::PolarsError),
}

#[derive(Error, Debug)]
pub enum ArithmeticError {
    #[error("row {row} ({country}, {year}): total_population is {population}, percentage is undefined")]
    NonPositivePopulation {
        row: usize,
        year: i32,
        country: String,
        population: i64,
    },
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Arithmetic(#[from] ArithmeticError),
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to connect to destination database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("failed to ensure destination schema: {0}")]
    Schema(#[source] sqlx::Error),

    #[error("failed to begin transaction: {0}")]
    Begin(#[source] sqlx::Error),

    #[error("row {row} ({country}, {year}) was rejected: {source}")]
    Row {
        row: usize,
        year: i32,
        country: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to commit transaction: {0}")]
    Commit(#[source] sqlx::Error),

    #[error("table could not be read for loading: {0}")]
    Table(#[from] SchemaError),
}

impl LoadError {
    /// Index of the row that caused the failure, when a single row is to blame.
    pub fn failed_row(&self) -> Option<usize> {
        match self {
            LoadError::Row { row, .. } => Some(*row),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("DATABASE_URL (or POPFLOW_DATABASE_URL) must be set")]
    MissingDatabaseUrl,

    #[error("invalid config value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("extract failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("load failed: {0}")]
    Load(#[from] LoadError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("illegal run state transition {from:?} -> {to:?}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("stage task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<SchemaError> for PipelineError {
    fn from(err: SchemaError) -> Self {
        PipelineError::Transform(err.into())
    }
}

impl From<ArithmeticError> for PipelineError {
    fn from(err: ArithmeticError) -> Self {
        PipelineError::Transform(err.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
