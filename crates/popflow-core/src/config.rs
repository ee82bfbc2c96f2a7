use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_SOURCE_URL: &str = "https://data.un.org/_Docs/SYB/CSV/SYB67_1_202411_Population,%20Surface%20Area%20and%20Density.csv";
pub const DEFAULT_SCRATCH_PATH: &str = "/tmp/population_data.csv";
/// Upper bound on whole-run re-executions accepted from configuration.
pub const MAX_RETRIES: u32 = 10;

/// What the transform does with a row whose `total_population` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroPopulationPolicy {
    /// Abort the transform with an arithmetic error naming the row.
    #[default]
    Fail,
    /// Keep the row with a null percentage.
    Null,
    /// Drop the row and log a warning.
    Skip,
}

/// Run-level retry contract: a fixed number of whole-run re-executions with a
/// constant delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Total attempts including the first execution.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, Duration::from_secs(300))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub source_url: String,
    pub scratch_path: PathBuf,
    pub database_url: Option<String>,
    pub retries: u32,
    pub retry_delay_secs: u64,
    pub schedule_interval_secs: u64,
    pub zero_population: ZeroPopulationPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            scratch_path: PathBuf::from(DEFAULT_SCRATCH_PATH),
            database_url: None,
            retries: 1,
            retry_delay_secs: 300,
            schedule_interval_secs: 24 * 60 * 60,
            zero_population: ZeroPopulationPolicy::Fail,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the optional TOML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL").or_else(|| lookup("POPFLOW_DATABASE_URL")) {
            self.database_url = Some(url);
        }
        if let Some(url) = lookup("POPFLOW_SOURCE_URL") {
            self.source_url = url;
        }
        if let Some(path) = lookup("POPFLOW_SCRATCH_PATH") {
            self.scratch_path = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "source_url",
                message: "must not be empty".into(),
            });
        }
        if self.scratch_path.file_name().is_none() {
            return Err(ConfigError::Invalid {
                field: "scratch_path",
                message: format!("{} does not name a file", self.scratch_path.display()),
            });
        }
        if self.retries > MAX_RETRIES {
            return Err(ConfigError::Invalid {
                field: "retries",
                message: format!("{} exceeds the maximum of {MAX_RETRIES}", self.retries),
            });
        }
        if self.schedule_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "schedule_interval_secs",
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_secs(self.retry_delay_secs))
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs)
    }
}
