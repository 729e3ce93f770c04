//! Registry configuration.
//!
//! Defaults can be overridden from the environment with [`Config::from_env`]:
//!
//! * `SWITCHY_SQLITE_DIR`: base directory databases are resolved against
//! * `SWITCHY_SQLITE_WORKERS`: size of the worker pool
//! * `SWITCHY_SQLITE_BUSY_TIMEOUT_MS`: `SQLite` busy timeout per connection

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;

pub const DIR_ENV: &str = "SWITCHY_SQLITE_DIR";
pub const WORKERS_ENV: &str = "SWITCHY_SQLITE_WORKERS";
pub const BUSY_TIMEOUT_ENV: &str = "SWITCHY_SQLITE_BUSY_TIMEOUT_MS";

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {name}: {source}")]
    ParseInt {
        name: &'static str,
        value: String,
        source: std::num::ParseIntError,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
    pub workers: usize,
    /// `None` disables the busy handler entirely.
    pub busy_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("switchy_sqlite"),
            workers: std::thread::available_parallelism()
                .map_or(DEFAULT_WORKERS, |n| n.get().min(DEFAULT_WORKERS)),
            busy_timeout: Some(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS)),
        }
    }
}

impl Config {
    /// Builds a config from the defaults, overridden by any of the
    /// `SWITCHY_SQLITE_*` environment variables that are set.
    ///
    /// # Errors
    ///
    /// * If a numeric environment variable is not a valid number
    /// * If `SWITCHY_SQLITE_WORKERS` is zero
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var(DIR_ENV) {
            config.base_dir = PathBuf::from(dir);
        }

        if let Some(workers) = option_env_parse::<usize>(WORKERS_ENV)? {
            if workers == 0 {
                return Err(ConfigError::Zero(WORKERS_ENV));
            }
            config.workers = workers;
        }

        if let Some(millis) = option_env_parse::<u64>(BUSY_TIMEOUT_ENV)? {
            config.busy_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }

        log::debug!("from_env: {config:?}");

        Ok(config)
    }

    #[must_use]
    pub fn with_base_dir(mut self, base_dir: impl AsRef<Path>) -> Self {
        self.base_dir = base_dir.as_ref().to_path_buf();
        self
    }

    /// Sets the worker pool size. Zero is clamped to one.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub const fn with_busy_timeout(mut self, busy_timeout: Option<Duration>) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Resolves `base_dir/[location/]file`.
    #[must_use]
    pub fn resolve(&self, file: &str, location: Option<&str>) -> PathBuf {
        let dir = location.map_or_else(|| self.base_dir.clone(), |x| self.base_dir.join(x));
        dir.join(file)
    }
}

fn option_env_parse<T: std::str::FromStr<Err = std::num::ParseIntError>>(
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|source| ConfigError::ParseInt {
                name,
                value,
                source,
            }),
        Err(_) => Ok(None),
    }
}
