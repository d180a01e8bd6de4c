//! Typed configuration.
//!
//! Process settings come from environment variables, loaded once at
//! startup; missing required vars fail fast. Sensitive values are wrapped in
//! `secrecy::SecretString` to prevent log leaks. Scheduling tunables live in
//! [`SchedulerConfig`], optionally read from a TOML file.

pub mod scheduler;

pub use scheduler::SchedulerConfig;

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::PathBuf;

#[derive(Debug)]
pub struct Config {
    /// Required for everything except `serve --memory`.
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Optional TOML file with scheduler tunables.
    pub scheduler_config: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables. The database URL is
    /// checked where it is needed, via [`Config::require_database_url`].
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var(DATABASE_URL_VAR).ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            scheduler_config: std::env::var("TASKMESH_CONFIG").ok().map(PathBuf::from),
        })
    }

    /// The database URL, failing if it was not configured.
    pub fn require_database_url(&self) -> Result<&SecretString> {
        self.database_url.as_ref().ok_or_else(|| missing_var(DATABASE_URL_VAR))
    }

    /// Scheduler tunables: the configured TOML file, or defaults.
    pub fn load_scheduler_config(&self) -> Result<SchedulerConfig> {
        match &self.scheduler_config {
            Some(path) => SchedulerConfig::load(path),
            None => Ok(SchedulerConfig::default()),
        }
    }
}

const DATABASE_URL_VAR: &str = "TASKMESH_DATABASE_URL";

fn missing_var(name: &str) -> Error {
    Error::Config(format!("required environment variable {name} is not set"))
}
