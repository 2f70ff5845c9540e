//! Server configuration.
//!
//! The embedded `config/default.toml` is used unless `PARKING_FINDER_CONFIG`
//! names another file. `BIND_ADDR`, `PORT`, `MODEL_PATH`, and `DATABASE_URL`
//! then override the matching settings.

use std::path::PathBuf;
use std::time::Duration;

use parking_finder_parking_models::{DEFAULT_CANDIDATE_LIMIT, DEFAULT_RADIUS_METERS};
use parking_finder_pipeline::PipelineSettings;
use parking_finder_predict::time::{self, TimeError};
use parking_finder_source::SourceError;
use parking_finder_source::memory::MemorySourceConfig;
use parking_finder_source::open_data::OpenDataConfig;
use serde::Deserialize;

/// Embedded default configuration.
const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

/// Environment variable naming an alternative configuration file.
pub const CONFIG_PATH_VAR: &str = "PARKING_FINDER_CONFIG";

/// Errors from loading configuration or building what it describes.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the configuration file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid TOML for [`ServerConfig`].
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The configured timezone is unknown.
    #[error(transparent)]
    Time(#[from] TimeError),

    /// A configured source could not be built.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// The database could not be reached or migrated.
    #[error("Database error: {0}")]
    Database(#[from] parking_finder_database::DbError),

    /// The configuration is well-formed but unusable.
    #[error("Invalid configuration: {message}")]
    Invalid {
        /// Description of what went wrong.
        message: String,
    },
}

/// Complete server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerSection,
    /// Search parameters.
    #[serde(default)]
    pub search: SearchSection,
    /// Civil time settings.
    #[serde(default)]
    pub time: TimeSection,
    /// Classifier settings.
    pub model: ModelSection,
    /// Candidate and attribute source.
    pub source: SourceConfig,
    /// Live sensor source for the realtime endpoint.
    #[serde(default)]
    pub live: Option<SourceConfig>,
}

/// `[server]`
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Address to bind.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8080
}

/// `[search]`
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    /// Candidates per request.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Search radius in meters.
    #[serde(default = "default_radius")]
    pub radius_m: f64,
    /// Maximum age of a live reading in seconds.
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
    /// Live readings requested per realtime query.
    #[serde(default = "default_live_limit")]
    pub live_limit: usize,
    /// Per-call upstream timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            radius_m: default_radius(),
            freshness_secs: default_freshness_secs(),
            live_limit: default_live_limit(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

const fn default_limit() -> usize {
    DEFAULT_CANDIDATE_LIMIT
}

const fn default_radius() -> f64 {
    DEFAULT_RADIUS_METERS
}

const fn default_freshness_secs() -> u64 {
    60
}

const fn default_live_limit() -> usize {
    100
}

const fn default_timeout_secs() -> u64 {
    10
}

/// `[time]`
#[derive(Debug, Clone, Deserialize)]
pub struct TimeSection {
    /// IANA timezone name.
    #[serde(default = "default_zone")]
    pub zone: String,
}

impl Default for TimeSection {
    fn default() -> Self {
        Self {
            zone: default_zone(),
        }
    }
}

fn default_zone() -> String {
    "Australia/Melbourne".to_string()
}

/// `[model]`
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSection {
    /// Path to the JSON classifier artifact.
    pub path: PathBuf,
    /// Name reported in `model_info`.
    pub name: String,
    /// Accuracy estimate reported in `model_info`.
    #[serde(default)]
    pub accuracy_estimate: Option<f64>,
    /// Default decision threshold.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

const fn default_threshold() -> f64 {
    0.5
}

/// A data source, tagged by `type` in TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// City of Melbourne open data API.
    OpenData(OpenDataConfig),
    /// Local `GeoJSON` and JSON snapshot files.
    Memory(MemorySourceConfig),
    /// `PostGIS` database.
    Postgis {
        /// Connection URL; falls back to `DATABASE_URL`.
        #[serde(default)]
        database_url: Option<String>,
        /// Server-side statement timeout in seconds.
        #[serde(default = "default_statement_timeout_secs")]
        statement_timeout_secs: u64,
    },
}

const fn default_statement_timeout_secs() -> u64 {
    30
}

impl ServerConfig {
    /// Loads the configuration from `PARKING_FINDER_CONFIG` or the embedded
    /// default, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or the
    /// result fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        let text = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => {
                log::info!("Loading configuration from {path}");
                std::fs::read_to_string(path)?
            }
            Err(_) => DEFAULT_CONFIG.to_string(),
        };

        let mut config = Self::from_toml(&text)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parses a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Toml`] if the document is invalid.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Applies `BIND_ADDR`, `PORT`, `MODEL_PATH`, and `DATABASE_URL` as
    /// returned by `lookup`. Unparseable ports are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bind_addr) = lookup("BIND_ADDR") {
            self.server.bind_addr = bind_addr;
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(e) => log::warn!("Ignoring PORT={port}: {e}"),
            }
        }
        if let Some(path) = lookup("MODEL_PATH") {
            self.model.path = PathBuf::from(path);
        }
        if let Some(url) = lookup("DATABASE_URL") {
            for source in std::iter::once(&mut self.source).chain(self.live.as_mut()) {
                if let SourceConfig::Postgis { database_url, .. } = source {
                    *database_url = Some(url.clone());
                }
            }
        }
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        time::parse_zone(&self.time.zone)?;

        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };
        if !(0.0..=1.0).contains(&self.model.threshold) {
            return invalid("model.threshold must be within [0, 1]");
        }
        if !(self.search.radius_m.is_finite() && self.search.radius_m > 0.0) {
            return invalid("search.radius_m must be positive");
        }
        if self.search.limit == 0 {
            return invalid("search.limit must be at least 1");
        }
        if self.search.timeout_secs == 0 {
            return invalid("search.timeout_secs must be at least 1");
        }
        if matches!(self.live, Some(SourceConfig::Postgis { .. })) {
            return invalid("live source cannot be postgis");
        }
        Ok(())
    }

    /// Pipeline settings derived from `[search]` and `[time]`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Time`] if the timezone is unknown.
    pub fn pipeline_settings(&self) -> Result<PipelineSettings, ConfigError> {
        Ok(PipelineSettings {
            limit: self.search.limit,
            radius_m: self.search.radius_m,
            freshness: Duration::from_secs(self.search.freshness_secs),
            live_limit: self.search.live_limit,
            timeout: Duration::from_secs(self.search.timeout_secs),
            zone: time::parse_zone(&self.time.zone)?,
        })
    }
}
