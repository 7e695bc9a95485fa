//! Configuration manager for the waitlist.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AppState;
use crate::ratelimiter::{DEFAULT_SWEEP_PROBABILITY, RateLimitConfig};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_NAME: &str = "PyMCU Alpha";
const DEFAULT_URL: &str = "http://localhost:4321";
const VERSION: &str = env!("CARGO_PKG_VERSION");

const MINUTE: u64 = 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Public site URL, used to build links sent by email.
    pub url: String,
    /// Enables production-only response headers.
    pub production: bool,
    /// Origins allowed by CORS.
    pub allowed_origins: Vec<String>,
    #[serde(skip_deserializing)]
    pub version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to PostgreSQL configuration.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to automatic mail sending.
    #[serde(skip_serializing)]
    pub mail: Option<Mail>,
    /// Limits applied per endpoint.
    #[serde(skip_serializing)]
    pub rate_limits: RateLimits,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_owned(),
            url: DEFAULT_URL.to_owned(),
            production: false,
            allowed_origins: vec![
                "https://pymcu.com".into(),
                "https://www.pymcu.com".into(),
            ],
            version: VERSION.to_owned(),
            path: PathBuf::default(),
            postgres: None,
            mail: None,
            rate_limits: RateLimits::default(),
        }
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// Mail queue configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mail {
    /// Hostname:(?port) for RabbitMQ instance.
    pub address: String,
    /// RabbitMQ default vhost.
    pub vhost: Option<String>,
    /// RabbitMQ username to access queue.
    pub username: String,
    /// RabbitMQ password to access queue.
    pub password: String,
    /// Max channel connections.
    pub pool: Option<u16>,
    /// Queue name to send mailing events.
    pub queue: String,
}

/// Rate limits for each endpoint class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    /// `POST /api/waitlist`.
    pub waitlist: RateLimitConfig,
    /// `GET /api/confirm`.
    pub confirm: RateLimitConfig,
    /// `GET|POST /api/unsubscribe`.
    pub unsubscribe: RateLimitConfig,
    /// Chance to sweep expired entries on each check.
    pub sweep_probability: f64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            waitlist: RateLimitConfig::new(15 * MINUTE, 3),
            confirm: RateLimitConfig::new(5 * MINUTE, 10),
            unsubscribe: RateLimitConfig::new(5 * MINUTE, 5),
            sweep_probability: DEFAULT_SWEEP_PROBABILITY,
        }
    }
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`). Trailing slash is removed.
    fn normalize_url(&self, url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.as_str().trim_end_matches('/').to_owned())
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Result<Arc<Self>, url::ParseError> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        match File::open(file_path) {
            Ok(file) => match serde_yaml::from_reader(file) {
                Ok(config) => Ok(Arc::new(self.finalize(config)?)),
                Err(err) => Ok(Arc::new(self.error(err))),
            },
            Err(err) => Ok(Arc::new(self.error(err))),
        }
    }

    /// Parse a configuration from a YAML string.
    pub fn from_yaml(self, yaml: &str) -> Result<Self, ConfigError> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(self.finalize(config)?)
    }

    fn finalize(&self, mut config: Configuration) -> Result<Self, url::ParseError> {
        // set app version.
        config.version = VERSION.to_owned();
        config.path = self.path.clone();

        // normalize URLs.
        config.url = self.normalize_url(&config.url)?;
        config.allowed_origins = config
            .allowed_origins
            .iter()
            .map(|origin| self.normalize_url(origin))
            .collect::<Result<_, _>>()?;

        Ok(config)
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not found or invalid");
        Self::default()
    }
}

/// Errors that may occur while parsing configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("URL is invalid: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to deserialize configuration: {0}")]
    Deserialize(#[from] serde_yaml::Error),
}
