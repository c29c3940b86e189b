//! Harness configuration.
//!
//! Values come from built-in defaults, then `.pg-test-cluster.toml` in the
//! working directory, then `PGTEST_*` environment variables.

use std::{env, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Optional configuration file read from the working directory.
pub const CONFIG_FILE: &str = ".pg-test-cluster.toml";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "PGTEST_";

/// Configuration could not be assembled.
#[derive(Debug, Error)]
#[error("invalid harness configuration: {0}")]
pub struct ConfigError(Box<figment::Error>);

/// Where clusters live and how long to wait for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory under which cluster data directories are created.
    pub cluster_root: PathBuf,
    /// Seconds a starting server may take to accept connections.
    pub start_timeout_secs: u64,
    /// Seconds a client connection attempt may take.
    pub connect_timeout_secs: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            cluster_root: env::temp_dir(),
            start_timeout_secs: 10,
            connect_timeout_secs: 5,
        }
    }
}

impl HarnessConfig {
    /// The layered configuration sources.
    #[must_use]
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Loads configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a source holds a malformed value.
    pub fn load() -> Result<Self, ConfigError> {
        Self::figment()
            .extract()
            .map_err(|e| ConfigError(Box::new(e)))
    }

    /// Start timeout as a [`Duration`].
    #[must_use]
    pub const fn start_timeout(&self) -> Duration { Duration::from_secs(self.start_timeout_secs) }

    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
