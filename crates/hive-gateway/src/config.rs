//! Controller configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file is a
//! valid configuration:
//!
//! ```toml
//! state_dir = "/var/lib/hive"
//! connect_timeout_secs = 10
//! request_timeout_secs = 60
//! job_timeout_secs = 240
//!
//! [supervisor]
//! enabled = true
//! max_attempts = 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::supervisor::ReconnectConfig;

/// Default timeout for opening a session and the capability handshake.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default timeout for a forwarded request.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default timeout for waiting on a delegated job.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 240;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// Path of the file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("invalid TOML: {0}")]
    Parse(String),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Background reconnection settings.
///
/// Disabled by default: a failed compute stays failed until something calls
/// `connect` again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Whether the supervisor runs at all.
    pub enabled: bool,
    /// How often failed computes are scanned.
    pub check_interval_secs: u64,
    /// Delay before the first retry of a compute.
    pub initial_delay_secs: u64,
    /// Upper bound on the delay between retries.
    pub max_delay_secs: u64,
    /// Multiplier applied to the delay after each failed retry.
    pub backoff_multiplier: f64,
    /// Retries per compute before giving up (`None` = forever).
    pub max_attempts: Option<u32>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_secs: 5,
            initial_delay_secs: 1,
            max_delay_secs: 60,
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl SupervisorConfig {
    /// Scan interval.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Backoff settings derived from this configuration.
    #[must_use]
    pub const fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
            backoff_multiplier: self.backoff_multiplier,
            max_attempts: self.max_attempts,
        }
    }
}

/// Configuration of a [`Controller`](crate::Controller).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Directory holding `computes.json`. Records are kept in memory only
    /// when unset.
    pub state_dir: Option<PathBuf>,
    /// Timeout for opening a session and the capability handshake.
    pub connect_timeout_secs: u64,
    /// Timeout for a forwarded request.
    pub request_timeout_secs: u64,
    /// Timeout for the long-running step of a delegated job.
    pub job_timeout_secs: u64,
    /// Required `major.minor` version of compute nodes, if any.
    pub expected_version: Option<String>,
    /// Background reconnection.
    pub supervisor: SupervisorConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            expected_version: None,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a timeout is zero or the backoff is malformed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("connect_timeout_secs must be > 0".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be > 0".to_string()));
        }
        if self.job_timeout_secs == 0 {
            return Err(ConfigError::Invalid("job_timeout_secs must be > 0".to_string()));
        }
        if let Some(version) = &self.expected_version {
            if hive_proto::parse_major_minor(version).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "expected_version '{version}' is not a version"
                )));
            }
        }

        let supervisor = &self.supervisor;
        if supervisor.check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.check_interval_secs must be > 0".to_string(),
            ));
        }
        if supervisor.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "supervisor.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if supervisor.max_delay_secs < supervisor.initial_delay_secs {
            return Err(ConfigError::Invalid(
                "supervisor.max_delay_secs must be >= initial_delay_secs".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the state directory.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the forwarded request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the delegated job timeout.
    #[must_use]
    pub const fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_secs = timeout.as_secs();
        self
    }

    /// Require compute nodes to report this `major.minor` version.
    #[must_use]
    pub fn with_expected_version(mut self, version: impl Into<String>) -> Self {
        self.expected_version = Some(version.into());
        self
    }

    /// Set the supervisor configuration.
    #[must_use]
    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Job timeout as a [`Duration`].
    #[must_use]
    pub const fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}
