use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::debug;

use crate::OpsecError;

/// Binary launched when the configuration does not name one.
pub const DEFAULT_BINARY: &str = "/usr/bin/fw1-loggrabber";
/// LEA protocol configuration expected inside the configuration directory.
pub const LEA_CONF_FILENAME: &str = "lea.conf";
/// fw1-loggrabber behaviour configuration expected inside the configuration directory.
pub const LOGGRABBER_CONF_FILENAME: &str = "fw1-loggrabber.conf";
/// Environment variable carrying the private temporary directory.
pub const LOGGRABBER_TEMP_PATH: &str = "LOGGRABBER_TEMP_PATH";
/// Environment variable carrying the validated configuration directory.
pub const LOGGRABBER_CONFIG_PATH: &str = "LOGGRABBER_CONFIG_PATH";

const DEFAULT_BACKOFF_MS: u64 = 100;

/// Settings for one log grabber source.
///
/// ```toml
/// "loggrabber.config.path" = "/etc/fw1-loggrabber"
/// binary = "/usr/bin/fw1-loggrabber"
/// args = ["--online"]
/// backoff_ms = 250
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(alias = "loggrabber.config.path", default)]
    pub config_path: PathBuf,
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_binary() -> PathBuf {
    PathBuf::from(DEFAULT_BINARY)
}

fn default_backoff_ms() -> u64 {
    DEFAULT_BACKOFF_MS
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            binary: default_binary(),
            args: Vec::new(),
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

impl SourceConfig {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, OpsecError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, OpsecError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| OpsecError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// How long callers should wait after a poll that found no work.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Checks that the configuration directory exists and holds both required files.
    pub fn validate(&self) -> Result<ValidatedConfigDir, OpsecError> {
        if self.config_path.as_os_str().is_empty() {
            return Err(OpsecError::EmptyConfigPath);
        }
        debug!(path = ?self.config_path, "loggrabber.config.path found");

        if !self.config_path.is_dir() {
            return Err(OpsecError::MissingConfigDir {
                path: self.config_path.clone(),
            });
        }

        for name in [LEA_CONF_FILENAME, LOGGRABBER_CONF_FILENAME] {
            let file = self.config_path.join(name);
            if !file.is_file() {
                return Err(OpsecError::MissingConfigFile { path: file });
            }
            debug!(path = ?file, "required configuration file exists");
        }

        // The child may run with a different working directory.
        let path = fs::canonicalize(&self.config_path).map_err(|_| OpsecError::MissingConfigDir {
            path: self.config_path.clone(),
        })?;
        Ok(ValidatedConfigDir { path })
    }
}

/// An absolute configuration directory known to contain `lea.conf` and `fw1-loggrabber.conf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedConfigDir {
    path: PathBuf,
}

impl ValidatedConfigDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}
