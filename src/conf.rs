//! The Serializable configuration data structures used for setup.
use std::{fs, io, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Which backend a watch service should run on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Native if the kernel allows it, polling otherwise.
    #[default]
    Auto,
    /// Native or fail.
    Native,
    /// Never touch the kernel facility, for flaky virtual filesystems and
    /// deterministic tests.
    Polling,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WatchConfig {
    #[serde(default)]
    pub backend: BackendChoice,

    /// How often a consumer loop should wake up to `scan()`.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_limit")]
    pub limit: usize,

    /// Default for paths added without an explicit missing policy.
    #[serde(default = "default_missing")]
    pub missing: bool,
}

impl WatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_backend(mut self, backend: BackendChoice) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_missing(mut self, missing: bool) -> Self {
        self.missing = missing;
        self
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::default(),
            timeout_ms: default_timeout_ms(),
            limit: default_limit(),
            missing: default_missing(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_cfg_ver")]
    pub version: u32,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unsupported config format for {0}, expected .toml")]
    Format(PathBuf),

    #[error(transparent)]
    Parse(#[from] toml::de::Error),
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => {}
            _ => return Err(ConfigError::Format(path.to_path_buf())),
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_cfg_ver(),
            log_level: default_log_level(),
            watch: WatchConfig::default(),
            paths: Vec::new(),
        }
    }
}

fn default_cfg_ver() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_limit() -> usize {
    1024
}

fn default_missing() -> bool {
    false
}
