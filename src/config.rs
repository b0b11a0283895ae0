use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from wakeguard.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct WakeguardConfig {
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ask the child to watch the host PID when no process option is given,
    /// so it dies with the host even if signal cleanup never runs.
    pub limit_lifetime: bool,
    /// Register with the termination registry while active.
    pub intercept_termination: bool,
    /// Default options as caffeinate argument tokens (e.g. ["-d", "-i"]),
    /// used when no option flags are given on the command line.
    pub default_opts: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Forward subprocess stdout/stderr through the logger.
    pub capture_output: bool,
    /// Default log filter when RUST_LOG is unset.
    pub filter: String,
}

// --- Default implementations ---

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            limit_lifetime: true,
            intercept_termination: true,
            default_opts: vec![],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            capture_output: true,
            filter: "info".to_string(),
        }
    }
}

/// Errors from loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    /// The file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid TOML for this configuration.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load configuration from a TOML file. A missing file yields defaults.
pub fn load(path: &Path) -> Result<WakeguardConfig, ConfigError> {
    if !path.exists() {
        return Ok(WakeguardConfig::default());
    }
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}
