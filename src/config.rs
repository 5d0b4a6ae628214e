use crate::role::ComponentRole;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from profiler.toml.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct ProfilerConfig {
    pub schedule: ScheduleConfig,
    pub sampler: SamplerConfig,
    pub locator: LocatorConfig,
    pub storage: StorageConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub session_duration_secs: u64,
    pub sleep_secs: u64,
    pub retention_mins: u64,
}

/// External sampling tool invocation.
///
/// `{pid}`, `{output}` and `{duration}` in `args` are substituted per session.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplerConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Trace file extension, without the dot.
    pub extension: String,
}

/// Process enumeration command and matching.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocatorConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Overrides the role's built-in command-line signature.
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct StorageConfig {
    pub bucket: Option<String>,
    /// Custom endpoint for S3-compatible stores.
    pub endpoint: Option<String>,
    pub path_style: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct StatusConfig {
    pub file: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            session_duration_secs: 60,
            sleep_secs: 60,
            retention_mins: 15,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            command: "py-spy".to_string(),
            args: [
                "record",
                "--pid",
                "{pid}",
                "-o",
                "{output}",
                "--duration",
                "{duration}",
                "--format",
                "speedscope",
                "--idle",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            extension: "json".to_string(),
        }
    }
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            command: "ps".to_string(),
            args: vec!["-eww".to_string(), "-o".to_string(), "pid=,args=".to_string()],
            signature: None,
        }
    }
}

impl ScheduleConfig {
    pub fn session_duration(&self) -> Duration {
        Duration::from_secs(self.session_duration_secs)
    }

    pub fn sleep(&self) -> Duration {
        Duration::from_secs(self.sleep_secs)
    }

    /// Retention window. Saturates for values `validate` would reject.
    pub fn retention(&self) -> chrono::TimeDelta {
        self.try_retention().unwrap_or(chrono::TimeDelta::MAX)
    }

    fn try_retention(&self) -> Option<chrono::TimeDelta> {
        i64::try_from(self.retention_mins)
            .ok()
            .and_then(chrono::TimeDelta::try_minutes)
    }
}

/// Errors loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl ProfilerConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule.session_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "schedule.session_duration_secs must be positive".into(),
            ));
        }
        if self.schedule.try_retention().is_none() {
            return Err(ConfigError::Invalid(format!(
                "schedule.retention_mins {} is out of range",
                self.schedule.retention_mins
            )));
        }
        if self.sampler.command.trim().is_empty() {
            return Err(ConfigError::Invalid("sampler.command is empty".into()));
        }
        if self.locator.command.trim().is_empty() {
            return Err(ConfigError::Invalid("locator.command is empty".into()));
        }
        let ext = &self.sampler.extension;
        if ext.is_empty() || ext.contains(['.', '/', '_']) {
            return Err(ConfigError::Invalid(format!(
                "sampler.extension {ext:?} must be non-empty without '.', '/' or '_'"
            )));
        }
        Ok(())
    }
}

/// Startup identity: who to profile and where results go.
///
/// Read once at startup from CLI flags or their environment fallbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub component: ComponentRole,
    pub home: PathBuf,
    pub env_name: String,
}

/// Everything the daemon needs, resolved once and passed down by reference.
#[derive(Debug, Clone)]
pub struct Settings {
    pub identity: Identity,
    pub config: ProfilerConfig,
}

impl Settings {
    /// Bucket to upload to, if any.
    pub fn bucket(&self) -> Option<&str> {
        self.config.storage.bucket.as_deref()
    }
}
