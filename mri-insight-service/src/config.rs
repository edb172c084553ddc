use scan_flow::{Theme, WorkspaceLimits};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Service settings, read once at startup
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub analysis_url: String,
    pub analysis_timeout: Duration,
    pub max_batch_files: Option<usize>,
    pub max_scans_per_workspace: Option<usize>,
    pub max_upload_bytes: usize,
    pub default_theme: Theme,
    /// `None` keeps workspaces until they are deleted.
    pub workspace_idle_ttl: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            analysis_url: "http://localhost:8000/api/analyze".to_string(),
            analysis_timeout: Duration::from_secs(120),
            max_batch_files: Some(32),
            max_scans_per_workspace: None,
            max_upload_bytes: 100 * 1024 * 1024,
            default_theme: Theme::Light,
            workspace_idle_ttl: Some(Duration::from_secs(60 * 60)),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            port: parse_or(&lookup, "PORT", defaults.port)?,
            analysis_url: lookup("ANALYSIS_SERVICE_URL").unwrap_or(defaults.analysis_url),
            analysis_timeout: Duration::from_secs(parse_or(
                &lookup,
                "ANALYSIS_TIMEOUT_SECS",
                defaults.analysis_timeout.as_secs(),
            )?),
            max_batch_files: match lookup("MAX_BATCH_FILES") {
                Some(value) => Some(parse("MAX_BATCH_FILES", value)?),
                None => defaults.max_batch_files,
            },
            max_scans_per_workspace: match lookup("MAX_SCANS_PER_WORKSPACE") {
                Some(value) => Some(parse("MAX_SCANS_PER_WORKSPACE", value)?),
                None => defaults.max_scans_per_workspace,
            },
            max_upload_bytes: parse_or(&lookup, "MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            default_theme: parse_or(&lookup, "DEFAULT_THEME", defaults.default_theme)?,
            workspace_idle_ttl: match lookup("WORKSPACE_IDLE_TTL_SECS") {
                Some(value) => match parse("WORKSPACE_IDLE_TTL_SECS", value)? {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                None => defaults.workspace_idle_ttl,
            },
        })
    }

    pub fn workspace_limits(&self) -> WorkspaceLimits {
        WorkspaceLimits {
            max_batch_files: self.max_batch_files,
            max_scans: self.max_scans_per_workspace,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => parse(key, value),
        None => Ok(default),
    }
}
