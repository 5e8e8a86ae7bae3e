use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use directories::ProjectDirs;
use mw_auth::{AuthConfig, HttpTimeouts, RetryPolicy};
use mw_session::SessionConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.mockwise.dev/";

/// Contents of `config.toml`. Every table and field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api: ApiSettings,
    pub retry: RetrySettings,
    pub session: SessionConfig,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub user_agent: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        let timeouts = HttpTimeouts::default();
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: None,
            connect_timeout_secs: timeouts.connect.as_secs(),
            request_timeout_secs: timeouts.request.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_millis: u64,
    pub backoff_multiplier: u32,
    pub max_delay_millis: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_millis: policy.base_delay.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            max_delay_millis: policy.max_delay.as_millis() as u64,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_millis),
            backoff_multiplier: settings.backoff_multiplier,
            max_delay: Duration::from_millis(settings.max_delay_millis),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory of the durable credential file. Defaults to the platform
    /// data directory.
    pub dir: Option<PathBuf>,
    /// How often to look for credential changes made by other processes.
    /// Zero disables the watcher.
    pub watch_interval_millis: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            dir: None,
            watch_interval_millis: 1000,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from the default location when `None`.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    #[instrument(level = "debug")]
    pub async fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::default_path()?, false),
        };

        if tokio::fs::metadata(&path).await.is_err() {
            if required {
                error!("Settings file does not exist: {}", path.display());
                return Err(SettingsError::FileNotFound { path });
            }
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .context("Failed to read settings file")
            .map_err(|e| {
                error!("Failed to read settings file {}: {}", path.display(), e);
                SettingsError::ReadFailed {
                    path: path.clone(),
                    source: e,
                }
            })?;

        let settings: Settings = toml::from_str(&content)
            .context("Failed to parse settings file")
            .map_err(|e| {
                error!("Failed to parse settings file {}: {}", path.display(), e);
                SettingsError::ParsingFailed {
                    path: path.clone(),
                    source: e,
                }
            })?;

        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn default_path() -> Result<PathBuf, SettingsError> {
        let proj_dirs = ProjectDirs::from("dev", "mockwise", "mockwise")
            .ok_or(SettingsError::ProjectDirectoriesUnavailable)?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn auth_config(&self) -> Result<AuthConfig, SettingsError> {
        let base_url =
            Url::parse(&self.api.base_url).map_err(|source| SettingsError::InvalidBaseUrl {
                url: self.api.base_url.clone(),
                source,
            })?;

        let mut config = AuthConfig::new(base_url).with_retry(RetryPolicy::from(&self.retry));
        config.http_timeouts = HttpTimeouts {
            connect: Duration::from_secs(self.api.connect_timeout_secs),
            request: Duration::from_secs(self.api.request_timeout_secs),
        };
        if let Some(agent) = &self.api.user_agent {
            config.user_agent = Some(agent.clone());
        }
        Ok(config)
    }

    pub fn watch_interval(&self) -> Option<Duration> {
        match self.storage.watch_interval_millis {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(
        "Project directories are unavailable - this usually indicates an unsupported OS or missing home directory"
    )]
    ProjectDirectoriesUnavailable,

    #[error("Settings file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    #[error("Failed to read settings file '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to parse settings file '{path}': {source}")]
    ParsingFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid API base URL '{url}': {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}
