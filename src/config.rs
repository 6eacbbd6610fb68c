use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::SyncError;
use crate::model::priority::PriorityStatus;

pub const DEFAULT_BASE_URL: &str = "https://dev.azure.com";
pub const DEFAULT_STATE_FIELD: &str = "System.State";
pub const DEFAULT_API_VERSION: &str = "7.0";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
pub struct AppConfig {
    pub azure_devops: Option<AzureDevOpsConfig>,
    pub storage: Option<StorageConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AzureDevOpsConfig {
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub pat: String,
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub sync_enabled: bool,
    pub base_url: Option<String>,
    pub state_field: Option<String>,
    pub api_version: Option<String>,
    pub timeout_secs: Option<u64>,
    /// Remote state name -> local status, consulted before the default table.
    #[serde(default)]
    pub state_mapping: HashMap<String, PriorityStatus>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StorageConfig {
    pub data_dir: Option<String>,
}

/// Validated connection settings, built once per invocation and passed down.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub organization: String,
    pub project: String,
    pub pat: String,
    pub identity: String,
    pub sync_enabled: bool,
    pub base_url: String,
    pub state_field: String,
    pub api_version: String,
    pub timeout_secs: u64,
    pub state_mapping: HashMap<String, PriorityStatus>,
}

impl SyncConfig {
    /// Validates credentials and endpoints without looking at `sync_enabled`.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, SyncError> {
        let raw = config.azure_devops.as_ref().ok_or(SyncError::NotConfigured)?;

        for (name, value) in [
            ("organization", &raw.organization),
            ("project", &raw.project),
            ("pat", &raw.pat),
        ] {
            if value.trim().is_empty() {
                return Err(SyncError::InvalidConfig(format!("{name} must not be empty")));
            }
        }

        let timeout_secs = raw.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(SyncError::InvalidConfig("timeout_secs must be positive".into()));
        }

        Ok(Self {
            organization: raw.organization.trim().to_string(),
            project: raw.project.trim().to_string(),
            pat: raw.pat.trim().to_string(),
            identity: raw.identity.trim().to_string(),
            sync_enabled: raw.sync_enabled,
            base_url: raw
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            state_field: raw
                .state_field
                .clone()
                .unwrap_or_else(|| DEFAULT_STATE_FIELD.into()),
            api_version: raw
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.into()),
            timeout_secs,
            state_mapping: raw.state_mapping.clone(),
        })
    }

    /// Like [`SyncConfig::from_app_config`], but also requires sync to be switched on.
    pub fn enabled(config: &AppConfig) -> Result<Self, SyncError> {
        let cfg = Self::from_app_config(config)?;
        if !cfg.sync_enabled {
            return Err(SyncError::SyncDisabled);
        }
        Ok(cfg)
    }

    /// Name recorded as the actor on audit entries.
    pub fn actor(&self) -> &str {
        if self.identity.is_empty() {
            "prisync"
        } else {
            &self.identity
        }
    }
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("PRISYNC_CONFIG") {
        return PathBuf::from(path);
    }
    default_dir().join("config.toml")
}

fn default_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".prisync")
}

pub fn data_dir(config: &AppConfig) -> PathBuf {
    config
        .storage
        .as_ref()
        .and_then(|s| s.data_dir.as_ref())
        .map(PathBuf::from)
        .unwrap_or_else(default_dir)
}

pub fn parse_config(contents: &str) -> Result<AppConfig> {
    toml::from_str(contents).with_context(|| "Failed to parse config.toml")
}

pub fn load_config() -> Result<AppConfig> {
    let path = config_path();
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    parse_config(&contents)
}
