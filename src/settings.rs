use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

use crate::{
    consts::{
        DEFAULT_CACHE_LIMIT, DEFAULT_MESSAGES_PER_APPLICATION, DEFAULT_REQUEST_TIMEOUT_SECS,
        DEFAULT_WATCHDOG_INTERVAL_SECS, MAX_API_PAGE_LIMIT, MAX_CACHE_LIMIT, SETTINGS_DIR_NAME,
        SETTINGS_ENV,
    },
    error::ConfigError,
};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub base_url: String,
    pub token: Option<String>,
    pub watchdog_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub messages_per_application: usize,
    pub cache_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            watchdog_interval_secs: DEFAULT_WATCHDOG_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            messages_per_application: DEFAULT_MESSAGES_PER_APPLICATION,
            cache_limit: DEFAULT_CACHE_LIMIT,
        }
    }
}

/// Validated connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub base_url: String,
    pub token: String,
}

impl Settings {
    /// Reads the settings file (defaults when it does not exist) and applies
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut settings = read_settings(path)?;
        settings.apply_env(|key| env::var(key).ok());
        Ok(settings)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("GOTIFY_URL").filter(|v| !v.trim().is_empty()) {
            self.base_url = url;
        }
        if let Some(token) = lookup("GOTIFY_TOKEN").filter(|v| !v.trim().is_empty()) {
            self.token = Some(token);
        }
        if let Some(raw) = lookup("GOTIFY_WATCHDOG_INTERVAL") {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.watchdog_interval_secs = secs,
                Err(error) => debug!("ignoring GOTIFY_WATCHDOG_INTERVAL={raw:?}: {error}"),
            }
        }
    }

    pub fn server(&self) -> Result<ServerInfo, ConfigError> {
        let base_url = normalize_base_url(&self.base_url)?;
        let token = self
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken)?
            .to_string();
        Ok(ServerInfo { base_url, token })
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn messages_per_application(&self) -> usize {
        self.messages_per_application.clamp(1, MAX_API_PAGE_LIMIT * 10)
    }

    pub fn cache_limit(&self) -> usize {
        self.cache_limit.clamp(1, MAX_CACHE_LIMIT)
    }
}

pub fn default_settings_path() -> PathBuf {
    if let Some(path) = env::var_os(SETTINGS_ENV) {
        return PathBuf::from(path);
    }
    let config_dir = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    config_dir.join(SETTINGS_DIR_NAME).join("settings.json")
}

pub fn read_settings(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        debug!("settings file {path:?} not found, using defaults");
        return Ok(Settings::default());
    }

    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str::<Settings>(&content)?)
}

pub fn normalize_base_url(input: &str) -> Result<String, ConfigError> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidUrl("Server URL is required".to_string()));
    }

    let url = reqwest::Url::parse(trimmed)
        .map_err(|error| ConfigError::InvalidUrl(error.to_string()))?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(ConfigError::InvalidUrl(
            "Server URL must start with http:// or https://".to_string(),
        ));
    }

    Ok(trimmed.to_string())
}

pub fn build_stream_ws_url(base_url: &str) -> Result<String, ConfigError> {
    let mut ws_url = reqwest::Url::parse(base_url)
        .map_err(|error| ConfigError::InvalidUrl(error.to_string()))?;

    let ws_scheme = match ws_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => {
            return Err(ConfigError::InvalidUrl(
                "Server URL must start with http:// or https://".to_string(),
            ))
        }
    };
    ws_url
        .set_scheme(ws_scheme)
        .map_err(|_| ConfigError::InvalidUrl(format!("Unable to convert URL scheme to {ws_scheme}")))?;

    let mut path = ws_url.path().trim_end_matches('/').to_string();
    path.push_str("/stream");
    ws_url.set_path(&path);
    Ok(ws_url.to_string())
}
