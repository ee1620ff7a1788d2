use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Application {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Absolute image URL; `None` when the server has no image for the app.
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub id: i64,
    pub appid: i64,
    #[serde(default)]
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub priority: i64,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Version {
    pub version: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default, rename = "buildDate")]
    pub build_date: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Paging {
    #[serde(default)]
    pub size: usize,
    #[serde(default)]
    pub since: i64,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PagedMessages {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub paging: Paging,
}

/// Error body returned by the Gotify API.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub error: String,
    #[serde(rename = "errorCode")]
    pub error_code: u16,
    #[serde(default, rename = "errorDescription")]
    pub error_description: String,
}

impl ErrorDetail {
    pub fn new(error: impl Into<String>, error_code: u16, description: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_code,
            error_description: description.into(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.error_code == 401 || self.error == "Unauthorized"
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error_description.is_empty() {
            write!(f, "{} ({})", self.error, self.error_code)
        } else {
            write!(
                f,
                "{} ({}): {}",
                self.error, self.error_code, self.error_description
            )
        }
    }
}

/// Selects messages on the server. `appid: None` addresses every application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MessageFilter {
    pub appid: Option<i64>,
    pub limit: Option<usize>,
    pub since: Option<i64>,
}

impl MessageFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_application(appid: i64) -> Self {
        Self {
            appid: Some(appid),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    /// Stable single-flight target fragment: `all` or `app:<id>`.
    pub fn scope(&self) -> String {
        match self.appid {
            Some(appid) => format!("app:{appid}"),
            None => "all".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connecting,
    Active,
    Inactive,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::Active => "Active",
            Self::Inactive => "Inactive",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
