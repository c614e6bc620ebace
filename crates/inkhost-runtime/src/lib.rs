use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThemeRuntimeStatus {
    NotInstalled,
    Installed,
    Running,
    Error,
}

/// Point-in-time view of one theme's runtime, merged from filesystem install
/// state and the live registry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RuntimeStatusInfo {
    pub name: String,
    pub status: ThemeRuntimeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl RuntimeStatusInfo {
    pub fn not_installed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ThemeRuntimeStatus::NotInstalled,
            version: None,
            port: None,
            installed_at: None,
            started_at: None,
        }
    }
}

/// Lifecycle errors surfaced to the administrative caller.
///
/// A stop that outlives the graceful window is escalated to SIGKILL inside
/// the supervisor and never becomes an error here.
#[derive(Debug, thiserror::Error)]
pub enum SsrError {
    #[error("theme already running: {0}")]
    AlreadyRunning(String),

    #[error("theme not running: {0}")]
    NotRunning(String),

    #[error("theme not installed: {0}")]
    NotInstalled(String),

    #[error("failed to spawn runtime for {theme}")]
    SpawnFailed {
        theme: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist activation state")]
    ActivationPersistFailed(#[source] anyhow::Error),

    #[error("theme catalog lookup failed")]
    Catalog(#[source] anyhow::Error),
}
