//! TOML configuration for crewdeck.
//!
//! Layered lookup: the file named by `CREWDECK_CONFIG`, then `./crewdeck.toml`,
//! then compiled-in defaults. `CREWDECK_API_URL`, `CREWDECK_WS_URL` and
//! `CREWDECK_TOKEN` override the loaded values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::FallbackPolicy;

pub const CONFIG_ENV: &str = "CREWDECK_CONFIG";
pub const LOCAL_CONFIG: &str = "crewdeck.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrewdeckConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CrewdeckConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration through the lookup chain and apply env overrides.
    ///
    /// An explicit `path` (from the command line) must load; the implicit
    /// locations fall through to defaults when unreadable.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::load_or_default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(&env_path);
            match Self::load(&path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CREWDECK_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var("CREWDECK_API_URL").ok(),
            std::env::var("CREWDECK_WS_URL").ok(),
            std::env::var("CREWDECK_TOKEN").ok(),
        );
    }

    fn apply_overrides(&mut self, api_url: Option<String>, ws_url: Option<String>, token: Option<String>) {
        if let Some(url) = api_url.filter(|s| !s.is_empty()) {
            self.api.base_url = url;
        }
        if let Some(url) = ws_url.filter(|s| !s.is_empty()) {
            self.api.ws_url = url;
        }
        if let Some(token) = token.filter(|s| !s.is_empty()) {
            self.api.token = Some(token);
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Orchestration service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Push channel endpoint.
    pub ws_url: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Sent as a bearer token when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            ws_url: "ws://localhost:8000/ws".to_string(),
            timeout_secs: 30,
            connect_timeout_secs: 5,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/crewdeck.db"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// What a network failure does to create/update/delete/execute.
    pub fallback: FallbackPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub default_duration_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_duration_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
