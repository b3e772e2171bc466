//! Client configuration: TOML file with defaults and environment overrides

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, SessionError};

pub const ENV_API_URL: &str = "PARLEY_API_URL";
pub const ENV_WS_URL: &str = "PARLEY_WS_URL";
pub const ENV_STATE_PATH: &str = "PARLEY_STATE_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the HTTP API (login, refresh, user lookup)
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// WebSocket endpoint; the access token is appended as `?token=`
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Where the session snapshot and credentials are kept
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_ws_url() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_state_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("parley")
        .join("session.json")
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ws_url: default_ws_url(),
            state_path: default_state_path(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ClientConfig {
    /// Default location: `<config_dir>/parley/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("parley").join("config.toml"))
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` (defaults if the file does not exist), then apply
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            debug!("Loading config from {:?}", path);
            let content = std::fs::read_to_string(path)?;
            Self::parse(&content)?
        } else {
            info!("No config at {:?}, using defaults", path);
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override fields from a variable lookup (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_API_URL) {
            self.api_url = v;
        }
        if let Some(v) = lookup(ENV_WS_URL) {
            self.ws_url = v;
        }
        if let Some(v) = lookup(ENV_STATE_PATH) {
            self.state_path = PathBuf::from(v);
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        let api = url::Url::parse(&self.api_url)
            .map_err(|e| SessionError::Config(format!("api_url '{}': {}", self.api_url, e)))?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(SessionError::Config(format!(
                "api_url must be http(s), got '{}'",
                self.api_url
            )));
        }
        let ws = url::Url::parse(&self.ws_url)
            .map_err(|e| SessionError::Config(format!("ws_url '{}': {}", self.ws_url, e)))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(SessionError::Config(format!(
                "ws_url must be ws(s), got '{}'",
                self.ws_url
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(SessionError::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
