use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::subscription::LiveOptions;

// Upper bounds for the time windows; anything longer is a misconfiguration
const MAX_TYPING_LIVENESS_SECS: u64 = 60 * 60;
const MAX_STATUS_WINDOW_HOURS: i64 = 24 * 365;

/// Client settings. Store endpoint and credentials belong to the managed
/// backend; the rest tunes the sync layer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Typing flags older than this read as false
    pub typing_liveness_secs: u64,
    /// How often a typing subscription re-checks liveness without new writes
    pub typing_refresh_ms: u64,
    pub resubscribe_base_ms: u64,
    pub resubscribe_max_ms: u64,
    pub status_window_hours: i64,
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            endpoint: "memory://local".to_string(),
            project_id: "xchat".to_string(),
            api_key: None,
            typing_liveness_secs: 8,
            typing_refresh_ms: 1000,
            resubscribe_base_ms: 500,
            resubscribe_max_ms: 30_000,
            status_window_hours: 24,
            channel_capacity: 100,
        }
    }
}

impl ClientConfig {
    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(BASE64.encode(key));
        self
    }

    pub fn get_api_key(&self) -> Option<String> {
        self.api_key.as_ref().map(|encoded| {
            String::from_utf8(BASE64.decode(encoded).unwrap_or_default()).unwrap_or_default()
        })
    }

    pub fn typing_liveness(&self) -> chrono::Duration {
        let secs = self.typing_liveness_secs.min(MAX_TYPING_LIVENESS_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn typing_refresh(&self) -> Duration {
        Duration::from_millis(self.typing_refresh_ms.max(10))
    }

    pub fn status_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.status_window_hours.clamp(1, MAX_STATUS_WINDOW_HOURS))
    }

    /// Reject windows outside the supported range.
    pub fn validate(&self) -> Result<()> {
        if self.typing_liveness_secs > MAX_TYPING_LIVENESS_SECS {
            return Err(anyhow!(
                "typing_liveness_secs must be at most {}, got {}",
                MAX_TYPING_LIVENESS_SECS,
                self.typing_liveness_secs
            ));
        }
        if !(1..=MAX_STATUS_WINDOW_HOURS).contains(&self.status_window_hours) {
            return Err(anyhow!(
                "status_window_hours must be between 1 and {}, got {}",
                MAX_STATUS_WINDOW_HOURS,
                self.status_window_hours
            ));
        }
        Ok(())
    }

    pub fn live_options(&self) -> LiveOptions {
        LiveOptions {
            capacity: self.channel_capacity.max(1),
            backoff_base: Duration::from_millis(self.resubscribe_base_ms),
            backoff_max: Duration::from_millis(self.resubscribe_max_ms.max(self.resubscribe_base_ms)),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("XCHAT_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Ok(key) = std::env::var("XCHAT_API_KEY") {
            self.api_key = Some(BASE64.encode(key));
        }
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("xchat");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn get_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = std::env::var("XCHAT_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    Ok(get_config_dir()?.join("config.json"))
}

/// Load the configuration, falling back to defaults when no file exists.
/// Environment overrides apply on top of either.
pub fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    let config_path = get_config_path(path)?;

    let mut config = if config_path.exists() {
        let mut file = File::open(&config_path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: ClientConfig = serde_json::from_str(&contents)
            .map_err(|e| anyhow!("Invalid config {}: {}", config_path.display(), e))?;
        config
            .validate()
            .map_err(|e| anyhow!("Invalid config {}: {}", config_path.display(), e))?;
        info!("Loaded config for project {} from {}", config.project_id, config_path.display());
        config
    } else {
        info!("No config at {}, using defaults", config_path.display());
        ClientConfig::default()
    };

    config.apply_env_overrides();
    Ok(config)
}

pub fn save_config(config: &ClientConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;

    info!("Config saved to {}", path.display());
    Ok(())
}
