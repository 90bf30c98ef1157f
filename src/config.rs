use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolved settings; every field is filled by [`HubConfig::load`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub data_dir: String,
    pub log_dir: String,
    pub log_level: String,
    pub xray_binary_path: String,
    pub xray_log_level: String,

    /// Stats sync interval in seconds.
    pub worker_interval: u64,

    /// Timeout for node pushes and stats fetches, in seconds.
    pub http_client_timeout: u64,

    /// Deadline for reaching the engine's control plane after a start, in seconds.
    pub engine_connect_timeout: u64,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialHubConfig {
    data_dir: Option<String>,
    log_dir: Option<String>,
    log_level: Option<String>,
    xray_binary_path: Option<String>,
    xray_log_level: Option<String>,
    worker_interval: Option<u64>,
    http_client_timeout: Option<u64>,
    engine_connect_timeout: Option<u64>,
}

fn default_data_dir() -> String {
    "storage".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_xray_binary_path() -> String {
    if cfg!(target_os = "macos") {
        "third_party/xray-macos-arm64/xray".to_string()
    } else {
        "third_party/xray-linux-64/xray".to_string()
    }
}

fn default_xray_log_level() -> String {
    "warning".to_string()
}

fn default_worker_interval() -> u64 {
    10
}

fn default_http_client_timeout() -> u64 {
    10
}

fn default_engine_connect_timeout() -> u64 {
    10
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::merge(PartialHubConfig::default(), PartialHubConfig::default())
    }
}

impl HubConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, String> {
        dotenv::dotenv().ok();

        // 1. Load from file (optional)
        let file_config: PartialHubConfig = if let Some(path_str) = config_path {
            let path = Path::new(path_str);
            if path.exists() {
                let contents = fs::read_to_string(path)
                    .map_err(|e| format!("Failed to read config file at {path:?}: {e}"))?;
                toml::from_str(&contents)
                    .map_err(|e| format!("Failed to parse TOML from config file at {path:?}: {e}"))?
            } else {
                PartialHubConfig::default()
            }
        } else {
            PartialHubConfig::default()
        };

        // 2. Load from environment variables
        let env_config: PartialHubConfig = envy::prefixed("HUB_")
            .from_env::<PartialHubConfig>()
            .map_err(|e| format!("Failed to load config from environment: {e}"))?;

        // 3. Merge: environment overrides file
        let config = Self::merge(env_config, file_config);
        if config.worker_interval == 0 {
            return Err("worker_interval must be at least 1 second".to_string());
        }
        Ok(config)
    }

    fn merge(primary: PartialHubConfig, fallback: PartialHubConfig) -> Self {
        HubConfig {
            data_dir: primary.data_dir.or(fallback.data_dir).unwrap_or_else(default_data_dir),
            log_dir: primary.log_dir.or(fallback.log_dir).unwrap_or_else(default_log_dir),
            log_level: primary
                .log_level
                .or(fallback.log_level)
                .unwrap_or_else(default_log_level),
            xray_binary_path: primary
                .xray_binary_path
                .or(fallback.xray_binary_path)
                .unwrap_or_else(default_xray_binary_path),
            xray_log_level: primary
                .xray_log_level
                .or(fallback.xray_log_level)
                .unwrap_or_else(default_xray_log_level),
            worker_interval: primary
                .worker_interval
                .or(fallback.worker_interval)
                .unwrap_or_else(default_worker_interval),
            http_client_timeout: primary
                .http_client_timeout
                .or(fallback.http_client_timeout)
                .unwrap_or_else(default_http_client_timeout),
            engine_connect_timeout: primary
                .engine_connect_timeout
                .or(fallback.engine_connect_timeout)
                .unwrap_or_else(default_engine_connect_timeout),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("database").join("app.json")
    }

    pub fn xray_config_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("app").join("xray.json")
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.worker_interval)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_client_timeout)
    }

    pub fn engine_connect_deadline(&self) -> Duration {
        Duration::from_secs(self.engine_connect_timeout)
    }
}
