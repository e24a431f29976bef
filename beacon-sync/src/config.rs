use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{channel::ChannelConfig, retry::RetryPolicy};

/// `config.json` is expected to be tiny; refuse anything larger.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;
pub const CONFIG_DIR_ENV: &str = "BEACON_CONFIG_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("config {path} is too large: {size} bytes (max {max})")]
    TooLarge { path: PathBuf, size: u64, max: u64 },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config:\n- {}", .errors.join("\n- "))]
    Invalid { errors: Vec<String> },
    #[error("failed to serialize config: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to write config {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySettings {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            max_retries: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelSettings {
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,
    pub ping_interval_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            max_reconnect_attempts: 10,
            ping_interval_secs: 30,
            connect_timeout_secs: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub server_url: String,
    pub socket_url: String,
    pub device_id: String,
    pub token: String,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub channel: ChannelSettings,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_visibility_debounce_ms")]
    pub visibility_debounce_ms: u64,
    #[serde(default = "default_online_settle_ms")]
    pub online_settle_ms: u64,
    #[serde(default = "default_max_pull_pages")]
    pub max_pull_pages: u32,
}

fn default_request_timeout_secs() -> u64 {
    20
}

fn default_visibility_debounce_ms() -> u64 {
    1_000
}

fn default_online_settle_ms() -> u64 {
    500
}

fn default_max_pull_pages() -> u32 {
    10
}

impl EngineConfig {
    pub fn new(
        server_url: impl Into<String>,
        socket_url: impl Into<String>,
        device_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            socket_url: socket_url.into(),
            device_id: device_id.into(),
            token: token.into(),
            store_path: None,
            retry: RetrySettings::default(),
            channel: ChannelSettings::default(),
            request_timeout_secs: default_request_timeout_secs(),
            visibility_debounce_ms: default_visibility_debounce_ms(),
            online_settle_ms: default_online_settle_ms(),
            max_pull_pages: default_max_pull_pages(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        match Url::parse(&self.server_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(format!(
                "server_url must use http or https, got {}",
                url.scheme()
            )),
            Err(err) => errors.push(format!("server_url is not a valid URL: {err}")),
        }
        match Url::parse(&self.socket_url) {
            Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
            Ok(url) => errors.push(format!(
                "socket_url must use ws or wss, got {}",
                url.scheme()
            )),
            Err(err) => errors.push(format!("socket_url is not a valid URL: {err}")),
        }
        if self.device_id.trim().is_empty() {
            errors.push("device_id must not be empty".to_owned());
        }
        if self.token.trim().is_empty() {
            errors.push("token must not be empty".to_owned());
        }
        if self.retry.base_ms == 0 || self.retry.cap_ms < self.retry.base_ms {
            errors.push("retry.cap_ms must be >= retry.base_ms > 0".to_owned());
        }
        if self.channel.reconnect_base_ms == 0
            || self.channel.reconnect_cap_ms < self.channel.reconnect_base_ms
        {
            errors.push("channel.reconnect_cap_ms must be >= reconnect_base_ms > 0".to_owned());
        }
        if self.channel.ping_interval_secs == 0 {
            errors.push("channel.ping_interval_secs must be > 0".to_owned());
        }
        if self.max_pull_pages == 0 {
            errors.push("max_pull_pages must be > 0".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { errors })
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(self.retry.base_ms),
            cap: Duration::from_millis(self.retry.cap_ms),
            max_retries: self.retry.max_retries,
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            url: self.socket_url.clone(),
            token: self.token.clone(),
            device_id: self.device_id.clone(),
            reconnect_base: Duration::from_millis(self.channel.reconnect_base_ms),
            reconnect_cap: Duration::from_millis(self.channel.reconnect_cap_ms),
            max_reconnect_attempts: self.channel.max_reconnect_attempts,
            ping_interval: Duration::from_secs(self.channel.ping_interval_secs),
            connect_timeout: Duration::from_secs(self.channel.connect_timeout_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn visibility_debounce(&self) -> Duration {
        Duration::from_millis(self.visibility_debounce_ms)
    }

    pub fn online_settle(&self) -> Duration {
        Duration::from_millis(self.online_settle_ms)
    }
}

/// `$BEACON_CONFIG_DIR/config.json`, else `./beacon/config.json`.
pub fn default_config_path() -> PathBuf {
    if let Some(override_dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(override_dir).join("config.json");
    }
    PathBuf::from("beacon").join("config.json")
}

pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let meta = fs::metadata(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigError::TooLarge {
            path: path.to_owned(),
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    let config: EngineConfig = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &EngineConfig) -> Result<(), ConfigError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    config.validate()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_owned(),
            source,
        })?;
    }

    let payload = serde_json::to_string_pretty(config).map_err(ConfigError::Serialize)?;
    let tmp_path = path.with_extension("json.tmp");

    let mut attempt = 1;
    loop {
        let result =
            fs::write(&tmp_path, payload.as_bytes()).and_then(|()| fs::rename(&tmp_path, path));
        match result {
            Ok(()) => return Ok(()),
            Err(source) if attempt >= MAX_ATTEMPTS => {
                return Err(ConfigError::Write {
                    path: path.to_owned(),
                    source,
                });
            }
            Err(_) => {
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
