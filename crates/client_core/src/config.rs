use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "chat_sync.toml";
const ENV_PREFIX: &str = "CHAT_SYNC__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server_url: String,
    pub socket_path: String,
    pub page_size: u32,
    pub send_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:4000".into(),
            socket_path: "/ws".into(),
            page_size: 20,
            send_timeout_ms: 15_000,
            reconnect_attempts: 10,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
        }
    }
}

/// Exponential backoff schedule for socket reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let multiplier = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
    }
}

impl SyncConfig {
    /// Defaults, then `chat_sync.toml` in the working directory if present,
    /// then `CHAT_SYNC__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Path::new(DEFAULT_CONFIG_FILE);
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = var("SOCKET_PATH") {
            self.socket_path = v;
        }
        if let Some(v) = var("PAGE_SIZE") {
            self.page_size = parse_number("page_size", &v)?;
        }
        if let Some(v) = var("SEND_TIMEOUT_MS") {
            self.send_timeout_ms = parse_number("send_timeout_ms", &v)?;
        }
        if let Some(v) = var("RECONNECT_ATTEMPTS") {
            self.reconnect_attempts = parse_number("reconnect_attempts", &v)?;
        }
        if let Some(v) = var("RECONNECT_BASE_MS") {
            self.reconnect_base_ms = parse_number("reconnect_base_ms", &v)?;
        }
        if let Some(v) = var("RECONNECT_MAX_MS") {
            self.reconnect_max_ms = parse_number("reconnect_max_ms", &v)?;
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: "server_url",
                value: self.server_url.clone(),
            });
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "page_size",
                value: self.page_size.to_string(),
            });
        }
        if self.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "send_timeout_ms",
                value: self.send_timeout_ms.to_string(),
            });
        }
        Ok(())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_base_ms)),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
