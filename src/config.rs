//! Engine configuration.
//!
//! Parses and validates the YAML config consumed by the daemon. The
//! config carries the caller-set resource bounds (buffer capacity) and
//! the endpoints the engine works with; everything has a default so an
//! empty file is a valid config.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::transport::Endpoint;

/// Top-level configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on, `host:port`.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Per-connection buffer capacity in bytes. Bounds header size.
    #[serde(default = "default_buf_size")]
    pub buf_size: usize,
    /// Directory uploaded files are written into.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    /// SOCKS5 proxy to relay outbound connections through, `host:port`.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Poll timeout per tick, in milliseconds.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_buf_size() -> usize {
    crate::manager::DEFAULT_BUF_CAPACITY
}

fn default_upload_dir() -> String {
    ".".to_string()
}

fn default_poll_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: default_listen(),
            buf_size: default_buf_size(),
            upload_dir: default_upload_dir(),
            proxy: None,
            poll_ms: default_poll_ms(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config: read: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config: {0}")]
    Invalid(String),
}

/// Loads and validates a YAML config file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let data = fs::read(path)?;
    load_from_bytes(&data)
}

/// Parses a YAML config from raw bytes.
pub fn load_from_bytes(data: &[u8]) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml::from_slice(data)?;
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    /// Checks the config for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Endpoint::parse(&self.listen)
            .map_err(|e| ConfigError::Invalid(format!("listen: {}", e)))?;
        if self.buf_size < 512 {
            return Err(ConfigError::Invalid(format!(
                "buf_size {} is below the 512-byte minimum",
                self.buf_size
            )));
        }
        if self.upload_dir.is_empty() {
            return Err(ConfigError::Invalid("upload_dir is empty".to_string()));
        }
        if let Some(proxy) = &self.proxy {
            Endpoint::parse(proxy)
                .map_err(|e| ConfigError::Invalid(format!("proxy: {}", e)))?;
        }
        Ok(())
    }

    /// The listen address as an endpoint. Only valid after `validate`.
    pub fn listen_endpoint(&self) -> Result<Endpoint, ConfigError> {
        Endpoint::parse(&self.listen).map_err(|e| ConfigError::Invalid(format!("listen: {}", e)))
    }
}
