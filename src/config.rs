//! Client configuration (`client.toml`)

use crate::protocol::{timeouts, DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY};
use crate::queue::QueuePolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "client.toml";

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("BiNinja");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("bininja");
    }
    PathBuf::from(".bininja")
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub channel_timeout_ms: u64,
    pub header_timeout_ms: u64,
    /// Handoff queue bound in chunks, 0 for unbounded
    pub queue_capacity: usize,
    pub public_key: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub transfer_log: Option<PathBuf>,
    pub log_filter: Option<String>,
    pub headless: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connect_timeout_ms: timeouts::CONNECT_MS,
            close_timeout_ms: timeouts::CLOSE_MS,
            channel_timeout_ms: timeouts::CHANNEL_MS,
            header_timeout_ms: timeouts::HEADER_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            public_key: None,
            download_dir: None,
            transfer_log: None,
            log_filter: None,
            headless: false,
        }
    }
}

impl ClientConfig {
    /// Load `path`, or `<config dir>/client.toml` when `path` is `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (config_dir().join(CONFIG_FILE), false),
        };
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.header_timeout_ms)
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        QueuePolicy::from_capacity(self.queue_capacity)
    }
}
