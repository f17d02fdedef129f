use crate::{codec::Format, error::Result};
use serde::Deserialize;
use std::{net::SocketAddr, path::Path, time::Duration};

pub const DEFAULT_COLLECTOR_ADDRESS: &str = "127.0.0.1:9999";
pub const DEFAULT_EXPORTER_PORT: u16 = 8000;

fn default_collector_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9999))
}

const fn default_retry_backoff_ms() -> u64 {
    5_000
}

const fn default_collection_interval() -> u64 {
    10
}

const fn default_max_frame_len() -> usize {
    crate::codec::MAX_FRAME_LEN
}

const fn default_exporter_port() -> u16 {
    DEFAULT_EXPORTER_PORT
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentConfig {
    pub agent_name: String,
    #[serde(default = "default_collector_address")]
    pub collector_address: SocketAddr,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Retries allowed per snapshot before giving up; unset retries forever.
    #[serde(default)]
    pub retry_budget: Option<u32>,
    #[serde(default = "default_collection_interval")]
    pub collection_interval_secs: u64,
    #[serde(default)]
    pub format: Format,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_name: "agent".into(),
            collector_address: default_collector_address(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_budget: None,
            collection_interval_secs: default_collection_interval(),
            format: Format::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            ..Self::default()
        }
    }

    /// Parses an agent config from TOML.
    ///
    /// # Errors
    /// Returns [`crate::TransportError::Config`] for invalid TOML or values.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Reads and parses an agent config file.
    ///
    /// # Errors
    /// IO errors reading the file, or parse errors as in [`Self::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub const fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_collector_address")]
    pub address: SocketAddr,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Port of the scrape endpoint served by the metrics exporter.
    #[serde(default = "default_exporter_port")]
    pub exporter_port: u16,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            address: default_collector_address(),
            max_frame_len: default_max_frame_len(),
            exporter_port: default_exporter_port(),
        }
    }
}

impl CollectorConfig {
    /// Parses a collector config from TOML.
    ///
    /// # Errors
    /// Returns [`crate::TransportError::Config`] for invalid TOML or values.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Reads and parses a collector config file.
    ///
    /// # Errors
    /// IO errors reading the file, or parse errors as in [`Self::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }
}
