//! YAML settings for the `queue-worker` binary
//!
//! ```yaml
//! consumer:
//!   queue_name: events
//!   worker_name: mailer
//!   routing_key: events.mail
//!   pool_size: 8
//! store:
//!   kind: file
//!   path: ./dead-letters
//! broker:
//!   kind: stdin
//! logging:
//!   level: info
//!   json: true
//! metrics:
//!   prefix: mailer
//! ```

use crate::consumer::ConsumerConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where dead letters are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Keep records in memory
    Memory,
    /// Append records to JSON-lines files
    #[default]
    File,
}

/// Dead-letter store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Store implementation
    pub kind: StoreKind,
    /// Root directory for the file store
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            kind: StoreKind::File,
            path: PathBuf::from("dead-letters"),
        }
    }
}

/// Where messages come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Lines read from standard input
    #[default]
    Stdin,
    /// A Kafka-compatible cluster
    Kafka,
}

/// Broker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Broker implementation
    pub kind: BrokerKind,
    /// Broker addresses (comma-separated)
    pub brokers: String,
    /// Consumer group ID
    pub group_id: String,
    /// Additional client properties
    pub properties: HashMap<String, String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Stdin,
            brokers: "localhost:9092".to_string(),
            group_id: "queue-worker".to_string(),
            properties: HashMap::new(),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of plain text
    pub json: bool,
    /// Facility attached to error entries
    pub facility: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            facility: None,
        }
    }
}

/// Metrics settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Prefix for every metric name
    pub prefix: Option<String>,
    /// Print the Prometheus text export on shutdown
    pub dump_on_exit: bool,
}

/// Complete settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// What to consume
    pub consumer: ConsumerConfig,
    /// Dead-letter store
    pub store: StoreSettings,
    /// Message source
    pub broker: BrokerSettings,
    /// Log output
    pub logging: LoggingSettings,
    /// Metrics
    pub metrics: MetricsSettings,
}

impl Settings {
    /// Parse settings from YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load settings from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Check the settings can start a worker
    pub fn validate(&self) -> Result<()> {
        self.consumer.validate().map_err(Error::Config)?;

        if self.store.kind == StoreKind::File && self.store.path.as_os_str().is_empty() {
            return Err(Error::config("Store path cannot be empty"));
        }

        if self.broker.kind == BrokerKind::Kafka {
            if self.broker.brokers.is_empty() {
                return Err(Error::config("Brokers cannot be empty"));
            }
            if self.broker.group_id.is_empty() {
                return Err(Error::config("Group ID cannot be empty"));
            }
        }

        Ok(())
    }
}
