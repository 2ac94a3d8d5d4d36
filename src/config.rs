//! Configuration for the rule controller and the UI store.
//!
//! Defines where rules are persisted, host table limits, and how long a
//! message round-trip may take.

use crate::directive::RedirectEncoding;
use crate::host::DEFAULT_MAX_DYNAMIC_RULES;
use crate::storage::RULES_KEY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockRulesConfig {
    /// Persistent storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Host redirect table
    #[serde(default)]
    pub host: HostConfig,

    /// Messaging channel between the store and the controller
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl MockRulesConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.storage.validate()?;
        self.host.validate()?;
        self.channel.validate()?;
        Ok(())
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// JSON file backing the storage area (in-memory when null)
    #[serde(default = "default_storage_path")]
    pub path: Option<PathBuf>,

    /// Key holding the rule list
    #[serde(default = "default_rules_key")]
    pub key: String,
}

fn default_storage_path() -> Option<PathBuf> {
    Some(PathBuf::from("mock-rules.json"))
}

fn default_rules_key() -> String {
    RULES_KEY.to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            key: default_rules_key(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.key.is_empty() {
            anyhow::bail!("storage key cannot be empty");
        }
        Ok(())
    }
}

/// Host table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Maximum number of dynamic directives
    #[serde(default = "default_max_dynamic_rules")]
    pub max_dynamic_rules: usize,

    /// How mock bodies are embedded in redirect URLs
    #[serde(default)]
    pub redirect_encoding: RedirectEncoding,
}

fn default_max_dynamic_rules() -> usize {
    DEFAULT_MAX_DYNAMIC_RULES
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_dynamic_rules: default_max_dynamic_rules(),
            redirect_encoding: RedirectEncoding::default(),
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_dynamic_rules == 0 {
            anyhow::bail!("max_dynamic_rules must be greater than 0");
        }
        Ok(())
    }
}

/// Channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    /// Time allowed for a request and its acknowledgement (ms)
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Pending messages the controller queue holds
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_ack_timeout_ms() -> u64 {
    5000
}

fn default_capacity() -> usize {
    64
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            capacity: default_capacity(),
        }
    }
}

impl ChannelConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ack_timeout_ms == 0 {
            anyhow::bail!("ack_timeout_ms must be greater than 0");
        }
        if self.capacity == 0 {
            anyhow::bail!("channel capacity must be greater than 0");
        }
        Ok(())
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Log every applied add/remove/update
    #[serde(default = "default_true")]
    pub log_operations: bool,

    /// Compact JSON mock bodies before storing them
    #[serde(default = "default_true")]
    pub normalize_mock: bool,
}

fn default_true() -> bool {
    true
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_operations: true,
            normalize_mock: true,
        }
    }
}
