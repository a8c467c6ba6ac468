//! Broker configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::events::DEFAULT_QUEUE_CAPACITY;
use crate::protocol::DEFAULT_BAUD_RATE;

/// Environment variable overriding the serial port.
pub const PORT_ENV_VAR: &str = "DECK_PORT";

pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/deckd.sock";

/// Configuration for a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Serial device the deck is attached to.
    pub port: String,
    /// Line speed.
    pub baud_rate: u32,
    /// Unix socket clients connect to.
    pub socket_path: PathBuf,
    /// Events buffered per subscriber before it is dropped.
    pub queue_capacity: usize,
    /// Delay between reopen attempts while the deck is disconnected.
    pub reconnect_interval_ms: u64,
    /// Send `Up` after every open and `Down` at shutdown.
    pub enable_reporting: bool,
    /// Peer uids allowed to send commands. Empty allows everyone.
    pub command_uids: Vec<u32>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconnect_interval_ms: 1000,
            enable_reporting: true,
            command_uids: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BrokerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `DECK_PORT` if it is set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(port) = std::env::var(PORT_ENV_VAR)
            && !port.is_empty()
        {
            self.port = port;
        }
        self
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(10))
    }

    /// One field rendered as text, e.g. `get("port")`.
    pub fn get(&self, name: &str) -> Result<String> {
        let table = self.to_table()?;
        let Some(value) = table.get(name) else {
            bail!("Unknown config key: {name}");
        };
        Ok(match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Set one field from text. The value is read as TOML, falling back to
    /// a plain string, and must fit the field's type.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let mut table = self.to_table()?;
        if !table.contains_key(name) {
            bail!("Unknown config key: {name}");
        }
        table.insert(name.to_string(), parse_value(value));
        *self = toml::Value::Table(table)
            .try_into()
            .with_context(|| format!("Invalid value for {name}: {value}"))?;
        Ok(())
    }

    /// Put one field back to its default.
    pub fn unset(&mut self, name: &str) -> Result<()> {
        let defaults = BrokerConfig::default().to_table()?;
        let Some(default) = defaults.get(name) else {
            bail!("Unknown config key: {name}");
        };
        let mut table = self.to_table()?;
        table.insert(name.to_string(), default.clone());
        *self = toml::Value::Table(table).try_into()?;
        Ok(())
    }

    fn to_table(&self) -> Result<toml::Table> {
        match toml::Value::try_from(self)? {
            toml::Value::Table(table) => Ok(table),
            _ => bail!("Config did not serialize to a table"),
        }
    }

    /// Whether a peer with this uid may send commands.
    pub fn may_command(&self, uid: Option<u32>) -> bool {
        if self.command_uids.is_empty() {
            return true;
        }
        uid.is_some_and(|uid| self.command_uids.contains(&uid))
    }
}

fn parse_value(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("value = {raw}"))
        .ok()
        .and_then(|mut table| table.remove("value"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}
