//! TOML config file loading and validation for the relay. Every knob has
//! a default matching the long-standing deployed behavior, so a missing
//! file yields a fully working config.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttSection,
    pub web: WebSection,
    pub storage: StorageSection,
    pub commands: CommandsSection,
    pub windows: WindowsSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub topics: Vec<String>,
    /// Retained "online"/"offline" marker; empty string disables it.
    pub status_topic: String,
    pub keep_alive_secs: u64,
    pub reconnect_backoff_secs: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "ag360-relay".to_string(),
            topics: vec!["esp32/telemetry".to_string()],
            status_topic: "ag360/status".to_string(),
            keep_alive_secs: 30,
            reconnect_backoff_secs: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub retention_days: i64,
    pub sweep_interval_secs: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            retention_days: 30,
            sweep_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CommandsSection {
    pub led_topic: String,
    pub relay1_topic: String,
    pub relay2_topic: String,
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            led_topic: "esp32/led".to_string(),
            relay1_topic: "esp32/relay1".to_string(),
            relay2_topic: "esp32/relay2".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowsSection {
    /// Maximum age of the last telemetry before the derived device
    /// status flips to offline.
    pub staleness_secs: u64,
}

impl Default for WindowsSection {
    fn default() -> Self {
        Self { staleness_secs: 12 }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load and validate the config file. A missing file is not an error:
/// defaults apply (env overrides are handled by the caller).
pub fn load(path: &str) -> Result<Config> {
    let cfg = if Path::new(path).exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        toml::from_str(&text).with_context(|| format!("failed to parse config file {path}"))?
    } else {
        Config::default()
    };
    cfg.validate()?;
    Ok(cfg)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.mqtt.reconnect_backoff_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt.keep_alive_secs)
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.storage.retention_days as u64 * 24 * 60 * 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.storage.sweep_interval_secs)
    }

    pub fn staleness_ms(&self) -> i64 {
        self.windows.staleness_secs as i64 * 1000
    }

    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if self.mqtt.port == 0 {
            errors.push("mqtt.port must be non-zero".to_string());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }
        if self.mqtt.topics.is_empty() {
            errors.push("mqtt.topics is empty, nothing to subscribe to".to_string());
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, topic) in self.mqtt.topics.iter().enumerate() {
            if topic.trim().is_empty() {
                errors.push(format!("mqtt.topics[{i}] is empty"));
            } else if !seen.insert(topic) {
                errors.push(format!("mqtt.topics[{i}]: duplicate topic '{topic}'"));
            }
        }
        if self.mqtt.keep_alive_secs == 0 {
            errors.push("mqtt.keep_alive_secs must be positive".to_string());
        }
        if self.mqtt.reconnect_backoff_secs == 0 {
            errors.push("mqtt.reconnect_backoff_secs must be positive".to_string());
        }

        if self.web.port == 0 {
            errors.push("web.port must be non-zero".to_string());
        }

        if self.storage.retention_days <= 0 {
            errors.push(format!(
                "storage.retention_days must be positive, got {}",
                self.storage.retention_days
            ));
        }
        if self.storage.sweep_interval_secs == 0 {
            errors.push("storage.sweep_interval_secs must be positive".to_string());
        }

        for (name, topic) in [
            ("commands.led_topic", &self.commands.led_topic),
            ("commands.relay1_topic", &self.commands.relay1_topic),
            ("commands.relay2_topic", &self.commands.relay2_topic),
        ] {
            if topic.trim().is_empty() {
                errors.push(format!("{name} is empty"));
            }
        }

        if self.windows.staleness_secs == 0 {
            errors.push("windows.staleness_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
