//! Reader configuration management

use crate::permission::PermissionMode;
use crate::session::{DEFAULT_SHUTDOWN_GRACE, SessionSettings};
use crate::usb::matcher::DeviceTarget;
use crate::usb::poller::{DEFAULT_POLL_INTERVAL, DEFAULT_READ_TIMEOUT, PollSettings};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub reader: ReaderSettings,
    pub device: DeviceSettings,
    #[serde(default)]
    pub polling: PollingSettings,
    #[serde(default)]
    pub permission: PermissionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderSettings {
    pub log_level: String,
}

/// Identity of the card reader, as `0x`-prefixed hex strings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub vendor_id: String,
    pub product_id: String,
}

/// Polling loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    /// Pause between two reads in milliseconds
    #[serde(default = "PollingSettings::default_interval")]
    pub interval_ms: u64,
    /// Upper bound for one blocking read in milliseconds
    #[serde(default = "PollingSettings::default_read_timeout")]
    pub read_timeout_ms: u64,
    /// How long teardown waits for the reader thread to exit
    #[serde(default = "PollingSettings::default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: Self::default_interval(),
            read_timeout_ms: Self::default_read_timeout(),
            shutdown_grace_ms: Self::default_shutdown_grace(),
        }
    }
}

impl PollingSettings {
    fn default_interval() -> u64 {
        DEFAULT_POLL_INTERVAL.as_millis() as u64
    }

    fn default_read_timeout() -> u64 {
        DEFAULT_READ_TIMEOUT.as_millis() as u64
    }

    fn default_shutdown_grace() -> u64 {
        DEFAULT_SHUTDOWN_GRACE.as_millis() as u64
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionSettings {
    /// prompt, grant or deny
    #[serde(default)]
    pub mode: PermissionMode,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            reader: ReaderSettings {
                log_level: "info".to_string(),
            },
            device: DeviceSettings {
                vendor_id: "0x08ff".to_string(),
                product_id: "0x0009".to_string(),
            },
            polling: PollingSettings::default(),
            permission: PermissionSettings::default(),
        }
    }
}

impl ReaderConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-card-reader/reader.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ReaderConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-card-reader").join("reader.toml")
        } else {
            PathBuf::from(".config/usb-card-reader/reader.toml")
        }
    }

    /// The (VID, PID) to look for
    pub fn target(&self) -> Result<DeviceTarget> {
        Ok(DeviceTarget::new(
            parse_hex_id(&self.device.vendor_id, "VID")?,
            parse_hex_id(&self.device.product_id, "PID")?,
        ))
    }

    /// Session manager settings derived from this configuration
    pub fn session_settings(&self) -> Result<SessionSettings> {
        Ok(SessionSettings {
            target: self.target()?,
            poll: PollSettings {
                interval: Duration::from_millis(self.polling.interval_ms),
                read_timeout: Duration::from_millis(self.polling.read_timeout_ms),
            },
            shutdown_grace: Duration::from_millis(self.polling.shutdown_grace_ms),
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.reader.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.reader.log_level,
                valid_levels.join(", ")
            ));
        }

        parse_hex_id(&self.device.vendor_id, "VID")?;
        parse_hex_id(&self.device.product_id, "PID")?;

        let timings = [
            ("interval_ms", self.polling.interval_ms),
            ("read_timeout_ms", self.polling.read_timeout_ms),
            ("shutdown_grace_ms", self.polling.shutdown_grace_ms),
        ];
        for (name, value) in timings {
            if value == 0 {
                return Err(anyhow!("Invalid polling.{}: must be greater than 0", name));
            }
        }

        Ok(())
    }
}

/// Parse a `0x`-prefixed USB ID (VID or PID)
pub fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
        return Err(anyhow!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x08ff')",
            name,
            id
        ));
    };

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

/// Load a configuration file, expanding `~` in the path
pub fn load_config(path: &str) -> Result<ReaderConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    ReaderConfig::load(Some(path_buf))
}
