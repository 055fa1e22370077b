//! Daemon configuration management

use crate::usb::{
    APPLE_VENDOR_ID, DEFAULT_RX_BUFFER_SIZE, DEFAULT_RX_LOOPS, ManagerConfig, PRODUCT_ID_RANGE,
};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "DaemonSettings::default_log_level")]
    pub log_level: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl DaemonSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Parallel receive loops per device
    #[serde(default = "UsbSettings::default_rx_loops")]
    pub rx_loops: usize,
    /// Size of each receive buffer in bytes
    #[serde(default = "UsbSettings::default_rx_buffer_size")]
    pub rx_buffer_size: usize,
    /// Lowest accepted product ID ("0x1290")
    #[serde(default = "UsbSettings::default_product_id_low")]
    pub product_id_low: String,
    /// Highest accepted product ID ("0x12af")
    #[serde(default = "UsbSettings::default_product_id_high")]
    pub product_id_high: String,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            rx_loops: Self::default_rx_loops(),
            rx_buffer_size: Self::default_rx_buffer_size(),
            product_id_low: Self::default_product_id_low(),
            product_id_high: Self::default_product_id_high(),
        }
    }
}

impl UsbSettings {
    fn default_rx_loops() -> usize {
        DEFAULT_RX_LOOPS
    }

    fn default_rx_buffer_size() -> usize {
        DEFAULT_RX_BUFFER_SIZE
    }

    fn default_product_id_low() -> String {
        format!("{:#06x}", PRODUCT_ID_RANGE.start())
    }

    fn default_product_id_high() -> String {
        format!("{:#06x}", PRODUCT_ID_RANGE.end())
    }
}

impl DaemonConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbmuxd-rs/usbmuxd.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
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
            config_dir.join("usbmuxd-rs").join("usbmuxd.toml")
        } else {
            PathBuf::from(".config/usbmuxd-rs/usbmuxd.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.usb.rx_loops == 0 {
            return Err(anyhow!("rx_loops must be at least 1"));
        }
        if self.usb.rx_buffer_size == 0 {
            return Err(anyhow!("rx_buffer_size must be greater than 0"));
        }

        let low = Self::parse_hex_id(&self.usb.product_id_low, "product_id_low")?;
        let high = Self::parse_hex_id(&self.usb.product_id_high, "product_id_high")?;
        if low > high {
            return Err(anyhow!(
                "Invalid product ID range {}..={}, low end is above high end",
                self.usb.product_id_low,
                self.usb.product_id_high
            ));
        }

        Ok(())
    }

    /// Parse a hex ID ("0x12a8")
    fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| {
                anyhow!(
                    "Invalid {} '{}', must start with '0x' (e.g., '0x1290')",
                    name,
                    id
                )
            })?;

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

    /// Device manager settings described by this configuration
    pub fn manager_config(&self) -> Result<ManagerConfig> {
        self.validate()?;
        let low = Self::parse_hex_id(&self.usb.product_id_low, "product_id_low")?;
        let high = Self::parse_hex_id(&self.usb.product_id_high, "product_id_high")?;

        Ok(ManagerConfig {
            vendor_id: APPLE_VENDOR_ID,
            product_ids: low..=high,
            rx_loops: self.usb.rx_loops,
            rx_buffer_size: self.usb.rx_buffer_size,
        })
    }
}

/// Load configuration from a user-supplied path, expanding `~`
pub fn load_config(path: &str) -> Result<DaemonConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    DaemonConfig::load(Some(path_buf))
}
