//! Driver configuration management

use crate::usb::context::ContextLimits;
use crate::usb::manager::ManagerSettings;
use crate::usb::rusb_backend::OpenOptions;
use crate::usb::session::{
    DEFAULT_BULK_TIMEOUT, DEFAULT_CONTROL_TIMEOUT, DEFAULT_LOCK_WAIT, SessionTimeouts,
};
use crate::usb::transfers::StallPolicy;
use anyhow::{Context, Result, anyhow};
use protocol::DeviceMatch;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    /// Transfer timeouts and buffer limits
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    pub log_level: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Timeout of one bulk transfer (e.g. "5s", "500ms")
    #[serde(default = "TransferSettings::default_bulk_timeout", with = "duration_serde")]
    pub bulk_timeout: Duration,
    /// Timeout of one control transfer
    #[serde(
        default = "TransferSettings::default_control_timeout",
        with = "duration_serde"
    )]
    pub control_timeout: Duration,
    /// How long a request waits for another session's transfer
    #[serde(default = "TransferSettings::default_lock_wait", with = "duration_serde")]
    pub lock_wait: Duration,
    /// Largest single bulk transfer in bytes
    #[serde(default = "TransferSettings::default_max_transfer_size")]
    pub max_transfer_size: usize,
    /// Largest data stage of a control transfer in bytes
    #[serde(default = "TransferSettings::default_control_max_transfer")]
    pub control_max_transfer: usize,
    /// Largest transfer buffer a device may allocate at attach
    #[serde(default = "TransferSettings::default_max_buffer_size")]
    pub max_buffer_size: usize,
    /// What to do after an endpoint halt has been cleared
    #[serde(default)]
    pub stall_policy: StallPolicy,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            bulk_timeout: Self::default_bulk_timeout(),
            control_timeout: Self::default_control_timeout(),
            lock_wait: Self::default_lock_wait(),
            max_transfer_size: Self::default_max_transfer_size(),
            control_max_transfer: Self::default_control_max_transfer(),
            max_buffer_size: Self::default_max_buffer_size(),
            stall_policy: StallPolicy::default(),
        }
    }
}

impl TransferSettings {
    fn default_bulk_timeout() -> Duration {
        DEFAULT_BULK_TIMEOUT
    }

    fn default_control_timeout() -> Duration {
        DEFAULT_CONTROL_TIMEOUT
    }

    fn default_lock_wait() -> Duration {
        DEFAULT_LOCK_WAIT
    }

    fn default_max_transfer_size() -> usize {
        64 * 1024
    }

    fn default_control_max_transfer() -> usize {
        4096
    }

    fn default_max_buffer_size() -> usize {
        1024 * 1024
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Interface carrying the bulk endpoint pair
    #[serde(default)]
    pub interface: u8,
    /// Extra devices to drive, as "0xVID:0xPID" or "0xVID:*"
    #[serde(default)]
    pub filters: Vec<String>,
}

/// Custom serde module for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string like "5s", "500ms", "1m30s"
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        let mut total_ms: u64 = 0;
        let mut current_num = String::new();
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                current_num.push(c);
                continue;
            }
            if current_num.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            current_num.clear();

            let unit_ms = match c {
                'h' => 3_600_000,
                'm' if chars.peek() == Some(&'s') => {
                    chars.next();
                    1
                }
                'm' => 60_000,
                's' => 1000,
                _ => return Err(format!("Invalid duration unit: {}", c)),
            };
            total_ms = num
                .checked_mul(unit_ms)
                .and_then(|ms| total_ms.checked_add(ms))
                .ok_or_else(|| format!("Duration out of range: {}", s))?;
        }

        // Trailing number without unit is seconds
        if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            total_ms = num
                .checked_mul(1000)
                .and_then(|ms| total_ms.checked_add(ms))
                .ok_or_else(|| format!("Duration out of range: {}", s))?;
        }

        if total_ms == 0 {
            return Err("Duration must be greater than 0".to_string());
        }

        Ok(Duration::from_millis(total_ms))
    }

    pub fn format_duration(d: Duration) -> String {
        let total_ms = d.as_millis();
        if total_ms % 1000 != 0 {
            return format!("{}ms", total_ms);
        }

        let secs = d.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 || result.is_empty() {
            result.push_str(&format!("{}s", secs));
        }
        result
    }
}

pub use duration_serde::{format_duration, parse_duration};

impl DriverConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/caen-usb/driver.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DriverConfig = toml::from_str(&content)
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
        let path = expand_path(path);
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("caen-usb").join("driver.toml")
        } else {
            PathBuf::from(".config/caen-usb/driver.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                valid_levels.join(", ")
            ));
        }

        let transfer = &self.transfer;
        for (name, value) in [
            ("bulk_timeout", transfer.bulk_timeout),
            ("control_timeout", transfer.control_timeout),
            ("lock_wait", transfer.lock_wait),
        ] {
            if value.is_zero() {
                return Err(anyhow!("Invalid {}, must be greater than 0", name));
            }
        }

        if transfer.max_transfer_size == 0 || transfer.control_max_transfer == 0 {
            return Err(anyhow!("Transfer sizes must be greater than 0"));
        }
        let largest = transfer.max_transfer_size.max(transfer.control_max_transfer);
        if largest > transfer.max_buffer_size {
            return Err(anyhow!(
                "Transfer size {} exceeds max_buffer_size {}",
                largest,
                transfer.max_buffer_size
            ));
        }

        self.device_matches()?;
        Ok(())
    }

    /// Parsed `usb.filters`
    pub fn device_matches(&self) -> Result<Vec<DeviceMatch>> {
        self.usb
            .filters
            .iter()
            .map(|filter| {
                DeviceMatch::parse(filter)
                    .with_context(|| format!("Invalid USB filter '{}'", filter))
            })
            .collect()
    }

    /// Settings for the lifecycle manager
    pub fn manager_settings(&self) -> Result<ManagerSettings> {
        Ok(ManagerSettings {
            limits: ContextLimits {
                max_buffer_size: self.transfer.max_buffer_size,
                stall_policy: self.transfer.stall_policy,
            },
            timeouts: SessionTimeouts {
                bulk: self.transfer.bulk_timeout,
                control: self.transfer.control_timeout,
                lock_wait: self.transfer.lock_wait,
            },
            extra_matches: self.device_matches()?,
        })
    }

    /// How devices are opened at attach
    pub fn open_options(&self) -> OpenOptions {
        OpenOptions {
            interface: self.usb.interface,
            max_transfer_size: self.transfer.max_transfer_size,
            control_max_transfer: self.transfer.control_max_transfer,
        }
    }
}

/// Expand a leading `~` and environment variables in a path
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(&raw).as_ref()),
    }
}
