//! Configuration file support for busytag.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BUSYTAG_*)
//! 3. Local config file (./busytag.toml)
//! 4. Global config file (~/.config/busytag/config.toml)

use busytag::{LedMask, PatternStep, Rgb};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Per-command timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// File transfer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Upload chunk size in bytes.
    pub chunk_size: Option<usize>,
    /// Chunk acknowledgement timeout in milliseconds.
    pub chunk_timeout_ms: Option<u64>,
}

/// Device discovery configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Device name prefix, e.g. "busytag-".
    pub device_prefix: Option<String>,
    /// Interval between scans in `watch`, in milliseconds.
    pub scan_interval_ms: Option<u64>,
    /// Minimum seconds between repeated notifications of an unchanged device set.
    pub quiet_interval_secs: Option<u64>,
    /// Identity probe timeout in milliseconds.
    pub probe_timeout_ms: Option<u64>,
}

/// One step of a configured LED pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternStepConfig {
    /// Color as `RRGGBB` (leading `#` optional).
    pub color: String,
    /// Step duration in milliseconds.
    pub duration_ms: u64,
    /// Fade into the color.
    #[serde(default)]
    pub transition: bool,
    /// LED zone mask (1-127), all zones when absent.
    pub leds: Option<u8>,
}

/// A named LED pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Name used on the command line.
    pub name: String,
    /// Steps in playback order.
    #[serde(default)]
    pub steps: Vec<PatternStepConfig>,
}

impl PatternConfig {
    /// Convert to engine pattern steps, validating colors and masks.
    pub fn to_steps(&self) -> busytag::Result<Vec<PatternStep>> {
        self.steps
            .iter()
            .map(|step| {
                let leds = match step.leds {
                    Some(bits) => LedMask::new(bits)?,
                    None => LedMask::ALL,
                };
                Ok(PatternStep::new(
                    Rgb::from_hex(&step.color)?,
                    Duration::from_millis(step.duration_ms),
                    step.transition,
                )
                .with_leds(leds))
            })
            .collect()
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Transfer settings.
    #[serde(default)]
    pub transfer: TransferSettings,
    /// Discovery settings.
    #[serde(default)]
    pub discovery: DiscoverySettings,
    /// User-defined LED patterns (`[[pattern]]` tables).
    #[serde(default, rename = "pattern")]
    pub patterns: Vec<PatternConfig>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new("busytag.toml")) {
            debug!("Loaded local config from busytag.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "busytag").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Find a configured pattern by name, ignoring case.
    pub fn pattern(&self, name: &str) -> Option<&PatternConfig> {
        self.patterns
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        // Connection
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.connection.timeout_ms.is_some() {
            self.connection.timeout_ms = other.connection.timeout_ms;
        }

        // Transfer
        if other.transfer.chunk_size.is_some() {
            self.transfer.chunk_size = other.transfer.chunk_size;
        }
        if other.transfer.chunk_timeout_ms.is_some() {
            self.transfer.chunk_timeout_ms = other.transfer.chunk_timeout_ms;
        }

        // Discovery
        if other.discovery.device_prefix.is_some() {
            self.discovery.device_prefix = other.discovery.device_prefix;
        }
        if other.discovery.scan_interval_ms.is_some() {
            self.discovery.scan_interval_ms = other.discovery.scan_interval_ms;
        }
        if other.discovery.quiet_interval_secs.is_some() {
            self.discovery.quiet_interval_secs = other.discovery.quiet_interval_secs;
        }
        if other.discovery.probe_timeout_ms.is_some() {
            self.discovery.probe_timeout_ms = other.discovery.probe_timeout_ms;
        }

        // Patterns with the same name are replaced
        for pattern in other.patterns {
            self.patterns
                .retain(|p| !p.name.eq_ignore_ascii_case(&pattern.name));
            self.patterns.push(pattern);
        }
    }
}
