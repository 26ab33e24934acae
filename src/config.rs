//! User configuration management
//!
//! Configuration is stored in TOML format at `~/.ugcmount/config.toml`.
//! Every section and key is optional; missing values take their defaults.
//!
//! # Examples
//!
//! ```no_run
//! use ugcmount::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = Config::load()?;
//! println!("Namespace root: {}", config.namespace.root);
//!
//! config.timeouts.mount_secs = 120;
//! config.save()?;
//! # Ok(())
//! # }
//! ```

use crate::platform::detect_platform;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// User configuration file (`~/.ugcmount/config.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Virtual mount namespace
    #[serde(default)]
    pub namespace: NamespaceConfig,

    /// Archive acceptance rules
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Per-step timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Where extracted mounts and mount state live
    #[serde(default)]
    pub mount: MountConfig,

    /// Side-loaded archive folder
    #[serde(default)]
    pub sideload: SideloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    #[serde(default = "default_namespace_root")]
    pub root: String,
}

fn default_namespace_root() -> String {
    "/ugc".to_string()
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            root: default_namespace_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_format_version")]
    pub min_format_version: u32,

    #[serde(default = "default_format_version")]
    pub max_format_version: u32,

    /// Semver requirement the archive's engine version must meet (e.g. "~5.3")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_requirement: Option<String>,

    /// Platform tag archives must support; empty accepts any platform
    #[serde(default = "detect_platform")]
    pub platform: String,

    #[serde(default = "default_verify_checksums")]
    pub verify_checksums: bool,
}

fn default_format_version() -> u32 {
    crate::archive::CURRENT_FORMAT_VERSION
}

fn default_verify_checksums() -> bool {
    true
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_format_version: default_format_version(),
            max_format_version: default_format_version(),
            engine_requirement: None,
            platform: detect_platform(),
            verify_checksums: default_verify_checksums(),
        }
    }
}

/// Step timeouts in seconds; 0 disables the timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_validate_secs")]
    pub validate_secs: u64,

    #[serde(default = "default_mount_secs")]
    pub mount_secs: u64,

    #[serde(default = "default_index_secs")]
    pub index_secs: u64,
}

fn default_validate_secs() -> u64 {
    60
}

fn default_mount_secs() -> u64 {
    300
}

fn default_index_secs() -> u64 {
    30
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            validate_secs: default_validate_secs(),
            mount_secs: default_mount_secs(),
            index_secs: default_index_secs(),
        }
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

impl TimeoutConfig {
    pub fn validate(&self) -> Option<Duration> {
        secs(self.validate_secs)
    }

    pub fn mount(&self) -> Option<Duration> {
        secs(self.mount_secs)
    }

    pub fn index(&self) -> Option<Duration> {
        secs(self.index_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountConfig {
    /// Directory the extracting mounter writes into (default `~/.ugcmount/mounts`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Mount state file (default `~/.ugcmount/state.toml`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SideloadConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Config {
    /// Directory holding the config file, state file and default mount root
    ///
    /// Uses UGCMOUNT_CONFIG_DIR if set, otherwise ~/.ugcmount
    pub fn config_dir() -> Result<PathBuf> {
        // Check for custom config directory (useful for testing)
        if let Ok(config_dir) = std::env::var("UGCMOUNT_CONFIG_DIR") {
            return Ok(PathBuf::from(config_dir));
        }

        let home = dirs::home_dir()
            .ok_or_else(|| Error::Other("Could not find home directory".to_string()))?;

        Ok(home.join(".ugcmount"))
    }

    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from the default path, or defaults if it doesn't exist
    ///
    /// Environment variable overrides:
    /// - `UGCMOUNT_CONFIG_DIR`: Overrides the config directory location
    /// - `UGCMOUNT_MOUNT_ROOT`: Overrides `mount.root`
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(Self::default_path()?)?;

        if let Ok(root) = std::env::var("UGCMOUNT_MOUNT_ROOT") {
            if !root.is_empty() {
                config.mount.root = Some(PathBuf::from(root));
            }
        }

        Ok(config)
    }

    /// Load config from an explicit path; a missing file yields defaults
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save config to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(Self::default_path()?)
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Directory the extracting mounter uses
    pub fn mount_root(&self) -> Result<PathBuf> {
        match &self.mount.root {
            Some(root) => Ok(root.clone()),
            None => Ok(Self::config_dir()?.join("mounts")),
        }
    }

    pub fn state_file(&self) -> Result<PathBuf> {
        match &self.mount.state_file {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("state.toml")),
        }
    }

    /// Read a value by dotted key, as shown by `ugcmount config get`
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "namespace.root" => self.namespace.root.clone(),
            "validation.min_format_version" => self.validation.min_format_version.to_string(),
            "validation.max_format_version" => self.validation.max_format_version.to_string(),
            "validation.engine_requirement" => {
                self.validation.engine_requirement.clone().unwrap_or_default()
            }
            "validation.platform" => self.validation.platform.clone(),
            "validation.verify_checksums" => self.validation.verify_checksums.to_string(),
            "timeouts.validate_secs" => self.timeouts.validate_secs.to_string(),
            "timeouts.mount_secs" => self.timeouts.mount_secs.to_string(),
            "timeouts.index_secs" => self.timeouts.index_secs.to_string(),
            "mount.root" => self.mount_root()?.display().to_string(),
            "mount.state_file" => self.state_file()?.display().to_string(),
            "sideload.directory" => self
                .sideload
                .directory
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_default(),
            _ => return Err(unknown_key(key)),
        };
        Ok(value)
    }

    /// Set a value by dotted key; an empty value clears optional keys
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let optional_path = |value: &str| (!value.is_empty()).then(|| PathBuf::from(value));

        match key {
            "namespace.root" => {
                // Reject roots the allocator would refuse
                crate::NamespaceAllocator::new(value)?;
                self.namespace.root = value.to_string();
            }
            "validation.min_format_version" => {
                self.validation.min_format_version = parse_value(key, value)?
            }
            "validation.max_format_version" => {
                self.validation.max_format_version = parse_value(key, value)?
            }
            "validation.engine_requirement" => {
                if value.is_empty() {
                    self.validation.engine_requirement = None;
                } else {
                    semver::VersionReq::parse(value)?;
                    self.validation.engine_requirement = Some(value.to_string());
                }
            }
            "validation.platform" => self.validation.platform = value.to_string(),
            "validation.verify_checksums" => {
                self.validation.verify_checksums = parse_value(key, value)?
            }
            "timeouts.validate_secs" => self.timeouts.validate_secs = parse_value(key, value)?,
            "timeouts.mount_secs" => self.timeouts.mount_secs = parse_value(key, value)?,
            "timeouts.index_secs" => self.timeouts.index_secs = parse_value(key, value)?,
            "mount.root" => self.mount.root = optional_path(value),
            "mount.state_file" => self.mount.state_file = optional_path(value),
            "sideload.directory" => self.sideload.directory = optional_path(value),
            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }
}

/// Keys accepted by [`Config::get`] and [`Config::set`]
pub const CONFIG_KEYS: &[&str] = &[
    "namespace.root",
    "validation.min_format_version",
    "validation.max_format_version",
    "validation.engine_requirement",
    "validation.platform",
    "validation.verify_checksums",
    "timeouts.validate_secs",
    "timeouts.mount_secs",
    "timeouts.index_secs",
    "mount.root",
    "mount.state_file",
    "sideload.directory",
];

fn unknown_key(key: &str) -> Error {
    Error::Other(format!(
        "Unknown config key '{}'\n\nValid keys:\n  {}",
        key,
        CONFIG_KEYS.join("\n  ")
    ))
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Other(format!("Invalid value '{}' for '{}'", value, key)))
}
