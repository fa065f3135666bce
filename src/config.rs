//! Configuration management for the radio service.
//!
//! This module handles loading the configuration file from disk, including
//! scan settings, session teardown policy and known devices.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::platform::{CallbackType, ScanMode, ScanSettings},
   error::{RadioError, Result},
   event::DEFAULT_EVENT_CAPACITY,
};

/// What happens to callbacks that arrive while `disconnect_all` tears
/// sessions down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
   /// Callback bindings are cleared up front; late events are dropped.
   #[default]
   Discard,
   /// Late events are held and flushed once the disconnect is confirmed.
   Buffer,
}

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
   /// Adapter name such as `hci0`; the default adapter when unset.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<String>,

   #[serde(default = "default_event_capacity")]
   pub event_capacity: usize,

   #[serde(default)]
   pub teardown_policy: TeardownPolicy,

   #[serde(default)]
   pub scan: ScanConfig,

   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,
}

/// Scan related settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ScanConfig {
   #[serde(default)]
   pub mode: ScanMode,

   #[serde(default)]
   pub callback_type: CallbackType,

   /// Update name and RSSI of known devices on every sighting.
   #[serde(default)]
   pub refresh_registry: bool,

   #[serde(default = "default_scan_on_start")]
   pub scan_on_start: bool,
}

/// A device the daemon connects to as soon as it is discovered.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

const fn default_event_capacity() -> usize {
   DEFAULT_EVENT_CAPACITY
}

const fn default_scan_on_start() -> bool {
   true
}

impl Default for ScanConfig {
   fn default() -> Self {
      Self {
         mode: ScanMode::default(),
         callback_type: CallbackType::default(),
         refresh_registry: false,
         scan_on_start: default_scan_on_start(),
      }
   }
}

impl ScanConfig {
   pub const fn settings(&self) -> ScanSettings {
      ScanSettings {
         mode: self.mode,
         callback_type: self.callback_type,
      }
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         event_capacity: default_event_capacity(),
         teardown_policy: TeardownPolicy::default(),
         scan: ScanConfig::default(),
         known_devices: vec![],
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BLELINK_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(RadioError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("blelink").join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address.eq_ignore_ascii_case(address))
         .map(|d| d.name.as_str())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_empty_file_yields_defaults() {
      let config: Config = toml::from_str("").expect("empty config");
      assert_eq!(config, Config::default());
      assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
      assert_eq!(config.teardown_policy, TeardownPolicy::Discard);
      assert_eq!(config.scan.mode, ScanMode::LowLatency);
      assert_eq!(config.scan.callback_type, CallbackType::AllMatches);
      assert!(config.scan.scan_on_start);
      assert!(!config.scan.refresh_registry);
   }

   #[test]
   fn test_parse_full_config() {
      let config: Config = toml::from_str(
         r#"
            adapter = "hci1"
            event_capacity = 32
            teardown_policy = "buffer"

            [scan]
            mode = "balanced"
            callback_type = "first_match"
            refresh_registry = true
            scan_on_start = false

            [[known_devices]]
            address = "AA:BB:CC:DD:EE:FF"
            name = "Sensor"
         "#,
      )
      .expect("valid config");

      assert_eq!(config.adapter.as_deref(), Some("hci1"));
      assert_eq!(config.event_capacity, 32);
      assert_eq!(config.teardown_policy, TeardownPolicy::Buffer);
      assert_eq!(config.scan.settings(), ScanSettings {
         mode: ScanMode::Balanced,
         callback_type: CallbackType::FirstMatch,
      });
      assert!(config.scan.refresh_registry);
      assert!(!config.scan.scan_on_start);
      assert_eq!(config.is_known_device("aa:bb:cc:dd:ee:ff"), Some("Sensor"));
      assert_eq!(config.is_known_device("11:22:33:44:55:66"), None);
   }

   #[test]
   fn test_unknown_scan_mode_is_rejected() {
      let result: std::result::Result<Config, _> = toml::from_str("[scan]\nmode = \"turbo\"\n");
      assert!(result.is_err());
   }

   #[test]
   fn test_load_creates_default_file() {
      let dir = tempfile::tempdir().expect("tempdir");
      let path = dir.path().join("blelink").join("config.toml");

      let config = Config::load_from(&path).expect("load");
      assert_eq!(config, Config::default());
      assert!(path.exists());

      let mut edited = config.clone();
      edited.teardown_policy = TeardownPolicy::Buffer;
      edited.known_devices.push(KnownDevice {
         address: "AA:BB".into(),
         name: "Sensor".into(),
      });
      edited.save_to(&path).expect("save");

      assert_eq!(Config::load_from(&path).expect("reload"), edited);
   }
}
