use std::{net::SocketAddr, path::Path, time::Duration};

use anyhow::{bail, Context, Error};
use log::info;
use serde::{Deserialize, Serialize};

use crate::{attach::DEFAULT_MAX_RETRY, ble::DEFAULT_DEVICE_NAME, probe::DEFAULT_PROBE_HOST};

pub const MAX_AP_CONNECTIONS: u8 = 10;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Consecutive attach failures before local configuration opens
    pub max_retry: u8,
    pub registry_capacity: usize,
    pub provisioning_window_secs: u64,
    pub restart_grace_ms: u64,
    pub probe_host: String,
    pub portal: PortalConfig,
    pub access_point: AccessPointConfig,
    pub ble: BleConfig,
    pub storage: StorageConfig,
    pub link: LinkConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PortalConfig {
    pub bind: SocketAddr,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AccessPointConfig {
    pub ssid: String,
    /// Empty means an open access point
    pub passphrase: String,
    /// Size of the DHCP pool handed out on the access point
    pub max_connections: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BleConfig {
    pub enabled: bool,
    pub device_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    /// Station interface
    pub interface: String,
    /// Interface the access point runs on. When it is the station interface,
    /// station attempts wait until local configuration closes.
    pub ap_interface: String,
}

impl LinkConfig {
    pub fn shares_radio(&self) -> bool {
        self.interface == self.ap_interface
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
            registry_capacity: crate::registry::DEFAULT_CAPACITY,
            provisioning_window_secs: 300,
            restart_grace_ms: 2000,
            probe_host: DEFAULT_PROBE_HOST.to_string(),
            portal: PortalConfig::default(),
            access_point: AccessPointConfig::default(),
            ble: BleConfig::default(),
            storage: StorageConfig::default(),
            link: LinkConfig::default(),
        }
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 80)),
        }
    }
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            ssid: "ESP32_Config_Node".to_string(),
            passphrase: "12345678".to_string(),
            max_connections: 4,
        }
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "credentials.json".to_string(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            ap_interface: "wlan0".to_string(),
        }
    }
}

impl Config {
    /// Read a RON config. A missing file gives the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, Error> {
        let path = path.as_ref();
        if !path.exists() {
            info!("config: {} not found, using defaults", path.display());
            return Ok(Config::default());
        }

        let config = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            ron::from_str(&config).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_retry == 0 {
            bail!("max_retry must be at least 1");
        }
        if self.provisioning_window_secs == 0 {
            bail!("provisioning_window_secs must be at least 1");
        }
        // Channels plus the radio action
        if self.registry_capacity < 3 {
            bail!("registry_capacity must be at least 3");
        }

        let ap = &self.access_point;
        if ap.ssid.is_empty() || ap.ssid.len() > 32 {
            bail!("access_point.ssid must be 1 to 32 bytes");
        }
        if !ap.passphrase.is_empty() && !(8..=63).contains(&ap.passphrase.len()) {
            bail!("access_point.passphrase must be empty or 8 to 63 bytes");
        }
        if !(1..=MAX_AP_CONNECTIONS).contains(&ap.max_connections) {
            bail!(
                "access_point.max_connections must be 1 to {}",
                MAX_AP_CONNECTIONS
            );
        }
        if self.link.interface.is_empty() || self.link.ap_interface.is_empty() {
            bail!("link interfaces must not be empty");
        }
        Ok(())
    }

    pub fn provisioning_window(&self) -> Duration {
        Duration::from_secs(self.provisioning_window_secs)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }
}
