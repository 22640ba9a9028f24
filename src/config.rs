use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::ble_common::{
    FIRMWARE_VERSION_CHAR_UUID, OTA_COMMAND_CHAR_UUID, OTA_DATA_CHAR_UUID, OTA_SERVICE_UUID,
};
use crate::error::{OtaError, OtaResult};
use crate::framer::{FrameLayout, SectorAddressing, DEFAULT_CHUNK_SIZE, DEFAULT_SECTOR_SIZE};

/// Top-level configuration, read from `config.toml`.
/// Every table and field is optional; missing values take their defaults.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct OtaConfig {
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub gatt: GattConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    #[serde(default = "default_sector_size")]
    pub sector_size: usize,
    /// Requested payload bytes per frame; the link's negotiated maximum
    /// can lower it at send time.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub addressing: SectorAddressing,
    /// Reject acks that are not complete 20-byte packets with a valid CRC.
    #[serde(default = "default_true")]
    pub verify_ack_crc: bool,
}

/// Per-phase deadlines in milliseconds. 0 disables a deadline.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    /// Covers service and characteristic discovery together.
    #[serde(default = "default_discovery_ms")]
    pub discovery_ms: u64,
    /// Wait for the device's answer to START or END.
    #[serde(default = "default_ack_ms")]
    pub ack_ms: u64,
    /// Wait for one frame write to complete.
    #[serde(default = "default_write_ms")]
    pub write_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GattConfig {
    #[serde(default = "default_service_uuid")]
    pub service: Uuid,
    #[serde(default = "default_data_char_uuid")]
    pub data_char: Uuid,
    #[serde(default = "default_command_char_uuid")]
    pub command_char: Uuid,
    #[serde(default = "default_firmware_version_char_uuid")]
    pub firmware_version_char: Uuid,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Only list peripherals advertising this service. `None` lists all
    /// named peripherals.
    #[serde(default)]
    pub service_filter: Option<Uuid>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// ATT MTU assumed for the link. The OS negotiates it and most desktop
    /// stacks do not report the result, so it is configured.
    #[serde(default = "default_att_mtu")]
    pub att_mtu: usize,
    /// How often the connection watchdog polls the link.
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
}

fn default_sector_size() -> usize {
    DEFAULT_SECTOR_SIZE
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_true() -> bool {
    true
}
fn default_connect_ms() -> u64 {
    15_000
}
fn default_discovery_ms() -> u64 {
    10_000
}
fn default_ack_ms() -> u64 {
    5_000
}
fn default_write_ms() -> u64 {
    5_000
}
fn default_service_uuid() -> Uuid {
    OTA_SERVICE_UUID
}
fn default_data_char_uuid() -> Uuid {
    OTA_DATA_CHAR_UUID
}
fn default_command_char_uuid() -> Uuid {
    OTA_COMMAND_CHAR_UUID
}
fn default_firmware_version_char_uuid() -> Uuid {
    FIRMWARE_VERSION_CHAR_UUID
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_att_mtu() -> usize {
    517
}
fn default_watchdog_interval_ms() -> u64 {
    2_000
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            sector_size: default_sector_size(),
            chunk_size: default_chunk_size(),
            addressing: SectorAddressing::default(),
            verify_ack_crc: default_true(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            discovery_ms: default_discovery_ms(),
            ack_ms: default_ack_ms(),
            write_ms: default_write_ms(),
        }
    }
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            service: default_service_uuid(),
            data_char: default_data_char_uuid(),
            command_char: default_command_char_uuid(),
            firmware_version_char: default_firmware_version_char_uuid(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            service_filter: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            att_mtu: default_att_mtu(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl TimeoutConfig {
    pub fn connect(&self) -> Option<Duration> {
        millis(self.connect_ms)
    }
    pub fn discovery(&self) -> Option<Duration> {
        millis(self.discovery_ms)
    }
    pub fn ack(&self) -> Option<Duration> {
        millis(self.ack_ms)
    }
    pub fn write(&self) -> Option<Duration> {
        millis(self.write_ms)
    }
}

impl OtaConfig {
    /// `<config dir>/ble-ota/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ble-ota").join("config.toml"))
    }

    pub fn from_toml_str(content: &str) -> OtaResult<Self> {
        let config: OtaConfig = toml::from_str(content)
            .map_err(|e| OtaError::Config(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> OtaResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OtaError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Load `path` when given, else the default location if it exists,
    /// else the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> OtaResult<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> OtaResult<()> {
        self.layout(self.transfer.chunk_size).map(|_| ())
    }

    /// Frame layout for a given effective chunk size.
    pub fn layout(&self, chunk_size: usize) -> OtaResult<FrameLayout> {
        FrameLayout::new(
            self.transfer.sector_size,
            chunk_size,
            self.transfer.addressing,
        )
    }

    pub fn to_toml_string(&self) -> OtaResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| OtaError::Config(format!("Failed to serialise config: {}", e)))
    }
}
