use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Whether verified updates start on their own or wait for an operator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    Manual,
    #[default]
    Automatic,
}

/// Tunables of the update engine. Every field has a default, so an empty
/// JSON object is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub mode: UpdateMode,
    /// Sightings at or weaker than this (in magnitude) are out of range.
    pub rssi_threshold: i16,
    /// Consecutive in-range sightings before a device counts as discovered.
    pub sightings_required: u32,
    /// Per service, how many sessions may be in progress in automatic mode.
    pub max_concurrent_updates: usize,
    pub firmware_packet_size: usize,
    pub firmware_packet_interval_ms: u64,
    pub upload_complete_delay_ms: u64,
    pub removal_grace_ms: u64,
    pub control_data_chunk_size: usize,
    pub firmware_cache_dir: PathBuf,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        UpdaterConfig {
            mode: UpdateMode::Automatic,
            rssi_threshold: -75,
            sightings_required: 2,
            max_concurrent_updates: 3,
            firmware_packet_size: 14,
            firmware_packet_interval_ms: 8,
            upload_complete_delay_ms: 1000,
            removal_grace_ms: 3000,
            control_data_chunk_size: 255,
            firmware_cache_dir: std::env::temp_dir().join("ylink-firmware"),
        }
    }
}

impl UpdaterConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: UpdaterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=255).contains(&self.firmware_packet_size) {
            return Err(Error::Config(format!(
                "firmware_packet_size must be within 1..=255, got {}",
                self.firmware_packet_size
            )));
        }
        if !(1..=255).contains(&self.control_data_chunk_size) {
            return Err(Error::Config(format!(
                "control_data_chunk_size must be within 1..=255, got {}",
                self.control_data_chunk_size
            )));
        }
        if self.max_concurrent_updates == 0 {
            return Err(Error::Config("max_concurrent_updates must be at least 1".into()));
        }
        if self.sightings_required == 0 {
            return Err(Error::Config("sightings_required must be at least 1".into()));
        }
        if self.firmware_packet_interval_ms == 0 {
            return Err(Error::Config("firmware_packet_interval_ms must be non-zero".into()));
        }
        Ok(())
    }

    /// True when a sighting is close enough to count.
    pub fn in_range(&self, rssi: i16) -> bool {
        rssi.unsigned_abs() < self.rssi_threshold.unsigned_abs()
    }

    pub fn firmware_packet_interval(&self) -> Duration {
        Duration::from_millis(self.firmware_packet_interval_ms)
    }

    pub fn upload_complete_delay(&self) -> Duration {
        Duration::from_millis(self.upload_complete_delay_ms)
    }

    pub fn removal_grace(&self) -> Duration {
        Duration::from_millis(self.removal_grace_ms)
    }
}
