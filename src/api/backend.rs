use std::time::Duration;

use async_trait::async_trait;

use crate::Result;
use crate::model::YLink;

/// Byte counts reported while a firmware binary downloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    pub bytes_read: u64,
    pub total_bytes_read: u64,
    pub total_bytes_expected: Option<u64>,
}

/// The hotel's REST service: device inventory, firmware binaries and audit
/// reports. Implementations own transport, authentication and retries.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn ylinks_with_ota_updates(&self, hotel_id: u64) -> Result<Vec<YLink>>;

    async fn ylinks_with_control_data_updates(&self, hotel_id: u64) -> Result<Vec<YLink>>;

    /// Latest record of one yLink including its pending firmware, if any.
    async fn ota_update(&self, hotel_id: u64, ylink: &YLink) -> Result<YLink>;

    /// Latest record of one yLink including its pending control data, if any.
    async fn control_data_update(&self, hotel_id: u64, ylink: &YLink) -> Result<YLink>;

    async fn report_firmware_status(
        &self,
        hotel_id: u64,
        ylink: &YLink,
        code: u8,
        time_to_update: Option<Duration>,
    ) -> Result<()>;

    /// `hex` is the lock's full completion frame, lowercase hex.
    async fn report_firmware_update_complete(
        &self,
        hotel_id: u64,
        ylink: &YLink,
        hex: &str,
    ) -> Result<()>;

    async fn report_control_data_status(&self, hotel_id: u64, ylink: &YLink, code: u8)
    -> Result<()>;

    async fn report_control_data_update_complete(
        &self,
        hotel_id: u64,
        ylink: &YLink,
        hex: &str,
    ) -> Result<()>;

    async fn download_firmware(
        &self,
        url: &str,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<Vec<u8>>;
}
