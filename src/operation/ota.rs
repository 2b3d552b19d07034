use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;

use crate::api::characteristic::Characteristic;
use crate::model::YLink;
use crate::operation::{OperationSnapshot, Session};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum OtaStatus {
    None,
    Scanning,
    Discovered,
    VerifyingUpdate,
    UpdateVerifyFailed,
    UpdateVerified,
    DownloadingFirmware,
    FirmwareDownloadFailed,
    FirmwareDownloadComplete,
    /// Firmware downloaded and link open.
    Connected,
    /// Lock asked for packets.
    Updating,
    /// Lock rejected the image or timed out.
    FailedToWrite,
    /// Lock confirmed the upload and is rebooting.
    WriteComplete,
    /// Rebooted, waiting for the lock's confirmation.
    ValidatingUpdate,
    /// New firmware failed to boot.
    UpdateFailed,
    UpToDate,
    /// Link dropped without a reason from the lock.
    UnknownDisconnect,
}

impl OtaStatus {
    /// Counts against the concurrency cap.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            OtaStatus::VerifyingUpdate
                | OtaStatus::UpdateVerified
                | OtaStatus::DownloadingFirmware
                | OtaStatus::FirmwareDownloadComplete
                | OtaStatus::Connected
                | OtaStatus::Updating
                | OtaStatus::WriteComplete
                | OtaStatus::ValidatingUpdate
        )
    }

    /// Discovery no longer changes the status.
    pub fn is_terminal(self) -> bool {
        matches!(self, OtaStatus::UpToDate | OtaStatus::UpdateFailed)
    }

    /// Mid-exchange with the backend or the lock. Sightings are recorded but
    /// do not re-run discovery.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            OtaStatus::VerifyingUpdate
                | OtaStatus::DownloadingFirmware
                | OtaStatus::FirmwareDownloadComplete
                | OtaStatus::Connected
                | OtaStatus::Updating
        )
    }
}

impl fmt::Display for OtaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OtaStatus::None => "Not started",
            OtaStatus::Scanning => "Scanning",
            OtaStatus::Discovered => "Discovered",
            OtaStatus::VerifyingUpdate => "Verifying update",
            OtaStatus::UpdateVerifyFailed => "No update needed",
            OtaStatus::UpdateVerified => "Update verified",
            OtaStatus::DownloadingFirmware => "Downloading firmware",
            OtaStatus::FirmwareDownloadFailed => "Firmware download failed",
            OtaStatus::FirmwareDownloadComplete => "Firmware downloaded",
            OtaStatus::Connected => "Connected",
            OtaStatus::Updating => "Updating",
            OtaStatus::FailedToWrite => "Failed to write firmware",
            OtaStatus::WriteComplete => "Firmware written, rebooting",
            OtaStatus::ValidatingUpdate => "Validating update",
            OtaStatus::UpdateFailed => "Update failed",
            OtaStatus::UpToDate => "Up to date",
            OtaStatus::UnknownDisconnect => "Disconnected",
        };
        f.write_str(text)
    }
}

/// Reason codes a lock sends in a disconnect frame during a firmware update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum OtaDisconnectReason {
    FirmwareTooSmall = 0x08,
    FirmwareTooBig = 0x09,
    FirmwareFailedCrc = 0x0A,
    FirmwareUploadConfirmed = 0x0B,
    InactivityTimeout = 0x0C,
    FirmwareFailedToBoot = 0x0D,
}

impl OtaDisconnectReason {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x08 => Some(OtaDisconnectReason::FirmwareTooSmall),
            0x09 => Some(OtaDisconnectReason::FirmwareTooBig),
            0x0A => Some(OtaDisconnectReason::FirmwareFailedCrc),
            0x0B => Some(OtaDisconnectReason::FirmwareUploadConfirmed),
            0x0C => Some(OtaDisconnectReason::InactivityTimeout),
            0x0D => Some(OtaDisconnectReason::FirmwareFailedToBoot),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug)]
pub struct OtaOperation {
    pub ylink: YLink,
    pub status: OtaStatus,
    pub session: Session,
    pub last_disconnect_reason: Option<OtaDisconnectReason>,
    pub ota_characteristic: Option<Characteristic>,
    pub firmware: Option<Bytes>,
    /// Next byte of `firmware` to send.
    pub offset: usize,
    pub transfer_start: Option<Instant>,
    pub transfer_end: Option<Instant>,
}

impl OtaOperation {
    pub fn new(ylink: YLink) -> Self {
        OtaOperation {
            ylink,
            status: OtaStatus::None,
            session: Session::default(),
            last_disconnect_reason: None,
            ota_characteristic: None,
            firmware: None,
            offset: 0,
            transfer_start: None,
            transfer_end: None,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status.is_in_progress()
    }

    pub fn restart(&mut self) {
        self.session.restart();
        self.last_disconnect_reason = None;
        self.offset = 0;
        self.transfer_start = None;
        self.transfer_end = None;
    }

    pub fn transfer_time(&self) -> Option<Duration> {
        Some(self.transfer_end?.duration_since(self.transfer_start?))
    }

    pub fn firmware_len(&self) -> usize {
        self.firmware.as_ref().map_or(0, Bytes::len)
    }

    pub fn snapshot(&self) -> OperationSnapshot<OtaStatus> {
        OperationSnapshot::new(
            &self.ylink,
            &self.session,
            self.status,
            self.last_disconnect_reason.map(OtaDisconnectReason::code),
        )
    }
}
