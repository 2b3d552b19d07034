//! What observers of the updater get told.

use crate::api::backend::DownloadProgress;
use crate::operation::{ControlDataStatus, OperationSnapshot, OtaStatus};

pub type OtaSnapshot = OperationSnapshot<OtaStatus>;
pub type ControlDataSnapshot = OperationSnapshot<ControlDataStatus>;

#[derive(Clone, Debug, PartialEq)]
pub enum UpdateEvent {
    Ota(OtaEvent),
    ControlData(ControlDataEvent),
}

/// Bytes of a transfer written so far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteProgress {
    pub bytes_written: u64,
    pub total_bytes_written: u64,
    pub total_bytes_expected: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OtaEvent {
    /// The whole active list, after it was rebuilt.
    FoundUpdates(Vec<OtaSnapshot>),
    StartedScanning(Vec<OtaSnapshot>),
    SignalStrength { operation: OtaSnapshot, rssi: i16 },
    Discovered(OtaSnapshot),
    Verifying(OtaSnapshot),
    VerifyFailed {
        operation: OtaSnapshot,
        error: Option<String>,
    },
    VerifyPassed(OtaSnapshot),
    DownloadingFirmware {
        operation: OtaSnapshot,
        progress: DownloadProgress,
    },
    FirmwareDownloadFailed { operation: OtaSnapshot, error: String },
    FirmwareDownloadComplete(OtaSnapshot),
    Connected(OtaSnapshot),
    UpdateStarted(OtaSnapshot),
    WriteProgress {
        operation: OtaSnapshot,
        progress: WriteProgress,
    },
    WriteFailed(OtaSnapshot),
    WriteComplete(OtaSnapshot),
    Validating(OtaSnapshot),
    UpdateConfirmed(OtaSnapshot),
    UpdateFailed(OtaSnapshot),
    Disconnected(OtaSnapshot),
    Removed(OtaSnapshot),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ControlDataEvent {
    FoundUpdates(Vec<ControlDataSnapshot>),
    StartedScanning(Vec<ControlDataSnapshot>),
    SignalStrength {
        operation: ControlDataSnapshot,
        rssi: i16,
    },
    Discovered(ControlDataSnapshot),
    Verifying(ControlDataSnapshot),
    VerifyFailed {
        operation: ControlDataSnapshot,
        error: Option<String>,
    },
    VerifyPassed(ControlDataSnapshot),
    Connected(ControlDataSnapshot),
    UpdateStarted(ControlDataSnapshot),
    WriteProgress {
        operation: ControlDataSnapshot,
        progress: WriteProgress,
    },
    WriteComplete(ControlDataSnapshot),
    UpToDate(ControlDataSnapshot),
    UpdateFailed(ControlDataSnapshot),
    Disconnected(ControlDataSnapshot),
    Removed(ControlDataSnapshot),
}

/// Both active lists at one instant.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdaterSnapshot {
    pub ota: Vec<OtaSnapshot>,
    pub control_data: Vec<ControlDataSnapshot>,
}

impl From<OtaEvent> for UpdateEvent {
    fn from(event: OtaEvent) -> Self {
        UpdateEvent::Ota(event)
    }
}

impl From<ControlDataEvent> for UpdateEvent {
    fn from(event: ControlDataEvent) -> Self {
        UpdateEvent::ControlData(event)
    }
}
