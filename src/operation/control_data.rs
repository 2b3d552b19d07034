use std::fmt;

use serde::Serialize;

use crate::model::YLink;
use crate::operation::{OperationSnapshot, Session};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ControlDataStatus {
    None,
    Scanning,
    Discovered,
    VerifyingUpdate,
    UpdateVerifyFailed,
    UpdateVerified,
    Connected,
    Updating,
    WriteComplete,
    UpToDate,
    UpdateFailed,
    UnknownDisconnect,
}

impl ControlDataStatus {
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            ControlDataStatus::VerifyingUpdate
                | ControlDataStatus::UpdateVerified
                | ControlDataStatus::Connected
                | ControlDataStatus::Updating
                | ControlDataStatus::WriteComplete
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ControlDataStatus::UpToDate | ControlDataStatus::UpdateFailed
        )
    }

    pub fn is_busy(self) -> bool {
        matches!(
            self,
            ControlDataStatus::VerifyingUpdate
                | ControlDataStatus::Connected
                | ControlDataStatus::Updating
                | ControlDataStatus::WriteComplete
        )
    }
}

impl fmt::Display for ControlDataStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ControlDataStatus::None => "Not started",
            ControlDataStatus::Scanning => "Scanning",
            ControlDataStatus::Discovered => "Discovered",
            ControlDataStatus::VerifyingUpdate => "Verifying update",
            ControlDataStatus::UpdateVerifyFailed => "No update needed",
            ControlDataStatus::UpdateVerified => "Update verified",
            ControlDataStatus::Connected => "Connected",
            ControlDataStatus::Updating => "Updating",
            ControlDataStatus::WriteComplete => "Control data written",
            ControlDataStatus::UpToDate => "Up to date",
            ControlDataStatus::UpdateFailed => "Update failed",
            ControlDataStatus::UnknownDisconnect => "Disconnected",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ControlDataDisconnectReason {
    InactivityTimeout = 0x0C,
    Superseded = 0x0E,
    WrongSize = 0x0F,
    FailedCrc = 0x10,
    UnsupportedMessageVersion = 0x11,
}

impl ControlDataDisconnectReason {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x0C => Some(ControlDataDisconnectReason::InactivityTimeout),
            0x0E => Some(ControlDataDisconnectReason::Superseded),
            0x0F => Some(ControlDataDisconnectReason::WrongSize),
            0x10 => Some(ControlDataDisconnectReason::FailedCrc),
            0x11 => Some(ControlDataDisconnectReason::UnsupportedMessageVersion),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Which acknowledgements and markers of the three-phase upload have been
/// seen so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UploadPhase {
    pub acked_update_request: bool,
    pub acked_card_key_groups: bool,
    pub acked_cancelled_staff_cards: bool,
    pub wrote_card_key_groups_complete: bool,
    pub wrote_cancelled_staff_cards_complete: bool,
}

#[derive(Debug)]
pub struct ControlDataOperation {
    pub ylink: YLink,
    pub status: ControlDataStatus,
    pub session: Session,
    pub last_disconnect_reason: Option<ControlDataDisconnectReason>,
    pub phase: UploadPhase,
    pub card_key_groups_offset: usize,
    pub cancelled_staff_cards_offset: usize,
}

impl ControlDataOperation {
    pub fn new(ylink: YLink) -> Self {
        ControlDataOperation {
            ylink,
            status: ControlDataStatus::None,
            session: Session::default(),
            last_disconnect_reason: None,
            phase: UploadPhase::default(),
            card_key_groups_offset: 0,
            cancelled_staff_cards_offset: 0,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status.is_in_progress()
    }

    pub fn restart(&mut self) {
        self.session.restart();
        self.last_disconnect_reason = None;
        self.phase = UploadPhase::default();
        self.card_key_groups_offset = 0;
        self.cancelled_staff_cards_offset = 0;
    }

    pub fn snapshot(&self) -> OperationSnapshot<ControlDataStatus> {
        OperationSnapshot::new(
            &self.ylink,
            &self.session,
            self.status,
            self.last_disconnect_reason
                .map(ControlDataDisconnectReason::code),
        )
    }
}
