//! Per-device update sessions.

pub mod control_data;
pub mod ota;

use serde::Serialize;
use tokio::time::Instant;

use crate::api::central::PeripheralId;
use crate::api::characteristic::Characteristic;
use crate::model::{MacAddress, YLink};

pub use control_data::{ControlDataDisconnectReason, ControlDataOperation, ControlDataStatus};
pub use ota::{OtaDisconnectReason, OtaOperation, OtaStatus};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Idle,
    Connecting,
    Connected,
}

/// Radio-facing state shared by both kinds of operation.
#[derive(Debug, Default)]
pub struct Session {
    pub rssi: Option<i16>,
    /// Consecutive in-range sightings.
    pub sightings: u32,
    pub start: Option<Instant>,
    pub end: Option<Instant>,
    /// From the latest sighting, cleared when the link drops.
    pub peripheral: Option<PeripheralId>,
    pub link: LinkState,
    pub user_requested: bool,
    pub progress: f32,
    /// First half of a two-read completion frame has arrived.
    pub awaiting_continuation: bool,
    pub write_characteristic: Option<Characteristic>,
}

impl Session {
    pub fn start(&mut self) {
        self.start = Some(Instant::now());
    }

    pub fn end(&mut self) {
        self.end = Some(Instant::now());
    }

    /// Clears transient progress so the operation can be tried again.
    pub fn restart(&mut self) {
        self.start = None;
        self.end = None;
        self.progress = 0.0;
        self.awaiting_continuation = false;
    }

    /// Tagged for a manual update that has not finished yet.
    pub fn requires_manual_update(&self) -> bool {
        self.end.is_none() && self.user_requested
    }
}

/// Point-in-time view of an operation handed to observers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperationSnapshot<S> {
    pub address: MacAddress,
    pub room_number: Option<String>,
    pub status: S,
    pub progress: f32,
    pub rssi: Option<i16>,
    pub last_disconnect_reason: Option<u8>,
}

impl<S> OperationSnapshot<S> {
    pub(crate) fn new(
        ylink: &YLink,
        session: &Session,
        status: S,
        last_disconnect_reason: Option<u8>,
    ) -> Self {
        OperationSnapshot {
            address: ylink.mac_address,
            room_number: ylink.room_number.clone(),
            status,
            progress: session.progress,
            rssi: session.rssi,
            last_disconnect_reason,
        }
    }
}
