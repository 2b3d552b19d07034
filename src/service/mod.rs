//! The two update flows and what they share.
//!
//! Services never touch the radio's event channel. The updater loop hands
//! each event to the service that owns the peripheral, together with a
//! [`Context`] holding the radio, the backend and the timers.

pub mod control_data;
pub mod ota;

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use data_encoding::HEXUPPER_PERMISSIVE;
use log::{debug, error, trace, warn};
use tokio::sync::mpsc::UnboundedSender;

use crate::api::backend::{Backend, DownloadProgress};
use crate::api::central::CentralManager;
use crate::config::{UpdateMode, UpdaterConfig};
use crate::events::UpdateEvent;
use crate::model::{MacAddress, YLink};
use crate::operation::{ControlDataStatus, LinkState, OtaStatus, Session};
use crate::scheduler::{Flow, Scheduler, TimerKey};
use crate::{Error, Result};

pub use control_data::ControlDataService;
pub use ota::OtaService;

/// Work finished off the updater loop, posted back so state only changes
/// on the loop.
#[derive(Debug)]
pub(crate) enum Inbound {
    Timer {
        key: TimerKey,
        generation: u64,
    },
    OtaVerified {
        address: MacAddress,
        prior: OtaStatus,
        result: Result<YLink>,
    },
    ControlDataVerified {
        address: MacAddress,
        prior: ControlDataStatus,
        result: Result<YLink>,
    },
    FirmwareProgress {
        address: MacAddress,
        progress: DownloadProgress,
    },
    FirmwareDownloaded {
        address: MacAddress,
        result: Result<Bytes>,
    },
    UpdatesFetched {
        ota: Result<Vec<YLink>>,
        control_data: Result<Vec<YLink>>,
    },
}

pub(crate) struct Context {
    pub central: Arc<dyn CentralManager>,
    pub backend: Arc<dyn Backend>,
    pub events: UnboundedSender<UpdateEvent>,
    pub inbound: UnboundedSender<Inbound>,
    pub scheduler: Scheduler,
    pub config: UpdaterConfig,
    pub mode: UpdateMode,
    pub hotel_id: u64,
    /// Set by services, consumed by the updater once the current message
    /// has been handled.
    pub rescan_requested: bool,
}

impl Context {
    pub fn emit(&self, event: impl Into<UpdateEvent>) {
        if self.events.send(event.into()).is_err() {
            trace!("No observer for update events");
        }
    }

    pub fn request_rescan(&mut self) {
        self.rescan_requested = true;
    }

    /// Fire-and-forget backend call. Failures are logged, never retried.
    pub fn report<F>(&self, what: &'static str, room: String, call: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            match call.await {
                Ok(()) => debug!("[{room}] Reported {what}"),
                Err(e) => error!("[{room}] Failed to report {what}: {e}"),
            }
        });
    }

    /// Writes `frame` to the session's write characteristic using the write
    /// type the characteristic prefers. Returns false when nothing was sent.
    pub async fn write_frame(&self, session: &Session, frame: &[u8], room: &str) -> bool {
        let (Some(peripheral), Some(characteristic)) =
            (&session.peripheral, &session.write_characteristic)
        else {
            error!("[{room}] No write characteristic, dropping {} byte frame", frame.len());
            return false;
        };
        let Some(write_type) = characteristic.preferred_write_type() else {
            error!("[{room}] Write characteristic is not writable, skipping");
            return false;
        };
        match self.central.write(peripheral, characteristic, frame, write_type).await {
            Ok(()) => true,
            Err(e) => {
                warn!("[{room}] Write failed: {e}");
                false
            }
        }
    }

    /// Marks the session ended, drops its timers and closes its link.
    pub async fn end_session(&mut self, flow: Flow, address: MacAddress, session: &mut Session) {
        session.end();
        self.scheduler.cancel_operation(flow, address);
        if session.link != LinkState::Idle {
            if let Some(peripheral) = &session.peripheral {
                if let Err(e) = self.central.disconnect(peripheral).await {
                    warn!("Failed to disconnect {peripheral}: {e}");
                }
            }
        }
    }
}

/// Outcome of counting one sighting against the range gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Sighting {
    OutOfRange,
    Counting,
    Confirmed,
}

pub(crate) fn count_sighting(session: &mut Session, rssi: i16, config: &UpdaterConfig) -> Sighting {
    session.rssi = Some(rssi);
    if !config.in_range(rssi) {
        session.sightings = 0;
        return Sighting::OutOfRange;
    }
    session.sightings += 1;
    if session.sightings < config.sightings_required {
        return Sighting::Counting;
    }
    session.sightings = 0;
    Sighting::Confirmed
}

/// Decodes a hex blob handed out by the backend.
pub(crate) fn decode_blob(hex: Option<&str>, field: &'static str) -> Result<Vec<u8>> {
    let hex = hex.ok_or(Error::MissingField(field))?;
    Ok(HEXUPPER_PERMISSIVE.decode(hex.as_bytes())?)
}
