//! RFID control-data updates: card key groups and cancelled staff cards.

use data_encoding::HEXLOWER;
use log::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::api::central::PeripheralId;
use crate::api::central_event::DisconnectCause;
use crate::api::characteristic::Characteristic;
use crate::codec::{Chunk, Message};
use crate::config::UpdateMode;
use crate::events::{ControlDataEvent, ControlDataSnapshot, WriteProgress};
use crate::model::advert::{WRITE_CHARACTERISTIC_UUID, YLINK_SERVICE_UUID};
use crate::model::{MacAddress, YLink};
use crate::operation::{ControlDataDisconnectReason, ControlDataOperation, ControlDataStatus, LinkState};
use crate::scheduler::{Flow, TimerKey, TimerKind};
use crate::service::{Context, Inbound, Sighting, count_sighting, decode_blob};
use crate::Result;

fn timer(address: MacAddress, kind: TimerKind) -> TimerKey {
    TimerKey::new(Flow::ControlData, address, kind)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Blob {
    CardKeyGroups,
    CancelledStaffCards,
}

impl Blob {
    fn field(self) -> &'static str {
        match self {
            Blob::CardKeyGroups => "card_key_groups",
            Blob::CancelledStaffCards => "cancelled_staff_cards",
        }
    }

    fn hex(self, ylink: &YLink) -> Option<&str> {
        match self {
            Blob::CardKeyGroups => ylink.card_key_groups.as_deref(),
            Blob::CancelledStaffCards => ylink.cancelled_staff_cards.as_deref(),
        }
    }
}

fn blob_len(ylink: &YLink, blob: Blob) -> usize {
    decode_blob(blob.hex(ylink), blob.field()).map_or(0, |data| data.len())
}

/// Owns every control-data operation of the current hotel.
pub struct ControlDataService {
    operations: Vec<ControlDataOperation>,
    pending: Vec<YLink>,
}

impl Default for ControlDataService {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlDataService {
    pub fn new() -> Self {
        ControlDataService {
            operations: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn set_pending(&mut self, ylinks: Vec<YLink>) {
        self.pending = ylinks;
    }

    pub fn pending(&self) -> &[YLink] {
        &self.pending
    }

    pub fn operations(&self) -> &[ControlDataOperation] {
        &self.operations
    }

    pub fn scan_services(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.pending.iter().map(YLink::service_uuid)
    }

    pub fn snapshots(&self) -> Vec<ControlDataSnapshot> {
        self.operations
            .iter()
            .map(ControlDataOperation::snapshot)
            .collect()
    }

    pub fn owns_address(&self, address: MacAddress) -> bool {
        self.index_of(address).is_some()
    }

    pub fn owns_peripheral(&self, peripheral: &PeripheralId) -> bool {
        self.index_of_peripheral(peripheral).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.operations.iter().filter(|op| op.is_in_progress()).count()
    }

    fn index_of(&self, address: MacAddress) -> Option<usize> {
        self.operations
            .iter()
            .position(|op| op.ylink.mac_address == address)
    }

    fn index_of_peripheral(&self, peripheral: &PeripheralId) -> Option<usize> {
        self.operations
            .iter()
            .position(|op| op.session.peripheral.as_ref() == Some(peripheral))
    }

    pub(crate) async fn restart_all(&mut self, cx: &mut Context) {
        self.end_all(cx).await;
        self.operations = self
            .pending
            .iter()
            .cloned()
            .map(|ylink| {
                let mut op = ControlDataOperation::new(ylink);
                op.status = ControlDataStatus::Scanning;
                op
            })
            .collect();
        info!(
            "Scanning for {} yLinks with control data updates",
            self.operations.len()
        );
        cx.emit(ControlDataEvent::FoundUpdates(self.snapshots()));
        cx.emit(ControlDataEvent::StartedScanning(self.snapshots()));
    }

    pub(crate) async fn end_all(&mut self, cx: &mut Context) {
        for mut op in self.operations.drain(..) {
            cx.end_session(Flow::ControlData, op.ylink.mac_address, &mut op.session)
                .await;
        }
    }

    pub(crate) async fn on_discovered(
        &mut self,
        cx: &mut Context,
        address: MacAddress,
        peripheral: PeripheralId,
        rssi: i16,
    ) {
        let active = self.active_count();
        let Some(idx) = self.index_of(address) else {
            return;
        };
        let op = &mut self.operations[idx];
        op.session.peripheral = Some(peripheral);

        if op.status.is_terminal() {
            trace!("[{}] Ignoring sighting, status is {}", op.ylink.room(), op.status);
            return;
        }
        if op.status.is_busy() {
            op.session.rssi = Some(rssi);
            return;
        }

        match count_sighting(&mut op.session, rssi, &cx.config) {
            Sighting::OutOfRange => {
                debug!("[{}] Out of range at {rssi} dBm", op.ylink.room());
                cx.emit(ControlDataEvent::SignalStrength {
                    operation: op.snapshot(),
                    rssi,
                });
                cx.request_rescan();
                return;
            }
            Sighting::Counting => {
                cx.request_rescan();
                return;
            }
            Sighting::Confirmed => {}
        }

        if (cx.mode == UpdateMode::Automatic || op.status != ControlDataStatus::UnknownDisconnect)
            && op.status != ControlDataStatus::Discovered
        {
            info!("[{}] Discovered at {rssi} dBm", op.ylink.room());
            op.status = ControlDataStatus::Discovered;
            op.restart();
            cx.emit(ControlDataEvent::Discovered(op.snapshot()));
        }

        if cx.mode == UpdateMode::Automatic {
            if active < cx.config.max_concurrent_updates {
                self.verify(cx, idx);
            } else {
                cx.request_rescan();
            }
        }
    }

    pub(crate) fn request_update(&mut self, cx: &mut Context, address: MacAddress) -> bool {
        let Some(idx) = self.index_of(address) else {
            return false;
        };
        let op = &mut self.operations[idx];
        if op.session.end.is_some() || op.is_in_progress() {
            debug!("[{}] Manual update refused, status {}", op.ylink.room(), op.status);
            return false;
        }
        op.session.user_requested = true;
        self.verify(cx, idx);
        true
    }

    fn verify(&mut self, cx: &mut Context, idx: usize) {
        let op = &mut self.operations[idx];
        let prior = op.status;
        op.status = ControlDataStatus::VerifyingUpdate;
        cx.emit(ControlDataEvent::Verifying(op.snapshot()));

        let backend = cx.backend.clone();
        let inbound = cx.inbound.clone();
        let hotel_id = cx.hotel_id;
        let ylink = op.ylink.clone();
        tokio::spawn(async move {
            let result = backend.control_data_update(hotel_id, &ylink).await;
            let _ = inbound.send(Inbound::ControlDataVerified {
                address: ylink.mac_address,
                prior,
                result,
            });
        });
    }

    pub(crate) async fn on_verified(
        &mut self,
        cx: &mut Context,
        address: MacAddress,
        prior: ControlDataStatus,
        result: Result<YLink>,
    ) {
        let Some(idx) = self.index_of(address) else {
            return;
        };
        let op = &mut self.operations[idx];
        if op.status != ControlDataStatus::VerifyingUpdate {
            debug!("[{}] Dropping stale verification", op.ylink.room());
            return;
        }

        match result {
            Err(e) => {
                warn!("[{}] Could not verify control data: {e}", op.ylink.room());
                op.status = prior;
                cx.emit(ControlDataEvent::VerifyFailed {
                    operation: op.snapshot(),
                    error: Some(e.to_string()),
                });
                cx.request_rescan();
            }
            Ok(ylink) if !ylink.has_control_data_update() => {
                info!("[{}] Backend has no control data for this yLink", op.ylink.room());
                op.status = ControlDataStatus::UpdateVerifyFailed;
                cx.emit(ControlDataEvent::VerifyFailed {
                    operation: op.snapshot(),
                    error: None,
                });
                self.remove(cx, address).await;
            }
            Ok(ylink) => {
                op.ylink = ylink;
                op.status = ControlDataStatus::UpdateVerified;
                cx.emit(ControlDataEvent::VerifyPassed(op.snapshot()));
                if cx.mode == UpdateMode::Automatic || op.session.requires_manual_update() {
                    self.start(cx, idx).await;
                }
            }
        }
    }

    async fn start(&mut self, cx: &mut Context, idx: usize) {
        let op = &mut self.operations[idx];
        let Some(peripheral) = op.session.peripheral.clone() else {
            op.status = ControlDataStatus::Scanning;
            cx.emit(ControlDataEvent::StartedScanning(vec![op.snapshot()]));
            cx.request_rescan();
            return;
        };
        info!("[{}] Starting control data update", op.ylink.room());
        op.session.start();
        op.session.link = LinkState::Connecting;
        if let Err(e) = cx.central.connect(&peripheral).await {
            error!("[{}] Connect failed: {e}", op.ylink.room());
            op.session.link = LinkState::Idle;
            cx.request_rescan();
        }
    }

    pub(crate) async fn on_connected(&mut self, cx: &mut Context, peripheral: &PeripheralId) {
        let Some(idx) = self.index_of_peripheral(peripheral) else {
            return;
        };
        let op = &mut self.operations[idx];
        op.session.link = LinkState::Connected;
        op.status = ControlDataStatus::Connected;
        cx.emit(ControlDataEvent::Connected(op.snapshot()));
        if let Err(e) = cx
            .central
            .discover_characteristics(peripheral, YLINK_SERVICE_UUID, &[WRITE_CHARACTERISTIC_UUID])
            .await
        {
            error!("[{}] Characteristic discovery failed: {e}", op.ylink.room());
        }
    }

    pub(crate) async fn on_disconnected(
        &mut self,
        cx: &mut Context,
        peripheral: &PeripheralId,
        cause: &DisconnectCause,
    ) {
        let Some(idx) = self.index_of_peripheral(peripheral) else {
            return;
        };
        let op = &mut self.operations[idx];
        op.session.link = LinkState::Idle;
        op.session.peripheral = None;
        op.session.write_characteristic = None;

        if *cause != DisconnectCause::Requested
            && op.last_disconnect_reason.is_none()
            && !op.status.is_terminal()
        {
            warn!(
                "[{}] Link dropped without a reason while {} ({cause:?})",
                op.ylink.room(),
                op.status
            );
            op.session.progress = 0.0;
            op.status = ControlDataStatus::UnknownDisconnect;
        } else {
            info!("[{}] Disconnected", op.ylink.room());
        }
        cx.emit(ControlDataEvent::Disconnected(op.snapshot()));
        cx.request_rescan();
    }

    pub(crate) async fn on_characteristics(
        &mut self,
        cx: &mut Context,
        peripheral: &PeripheralId,
        characteristics: Vec<Characteristic>,
    ) {
        let Some(idx) = self.index_of_peripheral(peripheral) else {
            return;
        };
        let op = &mut self.operations[idx];
        let Some(characteristic) = characteristics
            .into_iter()
            .find(|c| c.uuid == WRITE_CHARACTERISTIC_UUID)
        else {
            debug!("[{}] Write characteristic not found yet", op.ylink.room());
            return;
        };
        if let Err(e) = cx.central.subscribe(peripheral, &characteristic).await {
            error!("[{}] Subscribe failed: {e}", op.ylink.room());
        }
        op.session.write_characteristic = Some(characteristic);

        let request = decode_blob(
            op.ylink.cl_rfid_control_data_update_request.as_deref(),
            "cl_rfid_control_data_update_request",
        );
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                error!("[{}] No usable control data request: {e}", op.ylink.room());
                op.status = ControlDataStatus::UpdateFailed;
                cx.emit(ControlDataEvent::UpdateFailed(op.snapshot()));
                return;
            }
        };
        if !matches!(
            Message::decode(&request),
            Ok(Message::SealedControlDataUpdateRequest(_))
        ) {
            warn!(
                "[{}] Control data request does not look sealed, sending it anyway",
                op.ylink.room()
            );
        }

        debug!("[{}] Sending control data update request", op.ylink.room());
        cx.write_frame(&op.session, &request, op.ylink.room()).await;
        op.status = ControlDataStatus::Updating;
        cx.emit(ControlDataEvent::UpdateStarted(op.snapshot()));
    }

    pub(crate) async fn on_notified(
        &mut self,
        cx: &mut Context,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    ) {
        if characteristic != WRITE_CHARACTERISTIC_UUID {
            return;
        }
        let Some(idx) = self.index_of_peripheral(peripheral) else {
            return;
        };
        let message = match Message::decode(&value) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "[{}] Unreadable frame {}: {e}",
                    self.operations[idx].ylink.room(),
                    HEXLOWER.encode(&value)
                );
                return;
            }
        };

        match message {
            Message::Ack => self.on_ack(cx, idx).await,
            Message::Disconnect(disconnect) => self.on_disconnect_frame(cx, idx, disconnect.reason),
            Message::ControlDataUpdateComplete(_) => self.on_update_complete(cx, idx, &value).await,
            other => warn!(
                "[{}] Unexpected message {:#04x}",
                self.operations[idx].ylink.room(),
                other.opcode()
            ),
        }
    }

    /// A confirmed write on the write characteristic moves the current
    /// blob along by one chunk.
    pub(crate) async fn on_written(
        &mut self,
        cx: &mut Context,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        error: Option<&str>,
    ) {
        let Some(idx) = self.index_of_peripheral(peripheral) else {
            return;
        };
        let op = &self.operations[idx];
        if let Some(e) = error {
            warn!("[{}] Write to {characteristic} failed: {e}", op.ylink.room());
        }
        if characteristic != WRITE_CHARACTERISTIC_UUID {
            return;
        }
        let phase = op.phase;
        if phase.acked_update_request
            && !phase.acked_card_key_groups
            && !phase.acked_cancelled_staff_cards
            && !phase.wrote_card_key_groups_complete
        {
            self.write_next_chunk(cx, idx, Blob::CardKeyGroups).await;
        } else if phase.acked_update_request
            && phase.acked_card_key_groups
            && !phase.acked_cancelled_staff_cards
            && !phase.wrote_cancelled_staff_cards_complete
        {
            self.write_next_chunk(cx, idx, Blob::CancelledStaffCards)
                .await;
        }
    }

    async fn on_ack(&mut self, cx: &mut Context, idx: usize) {
        let op = &mut self.operations[idx];
        if !op.phase.acked_update_request && !op.phase.acked_card_key_groups {
            debug!("[{}] Update request acknowledged", op.ylink.room());
            op.phase.acked_update_request = true;
            self.write_next_chunk(cx, idx, Blob::CardKeyGroups).await;
        } else if op.phase.acked_update_request && !op.phase.acked_card_key_groups {
            debug!("[{}] Card key groups acknowledged", op.ylink.room());
            op.phase.acked_card_key_groups = true;
            self.write_next_chunk(cx, idx, Blob::CancelledStaffCards)
                .await;
        } else {
            trace!("[{}] Ack ignored", op.ylink.room());
        }
    }

    async fn write_next_chunk(&mut self, cx: &mut Context, idx: usize, blob: Blob) {
        let op = &mut self.operations[idx];
        let data = match decode_blob(blob.hex(&op.ylink), blob.field()) {
            Ok(data) => data,
            Err(e) => {
                debug!("[{}] Nothing to send for {}: {e}", op.ylink.room(), blob.field());
                Vec::new()
            }
        };
        let offset = match blob {
            Blob::CardKeyGroups => op.card_key_groups_offset,
            Blob::CancelledStaffCards => op.cancelled_staff_cards_offset,
        };
        if offset >= data.len() {
            self.write_upload_complete(cx, idx, blob).await;
            return;
        }

        let chunk = cx.config.control_data_chunk_size.min(data.len() - offset);
        let payload = data[offset..offset + chunk].to_vec();
        let frame = match Chunk::new(payload) {
            Ok(chunk) => match blob {
                Blob::CardKeyGroups => Message::CardKeyGroups(chunk),
                Blob::CancelledStaffCards => Message::CancelledStaffCards(chunk),
            }
            .encode(),
            Err(e) => {
                error!("[{}] Cannot frame {} chunk: {e}", op.ylink.room(), blob.field());
                return;
            }
        };
        trace!(
            "[{}] Writing {} bytes {offset}..{}",
            op.ylink.room(),
            blob.field(),
            offset + chunk
        );
        cx.write_frame(&op.session, &frame, op.ylink.room()).await;
        match blob {
            Blob::CardKeyGroups => op.card_key_groups_offset += chunk,
            Blob::CancelledStaffCards => op.cancelled_staff_cards_offset += chunk,
        }

        let total = blob_len(&op.ylink, Blob::CardKeyGroups)
            + blob_len(&op.ylink, Blob::CancelledStaffCards);
        let written = op.card_key_groups_offset + op.cancelled_staff_cards_offset;
        if total > 0 {
            op.session.progress = written as f32 / total as f32;
            cx.emit(ControlDataEvent::WriteProgress {
                operation: op.snapshot(),
                progress: WriteProgress {
                    bytes_written: chunk as u64,
                    total_bytes_written: written as u64,
                    total_bytes_expected: total as u64,
                },
            });
        }
    }

    async fn write_upload_complete(&mut self, cx: &mut Context, idx: usize, blob: Blob) {
        let op = &mut self.operations[idx];
        let frame = match blob {
            Blob::CardKeyGroups => {
                debug!("[{}] Card key groups sent", op.ylink.room());
                op.phase.wrote_card_key_groups_complete = true;
                Message::CardKeyGroupsUploadComplete
            }
            Blob::CancelledStaffCards => {
                info!("[{}] Control data written", op.ylink.room());
                op.phase.wrote_cancelled_staff_cards_complete = true;
                op.status = ControlDataStatus::WriteComplete;
                cx.emit(ControlDataEvent::WriteComplete(op.snapshot()));
                Message::CancelledStaffCardsUploadComplete
            }
        };
        cx.write_frame(&op.session, &frame.encode(), op.ylink.room())
            .await;
    }

    fn on_disconnect_frame(&mut self, cx: &mut Context, idx: usize, code: u8) {
        let op = &mut self.operations[idx];
        let Some(reason) = ControlDataDisconnectReason::from_code(code) else {
            warn!("[{}] Unhandled disconnect reason {code:#04x}", op.ylink.room());
            return;
        };
        warn!("[{}] Lock ended the update: {reason:?}", op.ylink.room());
        op.last_disconnect_reason = Some(reason);
        op.session.end();
        op.status = ControlDataStatus::UpdateFailed;
        cx.emit(ControlDataEvent::UpdateFailed(op.snapshot()));

        let backend = cx.backend.clone();
        let hotel_id = cx.hotel_id;
        let ylink = op.ylink.clone();
        cx.report("control data status", op.ylink.room().to_string(), async move {
            backend
                .report_control_data_status(hotel_id, &ylink, reason.code())
                .await
        });
    }

    async fn on_update_complete(&mut self, cx: &mut Context, idx: usize, value: &[u8]) {
        let op = &mut self.operations[idx];
        op.phase.acked_cancelled_staff_cards = true;
        if op.status == ControlDataStatus::UpToDate {
            trace!("[{}] Already up to date", op.ylink.room());
            return;
        }

        if !op.session.awaiting_continuation {
            op.session.awaiting_continuation = true;
            debug!("[{}] Update complete notified, reading the rest", op.ylink.room());
            let (Some(peripheral), Some(characteristic)) =
                (&op.session.peripheral, &op.session.write_characteristic)
            else {
                warn!("[{}] No link to read the confirmation from", op.ylink.room());
                return;
            };
            if let Err(e) = cx.central.read(peripheral, characteristic).await {
                error!("[{}] Read failed: {e}", op.ylink.room());
            }
            return;
        }

        op.session.end();
        if let (Some(start), Some(end)) = (op.session.start, op.session.end) {
            info!(
                "[{}] Control data updated in {:.1}s",
                op.ylink.room(),
                end.duration_since(start).as_secs_f32()
            );
        }
        let ack = Message::ControlDataUpdateCompleteAck.encode();
        cx.write_frame(&op.session, &ack, op.ylink.room()).await;
        op.status = ControlDataStatus::UpToDate;
        cx.emit(ControlDataEvent::UpToDate(op.snapshot()));

        let hex = HEXLOWER.encode(value);
        let backend = cx.backend.clone();
        let hotel_id = cx.hotel_id;
        let ylink = op.ylink.clone();
        cx.report("control data update complete", op.ylink.room().to_string(), async move {
            backend
                .report_control_data_update_complete(hotel_id, &ylink, &hex)
                .await
        });

        op.session.awaiting_continuation = false;
        cx.scheduler.after(
            timer(op.ylink.mac_address, TimerKind::Removal),
            cx.config.removal_grace(),
        );
    }

    pub(crate) async fn on_timer(&mut self, cx: &mut Context, key: TimerKey) {
        match key.kind {
            TimerKind::Removal => self.remove(cx, key.address).await,
            kind => trace!("No control data timer of kind {kind:?}"),
        }
    }

    async fn remove(&mut self, cx: &mut Context, address: MacAddress) {
        let Some(idx) = self.index_of(address) else {
            return;
        };
        let mut op = self.operations.remove(idx);
        info!("[{}] Removing control data operation", op.ylink.room());
        cx.end_session(Flow::ControlData, address, &mut op.session)
            .await;
        cx.emit(ControlDataEvent::Removed(op.snapshot()));
        self.pending.retain(|ylink| ylink.mac_address != address);
        cx.request_rescan();
    }
}
