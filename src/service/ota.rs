//! Firmware updates over the air.

use bytes::Bytes;
use data_encoding::HEXLOWER;
use log::{debug, error, info, trace, warn};
use tokio::time::Instant;
use uuid::Uuid;

use crate::api::backend::DownloadProgress;
use crate::api::central::PeripheralId;
use crate::api::central_event::DisconnectCause;
use crate::api::characteristic::{Characteristic, CharacteristicWriteType};
use crate::codec::{FirmwarePacket, FirmwareUpdateRequest, Message};
use crate::config::UpdateMode;
use crate::events::{OtaEvent, OtaSnapshot, WriteProgress};
use crate::firmware_store::FirmwareStore;
use crate::model::advert::{OTA_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID, YLINK_SERVICE_UUID};
use crate::model::{MacAddress, YLink};
use crate::operation::{LinkState, OtaDisconnectReason, OtaOperation, OtaStatus};
use crate::scheduler::{Flow, TimerKey, TimerKind};
use crate::service::{Context, Inbound, Sighting, count_sighting, decode_blob};
use crate::{Error, Result};

fn timer(address: MacAddress, kind: TimerKind) -> TimerKey {
    TimerKey::new(Flow::Ota, address, kind)
}

/// Owns every OTA operation of the current hotel.
pub struct OtaService {
    operations: Vec<OtaOperation>,
    /// yLinks the backend says have firmware waiting.
    pending: Vec<YLink>,
    store: FirmwareStore,
}

impl OtaService {
    pub fn new(store: FirmwareStore) -> Self {
        OtaService {
            operations: Vec::new(),
            pending: Vec::new(),
            store,
        }
    }

    pub fn set_pending(&mut self, ylinks: Vec<YLink>) {
        self.pending = ylinks;
    }

    pub fn pending(&self) -> &[YLink] {
        &self.pending
    }

    pub fn operations(&self) -> &[OtaOperation] {
        &self.operations
    }

    /// Advertised UUIDs worth scanning for.
    pub fn scan_services(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.pending
            .iter()
            .filter(|ylink| ylink.has_new_firmware())
            .map(YLink::service_uuid)
    }

    pub fn snapshots(&self) -> Vec<OtaSnapshot> {
        self.operations.iter().map(OtaOperation::snapshot).collect()
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

    /// Ends every operation and rebuilds the list from the pending set.
    pub(crate) async fn restart_all(&mut self, cx: &mut Context) {
        self.end_all(cx).await;
        self.operations = self
            .pending
            .iter()
            .filter(|ylink| ylink.has_new_firmware())
            .cloned()
            .map(|ylink| {
                let mut op = OtaOperation::new(ylink);
                op.status = OtaStatus::Scanning;
                op
            })
            .collect();
        info!("Scanning for {} yLinks with new firmware", self.operations.len());
        cx.emit(OtaEvent::FoundUpdates(self.snapshots()));
        cx.emit(OtaEvent::StartedScanning(self.snapshots()));
    }

    pub(crate) async fn end_all(&mut self, cx: &mut Context) {
        for mut op in self.operations.drain(..) {
            cx.end_session(Flow::Ota, op.ylink.mac_address, &mut op.session)
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

        match op.status {
            OtaStatus::UpToDate | OtaStatus::UpdateFailed => {
                trace!("[{}] Ignoring sighting, status is {}", op.ylink.room(), op.status);
                return;
            }
            OtaStatus::WriteComplete | OtaStatus::ValidatingUpdate => {
                op.session.rssi = Some(rssi);
                op.session.progress = 0.0;
                if op.status != OtaStatus::ValidatingUpdate {
                    info!("[{}] Rebooted yLink seen again, validating", op.ylink.room());
                }
                op.status = OtaStatus::ValidatingUpdate;
                cx.emit(OtaEvent::Validating(op.snapshot()));
                if op.session.link == LinkState::Idle {
                    connect(cx, op).await;
                }
                return;
            }
            status if status.is_busy() => {
                op.session.rssi = Some(rssi);
                return;
            }
            _ => {}
        }

        match count_sighting(&mut op.session, rssi, &cx.config) {
            Sighting::OutOfRange => {
                debug!("[{}] Out of range at {rssi} dBm", op.ylink.room());
                cx.emit(OtaEvent::SignalStrength {
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

        if (cx.mode == UpdateMode::Automatic || op.status != OtaStatus::UnknownDisconnect)
            && op.status != OtaStatus::Discovered
        {
            info!("[{}] Discovered at {rssi} dBm", op.ylink.room());
            op.status = OtaStatus::Discovered;
            op.restart();
            cx.emit(OtaEvent::Discovered(op.snapshot()));
        }

        if cx.mode == UpdateMode::Automatic {
            if active < cx.config.max_concurrent_updates {
                self.verify(cx, idx);
            } else {
                debug!(
                    "[{}] {active} updates already running, waiting",
                    self.operations[idx].ylink.room()
                );
                cx.request_rescan();
            }
        }
    }

    /// Operator request for one yLink, whatever the mode and however many
    /// updates are running. False when the operation is unknown, already
    /// finished or already underway.
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
        op.status = OtaStatus::VerifyingUpdate;
        cx.emit(OtaEvent::Verifying(op.snapshot()));

        let backend = cx.backend.clone();
        let inbound = cx.inbound.clone();
        let hotel_id = cx.hotel_id;
        let ylink = op.ylink.clone();
        tokio::spawn(async move {
            let result = backend.ota_update(hotel_id, &ylink).await;
            let _ = inbound.send(Inbound::OtaVerified {
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
        prior: OtaStatus,
        result: Result<YLink>,
    ) {
        let Some(idx) = self.index_of(address) else {
            return;
        };
        let op = &mut self.operations[idx];
        if op.status != OtaStatus::VerifyingUpdate {
            debug!("[{}] Dropping stale verification", op.ylink.room());
            return;
        }

        match result {
            Err(e) => {
                warn!("[{}] Could not verify update: {e}", op.ylink.room());
                op.status = prior;
                cx.emit(OtaEvent::VerifyFailed {
                    operation: op.snapshot(),
                    error: Some(e.to_string()),
                });
                cx.request_rescan();
            }
            Ok(ylink) if !ylink.has_new_firmware() => {
                info!("[{}] Backend has no new firmware for this yLink", op.ylink.room());
                op.status = OtaStatus::UpdateVerifyFailed;
                cx.emit(OtaEvent::VerifyFailed {
                    operation: op.snapshot(),
                    error: None,
                });
                self.remove(cx, address).await;
            }
            Ok(ylink) => {
                op.ylink = ylink;
                op.status = OtaStatus::UpdateVerified;
                cx.emit(OtaEvent::VerifyPassed(op.snapshot()));
                if cx.mode == UpdateMode::Automatic || op.session.requires_manual_update() {
                    self.start(cx, idx);
                }
            }
        }
    }

    fn start(&mut self, cx: &mut Context, idx: usize) {
        let op = &mut self.operations[idx];
        let address = op.ylink.mac_address;
        let url = op
            .ylink
            .new_firmware
            .as_ref()
            .and_then(|firmware| firmware.file_location.clone());
        let Some(url) = url else {
            error!("[{}] New firmware has no file location", op.ylink.room());
            op.status = OtaStatus::FirmwareDownloadFailed;
            cx.emit(OtaEvent::FirmwareDownloadFailed {
                operation: op.snapshot(),
                error: Error::MissingField("file_location").to_string(),
            });
            return;
        };

        info!("[{}] Fetching firmware", op.ylink.room());
        let store = self.store.clone();
        let backend = cx.backend.clone();
        let inbound = cx.inbound.clone();
        tokio::spawn(async move {
            let progress_tx = inbound.clone();
            let progress = move |progress: DownloadProgress| {
                let _ = progress_tx.send(Inbound::FirmwareProgress { address, progress });
            };
            let result = store.fetch(backend.as_ref(), &url, &progress).await;
            let _ = inbound.send(Inbound::FirmwareDownloaded { address, result });
        });
    }

    pub(crate) fn on_download_progress(
        &mut self,
        cx: &mut Context,
        address: MacAddress,
        progress: DownloadProgress,
    ) {
        let Some(idx) = self.index_of(address) else {
            return;
        };
        let op = &mut self.operations[idx];
        if !matches!(
            op.status,
            OtaStatus::UpdateVerified | OtaStatus::DownloadingFirmware
        ) {
            return;
        }
        op.status = OtaStatus::DownloadingFirmware;
        cx.emit(OtaEvent::DownloadingFirmware {
            operation: op.snapshot(),
            progress,
        });
    }

    pub(crate) async fn on_downloaded(
        &mut self,
        cx: &mut Context,
        address: MacAddress,
        result: Result<Bytes>,
    ) {
        let Some(idx) = self.index_of(address) else {
            return;
        };
        let op = &mut self.operations[idx];
        if !matches!(
            op.status,
            OtaStatus::UpdateVerified | OtaStatus::DownloadingFirmware
        ) {
            debug!("[{}] Dropping stale firmware download", op.ylink.room());
            return;
        }

        let firmware = match result {
            Ok(firmware) => firmware,
            Err(e) => {
                error!("[{}] Firmware download failed: {e}", op.ylink.room());
                op.status = OtaStatus::FirmwareDownloadFailed;
                cx.emit(OtaEvent::FirmwareDownloadFailed {
                    operation: op.snapshot(),
                    error: e.to_string(),
                });
                return;
            }
        };

        info!("[{}] Firmware ready, {} bytes", op.ylink.room(), firmware.len());
        op.firmware = Some(firmware);
        op.status = OtaStatus::FirmwareDownloadComplete;
        cx.emit(OtaEvent::FirmwareDownloadComplete(op.snapshot()));

        if op.session.peripheral.is_none() {
            op.status = OtaStatus::Scanning;
            cx.emit(OtaEvent::StartedScanning(vec![op.snapshot()]));
            cx.request_rescan();
            return;
        }
        op.session.start();
        connect(cx, op).await;
    }

    pub(crate) async fn on_connected(&mut self, cx: &mut Context, peripheral: &PeripheralId) {
        let Some(idx) = self.index_of_peripheral(peripheral) else {
            return;
        };
        let op = &mut self.operations[idx];
        op.session.link = LinkState::Connected;
        if op.status != OtaStatus::ValidatingUpdate {
            op.status = OtaStatus::Connected;
            cx.emit(OtaEvent::Connected(op.snapshot()));
        }
        info!("[{}] Connected, discovering characteristics", op.ylink.room());
        if let Err(e) = cx
            .central
            .discover_characteristics(
                peripheral,
                YLINK_SERVICE_UUID,
                &[WRITE_CHARACTERISTIC_UUID, OTA_CHARACTERISTIC_UUID],
            )
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
        let address = op.ylink.mac_address;
        cx.scheduler.cancel(&timer(address, TimerKind::FirmwarePacket));
        op.session.link = LinkState::Idle;
        op.session.peripheral = None;
        op.session.write_characteristic = None;
        op.ota_characteristic = None;

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
            op.status = OtaStatus::UnknownDisconnect;
        } else {
            info!("[{}] Disconnected", op.ylink.room());
        }
        cx.emit(OtaEvent::Disconnected(op.snapshot()));
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
        for characteristic in characteristics {
            if characteristic.uuid == WRITE_CHARACTERISTIC_UUID {
                if let Err(e) = cx.central.subscribe(peripheral, &characteristic).await {
                    error!("[{}] Subscribe failed: {e}", op.ylink.room());
                }
                op.session.write_characteristic = Some(characteristic);
            } else if characteristic.uuid == OTA_CHARACTERISTIC_UUID {
                op.ota_characteristic = Some(characteristic);
            }
        }

        if op.session.write_characteristic.is_none() || op.ota_characteristic.is_none() {
            debug!("[{}] Waiting for both characteristics", op.ylink.room());
            return;
        }

        let sealed = decode_blob(
            op.ylink
                .new_firmware
                .as_ref()
                .and_then(|firmware| firmware.cl_firmware_update_request.as_deref()),
            "cl_firmware_update_request",
        );
        let sealed = match sealed {
            Ok(sealed) => sealed,
            Err(e) => {
                error!("[{}] No usable firmware update request: {e}", op.ylink.room());
                op.status = OtaStatus::UnknownDisconnect;
                cx.emit(OtaEvent::Disconnected(op.snapshot()));
                return;
            }
        };
        let frame = Message::FirmwareUpdateRequest(FirmwareUpdateRequest::new(sealed)).encode();
        debug!("[{}] Sending firmware update request", op.ylink.room());
        cx.write_frame(&op.session, &frame, op.ylink.room()).await;
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
            Message::StartFirmwareUpload(start) => {
                self.start_upload(cx, idx, start.starting_offset as usize)
            }
            Message::Disconnect(disconnect) => self.on_disconnect_frame(cx, idx, disconnect.reason),
            Message::FirmwareUpdateComplete(_) => self.on_update_complete(cx, idx, &value).await,
            other => warn!(
                "[{}] Unexpected message {:#04x}",
                self.operations[idx].ylink.room(),
                other.opcode()
            ),
        }
    }

    pub(crate) fn on_written(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        error: Option<&str>,
    ) {
        let Some(idx) = self.index_of_peripheral(peripheral) else {
            return;
        };
        let room = self.operations[idx].ylink.room();
        match error {
            Some(e) => warn!("[{room}] Write to {characteristic} failed: {e}"),
            None => trace!("[{room}] Wrote to {characteristic}"),
        }
    }

    fn start_upload(&mut self, cx: &mut Context, idx: usize, starting_offset: usize) {
        let op = &mut self.operations[idx];
        if op.firmware.is_none() {
            error!("[{}] Lock asked for firmware we do not have", op.ylink.room());
            return;
        }
        info!(
            "[{}] Lock requested firmware from byte {starting_offset} of {}",
            op.ylink.room(),
            op.firmware_len()
        );
        op.offset = starting_offset;
        if op.status != OtaStatus::Updating {
            op.status = OtaStatus::Updating;
            cx.emit(OtaEvent::UpdateStarted(op.snapshot()));
        }
        let key = timer(op.ylink.mac_address, TimerKind::FirmwarePacket);
        if !cx.scheduler.is_scheduled(&key) {
            cx.scheduler.every(key, cx.config.firmware_packet_interval());
        }
    }

    fn on_disconnect_frame(&mut self, cx: &mut Context, idx: usize, code: u8) {
        let op = &mut self.operations[idx];
        let Some(reason) = OtaDisconnectReason::from_code(code) else {
            warn!("[{}] Unhandled disconnect reason {code:#04x}", op.ylink.room());
            return;
        };
        op.last_disconnect_reason = Some(reason);
        let mut time_to_update = None;

        match reason {
            OtaDisconnectReason::FirmwareTooSmall
            | OtaDisconnectReason::FirmwareTooBig
            | OtaDisconnectReason::FirmwareFailedCrc
            | OtaDisconnectReason::InactivityTimeout => {
                warn!("[{}] Lock rejected the firmware: {reason:?}", op.ylink.room());
                cx.scheduler
                    .cancel(&timer(op.ylink.mac_address, TimerKind::FirmwarePacket));
                op.session.end();
                op.session.progress = 0.0;
                op.status = OtaStatus::FailedToWrite;
                cx.emit(OtaEvent::WriteFailed(op.snapshot()));
            }
            OtaDisconnectReason::FirmwareUploadConfirmed => {
                info!("[{}] Lock accepted the firmware, rebooting", op.ylink.room());
                op.status = OtaStatus::WriteComplete;
                time_to_update = op.transfer_time();
                cx.emit(OtaEvent::WriteComplete(op.snapshot()));
            }
            OtaDisconnectReason::FirmwareFailedToBoot => {
                error!("[{}] New firmware failed to boot", op.ylink.room());
                op.session.end();
                op.session.progress = 0.0;
                op.status = OtaStatus::UpdateFailed;
                cx.emit(OtaEvent::UpdateFailed(op.snapshot()));
            }
        }

        let backend = cx.backend.clone();
        let hotel_id = cx.hotel_id;
        let ylink = op.ylink.clone();
        cx.report("firmware status", op.ylink.room().to_string(), async move {
            backend
                .report_firmware_status(hotel_id, &ylink, reason.code(), time_to_update)
                .await
        });
    }

    /// The lock's confirmation arrives in two reads: a notification with the
    /// first part, then an explicit read for the whole frame.
    async fn on_update_complete(&mut self, cx: &mut Context, idx: usize, value: &[u8]) {
        let op = &mut self.operations[idx];
        if op.status == OtaStatus::UpToDate {
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

        info!("[{}] Firmware update confirmed", op.ylink.room());
        op.session.progress = 0.0;
        op.status = OtaStatus::UpToDate;
        cx.emit(OtaEvent::UpdateConfirmed(op.snapshot()));

        let ack = Message::FirmwareUpdateCompleteAck.encode();
        cx.write_frame(&op.session, &ack, op.ylink.room()).await;

        let hex = HEXLOWER.encode(value);
        let backend = cx.backend.clone();
        let hotel_id = cx.hotel_id;
        let ylink = op.ylink.clone();
        cx.report("firmware update complete", op.ylink.room().to_string(), async move {
            backend
                .report_firmware_update_complete(hotel_id, &ylink, &hex)
                .await
        });

        op.session.awaiting_continuation = false;
        op.session.end();
        cx.scheduler.after(
            timer(op.ylink.mac_address, TimerKind::Removal),
            cx.config.removal_grace(),
        );
    }

    pub(crate) async fn on_timer(&mut self, cx: &mut Context, key: TimerKey) {
        match key.kind {
            TimerKind::FirmwarePacket => self.send_next_packet(cx, key).await,
            TimerKind::UploadComplete => self.send_upload_complete(cx, key.address).await,
            TimerKind::Removal => self.remove(cx, key.address).await,
        }
    }

    async fn send_next_packet(&mut self, cx: &mut Context, key: TimerKey) {
        let Some(idx) = self.index_of(key.address) else {
            cx.scheduler.cancel(&key);
            return;
        };
        let op = &mut self.operations[idx];
        let Some(firmware) = op.firmware.clone() else {
            cx.scheduler.cancel(&key);
            return;
        };
        if op.status != OtaStatus::Updating {
            debug!("[{}] Stopping packets, status is {}", op.ylink.room(), op.status);
            cx.scheduler.cancel(&key);
            return;
        }

        let len = firmware.len();
        if op.offset >= len {
            cx.scheduler.cancel(&key);
            let now = Instant::now();
            op.transfer_end = Some(now);
            if let Some(start) = op.transfer_start {
                info!(
                    "[{}] Sent {len} bytes in {:.1}s",
                    op.ylink.room(),
                    now.duration_since(start).as_secs_f32()
                );
            }
            cx.scheduler.after(
                timer(key.address, TimerKind::UploadComplete),
                cx.config.upload_complete_delay(),
            );
            return;
        }

        if op.session.link != LinkState::Connected {
            info!("[{}] Link gone, stopping packets", op.ylink.room());
            cx.scheduler.cancel(&key);
            return;
        }
        let (Some(peripheral), Some(characteristic)) =
            (&op.session.peripheral, &op.ota_characteristic)
        else {
            cx.scheduler.cancel(&key);
            return;
        };

        let chunk = cx.config.firmware_packet_size.min(len - op.offset);
        op.transfer_start.get_or_insert_with(Instant::now);
        let packet = FirmwarePacket::new(
            op.offset as u32,
            firmware.slice(op.offset..op.offset + chunk).to_vec(),
        );
        let frame = match packet {
            Ok(packet) => Message::FirmwarePacket(packet).encode(),
            Err(e) => {
                error!("[{}] Cannot frame firmware packet: {e}", op.ylink.room());
                cx.scheduler.cancel(&key);
                return;
            }
        };
        if let Err(e) = cx
            .central
            .write(
                peripheral,
                characteristic,
                &frame,
                CharacteristicWriteType::WriteWithoutResponse,
            )
            .await
        {
            warn!("[{}] Packet write failed: {e}", op.ylink.room());
        }

        op.session.progress = op.offset as f32 / len as f32;
        cx.emit(OtaEvent::WriteProgress {
            operation: op.snapshot(),
            progress: WriteProgress {
                bytes_written: chunk as u64,
                total_bytes_written: op.offset as u64,
                total_bytes_expected: len as u64,
            },
        });
        op.offset += chunk;
    }

    async fn send_upload_complete(&mut self, cx: &mut Context, address: MacAddress) {
        let Some(idx) = self.index_of(address) else {
            return;
        };
        let op = &self.operations[idx];
        if op.status != OtaStatus::Updating || op.offset < op.firmware_len() {
            debug!("[{}] Upload no longer complete, not announcing", op.ylink.room());
            return;
        }
        info!("[{}] Announcing end of upload", op.ylink.room());
        let frame = Message::FirmwareUploadComplete.encode();
        cx.write_frame(&op.session, &frame, op.ylink.room()).await;
    }

    async fn remove(&mut self, cx: &mut Context, address: MacAddress) {
        let Some(idx) = self.index_of(address) else {
            return;
        };
        let mut op = self.operations.remove(idx);
        info!("[{}] Removing OTA operation", op.ylink.room());
        cx.end_session(Flow::Ota, address, &mut op.session).await;
        cx.emit(OtaEvent::Removed(op.snapshot()));
        self.pending.retain(|ylink| ylink.mac_address != address);
        cx.request_rescan();
    }
}

async fn connect(cx: &mut Context, op: &mut OtaOperation) {
    let Some(peripheral) = &op.session.peripheral else {
        return;
    };
    op.session.link = LinkState::Connecting;
    debug!("[{}] Connecting to {peripheral}", op.ylink.room());
    if let Err(e) = cx.central.connect(peripheral).await {
        error!("[{}] Connect failed: {e}", op.ylink.room());
        op.session.link = LinkState::Idle;
        cx.request_rescan();
    }
}
