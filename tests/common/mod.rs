//! A simulated yLink radio and backend for driving the updater end to end.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use data_encoding::HEXUPPER;
use tempfile::TempDir;
use tokio::sync::mpsc::{self, Sender, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;
use ylinkcore::api::backend::{Backend, DownloadProgress};
use ylinkcore::api::central::{CentralManager, PeripheralId, ScanFilter};
use ylinkcore::api::central_event::{CentralEvent, CentralState, DisconnectCause};
use ylinkcore::api::characteristic::{
    Characteristic, CharacteristicProperty, CharacteristicWriteType,
};
use ylinkcore::codec::message::opcode;
use ylinkcore::codec::{Disconnect, Message, Sealed, StartFirmwareUpload};
use ylinkcore::model::advert::{
    OTA_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID, YLINK_SERVICE_UUID, ylink_service_uuid,
};
use ylinkcore::model::{Firmware, MacAddress, YLink};
use ylinkcore::{Error, Result, UpdateEvent, Updater, UpdaterConfig, UpdaterHandle};

pub const FIRMWARE_URL: &str = "https://fw.example.com/ylink-12.bin";
const UPLOAD_CONFIRMED: u8 = 0x0B;

pub fn peripheral_of(mac: MacAddress) -> PeripheralId {
    PeripheralId(format!("p-{mac}"))
}

pub fn advert(mac: MacAddress, rssi: i16) -> CentralEvent {
    CentralEvent::DeviceDiscovered {
        peripheral: peripheral_of(mac),
        services: vec![ylink_service_uuid(&mac)],
        manufacturer_data: None,
        rssi,
    }
}

/// A sealed frame as the lock or the server would produce it.
pub fn sealed_frame(op: u8, payload: &[u8]) -> Vec<u8> {
    let sealed = Sealed {
        version: 1,
        iv: [0x11; 16],
        payload: payload.to_vec(),
    };
    let message = match op {
        opcode::FIRMWARE_UPDATE_COMPLETE => Message::FirmwareUpdateComplete(sealed),
        opcode::CONTROL_DATA_UPDATE_COMPLETE => Message::ControlDataUpdateComplete(sealed),
        _ => Message::SealedControlDataUpdateRequest(sealed),
    };
    message.encode()
}

pub fn ota_ylink(mac: MacAddress, room: &str) -> YLink {
    let mut ylink = YLink::new(mac);
    ylink.room_number = Some(room.to_string());
    ylink.new_firmware = Some(Firmware {
        version: Some(12),
        file_location: Some(FIRMWARE_URL.to_string()),
        cl_firmware_update_request: Some("790102030405".to_string()),
        ..Firmware::default()
    });
    ylink
}

pub fn control_data_ylink(
    mac: MacAddress,
    room: &str,
    card_key_groups: &[u8],
    cancelled_staff_cards: &[u8],
) -> YLink {
    let mut ylink = YLink::new(mac);
    ylink.room_number = Some(room.to_string());
    ylink.cl_rfid_control_data_update_request = Some(HEXUPPER.encode(&sealed_frame(
        opcode::SEALED_CONTROL_DATA_UPDATE_REQUEST,
        &[0xAB; 8],
    )));
    ylink.card_key_groups = Some(HEXUPPER.encode(card_key_groups));
    ylink.cancelled_staff_cards = Some(HEXUPPER.encode(cancelled_staff_cards));
    ylink
}

/// What the simulated locks have seen.
#[derive(Default)]
pub struct LockState {
    pub resume_offset: u32,
    pub images: HashMap<PeripheralId, Vec<u8>>,
    pub packets: Vec<(PeripheralId, u32, usize)>,
    pub frames: Vec<(PeripheralId, Vec<u8>)>,
    pub card_key_groups: Vec<u8>,
    pub cancelled_staff_cards: Vec<u8>,
    pub scans: Vec<ScanFilter>,
    rebooted: HashSet<PeripheralId>,
    completions: HashMap<PeripheralId, Vec<u8>>,
}

impl LockState {
    pub fn frames_for(&self, peripheral: &PeripheralId) -> Vec<Vec<u8>> {
        self.frames
            .iter()
            .filter(|(p, _)| p == peripheral)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub fn packets_for(&self, peripheral: &PeripheralId) -> Vec<(u32, usize)> {
        self.packets
            .iter()
            .filter(|(p, _, _)| p == peripheral)
            .map(|(_, offset, len)| (*offset, *len))
            .collect()
    }
}

/// Radio whose peripherals answer like yLinks: they accept firmware,
/// reboot after the upload, confirm on the next connection and
/// acknowledge control data.
pub struct SimulatedLock {
    events: UnboundedSender<CentralEvent>,
    pub state: Mutex<LockState>,
}

impl SimulatedLock {
    pub fn new(central_tx: Sender<CentralEvent>, resume_offset: u32) -> Arc<Self> {
        let (events, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if central_tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Arc::new(SimulatedLock {
            events,
            state: Mutex::new(LockState {
                resume_offset,
                ..LockState::default()
            }),
        })
    }

    fn emit(&self, event: CentralEvent) {
        let _ = self.events.send(event);
    }

    fn notify(&self, peripheral: &PeripheralId, value: Vec<u8>) {
        self.emit(CentralEvent::CharacteristicNotified {
            peripheral: peripheral.clone(),
            characteristic: WRITE_CHARACTERISTIC_UUID,
            value,
        });
    }

    fn complete(&self, peripheral: &PeripheralId, op: u8) {
        let frame = sealed_frame(op, &[0xC0, 0xFF, 0xEE]);
        self.state
            .lock()
            .unwrap()
            .completions
            .insert(peripheral.clone(), frame.clone());
        self.notify(peripheral, frame);
    }

    fn on_packet(&self, peripheral: &PeripheralId, data: &[u8]) {
        let Ok(Message::FirmwarePacket(packet)) = Message::decode(data) else {
            panic!("unexpected frame on the OTA characteristic: {data:02x?}");
        };
        let offset = packet.byte_offset() as usize;
        let bytes = packet.packet();
        let mut state = self.state.lock().unwrap();
        let image = state.images.entry(peripheral.clone()).or_default();
        if image.len() < offset + bytes.len() {
            image.resize(offset + bytes.len(), 0);
        }
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
        state
            .packets
            .push((peripheral.clone(), packet.byte_offset(), bytes.len()));
    }

    fn on_frame(&self, peripheral: &PeripheralId, data: &[u8]) {
        let message = Message::decode(data).expect("lock received an unreadable frame");
        match message {
            Message::FirmwareUpdateRequest(_) => {
                let (rebooted, resume_offset) = {
                    let state = self.state.lock().unwrap();
                    (state.rebooted.contains(peripheral), state.resume_offset)
                };
                if rebooted {
                    self.complete(peripheral, opcode::FIRMWARE_UPDATE_COMPLETE);
                } else {
                    let start = StartFirmwareUpload {
                        version: 1,
                        starting_offset: resume_offset,
                    };
                    self.notify(peripheral, Message::StartFirmwareUpload(start).encode());
                }
            }
            Message::FirmwareUploadComplete => {
                self.state
                    .lock()
                    .unwrap()
                    .rebooted
                    .insert(peripheral.clone());
                let disconnect = Disconnect {
                    version: 1,
                    reason: UPLOAD_CONFIRMED,
                };
                self.notify(peripheral, Message::Disconnect(disconnect).encode());
                self.emit(CentralEvent::DeviceDisconnected {
                    peripheral: peripheral.clone(),
                    cause: DisconnectCause::Remote,
                });
            }
            Message::SealedControlDataUpdateRequest(_) | Message::CardKeyGroupsUploadComplete => {
                self.notify(peripheral, Message::Ack.encode());
            }
            Message::CardKeyGroups(chunk) => self
                .state
                .lock()
                .unwrap()
                .card_key_groups
                .extend_from_slice(chunk.data()),
            Message::CancelledStaffCards(chunk) => self
                .state
                .lock()
                .unwrap()
                .cancelled_staff_cards
                .extend_from_slice(chunk.data()),
            Message::CancelledStaffCardsUploadComplete => {
                self.complete(peripheral, opcode::CONTROL_DATA_UPDATE_COMPLETE);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl CentralManager for SimulatedLock {
    async fn start_scan(&self, filter: ScanFilter) -> Result<()> {
        self.state.lock().unwrap().scans.push(filter);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.emit(CentralEvent::DeviceConnected {
            peripheral: peripheral.clone(),
        });
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.emit(CentralEvent::DeviceDisconnected {
            peripheral: peripheral.clone(),
            cause: DisconnectCause::Requested,
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()> {
        let available = [
            Characteristic::new(
                WRITE_CHARACTERISTIC_UUID,
                YLINK_SERVICE_UUID,
                vec![CharacteristicProperty::Write, CharacteristicProperty::Notify],
            ),
            Characteristic::new(
                OTA_CHARACTERISTIC_UUID,
                YLINK_SERVICE_UUID,
                vec![CharacteristicProperty::WriteWithoutResponse],
            ),
        ];
        self.emit(CentralEvent::CharacteristicsDiscovered {
            peripheral: peripheral.clone(),
            service,
            characteristics: available
                .into_iter()
                .filter(|c| characteristics.contains(&c.uuid))
                .collect(),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        _peripheral: &PeripheralId,
        _characteristic: &Characteristic,
    ) -> Result<()> {
        Ok(())
    }

    async fn read(&self, peripheral: &PeripheralId, _characteristic: &Characteristic) -> Result<()> {
        let frame = self
            .state
            .lock()
            .unwrap()
            .completions
            .get(peripheral)
            .cloned()
            .ok_or_else(|| Error::Radio("nothing to read".into()))?;
        self.notify(peripheral, frame);
        Ok(())
    }

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: CharacteristicWriteType,
    ) -> Result<()> {
        if characteristic.uuid == OTA_CHARACTERISTIC_UUID {
            self.on_packet(peripheral, data);
            return Ok(());
        }
        self.state
            .lock()
            .unwrap()
            .frames
            .push((peripheral.clone(), data.to_vec()));
        if write_type == CharacteristicWriteType::WriteWithResponse {
            self.emit(CentralEvent::CharacteristicWritten {
                peripheral: peripheral.clone(),
                characteristic: characteristic.uuid,
                error: None,
            });
        }
        self.on_frame(peripheral, data);
        Ok(())
    }

    async fn adapter_state(&self) -> Result<CentralState> {
        Ok(CentralState::PoweredOn)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Report {
    FirmwareStatus(MacAddress, u8),
    FirmwareComplete(MacAddress, String),
    ControlDataStatus(MacAddress, u8),
    ControlDataComplete(MacAddress, String),
}

/// Backend serving fixed yLink lists and one firmware binary.
#[derive(Default)]
pub struct FixtureBackend {
    pub ota: Vec<YLink>,
    pub control_data: Vec<YLink>,
    pub binary: Vec<u8>,
    pub downloads: AtomicUsize,
    pub reports: Mutex<Vec<Report>>,
}

impl FixtureBackend {
    fn find(list: &[YLink], ylink: &YLink) -> Result<YLink> {
        list.iter()
            .find(|candidate| candidate.mac_address == ylink.mac_address)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("unknown yLink {}", ylink.mac_address)))
    }

    fn record(&self, report: Report) {
        self.reports.lock().unwrap().push(report);
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for FixtureBackend {
    async fn ylinks_with_ota_updates(&self, _hotel_id: u64) -> Result<Vec<YLink>> {
        Ok(self.ota.clone())
    }

    async fn ylinks_with_control_data_updates(&self, _hotel_id: u64) -> Result<Vec<YLink>> {
        Ok(self.control_data.clone())
    }

    async fn ota_update(&self, _hotel_id: u64, ylink: &YLink) -> Result<YLink> {
        Self::find(&self.ota, ylink)
    }

    async fn control_data_update(&self, _hotel_id: u64, ylink: &YLink) -> Result<YLink> {
        Self::find(&self.control_data, ylink)
    }

    async fn report_firmware_status(
        &self,
        _hotel_id: u64,
        ylink: &YLink,
        code: u8,
        _time_to_update: Option<Duration>,
    ) -> Result<()> {
        self.record(Report::FirmwareStatus(ylink.mac_address, code));
        Ok(())
    }

    async fn report_firmware_update_complete(
        &self,
        _hotel_id: u64,
        ylink: &YLink,
        hex: &str,
    ) -> Result<()> {
        self.record(Report::FirmwareComplete(ylink.mac_address, hex.to_string()));
        Ok(())
    }

    async fn report_control_data_status(
        &self,
        _hotel_id: u64,
        ylink: &YLink,
        code: u8,
    ) -> Result<()> {
        self.record(Report::ControlDataStatus(ylink.mac_address, code));
        Ok(())
    }

    async fn report_control_data_update_complete(
        &self,
        _hotel_id: u64,
        ylink: &YLink,
        hex: &str,
    ) -> Result<()> {
        self.record(Report::ControlDataComplete(ylink.mac_address, hex.to_string()));
        Ok(())
    }

    async fn download_firmware(
        &self,
        _url: &str,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let len = self.binary.len() as u64;
        progress(DownloadProgress {
            bytes_read: len,
            total_bytes_read: len,
            total_bytes_expected: Some(len),
        });
        Ok(self.binary.clone())
    }
}

pub struct Rig {
    pub handle: UpdaterHandle,
    pub lock: Arc<SimulatedLock>,
    pub backend: Arc<FixtureBackend>,
    pub events: UnboundedReceiver<UpdateEvent>,
    pub central_tx: Sender<CentralEvent>,
    _dir: TempDir,
}

impl Rig {
    /// Spawns an updater over a simulated lock that asks for firmware from
    /// `resume_offset`.
    pub fn launch(backend: FixtureBackend, config: UpdaterConfig, resume_offset: u32) -> Rig {
        let dir = TempDir::new().unwrap();
        let config = UpdaterConfig {
            firmware_cache_dir: dir.path().to_path_buf(),
            ..config
        };
        let (central_tx, central_rx) = mpsc::channel(64);
        let lock = SimulatedLock::new(central_tx.clone(), resume_offset);
        let backend = Arc::new(backend);
        let (updater, handle, events) =
            Updater::new(lock.clone(), central_rx, backend.clone(), 1, config).unwrap();
        tokio::spawn(updater.run());
        Rig {
            handle,
            lock,
            backend,
            events,
            central_tx,
            _dir: dir,
        }
    }

    /// Enough in-range sightings to count as discovered.
    pub async fn sight(&self, mac: MacAddress) {
        for _ in 0..2 {
            self.central_tx.send(advert(mac, -50)).await.unwrap();
        }
    }

    /// Collects events until one matches, failing after a long virtual
    /// timeout.
    pub async fn wait_for(
        &mut self,
        what: &str,
        mut matches: impl FnMut(&UpdateEvent) -> bool,
    ) -> Vec<UpdateEvent> {
        let mut seen = Vec::new();
        let result = tokio::time::timeout(Duration::from_secs(600), async {
            while let Some(event) = self.events.recv().await {
                let done = matches(&event);
                seen.push(event);
                if done {
                    return true;
                }
            }
            false
        })
        .await;
        match result {
            Ok(true) => seen,
            _ => panic!("never saw {what}; got {seen:#?}"),
        }
    }
}
