//! [`CentralManager`] on top of `btleplug`, for every desktop platform it
//! supports.
//!
//! Each connected peripheral gets a worker task that runs its requests one
//! after the other, so frames reach the lock in the order they were
//! written.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent as BtEvent, CentralState as BtState, CharPropFlags, Manager as _,
    Peripheral as _, ScanFilter as BtScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId as BtPeripheralId};
use futures::StreamExt;
use log::{debug, error, trace, warn};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, Sender, UnboundedSender};
use uuid::Uuid;

use crate::api::central::{CentralManager, PeripheralId, ScanFilter};
use crate::api::central_event::{CentralEvent, CentralState, DisconnectCause};
use crate::api::characteristic::{Characteristic, CharacteristicProperty, CharacteristicWriteType};
use crate::model::advert::YIKES_COMPANY_ID;
use crate::{Error, Result};

fn radio(e: btleplug::Error) -> Error {
    Error::Radio(e.to_string())
}

fn peripheral_id(id: &BtPeripheralId) -> PeripheralId {
    PeripheralId(format!("{id:?}"))
}

fn properties(flags: CharPropFlags) -> Vec<CharacteristicProperty> {
    [
        (CharPropFlags::BROADCAST, CharacteristicProperty::Broadcast),
        (CharPropFlags::READ, CharacteristicProperty::Read),
        (
            CharPropFlags::WRITE_WITHOUT_RESPONSE,
            CharacteristicProperty::WriteWithoutResponse,
        ),
        (CharPropFlags::WRITE, CharacteristicProperty::Write),
        (
            CharPropFlags::AUTHENTICATED_SIGNED_WRITES,
            CharacteristicProperty::AuthenticatedSignedWrites,
        ),
        (CharPropFlags::NOTIFY, CharacteristicProperty::Notify),
        (CharPropFlags::INDICATE, CharacteristicProperty::Indicate),
        (
            CharPropFlags::EXTENDED_PROPERTIES,
            CharacteristicProperty::ExtendedProperties,
        ),
    ]
    .into_iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, property)| property)
    .collect()
}

fn central_state(state: BtState) -> CentralState {
    match state {
        BtState::PoweredOn => CentralState::PoweredOn,
        BtState::PoweredOff => CentralState::PoweredOff,
        _ => CentralState::Unknown,
    }
}

#[derive(Debug)]
enum LinkRequest {
    Connect,
    Disconnect,
    Discover {
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    Subscribe(Uuid),
    Read(Uuid),
    Write {
        characteristic: Uuid,
        data: Vec<u8>,
        write_type: CharacteristicWriteType,
    },
}

struct Shared {
    adapter: Adapter,
    events: Sender<CentralEvent>,
    peripherals: Mutex<HashMap<PeripheralId, Peripheral>>,
    links: Mutex<HashMap<PeripheralId, UnboundedSender<LinkRequest>>>,
    requested_disconnects: Mutex<HashSet<PeripheralId>>,
}

impl Shared {
    async fn send_event(&self, event: CentralEvent) {
        if let Err(e) = self.events.send(event).await {
            error!("Error sending central event: {}", e);
        }
    }
}

pub struct BtleplugCentral {
    shared: Arc<Shared>,
}

impl BtleplugCentral {
    /// Uses the first adapter the platform reports. Events go to `events`.
    pub async fn new(events: Sender<CentralEvent>) -> Result<Self> {
        let manager = Manager::new().await.map_err(radio)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(radio)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Radio("No Bluetooth adapter found".into()))?;
        let stream = adapter.events().await.map_err(radio)?;

        let shared = Arc::new(Shared {
            adapter,
            events,
            peripherals: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            requested_disconnects: Mutex::new(HashSet::new()),
        });

        let pump = shared.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            while let Some(event) = stream.next().await {
                handle_adapter_event(&pump, event).await;
            }
            debug!("Adapter event stream ended");
        });

        Ok(BtleplugCentral { shared })
    }

    async fn link(&self, peripheral: &PeripheralId) -> Result<UnboundedSender<LinkRequest>> {
        let mut links = self.shared.links.lock().await;
        if let Some(link) = links.get(peripheral) {
            if !link.is_closed() {
                return Ok(link.clone());
            }
        }
        let device = self
            .shared
            .peripherals
            .lock()
            .await
            .get(peripheral)
            .cloned()
            .ok_or_else(|| Error::UnknownPeripheral(peripheral.to_string()))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = self.shared.clone();
        let id = peripheral.clone();
        tokio::spawn(async move {
            let mut worker = LinkWorker {
                shared,
                id,
                device,
                notifying: false,
            };
            while let Some(request) = rx.recv().await {
                worker.handle(request).await;
            }
        });
        links.insert(peripheral.clone(), tx.clone());
        Ok(tx)
    }

    async fn request(&self, peripheral: &PeripheralId, request: LinkRequest) -> Result<()> {
        self.link(peripheral)
            .await?
            .send(request)
            .map_err(|_| Error::Radio(format!("Link worker for {peripheral} stopped")))
    }
}

async fn handle_adapter_event(shared: &Arc<Shared>, event: BtEvent) {
    match event {
        BtEvent::DeviceDiscovered(id) | BtEvent::DeviceUpdated(id) => advert(shared, &id).await,
        BtEvent::DeviceConnected(id) => {
            shared
                .send_event(CentralEvent::DeviceConnected {
                    peripheral: peripheral_id(&id),
                })
                .await;
        }
        BtEvent::DeviceDisconnected(id) => {
            let peripheral = peripheral_id(&id);
            let requested = shared
                .requested_disconnects
                .lock()
                .await
                .remove(&peripheral);
            let cause = if requested {
                DisconnectCause::Requested
            } else {
                DisconnectCause::Remote
            };
            shared
                .send_event(CentralEvent::DeviceDisconnected { peripheral, cause })
                .await;
        }
        BtEvent::StateUpdate(state) => {
            shared
                .send_event(CentralEvent::StateUpdate {
                    state: central_state(state),
                })
                .await;
        }
        other => trace!("Unhandled adapter event {other:?}"),
    }
}

async fn advert(shared: &Arc<Shared>, id: &BtPeripheralId) {
    let device = match shared.adapter.peripheral(id).await {
        Ok(device) => device,
        Err(e) => {
            debug!("Lost track of {id:?}: {e}");
            return;
        }
    };
    let Ok(Some(props)) = device.properties().await else {
        return;
    };
    let Some(rssi) = props.rssi else {
        return;
    };
    let manufacturer_data = props
        .manufacturer_data
        .get(&YIKES_COMPANY_ID)
        .map(|payload| {
            let mut data = YIKES_COMPANY_ID.to_le_bytes().to_vec();
            data.extend_from_slice(payload);
            data
        });

    let peripheral = peripheral_id(id);
    shared
        .peripherals
        .lock()
        .await
        .insert(peripheral.clone(), device);
    shared
        .send_event(CentralEvent::DeviceDiscovered {
            peripheral,
            services: props.services,
            manufacturer_data,
            rssi,
        })
        .await;
}

struct LinkWorker {
    shared: Arc<Shared>,
    id: PeripheralId,
    device: Peripheral,
    notifying: bool,
}

impl LinkWorker {
    async fn handle(&mut self, request: LinkRequest) {
        trace!("{}: {request:?}", self.id);
        match request {
            LinkRequest::Connect => {
                self.notifying = false;
                if let Err(e) = self.device.connect().await {
                    self.shared
                        .send_event(CentralEvent::DeviceConnectionFailed {
                            peripheral: self.id.clone(),
                            error: Some(e.to_string()),
                        })
                        .await;
                }
            }
            LinkRequest::Disconnect => {
                self.shared
                    .requested_disconnects
                    .lock()
                    .await
                    .insert(self.id.clone());
                if let Err(e) = self.device.disconnect().await {
                    warn!("{}: disconnect failed: {e}", self.id);
                }
            }
            LinkRequest::Discover {
                service,
                characteristics,
            } => self.discover(service, &characteristics).await,
            LinkRequest::Subscribe(uuid) => self.subscribe(uuid).await,
            LinkRequest::Read(uuid) => {
                let Some(characteristic) = self.characteristic(uuid) else {
                    return;
                };
                match self.device.read(&characteristic).await {
                    Ok(value) => {
                        self.shared
                            .send_event(CentralEvent::CharacteristicNotified {
                                peripheral: self.id.clone(),
                                characteristic: uuid,
                                value,
                            })
                            .await
                    }
                    Err(e) => warn!("{}: read of {uuid} failed: {e}", self.id),
                }
            }
            LinkRequest::Write {
                characteristic,
                data,
                write_type,
            } => self.write(characteristic, &data, write_type).await,
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Option<btleplug::api::Characteristic> {
        let found = self
            .device
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid);
        if found.is_none() {
            warn!("{}: characteristic {uuid} not discovered", self.id);
        }
        found
    }

    async fn discover(&self, service: Uuid, wanted: &[Uuid]) {
        if let Err(e) = self.device.discover_services().await {
            error!("{}: service discovery failed: {e}", self.id);
            return;
        }
        let characteristics = self
            .device
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == service && wanted.contains(&c.uuid))
            .map(|c| Characteristic::new(c.uuid, c.service_uuid, properties(c.properties)))
            .collect();
        self.shared
            .send_event(CentralEvent::CharacteristicsDiscovered {
                peripheral: self.id.clone(),
                service,
                characteristics,
            })
            .await;
    }

    async fn subscribe(&mut self, uuid: Uuid) {
        let Some(characteristic) = self.characteristic(uuid) else {
            return;
        };
        if let Err(e) = self.device.subscribe(&characteristic).await {
            error!("{}: subscribe to {uuid} failed: {e}", self.id);
            return;
        }
        if self.notifying {
            return;
        }
        let mut notifications = match self.device.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("{}: no notification stream: {e}", self.id);
                return;
            }
        };
        self.notifying = true;
        let shared = self.shared.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                shared
                    .send_event(CentralEvent::CharacteristicNotified {
                        peripheral: id.clone(),
                        characteristic: notification.uuid,
                        value: notification.value,
                    })
                    .await;
            }
            trace!("{id}: notification stream ended");
        });
    }

    async fn write(&self, uuid: Uuid, data: &[u8], write_type: CharacteristicWriteType) {
        let Some(characteristic) = self.characteristic(uuid) else {
            return;
        };
        let result = match write_type {
            CharacteristicWriteType::WriteWithResponse => {
                self.device
                    .write(&characteristic, data, WriteType::WithResponse)
                    .await
            }
            CharacteristicWriteType::WriteWithoutResponse => {
                self.device
                    .write(&characteristic, data, WriteType::WithoutResponse)
                    .await
            }
        };
        match (write_type, result) {
            (CharacteristicWriteType::WriteWithResponse, result) => {
                self.shared
                    .send_event(CentralEvent::CharacteristicWritten {
                        peripheral: self.id.clone(),
                        characteristic: uuid,
                        error: result.err().map(|e| e.to_string()),
                    })
                    .await;
            }
            (CharacteristicWriteType::WriteWithoutResponse, Err(e)) => {
                warn!("{}: write to {uuid} failed: {e}", self.id)
            }
            (CharacteristicWriteType::WriteWithoutResponse, Ok(())) => {}
        }
    }
}

#[async_trait]
impl CentralManager for BtleplugCentral {
    async fn start_scan(&self, filter: ScanFilter) -> Result<()> {
        if filter.allow_duplicates {
            trace!("Duplicate filtering is left to the platform");
        }
        self.shared
            .adapter
            .start_scan(BtScanFilter {
                services: filter.services,
            })
            .await
            .map_err(radio)
    }

    async fn stop_scan(&self) -> Result<()> {
        self.shared.adapter.stop_scan().await.map_err(radio)
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.request(peripheral, LinkRequest::Connect).await
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.request(peripheral, LinkRequest::Disconnect).await
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()> {
        self.request(
            peripheral,
            LinkRequest::Discover {
                service,
                characteristics: characteristics.to_vec(),
            },
        )
        .await
    }

    async fn subscribe(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
    ) -> Result<()> {
        self.request(peripheral, LinkRequest::Subscribe(characteristic.uuid))
            .await
    }

    async fn read(&self, peripheral: &PeripheralId, characteristic: &Characteristic) -> Result<()> {
        self.request(peripheral, LinkRequest::Read(characteristic.uuid))
            .await
    }

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: CharacteristicWriteType,
    ) -> Result<()> {
        self.request(
            peripheral,
            LinkRequest::Write {
                characteristic: characteristic.uuid,
                data: data.to_vec(),
                write_type,
            },
        )
        .await
    }

    async fn adapter_state(&self) -> Result<CentralState> {
        let state = self.shared.adapter.adapter_state().await.map_err(radio)?;
        Ok(central_state(state))
    }
}
