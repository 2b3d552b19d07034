//! Session orchestration: one task owns both services and serializes every
//! radio event, timer, backend completion and operator command.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::api::backend::Backend;
use crate::api::central::{CentralManager, PeripheralId, ScanFilter};
use crate::api::central_event::{CentralEvent, CentralState, DisconnectCause};
use crate::config::{UpdateMode, UpdaterConfig};
use crate::events::{ControlDataEvent, OtaEvent, UpdateEvent, UpdaterSnapshot};
use crate::firmware_store::FirmwareStore;
use crate::model::{MacAddress, YLink};
use crate::model::advert::{AdvertFlag, mac_from_advert};
use crate::scheduler::{Flow, Scheduler};
use crate::service::{Context, ControlDataService, Inbound, OtaService};
use crate::{Error, Result};

const COMMAND_CHANNEL_SIZE: usize = 32;

#[derive(Debug)]
enum Command {
    Start {
        responder: oneshot::Sender<Result<()>>,
    },
    Stop {
        responder: oneshot::Sender<()>,
    },
    Refresh {
        responder: oneshot::Sender<()>,
    },
    SetMode {
        mode: UpdateMode,
        responder: oneshot::Sender<()>,
    },
    Mode {
        responder: oneshot::Sender<UpdateMode>,
    },
    RequestOtaUpdate {
        address: MacAddress,
        responder: oneshot::Sender<bool>,
    },
    RequestControlDataUpdate {
        address: MacAddress,
        responder: oneshot::Sender<bool>,
    },
    Snapshot {
        responder: oneshot::Sender<UpdaterSnapshot>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable control surface of a running [`Updater`].
#[derive(Clone, Debug)]
pub struct UpdaterHandle {
    command_tx: Sender<Command>,
}

impl UpdaterHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (responder, response) = oneshot::channel();
        self.command_tx
            .send(command(responder))
            .await
            .map_err(|_| Error::UpdaterStopped)?;
        response.await.map_err(|_| Error::UpdaterStopped)
    }

    /// Fetches the hotel's pending updates and starts scanning for them.
    pub async fn start(&self) -> Result<()> {
        self.request(|responder| Command::Start { responder }).await?
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(|responder| Command::Stop { responder }).await
    }

    /// Re-fetches pending updates and rebuilds both operation lists.
    pub async fn refresh(&self) -> Result<()> {
        self.request(|responder| Command::Refresh { responder }).await
    }

    pub async fn set_mode(&self, mode: UpdateMode) -> Result<()> {
        self.request(|responder| Command::SetMode { mode, responder })
            .await
    }

    pub async fn mode(&self) -> Result<UpdateMode> {
        self.request(|responder| Command::Mode { responder }).await
    }

    /// False when the yLink has no OTA operation, it already finished or is
    /// underway, or too many updates are running.
    pub async fn request_ota_update(&self, address: MacAddress) -> Result<bool> {
        self.request(|responder| Command::RequestOtaUpdate { address, responder })
            .await
    }

    pub async fn request_control_data_update(&self, address: MacAddress) -> Result<bool> {
        self.request(|responder| Command::RequestControlDataUpdate { address, responder })
            .await
    }

    pub async fn snapshot(&self) -> Result<UpdaterSnapshot> {
        self.request(|responder| Command::Snapshot { responder })
            .await
    }

    /// Ends every session and stops the updater task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|responder| Command::Shutdown { responder })
            .await
    }
}

pub struct Updater {
    cx: Context,
    ota: OtaService,
    control_data: ControlDataService,
    central_rx: Receiver<CentralEvent>,
    inbound_rx: UnboundedReceiver<Inbound>,
    command_rx: Receiver<Command>,
    started: bool,
}

impl Updater {
    /// `central_rx` must be the event channel `central` reports on. Fails
    /// when `config` does not validate.
    pub fn new(
        central: Arc<dyn CentralManager>,
        central_rx: Receiver<CentralEvent>,
        backend: Arc<dyn Backend>,
        hotel_id: u64,
        config: UpdaterConfig,
    ) -> Result<(Updater, UpdaterHandle, UnboundedReceiver<UpdateEvent>)> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        let store = FirmwareStore::new(config.firmware_cache_dir.clone());
        let cx = Context {
            central,
            backend,
            events: events_tx,
            inbound: inbound_tx.clone(),
            scheduler: Scheduler::new(inbound_tx),
            mode: config.mode,
            config,
            hotel_id,
            rescan_requested: false,
        };
        let updater = Updater {
            cx,
            ota: OtaService::new(store),
            control_data: ControlDataService::new(),
            central_rx,
            inbound_rx,
            command_rx,
            started: false,
        };
        Ok((updater, UpdaterHandle { command_tx }, events_rx))
    }

    /// Runs until shut down or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Updater running for hotel {}", self.cx.hotel_id);
        loop {
            // Radio events first, so a command sees every event queued
            // before it.
            tokio::select! {
                biased;
                Some(event) = self.central_rx.recv() => self.handle_central_event(event).await,
                Some(inbound) = self.inbound_rx.recv() => self.handle_inbound(inbound).await,
                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
            }

            if self.cx.rescan_requested {
                self.cx.rescan_requested = false;
                self.rescan().await;
            }
        }
        self.halt().await;
        info!("Updater stopped");
    }

    /// Returns false once the loop should exit.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start { responder } => {
                self.started = true;
                let result = match self.cx.central.adapter_state().await {
                    Ok(CentralState::PoweredOff) => {
                        warn!("Bluetooth is off, waiting for it to power on");
                        Ok(())
                    }
                    Ok(_) => {
                        self.fetch_updates();
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = responder.send(result);
            }
            Command::Stop { responder } => {
                self.started = false;
                self.halt().await;
                let _ = responder.send(());
            }
            Command::Refresh { responder } => {
                if self.started {
                    self.fetch_updates();
                }
                let _ = responder.send(());
            }
            Command::SetMode { mode, responder } => {
                info!("Update mode set to {mode:?}");
                self.cx.mode = mode;
                if mode == UpdateMode::Automatic {
                    self.cx.request_rescan();
                }
                let _ = responder.send(());
            }
            Command::Mode { responder } => {
                let _ = responder.send(self.cx.mode);
            }
            Command::RequestOtaUpdate { address, responder } => {
                let accepted = self.ota.request_update(&mut self.cx, address);
                let _ = responder.send(accepted);
            }
            Command::RequestControlDataUpdate { address, responder } => {
                let accepted = self.control_data.request_update(&mut self.cx, address);
                let _ = responder.send(accepted);
            }
            Command::Snapshot { responder } => {
                let _ = responder.send(UpdaterSnapshot {
                    ota: self.ota.snapshots(),
                    control_data: self.control_data.snapshots(),
                });
            }
            Command::Shutdown { responder } => {
                self.halt().await;
                let _ = responder.send(());
                return false;
            }
        }
        true
    }

    async fn handle_central_event(&mut self, event: CentralEvent) {
        trace!("{event:?}");
        match event {
            CentralEvent::StateUpdate { state } => self.on_state(state).await,
            CentralEvent::DeviceDiscovered {
                peripheral,
                services,
                manufacturer_data,
                rssi,
            } => {
                self.on_advert(peripheral, &services, manufacturer_data.as_deref(), rssi)
                    .await
            }
            CentralEvent::DeviceConnected { peripheral } => {
                if self.ota.owns_peripheral(&peripheral) {
                    self.ota.on_connected(&mut self.cx, &peripheral).await;
                } else if self.control_data.owns_peripheral(&peripheral) {
                    self.control_data
                        .on_connected(&mut self.cx, &peripheral)
                        .await;
                } else {
                    debug!("Connected to {peripheral} with no operation, disconnecting");
                    if let Err(e) = self.cx.central.disconnect(&peripheral).await {
                        warn!("Failed to disconnect {peripheral}: {e}");
                    }
                }
            }
            CentralEvent::DeviceConnectionFailed { peripheral, error } => {
                let cause = DisconnectCause::Failure(error.unwrap_or_else(|| "unknown".into()));
                self.on_disconnected(&peripheral, &cause).await;
            }
            CentralEvent::DeviceDisconnected { peripheral, cause } => {
                self.on_disconnected(&peripheral, &cause).await;
            }
            CentralEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                characteristics,
            } => {
                trace!("{} characteristics of {service} on {peripheral}", characteristics.len());
                if self.ota.owns_peripheral(&peripheral) {
                    self.ota
                        .on_characteristics(&mut self.cx, &peripheral, characteristics)
                        .await;
                } else if self.control_data.owns_peripheral(&peripheral) {
                    self.control_data
                        .on_characteristics(&mut self.cx, &peripheral, characteristics)
                        .await;
                }
            }
            CentralEvent::CharacteristicNotified {
                peripheral,
                characteristic,
                value,
            } => {
                if self.ota.owns_peripheral(&peripheral) {
                    self.ota
                        .on_notified(&mut self.cx, &peripheral, characteristic, value)
                        .await;
                } else if self.control_data.owns_peripheral(&peripheral) {
                    self.control_data
                        .on_notified(&mut self.cx, &peripheral, characteristic, value)
                        .await;
                }
            }
            CentralEvent::CharacteristicWritten {
                peripheral,
                characteristic,
                error,
            } => {
                if self.ota.owns_peripheral(&peripheral) {
                    self.ota
                        .on_written(&peripheral, characteristic, error.as_deref());
                } else if self.control_data.owns_peripheral(&peripheral) {
                    self.control_data
                        .on_written(&mut self.cx, &peripheral, characteristic, error.as_deref())
                        .await;
                }
            }
        }
    }

    async fn on_state(&mut self, state: CentralState) {
        match state {
            CentralState::PoweredOn => {
                info!("Bluetooth powered on");
                if self.started {
                    self.fetch_updates();
                }
            }
            CentralState::PoweredOff => {
                warn!("Bluetooth powered off, ending all sessions");
                self.halt().await;
            }
            CentralState::Unknown => debug!("Bluetooth state unknown"),
        }
    }

    async fn on_advert(
        &mut self,
        peripheral: PeripheralId,
        services: &[Uuid],
        manufacturer_data: Option<&[u8]>,
        rssi: i16,
    ) {
        let flag = manufacturer_data.and_then(AdvertFlag::from_manufacturer_data);
        for address in services.iter().filter_map(mac_from_advert) {
            if flag == Some(AdvertFlag::HasKey) {
                warn!("yLink {address} is advertising a key, not updating it now");
                continue;
            }
            if self.ota.owns_address(address) {
                self.ota
                    .on_discovered(&mut self.cx, address, peripheral.clone(), rssi)
                    .await;
            } else if self.control_data.owns_address(address) {
                self.control_data
                    .on_discovered(&mut self.cx, address, peripheral.clone(), rssi)
                    .await;
            } else {
                trace!("Ignoring yLink {address}, nothing to update");
            }
        }
    }

    async fn on_disconnected(&mut self, peripheral: &PeripheralId, cause: &DisconnectCause) {
        if self.ota.owns_peripheral(peripheral) {
            self.ota
                .on_disconnected(&mut self.cx, peripheral, cause)
                .await;
        } else if self.control_data.owns_peripheral(peripheral) {
            self.control_data
                .on_disconnected(&mut self.cx, peripheral, cause)
                .await;
        }
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Timer { key, generation } => {
                if !self.cx.scheduler.fire(&key, generation) {
                    trace!("Stale timer {key:?}");
                    return;
                }
                match key.flow {
                    Flow::Ota => self.ota.on_timer(&mut self.cx, key).await,
                    Flow::ControlData => self.control_data.on_timer(&mut self.cx, key).await,
                }
            }
            Inbound::OtaVerified {
                address,
                prior,
                result,
            } => {
                self.ota
                    .on_verified(&mut self.cx, address, prior, result)
                    .await
            }
            Inbound::ControlDataVerified {
                address,
                prior,
                result,
            } => {
                self.control_data
                    .on_verified(&mut self.cx, address, prior, result)
                    .await
            }
            Inbound::FirmwareProgress { address, progress } => {
                self.ota
                    .on_download_progress(&mut self.cx, address, progress)
            }
            Inbound::FirmwareDownloaded { address, result } => {
                self.ota
                    .on_downloaded(&mut self.cx, address, result)
                    .await
            }
            Inbound::UpdatesFetched { ota, control_data } => {
                self.on_updates_fetched(ota, control_data).await
            }
        }
    }

    fn fetch_updates(&self) {
        let backend = self.cx.backend.clone();
        let inbound = self.cx.inbound.clone();
        let hotel_id = self.cx.hotel_id;
        debug!("Fetching pending updates for hotel {hotel_id}");
        tokio::spawn(async move {
            let (ota, control_data) = futures::join!(
                backend.ylinks_with_ota_updates(hotel_id),
                backend.ylinks_with_control_data_updates(hotel_id)
            );
            let _ = inbound.send(Inbound::UpdatesFetched { ota, control_data });
        });
    }

    async fn on_updates_fetched(
        &mut self,
        ota: Result<Vec<YLink>>,
        control_data: Result<Vec<YLink>>,
    ) {
        match ota {
            Ok(ylinks) => self.ota.set_pending(ylinks),
            Err(e) => error!("Failed to fetch yLinks with OTA updates: {e}"),
        }
        match control_data {
            Ok(ylinks) => self.control_data.set_pending(ylinks),
            Err(e) => error!("Failed to fetch yLinks with control data updates: {e}"),
        }
        if !self.started {
            return;
        }
        self.ota.restart_all(&mut self.cx).await;
        self.control_data.restart_all(&mut self.cx).await;
        self.cx.request_rescan();
    }

    async fn rescan(&mut self) {
        if !self.started {
            return;
        }
        let services: BTreeSet<Uuid> = self
            .ota
            .scan_services()
            .chain(self.control_data.scan_services())
            .collect();
        let result = if services.is_empty() {
            debug!("Nothing left to scan for");
            self.cx.central.stop_scan().await
        } else {
            trace!("Scanning for {} yLinks", services.len());
            let filter = ScanFilter {
                services: services.into_iter().collect(),
                allow_duplicates: false,
            };
            self.cx.central.start_scan(filter).await
        };
        if let Err(e) = result {
            error!("Failed to update scan: {e}");
        }
    }

    async fn halt(&mut self) {
        if let Err(e) = self.cx.central.stop_scan().await {
            warn!("Failed to stop scan: {e}");
        }
        let had_ota = !self.ota.operations().is_empty();
        let had_control_data = !self.control_data.operations().is_empty();
        self.ota.end_all(&mut self.cx).await;
        self.control_data.end_all(&mut self.cx).await;
        if had_ota {
            self.cx.emit(OtaEvent::FoundUpdates(Vec::new()));
        }
        if had_control_data {
            self.cx.emit(ControlDataEvent::FoundUpdates(Vec::new()));
        }
        self.cx.scheduler.cancel_all();
        self.cx.rescan_requested = false;
    }
}
