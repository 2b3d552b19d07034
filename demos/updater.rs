//! Runs the updater against the local radio with a hotel read from a JSON
//! fixture.
//!
//! ```text
//! cargo run --example updater --features btleplug -- hotel.json [config.json]
//! ```
//!
//! `file_location` of each firmware is read as a local path. Reports are
//! only logged.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{LevelFilter, info, warn};
use tokio::sync::mpsc;
use ylinkcore::api::backend::{Backend, DownloadProgress};
use ylinkcore::api::central_event::CentralEvent;
use ylinkcore::btleplug_central::BtleplugCentral;
use ylinkcore::model::{Hotel, YLink};
use ylinkcore::{Error, Result, UpdateEvent, Updater, UpdaterConfig};

struct FixtureBackend {
    hotel: Hotel,
}

impl FixtureBackend {
    fn find(&self, ylink: &YLink, list: &[YLink]) -> Result<YLink> {
        list.iter()
            .find(|candidate| candidate.mac_address == ylink.mac_address)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("{} is not in the fixture", ylink.mac_address)))
    }
}

#[async_trait]
impl Backend for FixtureBackend {
    async fn ylinks_with_ota_updates(&self, _hotel_id: u64) -> Result<Vec<YLink>> {
        Ok(self.hotel.ylinks_with_ota_updates.clone())
    }

    async fn ylinks_with_control_data_updates(&self, _hotel_id: u64) -> Result<Vec<YLink>> {
        Ok(self.hotel.ylinks_with_control_data_updates.clone())
    }

    async fn ota_update(&self, _hotel_id: u64, ylink: &YLink) -> Result<YLink> {
        self.find(ylink, &self.hotel.ylinks_with_ota_updates)
    }

    async fn control_data_update(&self, _hotel_id: u64, ylink: &YLink) -> Result<YLink> {
        self.find(ylink, &self.hotel.ylinks_with_control_data_updates)
    }

    async fn report_firmware_status(
        &self,
        _hotel_id: u64,
        ylink: &YLink,
        code: u8,
        time_to_update: Option<Duration>,
    ) -> Result<()> {
        info!(
            "Room {}: firmware status {code} ({time_to_update:?})",
            ylink.room()
        );
        Ok(())
    }

    async fn report_firmware_update_complete(
        &self,
        _hotel_id: u64,
        ylink: &YLink,
        hex: &str,
    ) -> Result<()> {
        info!("Room {}: firmware complete {hex}", ylink.room());
        Ok(())
    }

    async fn report_control_data_status(
        &self,
        _hotel_id: u64,
        ylink: &YLink,
        code: u8,
    ) -> Result<()> {
        info!("Room {}: control data status {code}", ylink.room());
        Ok(())
    }

    async fn report_control_data_update_complete(
        &self,
        _hotel_id: u64,
        ylink: &YLink,
        hex: &str,
    ) -> Result<()> {
        info!("Room {}: control data complete {hex}", ylink.room());
        Ok(())
    }

    async fn download_firmware(
        &self,
        url: &str,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<Vec<u8>> {
        let binary = tokio::fs::read(url).await?;
        let len = binary.len() as u64;
        progress(DownloadProgress {
            bytes_read: len,
            total_bytes_read: len,
            total_bytes_expected: Some(len),
        });
        Ok(binary)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    ylinkcore::init_logging(LevelFilter::Info);

    let mut args = std::env::args().skip(1);
    let hotel_path = args
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| Error::Config("usage: updater <hotel.json> [config.json]".into()))?;
    let config = match args.next() {
        Some(path) => UpdaterConfig::load(path)?,
        None => UpdaterConfig::default(),
    };

    let hotel: Hotel = serde_json::from_str(&std::fs::read_to_string(hotel_path)?)?;
    let hotel_id = hotel.id;

    let (central_tx, central_rx) = mpsc::channel::<CentralEvent>(256);
    let central = Arc::new(BtleplugCentral::new(central_tx).await?);
    let backend = Arc::new(FixtureBackend { hotel });

    let (updater, handle, mut events) =
        Updater::new(central, central_rx, backend, hotel_id, config)?;
    tokio::spawn(updater.run());
    handle.start().await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(UpdateEvent::Ota(event)) => info!("{event:?}"),
                Some(UpdateEvent::ControlData(event)) => info!("{event:?}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, shutting down");
                handle.shutdown().await?;
                break;
            }
        }
    }
    Ok(())
}
