//! Over-the-air firmware and RFID control-data updates for yLink door-lock
//! controllers over Bluetooth Low Energy.
//!
//! An [`Updater`] owns a [`CentralManager`](api::central::CentralManager)
//! and a [`Backend`](api::backend::Backend). It scans for the yLinks the
//! backend says need an update, runs each update over its own BLE session
//! and reports progress as [`UpdateEvent`]s.

pub mod api;
#[cfg(feature = "btleplug")]
pub mod btleplug_central;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod firmware_store;
pub mod model;
pub mod operation;
pub(crate) mod scheduler;
pub(crate) mod service;
pub mod updater;

pub use config::{UpdateMode, UpdaterConfig};
pub use error::{Error, Result};
pub use events::{ControlDataEvent, OtaEvent, UpdateEvent, UpdaterSnapshot};
pub use updater::{Updater, UpdaterHandle};

/// Installs `pretty_env_logger` at `level`. `RUST_LOG` still refines it
/// per module. Calling it twice is harmless.
pub fn init_logging(level: log::LevelFilter) {
    let _ = pretty_env_logger::formatted_builder()
        .filter_level(level)
        .parse_default_env()
        .try_init();
}
