use thiserror::Error;

use crate::codec::CodecError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Radio error: {0}")]
    Radio(String),

    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid hex: {0}")]
    Hex(#[from] data_encoding::DecodeError),

    #[error("Invalid MAC address: {0}")]
    InvalidMacAddress(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Updater is not running")]
    UpdaterStopped,
}

pub type Result<T> = std::result::Result<T, Error>;
