use uuid::Uuid;

use crate::api::central::PeripheralId;
use crate::api::characteristic::Characteristic;

#[derive(Debug, Clone)]
pub enum CentralEvent {
    StateUpdate {
        state: CentralState,
    },
    DeviceDiscovered {
        peripheral: PeripheralId,
        services: Vec<Uuid>,
        /// Company id (little-endian) followed by the payload.
        manufacturer_data: Option<Vec<u8>>,
        rssi: i16,
    },
    DeviceConnected {
        peripheral: PeripheralId,
    },
    DeviceConnectionFailed {
        peripheral: PeripheralId,
        error: Option<String>,
    },
    DeviceDisconnected {
        peripheral: PeripheralId,
        cause: DisconnectCause,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: Uuid,
        characteristics: Vec<Characteristic>,
    },
    CharacteristicNotified {
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    CharacteristicWritten {
        peripheral: PeripheralId,
        characteristic: Uuid,
        error: Option<String>,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CentralState {
    Unknown = 0,
    PoweredOn = 1,
    PoweredOff = 2,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DisconnectCause {
    /// We asked for it.
    Requested,
    /// The peripheral dropped the link.
    Remote,
    Failure(String),
}
