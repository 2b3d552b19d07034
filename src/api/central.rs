use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::Result;
use crate::api::central_event::CentralState;
use crate::api::characteristic::{Characteristic, CharacteristicWriteType};

/// The BLE radio, seen from the central role.
///
/// Calls only issue requests. Outcomes (connection, discovered
/// characteristics, notified values, write confirmations) come back as
/// [`CentralEvent`](crate::api::central_event::CentralEvent)s on the channel
/// the implementation was built with, in the order the radio produced them.
#[async_trait]
pub trait CentralManager: Send + Sync {
    async fn start_scan(&self, filter: ScanFilter) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()>;

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()>;

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()>;

    // subscribe to notifications
    async fn subscribe(&self, peripheral: &PeripheralId, characteristic: &Characteristic)
    -> Result<()>;

    /// The value arrives as a `CharacteristicNotified` event.
    async fn read(&self, peripheral: &PeripheralId, characteristic: &Characteristic) -> Result<()>;

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: CharacteristicWriteType,
    ) -> Result<()>;

    async fn adapter_state(&self) -> Result<CentralState>;
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanFilter {
    pub services: Vec<Uuid>,
    pub allow_duplicates: bool,
}

/// Radio-level handle of a peripheral. Only meaningful to the radio that
/// produced it.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PeripheralId(pub String);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(value: &str) -> Self {
        PeripheralId(value.to_string())
    }
}
