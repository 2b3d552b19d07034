use std::fmt;
use std::str::FromStr;

use data_encoding::{HEXUPPER, HEXUPPER_PERMISSIVE};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::advert::ylink_service_uuid;
use crate::{Error, Result};

/// Hardware address of a yLink, the stable identity of a device.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    /// Accepts 12 hex digits, optionally separated by `:`.
    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s.chars().filter(|c| *c != ':').collect();
        let raw = HEXUPPER_PERMISSIVE
            .decode(digits.as_bytes())
            .map_err(|_| Error::InvalidMacAddress(s.to_string()))?;
        let bytes: [u8; 6] = raw
            .try_into()
            .map_err(|_| Error::InvalidMacAddress(s.to_string()))?;
        Ok(MacAddress(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(value: MacAddress) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&HEXUPPER.encode(&self.0))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryStrength {
    Strong,
    Ok,
    Weak,
    Danger,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Battery {
    pub strength: Option<BatteryStrength>,
    pub level: Option<String>,
    pub reported_on: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firmware {
    pub id: Option<u64>,
    pub version: Option<u32>,
    pub firmware_loaded_on: Option<String>,
    pub new_firmware_requested_on: Option<String>,
    /// URL of the firmware binary.
    pub file_location: Option<String>,
    /// Hex of the server-sealed firmware update request.
    pub cl_firmware_update_request: Option<String>,
}

/// A door-lock controller as the backend describes it. Replaced wholesale
/// whenever a fresher copy is fetched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct YLink {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub room_number: Option<String>,
    pub mac_address: MacAddress,
    #[serde(default)]
    pub firmware: Option<Firmware>,
    #[serde(default)]
    pub new_firmware: Option<Firmware>,
    #[serde(default)]
    pub cl_rfid_control_data_update_request: Option<String>,
    #[serde(default)]
    pub card_key_groups: Option<String>,
    #[serde(default)]
    pub cancelled_staff_cards: Option<String>,
    #[serde(default)]
    pub ylink_battery: Option<Battery>,
    #[serde(default)]
    pub lock_battery: Option<Battery>,
}

impl YLink {
    pub fn new(mac_address: MacAddress) -> Self {
        YLink {
            id: None,
            room_number: None,
            mac_address,
            firmware: None,
            new_firmware: None,
            cl_rfid_control_data_update_request: None,
            card_key_groups: None,
            cancelled_staff_cards: None,
            ylink_battery: None,
            lock_battery: None,
        }
    }

    /// The service UUID this yLink advertises while it awaits an update.
    pub fn service_uuid(&self) -> Uuid {
        ylink_service_uuid(&self.mac_address)
    }

    pub fn room(&self) -> &str {
        self.room_number.as_deref().unwrap_or("?")
    }

    pub fn has_new_firmware(&self) -> bool {
        self.new_firmware.is_some()
    }

    pub fn has_control_data_update(&self) -> bool {
        self.cl_rfid_control_data_update_request.is_some()
    }
}

/// The subset of a hotel record the update engine consumes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hotel {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ylinks_with_ota_updates: Vec<YLink>,
    #[serde(default)]
    pub ylinks_with_control_data_updates: Vec<YLink>,
}
