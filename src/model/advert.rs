use uuid::Uuid;

use crate::model::ylink::MacAddress;

/// GATT service every yLink exposes once connected.
pub const YLINK_SERVICE_UUID: Uuid = Uuid::from_u128(0xC3221178_2E83_40E2_9F12_F07B57A77E1F);
/// Write / notify channel for protocol frames.
pub const WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x06F87DA4_6264_4C8F_9ADB_D077380CEFA9);
/// Dedicated channel for firmware packets.
pub const OTA_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x70A65E35_262D_4E7B_A43D_0C30294DC727);

/// Bluetooth SIG company identifier carried in yLink manufacturer data.
pub const YIKES_COMPANY_ID: u16 = 0x0161;

const ADVERT_PREFIX: [u8; 10] = [0xA2, 0x49, 0xB3, 0x50, 0xF1, 0x12, 0xE9, 0x88, 0x20, 0x15];

/// `A249B350-F112-E988-2015-<MAC>`
pub fn ylink_service_uuid(mac: &MacAddress) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[..10].copy_from_slice(&ADVERT_PREFIX);
    bytes[10..].copy_from_slice(&mac.bytes());
    Uuid::from_bytes(bytes)
}

pub fn is_ylink_advert(uuid: &Uuid) -> bool {
    uuid.as_bytes().starts_with(&ADVERT_PREFIX)
}

pub fn mac_from_advert(uuid: &Uuid) -> Option<MacAddress> {
    if !is_ylink_advert(uuid) {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&uuid.as_bytes()[10..]);
    Some(MacAddress::new(mac))
}

/// What a yLink says about itself in its manufacturer data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvertFlag {
    NoReport,
    HasReport,
    HasKey,
}

impl AdvertFlag {
    /// `data` starts with the little-endian company id, as the radio
    /// delivers it.
    pub fn from_manufacturer_data(data: &[u8]) -> Option<Self> {
        let [lo, hi, flag, ..] = data else {
            return None;
        };
        if u16::from_le_bytes([*lo, *hi]) != YIKES_COMPANY_ID {
            return None;
        }
        match flag {
            0x01 => Some(AdvertFlag::NoReport),
            0x02 => Some(AdvertFlag::HasReport),
            0x03 => Some(AdvertFlag::HasKey),
            _ => None,
        }
    }
}
