pub mod advert;
pub mod ylink;

pub use advert::AdvertFlag;
pub use ylink::{Battery, BatteryStrength, Firmware, Hotel, MacAddress, YLink};
