pub mod radio;
pub mod simulated;
pub mod uuids;

#[cfg(feature = "bluez")]
pub mod bluez;

pub use radio::{AdvertisementStream, NotificationStream, RadioClient, RadioState};
pub use simulated::{SimulatedDevice, SimulatedRadio};

#[cfg(feature = "bluez")]
pub use bluez::BluezRadio;
