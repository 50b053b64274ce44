//! Bluetooth LE smart-scale link.
//!
//! Discovers weight and body composition scales, holds a single connection,
//! decodes their measurement notifications and reports everything as
//! [`ScaleEvent`]s. The radio is injected: [`bluetooth::BluezRadio`] talks to
//! real hardware, [`bluetooth::SimulatedRadio`] stands in for it.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod utils;

pub use config::ScaleConfig;
pub use error::{DecodeError, RadioError, Result, ScaleError};
pub use events::{EventReceiver, ScaleEvent};
pub use manager::{ManagerOptions, ScaleLinkManager, DEFAULT_SCAN_TIMEOUT};
pub use models::{ScaleDevice, ScaleReading, WeightUnit};
